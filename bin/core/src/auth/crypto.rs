use anyhow::{Context, anyhow, bail};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

/// Recovers the signer address from an Ethereum "personal_sign" signature
/// over `message`. Signature recovery being unavailable is a hard refusal,
/// not a runtime fallback, so this isn't gated behind a feature flag; the
/// crate is always linked in.
pub fn recover_personal_sign_address(
  message: &str,
  signature_hex: &str,
) -> anyhow::Result<String> {
  let signature_bytes = decode_hex(signature_hex)
    .context("signature must be hex-encoded")?;
  if signature_bytes.len() != 65 {
    bail!("signature must be 65 bytes (r || s || v)");
  }

  let (rs, v) = signature_bytes.split_at(64);
  let mut recovery_byte = v[0];
  if recovery_byte >= 27 {
    recovery_byte -= 27;
  }
  let recovery_id = RecoveryId::from_byte(recovery_byte)
    .ok_or_else(|| anyhow!("invalid recovery id"))?;
  let signature = Signature::from_slice(rs)
    .context("invalid signature r/s values")?;

  let prehash = personal_sign_hash(message);
  let verifying_key =
    VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id)
      .context("failed to recover public key from signature")?;

  Ok(address_from_verifying_key(&verifying_key))
}

fn personal_sign_hash(message: &str) -> [u8; 32] {
  let prefixed =
    format!("\x19Ethereum Signed Message:\n{}{message}", message.len());
  let mut hasher = Keccak256::new();
  hasher.update(prefixed.as_bytes());
  hasher.finalize().into()
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
  let uncompressed = key.to_encoded_point(false);
  // Drop the leading 0x04 tag; address is the low 20 bytes of
  // keccak256(x || y).
  let mut hasher = Keccak256::new();
  hasher.update(&uncompressed.as_bytes()[1..]);
  let hash = hasher.finalize();
  format!("0x{}", hex::encode(&hash[12..]))
}

fn decode_hex(input: &str) -> anyhow::Result<Vec<u8>> {
  let stripped = input.strip_prefix("0x").unwrap_or(input);
  hex::decode(stripped).context("invalid hex string")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_malformed_signature() {
    let err = recover_personal_sign_address("hello", "0xdeadbeef")
      .unwrap_err();
    assert!(err.to_string().contains("65 bytes"));
  }

  #[test]
  fn rejects_non_hex_signature() {
    assert!(recover_personal_sign_address("hello", "not-hex").is_err());
  }
}
