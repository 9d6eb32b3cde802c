mod crypto;

use anyhow::{Context, anyhow, bail};
use cache::CloneCache;
use rand::RngCore;
use validations::{StringValidator, StringValidatorMatches};

use crate::entities::{AuthNonce, Session};

pub const NONCE_TTL_SECS: i64 = 300;
pub const SESSION_TTL_SECS: i64 = 86_400;

const MESSAGE_PREAMBLE: &str = "Sign this message to authenticate with Aleph Marketplace.";

/// Nonce-challenge / signature-verify flow that issues bearer session
/// tokens bound to a wallet address. Nonce and session maps are each a
/// single [CloneCache] with opportunistic eviction on access, matching the
/// teacher's "single mutex, best-effort cleanup" shape used throughout
/// `lib/cache` and `lib/rate_limit`.
pub struct AuthService {
  nonces: CloneCache<String, AuthNonce>,
  sessions: CloneCache<String, Session>,
}

impl Default for AuthService {
  fn default() -> Self {
    Self { nonces: CloneCache::default(), sessions: CloneCache::default() }
  }
}

impl AuthService {
  pub async fn request_nonce(
    &self,
    address: &str,
  ) -> anyhow::Result<(String, String)> {
    let address = normalize_address(address)?;
    let nonce = random_hex(16);
    self
      .nonces
      .insert(
        address.clone(),
        AuthNonce { nonce: nonce.clone(), created_at: now() },
      )
      .await;
    let message = canonical_message(&address, &nonce);
    Ok((nonce, message))
  }

  pub async fn verify(
    &self,
    address: &str,
    nonce: &str,
    signature: &str,
  ) -> anyhow::Result<(String, i64)> {
    let address = normalize_address(&address.to_lowercase())?;

    let stored = self
      .nonces
      .get(&address)
      .await
      .ok_or_else(|| anyhow!("no nonce pending for this address"))?;
    if stored.nonce != nonce {
      bail!("nonce mismatch");
    }
    if now() - stored.created_at > NONCE_TTL_SECS {
      bail!("nonce expired");
    }

    let message = canonical_message(&address, nonce);
    let recovered =
      crypto::recover_personal_sign_address(&message, signature)
        .context("signature recovery failed")?;
    if recovered.to_lowercase() != address {
      bail!("recovered address does not match claimed address");
    }

    // Consumed by exactly one successful verify; a replay finds no nonce.
    self.nonces.remove(&address).await;

    let token = random_hex(32);
    let created_at = now();
    let expires_at = created_at + SESSION_TTL_SECS;
    self
      .sessions
      .insert(token.clone(), Session { address, created_at, expires_at })
      .await;
    Ok((token, expires_at))
  }

  /// Returns the session if present and unexpired. An expired session is
  /// evicted opportunistically on lookup.
  pub async fn session(&self, token: &str) -> Option<Session> {
    let session = self.sessions.get(&token.to_string()).await?;
    if session.expires_at < now() {
      self.sessions.remove(&token.to_string()).await;
      return None;
    }
    Some(session)
  }

  /// Always succeeds, whether or not a session existed for the token.
  pub async fn logout(&self, token: &str) {
    self.sessions.remove(&token.to_string()).await;
  }
}

fn canonical_message(address: &str, nonce: &str) -> String {
  format!("{MESSAGE_PREAMBLE}\n\nNonce: {nonce}\nAddress: {address}")
}

fn normalize_address(address: &str) -> anyhow::Result<String> {
  let lower = address.to_lowercase();
  StringValidator::default()
    .matches(StringValidatorMatches::EthAddress)
    .validate(&lower)
    .map_err(|e| anyhow!("invalid address: {e:#}"))?;
  Ok(lower)
}

fn random_hex(bytes: usize) -> String {
  let mut buf = vec![0u8; bytes];
  rand::rng().fill_bytes(&mut buf);
  hex::encode(buf)
}

fn now() -> i64 {
  chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn nonce_then_bad_signature_is_rejected() {
    let auth = AuthService::default();
    let (nonce, _message) =
      auth.request_nonce("0x1111111111111111111111111111111111111111").await.unwrap();
    let result = auth
      .verify(
        "0x1111111111111111111111111111111111111111",
        &nonce,
        "0xdeadbeef",
      )
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn mismatched_nonce_is_rejected() {
    let auth = AuthService::default();
    auth.request_nonce("0x2222222222222222222222222222222222222222").await.unwrap();
    let result = auth
      .verify(
        "0x2222222222222222222222222222222222222222",
        "not-the-real-nonce",
        "0x00",
      )
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn session_round_trip_ttl() {
    let auth = AuthService::default();
    auth
      .sessions
      .insert(
        "tok".to_string(),
        Session {
          address: "0xabc".to_string(),
          created_at: now(),
          expires_at: now() + SESSION_TTL_SECS,
        },
      )
      .await;
    let session = auth.session("tok").await.unwrap();
    assert_eq!(session.expires_at - session.created_at, SESSION_TTL_SECS);
  }

  #[tokio::test]
  async fn logout_always_succeeds() {
    let auth = AuthService::default();
    auth.logout("never-issued").await;
  }
}
