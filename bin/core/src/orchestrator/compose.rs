use rand::Rng;

use crate::entities::{
  GENERATED_PASSWORD_PLACEHOLDER, GENERATED_ROOT_PASSWORD_PLACEHOLDER,
  GeneratedPasswords,
};

const PASSWORD_LENGTH: usize = 22;
const PASSWORD_CHARSET: &[u8] =
  b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Replaces `__GENERATED_PASSWORD__` / `__GENERATED_ROOT_PASSWORD__` with
/// fresh per-deployment random strings, returning the filled-in compose
/// document plus whatever was generated (to be surfaced back to the client
/// exactly once).
pub fn substitute_placeholders(
  compose: &str,
) -> (String, Option<GeneratedPasswords>) {
  let mut result = compose.to_string();
  let mut passwords = GeneratedPasswords { password: None, root_password: None };
  let mut any = false;

  if result.contains(GENERATED_PASSWORD_PLACEHOLDER) {
    let pw = random_password();
    result = result.replace(GENERATED_PASSWORD_PLACEHOLDER, &pw);
    passwords.password = Some(pw);
    any = true;
  }
  if result.contains(GENERATED_ROOT_PASSWORD_PLACEHOLDER) {
    let pw = random_password();
    result = result.replace(GENERATED_ROOT_PASSWORD_PLACEHOLDER, &pw);
    passwords.root_password = Some(pw);
    any = true;
  }

  (result, any.then_some(passwords))
}

fn random_password() -> String {
  let mut rng = rand::rng();
  (0..PASSWORD_LENGTH)
    .map(|_| PASSWORD_CHARSET[rng.random_range(0..PASSWORD_CHARSET.len())] as char)
    .collect()
}

/// Preference order: caller's `tunnel_port` override, else first service
/// named `web`/`app`, else first service exposing a host port <1024, else
/// the first `<host>:<container>` pair found, else `80`. Picking the first
/// pair unconditionally can choose an unintended port when a compose
/// document lists multiple services.
pub fn parse_local_port(compose: &str, override_port: Option<u16>) -> u16 {
  if let Some(port) = override_port {
    return port;
  }

  let candidates = host_port_candidates(compose);
  if candidates.is_empty() {
    return 80;
  }
  if let Some((_, port)) =
    candidates.iter().find(|(name, _)| name == "web" || name == "app")
  {
    return *port;
  }
  if let Some((_, port)) = candidates.iter().find(|(_, port)| *port < 1024) {
    return *port;
  }
  candidates[0].1
}

fn host_port_candidates(compose: &str) -> Vec<(String, u16)> {
  let Ok(doc) = serde_yaml_ng::from_str::<serde_yaml_ng::Value>(compose)
  else {
    return vec![];
  };
  let Some(services) =
    doc.get("services").and_then(|s| s.as_mapping())
  else {
    return vec![];
  };

  let mut candidates = Vec::new();
  for (name, service) in services {
    let name = name.as_str().unwrap_or_default().to_string();
    let Some(ports) = service.get("ports").and_then(|p| p.as_sequence())
    else {
      continue;
    };
    for entry in ports {
      if let Some(host_port) = parse_host_port(entry) {
        candidates.push((name.clone(), host_port));
      }
    }
  }
  candidates
}

fn parse_host_port(entry: &serde_yaml_ng::Value) -> Option<u16> {
  let raw = match entry {
    serde_yaml_ng::Value::String(s) => s.clone(),
    serde_yaml_ng::Value::Number(n) => n.to_string(),
    _ => return None,
  };
  if !raw.contains(':') {
    // A bare container port with no host binding isn't a publish candidate.
    return None;
  }
  let host_part = raw.split(':').next()?;
  host_part.parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn substitutes_both_placeholders() {
    let compose = "environment:\n  PASSWORD: __GENERATED_PASSWORD__\n  ROOT_PASSWORD: __GENERATED_ROOT_PASSWORD__\n";
    let (filled, passwords) = substitute_placeholders(compose);
    assert!(!filled.contains("__GENERATED_PASSWORD__"));
    assert!(!filled.contains("__GENERATED_ROOT_PASSWORD__"));
    let passwords = passwords.unwrap();
    assert_eq!(passwords.password.unwrap().len(), PASSWORD_LENGTH);
    assert_eq!(passwords.root_password.unwrap().len(), PASSWORD_LENGTH);
  }

  #[test]
  fn no_placeholders_returns_none() {
    let (filled, passwords) = substitute_placeholders("services: {}\n");
    assert_eq!(filled, "services: {}\n");
    assert!(passwords.is_none());
  }

  #[test]
  fn override_port_wins() {
    assert_eq!(parse_local_port("services: {}\n", Some(9999)), 9999);
  }

  #[test]
  fn prefers_named_web_service() {
    let compose = "services:\n  db:\n    ports:\n      - \"5432:5432\"\n  web:\n    ports:\n      - \"8080:80\"\n";
    assert_eq!(parse_local_port(compose, None), 8080);
  }

  #[test]
  fn falls_back_to_privileged_port_then_first_pair() {
    let compose = "services:\n  api:\n    ports:\n      - \"3000:3000\"\n  metrics:\n    ports:\n      - \"443:443\"\n";
    assert_eq!(parse_local_port(compose, None), 443);
  }

  #[test]
  fn defaults_to_80_with_no_candidates() {
    assert_eq!(parse_local_port("services:\n  db: {}\n", None), 80);
  }
}
