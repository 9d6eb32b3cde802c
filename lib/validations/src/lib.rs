//! # Input Validation Module
//!
//! This module provides validation functions for user inputs to prevent
//! invalid data from entering the system and improve security.

use std::{
  net::{IpAddr, SocketAddr, ToSocketAddrs},
  sync::OnceLock,
};

use anyhow::{Context, anyhow};
use regex::Regex;

/// Options to validate input strings to have certain properties.
/// This ensures only valid data can enter the system.
///
/// ## Usage
///
/// ```
/// use validations::{StringValidator, StringValidatorMatches};
/// StringValidator::default()
///   .min_length(1)
///   .max_length(100)
///   .matches(StringValidatorMatches::AppId)
///   .validate("nginx-demo")
///   .unwrap();
/// ```
#[derive(Default)]
pub struct StringValidator {
  /// Specify the minimum length of string.
  /// Setting `0` will effectively skip this validation.
  pub min_length: usize,
  /// Specify max length of string, or None to allow arbitrary length.
  pub max_length: Option<usize>,
  /// Skip the control character check.
  /// Most values should not contain these by default.
  pub skip_control_check: bool,
  /// Specify a pattern to validate the string contents.
  pub matches: Option<StringValidatorMatches>,
}

impl StringValidator {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  pub fn validate(&self, input: &str) -> anyhow::Result<()> {
    let len = input.len();

    if len < self.min_length {
      return Err(anyhow!(
        "Input too short. Must be at least {} characters.",
        self.min_length
      ));
    }

    if let Some(max_length) = self.max_length
      && len > max_length
    {
      return Err(anyhow!(
        "Input too long. Must be at most {max_length} characters."
      ));
    }

    if !self.skip_control_check {
      validate_no_control_chars(input)?;
    }

    if let Some(matches) = &self.matches {
      matches.validate(input)?
    }

    Ok(())
  }

  pub fn min_length(mut self, min_length: usize) -> StringValidator {
    self.min_length = min_length;
    self
  }

  pub fn max_length(
    mut self,
    max_length: impl Into<Option<usize>>,
  ) -> StringValidator {
    self.max_length = max_length.into();
    self
  }

  pub fn skip_control_check(mut self) -> StringValidator {
    self.skip_control_check = true;
    self
  }

  pub fn matches(
    mut self,
    matches: impl Into<Option<StringValidatorMatches>>,
  ) -> StringValidator {
    self.matches = matches.into();
    self
  }
}

pub enum StringValidatorMatches {
  /// Application / deployment identifier:
  /// - alphanumeric characters, underscores, hyphens only
  /// - no path-traversal substrings (`..`, `/`)
  AppId,
  /// Ethereum-style wallet address: `0x` + 40 lowercase hex chars.
  /// Input is expected to already be lowercased by the caller.
  EthAddress,
  /// - http or https URL.
  HttpUrl,
}

impl StringValidatorMatches {
  /// Returns Ok if input passes validations, otherwise includes
  /// error with failure reason.
  fn validate(&self, input: &str) -> anyhow::Result<()> {
    let validate = || match self {
      StringValidatorMatches::AppId => {
        static APP_ID_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = APP_ID_REGEX.get_or_init(|| {
          Regex::new(r"^[A-Za-z0-9_-]{1,64}$")
            .expect("Failed to initialize app id regex")
        });
        if !regex.is_match(input) {
          return Err(anyhow!(
            "Only alphanumeric characters, underscores and hyphens are allowed, max 64 chars"
          ));
        }
        if input.contains("..") || input.contains('/') {
          return Err(anyhow!("Path traversal sequences are not allowed"));
        }
        Ok(())
      }

      StringValidatorMatches::EthAddress => {
        static ETH_ADDRESS_REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = ETH_ADDRESS_REGEX.get_or_init(|| {
          Regex::new(r"^0x[a-f0-9]{40}$")
            .expect("Failed to initialize eth address regex")
        });
        if regex.is_match(input) {
          Ok(())
        } else {
          Err(anyhow!(
            "Must be a lowercase 0x-prefixed 40 hex character address"
          ))
        }
      }

      StringValidatorMatches::HttpUrl => {
        if !input.starts_with("http://")
          && !input.starts_with("https://")
        {
          return Err(anyhow!(
            "Input must start with http:// or https://"
          ));
        }
        url::Url::parse(input)
          .context("Failed to parse input as URL")
          .map(|_| ())
      }
    };
    validate().context("Invalid characters in input")
  }
}

fn validate_no_control_chars(input: &str) -> anyhow::Result<()> {
  for (index, char) in input.chars().enumerate() {
    if char.is_control() {
      return Err(anyhow!(
        "Control character at index {index}. Input: \"{input}\""
      ));
    }
  }
  Ok(())
}

/// Hosts a compute node is not allowed to report for SSH deployment targets,
/// barring `allow_loopback_targets`. Covers loopback/private/link-local/
/// reserved ranges plus the well-known cloud metadata endpoints.
const BLOCKED_HOST_LITERALS: &[&str] = &[
  "169.254.169.254",
  "metadata.google.internal",
  "metadata.internal",
];

/// Validates that `host` is an acceptable SSH deployment target.
///
/// `allow_loopback` overrides the loopback ban for self-deployment
/// scenarios; it never overrides the literal cloud-metadata deny-list.
pub fn validate_ssh_host(
  host: &str,
  allow_loopback: bool,
) -> anyhow::Result<()> {
  let lower = host.to_ascii_lowercase();
  if BLOCKED_HOST_LITERALS.contains(&lower.as_str()) {
    return Err(anyhow!("Host '{host}' is a blocked metadata endpoint"));
  }

  if let Ok(ip) = host.parse::<IpAddr>() {
    return validate_ip(ip, allow_loopback, host);
  }

  if host == "localhost" {
    return if allow_loopback {
      Ok(())
    } else {
      Err(anyhow!("Host 'localhost' is disallowed (loopback)"))
    };
  }

  // Best-effort resolve any other hostname and check the resolved IPs too,
  // so a DNS name can't be used to smuggle a loopback/private target past
  // the literal checks above. Resolution failures are not a validation
  // error here — the SSH probe step will fail loudly enough on its own.
  if let Ok(addrs) = (host, 0u16).to_socket_addrs() {
    for addr in addrs {
      if let SocketAddr::V4(v4) = addr {
        validate_ip(IpAddr::V4(*v4.ip()), allow_loopback, host)?;
      } else if let SocketAddr::V6(v6) = addr {
        validate_ip(IpAddr::V6(*v6.ip()), allow_loopback, host)?;
      }
    }
  }

  Ok(())
}

fn validate_ip(
  ip: IpAddr,
  allow_loopback: bool,
  original: &str,
) -> anyhow::Result<()> {
  if ip.is_loopback() && !allow_loopback {
    return Err(anyhow!("Host '{original}' resolves to loopback"));
  }
  if is_private_or_reserved(ip) {
    return Err(anyhow!(
      "Host '{original}' resolves to a private/reserved address"
    ));
  }
  Ok(())
}

fn is_private_or_reserved(ip: IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => {
      v4.is_private()
        || v4.is_link_local()
        || v4.is_broadcast()
        || v4.is_documentation()
        || v4.is_unspecified()
    }
    IpAddr::V6(v6) => {
      v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local()
    }
  }
}

pub fn validate_port(port: u32) -> anyhow::Result<u16> {
  if port == 0 || port > 65535 {
    return Err(anyhow!("Port must be between 1 and 65535"));
  }
  Ok(port as u16)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn app_id_boundaries() {
    let validator =
      StringValidator::default().matches(StringValidatorMatches::AppId);
    assert!(validator.validate(&"a".repeat(64)).is_ok());
    assert!(validator.validate(&"a".repeat(65)).is_err());
    assert!(validator.validate("../etc").is_err());
    assert!(validator.validate("app/name").is_err());
  }

  #[test]
  fn ssh_host_boundaries() {
    assert!(validate_ssh_host("169.254.169.254", false).is_err());
    assert!(validate_ssh_host("10.0.0.1", false).is_err());
    assert!(validate_ssh_host("1.2.3.4", false).is_ok());
    assert!(validate_ssh_host("localhost", false).is_err());
    assert!(validate_ssh_host("localhost", true).is_ok());
  }

  #[test]
  fn port_boundaries() {
    assert!(validate_port(0).is_err());
    assert!(validate_port(65536).is_err());
    assert!(validate_port(22).is_ok());
  }
}
