use std::sync::OnceLock;

use anyhow::Context;
use logger::LogConfig;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

/// Environment-driven configuration. The only settings that influence
/// correctness are whether loopback SSH targets are acceptable and where
/// the deployment private key lives. Everything else here is ambient
/// (ports, file paths, rate-limit knobs, logging).
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
  #[serde(default = "default_port")]
  pub port: u16,

  /// Path to the JSON catalog of [crate::entities::AppTemplate]s, loaded once
  /// at startup.
  #[serde(default = "default_catalog_path")]
  pub catalog_path: String,

  /// Path to the deployment-store snapshot file.
  #[serde(default = "default_store_path")]
  pub store_path: String,

  /// SSH private key used to connect to deployment targets. The matching
  /// public key is injected into a VM's authorized_keys and revoked after
  /// install.
  #[serde(default = "default_deployment_key_path")]
  pub deployment_key_path: String,

  /// Default SSH user for deployment targets absent a per-request override.
  #[serde(default = "default_ssh_user")]
  pub default_ssh_user: String,

  /// Off by default. Allows `127.0.0.1`/`localhost` as SSH targets, for
  /// self-deployment / local development scenarios.
  #[serde(default)]
  pub allow_loopback_ssh_targets: bool,

  /// Base domain the gateway publishes subdomains under.
  #[serde(default = "default_base_domain")]
  pub base_domain: String,

  /// Base URL of the decentralized-network scheduler.
  pub scheduler_url: String,
  /// Base URL of the gateway subdomain-lookup service.
  pub gateway_url: String,
  /// Base URL of the balance/credits service.
  pub credits_url: String,

  #[serde(default)]
  pub cors_allowed_origins: Vec<String>,
  #[serde(default)]
  pub cors_allow_credentials: bool,

  #[serde(default)]
  pub log_level: logger::LogLevel,
  #[serde(default)]
  pub log_stdio: logger::StdioLogMode,
  #[serde(default)]
  pub log_pretty: bool,
}

fn default_port() -> u16 {
  8120
}
fn default_catalog_path() -> String {
  "apps.json".to_string()
}
fn default_store_path() -> String {
  "deployments.json".to_string()
}
fn default_deployment_key_path() -> String {
  "/root/.ssh/id_rsa".to_string()
}
fn default_ssh_user() -> String {
  "root".to_string()
}
fn default_base_domain() -> String {
  "2n6.me".to_string()
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    dotenvy::dotenv().ok();
    match envy::prefixed("CORE_")
      .from_env::<CoreConfig>()
      .context("failed to parse core environment")
    {
      Ok(config) => config,
      Err(e) => {
        eprintln!("FATAL: {e:?}");
        std::process::exit(1)
      }
    }
  })
}

pub fn log_config() -> LogConfig {
  let config = core_config();
  LogConfig {
    level: config.log_level,
    stdio: config.log_stdio,
    pretty: config.log_pretty,
    location: false,
    ansi: true,
  }
}

pub fn cors_layer() -> CorsLayer {
  let config = core_config();
  let allowed_origins = if config.cors_allowed_origins.is_empty() {
    vec![axum::http::HeaderValue::from_static("*")]
  } else {
    config
      .cors_allowed_origins
      .iter()
      .filter_map(|origin| {
        axum::http::HeaderValue::from_str(origin)
          .inspect_err(|e| {
            tracing::warn!("invalid CORS allowed origin: {origin} | {e:?}")
          })
          .ok()
      })
      .collect()
  };
  CorsLayer::new()
    .allow_origin(allowed_origins)
    .allow_methods(tower_http::cors::Any)
    .allow_headers(tower_http::cors::Any)
    .allow_credentials(config.cors_allow_credentials)
}
