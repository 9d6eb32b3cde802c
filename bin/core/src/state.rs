use std::sync::{Arc, OnceLock};

use anyhow::{Context, anyhow};
use rate_limit::RateLimiter;

use crate::{
  adapter::{HttpAdapter, NetworkAdapter},
  auth::AuthService,
  config::core_config,
  executor::{RemoteExecutor, SshExecutor},
  orchestrator::Orchestrator,
  store::DeploymentStore,
};

static DEPLOYMENT_STORE: OnceLock<Arc<DeploymentStore>> = OnceLock::new();

pub fn deployment_store() -> &'static Arc<DeploymentStore> {
  DEPLOYMENT_STORE.get().unwrap_or_else(|| {
    tracing::error!(
      "FATAL: deployment_store accessed before initialized | Ensure init_deployment_store() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

/// Must be called in app startup sequence.
pub async fn init_deployment_store() {
  let init = async {
    let store = DeploymentStore::load(&core_config().store_path)
      .await
      .context("failed to load deployment store")?;
    DEPLOYMENT_STORE.set(store).map_err(|_| {
      anyhow!("deployment_store initialized more than once - this should not happen")
    })?;
    anyhow::Ok(())
  }
  .await;
  if let Err(e) = init {
    tracing::error!("FATAL: Failed to initialize deployment store | {e:#} | Exiting...");
    std::process::exit(1)
  }
}

pub fn auth_service() -> &'static AuthService {
  static AUTH_SERVICE: OnceLock<AuthService> = OnceLock::new();
  AUTH_SERVICE.get_or_init(AuthService::default)
}

pub fn deployment_public_key() -> &'static str {
  static DEPLOYMENT_PUBLIC_KEY: OnceLock<String> = OnceLock::new();
  DEPLOYMENT_PUBLIC_KEY.get_or_init(|| {
    let path = format!("{}.pub", core_config().deployment_key_path);
    std::fs::read_to_string(&path)
      .map(|s| s.trim().to_string())
      .unwrap_or_else(|e| {
        tracing::error!(
          "FATAL: failed to read deployment public key at {path} | {e:#} | Exiting..."
        );
        std::process::exit(1)
      })
  })
}

pub fn network_adapter() -> &'static Arc<dyn NetworkAdapter> {
  static ADAPTER: OnceLock<Arc<dyn NetworkAdapter>> = OnceLock::new();
  ADAPTER.get_or_init(|| {
    let config = core_config();
    match HttpAdapter::new(
      config.scheduler_url.clone(),
      config.gateway_url.clone(),
      config.credits_url.clone(),
    ) {
      Ok(adapter) => Arc::new(adapter),
      Err(e) => {
        tracing::error!("FATAL: failed to build network adapter | {e:#} | Exiting...");
        std::process::exit(1)
      }
    }
  })
}

pub fn orchestrator() -> &'static Arc<Orchestrator> {
  static ORCHESTRATOR: OnceLock<Arc<Orchestrator>> = OnceLock::new();
  ORCHESTRATOR.get_or_init(|| {
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
      core_config().deployment_key_path.clone(),
    ));
    Orchestrator::new(
      deployment_store().clone(),
      executor,
      network_adapter().clone(),
      deployment_public_key().to_string(),
    )
  })
}

/// `POST /api/auth/nonce`: ≤20/min per source IP.
pub fn nonce_rate_limiter() -> &'static RateLimiter {
  static LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();
  LIMITER.get_or_init(|| RateLimiter::new(false, 20, 60)).as_ref()
}

/// `POST /api/auth/verify`: ≤10/min per source IP.
pub fn verify_rate_limiter() -> &'static RateLimiter {
  static LIMITER: OnceLock<Arc<RateLimiter>> = OnceLock::new();
  LIMITER.get_or_init(|| RateLimiter::new(false, 10, 60)).as_ref()
}
