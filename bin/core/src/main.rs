#[macro_use]
extern crate tracing;

mod adapter;
mod api;
mod auth;
mod catalog;
mod config;
mod entities;
mod error;
mod executor;
mod orchestrator;
mod state;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::core_config();
  logger::init(&config::log_config())?;

  info!("Deploy Core version: v{}", env!("CARGO_PKG_VERSION"));
  info!("{config:?}");

  state::init_deployment_store().await;

  // Touch the remaining lazily-initialized singletons here so a bad
  // catalog file, missing deployment key, or unparsable network URLs
  // crash at startup instead of on first request.
  catalog::catalog();
  state::auth_service();
  state::orchestrator();

  let listener =
    tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
  info!("Deploy Core listening on :{}", config.port);

  axum::serve(listener, api::app()).await?;

  Ok(())
}
