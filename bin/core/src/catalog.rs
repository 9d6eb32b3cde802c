use std::sync::OnceLock;

use anyhow::Context;

use crate::{config::core_config, entities::AppTemplate};

/// The static application catalog, loaded once at startup from
/// `CoreConfig::catalog_path` and never mutated afterward. Treated as a
/// read-only configuration input, not a managed resource.
pub struct Catalog {
  apps: Vec<AppTemplate>,
}

impl Catalog {
  fn load() -> anyhow::Result<Self> {
    let path = &core_config().catalog_path;
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read app catalog at {path}"))?;
    let apps: Vec<AppTemplate> = serde_json::from_str(&raw)
      .with_context(|| format!("failed to parse app catalog at {path}"))?;
    Ok(Self { apps })
  }

  pub fn list(&self, category: Option<&str>) -> Vec<&AppTemplate> {
    self
      .apps
      .iter()
      .filter(|app| {
        category.is_none_or(|category| app.category == category)
      })
      .collect()
  }

  pub fn get(&self, id: &str) -> Option<&AppTemplate> {
    self.apps.iter().find(|app| app.id == id)
  }
}

pub fn catalog() -> &'static Catalog {
  static CATALOG: OnceLock<Catalog> = OnceLock::new();
  CATALOG.get_or_init(|| match Catalog::load() {
    Ok(catalog) => catalog,
    Err(e) => {
      tracing::error!(
        "FATAL: failed to load app catalog | {e:#} | Exiting..."
      );
      std::process::exit(1)
    }
  })
}
