use serde::{Deserialize, Serialize};

/// A deployable application template, loaded once at startup from the
/// configured catalog file and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTemplate {
  /// Short slug, also the app identifier used throughout the API.
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub icon: String,
  /// Free-form, matched by the `?category=` filter on `GET /api/apps`.
  pub category: String,
  #[serde(default)]
  pub description: String,
  pub resources: AppResources,
  /// Estimated cost in USD per day, display-only.
  pub est_cost_per_day: f64,
  #[serde(default)]
  pub tags: Vec<String>,
  /// Opaque docker-compose document. May contain the literal placeholders
  /// `__GENERATED_PASSWORD__` / `__GENERATED_ROOT_PASSWORD__`.
  pub compose: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppResources {
  pub vcpus: u32,
  pub memory_mb: u32,
  pub disk_gb: u32,
}

pub const GENERATED_PASSWORD_PLACEHOLDER: &str = "__GENERATED_PASSWORD__";
pub const GENERATED_ROOT_PASSWORD_PLACEHOLDER: &str =
  "__GENERATED_ROOT_PASSWORD__";
