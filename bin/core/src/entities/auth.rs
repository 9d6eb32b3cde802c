use serde::{Deserialize, Serialize};

/// `address => (nonce, created_at)`. Consumed on successful verify, evicted
/// after [crate::auth::NONCE_TTL_SECS].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthNonce {
  pub nonce: String,
  pub created_at: i64,
}

/// `token => (address, expires_at)`. Deleted on logout, evicted after
/// expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  pub address: String,
  pub created_at: i64,
  pub expires_at: i64,
}
