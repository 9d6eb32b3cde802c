use std::{
  net::IpAddr,
  sync::Arc,
  time::{Duration, Instant},
};

use axum::http::HeaderMap;
use cache::CloneCache;
use tokio::sync::RwLock;

/// Error produced by [WithFailureRateLimit]: either the limit was hit before
/// the wrapped future ran, or the future ran and failed on its own terms.
#[derive(Debug)]
pub enum RateLimitError<E> {
  TooManyAttempts { max_attempts: usize, window: Duration },
  MissingClientIp,
  Inner(E),
}

impl<E> From<E> for RateLimitError<E> {
  fn from(e: E) -> Self {
    RateLimitError::Inner(e)
  }
}

/// Trait to extend fallible futures with stateful rate limiting.
pub trait WithFailureRateLimit<R, E>
where
  Self: Future<Output = Result<R, E>> + Sized,
{
  /// Ensure the given IP is not violating the given `limiter`'s rate limit
  /// rules before executing this fallible future.
  ///
  /// If the rules are violated, returns `Err(RateLimitError::TooManyAttempts)`
  /// without running the future at all.
  ///
  /// If the rules are not violated, the future runs; on failure, the attempt
  /// time is recorded and the original error is returned wrapped in
  /// `RateLimitError::Inner`. Succeeding attempts are never counted against
  /// the limit.
  fn with_failure_rate_limit_using_ip(
    self,
    limiter: &RateLimiter,
    ip: &IpAddr,
  ) -> impl Future<Output = Result<R, RateLimitError<E>>> {
    async {
      if limiter.disabled {
        return self.await.map_err(RateLimitError::Inner);
      }

      let attempts = limiter.attempts.get_or_insert_default(ip).await;

      let read = attempts.read().await;
      let now = Instant::now();
      let window_start = now - limiter.window;
      let count =
        read.iter().filter(|&&time| time > window_start).count();
      drop(read);

      if count >= limiter.max_attempts {
        attempts.write().await.retain(|&time| time > window_start);
        return Err(RateLimitError::TooManyAttempts {
          max_attempts: limiter.max_attempts,
          window: limiter.window,
        });
      }

      match self.await {
        Ok(res) => Ok(res),
        Err(e) => {
          let mut write = attempts.write().await;
          write.retain(|&time| time > window_start);
          write.push(now);
          Err(RateLimitError::Inner(e))
        }
      }
    }
  }

  fn with_failure_rate_limit_using_headers(
    self,
    limiter: &RateLimiter,
    headers: &HeaderMap,
  ) -> impl Future<Output = Result<R, RateLimitError<E>>> {
    async {
      if limiter.disabled {
        return self.await.map_err(RateLimitError::Inner);
      }
      let ip = match get_ip_from_headers(headers) {
        Some(ip) => ip,
        None => return Err(RateLimitError::MissingClientIp),
      };
      self.with_failure_rate_limit_using_ip(limiter, &ip).await
    }
  }
}

impl<F, R, E> WithFailureRateLimit<R, E> for F where
  F: Future<Output = Result<R, E>> + Sized
{
}

type RateLimiterMapEntry = Arc<RwLock<Vec<Instant>>>;

pub struct RateLimiter {
  attempts: CloneCache<IpAddr, RateLimiterMapEntry>,
  disabled: bool,
  max_attempts: usize,
  window: Duration,
}

impl RateLimiter {
  /// Create a new rate limiter. Also spawns a tokio task to clean up stale
  /// keys (ones which haven't been accessed in 15+ minutes).
  pub fn new(
    disabled: bool,
    max_attempts: usize,
    window_seconds: u64,
  ) -> Arc<Self> {
    let limiter = Arc::new(Self {
      attempts: CloneCache::default(),
      disabled,
      max_attempts,
      window: Duration::from_secs(window_seconds),
    });
    if !disabled {
      spawn_cleanup_task(limiter.clone());
    }
    limiter
  }
}

/// Runs every 60s and clears off the best guess of stale entries. Repeatedly
/// succeeding calls leave an empty attempts array, which gets cleared here.
fn spawn_cleanup_task(limiter: Arc<RateLimiter>) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
      interval.tick().await;
      let remove_before = Instant::now() - Duration::from_secs(15 * 60);
      limiter
        .attempts
        .retain(|_, attempts| {
          let Ok(attempts) = attempts.try_read() else {
            return true;
          };
          let Some(&last) = attempts.last() else {
            return false;
          };
          last > remove_before
        })
        .await;
    }
  });
}

pub fn get_ip_from_headers(headers: &HeaderMap) -> Option<IpAddr> {
  if let Some(forwarded) = headers.get("x-forwarded-for")
    && let Ok(forwarded_str) = forwarded.to_str()
    && let Some(ip) = forwarded_str.split(',').next()
  {
    return ip.trim().parse().ok();
  }

  if let Some(real_ip) = headers.get("x-real-ip")
    && let Ok(ip) = real_ip.to_str()
  {
    return ip.trim().parse().ok();
  }

  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{IpAddr, Ipv4Addr};

  #[tokio::test]
  async fn allows_until_limit_then_blocks() {
    let limiter = RateLimiter::new(false, 2, 60);
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    for _ in 0..2 {
      let res: Result<(), RateLimitError<anyhow::Error>> =
        async { Err::<(), _>(anyhow::anyhow!("boom")) }
          .with_failure_rate_limit_using_ip(&limiter, &ip)
          .await;
      assert!(matches!(res, Err(RateLimitError::Inner(_))));
    }

    let res: Result<(), RateLimitError<anyhow::Error>> =
      async { Ok(()) }
        .with_failure_rate_limit_using_ip(&limiter, &ip)
        .await;
    assert!(matches!(
      res,
      Err(RateLimitError::TooManyAttempts { .. })
    ));
  }

  #[tokio::test]
  async fn success_does_not_count_against_limit() {
    let limiter = RateLimiter::new(false, 1, 60);
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

    for _ in 0..5 {
      let res: Result<(), RateLimitError<anyhow::Error>> =
        async { Ok(()) }
          .with_failure_rate_limit_using_ip(&limiter, &ip)
          .await;
      assert!(res.is_ok());
    }
  }
}
