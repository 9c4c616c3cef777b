//! Exponential backoff with jitter for the client dispatcher's retry loop
//! (spec §4.4/§8: initial 1s, factor 2x, max 5s, randomization 0.5, capped at 5
//! attempts).

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Computes the delay before retry attempt `attempt` (0-indexed: the delay before
/// the *second* try is `schedule(cfg, 0)`), with jitter in
/// `[delay * (1 - randomization), delay * (1 + randomization)]`.
pub fn delay_for_attempt(cfg: &BackoffConfig, attempt: u32) -> Duration {
  let base = cfg.initial_ms as f64 * cfg.factor.powi(attempt as i32);
  let capped = base.min(cfg.max_ms as f64);
  let jitter_span = capped * cfg.randomization;
  let jittered = rand::thread_rng().gen_range((capped - jitter_span)..=(capped + jitter_span));
  Duration::from_millis(jittered.max(0.0) as u64)
}

/// Drives an async operation through the backoff schedule, retrying while `f`
/// returns a retryable error, up to `cfg.max_attempts` tries total.
pub async fn retry<T, E, F, Fut>(cfg: &BackoffConfig, is_retryable: impl Fn(&E) -> bool, mut f: F) -> Result<T, E>
where
  F: FnMut(u32) -> Fut,
  Fut: std::future::Future<Output = Result<T, E>>,
{
  let mut attempt = 0;
  loop {
    match f(attempt).await {
      Ok(v) => return Ok(v),
      Err(e) if attempt + 1 < cfg.max_attempts && is_retryable(&e) => {
        tokio::time::sleep(delay_for_attempt(cfg, attempt)).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn delay_grows_with_attempt_and_stays_capped() {
    let cfg = BackoffConfig::default();
    let first = delay_for_attempt(&cfg, 0).as_millis();
    let later = delay_for_attempt(&cfg, 10).as_millis();
    assert!(first <= 1500 && first >= 500);
    assert!(later <= 7500);
  }

  #[tokio::test]
  async fn retry_stops_after_max_attempts() {
    let cfg = BackoffConfig {
      max_attempts: 3,
      initial_ms: 1,
      max_ms: 2,
      factor: 2.0,
      randomization: 0.0,
    };
    let mut calls = 0u32;
    let result: Result<(), &'static str> = retry(&cfg, |_| true, |_attempt| {
      calls += 1;
      async { Err("still failing") }
    })
    .await;
    assert!(result.is_err());
    assert_eq!(calls, 3);
  }

  #[tokio::test]
  async fn retry_returns_first_success_without_exhausting_attempts() {
    let cfg = BackoffConfig::default();
    let mut calls = 0u32;
    let result: Result<u32, &'static str> = retry(&cfg, |_| true, |attempt| {
      calls += 1;
      async move {
        if attempt < 2 {
          Err("transient")
        } else {
          Ok(attempt)
        }
      }
    })
    .await;
    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls, 3);
  }
}
