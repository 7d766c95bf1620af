//!
//! src/retry.rs
//!
//! Exponential backoff around a single catalog call. Only transient
//! errors are retried, everything else returns on the first attempt
//!

use std::{future::Future, time::Duration};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::BridgeError;

/// Delay before retry number `retry` (0 based): base * factor^retry,
/// capped, plus up to a quarter of itself when jitter is on
pub fn generate_backoff(cfg: &RetryConfig, retry: u32, rng: &mut SmallRng) -> Duration {
    let base = cfg.base_backoff.as_millis() as u64;
    let cap = cfg.max_backoff.as_millis() as u64;
    let exp = u64::from(cfg.factor).saturating_pow(retry.min(16));
    let ms = base.saturating_mul(exp).min(cap);

    let jitter = if cfg.jitter && ms > 0 { rng.gen_range(0..=ms / 4) } else { 0 };
    Duration::from_millis(ms + jitter)
}

/// Runs `op` until it succeeds, fails permanently, or the retry budget
/// is spent. Returns the final result with the number of attempts made
pub async fn with_retry_counted<T, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F
) -> (Result<T, BridgeError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>
{
    let mut rng = SmallRng::from_entropy();
    let mut attempts = 0_u32;
    loop {
        if cancel.is_cancelled() {
            return (Err(BridgeError::Cancelled), attempts);
        }
        attempts += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            r = op() => r
        };

        let err = match result {
            Ok(v) => return (Ok(v), attempts),
            Err(e) if e.is_transient() && attempts <= cfg.max_retries => e,
            Err(e) => return (Err(e), attempts)
        };

        let backoff = generate_backoff(cfg, attempts - 1, &mut rng);
        warn!(
            op = label, attempt = attempts, backoff_ms = backoff.as_millis() as u64,
            error = %err, "http.retry"
        );
        tokio::select! {
            _ = cancel.cancelled() => return (Err(BridgeError::Cancelled), attempts),
            _ = sleep(backoff) => {}
        }
    }
}

pub async fn with_retry<T, F, Fut>(
    cfg: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    op: F
) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>
{
    with_retry_counted(cfg, cancel, label, op).await.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = RetryConfig::default();
        let delays: Vec<u64> = (0..5)
            .map(|n| generate_backoff(&cfg, n, &mut rng()).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000]);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let cfg = RetryConfig { jitter: true, ..RetryConfig::default() };
        let mut r = rng();
        for _ in 0..50 {
            let d = generate_backoff(&cfg, 1, &mut r).as_millis() as u64;
            assert!((1000..=1250).contains(&d), "delay {d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let (result, attempts) = with_retry_counted(
            &RetryConfig::default(), &CancellationToken::new(), "test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(BridgeError::TransientNetwork("503".into()))
                } else {
                    Ok(n)
                }
            }
        ).await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500) && elapsed < Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_retry_budget() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = with_retry_counted(
            &RetryConfig::default(), &CancellationToken::new(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BridgeError::TransientNetwork("timeout".into()))
            }
        ).await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (result, attempts) = with_retry_counted(
            &RetryConfig::default(), &CancellationToken::new(), "test", || async {
                Err::<(), _>(BridgeError::AuthInvalid("expired".into()))
            }
        ).await;
        assert!(matches!(result, Err(BridgeError::AuthInvalid(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = with_retry(&RetryConfig::default(), &cancel, "test", || async {
            Err::<(), _>(BridgeError::TransientNetwork("503".into()))
        }).await;
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }
}
