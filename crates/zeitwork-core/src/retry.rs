use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible async operation with a fixed delay between attempts.
///
/// The control plane favours simple fixed-interval polling over exponential
/// escalation; reconcilers already provide their own 5-second retry cadence,
/// this helper covers one-shot call sites (log shipping, builder spawn).
pub async fn retry_fixed<T, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt ran"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry_fixed(3, Duration::from_millis(1), "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = AtomicU32::new(0);
        let result = retry_fixed(3, Duration::from_millis(1), "test", || {
            let c = count.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if c < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(c)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_all_attempts() {
        let count = AtomicU32::new(0);
        let result: Result<i32> = retry_fixed(3, Duration::from_millis(1), "test", || {
            count.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("always fails") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
