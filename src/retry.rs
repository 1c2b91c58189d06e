use std::future::Future;
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Capped exponential backoff: `base * 2^(attempt - 1)`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay before the next try after `attempt` failures (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms)
    }

    pub fn next_at(&self, now_ms: i64, attempt: u32) -> i64 {
        let delay = i64::try_from(self.delay_ms(attempt)).unwrap_or(i64::MAX);
        now_ms.saturating_add(delay)
    }
}

/// Run `fut` under a deadline; overrunning it counts as a failed attempt.
pub async fn with_deadline<T, F>(operation: &'static str, deadline_ms: u64, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(deadline_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout {
            operation,
            deadline_ms,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = Backoff::new(1_000, 5_000);
        assert_eq!(backoff.delay_ms(1), 1_000);
        assert_eq!(backoff.delay_ms(2), 2_000);
        assert_eq!(backoff.delay_ms(3), 4_000);
        assert_eq!(backoff.delay_ms(4), 5_000);
        assert_eq!(backoff.delay_ms(60), 5_000);
    }

    #[test]
    fn zero_attempt_uses_base() {
        assert_eq!(Backoff::new(250, 10_000).delay_ms(0), 250);
    }

    #[tokio::test]
    async fn deadline_overrun_is_a_timeout() {
        let err = with_deadline("probe", 10, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, SyncError>(())
        })
        .await
        .expect_err("deadline should fire");
        assert!(matches!(err, SyncError::Timeout { operation: "probe", deadline_ms: 10 }));
    }

    #[tokio::test]
    async fn completes_within_deadline() {
        let value = with_deadline("probe", 1_000, async { Ok::<_, SyncError>(7) })
            .await
            .expect("in time");
        assert_eq!(value, 7);
    }
}
