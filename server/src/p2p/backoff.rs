//! Exponential backoff for peer connections.
//!
//! An attempt is made, and on failure the loop sleeps for the current delay
//! and doubles it. Once the next delay would exceed the ceiling the loop gives
//! up with [`Error::MaxBackoff`]. With the defaults (1s, 60s) that is seven
//! attempts separated by 1, 2, 4, 8, 16 and 32 seconds.

use std::future::Future;
use std::time::Duration;

use crate::cancel::{self, CancelSignal};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// The sleeps taken between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max;
        std::iter::successors(Some(self.initial), |d| d.checked_mul(2))
            .take_while(move |d| *d <= max && !d.is_zero())
    }
}

/// Run `attempt` until it succeeds, the backoff is exhausted, or `cancel` fires.
///
/// `label` names the target in logs and in the final error.
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: Backoff,
    label: &str,
    cancel: &mut CancelSignal,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = backoff.initial;

    loop {
        cancel::check(cancel)?;

        let last_error = match attempt().await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => e,
        };

        if delay > backoff.max || delay.is_zero() {
            tracing::warn!("Giving up on {} after backoff reached {:?}", label, backoff.max);
            return Err(Error::MaxBackoff {
                peer: label.to_string(),
                last_error: last_error.to_string(),
            });
        }

        tracing::debug!("Attempt for {} failed ({}), retrying in {:?}", label, last_error, delay);

        tokio::select! {
            _ = cancel::cancelled(cancel) => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = delay.saturating_mul(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = Backoff::default().delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_schedule_includes_ceiling_when_reached_exactly() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        let delays: Vec<u64> = backoff.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4]);
    }

    #[test]
    fn test_zero_initial_has_no_delays() {
        let backoff = Backoff::new(Duration::ZERO, Duration::from_secs(4));
        assert_eq!(backoff.delays().count(), 0);
    }
}
