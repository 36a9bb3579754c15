//! Deadlines for driver calls.

use smol::Timer;
use std::future::Future;
use std::time::Duration;

/// Budgets for the two bounded driver calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub ping: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            ping: Duration::from_secs(5),
        }
    }
}

/// Resolve `future`, or `None` once `limit` has passed. The losing future is
/// dropped, which cancels it.
pub async fn with_deadline<F, T>(limit: Duration, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    smol::future::or(async { Some(future.await) }, async {
        Timer::after(limit).await;
        None
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_within_deadline() {
        smol::block_on(async {
            let value = with_deadline(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(value, Some(7));
        });
    }

    #[test]
    fn test_times_out() {
        smol::block_on(async {
            let value = with_deadline(Duration::from_millis(20), async {
                Timer::after(Duration::from_secs(5)).await;
                7
            })
            .await;
            assert_eq!(value, None);
        });
    }

    #[test]
    fn test_default_budgets() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.connect.as_secs(), 15);
        assert_eq!(timeouts.ping.as_secs(), 5);
    }
}
