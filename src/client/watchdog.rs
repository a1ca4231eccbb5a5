//! Client-side idle-activity watchdog. See SPEC_FULL.md §4.6.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::error::ClientDriverError;

/// Activity pushed by receivers on every successful send or non-empty
/// recv, or on observing the server's `SuspiciousClientIP!` sentinel.
#[derive(Clone, Debug)]
pub enum Activity {
    /// A send or non-empty recv happened on some flow.
    Tick,
    /// The server reported a different data-plane source IP than the
    /// side channel saw, via the `SuspiciousClientIP!;<ip>` sentinel.
    IpFlip(String),
}

/// Watches an [`Activity`] channel; if no [`Activity::Tick`] arrives for
/// `max_idle` it returns [`ClientDriverError::IdleTimeout`]. If an
/// [`Activity::IpFlip`] arrives at any point it returns
/// [`ClientDriverError::IpFlip`] immediately.
///
/// # Errors
///
/// Returns `Err` exactly in those two cases; returns `Ok(())` only if the
/// channel is closed by the send loop signalling normal completion
/// (callers should race this future against their own completion signal).
pub async fn watch(
    mut activity: mpsc::UnboundedReceiver<Activity>,
    max_idle: Duration,
) -> Result<(), ClientDriverError> {
    let mut last_tick = Instant::now();
    loop {
        match timeout(max_idle, activity.recv()).await {
            Ok(Some(Activity::Tick)) => last_tick = Instant::now(),
            Ok(Some(Activity::IpFlip(ip))) => return Err(ClientDriverError::IpFlip(ip)),
            Ok(None) => return Ok(()),
            Err(_elapsed) => {
                if last_tick.elapsed() >= max_idle {
                    return Err(ClientDriverError::IdleTimeout);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn times_out_without_activity() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let result = watch(rx, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientDriverError::IdleTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn ip_flip_short_circuits() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Activity::IpFlip("203.0.113.5".to_owned())).unwrap();
        let result = watch(rx, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(ClientDriverError::IpFlip(ip)) if ip == "203.0.113.5"));
    }
}
