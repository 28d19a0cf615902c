//! Identify gating and randomized protocol delays.
//!
//! The gateway limits how often sessions may be started. Shards do not
//! enforce this themselves; they ask an [`IdentifyQueue`] for a permit, so a
//! cluster-level coordinator can gate identifies across processes. The
//! in-process default releases one permit per five seconds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Grants permission to transmit an Identify payload.
pub trait IdentifyQueue: Send + Sync {
    /// Complete when the shard may identify.
    fn request(&self, shard_id: u32) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Single-process [`IdentifyQueue`] releasing `max_concurrency` permits per
/// five-second window.
pub struct LocalIdentifyQueue {
    semaphore: Arc<Semaphore>,
    hold_duration: Duration,
}

impl LocalIdentifyQueue {
    /// Create a queue with the given `max_concurrency`.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            hold_duration: Duration::from_secs(5),
        }
    }

    /// Permits currently available.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for LocalIdentifyQueue {
    fn default() -> Self {
        // Most bots get max_concurrency 1.
        Self::new(1)
    }
}

impl IdentifyQueue for LocalIdentifyQueue {
    fn request(&self, shard_id: u32) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => {
                    let hold_duration = self.hold_duration;
                    tokio::spawn(async move {
                        sleep(hold_duration).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    tracing::warn!(shard_id, "identify semaphore closed, proceeding");
                }
            }
        })
    }
}

/// Delay before the first heartbeat: a uniform sample of the interval,
/// floored at half of it so a zero-delay beat cannot race the handshake.
pub(crate) fn first_beat_delay(interval_ms: u64) -> Duration {
    use rand::Rng;

    let factor = rand::rng().random::<f64>().max(0.5);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let delay_ms = (interval_ms as f64 * factor).ceil() as u64;
    Duration::from_millis(delay_ms)
}

/// Delay before acting on an invalidated session: uniform in 1-5 seconds.
pub(crate) fn invalid_session_backoff() -> Duration {
    use rand::Rng;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let delay_ms = ((rand::rng().random::<f64>() * 4.0 + 1.0) * 1000.0).floor() as u64;
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_queue_hands_out_permits() {
        let queue = LocalIdentifyQueue::new(3);
        assert_eq!(queue.available_permits(), 3);

        queue.request(0).await;
        assert!(queue.available_permits() <= 3);
    }

    #[test]
    fn first_beat_delay_within_bounds() {
        for _ in 0..500 {
            let delay = first_beat_delay(41_250);
            assert!(delay >= Duration::from_millis(20_625));
            assert!(delay <= Duration::from_millis(41_250));
        }
    }

    #[test]
    fn invalid_session_backoff_within_bounds() {
        for _ in 0..500 {
            let delay = invalid_session_backoff();
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(5_000));
        }
    }
}
