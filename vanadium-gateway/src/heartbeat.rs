//! Heartbeat bookkeeping.
//!
//! The timers live on the shard; this tracks the negotiated interval, the
//! acknowledgement flag, and round-trip timing. Any inbound packet counts as
//! an acknowledgement, so RTT is measured on all traffic rather than only on
//! explicit acks.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "no RTT sample yet".
const RTT_UNSET: u64 = u64::MAX;

/// Interval used until Hello negotiates one.
const DEFAULT_INTERVAL_MS: u64 = 45_000;

#[derive(Debug, Default)]
struct Timing {
    last_beat: Option<Instant>,
    last_ack: Option<Instant>,
}

/// Heartbeat state for one shard.
#[derive(Debug)]
pub(crate) struct Heart {
    interval_ms: AtomicU64,
    acknowledged: AtomicBool,
    timing: RwLock<Timing>,
    rtt_ms: AtomicU64,
}

impl Heart {
    pub fn new() -> Self {
        Self {
            interval_ms: AtomicU64::new(DEFAULT_INTERVAL_MS),
            acknowledged: AtomicBool::new(true),
            timing: RwLock::new(Timing::default()),
            rtt_ms: AtomicU64::new(RTT_UNSET),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    pub fn set_interval(&self, interval_ms: u64) {
        self.interval_ms.store(interval_ms, Ordering::Release);
    }

    /// Prepare for a fresh connection.
    pub fn reset(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
        *self.timing.write() = Timing::default();
    }

    /// A heartbeat was transmitted; unacknowledged until the next packet.
    pub fn mark_sent(&self) {
        self.acknowledged.store(false, Ordering::SeqCst);
        self.timing.write().last_beat = Some(Instant::now());
    }

    /// The gateway requested a heartbeat and we echoed one.
    pub fn note_server_beat(&self) {
        self.timing.write().last_beat = Some(Instant::now());
    }

    /// Record an inbound packet. If a beat was outstanding, this counts as
    /// its acknowledgement and yields the measured round trip.
    pub fn observe_packet(&self) -> Option<Duration> {
        let mut timing = self.timing.write();
        let now = Instant::now();
        timing.last_ack = Some(now);

        let beat = timing.last_beat?;
        if self.acknowledged.swap(true, Ordering::SeqCst) {
            return None;
        }

        let rtt = now.duration_since(beat);
        self.rtt_ms
            .store(rtt.as_millis() as u64, Ordering::Release);
        Some(rtt)
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Last measured round trip, if any.
    pub fn rtt(&self) -> Option<Duration> {
        let ms = self.rtt_ms.load(Ordering::Acquire);
        (ms != RTT_UNSET).then(|| Duration::from_millis(ms))
    }
}
