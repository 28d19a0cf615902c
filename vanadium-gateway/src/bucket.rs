//! Leaky-bucket admission control for outbound commands.
//!
//! Tokens refill at a fixed cadence. Callers that cannot be admitted park in
//! a deque; high-priority callers park at the head and overtake everything
//! already waiting. The waiter deque survives a rebuild, so senders queued
//! before Hello renegotiates the rate complete against the new bucket.

use crate::error::GatewayError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Commands the gateway admits per rate-limit interval.
pub(crate) const COMMANDS_PER_INTERVAL: u32 = 120;

/// How often the gateway resets the command allowance.
pub(crate) const REFILL_INTERVAL: Duration = Duration::from_millis(60_000);

/// Commands to allot per interval, leaving twice the heartbeat count in
/// reserve for protocol traffic the gateway may demand at any time.
pub(crate) fn safe_commands_per_interval(heartbeat_interval_ms: u64) -> u32 {
    let interval_ms = if heartbeat_interval_ms == 0 {
        45_000
    } else {
        heartbeat_interval_ms
    };

    let reserved = (REFILL_INTERVAL.as_millis() as u64).div_ceil(interval_ms) * 2;
    COMMANDS_PER_INTERVAL.saturating_sub(reserved.min(u64::from(u32::MAX)) as u32)
}

#[derive(Debug)]
struct Waiter {
    amount: u32,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct BucketState {
    max: u32,
    refill_amount: u32,
    refill_interval: Duration,
    tokens: u32,
    last_refill: Instant,
    waiting: VecDeque<Waiter>,
    driving: bool,
    closed: bool,
}

impl BucketState {
    /// Credit tokens for every full refill interval that elapsed.
    fn replenish(&mut self) {
        let elapsed = Instant::now().duration_since(self.last_refill);
        if elapsed < self.refill_interval {
            return;
        }

        let ticks = (elapsed.as_millis() / self.refill_interval.as_millis()) as u32;
        self.tokens = self
            .tokens
            .saturating_add(ticks.saturating_mul(self.refill_amount))
            .min(self.max);
        self.last_refill += self.refill_interval * ticks;
    }

    /// Admit waiters from the head while tokens allow.
    fn serve(&mut self) {
        while self
            .waiting
            .front()
            .is_some_and(|front| self.tokens >= front.amount)
        {
            if let Some(waiter) = self.waiting.pop_front() {
                self.tokens -= waiter.amount;
                if waiter.tx.send(()).is_err() {
                    // Receiver gave up; return its tokens.
                    self.tokens += waiter.amount;
                }
            }
        }
    }
}

/// Token-count rate limiter with priority waiters.
#[derive(Debug)]
pub struct CommandBucket {
    state: Arc<Mutex<BucketState>>,
}

impl CommandBucket {
    /// Create a full bucket.
    pub fn new(max: u32, refill_amount: u32, refill_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketState {
                max,
                refill_amount,
                refill_interval,
                tokens: max,
                last_refill: Instant::now(),
                waiting: VecDeque::new(),
                driving: false,
                closed: false,
            })),
        }
    }

    /// Take `amount` tokens, waiting for a refill when the bucket cannot
    /// admit the caller immediately. High-priority callers overtake every
    /// parked waiter.
    ///
    /// # Errors
    /// Returns [`GatewayError::Shutdown`] when the bucket is closed while
    /// the caller waits.
    pub async fn acquire(&self, amount: u32, high_priority: bool) -> Result<(), GatewayError> {
        let rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(GatewayError::Shutdown);
            }

            state.replenish();
            if state.waiting.is_empty() && state.tokens >= amount {
                state.tokens -= amount;
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { amount, tx };
            if high_priority {
                state.waiting.push_front(waiter);
            } else {
                state.waiting.push_back(waiter);
            }

            if !state.driving {
                state.driving = true;
                tokio::spawn(drive(Arc::clone(&self.state)));
            }

            rx
        };

        rx.await.map_err(|_| GatewayError::Shutdown)
    }

    /// Replace the rate configuration, refilling to the new capacity while
    /// keeping every parked waiter. Waiters the fresh capacity can admit are
    /// released immediately, in queue order.
    pub fn rebuild(&self, max: u32, refill_amount: u32, refill_interval: Duration) {
        let mut state = self.state.lock();
        state.max = max;
        state.refill_amount = refill_amount;
        state.refill_interval = refill_interval;
        state.tokens = max;
        state.last_refill = Instant::now();
        state.serve();
    }

    /// Wake every parked waiter with a cancellation outcome and reject
    /// future acquires.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiting.clear();
    }

    /// Tokens currently available.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        state.replenish();
        state.tokens
    }

    /// Capacity of the bucket.
    pub fn max(&self) -> u32 {
        self.state.lock().max
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.state.lock().waiting.len()
    }
}

/// Serve parked waiters at every refill boundary until none remain.
async fn drive(state: Arc<Mutex<BucketState>>) {
    loop {
        let wake_at = {
            let mut state = state.lock();
            state.replenish();
            state.serve();
            if state.waiting.is_empty() || state.closed {
                state.driving = false;
                return;
            }
            state.last_refill + state.refill_interval
        };

        tokio::time::sleep_until(wake_at).await;
    }
}
