//! One-shot rendezvous points for identify and resume attempts.
//!
//! One slot per awaited gateway signal. Registering replaces any previous
//! waiter for that slot, each waiter is fulfilled at most once, and a fatal
//! close fails every registered waiter at once.

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Signals an identify or resume attempt can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaiterKind {
    Ready,
    Resumed,
    InvalidSession,
}

/// How a wait concluded.
#[derive(Debug, Clone)]
pub(crate) enum WaiterOutcome {
    /// The awaited signal arrived.
    Resolved,
    /// The connection closed with an unrecoverable code.
    Fatal { code: u16, reason: String },
}

#[derive(Debug, Default)]
struct Slots {
    ready: Option<oneshot::Sender<WaiterOutcome>>,
    resumed: Option<oneshot::Sender<WaiterOutcome>>,
    invalid_session: Option<oneshot::Sender<WaiterOutcome>>,
}

impl Slots {
    fn slot(&mut self, kind: WaiterKind) -> &mut Option<oneshot::Sender<WaiterOutcome>> {
        match kind {
            WaiterKind::Ready => &mut self.ready,
            WaiterKind::Resumed => &mut self.resumed,
            WaiterKind::InvalidSession => &mut self.invalid_session,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Waiters {
    slots: Mutex<Slots>,
}

impl Waiters {
    /// Register a waiter, replacing (and thereby cancelling) any previous
    /// one in the same slot.
    pub fn register(&self, kind: WaiterKind) -> oneshot::Receiver<WaiterOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.slots.lock().slot(kind) = Some(tx);
        rx
    }

    /// Fulfil and remove the waiter in `kind`, if one is registered.
    pub fn resolve(&self, kind: WaiterKind) {
        if let Some(tx) = self.slots.lock().slot(kind).take() {
            let _ = tx.send(WaiterOutcome::Resolved);
        }
    }

    /// Fail every registered waiter with an unrecoverable close.
    pub fn fail_all(&self, code: u16, reason: &str) {
        let mut slots = self.slots.lock();
        for kind in [
            WaiterKind::Ready,
            WaiterKind::Resumed,
            WaiterKind::InvalidSession,
        ] {
            if let Some(tx) = slots.slot(kind).take() {
                let _ = tx.send(WaiterOutcome::Fatal {
                    code,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Drop every registered waiter, signalling cancellation.
    pub fn clear(&self) {
        *self.slots.lock() = Slots::default();
    }
}
