use std::time::Duration;

use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::error::ConsensusError;

/// The five phases of the Round State Machine (C1), spec §4.1. The integer
/// values are the wire-level phase numbering used by metrics and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle = 0,
    Ready = 1,
    MempoolSync = 2,
    Building = 3,
    Committing = 4,
}

impl Phase {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Owns `phase` behind an async `RwLock`, paired with a `Notify` so
/// phase-gated waits re-check on every transition instead of polling a
/// bare sleep loop — the async analogue of the condvar-per-transition
/// re-architecture recommended in spec §9, replacing the source's
/// busy-waiting-on-a-shared-integer pattern. Waits never hold the phase
/// lock while parked (spec §4.1: "Waits do NOT hold the data locks").
pub struct PhaseGate {
    phase: RwLock<Phase>,
    notify: Notify,
}

impl PhaseGate {
    pub fn new(initial: Phase) -> Self {
        Self {
            phase: RwLock::new(initial),
            notify: Notify::new(),
        }
    }

    pub async fn current(&self) -> Phase {
        *self.phase.read().await
    }

    /// Transition to `next`, waking every waiter so they re-check their
    /// condition immediately rather than on the next poll tick.
    pub async fn set(&self, next: Phase) {
        *self.phase.write().await = next;
        metrics::record_consensus_phase(next.as_u8());
        self.notify.notify_waiters();
    }

    /// Block the caller until `phase == required`, re-checking on every
    /// `Notify` wake plus a bounded fallback poll interval, for at most
    /// `timeout`. Returns `Err(OutOfOrderMessage)` on timeout — spec §4.1:
    /// "Fails with OutOfOrderMessage if a message arrives whose phase will
    /// never be reached before another addBlock resets to IDLE".
    pub async fn wait_for(
        &self,
        required: Phase,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), ConsensusError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.current().await == required {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(?required, "phase gate timed out; dropping message as out-of-order");
                return Err(ConsensusError::OutOfOrderMessage);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let wait_slice = poll_interval.min(remaining);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait_slice) => {}
            }
        }
    }
}
