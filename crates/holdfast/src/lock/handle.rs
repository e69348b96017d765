//! Held-lock lifecycle: state machine, keep-alive worker, release

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordination::{Coordination, RenewalStream};
use crate::lease::LeaseManager;
use crate::model::{LeaseId, LockStatsCollector};

/// Acquire/release state of one lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleState {
    /// Nothing has been submitted to the coordination service yet.
    Unacquired = 0,
    /// Lease grant or transaction submission in flight.
    Acquiring = 1,
    /// The lock is owned; the critical section may run.
    Held = 2,
    /// Explicitly released. Terminal.
    Released = 3,
    /// Acquisition failed, or ownership was lost before release. Terminal.
    Failed = 4,
}

impl HandleState {
    fn from_u8(raw: u8) -> HandleState {
        match raw {
            0 => HandleState::Unacquired,
            1 => HandleState::Acquiring,
            2 => HandleState::Held,
            3 => HandleState::Released,
            _ => HandleState::Failed,
        }
    }
}

/// Atomic state cell shared between the handle, the keep-alive worker, and
/// the critical-section executor. Besides the worker's stop channel this is
/// the only mutable state they share.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: HandleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> HandleState {
        HandleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, state: HandleState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move `from` to `to`; false when another transition won the race.
    pub(crate) fn transition(&self, from: HandleState, to: HandleState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn swap(&self, to: HandleState) -> HandleState {
        HandleState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }
}

/// A successfully acquired lock.
///
/// Owns the backing lease, the keep-alive worker, and exactly-once release.
/// Dropping a held handle without calling [`release`](Self::release) stops
/// the renewal worker and leaves the key to the lease's TTL expiry.
pub struct LockHandle {
    key: String,
    lease: Option<LeaseId>,
    coordination: Arc<dyn Coordination>,
    leases: LeaseManager,
    state: Arc<StateCell>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<LockStatsCollector>,
    held_since: Instant,
    local_permit: Option<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub(crate) fn new(
        key: String,
        lease: Option<LeaseId>,
        coordination: Arc<dyn Coordination>,
        leases: LeaseManager,
        state: Arc<StateCell>,
        stats: Arc<LockStatsCollector>,
        local_permit: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            key,
            lease,
            coordination,
            leases,
            state,
            stop_tx: None,
            worker: None,
            stats,
            held_since: Instant::now(),
            local_permit,
        }
    }

    /// Start the keep-alive worker for this handle's lease.
    pub(crate) fn start_keep_alive(&mut self, renewals: RenewalStream) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        self.worker = Some(spawn_keep_alive_worker(
            self.key.clone(),
            self.state.clone(),
            self.stats.clone(),
            renewals,
            stop_rx,
        ));
        self.stop_tx = Some(stop_tx);
    }

    /// The key this handle locked.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The lease backing this handle, if one was used.
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease
    }

    pub fn state(&self) -> HandleState {
        self.state.load()
    }

    /// Whether the lock is still owned.
    pub fn is_held(&self) -> bool {
        self.state.load() == HandleState::Held
    }

    /// Whether ownership was lost before an explicit release. A running
    /// critical section should treat its work as unsafe once this is true.
    pub fn is_lost(&self) -> bool {
        self.state.load() == HandleState::Failed
    }

    /// Release the lock: stop the keep-alive worker, then revoke the lease
    /// (or delete the key when no lease backs it).
    ///
    /// Idempotent; a second call is a no-op. Failures on this path are
    /// logged, never returned; the lease TTL is the backstop.
    pub async fn release(&mut self) {
        if self.state.swap(HandleState::Released) == HandleState::Released {
            return;
        }

        // Stop renewal before revoking so the lease cannot be renewed
        // after revocation has been requested.
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }

        match self.lease {
            Some(lease) => self.leases.revoke(lease).await,
            None => {
                if let Err(e) = self.coordination.delete_key(&self.key).await {
                    warn!(key = %self.key, error = %e, "lock key delete failed");
                }
            }
        }

        let held_ms = self.held_since.elapsed().as_millis() as u64;
        self.stats.total_releases.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_hold_time_ms
            .fetch_add(held_ms, Ordering::Relaxed);
        self.stats.completed_holds.fetch_add(1, Ordering::Relaxed);
        counter!("holdfast_lock_releases_total").increment(1);
        debug!(key = %self.key, held_ms, "lock released");

        self.local_permit = None;
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("state", &self.state.load())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.state.load() == HandleState::Held {
            // The stop channel drops with the handle, which stops the
            // worker; the lease then runs out its TTL service-side.
            warn!(key = %self.key, "lock handle dropped without release; lease will expire via ttl");
        }
    }
}

/// Background renewal consumer for one held lock, and the only background
/// activity per handle. Runs until release cancels it or the renewal stream
/// ends; a stream that ends before release means the lease can no longer be
/// renewed, so the lock must be treated as lost.
fn spawn_keep_alive_worker(
    key: String,
    state: Arc<StateCell>,
    stats: Arc<LockStatsCollector>,
    mut renewals: RenewalStream,
    mut stop_rx: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                // Fires on an explicit stop and when the handle (and with
                // it the sender) is dropped.
                _ = stop_rx.recv() => {
                    debug!(key = %key, "keep-alive worker stopped");
                    break;
                }
                ack = renewals.recv() => {
                    match ack {
                        Some(ack) => {
                            debug!(key = %key, ttl_secs = ack.ttl_secs, "lease renewed");
                        }
                        None => {
                            if state.transition(HandleState::Held, HandleState::Failed) {
                                warn!(key = %key, "renewal stream ended while held; lock ownership lost");
                                stats.locks_lost.fetch_add(1, Ordering::Relaxed);
                                counter!("holdfast_locks_lost_total").increment(1);
                            }
                            break;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_transitions() {
        let cell = StateCell::new(HandleState::Unacquired);
        assert_eq!(cell.load(), HandleState::Unacquired);

        cell.store(HandleState::Acquiring);
        cell.store(HandleState::Held);
        assert!(cell.transition(HandleState::Held, HandleState::Failed));
        assert!(!cell.transition(HandleState::Held, HandleState::Failed));
        assert_eq!(cell.load(), HandleState::Failed);
    }

    #[test]
    fn test_state_cell_release_is_exactly_once() {
        let cell = StateCell::new(HandleState::Held);
        assert_eq!(cell.swap(HandleState::Released), HandleState::Held);
        assert_eq!(cell.swap(HandleState::Released), HandleState::Released);
    }

    #[test]
    fn test_failed_worker_loses_release_race_cleanly() {
        let cell = StateCell::new(HandleState::Held);
        // Release swaps first; the worker's Held->Failed transition must
        // then refuse rather than resurrect the handle.
        assert_eq!(cell.swap(HandleState::Released), HandleState::Held);
        assert!(!cell.transition(HandleState::Held, HandleState::Failed));
        assert_eq!(cell.load(), HandleState::Released);
    }
}
