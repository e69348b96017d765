//! In-process coordination engine
//!
//! A single-process, linearizable implementation of [`Coordination`]: one
//! mutex-guarded table arbitrates every transaction, leases expire on
//! tokio-time deadlines, and renewal streams behave like their networked
//! counterparts. Serves embedded single-process deployments and the lock
//! test fixtures; a networked backend replaces it in clustered use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::coordination::{Coordination, RenewalStream};
use crate::error::CoordinationError;
use crate::lease::renewal_interval;
use crate::model::{LeaseId, LockAttempt, RenewalAck};

const RENEWAL_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug)]
struct KeyEntry {
    value: Vec<u8>,
    #[allow(dead_code)]
    create_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseEntry {
    ttl_secs: i64,
    deadline: Instant,
    /// Cleared by [`MemoryCoordination::disconnect_lease`]: renewal stops
    /// extending the deadline and the renewal stream ends, but the lease
    /// itself survives until the deadline passes.
    connected: bool,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    revision: i64,
    next_lease: LeaseId,
    keys: HashMap<String, KeyEntry>,
    leases: HashMap<LeaseId, LeaseEntry>,
}

impl EngineState {
    /// Remove leases whose deadline has passed, together with every key
    /// bound to them. Called on every operation so expiry never depends on
    /// the background scanner running.
    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(lease) = self.leases.remove(&id) {
                for key in &lease.keys {
                    self.keys.remove(key);
                }
                debug!(lease = id, keys = lease.keys.len(), "lease expired");
            }
        }
    }

    fn remove_lease(&mut self, id: LeaseId) -> bool {
        match self.leases.remove(&id) {
            Some(lease) => {
                for key in &lease.keys {
                    self.keys.remove(key);
                }
                true
            }
            None => false,
        }
    }
}

/// In-memory coordination service.
///
/// Linearizability comes for free from the single state mutex: every
/// transaction observes a total order. Clone the wrapping `Arc` to share
/// one engine across services standing in for independent processes.
#[derive(Debug)]
pub struct MemoryCoordination {
    state: Arc<Mutex<EngineState>>,
    _scanner_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            _scanner_handle: None,
        }
    }

    /// Start a background scanner that purges expired leases every
    /// `interval` and publishes the alive-lease gauge. Expiry is already
    /// enforced lazily on every operation; the scanner keeps the table and
    /// the gauge fresh between operations. Requires a tokio runtime.
    pub fn with_expiry_scanner(self, interval: Duration) -> Self {
        let state = self.state.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let alive = {
                    let mut state = state.lock();
                    state.purge_expired(Instant::now());
                    state.leases.len()
                };
                gauge!("holdfast_leases_alive").set(alive as f64);
            }
        });

        Self {
            state: self.state,
            _scanner_handle: Some(handle),
        }
    }

    /// Simulate losing connectivity for `lease`: renewal stops extending
    /// the deadline and the renewal stream ends, but the lease is not
    /// revoked; it expires when its current TTL runs out. Returns false
    /// for an unknown lease.
    pub fn disconnect_lease(&self, lease: LeaseId) -> bool {
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.connected = false;
                debug!(lease, "lease disconnected");
                true
            }
            None => false,
        }
    }

    /// Number of unexpired leases currently tracked.
    pub fn alive_leases(&self) -> usize {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    /// Ids of the unexpired leases currently tracked.
    pub fn lease_ids(&self) -> Vec<LeaseId> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        state.leases.keys().copied().collect()
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Coordination for MemoryCoordination {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, CoordinationError> {
        if ttl_secs <= 0 {
            return Err(CoordinationError::Service(format!(
                "invalid lease ttl: {ttl_secs}"
            )));
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);

        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl_secs,
                deadline: now + Duration::from_secs(ttl_secs as u64),
                connected: true,
                keys: HashSet::new(),
            },
        );
        debug!(lease = id, ttl_secs, "lease granted");
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<RenewalStream, CoordinationError> {
        let interval = {
            let mut state = self.state.lock();
            state.purge_expired(Instant::now());
            let entry = state
                .leases
                .get(&lease)
                .ok_or_else(|| CoordinationError::Service(format!("lease {lease} not found")))?;
            renewal_interval(entry.ttl_secs)
        };

        let (tx, rx) = mpsc::channel(RENEWAL_CHANNEL_CAPACITY);
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    debug!(lease, "renewal stopped: consumer dropped");
                    break;
                }

                let ack = {
                    let now = Instant::now();
                    let mut state = state.lock();
                    state.purge_expired(now);
                    match state.leases.get_mut(&lease) {
                        Some(entry) if entry.connected => {
                            entry.deadline = now + Duration::from_secs(entry.ttl_secs as u64);
                            Some(RenewalAck {
                                ttl_secs: entry.ttl_secs,
                            })
                        }
                        Some(_) => {
                            debug!(lease, "renewal stopped: lease disconnected");
                            None
                        }
                        None => {
                            debug!(lease, "renewal stopped: lease gone");
                            None
                        }
                    }
                };

                match ack {
                    Some(ack) => match tx.try_send(ack) {
                        Ok(()) => {}
                        // Acks are pure liveness; the renewal itself already
                        // happened, so a full buffer just drops the ack.
                        Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    },
                    // Dropping tx closes the stream for the consumer.
                    None => break,
                }
            }
        });

        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        if state.remove_lease(lease) {
            debug!(lease, "lease revoked");
            Ok(())
        } else {
            Err(CoordinationError::Service(format!(
                "lease {lease} not found"
            )))
        }
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<LockAttempt, CoordinationError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.purge_expired(now);

        if let Some(entry) = state.keys.get(key) {
            return Ok(LockAttempt {
                acquired: false,
                current_value: Some(entry.value.clone()),
            });
        }

        if let Some(id) = lease {
            let entry = state
                .leases
                .get_mut(&id)
                .ok_or_else(|| CoordinationError::Service(format!("lease {id} not found")))?;
            entry.keys.insert(key.to_string());
        }

        state.revision += 1;
        let create_revision = state.revision;
        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_vec(),
                create_revision,
                lease,
            },
        );

        Ok(LockAttempt {
            acquired: true,
            current_value: None,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        Ok(state.keys.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete_key(&self, key: &str) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        state.purge_expired(Instant::now());
        if let Some(entry) = state.keys.remove(key) {
            state.revision += 1;
            if let Some(id) = entry.lease
                && let Some(lease) = state.leases.get_mut(&id)
            {
                lease.keys.remove(key);
            }
        }
        Ok(())
    }
}
