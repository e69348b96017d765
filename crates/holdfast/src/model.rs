//! Lock model types and statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Lease identifier issued by the coordination service. Zero is never a
/// valid id.
pub type LeaseId = i64;

/// Default lease TTL in seconds when none is configured.
pub const DEFAULT_TTL_SECS: i64 = 5;

/// One successful renewal round for a held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalAck {
    /// TTL the lease was extended to, in seconds.
    pub ttl_secs: i64,
}

/// Outcome of a single create-if-absent transaction submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockAttempt {
    /// Whether the create branch ran, i.e. this contender won.
    pub acquired: bool,
    /// The current holder's stored value when the key already existed.
    /// Diagnostic only; correctness never depends on it.
    #[serde(default)]
    pub current_value: Option<Vec<u8>>,
}

/// Options governing how a [`LockService`](crate::service::LockService)
/// acquires and holds locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOptions {
    /// Lease TTL in seconds. `None` creates the key without a lease; it
    /// then persists until explicitly released.
    pub ttl_secs: Option<i64>,
    /// Renew the lease continuously in the background while the lock is
    /// held. Only meaningful when a TTL is set.
    pub keep_alive: bool,
    /// Value stored under the lock key. Losing contenders see it, which
    /// makes a holder identity (hostname, pod name) a useful choice.
    #[serde(default)]
    pub value: Vec<u8>,
    /// Serialize attempts for the same key within this process so a
    /// locally-held key fails fast without a wasted lease grant. Purely an
    /// optimization: the coordination service's transaction stays the sole
    /// arbiter of ownership.
    pub serialize_local: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl_secs: Some(DEFAULT_TTL_SECS),
            keep_alive: true,
            value: Vec::new(),
            serialize_local: true,
        }
    }
}

impl LockOptions {
    /// Use a lease with the given TTL in seconds.
    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    /// Create the lock key without a lease. The key survives process
    /// crashes until deleted, so prefer a TTL for anything unattended.
    pub fn without_lease(mut self) -> Self {
        self.ttl_secs = None;
        self
    }

    /// Enable or disable background renewal.
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the value stored under the lock key.
    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    /// Enable or disable process-local attempt serialization.
    pub fn with_serialize_local(mut self, serialize_local: bool) -> Self {
        self.serialize_local = serialize_local;
        self
    }

    /// Reject configurations the coordination service would misbehave on.
    pub fn validate(&self) -> Result<(), LockError> {
        if let Some(ttl) = self.ttl_secs
            && ttl <= 0
        {
            return Err(LockError::InvalidTtl(ttl));
        }
        Ok(())
    }
}

/// Point-in-time lock statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStats {
    /// Successful acquisitions.
    pub total_acquisitions: u64,
    /// Attempts refused because the lock was already held.
    pub failed_acquisitions: u64,
    /// Completed releases.
    pub total_releases: u64,
    /// Holds that ended because renewal failed.
    pub locks_lost: u64,
    /// Average hold duration across completed holds, in milliseconds.
    pub avg_hold_time_ms: u64,
}

/// Shared atomic counters behind [`LockStats`].
#[derive(Debug, Default)]
pub(crate) struct LockStatsCollector {
    pub(crate) total_acquisitions: AtomicU64,
    pub(crate) failed_acquisitions: AtomicU64,
    pub(crate) total_releases: AtomicU64,
    pub(crate) locks_lost: AtomicU64,
    pub(crate) total_hold_time_ms: AtomicU64,
    pub(crate) completed_holds: AtomicU64,
}

impl LockStatsCollector {
    pub(crate) fn snapshot(&self) -> LockStats {
        let completed = self.completed_holds.load(Ordering::Relaxed);
        let total_hold = self.total_hold_time_ms.load(Ordering::Relaxed);
        let avg_hold = if completed > 0 {
            total_hold / completed
        } else {
            0
        };

        LockStats {
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            locks_lost: self.locks_lost.load(Ordering::Relaxed),
            avg_hold_time_ms: avg_hold,
        }
    }
}
