//! Lease lifecycle management

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::coordination::{Coordination, RenewalStream};
use crate::error::{LockError, Result};
use crate::model::LeaseId;

/// Renewal cadence for a lease of `ttl_secs`: one third of the TTL,
/// floored at 100ms so one-second leases still renew in time.
pub fn renewal_interval(ttl_secs: i64) -> Duration {
    Duration::from_millis(ttl_secs.max(0) as u64 * 1000 / 3).max(Duration::from_millis(100))
}

/// Grants, renews, and revokes the TTL leases that back held locks.
///
/// Each lock attempt owns its own lease for as long as it might be held;
/// lease identity is never shared across attempts.
#[derive(Clone)]
pub struct LeaseManager {
    coordination: Arc<dyn Coordination>,
}

impl LeaseManager {
    pub fn new(coordination: Arc<dyn Coordination>) -> Self {
        Self { coordination }
    }

    /// Grant a lease for `ttl_secs` seconds. Zero or negative is a
    /// configuration error, rejected before the service is contacted.
    pub async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(LockError::InvalidTtl(ttl_secs));
        }
        let lease = self.coordination.grant_lease(ttl_secs).await?;
        debug!(lease, ttl_secs, "lease granted");
        Ok(lease)
    }

    /// Start renewing `lease`. The returned stream yields one ack per
    /// successful round and closes when the lease can no longer be renewed.
    pub async fn keep_alive(&self, lease: LeaseId) -> Result<RenewalStream> {
        let stream = self.coordination.keep_alive(lease).await?;
        debug!(lease, "keep-alive started");
        Ok(stream)
    }

    /// Revoke `lease`, best-effort. Failures are logged and swallowed: the
    /// service-side TTL expiry is the backstop for reclaiming the lease.
    pub async fn revoke(&self, lease: LeaseId) {
        match self.coordination.revoke_lease(lease).await {
            Ok(()) => debug!(lease, "lease revoked"),
            Err(e) => warn!(lease, error = %e, "lease revoke failed; ttl expiry will reclaim it"),
        }
    }
}
