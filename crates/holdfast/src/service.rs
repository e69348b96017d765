//! Caller-facing lock service
//!
//! `LockService` exposes the two operations callers use:
//! - `try_acquire`: one transaction submission, returning a [`LockHandle`]
//!   on success
//! - `with_lock`: run a critical section under the lock with release
//!   guaranteed on every exit path, including a panicking body

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::coordination::Coordination;
use crate::error::{LockError, Result};
use crate::lease::LeaseManager;
use crate::lock::{HandleState, LockAcquirer, LockHandle, StateCell};
use crate::model::{LockOptions, LockStats, LockStatsCollector};

/// Distributed mutual-exclusion service over a coordination backend.
///
/// One service instance may be shared across tasks; lock attempts on
/// different keys never contend with each other locally. Lease state is
/// strictly per-attempt: each [`LockHandle`] owns its own lease.
pub struct LockService {
    coordination: Arc<dyn Coordination>,
    acquirer: LockAcquirer,
    leases: LeaseManager,
    options: LockOptions,
    /// Per-key gates backing the process-local serialization optimization.
    local_gates: DashMap<String, Arc<Mutex<()>>>,
    stats: Arc<LockStatsCollector>,
}

impl LockService {
    /// Create a service with default [`LockOptions`].
    pub fn new(coordination: Arc<dyn Coordination>) -> Self {
        Self {
            acquirer: LockAcquirer::new(coordination.clone()),
            leases: LeaseManager::new(coordination.clone()),
            coordination,
            options: LockOptions::default(),
            local_gates: DashMap::new(),
            stats: Arc::new(LockStatsCollector::default()),
        }
    }

    pub fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Point-in-time statistics for this service.
    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    /// Try to acquire the lock named `key` without waiting.
    ///
    /// Exactly one transaction submission. "Held by another owner" comes
    /// back as [`LockError::NotAcquired`] carrying the holder's stored
    /// value, distinct from transport failures; waiting and backoff are
    /// caller-level policies layered on top of this call.
    pub async fn try_acquire(&self, key: &str) -> Result<LockHandle> {
        self.options.validate()?;

        let local_permit = if self.options.serialize_local {
            let gate = self.local_gates.entry(key.to_string()).or_default().clone();
            match gate.try_lock_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    // A caller in this process already holds or is acquiring
                    // this key; skip the wasted lease grant.
                    debug!(key, "refused locally: key busy in this process");
                    self.record_contention();
                    return Err(LockError::NotAcquired { holder: None });
                }
            }
        } else {
            None
        };

        let state = Arc::new(StateCell::new(HandleState::Unacquired));
        state.store(HandleState::Acquiring);

        let lease = match self.options.ttl_secs {
            Some(ttl) => match self.leases.grant(ttl).await {
                Ok(lease) => Some(lease),
                Err(e) => {
                    state.store(HandleState::Failed);
                    return Err(e);
                }
            },
            None => None,
        };

        let attempt = match self
            .acquirer
            .attempt(key, &self.options.value, lease)
            .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                state.store(HandleState::Failed);
                if let Some(lease) = lease {
                    self.leases.revoke(lease).await;
                }
                return Err(e);
            }
        };

        if !attempt.acquired {
            state.store(HandleState::Failed);
            // The lease was granted for this attempt alone; reclaim it now
            // rather than letting it run out its TTL.
            if let Some(lease) = lease {
                self.leases.revoke(lease).await;
            }
            self.record_contention();
            return Err(LockError::NotAcquired {
                holder: attempt.current_value,
            });
        }

        state.store(HandleState::Held);
        self.stats.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        counter!("holdfast_lock_acquisitions_total").increment(1);

        let mut handle = LockHandle::new(
            key.to_string(),
            lease,
            self.coordination.clone(),
            self.leases.clone(),
            state,
            self.stats.clone(),
            local_permit,
        );

        match lease {
            Some(lease_id) if self.options.keep_alive => {
                match self.leases.keep_alive(lease_id).await {
                    Ok(renewals) => handle.start_keep_alive(renewals),
                    Err(e) => {
                        // Held-but-unrenewable is not a state we hand out:
                        // give the lock back and surface the failure.
                        warn!(key, error = %e, "keep-alive setup failed; releasing");
                        handle.release().await;
                        return Err(e);
                    }
                }
            }
            None if self.options.keep_alive => {
                debug!(key, "keep_alive ignored: no lease ttl configured");
            }
            _ => {}
        }

        debug!(key, ?lease, "lock acquired");
        Ok(handle)
    }

    /// Run `body` under the lock named `key`.
    ///
    /// The body never runs unless the lock is acquired
    /// ([`LockError::NotAcquired`] otherwise), and release runs on every
    /// exit path, including a body error or panic. When renewal
    /// fails mid-run the result is [`LockError::Lost`] regardless of the
    /// body's own outcome, so "my work failed" and "I lost exclusivity"
    /// stay distinguishable; a suppressed body failure is logged.
    ///
    /// No cancellation signal is threaded into the body. A long-running
    /// section that must abort early on ownership loss should use
    /// [`try_acquire`](Self::try_acquire) and poll
    /// [`LockHandle::is_lost`] itself.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut handle = self.try_acquire(key).await?;

        // Only the body sits inside the panic boundary; lock management
        // errors use ordinary results.
        let outcome = AssertUnwindSafe(body()).catch_unwind().await;

        let lost = handle.is_lost();
        handle.release().await;

        if lost {
            match &outcome {
                Ok(Err(e)) => warn!(key, error = %e, "critical section failed after lock was lost"),
                Err(_) => warn!(key, "critical section panicked after lock was lost"),
                Ok(Ok(_)) => {}
            }
            return Err(LockError::Lost);
        }

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(LockError::Body(e)),
            Err(panic) => Err(LockError::BodyPanic(panic_message(panic))),
        }
    }

    fn record_contention(&self) {
        self.stats
            .failed_acquisitions
            .fetch_add(1, Ordering::Relaxed);
        counter!("holdfast_lock_contentions_total").increment(1);
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordination;

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "boom");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_with_lock_happy_path() {
        let service = LockService::new(Arc::new(MemoryCoordination::new()));

        let value = service
            .with_lock("/lock/happy", || async { Ok(21 * 2) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let stats = service.stats();
        assert_eq!(stats.total_acquisitions, 1);
        assert_eq!(stats.total_releases, 1);
    }

    #[tokio::test]
    async fn test_with_lock_body_error_is_distinct() {
        let service = LockService::new(Arc::new(MemoryCoordination::new()));

        let result: Result<()> = service
            .with_lock("/lock/err", || async { Err(anyhow::anyhow!("task failed")) })
            .await;
        assert!(matches!(result, Err(LockError::Body(_))));

        // The body's failure did not skip release.
        let mut handle = service.try_acquire("/lock/err").await.unwrap();
        handle.release().await;
    }
}
