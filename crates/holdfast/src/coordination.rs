//! Coordination-service seam
//!
//! The lock core talks to the replicated, linearizable key-value service
//! through this trait: lease grant/revoke, a keep-alive renewal stream, the
//! atomic create-if-absent transaction, and plain key reads and deletes.
//! Establishing the underlying connection (endpoints, authentication, dial
//! timeouts) is the caller's concern; implementations adapt an
//! already-connected client handle.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoordinationError;
use crate::model::{LeaseId, LockAttempt, RenewalAck};

/// Stream of renewal acknowledgments for one lease.
///
/// Lazy and non-restartable: each element acknowledges a successful renewal
/// round. The channel closing without an error means the lease can no
/// longer be renewed (expired, revoked, or connectivity lost).
pub type RenewalStream = mpsc::Receiver<RenewalAck>;

/// Client-side view of the coordination service.
///
/// A single implementation instance may be shared across many concurrent
/// lock attempts on different keys; nothing here requires exclusive access.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Grant a TTL-bound lease. Keys bound to the lease are removed by the
    /// service when it expires.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, CoordinationError>;

    /// Start renewing `lease` and observe each successful round.
    async fn keep_alive(&self, lease: LeaseId) -> Result<RenewalStream, CoordinationError>;

    /// Revoke `lease`, removing any keys bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Submit the atomic transaction: if `key` does not exist (its create
    /// revision is zero), put it with `value`, bound to `lease` when given;
    /// otherwise read the current holder's value. The returned
    /// [`LockAttempt::acquired`] flag is the sole acquisition signal.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<LockAttempt, CoordinationError>;

    /// Fetch the byte value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Delete `key` unconditionally. Deleting an absent key succeeds.
    async fn delete_key(&self, key: &str) -> Result<(), CoordinationError>;
}
