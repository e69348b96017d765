//! Single-submission lock acquisition

use std::sync::Arc;

use tracing::debug;

use crate::coordination::Coordination;
use crate::error::Result;
use crate::model::{LeaseId, LockAttempt};

/// Submits the atomic create-if-absent transaction that decides the single
/// winner among concurrent contenders.
pub struct LockAcquirer {
    coordination: Arc<dyn Coordination>,
}

impl LockAcquirer {
    pub fn new(coordination: Arc<dyn Coordination>) -> Self {
        Self { coordination }
    }

    /// Submit one acquisition transaction for `key`.
    ///
    /// The transaction succeeds only when the key does not exist (its
    /// create revision is zero); the put binds the key to `lease` when
    /// given, so the key disappears with the lease. Exactly one submission:
    /// polling until the key frees up is a caller-level policy, not part of
    /// this primitive. Transport and service failures surface as errors,
    /// distinct from "held by another owner".
    pub async fn attempt(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<LockAttempt> {
        let attempt = self.coordination.create_if_absent(key, value, lease).await?;
        if attempt.acquired {
            debug!(key, ?lease, "acquisition transaction succeeded");
        } else {
            debug!(key, "acquisition transaction lost: key already exists");
        }
        Ok(attempt)
    }
}
