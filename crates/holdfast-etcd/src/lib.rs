//! etcd backend for holdfast
//!
//! Adapts a live [`etcd_client::Client`] to the [`Coordination`] seam.
//! Establishing the connection (endpoint discovery, authentication, dial
//! timeouts) stays with the caller; this crate only consumes the handle:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! let client = etcd_client::Client::connect(["127.0.0.1:2379"], None).await?;
//! let locks = holdfast::LockService::new(Arc::new(
//!     holdfast_etcd::EtcdCoordination::from_client(client),
//! ));
//!
//! locks
//!     .with_lock("/app/lock/migrations", || async {
//!         // runs on at most one process at a time
//!         Ok(())
//!     })
//!     .await?;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp, TxnOpResponse};
use holdfast::coordination::{Coordination, RenewalStream};
use holdfast::error::CoordinationError;
use holdfast::lease::renewal_interval;
use holdfast::model::{LeaseId, LockAttempt, RenewalAck};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RENEWAL_CHANNEL_CAPACITY: usize = 8;

/// [`Coordination`] implementation backed by an etcd cluster.
///
/// etcd clients are cheap to clone; one `EtcdCoordination` may be shared
/// across many concurrent lock attempts on different keys.
#[derive(Clone)]
pub struct EtcdCoordination {
    client: Client,
}

impl EtcdCoordination {
    /// Wrap an already-connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_err(e: etcd_client::Error) -> CoordinationError {
    CoordinationError::Transport(e.to_string())
}

#[async_trait]
impl Coordination for EtcdCoordination {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, CoordinationError> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await.map_err(map_err)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<RenewalStream, CoordinationError> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) =
            client.lease_keep_alive(lease).await.map_err(map_err)?;
        let (tx, rx) = mpsc::channel(RENEWAL_CHANNEL_CAPACITY);

        // Drive the renewal exchange: one request, one ack, then wait a
        // third of the returned TTL before the next round. Dropping tx is
        // how every exit ends the stream for the consumer.
        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    debug!(lease, "renewal stopped: consumer dropped");
                    break;
                }
                if let Err(e) = keeper.keep_alive().await {
                    warn!(lease, error = %e, "keep-alive request failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        match tx.try_send(RenewalAck {
                            ttl_secs: resp.ttl(),
                        }) {
                            // A full buffer just drops the ack; the renewal
                            // itself already happened server-side.
                            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                        tokio::time::sleep(renewal_interval(resp.ttl())).await;
                    }
                    Ok(Some(_)) => {
                        // TTL of zero or less: the lease no longer exists.
                        warn!(lease, "lease expired or revoked server-side");
                        break;
                    }
                    Ok(None) => {
                        warn!(lease, "keep-alive stream closed by server");
                        break;
                    }
                    Err(e) => {
                        warn!(lease, error = %e, "keep-alive stream error");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(map_err)?;
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<LockAttempt, CoordinationError> {
        let put_options = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_options)])
            .or_else(vec![TxnOp::get(key, None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(map_err)?;
        let acquired = resp.succeeded();

        let mut current_value = None;
        if !acquired {
            // The else-branch read: the current holder's stored value.
            for op in resp.op_responses() {
                if let TxnOpResponse::Get(get) = op {
                    current_value = get.kvs().first().map(|kv| kv.value().to_vec());
                }
            }
        }

        Ok(LockAttempt {
            acquired,
            current_value,
        })
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(map_err)?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn delete_key(&self, key: &str) -> Result<(), CoordinationError> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(map_err)?;
        Ok(())
    }
}
