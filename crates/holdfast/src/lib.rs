//! Holdfast - distributed mutual exclusion over a linearizable
//! coordination service
//!
//! This crate provides:
//! - A coordination-service seam ([`Coordination`]) covering lease
//!   grant/revoke, keep-alive renewal streams, and the atomic
//!   create-if-absent transaction
//! - An in-process engine ([`MemoryCoordination`]) implementing the seam
//! - Lease lifecycle management with continuous background renewal while a
//!   lock is held
//! - Single-submission acquisition with typed contention results
//! - [`LockHandle`] with exactly-once, idempotent release
//! - [`LockService::with_lock`]: scoped critical sections with release
//!   guaranteed on every exit path, including panics
//!
//! Networked backends (e.g. the `holdfast-etcd` crate) implement
//! [`Coordination`] over an already-connected client handle.

pub mod coordination;
pub mod error;
pub mod lease;
pub mod lock;
pub mod memory;
pub mod model;
pub mod service;

pub use coordination::{Coordination, RenewalStream};
pub use error::{CoordinationError, LockError};
pub use lease::LeaseManager;
pub use lock::{HandleState, LockAcquirer, LockHandle};
pub use memory::MemoryCoordination;
pub use model::{DEFAULT_TTL_SECS, LeaseId, LockAttempt, LockOptions, LockStats, RenewalAck};
pub use service::LockService;
