//! Reconciliation loop primitives.
//!
//! A node agent converges live host state toward a desired state on every
//! tick. Passes may overlap, may be abandoned half way, and are always
//! retried on the next tick. This crate holds the pieces those passes share:
//!
//! - [`LeasedLock`]: expiring, token-checked mutual exclusion per resource key
//! - [`ContentHash`]: deterministic change detection over canonical JSON
//! - [`AppliedHashes`]: last successfully applied hash per resource
//! - [`DisconnectTracker`]: grace-period bookkeeping for flapping links
//!
//! # Invariants
//!
//! - A lease release is honored only when its token matches the holder
//! - Identical inputs always produce identical hashes
//! - An applied hash is only recorded by the caller after the apply succeeded

mod grace;
mod hash;
mod lock;

pub use grace::DisconnectTracker;
pub use hash::{AppliedHashes, ContentHash};
pub use lock::{LeaseToken, LeasedLock, OwnedLease};

use std::time::Duration;

/// Default expiry for a leased lock held by a convergence pass.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
