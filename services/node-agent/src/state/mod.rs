//! Access to the cluster document store.
//!
//! Lifecycle and overlay code depend only on the [`DocumentStore`] trait.
//! [`SqliteStore`] is the node-local implementation used by the agent binary
//! and by tests.

mod store;

use std::time::Duration;

use async_trait::async_trait;
use meshvisor_id::{DiskId, NodeId, VmId, VpcId};
use thiserror::Error;

use crate::model::{Disk, VirtualMachine, VmState, Vpc};

pub use store::SqliteStore;

/// Errors from document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(e.to_string())
    }
}

/// Document store operations the agent relies on.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_vm(&self, id: &VmId) -> Result<VirtualMachine, StoreError>;

    /// VMs scheduled on `node`.
    async fn list_node_vms(&self, node: &NodeId) -> Result<Vec<VirtualMachine>, StoreError>;

    /// Field-level update of a VM's state. Other fields are left untouched.
    async fn commit_vm_state(&self, id: &VmId, state: VmState) -> Result<(), StoreError>;

    async fn get_disk(&self, id: &DiskId) -> Result<Disk, StoreError>;

    async fn delete_disk(&self, id: &DiskId) -> Result<(), StoreError>;

    /// Clear the disk's attachment without deleting it.
    async fn detach_disk(&self, id: &DiskId) -> Result<(), StoreError>;

    async fn list_vpcs(&self) -> Result<Vec<Vpc>, StoreError>;

    /// Renew or take the link lease for `vpc` on behalf of `node`.
    ///
    /// Conditional on the lease being unheld, held by `node`, or older than
    /// `timeout`. Returns whether `node` holds the lease afterwards.
    async fn ping_link(&self, vpc: &VpcId, node: &NodeId, timeout: Duration)
        -> Result<bool, StoreError>;
}
