//! Last-known runtime facts per VM and per VPC.
//!
//! Nothing here is authoritative. Lifecycle operations always re-query the
//! process manager before acting; the cache only spares the reconcile tick
//! from asking again for VMs that need no work. Every mutating operation
//! invalidates the facts it may have changed.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use meshvisor_id::{DiskId, VmId, VpcId};
use meshvisor_networking::VpcGateway;

use crate::model::VmState;

/// Cached facts about one VM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmFacts {
    pub state: Option<VmState>,
    /// Disks the store records as attached to the VM.
    pub disks: Option<Vec<DiskId>>,
}

impl VmFacts {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Cached facts about one VPC's overlay namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VpcFacts {
    pub gateway: Option<VpcGateway>,
    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,
}

/// Shared cache handed to every component that mutates host state.
#[derive(Debug, Default)]
pub struct ResourceCache {
    vms: Mutex<HashMap<VmId, VmFacts>>,
    vpcs: Mutex<HashMap<VpcId, VpcFacts>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm(&self, id: &VmId) -> Option<VmFacts> {
        guard(&self.vms).get(id).cloned()
    }

    pub fn vm_disks(&self, id: &VmId) -> Option<Vec<DiskId>> {
        guard(&self.vms).get(id).and_then(|f| f.disks.clone())
    }

    pub fn vm_state(&self, id: &VmId) -> Option<VmState> {
        guard(&self.vms).get(id).and_then(|f| f.state)
    }

    pub fn set_vm_state(&self, id: VmId, state: VmState) {
        guard(&self.vms).entry(id).or_default().state = Some(state);
    }

    pub fn set_vm_disks(&self, id: VmId, disks: Vec<DiskId>) {
        guard(&self.vms).entry(id).or_default().disks = Some(disks);
    }

    /// Drop the cached process state.
    pub fn rem_virt(&self, id: &VmId) {
        self.update_vm(id, |f| f.state = None);
    }

    pub fn rem_disks(&self, id: &VmId) {
        self.update_vm(id, |f| f.disks = None);
    }

    /// Drop every fact about a VM.
    pub fn invalidate_vm(&self, id: &VmId) {
        guard(&self.vms).remove(id);
    }

    fn update_vm(&self, id: &VmId, f: impl FnOnce(&mut VmFacts)) {
        let mut vms = guard(&self.vms);
        if let Some(facts) = vms.get_mut(id) {
            f(facts);
            if facts.is_empty() {
                vms.remove(id);
            }
        }
    }

    pub fn vpc(&self, id: &VpcId) -> Option<VpcFacts> {
        guard(&self.vpcs).get(id).cloned()
    }

    pub fn set_vpc(&self, id: VpcId, facts: VpcFacts) {
        guard(&self.vpcs).insert(id, facts);
    }

    pub fn invalidate_vpc(&self, id: &VpcId) {
        guard(&self.vpcs).remove(id);
    }
}
