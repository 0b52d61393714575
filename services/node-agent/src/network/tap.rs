//! TAP devices for VM network adapters.
//!
//! Each adapter gets a TAP device the hypervisor opens as its virtio-net
//! backend. The host side is enslaved to the VPC bridge so guests reach the
//! namespace gateway.

use async_trait::async_trait;
use meshvisor_id::VmId;
use meshvisor_networking::vpc_bridge;
use tracing::{debug, info};

use super::host::{ensure_bridge, ignore_missing};
use super::VmNetwork;
use crate::command::run_ip;
use crate::error::Result;
use crate::model::VirtualMachine;

/// Default MTU for guest-facing devices.
pub const DEFAULT_MTU: u32 = 1420;

/// TAP device name for a VM adapter.
///
/// Names are limited to 15 chars (IFNAMSIZ - 1).
pub fn tap_name(vm: &VmId, index: usize) -> String {
    let ulid = vm.ulid().to_string();
    format!("tap-{}{}", &ulid[ulid.len() - 8..], index % 10)
}

/// VM networking on Linux TAP devices.
#[derive(Debug, Clone)]
pub struct TapNetwork {
    mtu: u32,
}

impl Default for TapNetwork {
    fn default() -> Self {
        Self { mtu: DEFAULT_MTU }
    }
}

impl TapNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set custom MTU.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }
}

#[async_trait]
impl VmNetwork for TapNetwork {
    async fn configure(&self, vm: &VirtualMachine) -> Result<()> {
        for (index, adapter) in vm.adapters.iter().enumerate() {
            let tap = tap_name(&vm.id, index);
            let bridge = vpc_bridge(&adapter.vpc_id);

            info!(
                vm_id = %vm.id,
                tap = %tap,
                bridge = %bridge,
                mtu = self.mtu,
                "Configuring TAP device"
            );

            if let Err(e) = run_ip(&["tuntap", "add", "dev", &tap, "mode", "tap"]).await {
                if !e.is_exists() {
                    return Err(e.into());
                }
                debug!(tap = %tap, "TAP device already exists");
            }

            ensure_bridge(&bridge).await?;
            run_ip(&["link", "set", "dev", &tap, "mtu", &self.mtu.to_string()]).await?;
            run_ip(&["link", "set", "dev", &tap, "master", &bridge]).await?;
            run_ip(&["link", "set", "dev", &tap, "up"]).await?;
        }
        Ok(())
    }

    async fn clear(&self, vm: &VirtualMachine) -> Result<()> {
        for index in 0..vm.adapters.len() {
            let tap = tap_name(&vm.id, index);
            debug!(vm_id = %vm.id, tap = %tap, "Deleting TAP device");
            ignore_missing(run_ip(&["link", "delete", &tap]).await)?;
        }
        Ok(())
    }
}
