//! Host networking for VMs and VPC overlays.
//!
//! - [`VmNetwork`]: per-VM TAP devices attached to the VPC bridge
//! - [`NetworkHost`]: kernel objects the overlay creates and sweeps
//! - [`TunnelSubsystem`]: the IPsec daemon running inside each namespace
//! - [`AddressResolver`]: public address discovery for tunnel endpoints
//! - [`OverlayReconciler`]: converges all of the above per VPC

mod address;
mod host;
mod overlay;
mod tap;
mod tunnel;

use async_trait::async_trait;
use meshvisor_id::VpcId;
use meshvisor_networking::VpcGateway;

use crate::error::Result;
use crate::model::VirtualMachine;

pub use address::{AddressResolver, PublicAddressResolver, PublicAddresses};
pub use host::IpHost;
pub use overlay::{OverlayDeps, OverlayReconciler, OverlaySettings, PassOutcome};
pub use tap::{tap_name, TapNetwork};
pub use tunnel::{
    link_states, parse_link_uri, IpsecTunnels, LinkState, LinkUri, TunnelLink, TunnelSubsystem,
};

/// Network attachment of a single VM.
#[async_trait]
pub trait VmNetwork: Send + Sync {
    async fn configure(&self, vm: &VirtualMachine) -> Result<()>;

    /// Tear down everything `configure` created. Missing pieces are ignored.
    async fn clear(&self, vm: &VirtualMachine) -> Result<()>;
}

/// Kernel objects and processes the overlay manages.
#[async_trait]
pub trait NetworkHost: Send + Sync {
    /// Names of all host network interfaces.
    async fn interfaces(&self) -> Result<Vec<String>>;

    /// Names of all network namespaces.
    async fn namespaces(&self) -> Result<Vec<String>>;

    async fn delete_interface(&self, name: &str) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Create the VPC namespace and its virtual pair and assign the gateway.
    async fn configure_namespace(&self, vpc: &VpcId, gateway: &VpcGateway) -> Result<()>;

    /// Remove the namespace network config. The namespace itself is left for the sweep.
    async fn clear_namespace(&self, vpc: &VpcId) -> Result<()>;

    fn process_alive(&self, pid: i32) -> bool;

    /// Forcibly terminate a process.
    fn kill_process(&self, pid: i32) -> Result<()>;
}
