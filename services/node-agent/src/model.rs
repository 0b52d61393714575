//! Documents the agent reads from the cluster store.

use std::fmt;

use chrono::{DateTime, Utc};
use meshvisor_id::{DiskId, NodeId, SubnetId, VmId, VpcId};
use serde::{Deserialize, Serialize};

/// Observed or persisted state of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Destroyed,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "failed" => Some(Self::Failed),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }

    /// A process in this state is no longer running.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Destroyed)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the control plane wants done with a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmAction {
    #[default]
    Start,
    Stop,
    Destroy,
}

/// Disk attached to a VM, in boot order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub id: DiskId,
}

/// A VM's network adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAdapter {
    pub vpc_id: VpcId,
    pub subnet_id: SubnetId,
    pub mac: String,
}

/// Virtual machine document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: VmId,
    pub node_id: NodeId,
    pub name: String,
    pub state: VmState,
    #[serde(default)]
    pub action: VmAction,
    pub memory_mb: u32,
    pub processors: u32,
    #[serde(default)]
    pub disks: Vec<DiskAttachment>,
    #[serde(default)]
    pub adapters: Vec<NetworkAdapter>,
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub secure_boot: bool,
    #[serde(default)]
    pub hugepages: bool,
    /// Console password, set after start when present.
    #[serde(default)]
    pub vnc_password: Option<String>,
    #[serde(default)]
    pub vnc_display: Option<u16>,
}

impl VirtualMachine {
    /// Minimal document used when seeding stores.
    pub fn new(id: VmId, node_id: NodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            node_id,
            name: name.into(),
            state: VmState::Stopped,
            action: VmAction::Start,
            memory_mb: 1024,
            processors: 1,
            disks: Vec::new(),
            adapters: Vec::new(),
            uefi: false,
            secure_boot: false,
            hugepages: false,
            vnc_password: None,
            vnc_display: None,
        }
    }

    pub fn has_vnc(&self) -> bool {
        self.vnc_display.is_some()
    }
}

/// Disk document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: DiskId,
    /// VM whose creation produced this disk. Only that VM's destroy deletes it.
    pub source_instance: Option<VmId>,
    /// VM the disk is currently attached to.
    pub instance: Option<VmId>,
    pub size_gb: u32,
}

/// VPC document with its link-lease fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vpc {
    pub id: VpcId,
    pub name: String,
    /// IPv4 network in CIDR notation.
    pub network: String,
    /// Tunnel endpoint URIs to peer sites.
    #[serde(default)]
    pub link_uris: Vec<String>,
    /// Node currently holding the link lease.
    #[serde(default)]
    pub link_node: Option<NodeId>,
    /// Last renewal of the link lease.
    #[serde(default)]
    pub link_timestamp: Option<DateTime<Utc>>,
}

impl Vpc {
    pub fn new(id: VpcId, name: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            network: network.into(),
            link_uris: Vec::new(),
            link_node: None,
            link_timestamp: None,
        }
    }

    /// Whether `node` may hold this VPC's links at `now`.
    ///
    /// True when the node already holds the lease, or when the lease is
    /// unset or older than `timeout`.
    pub fn link_claimable(
        &self,
        node: &NodeId,
        now: DateTime<Utc>,
        timeout: std::time::Duration,
    ) -> bool {
        if self.link_node.as_ref() == Some(node) {
            return true;
        }
        match (&self.link_node, self.link_timestamp) {
            (Some(_), Some(ts)) => {
                let age = now.signed_duration_since(ts);
                age.to_std().map(|age| age >= timeout).unwrap_or(false)
            }
            _ => true,
        }
    }
}
