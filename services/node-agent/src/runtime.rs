//! Interfaces to the per-VM process machinery.
//!
//! - [`UnitManager`]: the host process manager running one unit per VM
//! - [`ControlClient`]: monitor and guest-agent channels of a running VM
//! - [`GuestBootstrap`]: first-boot configuration handed to the guest
//!
//! Host implementations live in `systemd`, `control` and `vm::bootstrap`;
//! [`crate::mock::MockHost`] implements all of them for tests.

use std::fmt;

use async_trait::async_trait;
use meshvisor_id::VmId;

use crate::error::Result;
use crate::model::{VirtualMachine, VmState};

/// Process-manager view of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Activating,
    Deactivating,
    Inactive,
    Failed,
}

impl UnitState {
    /// Parse `systemctl is-active` output.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "active" | "reloading" | "refreshing" => Self::Active,
            "activating" => Self::Activating,
            "deactivating" => Self::Deactivating,
            "failed" => Self::Failed,
            _ => Self::Inactive,
        }
    }

    pub fn vm_state(self) -> VmState {
        match self {
            Self::Active => VmState::Running,
            Self::Activating => VmState::Starting,
            Self::Deactivating => VmState::Stopping,
            Self::Inactive => VmState::Stopped,
            Self::Failed => VmState::Failed,
        }
    }
}

/// Channel a shutdown request is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChannel {
    /// Hypervisor monitor: ACPI power button.
    Monitor,
    /// In-guest agent.
    Guest,
}

impl fmt::Display for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitor => f.write_str("monitor"),
            Self::Guest => f.write_str("guest"),
        }
    }
}

/// Host process manager.
#[async_trait]
pub trait UnitManager: Send + Sync {
    async fn start(&self, unit: &str) -> Result<()>;

    /// Stop a unit. Stopping an unknown or inactive unit succeeds.
    async fn stop(&self, unit: &str) -> Result<()>;

    /// Re-read unit definitions after files changed.
    async fn reload(&self) -> Result<()>;

    async fn state(&self, unit: &str) -> Result<UnitState>;
}

/// Control channels of a running VM.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Ask the guest to shut down.
    async fn shutdown(&self, vm: &VmId, channel: ControlChannel) -> Result<()>;

    async fn set_console_password(&self, vm: &VmId, password: &str) -> Result<()>;
}

/// Writes guest first-boot data before a start.
#[async_trait]
pub trait GuestBootstrap: Send + Sync {
    async fn write(&self, vm: &VirtualMachine) -> Result<()>;
}
