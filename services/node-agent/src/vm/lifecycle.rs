//! VM process lifecycle.
//!
//! [`VmController`] drives one VM's hypervisor process through start, graceful
//! stop, forced stop and destroy. Operations on different VMs may run
//! concurrently; callers serialize operations on the same VM.
//!
//! Graceful stop escalates in a fixed order: a shutdown request over the
//! monitor (retried briefly), then polling for up to the stop timeout while
//! re-sending shutdown requests periodically, then a forced stop through the
//! process manager.

use std::sync::Arc;
use std::time::Duration;

use meshvisor_id::{DiskId, VmId};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::unit::{render_unit, write_firmware_vars, UnitTemplate};
use crate::cache::ResourceCache;
use crate::config::{Config, TimingConfig};
use crate::error::{AgentError, Result};
use crate::model::{VirtualMachine, VmState};
use crate::network::VmNetwork;
use crate::paths::{remove_path, write_file, NodePaths};
use crate::runtime::{ControlChannel, ControlClient, GuestBootstrap, UnitManager};
use crate::shutdown::Interrupt;
use crate::state::DocumentStore;

/// Lifecycle timeouts and host binaries.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub timing: TimingConfig,
    pub template: UnitTemplate,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            start_timeout: config.start_timeout,
            stop_timeout: config.stop_timeout,
            timing: config.timing.clone(),
            template: UnitTemplate::from_config(config),
        }
    }
}

/// Collaborators of the lifecycle controller.
#[derive(Clone)]
pub struct VmDeps {
    pub store: Arc<dyn DocumentStore>,
    pub units: Arc<dyn UnitManager>,
    pub control: Arc<dyn ControlClient>,
    pub bootstrap: Arc<dyn GuestBootstrap>,
    pub network: Arc<dyn VmNetwork>,
    pub cache: Arc<ResourceCache>,
}

/// Drives VM processes on this node.
pub struct VmController {
    settings: LifecycleSettings,
    paths: NodePaths,
    deps: VmDeps,
    interrupt: Interrupt,
}

impl VmController {
    pub fn new(
        settings: LifecycleSettings,
        paths: NodePaths,
        deps: VmDeps,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            settings,
            paths,
            deps,
            interrupt,
        }
    }

    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Query the process manager and refresh the cached state.
    pub async fn state(&self, vm: &VmId) -> Result<VmState> {
        let unit = self.paths.unit_name(vm);
        let state = self.deps.units.state(&unit).await?.vm_state();
        self.deps.cache.set_vm_state(*vm, state);
        Ok(state)
    }

    /// Disks currently attached to the VM, cached until the next mutation.
    pub async fn attached_disks(&self, vm: &VirtualMachine) -> Result<Vec<DiskId>> {
        if let Some(disks) = self.deps.cache.vm_disks(&vm.id) {
            return Ok(disks);
        }

        let mut disks = Vec::with_capacity(vm.disks.len());
        for attachment in &vm.disks {
            match self.deps.store.get_disk(&attachment.id).await {
                Ok(disk) if disk.instance == Some(vm.id) => disks.push(disk.id),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.deps.cache.set_vm_disks(vm.id, disks.clone());
        Ok(disks)
    }

    /// Last observed state, if any.
    pub fn cached_state(&self, vm: &VmId) -> Option<VmState> {
        self.deps.cache.vm_state(vm)
    }

    /// Start the VM's process and attach its networking.
    pub async fn power_on(&self, vm: &VirtualMachine) -> Result<()> {
        if self.interrupt.is_raised() {
            return Ok(());
        }

        if self.state(&vm.id).await? == VmState::Running {
            debug!(vm_id = %vm.id, "Virtual machine already running");
            self.invalidate_runtime(&vm.id);
            return Ok(());
        }

        info!(vm_id = %vm.id, "Starting virtual machine");

        let vm_dir = self.paths.vm_dir(&vm.id);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|e| AgentError::io(&vm_dir, e))?;

        self.deps.bootstrap.write(vm).await?;
        if vm.uefi {
            write_firmware_vars(vm, &self.settings.template, &self.paths).await?;
        }
        self.write_unit(vm).await?;

        self.deps.units.start(&self.paths.unit_name(&vm.id)).await?;
        self.wait_running(vm).await?;

        if let (true, Some(password)) = (vm.has_vnc(), vm.vnc_password.as_deref()) {
            if let Err(e) = self.deps.control.set_console_password(&vm.id, password).await {
                warn!(vm_id = %vm.id, error = %e, "Failed to set console password");
            }
        }

        let network = self.deps.network.configure(vm).await;
        self.invalidate_runtime(&vm.id);
        if let Err(e) = network {
            error!(vm_id = %vm.id, error = %e, "Failed to configure virtual machine network");
            return Err(e);
        }
        Ok(())
    }

    /// Gracefully stop the VM, escalating to a forced stop.
    pub async fn power_off(&self, vm: &VirtualMachine) -> Result<()> {
        if self.interrupt.is_raised() {
            return Ok(());
        }

        info!(vm_id = %vm.id, "Stopping virtual machine");

        self.stop_gracefully(vm).await?;
        self.deps.network.clear(vm).await?;
        sleep(self.settings.timing.settle_delay).await;

        self.invalidate_runtime(&vm.id);
        Ok(())
    }

    /// Stop the VM without waiting for the guest.
    ///
    /// A shutdown request is still fired off, and the dwell before the forced
    /// stop is longer when a cause is given.
    pub async fn force_power_off(
        &self,
        vm: &VirtualMachine,
        cause: Option<&AgentError>,
    ) -> Result<()> {
        if self.interrupt.is_raised() {
            return Ok(());
        }

        let dwell = match cause {
            Some(cause) => {
                error!(vm_id = %vm.id, error = %cause, "Force power off virtual machine");
                self.settings.timing.force_dwell_with_cause
            }
            None => {
                warn!(vm_id = %vm.id, "Force power off virtual machine");
                self.settings.timing.force_dwell
            }
        };

        self.nudge(vm.id);
        sleep(dwell).await;

        self.deps.units.stop(&self.paths.unit_name(&vm.id)).await?;
        self.deps.network.clear(vm).await?;
        sleep(self.settings.timing.settle_delay).await;

        self.invalidate_runtime(&vm.id);
        Ok(())
    }

    /// Stop the VM if needed and remove every trace of it from this node.
    ///
    /// Safe to repeat: missing units, disks and files are skipped.
    pub async fn destroy(&self, vm: &VirtualMachine) -> Result<()> {
        if self.interrupt.is_raised() {
            return Ok(());
        }

        info!(vm_id = %vm.id, "Destroying virtual machine");

        let unit_path = self.paths.unit_path(&vm.id);
        let unit_exists = tokio::fs::try_exists(&unit_path)
            .await
            .map_err(|e| AgentError::io(&unit_path, e))?;

        if unit_exists {
            if self.state(&vm.id).await? == VmState::Running {
                self.stop_gracefully(vm).await?;
            }
            self.deps.units.stop(&self.paths.unit_name(&vm.id)).await?;
            sleep(self.settings.timing.settle_delay).await;
        }

        self.deps.network.clear(vm).await?;
        self.release_disks(vm).await?;

        for path in self.paths.vm_artifacts(&vm.id) {
            remove_path(&path).await?;
        }

        self.commit_state(&vm.id, VmState::Destroyed).await?;
        self.deps.cache.invalidate_vm(&vm.id);
        Ok(())
    }

    /// Clean up after a process that exited on its own.
    pub async fn cleanup(&self, vm: &VirtualMachine) {
        info!(vm_id = %vm.id, "Cleaning up stopped virtual machine");
        if let Err(e) = self.deps.network.clear(vm).await {
            error!(vm_id = %vm.id, error = %e, "Failed to clear virtual machine network");
        }
        sleep(self.settings.timing.settle_delay).await;
        self.invalidate_runtime(&vm.id);
    }

    /// Shutdown request, wait, and forced stop if the guest did not comply.
    async fn stop_gracefully(&self, vm: &VirtualMachine) -> Result<()> {
        let stopped = if self.send_shutdown(&vm.id).await {
            self.wait_stopped(&vm.id).await?
        } else {
            false
        };

        if !stopped {
            warn!(vm_id = %vm.id, "Force power off virtual machine");
            self.deps.units.stop(&self.paths.unit_name(&vm.id)).await?;
        }
        Ok(())
    }

    /// Deliver a monitor shutdown request. Returns whether it was accepted.
    async fn send_shutdown(&self, vm: &VmId) -> bool {
        let timing = &self.settings.timing;
        let mut last_error = None;

        for attempt in 0..timing.shutdown_attempts {
            if attempt > 0 {
                sleep(timing.shutdown_backoff).await;
            }
            match self.deps.control.shutdown(vm, ControlChannel::Monitor).await {
                Ok(()) => return true,
                Err(e) => {
                    if attempt == 0 {
                        warn!(vm_id = %vm, error = %e, "Failed to send shutdown");
                    }
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            error!(vm_id = %vm, error = %e, "Power off virtual machine error");
        }
        false
    }

    /// Poll until the process exits or the stop timeout elapses.
    ///
    /// Persists the observed terminal state. Returns whether the VM stopped.
    async fn wait_stopped(&self, vm: &VmId) -> Result<bool> {
        let timing = &self.settings.timing;
        let poll_ms = timing.poll_interval.as_millis().max(1);
        let ticks = self.settings.stop_timeout.as_millis().div_ceil(poll_ms);
        let nudge_every = u128::from(timing.nudge_every.max(1));

        for tick in 0..ticks {
            let state = self.state(vm).await?;
            if state.is_terminal() {
                self.commit_state(vm, state).await?;
                return Ok(true);
            }

            sleep(timing.poll_interval).await;

            if (tick + 1) % nudge_every == 0 {
                self.nudge(*vm);
            }
        }
        Ok(false)
    }

    /// Poll until the process reports running.
    async fn wait_running(&self, vm: &VirtualMachine) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.state(&vm.id).await? {
                VmState::Running => {
                    self.commit_state(&vm.id, VmState::Running).await?;
                    return Ok(());
                }
                VmState::Failed => {
                    return Err(AgentError::Fatal(format!(
                        "virtual machine {} failed during start",
                        vm.id
                    )));
                }
                _ => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.settings.start_timeout {
                return Err(AgentError::Timeout {
                    what: format!("virtual machine {} to start", vm.id),
                    elapsed,
                });
            }
            sleep(self.settings.timing.poll_interval).await;
        }
    }

    /// Fire-and-forget shutdown on both channels.
    fn nudge(&self, vm: VmId) {
        let control = Arc::clone(&self.deps.control);
        tokio::spawn(async move {
            for channel in [ControlChannel::Monitor, ControlChannel::Guest] {
                if let Err(e) = control.shutdown(&vm, channel).await {
                    debug!(vm_id = %vm, %channel, error = %e, "Shutdown nudge failed");
                }
            }
        });
    }

    async fn commit_state(&self, vm: &VmId, state: VmState) -> Result<()> {
        match self.deps.store.commit_vm_state(vm, state).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(vm_id = %vm, "Virtual machine document gone, state not committed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_unit(&self, vm: &VirtualMachine) -> Result<()> {
        let unit = render_unit(vm, &self.settings.template, &self.paths);
        write_file(&self.paths.unit_path(&vm.id), unit).await?;
        self.deps.units.reload().await
    }

    /// Delete the VM's own boot disk and detach every other disk.
    async fn release_disks(&self, vm: &VirtualMachine) -> Result<()> {
        for (index, attachment) in vm.disks.iter().enumerate() {
            let disk = match self.deps.store.get_disk(&attachment.id).await {
                Ok(disk) => disk,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            let owned = index == 0 && disk.source_instance == Some(vm.id);
            let result = if owned {
                info!(vm_id = %vm.id, disk_id = %disk.id, "Deleting virtual machine disk");
                self.deps.store.delete_disk(&disk.id).await
            } else {
                debug!(vm_id = %vm.id, disk_id = %disk.id, "Detaching virtual machine disk");
                self.deps.store.detach_disk(&disk.id).await
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn invalidate_runtime(&self, vm: &VmId) {
        self.deps.cache.rem_virt(vm);
        self.deps.cache.rem_disks(vm);
    }
}
