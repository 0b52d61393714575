//! Reconciliation loop for converging node state.
//!
//! The reconciler:
//! - Periodically applies each local VM's desired action
//! - Periodically hands the VPC list to the overlay reconciler

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meshvisor_id::{NodeId, VmId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Result;
use crate::model::{VirtualMachine, VmAction, VmState};
use crate::network::OverlayReconciler;
use crate::state::DocumentStore;
use crate::vm::VmController;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between VM passes.
    pub vm_interval: Duration,

    /// Interval between overlay passes.
    pub overlay_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            vm_interval: Duration::from_secs(5),
            overlay_interval: Duration::from_secs(10),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vm_interval: config.sync_interval,
            overlay_interval: config.sync_interval,
        }
    }
}

/// Drives lifecycle and overlay convergence on a timer.
pub struct Reconciler {
    node_id: NodeId,
    store: Arc<dyn DocumentStore>,
    vms: Arc<VmController>,
    overlay: Arc<OverlayReconciler>,
    /// VMs with an operation in progress.
    in_flight: Arc<Mutex<HashSet<VmId>>>,
    tasks: Mutex<JoinSet<()>>,
    config: ReconcilerConfig,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Reconciler {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn DocumentStore>,
        vms: Arc<VmController>,
        overlay: Arc<OverlayReconciler>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            node_id,
            store,
            vms,
            overlay,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: Mutex::new(JoinSet::new()),
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            vm_interval_secs = self.config.vm_interval.as_secs(),
            overlay_interval_secs = self.config.overlay_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut vm_interval = tokio::time::interval(self.config.vm_interval);
        let mut overlay_interval = tokio::time::interval(self.config.overlay_interval);

        loop {
            tokio::select! {
                _ = vm_interval.tick() => {
                    if let Err(e) = self.reconcile_vms().await {
                        error!(error = %e, "VM reconciliation failed");
                    }
                }
                _ = overlay_interval.tick() => {
                    if let Err(e) = self.reconcile_overlay().await {
                        error!(error = %e, "Overlay reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch the desired action of every local VM not already busy.
    ///
    /// Returns how many operations were dispatched.
    pub async fn reconcile_vms(&self) -> Result<usize> {
        self.reap();

        let vms = self.store.list_node_vms(&self.node_id).await?;
        let mut dispatched = 0;

        for vm in vms {
            if vm.action == VmAction::Destroy && vm.state == VmState::Destroyed {
                continue;
            }
            if !guard(&self.in_flight).insert(vm.id) {
                debug!(vm_id = %vm.id, "Operation already in progress");
                continue;
            }

            dispatched += 1;
            let controller = Arc::clone(&self.vms);
            let claim = InFlight {
                set: Arc::clone(&self.in_flight),
                vm: vm.id,
            };
            guard(&self.tasks).spawn(async move {
                let _claim = claim;
                if let Err(e) = apply_action(&controller, &vm).await {
                    error!(
                        vm_id = %vm.id,
                        action = ?vm.action,
                        error = %e,
                        "Virtual machine operation failed"
                    );
                }
            });
        }

        Ok(dispatched)
    }

    /// Run one overlay pass over every VPC.
    pub async fn reconcile_overlay(&self) -> Result<()> {
        let vpcs = self.store.list_vpcs().await?;
        let dispatched = self.overlay.sync_states(&vpcs).await?;
        debug!(vpcs = vpcs.len(), dispatched = dispatched.len(), "Overlay pass dispatched");
        Ok(())
    }

    /// Wait for every dispatched VM operation to finish.
    pub async fn wait_idle(&self) {
        let mut tasks = std::mem::take(&mut *guard(&self.tasks));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Virtual machine task panicked");
            }
        }
    }

    fn reap(&self) {
        let mut tasks = guard(&self.tasks);
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Virtual machine task panicked");
            }
        }
    }
}

/// Claim on a VM's in-flight slot, released when the task ends or unwinds.
struct InFlight {
    set: Arc<Mutex<HashSet<VmId>>>,
    vm: VmId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        guard(&self.set).remove(&self.vm);
    }
}

/// Move one VM towards its desired action.
async fn apply_action(controller: &VmController, vm: &VirtualMachine) -> Result<()> {
    let previous = controller.cached_state(&vm.id);
    let current = controller.state(&vm.id).await?;
    let exited = previous == Some(VmState::Running) && current.is_terminal();

    match vm.action {
        VmAction::Start => {
            if current == VmState::Running {
                return Ok(());
            }
            if exited || current == VmState::Failed {
                controller.cleanup(vm).await;
            }
            controller.power_on(vm).await
        }
        VmAction::Stop => {
            if current == VmState::Running {
                controller.power_off(vm).await
            } else {
                if exited {
                    controller.cleanup(vm).await;
                }
                Ok(())
            }
        }
        VmAction::Destroy => controller.destroy(vm).await,
    }
}
