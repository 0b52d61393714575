//! In-memory host for tests and development.
//!
//! [`MockHost`] implements every host-facing trait, records each call with
//! the (virtual) time it happened, and lets tests script failures.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use meshvisor_id::{VmId, VpcId};
use meshvisor_networking::{link_namespace, VpcGateway};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::model::VirtualMachine;
use crate::network::{
    AddressResolver, LinkState, NetworkHost, PublicAddresses, TunnelSubsystem, VmNetwork,
};
use crate::paths::unit_name;
use crate::runtime::{ControlChannel, ControlClient, GuestBootstrap, UnitManager, UnitState};

/// A call made against the mock host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    UnitStart(String),
    UnitStop(String),
    UnitReload,
    Shutdown(VmId, ControlChannel),
    ConsolePassword(VmId),
    Bootstrap(VmId),
    NetworkConfigure(VmId),
    NetworkClear(VmId),
    DeleteInterface(String),
    DeleteNamespace(String),
    ConfigureNamespace(VpcId),
    ClearNamespace(VpcId),
    Kill(i32),
    /// Tunnel deploy with the link names pushed.
    Deploy(VpcId, Vec<String>),
    TunnelTeardown(VpcId),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<(Instant, HostCall)>,
    units: HashMap<String, UnitState>,
    interfaces: Vec<String>,
    namespaces: Vec<String>,
    alive: HashSet<i32>,
    disconnected: HashMap<VpcId, Vec<String>>,
    /// VPCs with a tunnel daemon running in their namespace.
    daemons: HashSet<VpcId>,
    addresses: PublicAddresses,
    address_failures: u32,
    deploy_delay: Duration,
}

/// Scriptable host implementing every collaborator trait.
#[derive(Debug)]
pub struct MockHost {
    state: Mutex<MockState>,
    control_reachable: AtomicBool,
    honor_shutdown: AtomicBool,
    fail_deploy: AtomicBool,
    fail_configure_namespace: AtomicBool,
    fail_network: AtomicBool,
    panic_on_start: AtomicBool,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// A host whose guests honor shutdown requests.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            control_reachable: AtomicBool::new(true),
            honor_shutdown: AtomicBool::new(true),
            fail_deploy: AtomicBool::new(false),
            fail_configure_namespace: AtomicBool::new(false),
            fail_network: AtomicBool::new(false),
            panic_on_start: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: HostCall) {
        self.inner().calls.push((Instant::now(), call));
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.inner().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Calls with the instant each was made.
    pub fn timed_calls(&self) -> Vec<(Instant, HostCall)> {
        self.inner().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&HostCall) -> bool) -> usize {
        self.inner().calls.iter().filter(|(_, c)| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.inner().calls.clear();
    }

    pub fn set_vm_state(&self, vm: &VmId, state: UnitState) {
        self.inner().units.insert(unit_name(vm), state);
    }

    pub fn set_control_reachable(&self, reachable: bool) {
        self.control_reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether an accepted monitor shutdown stops the VM.
    pub fn set_honor_shutdown(&self, honor: bool) {
        self.honor_shutdown.store(honor, Ordering::SeqCst);
    }

    pub fn set_fail_deploy(&self, fail: bool) {
        self.fail_deploy.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_configure_namespace(&self, fail: bool) {
        self.fail_configure_namespace.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_network(&self, fail: bool) {
        self.fail_network.store(fail, Ordering::SeqCst);
    }

    /// Make unit starts panic, as a crashing operation would.
    pub fn set_panic_on_start(&self, panic: bool) {
        self.panic_on_start.store(panic, Ordering::SeqCst);
    }

    pub fn set_addresses(&self, addresses: PublicAddresses) {
        self.inner().addresses = addresses;
    }

    /// Fail the next `count` address lookups.
    pub fn fail_address_lookups(&self, count: u32) {
        self.inner().address_failures = count;
    }

    pub fn set_interfaces<I: IntoIterator<Item = String>>(&self, names: I) {
        self.inner().interfaces = names.into_iter().collect();
    }

    pub fn set_namespaces<I: IntoIterator<Item = String>>(&self, names: I) {
        self.inner().namespaces = names.into_iter().collect();
    }

    pub fn set_alive(&self, pid: i32) {
        self.inner().alive.insert(pid);
    }

    pub fn set_disconnected(&self, vpc: VpcId, names: Vec<String>) {
        self.inner().disconnected.insert(vpc, names);
    }

    /// Make every deploy take this long.
    pub fn set_deploy_delay(&self, delay: Duration) {
        self.inner().deploy_delay = delay;
    }

    pub fn set_daemon_running(&self, vpc: VpcId) {
        self.inner().daemons.insert(vpc);
    }

    pub fn daemon_running(&self, vpc: &VpcId) -> bool {
        self.inner().daemons.contains(vpc)
    }

    pub fn interfaces_now(&self) -> Vec<String> {
        self.inner().interfaces.clone()
    }

    pub fn namespaces_now(&self) -> Vec<String> {
        self.inner().namespaces.clone()
    }
}

#[async_trait]
impl UnitManager for MockHost {
    async fn start(&self, unit: &str) -> Result<()> {
        self.record(HostCall::UnitStart(unit.to_string()));
        if self.panic_on_start.load(Ordering::SeqCst) {
            panic!("unit {unit} start crashed");
        }
        self.inner().units.insert(unit.to_string(), UnitState::Active);
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.record(HostCall::UnitStop(unit.to_string()));
        self.inner().units.insert(unit.to_string(), UnitState::Inactive);
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.record(HostCall::UnitReload);
        Ok(())
    }

    async fn state(&self, unit: &str) -> Result<UnitState> {
        Ok(self
            .inner()
            .units
            .get(unit)
            .copied()
            .unwrap_or(UnitState::Inactive))
    }
}

#[async_trait]
impl ControlClient for MockHost {
    async fn shutdown(&self, vm: &VmId, channel: ControlChannel) -> Result<()> {
        self.record(HostCall::Shutdown(*vm, channel));
        if !self.control_reachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable(format!("{channel} socket for {vm}")));
        }
        if self.honor_shutdown.load(Ordering::SeqCst) {
            debug!(vm_id = %vm, "Mock guest powering down");
            self.inner().units.insert(unit_name(vm), UnitState::Inactive);
        }
        Ok(())
    }

    async fn set_console_password(&self, vm: &VmId, _password: &str) -> Result<()> {
        self.record(HostCall::ConsolePassword(*vm));
        if !self.control_reachable.load(Ordering::SeqCst) {
            return Err(AgentError::Unreachable(format!("monitor socket for {vm}")));
        }
        Ok(())
    }
}

#[async_trait]
impl GuestBootstrap for MockHost {
    async fn write(&self, vm: &VirtualMachine) -> Result<()> {
        self.record(HostCall::Bootstrap(vm.id));
        Ok(())
    }
}

#[async_trait]
impl VmNetwork for MockHost {
    async fn configure(&self, vm: &VirtualMachine) -> Result<()> {
        self.record(HostCall::NetworkConfigure(vm.id));
        if self.fail_network.load(Ordering::SeqCst) {
            return Err(AgentError::Fatal("network configure failed".to_string()));
        }
        Ok(())
    }

    async fn clear(&self, vm: &VirtualMachine) -> Result<()> {
        self.record(HostCall::NetworkClear(vm.id));
        Ok(())
    }
}

#[async_trait]
impl NetworkHost for MockHost {
    async fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.interfaces_now())
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self.namespaces_now())
    }

    async fn delete_interface(&self, name: &str) -> Result<()> {
        self.record(HostCall::DeleteInterface(name.to_string()));
        self.inner().interfaces.retain(|i| i != name);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.record(HostCall::DeleteNamespace(name.to_string()));
        self.inner().namespaces.retain(|n| n != name);
        Ok(())
    }

    async fn configure_namespace(&self, vpc: &VpcId, _gateway: &VpcGateway) -> Result<()> {
        self.record(HostCall::ConfigureNamespace(*vpc));
        if self.fail_configure_namespace.load(Ordering::SeqCst) {
            return Err(AgentError::Fatal("namespace configure failed".to_string()));
        }
        let namespace = link_namespace(vpc, 0);
        let mut state = self.inner();
        if !state.namespaces.contains(&namespace) {
            state.namespaces.push(namespace);
        }
        Ok(())
    }

    async fn clear_namespace(&self, vpc: &VpcId) -> Result<()> {
        self.record(HostCall::ClearNamespace(*vpc));
        Ok(())
    }

    /// Mirrors kill(2): non-positive pids address process groups and
    /// always appear alive.
    fn process_alive(&self, pid: i32) -> bool {
        pid <= 0 || self.inner().alive.contains(&pid)
    }

    fn kill_process(&self, pid: i32) -> Result<()> {
        self.record(HostCall::Kill(pid));
        if self.inner().alive.remove(&pid) {
            Ok(())
        } else {
            Err(AgentError::NotFound(format!("pid {pid}")))
        }
    }
}

#[async_trait]
impl TunnelSubsystem for MockHost {
    async fn deploy(&self, vpc: &VpcId, states: &[LinkState]) -> Result<()> {
        let names = states
            .iter()
            .flat_map(|s| s.links.iter().map(|l| l.name.clone()))
            .collect();
        self.record(HostCall::Deploy(*vpc, names));

        let delay = self.inner().deploy_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(AgentError::Fatal("deploy failed".to_string()));
        }
        self.inner().daemons.insert(*vpc);
        Ok(())
    }

    async fn teardown(&self, vpc: &VpcId) -> Result<()> {
        self.record(HostCall::TunnelTeardown(*vpc));
        // the daemon is only reachable through its namespace
        let mut state = self.inner();
        if state.namespaces.contains(&link_namespace(vpc, 0)) {
            state.daemons.remove(vpc);
        }
        Ok(())
    }

    async fn disconnected(&self, vpc: &VpcId, names: &[String]) -> Result<Vec<String>> {
        let down = self.inner().disconnected.get(vpc).cloned().unwrap_or_default();
        Ok(down.into_iter().filter(|n| names.contains(n)).collect())
    }
}

#[async_trait]
impl AddressResolver for MockHost {
    async fn public_addresses(&self) -> Result<PublicAddresses> {
        let mut state = self.inner();
        if state.address_failures > 0 {
            state.address_failures -= 1;
            return Err(AgentError::Unreachable("metadata service".to_string()));
        }
        Ok(state.addresses)
    }
}
