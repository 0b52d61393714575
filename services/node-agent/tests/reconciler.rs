//! Reconciliation loop tests: desired actions dispatched to the lifecycle
//! controller and VPC lists handed to the overlay reconciler.

use std::net::Ipv4Addr;
use std::sync::Arc;

use meshvisor_id::{NodeId, VmId, VpcId};
use meshvisor_node_agent::config::Config;
use meshvisor_node_agent::mock::{HostCall, MockHost};
use meshvisor_node_agent::network::PublicAddresses;
use meshvisor_node_agent::paths::NodePaths;
use meshvisor_node_agent::runtime::{ControlChannel, UnitState};
use meshvisor_node_agent::state::{DocumentStore, SqliteStore};
use meshvisor_node_agent::{
    Interrupt, LifecycleSettings, OverlayDeps, OverlayReconciler, OverlaySettings, Reconciler,
    ReconcilerConfig, ResourceCache, VirtualMachine, VmAction, VmController, VmDeps, VmState,
    Vpc,
};
use meshvisor_reconcile::{AppliedHashes, LeasedLock};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    node_id: NodeId,
    host: Arc<MockHost>,
    store: Arc<SqliteStore>,
    vms: Arc<VmController>,
    overlay: Arc<OverlayReconciler>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted(NodeId::new(), dir.path());
    let paths = NodePaths::new(&config);
    let host = Arc::new(MockHost::new());
    host.set_addresses(PublicAddresses {
        ipv4: Some(Ipv4Addr::new(198, 51, 100, 1)),
        ipv6: None,
    });
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = Arc::new(ResourceCache::new());

    let vms = Arc::new(VmController::new(
        LifecycleSettings::from_config(&config),
        paths.clone(),
        VmDeps {
            store: store.clone(),
            units: host.clone(),
            control: host.clone(),
            bootstrap: host.clone(),
            network: host.clone(),
            cache: cache.clone(),
        },
        Interrupt::new(),
    ));
    let overlay = Arc::new(OverlayReconciler::new(
        OverlaySettings::from_config(&config),
        paths,
        OverlayDeps {
            store: store.clone(),
            host: host.clone(),
            tunnels: host.clone(),
            resolver: host.clone(),
            cache,
            locks: Arc::new(LeasedLock::new(config.lock_ttl)),
            applied: Arc::new(AppliedHashes::new()),
        },
    ));
    let reconciler = Reconciler::new(
        config.node_id,
        store.clone(),
        vms.clone(),
        overlay.clone(),
        ReconcilerConfig::from_config(&config),
    );

    Harness {
        _dir: dir,
        node_id: config.node_id,
        host,
        store,
        vms,
        overlay,
        reconciler,
    }
}

impl Harness {
    fn vm(&self, action: VmAction, state: VmState) -> VirtualMachine {
        let mut vm = VirtualMachine::new(VmId::new(), self.node_id, "app");
        vm.action = action;
        vm.state = state;
        self.store.put_vm(&vm).unwrap();
        vm
    }

    fn unit(&self, vm: &VirtualMachine) -> String {
        self.vms.paths().unit_name(&vm.id)
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_action_powers_on() {
    let h = harness();
    let vm = h.vm(VmAction::Start, VmState::Stopped);

    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 1);
    h.reconciler.wait_idle().await;

    assert!(h.host.calls().contains(&HostCall::UnitStart(h.unit(&vm))));
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Running);

    // already running: nothing more to do
    h.host.clear_calls();
    h.reconciler.reconcile_vms().await.unwrap();
    h.reconciler.wait_idle().await;
    assert!(h.host.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_action_powers_off_running_vm() {
    let h = harness();
    let vm = h.vm(VmAction::Stop, VmState::Running);
    h.host.set_vm_state(&vm.id, UnitState::Active);

    h.reconciler.reconcile_vms().await.unwrap();
    h.reconciler.wait_idle().await;

    assert!(h
        .host
        .calls()
        .contains(&HostCall::Shutdown(vm.id, ControlChannel::Monitor)));
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_exited_vm_is_cleaned_up_before_restart() {
    let h = harness();
    let vm = h.vm(VmAction::Start, VmState::Running);
    h.host.set_vm_state(&vm.id, UnitState::Active);
    h.vms.state(&vm.id).await.unwrap();

    // process died on its own
    h.host.set_vm_state(&vm.id, UnitState::Inactive);
    h.reconciler.reconcile_vms().await.unwrap();
    h.reconciler.wait_idle().await;

    let calls = h.host.calls();
    let clear = calls
        .iter()
        .position(|c| *c == HostCall::NetworkClear(vm.id))
        .expect("network cleared");
    let start = calls
        .iter()
        .position(|c| *c == HostCall::UnitStart(h.unit(&vm)))
        .expect("restarted");
    assert!(clear < start);
}

#[tokio::test(start_paused = true)]
async fn test_destroyed_and_busy_vms_are_skipped() {
    let h = harness();
    h.vm(VmAction::Destroy, VmState::Destroyed);
    let mut foreign = VirtualMachine::new(VmId::new(), NodeId::new(), "elsewhere");
    foreign.action = VmAction::Start;
    h.store.put_vm(&foreign).unwrap();
    h.vm(VmAction::Start, VmState::Stopped);

    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 1);
    // previous operation still in flight
    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 0);
    h.reconciler.wait_idle().await;

    assert_eq!(h.host.count(|c| matches!(c, HostCall::UnitStart(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_action_destroys() {
    let h = harness();
    let vm = h.vm(VmAction::Destroy, VmState::Stopped);

    h.reconciler.reconcile_vms().await.unwrap();
    h.reconciler.wait_idle().await;

    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Destroyed);
    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 0);
}

#[tokio::test]
async fn test_overlay_pass_uses_stored_vpcs() {
    let h = harness();
    let mut vpc = Vpc::new(VpcId::new(), "prod", "10.40.0.0/16");
    vpc.link_uris = vec!["ipsec://secret@203.0.113.9".to_string()];
    h.store.put_vpc(&vpc).unwrap();

    h.reconciler.reconcile_overlay().await.unwrap();
    h.overlay.wait_idle().await;

    assert_eq!(
        h.host
            .count(|c| matches!(c, HostCall::Deploy(id, _) if *id == vpc.id)),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_crashed_operation_releases_vm() {
    let h = harness();
    let vm = h.vm(VmAction::Start, VmState::Stopped);
    h.host.set_panic_on_start(true);

    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 1);
    h.reconciler.wait_idle().await;

    h.host.set_panic_on_start(false);
    assert_eq!(h.reconciler.reconcile_vms().await.unwrap(), 1);
    h.reconciler.wait_idle().await;

    assert_eq!(
        h.host
            .count(|c| *c == HostCall::UnitStart(h.unit(&vm))),
        2
    );
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Running);
}
