//! Integration tests for the VM lifecycle controller.
//!
//! All timing tests run on tokio's paused clock so stop timeouts and dwell
//! periods elapse instantly while ordering stays observable.

use std::sync::Arc;
use std::time::Duration;

use meshvisor_id::{DiskId, NodeId, VmId};
use meshvisor_node_agent::config::Config;
use meshvisor_node_agent::mock::{HostCall, MockHost};
use meshvisor_node_agent::paths::NodePaths;
use meshvisor_node_agent::runtime::{ControlChannel, UnitState};
use meshvisor_node_agent::state::{DocumentStore, SqliteStore};
use meshvisor_node_agent::vm::{LifecycleSettings, VmController, VmDeps};
use meshvisor_node_agent::{
    AgentError, Disk, DiskAttachment, Interrupt, ResourceCache, VirtualMachine, VmState,
};
use tempfile::TempDir;
use tokio::time::Instant;

struct Harness {
    _dir: TempDir,
    config: Config,
    paths: NodePaths,
    host: Arc<MockHost>,
    store: Arc<SqliteStore>,
    cache: Arc<ResourceCache>,
    interrupt: Interrupt,
    controller: VmController,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::rooted(NodeId::new(), dir.path());
    let paths = NodePaths::new(&config);
    let host = Arc::new(MockHost::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = Arc::new(ResourceCache::new());
    let interrupt = Interrupt::new();

    let controller = VmController::new(
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
        interrupt.clone(),
    );

    Harness {
        _dir: dir,
        config,
        paths,
        host,
        store,
        cache,
        interrupt,
        controller,
    }
}

impl Harness {
    fn vm(&self, name: &str) -> VirtualMachine {
        let vm = VirtualMachine::new(VmId::new(), self.config.node_id, name);
        self.store.put_vm(&vm).unwrap();
        vm
    }

    fn running_vm(&self, name: &str) -> VirtualMachine {
        let vm = self.vm(name);
        self.host.set_vm_state(&vm.id, UnitState::Active);
        vm
    }

    fn unit(&self, vm: &VirtualMachine) -> String {
        self.paths.unit_name(&vm.id)
    }

    fn time_of(&self, call: &HostCall) -> Option<Instant> {
        self.host
            .timed_calls()
            .into_iter()
            .find(|(_, c)| c == call)
            .map(|(at, _)| at)
    }
}

#[tokio::test(start_paused = true)]
async fn test_power_on_starts_and_configures() {
    let h = harness();
    let mut vm = h.vm("web");
    vm.vnc_display = Some(1);
    vm.vnc_password = Some("hunter2".to_string());

    h.controller.power_on(&vm).await.unwrap();

    let calls = h.host.calls();
    let start = calls
        .iter()
        .position(|c| *c == HostCall::UnitStart(h.unit(&vm)))
        .expect("unit started");
    let reload = calls.iter().position(|c| *c == HostCall::UnitReload).unwrap();
    let bootstrap = calls
        .iter()
        .position(|c| *c == HostCall::Bootstrap(vm.id))
        .unwrap();
    let network = calls
        .iter()
        .position(|c| *c == HostCall::NetworkConfigure(vm.id))
        .unwrap();
    assert!(bootstrap < reload && reload < start && start < network);
    assert!(calls.contains(&HostCall::ConsolePassword(vm.id)));

    assert!(h.paths.unit_path(&vm.id).exists());
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Running);
    assert_eq!(h.cache.vm_state(&vm.id), None);
}

#[tokio::test(start_paused = true)]
async fn test_power_on_is_idempotent() {
    let h = harness();
    let vm = h.vm("web");

    h.controller.power_on(&vm).await.unwrap();
    h.host.clear_calls();
    h.controller.power_on(&vm).await.unwrap();

    assert!(h.host.calls().is_empty());
    assert_eq!(h.cache.vm_state(&vm.id), None);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_short_circuits_operations() {
    let h = harness();
    let vm = h.running_vm("web");
    h.interrupt.raise();

    h.controller.power_on(&vm).await.unwrap();
    h.controller.power_off(&vm).await.unwrap();
    h.controller.force_power_off(&vm, None).await.unwrap();
    h.controller.destroy(&vm).await.unwrap();

    assert!(h.host.calls().is_empty());
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_network_failure_keeps_process_running() {
    let h = harness();
    let vm = h.vm("web");
    h.host.set_fail_network(true);

    let err = h.controller.power_on(&vm).await.unwrap_err();
    assert!(matches!(err, AgentError::Fatal(_)));

    assert_eq!(h.host.count(|c| matches!(c, HostCall::UnitStop(_))), 0);
    assert_eq!(h.controller.state(&vm.id).await.unwrap(), VmState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_power_off_graceful() {
    let h = harness();
    let vm = h.running_vm("web");

    h.controller.power_off(&vm).await.unwrap();

    assert_eq!(
        h.host
            .count(|c| *c == HostCall::Shutdown(vm.id, ControlChannel::Monitor)),
        1
    );
    assert_eq!(h.host.count(|c| matches!(c, HostCall::UnitStop(_))), 0);
    assert!(h.host.calls().contains(&HostCall::NetworkClear(vm.id)));
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_power_off_escalates_only_after_stop_timeout() {
    let h = harness();
    let vm = h.running_vm("stubborn");
    h.host.set_honor_shutdown(false);

    let requested = Instant::now();
    h.controller.power_off(&vm).await.unwrap();

    let stopped_at = h
        .time_of(&HostCall::UnitStop(h.unit(&vm)))
        .expect("force stop issued");
    assert!(stopped_at.duration_since(requested) >= h.config.stop_timeout);

    // one nudge per 15 polls over 180 polls, each on both channels
    assert_eq!(
        h.host
            .count(|c| *c == HostCall::Shutdown(vm.id, ControlChannel::Guest)),
        12
    );
    assert_eq!(
        h.host
            .count(|c| *c == HostCall::Shutdown(vm.id, ControlChannel::Monitor)),
        13
    );

    let clear_at = h.time_of(&HostCall::NetworkClear(vm.id)).unwrap();
    assert!(clear_at >= stopped_at);
}

#[tokio::test(start_paused = true)]
async fn test_power_off_unreachable_control_still_escalates() {
    let h = harness();
    let vm = h.running_vm("wedged");
    h.host.set_control_reachable(false);

    let requested = Instant::now();
    h.controller.power_off(&vm).await.unwrap();

    assert_eq!(
        h.host
            .count(|c| *c == HostCall::Shutdown(vm.id, ControlChannel::Monitor)),
        10
    );
    let stopped_at = h.time_of(&HostCall::UnitStop(h.unit(&vm))).unwrap();
    assert!(stopped_at.duration_since(requested) >= Duration::from_millis(9 * 500));
    assert!(stopped_at.duration_since(requested) < h.config.stop_timeout);
}

#[tokio::test(start_paused = true)]
async fn test_force_power_off_dwell_depends_on_cause() {
    let h = harness();
    let quiet = h.running_vm("quiet");
    let loud = h.running_vm("loud");
    h.host.set_honor_shutdown(false);

    let t0 = Instant::now();
    h.controller.force_power_off(&quiet, None).await.unwrap();
    let quiet_stop = h.time_of(&HostCall::UnitStop(h.unit(&quiet))).unwrap();
    let dwell = quiet_stop.duration_since(t0);
    assert!(dwell >= Duration::from_secs(10) && dwell < Duration::from_secs(11));

    let cause = AgentError::Unreachable("monitor socket".to_string());
    let t1 = Instant::now();
    h.controller
        .force_power_off(&loud, Some(&cause))
        .await
        .unwrap();
    let loud_stop = h.time_of(&HostCall::UnitStop(h.unit(&loud))).unwrap();
    let dwell = loud_stop.duration_since(t1);
    assert!(dwell >= Duration::from_secs(15) && dwell < Duration::from_secs(16));
}

#[tokio::test(start_paused = true)]
async fn test_destroy_deletes_owned_disk_and_detaches_others() {
    let h = harness();
    let mut vm = h.running_vm("db");
    let other = VmId::new();

    let disks: Vec<Disk> = (0..3)
        .map(|i| Disk {
            id: DiskId::new(),
            source_instance: Some(if i == 0 { vm.id } else { other }),
            instance: Some(vm.id),
            size_gb: 10,
        })
        .collect();
    for disk in &disks {
        h.store.put_disk(disk).unwrap();
    }
    vm.disks = disks.iter().map(|d| DiskAttachment { id: d.id }).collect();
    h.store.put_vm(&vm).unwrap();

    std::fs::create_dir_all(h.paths.unit_path(&vm.id).parent().unwrap()).unwrap();
    std::fs::write(h.paths.unit_path(&vm.id), "[Unit]\n").unwrap();
    std::fs::create_dir_all(h.paths.vm_dir(&vm.id)).unwrap();

    h.controller.destroy(&vm).await.unwrap();

    assert!(h.store.get_disk(&disks[0].id).await.unwrap_err().is_not_found());
    for disk in &disks[1..] {
        let kept = h.store.get_disk(&disk.id).await.unwrap();
        assert_eq!(kept.instance, None);
    }

    assert!(h.host.calls().contains(&HostCall::Shutdown(vm.id, ControlChannel::Monitor)));
    assert!(h.host.calls().contains(&HostCall::UnitStop(h.unit(&vm))));
    for path in h.paths.vm_artifacts(&vm.id) {
        assert!(!path.exists(), "{} left behind", path.display());
    }
    assert_eq!(h.store.get_vm(&vm.id).await.unwrap().state, VmState::Destroyed);
    assert!(h.cache.vm(&vm.id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_destroy_only_deletes_boot_disk_it_created() {
    let h = harness();
    let mut vm = h.vm("attached");
    let shared = Disk {
        id: DiskId::new(),
        source_instance: None,
        instance: Some(vm.id),
        size_gb: 20,
    };
    // owned by this VM but not the boot disk
    let secondary = Disk {
        id: DiskId::new(),
        source_instance: Some(vm.id),
        instance: Some(vm.id),
        size_gb: 5,
    };
    h.store.put_disk(&shared).unwrap();
    h.store.put_disk(&secondary).unwrap();
    let missing = DiskId::new();
    vm.disks = vec![
        DiskAttachment { id: shared.id },
        DiskAttachment { id: secondary.id },
        DiskAttachment { id: missing },
    ];

    h.controller.destroy(&vm).await.unwrap();

    assert_eq!(h.store.get_disk(&shared.id).await.unwrap().instance, None);
    assert_eq!(h.store.get_disk(&secondary.id).await.unwrap().instance, None);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent() {
    let h = harness();
    let vm = h.vm("gone");
    h.controller.power_on(&vm).await.unwrap();

    h.controller.destroy(&vm).await.unwrap();
    assert!(h.host.calls().contains(&HostCall::UnitStop(h.unit(&vm))));
    h.host.clear_calls();
    h.controller.destroy(&vm).await.unwrap();

    assert_eq!(h.host.count(|c| matches!(c, HostCall::UnitStop(_))), 0);
    assert_eq!(h.host.count(|c| matches!(c, HostCall::Shutdown(..))), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_invalidates_without_stopping() {
    let h = harness();
    let vm = h.running_vm("crashed");
    h.controller.state(&vm.id).await.unwrap();
    assert_eq!(h.cache.vm_state(&vm.id), Some(VmState::Running));

    h.controller.cleanup(&vm).await;

    assert_eq!(h.cache.vm_state(&vm.id), None);
    assert_eq!(h.host.calls(), vec![HostCall::NetworkClear(vm.id)]);
}

#[tokio::test(start_paused = true)]
async fn test_attached_disks_cached_until_mutation() {
    let h = harness();
    let mut vm = h.running_vm("disks");
    let disks: Vec<Disk> = (0..2)
        .map(|_| Disk {
            id: DiskId::new(),
            source_instance: None,
            instance: Some(vm.id),
            size_gb: 1,
        })
        .collect();
    for disk in &disks {
        h.store.put_disk(disk).unwrap();
    }
    vm.disks = disks.iter().map(|d| DiskAttachment { id: d.id }).collect();
    vm.disks.push(DiskAttachment { id: DiskId::new() });

    let ids: Vec<DiskId> = disks.iter().map(|d| d.id).collect();
    assert_eq!(h.controller.attached_disks(&vm).await.unwrap(), ids);

    h.store.detach_disk(&disks[1].id).await.unwrap();
    assert_eq!(h.controller.attached_disks(&vm).await.unwrap(), ids);

    h.controller.power_off(&vm).await.unwrap();
    assert_eq!(h.cache.vm(&vm.id).and_then(|f| f.disks), None);
    assert_eq!(
        h.controller.attached_disks(&vm).await.unwrap(),
        vec![disks[0].id]
    );
}
