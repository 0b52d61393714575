//! Process-manager unit definitions for VMs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::model::VirtualMachine;
use crate::network::tap_name;
use crate::paths::NodePaths;

/// Host binaries and firmware used when rendering units.
#[derive(Debug, Clone)]
pub struct UnitTemplate {
    pub hypervisor_bin: PathBuf,
    pub ovmf_code: PathBuf,
    pub ovmf_vars: PathBuf,
    pub ovmf_secure_vars: PathBuf,
}

impl UnitTemplate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hypervisor_bin: config.hypervisor_bin.clone(),
            ovmf_code: config.ovmf_code.clone(),
            ovmf_vars: config.ovmf_vars.clone(),
            ovmf_secure_vars: config.ovmf_secure_vars.clone(),
        }
    }

    /// UEFI variable-store template for the VM's boot mode.
    pub fn firmware_vars(&self, secure_boot: bool) -> &Path {
        if secure_boot {
            &self.ovmf_secure_vars
        } else {
            &self.ovmf_vars
        }
    }
}

/// Copy a fresh UEFI variable store over the VM's per-VM copy.
pub async fn write_firmware_vars(
    vm: &VirtualMachine,
    template: &UnitTemplate,
    paths: &NodePaths,
) -> Result<()> {
    let source = template.firmware_vars(vm.secure_boot);
    let target = paths.ovmf_vars_path(&vm.id);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::io(parent, e))?;
    }
    tokio::fs::copy(source, &target)
        .await
        .map_err(|e| AgentError::io(source, e))?;
    Ok(())
}

fn hypervisor_args(vm: &VirtualMachine, template: &UnitTemplate, paths: &NodePaths) -> Vec<String> {
    let id = vm.id;
    let mut args = vec![
        format!("-name {id}"),
        "-machine q35,accel=kvm".to_string(),
        "-cpu host".to_string(),
        format!("-smp {}", vm.processors),
        format!("-m {}M", vm.memory_mb),
        "-nographic".to_string(),
        format!("-pidfile {}", paths.pid_path(&id).display()),
        format!("-qmp unix:{},server,nowait", paths.monitor_path(&id).display()),
        format!("-serial unix:{},server,nowait", paths.sock_path(&id).display()),
        format!(
            "-chardev socket,path={},server=on,wait=off,id=qga0",
            paths.guest_path(&id).display()
        ),
        "-device virtio-serial".to_string(),
        "-device virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".to_string(),
        format!(
            "-fw_cfg name=opt/meshvisor/init,file={}",
            paths.init_path(&id).display()
        ),
    ];

    if vm.hugepages {
        args.push("-mem-path /dev/hugepages".to_string());
    }

    if vm.uefi {
        args.push(format!(
            "-drive if=pflash,format=raw,readonly=on,file={}",
            template.ovmf_code.display()
        ));
        args.push(format!(
            "-drive if=pflash,format=raw,file={}",
            paths.ovmf_vars_path(&id).display()
        ));
    }

    for (index, disk) in vm.disks.iter().enumerate() {
        args.push(format!(
            "-drive file={},if=virtio,index={index},format=qcow2",
            paths.disk_path(&disk.id).display()
        ));
    }

    for (index, adapter) in vm.adapters.iter().enumerate() {
        args.push(format!(
            "-netdev tap,id=net{index},ifname={},script=no,downscript=no",
            tap_name(&id, index)
        ));
        args.push(format!(
            "-device virtio-net-pci,netdev=net{index},mac={}",
            adapter.mac
        ));
    }

    if let Some(display) = vm.vnc_display {
        args.push(format!("-vnc :{display},password=on"));
    }

    args
}

/// Render the unit file for a VM.
pub fn render_unit(vm: &VirtualMachine, template: &UnitTemplate, paths: &NodePaths) -> String {
    let mut unit = String::new();
    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description=Meshvisor Virtual Machine {} ({})", vm.name, vm.id);
    let _ = writeln!(unit, "After=network.target");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Service]");
    let _ = writeln!(unit, "Type=simple");
    let _ = writeln!(unit, "Environment=MESHVISOR_VM_ID={}", vm.id);
    let _ = writeln!(
        unit,
        "ExecStart={} {}",
        template.hypervisor_bin.display(),
        hypervisor_args(vm, template, paths).join(" ")
    );
    let _ = writeln!(unit, "KillMode=mixed");
    let _ = writeln!(unit, "TimeoutStopSec=30");
    let _ = writeln!(unit, "Restart=no");
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiskAttachment, NetworkAdapter};
    use meshvisor_id::{DiskId, NodeId, SubnetId, VmId, VpcId};

    fn setup() -> (Config, NodePaths, UnitTemplate) {
        let config = Config::rooted(NodeId::new(), Path::new("/srv/agent"));
        let paths = NodePaths::new(&config);
        let template = UnitTemplate::from_config(&config);
        (config, paths, template)
    }

    #[test]
    fn test_render_unit_includes_devices() {
        let (config, paths, template) = setup();
        let mut vm = VirtualMachine::new(VmId::new(), config.node_id, "web");
        vm.memory_mb = 2048;
        vm.processors = 4;
        vm.disks = vec![DiskAttachment { id: DiskId::new() }];
        vm.adapters = vec![NetworkAdapter {
            vpc_id: VpcId::new(),
            subnet_id: SubnetId::new(),
            mac: "52:54:00:12:34:56".to_string(),
        }];
        vm.vnc_display = Some(3);

        let unit = render_unit(&vm, &template, &paths);
        assert!(unit.contains("-smp 4"));
        assert!(unit.contains("-m 2048M"));
        assert!(unit.contains(&paths.disk_path(&vm.disks[0].id).display().to_string()));
        assert!(unit.contains(&format!("ifname={}", tap_name(&vm.id, 0))));
        assert!(unit.contains("mac=52:54:00:12:34:56"));
        assert!(unit.contains("-vnc :3,password=on"));
        assert!(!unit.contains("pflash"));
    }

    #[test]
    fn test_uefi_uses_per_vm_vars() {
        let (config, paths, template) = setup();
        let mut vm = VirtualMachine::new(VmId::new(), config.node_id, "uefi");
        vm.uefi = true;
        let unit = render_unit(&vm, &template, &paths);
        assert!(unit.contains(&paths.ovmf_vars_path(&vm.id).display().to_string()));
        assert!(unit.contains(&template.ovmf_code.display().to_string()));
    }

    #[test]
    fn test_firmware_selection() {
        let (_, _, template) = setup();
        assert_eq!(template.firmware_vars(true), template.ovmf_secure_vars.as_path());
        assert_eq!(template.firmware_vars(false), template.ovmf_vars.as_path());
    }

    #[tokio::test]
    async fn test_write_firmware_vars_copies_template() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::rooted(NodeId::new(), dir.path());
        let paths = NodePaths::new(&config);
        let template = UnitTemplate::from_config(&config);
        std::fs::create_dir_all(template.ovmf_vars.parent().unwrap()).unwrap();
        std::fs::write(&template.ovmf_vars, b"plain").unwrap();
        std::fs::write(&template.ovmf_secure_vars, b"secure").unwrap();

        let mut vm = VirtualMachine::new(VmId::new(), config.node_id, "fw");
        vm.secure_boot = true;
        write_firmware_vars(&vm, &template, &paths).await.unwrap();
        assert_eq!(std::fs::read(paths.ovmf_vars_path(&vm.id)).unwrap(), b"secure");
    }
}
