//! On-disk layout of per-VM and per-namespace artifacts.

use std::path::{Path, PathBuf};

use meshvisor_id::{DiskId, VmId};

use crate::config::Config;
use crate::error::{AgentError, Result};

/// Process-manager unit name of a VM.
pub fn unit_name(vm: &VmId) -> String {
    format!("meshvisor_{vm}.service")
}

/// Resolves artifact locations from the configured directories.
#[derive(Debug, Clone)]
pub struct NodePaths {
    data_dir: PathBuf,
    run_dir: PathBuf,
    systemd_dir: PathBuf,
    netns_dir: PathBuf,
}

impl NodePaths {
    pub fn new(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            run_dir: config.run_dir.clone(),
            systemd_dir: config.systemd_dir.clone(),
            netns_dir: config.netns_dir.clone(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn netns_dir(&self) -> &Path {
        &self.netns_dir
    }

    pub fn unit_name(&self, vm: &VmId) -> String {
        unit_name(vm)
    }

    pub fn unit_path(&self, vm: &VmId) -> PathBuf {
        self.systemd_dir.join(self.unit_name(vm))
    }

    pub fn vm_dir(&self, vm: &VmId) -> PathBuf {
        self.data_dir.join("instances").join(vm.to_string())
    }

    /// Console socket.
    pub fn sock_path(&self, vm: &VmId) -> PathBuf {
        self.run_dir.join(format!("{vm}.sock"))
    }

    /// Hypervisor monitor socket.
    pub fn monitor_path(&self, vm: &VmId) -> PathBuf {
        self.run_dir.join(format!("{vm}.qmp.sock"))
    }

    /// Guest agent socket.
    pub fn guest_path(&self, vm: &VmId) -> PathBuf {
        self.run_dir.join(format!("{vm}.guest"))
    }

    pub fn pid_path(&self, vm: &VmId) -> PathBuf {
        self.run_dir.join(format!("{vm}.pid"))
    }

    pub fn init_path(&self, vm: &VmId) -> PathBuf {
        self.data_dir.join("inits").join(format!("{vm}.json"))
    }

    pub fn lease_path(&self, vm: &VmId) -> PathBuf {
        self.data_dir.join("leases").join(format!("{vm}.leases"))
    }

    pub fn ovmf_vars_path(&self, vm: &VmId) -> PathBuf {
        self.data_dir.join("ovmf").join(format!("{vm}_vars.fd"))
    }

    pub fn disk_path(&self, disk: &DiskId) -> PathBuf {
        self.data_dir.join("disks").join(format!("{disk}.qcow2"))
    }

    pub fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.netns_dir.join(namespace)
    }

    /// Marker recording which VPC owns a namespace directory.
    pub fn vpc_marker_path(&self, namespace: &str) -> PathBuf {
        self.namespace_dir(namespace).join("vpc.id")
    }

    /// Every artifact a destroyed VM leaves behind.
    pub fn vm_artifacts(&self, vm: &VmId) -> Vec<PathBuf> {
        vec![
            self.vm_dir(vm),
            self.unit_path(vm),
            self.sock_path(vm),
            self.monitor_path(vm),
            self.guest_path(vm),
            self.pid_path(vm),
            self.init_path(vm),
            self.lease_path(vm),
            self.ovmf_vars_path(vm),
        ]
    }
}

/// Remove a file or directory tree. Missing paths are not an error.
pub async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AgentError::io(path, e)),
    };

    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::io(path, e)),
    }
}

/// Write a file, creating parent directories as needed.
pub async fn write_file(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AgentError::io(parent, e))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| AgentError::io(path, e))
}
