//! Guest first-boot data written next to the VM.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::model::VirtualMachine;
use crate::paths::{write_file, NodePaths};
use crate::runtime::GuestBootstrap;

#[derive(Debug, Serialize)]
struct InitDocument<'a> {
    instance_id: String,
    hostname: &'a str,
    adapters: Vec<InitAdapter<'a>>,
}

#[derive(Debug, Serialize)]
struct InitAdapter<'a> {
    mac: &'a str,
    vpc_id: String,
    subnet_id: String,
}

/// Writes the init document the hypervisor exposes to the guest.
#[derive(Debug, Clone)]
pub struct FileBootstrap {
    paths: NodePaths,
}

impl FileBootstrap {
    pub fn new(paths: NodePaths) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl GuestBootstrap for FileBootstrap {
    async fn write(&self, vm: &VirtualMachine) -> Result<()> {
        let doc = InitDocument {
            instance_id: vm.id.to_string(),
            hostname: &vm.name,
            adapters: vm
                .adapters
                .iter()
                .map(|a| InitAdapter {
                    mac: &a.mac,
                    vpc_id: a.vpc_id.to_string(),
                    subnet_id: a.subnet_id.to_string(),
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&doc)
            .map_err(|e| AgentError::Fatal(format!("init document: {e}")))?;

        let path = self.paths.init_path(&vm.id);
        debug!(vm_id = %vm.id, path = %path.display(), "Writing guest init");
        write_file(&path, json).await
    }
}
