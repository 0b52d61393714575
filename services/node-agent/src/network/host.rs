//! Overlay kernel objects via `ip`, plus process checks via signals.

use std::path::PathBuf;

use async_trait::async_trait;
use meshvisor_id::VpcId;
use meshvisor_networking::{link_namespace, link_virt_iface, vpc_bridge, VpcGateway};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::NetworkHost;
use crate::command::{run_in_namespace, run_ip, CommandError};
use crate::error::{AgentError, Result};

/// Treat "already gone" as success.
pub(crate) fn ignore_missing<T>(result: Result<T, CommandError>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_missing() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Treat "already there" as success.
fn ignore_exists<T>(result: Result<T, CommandError>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_exists() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create a bridge if it does not exist and bring it up.
pub(crate) async fn ensure_bridge(name: &str) -> Result<()> {
    ignore_exists(run_ip(&["link", "add", "name", name, "type", "bridge"]).await)?;
    run_ip(&["link", "set", "dev", name, "up"]).await?;
    Ok(())
}

/// Network host backed by iproute2 and sysfs.
#[derive(Debug, Clone)]
pub struct IpHost {
    sysfs_net: PathBuf,
}

impl Default for IpHost {
    fn default() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl IpHost {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NetworkHost for IpHost {
    async fn interfaces(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.sysfs_net)
            .await
            .map_err(|e| AgentError::io(&self.sysfs_net, e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AgentError::io(&self.sysfs_net, e))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let out = run_ip(&["netns", "list"]).await?;
        Ok(parse_netns_list(&out))
    }

    async fn delete_interface(&self, name: &str) -> Result<()> {
        ignore_missing(run_ip(&["link", "delete", name]).await)
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        ignore_missing(run_ip(&["netns", "delete", name]).await)
    }

    async fn configure_namespace(&self, vpc: &VpcId, gateway: &VpcGateway) -> Result<()> {
        let ns = link_namespace(vpc, 0);
        let virt0 = link_virt_iface(vpc, 0);
        let virt1 = link_virt_iface(vpc, 1);
        let bridge = vpc_bridge(vpc);

        info!(vpc_id = %vpc, namespace = %ns, gateway = %gateway.ipv4, "Configuring namespace");

        ignore_exists(run_ip(&["netns", "add", &ns]).await)?;
        ensure_bridge(&bridge).await?;

        if !self.sysfs_net.join(&virt0).exists() {
            run_ip(&[
                "link", "add", &virt0, "type", "veth", "peer", "name", &virt1, "netns", &ns,
            ])
            .await?;
        }
        run_ip(&["link", "set", "dev", &virt0, "master", &bridge]).await?;
        run_ip(&["link", "set", "dev", &virt0, "up"]).await?;

        let v4 = format!("{}/{}", gateway.ipv4, gateway.prefix_len);
        let v6 = format!("{}/64", gateway.ipv6);
        run_in_namespace(&ns, "ip", &["link", "set", "dev", "lo", "up"]).await?;
        run_in_namespace(&ns, "ip", &["link", "set", "dev", &virt1, "up"]).await?;
        run_in_namespace(&ns, "ip", &["addr", "replace", &v4, "dev", &virt1]).await?;
        run_in_namespace(&ns, "ip", &["-6", "addr", "replace", &v6, "dev", &virt1]).await?;

        if let Err(e) =
            run_in_namespace(&ns, "sysctl", &["-w", "net.ipv4.ip_forward=1"]).await
        {
            warn!(namespace = %ns, error = %e, "Failed to enable forwarding");
        }

        debug!(namespace = %ns, "Namespace configured");
        Ok(())
    }

    async fn clear_namespace(&self, vpc: &VpcId) -> Result<()> {
        let virt0 = link_virt_iface(vpc, 0);
        debug!(vpc_id = %vpc, iface = %virt0, "Clearing namespace network");
        // deleting one end of the pair removes both
        ignore_missing(run_ip(&["link", "delete", &virt0]).await)
    }

    fn process_alive(&self, pid: i32) -> bool {
        // 0 and negative values address process groups, never one process
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn kill_process(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(AgentError::Parse(format!("refusing to signal pid {pid}")));
        }
        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(AgentError::NotFound(format!("pid {pid}"))),
            Err(e) => Err(AgentError::Fatal(format!("kill {pid}: {e}"))),
        }
    }
}

/// Parse `ip netns list` output into namespace names.
fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}
