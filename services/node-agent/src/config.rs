//! Configuration for the node agent.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use meshvisor_id::NodeId;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of the node this agent runs on.
    pub node_id: NodeId,

    /// Persistent state: document store, VM dirs, inits, leases, firmware vars.
    pub data_dir: PathBuf,

    /// Runtime sockets, pid files, dhclient pid files.
    pub run_dir: PathBuf,

    /// Directory holding generated process-manager unit files.
    pub systemd_dir: PathBuf,

    /// Per-namespace configuration directories.
    pub netns_dir: PathBuf,

    /// Plain UEFI variable-store template.
    pub ovmf_vars: PathBuf,

    /// Secure-boot UEFI variable-store template.
    pub ovmf_secure_vars: PathBuf,

    /// UEFI code image passed to the hypervisor.
    pub ovmf_code: PathBuf,

    /// Hypervisor binary used in generated units.
    pub hypervisor_bin: PathBuf,

    /// Upper bound for a VM to report running after start.
    pub start_timeout: Duration,

    /// Upper bound for a graceful stop before force-stopping.
    pub stop_timeout: Duration,

    /// Age after which another node's link lease can be taken over.
    pub link_timeout: Duration,

    /// TTL for in-process leased locks.
    pub lock_ttl: Duration,

    /// How long a tunnel may stay disconnected before a redeploy.
    pub link_grace: Duration,

    /// Interval between reconciliation ticks.
    pub sync_interval: Duration,

    /// Statically configured public IPv4 address.
    pub public_ipv4: Option<Ipv4Addr>,

    /// Statically configured public IPv6 address.
    pub public_ipv6: Option<Ipv6Addr>,

    /// Metadata service base URL for public address discovery.
    pub metadata_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Fixed delays and retry counts used by lifecycle and overlay passes.
    pub timing: TimingConfig,
}

/// Delays and retry counts for the lifecycle and overlay sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    /// Attempts to deliver a shutdown request before giving up.
    pub shutdown_attempts: u32,
    /// Delay between shutdown delivery attempts.
    pub shutdown_backoff: Duration,
    /// State polling period while waiting for a stop or start.
    pub poll_interval: Duration,
    /// Re-send shutdown requests every this many polls.
    pub nudge_every: u32,
    /// Settle delay after network teardown.
    pub settle_delay: Duration,
    /// Dwell between a fire-and-forget shutdown and a forced stop.
    pub force_dwell: Duration,
    /// Dwell used when the forced stop has a cause.
    pub force_dwell_with_cause: Duration,
    /// Attempts at public address discovery per overlay pass.
    pub address_attempts: u32,
    /// Delay between public address discovery attempts.
    pub address_backoff: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            shutdown_attempts: 10,
            shutdown_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            nudge_every: 15,
            settle_delay: Duration::from_secs(3),
            force_dwell: Duration::from_secs(10),
            force_dwell_with_cause: Duration::from_secs(15),
            address_attempts: 3,
            address_backoff: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_id = match std::env::var("MESHVISOR_NODE_ID") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid MESHVISOR_NODE_ID: {raw}"))?,
            Err(_) => NodeId::new(),
        };

        let data_dir = env_path("MESHVISOR_DATA_DIR", "/var/lib/meshvisor");
        let mut config = Self::rooted(node_id, &data_dir);

        config.run_dir = env_path("MESHVISOR_RUN_DIR", "/var/run");
        config.systemd_dir = env_path("MESHVISOR_SYSTEMD_DIR", "/etc/systemd/system");
        config.netns_dir = env_path("MESHVISOR_NETNS_DIR", "/etc/netns");
        config.ovmf_vars = env_path("MESHVISOR_OVMF_VARS", "/usr/share/OVMF/OVMF_VARS.fd");
        config.ovmf_secure_vars = env_path(
            "MESHVISOR_OVMF_SECURE_VARS",
            "/usr/share/OVMF/OVMF_VARS.secboot.fd",
        );
        config.ovmf_code = env_path("MESHVISOR_OVMF_CODE", "/usr/share/OVMF/OVMF_CODE.fd");
        config.hypervisor_bin = env_path("MESHVISOR_HYPERVISOR", "/usr/bin/qemu-system-x86_64");

        config.start_timeout = env_secs("MESHVISOR_START_TIMEOUT", 30);
        config.stop_timeout = env_secs("MESHVISOR_STOP_TIMEOUT", 180);
        config.link_timeout = env_secs("MESHVISOR_LINK_TIMEOUT", 60);
        config.lock_ttl = env_secs("MESHVISOR_LOCK_TTL", 60);
        config.link_grace = env_secs("MESHVISOR_LINK_GRACE", 30);
        config.sync_interval = env_secs("MESHVISOR_SYNC_INTERVAL", 10);

        config.public_ipv4 = env_parse("MESHVISOR_PUBLIC_IPV4")?;
        config.public_ipv6 = env_parse("MESHVISOR_PUBLIC_IPV6")?;
        config.metadata_url = std::env::var("MESHVISOR_METADATA_URL").ok();
        config.log_level =
            std::env::var("MESHVISOR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(config)
    }

    /// Configuration with every directory placed under `root`.
    pub fn rooted(node_id: NodeId, root: &Path) -> Self {
        Self {
            node_id,
            data_dir: root.to_path_buf(),
            run_dir: root.join("run"),
            systemd_dir: root.join("systemd"),
            netns_dir: root.join("netns"),
            ovmf_vars: root.join("ovmf").join("OVMF_VARS.fd"),
            ovmf_secure_vars: root.join("ovmf").join("OVMF_VARS.secboot.fd"),
            ovmf_code: root.join("ovmf").join("OVMF_CODE.fd"),
            hypervisor_bin: PathBuf::from("/usr/bin/qemu-system-x86_64"),
            start_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(180),
            link_timeout: Duration::from_secs(60),
            lock_ttl: meshvisor_reconcile::DEFAULT_LOCK_TTL,
            link_grace: Duration::from_secs(30),
            sync_interval: Duration::from_secs(10),
            public_ipv4: None,
            public_ipv6: None,
            metadata_url: None,
            log_level: "info".to_string(),
            timing: TimingConfig::default(),
        }
    }

    /// Path of the SQLite document store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }
}

fn env_path(name: &str, default: &str) -> PathBuf {
    std::env::var_os(name)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}: {raw}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout() {
        let config = Config::rooted(NodeId::new(), Path::new("/tmp/agent"));
        assert_eq!(config.run_dir, PathBuf::from("/tmp/agent/run"));
        assert_eq!(config.netns_dir, PathBuf::from("/tmp/agent/netns"));
        assert_eq!(config.store_path(), PathBuf::from("/tmp/agent/state.db"));
        assert_eq!(config.stop_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_default_timing() {
        let timing = TimingConfig::default();
        assert_eq!(timing.shutdown_attempts, 10);
        assert_eq!(timing.nudge_every, 15);
        assert_eq!(timing.settle_delay, Duration::from_secs(3));
        assert_eq!(timing.force_dwell_with_cause, Duration::from_secs(15));
    }
}
