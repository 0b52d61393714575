//! VPC overlay reconciliation.
//!
//! Every tick [`OverlayReconciler::sync_states`] decides which VPCs this node
//! carries links for, spawns an independent convergence pass per VPC and
//! sweeps overlay objects no longer wanted. Passes for the same VPC are
//! mutually exclusive through the shared [`LeasedLock`]; a pass that finds the
//! lease taken returns immediately and the next tick retries.
//!
//! A pass only redeploys the tunnel daemon when the content hash of the
//! desired link states differs from the last successfully applied one, or
//! when links stay disconnected for longer than the grace period.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use meshvisor_id::{NodeId, VpcId};
use meshvisor_networking::{
    dhclient_pid_file_iface, is_link_namespace, is_virt_iface, link_external_iface,
    link_namespace, link_virt_iface, Ipv4Network, VpcGateway,
};
use meshvisor_reconcile::{AppliedHashes, ContentHash, DisconnectTracker, LeasedLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::address::{AddressResolver, PublicAddresses};
use super::tunnel::TunnelSubsystem;
use super::NetworkHost;
use crate::cache::{ResourceCache, VpcFacts};
use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::model::Vpc;
use crate::paths::{remove_path, write_file, NodePaths};
use crate::state::DocumentStore;

/// Overlay reconciliation settings.
#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub node_id: NodeId,
    /// Age after which another node's link lease may be taken over.
    pub link_timeout: Duration,
    /// How long links may stay disconnected before a redeploy.
    pub link_grace: Duration,
    pub address_attempts: u32,
    pub address_backoff: Duration,
}

impl OverlaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            node_id: config.node_id,
            link_timeout: config.link_timeout,
            link_grace: config.link_grace,
            address_attempts: config.timing.address_attempts,
            address_backoff: config.timing.address_backoff,
        }
    }
}

/// Collaborators of the overlay reconciler.
#[derive(Clone)]
pub struct OverlayDeps {
    pub store: Arc<dyn DocumentStore>,
    pub host: Arc<dyn NetworkHost>,
    pub tunnels: Arc<dyn TunnelSubsystem>,
    pub resolver: Arc<dyn AddressResolver>,
    pub cache: Arc<ResourceCache>,
    pub locks: Arc<LeasedLock>,
    pub applied: Arc<AppliedHashes<VpcId>>,
}

/// Result of one per-VPC pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass holds the VPC lease.
    Busy,
    /// Desired state already applied and links healthy.
    Unchanged,
    /// Desired state changed and was deployed.
    Deployed,
    /// Links stayed down past the grace period and were redeployed.
    Redeployed,
    /// Namespace torn down.
    Removed,
    /// Pass stopped early. The next tick retries.
    Aborted,
}

/// Overlay objects that must survive the sweep.
#[derive(Debug, Default)]
struct Desired {
    namespaces: HashSet<String>,
    virt_ifaces: HashSet<String>,
    external_ifaces: HashSet<String>,
}

impl Desired {
    fn insert(&mut self, vpc: &VpcId) {
        self.namespaces.insert(link_namespace(vpc, 0));
        self.virt_ifaces.insert(link_virt_iface(vpc, 0));
        self.virt_ifaces.insert(link_virt_iface(vpc, 1));
        self.external_ifaces.insert(link_external_iface(vpc, 0));
    }
}

/// Converges VPC overlay namespaces and their tunnels.
pub struct OverlayReconciler {
    settings: OverlaySettings,
    paths: NodePaths,
    deps: OverlayDeps,
    trackers: Mutex<HashMap<VpcId, DisconnectTracker>>,
    tasks: Mutex<JoinSet<PassOutcome>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OverlayReconciler {
    pub fn new(settings: OverlaySettings, paths: NodePaths, deps: OverlayDeps) -> Self {
        Self {
            settings,
            paths,
            deps,
            trackers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Decide which VPCs this node carries, dispatch their passes and sweep.
    ///
    /// Returns the VPCs a pass was dispatched for. Passes run in the
    /// background; use [`Self::wait_idle`] to wait for them.
    pub async fn sync_states(self: &Arc<Self>, vpcs: &[Vpc]) -> Result<Vec<VpcId>> {
        self.reap();

        let node = self.settings.node_id;
        let timeout = self.settings.link_timeout;
        let now = Utc::now();
        let mut desired = Desired::default();
        let mut dispatched = Vec::new();

        for vpc in vpcs {
            if vpc.link_uris.is_empty() {
                continue;
            }

            if !vpc.link_claimable(&node, now, timeout) {
                debug!(vpc_id = %vpc.id, "Links held by another node");
                continue;
            }

            match self.deps.store.ping_link(&vpc.id, &node, timeout).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(vpc_id = %vpc.id, "Lost link lease race");
                    continue;
                }
                Err(e) => {
                    error!(vpc_id = %vpc.id, error = %e, "Failed to update link timestamp");
                    continue;
                }
            }

            desired.insert(&vpc.id);
            dispatched.push(vpc.id);

            let this = Arc::clone(self);
            let vpc = vpc.clone();
            self.spawn(async move { this.converge(&vpc).await });
        }

        self.sweep(&desired).await?;
        Ok(dispatched)
    }

    /// One convergence pass for a VPC.
    pub async fn converge(&self, vpc: &Vpc) -> PassOutcome {
        let Some(_lease) = self.deps.locks.try_acquire_owned(&vpc.id.to_string()) else {
            debug!(vpc_id = %vpc.id, "Overlay pass already running");
            return PassOutcome::Busy;
        };

        let gateway = match self.configure_namespace(vpc).await {
            Ok(gateway) => gateway,
            Err(e) => {
                error!(vpc_id = %vpc.id, error = %e, "Failed to configure namespace");
                if let Err(e) = self.deps.host.clear_namespace(&vpc.id).await {
                    error!(vpc_id = %vpc.id, error = %e, "Failed to clear namespace");
                }
                return PassOutcome::Aborted;
            }
        };

        let addresses = self.resolve_addresses(&vpc.id).await;
        if addresses.is_empty() {
            error!(vpc_id = %vpc.id, "Failed to resolve public address");
            return PassOutcome::Aborted;
        }

        let states = match self.deps.tunnels.desired_states(vpc, &addresses).await {
            Ok(states) => states,
            Err(e) => {
                error!(vpc_id = %vpc.id, error = %e, "Failed to build link states");
                return PassOutcome::Aborted;
            }
        };
        let hash = ContentHash::combine(states.iter().map(|s| &s.hash));
        let names: Vec<String> = states
            .iter()
            .flat_map(|s| s.links.iter().map(|l| l.name.clone()))
            .collect();

        let mut outcome = PassOutcome::Unchanged;
        if self.deps.applied.is_changed(&vpc.id, &hash) {
            info!(vpc_id = %vpc.id, hash = %hash, peers = states.len(), "Deploying link state");
            if let Err(e) = self.deps.tunnels.deploy(&vpc.id, &states).await {
                error!(vpc_id = %vpc.id, error = %e, "Failed to deploy link state");
                return PassOutcome::Aborted;
            }
            self.deps.applied.mark_applied(vpc.id, hash);
            guard(&self.trackers).remove(&vpc.id);
            outcome = PassOutcome::Deployed;
        }

        match self.deps.tunnels.disconnected(&vpc.id, &names).await {
            Ok(down) => {
                let expired = self.observe_disconnected(vpc.id, down);
                if !expired.is_empty() {
                    warn!(vpc_id = %vpc.id, links = ?expired, "Disconnected timeout, redeploying");
                    if let Err(e) = self.deps.tunnels.deploy(&vpc.id, &states).await {
                        error!(vpc_id = %vpc.id, error = %e, "Failed to redeploy link state");
                        return PassOutcome::Aborted;
                    }
                    outcome = PassOutcome::Redeployed;
                }
            }
            Err(e) => info!(vpc_id = %vpc.id, error = %e, "Failed to get link status"),
        }

        self.deps.cache.set_vpc(
            vpc.id,
            VpcFacts {
                gateway: Some(gateway),
                public_ipv4: addresses.ipv4,
                public_ipv6: addresses.ipv6,
            },
        );
        outcome
    }

    /// Tear down a VPC's namespace after the node stopped carrying it.
    pub async fn remove_vpc(&self, vpc_id: VpcId) -> PassOutcome {
        let Some(_lease) = self.deps.locks.try_acquire_owned(&vpc_id.to_string()) else {
            debug!(vpc_id = %vpc_id, "Overlay pass already running");
            return PassOutcome::Busy;
        };

        info!(vpc_id = %vpc_id, "Removing overlay namespace");

        if let Err(e) = self.deps.tunnels.teardown(&vpc_id).await {
            error!(vpc_id = %vpc_id, error = %e, "Failed to stop tunnels");
            return PassOutcome::Aborted;
        }
        if let Err(e) = self.deps.host.clear_namespace(&vpc_id).await {
            error!(vpc_id = %vpc_id, error = %e, "Failed to clear network state");
            return PassOutcome::Aborted;
        }

        let namespace = link_namespace(&vpc_id, 0);
        if let Err(e) = self.deps.host.delete_namespace(&namespace).await {
            error!(vpc_id = %vpc_id, error = %e, "Failed to delete namespace");
            return PassOutcome::Aborted;
        }

        let dir = self.paths.namespace_dir(&namespace);
        if let Err(e) = remove_path(&dir).await {
            error!(vpc_id = %vpc_id, error = %e, "Failed to remove namespace directory");
            return PassOutcome::Aborted;
        }

        self.deps.applied.forget(&vpc_id);
        guard(&self.trackers).remove(&vpc_id);
        self.deps.cache.invalidate_vpc(&vpc_id);
        PassOutcome::Removed
    }

    /// Wait for every dispatched pass to finish.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *guard(&self.tasks));
            if tasks.is_empty() {
                return;
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Overlay pass panicked");
                }
            }
        }
    }

    fn spawn<F>(&self, pass: F)
    where
        F: Future<Output = PassOutcome> + Send + 'static,
    {
        guard(&self.tasks).spawn(pass);
    }

    /// Drop finished passes.
    fn reap(&self) {
        let mut tasks = guard(&self.tasks);
        while let Some(joined) = tasks.try_join_next() {
            match joined {
                Ok(outcome) => debug!(?outcome, "Overlay pass finished"),
                Err(e) => error!(error = %e, "Overlay pass panicked"),
            }
        }
    }

    async fn configure_namespace(&self, vpc: &Vpc) -> Result<VpcGateway> {
        let network = Ipv4Network::from_cidr(&vpc.network)
            .map_err(|e| AgentError::Parse(format!("vpc network {}: {e}", vpc.network)))?;
        let gateway = VpcGateway::for_vpc(&vpc.id, &network)
            .map_err(|e| AgentError::Parse(format!("vpc gateway: {e}")))?;

        let namespace = link_namespace(&vpc.id, 0);
        write_file(&self.paths.vpc_marker_path(&namespace), vpc.id.to_string()).await?;
        self.deps.host.configure_namespace(&vpc.id, &gateway).await?;
        Ok(gateway)
    }

    /// Resolve public addresses, retrying while IPv6 is still missing.
    async fn resolve_addresses(&self, vpc_id: &VpcId) -> PublicAddresses {
        let mut addresses = PublicAddresses::default();
        for attempt in 0..self.settings.address_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.address_backoff).await;
            }
            match self.deps.resolver.public_addresses().await {
                Ok(found) => {
                    addresses = found;
                    if found.ipv6.is_some() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(vpc_id = %vpc_id, attempt, error = %e, "Failed to get public address")
                }
            }
        }
        addresses
    }

    fn observe_disconnected(&self, vpc_id: VpcId, down: Vec<String>) -> Vec<String> {
        let now = tokio::time::Instant::now().into_std();
        let grace = self.settings.link_grace;
        guard(&self.trackers)
            .entry(vpc_id)
            .or_insert_with(|| DisconnectTracker::new(grace))
            .observe(down, now)
    }

    async fn sweep(self: &Arc<Self>, desired: &Desired) -> Result<()> {
        for iface in self.deps.host.interfaces().await? {
            if !is_virt_iface(&iface) || desired.virt_ifaces.contains(&iface) {
                continue;
            }
            info!(iface = %iface, "Removing orphaned virtual interface");
            if let Err(e) = self.deps.host.delete_interface(&iface).await {
                warn!(iface = %iface, error = %e, "Failed to remove virtual interface");
            }
        }

        for namespace in self.deps.host.namespaces().await? {
            if !is_link_namespace(&namespace) || desired.namespaces.contains(&namespace) {
                continue;
            }
            // marked namespaces are removed by remove_vpc once tunnels are down
            let marker = self.paths.vpc_marker_path(&namespace);
            if tokio::fs::try_exists(&marker)
                .await
                .map_err(|e| AgentError::io(&marker, e))?
            {
                continue;
            }
            info!(namespace = %namespace, "Removing orphaned namespace");
            self.deps.host.delete_namespace(&namespace).await?;
        }

        self.sweep_namespace_dirs(desired).await?;
        self.sweep_dhclients(desired).await
    }

    async fn sweep_namespace_dirs(self: &Arc<Self>, desired: &Desired) -> Result<()> {
        let netns_dir = self.paths.netns_dir();
        for name in list_dir(netns_dir, true).await? {
            if !is_link_namespace(&name) || desired.namespaces.contains(&name) {
                continue;
            }

            let marker = self.paths.vpc_marker_path(&name);
            let raw = match tokio::fs::read_to_string(&marker).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AgentError::io(&marker, e)),
            };
            let vpc_id: VpcId = raw
                .trim()
                .parse()
                .map_err(|e| AgentError::Parse(format!("{}: {e}", marker.display())))?;

            let this = Arc::clone(self);
            self.spawn(async move { this.remove_vpc(vpc_id).await });
        }
        Ok(())
    }

    async fn sweep_dhclients(&self, desired: &Desired) -> Result<()> {
        let run_dir = self.paths.run_dir();
        for name in list_dir(run_dir, false).await? {
            let Some(iface) = dhclient_pid_file_iface(&name) else {
                continue;
            };
            if desired.external_ifaces.contains(iface) {
                continue;
            }

            let path = run_dir.join(&name);
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| AgentError::io(&path, e))?;
            let pid: i32 = raw
                .trim()
                .parse()
                .map_err(|e| AgentError::Parse(format!("{}: {e}", path.display())))?;

            if pid <= 0 {
                warn!(path = %path.display(), pid, "Invalid DHCP client pid, removing pid file");
                remove_path(&path).await?;
            } else if self.deps.host.process_alive(pid) {
                info!(iface = %iface, pid, "Killing orphaned DHCP client");
                if let Err(e) = self.deps.host.kill_process(pid) {
                    warn!(pid, error = %e, "Failed to kill DHCP client");
                }
            } else {
                remove_path(&path).await?;
            }
        }
        Ok(())
    }
}

/// Names of entries in `dir` that are directories (`dirs`) or files (`!dirs`).
///
/// A missing directory has no entries.
async fn list_dir(dir: &Path, dirs: bool) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AgentError::io(dir, e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AgentError::io(dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| AgentError::io(entry.path(), e))?;
        if file_type.is_dir() == dirs {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}
