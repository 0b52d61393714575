//! Meshvisor Node Agent
//!
//! Runs on each hypervisor host. Starts, stops and destroys the VMs scheduled
//! on this node and maintains the VPC overlay namespaces and site-to-site
//! tunnels this node carries.
//!
//! Shutdown is two-phase: the tick loop stops first, then after a grace
//! period the interrupt flag turns any lifecycle operation still in flight
//! into a no-op and outstanding overlay passes are awaited.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meshvisor_node_agent::config::Config;
use meshvisor_node_agent::control::SocketControl;
use meshvisor_node_agent::network::{
    IpHost, IpsecTunnels, OverlayDeps, OverlayReconciler, OverlaySettings, PublicAddressResolver,
    TapNetwork,
};
use meshvisor_node_agent::paths::NodePaths;
use meshvisor_node_agent::reconciler::{Reconciler, ReconcilerConfig};
use meshvisor_node_agent::shutdown::Interrupt;
use meshvisor_node_agent::state::{DocumentStore, SqliteStore};
use meshvisor_node_agent::systemd::SystemdUnits;
use meshvisor_node_agent::vm::{FileBootstrap, LifecycleSettings, VmController, VmDeps};
use meshvisor_node_agent::ResourceCache;
use meshvisor_reconcile::{AppliedHashes, LeasedLock};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time between stopping the tick loop and raising the interrupt flag.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for outstanding overlay passes at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        data_dir = %config.data_dir.display(),
        run_dir = %config.run_dir.display(),
        "Starting meshvisor node agent"
    );

    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let store: Arc<dyn DocumentStore> = Arc::new(
        SqliteStore::open(config.store_path()).context("opening document store")?,
    );

    let paths = NodePaths::new(&config);
    let interrupt = Interrupt::new();
    let cache = Arc::new(ResourceCache::new());

    let vms = Arc::new(VmController::new(
        LifecycleSettings::from_config(&config),
        paths.clone(),
        VmDeps {
            store: Arc::clone(&store),
            units: Arc::new(SystemdUnits::new()),
            control: Arc::new(SocketControl::new(paths.clone())),
            bootstrap: Arc::new(FileBootstrap::new(paths.clone())),
            network: Arc::new(TapNetwork::new()),
            cache: Arc::clone(&cache),
        },
        interrupt.clone(),
    ));

    let overlay = Arc::new(OverlayReconciler::new(
        OverlaySettings::from_config(&config),
        paths.clone(),
        OverlayDeps {
            store: Arc::clone(&store),
            host: Arc::new(IpHost::new()),
            tunnels: Arc::new(IpsecTunnels::new(paths.clone())),
            resolver: Arc::new(PublicAddressResolver::new(&config)?),
            cache: Arc::clone(&cache),
            locks: Arc::new(LeasedLock::new(config.lock_ttl)),
            applied: Arc::new(AppliedHashes::new()),
        },
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(Reconciler::new(
        config.node_id,
        Arc::clone(&store),
        vms,
        Arc::clone(&overlay),
        ReconcilerConfig::from_config(&config),
    ));
    let reconciler_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            } else {
                info!("Reconciler exited");
            }
        }
    }

    // Stop ticking
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    interrupt.raise();

    let drain = async {
        reconciler.wait_idle().await;
        overlay.wait_idle().await;
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Timed out waiting for outstanding operations");
    }

    info!("Node agent shutdown complete");
    Ok(())
}
