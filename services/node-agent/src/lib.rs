//! Meshvisor Node Agent Library
//!
//! The node agent runs on each hypervisor host and converges it towards the
//! desired state held in the document store.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler (tick driver)
//! ├── VmController          (per-VM process lifecycle)
//! └── OverlayReconciler     (per-VPC namespace + tunnel convergence)
//!     └── LeasedLock        (one pass per VPC at a time)
//! ```
//!
//! Both sides share a [`cache::ResourceCache`] of last-known runtime facts.
//! Host interaction goes through the traits in [`runtime`] and [`network`];
//! [`mock::MockHost`] implements all of them for tests.
//!
//! ## Modules
//!
//! - `vm`: VM lifecycle controller, unit rendering, guest bootstrap
//! - `network`: TAP devices, overlay namespaces, tunnels, address discovery
//! - `state`: document store access and the SQLite implementation

pub mod cache;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod mock;
pub mod model;
pub mod network;
pub mod paths;
pub mod reconciler;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod systemd;
pub mod vm;

// Re-export commonly used types
pub use cache::ResourceCache;
pub use config::{Config, TimingConfig};
pub use error::{AgentError, Result};
pub use mock::{HostCall, MockHost};
pub use model::{Disk, DiskAttachment, NetworkAdapter, VirtualMachine, VmAction, VmState, Vpc};
pub use network::{OverlayDeps, OverlayReconciler, OverlaySettings, PassOutcome};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use shutdown::Interrupt;
pub use state::{DocumentStore, SqliteStore, StoreError};
pub use vm::{LifecycleSettings, VmController, VmDeps};
