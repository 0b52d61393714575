//! VM lifecycle on this node.

mod bootstrap;
mod lifecycle;
mod unit;

pub use bootstrap::FileBootstrap;
pub use lifecycle::{LifecycleSettings, VmController, VmDeps};
pub use unit::{render_unit, write_firmware_vars, UnitTemplate};
