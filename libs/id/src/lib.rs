//! # meshvisor-id
//!
//! Typed identifiers for the resources a node agent touches.
//!
//! Every ID renders as `{prefix}_{ulid}`, for example
//! `vm_01HV4Z4NYPLTRS0JTUA8XDME5F` or `vpc_01HV4Z3MXNKPQR9HSTZ7WCLD4E`.
//! The prefix keeps a `VmId` from being passed where a `VpcId` is expected,
//! and the rendered form is what kernel object names and store keys are
//! derived from, so it must stay stable across releases.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
