//! Typed ID definitions for node-local resources.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(VmId, "vm");
define_id!(DiskId, "dsk");
define_id!(NodeId, "node");

// =============================================================================
// Networking
// =============================================================================

define_id!(VpcId, "vpc");
define_id!(SubnetId, "sub");
