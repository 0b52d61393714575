//! Deterministic names for overlay kernel objects.
//!
//! Every name is exactly [`LINK_NAME_LEN`] characters: a class letter, twelve
//! hex characters derived from the VPC ID, and a one-digit path index. The
//! sweep relies on this shape to recognise objects it owns, so the format is
//! part of the on-host contract and must not change.

use meshvisor_id::VpcId;
use sha2::{Digest, Sha256};

/// Length of every namespace and interface name produced here.
pub const LINK_NAME_LEN: usize = 14;

const NAMESPACE_PREFIX: char = 'x';
const VIRT_PREFIX: char = 'y';
const EXTERNAL_PREFIX: char = 'z';
const BRIDGE_PREFIX: char = 'b';

const DHCLIENT_PREFIX: &str = "dhclient-";
const DHCLIENT_SUFFIX: &str = ".pid";

fn vpc_digest(vpc_id: &VpcId) -> String {
    let digest = Sha256::digest(vpc_id.to_string().as_bytes());
    hex::encode(&digest[..6])
}

fn link_name(prefix: char, vpc_id: &VpcId, index: u8) -> String {
    format!("{}{}{}", prefix, vpc_digest(vpc_id), index % 10)
}

/// Network namespace holding a VPC's tunnel endpoint.
pub fn link_namespace(vpc_id: &VpcId, index: u8) -> String {
    link_name(NAMESPACE_PREFIX, vpc_id, index)
}

/// Virtual interface paired with the namespace, one per address-family leg.
pub fn link_virt_iface(vpc_id: &VpcId, index: u8) -> String {
    link_name(VIRT_PREFIX, vpc_id, index)
}

/// External-facing interface whose address is leased by a DHCP client.
pub fn link_external_iface(vpc_id: &VpcId, index: u8) -> String {
    link_name(EXTERNAL_PREFIX, vpc_id, index)
}

/// Host bridge joining a VPC's VM taps and the namespace's virtual pair.
pub fn vpc_bridge(vpc_id: &VpcId) -> String {
    link_name(BRIDGE_PREFIX, vpc_id, 0)
}

fn has_shape(name: &str, prefix: char) -> bool {
    name.len() == LINK_NAME_LEN && name.starts_with(prefix)
}

pub fn is_link_namespace(name: &str) -> bool {
    has_shape(name, NAMESPACE_PREFIX)
}

pub fn is_virt_iface(name: &str) -> bool {
    has_shape(name, VIRT_PREFIX)
}

pub fn is_external_iface(name: &str) -> bool {
    has_shape(name, EXTERNAL_PREFIX)
}

/// File name of the DHCP client pid file for an external interface.
pub fn dhclient_pid_file(iface: &str) -> String {
    format!("{DHCLIENT_PREFIX}{iface}{DHCLIENT_SUFFIX}")
}

/// Extract the external interface from a DHCP client pid file name.
///
/// Returns `None` for anything that is not one of ours.
pub fn dhclient_pid_file_iface(file_name: &str) -> Option<&str> {
    if file_name.len() != DHCLIENT_PREFIX.len() + LINK_NAME_LEN + DHCLIENT_SUFFIX.len() {
        return None;
    }
    let iface = file_name
        .strip_prefix(DHCLIENT_PREFIX)?
        .strip_suffix(DHCLIENT_SUFFIX)?;
    is_external_iface(iface).then_some(iface)
}
