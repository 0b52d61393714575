//! Networking utilities for the node agent.
//!
//! This library provides helpers for:
//! - Deterministic names for the namespaces, virtual interfaces, and DHCP
//!   client artifacts that back a VPC overlay
//! - IPv4 network parsing and gateway derivation for a VPC
//! - IPv6 prefix math for the derived secondary-family gateway

mod naming;
mod prefix;

pub use naming::{
    dhclient_pid_file, dhclient_pid_file_iface, is_external_iface, is_link_namespace,
    is_virt_iface, link_external_iface, link_namespace, link_virt_iface, vpc_bridge,
    LINK_NAME_LEN,
};
pub use prefix::{derived_ipv6_gateway, Ipv4Network, Ipv6Prefix, VpcGateway};

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Network too small to hold a gateway.
    #[error("network {0} has no usable host addresses")]
    NoHosts(String),
}
