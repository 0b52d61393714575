//! Address math for VPC networks.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use meshvisor_id::VpcId;
use sha2::{Digest, Sha256};

use crate::NetworkError;

/// IPv4 network in CIDR form, stored masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Network {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        let bits = u32::from(address) & mask_v4(prefix_len);
        Ok(Self {
            address: Ipv4Addr::from(bits),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "10.97.0.0/16").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_v4(self.prefix_len) == u32::from(self.address)
    }

    /// First host address, used as the VPC gateway.
    pub fn first_host(&self) -> Result<Ipv4Addr, NetworkError> {
        if self.prefix_len >= 31 {
            return Err(NetworkError::NoHosts(self.to_string()));
        }
        Ok(Ipv4Addr::from(u32::from(self.address) + 1))
    }
}

impl std::fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    }
}

/// IPv6 prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Prefix {
    /// Base address of the prefix.
    pub address: Ipv6Addr,

    /// Prefix length (e.g., 64 for /64).
    pub prefix_len: u8,
}

impl Ipv6Prefix {
    pub fn new(address: Ipv6Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 128 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 128",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv6(address, prefix_len),
            prefix_len,
        })
    }

    /// Unique-local /64 derived from a VPC ID.
    pub fn for_vpc(vpc_id: &VpcId) -> Self {
        let digest = Sha256::digest(vpc_id.to_string().as_bytes());
        let mut octets = [0u8; 16];
        octets[0] = 0xfd;
        octets[1..6].copy_from_slice(&digest[..5]);
        Self {
            address: Ipv6Addr::from(octets),
            prefix_len: 64,
        }
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        mask_ipv6(addr, self.prefix_len) == self.address
    }

    /// Address inside this prefix with `host` as the low 32 bits.
    pub fn with_host(&self, host: u32) -> Ipv6Addr {
        let bits = u128::from_be_bytes(self.address.octets()) | u128::from(host);
        Ipv6Addr::from(bits.to_be_bytes())
    }
}

impl std::fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_ipv6(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    let bits = u128::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    };
    Ipv6Addr::from((bits & mask).to_be_bytes())
}

/// Secondary-family gateway: the IPv4 gateway embedded in the VPC's ULA /64.
pub fn derived_ipv6_gateway(vpc_id: &VpcId, ipv4_gateway: Ipv4Addr) -> Ipv6Addr {
    Ipv6Prefix::for_vpc(vpc_id).with_host(u32::from(ipv4_gateway))
}

/// Local gateway addresses for one VPC's overlay namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpcGateway {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub prefix_len: u8,
}

impl VpcGateway {
    pub fn for_vpc(vpc_id: &VpcId, network: &Ipv4Network) -> Result<Self, NetworkError> {
        let ipv4 = network.first_host()?;
        Ok(Self {
            ipv4,
            ipv6: derived_ipv6_gateway(vpc_id, ipv4),
            prefix_len: network.prefix_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_network_masks() {
        let net = Ipv4Network::from_cidr("10.97.3.9/16").unwrap();
        assert_eq!(net.address, Ipv4Addr::new(10, 97, 0, 0));
        assert_eq!(net.to_string(), "10.97.0.0/16");
        assert!(net.contains(Ipv4Addr::new(10, 97, 255, 1)));
        assert!(!net.contains(Ipv4Addr::new(10, 98, 0, 1)));
    }

    #[test]
    fn test_ipv4_gateway() {
        let net = Ipv4Network::from_cidr("10.97.0.0/16").unwrap();
        assert_eq!(net.first_host().unwrap(), Ipv4Addr::new(10, 97, 0, 1));
        let tiny = Ipv4Network::from_cidr("10.0.0.0/31").unwrap();
        assert!(matches!(tiny.first_host(), Err(NetworkError::NoHosts(_))));
    }

    #[test]
    fn test_ipv4_parse_errors() {
        assert!(matches!(
            Ipv4Network::from_cidr("10.0.0.0"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Network::from_cidr("10.0.0/8"),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            Ipv4Network::from_cidr("10.0.0.0/33"),
            Err(NetworkError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_ipv6_prefix() {
        let prefix = Ipv6Prefix::new("2001:db8::1".parse().unwrap(), 32).unwrap();
        assert_eq!(prefix.to_string(), "2001:db8::/32");
        assert!(prefix.contains("2001:db8:1::1".parse().unwrap()));
    }

    #[test]
    fn test_derived_gateway() {
        let vpc = VpcId::new();
        let net = Ipv4Network::from_cidr("10.97.0.0/16").unwrap();
        let gw = VpcGateway::for_vpc(&vpc, &net).unwrap();

        let prefix = Ipv6Prefix::for_vpc(&vpc);
        assert!(prefix.contains(gw.ipv6));
        assert_eq!(gw.ipv6.octets()[0], 0xfd);
        assert_eq!(&gw.ipv6.octets()[12..], &[10, 97, 0, 1]);
        assert_eq!(gw.prefix_len, 16);
        assert_eq!(VpcGateway::for_vpc(&vpc, &net).unwrap(), gw);
    }
}
