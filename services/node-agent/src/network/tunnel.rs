//! IPsec tunnels between sites.
//!
//! A VPC lists link URIs of the form
//! `ipsec://<psk>@<host>[:port]?ipv6=<addr>&subnets=<cidr,..>&ike=..&esp=..`.
//! Each URI becomes one [`LinkState`] (one peer) holding a [`TunnelLink`] per
//! address family both sides can use. The configuration is rendered into the
//! namespace's `/etc/netns/<ns>` directory, which `ip netns exec` overlays on
//! `/etc` for the daemon running inside it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use meshvisor_id::VpcId;
use meshvisor_networking::link_namespace;
use meshvisor_reconcile::ContentHash;
use reqwest::Url;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::address::PublicAddresses;
use super::host::ignore_missing;
use crate::command::{self, run_in_namespace};
use crate::error::{AgentError, Result};
use crate::model::Vpc;
use crate::paths::{write_file, NodePaths};

const DEFAULT_IKE: &str = "aes256-sha256-modp2048";
const DEFAULT_ESP: &str = "aes256-sha256";
const DEFAULT_REMOTE_SUBNETS: &str = "0.0.0.0/0";

/// Parsed link URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUri {
    pub psk: String,
    pub host: String,
    pub port: Option<u16>,
    /// Peer IPv6 endpoint when the host is not itself an IPv6 literal.
    pub ipv6: Option<String>,
    pub params: BTreeMap<String, String>,
}

impl LinkUri {
    fn host_is_ipv6(&self) -> bool {
        matches!(self.host.parse::<IpAddr>(), Ok(IpAddr::V6(_)))
    }

    /// Stable peer identifier, independent of the secret.
    pub fn peer_id(&self) -> String {
        let key = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };
        let digest = Sha256::digest(key.as_bytes());
        hex::encode(&digest[..6])
    }
}

pub fn parse_link_uri(raw: &str) -> Result<LinkUri> {
    let url = Url::parse(raw).map_err(|e| AgentError::Parse(format!("link uri: {e}")))?;
    if url.scheme() != "ipsec" {
        return Err(AgentError::Parse(format!(
            "link uri: unsupported scheme {}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AgentError::Parse("link uri: missing host".to_string()))?;

    if url.username().is_empty() {
        return Err(AgentError::Parse("link uri: missing pre-shared key".to_string()));
    }

    let mut params: BTreeMap<String, String> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let ipv6 = params.remove("ipv6");

    Ok(LinkUri {
        psk: url.username().to_string(),
        host,
        port: url.port(),
        ipv6,
        params,
    })
}

/// One tunnel leg between the local node and a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelLink {
    /// Connection name, `"{peer}-{leg}"`.
    pub name: String,
    pub left: IpAddr,
    pub right: String,
    pub psk: String,
    pub local_subnet: String,
    pub remote_subnets: String,
    pub ike: String,
    pub esp: String,
}

/// Desired state for one peer, with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub id: String,
    pub links: Vec<TunnelLink>,
    pub hash: ContentHash,
}

impl LinkState {
    pub fn new(id: String, links: Vec<TunnelLink>) -> Self {
        let hash = ContentHash::from_json(&serde_json::json!({
            "id": id,
            "links": links,
        }));
        Self { id, links, hash }
    }
}

/// Compute the desired per-peer states for a VPC.
///
/// Output is sorted by peer so identical inputs hash identically.
pub fn link_states(vpc: &Vpc, local: &PublicAddresses) -> Result<Vec<LinkState>> {
    let mut states = Vec::with_capacity(vpc.link_uris.len());

    for raw in &vpc.link_uris {
        let uri = parse_link_uri(raw)?;
        let id = uri.peer_id();

        let mut ends: Vec<(IpAddr, String)> = Vec::new();
        if let Some(v4) = local.ipv4 {
            if !uri.host_is_ipv6() {
                ends.push((IpAddr::V4(v4), uri.host.clone()));
            }
        }
        if let Some(v6) = local.ipv6 {
            let right = if uri.host_is_ipv6() {
                Some(uri.host.clone())
            } else {
                uri.ipv6.clone()
            };
            if let Some(right) = right {
                ends.push((IpAddr::V6(v6), right));
            }
        }

        if ends.is_empty() {
            debug!(vpc_id = %vpc.id, peer = %id, "No usable address family for peer");
            continue;
        }

        let param = |key: &str, default: &str| {
            uri.params
                .get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let links = ends
            .into_iter()
            .enumerate()
            .map(|(i, (left, right))| TunnelLink {
                name: format!("{id}-{i}"),
                left,
                right,
                psk: uri.psk.clone(),
                local_subnet: vpc.network.clone(),
                remote_subnets: param("subnets", DEFAULT_REMOTE_SUBNETS),
                ike: param("ike", DEFAULT_IKE),
                esp: param("esp", DEFAULT_ESP),
            })
            .collect();

        states.push(LinkState::new(id, links));
    }

    states.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(states)
}

/// Tunnel daemon control for one VPC namespace.
#[async_trait]
pub trait TunnelSubsystem: Send + Sync {
    async fn desired_states(
        &self,
        vpc: &Vpc,
        addresses: &PublicAddresses,
    ) -> Result<Vec<LinkState>> {
        link_states(vpc, addresses)
    }

    /// Push the full desired state and restart the daemon.
    async fn deploy(&self, vpc: &VpcId, states: &[LinkState]) -> Result<()>;

    /// Stop the daemon. A namespace that is already gone is not an error.
    async fn teardown(&self, vpc: &VpcId) -> Result<()>;

    /// Subset of `names` whose tunnel is currently down.
    async fn disconnected(&self, vpc: &VpcId, names: &[String]) -> Result<Vec<String>>;
}

/// Tunnels managed by the `ipsec` tool inside each namespace.
#[derive(Debug, Clone)]
pub struct IpsecTunnels {
    paths: NodePaths,
}

impl IpsecTunnels {
    pub fn new(paths: NodePaths) -> Self {
        Self { paths }
    }
}

const CONFIG_HEADER: &str = "config setup
    uniqueids=no

conn %default
    keyexchange=ikev2
    authby=secret
    auto=start
    dpdaction=restart
";

pub(crate) fn render_config(states: &[LinkState]) -> String {
    let mut out = String::from(CONFIG_HEADER);
    for link in states.iter().flat_map(|s| &s.links) {
        out.push_str(&format!("\nconn {}\n", link.name));
        for (key, value) in [
            ("left", link.left.to_string()),
            ("leftsubnet", link.local_subnet.clone()),
            ("right", link.right.clone()),
            ("rightsubnet", link.remote_subnets.clone()),
            ("ike", link.ike.clone()),
            ("esp", link.esp.clone()),
        ] {
            out.push_str(&format!("    {key}={value}\n"));
        }
    }
    out
}

pub(crate) fn render_secrets(states: &[LinkState]) -> String {
    states
        .iter()
        .flat_map(|s| &s.links)
        .map(|link| format!("{} {} : PSK \"{}\"\n", link.left, link.right, link.psk))
        .collect()
}

/// Connection names with an installed child SA in `ipsec status` output.
pub(crate) fn parse_connected(status: &str) -> Vec<String> {
    status
        .lines()
        .filter(|line| line.contains("INSTALLED"))
        .filter_map(|line| {
            let name = line.trim_start().split('{').next()?;
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

#[async_trait]
impl TunnelSubsystem for IpsecTunnels {
    async fn deploy(&self, vpc: &VpcId, states: &[LinkState]) -> Result<()> {
        let ns = link_namespace(vpc, 0);
        let dir = self.paths.namespace_dir(&ns);

        info!(vpc_id = %vpc, namespace = %ns, peers = states.len(), "Deploying tunnels");

        write_file(&dir.join("ipsec.conf"), render_config(states)).await?;
        write_file(&dir.join("ipsec.secrets"), render_secrets(states)).await?;
        run_in_namespace(&ns, "ipsec", &["restart"]).await?;
        Ok(())
    }

    async fn teardown(&self, vpc: &VpcId) -> Result<()> {
        let ns = link_namespace(vpc, 0);
        ignore_missing(run_in_namespace(&ns, "ipsec", &["stop"]).await)
    }

    async fn disconnected(&self, vpc: &VpcId, names: &[String]) -> Result<Vec<String>> {
        let ns = link_namespace(vpc, 0);
        let out = command::output("ip", &["netns", "exec", &ns, "ipsec", "status"]).await?;
        if !out.success {
            debug!(namespace = %ns, stderr = %out.stderr, "Tunnel daemon not answering");
            return Ok(names.to_vec());
        }
        let connected = parse_connected(&out.stdout);
        Ok(names
            .iter()
            .filter(|name| !connected.contains(name))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn addresses(v4: bool, v6: bool) -> PublicAddresses {
        PublicAddresses {
            ipv4: v4.then(|| Ipv4Addr::new(198, 51, 100, 10)),
            ipv6: v6.then(|| "2001:db8::10".parse::<Ipv6Addr>().unwrap()),
        }
    }

    fn vpc(uris: &[&str]) -> Vpc {
        let mut vpc = Vpc::new(VpcId::new(), "prod", "10.20.0.0/16");
        vpc.link_uris = uris.iter().map(|s| s.to_string()).collect();
        vpc
    }

    #[test]
    fn test_parse_link_uri() {
        let uri =
            parse_link_uri("ipsec://s3cret@203.0.113.7:4500?ipv6=2001:db8::7&ike=aes128").unwrap();
        assert_eq!(uri.psk, "s3cret");
        assert_eq!(uri.host, "203.0.113.7");
        assert_eq!(uri.port, Some(4500));
        assert_eq!(uri.ipv6.as_deref(), Some("2001:db8::7"));
        assert_eq!(uri.params.get("ike").map(String::as_str), Some("aes128"));
    }

    #[test]
    fn test_parse_link_uri_rejects_bad_input() {
        assert!(parse_link_uri("https://k@host").is_err());
        assert!(parse_link_uri("ipsec://host").is_err());
        assert!(parse_link_uri("not a uri").is_err());
    }

    #[test]
    fn test_ipv6_literal_host() {
        let uri = parse_link_uri("ipsec://k@[2001:db8::9]").unwrap();
        assert_eq!(uri.host, "2001:db8::9");
        let uris = ["ipsec://k@[2001:db8::9]"];
        let states = link_states(&vpc(&uris), &addresses(true, true)).unwrap();
        assert_eq!(states[0].links.len(), 1);
        assert!(states[0].links[0].left.is_ipv6());
    }

    #[test]
    fn test_legs_per_address_family() {
        let vpc = vpc(&["ipsec://k@203.0.113.7?ipv6=2001:db8::7"]);

        let both = link_states(&vpc, &addresses(true, true)).unwrap();
        assert_eq!(both.len(), 1);
        let names: Vec<_> = both[0].links.iter().map(|l| l.name.as_str()).collect();
        let id = &both[0].id;
        assert_eq!(names, vec![format!("{id}-0"), format!("{id}-1")]);

        let v4_only = link_states(&vpc, &addresses(true, false)).unwrap();
        assert_eq!(v4_only[0].links.len(), 1);
        assert_ne!(v4_only[0].hash, both[0].hash);
    }

    #[test]
    fn test_states_hash_is_order_independent() {
        let a = "ipsec://k1@203.0.113.7";
        let b = "ipsec://k2@203.0.113.8";
        let mut first = vpc(&[a, b]);
        let second_states = {
            let mut v = first.clone();
            v.link_uris = vec![b.to_string(), a.to_string()];
            link_states(&v, &addresses(true, false)).unwrap()
        };
        let first_states = link_states(&first, &addresses(true, false)).unwrap();
        assert_eq!(first_states, second_states);

        first.link_uris.pop();
        assert_ne!(link_states(&first, &addresses(true, false)).unwrap(), first_states);
    }

    const PEER: &str =
        "ipsec://k1@203.0.113.7:500?ike=aes128-sha256-modp2048&esp=aes128-sha256&subnets=10.9.0.0/16";
    const NEIGHBOUR: &str = "ipsec://k2@203.0.113.8?ipv6=2001:db8::8";

    fn combined(states: &[LinkState]) -> ContentHash {
        ContentHash::combine(states.iter().map(|s| &s.hash))
    }

    #[rstest]
    #[case::psk(PEER.replacen("k1@", "k9@", 1))]
    #[case::port(PEER.replacen(":500?", ":4500?", 1))]
    #[case::ike(PEER.replacen("ike=aes128", "ike=aes256", 1))]
    #[case::esp(PEER.replacen("esp=aes128", "esp=aes256", 1))]
    #[case::subnets(PEER.replacen("10.9.0.0/16", "10.8.0.0/16", 1))]
    fn test_single_peer_change_changes_hash(#[case] changed: String) {
        let local = addresses(true, true);
        let before = link_states(&vpc(&[PEER, NEIGHBOUR]), &local).unwrap();
        let again = link_states(&vpc(&[PEER, NEIGHBOUR]), &local).unwrap();
        let after = link_states(&vpc(&[&changed, NEIGHBOUR]), &local).unwrap();

        assert_eq!(combined(&before), combined(&again));
        assert_ne!(combined(&before), combined(&after));

        let neighbour = parse_link_uri(NEIGHBOUR).unwrap().peer_id();
        let hash_of = |states: &[LinkState], same: bool| {
            states
                .iter()
                .find(|s| (s.id == neighbour) == same)
                .map(|s| s.hash.clone())
                .unwrap()
        };
        assert_eq!(hash_of(&before, true), hash_of(&after, true));
        assert_ne!(hash_of(&before, false), hash_of(&after, false));
    }

    #[test]
    fn test_render_config_and_secrets() {
        let uris = ["ipsec://k@203.0.113.7"];
        let states = link_states(&vpc(&uris), &addresses(true, false)).unwrap();
        let conf = render_config(&states);
        assert!(conf.contains(&format!("conn {}-0", states[0].id)));
        assert!(conf.contains("right=203.0.113.7"));
        assert!(conf.contains("leftsubnet=10.20.0.0/16"));
        let secrets = render_secrets(&states);
        assert_eq!(secrets, "198.51.100.10 203.0.113.7 : PSK \"k\"\n");
    }

    #[test]
    fn test_parse_connected() {
        let status = "\
Security Associations (2 up, 0 connecting):
  a1b2c3d4e5f6-0[3]: ESTABLISHED 5 minutes ago, 198.51.100.10...203.0.113.7
  a1b2c3d4e5f6-0{7}:  INSTALLED, TUNNEL, reqid 1, ESP SPIs: c1 c2
  ffeeddccbbaa-1[4]: CONNECTING, 198.51.100.10...203.0.113.8
";
        assert_eq!(parse_connected(status), vec!["a1b2c3d4e5f6-0"]);
    }
}
