//! Public address discovery for tunnel endpoints.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::Config;
use crate::error::{AgentError, Result};

/// Public addresses of this node. Either family may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublicAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl PublicAddresses {
    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Source of the node's public addresses.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn public_addresses(&self) -> Result<PublicAddresses>;
}

/// Static addresses from configuration, filled in from a metadata service.
#[derive(Debug, Clone)]
pub struct PublicAddressResolver {
    configured: PublicAddresses,
    metadata_url: Option<String>,
    client: reqwest::Client,
}

impl PublicAddressResolver {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(|e| AgentError::Fatal(format!("http client: {e}")))?;

        Ok(Self {
            configured: PublicAddresses {
                ipv4: config.public_ipv4,
                ipv6: config.public_ipv6,
            },
            metadata_url: config
                .metadata_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            client,
        })
    }

    async fn fetch<T>(&self, base: &str, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let url = format!("{base}/{key}");
        debug!(url = %url, "Querying metadata service");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(format!("{url}: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "{url}: status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Unreachable(format!("{url}: {e}")))?;
        let body = body.trim();
        if body.is_empty() {
            return Ok(None);
        }
        body.parse()
            .map(Some)
            .map_err(|e| AgentError::Parse(format!("{key}: {e}")))
    }
}

#[async_trait]
impl AddressResolver for PublicAddressResolver {
    async fn public_addresses(&self) -> Result<PublicAddresses> {
        let mut addresses = self.configured;
        let Some(base) = self.metadata_url.as_deref() else {
            return Ok(addresses);
        };

        if addresses.ipv4.is_none() {
            addresses.ipv4 = self.fetch(base, "public-ipv4").await?;
        }
        if addresses.ipv6.is_none() {
            addresses.ipv6 = self.fetch(base, "public-ipv6").await?;
        }
        Ok(addresses)
    }
}
