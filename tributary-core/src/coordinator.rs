//! Discovery of the brokers that serve a stream.

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{Error, Result};

/// Brokers resolved by a [Coordinator].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub brokers: Vec<SocketAddr>,
}

/// Coordinator resolves a list of coordination service addresses into a broker [Topology].
/// Failures are reported as [Error::PartitionUnavailable], since without a topology no
/// partition can be read.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn connect(&self, addresses: &[String]) -> Result<Topology>;
}

/// StaticCoordinator treats the configured addresses as the brokers themselves and only resolves
/// them through DNS.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticCoordinator;

impl StaticCoordinator {
    pub fn new() -> Self {
        Self
    }
}

/// Splits a comma separated address list such as `"zk-1:2181,zk-2:2181"`.
pub fn parse_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Coordinator for StaticCoordinator {
    async fn connect(&self, addresses: &[String]) -> Result<Topology> {
        if addresses.is_empty() {
            return Err(Error::Config(
                "at least one coordinator address is required".to_string(),
            ));
        }

        let mut brokers = Vec::new();
        for address in addresses {
            if !address.contains(':') {
                return Err(Error::Config(format!(
                    "coordinator address {address:?} must be in host:port form"
                )));
            }
            let resolved = tokio::net::lookup_host(address.as_str())
                .await
                .map_err(|e| {
                    Error::PartitionUnavailable(format!("resolving coordinator {address}: {e}"))
                })?;
            for addr in resolved {
                debug!(%address, %addr, "Resolved coordinator address");
                if !brokers.contains(&addr) {
                    brokers.push(addr);
                }
            }
        }

        if brokers.is_empty() {
            return Err(Error::PartitionUnavailable(format!(
                "no brokers resolved from {addresses:?}"
            )));
        }
        info!(brokers = ?brokers, "Connected to coordinator");
        Ok(Topology { brokers })
    }
}
