//! Node addressing and identity.
//!
//! A cluster member is reached through an [`Address`]. Pollers and the
//! registry key everything by a [`NodeId`], which is derived from the
//! resolved address so that two spellings of the same endpoint collapse
//! onto one node.

use crate::error::{PollerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Latest metric reading for a node (entry count).
pub type MetricValue = u64;

/// Network endpoint of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    host: String,
    port: u16,
    ip: Option<IpAddr>,
}

impl Address {
    /// Creates an address from a host name and port.
    ///
    /// A host that is already an IP literal is treated as resolved.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let ip = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();
        Self { host, port, ip }
    }

    /// Host name as supplied.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Numeric address, if one is already known.
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            ip: Some(addr.ip()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(IpAddr::V6(_)) if !self.host.starts_with('[') => {
                write!(f, "[{}]:{}", self.host, self.port)
            }
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(sock.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address '{}'", s))?;
        if host.is_empty() {
            return Err(format!("missing host in address '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in address '{}': {}", s, e))?;
        Ok(Address::new(host, port))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

/// Stable identifier of a node, derived from its resolved address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps an already-derived identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest known state of one node, as exposed to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Derived node identifier.
    pub id: NodeId,
    /// Address the node was discovered under.
    pub address: Address,
    /// Last successfully fetched value; `None` until the first success.
    pub value: Option<MetricValue>,
    /// Wall-clock time of the last successful fetch, in ms since the epoch.
    pub updated_at_ms: Option<u64>,
}

impl NodeInfo {
    /// Creates an entry with an unknown value.
    pub fn new(id: NodeId, address: Address) -> Self {
        Self {
            id,
            address,
            value: None,
            updated_at_ms: None,
        }
    }

    pub(crate) fn record(&mut self, value: MetricValue) {
        self.value = Some(value);
        self.updated_at_ms = Some(now_ms());
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Turns host names into numeric addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolves `host` to a single IP address.
    async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolver backed by the operating system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PollerError::Resolution {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        addrs
            .next()
            .map(|sock| sock.ip())
            .ok_or_else(|| PollerError::Resolution {
                host: host.to_string(),
                reason: "no addresses returned".to_string(),
            })
    }
}

/// Derives the [`NodeId`] for `addr`.
///
/// The canonical form is the resolved IP address text followed by the
/// port; every non-digit character is replaced with `-`. Addresses that
/// resolve to the same IP and port yield the same id. Resolution is only
/// attempted when the address carries no numeric IP.
///
/// The id is built from the IP, not the host's canonical name: a name
/// would collapse to dashes only, so distinct hosts could share an id.
pub async fn derive_node_id(addr: &Address, resolver: &dyn HostResolver) -> Result<NodeId> {
    let ip = match addr.ip() {
        Some(ip) => ip,
        None => resolver.resolve(addr.host()).await?,
    };
    Ok(node_id_for(ip, addr.port()))
}

fn node_id_for(ip: IpAddr, port: u16) -> NodeId {
    let raw = format!("{}-{}", ip, port);
    NodeId(
        raw.chars()
            .map(|c| if c.is_ascii_digit() { c } else { '-' })
            .collect(),
    )
}
