//! Node addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The address of one cluster node.
///
/// Pools are keyed by address: two slot ranges served by the same
/// `{host, port}` share one pool, and a topology rebuild reuses the pool
/// of any address that is still present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Error parsing a `host:port` string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid node address '{0}': expected host:port")]
pub struct AddrParseError(String);

impl FromStr for NodeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // split on the last ':' so IPv6-style hosts with colons still parse
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError(s.to_owned()))?;
        if host.is_empty() {
            return Err(AddrParseError(s.to_owned()));
        }
        let port: u16 = port.parse().map_err(|_| AddrParseError(s.to_owned()))?;
        Ok(Self::new(host, port))
    }
}
