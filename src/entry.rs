//! Service entry published to the registry.

use std::fmt;
use std::str::FromStr;

use iroh::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{is_stat_bearing, Config};
use crate::error::Error;

/// Address of a service: node identity plus listening port.
///
/// Rendered as `<hex public key>:<port>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    /// Node identity.
    pub public_key: PublicKey,
    /// Service port.
    pub port: u16,
}

impl NodeAddress {
    /// Create an address.
    pub fn new(public_key: PublicKey, port: u16) -> Self {
        Self { public_key, port }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.public_key.as_bytes()), self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pk, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::protocol(format!("address {s:?} has no port")))?;
        let port = port
            .parse()
            .map_err(|e| Error::protocol(format!("address {s:?}: bad port: {e}")))?;

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(pk, &mut bytes)
            .map_err(|e| Error::protocol(format!("address {s:?}: bad public key: {e}")))?;
        let public_key = PublicKey::from_bytes(&bytes)
            .map_err(|e| Error::protocol(format!("address {s:?}: bad public key: {e}")))?;

        Ok(Self { public_key, port })
    }
}

impl Serialize for NodeAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Live statistics of a stat-bearing service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of clients currently connected to the service.
    pub connected_clients: i64,
}

/// A record in the discovery registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    /// Where the service can be reached.
    pub address: NodeAddress,
    /// Live statistics, present only for stat-bearing service types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
    /// Service type tag.
    #[serde(rename = "type")]
    pub service_type: String,
    /// Build version of the publishing node.
    pub version: String,
}

impl ServiceEntry {
    /// Initial local entry for a config.
    pub fn from_config(conf: &Config) -> Self {
        let stats = is_stat_bearing(conf.service_type()).then(Stats::default);
        Self {
            address: NodeAddress::new(conf.public_key(), conf.port()),
            stats,
            service_type: conf.service_type().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
