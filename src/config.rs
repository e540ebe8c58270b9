//! Device configuration.
//!
//! Every field has a default, so a JSON document only needs the values it
//! changes:
//!
//! ```json
//! { "naming": { "grace_ms": 500 }, "liveness_timeout_ms": 4000 }
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::LoopbackNetwork;
use crate::{Error, Result};

/// Default multicast group and port of the bus.
pub const DEFAULT_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 3), 7570);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Udp {
        #[serde(default = "default_group")]
        group: SocketAddrV4,
        #[serde(default)]
        interface: Option<Ipv4Addr>,
        #[serde(default = "default_ttl")]
        ttl: u32,
    },
    /// In-process network supplied with [`DeviceConfig::with_network`].
    Loopback,
}

fn default_group() -> SocketAddrV4 {
    DEFAULT_GROUP
}

fn default_ttl() -> u32 {
    1
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Udp { group: DEFAULT_GROUP, interface: None, ttl: 1 }
    }
}

/// Name collision resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// How long a proposed name must go unchallenged.
    pub grace_ms: u64,
    /// Wait after a collision before proposing the next ordinal.
    pub backoff_ms: u64,
    /// Proposals before giving up with `NameResolutionFailed`.
    pub max_attempts: u32,
    pub initial_ordinal: u32,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self { grace_ms: 2000, backoff_ms: 500, max_attempts: 32, initial_ordinal: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: TransportConfig,
    pub naming: NamingConfig,
    /// Period of `/sync` heartbeats and map renegotiation.
    pub announce_interval_ms: u64,
    /// Peers silent for longer are dropped from the graph.
    pub liveness_timeout_ms: u64,
    pub subscription_lease_ms: u64,
    #[serde(skip)]
    network: Option<LoopbackNetwork>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            naming: NamingConfig::default(),
            announce_interval_ms: 1000,
            liveness_timeout_ms: 10_000,
            subscription_lease_ms: 10_000,
            network: None,
        }
    }
}

impl DeviceConfig {
    /// Attach to an in-process network instead of real sockets.
    pub fn with_network(mut self, network: &LoopbackNetwork) -> Self {
        self.transport = TransportConfig::Loopback;
        self.network = Some(network.clone());
        self
    }

    pub fn network(&self) -> Option<&LoopbackNetwork> {
        self.network.as_ref()
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.announce_interval_ms == 0 {
            return Err(Error::Config("announce_interval_ms must be positive".into()));
        }
        if self.liveness_timeout_ms <= self.announce_interval_ms {
            return Err(Error::Config("liveness_timeout_ms must exceed announce_interval_ms".into()));
        }
        if self.naming.max_attempts == 0 {
            return Err(Error::Config("naming.max_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn subscription_lease(&self) -> Duration {
        Duration::from_millis(self.subscription_lease_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = DeviceConfig::from_json_str(r#"{ "naming": { "grace_ms": 250 }, "liveness_timeout_ms": 3000 }"#).unwrap();
        assert_eq!(c.naming.grace_ms, 250);
        assert_eq!(c.naming.backoff_ms, 500);
        assert_eq!(c.liveness_timeout_ms, 3000);
        assert_eq!(c.transport, TransportConfig::default());
    }

    #[test]
    fn test_transport_variants() {
        let c = DeviceConfig::from_json_str(r#"{ "transport": { "kind": "udp", "ttl": 4 } }"#).unwrap();
        assert_eq!(c.transport, TransportConfig::Udp { group: DEFAULT_GROUP, interface: None, ttl: 4 });
        let c = DeviceConfig::from_json_str(r#"{ "transport": { "kind": "loopback" } }"#).unwrap();
        assert_eq!(c.transport, TransportConfig::Loopback);
        assert!(c.network().is_none());
    }

    #[test]
    fn test_invalid_timing_rejected() {
        let err = DeviceConfig::from_json_str(r#"{ "announce_interval_ms": 5000, "liveness_timeout_ms": 1000 }"#);
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(matches!(DeviceConfig::from_json_str("{ nope"), Err(Error::Json(_))));
    }

    #[test]
    fn test_with_network_switches_transport() {
        let net = LoopbackNetwork::new();
        let c = DeviceConfig::default().with_network(&net);
        assert_eq!(c.transport, TransportConfig::Loopback);
        assert!(c.network().is_some());
    }
}
