//! Identifiers shared across the network.
//!
//! Ids that travel between processes are derived from names with a stable
//! hash, so every peer computes the same id for the same device or instance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// First eight bytes of SHA-256 over the concatenated parts.
pub(crate) fn stable_hash(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Device identifier: a 32-bit name hash in the upper half, leaving the
/// lower half for per-device counters (see [`MapId::compose`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub fn for_name(name: &str) -> Self {
        DeviceId(stable_hash(&[name.as_bytes()]) & 0xFFFF_FFFF_0000_0000)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Map identifier, unique per creating device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapId(pub u64);

impl MapId {
    pub fn compose(creator: DeviceId, counter: u32) -> Self {
        MapId(creator.0 | counter as u64)
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Local instance identifier on a signal. Instance 0 is the default
/// (singleton) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub const DEFAULT: InstanceId = InstanceId(0);

    /// Network-wide id for this instance as originated by `device`.
    pub fn global(self, device: &str) -> u64 {
        stable_hash(&[device.as_bytes(), &self.0.to_be_bytes()])
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified signal name: `device/signal`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalPath {
    pub device: String,
    pub signal: String,
}

impl SignalPath {
    pub fn new(device: impl Into<String>, signal: impl Into<String>) -> Self {
        Self { device: device.into(), signal: signal.into() }
    }
}

impl fmt::Display for SignalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.signal)
    }
}

impl FromStr for SignalPath {
    type Err = Error;

    /// Parses `dev.1/sig` (a leading `/` is accepted). Signal names may
    /// themselves contain `/`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix('/').unwrap_or(s);
        match s.split_once('/') {
            Some((dev, sig)) if !dev.is_empty() && !sig.is_empty() => Ok(SignalPath::new(dev, sig)),
            _ => Err(Error::NotFound(format!("malformed signal path '{s}'"))),
        }
    }
}

impl TryFrom<&str> for SignalPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_stable() {
        assert_eq!(DeviceId::for_name("synth.1"), DeviceId::for_name("synth.1"));
        assert_ne!(DeviceId::for_name("synth.1"), DeviceId::for_name("synth.2"));
        assert_eq!(DeviceId::for_name("synth.1").0 & 0xFFFF_FFFF, 0);
    }

    #[test]
    fn test_map_id_compose() {
        let dev = DeviceId::for_name("a.0");
        let id = MapId::compose(dev, 7);
        assert_eq!(id.0 & 0xFFFF_FFFF, 7);
        assert_eq!(id.0 & !0xFFFF_FFFF, dev.0);
    }

    #[test]
    fn test_signal_path_parse() {
        let p: SignalPath = "/src.0/out/left".parse().unwrap();
        assert_eq!(p.device, "src.0");
        assert_eq!(p.signal, "out/left");
        assert_eq!(p.to_string(), "src.0/out/left");
        assert!("nodevice".parse::<SignalPath>().is_err());
    }

    #[test]
    fn test_global_instance_differs_by_device() {
        let i = InstanceId(3);
        assert_ne!(i.global("a.0"), i.global("b.0"));
        assert_eq!(i.global("a.0"), InstanceId(3).global("a.0"));
    }
}
