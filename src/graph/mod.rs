//! # Graph
//!
//! The locally replicated view of every device, signal and map on the
//! network, built purely from received announcements. Records are
//! immutable `Arc`s; an update replaces the record and fires an event.
//!
//! Mutation is crate-private and driven by the owning device's `poll`.
//! Applying an announcement is idempotent: identical data fires nothing,
//! changed data fires `Modified`, unseen data fires `Added`.

pub mod query;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde::Serialize;
use tracing::debug;

use crate::expr::Signature;
use crate::map::{MapMode, MapStatus, ProcessLocation};
use crate::model::{DeviceId, MapId, SignalPath, Timetag, Type, Value};
use crate::signal::Direction;

pub use query::{MapFilter, SignalFilter, Snapshot};

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub name: String,
    pub id: DeviceId,
    /// Where the device receives unicast messages.
    pub address: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalRecord {
    pub device: String,
    pub name: String,
    pub direction: Direction,
    pub ty: Type,
    pub len: usize,
    pub unit: Option<String>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub instances: u32,
    /// Latest value seen through a subscription.
    pub last_value: Option<(Value, Timetag)>,
}

impl SignalRecord {
    pub fn path(&self) -> SignalPath {
        SignalPath::new(&self.device, &self.name)
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.ty, self.len)
    }

    /// Same announced properties, ignoring `last_value`.
    fn same_definition(&self, other: &SignalRecord) -> bool {
        self.direction == other.direction
            && self.ty == other.ty
            && self.len == other.len
            && self.unit == other.unit
            && self.min == other.min
            && self.max == other.max
            && self.instances == other.instances
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapRecord {
    pub id: MapId,
    /// Device that created (and tears down) the map.
    pub creator: String,
    pub sources: Vec<SignalPath>,
    pub destinations: Vec<SignalPath>,
    pub source_types: Vec<Signature>,
    pub source_instances: Vec<u32>,
    pub destination_types: Vec<Signature>,
    pub mode: MapMode,
    /// `None` for raw maps.
    pub expression: Option<String>,
    pub muted: bool,
    pub location: ProcessLocation,
    /// Devices whose instance updates pass through the map.
    pub scopes: Vec<String>,
    pub status: MapStatus,
}

impl MapRecord {
    pub fn involves_device(&self, device: &str) -> bool {
        self.sources.iter().chain(&self.destinations).any(|p| p.device == device)
    }

    pub fn involves_signal(&self, path: &SignalPath) -> bool {
        self.sources.iter().chain(&self.destinations).any(|p| p == path)
    }

    /// Distinct endpoint device names, sources first.
    pub fn endpoint_devices(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in self.sources.iter().chain(&self.destinations) {
            if !out.contains(&p.device) {
                out.push(p.device.clone());
            }
        }
        out
    }

    pub fn destination_devices(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in &self.destinations {
            if !out.contains(&p.device) {
                out.push(p.device.clone());
            }
        }
        out
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphEventKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub enum GraphObject {
    Device(Arc<DeviceRecord>),
    Signal(Arc<SignalRecord>),
    Map(Arc<MapRecord>),
}

#[derive(Debug, Clone)]
pub struct GraphEvent {
    pub kind: GraphEventKind,
    pub object: GraphObject,
}

/// Which object types a graph handler wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMask(u8);

impl ObjectMask {
    pub const DEVICES: ObjectMask = ObjectMask(0b001);
    pub const SIGNALS: ObjectMask = ObjectMask(0b010);
    pub const MAPS: ObjectMask = ObjectMask(0b100);
    pub const ALL: ObjectMask = ObjectMask(0b111);

    pub fn matches(self, object: &GraphObject) -> bool {
        let bit = match object {
            GraphObject::Device(_) => Self::DEVICES,
            GraphObject::Signal(_) => Self::SIGNALS,
            GraphObject::Map(_) => Self::MAPS,
        };
        self.0 & bit.0 != 0
    }
}

impl std::ops::BitOr for ObjectMask {
    type Output = ObjectMask;

    fn bitor(self, rhs: ObjectMask) -> ObjectMask {
        ObjectMask(self.0 | rhs.0)
    }
}

pub type GraphHandler = Box<dyn FnMut(&GraphEvent) + Send>;

// ============================================================================
// Graph
// ============================================================================

/// Eventually-consistent replica of the network.
#[derive(Default)]
pub struct Graph {
    devices: HashMap<String, Arc<DeviceRecord>>,
    signals: HashMap<SignalPath, Arc<SignalRecord>>,
    maps: HashMap<MapId, Arc<MapRecord>>,
    last_seen: HashMap<String, Instant>,
    handlers: Vec<(ObjectMask, GraphHandler)>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn device(&self, name: &str) -> Option<Arc<DeviceRecord>> {
        self.devices.get(name).cloned()
    }

    pub fn signal(&self, path: &SignalPath) -> Option<Arc<SignalRecord>> {
        self.signals.get(path).cloned()
    }

    pub fn map(&self, id: MapId) -> Option<Arc<MapRecord>> {
        self.maps.get(&id).cloned()
    }

    /// All devices, sorted by name, as of now.
    pub fn devices(&self) -> Snapshot<DeviceRecord> {
        let mut all: Vec<Arc<DeviceRecord>> = self.devices.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Snapshot::new(all, |_| true)
    }

    /// Signals matching `filter`, sorted by path.
    pub fn signals(&self, filter: SignalFilter) -> Snapshot<SignalRecord> {
        let mut all: Vec<Arc<SignalRecord>> = self.signals.values().cloned().collect();
        all.sort_by(|a, b| (&a.device, &a.name).cmp(&(&b.device, &b.name)));
        Snapshot::new(all, move |s| filter.matches(s))
    }

    /// Maps matching `filter`, sorted by id.
    pub fn maps(&self, filter: MapFilter) -> Snapshot<MapRecord> {
        let mut all: Vec<Arc<MapRecord>> = self.maps.values().cloned().collect();
        all.sort_by_key(|m| m.id);
        Snapshot::new(all, move |m| filter.matches(m))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    pub fn add_callback(&mut self, mask: ObjectMask, handler: GraphHandler) {
        self.handlers.push((mask, handler));
    }

    fn emit(&mut self, kind: GraphEventKind, object: GraphObject) {
        let event = GraphEvent { kind, object };
        for (mask, handler) in self.handlers.iter_mut() {
            if mask.matches(&event.object) {
                handler(&event);
            }
        }
    }

    // ========================================================================
    // Mutation (protocol-driven)
    // ========================================================================

    /// Note traffic from a device without changing its record.
    pub(crate) fn touch(&mut self, name: &str, now: Instant) -> bool {
        match self.last_seen.get_mut(name) {
            Some(seen) if self.devices.contains_key(name) => {
                *seen = now;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn upsert_device(&mut self, record: DeviceRecord, now: Instant) -> Option<GraphEventKind> {
        self.last_seen.insert(record.name.clone(), now);
        let kind = match self.devices.get(&record.name) {
            Some(existing) if **existing == record => return None,
            Some(_) => GraphEventKind::Modified,
            None => GraphEventKind::Added,
        };
        let record = Arc::new(record);
        self.devices.insert(record.name.clone(), record.clone());
        self.emit(kind, GraphObject::Device(record));
        Some(kind)
    }

    /// Ignored unless the owning device is known.
    pub(crate) fn upsert_signal(&mut self, mut record: SignalRecord) -> Option<GraphEventKind> {
        if !self.devices.contains_key(&record.device) {
            debug!(signal = %record.path(), "signal for unknown device ignored");
            return None;
        }
        let path = record.path();
        let kind = match self.signals.get(&path) {
            Some(existing) if existing.same_definition(&record) => return None,
            Some(existing) => {
                record.last_value = existing.last_value.clone();
                GraphEventKind::Modified
            }
            None => GraphEventKind::Added,
        };
        let record = Arc::new(record);
        self.signals.insert(path, record.clone());
        self.emit(kind, GraphObject::Signal(record));
        Some(kind)
    }

    /// Record a value observed through a subscription.
    pub(crate) fn set_signal_value(&mut self, path: &SignalPath, value: Value, time: Timetag) -> bool {
        let Some(existing) = self.signals.get(path) else {
            return false;
        };
        let mut record = (**existing).clone();
        record.last_value = Some((value, time));
        let record = Arc::new(record);
        self.signals.insert(path.clone(), record.clone());
        self.emit(GraphEventKind::Modified, GraphObject::Signal(record));
        true
    }

    pub(crate) fn upsert_map(&mut self, record: MapRecord) -> Option<GraphEventKind> {
        let kind = match self.maps.get(&record.id) {
            Some(existing) if **existing == record => return None,
            Some(_) => GraphEventKind::Modified,
            None => GraphEventKind::Added,
        };
        let record = Arc::new(record);
        self.maps.insert(record.id, record.clone());
        self.emit(kind, GraphObject::Map(record));
        Some(kind)
    }

    pub(crate) fn remove_map(&mut self, id: MapId) -> bool {
        match self.maps.remove(&id) {
            Some(record) => {
                self.emit(GraphEventKind::Removed, GraphObject::Map(record));
                true
            }
            None => false,
        }
    }

    /// Remove a signal and every map referencing it. Returns removed map ids.
    pub(crate) fn remove_signal(&mut self, path: &SignalPath) -> Vec<MapId> {
        let maps = self.remove_maps_where(|m| m.involves_signal(path));
        if let Some(record) = self.signals.remove(path) {
            self.emit(GraphEventKind::Removed, GraphObject::Signal(record));
        }
        maps
    }

    /// Remove a device with its signals and every map touching it.
    /// Returns removed map ids.
    pub(crate) fn remove_device(&mut self, name: &str) -> Vec<MapId> {
        let maps = self.remove_maps_where(|m| m.involves_device(name));

        let mut paths: Vec<SignalPath> = self.signals.keys().filter(|p| p.device == name).cloned().collect();
        paths.sort();
        for path in paths {
            if let Some(record) = self.signals.remove(&path) {
                self.emit(GraphEventKind::Removed, GraphObject::Signal(record));
            }
        }

        self.last_seen.remove(name);
        if let Some(record) = self.devices.remove(name) {
            self.emit(GraphEventKind::Removed, GraphObject::Device(record));
        }
        maps
    }

    /// Drop devices not heard from within `timeout`, except `keep`.
    /// Returns the names of expired devices.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration, keep: &str) -> Vec<String> {
        let mut stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(name, seen)| name.as_str() != keep && now.saturating_duration_since(**seen) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        for name in &stale {
            debug!(device = %name, "device expired");
            self.remove_device(name);
        }
        stale
    }

    fn remove_maps_where(&mut self, pred: impl Fn(&MapRecord) -> bool) -> Vec<MapId> {
        let mut ids: Vec<MapId> = self.maps.values().filter(|m| pred(m)).map(|m| m.id).collect();
        ids.sort();
        for id in &ids {
            self.remove_map(*id);
        }
        ids
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("devices", &self.devices.len())
            .field("signals", &self.signals.len())
            .field("maps", &self.maps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn device(name: &str, port: u16) -> DeviceRecord {
        DeviceRecord {
            name: name.into(),
            id: DeviceId::for_name(name),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn signal(dev: &str, name: &str, direction: Direction) -> SignalRecord {
        SignalRecord {
            device: dev.into(),
            name: name.into(),
            direction,
            ty: Type::Float32,
            len: 1,
            unit: None,
            min: None,
            max: None,
            instances: 1,
            last_value: None,
        }
    }

    fn map(id: u64, src: &str, dst: &str) -> MapRecord {
        MapRecord {
            id: MapId(id),
            creator: "a.0".into(),
            sources: vec![src.parse().unwrap()],
            destinations: vec![dst.parse().unwrap()],
            source_types: vec![Signature::new(Type::Float32, 1)],
            source_instances: vec![1],
            mode: MapMode::Raw,
            expression: None,
            muted: false,
            destination_types: Vec::new(),
            location: ProcessLocation::Destination,
            scopes: Vec::new(),
            status: MapStatus::Ready,
        }
    }

    fn recording(graph: &mut Graph) -> Arc<Mutex<Vec<(GraphEventKind, String)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        graph.add_callback(ObjectMask::ALL, Box::new(move |e: &GraphEvent| {
            let label = match &e.object {
                GraphObject::Device(d) => format!("device {}", d.name),
                GraphObject::Signal(s) => format!("signal {}", s.path()),
                GraphObject::Map(m) => format!("map {}", m.id.0),
            };
            sink.lock().push((e.kind, label));
        }));
        log
    }

    #[test]
    fn test_idempotent_announcements() {
        let mut g = Graph::new();
        let log = recording(&mut g);
        let now = Instant::now();
        assert_eq!(g.upsert_device(device("a.0", 1), now), Some(GraphEventKind::Added));
        assert_eq!(g.upsert_device(device("a.0", 1), now), None);
        assert_eq!(g.upsert_signal(signal("a.0", "out", Direction::Outgoing)), Some(GraphEventKind::Added));
        assert_eq!(g.upsert_signal(signal("a.0", "out", Direction::Outgoing)), None);
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_changed_properties_fire_modified() {
        let mut g = Graph::new();
        let now = Instant::now();
        g.upsert_device(device("a.0", 1), now);
        assert_eq!(g.upsert_device(device("a.0", 2), now), Some(GraphEventKind::Modified));
        g.upsert_signal(signal("a.0", "out", Direction::Outgoing));
        let mut changed = signal("a.0", "out", Direction::Outgoing);
        changed.unit = Some("Hz".into());
        assert_eq!(g.upsert_signal(changed), Some(GraphEventKind::Modified));
    }

    #[test]
    fn test_signal_requires_known_device() {
        let mut g = Graph::new();
        assert_eq!(g.upsert_signal(signal("ghost.0", "x", Direction::Incoming)), None);
        assert_eq!(g.signal_count(), 0);
    }

    #[test]
    fn test_device_removal_cascades() {
        let mut g = Graph::new();
        let now = Instant::now();
        g.upsert_device(device("a.0", 1), now);
        g.upsert_device(device("b.0", 2), now);
        g.upsert_signal(signal("a.0", "out", Direction::Outgoing));
        g.upsert_signal(signal("b.0", "in", Direction::Incoming));
        g.upsert_map(map(7, "a.0/out", "b.0/in"));
        let log = recording(&mut g);

        let removed = g.remove_device("a.0");
        assert_eq!(removed, vec![MapId(7)]);
        assert_eq!(*log.lock(), vec![
            (GraphEventKind::Removed, "map 7".to_string()),
            (GraphEventKind::Removed, "signal a.0/out".to_string()),
            (GraphEventKind::Removed, "device a.0".to_string()),
        ]);
        assert!(g.signal(&"b.0/in".parse().unwrap()).is_some());
    }

    #[test]
    fn test_expiry_skips_local_device() {
        let mut g = Graph::new();
        let start = Instant::now();
        g.upsert_device(device("me.0", 1), start);
        g.upsert_device(device("peer.0", 2), start);
        let later = start + Duration::from_secs(11);
        let expired = g.expire(later, Duration::from_secs(10), "me.0");
        assert_eq!(expired, vec!["peer.0".to_string()]);
        assert!(g.device("me.0").is_some());
        assert!(g.device("peer.0").is_none());
    }

    #[test]
    fn test_touch_refreshes_liveness() {
        let mut g = Graph::new();
        let start = Instant::now();
        g.upsert_device(device("peer.0", 2), start);
        assert!(g.touch("peer.0", start + Duration::from_secs(8)));
        assert!(g.expire(start + Duration::from_secs(15), Duration::from_secs(10), "").is_empty());
        assert!(!g.touch("unknown.0", start));
    }

    #[test]
    fn test_subscription_value_fires_modified() {
        let mut g = Graph::new();
        g.upsert_device(device("a.0", 1), Instant::now());
        g.upsert_signal(signal("a.0", "out", Direction::Outgoing));
        let log = recording(&mut g);
        let path: SignalPath = "a.0/out".parse().unwrap();
        assert!(g.set_signal_value(&path, Value::from(2.0f32), Timetag::new(1, 0)));
        assert_eq!(log.lock()[0].0, GraphEventKind::Modified);
        assert_eq!(g.signal(&path).unwrap().last_value, Some((Value::from(2.0f32), Timetag::new(1, 0))));
        // Re-announcing the same definition keeps the value and fires nothing
        assert_eq!(g.upsert_signal(signal("a.0", "out", Direction::Outgoing)), None);
    }
}
