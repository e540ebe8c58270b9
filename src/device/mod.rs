//! # Devices
//!
//! A [`Device`] owns a set of signals, a replica of the network graph and
//! the maps it created. All network work happens inside [`Device::poll`]:
//!
//! ```text
//! poll(timeout)
//!   ├─ naming      probe / lock `prefix.ordinal`
//!   ├─ receive     decode and dispatch pending datagrams
//!   ├─ flush       send queued updates and announcements (FIFO)
//!   ├─ housekeep   heartbeat, expire peers, resolve and renegotiate maps
//!   └─ wait        block up to `timeout` only if nothing was processed
//! ```
//!
//! Every other call is synchronous and only queues network effects for
//! the next poll. Callbacks run inside `poll` on the caller's thread.

mod handlers;
pub(crate) mod naming;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, TransportConfig};
use crate::graph::{DeviceRecord, Graph, GraphEvent, ObjectMask};
use crate::map::router::{Router, SignalTable};
use crate::map::{Map, MapErrorHandler, MapSpec, MapStatus};
use crate::model::{stable_hash, DeviceId, InstanceId, MapId, SignalPath, Timetag, Value};
use crate::net::{Packet, Transport};
use crate::signal::{Direction, EventMask, Signal, SignalEvent, SignalId, SignalSpec};
use crate::{Error, Result};

use naming::{Naming, NamingAction};

/// Longest a not-yet-named device blocks in one poll, so probing keeps
/// moving.
const NAMING_SLICE: Duration = Duration::from_millis(10);

/// Bound on flush/local-dispatch rounds per poll.
const MAX_PUMP_ROUNDS: usize = 16;

/// Announce intervals a released map keeps repeating its removal.
const UNMAP_REPEATS: u8 = 3;

/// A queued network effect.
#[derive(Debug, Clone)]
enum Outgoing {
    Bus(Packet),
    /// To a device by name, resolved through the graph when sent.
    Device(String, Packet),
    Address(SocketAddr, Packet),
}

/// A peer leasing raw updates of one of our signals.
#[derive(Debug, Clone)]
struct Subscriber {
    device: String,
    address: SocketAddr,
    expires: Instant,
}

pub struct Device {
    prefix: String,
    config: DeviceConfig,
    transport: Box<dyn Transport>,
    naming: Naming,
    name: String,
    id: DeviceId,
    ready: bool,
    signals: SignalTable,
    signal_names: HashMap<SignalId, String>,
    next_signal: u32,
    graph: Graph,
    router: Router,
    maps: HashMap<MapId, Map>,
    next_map: u32,
    outbox: VecDeque<Outgoing>,
    /// Packets addressed to ourselves.
    inbox: VecDeque<Packet>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// Remote signals we subscribe to, with the next renewal time.
    subscriptions: HashMap<SignalPath, Instant>,
    last_sync: Option<Instant>,
    last_who: Option<Instant>,
    map_error_handler: Option<MapErrorHandler>,
}

// ============================================================================
// Construction
// ============================================================================

impl Device {
    /// Create a device and start claiming `prefix.N` on the network.
    pub fn new(prefix: &str, config: DeviceConfig) -> Result<Device> {
        config.validate()?;
        let transport: Box<dyn Transport> = match &config.transport {
            TransportConfig::Loopback => {
                let network = config
                    .network()
                    .ok_or_else(|| Error::Config("loopback transport needs DeviceConfig::with_network".into()))?;
                Box::new(network.endpoint())
            }
            #[cfg(feature = "udp")]
            TransportConfig::Udp { group, interface, ttl } => {
                Box::new(crate::net::UdpTransport::bind(*group, *interface, *ttl)?)
            }
            #[cfg(not(feature = "udp"))]
            TransportConfig::Udp { .. } => {
                return Err(Error::Config("built without the `udp` feature".into()));
            }
        };
        Self::with_transport(prefix, config, transport)
    }

    /// Create a device on a caller-supplied transport.
    pub fn with_transport(prefix: &str, config: DeviceConfig, mut transport: Box<dyn Transport>) -> Result<Device> {
        if prefix.is_empty() || prefix.contains(['/', '@']) || prefix.contains(char::is_whitespace) {
            return Err(Error::Config(format!("invalid device name prefix '{prefix}'")));
        }
        config.validate()?;
        transport.join_group()?;

        let address = transport.local_address();
        let tie_break = stable_hash(&[prefix.as_bytes(), address.to_string().as_bytes()]) as u32;
        let naming = Naming::new(prefix, config.naming.clone(), tie_break, address);
        let name = naming.name();
        debug!(prefix, %address, "device created");

        Ok(Device {
            prefix: prefix.to_string(),
            config,
            transport,
            naming,
            id: DeviceId::for_name(&name),
            name,
            ready: false,
            signals: SignalTable::new(),
            signal_names: HashMap::new(),
            next_signal: 0,
            graph: Graph::new(),
            router: Router::new(),
            maps: HashMap::new(),
            next_map: 1,
            outbox: VecDeque::new(),
            inbox: VecDeque::new(),
            subscribers: HashMap::new(),
            subscriptions: HashMap::new(),
            last_sync: None,
            last_who: None,
            map_error_handler: None,
        })
    }

    /// Retract everything this device announced and release it.
    pub fn free(self) {
        drop(self);
    }

    // ========================================================================
    // Identity
    // ========================================================================

    /// `prefix.ordinal`; provisional until the device is ready.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ordinal(&self) -> u32 {
        self.naming.ordinal()
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.transport.local_address()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord { name: self.name.clone(), id: self.id, address: self.transport.local_address() }
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Add a signal. Before the device is ready the announcement is held
    /// back and sent once the name is locked.
    pub fn add_signal(&mut self, spec: SignalSpec) -> Result<SignalId> {
        if self.signals.contains_key(&spec.name) {
            return Err(Error::Config(format!("signal '{}' already exists on {}", spec.name, self.name)));
        }
        let id = SignalId(self.next_signal);
        let signal = Signal::from_spec(id, spec)?;
        self.next_signal += 1;
        if self.ready {
            self.outbox.push_back(Outgoing::Bus(Packet::Signal(signal.record(&self.name))));
        }
        debug!(device = %self.name, signal = signal.name(), "signal added");
        self.signal_names.insert(id, signal.name().to_string());
        self.signals.insert(signal.name().to_string(), signal);
        Ok(id)
    }

    /// Remove a signal, retracting every map that references it.
    pub fn remove_signal(&mut self, id: SignalId) -> Result<()> {
        let name = self.signal_names.remove(&id).ok_or_else(|| Error::NotFound(format!("signal {}", id.0)))?;
        let path = SignalPath::new(&self.name, &name);
        self.router.retain(|r| !r.involves_signal(&path), &mut self.signals);
        self.signals.remove(&name);
        self.subscribers.remove(&name);
        let owned: Vec<MapId> = self
            .maps
            .values()
            .filter(|m| *m.status() != MapStatus::Released)
            .filter(|m| m.sources().iter().chain(m.destinations()).any(|p| *p == path))
            .map(|m| m.id())
            .collect();
        for map in owned {
            self.retract_owned(map);
        }
        if self.ready {
            self.outbox.push_back(Outgoing::Bus(Packet::SignalRemoved { path }));
        }
        Ok(())
    }

    pub fn signal(&self, id: SignalId) -> Option<&Signal> {
        self.signals.get(self.signal_names.get(&id)?)
    }

    pub fn signal_by_name(&self, name: &str) -> Option<&Signal> {
        self.signals.get(name)
    }

    /// Local signals, in creation order.
    pub fn signals(&self) -> Vec<&Signal> {
        let mut all: Vec<&Signal> = self.signals.values().collect();
        all.sort_by_key(|s| s.id());
        all
    }

    /// Full network path of a local signal. `None` until the device is
    /// ready, since the name may still change.
    pub fn signal_path(&self, id: SignalId) -> Option<SignalPath> {
        if !self.ready {
            return None;
        }
        self.signal_names.get(&id).map(|n| SignalPath::new(&self.name, n))
    }

    /// Register a handler for updates and instance events on a signal.
    pub fn on_signal(
        &mut self,
        id: SignalId,
        mask: EventMask,
        handler: impl FnMut(&SignalEvent<'_>) + Send + 'static,
    ) -> Result<()> {
        let signal = self.signal_mut(id)?;
        signal.add_handler(mask, Box::new(handler));
        Ok(())
    }

    fn signal_mut(&mut self, id: SignalId) -> Result<&mut Signal> {
        let name = self.signal_names.get(&id).ok_or_else(|| Error::NotFound(format!("signal {}", id.0)))?;
        self.signals.get_mut(name).ok_or_else(|| Error::NotFound(format!("signal '{name}'")))
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Update the default instance of an outgoing signal.
    pub fn set_value(&mut self, id: SignalId, value: impl Into<Value>) -> Result<()> {
        self.set_instance_value(id, InstanceId::DEFAULT, value)
    }

    /// Update one instance of an outgoing signal and queue it for every
    /// ready map and subscriber. Bounds are advisory and not enforced.
    pub fn set_instance_value(&mut self, id: SignalId, instance: InstanceId, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let device = self.name.clone();
        let signal = self.signal_mut(id)?;
        if signal.direction() != Direction::Outgoing {
            return Err(Error::InvalidDirection {
                signal: format!("{device}/{}", signal.name()),
                expected: Direction::Outgoing,
            });
        }
        value.check(signal.ty(), signal.len())?;
        let time = Timetag::now();
        if signal.store(instance, value.clone(), time).is_none() {
            return Err(Error::NotFound(format!("no free instance on '{}'", signal.name())));
        }
        let name = signal.name().to_string();
        let global = if signal.instance_capacity() == 1 { 0 } else { instance.global(&device) };
        self.emit_update(&name, instance, global, time, Some(value));
        Ok(())
    }

    /// End an instance of an outgoing signal; downstream instances are
    /// released too.
    pub fn release_instance(&mut self, id: SignalId, instance: InstanceId) -> Result<()> {
        let device = self.name.clone();
        let signal = self.signal_mut(id)?;
        if signal.direction() != Direction::Outgoing {
            return Err(Error::InvalidDirection {
                signal: format!("{device}/{}", signal.name()),
                expected: Direction::Outgoing,
            });
        }
        let released = signal.instances.release(instance);
        if released.is_none() {
            return Err(Error::NotFound(format!("instance {instance} on '{}'", signal.name())));
        }
        let name = signal.name().to_string();
        let global = if signal.instance_capacity() == 1 { 0 } else { instance.global(&device) };
        self.emit_update(&name, instance, global, Timetag::now(), None);
        Ok(())
    }

    /// Latest value of the default instance, or `None` if never set.
    pub fn value(&self, id: SignalId) -> Option<(Value, Timetag)> {
        self.instance_value(id, InstanceId::DEFAULT)
    }

    pub fn instance_value(&self, id: SignalId, instance: InstanceId) -> Option<(Value, Timetag)> {
        self.signal(id)?.value(instance).map(|(v, t)| (v.clone(), t))
    }

    fn emit_update(&mut self, signal: &str, instance: InstanceId, global: u64, time: Timetag, value: Option<Value>) {
        let (emissions, errors) = self.router.emit(signal, &self.name, global, value.as_ref());
        for out in emissions {
            let packet = Packet::MapData { id: out.map, slot: out.slot, instance: global, time, value: out.value };
            for device in out.devices {
                self.outbox.push_back(Outgoing::Device(device, packet.clone()));
            }
        }
        for (id, err) in errors {
            self.report_map_error(id, &err);
        }
        if let Some(subscribers) = self.subscribers.get(signal) {
            let packet = Packet::SignalUpdate {
                path: SignalPath::new(&self.name, signal),
                instance: instance.0,
                time,
                value,
            };
            for s in subscribers {
                self.outbox.push_back(Outgoing::Address(s.address, packet.clone()));
            }
        }
    }

    // ========================================================================
    // Remote signals
    // ========================================================================

    /// Write directly to a remote incoming signal, without a map.
    pub fn set_remote(&mut self, path: &SignalPath, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let record = self.graph.signal(path).ok_or_else(|| Error::NotFound(format!("signal '{path}'")))?;
        if record.direction != Direction::Incoming {
            return Err(Error::InvalidDirection { signal: path.to_string(), expected: Direction::Incoming });
        }
        value.check(record.ty, record.len)?;
        let packet = Packet::SignalUpdate { path: path.clone(), instance: 0, time: Timetag::now(), value: Some(value) };
        self.outbox.push_back(Outgoing::Device(path.device.clone(), packet));
        Ok(())
    }

    /// Lease raw updates of a remote signal. Values land in the graph
    /// record's `last_value`. The lease is renewed while polling.
    pub fn subscribe(&mut self, path: &SignalPath) -> Result<()> {
        if self.graph.signal(path).is_none() {
            return Err(Error::NotFound(format!("signal '{path}'")));
        }
        self.send_subscribe(path, self.config.subscription_lease_ms);
        self.subscriptions.insert(path.clone(), Instant::now() + self.config.subscription_lease() / 2);
        Ok(())
    }

    pub fn unsubscribe(&mut self, path: &SignalPath) {
        if self.subscriptions.remove(path).is_some() {
            self.send_subscribe(path, 0);
        }
    }

    fn send_subscribe(&mut self, path: &SignalPath, lease_ms: u64) {
        let packet = Packet::Subscribe {
            subscriber: self.name.clone(),
            path: path.clone(),
            lease_ms: lease_ms.min(u32::MAX as u64) as u32,
        };
        self.outbox.push_back(Outgoing::Device(path.device.clone(), packet));
    }

    // ========================================================================
    // Maps
    // ========================================================================

    /// Create a map owned by this device. It stays unresolved until pushed.
    pub fn new_map(&mut self, spec: MapSpec) -> Result<MapId> {
        if !self.ready {
            return Err(Error::NotReady(format!("device '{}' has no name yet", self.name)));
        }
        let id = MapId::compose(self.id, self.next_map);
        let map = Map::new(id, spec)?;
        self.next_map += 1;
        self.maps.insert(id, map);
        Ok(id)
    }

    /// Send (or re-send) a map definition to its endpoints. Negotiation
    /// continues inside `poll`.
    ///
    /// Every endpoint must already be known: a local signal, or a remote
    /// one present in the graph.
    pub fn push_map(&mut self, id: MapId) -> Result<()> {
        let map = self.maps.get(&id).ok_or_else(|| Error::NotFound(format!("map {id}")))?;
        let missing = map.sources().iter().chain(map.destinations()).find(|p| {
            if p.device == self.name {
                !self.signals.contains_key(&p.signal)
            } else {
                self.graph.signal(p).is_none()
            }
        });
        if let Some(path) = missing {
            return Err(Error::NotFound(format!("signal '{path}'")));
        }
        let map = self.maps.get_mut(&id).ok_or_else(|| Error::NotFound(format!("map {id}")))?;
        if *map.status() == MapStatus::Released {
            return Err(Error::NotFound(format!("map {id} was released")));
        }
        if let Some(text) = map.spec().expression.as_deref() {
            crate::expr::check_syntax(text)?;
        }
        map.reset();
        map.pushed = true;
        debug!(map = %id, "map pushed");
        Ok(())
    }

    /// Release a map everywhere. Locally effective immediately; peers
    /// follow when they receive the removal.
    pub fn release_map(&mut self, id: MapId) -> Result<()> {
        match self.maps.get(&id).map(|m| m.status().clone()) {
            None => Err(Error::NotFound(format!("map {id}"))),
            Some(MapStatus::Released) => Ok(()),
            Some(_) => {
                self.retract_owned(id);
                Ok(())
            }
        }
    }

    pub fn map(&self, id: MapId) -> Option<&Map> {
        self.maps.get(&id)
    }

    pub fn map_mut(&mut self, id: MapId) -> Option<&mut Map> {
        self.maps.get_mut(&id)
    }

    /// Maps created by this device, by id.
    pub fn maps(&self) -> Vec<&Map> {
        let mut all: Vec<&Map> = self.maps.values().collect();
        all.sort_by_key(|m| m.id());
        all
    }

    /// Called for evaluation errors and failed negotiations on any map
    /// this device creates or carries.
    pub fn on_map_error(&mut self, handler: impl FnMut(MapId, &Error) + Send + 'static) {
        self.map_error_handler = Some(Box::new(handler));
    }

    pub fn add_graph_callback(&mut self, mask: ObjectMask, handler: impl FnMut(&GraphEvent) + Send + 'static) {
        self.graph.add_callback(mask, Box::new(handler));
    }

    fn retract_owned(&mut self, id: MapId) {
        if let Some(map) = self.maps.get_mut(&id) {
            map.set_status(MapStatus::Released);
            map.pushed = false;
            map.unmap_repeats = UNMAP_REPEATS;
        }
        self.router.remove(id, &mut self.signals);
        info!(device = %self.name, map = %id, "map released");
        self.outbox.push_back(Outgoing::Bus(Packet::Unmap { id }));
    }

    fn report_map_error(&mut self, id: MapId, err: &Error) {
        if let Some(map) = self.maps.get_mut(&id) {
            map.report(err);
        }
        self.report_device_error(id, err);
    }

    fn report_device_error(&mut self, id: MapId, err: &Error) {
        if let Some(handler) = self.map_error_handler.as_mut() {
            handler(id, err);
        }
    }

    // ========================================================================
    // Poll
    // ========================================================================

    /// Process pending network traffic and timers, blocking up to
    /// `timeout` only if there was nothing to do. Returns the number of
    /// messages processed.
    ///
    /// The only error is `NameResolutionFailed`; network faults are logged
    /// and surface through callbacks and map state.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize> {
        let now = Instant::now();
        self.step_naming(now)?;

        let mut count = self.receive(Duration::ZERO);
        count += self.pump();
        if self.ready {
            self.housekeeping(Instant::now());
            count += self.pump();
        }

        if count == 0 && !timeout.is_zero() {
            let wait = if self.ready { timeout } else { timeout.min(NAMING_SLICE) };
            count += self.receive(wait);
            count += self.pump();
        }
        Ok(count)
    }

    fn step_naming(&mut self, now: Instant) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let action = self.naming.tick(now)?;
        self.apply_naming(action, now);
        Ok(())
    }

    fn apply_naming(&mut self, action: NamingAction, now: Instant) {
        match action {
            NamingAction::None => {}
            NamingAction::Probe => {
                self.name = self.naming.name();
                let probe = Packet::NameProbe { name: self.name.clone(), id: self.naming.id() };
                self.send_bus(&probe);
            }
            NamingAction::Registered => {
                self.send_bus(&Packet::NameRegistered { name: self.name.clone() });
            }
            NamingAction::Locked => self.on_ready(now),
        }
    }

    fn on_ready(&mut self, now: Instant) {
        self.name = self.naming.name();
        self.id = DeviceId::for_name(&self.name);
        self.ready = true;
        info!(device = %self.name, address = %self.transport.local_address(), "device ready");
        self.announce_all();
        self.outbox.push_back(Outgoing::Bus(Packet::Who));
        self.last_who = Some(now);
    }

    /// Queue our device, signals and live owned maps.
    fn announce_all(&mut self) {
        let mut packets = vec![Packet::Device(self.record())];
        packets.extend(self.signals().into_iter().map(|s| Packet::Signal(s.record(&self.name))));
        let mut owned: Vec<&Map> = self.maps.values().filter(|m| m.is_ready()).collect();
        owned.sort_by_key(|m| m.id());
        packets.extend(owned.into_iter().filter_map(|m| m.record.clone()).map(Packet::Mapped));
        self.outbox.extend(packets.into_iter().map(Outgoing::Bus));
    }

    fn receive(&mut self, timeout: Duration) -> usize {
        let datagrams = match self.transport.receive(timeout) {
            Ok(d) => d,
            Err(e) => {
                warn!(device = %self.name, error = %e, "receive failed");
                return 0;
            }
        };
        let now = Instant::now();
        let mut count = 0;
        for datagram in datagrams {
            match Packet::decode(&datagram.bytes) {
                Ok(packet) => {
                    self.dispatch(packet, datagram.from, now);
                    count += 1;
                }
                Err(e) => debug!(device = %self.name, from = %datagram.from, error = %e, "malformed datagram dropped"),
            }
        }
        count
    }

    /// Flush the outbox and dispatch packets we sent to ourselves, until
    /// both are empty.
    fn pump(&mut self) -> usize {
        let mut count = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            self.flush();
            if self.inbox.is_empty() {
                break;
            }
            let local = self.transport.local_address();
            let now = Instant::now();
            while let Some(packet) = self.inbox.pop_front() {
                self.dispatch(packet, local, now);
                count += 1;
            }
        }
        count
    }

    fn flush(&mut self) {
        while let Some(out) = self.outbox.pop_front() {
            match out {
                Outgoing::Bus(packet) => {
                    self.send_bus(&packet);
                    self.apply_own(packet);
                }
                Outgoing::Device(device, packet) if device == self.name => self.inbox.push_back(packet),
                Outgoing::Device(device, packet) => match self.graph.device(&device) {
                    Some(record) => self.send_to(record.address, &packet),
                    None => debug!(device = %self.name, to = %device, "unknown device, message dropped"),
                },
                Outgoing::Address(address, packet) => self.send_to(address, &packet),
            }
        }
    }

    /// Bus packets describe the graph; our own are applied to our replica
    /// as they are sent.
    fn apply_own(&mut self, packet: Packet) {
        match packet {
            Packet::Device(record) => {
                self.graph.upsert_device(record, Instant::now());
            }
            Packet::Signal(record) => {
                self.graph.upsert_signal(record);
            }
            Packet::SignalRemoved { path } => {
                self.graph.remove_signal(&path);
            }
            Packet::Mapped(record) => self.on_mapped(record),
            Packet::Unmap { id } => self.on_unmap(id),
            _ => {}
        }
    }

    fn send_bus(&mut self, packet: &Packet) {
        if let Err(e) = self.transport.broadcast(&packet.encode()) {
            warn!(device = %self.name, error = %e, "broadcast failed");
        }
    }

    fn send_to(&mut self, address: SocketAddr, packet: &Packet) {
        if let Err(e) = self.transport.send(address, &packet.encode()) {
            warn!(device = %self.name, to = %address, error = %e, "send failed");
        }
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    fn housekeeping(&mut self, now: Instant) {
        let interval = self.config.announce_interval();
        let due = self.last_sync.is_none_or(|t| now.saturating_duration_since(t) >= interval);
        if due {
            self.last_sync = Some(now);
            self.graph.touch(&self.name, now);
            self.outbox.push_back(Outgoing::Bus(Packet::Sync { name: self.name.clone() }));
            self.resend_pending(now, interval);
            self.reannounce_maps();
            self.renew_subscriptions(now);
            for list in self.subscribers.values_mut() {
                list.retain(|s| s.expires > now);
            }
        }

        let expired = self.graph.expire(now, self.config.liveness_timeout(), &self.name);
        for name in expired {
            info!(device = %self.name, peer = %name, "peer timed out");
            self.forget_device(&name);
        }

        self.resolve_maps(now);
    }

    /// Build and send definitions for pushed maps whose endpoints are now
    /// all known.
    fn resolve_maps(&mut self, now: Instant) {
        let mut sends = Vec::new();
        let mut failures = Vec::new();
        for map in self.maps.values_mut() {
            if !map.pushed || *map.status() != MapStatus::Unresolved {
                continue;
            }
            match map.resolve(&self.graph, &self.name) {
                Ok(Some(record)) => {
                    debug!(map = %map.id(), endpoints = ?map.endpoints, "map resolved");
                    map.last_sent = Some(now);
                    for device in &map.endpoints {
                        sends.push(Outgoing::Device(device.clone(), Packet::Map(record.clone())));
                    }
                }
                Ok(None) => {}
                Err(failure) => failures.push((map.id(), Error::from(failure))),
            }
        }
        self.outbox.extend(sends);
        for (id, err) in failures {
            self.report_device_error(id, &err);
        }
    }

    /// Re-send definitions to endpoints that have not answered yet.
    fn resend_pending(&mut self, now: Instant, interval: Duration) {
        for map in self.maps.values_mut() {
            if *map.status() != MapStatus::Pending {
                continue;
            }
            if map.last_sent.is_some_and(|t| now.saturating_duration_since(t) < interval) {
                continue;
            }
            let Some(record) = map.record.clone() else { continue };
            map.last_sent = Some(now);
            for device in map.endpoints.iter().filter(|d| !map.acked.contains(*d)) {
                self.outbox.push_back(Outgoing::Device(device.clone(), Packet::Map(record.clone())));
            }
        }
    }

    /// Repeat the outcome of finished negotiations, and for a while the
    /// removal of released maps, so endpoints that missed a broadcast
    /// catch up.
    fn reannounce_maps(&mut self) {
        let mut ids: Vec<MapId> = self.maps.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(map) = self.maps.get_mut(&id) else { continue };
            let packet = match map.status() {
                MapStatus::Ready | MapStatus::Failed(_) => {
                    let Some(mut record) = map.record.clone() else { continue };
                    record.status = map.status().clone();
                    Packet::Mapped(record)
                }
                MapStatus::Released if map.unmap_repeats > 0 => {
                    map.unmap_repeats -= 1;
                    Packet::Unmap { id }
                }
                _ => continue,
            };
            self.outbox.push_back(Outgoing::Bus(packet));
        }
    }

    fn renew_subscriptions(&mut self, now: Instant) {
        let half = self.config.subscription_lease() / 2;
        let due: Vec<SignalPath> =
            self.subscriptions.iter().filter(|(_, at)| **at <= now).map(|(p, _)| p.clone()).collect();
        for path in due {
            self.send_subscribe(&path, self.config.subscription_lease_ms);
            self.subscriptions.insert(path, now + half);
        }
    }

    /// Drop all local state tied to a departed device.
    fn forget_device(&mut self, name: &str) {
        self.router.retain(|r| !r.involves_device(name), &mut self.signals);
        for list in self.subscribers.values_mut() {
            list.retain(|s| s.device != name);
        }
        self.subscriptions.retain(|p, _| p.device != name);
        let owned: Vec<MapId> = self
            .maps
            .values()
            .filter(|m| *m.status() != MapStatus::Released)
            .filter(|m| m.sources().iter().chain(m.destinations()).any(|p| p.device == name))
            .map(|m| m.id())
            .collect();
        for id in owned {
            self.retract_owned(id);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if !self.ready {
            return;
        }
        let mut owned: Vec<MapId> =
            self.maps.values().filter(|m| *m.status() != MapStatus::Released).map(|m| m.id()).collect();
        owned.sort();
        for id in owned {
            self.send_bus(&Packet::Unmap { id });
        }
        self.send_bus(&Packet::Logout { name: self.name.clone() });
        info!(device = %self.name, "device freed");
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("ready", &self.ready)
            .field("signals", &self.signals.len())
            .field("maps", &self.maps.len())
            .field("routes", &self.router.len())
            .finish_non_exhaustive()
    }
}
