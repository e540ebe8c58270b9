//! Inbound packet dispatch.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use super::{Device, Outgoing, Subscriber};
use crate::graph::{DeviceRecord, MapRecord, SignalRecord};
use crate::map::{AckProgress, MapFailure, MapStatus};
use crate::model::{InstanceId, MapId, SignalPath, Timetag, Value};
use crate::net::Packet;
use crate::signal::{Direction, SignalEventKind};
use crate::Error;

impl Device {
    pub(super) fn dispatch(&mut self, packet: Packet, from: SocketAddr, now: Instant) {
        trace!(device = %self.name, path = packet.path(), %from, "received");
        match packet {
            Packet::NameProbe { name, id } => self.on_name_probe(&name, id, from, now),
            Packet::NameRegistered { name } => self.naming.on_taken(&name, now),
            Packet::Who => {
                if self.ready {
                    self.announce_all();
                }
            }
            Packet::Device(record) => self.on_device(record, now),
            Packet::Sync { name } => self.on_sync(&name, now),
            Packet::Signal(record) => self.on_signal_record(record, now),
            Packet::SignalRemoved { path } => self.on_signal_removed(&path),
            Packet::Logout { name } => self.on_logout(&name),
            Packet::Mapped(record) => self.on_mapped(record),
            Packet::Unmap { id } => self.on_unmap(id),
            Packet::Map(record) => self.on_map(record, from),
            Packet::MapAck { id, device, outcome } => self.on_map_ack(id, &device, outcome),
            Packet::MapData { id, slot, instance, time, value } => {
                self.on_map_data(id, slot, instance, time, value.as_ref())
            }
            Packet::SignalUpdate { path, instance, time, value } => {
                self.on_signal_update(&path, InstanceId(instance), time, value)
            }
            Packet::Subscribe { subscriber, path, lease_ms } => {
                self.on_subscribe(subscriber, &path, lease_ms, from, now)
            }
        }
    }

    // ========================================================================
    // Presence
    // ========================================================================

    fn on_name_probe(&mut self, name: &str, id: u32, from: SocketAddr, now: Instant) {
        if from == self.transport.local_address() {
            return;
        }
        let action = self.naming.on_probe(name, id, from, now);
        self.apply_naming(action, now);
    }

    fn on_device(&mut self, record: DeviceRecord, now: Instant) {
        if record.name == self.name {
            if !self.ready {
                self.naming.on_taken(&record.name, now);
            } else if record.address != self.transport.local_address() {
                warn!(device = %self.name, other = %record.address, "another device announces our name");
            }
            return;
        }
        if let Some(kind) = self.graph.upsert_device(record, now) {
            trace!(device = %self.name, ?kind, "peer device");
        }
    }

    fn on_sync(&mut self, name: &str, now: Instant) {
        if name == self.name || !self.ready {
            return;
        }
        if self.graph.touch(name, now) {
            return;
        }
        // Heartbeat from a device we never heard announce itself.
        let interval = self.config.announce_interval();
        if self.last_who.is_none_or(|t| now.saturating_duration_since(t) >= interval) {
            debug!(device = %self.name, peer = name, "unknown peer, asking for announcements");
            self.last_who = Some(now);
            self.outbox.push_back(Outgoing::Bus(Packet::Who));
        }
    }

    fn on_signal_record(&mut self, record: SignalRecord, now: Instant) {
        if record.device == self.name {
            return;
        }
        self.graph.touch(&record.device, now);
        self.graph.upsert_signal(record);
    }

    fn on_signal_removed(&mut self, path: &SignalPath) {
        if path.device == self.name {
            return;
        }
        self.graph.remove_signal(path);
        self.router.retain(|r| !r.involves_signal(path), &mut self.signals);
        self.subscriptions.remove(path);
        let owned: Vec<MapId> = self
            .maps
            .values()
            .filter(|m| *m.status() != MapStatus::Released)
            .filter(|m| m.sources().iter().chain(m.destinations()).any(|p| p == path))
            .map(|m| m.id())
            .collect();
        for id in owned {
            self.retract_owned(id);
        }
    }

    fn on_logout(&mut self, name: &str) {
        if name == self.name {
            return;
        }
        info!(device = %self.name, peer = name, "peer logged out");
        self.graph.remove_device(name);
        self.forget_device(name);
    }

    // ========================================================================
    // Map lifecycle
    // ========================================================================

    /// A creator announced a map's definition and status.
    pub(super) fn on_mapped(&mut self, record: MapRecord) {
        let involved = record.involves_device(&self.name);
        match &record.status {
            MapStatus::Ready => {
                if involved && !self.router.set_status(record.id, &record.status, record.muted) {
                    // Missed the definition; the announcement carries it.
                    match self.router.install(&record, &self.name, &self.signals) {
                        Ok(()) => {
                            self.router.set_status(record.id, &record.status, record.muted);
                        }
                        Err(failure) => debug!(map = %record.id, %failure, "cannot carry announced map"),
                    }
                }
                self.graph.upsert_map(record);
            }
            MapStatus::Released => {
                if involved {
                    self.router.remove(record.id, &mut self.signals);
                }
                self.graph.remove_map(record.id);
            }
            MapStatus::Failed(_) => {
                if involved {
                    self.router.remove(record.id, &mut self.signals);
                }
                self.graph.upsert_map(record);
            }
            MapStatus::Unresolved | MapStatus::Pending => {
                self.graph.upsert_map(record);
            }
        }
    }

    pub(super) fn on_unmap(&mut self, id: MapId) {
        self.graph.remove_map(id);
        if self.router.remove(id, &mut self.signals).is_some() {
            debug!(device = %self.name, map = %id, "route released");
        }
    }

    /// An endpoint receives a definition: validate, install and answer
    /// the creator.
    fn on_map(&mut self, record: MapRecord, from: SocketAddr) {
        let outcome = self.router.install(&record, &self.name, &self.signals);
        match &outcome {
            Ok(()) => debug!(device = %self.name, map = %record.id, "map installed"),
            Err(failure) => info!(device = %self.name, map = %record.id, %failure, "map rejected"),
        }
        let ack = Packet::MapAck { id: record.id, device: self.name.clone(), outcome };
        if record.creator == self.name {
            self.inbox.push_back(ack);
        } else {
            self.outbox.push_back(Outgoing::Address(from, ack));
        }
    }

    fn on_map_ack(&mut self, id: MapId, device: &str, outcome: std::result::Result<(), MapFailure>) {
        let Some(map) = self.maps.get_mut(&id) else {
            trace!(map = %id, "ack for unknown map");
            return;
        };
        match map.on_ack(device, outcome) {
            AckProgress::Ready => {
                info!(device = %self.name, map = %id, "map ready");
                if let Some(record) = map.record.clone() {
                    self.outbox.push_back(Outgoing::Bus(Packet::Mapped(record)));
                }
            }
            AckProgress::Failed(failure) => {
                if let Some(mut record) = map.record.clone() {
                    record.status = MapStatus::Failed(failure.clone());
                    self.outbox.push_back(Outgoing::Bus(Packet::Mapped(record)));
                }
                self.report_device_error(id, &Error::from(failure));
            }
            AckProgress::Waiting | AckProgress::Ignored => {}
        }
    }

    fn on_map_data(&mut self, id: MapId, slot: usize, instance: u64, time: Timetag, value: Option<&Value>) {
        let errors = self.router.deliver(id, slot, instance, time, value, &mut self.signals);
        for err in errors {
            self.report_map_error(id, &err);
        }
    }

    // ========================================================================
    // Direct signal access
    // ========================================================================

    fn on_signal_update(&mut self, path: &SignalPath, instance: InstanceId, time: Timetag, value: Option<Value>) {
        if path.device != self.name {
            // Subscription feed for a remote signal.
            if let Some(value) = value {
                self.graph.set_signal_value(path, value, time);
            }
            return;
        }
        let Some(signal) = self.signals.get_mut(&path.signal) else {
            debug!(device = %self.name, signal = %path, "update for unknown signal");
            return;
        };
        if signal.direction() != Direction::Incoming {
            debug!(device = %self.name, signal = %path, "remote write to outgoing signal ignored");
            return;
        }
        let Some(value) = value else {
            if let Some(released) = signal.instances.release(instance) {
                signal.notify_released(&released);
            }
            return;
        };
        if let Err(e) = value.check(signal.ty(), signal.len()) {
            debug!(device = %self.name, signal = %path, error = %e, "remote write rejected");
            return;
        }
        match signal.store(instance, value, time) {
            Some(created) => {
                if created {
                    signal.notify(SignalEventKind::InstanceNew, instance);
                }
                signal.notify(SignalEventKind::Update, instance);
            }
            None => trace!(signal = %path, "no free instance for remote write"),
        }
    }

    fn on_subscribe(&mut self, subscriber: String, path: &SignalPath, lease_ms: u32, from: SocketAddr, now: Instant) {
        if path.device != self.name {
            return;
        }
        let Some(signal) = self.signals.get(&path.signal) else {
            debug!(device = %self.name, signal = %path, "subscription to unknown signal");
            return;
        };
        let current = signal.value(InstanceId::DEFAULT).map(|(v, t)| (v.clone(), t));
        let list = self.subscribers.entry(path.signal.clone()).or_default();
        list.retain(|s| s.device != subscriber);
        if lease_ms == 0 {
            return;
        }
        list.push(Subscriber {
            device: subscriber,
            address: from,
            expires: now + std::time::Duration::from_millis(lease_ms as u64),
        });
        if let Some((value, time)) = current {
            let update = Packet::SignalUpdate { path: path.clone(), instance: 0, time, value: Some(value) };
            self.outbox.push_back(Outgoing::Address(from, update));
        }
    }
}
