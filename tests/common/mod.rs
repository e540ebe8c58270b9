//! Shared helpers for the end-to-end tests: fast timings on an in-process
//! network.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use libmapper_rs::net::{Datagram, Packet};
use libmapper_rs::{
    Device, DeviceConfig, LoopbackNetwork, MapId, MapStatus, Result, SignalId, SignalPath, Transport,
};

pub const DEADLINE: Duration = Duration::from_secs(5);

pub fn config(net: &LoopbackNetwork) -> DeviceConfig {
    let mut config = DeviceConfig::default().with_network(net);
    config.naming.grace_ms = 30;
    config.naming.backoff_ms = 10;
    config.announce_interval_ms = 50;
    config.liveness_timeout_ms = 300;
    config.subscription_lease_ms = 400;
    config
}

pub fn device(net: &LoopbackNetwork, prefix: &str) -> Device {
    Device::new(prefix, config(net)).unwrap()
}

/// Poll every device once.
pub fn poll_all(devices: &mut [&mut Device]) {
    for d in devices.iter_mut() {
        d.poll(Duration::from_millis(1)).unwrap();
    }
}

/// Poll until `done` holds or the deadline passes.
pub fn run_until(devices: &mut [&mut Device], mut done: impl FnMut(&[&mut Device]) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        poll_all(devices);
        if done(devices) {
            return true;
        }
    }
    false
}

/// Poll for a fixed time.
pub fn run_for(devices: &mut [&mut Device], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        poll_all(devices);
    }
}

/// Every device named and aware of every other.
pub fn settle(devices: &mut [&mut Device]) {
    let n = devices.len();
    let ok = run_until(devices, |ds| ds.iter().all(|d| d.is_ready() && d.graph().device_count() == n));
    assert!(ok, "devices did not discover each other");
}

/// Wait until the signal is visible in every device's graph.
pub fn wait_for_signal(devices: &mut [&mut Device], path: &SignalPath) {
    let ok = run_until(devices, |ds| ds.iter().all(|d| d.graph().signal(path).is_some()));
    assert!(ok, "signal {path} never announced");
}

/// Wait until every device's graph shows the map as ready.
pub fn wait_for_map(devices: &mut [&mut Device], id: MapId) {
    let ok = run_until(devices, |ds| {
        ds.iter().all(|d| d.graph().map(id).is_some_and(|m| m.status == MapStatus::Ready))
    });
    assert!(ok, "map {id} never became ready");
}

pub fn float(device: &Device, signal: SignalId) -> Option<f64> {
    device.value(signal).and_then(|(v, _)| v.get(0))
}

/// Loopback endpoint that silently drops the first `budget` broadcasts
/// travelling under `path`.
pub struct Lossy<T> {
    inner: T,
    path: &'static str,
    budget: usize,
    pub dropped: Arc<AtomicUsize>,
}

impl<T: Transport> Lossy<T> {
    pub fn new(inner: T, path: &'static str, budget: usize) -> Self {
        Self { inner, path, budget, dropped: Arc::default() }
    }
}

impl<T: Transport> Transport for Lossy<T> {
    fn local_address(&self) -> SocketAddr {
        self.inner.local_address()
    }

    fn join_group(&mut self) -> Result<()> {
        self.inner.join_group()
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.inner.send(to, bytes)
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        let matches = Packet::decode(bytes).is_ok_and(|p| p.path() == self.path);
        if matches && self.dropped.load(Ordering::SeqCst) < self.budget {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.inner.broadcast(bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<Datagram>> {
        self.inner.receive(timeout)
    }
}

/// A device whose first `budget` broadcasts under `path` are lost.
pub fn lossy_device(net: &LoopbackNetwork, prefix: &str, path: &'static str, budget: usize) -> (Device, Arc<AtomicUsize>) {
    let transport = Lossy::new(net.endpoint(), path, budget);
    let dropped = transport.dropped.clone();
    let device = Device::with_transport(prefix, config(net), Box::new(transport)).unwrap();
    (device, dropped)
}
