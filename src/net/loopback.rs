//! In-process network.
//!
//! Every [`LoopbackTransport`] created from one [`LoopbackNetwork`] gets a
//! distinct `127.0.0.1:port` address and a receive queue. Clones of the
//! network share the same state, so devices on different threads can
//! reach each other.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{Error, Result};

use super::{Datagram, Transport};

const FIRST_PORT: u16 = 20_000;

#[derive(Default)]
struct NetState {
    next_port: u16,
    queues: HashMap<SocketAddr, VecDeque<Datagram>>,
    members: HashSet<SocketAddr>,
    delivered: u64,
}

struct Inner {
    state: Mutex<NetState>,
    arrived: Condvar,
}

/// Shared handle to an in-process datagram network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Inner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(NetState { next_port: FIRST_PORT, ..NetState::default() }),
                arrived: Condvar::new(),
            }),
        }
    }

    /// Attach a new endpoint.
    pub fn endpoint(&self) -> LoopbackTransport {
        let mut state = self.inner.state.lock();
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1).max(FIRST_PORT);
        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        state.queues.insert(address, VecDeque::new());
        LoopbackTransport { network: self.clone(), address }
    }

    /// Attached endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.inner.state.lock().queues.len()
    }

    /// Datagrams enqueued so far.
    pub fn delivered(&self) -> u64 {
        self.inner.state.lock().delivered
    }

    fn enqueue(state: &mut NetState, from: SocketAddr, to: SocketAddr, bytes: &Bytes) -> bool {
        match state.queues.get_mut(&to) {
            Some(queue) => {
                queue.push_back(Datagram { from, bytes: bytes.clone() });
                state.delivered += 1;
                true
            }
            None => false,
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork").field("endpoints", &self.endpoint_count()).finish()
    }
}

/// One endpoint on a [`LoopbackNetwork`]. Detaches on drop.
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    address: SocketAddr,
}

impl Transport for LoopbackTransport {
    fn local_address(&self) -> SocketAddr {
        self.address
    }

    fn join_group(&mut self) -> Result<()> {
        self.network.inner.state.lock().members.insert(self.address);
        Ok(())
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<()> {
        let bytes = Bytes::copy_from_slice(bytes);
        let delivered = {
            let mut state = self.network.inner.state.lock();
            LoopbackNetwork::enqueue(&mut state, self.address, to, &bytes)
        };
        if !delivered {
            return Err(Error::Transport(format!("no endpoint at {to}")));
        }
        self.network.inner.arrived.notify_all();
        Ok(())
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        let bytes = Bytes::copy_from_slice(bytes);
        {
            let mut state = self.network.inner.state.lock();
            let mut members: Vec<SocketAddr> = state.members.iter().copied().filter(|m| *m != self.address).collect();
            members.sort();
            for to in members {
                LoopbackNetwork::enqueue(&mut state, self.address, to, &bytes);
            }
        }
        self.network.inner.arrived.notify_all();
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<Datagram>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.network.inner.state.lock();
        loop {
            let Some(queue) = state.queues.get_mut(&self.address) else {
                return Err(Error::Transport("endpoint detached".into()));
            };
            if !queue.is_empty() {
                let out: Vec<Datagram> = queue.drain(..).collect();
                trace!(endpoint = %self.address, count = out.len(), "loopback receive");
                return Ok(out);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            self.network.inner.arrived.wait_for(&mut state, deadline - now);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut state = self.network.inner.state.lock();
        state.queues.remove(&self.address);
        state.members.remove(&self.address);
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport").field("address", &self.address).finish()
    }
}
