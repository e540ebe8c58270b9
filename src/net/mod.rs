//! # Networking
//!
//! Devices talk over two channels: a shared multicast *bus* for presence
//! and graph announcements, and a unicast *mesh* for map negotiation and
//! data. A [`Transport`] hides both behind plain datagram operations so
//! the device logic runs unchanged over real sockets ([`udp`]) or an
//! in-process network ([`loopback`]).

pub mod loopback;
pub mod protocol;
#[cfg(feature = "udp")]
pub mod udp;
pub mod wire;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::Result;

pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use protocol::Packet;
#[cfg(feature = "udp")]
pub use udp::UdpTransport;

/// A received datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub bytes: Bytes,
}

/// Unreliable datagram delivery. No ordering or delivery guarantee is
/// assumed by callers.
pub trait Transport: Send {
    /// Address peers use to reach this endpoint directly.
    fn local_address(&self) -> SocketAddr;

    /// Start receiving bus traffic.
    fn join_group(&mut self) -> Result<()>;

    /// Send to one endpoint.
    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<()>;

    /// Send to every member of the bus. The sender does not receive its
    /// own broadcasts.
    fn broadcast(&mut self, bytes: &[u8]) -> Result<()>;

    /// Everything pending, waiting at most `timeout` for the first
    /// datagram. A zero timeout never blocks.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<Datagram>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn local_address(&self) -> SocketAddr {
        (**self).local_address()
    }

    fn join_group(&mut self) -> Result<()> {
        (**self).join_group()
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<()> {
        (**self).send(to, bytes)
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).broadcast(bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<Datagram>> {
        (**self).receive(timeout)
    }
}
