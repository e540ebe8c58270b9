//! UDP transport.
//!
//! Two non-blocking sockets: the *bus* socket is bound to the multicast
//! group's port with address reuse, so several devices on one host can
//! share it, and has joined the group; the *mesh* socket is bound to an
//! ephemeral port and sends everything, including broadcasts. Peers learn
//! a device's mesh address from its `/device` announcement.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::Result;

use super::wire::MAX_DATAGRAM;
use super::{Datagram, Transport};

/// Sleep between empty polls while waiting for traffic.
const IDLE_SLICE: Duration = Duration::from_millis(1);

pub struct UdpTransport {
    bus: UdpSocket,
    mesh: UdpSocket,
    group: SocketAddrV4,
    interface: Ipv4Addr,
    local: SocketAddr,
    joined: bool,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind both sockets. `interface` selects the multicast interface;
    /// the default lets the OS choose.
    pub fn bind(group: SocketAddrV4, interface: Option<Ipv4Addr>, ttl: u32) -> Result<Self> {
        let interface = interface.unwrap_or(Ipv4Addr::UNSPECIFIED);

        let bus = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        bus.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        bus.set_reuse_port(true)?;
        bus.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())))?;
        let bus: UdpSocket = bus.into();
        bus.set_nonblocking(true)?;

        let mesh = UdpSocket::bind(SocketAddrV4::new(interface, 0))?;
        mesh.set_nonblocking(true)?;
        mesh.set_multicast_loop_v4(true)?;
        mesh.set_multicast_ttl_v4(ttl)?;

        let ip = local_ip(group, interface);
        let local = SocketAddr::new(ip.into(), mesh.local_addr()?.port());
        debug!(%local, %group, "udp transport bound");
        Ok(Self { bus, mesh, group, interface, local, joined: false, buf: vec![0u8; MAX_DATAGRAM] })
    }

    fn drain(&mut self, out: &mut Vec<Datagram>) -> Result<()> {
        for socket in [&self.bus, &self.mesh] {
            loop {
                match socket.recv_from(&mut self.buf) {
                    Ok((n, from)) => {
                        // Our own broadcasts come back through multicast loop.
                        if from == self.local {
                            continue;
                        }
                        out.push(Datagram { from, bytes: Bytes::copy_from_slice(&self.buf[..n]) });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    // ICMP port-unreachable from an earlier send surfaces here.
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

/// Address other hosts can reach us on: the source address the OS picks
/// for traffic to the group.
fn local_ip(group: SocketAddrV4, interface: Ipv4Addr) -> Ipv4Addr {
    if !interface.is_unspecified() {
        return interface;
    }
    let detect = || -> std::io::Result<Ipv4Addr> {
        let s = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        s.connect(group)?;
        match s.local_addr()? {
            SocketAddr::V4(a) if !a.ip().is_unspecified() => Ok(*a.ip()),
            _ => Ok(Ipv4Addr::LOCALHOST),
        }
    };
    detect().unwrap_or(Ipv4Addr::LOCALHOST)
}

impl Transport for UdpTransport {
    fn local_address(&self) -> SocketAddr {
        self.local
    }

    fn join_group(&mut self) -> Result<()> {
        if !self.joined {
            self.bus.join_multicast_v4(self.group.ip(), &self.interface)?;
            self.joined = true;
        }
        Ok(())
    }

    fn send(&mut self, to: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.mesh.send_to(bytes, to)?;
        Ok(())
    }

    fn broadcast(&mut self, bytes: &[u8]) -> Result<()> {
        self.mesh.send_to(bytes, self.group)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<Datagram>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        loop {
            self.drain(&mut out)?;
            let now = Instant::now();
            if !out.is_empty() || now >= deadline {
                trace!(count = out.len(), "udp receive");
                return Ok(out);
            }
            std::thread::sleep(IDLE_SLICE.min(deadline - now));
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if self.joined {
            let _ = self.bus.leave_multicast_v4(self.group.ip(), &self.interface);
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.local)
            .field("group", &self.group)
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}
