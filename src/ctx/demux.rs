//! Demultiplexing tables: local port reservations and established
//! connections.

use std::collections::HashMap;
use std::net::SocketAddr;

use super::StreamHandle;
use crate::protocol::Socket;
use crate::{Error, Result};

/// First port of the ephemeral range (RFC 6335).
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Last port of the ephemeral range (RFC 6335).
pub const EPHEMERAL_PORT_MAX: u16 = 65535;

const EPHEMERAL_PORT_COUNT: u32 = (EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) as u32 + 1;

/// Address family of a local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { Family::V4 } else { Family::V6 }
    }

    pub(crate) fn is_v4(self) -> bool {
        self == Family::V4
    }
}

/// Streams reachable from inbound packets.
///
/// Bound streams are found by local port, one per port and family across
/// the context. TCP connections are found by their full socket pair, which
/// takes precedence.
#[derive(Debug, Default)]
pub(crate) struct Demux {
    ports: HashMap<(Family, u16), StreamHandle>,
    conns: HashMap<Socket, StreamHandle>,
    /// Offset into the ephemeral range where the next search starts.
    next_ephemeral: u32,
}

impl Demux {
    /// Reserves `port` (or an ephemeral port when 0) for `handle`, returning
    /// the port reserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the port is blocked, already reserved, or the
    /// ephemeral range is exhausted.
    pub(crate) fn reserve(
        &mut self,
        local: SocketAddr,
        handle: StreamHandle,
        is_blocked: impl Fn(u16) -> bool,
    ) -> Result<u16> {
        let family = Family::of(&local);

        if local.port() != 0 {
            if is_blocked(local.port()) {
                return Err(Error::InvalidConfig("local port is blocked"));
            }

            if self.ports.contains_key(&(family, local.port())) {
                return Err(Error::AddrInUse(local));
            }

            self.ports.insert((family, local.port()), handle);

            return Ok(local.port());
        }

        for i in 0..EPHEMERAL_PORT_COUNT {
            let offset = (self.next_ephemeral + i) % EPHEMERAL_PORT_COUNT;
            let port = EPHEMERAL_PORT_MIN + offset as u16;

            if is_blocked(port) || self.ports.contains_key(&(family, port)) {
                continue;
            }

            self.ports.insert((family, port), handle);
            self.next_ephemeral = (offset + 1) % EPHEMERAL_PORT_COUNT;

            return Ok(port);
        }

        Err(Error::OutOfResources("ephemeral ports exhausted"))
    }

    /// Releases the reservation of `local` if it belongs to `handle`.
    pub(crate) fn unreserve(&mut self, local: SocketAddr, handle: StreamHandle) {
        let key = (Family::of(&local), local.port());

        if self.ports.get(&key) == Some(&handle) {
            self.ports.remove(&key);
        }
    }

    /// Registers a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket pair is already in use.
    pub(crate) fn insert_conn(&mut self, sock: Socket, handle: StreamHandle) -> Result<()> {
        if self.conns.contains_key(&sock) {
            return Err(Error::AddrInUse(sock.src));
        }

        self.conns.insert(sock, handle);

        Ok(())
    }

    /// Removes the connection `sock` if it belongs to `handle`.
    pub(crate) fn remove_conn(&mut self, sock: &Socket, handle: StreamHandle) {
        if self.conns.get(sock) == Some(&handle) {
            self.conns.remove(sock);
        }
    }

    /// Finds the stream for an inbound packet on `sock` (local, remote).
    /// The flag is `true` for a connection match and `false` for a bound
    /// port match.
    pub(crate) fn lookup(&self, sock: &Socket) -> Option<(StreamHandle, bool)> {
        if let Some(handle) = self.conns.get(sock) {
            return Some((*handle, true));
        }

        self.ports
            .get(&(Family::of(&sock.src), sock.src.port()))
            .map(|handle| (*handle, false))
    }
}
