//! Representing unique L4 flows through socket address pairs.

use std::fmt;
use std::net::SocketAddr;

/// Unique transport flow, identified by both the source (local) and
/// destination (remote) socket addresses.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Socket {
    /// The source socket address (local IP and port).
    pub src: SocketAddr,
    /// The destination socket address (remote IP and port).
    pub dst: SocketAddr,
}

impl Socket {
    /// Creates a new socket pair.
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// Returns the same flow as seen from the other endpoint.
    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Returns `true` if both endpoints belong to the same address family.
    pub fn is_same_family(&self) -> bool {
        self.src.is_ipv4() == self.dst.is_ipv4()
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}
