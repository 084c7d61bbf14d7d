//! TCP segments exchanged between the connection state machine and the
//! context's framing layer.

use bytes::Bytes;

use crate::protocol::headers::TcpHeader;

/// TCP header paired with its payload.
///
/// The IP header is not part of the segment: it is derived from the
/// stream's destination when the segment is framed for a device.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    /// TCP header of the segment.
    pub tcp: TcpHeader,
    /// Payload of the segment.
    pub payload: Bytes,
}

impl TcpSegment {
    /// Create a new TCP segment given the TCP header and payload.
    pub fn new(tcp: TcpHeader, payload: Bytes) -> Self {
        Self { tcp, payload }
    }

    /// Create a TCP segment that carries no payload.
    pub fn control(tcp: TcpHeader) -> Self {
        Self {
            tcp,
            payload: Bytes::new(),
        }
    }

    /// The number of octets of sequence space occupied by the segment
    /// (counting SYN and FIN).
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.tcp.syn() as u32 + self.tcp.fin() as u32
    }

    /// Sequence number one past the last octet occupied by the segment.
    pub fn seq_end(&self) -> u32 {
        self.tcp.seq_number().wrapping_add(self.seq_len())
    }
}
