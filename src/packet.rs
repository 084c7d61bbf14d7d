//! Packet buffers exchanged with the engine.
//!
//! A [Packet] is a contiguous frame with headroom in front of the data
//! offset, so headers can be prepended without copying the payload. Layer
//! lengths and classification bits describe where each header lives:
//!
//! ```text
//!   inbound (rx_bulk, synreqs, recv):
//!
//!   +-----------+----------+----------+----------+----------------+
//!   | headroom  |    L2    |    L3    |    L4    |    payload     |
//!   +-----------+----------+----------+----------+----------------+
//!                                                ^ data offset
//!
//!   outbound (tx_bulk):
//!
//!   +-----------+----------+----------+----------+----------------+
//!   | headroom  |    L2    |    L3    |    L4    |    payload     |
//!   +-----------+----------+----------+----------+----------------+
//!               ^ data offset
//! ```

use std::fmt;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};

use crate::ctx::DeviceId;
use crate::protocol::headers::{Ipv4Header, Ipv6Header, Protocol, TcpHeader, UdpHeader};
use crate::{Error, HeaderError, ParseError, Result};

/// Headroom reserved by [Packet::with_headroom] callers that will hand the
/// packet to the engine for transmission: Ethernet + IPv6 + TCP with options.
pub const DEFAULT_HEADROOM: usize = 14 + 40 + 60;

/// Length of an Ethernet II header without VLAN tags.
pub const ETHER_HDR_LEN: u16 = 14;

bitflags! {
    /// Classification bits describing which headers a packet carries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketType: u32 {
        /// Ethernet II header.
        const L2_ETHER = 1 << 0;
        /// IPv4 header (options allowed on ingress).
        const L3_IPV4 = 1 << 4;
        /// IPv6 fixed header.
        const L3_IPV6 = 1 << 5;
        /// TCP segment.
        const L4_TCP = 1 << 8;
        /// UDP datagram.
        const L4_UDP = 1 << 9;
    }
}

bitflags! {
    /// Per-packet offload bits.
    ///
    /// `RX_*` bits are reported by a device that validated checksums; `TX_*`
    /// bits request the device to complete checksums the engine left
    /// unfinished.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OffloadFlags: u64 {
        /// The device verified the IPv4 header checksum.
        const RX_IP_CKSUM_GOOD = 1 << 0;
        /// The device found the IPv4 header checksum to be wrong.
        const RX_IP_CKSUM_BAD = 1 << 1;
        /// The device verified the L4 checksum.
        const RX_L4_CKSUM_GOOD = 1 << 2;
        /// The device found the L4 checksum to be wrong.
        const RX_L4_CKSUM_BAD = 1 << 3;
        /// The packet carries an IPv4 header.
        const TX_IPV4 = 1 << 8;
        /// The packet carries an IPv6 header.
        const TX_IPV6 = 1 << 9;
        /// The device must compute the IPv4 header checksum.
        const TX_IP_CKSUM = 1 << 10;
        /// The device must complete the TCP checksum from the pseudo header
        /// sum stored in the checksum field.
        const TX_TCP_CKSUM = 1 << 11;
        /// The device must complete the UDP checksum from the pseudo header
        /// sum stored in the checksum field.
        const TX_UDP_CKSUM = 1 << 12;
    }
}

/// A network packet with header-offset metadata.
#[derive(Clone)]
pub struct Packet {
    /// Frame storage, including headroom.
    buf: BytesMut,
    /// Offset of the first data byte within `buf`.
    data_off: usize,
    /// Length of the L2 header in bytes.
    pub l2_len: u16,
    /// Length of the L3 header in bytes.
    pub l3_len: u16,
    /// Length of the L4 header in bytes.
    pub l4_len: u16,
    /// Classification of the headers present.
    pub packet_type: PacketType,
    /// Checksum offload state.
    pub ol_flags: OffloadFlags,
    /// Device the packet was received on, set by `rx_bulk`.
    pub rx_device: Option<DeviceId>,
}

impl Packet {
    /// Creates a packet holding `payload` with `headroom` bytes reserved in
    /// front of it.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(headroom + payload.len());
        buf.resize(headroom, 0);
        buf.extend_from_slice(payload);

        Self {
            buf,
            data_off: headroom,
            ..Self::empty()
        }
    }

    /// Creates an unclassified packet whose data offset is the first byte of
    /// `frame`.
    pub fn from_frame(frame: impl Into<BytesMut>) -> Self {
        Self {
            buf: frame.into(),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            buf: BytesMut::new(),
            data_off: 0,
            l2_len: 0,
            l3_len: 0,
            l4_len: 0,
            packet_type: PacketType::empty(),
            ol_flags: OffloadFlags::empty(),
            rx_device: None,
        }
    }

    /// Software classification of a raw frame.
    ///
    /// Parses the IP and L4 headers following an L2 header of `l2_len` bytes,
    /// sets the layer lengths and type bits, trims link-layer padding past
    /// the IP payload, and moves the data offset past the L4 header.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not carry a well-formed IPv4/IPv6
    /// header followed by a TCP or UDP header.
    pub fn classify(frame: impl Into<BytesMut>, l2_len: u16) -> Result<Self> {
        let mut pkt = Self::from_frame(frame);
        let l2 = l2_len as usize;

        let Some(&first) = pkt.buf.get(l2) else {
            return Err(Error::Parse(ParseError::InvalidLayout("frame ends before L3")));
        };

        let (l3_len, ip_end, proto, l3_type) = match first >> 4 {
            4 => {
                let ip = Ipv4Header::try_from(&pkt.buf[l2..])?;
                (ip.header_len(), l2 + ip.total_len() as usize, ip.protocol(), PacketType::L3_IPV4)
            }
            6 => {
                let ip = Ipv6Header::try_from(&pkt.buf[l2..])?;
                (
                    ip.header_len(),
                    l2 + ip.header_len() + ip.payload_len(),
                    ip.next_header(),
                    PacketType::L3_IPV6,
                )
            }
            version => {
                return Err(Error::Parse(ParseError::InvalidVersion {
                    provided: version,
                    expected: 4,
                }));
            }
        };

        if ip_end > pkt.buf.len() {
            return Err(Error::Parse(ParseError::InvalidLayout(
                "IP length exceeds frame",
            )));
        }

        // Link-layer padding.
        pkt.buf.truncate(ip_end);

        let l4 = l2 + l3_len;
        let (l4_len, l4_type) = match proto {
            Protocol::TCP => (
                TcpHeader::try_from(&pkt.buf[l4..])?.header_len(),
                PacketType::L4_TCP,
            ),
            Protocol::UDP => {
                UdpHeader::try_from(&pkt.buf[l4..])?;
                (UdpHeader::HEADER_LEN as usize, PacketType::L4_UDP)
            }
        };

        pkt.l2_len = l2_len;
        pkt.l3_len = l3_len as u16;
        pkt.l4_len = l4_len as u16;
        pkt.packet_type = l3_type | l4_type;
        if l2_len == ETHER_HDR_LEN {
            pkt.packet_type |= PacketType::L2_ETHER;
        }
        pkt.data_off = l4 + l4_len;

        Ok(pkt)
    }

    /// Returns the bytes from the data offset to the end of the packet.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data_off..]
    }

    /// Returns the mutable bytes from the data offset to the end of the
    /// packet.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_off..]
    }

    /// Returns the number of bytes past the data offset.
    pub fn len(&self) -> usize {
        self.buf.len() - self.data_off
    }

    /// Returns `true` if no bytes follow the data offset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes available in front of the data offset.
    pub fn headroom(&self) -> usize {
        self.data_off
    }

    /// Moves the data offset `len` bytes towards the front of the buffer and
    /// returns the newly exposed bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if there is less than `len` bytes of headroom.
    pub fn prepend(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > self.data_off {
            return Err(Error::Header(HeaderError::InsufficientHeadroom {
                needed: len,
                available: self.data_off,
            }));
        }

        self.data_off -= len;

        Ok(&mut self.buf[self.data_off..self.data_off + len])
    }

    /// Strips `len` bytes from the front of the data, returning `false` if
    /// fewer bytes are available.
    pub fn adj(&mut self, len: usize) -> bool {
        if len > self.len() {
            return false;
        }

        self.data_off += len;

        true
    }

    /// Removes `len` bytes from the tail of the data, returning `false` if
    /// fewer bytes are available.
    pub fn trim(&mut self, len: usize) -> bool {
        if len > self.len() {
            return false;
        }

        self.buf.truncate(self.buf.len() - len);

        true
    }

    /// Returns the classified L2, L3 and L4 headers in front of the data
    /// offset of an inbound packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer lengths exceed the headroom.
    pub fn headers(&self) -> Result<&[u8]> {
        let start = self.headers_start()?;

        Ok(&self.buf[start..self.data_off])
    }

    /// Returns the L3 header of an inbound packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer lengths exceed the headroom.
    pub fn l3_header(&self) -> Result<&[u8]> {
        let start = self.headers_start()? + self.l2_len as usize;

        Ok(&self.buf[start..start + self.l3_len as usize])
    }

    /// Returns the L4 header and payload of an inbound packet as one
    /// contiguous slice, as covered by the L4 checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer lengths exceed the headroom.
    pub fn l4_segment(&self) -> Result<&[u8]> {
        let start = self.data_off.checked_sub(self.l4_len as usize).ok_or(Error::Parse(
            ParseError::InvalidLayout("L4 header exceeds headroom"),
        ))?;

        Ok(&self.buf[start..])
    }

    fn headers_start(&self) -> Result<usize> {
        let hdrs = self.l2_len as usize + self.l3_len as usize + self.l4_len as usize;

        self.data_off.checked_sub(hdrs).ok_or(Error::Parse(ParseError::InvalidLayout(
            "layer lengths exceed headroom",
        )))
    }

    /// Consumes the packet, returning the bytes from the data offset onwards.
    pub fn into_bytes(mut self) -> Bytes {
        self.buf.split_off(self.data_off).freeze()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("headroom", &self.data_off)
            .field("l2_len", &self.l2_len)
            .field("l3_len", &self.l3_len)
            .field("l4_len", &self.l4_len)
            .field("packet_type", &self.packet_type)
            .field("ol_flags", &self.ol_flags)
            .field("rx_device", &self.rx_device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tcp_frame(payload: &[u8], padding: usize) -> Vec<u8> {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        let mut tcp = TcpHeader::new(1000, 80, 1, 1024);
        tcp.set_ack();
        tcp.set_checksum(IpAddr::V4(src), IpAddr::V4(dst), payload);

        let mut ip = Ipv4Header::new(src, dst, tcp.header_len() + payload.len(), 64, Protocol::TCP)
            .unwrap();
        ip.set_header_checksum();

        let mut frame = vec![0u8; ETHER_HDR_LEN as usize];
        ip.write(&mut frame);
        tcp.write(&mut frame);
        frame.extend_from_slice(payload);
        frame.extend(std::iter::repeat_n(0u8, padding));
        frame
    }

    #[test]
    fn packet_classify_tcp_frame() {
        let pkt = Packet::classify(BytesMut::from(&tcp_frame(b"hello", 4)[..]), ETHER_HDR_LEN).unwrap();

        assert_eq!(pkt.l2_len, 14);
        assert_eq!(pkt.l3_len, 20);
        assert_eq!(pkt.l4_len, 20);
        assert_eq!(
            pkt.packet_type,
            PacketType::L2_ETHER | PacketType::L3_IPV4 | PacketType::L4_TCP
        );
        // Padding trimmed.
        assert_eq!(pkt.data(), b"hello");
        assert_eq!(pkt.headers().unwrap().len(), 54);
        assert_eq!(pkt.l3_header().unwrap()[0], 0x45);
        assert_eq!(pkt.l4_segment().unwrap().len(), 25);
    }

    #[test]
    fn packet_classify_truncated_invalid() {
        let frame = tcp_frame(b"hello", 0);

        assert!(Packet::classify(BytesMut::from(&frame[..40]), ETHER_HDR_LEN).is_err());
        assert!(Packet::classify(BytesMut::from(&frame[..10]), ETHER_HDR_LEN).is_err());
    }

    #[test]
    fn packet_prepend_respects_headroom() {
        let mut pkt = Packet::with_headroom(8, b"data");

        assert_eq!(pkt.headroom(), 8);
        pkt.prepend(8).unwrap().copy_from_slice(b"HEADERS!");
        assert_eq!(pkt.data(), b"HEADERS!data");

        assert!(matches!(
            pkt.prepend(1),
            Err(Error::Header(HeaderError::InsufficientHeadroom {
                needed: 1,
                available: 0
            }))
        ));
    }

    #[test]
    fn packet_adj_and_trim() {
        let mut pkt = Packet::with_headroom(0, b"0123456789");

        assert!(pkt.adj(3));
        assert!(pkt.trim(2));
        assert_eq!(pkt.data(), b"34567");
        assert!(!pkt.adj(6));
        assert!(!pkt.trim(6));
        assert_eq!(pkt.into_bytes(), Bytes::from_static(b"34567"));
    }
}
