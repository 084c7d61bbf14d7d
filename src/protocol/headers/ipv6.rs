use std::net::Ipv6Addr;

use bytes::BufMut;

use super::Protocol;
use crate::{Error, HeaderError, ParseError};

/// IPv6 Fixed Header.
///
/// # Note
///
/// Extension headers are not supported: the `next header` field must name
/// the upper-layer protocol directly.
///
/// RFC 8200 (3)
///
/// ```text
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |Version| Traffic Class |           Flow Label                  |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |         Payload Length        |  Next Header  |   Hop Limit   |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                         Source Address                        +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///   |                                                               |
///   +                      Destination Address                      +
///   |                                                               |
///   +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Version (4 bits), traffic class (8 bits) and flow label (20 bits).
    version_class_flow: u32,
    /// Length of the payload following this header, in octets.
    payload_len: u16,
    /// Identifies the type of header immediately following this header.
    next_header: Protocol,
    /// Decremented by 1 by each node that forwards the packet.
    hop_limit: u8,
    /// The source address.
    src_addr: Ipv6Addr,
    /// The destination address.
    dst_addr: Ipv6Addr,
}

impl Ipv6Header {
    /// Length of the IPv6 fixed header in bytes.
    pub const HEADER_LEN: u16 = 40;

    /// Default hop limit for engine-built packets.
    pub const DEFAULT_HOP_LIMIT: u8 = 64;

    /// Creates a new IPv6 header with the specified source and destination
    /// addresses, payload length, hop limit, and upper-layer protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the `payload_len` does not fit the 16-bit payload
    /// length field (jumbograms are not supported).
    pub fn new(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        payload_len: usize,
        hop_limit: u8,
        next_header: Protocol,
    ) -> crate::Result<Self> {
        let mut header = Self {
            // Version = 6
            version_class_flow: 6 << 28,
            payload_len: 0,
            next_header,
            hop_limit,
            src_addr: src,
            dst_addr: dst,
        };

        header.set_payload_len(payload_len)?;

        Ok(header)
    }

    /// Returns the `version` field of the IPv6 header.
    pub fn version(&self) -> u8 {
        // Stored in the higher 4 bits.
        (self.version_class_flow >> 28) as u8
    }

    /// Returns the `traffic class` field of the IPv6 header.
    pub fn traffic_class(&self) -> u8 {
        // Stored in bits 4..12.
        (self.version_class_flow >> 20) as u8
    }

    /// Sets the `traffic class` field of the IPv6 header.
    pub fn set_traffic_class(&mut self, class: u8) {
        self.version_class_flow &= !(0xFF << 20);
        self.version_class_flow |= (class as u32) << 20;
    }

    /// Returns the `flow label` field of the IPv6 header.
    pub fn flow_label(&self) -> u32 {
        // Stored in the lower 20 bits.
        self.version_class_flow & 0xF_FFFF
    }

    /// Returns the `payload length` field of the IPv6 header.
    pub fn payload_len(&self) -> usize {
        self.payload_len as usize
    }

    /// Sets the `payload length` field of the IPv6 header.
    ///
    /// # Errors
    ///
    /// Returns an error if the `payload_len` does not fit in 16 bits.
    pub fn set_payload_len(&mut self, payload_len: usize) -> crate::Result<()> {
        if payload_len > u16::MAX as usize {
            return Err(Error::Header(HeaderError::PayloadTooLarge {
                provided: payload_len,
                max: u16::MAX,
            }));
        }

        self.payload_len = payload_len as u16;

        Ok(())
    }

    /// Returns the `next header` field of the IPv6 header.
    pub fn next_header(&self) -> Protocol {
        self.next_header
    }

    /// Sets the `next header` field of the IPv6 header.
    pub fn set_next_header(&mut self, next_header: Protocol) {
        self.next_header = next_header;
    }

    /// Returns the `hop limit` field of the IPv6 header.
    pub fn hop_limit(&self) -> u8 {
        self.hop_limit
    }

    /// Returns the `source address` field of the IPv6 header.
    pub fn src(&self) -> Ipv6Addr {
        self.src_addr
    }

    /// Sets the `source address` field of the IPv6 header.
    pub fn set_src(&mut self, src: Ipv6Addr) {
        self.src_addr = src;
    }

    /// Returns the `destination address` field of the IPv6 header.
    pub fn dst(&self) -> Ipv6Addr {
        self.dst_addr
    }

    /// Sets the `destination address` field of the IPv6 header.
    pub fn set_dst(&mut self, dst: Ipv6Addr) {
        self.dst_addr = dst;
    }

    /// Returns the length of the IPv6 header in bytes.
    pub fn header_len(&self) -> usize {
        Self::HEADER_LEN as usize
    }

    /// Returns the memory representation of the IPv6 header as a byte array in
    /// big-endian (network) byte order.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> [u8; Self::HEADER_LEN as usize] {
        let mut raw_header = [0u8; Self::HEADER_LEN as usize];

        raw_header[0..4].copy_from_slice(&self.version_class_flow.to_be_bytes());
        raw_header[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        raw_header[6] = self.next_header.into();
        raw_header[7] = self.hop_limit;
        raw_header[8..24].copy_from_slice(&self.src_addr.octets());
        raw_header[24..40].copy_from_slice(&self.dst_addr.octets());

        raw_header
    }

    /// Writes the IPv6 header to the given buffer.
    pub fn write<B: BufMut>(&self, output: &mut B) {
        output.put_slice(&self.to_be_bytes());
    }
}

impl TryFrom<&[u8]> for Ipv6Header {
    type Error = Error;

    fn try_from(header_raw: &[u8]) -> Result<Self, Self::Error> {
        if header_raw.len() < Self::HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: header_raw.len(),
                min: Self::HEADER_LEN,
                max: Self::HEADER_LEN,
            }));
        }

        let version_class_flow =
            u32::from_be_bytes([header_raw[0], header_raw[1], header_raw[2], header_raw[3]]);

        if (version_class_flow >> 28) != 6 {
            return Err(Error::Parse(ParseError::InvalidVersion {
                provided: (version_class_flow >> 28) as u8,
                expected: 6,
            }));
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&header_raw[8..24]);

        let mut dst = [0u8; 16];
        dst.copy_from_slice(&header_raw[24..40]);

        Ok(Self {
            version_class_flow,
            payload_len: u16::from_be_bytes([header_raw[4], header_raw[5]]),
            next_header: Protocol::try_from(header_raw[6])?,
            hop_limit: header_raw[7],
            src_addr: Ipv6Addr::from(src),
            dst_addr: Ipv6Addr::from(dst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Ipv6Header {
        Ipv6Header::new(
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
            32,
            Ipv6Header::DEFAULT_HOP_LIMIT,
            Protocol::TCP,
        )
        .unwrap()
    }

    #[test]
    fn ipv6_header_parse_written_bytes_valid() {
        let mut header = header();
        header.set_traffic_class(0xb8);

        let bytes = header.to_be_bytes();
        assert_eq!(bytes[0] >> 4, 6);
        assert_eq!(bytes[6], 6);

        let parsed = Ipv6Header::try_from(&bytes[..]).unwrap();

        assert_eq!(parsed.version(), 6);
        assert_eq!(parsed.traffic_class(), 0xb8);
        assert_eq!(parsed.flow_label(), 0);
        assert_eq!(parsed.payload_len(), 32);
        assert_eq!(parsed.next_header(), Protocol::TCP);
        assert_eq!(parsed.hop_limit(), 64);
        assert_eq!(parsed.src(), "fe80::1".parse::<Ipv6Addr>().unwrap());
        assert_eq!(parsed.dst(), "fe80::2".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ipv6_header_version_invalid() {
        let mut bytes = header().to_be_bytes();
        bytes[0] = 0x45;

        assert!(matches!(
            Ipv6Header::try_from(&bytes[..]),
            Err(Error::Parse(ParseError::InvalidVersion { provided: 4, .. }))
        ));
    }

    #[test]
    fn ipv6_header_extension_header_invalid() {
        let mut bytes = header().to_be_bytes();
        // Hop-by-Hop Options.
        bytes[6] = 0;

        assert!(Ipv6Header::try_from(&bytes[..]).is_err());
    }

    #[test]
    fn ipv6_header_buffer_length_invalid() {
        let bytes = header().to_be_bytes();

        assert!(Ipv6Header::try_from(&bytes[..39]).is_err());
    }
}
