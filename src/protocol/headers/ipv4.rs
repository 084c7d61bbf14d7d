use std::net::Ipv4Addr;

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use super::checksum;
use crate::{Error, HeaderError, ParseError};

bitflags! {
    /// Fragmentation control flags (the top 3 bits of header word 2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FragmentFlags: u16 {
        /// More fragments follow.
        const MF = 1 << 13;
        /// Do not fragment.
        const DF = 1 << 14;
    }
}

/// IPv4 Datagram Header.
///
/// RFC 791 (3.1)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |Version|  IHL  |Type of Service|          Total Length         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Identification        |Flags|      Fragment Offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Time to Live |    Protocol   |         Header Checksum       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Source Address                          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                    Destination Address                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Options of inbound datagrams are skipped using the IHL. Outbound
/// headers never carry options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words.
    ihl: u8,
    tos: u8,
    /// Header plus payload, in bytes.
    total_len: u16,
    id: u16,
    flags: FragmentFlags,
    /// In units of 8 bytes.
    fragment_offset: u16,
    ttl: u8,
    protocol: Protocol,
    header_checksum: u16,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Length of a header without options.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Length of a header with an IHL of 15.
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Largest payload the total length field leaves room for.
    pub const MAX_PAYLOAD_LEN: u16 = u16::MAX - Self::MIN_HEADER_LEN;

    /// TTL of datagrams built without a template.
    pub const DEFAULT_TTL: u8 = 64;

    const MIN_IHL: u8 = 5;
    const CHECKSUM_OFFSET: usize = 10;
    const FRAGMENT_OFFSET_MASK: u16 = 0x1FFF;

    /// Creates a header without options and with DF set.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload_len` does not fit the total length.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload_len: usize,
        ttl: u8,
        protocol: Protocol,
    ) -> crate::Result<Self> {
        let mut header = Self {
            ttl,
            protocol,
            src_addr: src,
            dst_addr: dst,
            ..Default::default()
        };

        header.set_payload_len(payload_len)?;

        Ok(header)
    }

    /// Always 4.
    pub fn version(&self) -> u8 {
        4
    }

    /// Header length in 32-bit words. See [Ipv4Header::header_len] for
    /// bytes.
    pub fn ihl(&self) -> u8 {
        self.ihl
    }

    /// Type of service.
    pub fn tos(&self) -> u8 {
        self.tos
    }

    /// Overwrites the type of service.
    pub fn set_tos(&mut self, tos: u8) {
        self.tos = tos;
    }

    /// Total length of the datagram.
    pub fn total_len(&self) -> u16 {
        self.total_len
    }

    /// Sets the total length for a payload of `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload_len` exceeds [Ipv4Header::MAX_PAYLOAD_LEN].
    pub fn set_payload_len(&mut self, payload_len: usize) -> crate::Result<()> {
        let max = Self::MAX_PAYLOAD_LEN;

        match u16::try_from(payload_len) {
            Ok(len) if len <= max => {
                self.total_len = self.header_len() as u16 + len;
                Ok(())
            }
            _ => Err(Error::Header(HeaderError::PayloadTooLarge {
                provided: payload_len,
                max,
            })),
        }
    }

    /// Identification used for reassembly.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Overwrites the identification.
    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    /// Fragmentation flags.
    pub fn flags(&self) -> FragmentFlags {
        self.flags
    }

    /// DF bit.
    pub fn dont_fragment(&self) -> bool {
        self.flags.contains(FragmentFlags::DF)
    }

    /// MF bit.
    pub fn more_fragments(&self) -> bool {
        self.flags.contains(FragmentFlags::MF)
    }

    /// Position of this fragment, in units of 8 bytes.
    pub fn fragment_offset(&self) -> u16 {
        self.fragment_offset
    }

    /// Returns `true` for a datagram that is part of a fragmented one.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    /// Time to live.
    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Protocol of the payload.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Overwrites the payload protocol.
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    /// Header checksum as stored.
    pub fn header_checksum(&self) -> u16 {
        self.header_checksum
    }

    /// Fills the header checksum.
    pub fn set_header_checksum(&mut self) {
        self.header_checksum = self.compute_header_checksum();
    }

    /// Zeroes the header checksum for a device that computes it.
    pub fn clear_header_checksum(&mut self) {
        self.header_checksum = 0;
    }

    /// Returns `true` if the stored checksum matches the header.
    pub fn is_valid_checksum(&self) -> bool {
        self.header_checksum == self.compute_header_checksum()
    }

    /// Source address.
    pub fn src(&self) -> Ipv4Addr {
        self.src_addr
    }

    /// Overwrites the source address.
    pub fn set_src(&mut self, src: Ipv4Addr) {
        self.src_addr = src;
    }

    /// Destination address.
    pub fn dst(&self) -> Ipv4Addr {
        self.dst_addr
    }

    /// Overwrites the destination address.
    pub fn set_dst(&mut self, dst: Ipv4Addr) {
        self.dst_addr = dst;
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Payload length implied by the total length.
    pub fn payload_len(&self) -> usize {
        // Parsing rejects a total length shorter than the header.
        self.total_len as usize - self.header_len()
    }

    /// Computes the RFC 1071 checksum over the header with a zero checksum
    /// field.
    pub fn compute_header_checksum(&self) -> u16 {
        let mut raw = self.to_be_bytes();
        raw[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 2].fill(0);

        checksum::checksum(&raw)
    }

    /// Serializes the header without options in network byte order.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> [u8; Self::MIN_HEADER_LEN as usize] {
        let mut raw = [0u8; Self::MIN_HEADER_LEN as usize];

        let mut buf = &mut raw[..];
        buf.put_u8(0x40 | Self::MIN_IHL);
        buf.put_u8(self.tos);
        buf.put_u16(self.total_len);
        buf.put_u16(self.id);
        buf.put_u16(self.flags.bits() | self.fragment_offset);
        buf.put_u8(self.ttl);
        buf.put_u8(self.protocol.into());
        buf.put_u16(self.header_checksum);
        buf.put_slice(&self.src_addr.octets());
        buf.put_slice(&self.dst_addr.octets());

        raw
    }

    /// Appends the serialized header to `output`. The checksum is written
    /// as stored.
    pub fn write<B: BufMut>(&self, output: &mut B) {
        output.put_slice(&self.to_be_bytes());
    }
}

impl TryFrom<&[u8]> for Ipv4Header {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: raw.len(),
                min: Self::MIN_HEADER_LEN,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let mut buf = raw;
        let version_ihl = buf.get_u8();
        let (version, ihl) = (version_ihl >> 4, version_ihl & 0x0F);

        if version != 4 {
            return Err(Error::Parse(ParseError::InvalidVersion {
                provided: version,
                expected: 4,
            }));
        }

        if ihl < Self::MIN_IHL {
            return Err(Error::Parse(ParseError::InvalidIhl {
                provided: ihl,
                min: Self::MIN_IHL,
            }));
        }

        let header_len = ihl as u16 * 4;

        // The options area is cut off.
        if raw.len() < header_len as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: raw.len(),
                min: header_len,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let tos = buf.get_u8();
        let total_len = buf.get_u16();

        if total_len < header_len {
            return Err(Error::Parse(ParseError::InvalidTotalLength {
                provided: total_len,
                expected: ihl * 4,
            }));
        }

        let id = buf.get_u16();
        let word = buf.get_u16();
        let ttl = buf.get_u8();
        let protocol = Protocol::try_from(buf.get_u8())?;
        let header_checksum = buf.get_u16();
        let src_addr = Ipv4Addr::from(buf.get_u32());
        let dst_addr = Ipv4Addr::from(buf.get_u32());

        Ok(Self {
            ihl,
            tos,
            total_len,
            id,
            flags: FragmentFlags::from_bits_truncate(word),
            fragment_offset: word & Self::FRAGMENT_OFFSET_MASK,
            ttl,
            protocol,
            header_checksum,
            src_addr,
            dst_addr,
        })
    }
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            ihl: Self::MIN_IHL,
            tos: 0,
            total_len: Self::MIN_HEADER_LEN,
            id: 0,
            flags: FragmentFlags::DF,
            fragment_offset: 0,
            ttl: Self::DEFAULT_TTL,
            protocol: Protocol::TCP,
            header_checksum: 0,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// IP protocol numbers (RFC 790) the engine carries. Any other protocol is
/// rejected when a packet is classified.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Protocol {
    /// Transmission Control Protocol.
    TCP = 6,
    /// User Datagram Protocol.
    UDP = 17,
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        proto as u8
    }
}

impl TryFrom<u8> for Protocol {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            6 => Ok(Protocol::TCP),
            17 => Ok(Protocol::UDP),
            _ => Err(Error::Parse(ParseError::InvalidProtocol(val))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // 192.168.0.1 -> 192.168.0.44, TCP, DF, 40 bytes of payload.
    const HEADER_BYTES: [u8; 20] = [
        0x45, 0x00, 0x00, 0x3c, 0xbe, 0xfa, 0x40, 0x00, 0x40, 0x06, 0xfa, 0x43, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0x2c,
    ];

    proptest! {
        #[test]
        fn ipv4_header_parsing_no_panic(raw in prop::collection::vec(any::<u8>(), 0..Ipv4Header::MAX_HEADER_LEN as usize)) {
            if let Ok(header) = Ipv4Header::try_from(&raw[..]) {
                prop_assert!(header.header_len() <= raw.len());
                prop_assert!(header.header_len() + header.payload_len() == header.total_len() as usize);
            }
        }
    }

    #[test]
    fn ipv4_header_captured() {
        let header = Ipv4Header::try_from(&HEADER_BYTES[..]).unwrap();

        assert_eq!(header.ihl(), 5);
        assert_eq!(header.tos(), 0);
        assert_eq!(header.total_len(), 60);
        assert_eq!(header.id(), 48890);
        assert_eq!(header.flags(), FragmentFlags::DF);
        assert!(!header.is_fragment());
        assert_eq!(header.ttl(), 64);
        assert_eq!(header.protocol(), Protocol::TCP);
        assert_eq!(header.header_checksum(), 0xFA43);
        assert!(header.is_valid_checksum());
        assert_eq!(header.src(), Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(header.dst(), Ipv4Addr::new(192, 168, 0, 44));
        assert_eq!(header.payload_len(), 40);

        let mut out = Vec::new();
        header.write(&mut out);
        assert_eq!(out, HEADER_BYTES);
    }

    #[test]
    fn ipv4_header_checksum_tracks_fields() {
        let mut header = Ipv4Header::try_from(&HEADER_BYTES[..]).unwrap();

        header.set_payload_len(22).unwrap();
        assert!(!header.is_valid_checksum());

        header.set_header_checksum();
        assert!(header.is_valid_checksum());
        assert_eq!(checksum::checksum(&header.to_be_bytes()), 0);
    }

    #[test]
    fn ipv4_header_fragments_detected() {
        let mut raw = HEADER_BYTES;

        // MF set.
        raw[6] = 0x20;
        let header = Ipv4Header::try_from(&raw[..]).unwrap();
        assert!(header.more_fragments());
        assert!(header.is_fragment());

        // Last fragment at offset 185 * 8.
        raw[6] = 0x00;
        raw[7] = 0xB9;
        let header = Ipv4Header::try_from(&raw[..]).unwrap();
        assert_eq!(header.fragment_offset(), 185);
        assert!(!header.dont_fragment());
        assert!(header.is_fragment());
    }

    #[test]
    fn ipv4_header_with_options_skipped() {
        let mut raw = [0u8; 24];
        raw[..20].copy_from_slice(&HEADER_BYTES);
        raw[0] = 0x46;

        let header = Ipv4Header::try_from(&raw[..]).unwrap();
        assert_eq!(header.header_len(), 24);
        assert_eq!(header.payload_len(), 36);

        assert!(matches!(
            Ipv4Header::try_from(&raw[..22]),
            Err(Error::Parse(ParseError::InvalidBufferLength { min: 24, .. }))
        ));
    }

    #[test]
    fn ipv4_header_payload_too_large_invalid() {
        let header = Ipv4Header::new(
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            Ipv4Header::MAX_PAYLOAD_LEN as usize + 1,
            64,
            Protocol::UDP,
        );

        assert!(matches!(
            header,
            Err(Error::Header(HeaderError::PayloadTooLarge { .. }))
        ));
    }

    #[test]
    fn ipv4_header_malformed_fields_invalid() {
        let mut raw = HEADER_BYTES;
        raw[0] = 0x65;
        assert!(matches!(
            Ipv4Header::try_from(&raw[..]),
            Err(Error::Parse(ParseError::InvalidVersion { provided: 6, .. }))
        ));

        let mut raw = HEADER_BYTES;
        raw[0] = 0x43;
        assert!(matches!(
            Ipv4Header::try_from(&raw[..]),
            Err(Error::Parse(ParseError::InvalidIhl { provided: 3, .. }))
        ));

        let mut raw = HEADER_BYTES;
        raw[2..4].fill(0);
        assert!(matches!(
            Ipv4Header::try_from(&raw[..]),
            Err(Error::Parse(ParseError::InvalidTotalLength { .. }))
        ));

        let mut raw = HEADER_BYTES;
        // ICMP
        raw[9] = 0x01;
        assert!(matches!(
            Ipv4Header::try_from(&raw[..]),
            Err(Error::Parse(ParseError::InvalidProtocol(1)))
        ));
    }
}
