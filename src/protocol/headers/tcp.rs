use std::net::IpAddr;

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use super::{Protocol, checksum};
use crate::{Error, HeaderError, ParseError};

bitflags! {
    /// TCP control bits, as carried in the low byte of header word 6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        /// No more data from sender.
        const FIN = 1 << 0;
        /// Synchronize sequence numbers.
        const SYN = 1 << 1;
        /// Reset the connection.
        const RST = 1 << 2;
        /// Push function.
        const PSH = 1 << 3;
        /// Acknowledgment field significant.
        const ACK = 1 << 4;
        /// Urgent pointer field significant.
        const URG = 1 << 5;
    }
}

/// TCP Segment Header.
///
/// RFC 793 (3.1)
///
/// ```text
///     0                   1                   2                   3
///     0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |          Source Port          |       Destination Port        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                        Sequence Number                        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Acknowledgment Number                      |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |  Data |           |U|A|P|R|S|F|                               |
///    | Offset| Reserved  |R|C|S|S|Y|I|            Window             |
///    |       |           |G|K|H|T|N|N|                               |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |           Checksum            |         Urgent Pointer        |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///    |                    Options                    |    Padding    |
///    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The data offset is not stored: it always follows from the options
/// length. Reserved bits are dropped on parse and sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq_number: u32,
    ack_number: u32,
    flags: TcpFlags,
    window: u16,
    checksum: u16,
    urgent_pointer: u16,
    options: TcpOptions,
}

impl TcpHeader {
    /// Length of a TCP header without options.
    pub const MIN_HEADER_LEN: u16 = 20;

    /// Length of a TCP header with a data offset of 15.
    pub const MAX_HEADER_LEN: u16 = 60;

    /// Data offset of a header without options, in 32-bit words.
    pub const MIN_DATA_OFFSET: u16 = 5;

    /// Largest data offset the 4-bit field holds.
    pub const MAX_DATA_OFFSET: u16 = 15;

    /// Offset of the checksum field within the header.
    const CHECKSUM_OFFSET: usize = 16;

    /// Creates a header with no control bits and no options.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, window: u16) -> Self {
        Self {
            src_port,
            dst_port,
            seq_number,
            window,
            ..Default::default()
        }
    }

    /// Source port.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Destination port.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Sequence number of the first octet of the segment (the ISN when SYN
    /// is set).
    pub fn seq_number(&self) -> u32 {
        self.seq_number
    }

    /// Overwrites the sequence number.
    pub fn set_seq_number(&mut self, seq: u32) {
        self.seq_number = seq;
    }

    /// Next sequence number the sender expects, meaningful only with ACK.
    pub fn ack_number(&self) -> u32 {
        self.ack_number
    }

    /// Overwrites the acknowledgment number. The ACK bit is left alone.
    pub fn set_ack_number(&mut self, ack: u32) {
        self.ack_number = ack;
    }

    /// Header length in 32-bit words. See [TcpHeader::header_len] for bytes.
    pub fn data_offset(&self) -> u8 {
        (Self::MIN_DATA_OFFSET as usize + self.options.len() / 4) as u8
    }

    /// Control bits of the header.
    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    /// URG bit.
    pub fn urg(&self) -> bool {
        self.flags.contains(TcpFlags::URG)
    }

    /// ACK bit.
    pub fn ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    /// Sets the ACK bit.
    pub fn set_ack(&mut self) {
        self.flags.insert(TcpFlags::ACK);
    }

    /// PSH bit.
    pub fn psh(&self) -> bool {
        self.flags.contains(TcpFlags::PSH)
    }

    /// Sets the PSH bit.
    pub fn set_psh(&mut self) {
        self.flags.insert(TcpFlags::PSH);
    }

    /// RST bit.
    pub fn rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }

    /// Sets the RST bit.
    pub fn set_rst(&mut self) {
        self.flags.insert(TcpFlags::RST);
    }

    /// SYN bit.
    pub fn syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    /// Sets the SYN bit.
    pub fn set_syn(&mut self) {
        self.flags.insert(TcpFlags::SYN);
    }

    /// FIN bit.
    pub fn fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    /// Sets the FIN bit.
    pub fn set_fin(&mut self) {
        self.flags.insert(TcpFlags::FIN);
    }

    /// Advertised receive window.
    pub fn window(&self) -> u16 {
        self.window
    }

    /// Overwrites the advertised receive window.
    pub fn set_window(&mut self, window: u16) {
        self.window = window;
    }

    /// Checksum field as stored (not verified).
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Fills the checksum field for a segment carrying `payload` between
    /// `src` and `dst`.
    pub fn set_checksum(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) {
        self.checksum = self.compute_checksum(src, dst, payload);
    }

    /// Leaves the folded pseudo header sum in the checksum field, which is
    /// what a device completing the checksum in hardware expects.
    pub fn set_pseudo_header_checksum(&mut self, src: IpAddr, dst: IpAddr, payload_len: usize) {
        let len = (self.header_len() + payload_len) as u32;
        let sum = checksum::pseudo_header_sum(src, dst, Protocol::TCP.into(), len);

        self.checksum = checksum::fold(sum);
    }

    /// Returns `true` if the checksum field matches the segment.
    pub fn is_valid_checksum(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> bool {
        self.checksum == self.compute_checksum(src, dst, payload)
    }

    /// Urgent pointer, meaningful only with URG.
    pub fn urgent_pointer(&self) -> u16 {
        self.urgent_pointer
    }

    /// Options following the fixed header.
    pub fn options(&self) -> &TcpOptions {
        &self.options
    }

    /// Adds the MSS option. Only meaningful on SYN segments.
    ///
    /// # Errors
    ///
    /// Returns an error for an MSS of zero or when the options are full.
    pub fn set_option_mss(&mut self, mss: u16) -> crate::Result<()> {
        self.options.set_mss(mss)
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        Self::MIN_HEADER_LEN as usize + self.options.len()
    }

    /// Computes the checksum over the pseudo header, this header (with a
    /// zero checksum field) and `payload`.
    pub fn compute_checksum(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> u16 {
        let (mut raw, len) = self.to_be_bytes();
        raw[Self::CHECKSUM_OFFSET..Self::CHECKSUM_OFFSET + 2].fill(0);

        let total = (len + payload.len()) as u32;
        let sum = checksum::pseudo_header_sum(src, dst, Protocol::TCP.into(), total);

        // The header length is a multiple of 4, so the payload starts on a
        // word boundary.
        let sum = checksum::accumulate(checksum::accumulate(sum, &raw[..len]), payload);

        !checksum::fold(sum)
    }

    /// Serializes the header in network byte order into a buffer sized for
    /// the largest header, returning it with the number of bytes used.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> ([u8; Self::MAX_HEADER_LEN as usize], usize) {
        let mut raw = [0u8; Self::MAX_HEADER_LEN as usize];
        let len = self.header_len();

        let mut buf = &mut raw[..len];
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq_number);
        buf.put_u32(self.ack_number);
        buf.put_u8(self.data_offset() << 4);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent_pointer);
        buf.put_slice(self.options.as_slice());

        (raw, len)
    }

    /// Appends the serialized header to `output`. The checksum is written
    /// as stored.
    pub fn write<B: BufMut>(&self, output: &mut B) {
        let (raw, len) = self.to_be_bytes();
        output.put_slice(&raw[..len]);
    }
}

impl TryFrom<&[u8]> for TcpHeader {
    type Error = Error;

    /// Parses the header at the start of `raw`. Bytes past the data offset
    /// are payload and left alone.
    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() < Self::MIN_HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: raw.len(),
                min: Self::MIN_HEADER_LEN,
                max: Self::MAX_HEADER_LEN,
            }));
        }

        let mut buf = raw;
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq_number = buf.get_u32();
        let ack_number = buf.get_u32();
        let data_offset = (buf.get_u8() >> 4) as u16;
        let flags = TcpFlags::from_bits_truncate(buf.get_u8());
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let urgent_pointer = buf.get_u16();

        if data_offset < Self::MIN_DATA_OFFSET {
            return Err(Error::Parse(ParseError::InvalidDataOffset {
                provided: data_offset,
                min: Self::MIN_DATA_OFFSET,
                max: Self::MAX_DATA_OFFSET,
            }));
        }

        let header_len = data_offset * 4;
        let Some(options) = raw.get(Self::MIN_HEADER_LEN as usize..header_len as usize) else {
            return Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: raw.len(),
                expected: header_len,
            }));
        };

        Ok(Self {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags,
            window,
            checksum,
            urgent_pointer,
            options: TcpOptions::try_from(options)?,
        })
    }
}

/// Options area of a TCP header, kept as raw bytes padded to a multiple of
/// four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpOptions {
    len: usize,
    buf: [u8; Self::MAX_OPTIONS_LEN],
}

impl TcpOptions {
    /// Room left for options by the 4-bit data offset.
    pub const MAX_OPTIONS_LEN: usize = 40;

    /// Kind, length, and a 16-bit value.
    pub const MSS_LEN: usize = 4;

    /// Creates an empty options area.
    pub fn new() -> Self {
        Self {
            len: 0,
            buf: [0; Self::MAX_OPTIONS_LEN],
        }
    }

    /// Returns the MSS option value, if present and well formed.
    pub fn mss(&self) -> Option<u16> {
        self.iter()
            .find(|(kind, _)| *kind == OptionKind::MSS)
            .and_then(|(_, value)| <[u8; 2]>::try_from(value).ok())
            .map(u16::from_be_bytes)
    }

    /// Appends an MSS option. A second call keeps the existing value.
    ///
    /// # Errors
    ///
    /// Returns an error for an MSS of zero or when the options are full.
    pub fn set_mss(&mut self, mss: u16) -> crate::Result<()> {
        if self.mss().is_some() {
            return Ok(());
        }

        if mss == 0 {
            return Err(Error::Header(HeaderError::InvalidMssOption));
        }

        let end = self.len + Self::MSS_LEN;

        if end > Self::MAX_OPTIONS_LEN {
            return Err(Error::Header(HeaderError::InsufficientOptionSpace {
                attempted_len: end,
                current_len: self.len,
                max_len: Self::MAX_OPTIONS_LEN,
            }));
        }

        let mut slot = &mut self.buf[self.len..end];
        slot.put_u8(OptionKind::MSS.into());
        slot.put_u8(Self::MSS_LEN as u8);
        slot.put_u16(mss);
        self.len = end;

        Ok(())
    }

    /// Length in bytes, padding included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no options.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw option bytes, padding included.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Walks the options up to the end-of-list marker, yielding each kind
    /// with its value bytes. Stops at the first malformed option.
    fn iter(&self) -> impl Iterator<Item = (OptionKind, &[u8])> + '_ {
        let mut rest = self.as_slice();

        std::iter::from_fn(move || {
            loop {
                let (&kind, tail) = rest.split_first()?;

                match OptionKind::from(kind) {
                    OptionKind::EOL => return None,
                    OptionKind::NOP => rest = tail,
                    kind => {
                        let len = *tail.first()? as usize;

                        if len < 2 || len > rest.len() {
                            return None;
                        }

                        let value = &rest[2..len];
                        rest = &rest[len..];

                        return Some((kind, value));
                    }
                }
            }
        })
    }
}

impl TryFrom<&[u8]> for TcpOptions {
    type Error = Error;

    fn try_from(raw: &[u8]) -> Result<Self, Self::Error> {
        if raw.len() > Self::MAX_OPTIONS_LEN {
            return Err(Error::Parse(ParseError::InvalidOptionsLength {
                provided: raw.len(),
                max: Self::MAX_OPTIONS_LEN,
            }));
        }

        let mut options = Self::new();
        options.buf[..raw.len()].copy_from_slice(raw);
        // Zero padding reads as end-of-list.
        options.len = raw.len().next_multiple_of(4);

        Ok(options)
    }
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP option kinds (RFC 793 3.1, RFC 9293 3.2).
///
/// ```text
///      Kind     Length    Meaning
///      ----     ------    -------
///       0         -       End of option list.
///       1         -       No-Operation.
///       2         4       Maximum Segment Size.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum OptionKind {
    /// End of option list.
    EOL,
    /// Padding between options.
    NOP,
    /// Largest segment the sender of a SYN can receive.
    MSS,
    /// Recognised by length only (window scale, SACK, timestamps, ...).
    Unknown(u8),
}

impl From<u8> for OptionKind {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::EOL,
            1 => Self::NOP,
            2 => Self::MSS,
            other => Self::Unknown(other),
        }
    }
}

impl From<OptionKind> for u8 {
    fn from(kind: OptionKind) -> u8 {
        match kind {
            OptionKind::EOL => 0,
            OptionKind::NOP => 1,
            OptionKind::MSS => 2,
            OptionKind::Unknown(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    // SYN captured from a Linux client: MSS, SACK permitted, timestamps, NOP,
    // window scale.
    const SYN_BYTES: [u8; 40] = [
        0xa0, 0x16, 0x01, 0xbb, 0xbc, 0xbb, 0x54, 0xa8, 0x00, 0x00, 0x00, 0x00, 0xa0, 0x02, 0xfa,
        0xf0, 0xbb, 0x4c, 0x00, 0x00, 0x02, 0x04, 0x05, 0xb4, 0x04, 0x02, 0x08, 0x0a, 0x78, 0x27,
        0xe4, 0xe7, 0x00, 0x00, 0x00, 0x00, 0x01, 0x03, 0x03, 0x07,
    ];

    fn addrs() -> (IpAddr, IpAddr) {
        (
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 0, 44)),
        )
    }

    proptest! {
        #[test]
        fn tcp_header_parsing_no_panic(raw in prop::collection::vec(any::<u8>(), 0..96)) {
            if let Ok(header) = TcpHeader::try_from(&raw[..]) {
                prop_assert!(header.header_len() <= raw.len());
                prop_assert_eq!(header.data_offset() as usize * 4, header.header_len());
                let _ = header.options().mss();
            }
        }
    }

    #[test]
    fn tcp_header_captured_syn() {
        let header = TcpHeader::try_from(&SYN_BYTES[..]).unwrap();

        assert_eq!(header.src_port(), 40982);
        assert_eq!(header.dst_port(), 443);
        assert_eq!(header.seq_number(), 3166393512);
        assert_eq!(header.ack_number(), 0);
        assert_eq!(header.data_offset(), 10);
        assert_eq!(header.flags(), TcpFlags::SYN);
        assert_eq!(header.window(), 64240);
        assert_eq!(header.checksum(), 0xBB4C);
        assert_eq!(header.urgent_pointer(), 0);
        assert_eq!(header.options().len(), 20);
        assert_eq!(header.options().mss(), Some(1460));

        let (raw, len) = header.to_be_bytes();
        assert_eq!(&raw[..len], &SYN_BYTES[..]);
    }

    #[test]
    fn tcp_header_trailing_payload_ignored() {
        let mut segment = SYN_BYTES.to_vec();
        segment.extend_from_slice(b"payload");

        let header = TcpHeader::try_from(&segment[..]).unwrap();

        assert_eq!(header.header_len(), 40);
        assert_eq!(header.options().mss(), Some(1460));
    }

    #[test]
    fn tcp_header_checksum_covers_payload() {
        let (src, dst) = addrs();
        let mut header = TcpHeader::new(40982, 443, 1, 4096);
        header.set_ack();
        header.set_ack_number(7);
        header.set_checksum(src, dst, b"hello");

        assert!(header.is_valid_checksum(src, dst, b"hello"));
        assert!(!header.is_valid_checksum(src, dst, b"hellp"));

        let mut segment = Vec::new();
        header.write(&mut segment);
        segment.extend_from_slice(b"hello");
        assert!(checksum::verify_l4(src, dst, Protocol::TCP.into(), &segment));

        header.set_ack_number(22);
        assert!(!header.is_valid_checksum(src, dst, b"hello"));
    }

    #[test]
    fn tcp_header_pseudo_header_checksum_completion() {
        let (src, dst) = addrs();
        let mut header = TcpHeader::new(1, 2, 3, 4);
        header.set_pseudo_header_checksum(src, dst, 3);

        // Hardware sums header and payload onto the value left in the field.
        let mut segment = Vec::new();
        header.write(&mut segment);
        segment.extend_from_slice(b"abc");

        let completed = !checksum::fold(checksum::accumulate(0, &segment));
        header.set_checksum(src, dst, b"abc");

        assert_eq!(completed, header.checksum());
    }

    #[test]
    fn tcp_header_every_flag_combination() {
        for bits in 0u8..=0b0011_1111 {
            let mut raw = SYN_BYTES;
            raw[13] = bits;

            let header = TcpHeader::try_from(&raw[..]).unwrap();
            let flags = TcpFlags::from_bits_truncate(bits);

            assert_eq!(header.flags(), flags, "{bits:06b}");
            assert_eq!(header.urg(), flags.contains(TcpFlags::URG));
            assert_eq!(header.ack(), flags.contains(TcpFlags::ACK));
            assert_eq!(header.psh(), flags.contains(TcpFlags::PSH));
            assert_eq!(header.rst(), flags.contains(TcpFlags::RST));
            assert_eq!(header.syn(), flags.contains(TcpFlags::SYN));
            assert_eq!(header.fin(), flags.contains(TcpFlags::FIN));
        }
    }

    #[test]
    fn tcp_header_reserved_bits_dropped() {
        let mut raw = SYN_BYTES;
        raw[12] |= 0x0F;
        raw[13] |= 0xC0;

        let header = TcpHeader::try_from(&raw[..]).unwrap();
        let (out, len) = header.to_be_bytes();

        assert_eq!(header.flags(), TcpFlags::SYN);
        assert_eq!(&out[12..14], &SYN_BYTES[12..14]);
        assert_eq!(len, 40);
    }

    #[test]
    fn tcp_header_set_mss() {
        let mut header = TcpHeader::new(40982, 443, 0, 64240);
        header.set_syn();
        header.set_psh();

        assert_eq!(header.data_offset(), 5);
        assert_eq!(header.options().mss(), None);

        header.set_option_mss(1460).unwrap();
        header.set_option_mss(536).unwrap();

        assert_eq!(header.flags(), TcpFlags::SYN | TcpFlags::PSH);
        assert_eq!(header.data_offset(), 6);
        assert_eq!(header.options().mss(), Some(1460));

        let (raw, len) = header.to_be_bytes();
        let parsed = TcpHeader::try_from(&raw[..len]).unwrap();
        assert_eq!(parsed, header);

        assert!(matches!(
            TcpHeader::new(1, 2, 0, 0).set_option_mss(0),
            Err(Error::Header(HeaderError::InvalidMssOption))
        ));
    }

    #[test]
    fn tcp_options_mss_after_unknown_option() {
        // Window scale (kind 3, len 3), NOP, MSS 1400.
        let opts = TcpOptions::try_from(&[0x03, 0x03, 0x07, 0x01, 0x02, 0x04, 0x05, 0x78][..]).unwrap();

        assert_eq!(opts.mss(), Some(1400));
    }

    #[test]
    fn tcp_options_malformed_length_stops_walk() {
        let opts = TcpOptions::try_from(&[0x08, 0x00, 0x02, 0x04][..]).unwrap();
        assert_eq!(opts.mss(), None);

        // MSS kind in the last byte of the area.
        let opts = TcpOptions::try_from(&[0x01, 0x01, 0x01, 0x02][..]).unwrap();
        assert_eq!(opts.len(), 4);
        assert_eq!(opts.mss(), None);
    }

    #[test]
    fn tcp_header_data_offset_invalid() {
        let mut raw = SYN_BYTES;
        raw[12] = 0x40;

        assert!(matches!(
            TcpHeader::try_from(&raw[..]),
            Err(Error::Parse(ParseError::InvalidDataOffset { provided: 4, .. }))
        ));
    }

    #[test]
    fn tcp_header_length_mismatch_invalid() {
        // A data offset of 10 advertises 40 bytes.
        assert!(matches!(
            TcpHeader::try_from(&SYN_BYTES[..24]),
            Err(Error::Parse(ParseError::HeaderLengthMismatch {
                provided: 24,
                expected: 40
            }))
        ));
    }
}
