use std::net::IpAddr;

use bytes::BufMut;

use super::{Protocol, checksum};
use crate::{Error, HeaderError, ParseError};

/// User Datagram Header.
///
/// RFC 768
///
/// ```text
///                  0      7 8     15 16    23 24    31
///                 +--------+--------+--------+--------+
///                 |     Source      |   Destination   |
///                 |      Port       |      Port       |
///                 +--------+--------+--------+--------+
///                 |                 |                 |
///                 |     Length      |    Checksum     |
///                 +--------+--------+--------+--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// The source port number.
    src_port: u16,
    /// The destination port number.
    dst_port: u16,
    /// Length in octets of this user datagram including this header and
    /// the data.
    len: u16,
    /// One's complement of the one's complement sum of the pseudo header,
    /// the UDP header, and the data. Zero means no checksum was computed
    /// (IPv4 only).
    checksum: u16,
}

impl UdpHeader {
    /// Length of a UDP header in bytes.
    pub const HEADER_LEN: u16 = 8;

    /// Creates a new UDP header for a datagram carrying `payload_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting datagram length does not fit the
    /// 16-bit length field.
    pub fn new(src_port: u16, dst_port: u16, payload_len: usize) -> crate::Result<Self> {
        let total = payload_len + Self::HEADER_LEN as usize;

        if total > u16::MAX as usize {
            return Err(Error::Header(HeaderError::PayloadTooLarge {
                provided: payload_len,
                max: u16::MAX - Self::HEADER_LEN,
            }));
        }

        Ok(Self {
            src_port,
            dst_port,
            len: total as u16,
            checksum: 0,
        })
    }

    /// Returns the `source port` field of the UDP header.
    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    /// Returns the `destination port` field of the UDP header.
    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    /// Returns the `length` field of the UDP header.
    pub fn length(&self) -> u16 {
        self.len
    }

    /// Returns the number of payload bytes described by the `length` field.
    pub fn payload_len(&self) -> usize {
        (self.len - Self::HEADER_LEN) as usize
    }

    /// Returns the `checksum` field of the UDP header.
    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    /// Computes and updates the `checksum` field for the UDP header.
    pub fn set_checksum(&mut self, src: IpAddr, dst: IpAddr, payload: &[u8]) {
        let checksum = self.compute_checksum(src, dst, payload);

        // RFC 768: an all zero transmitted checksum value means that the
        // transmitter generated no checksum.
        self.checksum = if checksum == 0 { 0xFFFF } else { checksum };
    }

    /// Stores the folded pseudo header sum in the `checksum` field, as
    /// expected by devices completing the checksum in hardware.
    pub fn set_pseudo_header_checksum(&mut self, src: IpAddr, dst: IpAddr) {
        self.checksum = checksum::fold(checksum::pseudo_header_sum(
            src,
            dst,
            Protocol::UDP.into(),
            self.len as u32,
        ));
    }

    /// Returns the computed checksum of the UDP header and payload.
    pub fn compute_checksum(&self, src: IpAddr, dst: IpAddr, payload: &[u8]) -> u16 {
        let mut raw_header = self.to_be_bytes();

        // Checksum field must be 0 for computation.
        raw_header[6] = 0x00;
        raw_header[7] = 0x00;

        let mut sum =
            checksum::pseudo_header_sum(src, dst, Protocol::UDP.into(), self.len as u32);
        sum = checksum::accumulate(sum, &raw_header);
        sum = checksum::accumulate(sum, payload);

        !checksum::fold(sum)
    }

    /// Returns the memory representation of the UDP header as a byte array in
    /// big-endian (network) byte order.
    #[allow(clippy::wrong_self_convention)]
    pub fn to_be_bytes(&self) -> [u8; Self::HEADER_LEN as usize] {
        let mut raw_header = [0u8; Self::HEADER_LEN as usize];

        raw_header[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        raw_header[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        raw_header[4..6].copy_from_slice(&self.len.to_be_bytes());
        raw_header[6..8].copy_from_slice(&self.checksum.to_be_bytes());

        raw_header
    }

    /// Writes the UDP header to the given buffer.
    pub fn write<B: BufMut>(&self, output: &mut B) {
        output.put_slice(&self.to_be_bytes());
    }
}

impl TryFrom<&[u8]> for UdpHeader {
    type Error = Error;

    /// Parses the UDP header at the start of `datagram`, validating the length
    /// field against the bytes available.
    fn try_from(datagram: &[u8]) -> Result<Self, Self::Error> {
        if datagram.len() < Self::HEADER_LEN as usize {
            return Err(Error::Parse(ParseError::InvalidBufferLength {
                provided: datagram.len(),
                min: Self::HEADER_LEN,
                max: Self::HEADER_LEN,
            }));
        }

        let len = u16::from_be_bytes([datagram[4], datagram[5]]);

        if len < Self::HEADER_LEN || len as usize > datagram.len() {
            return Err(Error::Parse(ParseError::InvalidUdpLength {
                provided: len,
                max: datagram.len(),
            }));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
            dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
            len,
            checksum: u16::from_be_bytes([datagram[6], datagram[7]]),
        })
    }
}
