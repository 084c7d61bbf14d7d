//! Internet checksum (RFC 1071) and the IPv4/IPv6 pseudo headers used by
//! TCP and UDP.

use std::net::IpAddr;

/// Accumulates the one's complement sum of `data` onto `sum`, treating the
/// bytes as a sequence of big-endian 16-bit words.
///
/// If `data` contains an odd number of octets, the last octet is padded on
/// the right with zeros to form a 16-bit word.
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);

    for word in chunks.by_ref() {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;

        // Handle potential overflow with carry folding.
        if sum > 0xFFFF {
            // Adds the higher 16-bits to the lower 16-bits.
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0x00]) as u32;
    }

    sum
}

/// Folds the carries of a 32-bit accumulator into 16 bits, without taking
/// the complement.
pub fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum as u16
}

/// Returns the 16-bit one's complement of the one's complement sum of
/// `data`.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(accumulate(0, data))
}

/// Returns the (uncomplemented) sum of the pseudo header for an upper-layer
/// segment of `len` bytes exchanged between `src` and `dst`.
///
/// IPv4 (RFC 793 3.1):
///
/// ```text
///        +--------+--------+--------+--------+
///        |           Source Address          |
///        +--------+--------+--------+--------+
///        |         Destination Address       |
///        +--------+--------+--------+--------+
///        |  zero  |  PTCL  |    TCP Length   |
///        +--------+--------+--------+--------+
/// ```
///
/// IPv6 (RFC 8200 8.1):
///
/// ```text
///    +                         Source Address                        +
///    +                      Destination Address                      +
///    |                   Upper-Layer Packet Length                   |
///    |                      zero                     |  Next Header  |
/// ```
///
/// Mixed address families produce a sum over the IPv4-mapped form of both
/// addresses.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, len: u32) -> u32 {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut pseudo_header = [0u8; 12];

            pseudo_header[0..4].copy_from_slice(&src.octets());
            pseudo_header[4..8].copy_from_slice(&dst.octets());
            pseudo_header[8] = 0;
            pseudo_header[9] = protocol;
            pseudo_header[10..12].copy_from_slice(&(len as u16).to_be_bytes());

            accumulate(0, &pseudo_header)
        }
        (src, dst) => {
            let mut pseudo_header = [0u8; 40];

            pseudo_header[0..16].copy_from_slice(&to_v6_octets(src));
            pseudo_header[16..32].copy_from_slice(&to_v6_octets(dst));
            pseudo_header[32..36].copy_from_slice(&len.to_be_bytes());
            pseudo_header[39] = protocol;

            accumulate(0, &pseudo_header)
        }
    }
}

/// Returns the checksum of an upper-layer segment (header and payload,
/// already contiguous in `segment`) including its pseudo header.
///
/// The checksum field inside `segment` must be zero, or the result can be
/// compared against zero to verify an inbound segment.
pub fn l4_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, protocol, segment.len() as u32);
    !fold(accumulate(sum, segment))
}

/// Returns `true` if an inbound upper-layer segment, checksum field included,
/// sums to the expected all-ones value.
pub fn verify_l4(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> bool {
    l4_checksum(src, dst, protocol, segment) == 0
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
