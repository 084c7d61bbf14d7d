//! Destination resolution and outbound framing.
//!
//! A [Lookup] maps a remote address to a [Destination]: the device to send
//! through, the path MTU, and an L2+L3 header template. Outbound packets are
//! framed by prepending the L4 header, an IP header derived from the
//! template, and a copy of the template's L2 header.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;

use crate::config::DeviceOffload;
use crate::ctx::DeviceId;
use crate::packet::{OffloadFlags, Packet, PacketType, ETHER_HDR_LEN};
use crate::protocol::fsm::TCP_HDR_LEN;
use crate::protocol::headers::{Ipv4Header, Ipv6Header, Protocol, TcpHeader, UdpHeader};
use crate::{Error, HeaderError, Result};

/// Route to a remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Device the packets leave through.
    pub device: DeviceId,
    /// Path MTU, in bytes of L3 packet.
    pub mtu: u16,
    /// L2 header followed by an IPv4 or IPv6 header template. The template's
    /// TOS/traffic class and TTL/hop limit are kept; addresses, lengths,
    /// protocol and checksum are rewritten.
    pub header: Bytes,
    /// Length of the L2 part of `header`.
    pub l2_len: u16,
    /// Length of the L3 part of `header`: 20 for IPv4, 40 for IPv6.
    pub l3_len: u16,
}

impl Destination {
    /// Creates an Ethernet destination from a raw header template.
    pub fn ether(device: DeviceId, mtu: u16, header: impl Into<Bytes>) -> Self {
        let header = header.into();
        let l3_len = (header.len() as u16).saturating_sub(ETHER_HDR_LEN);

        Self {
            device,
            mtu,
            header,
            l2_len: ETHER_HDR_LEN,
            l3_len,
        }
    }

    /// Checks that the template matches the family of the remote address and
    /// leaves room for a TCP header within the MTU.
    ///
    /// # Errors
    ///
    /// Returns an error describing the inconsistency.
    pub fn validate(&self, v4: bool) -> Result<()> {
        let (l3_len, version) = if v4 {
            (Ipv4Header::MIN_HEADER_LEN, 4)
        } else {
            (Ipv6Header::HEADER_LEN, 6)
        };

        if self.l3_len != l3_len
            || self.header.len() != (self.l2_len + self.l3_len) as usize
            || self.header[self.l2_len as usize] >> 4 != version
        {
            return Err(Error::Header(HeaderError::InvalidTemplate(
                "template does not end with an IP header of the remote's family",
            )));
        }

        if self.mtu <= self.l3_len + TCP_HDR_LEN {
            return Err(Error::Header(HeaderError::InvalidTemplate(
                "MTU leaves no room for payload",
            )));
        }

        Ok(())
    }

    /// Returns the MSS advertised for connections using this destination.
    pub fn mss(&self) -> u16 {
        self.mtu - self.l3_len - TCP_HDR_LEN
    }

    fn l3_template(&self) -> &[u8] {
        &self.header[self.l2_len as usize..]
    }
}

/// Resolves remote addresses of one family.
pub trait Lookup<A>: Send + Sync {
    /// Returns the destination for `addr`, or `None` if it is unreachable.
    fn lookup(&self, addr: &A) -> Option<Destination>;
}

impl<A, F> Lookup<A> for F
where
    F: Fn(&A) -> Option<Destination> + Send + Sync,
{
    fn lookup(&self, addr: &A) -> Option<Destination> {
        self(addr)
    }
}

/// L4 header of a packet being framed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum L4Header {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl L4Header {
    fn protocol(&self) -> Protocol {
        match self {
            L4Header::Tcp(_) => Protocol::TCP,
            L4Header::Udp(_) => Protocol::UDP,
        }
    }

    fn packet_type(&self) -> PacketType {
        match self {
            L4Header::Tcp(_) => PacketType::L4_TCP,
            L4Header::Udp(_) => PacketType::L4_UDP,
        }
    }
}

/// Frames `pkt`, whose data is the L4 payload, for transmission to `dst_ip`
/// through `dst`.
///
/// L4 checksums (and the IPv4 header checksum) are computed in software
/// unless the device offloads them, in which case the matching `TX_*` flags
/// are set and the L4 checksum field holds the pseudo header sum.
///
/// # Errors
///
/// Returns an error if the packet lacks headroom or the payload does not fit
/// the length fields.
pub(crate) fn encapsulate(
    dst: &Destination,
    mut pkt: Packet,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    l4: L4Header,
    offload: DeviceOffload,
    ip_id: u16,
) -> Result<Packet> {
    let payload_len = pkt.len();
    let mut ol_flags = OffloadFlags::empty();

    let (l4_bytes, l4_len) = match l4 {
        L4Header::Tcp(mut tcp) => {
            if offload.contains(DeviceOffload::TCP_CKSUM) {
                tcp.set_pseudo_header_checksum(src_ip, dst_ip, payload_len);
                ol_flags |= OffloadFlags::TX_TCP_CKSUM;
            } else {
                tcp.set_checksum(src_ip, dst_ip, pkt.data());
            }

            let (raw, len) = tcp.to_be_bytes();
            (raw, len)
        }
        L4Header::Udp(mut udp) => {
            if offload.contains(DeviceOffload::UDP_CKSUM) {
                udp.set_pseudo_header_checksum(src_ip, dst_ip);
                ol_flags |= OffloadFlags::TX_UDP_CKSUM;
            } else {
                udp.set_checksum(src_ip, dst_ip, pkt.data());
            }

            let mut raw = [0u8; TcpHeader::MAX_HEADER_LEN as usize];
            raw[..UdpHeader::HEADER_LEN as usize].copy_from_slice(&udp.to_be_bytes());
            (raw, UdpHeader::HEADER_LEN as usize)
        }
    };

    pkt.prepend(l4_len)?.copy_from_slice(&l4_bytes[..l4_len]);

    let template = dst.l3_template();
    let l3_payload_len = l4_len + payload_len;

    match (src_ip, dst_ip) {
        (IpAddr::V4(src), IpAddr::V4(dst_addr)) => {
            let mut ip = ipv4_from_template(template, src, dst_addr, l3_payload_len, l4.protocol())?;
            ip.set_id(ip_id);

            if offload.contains(DeviceOffload::IPV4_CKSUM) {
                ip.clear_header_checksum();
                ol_flags |= OffloadFlags::TX_IP_CKSUM;
            } else {
                ip.set_header_checksum();
            }

            pkt.prepend(Ipv4Header::MIN_HEADER_LEN as usize)?
                .copy_from_slice(&ip.to_be_bytes());
            ol_flags |= OffloadFlags::TX_IPV4;
            pkt.packet_type = PacketType::L3_IPV4;
        }
        (IpAddr::V6(src), IpAddr::V6(dst_addr)) => {
            let ip = ipv6_from_template(template, src, dst_addr, l3_payload_len, l4.protocol())?;

            pkt.prepend(Ipv6Header::HEADER_LEN as usize)?
                .copy_from_slice(&ip.to_be_bytes());
            ol_flags |= OffloadFlags::TX_IPV6;
            pkt.packet_type = PacketType::L3_IPV6;
        }
        _ => {
            return Err(Error::Header(HeaderError::InvalidTemplate(
                "source and destination address families differ",
            )));
        }
    }

    let l2_len = dst.l2_len as usize;
    pkt.prepend(l2_len)?.copy_from_slice(&dst.header[..l2_len]);

    pkt.l2_len = dst.l2_len;
    pkt.l3_len = dst.l3_len;
    pkt.l4_len = l4_len as u16;
    pkt.packet_type |= l4.packet_type();
    if dst.l2_len == ETHER_HDR_LEN {
        pkt.packet_type |= PacketType::L2_ETHER;
    }
    pkt.ol_flags = ol_flags;

    Ok(pkt)
}

fn ipv4_from_template(
    template: &[u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    payload_len: usize,
    protocol: Protocol,
) -> Result<Ipv4Header> {
    if template.len() != Ipv4Header::MIN_HEADER_LEN as usize || template[0] >> 4 != 4 {
        return Err(Error::Header(HeaderError::InvalidTemplate(
            "template does not hold an IPv4 header",
        )));
    }

    let mut ip = Ipv4Header::new(src, dst, payload_len, template[8], protocol)?;
    ip.set_tos(template[1]);

    Ok(ip)
}

fn ipv6_from_template(
    template: &[u8],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    payload_len: usize,
    protocol: Protocol,
) -> Result<Ipv6Header> {
    if template.len() != Ipv6Header::HEADER_LEN as usize || template[0] >> 4 != 6 {
        return Err(Error::Header(HeaderError::InvalidTemplate(
            "template does not hold an IPv6 header",
        )));
    }

    let mut ip = Ipv6Header::new(src, dst, payload_len, template[7], protocol)?;
    // Traffic class straddles the first two bytes.
    ip.set_traffic_class((template[0] << 4) | (template[1] >> 4));

    Ok(ip)
}
