//! Bulk packet ingest and egress, and the periodic timer sweep.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use super::device::{Device, TxOrigin};
use super::stream::{Stream, StreamKind};
use super::{Context, DeviceId, Slot, StreamHandle};
use crate::config::{DeviceOffload, L4Protocol};
use crate::dest::L4Header;
use crate::event::Pending;
use crate::packet::{OffloadFlags, Packet, PacketType};
use crate::protocol::Socket;
use crate::protocol::fsm::{self, ConnectionState, Delivery, Output};
use crate::protocol::headers::{checksum, Ipv4Header, Ipv6Header, Protocol, TcpHeader, UdpHeader};
use crate::protocol::TcpSegment;
use crate::{Error, ParseError, RejectReason, Result};

/// Addresses and L4 header of an inbound packet.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) src: IpAddr,
    pub(crate) dst: IpAddr,
    pub(crate) fragment: bool,
    pub(crate) l4: InboundL4,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum InboundL4 {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl InboundL4 {
    fn dst_port(&self) -> u16 {
        match self {
            InboundL4::Tcp(tcph) => tcph.dst_port(),
            InboundL4::Udp(udph) => udph.dst_port(),
        }
    }
}

/// Parses the L3 and L4 headers of a classified packet, cutting link-layer
/// padding that follows the IP payload.
///
/// # Errors
///
/// Returns an error if the headers are missing or malformed, or the IP
/// length does not fit the packet.
pub(crate) fn parse(pkt: &mut Packet) -> Result<Inbound> {
    let l3 = pkt.l3_header()?;

    let (src, dst, fragment, proto, ip_len) = if pkt.packet_type.contains(PacketType::L3_IPV4) {
        let ip = Ipv4Header::try_from(l3)?;
        let (src, dst) = (IpAddr::V4(ip.src()), IpAddr::V4(ip.dst()));
        (src, dst, ip.is_fragment(), ip.protocol(), ip.total_len() as usize)
    } else if pkt.packet_type.contains(PacketType::L3_IPV6) {
        let ip = Ipv6Header::try_from(l3)?;
        let (src, dst) = (IpAddr::V6(ip.src()), IpAddr::V6(ip.dst()));
        (src, dst, false, ip.next_header(), ip.header_len() + ip.payload_len())
    } else {
        return Err(Error::Parse(ParseError::InvalidLayout("packet is not IPv4 nor IPv6")));
    };

    fit_to_ip_length(pkt, ip_len)?;

    let segment = pkt.l4_segment()?;
    let l4 = match proto {
        Protocol::TCP => InboundL4::Tcp(TcpHeader::try_from(segment)?),
        Protocol::UDP => InboundL4::Udp(UdpHeader::try_from(segment)?),
    };

    Ok(Inbound {
        src,
        dst,
        fragment,
        l4,
    })
}

/// Trims the packet so the L4 segment ends where the IP length says.
fn fit_to_ip_length(pkt: &mut Packet, ip_len: usize) -> Result<()> {
    let declared = ip_len.checked_sub(pkt.l3_len as usize).ok_or(Error::Parse(
        ParseError::InvalidLayout("IP length ends inside the L3 header"),
    ))?;
    let present = pkt.l4_segment()?.len();

    if declared > present {
        return Err(Error::Parse(ParseError::InvalidLayout("IP length exceeds packet")));
    }

    // Padding never reaches back into the L4 header.
    if !pkt.trim(present - declared) {
        return Err(Error::Parse(ParseError::InvalidLayout(
            "IP length ends inside the L4 header",
        )));
    }

    Ok(())
}

type Rejection = (Packet, RejectReason);

impl Context {
    /// Hands received packets of device `dev` to their streams, returning
    /// the number delivered.
    ///
    /// Packets that cannot be delivered are appended to `rejected` with the
    /// reason; every input packet is either delivered or rejected. Replies
    /// the packets provoke (ACKs, resets) are queued on the devices for
    /// `tx_bulk`.
    pub fn rx_bulk(
        &self,
        dev: DeviceId,
        pkts: Vec<Packet>,
        rejected: &mut Vec<(Packet, RejectReason)>,
    ) -> usize {
        let bulk = self.bulk.lock();

        let Some(device) = self.device(dev) else {
            warn!("[{}] received {} packets on unknown device", dev, pkts.len());
            rejected.extend(pkts.into_iter().map(|pkt| (pkt, RejectReason::NoMatchingStream)));
            return 0;
        };

        let now = self.now();
        let mut pending = Pending::default();
        let mut delivered = 0;

        for mut pkt in pkts {
            pkt.rx_device = Some(dev);

            match self.rx_one(&device, pkt, now, &mut pending) {
                Ok(()) => delivered += 1,
                Err((pkt, reason)) => {
                    trace!("[{}] rejected inbound packet: {:?}", dev, reason);
                    rejected.push((pkt, reason));
                }
            }
        }

        drop(bulk);
        pending.fire();

        delivered
    }

    /// Moves up to `max` framed packets queued on device `dev` into `out`,
    /// in the order they were queued, returning the number moved.
    pub fn tx_bulk(&self, dev: DeviceId, out: &mut Vec<Packet>, max: usize) -> usize {
        let bulk = self.bulk.lock();

        let Some(device) = self.device(dev) else {
            return 0;
        };

        let entries = device.dequeue(max);
        let n = entries.len();
        let mut pending = Pending::default();
        let mut released = Vec::new();

        for entry in entries {
            if let TxOrigin::Datagram(owner) = entry.origin
                && let Some(stream) = self.complete_tx(owner, &mut pending)
            {
                released.push(stream);
            }

            out.push(entry.pkt);
        }

        for stream in released {
            self.release(stream);
        }

        drop(bulk);
        pending.fire();

        n
    }

    /// Advances the tick counter by one and runs the timers of every TCP
    /// stream, returning the number of streams visited.
    ///
    /// Closed streams whose connection reached CLOSED are released.
    pub fn process(&self) -> usize {
        let bulk = self.bulk.lock();
        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;

        let mut pending = Pending::default();
        let mut released = Vec::new();
        let mut visited = 0;

        for slot in self.slots.iter() {
            let mut slot = slot.lock();

            let Some(stream) = slot.stream.as_mut() else {
                continue;
            };

            let was_readable = stream.is_readable();
            let StreamKind::Tcp(tcp) = &mut stream.kind else {
                continue;
            };

            visited += 1;

            let mut out = Output::new();
            tcp.tcb.on_tick(now, &mut out);

            let finished = stream.user_closed && tcp.tcb.state() == ConnectionState::CLOSED;
            self.drive(stream, out, was_readable, &mut pending);

            if finished && let Some(stream) = slot.stream.take() {
                released.push(stream);
            }
        }

        for stream in released {
            self.release(stream);
        }

        drop(bulk);
        pending.fire();

        visited
    }

    fn rx_one(
        &self,
        dev: &Device,
        mut pkt: Packet,
        now: u64,
        pending: &mut Pending,
    ) -> std::result::Result<(), Rejection> {
        let Some(inbound) = self.inspect(dev, &mut pkt) else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        match inbound.l4 {
            InboundL4::Tcp(tcph) => self.rx_tcp(dev, &inbound, tcph, pkt, now, pending),
            InboundL4::Udp(udph) => self.rx_udp(dev, &inbound, udph, pkt, pending),
        }
    }

    /// Validates an inbound packet against the device and the context.
    /// Packets no stream could accept yield `None`.
    fn inspect(&self, dev: &Device, pkt: &mut Packet) -> Option<Inbound> {
        let classified = match self.params.proto {
            L4Protocol::Tcp => PacketType::L4_TCP,
            L4Protocol::Udp => PacketType::L4_UDP,
        };

        if !pkt.packet_type.contains(classified) {
            trace!("[{}] packet is not {:?}: {:?}", dev.id, self.params.proto, pkt.packet_type);
            return None;
        }

        let inbound = match parse(pkt) {
            Ok(inbound) => inbound,
            Err(err) => {
                trace!("[{}] malformed packet: {}", dev.id, err);
                return None;
            }
        };

        if inbound.fragment {
            trace!("[{}] fragment from {}: not reassembled", dev.id, inbound.src);
            return None;
        }

        if !verify_checksums(dev, pkt, &inbound) {
            trace!("[{}] checksum mismatch on packet from {}", dev.id, inbound.src);
            return None;
        }

        if !dev.owns(&inbound.dst) {
            trace!("[{}] packet for foreign address {}", dev.id, inbound.dst);
            return None;
        }

        if dev.params.is_blocked(inbound.dst.is_ipv4(), inbound.l4.dst_port()) {
            trace!("[{}] packet for blocked port {}", dev.id, inbound.l4.dst_port());
            return None;
        }

        Some(inbound)
    }

    fn rx_tcp(
        &self,
        dev: &Device,
        inbound: &Inbound,
        tcph: TcpHeader,
        pkt: Packet,
        now: u64,
        pending: &mut Pending,
    ) -> std::result::Result<(), Rejection> {
        let sock = Socket::new(
            SocketAddr::new(inbound.dst, tcph.dst_port()),
            SocketAddr::new(inbound.src, tcph.src_port()),
        );

        let found = self.demux.read().lookup(&sock);
        let Some((handle, is_conn)) = found else {
            return Err(self.refuse(&sock, &tcph, pkt));
        };

        let Ok(mut slot) = self.slot(handle) else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        let Some(stream) = deliverable(&mut slot, handle, dev.id) else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        let was_readable = stream.is_readable();
        let StreamKind::Tcp(tcp) = &mut stream.kind else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        if is_conn {
            let mut out = Output::new();
            let delivery = tcp.tcb.on_segment(&tcph, pkt, now, &mut out);

            self.drive(stream, out, was_readable, pending);

            return match delivery {
                Delivery::Consumed | Delivery::Queued => Ok(()),
                Delivery::Rejected(pkt, reason) => Err((pkt, reason)),
            };
        }

        if tcp.tcb.state() != ConnectionState::LISTEN || stream.user_closed {
            drop(slot);
            return Err(self.refuse(&sock, &tcph, pkt));
        }

        // RFC 793 (3.9): LISTEN ignores RSTs, resets ACKs, queues SYNs.
        if tcph.rst() {
            return Err((pkt, RejectReason::NoMatchingStream));
        }

        if tcph.ack() {
            drop(slot);
            return Err(self.refuse(&sock, &tcph, pkt));
        }

        if !tcph.syn() {
            return Err((pkt, RejectReason::NoMatchingStream));
        }

        if tcp.synq.len() >= self.params.max_stream_rbufs {
            debug!("[{}] (LISTEN) SYN queue full: dropping request", sock);
            return Err((pkt, RejectReason::BufferFull));
        }

        tcp.synq.push_back(pkt);

        debug!("[{}] (LISTEN) queued connection request", sock);

        stream.recv.signal(handle, !was_readable, pending);

        Ok(())
    }

    fn rx_udp(
        &self,
        dev: &Device,
        inbound: &Inbound,
        udph: UdpHeader,
        pkt: Packet,
        pending: &mut Pending,
    ) -> std::result::Result<(), Rejection> {
        let remote = SocketAddr::new(inbound.src, udph.src_port());
        let sock = Socket::new(SocketAddr::new(inbound.dst, udph.dst_port()), remote);

        let found = self.demux.read().lookup(&sock);
        let Some((handle, _)) = found else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        let Ok(mut slot) = self.slot(handle) else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        let Some(stream) = deliverable(&mut slot, handle, dev.id) else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        let accepts_remote = (stream.remote.ip().is_unspecified() || stream.remote.ip() == remote.ip())
            && (stream.remote.port() == 0 || stream.remote.port() == remote.port());

        if stream.user_closed || !accepts_remote {
            return Err((pkt, RejectReason::NoMatchingStream));
        }

        let was_readable = stream.is_readable();
        let StreamKind::Udp(udp) = &mut stream.kind else {
            return Err((pkt, RejectReason::NoMatchingStream));
        };

        if udp.rbuf.len() >= self.params.max_stream_rbufs {
            return Err((pkt, RejectReason::BufferFull));
        }

        udp.rbuf.push_back(pkt);
        stream.recv.signal(handle, !was_readable, pending);

        Ok(())
    }

    /// Rejects a segment no connection accepts, answering it with a reset
    /// (RFC 793 3.4).
    fn refuse(&self, sock: &Socket, tcph: &TcpHeader, pkt: Packet) -> Rejection {
        if let Some(rst) = fsm::reset_for(tcph, pkt.len()) {
            debug!("[{}] (CLOSED) no connection for segment: sending RST", sock);
            self.reply(sock, rst);
        }

        (pkt, RejectReason::NoMatchingStream)
    }

    /// Queues a control segment that belongs to no stream.
    fn reply(&self, sock: &Socket, seg: TcpSegment) {
        let remote = sock.dst.ip();

        let result = self.resolve(remote).and_then(|dst| {
            let pkt = Packet::with_headroom(dst.header.len() + TcpHeader::MAX_HEADER_LEN as usize, &[]);
            self.queue_tx(&dst, pkt, sock.src.ip(), remote, L4Header::Tcp(seg.tcp), TxOrigin::Reply)
        });

        match result {
            Ok(()) => {}
            Err(Error::OutOfResources(_)) => {
                trace!("[{}] reply backlog full: dropping RST", sock);
            }
            Err(err) => warn!("[{}] dropping reply: {}", sock, err),
        }
    }

    /// Accounts for a datagram of `owner` leaving through `tx_bulk`.
    /// Returns the stream when it was closed and this was its last queued
    /// datagram.
    fn complete_tx(&self, owner: StreamHandle, pending: &mut Pending) -> Option<Stream> {
        let mut slot = self.slot(owner).ok()?;
        let stream = slot.get(owner)?;

        let StreamKind::Udp(udp) = &mut stream.kind else {
            return None;
        };

        let was_full = udp.in_flight >= self.params.max_stream_sbufs;
        udp.in_flight = udp.in_flight.saturating_sub(1);

        if stream.user_closed {
            if udp.in_flight == 0 {
                return slot.stream.take();
            }
            return None;
        }

        stream.send.signal(owner, was_full, pending);

        None
    }
}

/// Returns the stream `handle` refers to if it may receive packets from
/// `dev`.
fn deliverable(slot: &mut Slot, handle: StreamHandle, dev: DeviceId) -> Option<&mut Stream> {
    slot.get(handle)
        .filter(|stream| stream.device.is_none_or(|bound| bound == dev))
}

/// Verifies the L3 and L4 checksums of an inbound packet, trusting the
/// device's verdict where it offloads the check.
fn verify_checksums(dev: &Device, pkt: &Packet, inbound: &Inbound) -> bool {
    let rx = dev.params.rx_offload;

    if inbound.src.is_ipv4() {
        if rx.contains(DeviceOffload::IPV4_CKSUM) && pkt.ol_flags.contains(OffloadFlags::RX_IP_CKSUM_BAD) {
            return false;
        }

        let trusted = rx.contains(DeviceOffload::IPV4_CKSUM)
            && pkt.ol_flags.contains(OffloadFlags::RX_IP_CKSUM_GOOD);

        if !trusted && !pkt.l3_header().is_ok_and(|l3| checksum::checksum(l3) == 0) {
            return false;
        }
    }

    let (offload, proto) = match inbound.l4 {
        InboundL4::Tcp(_) => (DeviceOffload::TCP_CKSUM, Protocol::TCP),
        // RFC 768: an all-zero checksum was not computed by the sender.
        InboundL4::Udp(udph) if udph.checksum() == 0 && inbound.src.is_ipv4() => return true,
        InboundL4::Udp(_) => (DeviceOffload::UDP_CKSUM, Protocol::UDP),
    };

    if rx.contains(offload) {
        if pkt.ol_flags.contains(OffloadFlags::RX_L4_CKSUM_BAD) {
            return false;
        }
        if pkt.ol_flags.contains(OffloadFlags::RX_L4_CKSUM_GOOD) {
            return true;
        }
    }

    pkt.l4_segment()
        .is_ok_and(|segment| checksum::verify_l4(inbound.src, inbound.dst, proto.into(), segment))
}
