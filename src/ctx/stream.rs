//! Streams and the operations the user performs on them.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, warn};

use super::bulk::{self, InboundL4};
use super::device::TxOrigin;
use super::{Context, DeviceId, StreamHandle};
use crate::config::{AcceptParams, StreamConfig, StreamParams};
use crate::dest::{Destination, L4Header};
use crate::event::{Notify, Pending};
use crate::packet::Packet;
use crate::protocol::fsm::{ConnectionState, DEFAULT_TCP_MSS, Output, Signals, Tcb};
use crate::protocol::headers::{TcpHeader, UdpHeader};
use crate::protocol::{Socket, TcpSegment};
use crate::{Error, HeaderError, Result};

/// Destination resolved for a remote address, valid until the context's
/// generation changes.
#[derive(Debug)]
struct CachedDestination {
    remote: IpAddr,
    generation: u64,
    dst: Destination,
}

#[derive(Debug)]
pub(crate) struct TcpStream {
    pub(crate) tcb: Tcb,
    /// SYN packets waiting for `accept` (listeners only).
    pub(crate) synq: VecDeque<Packet>,
}

#[derive(Debug)]
pub(crate) struct UdpStream {
    pub(crate) rbuf: VecDeque<Packet>,
    /// Datagrams queued on a device and not yet taken by `tx_bulk`.
    pub(crate) in_flight: usize,
}

#[derive(Debug)]
pub(crate) enum StreamKind {
    Tcp(TcpStream),
    Udp(UdpStream),
}

/// A stream occupying a pool slot.
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) handle: StreamHandle,
    pub(crate) local: SocketAddr,
    pub(crate) remote: SocketAddr,
    /// Device the stream is restricted to, if any.
    pub(crate) device: Option<DeviceId>,
    pub(crate) retries: u32,
    pub(crate) linger: Option<u64>,
    pub(crate) recv: Notify,
    pub(crate) send: Notify,
    pub(crate) error: Notify,
    dst: Option<CachedDestination>,
    /// The local port is reserved in the demux table.
    pub(crate) port_reserved: bool,
    /// Connection registered in the demux table.
    pub(crate) conn: Option<Socket>,
    /// Closed by the user, kept until the stream winds down.
    pub(crate) user_closed: bool,
    pub(crate) kind: StreamKind,
}

impl Stream {
    /// Returns `true` if `recv` (or `synreqs`) has something to return.
    pub(crate) fn is_readable(&self) -> bool {
        match &self.kind {
            StreamKind::Tcp(tcp) => tcp.tcb.is_readable() || !tcp.synq.is_empty(),
            StreamKind::Udp(udp) => !udp.rbuf.is_empty(),
        }
    }

    /// Delivers state machine signals to the stream's notifications.
    pub(crate) fn notify(&self, signals: Signals, recv_edge: bool, pending: &mut Pending) {
        if signals.contains(Signals::RECV) {
            self.recv.signal(self.handle, recv_edge, pending);
        }
        if signals.contains(Signals::SEND) {
            self.send.signal(self.handle, true, pending);
        }
        if signals.contains(Signals::ERROR) {
            self.error.signal(self.handle, true, pending);
        }
    }

    /// Returns the destination for `remote`, resolving it again when the
    /// cached one is stale.
    fn destination(&mut self, ctx: &Context, remote: IpAddr) -> Result<Destination> {
        let generation = ctx.dst_generation();

        if let Some(cached) = &self.dst
            && cached.remote == remote
            && cached.generation == generation
        {
            return Ok(cached.dst.clone());
        }

        let dst = ctx.resolve(remote)?;
        self.cache(remote, generation, dst.clone());

        Ok(dst)
    }

    fn cache(&mut self, remote: IpAddr, generation: u64, dst: Destination) {
        self.dst = Some(CachedDestination {
            remote,
            generation,
            dst,
        });
    }

    fn tcp(&mut self) -> Result<&mut TcpStream> {
        match &mut self.kind {
            StreamKind::Tcp(tcp) => Ok(tcp),
            StreamKind::Udp(_) => Err(Error::InvalidConfig("operation requires a TCP stream")),
        }
    }

    fn udp(&mut self) -> Result<&mut UdpStream> {
        match &mut self.kind {
            StreamKind::Udp(udp) => Ok(udp),
            StreamKind::Tcp(_) => Err(Error::InvalidConfig("operation requires a UDP stream")),
        }
    }

    fn config(&self) -> StreamConfig {
        StreamConfig {
            nb_retries: self.retries,
            linger_cycles: self.linger,
            recv: (&self.recv).into(),
            send: (&self.send).into(),
            error: (&self.error).into(),
        }
    }
}

/// Converts the notification parameters of `cfg`.
fn notifications(cfg: &StreamConfig) -> Result<(Notify, Notify, Notify)> {
    Ok((
        Notify::try_from(cfg.recv.clone())?,
        Notify::try_from(cfg.send.clone())?,
        Notify::try_from(cfg.error.clone())?,
    ))
}

impl Context {
    /// Opens a stream bound to `params.local`.
    ///
    /// A non-zero local port is reserved as given; port 0 reserves an
    /// ephemeral port. A specified local IP must be the address of an
    /// attached device, and restricts the stream to that device.
    ///
    /// # Errors
    ///
    /// Returns [Error::StreamLimitReached] when the pool is exhausted,
    /// [Error::AddrInUse] if the port is reserved, and
    /// [Error::InvalidConfig] for inconsistent parameters.
    pub fn open(&self, params: StreamParams) -> Result<StreamHandle> {
        params.validate()?;

        let (recv, send, error) = notifications(&params.cfg)?;
        let device = self.bind_device(&params.local)?;
        let handle = self.alloc_slot().ok_or(Error::StreamLimitReached {
            max: self.params.max_streams,
        })?;

        let port = {
            let devices = self.devices.read();
            let v4 = params.local.is_ipv4();

            self.demux.write().reserve(params.local, handle, |port| {
                Self::is_blocked(&devices, device, v4, port)
            })
        };

        let port = match port {
            Ok(port) => port,
            Err(err) => {
                self.free_slot(handle);
                return Err(err);
            }
        };

        let mut local = params.local;
        local.set_port(port);

        let kind = if self.is_tcp() {
            let cfg = self.tcb_config(params.cfg.nb_retries, params.cfg.linger_cycles, DEFAULT_TCP_MSS);

            StreamKind::Tcp(TcpStream {
                tcb: Tcb::new(Socket::new(local, params.remote), cfg, self.congestion()),
                synq: VecDeque::new(),
            })
        } else {
            StreamKind::Udp(UdpStream {
                rbuf: VecDeque::new(),
                in_flight: 0,
            })
        };

        let stream = Stream {
            handle,
            local,
            remote: params.remote,
            device,
            retries: params.cfg.nb_retries,
            linger: params.cfg.linger_cycles,
            recv,
            send,
            error,
            dst: None,
            port_reserved: true,
            conn: None,
            user_closed: false,
            kind,
        };

        self.slots[handle.index()].lock().stream = Some(stream);

        debug!("[{}] opened {:?} stream on {}", handle, self.params.proto, local);

        Ok(handle)
    }

    /// Returns the addresses and settings of a stream.
    ///
    /// # Errors
    ///
    /// Returns [Error::UseAfterClose] for a closed stream.
    pub fn get_params(&self, handle: StreamHandle) -> Result<StreamParams> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;

        Ok(StreamParams {
            local: stream.local,
            remote: stream.remote,
            cfg: stream.config(),
        })
    }

    /// Replaces the changeable settings of a stream.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for an invalid notification and
    /// [Error::UseAfterClose] for a closed stream.
    pub fn update_config(&self, handle: StreamHandle, cfg: StreamConfig) -> Result<()> {
        let (recv, send, error) = notifications(&cfg)?;
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;

        stream.recv = recv;
        stream.send = send;
        stream.error = error;
        stream.retries = cfg.nb_retries;
        stream.linger = cfg.linger_cycles;

        if let StreamKind::Tcp(tcp) = &mut stream.kind {
            tcp.tcb.set_limits(cfg.nb_retries, cfg.linger_cycles);
        }

        Ok(())
    }

    /// Closes a stream.
    ///
    /// The handle is unusable afterwards. Received data is dropped. A TCP
    /// connection sends its remaining data followed by a FIN and is released
    /// once it reaches CLOSED; a UDP stream is released once its queued
    /// datagrams were taken by `tx_bulk`.
    ///
    /// # Errors
    ///
    /// Returns [Error::UseAfterClose] for a closed stream.
    pub fn close(&self, handle: StreamHandle) -> Result<()> {
        let released = {
            let mut slot = self.slot(handle)?;
            let stream = slot.live(handle)?;

            stream.user_closed = true;
            stream.recv = Notify::None;
            stream.send = Notify::None;
            stream.error = Notify::None;

            let mut out = Output::new();
            let done = match &mut stream.kind {
                StreamKind::Tcp(tcp) => {
                    tcp.synq.clear();
                    tcp.tcb.close(self.now(), &mut out)
                }
                StreamKind::Udp(udp) => {
                    udp.rbuf.clear();
                    udp.in_flight == 0
                }
            };

            self.transmit(stream, out.segments);

            if done { slot.stream.take() } else { None }
        };

        debug!("[{}] closed by user", handle);

        if let Some(stream) = released {
            self.release(stream);
        }

        Ok(())
    }

    /// Aborts a stream: buffered data is dropped and a synchronized TCP
    /// connection is reset. The stream stays open until closed.
    ///
    /// # Errors
    ///
    /// Returns [Error::UseAfterClose] for a closed stream.
    pub fn abort(&self, handle: StreamHandle) -> Result<()> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;

        match &mut stream.kind {
            StreamKind::Tcp(tcp) => {
                let mut out = Output::new();

                tcp.synq.clear();
                tcp.tcb.abort(&mut out);

                self.transmit(stream, out.segments);

                if let Some(sock) = stream.conn.take() {
                    self.demux.write().remove_conn(&sock, handle);
                }
            }
            StreamKind::Udp(udp) => udp.rbuf.clear(),
        }

        Ok(())
    }

    /// Puts a TCP stream into LISTEN.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidState] unless the stream is OPEN.
    pub fn listen(&self, handle: StreamHandle) -> Result<()> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;

        stream.tcp()?.tcb.listen()
    }

    /// Starts an active open of a TCP stream towards `remote`.
    ///
    /// An unspecified local IP is replaced by the address of the device the
    /// destination resolves to.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidState] unless the stream is OPEN,
    /// [Error::NoRoute] if `remote` cannot be resolved, and
    /// [Error::AddrInUse] if the connection already exists.
    pub fn connect(&self, handle: StreamHandle, remote: SocketAddr) -> Result<()> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;
        let state = stream.tcp()?.tcb.state();

        if state != ConnectionState::OPEN {
            return Err(Error::InvalidState(state));
        }

        if remote.is_ipv4() != stream.local.is_ipv4() {
            return Err(Error::InvalidConfig("local and remote address families differ"));
        }

        if remote.ip().is_unspecified() || remote.port() == 0 {
            return Err(Error::InvalidConfig("remote address is unspecified"));
        }

        let dst = self.resolve(remote.ip())?;

        if stream.device.is_some_and(|dev| dev != dst.device) {
            return Err(Error::NoRoute(remote.ip()));
        }

        let mut local = stream.local;
        if local.ip().is_unspecified() {
            local.set_ip(self.device_addr(dst.device, remote.ip())?);
        }

        let sock = Socket::new(local, remote);
        self.demux.write().insert_conn(sock, handle)?;

        let cfg = self.tcb_config(stream.retries, stream.linger, dst.mss());
        let mut tcb = Tcb::new(sock, cfg, self.congestion());
        let mut out = Output::new();

        if let Err(err) = tcb.connect(self.isn(&sock), dst.mss(), self.now(), &mut out) {
            self.demux.write().remove_conn(&sock, handle);
            return Err(err);
        }

        stream.tcp()?.tcb = tcb;
        stream.local = local;
        stream.remote = remote;
        stream.device = Some(dst.device);
        stream.conn = Some(sock);
        stream.cache(remote.ip(), self.dst_generation(), dst);

        self.transmit(stream, out.segments);

        Ok(())
    }

    /// Moves up to `max` queued connection requests of a listener into
    /// `out`, returning the number moved.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidState] unless the stream is listening.
    pub fn synreqs(&self, handle: StreamHandle, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;
        let tcp = stream.tcp()?;

        if tcp.tcb.state() != ConnectionState::LISTEN {
            return Err(Error::InvalidState(tcp.tcb.state()));
        }

        let n = usize::min(max, tcp.synq.len());
        out.extend(tcp.synq.drain(..n));

        let pending = !tcp.synq.is_empty();
        stream.recv.settle(pending);

        Ok(n)
    }

    /// Creates one stream per connection request, each in SYN_RECEIVED
    /// with its SYN-ACK queued.
    ///
    /// Every request is handled on its own: the result for a request that
    /// could not be accepted carries the error, and no stream is left behind
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidState] unless `listener` is listening.
    pub fn accept(
        &self,
        listener: StreamHandle,
        reqs: Vec<AcceptParams>,
    ) -> Result<Vec<Result<StreamHandle>>> {
        let (bound, device) = {
            let mut slot = self.slot(listener)?;
            let stream = slot.live(listener)?;
            let state = stream.tcp()?.tcb.state();

            if state != ConnectionState::LISTEN {
                return Err(Error::InvalidState(state));
            }

            (stream.local, stream.device)
        };

        Ok(reqs
            .into_iter()
            .map(|req| self.accept_one(bound, device, req))
            .collect())
    }

    fn accept_one(
        &self,
        bound: SocketAddr,
        device: Option<DeviceId>,
        mut req: AcceptParams,
    ) -> Result<StreamHandle> {
        let (recv, send, error) = notifications(&req.cfg)?;
        let inbound = bulk::parse(&mut req.syn)?;

        let InboundL4::Tcp(tcph) = inbound.l4 else {
            return Err(Error::InvalidConfig("connection request is not a TCP segment"));
        };

        if !tcph.syn() || tcph.ack() || tcph.rst() {
            return Err(Error::InvalidConfig("packet is not a connection request"));
        }

        let local = SocketAddr::new(inbound.dst, tcph.dst_port());
        let remote = SocketAddr::new(inbound.src, tcph.src_port());

        if local.port() != bound.port()
            || local.is_ipv4() != bound.is_ipv4()
            || (!bound.ip().is_unspecified() && bound.ip() != local.ip())
        {
            return Err(Error::InvalidConfig("request does not match the listener"));
        }

        let dst = self.resolve(remote.ip())?;
        let sock = Socket::new(local, remote);
        let handle = self.alloc_slot().ok_or(Error::ResourceExhausted)?;

        if let Err(err) = self.demux.write().insert_conn(sock, handle) {
            self.free_slot(handle);
            return Err(err);
        }

        let cfg = self.tcb_config(req.cfg.nb_retries, req.cfg.linger_cycles, dst.mss());
        let mut out = Output::new();
        let tcb = Tcb::accept(sock, &tcph, self.isn(&sock), cfg, self.congestion(), self.now(), &mut out);

        let tcb = match tcb {
            Ok(tcb) => tcb,
            Err(err) => {
                self.demux.write().remove_conn(&sock, handle);
                self.free_slot(handle);
                return Err(err);
            }
        };

        let mut stream = Stream {
            handle,
            local,
            remote,
            device: req.syn.rx_device.or(device),
            retries: req.cfg.nb_retries,
            linger: req.cfg.linger_cycles,
            recv,
            send,
            error,
            dst: None,
            port_reserved: false,
            conn: Some(sock),
            user_closed: false,
            kind: StreamKind::Tcp(TcpStream {
                tcb,
                synq: VecDeque::new(),
            }),
        };
        stream.cache(remote.ip(), self.dst_generation(), dst);

        let mut slot = self.slots[handle.index()].lock();
        self.transmit(&mut stream, out.segments);
        slot.stream = Some(stream);

        debug!("[{}] accepted connection {}", handle, sock);

        Ok(handle)
    }

    /// Queues `buf` for transmission on a TCP stream, returning the number
    /// of bytes taken (possibly fewer than `buf.len()` when the send buffer
    /// fills up).
    ///
    /// # Errors
    ///
    /// Returns [Error::NotConnected] unless the connection can send.
    pub fn send(&self, handle: StreamHandle, buf: &[u8]) -> Result<usize> {
        self.writev(handle, &[IoSlice::new(buf)])
    }

    /// Vectored form of [Context::send].
    ///
    /// # Errors
    ///
    /// Returns [Error::NotConnected] unless the connection can send.
    pub fn writev(&self, handle: StreamHandle, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let mut pending = Pending::default();

        let taken = {
            let mut slot = self.slot(handle)?;
            let stream = slot.live(handle)?;
            let was_readable = stream.is_readable();
            let tcp = stream.tcp()?;
            let now = self.now();
            let mut out = Output::new();
            let mut taken = 0;

            for buf in bufs {
                match tcp.tcb.send(buf, now, &mut out) {
                    Ok(n) => {
                        taken += n;
                        if n < buf.len() {
                            break;
                        }
                    }
                    Err(err) if taken == 0 => return Err(err),
                    Err(_) => break,
                }
            }

            self.drive(stream, out, was_readable, &mut pending);

            taken
        };

        pending.fire();

        Ok(taken)
    }

    /// Copies in-order received data of a TCP stream into `bufs`, returning
    /// the number of bytes copied. A return of 0 with a non-empty `bufs`
    /// means nothing is buffered (or the peer closed).
    ///
    /// # Errors
    ///
    /// Returns [Error::NotConnected] for a stream that never connected.
    pub fn readv(&self, handle: StreamHandle, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;
        let tcp = stream.tcp()?;

        if matches!(tcp.tcb.state(), ConnectionState::OPEN | ConnectionState::LISTEN) {
            return Err(Error::NotConnected);
        }

        let n = tcp.tcb.readv(bufs);
        let readable = stream.is_readable();
        stream.recv.settle(readable);

        Ok(n)
    }

    /// Moves up to `max` received packets of a stream into `out`, returning
    /// the number moved. TCP packets are in sequence order with headers
    /// stripped.
    ///
    /// # Errors
    ///
    /// Returns [Error::NotConnected] for a TCP stream that never connected.
    pub fn recv(&self, handle: StreamHandle, out: &mut Vec<Packet>, max: usize) -> Result<usize> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;

        let n = match &mut stream.kind {
            StreamKind::Tcp(tcp) => {
                if matches!(tcp.tcb.state(), ConnectionState::OPEN | ConnectionState::LISTEN) {
                    return Err(Error::NotConnected);
                }

                tcp.tcb.recv(out, max)
            }
            StreamKind::Udp(udp) => {
                let n = usize::min(max, udp.rbuf.len());
                out.extend(udp.rbuf.drain(..n));
                n
            }
        };

        let readable = stream.is_readable();
        stream.recv.settle(readable);

        Ok(n)
    }

    /// Queues datagrams of a UDP stream for transmission to `dst`, or to the
    /// stream's remote address when `None`. Sent packets are removed from
    /// the front of `pkts`; the rest stay, for instance when the send
    /// buffer is full. Each packet needs headroom for the L2, IP and UDP
    /// headers.
    ///
    /// # Errors
    ///
    /// Returns an error if no packet could be queued because of a missing
    /// destination, a route failure, or a malformed first packet.
    pub fn send_to(
        &self,
        handle: StreamHandle,
        pkts: &mut Vec<Packet>,
        dst: Option<SocketAddr>,
    ) -> Result<usize> {
        let mut slot = self.slot(handle)?;
        let stream = slot.live(handle)?;
        stream.udp()?;

        let remote = dst.unwrap_or(stream.remote);

        if remote.ip().is_unspecified() || remote.port() == 0 {
            return Err(Error::InvalidConfig("no destination address"));
        }

        if remote.is_ipv4() != stream.local.is_ipv4() {
            return Err(Error::InvalidConfig("local and remote address families differ"));
        }

        let route = stream.destination(self, remote.ip())?;

        if stream.device.is_some_and(|dev| dev != route.device) {
            return Err(Error::NoRoute(remote.ip()));
        }

        let src_ip = if stream.local.ip().is_unspecified() {
            self.device_addr(route.device, remote.ip())?
        } else {
            stream.local.ip()
        };

        let local_port = stream.local.port();
        let needed = route.header.len() + UdpHeader::HEADER_LEN as usize;
        let max_payload = route.mtu - route.l3_len - UdpHeader::HEADER_LEN;
        let sbufs = self.params.max_stream_sbufs;
        let udp = stream.udp()?;

        let mut sent = 0;
        let mut failure = None;
        let mut queue = mem::take(pkts).into_iter();

        for pkt in queue.by_ref() {
            if udp.in_flight >= sbufs {
                pkts.push(pkt);
                break;
            }

            if pkt.headroom() < needed {
                failure = Some(Error::Header(HeaderError::InsufficientHeadroom {
                    needed,
                    available: pkt.headroom(),
                }));
                pkts.push(pkt);
                break;
            }

            if pkt.len() > max_payload as usize {
                failure = Some(Error::Header(HeaderError::PayloadTooLarge {
                    provided: pkt.len(),
                    max: max_payload,
                }));
                pkts.push(pkt);
                break;
            }

            let udph = match UdpHeader::new(local_port, remote.port(), pkt.len()) {
                Ok(udph) => udph,
                Err(err) => {
                    failure = Some(err);
                    pkts.push(pkt);
                    break;
                }
            };

            let l4 = L4Header::Udp(udph);
            if let Err(err) = self.queue_tx(&route, pkt, src_ip, remote.ip(), l4, TxOrigin::Datagram(handle)) {
                warn!("[{}] dropped datagram to {}: {}", handle, remote, err);
                failure = Some(err);
                break;
            }

            udp.in_flight += 1;
            sent += 1;
        }

        pkts.extend(queue);

        match failure {
            Some(err) if sent == 0 => Err(err),
            _ => Ok(sent),
        }
    }

    /// Returns the state of a TCP stream's connection.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for a UDP stream.
    pub fn tcp_state(&self, handle: StreamHandle) -> Result<ConnectionState> {
        let mut slot = self.slot(handle)?;

        Ok(slot.live(handle)?.tcp()?.tcb.state())
    }

    /// Returns the effective MSS of a TCP stream's connection.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for a UDP stream.
    pub fn mss(&self, handle: StreamHandle) -> Result<u16> {
        let mut slot = self.slot(handle)?;

        Ok(slot.live(handle)?.tcp()?.tcb.mss())
    }

    /// Transmits the segments and delivers the signals of one state machine
    /// step.
    pub(crate) fn drive(&self, stream: &mut Stream, out: Output, was_readable: bool, pending: &mut Pending) {
        self.transmit(stream, out.segments);
        stream.notify(out.signals, !was_readable, pending);
    }

    /// Frames TCP segments towards the stream's remote and queues them on
    /// the destination's device. Segments that cannot be routed are dropped;
    /// the retransmission timer recovers them.
    pub(crate) fn transmit(&self, stream: &mut Stream, segments: Vec<TcpSegment>) {
        if segments.is_empty() {
            return;
        }

        let remote = stream.remote.ip();
        let dst = match stream.destination(self, remote) {
            Ok(dst) => dst,
            Err(err) => {
                warn!(
                    "[{}] dropping {} segments to {}: {}",
                    stream.handle,
                    segments.len(),
                    remote,
                    err
                );
                return;
            }
        };

        let headroom = dst.header.len() + TcpHeader::MAX_HEADER_LEN as usize;

        for seg in segments {
            let pkt = Packet::with_headroom(headroom, &seg.payload);

            let l4 = L4Header::Tcp(seg.tcp);
            if let Err(err) = self.queue_tx(&dst, pkt, stream.local.ip(), remote, l4, TxOrigin::Connection) {
                warn!("[{}] dropping segment to {}: {}", stream.handle, remote, err);
            }
        }
    }
}
