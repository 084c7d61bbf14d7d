//! TCP finite state machine (FSM), as described in [RFC 793].
//!
//! The state machine performs no I/O: inbound segments and `process` ticks
//! are fed in, and the segments to transmit together with notification
//! [Signals] are collected in an [Output]. Time is measured in ticks of the
//! owning context.
//!
//! [RFC 793]: https://www.rfc-editor.org/rfc/rfc793

use std::collections::{BTreeMap, VecDeque};
use std::io::IoSliceMut;
use std::mem;

use bitflags::bitflags;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use super::congestion::CongestionControl;
use super::headers::TcpHeader;
use super::{Socket, TcpSegment};
use crate::packet::Packet;
use crate::{Error, RejectReason, Result};

/// RFC 1122 (4.2.2.6)
///
/// If an MSS option is not received at connection setup, TCP MUST assume a
/// default send MSS of 536 (576-40).
pub const DEFAULT_TCP_MSS: u16 = 536;

/// Size of a TCP header without options, subtracted from the path MTU to
/// derive the advertised MSS.
pub const TCP_HDR_LEN: u16 = 20;

/// Default number of retransmissions before a connection is abandoned.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default initial retransmission timeout (`RTO`), in ticks.
pub const DEFAULT_RTO_CYCLES: u64 = 8;

/// The persist interval stops doubling at `RTO << 6`.
const MAX_PERSIST_SHIFT: u32 = 6;

bitflags! {
    /// Notifications raised by the state machine for the stream's user.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Signals: u8 {
        /// Data (or an end of stream) became available to read.
        const RECV = 1 << 0;
        /// Send buffer space became available, or the connection was
        /// established.
        const SEND = 1 << 1;
        /// The connection failed (reset by peer, retransmissions exhausted).
        const ERROR = 1 << 2;
    }
}

/// Segments to transmit and signals to deliver after driving a [Tcb].
#[derive(Debug, Default)]
pub struct Output {
    /// Segments to frame and queue for transmission, in order.
    pub segments: Vec<TcpSegment>,
    /// Notifications raised while driving the state machine.
    pub signals: Signals,
}

impl Output {
    /// Creates an empty output.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fate of an inbound packet handed to [Tcb::on_segment].
#[derive(Debug)]
pub enum Delivery {
    /// The segment was processed and the packet dropped (control segments,
    /// duplicates, data outside the window).
    Consumed,
    /// The packet was placed in the receive buffer (in order or out of
    /// order).
    Queued,
    /// The packet is returned to the caller with the reason it could not be
    /// taken.
    Rejected(Packet, RejectReason),
}

/// Per-connection limits, in packets and ticks.
#[derive(Debug, Clone, Copy)]
pub struct TcbConfig {
    /// Capacity of the receive buffer (in-order plus out-of-order packets).
    pub rbufs: usize,
    /// Capacity of the send buffer (unsent plus unacknowledged segments).
    pub sbufs: usize,
    /// MSS advertised to the peer, derived from the path MTU.
    pub local_mss: u16,
    /// Initial retransmission timeout, in ticks.
    pub rto: u64,
    /// Number of retransmissions attempted before giving up.
    pub retries: u32,
    /// Time spent in `TIME_WAIT`, in ticks.
    pub timewait: u64,
    /// Time granted after a close to flush the send buffer, in ticks.
    /// `None` waits for as long as the retransmission limit allows.
    pub linger: Option<u64>,
}

impl Default for TcbConfig {
    fn default() -> Self {
        Self {
            rbufs: 16,
            sbufs: 16,
            local_mss: DEFAULT_TCP_MSS,
            rto: DEFAULT_RTO_CYCLES,
            retries: DEFAULT_RETRIES,
            timewait: 0,
            linger: None,
        }
    }
}

/// Transmission Control Block (TCB).
#[derive(Debug)]
pub struct Tcb {
    /// Current state of the TCP connection.
    state: ConnectionState,
    /// Socket addresses of the host and remote TCPs.
    sock: Socket,
    /// Send Sequence Space for the TCP connection.
    snd: SendSeqSpace,
    /// Receive Sequence Space for the TCP connection.
    rcv: RecvSeqSpace,
    /// In-order packets received from the peer, ready for the user.
    rbuf: VecDeque<Packet>,
    /// Out-of-order packets keyed by their offset from `IRS`, with a flag
    /// telling whether the segment also carried a `FIN`.
    ooo: BTreeMap<u32, (Packet, bool)>,
    /// Data accepted from the user that has not entered the send window,
    /// chunked to the sender MSS.
    unsent: VecDeque<Bytes>,
    /// Transmitted segments awaiting acknowledgment, oldest first.
    retransmit_q: VecDeque<TcpSegment>,
    /// Tick at which the oldest unacknowledged segment is retransmitted.
    rto_deadline: Option<u64>,
    /// Current retransmission timeout, doubled on each expiry.
    rto: u64,
    /// Retransmissions since the last acknowledgment of new data.
    retries: u32,
    /// Tick at which the persist timer fires (RFC 1122 4.2.2.17).
    persist_deadline: Option<u64>,
    /// Doublings of the persist interval since the window closed.
    persist_shift: u32,
    /// A `FIN` follows the unsent data.
    fin_queued: bool,
    /// Our `FIN` entered the sequence space.
    fin_sent: bool,
    /// Our `FIN` was acknowledged.
    fin_acked: bool,
    /// The user closed the connection.
    closed: bool,
    /// Tick at which unsent data is abandoned after a close.
    linger_deadline: Option<u64>,
    /// Tick at which `TIME_WAIT` ends.
    time_wait_deadline: Option<u64>,
    /// An ACK advertising a reopened receive window is owed to the peer.
    window_update: bool,
    /// A send was truncated by a full send buffer.
    send_blocked: bool,
    /// An error signal was raised (or suppressed by an abort).
    error_reported: bool,
    /// Maximum Segment Size (MSS) received from peer.
    peer_mss: u16,
    /// How the connection was opened, once it has been.
    open_kind: Option<OpenKind>,
    /// Per-connection limits.
    cfg: TcbConfig,
    /// Congestion control policy.
    cc: Box<dyn CongestionControl>,
}

/// Connection states of a TCP stream. `OPEN` precedes both `LISTEN` and
/// `SYN_SENT`; the rest follow RFC 793.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
pub enum ConnectionState {
    /// Allocated and bound; neither listening nor connecting.
    OPEN,
    /// Accepting SYNs into the SYN queue.
    LISTEN,
    /// SYN sent, no SYN seen from the peer yet.
    SYN_SENT,
    /// SYN seen and SYN-ACK sent; our SYN is unacknowledged.
    SYN_RECEIVED,
    /// Both directions open.
    ESTABLISHED,
    /// Our FIN is queued or unacknowledged; the peer has not closed.
    FIN_WAIT_1,
    /// Our FIN is acknowledged; waiting on the peer's FIN.
    FIN_WAIT_2,
    /// The peer closed; we may still send.
    CLOSE_WAIT,
    /// Both sides sent FIN at once; ours is unacknowledged.
    CLOSING,
    /// The peer closed first and our FIN is unacknowledged.
    LAST_ACK,
    /// Both FINs acknowledged; absorbing retransmitted FINs until the timer
    /// runs out.
    TIME_WAIT,
    /// Torn down. The slot is released once the user has closed it.
    CLOSED,
}

impl ConnectionState {
    /// Returns `true` once a SYN has been received from the peer and the
    /// connection has not been torn down.
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            ConnectionState::SYN_RECEIVED
                | ConnectionState::ESTABLISHED
                | ConnectionState::FIN_WAIT_1
                | ConnectionState::FIN_WAIT_2
                | ConnectionState::CLOSE_WAIT
                | ConnectionState::CLOSING
                | ConnectionState::LAST_ACK
        )
    }
}

/// Send sequence variables (RFC 793 3.2). Bytes in `una..nxt` are in
/// flight; the peer allows sending up to `una + wnd`.
#[derive(Debug, Default)]
struct SendSeqSpace {
    una: u32,
    nxt: u32,
    wnd: u16,
    /// SEG.SEQ of the segment that last updated `wnd`.
    wl1: u32,
    /// SEG.ACK of the segment that last updated `wnd`.
    wl2: u32,
    iss: u32,
}

/// Receive sequence variables. Acceptable segments start within
/// `nxt..nxt + wnd`.
#[derive(Debug, Default)]
struct RecvSeqSpace {
    nxt: u32,
    wnd: u16,
    irs: u32,
}

/// States a TCP connection could be opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum OpenKind {
    /// TCP connection was opened in a "passive" state (`LISTEN` -> `SYN_RECEIVED`).
    PASSIVE_OPEN,
    /// TCP connection was opened in an "active" state (`OPEN` -> `SYN_SENT`).
    ACTIVE_OPEN,
}

impl Tcb {
    /// Creates a TCB in the `OPEN` state for the given socket pair.
    pub fn new(sock: Socket, cfg: TcbConfig, cc: Box<dyn CongestionControl>) -> Self {
        let mut tcb = Self {
            state: ConnectionState::OPEN,
            sock,
            snd: Default::default(),
            rcv: Default::default(),
            rbuf: Default::default(),
            ooo: Default::default(),
            unsent: Default::default(),
            retransmit_q: Default::default(),
            rto_deadline: None,
            rto: cfg.rto,
            retries: 0,
            persist_deadline: None,
            persist_shift: 0,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            closed: false,
            linger_deadline: None,
            time_wait_deadline: None,
            window_update: false,
            send_blocked: false,
            error_reported: false,
            peer_mss: DEFAULT_TCP_MSS,
            open_kind: None,
            cfg,
            cc,
        };

        tcb.refresh_window();

        tcb
    }

    /// Moves an `OPEN` connection to `LISTEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the `OPEN` state.
    pub fn listen(&mut self) -> Result<()> {
        if self.state != ConnectionState::OPEN {
            return Err(Error::InvalidState(self.state));
        }

        debug!("[{}] (OPEN) listening: OPEN -> LISTEN", self.sock);

        self.state = ConnectionState::LISTEN;

        Ok(())
    }

    /// Initiates a connection from the `OPEN` state, emitting a `SYN` that
    /// advertises `local_mss`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in the `OPEN` state or the
    /// `SYN` segment could not be constructed.
    pub fn connect(&mut self, iss: u32, local_mss: u16, now: u64, out: &mut Output) -> Result<()> {
        if self.state != ConnectionState::OPEN {
            return Err(Error::InvalidState(self.state));
        }

        self.cfg.local_mss = local_mss;
        self.snd = SendSeqSpace {
            // Set to ISS since there have been no sequence numbers ACKed yet.
            una: iss,
            // Incremented to account for the SYN being transmitted.
            nxt: iss.wrapping_add(1),
            // Will be updated when peer responds.
            wnd: 0,
            wl1: 0,
            wl2: 0,
            iss,
        };
        self.refresh_window();

        // <SEQ=ISS><CTL=SYN>
        let syn = self.create_syn()?;

        self.state = ConnectionState::SYN_SENT;
        self.open_kind = Some(OpenKind::ACTIVE_OPEN);
        self.transmit(syn, now, out);

        debug!(
            "[{}] (OPEN) constructing SYN: OPEN/ACTIVE_OPEN -> SYN_SENT",
            self.sock
        );

        Ok(())
    }

    /// Creates a TCB for a connection request taken from a listener's SYN
    /// queue, emitting the `SYN_ACK`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SYN_ACK` segment could not be constructed.
    pub fn accept(
        sock: Socket,
        syn: &TcpHeader,
        iss: u32,
        cfg: TcbConfig,
        cc: Box<dyn CongestionControl>,
        now: u64,
        out: &mut Output,
    ) -> Result<Self> {
        let mut conn = Self::new(sock, cfg, cc);

        conn.snd = SendSeqSpace {
            una: iss,
            nxt: iss.wrapping_add(1),
            // The window size that was advertised by the peer.
            wnd: syn.window(),
            wl1: syn.seq_number(),
            wl2: 0,
            iss,
        };
        conn.rcv.irs = syn.seq_number();
        conn.rcv.nxt = syn.seq_number().wrapping_add(1);
        conn.peer_mss = syn.options().mss().unwrap_or(DEFAULT_TCP_MSS);

        // <SEQ=ISS><ACK=RCV.NXT><CTL=SYN,ACK>
        let syn_ack = conn.create_syn_ack()?;

        conn.state = ConnectionState::SYN_RECEIVED;
        conn.open_kind = Some(OpenKind::PASSIVE_OPEN);
        conn.transmit(syn_ack, now, out);

        debug!(
            "[{}] (LISTEN) received SYN, constructing SYN_ACK: LISTEN/PASSIVE_OPEN -> SYN_RECEIVED",
            conn.sock
        );

        Ok(conn)
    }

    /// Returns the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns the socket pair of the connection.
    pub fn sock(&self) -> &Socket {
        &self.sock
    }

    /// Returns how the connection was opened, if it has been.
    pub fn open_kind(&self) -> Option<OpenKind> {
        self.open_kind
    }

    /// Returns the sender MSS: the smaller of the MSS received from the peer
    /// and the one we advertised.
    pub fn mss(&self) -> u16 {
        u16::min(self.peer_mss, self.cfg.local_mss)
    }

    /// Returns `true` if in-order data is waiting to be read.
    pub fn is_readable(&self) -> bool {
        !self.rbuf.is_empty()
    }

    /// Returns `true` if the send buffer can take more data.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT
        ) && !self.fin_queued
            && self.send_occupancy() < self.cfg.sbufs
    }

    /// Returns `true` once the user closed the connection.
    pub fn is_user_closed(&self) -> bool {
        self.closed
    }

    /// Updates the retransmission limit and the linger period.
    pub fn set_limits(&mut self, retries: u32, linger: Option<u64>) {
        self.cfg.retries = retries;
        self.cfg.linger = linger;
    }

    /// Number of segments held in the send buffer.
    fn send_occupancy(&self) -> usize {
        self.unsent.len() + self.retransmit_q.len()
    }

    /// Number of packets held in the receive buffer.
    fn recv_occupancy(&self) -> usize {
        self.rbuf.len() + self.ooo.len()
    }

    /// Recomputes RCV.WND from the free receive buffer slots.
    fn refresh_window(&mut self) {
        let free = self.cfg.rbufs.saturating_sub(self.recv_occupancy());

        self.rcv.wnd = usize::min(free * self.cfg.local_mss as usize, u16::MAX as usize) as u16;
    }

    /// Appends application data to the send buffer, returning the number of
    /// bytes accepted. Data is chunked to the sender MSS and released into
    /// the send window right away when the peer and congestion windows
    /// allow.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not in a state for sending data
    /// (`ESTABLISHED` or `CLOSE_WAIT`), or the user already closed it.
    pub fn send(&mut self, buf: &[u8], now: u64, out: &mut Output) -> Result<usize> {
        if !matches!(
            self.state,
            ConnectionState::ESTABLISHED | ConnectionState::CLOSE_WAIT,
        ) || self.fin_queued
        {
            return Err(Error::NotConnected);
        }

        let mut accepted = 0;

        for chunk in buf.chunks(self.mss() as usize) {
            if self.send_occupancy() >= self.cfg.sbufs {
                break;
            }

            self.unsent.push_back(Bytes::copy_from_slice(chunk));
            accepted += chunk.len();
        }

        if accepted < buf.len() {
            debug!(
                "[{}] ({:?}) send buffer full: accepted {} of {} bytes",
                self.sock,
                self.state,
                accepted,
                buf.len()
            );

            self.send_blocked = true;
        }

        self.try_send(now, out);

        Ok(accepted)
    }

    /// Moves up to `max` in-order packets from the receive buffer into `out`,
    /// returning the number moved.
    pub fn recv(&mut self, out: &mut Vec<Packet>, max: usize) -> usize {
        let n = usize::min(max, self.rbuf.len());

        out.extend(self.rbuf.drain(..n));
        self.on_buffer_drained();

        n
    }

    /// Copies in-order data into `bufs`, returning the number of bytes
    /// written. Packets only partially copied stay at the head of the
    /// receive buffer.
    pub fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> usize {
        let mut total = 0;

        for buf in bufs.iter_mut() {
            let mut pos = 0;

            while pos < buf.len() {
                let Some(pkt) = self.rbuf.front_mut() else {
                    break;
                };

                let n = usize::min(buf.len() - pos, pkt.len());
                buf[pos..pos + n].copy_from_slice(&pkt.data()[..n]);
                pkt.adj(n);
                pos += n;

                if pkt.is_empty() {
                    self.rbuf.pop_front();
                }
            }

            total += pos;

            if self.rbuf.is_empty() {
                break;
            }
        }

        self.on_buffer_drained();

        total
    }

    /// Schedules a window update once a closed receive window reopened.
    fn on_buffer_drained(&mut self) {
        let prev = self.rcv.wnd;
        self.refresh_window();

        if prev < self.cfg.local_mss && self.rcv.wnd >= self.cfg.local_mss {
            trace!(
                "[{}] ({:?}) receive window reopened: {} -> {}",
                self.sock, self.state, prev, self.rcv.wnd
            );

            self.window_update = true;
        }
    }

    /// Starts a graceful close at `now`. Returns `true` if the connection can
    /// be released immediately.
    ///
    /// A `FIN` is queued behind any unsent data; the connection is released
    /// later, once everything is acknowledged, `TIME_WAIT` ends, or the linger
    /// deadline passes.
    pub fn close(&mut self, now: u64, out: &mut Output) -> bool {
        self.closed = true;

        // Nobody reads past this point.
        self.rbuf.clear();
        self.ooo.clear();
        self.refresh_window();

        match self.state {
            ConnectionState::OPEN
            | ConnectionState::LISTEN
            | ConnectionState::SYN_SENT
            | ConnectionState::CLOSED => {
                debug!(
                    "[{}] ({:?}) close call received, releasing: {:?} -> CLOSED",
                    self.sock, self.state, self.state
                );

                self.reset();

                true
            }
            ConnectionState::SYN_RECEIVED | ConnectionState::ESTABLISHED => {
                debug!(
                    "[{}] ({state:?}) close call received, queueing FIN: {state:?} -> FIN_WAIT_1",
                    self.sock,
                    state = self.state
                );

                self.state = ConnectionState::FIN_WAIT_1;
                self.start_close(now, out);

                false
            }
            ConnectionState::CLOSE_WAIT => {
                // CLOSE-WAIT STATE
                //
                // Queue this request until all preceding SENDs have been
                // segmentized; then send a FIN segment, enter LAST-ACK state.
                debug!(
                    "[{}] (CLOSE_WAIT) close call received, queueing FIN: CLOSE_WAIT -> LAST_ACK",
                    self.sock
                );

                self.state = ConnectionState::LAST_ACK;
                self.start_close(now, out);

                false
            }
            ConnectionState::FIN_WAIT_1
            | ConnectionState::FIN_WAIT_2
            | ConnectionState::CLOSING
            | ConnectionState::LAST_ACK
            | ConnectionState::TIME_WAIT => {
                debug!(
                    "[{}] ({:?}) close call received: already closing",
                    self.sock, self.state
                );

                false
            }
        }
    }

    fn start_close(&mut self, now: u64, out: &mut Output) {
        self.fin_queued = true;
        self.linger_deadline = self.cfg.linger.map(|linger| now.saturating_add(linger));
        self.try_send(now, out);
    }

    /// Aborts the connection: queued data in both directions is discarded, a
    /// `RST` is emitted if the connection was synchronized, and the state
    /// becomes `CLOSED`. No error signal is raised.
    pub fn abort(&mut self, out: &mut Output) {
        if self.state.is_synchronized() {
            // <SEQ=SND.NXT><CTL=RST>
            out.segments.push(self.create_rst(self.snd.nxt, None));

            warn!(
                "[{}] ({state:?}) connection aborted, constructing RST: {state:?} -> CLOSED",
                self.sock,
                state = self.state
            );
        } else {
            debug!(
                "[{}] ({state:?}) connection aborted: {state:?} -> CLOSED",
                self.sock,
                state = self.state
            );
        }

        // Aborts are requested by the user, who needs no notification.
        self.error_reported = true;
        self.reset();
    }

    /// Drops every buffer and timer and enters `CLOSED`.
    fn reset(&mut self) {
        self.state = ConnectionState::CLOSED;
        self.rbuf.clear();
        self.ooo.clear();
        self.unsent.clear();
        self.retransmit_q.clear();
        self.rto_deadline = None;
        self.persist_deadline = None;
        self.linger_deadline = None;
        self.time_wait_deadline = None;
        self.window_update = false;
        self.fin_queued = false;
        self.refresh_window();
    }

    /// Raises the error signal, at most once per connection.
    fn fail(&mut self, out: &mut Output) {
        if !self.error_reported {
            self.error_reported = true;
            out.signals |= Signals::ERROR;
        }
    }

    /// Processes an incoming TCP segment for the connection. `pkt` carries
    /// the segment's payload at its data offset.
    ///
    /// Dispatches on the current state following the segment arrival
    /// rules of RFC 793 3.9. Segments ahead of `RCV.NXT` wait in the
    /// reordering queue.
    pub fn on_segment(
        &mut self,
        tcph: &TcpHeader,
        pkt: Packet,
        now: u64,
        out: &mut Output,
    ) -> Delivery {
        log_segment(&self.sock, tcph, pkt.len());

        match self.state {
            ConnectionState::OPEN | ConnectionState::LISTEN | ConnectionState::CLOSED => {
                debug!(
                    "[{}] ({:?}) segment for unsynchronized connection: rejecting",
                    self.sock, self.state
                );

                return Delivery::Rejected(pkt, RejectReason::NoMatchingStream);
            }
            ConnectionState::SYN_SENT => {
                self.on_syn_sent(tcph, now, out);
                self.try_send(now, out);

                return Delivery::Consumed;
            }
            _ => {}
        }

        let seqn = tcph.seq_number();
        let ackn = tcph.ack_number();

        // The peer retransmitted its SYN because our SYN_ACK was lost.
        if self.state == ConnectionState::SYN_RECEIVED && tcph.syn() && seqn == self.rcv.irs {
            if let Some(syn_ack) = self.retransmit_q.front() {
                debug!(
                    "[{}] (SYN_RECEIVED) received duplicate SYN: retransmitting SYN_ACK",
                    self.sock
                );

                out.segments.push(syn_ack.clone());
            }

            return Delivery::Consumed;
        }

        // The number of octets occupied by the data in the segment (counting
        // SYN and FIN).
        let seg_len = pkt.len() as u32 + tcph.syn() as u32 + tcph.fin() as u32;

        if !self.is_acceptable(seqn, seg_len) {
            debug!(
                "[{}] ({:?}) received unacceptable SEQ number {}: constructing ACK",
                self.sock, self.state, seqn
            );

            if !tcph.rst() {
                // TIME-WAIT STATE
                //
                // The only thing that can arrive in this state is a
                // retransmission of the remote FIN. Acknowledge it, and
                // restart the 2 MSL timeout.
                if self.state == ConnectionState::TIME_WAIT && tcph.fin() {
                    self.time_wait_deadline = Some(now.saturating_add(self.cfg.timewait));
                }

                // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
                out.segments.push(self.create_ack());

                // New data bounced off a full receive buffer.
                if self.rcv.wnd == 0 && !pkt.is_empty() && !wrapping_lt(seqn, self.rcv.nxt) {
                    return Delivery::Rejected(pkt, RejectReason::BufferFull);
                }
            }

            return Delivery::Consumed;
        }

        if tcph.rst() {
            warn!(
                "[{}] ({state:?}) received RST, connection reset: {state:?} -> CLOSED",
                self.sock,
                state = self.state,
            );

            self.reset();
            self.fail(out);

            return Delivery::Consumed;
        }

        if tcph.syn() {
            warn!(
                "[{}] ({state:?}) received SYN, constructing RST: {state:?} -> CLOSED",
                self.sock,
                state = self.state,
            );

            let rst = if tcph.ack() {
                self.create_rst(ackn, None)
            } else {
                self.create_rst(0, Some(seqn.wrapping_add(seg_len)))
            };

            out.segments.push(rst);
            self.reset();
            self.fail(out);

            return Delivery::Consumed;
        }

        if !tcph.ack() {
            debug!(
                "[{}] ({:?}) did not receive ACK: ignoring",
                self.sock, self.state,
            );

            return Delivery::Consumed;
        }

        if self.state == ConnectionState::SYN_RECEIVED {
            // If SND.UNA < SEG.ACK =< SND.NXT then the ACK is acceptable.
            if !is_between_wrapped(self.snd.una, ackn, self.snd.nxt.wrapping_add(1)) {
                // <SEQ=SEG.ACK><CTL=RST>
                out.segments.push(self.create_rst(ackn, None));

                warn!(
                    "[{}] (SYN_RECEIVED) received unacceptable ACK number {}: constructed RST",
                    self.sock, ackn,
                );

                return Delivery::Consumed;
            }

            debug!(
                "[{}] (SYN_RECEIVED) received valid ACK: SYN_RECEIVED -> ESTABLISHED",
                self.sock
            );

            self.state = ConnectionState::ESTABLISHED;
            self.snd.wl1 = seqn;
            self.snd.wl2 = ackn;
            self.snd.wnd = tcph.window();
            self.cc.on_established(self.mss());
            out.signals |= Signals::SEND;
        }

        if wrapping_lt(self.snd.nxt, ackn) {
            debug!(
                "[{}] ({:?}) received ACK number {} for untransmitted data: constructed ACK",
                self.sock, self.state, ackn
            );

            out.segments.push(self.create_ack());

            return Delivery::Consumed;
        }

        if wrapping_lt(self.snd.una, ackn) {
            self.on_ack(ackn, now, out);
        } else if ackn != self.snd.una {
            trace!(
                "[{}] ({:?}) received duplicate ACK number {}",
                self.sock, self.state, ackn
            );
        }

        // If SND.UNA =< SEG.ACK =< SND.NXT, the send window should be
        // updated. If (SND.WL1 < SEG.SEQ or (SND.WL1 = SEG.SEQ and
        // SND.WL2 =< SEG.ACK)), set SND.WND <- SEG.WND, set SND.WL1 <-
        // SEG.SEQ, and set SND.WL2 <- SEG.ACK.
        if !wrapping_lt(ackn, self.snd.una)
            && (wrapping_lt(self.snd.wl1, seqn)
                || (self.snd.wl1 == seqn && !wrapping_lt(ackn, self.snd.wl2)))
        {
            if self.snd.wnd != tcph.window() {
                debug!(
                    "[{}] ({:?}) updated send window, new size: {}",
                    self.sock,
                    self.state,
                    tcph.window()
                );
            }

            self.snd.wnd = tcph.window();
            self.snd.wl1 = seqn;
            self.snd.wl2 = ackn;
        }

        if self.fin_acked {
            match self.state {
                ConnectionState::FIN_WAIT_1 => {
                    debug!(
                        "[{}] (FIN_WAIT_1) received ACK for FIN: FIN_WAIT_1 -> FIN_WAIT_2",
                        self.sock
                    );

                    self.state = ConnectionState::FIN_WAIT_2;
                }
                ConnectionState::CLOSING => {
                    debug!(
                        "[{}] (CLOSING) received ACK for FIN: CLOSING -> TIME_WAIT",
                        self.sock
                    );

                    self.enter_time_wait(now);
                }
                ConnectionState::LAST_ACK => {
                    debug!(
                        "[{}] (LAST_ACK) received ACK for FIN: LAST_ACK -> CLOSED",
                        self.sock
                    );

                    self.reset();

                    return Delivery::Consumed;
                }
                _ => {}
            }
        }

        let delivery = if matches!(
            self.state,
            ConnectionState::ESTABLISHED | ConnectionState::FIN_WAIT_1 | ConnectionState::FIN_WAIT_2
        ) && seg_len > 0
        {
            let delivery = self.on_data(seqn, tcph.fin(), pkt, now, out);

            // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
            out.segments.push(self.create_ack());

            delivery
        } else {
            if !pkt.is_empty() {
                trace!(
                    "[{}] ({:?}) received data after peer FIN: ignoring",
                    self.sock, self.state
                );
            }

            Delivery::Consumed
        };

        self.try_send(now, out);

        delivery
    }

    /// Handles a segment in the `SYN_SENT` state.
    fn on_syn_sent(&mut self, tcph: &TcpHeader, now: u64, out: &mut Output) {
        let seqn = tcph.seq_number();
        let ackn = tcph.ack_number();

        // If SEG.ACK =< ISS, or SEG.ACK > SND.NXT, send a reset (unless the
        // RST bit is set, if so drop the segment and return).
        if tcph.ack() && !is_between_wrapped(self.snd.iss, ackn, self.snd.nxt.wrapping_add(1)) {
            if tcph.rst() {
                debug!(
                    "[{}] (SYN_SENT) invalid ACK number {} with RST: ignoring",
                    self.sock, ackn,
                );
            } else {
                debug!(
                    "[{}] (SYN_SENT) received invalid ACK number {}: constructing RST",
                    self.sock, ackn,
                );

                // <SEQ=SEG.ACK><CTL=RST>
                out.segments.push(self.create_rst(ackn, None));
            }

            return;
        }

        if tcph.rst() {
            // Ignore RST without ACK.
            if tcph.ack() {
                warn!(
                    "[{}] (SYN_SENT) received RST, connection refused: SYN_SENT -> CLOSED",
                    self.sock
                );

                self.reset();
                self.fail(out);
            }

            return;
        }

        if !tcph.syn() {
            debug!(
                "[{}] (SYN_SENT) received neither SYN nor RST: ignoring",
                self.sock
            );

            return;
        }

        // Previously unknown values can now be updated using incoming
        // segment.
        self.rcv.irs = seqn;
        self.rcv.nxt = seqn.wrapping_add(1);
        self.snd.wnd = tcph.window();
        self.snd.wl1 = seqn;
        self.snd.wl2 = ackn;
        self.peer_mss = tcph.options().mss().unwrap_or(DEFAULT_TCP_MSS);

        if tcph.ack() {
            debug!(
                "[{}] (SYN_SENT) received SYN_ACK, constructed ACK: SYN_SENT -> ESTABLISHED",
                self.sock
            );

            self.state = ConnectionState::ESTABLISHED;
            self.cc.on_established(self.mss());
            // Our SYN was ACKed.
            self.on_ack(ackn, now, out);

            // <SEQ=SND.NXT><ACK=RCV.NXT><CTL=ACK>
            out.segments.push(self.create_ack());
            out.signals |= Signals::SEND;
        } else {
            // Simultaneous open: the SYN_ACK replaces the SYN on the
            // retransmission queue.
            match self.create_syn_ack() {
                Ok(syn_ack) => {
                    debug!(
                        "[{}] (SYN_SENT) received SYN, constructed SYN_ACK: SYN_SENT -> SYN_RECEIVED",
                        self.sock
                    );

                    self.retransmit_q.clear();
                    self.rto_deadline = None;
                    self.state = ConnectionState::SYN_RECEIVED;
                    self.transmit(syn_ack, now, out);
                }
                Err(err) => {
                    warn!(
                        "[{}] (SYN_SENT) failed to construct SYN_ACK: {}",
                        self.sock, err
                    );
                }
            }
        }
    }

    /// RFC 793 (3.3) acceptability test for an incoming segment.
    fn is_acceptable(&self, seqn: u32, seg_len: u32) -> bool {
        let nxt_wnd = self.rcv.nxt.wrapping_add(self.rcv.wnd as u32);

        // There are four cases for the acceptability test for an incoming
        // segment:
        //
        // ```text
        //    Segment Receive  Test
        //    Length  Window
        //    ------- -------  -------------------------------------------
        //
        //       0       0     SEG.SEQ = RCV.NXT
        //
        //       0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
        //
        //      >0       0     not acceptable
        //
        //      >0      >0     RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
        //                  or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
        // ```
        match (seg_len, self.rcv.wnd) {
            // Case 1: SEG.SEQ = RCV.NXT
            (0, 0) => seqn == self.rcv.nxt,
            // Case 2: RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
            (0, _) => is_between_wrapped(self.rcv.nxt.wrapping_sub(1), seqn, nxt_wnd),
            // Case 3: not acceptable, although a FIN exactly at RCV.NXT
            // still closes the connection.
            (1, 0) => seqn == self.rcv.nxt,
            (_, 0) => false,
            // Case 4: RCV.NXT =< SEG.SEQ < RCV.NXT+RCV.WND
            //      or RCV.NXT =< SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
            (len, _) => {
                is_between_wrapped(self.rcv.nxt.wrapping_sub(1), seqn, nxt_wnd)
                    || is_between_wrapped(
                        self.rcv.nxt.wrapping_sub(1),
                        seqn.wrapping_add(len - 1),
                        nxt_wnd,
                    )
            }
        }
    }

    /// Processes newly acknowledged sequence space up to `ackn`.
    fn on_ack(&mut self, ackn: u32, now: u64, out: &mut Output) {
        let was_full = self.send_occupancy() >= self.cfg.sbufs;
        let mut acked_data = 0;

        // If SND.UNA < SEG.ACK =< SND.NXT then, set SND.UNA <- SEG.ACK.
        self.snd.una = ackn;

        // A segment on the retransmission queue is fully acknowledged if the
        // sum of its sequence number and length is less or equal than the
        // acknowledgment value in the incoming segment.
        while let Some(front) = self.retransmit_q.front_mut() {
            if !wrapping_lt(ackn, front.seq_end()) {
                acked_data += front.payload.len() as u32;

                if front.tcp.fin() {
                    self.fin_acked = true;
                }

                self.retransmit_q.pop_front();
            } else {
                if wrapping_lt(front.tcp.seq_number(), ackn) {
                    // Partially acknowledged, keep only the unacknowledged
                    // tail.
                    let n = ackn.wrapping_sub(front.tcp.seq_number());
                    let _ = front.payload.split_to(n as usize);
                    front.tcp.set_seq_number(ackn);

                    acked_data += n;
                }

                break;
            }
        }

        if acked_data > 0 {
            self.cc.on_ack(acked_data, self.mss());
        }

        self.retries = 0;
        self.rto = self.cfg.rto;
        self.rto_deadline = if self.retransmit_q.is_empty() {
            None
        } else {
            Some(now.saturating_add(self.rto))
        };

        if (was_full || self.send_blocked) && self.send_occupancy() < self.cfg.sbufs {
            self.send_blocked = false;
            out.signals |= Signals::SEND;
        }
    }

    /// Places a segment's payload in the receive buffer and handles an
    /// in-order `FIN`.
    fn on_data(
        &mut self,
        seqn: u32,
        mut fin: bool,
        mut pkt: Packet,
        now: u64,
        out: &mut Output,
    ) -> Delivery {
        // Sequence number of the FIN, if the segment carries one.
        let fin_seq = seqn.wrapping_add(pkt.len() as u32);

        // If a segment's contents straddle the boundary between old and new,
        // only the new parts should be processed.
        let mut seq = seqn;
        if wrapping_lt(seqn, self.rcv.nxt) {
            let start = usize::min(self.rcv.nxt.wrapping_sub(seqn) as usize, pkt.len());

            pkt.adj(start);
            seq = seqn.wrapping_add(start as u32);
        }

        let offset = seq.wrapping_sub(self.rcv.nxt) as usize;
        let wnd = self.rcv.wnd as usize;

        // A one byte payload at RCV.NXT passes a closed window.
        if wnd == 0 && !pkt.is_empty() && !self.closed {
            return Delivery::Rejected(pkt, RejectReason::BufferFull);
        }

        // Trim anything beyond the right edge of the window.
        if offset + pkt.len() > wnd {
            let excess = usize::min(offset + pkt.len() - wnd, pkt.len());
            pkt.trim(excess);
            fin = false;
        }

        let mut delivery = Delivery::Consumed;
        let mut fin_ready = false;

        if self.closed {
            // The user closed the connection: in-order data is acknowledged
            // and dropped, anything else is left for the peer to resend.
            if seq == self.rcv.nxt {
                if !pkt.is_empty() {
                    trace!(
                        "[{}] ({:?}) received payload after close: discarding {} bytes",
                        self.sock,
                        self.state,
                        pkt.len()
                    );
                }

                self.rcv.nxt = self.rcv.nxt.wrapping_add(pkt.len() as u32);

                if fin && fin_seq == self.rcv.nxt {
                    self.on_fin(now, out);
                }
            }

            return Delivery::Consumed;
        }

        if !pkt.is_empty() {
            if self.recv_occupancy() >= self.cfg.rbufs {
                debug!(
                    "[{}] ({:?}) receive buffer full: rejecting payload",
                    self.sock, self.state
                );

                return Delivery::Rejected(pkt, RejectReason::BufferFull);
            }

            if seq == self.rcv.nxt {
                // We received the next bytes we were expecting.
                trace!(
                    "[{}] ({:?}) received expected payload: buffering in-order",
                    self.sock, self.state
                );

                self.rcv.nxt = self.rcv.nxt.wrapping_add(pkt.len() as u32);
                self.rbuf.push_back(pkt);
                out.signals |= Signals::RECV;

                // Check if out-of-order segments can now be merged.
                fin_ready = self.merge_out_of_order();
            } else {
                // Received data we were not expecting yet. Data is buffered
                // but RCV.NXT is kept the same.
                let key = seq.wrapping_sub(self.rcv.irs);

                if self.ooo.contains_key(&key) {
                    trace!(
                        "[{}] ({:?}) received duplicate out-of-order payload: ignoring",
                        self.sock, self.state
                    );

                    return Delivery::Consumed;
                }

                debug!(
                    "[{}] ({:?}) received out-of-order payload: buffering out-of-order",
                    self.sock, self.state
                );

                self.ooo.insert(key, (pkt, fin));
                fin = false;
            }

            delivery = Delivery::Queued;
        }

        // A FIN is only processed once everything before it arrived.
        if fin_ready || (fin && fin_seq == self.rcv.nxt) {
            self.on_fin(now, out);
        }

        self.refresh_window();

        delivery
    }

    /// Moves out-of-order packets that became contiguous into the receive
    /// buffer, returning `true` if a merged segment carried a `FIN`.
    fn merge_out_of_order(&mut self) -> bool {
        let mut fin = false;

        while let Some(entry) = self.ooo.first_entry() {
            let nxt = self.rcv.nxt.wrapping_sub(self.rcv.irs);
            let key = *entry.key();

            // Not the next bytes we expect.
            if key > nxt {
                break;
            }

            let (mut pkt, seg_fin) = entry.remove();
            let start = (nxt - key) as usize;

            if start >= pkt.len() {
                // Already covered by in-order data.
                if start == pkt.len() && seg_fin {
                    fin = true;
                }

                continue;
            }

            pkt.adj(start);
            self.rcv.nxt = self.rcv.nxt.wrapping_add(pkt.len() as u32);
            self.rbuf.push_back(pkt);

            if seg_fin {
                fin = true;
            }
        }

        fin
    }

    /// Accounts for an in-order `FIN` from the peer.
    fn on_fin(&mut self, now: u64, out: &mut Output) {
        // Accounting for the received FIN.
        self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
        out.signals |= Signals::RECV;

        match self.state {
            ConnectionState::ESTABLISHED => {
                debug!(
                    "[{}] (ESTABLISHED) received FIN: ESTABLISHED -> CLOSE_WAIT",
                    self.sock
                );

                self.state = ConnectionState::CLOSE_WAIT;
            }
            ConnectionState::FIN_WAIT_1 if self.fin_acked => {
                debug!(
                    "[{}] (FIN_WAIT_1) received FIN for acknowledged FIN: FIN_WAIT_1 -> TIME_WAIT",
                    self.sock
                );

                self.enter_time_wait(now);
            }
            ConnectionState::FIN_WAIT_1 => {
                debug!(
                    "[{}] (FIN_WAIT_1) received FIN: FIN_WAIT_1 -> CLOSING",
                    self.sock
                );

                self.state = ConnectionState::CLOSING;
            }
            ConnectionState::FIN_WAIT_2 => {
                debug!(
                    "[{}] (FIN_WAIT_2) received FIN: FIN_WAIT_2 -> TIME_WAIT",
                    self.sock
                );

                self.enter_time_wait(now);
            }
            _ => {}
        }
    }

    fn enter_time_wait(&mut self, now: u64) {
        self.state = ConnectionState::TIME_WAIT;
        self.time_wait_deadline = Some(now.saturating_add(self.cfg.timewait));
        self.rto_deadline = None;
        self.persist_deadline = None;
        self.retransmit_q.clear();
    }

    /// Drives the connection's timers at tick `now`, in order: `TIME_WAIT`
    /// expiry, orphan release, linger expiry, retransmission, window update,
    /// and release of queued data.
    pub fn on_tick(&mut self, now: u64, out: &mut Output) {
        if self.state == ConnectionState::TIME_WAIT
            && self.time_wait_deadline.is_some_and(|deadline| now >= deadline)
        {
            debug!(
                "[{}] (TIME_WAIT) timer expired: TIME_WAIT -> CLOSED",
                self.sock
            );

            self.reset();
            return;
        }

        // Everything we sent, FIN included, has been acknowledged and nobody
        // is left to read the peer's data.
        if self.closed && self.state == ConnectionState::FIN_WAIT_2 {
            debug!(
                "[{}] (FIN_WAIT_2) orphaned connection fully acknowledged: FIN_WAIT_2 -> CLOSED",
                self.sock
            );

            self.reset();
            return;
        }

        if self.state != ConnectionState::CLOSED
            && self.linger_deadline.is_some_and(|deadline| now >= deadline)
        {
            if self.state.is_synchronized() {
                // <SEQ=SND.NXT><CTL=RST>
                out.segments.push(self.create_rst(self.snd.nxt, None));
            }

            warn!(
                "[{}] ({state:?}) linger period expired, abandoning unsent data: {state:?} -> CLOSED",
                self.sock,
                state = self.state
            );

            self.reset();
            return;
        }

        if self.rto_deadline.is_some_and(|deadline| now >= deadline) {
            if self.retries >= self.cfg.retries {
                warn!(
                    "[{}] ({state:?}) max retransmit limit reached: {state:?} -> CLOSED",
                    self.sock,
                    state = self.state,
                );

                self.reset();
                self.fail(out);
                return;
            }

            // Apply exponential backoff to avoid excessive retransmissions.
            self.retries += 1;
            self.rto = self.rto.saturating_mul(2);
            self.rto_deadline = Some(now.saturating_add(self.rto));

            let flight = self.snd.nxt.wrapping_sub(self.snd.una);
            self.cc.on_retransmit_timeout(flight, self.mss());

            if let Some(front) = self.retransmit_q.front() {
                let mut seg = front.clone();

                if seg.tcp.ack() {
                    seg.tcp.set_ack_number(self.rcv.nxt);
                }
                seg.tcp.set_window(self.rcv.wnd);

                debug!(
                    "[{}] ({:?}) segment retransmission constructed, updated transmit count: {}",
                    self.sock, self.state, self.retries
                );

                out.segments.push(seg);
            }
        }

        if self.persist_deadline.is_some_and(|deadline| now >= deadline) {
            self.persist_shift = u32::min(self.persist_shift + 1, MAX_PERSIST_SHIFT);
            self.persist_deadline = Some(now.saturating_add(self.cfg.rto << self.persist_shift));

            debug!(
                "[{}] ({:?}) peer window still closed: constructed persist ACK",
                self.sock, self.state
            );

            out.segments.push(self.create_persist_ack());
        }

        if mem::take(&mut self.window_update) && self.state.is_synchronized() {
            trace!(
                "[{}] ({:?}) advertising reopened window: constructed ACK",
                self.sock, self.state
            );

            out.segments.push(self.create_ack());
        }

        self.try_send(now, out);
    }

    /// Releases unsent data into the send window, then the `FIN` once all
    /// data went out.
    fn try_send(&mut self, now: u64, out: &mut Output) {
        if !matches!(
            self.state,
            ConnectionState::ESTABLISHED
                | ConnectionState::CLOSE_WAIT
                | ConnectionState::FIN_WAIT_1
                | ConnectionState::CLOSING
                | ConnectionState::LAST_ACK
        ) {
            return;
        }

        let wnd = u32::min(self.snd.wnd as u32, self.cc.window());

        loop {
            let flight = self.snd.nxt.wrapping_sub(self.snd.una);
            let avail = wnd.saturating_sub(flight) as usize;

            let Some(front) = self.unsent.front_mut() else {
                break;
            };

            if avail == 0 {
                trace!(
                    "[{}] ({:?}) send window exhausted: buffering unsent data",
                    self.sock, self.state
                );

                break;
            }

            // Segment the rest of the chunk up to the available window.
            let payload = if front.len() > avail {
                front.split_to(avail)
            } else {
                mem::take(front)
            };

            if front.is_empty() {
                self.unsent.pop_front();
            }

            let len = payload.len() as u32;
            let seg = self.create_data(payload);

            self.snd.nxt = self.snd.nxt.wrapping_add(len);
            self.transmit(seg, now, out);
        }

        if self.fin_queued && !self.fin_sent && self.unsent.is_empty() {
            let fin_ack = self.create_fin_ack();

            debug!(
                "[{}] ({:?}) unsent data flushed: constructed FIN_ACK",
                self.sock, self.state
            );

            // Accounting for the FIN sent.
            self.snd.nxt = self.snd.nxt.wrapping_add(1);
            self.fin_sent = true;
            self.transmit(fin_ack, now, out);
        }

        self.arm_persist(now);
    }

    /// Keeps the persist timer armed while data waits on a zero window with
    /// nothing in flight, since no ACK is then due that could reopen it.
    fn arm_persist(&mut self, now: u64) {
        let stalled =
            self.snd.wnd == 0 && self.retransmit_q.is_empty() && !self.unsent.is_empty();

        if !stalled {
            self.persist_deadline = None;
            self.persist_shift = 0;
        } else if self.persist_deadline.is_none() {
            trace!(
                "[{}] ({:?}) peer closed its window: arming persist timer",
                self.sock, self.state
            );

            self.persist_deadline = Some(now.saturating_add(self.cfg.rto));
        }
    }

    /// Emits a segment that occupies sequence space, queueing it for
    /// retransmission.
    fn transmit(&mut self, seg: TcpSegment, now: u64, out: &mut Output) {
        if self.rto_deadline.is_none() {
            self.rto_deadline = Some(now.saturating_add(self.rto));
        }

        self.retransmit_q.push_back(seg.clone());
        out.segments.push(seg);
    }

    fn header(&self, seq: u32) -> TcpHeader {
        TcpHeader::new(self.sock.src.port(), self.sock.dst.port(), seq, self.rcv.wnd)
    }

    /// Creates a `SYN` segment to initiate a connection request.
    fn create_syn(&self) -> Result<TcpSegment> {
        let mut syn = self.header(self.snd.iss);

        syn.set_syn();
        syn.set_option_mss(self.cfg.local_mss)?;

        Ok(TcpSegment::control(syn))
    }

    /// Creates a `SYN_ACK` segment in response to a peer's connection
    /// request.
    fn create_syn_ack(&self) -> Result<TcpSegment> {
        let mut syn_ack = self.header(self.snd.iss);

        // Acknowledge the peer's SYN.
        syn_ack.set_ack_number(self.rcv.nxt);
        syn_ack.set_syn();
        syn_ack.set_ack();
        syn_ack.set_option_mss(self.cfg.local_mss)?;

        Ok(TcpSegment::control(syn_ack))
    }

    /// Creates an `ACK` segment in response to a peer's segment.
    fn create_ack(&self) -> TcpSegment {
        let mut ack = self.header(self.snd.nxt);

        ack.set_ack_number(self.rcv.nxt);
        ack.set_ack();

        TcpSegment::control(ack)
    }

    /// Creates the persist segment: an `ACK` with an already acknowledged
    /// sequence number, which the peer answers with its current window.
    fn create_persist_ack(&self) -> TcpSegment {
        // <SEQ=SND.NXT-1><ACK=RCV.NXT><CTL=ACK>
        let mut persist = self.header(self.snd.nxt.wrapping_sub(1));

        persist.set_ack_number(self.rcv.nxt);
        persist.set_ack();

        TcpSegment::control(persist)
    }

    /// Creates a `PSH_ACK` segment carrying application data at SND.NXT.
    fn create_data(&self, payload: Bytes) -> TcpSegment {
        let mut ack = self.header(self.snd.nxt);

        ack.set_ack_number(self.rcv.nxt);
        ack.set_ack();
        ack.set_psh();

        TcpSegment::new(ack, payload)
    }

    /// Creates a `FIN_ACK` segment for a graceful connection termination.
    fn create_fin_ack(&self) -> TcpSegment {
        let mut fin_ack = self.header(self.snd.nxt);

        fin_ack.set_ack_number(self.rcv.nxt);
        fin_ack.set_fin();
        fin_ack.set_ack();

        TcpSegment::control(fin_ack)
    }

    /// Creates an `RST` segment to terminate the current connection.
    fn create_rst(&self, seq: u32, ack: Option<u32>) -> TcpSegment {
        let mut rst = TcpHeader::new(self.sock.src.port(), self.sock.dst.port(), seq, 0);

        rst.set_rst();

        if let Some(ack) = ack {
            rst.set_ack_number(ack);
            rst.set_ack();
        }

        TcpSegment::control(rst)
    }
}

/// Creates the `RST` answering a segment for which no connection exists.
///
/// RFC 793 (3.4)
///
/// If the incoming segment has an ACK field, the reset takes its sequence
/// number from the ACK field of the segment, otherwise the reset has
/// sequence number zero and the ACK field is set to the sum of the sequence
/// number and segment length of the incoming segment.
pub fn reset_for(tcph: &TcpHeader, payload_len: usize) -> Option<TcpSegment> {
    // An incoming RST should be ignored.
    if tcph.rst() {
        return None;
    }

    let mut rst = TcpHeader::new(tcph.dst_port(), tcph.src_port(), 0, 0);
    rst.set_rst();

    if tcph.ack() {
        // <SEQ=SEG.ACK><CTL=RST>
        rst.set_seq_number(tcph.ack_number());
    } else {
        // <SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>
        let seg_len = payload_len as u32 + tcph.syn() as u32 + tcph.fin() as u32;

        rst.set_ack_number(tcph.seq_number().wrapping_add(seg_len));
        rst.set_ack();
    }

    Some(TcpSegment::control(rst))
}

/// Logs an incoming TCP segment.
fn log_segment(sock: &Socket, tcph: &TcpHeader, payload_len: usize) {
    trace!(
        "[{}] received tcp segment | seq num: {}, ack num: {}, data offset: {}, ack: {}, psh: {}, rst: {}, syn: {}, fin: {}, window: {}, mss: {:?}, {} bytes of payload",
        sock,
        tcph.seq_number(),
        tcph.ack_number(),
        tcph.data_offset(),
        tcph.ack(),
        tcph.psh(),
        tcph.rst(),
        tcph.syn(),
        tcph.fin(),
        tcph.window(),
        tcph.options().mss(),
        payload_len,
    );
}

#[inline]
fn wrapping_lt(lhs: u32, rhs: u32) -> bool {
    // RFC 1323 (2.3)
    //
    // TCP determines if a data segment is "old" or "new" by testing whether
    // its sequence number is within 2**31 bytes of the left edge of the window,
    // and if it is not, discarding the data as "old". To insure that new data
    // is never mistakenly considered old and vice-versa, the left edge of the
    // sender's window has to be at most 2**31 away from the right edge of the
    // receiver's window.
    lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Returns `true` is the value `x` is in between the values `start` and `end`,
/// using wrapping arithmetic.
#[inline]
fn is_between_wrapped(start: u32, x: u32, end: u32) -> bool {
    wrapping_lt(start, x) && wrapping_lt(x, end)
}
