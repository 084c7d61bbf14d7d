//! Two contexts wired back to back: every frame one side transmits through
//! `tx_bulk` is classified and handed to the other side's `rx_bulk`.

use std::io::IoSliceMut;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use l4_engine::event::Callback;
use l4_engine::packet::{DEFAULT_HEADROOM, ETHER_HDR_LEN, PacketType};
use l4_engine::protocol::headers::{Ipv4Header, Protocol, TcpHeader};
use l4_engine::{
    AcceptParams, ConnectionState, Context, ContextParams, Destination, DeviceId, DeviceParams,
    Error, EventQueue, L4Protocol, Lookup, NotifyParams, Packet, RejectReason, StreamConfig,
    StreamHandle, StreamParams,
};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const MTU: u16 = 1500;

struct Peer {
    ctx: Context,
    dev: DeviceId,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Ethernet header followed by an IPv4 header template.
fn template() -> Vec<u8> {
    let mut header = vec![0x02, 0, 0, 0, 0, 0x02, 0x02, 0, 0, 0, 0, 0x01, 0x08, 0x00];
    let ip = Ipv4Header::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, 0, 64, Protocol::TCP)
        .unwrap();

    header.extend_from_slice(&ip.to_be_bytes());
    header
}

fn peer_with(
    proto: L4Protocol,
    local: Ipv4Addr,
    remote: Ipv4Addr,
    lookups: Arc<AtomicUsize>,
    tweak: impl FnOnce(&mut ContextParams),
) -> Peer {
    let dev = Arc::new(OnceLock::<DeviceId>::new());
    let route = Arc::clone(&dev);

    let lookup: Arc<dyn Lookup<Ipv4Addr>> = Arc::new(move |addr: &Ipv4Addr| {
        lookups.fetch_add(1, Ordering::SeqCst);

        if *addr != remote {
            return None;
        }

        Some(Destination::ether(*route.get()?, MTU, template()))
    });

    let mut params = ContextParams {
        proto,
        lookup4: Some(lookup),
        ..Default::default()
    };
    tweak(&mut params);

    let ctx = Context::new(params).unwrap();
    let id = ctx
        .add_device(DeviceParams {
            local_addr4: Some(local),
            ..Default::default()
        })
        .unwrap();
    dev.set(id).unwrap();

    Peer { ctx, dev: id }
}

fn peer(proto: L4Protocol, local: Ipv4Addr, remote: Ipv4Addr) -> Peer {
    peer_with(proto, local, remote, Arc::default(), |_| {})
}

fn classify(frames: &[Packet]) -> Vec<Packet> {
    frames
        .iter()
        .map(|frame| Packet::classify(BytesMut::from(frame.data()), ETHER_HDR_LEN).unwrap())
        .collect()
}

fn drain(peer: &Peer) -> Vec<Packet> {
    let mut out = Vec::new();
    peer.ctx.tx_bulk(peer.dev, &mut out, usize::MAX);
    out
}

/// Moves every frame queued on `from` to `to`, returning the number of frames
/// moved and the rejected packets.
fn shuttle(from: &Peer, to: &Peer) -> (usize, Vec<(Packet, RejectReason)>) {
    let pkts = classify(&drain(from));
    let n = pkts.len();

    let mut rejected = Vec::new();
    let delivered = to.ctx.rx_bulk(to.dev, pkts, &mut rejected);
    assert_eq!(delivered + rejected.len(), n);

    (n, rejected)
}

/// Shuttles frames both ways until both sides are quiet.
fn exchange(a: &Peer, b: &Peer) {
    for _ in 0..64 {
        let (ab, _) = shuttle(a, b);
        let (ba, _) = shuttle(b, a);

        if ab + ba == 0 {
            return;
        }
    }

    panic!("peers never went quiet");
}

fn tcp_header(frame: &Packet) -> TcpHeader {
    let pkt = Packet::classify(BytesMut::from(frame.data()), ETHER_HDR_LEN).unwrap();
    TcpHeader::try_from(pkt.l4_segment().unwrap()).unwrap()
}

/// Copies an Ethernet + IPv4 frame resized to `len` bytes, with the layer
/// lengths and type bits filled in by hand the way a NIC driver would.
fn hand_classified(frame: &Packet, len: usize, l4_len: u16, l4: PacketType) -> Packet {
    let mut raw = frame.data().to_vec();
    raw.resize(len, 0);

    let mut pkt = Packet::from_frame(BytesMut::from(&raw[..]));
    pkt.l2_len = ETHER_HDR_LEN;
    pkt.l3_len = 20;
    pkt.l4_len = l4_len;
    pkt.packet_type = PacketType::L2_ETHER | PacketType::L3_IPV4 | l4;
    assert!(pkt.adj((ETHER_HDR_LEN + 20 + l4_len) as usize));

    pkt
}

fn counter() -> (Arc<AtomicUsize>, Callback) {
    let count = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&count);
    let callback: Callback = Arc::new(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    (count, callback)
}

/// Opens a listener on the server and connects a client stream to it,
/// returning (client stream, listener, accepted stream).
fn establish(
    client: &Peer,
    server: &Peer,
    accepted_cfg: StreamConfig,
) -> (StreamHandle, StreamHandle, StreamHandle) {
    let listener = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 80))))
        .unwrap();
    server.ctx.listen(listener).unwrap();

    let stream = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))))
        .unwrap();
    client
        .ctx
        .connect(stream, SocketAddr::from((SERVER, 80)))
        .unwrap();
    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::SYN_SENT);

    let (n, rejected) = shuttle(client, server);
    assert_eq!(n, 1);
    assert!(rejected.is_empty());

    let mut syns = Vec::new();
    assert_eq!(server.ctx.synreqs(listener, &mut syns, 8).unwrap(), 1);

    let accepted = server
        .ctx
        .accept(
            listener,
            vec![AcceptParams {
                syn: syns.remove(0),
                cfg: accepted_cfg,
            }],
        )
        .unwrap()
        .remove(0)
        .unwrap();
    assert_eq!(
        server.ctx.tcp_state(accepted).unwrap(),
        ConnectionState::SYN_RECEIVED
    );

    exchange(client, server);

    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::ESTABLISHED);
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::ESTABLISHED);

    (stream, listener, accepted)
}

#[test]
fn tcp_connect_accept_transfer_close() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let events = EventQueue::new(4).unwrap();
    let readable = events.alloc(7).unwrap();
    let (connected, on_send) = counter();

    let client_cfg = StreamConfig {
        send: NotifyParams {
            event: None,
            callback: Some(on_send),
        },
        ..Default::default()
    };

    let listener = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 80))))
        .unwrap();
    server.ctx.listen(listener).unwrap();

    let stream = client
        .ctx
        .open(StreamParams {
            cfg: client_cfg,
            ..StreamParams::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        })
        .unwrap();
    client
        .ctx
        .connect(stream, SocketAddr::from((SERVER, 80)))
        .unwrap();

    // The unspecified local address was replaced by the device's.
    let local = client.ctx.get_params(stream).unwrap().local;
    assert_eq!(local.ip(), CLIENT);
    assert!(local.port() >= l4_engine::EPHEMERAL_PORT_MIN);

    shuttle(&client, &server);

    let mut syns = Vec::new();
    assert_eq!(server.ctx.synreqs(listener, &mut syns, 8).unwrap(), 1);
    assert_eq!(server.ctx.synreqs(listener, &mut syns, 8).unwrap(), 0);

    let accepted = server
        .ctx
        .accept(
            listener,
            vec![AcceptParams {
                syn: syns.remove(0),
                cfg: StreamConfig {
                    recv: NotifyParams {
                        event: Some(readable.clone()),
                        callback: None,
                    },
                    ..Default::default()
                },
            }],
        )
        .unwrap()
        .remove(0)
        .unwrap();

    exchange(&client, &server);

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(client.ctx.mss(stream).unwrap(), MTU - 40);
    assert_eq!(server.ctx.mss(accepted).unwrap(), MTU - 40);

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.ctx.send(stream, &payload).unwrap(), payload.len());

    exchange(&client, &server);

    let mut reported = Vec::new();
    assert_eq!(events.get(&mut reported, 4), 1);
    assert_eq!(reported, vec![7]);

    let mut received = vec![0u8; 8192];
    let n = server
        .ctx
        .readv(accepted, &mut [IoSliceMut::new(&mut received)])
        .unwrap();
    assert_eq!(&received[..n], &payload[..]);

    // Drained: the level-triggered event is no longer raised.
    assert_eq!(events.get(&mut reported, 4), 0);

    client.ctx.close(stream).unwrap();
    exchange(&client, &server);
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSE_WAIT);

    server.ctx.close(accepted).unwrap();
    exchange(&client, &server);

    assert!(matches!(
        client.ctx.tcp_state(stream),
        Err(Error::UseAfterClose)
    ));

    client.ctx.process();
    server.ctx.process();

    assert_eq!(client.ctx.open_streams(), 0);
    // Only the listener is left.
    assert_eq!(server.ctx.open_streams(), 1);
}

#[test]
fn tcp_rx_bulk_accounts_for_every_packet() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let listener = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 80))))
        .unwrap();
    server.ctx.listen(listener).unwrap();

    let to_listener = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    let to_nobody = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    client
        .ctx
        .connect(to_listener, SocketAddr::from((SERVER, 80)))
        .unwrap();
    client
        .ctx
        .connect(to_nobody, SocketAddr::from((SERVER, 81)))
        .unwrap();

    let frames = drain(&client);
    assert_eq!(frames.len(), 2);

    let mut corrupted = frames[0].data().to_vec();
    // Sequence number of the first SYN.
    corrupted[ETHER_HDR_LEN as usize + 20 + 4] ^= 0xFF;

    let unanswered_seq = tcp_header(&frames[1]).seq_number();
    let mut pkts = classify(&frames);
    pkts.insert(
        1,
        Packet::classify(BytesMut::from(&corrupted[..]), ETHER_HDR_LEN).unwrap(),
    );

    let mut rejected = Vec::new();
    let delivered = server.ctx.rx_bulk(server.dev, pkts, &mut rejected);

    assert_eq!(delivered, 1);
    let reasons: Vec<_> = rejected.iter().map(|(_, reason)| *reason).collect();
    assert_eq!(
        reasons,
        vec![RejectReason::NoMatchingStream, RejectReason::NoMatchingStream]
    );

    // The SYN to the closed port is answered with a reset.
    let replies = drain(&server);
    assert_eq!(replies.len(), 1);

    let rst = tcp_header(&replies[0]);
    assert!(rst.rst());
    assert!(rst.ack());
    assert_eq!(rst.ack_number(), unanswered_seq.wrapping_add(1));

    // The reset refuses the connection.
    let (_, rejected) = shuttle(&server, &client);
    assert!(rejected.is_empty());
    assert_eq!(client.ctx.tcp_state(to_nobody).unwrap(), ConnectionState::CLOSED);
}

#[test]
fn tcp_retransmission_backoff_then_single_error() {
    init_tracing();

    let client = peer_with(L4Protocol::Tcp, CLIENT, SERVER, Arc::default(), |params| {
        params.rto_cycles = 2;
    });

    let (failures, on_error) = counter();
    let stream = client
        .ctx
        .open(StreamParams {
            cfg: StreamConfig {
                nb_retries: 3,
                error: NotifyParams {
                    event: None,
                    callback: Some(on_error),
                },
                ..Default::default()
            },
            ..StreamParams::bind(SocketAddr::from((CLIENT, 0)))
        })
        .unwrap();
    client
        .ctx
        .connect(stream, SocketAddr::from((SERVER, 80)))
        .unwrap();
    assert_eq!(drain(&client).len(), 1);

    let mut retransmitted_at = Vec::new();
    for tick in 1..=64u64 {
        assert_eq!(client.ctx.process(), 1);

        for frame in drain(&client) {
            assert!(tcp_header(&frame).syn());
            retransmitted_at.push(tick);
        }
    }

    assert_eq!(retransmitted_at, vec![2, 6, 14]);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::CLOSED);

    // A failed stream stays allocated until the user closes it.
    assert_eq!(client.ctx.open_streams(), 1);
    client.ctx.close(stream).unwrap();
    assert_eq!(client.ctx.open_streams(), 0);
}

#[test]
fn tcp_linger_expiry_resets_and_releases() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let (stream, _, accepted) = establish(&client, &server, StreamConfig::default());

    client
        .ctx
        .update_config(
            stream,
            StreamConfig {
                linger_cycles: Some(5),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        client.ctx.get_params(stream).unwrap().cfg.linger_cycles,
        Some(5)
    );

    // Data and FIN are lost on the way.
    client.ctx.send(stream, b"never delivered").unwrap();
    client.ctx.close(stream).unwrap();
    drain(&client);

    for _ in 0..4 {
        client.ctx.process();
        assert_eq!(client.ctx.open_streams(), 1);
    }

    client.ctx.process();
    assert_eq!(client.ctx.open_streams(), 0);

    let frames = drain(&client);
    assert_eq!(frames.len(), 1);
    assert!(tcp_header(&frames[0]).rst());

    shuttle(&client, &server);
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSED);
}

#[test]
fn tcp_abort_discards_and_resets_peer() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let (reset, on_error) = counter();
    let (stream, _, accepted) = establish(
        &client,
        &server,
        StreamConfig {
            error: NotifyParams {
                event: None,
                callback: Some(on_error),
            },
            ..Default::default()
        },
    );

    client.ctx.send(stream, b"in flight").unwrap();
    client.ctx.abort(stream).unwrap();

    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::CLOSED);
    assert!(matches!(
        client.ctx.send(stream, b"more"),
        Err(Error::NotConnected)
    ));

    let mut out = Vec::new();
    assert_eq!(client.ctx.recv(stream, &mut out, 8).unwrap(), 0);

    // Data queued before the abort still leaves, followed by the reset.
    let frames = drain(&client);
    assert_eq!(frames.len(), 2);
    assert!(tcp_header(&frames[1]).rst());

    let mut rejected = Vec::new();
    server.ctx.rx_bulk(server.dev, classify(&frames), &mut rejected);

    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSED);
    assert_eq!(reset.load(Ordering::SeqCst), 1);

    // The handle stays usable until closed.
    client.ctx.close(stream).unwrap();
    assert!(matches!(
        client.ctx.abort(stream),
        Err(Error::UseAfterClose)
    ));
}

#[test]
fn stream_pool_limits_and_handles() {
    init_tracing();

    let ctx = Context::new(ContextParams {
        max_streams: 2,
        ..Default::default()
    })
    .unwrap();
    ctx.add_device(DeviceParams {
        local_addr4: Some(CLIENT),
        blocked_ports4: vec![7],
        ..Default::default()
    })
    .unwrap();

    let any = SocketAddr::from((CLIENT, 0));
    let first = ctx.open(StreamParams::bind(any)).unwrap();
    let second = ctx.open(StreamParams::bind(SocketAddr::from((CLIENT, 7000)))).unwrap();

    assert!(matches!(
        ctx.open(StreamParams::bind(any)),
        Err(Error::StreamLimitReached { max: 2 })
    ));

    // Devices are fixed while streams are open.
    assert!(matches!(
        ctx.add_device(DeviceParams {
            local_addr4: Some(SERVER),
            ..Default::default()
        }),
        Err(Error::InvalidConfig(_))
    ));

    ctx.close(first).unwrap();
    assert!(matches!(ctx.get_params(first), Err(Error::UseAfterClose)));
    assert!(matches!(ctx.close(first), Err(Error::UseAfterClose)));

    // The slot is reused under a new handle.
    let third = ctx.open(StreamParams::bind(any)).unwrap();
    assert_eq!(third.index(), first.index());
    assert_ne!(third, first);
    assert!(matches!(ctx.get_params(first), Err(Error::UseAfterClose)));

    ctx.close(third).unwrap();

    assert!(matches!(
        ctx.open(StreamParams::bind(SocketAddr::from((CLIENT, 7000)))),
        Err(Error::AddrInUse(_))
    ));
    assert!(matches!(
        ctx.open(StreamParams::bind(SocketAddr::from((CLIENT, 7)))),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        ctx.open(StreamParams::bind(SocketAddr::from((SERVER, 0)))),
        Err(Error::InvalidConfig(_))
    ));

    // Failed opens leave nothing behind.
    assert_eq!(ctx.open_streams(), 1);

    ctx.close(second).unwrap();
    assert_eq!(ctx.open_streams(), 0);
}

#[test]
fn notification_requires_event_or_callback() {
    let ctx = Context::new(ContextParams::default()).unwrap();
    ctx.add_device(DeviceParams {
        local_addr4: Some(CLIENT),
        ..Default::default()
    })
    .unwrap();

    let events = EventQueue::new(16).unwrap();
    let (_, callback) = counter();

    let notify = |event: bool, cb: bool| NotifyParams {
        event: event.then(|| events.alloc(1).unwrap()),
        callback: cb.then(|| Arc::clone(&callback)),
    };

    for direction in 0..3 {
        for (event, cb) in [(false, false), (true, false), (false, true), (true, true)] {
            let mut cfg = StreamConfig::default();
            match direction {
                0 => cfg.recv = notify(event, cb),
                1 => cfg.send = notify(event, cb),
                _ => cfg.error = notify(event, cb),
            }

            let opened = ctx.open(StreamParams {
                cfg,
                ..StreamParams::bind(SocketAddr::from((CLIENT, 0)))
            });

            if event && cb {
                assert!(matches!(opened, Err(Error::InvalidConfig(_))));
                assert_eq!(ctx.open_streams(), 0);
            } else {
                ctx.close(opened.unwrap()).unwrap();
            }
        }
    }

    assert_eq!(ctx.open_streams(), 0);
}

#[test]
fn udp_datagrams_backpressure_and_drain_on_close() {
    init_tracing();

    let lookups = Arc::new(AtomicUsize::new(0));
    let client = peer_with(L4Protocol::Udp, CLIENT, SERVER, Arc::clone(&lookups), |params| {
        params.max_stream_sbufs = 1;
    });
    let server = peer(L4Protocol::Udp, SERVER, CLIENT);

    let (writable, on_send) = counter();
    let sender = client
        .ctx
        .open(StreamParams {
            local: SocketAddr::from((CLIENT, 5000)),
            remote: SocketAddr::from((SERVER, 6000)),
            cfg: StreamConfig {
                send: NotifyParams {
                    event: None,
                    callback: Some(on_send),
                },
                ..Default::default()
            },
        })
        .unwrap();

    let (readable, on_recv) = counter();
    let receiver = server
        .ctx
        .open(StreamParams {
            cfg: StreamConfig {
                recv: NotifyParams {
                    event: None,
                    callback: Some(on_recv),
                },
                ..Default::default()
            },
            ..StreamParams::bind(SocketAddr::from((SERVER, 6000)))
        })
        .unwrap();

    let mut pkts = vec![
        Packet::with_headroom(DEFAULT_HEADROOM, b"ping"),
        Packet::with_headroom(DEFAULT_HEADROOM, b"pong"),
    ];

    // One send buffer slot: the second datagram waits.
    assert_eq!(client.ctx.send_to(sender, &mut pkts, None).unwrap(), 1);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].data(), b"pong");

    let mut frames = drain(&client);
    assert_eq!(writable.load(Ordering::SeqCst), 1);

    assert_eq!(client.ctx.send_to(sender, &mut pkts, None).unwrap(), 1);
    assert!(pkts.is_empty());
    frames.extend(drain(&client));

    // The destination was resolved once for both datagrams.
    assert_eq!(lookups.load(Ordering::SeqCst), 1);

    let mut rejected = Vec::new();
    assert_eq!(server.ctx.rx_bulk(server.dev, classify(&frames), &mut rejected), 2);
    assert_eq!(readable.load(Ordering::SeqCst), 1);

    let mut received = Vec::new();
    assert_eq!(server.ctx.recv(receiver, &mut received, 8).unwrap(), 2);
    assert_eq!(received[0].data(), b"ping");
    assert_eq!(received[1].data(), b"pong");

    // Source addresses are filtered against a specified remote.
    let reply = server
        .ctx
        .open(StreamParams {
            local: SocketAddr::from((SERVER, 6001)),
            remote: SocketAddr::from((CLIENT, 5000)),
            cfg: StreamConfig::default(),
        })
        .unwrap();
    server
        .ctx
        .send_to(
            reply,
            &mut vec![Packet::with_headroom(DEFAULT_HEADROOM, b"stray")],
            Some(SocketAddr::from((CLIENT, 5001))),
        )
        .unwrap();
    let (_, rejected) = shuttle(&server, &client);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, RejectReason::NoMatchingStream);

    client.ctx.invalidate_destination_cache();
    let mut pkts = vec![Packet::with_headroom(DEFAULT_HEADROOM, b"last")];
    assert_eq!(client.ctx.send_to(sender, &mut pkts, None).unwrap(), 1);
    assert_eq!(lookups.load(Ordering::SeqCst), 2);

    // Closed with a datagram still queued: released once it leaves.
    client.ctx.close(sender).unwrap();
    assert_eq!(client.ctx.open_streams(), 1);
    assert_eq!(drain(&client).len(), 1);
    assert_eq!(client.ctx.open_streams(), 0);

    // TCP operations are refused on UDP streams.
    assert!(matches!(
        server.ctx.tcp_state(receiver),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn rx_bulk_ignores_link_layer_padding() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let listener = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 80))))
        .unwrap();
    server.ctx.listen(listener).unwrap();

    let stream = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    client
        .ctx
        .connect(stream, SocketAddr::from((SERVER, 80)))
        .unwrap();
    shuttle(&client, &server);

    let mut syns = Vec::new();
    server.ctx.synreqs(listener, &mut syns, 8).unwrap();
    let accepted = server
        .ctx
        .accept(
            listener,
            vec![AcceptParams {
                syn: syns.remove(0),
                cfg: StreamConfig::default(),
            }],
        )
        .unwrap()
        .remove(0)
        .unwrap();

    shuttle(&server, &client);
    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::ESTABLISHED);

    // The final ACK of the handshake, padded to the Ethernet minimum.
    let frames = drain(&client);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data().len(), 54);

    let mut rejected = Vec::new();
    let ack = hand_classified(&frames[0], 60, 20, PacketType::L4_TCP);
    assert_eq!(server.ctx.rx_bulk(server.dev, vec![ack], &mut rejected), 1);
    assert!(rejected.is_empty());
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::ESTABLISHED);

    // UDP: padding is cut from the payload, a frame shorter than its IP
    // length is refused.
    let client = peer(L4Protocol::Udp, CLIENT, SERVER);
    let server = peer(L4Protocol::Udp, SERVER, CLIENT);

    let sender = client
        .ctx
        .open(StreamParams {
            local: SocketAddr::from((CLIENT, 5000)),
            remote: SocketAddr::from((SERVER, 6000)),
            cfg: StreamConfig::default(),
        })
        .unwrap();
    let receiver = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 6000))))
        .unwrap();

    let mut pkts = vec![Packet::with_headroom(DEFAULT_HEADROOM, b"hi")];
    client.ctx.send_to(sender, &mut pkts, None).unwrap();

    let frames = drain(&client);
    assert_eq!(frames[0].data().len(), 44);

    let pkts = vec![
        hand_classified(&frames[0], 60, 8, PacketType::L4_UDP),
        hand_classified(&frames[0], 43, 8, PacketType::L4_UDP),
    ];

    let mut rejected = Vec::new();
    assert_eq!(server.ctx.rx_bulk(server.dev, pkts, &mut rejected), 1);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, RejectReason::NoMatchingStream);

    let mut received = Vec::new();
    assert_eq!(server.ctx.recv(receiver, &mut received, 8).unwrap(), 1);
    assert_eq!(received[0].data(), b"hi");
}

#[test]
fn rx_bulk_reports_full_buffers() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer_with(L4Protocol::Tcp, SERVER, CLIENT, Arc::default(), |params| {
        params.max_stream_rbufs = 1;
    });

    let listener = server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 80))))
        .unwrap();
    server.ctx.listen(listener).unwrap();

    // A SYN queue of one request.
    for _ in 0..2 {
        let stream = client
            .ctx
            .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
            .unwrap();
        client
            .ctx
            .connect(stream, SocketAddr::from((SERVER, 80)))
            .unwrap();
    }

    let (n, rejected) = shuttle(&client, &server);
    assert_eq!(n, 2);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, RejectReason::BufferFull);

    let mut syns = Vec::new();
    assert_eq!(server.ctx.synreqs(listener, &mut syns, 8).unwrap(), 1);
    server.ctx.close(listener).unwrap();

    // A receive buffer of one segment.
    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let (stream, _, accepted) = establish(&client, &server, StreamConfig::default());

    client.ctx.send(stream, b"first").unwrap();
    client.ctx.send(stream, b"second").unwrap();

    let (n, rejected) = shuttle(&client, &server);
    assert_eq!(n, 2);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, RejectReason::BufferFull);
    assert_eq!(rejected[0].0.data(), b"second");

    let mut received = Vec::new();
    assert_eq!(server.ctx.recv(accepted, &mut received, 8).unwrap(), 1);
    assert_eq!(received[0].data(), b"first");

    // A UDP receive buffer of one datagram.
    let client = peer(L4Protocol::Udp, CLIENT, SERVER);
    let server = peer_with(L4Protocol::Udp, SERVER, CLIENT, Arc::default(), |params| {
        params.max_stream_rbufs = 1;
    });

    let sender = client
        .ctx
        .open(StreamParams {
            local: SocketAddr::from((CLIENT, 5000)),
            remote: SocketAddr::from((SERVER, 6000)),
            cfg: StreamConfig::default(),
        })
        .unwrap();
    server
        .ctx
        .open(StreamParams::bind(SocketAddr::from((SERVER, 6000))))
        .unwrap();

    let mut pkts = vec![
        Packet::with_headroom(DEFAULT_HEADROOM, b"kept"),
        Packet::with_headroom(DEFAULT_HEADROOM, b"dropped"),
    ];
    assert_eq!(client.ctx.send_to(sender, &mut pkts, None).unwrap(), 2);

    let (n, rejected) = shuttle(&client, &server);
    assert_eq!(n, 2);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1, RejectReason::BufferFull);
}

#[test]
fn tcp_zero_window_recovers_from_lost_window_update() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer_with(L4Protocol::Tcp, SERVER, CLIENT, Arc::default(), |params| {
        params.max_stream_rbufs = 1;
    });

    let (stream, _, accepted) = establish(&client, &server, StreamConfig::default());

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(client.ctx.send(stream, &payload).unwrap(), payload.len());

    // One segment fills the server's buffer and closes its window.
    exchange(&client, &server);

    let mut received = Vec::new();
    let mut buf = vec![0u8; 4096];
    let n = server
        .ctx
        .readv(accepted, &mut [IoSliceMut::new(&mut buf)])
        .unwrap();
    received.extend_from_slice(&buf[..n]);
    assert_eq!(n, (MTU - 40) as usize);

    // The window update is lost.
    server.ctx.process();
    assert_eq!(drain(&server).len(), 1);

    for _ in 0..200 {
        if received.len() == payload.len() {
            break;
        }

        client.ctx.process();
        server.ctx.process();
        exchange(&client, &server);

        let n = server
            .ctx
            .readv(accepted, &mut [IoSliceMut::new(&mut buf)])
            .unwrap();
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received, payload);
    assert_eq!(client.ctx.tcp_state(stream).unwrap(), ConnectionState::ESTABLISHED);
}

#[test]
fn tcp_abort_from_any_state() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    // OPEN: nothing to reset.
    let idle = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    client.ctx.abort(idle).unwrap();
    assert_eq!(client.ctx.tcp_state(idle).unwrap(), ConnectionState::CLOSED);
    assert!(drain(&client).is_empty());
    client.ctx.close(idle).unwrap();

    // CLOSE_WAIT with unread data: the data is discarded and the peer reset.
    let (stream, listener, accepted) = establish(&client, &server, StreamConfig::default());

    client.ctx.send(stream, b"unread").unwrap();
    client.ctx.close(stream).unwrap();
    exchange(&client, &server);
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSE_WAIT);

    server.ctx.abort(accepted).unwrap();
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSED);

    let mut out = Vec::new();
    assert_eq!(server.ctx.recv(accepted, &mut out, 8).unwrap(), 0);
    assert!(matches!(
        server.ctx.send(accepted, b"reply"),
        Err(Error::NotConnected)
    ));

    let frames = drain(&server);
    assert_eq!(frames.len(), 1);
    assert!(tcp_header(&frames[0]).rst());
    server.ctx.close(accepted).unwrap();

    // LISTEN with a pending request: the SYN queue is dropped.
    let pending = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    client
        .ctx
        .connect(pending, SocketAddr::from((SERVER, 80)))
        .unwrap();
    shuttle(&client, &server);

    server.ctx.abort(listener).unwrap();
    assert_eq!(server.ctx.tcp_state(listener).unwrap(), ConnectionState::CLOSED);

    let mut syns = Vec::new();
    assert!(matches!(
        server.ctx.synreqs(listener, &mut syns, 8),
        Err(Error::InvalidState(ConnectionState::CLOSED))
    ));
    assert!(drain(&server).is_empty());
}

#[test]
fn tcp_data_after_close_acknowledged_and_dropped() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let (stream, _, accepted) = establish(&client, &server, StreamConfig::default());

    client.ctx.close(stream).unwrap();
    exchange(&client, &server);
    assert_eq!(server.ctx.tcp_state(accepted).unwrap(), ConnectionState::CLOSE_WAIT);

    server.ctx.send(accepted, b"nobody reads this").unwrap();

    // Counted as delivered and acknowledged, so the server stops resending.
    let (n, rejected) = shuttle(&server, &client);
    assert_eq!(n, 1);
    assert!(rejected.is_empty());

    let acks = drain(&client);
    assert_eq!(acks.len(), 1);
    let ack = tcp_header(&acks[0]);
    assert!(ack.ack());
    assert!(!ack.rst());

    let mut rejected = Vec::new();
    server.ctx.rx_bulk(server.dev, classify(&acks), &mut rejected);
    assert!(rejected.is_empty());

    // Nothing is left to retransmit.
    for _ in 0..64 {
        server.ctx.process();
    }
    assert!(drain(&server).is_empty());
}

#[test]
fn tcp_reset_backlog_bounded_per_device() {
    init_tracing();

    let client = peer(L4Protocol::Tcp, CLIENT, SERVER);
    let server = peer(L4Protocol::Tcp, SERVER, CLIENT);

    let stream = client
        .ctx
        .open(StreamParams::bind(SocketAddr::from((CLIENT, 0))))
        .unwrap();
    client
        .ctx
        .connect(stream, SocketAddr::from((SERVER, 81)))
        .unwrap();

    let syn = classify(&drain(&client)).remove(0);

    // A burst of SYNs to a closed port.
    let mut rejected = Vec::new();
    let flood = vec![syn; 100];
    assert_eq!(server.ctx.rx_bulk(server.dev, flood.clone(), &mut rejected), 0);
    assert_eq!(rejected.len(), 100);
    assert!(rejected.iter().all(|(_, reason)| *reason == RejectReason::NoMatchingStream));

    let replies = drain(&server);
    assert_eq!(replies.len(), 64);
    assert!(replies.iter().all(|frame| tcp_header(frame).rst()));

    // Draining makes room again.
    server.ctx.rx_bulk(server.dev, flood, &mut Vec::new());
    assert_eq!(drain(&server).len(), 64);
}
