//! Devices attached to a context.

use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use super::StreamHandle;
use crate::config::DeviceParams;
use crate::packet::Packet;

/// Identifier of a device within its [Context].
///
/// [Context]: crate::Context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    index: u32,
    incarnation: u32,
}

impl DeviceId {
    pub(crate) fn new(index: u32, incarnation: u32) -> Self {
        Self { index, incarnation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}.{}", self.index, self.incarnation)
    }
}

/// Resets answering segments that no stream accepts, queued per device at
/// most.
pub(crate) const MAX_QUEUED_REPLIES: usize = 64;

/// What a queued packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxOrigin {
    /// Segment of a TCP connection.
    Connection,
    /// Datagram occupying a send buffer slot of the stream.
    Datagram(StreamHandle),
    /// Control segment answering a packet no stream accepted.
    Reply,
}

/// Framed packet waiting for `tx_bulk`.
#[derive(Debug)]
pub(crate) struct TxEntry {
    pub(crate) pkt: Packet,
    pub(crate) origin: TxOrigin,
}

#[derive(Debug, Default)]
struct TxQueue {
    entries: VecDeque<TxEntry>,
    /// Entries whose origin is [TxOrigin::Reply].
    replies: usize,
}

/// Attachment point for packet I/O.
#[derive(Debug)]
pub(crate) struct Device {
    pub(crate) id: DeviceId,
    pub(crate) params: DeviceParams,
    /// Packets ready for transmission, in enqueue order.
    tx_queue: Mutex<TxQueue>,
    /// Identification field of the next IPv4 packet.
    ip_id: AtomicU16,
}

impl Device {
    pub(crate) fn new(id: DeviceId, params: DeviceParams) -> Self {
        Self {
            id,
            params,
            tx_queue: Mutex::new(TxQueue::default()),
            ip_id: AtomicU16::new(0),
        }
    }

    /// Returns `true` if `addr` is the device's local address of its family.
    pub(crate) fn owns(&self, addr: &IpAddr) -> bool {
        self.params.local_addr(addr.is_ipv4()).as_ref() == Some(addr)
    }

    pub(crate) fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends an entry to the TX queue. Returns `false` and drops the
    /// entry when it is a reply and the reply backlog is full.
    pub(crate) fn enqueue(&self, entry: TxEntry) -> bool {
        let mut queue = self.tx_queue.lock();

        if entry.origin == TxOrigin::Reply {
            if queue.replies >= MAX_QUEUED_REPLIES {
                return false;
            }

            queue.replies += 1;
        }

        queue.entries.push_back(entry);

        true
    }

    /// Removes up to `max` entries from the head of the TX queue.
    pub(crate) fn dequeue(&self, max: usize) -> Vec<TxEntry> {
        let mut queue = self.tx_queue.lock();
        let n = usize::min(max, queue.entries.len());

        let entries: Vec<_> = queue.entries.drain(..n).collect();
        let replies = entries.iter().filter(|entry| entry.origin == TxOrigin::Reply).count();
        queue.replies -= replies;

        entries
    }

    pub(crate) fn pending(&self) -> usize {
        self.tx_queue.lock().entries.len()
    }
}
