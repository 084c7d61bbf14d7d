//! Transport contexts.
//!
//! A [Context] owns a fixed pool of streams, the devices packets flow
//! through, and the tables that demultiplex inbound packets to streams. It
//! is driven from outside: the user calls [Context::rx_bulk] with received
//! packets, [Context::tx_bulk] to collect packets to transmit, and
//! [Context::process] once per tick for timers.
//!
//! Locks are taken in one order: a stream slot, then the device table, then
//! the demux table, then a device's TX queue. The demux table is never held
//! while a stream slot is acquired, and user callbacks run with no lock
//! held.

mod bulk;
mod demux;
mod device;
mod stream;

pub use demux::{EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};
pub use device::DeviceId;

use std::fmt;
use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use siphasher::sip::SipHasher13;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::config::{ContextParams, DeviceParams, L4Protocol};
use crate::dest::{encapsulate, Destination, L4Header};
use crate::packet::Packet;
use crate::protocol::Socket;
use crate::protocol::congestion::{CongestionControl, SlowStart};
use crate::protocol::fsm::TcbConfig;
use crate::{Error, Result};

use demux::Demux;
use device::{Device, TxEntry, TxOrigin};
use stream::Stream;

/// Sequence number increment per tick, added to the hashed ISN (RFC 6528).
const ISN_TICK_INCREMENT: u32 = 64_000;

/// Handle of a stream within its [Context].
///
/// A handle stays bound to the stream it was issued for: once that stream is
/// closed, operations on the handle fail with [Error::UseAfterClose] even if
/// the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    index: u32,
    incarnation: u32,
}

impl StreamHandle {
    pub(crate) fn new(index: u32, incarnation: u32) -> Self {
        Self { index, incarnation }
    }

    /// Returns the position of the stream in the context's pool.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}.{}", self.index, self.incarnation)
    }
}

/// A pool entry. The incarnation advances every time the slot is handed
/// out.
#[derive(Debug, Default)]
struct Slot {
    incarnation: u32,
    stream: Option<Stream>,
}

impl Slot {
    /// Returns the stream `handle` refers to, including streams the user
    /// already closed.
    fn get(&mut self, handle: StreamHandle) -> Option<&mut Stream> {
        if self.incarnation != handle.incarnation {
            return None;
        }

        self.stream.as_mut()
    }

    /// Returns the stream `handle` refers to if the user may still operate
    /// on it.
    fn live(&mut self, handle: StreamHandle) -> Result<&mut Stream> {
        match self.get(handle) {
            Some(stream) if !stream.user_closed => Ok(stream),
            _ => Err(Error::UseAfterClose),
        }
    }
}

/// A user-space transport engine instance for one L4 protocol.
pub struct Context {
    params: ContextParams,
    slots: Box<[Mutex<Slot>]>,
    /// Indices of unallocated slots.
    free: Mutex<Vec<u32>>,
    devices: RwLock<Slab<Arc<Device>>>,
    demux: RwLock<Demux>,
    /// Ticks elapsed, advanced by `process`.
    ticks: AtomicU64,
    /// Bumped to invalidate every stream's cached destination.
    dst_generation: AtomicU64,
    device_incarnation: AtomicU32,
    /// Serializes the bulk entry points.
    bulk: Mutex<()>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("params", &self.params)
            .field("open_streams", &self.open_streams())
            .field("devices", &self.devices.read().len())
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context, allocating every stream slot upfront.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for inconsistent parameters and
    /// [Error::OutOfResources] if the stream pool cannot be allocated.
    pub fn new(params: ContextParams) -> Result<Self> {
        params.validate()?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(params.max_streams)
            .map_err(|_| Error::OutOfResources("stream pool"))?;
        slots.extend((0..params.max_streams).map(|_| Mutex::new(Slot::default())));

        let mut free = Vec::new();
        free.try_reserve_exact(params.max_streams)
            .map_err(|_| Error::OutOfResources("stream pool"))?;
        // Popped from the back, so the lowest index is handed out first.
        free.extend((0..params.max_streams as u32).rev());

        info!(
            "created {:?} context: {} streams, {} devices",
            params.proto, params.max_streams, params.max_devices
        );

        Ok(Self {
            devices: RwLock::new(Slab::with_capacity(params.max_devices)),
            params,
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
            demux: RwLock::new(Demux::default()),
            ticks: AtomicU64::new(0),
            dst_generation: AtomicU64::new(0),
            device_incarnation: AtomicU32::new(0),
            bulk: Mutex::new(()),
        })
    }

    /// Destroys the context, dropping every stream, device, and queued
    /// packet.
    pub fn destroy(self) {
        let open = self.open_streams();
        let devices = self.devices.read();
        let queued: usize = devices.iter().map(|(_, dev)| dev.pending()).sum();

        if open > 0 || queued > 0 {
            warn!(
                "destroying context with {} open streams and {} queued packets",
                open, queued
            );
        }

        info!("destroyed {:?} context", self.params.proto);
    }

    /// Returns the context parameters.
    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Returns the number of allocated streams, including closed streams
    /// still finishing their connection.
    pub fn open_streams(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    /// Attaches a device.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for inconsistent parameters or while
    /// any stream is open, and [Error::DeviceLimitReached] when the device
    /// pool is full.
    pub fn add_device(&self, params: DeviceParams) -> Result<DeviceId> {
        params.validate()?;

        if self.open_streams() > 0 {
            return Err(Error::InvalidConfig(
                "devices cannot be added while streams are open",
            ));
        }

        let mut devices = self.devices.write();

        if devices.len() >= self.params.max_devices {
            return Err(Error::DeviceLimitReached {
                max: self.params.max_devices,
            });
        }

        let entry = devices.vacant_entry();
        let incarnation = self.device_incarnation.fetch_add(1, Ordering::Relaxed) + 1;
        let id = DeviceId::new(entry.key() as u32, incarnation);

        entry.insert(Arc::new(Device::new(id, params)));

        info!("[{}] attached device", id);

        Ok(id)
    }

    /// Detaches a device, dropping the packets still queued on it.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidConfig] for a stale identifier or while any
    /// stream is open.
    pub fn remove_device(&self, id: DeviceId) -> Result<()> {
        if self.open_streams() > 0 {
            return Err(Error::InvalidConfig(
                "devices cannot be removed while streams are open",
            ));
        }

        let mut devices = self.devices.write();

        if devices.get(id.index()).is_none_or(|dev| dev.id != id) {
            return Err(Error::InvalidConfig("unknown device"));
        }

        let dev = devices.remove(id.index());
        let dropped = dev.pending();

        if dropped > 0 {
            warn!("[{}] detached device with {} queued packets", id, dropped);
        } else {
            info!("[{}] detached device", id);
        }

        Ok(())
    }

    /// Forces every stream to resolve its destination again on its next
    /// transmission.
    pub fn invalidate_destination_cache(&self) {
        self.dst_generation.fetch_add(1, Ordering::Relaxed);

        debug!("invalidated destination caches");
    }

    pub(crate) fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices
            .read()
            .get(id.index())
            .filter(|dev| dev.id == id)
            .cloned()
    }

    pub(crate) fn now(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub(crate) fn dst_generation(&self) -> u64 {
        self.dst_generation.load(Ordering::Relaxed)
    }

    fn is_tcp(&self) -> bool {
        self.params.proto == L4Protocol::Tcp
    }

    /// Locks the slot `handle` refers to.
    fn slot(&self, handle: StreamHandle) -> Result<MutexGuard<'_, Slot>> {
        self.slots
            .get(handle.index())
            .map(|slot| slot.lock())
            .ok_or(Error::InvalidConfig("stream handle out of range"))
    }

    /// Takes a free slot, returning the handle of its next incarnation.
    fn alloc_slot(&self) -> Option<StreamHandle> {
        let index = self.free.lock().pop()?;
        let mut slot = self.slots[index as usize].lock();

        slot.incarnation = slot.incarnation.wrapping_add(1);

        Some(StreamHandle::new(index, slot.incarnation))
    }

    /// Returns a slot whose stream was taken (or never installed) to the
    /// pool.
    fn free_slot(&self, handle: StreamHandle) {
        self.free.lock().push(handle.index);
    }

    /// Removes a stream taken out of its slot from the demux tables and
    /// returns the slot to the pool.
    fn release(&self, stream: Stream) {
        let handle = stream.handle;

        {
            let mut demux = self.demux.write();

            if stream.port_reserved {
                demux.unreserve(stream.local, handle);
            }
            if let Some(sock) = stream.conn {
                demux.remove_conn(&sock, handle);
            }
        }

        self.free_slot(handle);

        debug!("[{}] released stream {} -> {}", handle, stream.local, stream.remote);
    }

    /// Resolves `remote` through the lookup of its family.
    fn resolve(&self, remote: IpAddr) -> Result<Destination> {
        let dst = match remote {
            IpAddr::V4(addr) => self.params.lookup4.as_ref().and_then(|l| l.lookup(&addr)),
            IpAddr::V6(addr) => self.params.lookup6.as_ref().and_then(|l| l.lookup(&addr)),
        }
        .ok_or(Error::NoRoute(remote))?;

        dst.validate(remote.is_ipv4())?;

        Ok(dst)
    }

    /// Frames `pkt` through `dst` and appends it to the device's TX queue.
    fn queue_tx(
        &self,
        dst: &Destination,
        pkt: Packet,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        l4: L4Header,
        origin: TxOrigin,
    ) -> Result<()> {
        let dev = self.device(dst.device).ok_or(Error::NoRoute(dst_ip))?;
        let framed = encapsulate(dst, pkt, src_ip, dst_ip, l4, dev.params.tx_offload, dev.next_ip_id())?;

        if !dev.enqueue(TxEntry { pkt: framed, origin }) {
            return Err(Error::OutOfResources("device reply backlog full"));
        }

        Ok(())
    }

    /// Returns the local address of `dev_id` for the family of `remote`.
    fn device_addr(&self, dev_id: DeviceId, remote: IpAddr) -> Result<IpAddr> {
        self.device(dev_id)
            .and_then(|dev| dev.params.local_addr(remote.is_ipv4()))
            .ok_or(Error::NoRoute(remote))
    }

    /// Initial sequence number for `sock` (RFC 6528).
    ///
    /// ```text
    ///     ISN = M + F(localip, localport, remoteip, remoteport, secretkey)
    /// ```
    fn isn(&self, sock: &Socket) -> u32 {
        let mut hasher = SipHasher13::new_with_key(&self.params.secret_key);

        for addr in [sock.src, sock.dst] {
            match addr.ip() {
                IpAddr::V4(ip) => hasher.write(&ip.octets()),
                IpAddr::V6(ip) => hasher.write(&ip.octets()),
            }
            hasher.write_u16(addr.port());
        }

        let clock = (self.now() as u32).wrapping_mul(ISN_TICK_INCREMENT);

        (hasher.finish() as u32).wrapping_add(clock)
    }

    fn congestion(&self) -> Box<dyn CongestionControl> {
        match &self.params.congestion {
            Some(factory) => factory(),
            None => Box::new(SlowStart::new(self.params.icw)),
        }
    }

    fn tcb_config(&self, retries: u32, linger: Option<u64>, local_mss: u16) -> TcbConfig {
        TcbConfig {
            rbufs: self.params.max_stream_rbufs,
            sbufs: self.params.max_stream_sbufs,
            local_mss,
            rto: self.params.rto_cycles,
            retries,
            timewait: self.params.timewait_cycles,
            linger,
        }
    }

    /// Returns `true` if `port` is blocked on `bound`, or on any device when
    /// the stream is not bound to one.
    fn is_blocked(devices: &Slab<Arc<Device>>, bound: Option<DeviceId>, v4: bool, port: u16) -> bool {
        devices
            .iter()
            .filter(|(_, dev)| bound.is_none_or(|id| id == dev.id))
            .any(|(_, dev)| dev.params.is_blocked(v4, port))
    }

    /// Returns the device owning `local`, or `None` for an unspecified
    /// address.
    fn bind_device(&self, local: &SocketAddr) -> Result<Option<DeviceId>> {
        if local.ip().is_unspecified() {
            return Ok(None);
        }

        self.devices
            .read()
            .iter()
            .find(|(_, dev)| dev.owns(&local.ip()))
            .map(|(_, dev)| Some(dev.id))
            .ok_or(Error::InvalidConfig("no device owns the local address"))
    }
}
