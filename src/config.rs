//! Parameters for contexts, devices, and streams.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bitflags::bitflags;

use crate::dest::Lookup;
use crate::event::NotifyParams;
use crate::packet::Packet;
use crate::protocol::congestion::CongestionControl;
use crate::protocol::fsm::{DEFAULT_RETRIES, DEFAULT_RTO_CYCLES};
use crate::{Error, Result};

/// Builds the congestion control policy of each new TCP connection.
pub type CongestionFactory = Arc<dyn Fn() -> Box<dyn CongestionControl> + Send + Sync>;

/// Transport protocol served by a [Context].
///
/// [Context]: crate::Context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L4Protocol {
    /// Transmission Control Protocol.
    #[default]
    Tcp,
    /// User Datagram Protocol.
    Udp,
}

bitflags! {
    /// Checksum offload capabilities of a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceOffload: u32 {
        /// IPv4 header checksum.
        const IPV4_CKSUM = 1 << 0;
        /// TCP checksum.
        const TCP_CKSUM = 1 << 1;
        /// UDP checksum.
        const UDP_CKSUM = 1 << 2;
    }
}

/// Parameters of a [Context], fixed at creation.
///
/// [Context]: crate::Context
#[derive(Clone)]
pub struct ContextParams {
    /// Protocol of every stream in the context.
    pub proto: L4Protocol,
    /// Capacity of the stream pool.
    pub max_streams: usize,
    /// Capacity of the device pool.
    pub max_devices: usize,
    /// Receive buffer capacity of each stream, in packets. Also bounds a
    /// listener's SYN queue.
    pub max_stream_rbufs: usize,
    /// Send buffer capacity of each stream, in packets.
    pub max_stream_sbufs: usize,
    /// Resolver for IPv4 destinations.
    pub lookup4: Option<Arc<dyn Lookup<Ipv4Addr>>>,
    /// Resolver for IPv6 destinations.
    pub lookup6: Option<Arc<dyn Lookup<Ipv6Addr>>>,
    /// Key for initial sequence number generation (RFC 6528).
    pub secret_key: [u8; 16],
    /// Initial congestion window in segments, 0 selects the RFC 5681
    /// default.
    pub icw: u32,
    /// Initial retransmission timeout, in `process` ticks.
    pub rto_cycles: u64,
    /// Duration of `TIME_WAIT`, in `process` ticks.
    pub timewait_cycles: u64,
    /// Congestion control policy, slow start when `None`.
    pub congestion: Option<CongestionFactory>,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            proto: L4Protocol::Tcp,
            max_streams: 64,
            max_devices: 4,
            max_stream_rbufs: 32,
            max_stream_sbufs: 32,
            lookup4: None,
            lookup6: None,
            secret_key: random_key(),
            icw: 0,
            rto_cycles: DEFAULT_RTO_CYCLES,
            timewait_cycles: 0,
            congestion: None,
        }
    }
}

impl ContextParams {
    /// Checks the parameters for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent parameter.
    pub fn validate(&self) -> Result<()> {
        if self.max_streams == 0 || self.max_streams > u32::MAX as usize {
            return Err(Error::InvalidConfig("max_streams must be in 1..=u32::MAX"));
        }

        if self.max_devices == 0 {
            return Err(Error::InvalidConfig("max_devices must be non-zero"));
        }

        if self.max_stream_rbufs == 0 || self.max_stream_sbufs == 0 {
            return Err(Error::InvalidConfig("stream buffer capacities must be non-zero"));
        }

        if self.rto_cycles == 0 {
            return Err(Error::InvalidConfig("rto_cycles must be non-zero"));
        }

        Ok(())
    }
}

impl fmt::Debug for ContextParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextParams")
            .field("proto", &self.proto)
            .field("max_streams", &self.max_streams)
            .field("max_devices", &self.max_devices)
            .field("max_stream_rbufs", &self.max_stream_rbufs)
            .field("max_stream_sbufs", &self.max_stream_sbufs)
            .field("lookup4", &self.lookup4.is_some())
            .field("lookup6", &self.lookup6.is_some())
            .field("icw", &self.icw)
            .field("rto_cycles", &self.rto_cycles)
            .field("timewait_cycles", &self.timewait_cycles)
            .field("congestion", &self.congestion.is_some())
            .finish_non_exhaustive()
    }
}

/// Derives a per-process key from the standard library's randomly seeded
/// hasher.
fn random_key() -> [u8; 16] {
    let state = RandomState::new();
    let mut key = [0u8; 16];

    key[..8].copy_from_slice(&state.hash_one(0u64).to_ne_bytes());
    key[8..].copy_from_slice(&state.hash_one(1u64).to_ne_bytes());

    key
}

/// Parameters of a device attached to a [Context].
///
/// [Context]: crate::Context
#[derive(Debug, Clone, Default)]
pub struct DeviceParams {
    /// Checksums the device verifies on receive.
    pub rx_offload: DeviceOffload,
    /// Checksums the device computes on transmit.
    pub tx_offload: DeviceOffload,
    /// Local IPv4 address of the device.
    pub local_addr4: Option<Ipv4Addr>,
    /// Local IPv6 address of the device.
    pub local_addr6: Option<Ipv6Addr>,
    /// IPv4 ports never demultiplexed nor allocated.
    pub blocked_ports4: Vec<u16>,
    /// IPv6 ports never demultiplexed nor allocated.
    pub blocked_ports6: Vec<u16>,
}

impl DeviceParams {
    /// Checks the parameters for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error if the device has no usable local address.
    pub fn validate(&self) -> Result<()> {
        if self.local_addr4.is_none() && self.local_addr6.is_none() {
            return Err(Error::InvalidConfig("device has no local address"));
        }

        if self.local_addr4.is_some_and(|addr| addr.is_unspecified())
            || self.local_addr6.is_some_and(|addr| addr.is_unspecified())
        {
            return Err(Error::InvalidConfig("device local address is unspecified"));
        }

        Ok(())
    }

    /// Returns the local address of the device for the given family.
    pub fn local_addr(&self, v4: bool) -> Option<IpAddr> {
        if v4 {
            self.local_addr4.map(IpAddr::V4)
        } else {
            self.local_addr6.map(IpAddr::V6)
        }
    }

    /// Returns `true` if `port` is blocked for the given family.
    pub fn is_blocked(&self, v4: bool, port: u16) -> bool {
        if v4 {
            self.blocked_ports4.contains(&port)
        } else {
            self.blocked_ports6.contains(&port)
        }
    }
}

/// Per-stream settings that can be changed after the stream is opened.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Retransmissions attempted before the connection is abandoned (TCP).
    pub nb_retries: u32,
    /// Ticks granted after a close to flush the send buffer, unlimited when
    /// `None` (TCP).
    pub linger_cycles: Option<u64>,
    /// Notification for received data (or queued connection requests).
    pub recv: NotifyParams,
    /// Notification for free send buffer space and connection completion.
    pub send: NotifyParams,
    /// Notification for connection failure (TCP).
    pub error: NotifyParams,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            nb_retries: DEFAULT_RETRIES,
            linger_cycles: None,
            recv: NotifyParams::default(),
            send: NotifyParams::default(),
            error: NotifyParams::default(),
        }
    }
}

/// Parameters of a stream.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Local address. An unspecified IP binds to every device of the
    /// family, port 0 allocates an ephemeral port.
    pub local: SocketAddr,
    /// Remote address. For UDP an unspecified IP or port 0 accepts
    /// datagrams from any remote; for TCP it is set by `connect`.
    pub remote: SocketAddr,
    /// Changeable settings.
    pub cfg: StreamConfig,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            local: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            remote: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            cfg: StreamConfig::default(),
        }
    }
}

impl StreamParams {
    /// Creates parameters for a stream bound to `local`.
    pub fn bind(local: SocketAddr) -> Self {
        let remote = match local {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };

        Self {
            local,
            remote,
            cfg: StreamConfig::default(),
        }
    }

    /// Checks the parameters for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error on an address family mismatch or a multicast or
    /// broadcast address.
    pub fn validate(&self) -> Result<()> {
        if self.local.is_ipv4() != self.remote.is_ipv4() {
            return Err(Error::InvalidConfig(
                "local and remote address families differ",
            ));
        }

        for ip in [self.local.ip(), self.remote.ip()] {
            let invalid = match ip {
                IpAddr::V4(addr) => addr.is_multicast() || addr.is_broadcast(),
                IpAddr::V6(addr) => addr.is_multicast(),
            };

            if invalid {
                return Err(Error::InvalidConfig("multicast or broadcast address"));
            }
        }

        Ok(())
    }
}

/// One connection request handed to `accept`.
#[derive(Debug)]
pub struct AcceptParams {
    /// The SYN packet, as returned by `synreqs`.
    pub syn: Packet,
    /// Settings of the accepted stream.
    pub cfg: StreamConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_params_validate() {
        assert!(ContextParams::default().validate().is_ok());

        for params in [
            ContextParams {
                max_streams: 0,
                ..Default::default()
            },
            ContextParams {
                max_devices: 0,
                ..Default::default()
            },
            ContextParams {
                max_stream_sbufs: 0,
                ..Default::default()
            },
            ContextParams {
                rto_cycles: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(params.validate(), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn context_params_keys_differ() {
        assert_ne!(
            ContextParams::default().secret_key,
            ContextParams::default().secret_key
        );
    }

    #[test]
    fn device_params_validate() {
        assert!(DeviceParams::default().validate().is_err());

        let params = DeviceParams {
            local_addr4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            blocked_ports4: vec![22],
            ..Default::default()
        };
        assert!(params.validate().is_ok());
        assert!(params.is_blocked(true, 22));
        assert!(!params.is_blocked(false, 22));
        assert_eq!(params.local_addr(false), None);

        let params = DeviceParams {
            local_addr4: Some(Ipv4Addr::UNSPECIFIED),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn stream_params_validate() {
        let params = StreamParams::bind("10.0.0.1:80".parse().unwrap());
        assert!(params.validate().is_ok());

        let params = StreamParams {
            remote: "[::1]:80".parse().unwrap(),
            ..params
        };
        assert!(params.validate().is_err());

        let params = StreamParams::bind("224.0.0.1:80".parse().unwrap());
        assert!(params.validate().is_err());
    }
}
