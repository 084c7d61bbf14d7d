//! Error types for the transport engine, including errors surfaced by the
//! upper stream API, configuration validation, and the IPv4/IPv6/TCP/UDP
//! header codecs.

use std::net::{IpAddr, SocketAddr};
use std::result;

use thiserror::Error;

use crate::protocol::fsm::ConnectionState;

/// A convenience wrapper around `Result` for `l4_engine::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors that can occur when driving a [Context].
///
/// [Context]: crate::Context
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed parameters or a handle that does not refer to a live object.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Allocation of an internal pool failed.
    #[error("out of resources: {0}")]
    OutOfResources(&'static str),
    /// Every slot of the stream pool is in use.
    #[error("stream limit reached: all {max} stream slots in use")]
    StreamLimitReached {
        /// Capacity of the stream pool.
        max: usize,
    },
    /// Every slot of the device pool is in use.
    #[error("device limit reached: all {max} device slots in use")]
    DeviceLimitReached {
        /// Capacity of the device pool.
        max: usize,
    },
    /// A pool ran dry while servicing one entry of a batch operation.
    #[error("resources exhausted: no free stream slots")]
    ResourceExhausted,
    /// The operation is not valid in the connection's current state.
    #[error("invalid state: operation not permitted in {0:?}")]
    InvalidState(ConnectionState),
    /// Data operation on a stream without an established connection.
    #[error("stream is not connected")]
    NotConnected,
    /// The handle refers to a stream that has been closed by the user or
    /// whose slot has since been reused.
    #[error("stream handle used after close")]
    UseAfterClose,
    /// The requested local address/port pair is already reserved.
    #[error("address already in use: {0}")]
    AddrInUse(SocketAddr),
    /// The destination resolver returned no route for the address.
    #[error("no route to host: {0}")]
    NoRoute(IpAddr),
    /// Error parsing an IPv4/IPv6/TCP/UDP header.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Error creating or manipulating a header.
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Reason an inbound packet handed to [Context::rx_bulk] was returned to the
/// caller instead of being delivered.
///
/// [Context::rx_bulk]: crate::Context::rx_bulk
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No stream on this device accepts the packet. Packets that fail
    /// classification or checksum verification have no stream either.
    #[error("no matching stream")]
    NoMatchingStream,
    /// The matched stream's receive buffer (or SYN queue) is full.
    #[error("stream receive buffer full")]
    BufferFull,
}

/// Error occurred while trying to parse an IPv4/IPv6/TCP/UDP header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum ParseError {
    /// Input buffer not within the valid range for the header.
    #[error(
        "invalid header length: {provided} bytes (not within the valid range: {min}..={max} bytes)"
    )]
    InvalidBufferLength { provided: usize, min: u16, max: u16 },
    /// Invalid IP version.
    #[error("invalid IP version: IPv{provided} (must be IPv{expected})")]
    InvalidVersion { provided: u8, expected: u8 },
    /// Invalid IPv4 IHL.
    #[error("invalid IPv4 IHL: {provided} (must be at least {min})")]
    InvalidIhl { provided: u8, min: u8 },
    /// Invalid IPv4 total length.
    ///
    /// Value provided is less than `IHL << 2`.
    #[error(
        "invalid IPv4 total length: {provided} bytes (less than indicated by IHL: {expected} bytes)"
    )]
    InvalidTotalLength { provided: u16, expected: u8 },
    /// Upper-layer protocol not handled by the engine.
    #[error("unsupported upper-layer protocol: {0}")]
    InvalidProtocol(u8),
    /// Invalid TCP data offset.
    #[error("invalid TCP data offset: {provided} (not within the valid range: {min}..={max})")]
    InvalidDataOffset { provided: u16, min: u16, max: u16 },
    /// Mismatch between the provided and expected TCP header length.
    ///
    /// Value provided is less than `data_offset << 2`.
    #[error(
        "invalid TCP header length: {provided} bytes (less than indicated by data offset: {expected} bytes)"
    )]
    HeaderLengthMismatch { provided: usize, expected: u16 },
    /// Invalid TCP options length.
    #[error("invalid TCP options length: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    InvalidOptionsLength { provided: usize, max: usize },
    /// Invalid UDP length field.
    #[error("invalid UDP length: {provided} bytes (must be within 8..={max} bytes)")]
    InvalidUdpLength { provided: u16, max: usize },
    /// Packet metadata does not describe the buffer it is attached to.
    #[error("invalid packet layout: {0}")]
    InvalidLayout(&'static str),
}

/// Error occurred while trying to create or manipulate a header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HeaderError {
    /// Invalid payload length for an IP header.
    #[error("failed to set IP payload length: {provided} bytes (exceeds maximum allowed {max} bytes)")]
    PayloadTooLarge { provided: usize, max: u16 },
    /// Insufficient space to append TCP option.
    #[error(
        "failed to append TCP option to header: appending would result in {attempted_len} bytes, but current length is {current_len} (exceeds maximum allowed {max_len} bytes)"
    )]
    InsufficientOptionSpace {
        attempted_len: usize,
        current_len: usize,
        max_len: usize,
    },
    /// Invalid TCP `MSS` option value.
    #[error("invalid TCP MSS option: value must be greater than 0")]
    InvalidMssOption,
    /// Packet buffer lacks the headroom needed to prepend headers.
    #[error("insufficient headroom: {needed} bytes needed, {available} available")]
    InsufficientHeadroom { needed: usize, available: usize },
    /// Destination header template does not match its declared layout.
    #[error("invalid header template: {0}")]
    InvalidTemplate(&'static str),
}
