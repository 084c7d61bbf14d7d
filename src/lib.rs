//! User-space TCP/UDP transport engine.
//!
//! The engine performs no I/O of its own. The user attaches devices to a
//! [Context], feeds it received frames with [Context::rx_bulk], collects
//! frames to transmit with [Context::tx_bulk], and calls [Context::process]
//! on every tick to run retransmission, linger and `TIME_WAIT` timers.
//! Applications drive streams through the upper API ([Context::open],
//! [Context::connect], [Context::send], [Context::recv], ...) from any
//! thread, and learn about progress through events or callbacks.
//!
//! ```text
//!      user  ──open/connect/send/recv──▶  Context  ◀──rx_bulk── device RX
//!                                          │  ▲
//!      events/callbacks  ◀──notify────────┘  └──process (ticks)
//!                                          │
//!                                          └──tx_bulk──▶ device TX
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod config;
pub mod dest;
pub mod error;
pub mod event;
pub mod packet;
pub mod protocol;

mod ctx;

pub use config::{
    AcceptParams, ContextParams, DeviceOffload, DeviceParams, L4Protocol, StreamConfig,
    StreamParams,
};
pub use ctx::{Context, DeviceId, EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN, StreamHandle};
pub use dest::{Destination, Lookup};
pub use error::{Error, HeaderError, ParseError, RejectReason, Result};
pub use event::{Event, EventQueue, EventState, Notify, NotifyParams};
pub use packet::Packet;
pub use protocol::fsm::ConnectionState;
