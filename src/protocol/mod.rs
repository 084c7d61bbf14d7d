//! Transport protocol implementation: header codecs, the TCP connection
//! state machine, and its congestion control policy.

pub mod congestion;
pub mod fsm;
pub mod headers;

mod segment;
pub use segment::TcpSegment;

mod socket;
pub use socket::Socket;
