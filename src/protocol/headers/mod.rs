//! Parsing, serialization, and construction of IPv4/IPv6/TCP/UDP headers.

pub mod checksum;

mod ipv4;
pub use ipv4::{FragmentFlags, Ipv4Header, Protocol};

mod ipv6;
pub use ipv6::Ipv6Header;

mod tcp;
pub use tcp::{OptionKind, TcpFlags, TcpHeader, TcpOptions};

mod udp;
pub use udp::UdpHeader;
