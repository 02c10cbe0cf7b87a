//! Wire formats for the tunsocks packet router.
//!
//! Two families of types live here, both free of I/O state:
//!
//! - Internet-layer codecs: [`Ipv4Header`], [`TcpHeader`] and [`UdpHeader`]
//!   parse raw datagrams read from a TUN descriptor; [`TcpSegment`] and
//!   [`UdpDatagram`] emit complete IPv4 packets with freshly computed
//!   checksums.
//! - The [`socks`] module: client-side SOCKS5 protocol types with async
//!   read / write functions.

pub mod checksum;
pub mod socks;

mod error;
mod ipv4;
mod tcp;
mod udp;

pub use self::{
    error::{Error, ProtocolError},
    ipv4::{Ipv4Header, PROTOCOL_ICMP, PROTOCOL_TCP, PROTOCOL_UDP},
    tcp::{advance, TcpFlags, TcpHeader, TcpSegment},
    udp::{UdpDatagram, UdpHeader},
};

pub const SOCKS_VERSION: u8 = 0x05;
