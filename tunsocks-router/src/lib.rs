//! A user-space IPv4 packet router.
//!
//! The router consumes raw IPv4 datagrams from a TUN-style byte stream,
//! reconstructs TCP and UDP flows, and relays their payloads through an
//! upstream SOCKS5 proxy (RFC 1928, "no authentication", CONNECT and UDP
//! ASSOCIATE). Responses from the proxy are re-encapsulated as IPv4/TCP or
//! IPv4/UDP packets and written back to the TUN stream.
//!
//! The caller provides the TUN descriptor as a pair of async byte streams,
//! the loopback address of the SOCKS5 endpoint, and a [`Resolver`] for the
//! DNS fast path:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunsocks_router::{Router, RouterConfig, SystemResolver};
//!
//! # async fn run(tun_reader: tokio::io::ReadHalf<tokio::io::DuplexStream>, tun_writer: tokio::io::WriteHalf<tokio::io::DuplexStream>) {
//! let config = RouterConfig::new("127.0.0.1:1080".parse().unwrap());
//! let router = Router::start(tun_reader, tun_writer, config, Arc::new(SystemResolver));
//! // ...
//! router.shutdown();
//! # }
//! ```

mod config;
mod error;
mod flow;
mod router;
mod socks;
mod tun;

pub mod dns;
pub mod table;

pub use crate::{
    config::RouterConfig,
    dns::{Resolver, SystemResolver},
    error::Error,
    router::Router,
    table::{ConnectionTable, FlowKey, Statistics, TcpState},
};
