use std::{net::SocketAddr, time::Duration};

/// Tunables of the routing loop.
///
/// Everything is provided at construction; the router reads no environment
/// variables and persists no state.
#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    /// The upstream SOCKS5 endpoint, a loopback TCP address.
    pub socks_addr: SocketAddr,
    /// Deadline for opening the upstream TCP stream and completing the
    /// CONNECT handshake.
    pub connect_timeout: Duration,
    /// Deadline for the ASSOCIATE handshake; also the receive tick of the
    /// relay socket, which bounds how long cancellation can lag.
    pub associate_timeout: Duration,
    /// Idle tick of the upstream TCP reader.
    pub upstream_read_timeout: Duration,
    /// A flow untouched for this long is evicted by the sweep.
    pub idle_timeout: Duration,
    /// Eviction bound for TCP flows parked in TIME_WAIT.
    pub time_wait_timeout: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
    /// Answer port-53 queries with the host resolver instead of relaying
    /// them. Disable only when the upstream proxy supports UDP ASSOCIATE
    /// for DNS traffic.
    pub resolve_dns_locally: bool,
}

impl RouterConfig {
    pub fn new(socks_addr: SocketAddr) -> Self {
        Self {
            socks_addr,
            connect_timeout: Duration::from_secs(5),
            associate_timeout: Duration::from_secs(5),
            upstream_read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            time_wait_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            resolve_dns_locally: true,
        }
    }
}
