//! The routing loop.
//!
//! One task reads IPv4 datagrams off the TUN descriptor and fans each
//! packet out to a short-lived dispatch task, so a slow SOCKS5 handshake
//! can never stall reading. A second task sweeps idle flows on a fixed
//! interval. Everything else hangs off flow records in the table.

use crate::{
    config::RouterConfig,
    dns::Resolver,
    flow,
    table::{ConnectionTable, Statistics},
    tun::TunSink,
};
use std::{io::ErrorKind, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, trace};
use tunsocks_proto::{Ipv4Header, PROTOCOL_ICMP, PROTOCOL_TCP, PROTOCOL_UDP};

/// Largest datagram a blocking-mode TUN read can return.
const TUN_READ_BUF: usize = 32 * 1024;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a dispatch or reader task needs, shared behind one [`Arc`].
pub(crate) struct Context<W> {
    pub config: RouterConfig,
    pub table: ConnectionTable,
    pub tun: TunSink<W>,
    pub resolver: Arc<dyn Resolver>,
}

/// The packet router.
///
/// [`Router::start`] takes ownership of both sides of the TUN descriptor
/// and runs until the TUN reaches end of stream or [`Router::shutdown`] is
/// called.
pub struct Router<W> {
    ctx: Arc<Context<W>>,
    reader: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl<W> Router<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn start<R>(
        tun_reader: R,
        tun_writer: W,
        config: RouterConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ctx = Arc::new(Context {
            config,
            table: ConnectionTable::new(),
            tun: TunSink::new(tun_writer),
            resolver,
        });

        let sweeper = tokio::spawn(sweep_loop(ctx.clone()));
        let reader = tokio::spawn(read_loop(tun_reader, ctx.clone()));

        info!(socks = %config.socks_addr, "router started");

        Self {
            ctx,
            reader,
            sweeper,
        }
    }

    /// The flow registry, for inspection.
    pub fn table(&self) -> &ConnectionTable {
        &self.ctx.table
    }

    /// Lock-free counter snapshot.
    pub fn statistics(&self) -> Statistics {
        self.ctx.table.statistics()
    }

    /// Stops the loops and releases every flow. Never panics; releasing a
    /// half-dead flow is a no-op.
    pub fn shutdown(self) {
        self.sweeper.abort();
        let released = self.ctx.table.close_all();
        self.reader.abort();
        info!(released, "router stopped");
    }
}

async fn read_loop<R, W>(mut tun: R, ctx: Arc<Context<W>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; TUN_READ_BUF];

    loop {
        let n = match tun.read(&mut buf).await {
            Ok(0) => {
                info!("tun reached end of stream, router stopping");
                break;
            }
            Ok(n) => n,
            Err(err) if is_transient(err.kind()) => {
                trace!(%err, "transient tun read error");
                sleep(READ_RETRY_DELAY).await;
                continue;
            }
            Err(err) => {
                error!(%err, "fatal tun read error, router stopping");
                break;
            }
        };

        let packet = buf[..n].to_vec();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            dispatch(&ctx, &packet).await;
        });
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

async fn dispatch<W>(ctx: &Arc<Context<W>>, packet: &[u8])
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(ip) = Ipv4Header::parse(packet) else {
        trace!(len = packet.len(), "unparseable packet dropped");
        return;
    };

    match ip.protocol {
        PROTOCOL_TCP => flow::tcp::handle_tcp(ctx, &ip, packet).await,
        PROTOCOL_UDP => flow::udp::handle_udp(ctx, &ip, packet).await,
        PROTOCOL_ICMP => trace!("icmp packet dropped"),
        protocol => trace!(protocol, "unsupported protocol dropped"),
    }
}

async fn sweep_loop<W>(ctx: Arc<Context<W>>) {
    let mut ticker = interval(ctx.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let removed = ctx
            .table
            .cleanup_idle(ctx.config.idle_timeout, ctx.config.time_wait_timeout);

        if removed > 0 {
            debug!(removed, "idle sweep evicted flows");
        }
    }
}
