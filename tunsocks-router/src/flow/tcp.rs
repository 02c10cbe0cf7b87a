//! The simplified TCP state machine.
//!
//! One side of every connection is the TUN-side peer speaking real TCP; the
//! other side is a byte stream relayed through SOCKS5 CONNECT. Segments are
//! synthesized with whatever sequence state the flow currently holds; there
//! is no retransmission, no reordering and no window management beyond
//! advertising a fixed window.

use crate::{
    router::Context,
    socks,
    table::{FlowKey, TcpFlow, TcpState},
    Error,
};
use rand::Rng;
use std::{
    io::Result as IoResult,
    net::SocketAddrV4,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpStream},
    time::timeout,
};
use tracing::{debug, trace, warn};
use tunsocks_proto::{advance, Ipv4Header, TcpFlags, TcpHeader, TcpSegment};

const UPSTREAM_CHUNK: usize = 8 * 1024;
const WINDOW: u16 = 65535;
const TIME_WAIT_LINGER: Duration = Duration::from_secs(1);

pub async fn handle_tcp<W>(ctx: &Arc<Context<W>>, ip: &Ipv4Header, packet: &[u8])
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(tcp) = TcpHeader::parse(packet, ip.header_len) else {
        trace!("malformed tcp segment dropped");
        return;
    };

    let payload_start = ip.header_len + tcp.data_offset;
    if payload_start > ip.total_len {
        trace!("tcp segment with inconsistent lengths dropped");
        return;
    }

    let payload = &packet[payload_start..ip.total_len];
    let key = FlowKey::tcp(
        SocketAddrV4::new(ip.source, tcp.src_port),
        SocketAddrV4::new(ip.destination, tcp.dst_port),
    );

    if tcp.flags.contains(TcpFlags::Syn) && !tcp.flags.contains(TcpFlags::Ack) {
        if ctx.table.get_tcp(&key).is_none() {
            handle_syn(ctx, key, &tcp).await;
        } else {
            trace!(flow = %key, "duplicate syn ignored");
        }
        return;
    }

    if tcp.flags.contains(TcpFlags::Rst) {
        ctx.table.remove_tcp(&key);
        return;
    }

    let Some(flow) = ctx.table.get_tcp(&key) else {
        trace!(flow = %key, "segment for unknown flow dropped");
        return;
    };
    flow.touch(ctx.table.now());

    if tcp.flags.contains(TcpFlags::Fin) {
        handle_fin(ctx, &flow, &tcp).await;
        return;
    }

    if !payload.is_empty() {
        if flow.state() == TcpState::Established {
            handle_data(ctx, &flow, &tcp, payload).await;
        } else {
            trace!(flow = %key, state = ?flow.state(), "payload outside established dropped");
        }
        return;
    }

    if tcp.flags.contains(TcpFlags::Ack) {
        match flow.state() {
            // Activity already refreshed above.
            TcpState::Established => {}
            TcpState::FinWait1 => flow.set_state(TcpState::FinWait2),
            TcpState::Closing => {
                flow.set_state(TcpState::TimeWait);
            }
            state => trace!(flow = %key, ?state, "bare ack dropped"),
        }
    }
}

/// Opens the upstream relay for a new flow and answers the handshake.
///
/// The placeholder record is inserted before the first await so a duplicate
/// SYN arriving mid-handshake finds the flow and is ignored. A SOCKS5
/// refusal resets the peer and leaves no trace in the table.
async fn handle_syn<W>(ctx: &Arc<Context<W>>, key: FlowKey, tcp: &TcpHeader)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let iss: u32 = rand::thread_rng().gen();
    let our_ack = advance(tcp.seq, 1);
    let flow = ctx
        .table
        .insert_tcp(TcpFlow::new(key, iss, our_ack, ctx.table.now()));

    let connected = timeout(ctx.config.connect_timeout, async {
        let mut stream = TcpStream::connect(ctx.config.socks_addr).await?;
        socks::connect(&mut stream, key.destination).await?;
        Ok::<_, Error>(stream)
    })
    .await
    .unwrap_or(Err(Error::HandshakeTimeout));

    let upstream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            warn!(flow = %key, %err, "socks5 connect failed, resetting peer");
            ctx.table.remove_tcp(&key);
            let _ = emit(ctx, key, iss, our_ack, TcpFlags::Rst, 0, &[]).await;
            return;
        }
    };

    // The peer may have reset the flow while the handshake was in flight.
    let still_ours = ctx
        .table
        .get_tcp(&key)
        .map_or(false, |current| Arc::ptr_eq(&current, &flow));
    if !still_ours {
        debug!(flow = %key, "flow vanished during handshake, dropping upstream");
        return;
    }

    let (read_half, write_half) = upstream.into_split();
    *flow.upstream.lock().await = Some(write_half);
    flow.seq.store(advance(iss, 1), Ordering::Relaxed);
    flow.set_state(TcpState::Established);

    let reader_ctx = ctx.clone();
    let reader_flow = flow.clone();
    let handle = tokio::spawn(async move {
        upstream_reader(reader_ctx, reader_flow, read_half).await;
    });
    flow.set_reader(handle.abort_handle());

    debug!(flow = %key, "flow established");
    let _ = emit(ctx, key, iss, our_ack, TcpFlags::Syn | TcpFlags::Ack, WINDOW, &[]).await;
}

/// Forwards peer payload to the upstream stream and advances the ack.
async fn handle_data<W>(ctx: &Arc<Context<W>>, flow: &Arc<TcpFlow>, tcp: &TcpHeader, payload: &[u8])
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    {
        let mut upstream = flow.upstream.lock().await;

        let Some(stream) = upstream.as_mut() else {
            trace!(flow = %flow.key, "payload with no upstream dropped");
            return;
        };

        if let Err(err) = stream.write_all(payload).await {
            drop(upstream);
            debug!(flow = %flow.key, %err, "upstream write failed, removing flow");
            ctx.table.remove_tcp(&flow.key);
            return;
        }
    }

    flow.ack
        .store(advance(tcp.seq, payload.len() as u32), Ordering::Relaxed);
    flow.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
    ctx.table.add_bytes(payload.len() as u64, 0);
}

async fn handle_fin<W>(ctx: &Arc<Context<W>>, flow: &Arc<TcpFlow>, tcp: &TcpHeader)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let key = flow.key;
    let fin_ack = advance(tcp.seq, 1);

    match flow.state() {
        TcpState::Established => {
            flow.ack.store(fin_ack, Ordering::Relaxed);
            let seq = flow.seq.load(Ordering::Relaxed);
            let _ = emit(ctx, key, seq, fin_ack, TcpFlags::Ack, WINDOW, &[]).await;

            {
                let mut upstream = flow.upstream.lock().await;
                if let Some(stream) = upstream.as_mut() {
                    if let Err(err) = stream.shutdown().await {
                        debug!(flow = %key, %err, "upstream shutdown failed");
                    }
                }
            }

            flow.set_state(TcpState::FinWait1);
            let _ = emit(ctx, key, seq, fin_ack, TcpFlags::Fin | TcpFlags::Ack, WINDOW, &[]).await;
            // Our FIN occupies one sequence slot.
            flow.seq.store(advance(seq, 1), Ordering::Relaxed);
        }
        TcpState::FinWait1 => {
            // Simultaneous close.
            flow.ack.store(fin_ack, Ordering::Relaxed);
            flow.set_state(TcpState::Closing);
            let seq = flow.seq.load(Ordering::Relaxed);
            let _ = emit(ctx, key, seq, fin_ack, TcpFlags::Ack, WINDOW, &[]).await;
        }
        TcpState::FinWait2 => {
            flow.ack.store(fin_ack, Ordering::Relaxed);
            flow.set_state(TcpState::TimeWait);
            let seq = flow.seq.load(Ordering::Relaxed);
            let _ = emit(ctx, key, seq, fin_ack, TcpFlags::Ack, WINDOW, &[]).await;
            schedule_time_wait_removal(ctx, key);
        }
        state => trace!(flow = %key, ?state, "fin dropped"),
    }
}

fn schedule_time_wait_removal<W>(ctx: &Arc<Context<W>>, key: FlowKey)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(TIME_WAIT_LINGER).await;
        ctx.table.remove_tcp(&key);
    });
}

/// One long-lived task per established flow: pumps upstream bytes back to
/// the TUN as PSH/ACK segments. On EOF or error the flow is removed; no
/// synthetic FIN is emitted, the peer observes a timeout instead.
async fn upstream_reader<W>(ctx: Arc<Context<W>>, flow: Arc<TcpFlow>, mut upstream: OwnedReadHalf)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; UPSTREAM_CHUNK];

    loop {
        let n = match timeout(ctx.config.upstream_read_timeout, upstream.read(&mut buf)).await {
            // Idle tick; eviction is the sweep's job.
            Err(_) => continue,
            Ok(Ok(0)) => {
                debug!(flow = %flow.key, "upstream closed");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(flow = %flow.key, %err, "upstream read failed");
                break;
            }
        };

        let seq = flow.seq.load(Ordering::Relaxed);
        let ack = flow.ack.load(Ordering::Relaxed);

        if emit(
            &ctx,
            flow.key,
            seq,
            ack,
            TcpFlags::Psh | TcpFlags::Ack,
            WINDOW,
            &buf[..n],
        )
        .await
        .is_err()
        {
            break;
        }

        flow.seq.store(advance(seq, n as u32), Ordering::Relaxed);
        flow.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        ctx.table.add_bytes(0, n as u64);
        flow.touch(ctx.table.now());
    }

    ctx.table.remove_tcp(&flow.key);
}

/// Emits a synthetic segment for `key`, addressed back at the TUN-side
/// peer: source and destination are the inverse of the inbound packet.
async fn emit<W>(
    ctx: &Arc<Context<W>>,
    key: FlowKey,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> IoResult<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let packet = TcpSegment {
        source: key.destination,
        destination: key.source,
        seq,
        ack,
        flags,
        window,
        payload,
    }
    .encode();

    ctx.tun.write_packet(&packet).await.map_err(|err| {
        warn!(flow = %key, %err, len = packet.len(), "tun write failed");
        err
    })
}
