//! UDP relaying.
//!
//! Port-53 traffic takes the DNS fast path; everything else rides a SOCKS5
//! UDP association, one per 5-tuple. UDP is best effort throughout: a
//! failed packet is logged and dropped, and never disturbs other flows.

use crate::{
    dns,
    router::Context,
    socks,
    table::{FlowKey, UdpAssociateFlow, UdpFlow},
    Error,
};
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{atomic::Ordering, Arc},
};
use tokio::{
    io::AsyncWrite,
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tracing::{debug, trace, warn};
use tunsocks_proto::{
    socks::{Address, RelayHeader},
    Ipv4Header, UdpDatagram, UdpHeader,
};

const UDP_HEADER_LEN: usize = 8;
const RELAY_BUF: usize = 65535;
const DNS_PORT: u16 = 53;

pub async fn handle_udp<W>(ctx: &Arc<Context<W>>, ip: &Ipv4Header, packet: &[u8])
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(udp) = UdpHeader::parse(packet, ip.header_len) else {
        trace!("malformed udp datagram dropped");
        return;
    };

    let payload = &packet[ip.header_len + UDP_HEADER_LEN..ip.header_len + udp.length];
    let source = SocketAddrV4::new(ip.source, udp.src_port);
    let destination = SocketAddrV4::new(ip.destination, udp.dst_port);

    if udp.dst_port == DNS_PORT && ctx.config.resolve_dns_locally {
        answer_dns(ctx, source, destination, payload).await;
        return;
    }

    let key = FlowKey::udp(source, destination);

    let flow = match ctx.table.get_associate(&key) {
        Some(flow) => flow,
        None => match establish(ctx, key).await {
            Ok(flow) => flow,
            Err(err) => {
                debug!(flow = %key, %err, "udp association setup failed, dropping datagram");
                return;
            }
        },
    };

    flow.touch(ctx.table.now());

    let datagram = RelayHeader::new(Address::from(destination)).encapsulate(payload);

    match flow.socket.send(&datagram).await {
        Ok(_) => {
            flow.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
            ctx.table.add_bytes(payload.len() as u64, 0);
        }
        Err(err) => {
            debug!(flow = %key, %err, "relay send failed, removing flow");
            ctx.table.remove_associate(&key);
        }
    }
}

/// Opens a UDP association for a new flow: control connection, handshake,
/// datagram socket, reader task.
async fn establish<W>(ctx: &Arc<Context<W>>, key: FlowKey) -> Result<Arc<UdpAssociateFlow>, Error>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handshake = async {
        let mut control = TcpStream::connect(ctx.config.socks_addr).await?;
        let relay = socks::associate(&mut control).await?;
        Ok::<_, Error>((control, relay))
    };

    let (control, relay) = timeout(ctx.config.associate_timeout, handshake)
        .await
        .unwrap_or(Err(Error::HandshakeTimeout))?;

    // An all-zero BND.ADDR means "same host as the control connection".
    let relay = if relay.ip().is_unspecified() {
        match ctx.config.socks_addr {
            SocketAddr::V4(addr) => SocketAddrV4::new(*addr.ip(), relay.port()),
            SocketAddr::V6(_) => return Err(Error::RelayEndpoint),
        }
    } else {
        relay
    };

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(relay).await?;

    let (flow, inserted) = ctx.table.insert_associate(UdpAssociateFlow::new(
        key,
        control,
        Arc::new(socket),
        relay,
        ctx.table.now(),
    ));

    if inserted {
        let reader_ctx = ctx.clone();
        let reader_flow = flow.clone();
        let handle = tokio::spawn(async move {
            relay_reader(reader_ctx, reader_flow).await;
        });
        flow.set_reader(handle.abort_handle());
        debug!(flow = %key, relay = %relay, "udp association established");
    }

    Ok(flow)
}

/// One task per association: decapsulates relay datagrams and re-emits them
/// as IPv4/UDP packets to the TUN. Receive timeouts only tick the loop so
/// an aborted task lets go of the socket promptly.
async fn relay_reader<W>(ctx: Arc<Context<W>>, flow: Arc<UdpAssociateFlow>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; RELAY_BUF];

    loop {
        let n = match timeout(ctx.config.associate_timeout, flow.socket.recv(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                debug!(flow = %flow.key, %err, "relay receive failed");
                break;
            }
        };

        let (header, payload) = match RelayHeader::decapsulate(&buf[..n]).await {
            Ok(parts) => parts,
            Err(err) => {
                trace!(flow = %flow.key, %err, len = n, "bad relay datagram dropped");
                continue;
            }
        };

        let Some(origin) = header.address.as_socket_v4() else {
            trace!(flow = %flow.key, "non-ipv4 relay origin dropped");
            continue;
        };

        let packet = UdpDatagram {
            source: origin,
            destination: flow.key.source,
            payload,
        }
        .encode();

        if let Err(err) = ctx.tun.write_packet(&packet).await {
            warn!(flow = %flow.key, %err, "tun write failed");
            break;
        }

        flow.bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
        ctx.table.add_bytes(0, payload.len() as u64);
        flow.touch(ctx.table.now());
    }

    ctx.table.remove_associate(&flow.key);
}

/// Answers a port-53 query from the host resolver and emits the synthetic
/// response with source and destination swapped. Resolver failures drop
/// the query; the client retries on its own schedule.
async fn answer_dns<W>(
    ctx: &Arc<Context<W>>,
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let Some(question) = dns::parse_query(payload) else {
        trace!("malformed dns query dropped");
        return;
    };

    let key = FlowKey::udp(source, destination);
    let flow = match ctx.table.get_udp(&key) {
        Some(flow) => flow,
        None => ctx.table.insert_udp(UdpFlow::new(key, ctx.table.now())),
    };
    flow.touch(ctx.table.now());
    flow.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
    ctx.table.add_bytes(payload.len() as u64, 0);

    let addrs = match ctx.resolver.resolve(&question.qname).await {
        Ok(addrs) => addrs,
        Err(err) => {
            debug!(name = %question.qname, %err, "resolver failed, query dropped");
            return;
        }
    };

    trace!(name = %question.qname, answers = addrs.len(), "dns query answered locally");

    let response = dns::build_response(&question, &addrs);
    let packet = UdpDatagram {
        source: destination,
        destination: source,
        payload: &response,
    }
    .encode();

    if let Err(err) = ctx.tun.write_packet(&packet).await {
        warn!(flow = %key, %err, "tun write failed");
        return;
    }

    flow.bytes_received.fetch_add(response.len() as u64, Ordering::Relaxed);
    ctx.table.add_bytes(0, response.len() as u64);
}
