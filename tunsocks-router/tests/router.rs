//! Robustness of the routing loop itself: malformed input, statistics,
//! and the periodic idle sweep.

use async_trait::async_trait;
use std::{
    io::Result as IoResult,
    net::{IpAddr, Ipv4Addr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf},
    time::timeout,
};
use tunsocks_proto::{Ipv4Header, UdpDatagram};
use tunsocks_router::{FlowKey, Resolver, Router, RouterConfig};

struct MockResolver(Vec<IpAddr>);

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, _name: &str) -> IoResult<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

fn start_router(config: RouterConfig) -> (Router<WriteHalf<DuplexStream>>, DuplexStream) {
    let (test_side, router_side) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(router_side);
    let resolver = MockResolver(vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
    let router = Router::start(reader, writer, config, Arc::new(resolver));
    (router, test_side)
}

fn dns_query(source: SocketAddrV4) -> Vec<u8> {
    let mut query = vec![
        0xAB, 0xCD, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    query.extend_from_slice(b"\x07example\x03com\x00");
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

    UdpDatagram {
        source,
        destination: SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
        payload: &query,
    }
    .encode()
    .to_vec()
}

async fn read_one_packet(tun: &mut DuplexStream) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(5), tun.read(&mut buf))
        .await
        .expect("no packet emitted in time")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn malformed_packets_do_not_stop_the_loop() {
    let config = RouterConfig::new("127.0.0.1:1".parse().unwrap());
    let (router, mut tun) = start_router(config);

    // Garbage, a truncated header, an IPv6 version nibble: all dropped.
    // The pauses keep each write a separate TUN read, as a real descriptor
    // in blocking mode would deliver them.
    for bad in [&[0xFFu8; 40][..], &[0x45, 0x00, 0x00], &[0x60; 40]] {
        tun.write_all(bad).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The loop is still alive and still routes.
    let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50001);
    tun.write_all(&dns_query(source)).await.unwrap();

    let packet = read_one_packet(&mut tun).await;
    let ip = Ipv4Header::parse(&packet).expect("response must parse");
    assert_eq!(ip.destination, *source.ip());

    router.shutdown();
}

#[tokio::test]
async fn statistics_count_flows_and_bytes() {
    let config = RouterConfig::new("127.0.0.1:1".parse().unwrap());
    let (router, mut tun) = start_router(config);

    let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50002);
    tun.write_all(&dns_query(source)).await.unwrap();
    let _ = read_one_packet(&mut tun).await;

    let stats = router.statistics();
    assert_eq!(stats.udp_created, 1);
    assert_eq!(stats.udp_active, 1);
    assert!(stats.bytes_sent > 0);

    // Received bytes are credited after the response is written out.
    timeout(Duration::from_secs(5), async {
        while router.statistics().bytes_received == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("received bytes must be counted");

    // A second query on the same 5-tuple reuses the flow.
    tun.write_all(&dns_query(source)).await.unwrap();
    let _ = read_one_packet(&mut tun).await;
    assert_eq!(router.statistics().udp_created, 1);

    router.shutdown();
}

#[tokio::test]
async fn idle_sweep_reclaims_stale_flows() {
    let mut config = RouterConfig::new("127.0.0.1:1".parse().unwrap());
    config.sweep_interval = Duration::from_millis(50);
    config.idle_timeout = Duration::from_millis(100);
    let (router, mut tun) = start_router(config);

    let source = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50003);
    tun.write_all(&dns_query(source)).await.unwrap();
    let _ = read_one_packet(&mut tun).await;

    let key = FlowKey::udp(source, SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53));
    assert!(router.table().get_udp(&key).is_some());

    timeout(Duration::from_secs(5), async {
        while router.table().get_udp(&key).is_some() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("idle flow must be swept");

    assert_eq!(router.statistics().udp_active, 0);
    router.shutdown();
}
