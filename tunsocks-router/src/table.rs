//! Registry of live flows, keyed by 5-tuple.
//!
//! The table is the only shared mutable structure in the router. One
//! exclusive lock guards the three maps; it is never held across an await.
//! Flow records are handed out as [`Arc`] clones whose mutable fields are
//! atomics, so a lookup is a consistent, cheap snapshot. Statistics are
//! plain atomic counters and are readable without any lock; the created
//! totals are monotonic for the lifetime of the process.

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    net::SocketAddrV4,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpStream, UdpSocket},
    task::AbortHandle,
};
use tracing::debug;
use tunsocks_proto::{PROTOCOL_TCP, PROTOCOL_UDP};

/// One bidirectional flow: protocol, source and destination of the packets
/// arriving from the TUN side. Compared structurally.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FlowKey {
    pub protocol: u8,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
}

impl FlowKey {
    pub const fn tcp(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            protocol: PROTOCOL_TCP,
            source,
            destination,
        }
    }

    pub const fn udp(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            protocol: PROTOCOL_UDP,
            source,
            destination,
        }
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let proto = match self.protocol {
            PROTOCOL_TCP => "tcp",
            PROTOCOL_UDP => "udp",
            _ => "ip",
        };
        write!(f, "{proto} {} -> {}", self.source, self.destination)
    }
}

/// The simplified TCP connection states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TcpState {
    Closed = 0,
    SynSent = 1,
    Established = 2,
    FinWait1 = 3,
    FinWait2 = 4,
    Closing = 5,
    TimeWait = 6,
}

impl TcpState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::SynSent,
            2 => Self::Established,
            3 => Self::FinWait1,
            4 => Self::FinWait2,
            5 => Self::Closing,
            6 => Self::TimeWait,
            _ => Self::Closed,
        }
    }
}

/// A TCP flow relayed through a SOCKS5 CONNECT stream.
///
/// The write half of the upstream stream lives here behind an async mutex,
/// which serializes payload writes from the inbound path; the read half is
/// owned by the flow's reader task and is dropped when that task is aborted.
pub struct TcpFlow {
    pub key: FlowKey,
    pub upstream: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: AtomicU8,
    /// Our next send sequence number.
    pub seq: AtomicU32,
    /// The next sequence number we expect from the peer; sent as ACK.
    pub ack: AtomicU32,
    pub created_at: u64,
    last_activity: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    reader: OnceLock<AbortHandle>,
}

impl TcpFlow {
    /// A placeholder record in `SynSent`; the upstream stream and the reader
    /// task are attached once the SOCKS5 handshake succeeds.
    pub fn new(key: FlowKey, iss: u32, ack: u32, now: u64) -> Self {
        Self {
            key,
            upstream: tokio::sync::Mutex::new(None),
            state: AtomicU8::new(TcpState::SynSent as u8),
            seq: AtomicU32::new(iss),
            ack: AtomicU32::new(ack),
            created_at: now,
            last_activity: AtomicU64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reader: OnceLock::new(),
        }
    }

    pub fn state(&self) -> TcpState {
        TcpState::from_bits(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: TcpState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Attaches the upstream reader task; effective once.
    pub fn set_reader(&self, handle: AbortHandle) {
        let _ = self.reader.set(handle);
    }

    fn release(&self) {
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
    }
}

/// A UDP flow answered locally (the DNS fast path). Kept for bookkeeping
/// and idle accounting only; there is no upstream stream.
pub struct UdpFlow {
    pub key: FlowKey,
    pub created_at: u64,
    last_activity: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl UdpFlow {
    pub fn new(key: FlowKey, now: u64) -> Self {
        Self {
            key,
            created_at: now,
            last_activity: AtomicU64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// A UDP flow relayed through SOCKS5 UDP ASSOCIATE.
///
/// The control stream must stay open for the lifetime of the flow; the
/// record owning it guarantees that, and dropping the record terminates the
/// relay. The datagram socket is shared with the flow's reader task.
pub struct UdpAssociateFlow {
    pub key: FlowKey,
    pub control: TcpStream,
    pub socket: Arc<UdpSocket>,
    /// The relay endpoint from the BND fields of the ASSOCIATE reply.
    pub relay: SocketAddrV4,
    pub created_at: u64,
    last_activity: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    reader: OnceLock<AbortHandle>,
}

impl UdpAssociateFlow {
    pub fn new(
        key: FlowKey,
        control: TcpStream,
        socket: Arc<UdpSocket>,
        relay: SocketAddrV4,
        now: u64,
    ) -> Self {
        Self {
            key,
            control,
            socket,
            relay,
            created_at: now,
            last_activity: AtomicU64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            reader: OnceLock::new(),
        }
    }

    pub fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn set_reader(&self, handle: AbortHandle) {
        let _ = self.reader.set(handle);
    }

    fn release(&self) {
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
    }
}

#[derive(Default)]
struct Counters {
    tcp_created: AtomicU64,
    udp_created: AtomicU64,
    associate_created: AtomicU64,
    tcp_active: AtomicU64,
    udp_active: AtomicU64,
    associate_active: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A point-in-time view of the table counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub tcp_created: u64,
    pub udp_created: u64,
    pub associate_created: u64,
    pub tcp_active: u64,
    pub udp_active: u64,
    pub associate_active: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Maps {
    tcp: HashMap<FlowKey, Arc<TcpFlow>>,
    udp: HashMap<FlowKey, Arc<UdpFlow>>,
    associate: HashMap<FlowKey, Arc<UdpAssociateFlow>>,
}

pub struct ConnectionTable {
    maps: Mutex<Maps>,
    counters: Counters,
    epoch: Instant,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
            counters: Counters::default(),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds on the table's monotonic clock.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Maps> {
        // A poisoned lock means a panic while holding it; the maps are still
        // structurally sound, so keep routing.
        self.maps.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn insert_tcp(&self, flow: TcpFlow) -> Arc<TcpFlow> {
        let flow = Arc::new(flow);
        let replaced = self.lock().tcp.insert(flow.key, flow.clone());

        self.counters.tcp_created.fetch_add(1, Ordering::Relaxed);
        self.counters.tcp_active.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = replaced {
            self.counters.tcp_active.fetch_sub(1, Ordering::Relaxed);
            old.release();
        }

        flow
    }

    pub fn get_tcp(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.lock().tcp.get(key).cloned()
    }

    pub fn remove_tcp(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        let flow = self.lock().tcp.remove(key)?;

        self.counters.tcp_active.fetch_sub(1, Ordering::Relaxed);
        flow.release();
        debug!(flow = %flow.key, "tcp flow removed");

        Some(flow)
    }

    pub fn insert_udp(&self, flow: UdpFlow) -> Arc<UdpFlow> {
        let flow = Arc::new(flow);
        let replaced = self.lock().udp.insert(flow.key, flow.clone());

        self.counters.udp_created.fetch_add(1, Ordering::Relaxed);
        self.counters.udp_active.fetch_add(1, Ordering::Relaxed);

        if replaced.is_some() {
            self.counters.udp_active.fetch_sub(1, Ordering::Relaxed);
        }

        flow
    }

    pub fn get_udp(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        self.lock().udp.get(key).cloned()
    }

    pub fn remove_udp(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        let flow = self.lock().udp.remove(key)?;
        self.counters.udp_active.fetch_sub(1, Ordering::Relaxed);
        Some(flow)
    }

    /// Registers an ASSOCIATE flow, unless a concurrent packet for the same
    /// key won the race; the caller must use the returned record and spawn a
    /// reader only when `inserted` is true.
    pub fn insert_associate(&self, flow: UdpAssociateFlow) -> (Arc<UdpAssociateFlow>, bool) {
        let flow = Arc::new(flow);

        {
            let mut maps = self.lock();

            if let Some(existing) = maps.associate.get(&flow.key) {
                return (existing.clone(), false);
            }

            maps.associate.insert(flow.key, flow.clone());
        }

        self.counters.associate_created.fetch_add(1, Ordering::Relaxed);
        self.counters.associate_active.fetch_add(1, Ordering::Relaxed);

        (flow, true)
    }

    pub fn get_associate(&self, key: &FlowKey) -> Option<Arc<UdpAssociateFlow>> {
        self.lock().associate.get(key).cloned()
    }

    pub fn remove_associate(&self, key: &FlowKey) -> Option<Arc<UdpAssociateFlow>> {
        let flow = self.lock().associate.remove(key)?;

        self.counters.associate_active.fetch_sub(1, Ordering::Relaxed);
        flow.release();
        debug!(flow = %flow.key, "udp associate flow removed");

        Some(flow)
    }

    /// Cumulative byte accounting across all flow kinds.
    pub fn add_bytes(&self, sent: u64, received: u64) {
        if sent > 0 {
            self.counters.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        }
        if received > 0 {
            self.counters.bytes_received.fetch_add(received, Ordering::Relaxed);
        }
    }

    /// Safe to call from any task at any time; reads no lock.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            tcp_created: self.counters.tcp_created.load(Ordering::Relaxed),
            udp_created: self.counters.udp_created.load(Ordering::Relaxed),
            associate_created: self.counters.associate_created.load(Ordering::Relaxed),
            tcp_active: self.counters.tcp_active.load(Ordering::Relaxed),
            udp_active: self.counters.udp_active.load(Ordering::Relaxed),
            associate_active: self.counters.associate_active.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Evicts every flow idle longer than `idle`; TCP flows parked in
    /// TIME_WAIT are held only to the shorter `time_wait` bound.
    pub fn cleanup_idle(&self, idle: Duration, time_wait: Duration) -> usize {
        let now = self.now();
        let idle = idle.as_millis() as u64;
        let time_wait = time_wait.as_millis() as u64;

        let expired = |last: u64, bound: u64| now.saturating_sub(last) > bound;

        let (tcp, udp, associate) = {
            let mut maps = self.lock();

            let tcp: Vec<FlowKey> = maps
                .tcp
                .values()
                .filter(|flow| {
                    let bound = if flow.state() == TcpState::TimeWait {
                        time_wait
                    } else {
                        idle
                    };
                    expired(flow.last_activity(), bound)
                })
                .map(|flow| flow.key)
                .collect();
            let udp: Vec<FlowKey> = maps
                .udp
                .values()
                .filter(|flow| expired(flow.last_activity(), idle))
                .map(|flow| flow.key)
                .collect();
            let associate: Vec<FlowKey> = maps
                .associate
                .values()
                .filter(|flow| expired(flow.last_activity(), idle))
                .map(|flow| flow.key)
                .collect();

            let tcp: Vec<_> = tcp.iter().filter_map(|k| maps.tcp.remove(k)).collect();
            let udp: Vec<_> = udp.iter().filter_map(|k| maps.udp.remove(k)).collect();
            let associate: Vec<_> = associate
                .iter()
                .filter_map(|k| maps.associate.remove(k))
                .collect();

            (tcp, udp, associate)
        };

        let removed = tcp.len() + udp.len() + associate.len();

        self.counters.tcp_active.fetch_sub(tcp.len() as u64, Ordering::Relaxed);
        self.counters.udp_active.fetch_sub(udp.len() as u64, Ordering::Relaxed);
        self.counters
            .associate_active
            .fetch_sub(associate.len() as u64, Ordering::Relaxed);

        for flow in &tcp {
            flow.release();
            debug!(flow = %flow.key, "idle tcp flow evicted");
        }
        for flow in &associate {
            flow.release();
            debug!(flow = %flow.key, "idle udp associate flow evicted");
        }

        removed
    }

    /// Unconditional eviction of every flow; used on shutdown.
    pub fn close_all(&self) -> usize {
        let (tcp, udp, associate) = {
            let mut maps = self.lock();
            (
                std::mem::take(&mut maps.tcp),
                std::mem::take(&mut maps.udp),
                std::mem::take(&mut maps.associate),
            )
        };

        let removed = tcp.len() + udp.len() + associate.len();

        self.counters.tcp_active.fetch_sub(tcp.len() as u64, Ordering::Relaxed);
        self.counters.udp_active.fetch_sub(udp.len() as u64, Ordering::Relaxed);
        self.counters
            .associate_active
            .fetch_sub(associate.len() as u64, Ordering::Relaxed);

        for flow in tcp.values() {
            flow.release();
        }
        for flow in associate.values() {
            flow.release();
        }

        removed
    }
}
