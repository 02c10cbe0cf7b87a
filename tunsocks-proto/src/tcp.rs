use crate::{checksum, ipv4};
use bytes::{BufMut, BytesMut};
use std::{net::SocketAddrV4, ops::BitOr};

const MIN_HEADER_LEN: usize = 20;

/// The six flag bits of the thirteenth header byte.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct TcpFlags(pub u8);

#[allow(non_upper_case_globals)]
impl TcpFlags {
    pub const Fin: Self = Self(0x01);
    pub const Syn: Self = Self(0x02);
    pub const Rst: Self = Self(0x04);
    pub const Psh: Self = Self(0x08);
    pub const Ack: Self = Self(0x10);
    pub const Urg: Self = Self(0x20);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<u8> for TcpFlags {
    fn from(bits: u8) -> Self {
        Self(bits & 0x3F)
    }
}

impl From<TcpFlags> for u8 {
    fn from(flags: TcpFlags) -> Self {
        flags.0
    }
}

/// Parsed TCP header
///
/// ```plain
/// +-------------------------------+-------------------------------+
/// |          Source Port          |       Destination Port        |
/// +-------------------------------+-------------------------------+
/// |                        Sequence Number                        |
/// +---------------------------------------------------------------+
/// |                    Acknowledgment Number                      |
/// +-------+-----------+-----------+-------------------------------+
/// |  Data | Reserved  |U|A|P|R|S|F|            Window             |
/// | Offset|           |R|C|S|S|Y|I|                               |
/// +-------+-----------+-----------+-------------------------------+
/// |           Checksum            |        Urgent Pointer         |
/// +-------------------------------+-------------------------------+
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, within `[20, 60]`.
    pub data_offset: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    /// Parses the TCP header of an IPv4 `packet` whose IP header spans
    /// `ip_header_len` bytes.
    pub fn parse(packet: &[u8], ip_header_len: usize) -> Option<Self> {
        let segment = packet.get(ip_header_len..)?;

        if segment.len() < MIN_HEADER_LEN {
            return None;
        }

        let data_offset = usize::from(segment[12] >> 4) * 4;

        if data_offset < MIN_HEADER_LEN || data_offset > segment.len() {
            return None;
        }

        Some(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            data_offset,
            flags: TcpFlags::from(segment[13]),
            window: u16::from_be_bytes([segment[14], segment[15]]),
            checksum: u16::from_be_bytes([segment[16], segment[17]]),
            urgent: u16::from_be_bytes([segment[18], segment[19]]),
        })
    }
}

/// Advances a sequence number by `n`, wrapping at 2³².
pub const fn advance(seq: u32, n: u32) -> u32 {
    seq.wrapping_add(n)
}

/// A synthetic TCP segment to be emitted as a complete IPv4 packet.
///
/// The emitted packet carries a 20-byte IPv4 header and a 20-byte TCP header
/// (data offset 5, no options). The TCP checksum covers the pseudo-header,
/// the header and the payload.
#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn encode(&self) -> BytesMut {
        let segment_len = MIN_HEADER_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(20 + segment_len);

        ipv4::put_header(
            &mut buf,
            ipv4::PROTOCOL_TCP,
            *self.source.ip(),
            *self.destination.ip(),
            segment_len,
        );

        let mut header = [0u8; MIN_HEADER_LEN];
        header[0..2].copy_from_slice(&self.source.port().to_be_bytes());
        header[2..4].copy_from_slice(&self.destination.port().to_be_bytes());
        header[4..8].copy_from_slice(&self.seq.to_be_bytes());
        header[8..12].copy_from_slice(&self.ack.to_be_bytes());
        header[12] = 5 << 4;
        header[13] = u8::from(self.flags);
        header[14..16].copy_from_slice(&self.window.to_be_bytes());

        let mut sum = checksum::pseudo_header_sum(
            *self.source.ip(),
            *self.destination.ip(),
            ipv4::PROTOCOL_TCP,
            segment_len as u16,
        );
        sum = checksum::sum_words(sum, &header);
        sum = checksum::sum_words(sum, self.payload);
        header[16..18].copy_from_slice(&checksum::finish(sum).to_be_bytes());

        buf.put_slice(&header);
        buf.put_slice(self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{checksum, Ipv4Header};
    use std::net::Ipv4Addr;

    fn segment() -> BytesMut {
        TcpSegment {
            source: SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80),
            destination: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
            seq: 0xFFFF_FFFE,
            ack: 1001,
            flags: TcpFlags::Psh | TcpFlags::Ack,
            window: 65535,
            payload: b"HTTP/",
        }
        .encode()
    }

    #[test]
    fn encoded_segment_parses_back() {
        let packet = segment();
        let ip = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(ip.protocol, ipv4::PROTOCOL_TCP);
        assert_eq!(ip.total_len, 45);

        let tcp = TcpHeader::parse(&packet, ip.header_len).unwrap();
        assert_eq!(tcp.src_port, 80);
        assert_eq!(tcp.dst_port, 40000);
        assert_eq!(tcp.seq, 0xFFFF_FFFE);
        assert_eq!(tcp.ack, 1001);
        assert_eq!(tcp.data_offset, 20);
        assert_eq!(tcp.flags, TcpFlags::Psh | TcpFlags::Ack);
        assert_eq!(tcp.window, 65535);
        assert_eq!(&packet[ip.header_len + tcp.data_offset..], b"HTTP/");
    }

    #[test]
    fn transport_checksum_verifies_with_pseudo_header() {
        let packet = segment();
        let ip = Ipv4Header::parse(&packet).unwrap();

        let sum = checksum::pseudo_header_sum(
            ip.source,
            ip.destination,
            ip.protocol,
            (ip.total_len - ip.header_len) as u16,
        );
        assert_eq!(checksum::finish(checksum::sum_words(sum, &packet[ip.header_len..])), 0);
    }

    #[test]
    fn rejects_truncated_header() {
        let mut packet = segment().to_vec();
        packet.truncate(20 + 12);
        assert_eq!(TcpHeader::parse(&packet, 20), None);
    }

    #[test]
    fn rejects_data_offset_beyond_segment() {
        let mut packet = segment().to_vec();
        packet.truncate(40);
        packet[32] = 0xF0; // claims a 60-byte header in a 20-byte segment
        assert_eq!(TcpHeader::parse(&packet, 20), None);
    }

    #[test]
    fn flags_come_from_low_six_bits() {
        let flags = TcpFlags::from(0xFF);
        assert_eq!(u8::from(flags), 0x3F);
        assert!(flags.contains(TcpFlags::Fin));
        assert!(flags.contains(TcpFlags::Urg));
    }

    #[test]
    fn sequence_arithmetic_wraps() {
        assert_eq!(advance(0xFFFF_FFFF, 2), 1);
        assert_eq!(advance(1000, 18), 1018);
    }
}
