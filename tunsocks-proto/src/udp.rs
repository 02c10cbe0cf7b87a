use crate::{checksum, ipv4};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;

const HEADER_LEN: usize = 8;

/// Parsed UDP header
///
/// ```plain
/// +-------------------------------+-------------------------------+
/// |          Source Port          |       Destination Port        |
/// +-------------------------------+-------------------------------+
/// |            Length             |           Checksum            |
/// +-------------------------------+-------------------------------+
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Datagram length in bytes, the 8-byte header included.
    pub length: usize,
    pub checksum: u16,
}

impl UdpHeader {
    /// Parses the UDP header of an IPv4 `packet` whose IP header spans
    /// `ip_header_len` bytes.
    pub fn parse(packet: &[u8], ip_header_len: usize) -> Option<Self> {
        let datagram = packet.get(ip_header_len..)?;

        if datagram.len() < HEADER_LEN {
            return None;
        }

        let length = usize::from(u16::from_be_bytes([datagram[4], datagram[5]]));

        if length < HEADER_LEN || length > datagram.len() {
            return None;
        }

        Some(Self {
            src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
            dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
            length,
            checksum: u16::from_be_bytes([datagram[6], datagram[7]]),
        })
    }
}

/// A synthetic UDP datagram to be emitted as a complete IPv4 packet.
#[derive(Clone, Copy, Debug)]
pub struct UdpDatagram<'a> {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub payload: &'a [u8],
}

impl UdpDatagram<'_> {
    pub fn encode(&self) -> BytesMut {
        let datagram_len = HEADER_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(20 + datagram_len);

        ipv4::put_header(
            &mut buf,
            ipv4::PROTOCOL_UDP,
            *self.source.ip(),
            *self.destination.ip(),
            datagram_len,
        );

        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&self.source.port().to_be_bytes());
        header[2..4].copy_from_slice(&self.destination.port().to_be_bytes());
        header[4..6].copy_from_slice(&(datagram_len as u16).to_be_bytes());

        let mut sum = checksum::pseudo_header_sum(
            *self.source.ip(),
            *self.destination.ip(),
            ipv4::PROTOCOL_UDP,
            datagram_len as u16,
        );
        sum = checksum::sum_words(sum, &header);
        sum = checksum::sum_words(sum, self.payload);

        // A computed zero is transmitted as all-ones; zero means "no checksum".
        let transport_sum = match checksum::finish(sum) {
            0 => 0xFFFF,
            sum => sum,
        };
        header[6..8].copy_from_slice(&transport_sum.to_be_bytes());

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

    fn datagram() -> BytesMut {
        UdpDatagram {
            source: SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            destination: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 50123),
            payload: b"\x12\x34response",
        }
        .encode()
    }

    #[test]
    fn encoded_datagram_parses_back() {
        let packet = datagram();
        let ip = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(ip.protocol, ipv4::PROTOCOL_UDP);

        let udp = UdpHeader::parse(&packet, ip.header_len).unwrap();
        assert_eq!(udp.src_port, 53);
        assert_eq!(udp.dst_port, 50123);
        assert_eq!(udp.length, 8 + 10);
        assert_eq!(&packet[ip.header_len + HEADER_LEN..], b"\x12\x34response");
    }

    #[test]
    fn transport_checksum_verifies_with_pseudo_header() {
        let packet = datagram();
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
    fn rejects_length_below_header() {
        let mut packet = datagram().to_vec();
        packet[24..26].copy_from_slice(&7u16.to_be_bytes());
        assert_eq!(UdpHeader::parse(&packet, 20), None);
    }

    #[test]
    fn rejects_length_beyond_buffer() {
        let mut packet = datagram().to_vec();
        packet[24..26].copy_from_slice(&1000u16.to_be_bytes());
        assert_eq!(UdpHeader::parse(&packet, 20), None);
    }

    #[test]
    fn rejects_truncated_datagram() {
        let packet = datagram();
        assert_eq!(UdpHeader::parse(&packet[..26], 20), None);
    }
}
