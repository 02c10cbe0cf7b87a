use super::Address;
use crate::{Error, ProtocolError};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SOCKS5 UDP relay header
///
/// ```plain
/// +-----+------+------+----------+----------+----------+
/// | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +-----+------+------+----------+----------+----------+
/// |  2  |  1   |  1   | Variable |    2     | Variable |
/// +-----+------+------+----------+----------+----------+
/// ```
///
/// Every datagram exchanged with the relay is prefixed with this header.
/// Fragmented packets (FRAG != 0) are not supported and are rejected.
#[derive(Clone, Debug)]
pub struct RelayHeader {
    pub address: Address,
}

impl RelayHeader {
    /// The shortest well-formed relay packet: header with an IPv4 address.
    pub const MIN_LEN: usize = 2 + 1 + 1 + 4 + 2;

    pub const fn new(address: Address) -> Self {
        Self { address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut rsv = [0; 2];
        r.read_exact(&mut rsv).await?;

        if rsv != [0, 0] {
            return Err(Error::Protocol(ProtocolError::ReservedBytesInUdpHeader));
        }

        let frag = r.read_u8().await?;

        if frag != 0 {
            return Err(Error::Protocol(ProtocolError::FragmentedUdpPacket { frag }));
        }

        let address = Address::read_from(r).await?;

        Ok(Self::new(address))
    }

    /// Splits a raw relay datagram into its header and payload.
    ///
    /// Packets shorter than [`Self::MIN_LEN`] are rejected before any field
    /// is examined.
    pub async fn decapsulate(datagram: &[u8]) -> Result<(Self, &[u8]), Error> {
        if datagram.len() < Self::MIN_LEN {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "relay datagram shorter than minimum header",
            )));
        }

        let header = Self::read_from(&mut Cursor::new(datagram)).await?;
        let payload = &datagram[header.serialized_len()..];

        Ok((header, payload))
    }

    /// Prefixes `payload` with this header, producing a relay datagram.
    pub fn encapsulate(&self, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.serialized_len() + payload.len());
        self.write_to_buf(&mut buf);
        buf.put_slice(payload);
        buf
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_bytes(0x00, 2);
        buf.put_u8(0x00);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        2 + 1 + self.address.serialized_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn encapsulates_with_ipv4_target() {
        let header = RelayHeader::new(Address::from((Ipv4Addr::new(1, 1, 1, 1), 3478)));
        let datagram = header.encapsulate(b"ping");

        assert_eq!(
            &datagram[..],
            &[0x00, 0x00, 0x00, 0x01, 1, 1, 1, 1, 0x0D, 0x96, b'p', b'i', b'n', b'g']
        );
    }

    #[tokio::test]
    async fn decapsulates_payload() {
        let raw = [0x00, 0x00, 0x00, 0x01, 1, 1, 1, 1, 0x0D, 0x96, 0xAA, 0xBB];
        let (header, payload) = RelayHeader::decapsulate(&raw).await.unwrap();

        assert_eq!(
            header.address.as_socket_v4().unwrap().to_string(),
            "1.1.1.1:3478"
        );
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn rejects_nonzero_reserved_bytes() {
        let raw = [0x00, 0x01, 0x00, 0x01, 1, 1, 1, 1, 0x0D, 0x96];
        let err = RelayHeader::decapsulate(&raw).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ReservedBytesInUdpHeader)
        ));
    }

    #[tokio::test]
    async fn rejects_fragments() {
        let raw = [0x00, 0x00, 0x02, 0x01, 1, 1, 1, 1, 0x0D, 0x96];
        let err = RelayHeader::decapsulate(&raw).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FragmentedUdpPacket { frag: 0x02 })
        ));
    }

    #[tokio::test]
    async fn rejects_short_packets() {
        let raw = [0x00, 0x00, 0x00, 0x01, 1, 1];
        assert!(RelayHeader::decapsulate(&raw).await.is_err());
    }
}
