use crate::{Error, ProtocolError};
use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::Cursor,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4},
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A SOCKS5 address field (ATYP + ADDR + PORT).
///
/// Requests emitted by this crate always carry the IPv4 form; replies from a
/// server may carry any of the three RFC 1928 forms, so all of them parse.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainAddress(String, u16),
}

impl Address {
    const ATYP_IPV4: u8 = 0x01;
    const ATYP_FQDN: u8 = 0x03;
    const ATYP_IPV6: u8 = 0x04;

    /// `0.0.0.0:0`, the client-bind placeholder of an ASSOCIATE request.
    pub fn unspecified() -> Self {
        Address::SocketAddress(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    /// The IPv4 socket address, if this is one.
    pub fn as_socket_v4(&self) -> Option<SocketAddrV4> {
        match self {
            Address::SocketAddress(SocketAddr::V4(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;

        match atyp {
            Self::ATYP_IPV4 => {
                let mut buf = [0; 6];
                r.read_exact(&mut buf).await?;

                let addr = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = ReadBytesExt::read_u16::<BigEndian>(&mut Cursor::new(&buf[4..]))
                    .map_err(Error::Io)?;

                Ok(Self::SocketAddress(SocketAddr::from((addr, port))))
            }
            Self::ATYP_FQDN => {
                let len = usize::from(r.read_u8().await?);

                let mut buf = vec![0; len + 2];
                r.read_exact(&mut buf).await?;

                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                buf.truncate(len);

                let domain = String::from_utf8(buf)
                    .map_err(|_| ProtocolError::InvalidAddressType { address_type: atyp })?;

                Ok(Self::DomainAddress(domain, port))
            }
            Self::ATYP_IPV6 => {
                let mut buf = [0; 18];
                r.read_exact(&mut buf).await?;

                let mut octets = [0; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);

                Ok(Self::SocketAddress(SocketAddr::from((
                    Ipv6Addr::from(octets),
                    port,
                ))))
            }
            address_type => Err(Error::Protocol(ProtocolError::InvalidAddressType {
                address_type,
            })),
        }
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::SocketAddress(SocketAddr::V4(addr)) => {
                buf.put_u8(Self::ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::SocketAddress(SocketAddr::V6(addr)) => {
                buf.put_u8(Self::ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Self::DomainAddress(domain, port) => {
                buf.put_u8(Self::ATYP_FQDN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    pub fn serialized_len(&self) -> usize {
        1 + match self {
            Address::SocketAddress(SocketAddr::V4(_)) => 6,
            Address::SocketAddress(SocketAddr::V6(_)) => 18,
            Address::DomainAddress(domain, _) => 1 + domain.len() + 2,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Address::DomainAddress(domain, port) => write!(f, "{domain}:{port}"),
            Address::SocketAddress(addr) => write!(f, "{addr}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::SocketAddress(addr)
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Address::SocketAddress(SocketAddr::V4(addr))
    }
}

impl From<(Ipv4Addr, u16)> for Address {
    fn from((addr, port): (Ipv4Addr, u16)) -> Self {
        Address::SocketAddress(SocketAddr::from((addr, port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[tokio::test]
    async fn ipv4_round_trip() {
        let addr = Address::from((Ipv4Addr::new(93, 184, 216, 34), 80));

        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);
        assert_eq!(&buf[..], &[0x01, 93, 184, 216, 34, 0x00, 0x50]);
        assert_eq!(buf.len(), addr.serialized_len());

        let parsed = Address::read_from(&mut Cursor::new(&buf[..])).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let err = Address::read_from(&mut Cursor::new(&[0x05, 0, 0][..]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidAddressType { address_type: 0x05 })
        ));
    }

    #[tokio::test]
    async fn parses_ipv6_reply_address() {
        let mut raw = vec![0x04];
        raw.extend_from_slice(&[0; 16]);
        raw.extend_from_slice(&9000u16.to_be_bytes());

        let parsed = Address::read_from(&mut Cursor::new(&raw[..])).await.unwrap();
        assert_eq!(parsed.as_socket_v4(), None);
    }
}
