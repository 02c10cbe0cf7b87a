//! Method negotiation, from the client's side: the greeting is written, the
//! method selection is read back.

use crate::{Error, ProtocolError};
use bytes::{BufMut, BytesMut};
use std::io::Error as IoError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// An authentication method code.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Method(pub u8);

#[allow(non_upper_case_globals)]
impl Method {
    pub const None: Self = Self(0x00);
    pub const Unacceptable: Self = Self(0xFF);
}

/// SOCKS5 handshake request
///
/// ```plain
/// +-----+----------+----------+
/// | VER | NMETHODS | METHODS  |
/// +-----+----------+----------+
/// |  1  |    1     | 1 to 255 |
/// +-----+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<Method>,
}

impl HandshakeRequest {
    pub const fn new(methods: Vec<Method>) -> Self {
        Self { methods }
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), IoError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(crate::SOCKS_VERSION);
        buf.put_u8(self.methods.len() as u8);

        for method in &self.methods {
            buf.put_u8(method.0);
        }
    }

    pub fn serialized_len(&self) -> usize {
        1 + 1 + self.methods.len()
    }
}

/// SOCKS5 handshake response
///
/// ```plain
/// +-----+--------+
/// | VER | METHOD |
/// +-----+--------+
/// |  1  |   1    |
/// +-----+--------+
/// ```
#[derive(Clone, Copy, Debug)]
pub struct HandshakeResponse {
    pub method: Method,
}

impl HandshakeResponse {
    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;

        if version != crate::SOCKS_VERSION {
            return Err(Error::Protocol(ProtocolError::ProtocolVersion { version }));
        }

        let method = Method(r.read_u8().await?);

        Ok(Self { method })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn greeting_bytes() {
        let mut buf = BytesMut::new();
        HandshakeRequest::new(vec![Method::None]).write_to_buf(&mut buf);
        assert_eq!(&buf[..], &[0x05, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn reads_method_selection() {
        let resp = HandshakeResponse::read_from(&mut Cursor::new(&[0x05, 0x00][..]))
            .await
            .unwrap();
        assert_eq!(resp.method, Method::None);
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let err = HandshakeResponse::read_from(&mut Cursor::new(&[0x04, 0x00][..]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ProtocolVersion { version: 0x04 })
        ));
    }
}
