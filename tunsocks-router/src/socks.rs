//! The two SOCKS5 conversations the router holds with its upstream proxy.
//!
//! Both start with the same greeting offering only the "no authentication"
//! method. The caller owns the stream and applies its own deadline; nothing
//! here retries.

use crate::Error;
use std::net::SocketAddrV4;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;
use tunsocks_proto::{
    socks::{
        Address, Command, HandshakeRequest, HandshakeResponse, Method, Request, Response,
    },
    ProtocolError,
};

async fn negotiate<S>(stream: &mut S) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    HandshakeRequest::new(vec![Method::None])
        .write_to(stream)
        .await?;

    let response = HandshakeResponse::read_from(stream).await?;

    if response.method != Method::None {
        return Err(Error::Protocol(ProtocolError::UnacceptableHandshakeMethod {
            method: response.method.0,
        }));
    }

    Ok(())
}

/// Performs the CONNECT handshake for `target` on a freshly opened stream.
///
/// On success the stream is the relayed TCP connection; the BND fields of
/// the reply are discarded.
pub async fn connect<S>(stream: &mut S, target: SocketAddrV4) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream).await?;

    Request::new(Command::Connect, Address::from(target))
        .write_to(stream)
        .await?;

    let response = Response::read_from(stream).await?;

    if !response.reply.is_succeeded() {
        return Err(Error::Rejected(response.reply));
    }

    trace!(%target, "socks5 connect established");
    Ok(())
}

/// Performs the UDP ASSOCIATE handshake and returns the relay endpoint.
///
/// The stream is the association's control connection: it must be kept open
/// for as long as the relay is in use. A reply whose BND fields are a
/// domain or an IPv6 address is unusable here and fails the setup.
pub async fn associate<S>(stream: &mut S) -> Result<SocketAddrV4, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream).await?;

    Request::new(Command::Associate, Address::unspecified())
        .write_to(stream)
        .await?;

    let response = Response::read_from(stream).await?;

    if !response.reply.is_succeeded() {
        return Err(Error::Rejected(response.reply));
    }

    let relay = response.address.as_socket_v4().ok_or(Error::RelayEndpoint)?;

    trace!(%relay, "socks5 udp association established");
    Ok(relay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tunsocks_proto::socks::Reply;

    #[tokio::test]
    async fn connect_handshake_wire_bytes() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(
                request,
                [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50]
            );
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
        connect(&mut client, target).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_refusal_carries_the_reply_code() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
        let err = connect(&mut client, target).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(Reply::ConnectionRefused)));
    }

    #[tokio::test]
    async fn associate_returns_the_relay_endpoint() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request, [0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
            server
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x23, 0x28])
                .await
                .unwrap();
        });

        let relay = associate(&mut client).await.unwrap();
        assert_eq!(relay, SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000));
    }

    #[tokio::test]
    async fn associate_rejects_domain_relay_endpoint() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[0x05, 0x00, 0x00, 0x03, 5, b'r', b'e', b'l', b'a', b'y', 0x23, 0x28])
                .await
                .unwrap();
        });

        let err = associate(&mut client).await.unwrap_err();
        assert!(matches!(err, Error::RelayEndpoint));
    }

    #[tokio::test]
    async fn wrong_method_selection_fails() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let target = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80);
        let err = connect(&mut client, target).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnacceptableHandshakeMethod { method: 0xFF })
        ));
    }
}
