//! Error types for the router

use std::io::Error as IoError;
use thiserror::Error;
use tunsocks_proto::socks::Reply;

/// Failures of the upstream SOCKS5 conversation or of flow I/O.
///
/// None of these ever propagate out of the routing loop; they decide what to
/// synthesize on the TUN side (a RST, silence) and what to log.
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered the request with a non-zero REP code.
    #[error("SOCKS5 request rejected: {0}")]
    Rejected(Reply),

    /// The server broke the protocol: wrong version, short read, or an
    /// address type this client cannot use.
    #[error("SOCKS5 protocol violation: {0}")]
    Protocol(#[from] tunsocks_proto::ProtocolError),

    /// The server's ASSOCIATE reply carried a relay endpoint that is not an
    /// IPv4 socket address.
    #[error("unusable relay endpoint in ASSOCIATE reply")]
    RelayEndpoint,

    /// The handshake did not complete within its deadline.
    #[error("SOCKS5 handshake timed out")]
    HandshakeTimeout,

    #[error(transparent)]
    Io(#[from] IoError),
}

impl From<tunsocks_proto::Error> for Error {
    fn from(err: tunsocks_proto::Error) -> Self {
        match err {
            tunsocks_proto::Error::Protocol(err) => Error::Protocol(err),
            tunsocks_proto::Error::Io(err) => Error::Io(err),
        }
    }
}
