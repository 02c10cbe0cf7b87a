//! Error types for the SOCKS5 client protocol

use std::io::{Error as IoError, ErrorKind};
use thiserror::Error;

/// Errors that may occur while parsing data received from a SOCKS5 server.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported SOCKS version {version:#04x}")]
    ProtocolVersion { version: u8 },

    #[error("server chose unacceptable handshake method {method:#04x}")]
    UnacceptableHandshakeMethod { method: u8 },

    #[error("unsupported reply code {reply:#04x}")]
    InvalidReply { reply: u8 },

    #[error("unsupported address type {address_type:#04x}")]
    InvalidAddressType { address_type: u8 },

    #[error("non-zero reserved bytes in UDP relay header")]
    ReservedBytesInUdpHeader,

    #[error("fragmented UDP relay packet (frag {frag:#04x})")]
    FragmentedUdpPacket { frag: u8 },
}

impl From<ProtocolError> for IoError {
    fn from(err: ProtocolError) -> Self {
        IoError::new(ErrorKind::InvalidData, err)
    }
}

/// Converging error types
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] IoError),
}

impl From<Error> for IoError {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err => IoError::new(ErrorKind::Other, err),
        }
    }
}
