//! Client-side SOCKS5 protocol types.
//!
//! The router speaks RFC 1928 with the "no authentication" method only, so
//! this module covers exactly what a client needs: writing the greeting and
//! the CONNECT / ASSOCIATE requests, reading the method selection and the
//! response, and framing relay datagrams.

mod address;
mod command;
mod handshake;
mod reply;
mod request;
mod response;
mod udp;

pub use self::{
    address::Address,
    command::Command,
    handshake::{HandshakeRequest, HandshakeResponse, Method},
    reply::Reply,
    request::Request,
    response::Response,
    udp::RelayHeader,
};
