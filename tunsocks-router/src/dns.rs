//! The DNS fast path.
//!
//! Port-53 queries are answered from the host resolver instead of being
//! relayed, because a typical SSH-hosted upstream has no usable UDP
//! ASSOCIATE. The answer is synthesized directly from the query: the
//! question section is echoed verbatim and each resolved address becomes
//! one answer record pointing back at it.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::{io::Result as IoResult, net::IpAddr};
use tokio::net::lookup_host;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;

/// QR=1, RD=1, RA=1, RCODE=0.
const RESPONSE_FLAGS: u16 = 0x8180;
/// A compression pointer to the qname at the fixed question offset.
const NAME_POINTER: u16 = 0xC00C;
const CLASS_IN: u16 = 1;
const TTL: u32 = 60;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;

/// The parts of a query needed to synthesize its response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question<'a> {
    pub id: u16,
    pub qname: String,
    pub qtype: u16,
    /// The question section, byte for byte.
    pub question: &'a [u8],
}

/// Parses the transaction id and the first question of a DNS query.
///
/// The qname must be a plain run of length-prefixed labels terminated by a
/// zero byte; anything truncated, over-long or using compression pointers
/// is rejected.
pub fn parse_query(payload: &[u8]) -> Option<Question<'_>> {
    if payload.len() < HEADER_LEN {
        return None;
    }

    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);

    if qdcount == 0 {
        return None;
    }

    let mut labels = Vec::new();
    let mut idx = HEADER_LEN;

    loop {
        let len = usize::from(*payload.get(idx)?);
        idx += 1;

        if len == 0 {
            break;
        }

        if len > MAX_LABEL_LEN || idx + len > payload.len() {
            return None;
        }

        labels.push(std::str::from_utf8(&payload[idx..idx + len]).ok()?);
        idx += len;
    }

    if labels.is_empty() {
        return None;
    }

    let qtype_end = idx + 4;
    let question = payload.get(HEADER_LEN..qtype_end)?;
    let qtype = u16::from_be_bytes([payload[idx], payload[idx + 1]]);

    Some(Question {
        id: u16::from_be_bytes([payload[0], payload[1]]),
        qname: labels.join("."),
        qtype,
        question,
    })
}

/// Builds the response payload for `question` from the resolved addresses.
///
/// Addresses of the wrong family for the query type are skipped; an empty
/// answer set yields a well-formed response with answer count zero.
pub fn build_response(question: &Question<'_>, addrs: &[IpAddr]) -> BytesMut {
    let answers: Vec<&IpAddr> = addrs
        .iter()
        .filter(|addr| match question.qtype {
            QTYPE_A => addr.is_ipv4(),
            QTYPE_AAAA => addr.is_ipv6(),
            _ => false,
        })
        .collect();

    let mut buf = BytesMut::with_capacity(HEADER_LEN + question.question.len() + answers.len() * 28);

    buf.put_u16(question.id);
    buf.put_u16(RESPONSE_FLAGS);
    buf.put_u16(1);
    buf.put_u16(answers.len() as u16);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_slice(question.question);

    for addr in answers {
        buf.put_u16(NAME_POINTER);
        buf.put_u16(question.qtype);
        buf.put_u16(CLASS_IN);
        buf.put_u32(TTL);

        match addr {
            IpAddr::V4(addr) => {
                buf.put_u16(4);
                buf.put_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_u16(16);
                buf.put_slice(&addr.octets());
            }
        }
    }

    buf
}

/// The host resolver collaborator.
///
/// The router never resolves names itself; it asks this seam, which tests
/// replace with a canned implementation.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> IoResult<Vec<IpAddr>>;
}

/// Resolves through the operating system, like any other process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, name: &str) -> IoResult<Vec<IpAddr>> {
        Ok(lookup_host((name, 0)).await?.map(|addr| addr.ip()).collect())
    }
}
