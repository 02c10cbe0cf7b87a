use super::{Address, Reply};
use crate::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SOCKS5 response
///
/// ```plain
/// +-----+-----+-------+------+----------+----------+
/// | VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +-----+-----+-------+------+----------+----------+
/// |  1  |  1  | X'00' |  1   | Variable |    2     |
/// +-----+-----+-------+------+----------+----------+
/// ```
///
/// This is the client side; responses are only ever read.
#[derive(Clone, Debug)]
pub struct Response {
    pub reply: Reply,
    pub address: Address,
}

impl Response {
    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let version = r.read_u8().await?;

        if version != crate::SOCKS_VERSION {
            return Err(Error::Protocol(
                crate::ProtocolError::ProtocolVersion { version },
            ));
        }

        let reply = Reply::try_from(r.read_u8().await?)?;

        // RSV, ignored.
        r.read_u8().await?;

        let address = Address::read_from(r).await?;

        Ok(Self { reply, address })
    }
}
