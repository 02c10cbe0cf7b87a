use std::io::Result as IoResult;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

/// The writable side of the TUN descriptor.
///
/// Writes are serialized behind an async mutex so that packets emitted by
/// concurrent flow tasks are never interleaved; each packet is flushed
/// before the lock is released.
pub struct TunSink<W> {
    inner: Mutex<W>,
}

impl<W> TunSink<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(writer),
        }
    }

    /// Writes one complete IPv4 packet.
    pub async fn write_packet(&self, packet: &[u8]) -> IoResult<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(packet).await?;
        writer.flush().await
    }
}
