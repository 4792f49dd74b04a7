use crate::prelude::*;

use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Decoder;

const WRITE_TIMEOUT_SECS: u64 = 5;
const READ_BUFFER_SIZE: usize = 4096;
const MAX_BUFFER_SIZE: usize = 65536;

pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Opens the byte stream a device talks over.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ByteStream>>;

    fn describe(&self) -> String;
}

// {{{ SerialConnector
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> Result<Box<dyn ByteStream>> {
        let stream = tokio_serial::new(&self.port, self.baud_rate)
            .open_native_async()
            .map_err(|e| anyhow!("failed to open {}: {}", self.port, e))?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }
} // }}}

/// An open link to a device plus whatever bytes have been read but not yet
/// consumed by a decoder.
pub struct Wire {
    stream: Box<dyn ByteStream>,
    buffer: BytesMut,
}

impl Wire {
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match tokio::time::timeout(
            Duration::from_secs(WRITE_TIMEOUT_SECS),
            self.stream.write_all(bytes),
        )
        .await
        {
            Ok(Ok(_)) => {
                self.stream.flush().await?;
                Ok(())
            }
            Ok(Err(e)) => bail!("write failed: {}", e),
            Err(_) => bail!("write timeout after {} seconds", WRITE_TIMEOUT_SECS),
        }
    }

    /// Reads whatever is available within `timeout`. `Ok(None)` means nothing
    /// arrived in time; end-of-stream is an error.
    pub async fn fill(&mut self, timeout: Duration) -> Result<Option<usize>> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            bail!(
                "buffer overflow: {} unconsumed bytes exceeds {}",
                self.buffer.len(),
                MAX_BUFFER_SIZE
            );
        }

        match tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buffer)).await {
            Ok(Ok(0)) => bail!("connection closed by peer"),
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => bail!("read error: {}", e),
            Err(_) => Ok(None),
        }
    }

    /// Feeds buffered bytes to `decoder`, reading more until it yields an item
    /// or `timeout` passes without one.
    pub async fn read_frame<D>(&mut self, decoder: &mut D, timeout: Duration) -> Result<Option<D::Item>>
    where
        D: Decoder,
        D::Error: Into<anyhow::Error>,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(item) = decoder.decode(&mut self.buffer).map_err(Into::into)? {
                return Ok(Some(item));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if self.fill(remaining).await?.is_none() {
                return Ok(None);
            }
        }
    }

    /// Drops unconsumed bytes along with anything still arriving, until the
    /// line has been quiet for `quiet` or `limit` has passed. Returns how many
    /// bytes were dropped.
    pub async fn drain(&mut self, quiet: Duration, limit: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + limit;
        let mut dropped = self.buffer.len();
        self.buffer.clear();

        while tokio::time::Instant::now() < deadline {
            match self.fill(quiet).await? {
                Some(n) => {
                    dropped += n;
                    self.buffer.clear();
                }
                None => break,
            }
        }

        Ok(dropped)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("error closing stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_drops_late_bytes() -> Result<()> {
        let (near, mut far) = tokio::io::duplex(256);
        let mut wire = Wire::new(Box::new(near));

        far.write_all(b"(late answer\r").await?;
        let dropped = wire
            .drain(Duration::from_millis(50), Duration::from_secs(1))
            .await?;
        assert_eq!(dropped, 13);

        // only what arrives afterwards is read
        far.write_all(b"(NAK").await?;
        wire.fill(Duration::from_secs(1)).await?;
        assert_eq!(&wire.buffer[..], b"(NAK");
        Ok(())
    }
}
