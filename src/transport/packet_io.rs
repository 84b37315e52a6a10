//! Packet I/O over split stream halves
//!
//! The reader keeps a growing buffer and decodes whole packets out of it,
//! so partial reads and several packets arriving in one read are handled
//! the same way. `read_packet` only awaits `read_buf`, which makes it safe
//! to use as a `tokio::select!` branch.

use crate::constants::defaults::READ_BUFFER_SIZE;
use crate::error::{MqttError, Result};
use crate::packet::{decode_packet, encode_packet, Packet};
use crate::protocol::ProtocolVersion;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Decodes packets from the read half of a stream
#[derive(Debug)]
pub struct PacketReader<R> {
    inner: R,
    buffer: BytesMut,
    version: ProtocolVersion,
    max_packet_size: usize,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// `version` is used until the CONNECT has been decoded; CONNECT itself
    /// carries its own revision
    pub fn new(inner: R, version: ProtocolVersion, max_packet_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            version,
            max_packet_size,
        }
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    #[must_use]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Bytes received but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Reads the next complete packet
    ///
    /// Returns `Ok(None)` when the peer closed the stream between packets.
    ///
    /// # Errors
    ///
    /// Codec errors from [`decode_packet`], `Io` for transport failures and
    /// for a stream that ends in the middle of a packet
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some((packet, consumed)) =
                decode_packet(&self.buffer, self.version, self.max_packet_size)?
            {
                self.buffer.advance(consumed);
                return Ok(Some(packet));
            }

            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(MqttError::Io(format!(
                    "stream closed with {} bytes of a partial packet",
                    self.buffer.len()
                )));
            }
        }
    }
}

/// Encodes packets onto the write half of a stream
#[derive(Debug)]
pub struct PacketWriter<W> {
    inner: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
        }
    }

    /// Encodes and flushes one packet
    ///
    /// Nothing is written when encoding fails.
    ///
    /// # Errors
    ///
    /// Encoding errors from [`encode_packet`] and `Io` write failures
    pub async fn write_packet(&mut self, packet: &Packet, version: ProtocolVersion) -> Result<()> {
        self.buffer.clear();
        encode_packet(packet, version, &mut self.buffer)?;
        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// `Io` if the shutdown fails
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
