//! Length-prefixed framing for routine messages
//!
//! A frame is a 4-byte big-endian length followed by the bincode encoding
//! of one [`RoutineMessage`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use crate::config::RoutineConfig;
use crate::continuous::RoutineMessage;
use crate::error::{ContinuumResult, TransportError};

const LENGTH_PREFIX: usize = 4;

/// Encodes and decodes framed routine messages
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn from_config(config: &RoutineConfig) -> Self {
        Self::new(config.max_frame_size)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> ContinuumResult<()> {
        if size > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        Ok(())
    }

    /// Encode one message into a complete frame
    pub fn encode(&self, message: &RoutineMessage) -> ContinuumResult<Bytes> {
        let payload = bincode::serialize(message)?;
        self.check_size(payload.len())?;
        let length = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        frame.put_u32(length);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Take one frame off the front of `buffer`.
    ///
    /// Returns `None` while the buffer holds less than a whole frame; the
    /// partial data is left in place for the next call.
    pub fn decode(&self, buffer: &mut BytesMut) -> ContinuumResult<Option<RoutineMessage>> {
        if buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&buffer[..LENGTH_PREFIX]);
        let size = u32::from_be_bytes(prefix) as usize;
        self.check_size(size)?;

        if buffer.len() < LENGTH_PREFIX + size {
            buffer.reserve(LENGTH_PREFIX + size - buffer.len());
            return Ok(None);
        }

        buffer.advance(LENGTH_PREFIX);
        let payload = buffer.split_to(size);
        Ok(Some(bincode::deserialize(&payload)?))
    }

    /// Write one framed message to a stream
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        message: &RoutineMessage,
    ) -> ContinuumResult<()> {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one framed message from a stream; `None` on a clean end of stream
    pub async fn read_message<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
    ) -> ContinuumResult<Option<RoutineMessage>> {
        let size = match reader.read_u32().await {
            Ok(size) => size as usize,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        self.check_size(size)?;

        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).await?;
        Ok(Some(bincode::deserialize(&payload)?))
    }
}
