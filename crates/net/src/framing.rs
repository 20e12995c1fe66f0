//! Frame reader: turns a byte stream into decoded packets.
//!
//! Each frame is a header byte, an optional sub-header, the fixed fields and,
//! for dynamic packets, a payload plus NUL terminator. Sequenced packets are
//! followed by one more byte, which is consumed lazily at the start of the
//! next read so the packet is handed out before its trailer arrives.

use crate::error::FrameError;
use crate::packet::AnyPacket;
use crate::registry::{HeaderKey, PacketRegistry};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Default read buffer size, the largest frame accepted.
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// Reads complete frames from `R` and decodes them through the registry.
pub struct FrameReader<R> {
    reader: R,
    registry: Arc<PacketRegistry>,
    buffer: Vec<u8>,
    pending_sequence: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader` with a read buffer of `capacity` bytes.
    pub fn new(reader: R, registry: Arc<PacketRegistry>, capacity: usize) -> Self {
        Self {
            reader,
            registry,
            buffer: vec![0; capacity],
            pending_sequence: false,
        }
    }

    fn ensure_capacity(&self, key: HeaderKey, required: usize) -> Result<(), FrameError> {
        if required > self.buffer.len() {
            return Err(FrameError::BufferTooSmall {
                key,
                required,
                capacity: self.buffer.len(),
            });
        }
        Ok(())
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` when the peer closes the stream between frames. A
    /// stream that ends mid-frame is an I/O error.
    pub async fn next_packet(&mut self) -> Result<Option<Box<dyn AnyPacket>>, FrameError> {
        if self.pending_sequence {
            let mut sequence = [0u8; 1];
            match self.reader.read_exact(&mut sequence).await {
                Ok(_) => trace!(sequence = sequence[0], "consumed sequence byte"),
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(err) => return Err(err.into()),
            }
            self.pending_sequence = false;
        }

        let mut header = [0u8; 1];
        if self.reader.read(&mut header).await? == 0 {
            return Ok(None);
        }
        let header = header[0];
        let registry = Arc::clone(&self.registry);

        let (info, mut filled) = match registry.sub_header_offset(header) {
            Some(offset) => {
                let prefix = offset + 1;
                self.ensure_capacity(HeaderKey::plain(header), prefix)?;
                self.buffer[0] = header;
                self.reader.read_exact(&mut self.buffer[1..prefix]).await?;
                let key = HeaderKey::new(header, Some(self.buffer[offset]));
                let info = registry
                    .get(key)
                    .ok_or(FrameError::UnknownHeader { key })?;
                (info, prefix)
            }
            None => {
                let key = HeaderKey::plain(header);
                let info = registry
                    .get(key)
                    .ok_or(FrameError::UnknownHeader { key })?;
                self.ensure_capacity(key, 1)?;
                self.buffer[0] = header;
                (info, 1)
            }
        };

        let shape = info.shape;
        let fixed = shape.fixed_size;
        self.ensure_capacity(info.key, fixed)?;
        self.reader
            .read_exact(&mut self.buffer[filled..fixed])
            .await?;
        filled = fixed;

        if let Some(dynamic) = shape.dynamic {
            let at = dynamic.size_offset;
            let size = u16::from_le_bytes([self.buffer[at], self.buffer[at + 1]]);
            let tail = shape.tail_len(size).map_err(|source| FrameError::Decode {
                key: info.key,
                source,
            })?;
            let total = fixed + tail + 1;
            self.ensure_capacity(info.key, total)?;
            self.reader
                .read_exact(&mut self.buffer[fixed..total])
                .await?;
            filled = total;
        }

        let packet = info
            .decode(&self.buffer[..filled])
            .map_err(|source| FrameError::Decode {
                key: info.key,
                source,
            })?;
        self.pending_sequence = shape.has_sequence_byte;
        trace!(packet = info.name, len = filled, "decoded frame");
        Ok(Some(packet))
    }
}
