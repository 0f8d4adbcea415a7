//! I/O seams between the converter core and its host environment.
//!
//! The core never opens files or sockets itself: bytes come in through a
//! [`SourceReader`] and go out through an [`OutputWriter`]. In-memory
//! implementations of both are provided for tests and small inputs; file and
//! HTTP-range readers are expected to live in the host.

use async_trait::async_trait;
use bytes::Bytes;

/// Random-access byte source for the demuxers.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Read up to `len` bytes starting at `offset`.
    ///
    /// A read past the end returns the available prefix; a read at or beyond
    /// the end returns an empty buffer. Short reads are not errors.
    async fn read_at(&self, offset: u64, len: u32) -> std::io::Result<Bytes>;

    /// Total size of the source in bytes, when known up front.
    fn size(&self) -> Option<u64>;
}

/// A [`SourceReader`] over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    data: Bytes,
}

impl MemoryReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl SourceReader for MemoryReader {
    async fn read_at(&self, offset: u64, len: u32) -> std::io::Result<Bytes> {
        let total = self.data.len() as u64;
        if offset >= total {
            return Ok(Bytes::new());
        }
        let start = offset as usize;
        let end = (offset + u64::from(len)).min(total) as usize;
        Ok(self.data.slice(start..end))
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Append-plus-patch byte sink owned by a muxer.
///
/// `update_data_at` is required: both muxers defer a handful of fields
/// (Matroska segment duration, MP4 chunk offsets in `moov_last` mode) and
/// rewrite them on finalize.
pub trait OutputWriter: Send {
    /// Append bytes to the output.
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Overwrite previously written bytes at `offset`.
    ///
    /// The patched range must already have been written.
    fn update_data_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()>;

    /// Number of bytes written so far.
    fn written_len(&self) -> u64;
}

/// An [`OutputWriter`] accumulating into memory.
#[derive(Debug, Default)]
pub struct BufferWriter {
    buf: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the accumulated output, leaving the writer empty.
    pub fn take(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl OutputWriter for BufferWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn update_data_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "patch range {}..{} exceeds written length {}",
                    start,
                    end,
                    self.buf.len()
                ),
            ));
        }
        self.buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn written_len(&self) -> u64 {
        self.buf.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_reader_bounds() {
        let reader = MemoryReader::new(vec![1u8, 2, 3, 4, 5]);
        assert_eq!(reader.size(), Some(5));

        let full = reader.read_at(0, 5).await.unwrap();
        assert_eq!(&full[..], &[1, 2, 3, 4, 5]);

        // Short read at the tail.
        let tail = reader.read_at(3, 10).await.unwrap();
        assert_eq!(&tail[..], &[4, 5]);

        // Read past the end is empty, not an error.
        let past = reader.read_at(9, 4).await.unwrap();
        assert!(past.is_empty());
    }

    #[test]
    fn buffer_writer_append_and_patch() {
        let mut writer = BufferWriter::new();
        writer.write(&[0, 0, 0, 0]).unwrap();
        writer.write(&[5, 6]).unwrap();
        assert_eq!(writer.written_len(), 6);

        writer.update_data_at(1, &[9, 9]).unwrap();
        assert_eq!(writer.as_slice(), &[0, 9, 9, 0, 5, 6]);

        let out = writer.take();
        assert_eq!(&out[..], &[0, 9, 9, 0, 5, 6]);
        assert_eq!(writer.written_len(), 0);
    }

    #[test]
    fn buffer_writer_rejects_out_of_range_patch() {
        let mut writer = BufferWriter::new();
        writer.write(&[1, 2, 3]).unwrap();
        assert!(writer.update_data_at(2, &[7, 8]).is_err());
    }
}
