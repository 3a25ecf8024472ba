//! Log backend held in memory.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use bytes::BytesMut;

/// A transaction log that lives in a byte buffer.
///
/// Backs ephemeral transaction stores. Copy the bytes out with
/// [`data`](Self::data) and hand them to [`with_data`](Self::with_data) to
/// replay the same log in a new store.
///
/// ```rust
/// use sitx_storage::{InMemoryBackend, StorageBackend};
///
/// let mut log = InMemoryBackend::new();
/// assert_eq!(log.append(b"record").unwrap(), 0);
/// assert_eq!(log.len(), 6);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    buf: BytesMut,
    closed: bool,
}

impl InMemoryBackend {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that already holds `data`.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            buf: BytesMut::from(&data[..]),
            closed: false,
        }
    }

    /// Copy of everything appended.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.buf.to_vec()
    }

    /// Refuses later appends, flushes and syncs. Reads keep working.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn writable(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn append(&mut self, record: &[u8]) -> StorageResult<u64> {
        self.writable()?;
        let offset = self.len();
        self.buf.extend_from_slice(record);
        Ok(offset)
    }

    fn read_range(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        StorageError::check_range(offset, len, self.len())?;
        let start = offset as usize;
        Ok(self.buf[start..start + len].to_vec())
    }

    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        self.writable()?;
        StorageError::check_range(len, 0, self.len())?;
        self.buf.truncate(len as usize);
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.writable()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.writable()
    }
}
