//! The byte log the transaction store persists through.

use crate::error::StorageResult;

/// An append-only byte log.
///
/// Backends hold opaque bytes. Record framing, checksums and replay belong
/// to the transaction log in `sitx_core`. An append lands at the current
/// [`len`](Self::len) and bytes once written are never rewritten.
pub trait StorageBackend: Send + Sync {
    /// Appends `record` and returns the offset it starts at.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the backend is closed.
    fn append(&mut self, record: &[u8]) -> StorageResult<u64>;

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if the range ends past [`len`](Self::len); I/O errors
    /// otherwise.
    fn read_range(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads the whole log, for replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let len = usize::try_from(self.len()).unwrap_or(usize::MAX);
        self.read_range(0, len)
    }

    /// Bytes appended so far.
    fn len(&self) -> u64;

    /// Returns true if nothing was ever appended.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cuts the log back to `len` bytes. Later appends land at `len`.
    ///
    /// Only used to drop a partial record left at the tail by a crash.
    ///
    /// # Errors
    ///
    /// `OutOfRange` if `len` is past the end; I/O errors otherwise.
    fn truncate(&mut self, len: u64) -> StorageResult<()>;

    /// Hands buffered appends to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails or the backend is closed.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes every append durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails or the backend is closed.
    fn sync(&mut self) -> StorageResult<()>;
}
