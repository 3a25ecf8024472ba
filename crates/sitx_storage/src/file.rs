//! Log backend over a single append-mode file.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A transaction log kept in one file.
///
/// Appends go through a handle opened in append mode; reads use a second
/// handle so replay never moves the write position. `flush` hands bytes to
/// the OS and `sync` waits for them to reach the disk.
///
/// ```no_run
/// use sitx_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut log = FileBackend::open(Path::new("txn.log")).unwrap();
/// log.append(b"record").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    writer: File,
    reader: Mutex<File>,
    len: u64,
}

impl FileBackend {
    /// Opens the log at `path`, creating an empty one if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let writer = OpenOptions::new().create(true).append(true).open(path)?;
        let len = writer.metadata()?.len();
        let reader = File::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            reader: Mutex::new(reader),
            len,
        })
    }

    /// Like [`open`](Self::open), creating missing parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory or the file cannot be created.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn append(&mut self, record: &[u8]) -> StorageResult<u64> {
        let offset = self.len;
        self.writer.write_all(record)?;
        self.len += record.len() as u64;
        Ok(offset)
    }

    fn read_range(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        StorageError::check_range(offset, len, self.len)?;
        let mut out = vec![0u8; len];
        if len > 0 {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(offset))?;
            reader.read_exact(&mut out)?;
        }
        Ok(out)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn truncate(&mut self, len: u64) -> StorageResult<()> {
        StorageError::check_range(len, 0, self.len)?;
        self.writer.set_len(len)?;
        self.writer.sync_all()?;
        self.len = len;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.writer.sync_data()?;
        Ok(())
    }
}
