//! Durable transaction log.
//!
//! Every accepted change to a transaction record is appended here before it
//! becomes visible, and replayed on open. Each record is framed as
//!
//! ```text
//! | magic "STXL" (4) | version (2) | type (1) | length (4) | payload | crc32 (4) |
//! ```
//!
//! with little-endian integers and a CBOR payload. The CRC covers everything
//! before it.

use crate::error::{CoreError, CoreResult};
use crate::txn::view::TxnView;
use crate::types::{Timestamp, TxnId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sitx_storage::StorageBackend;
use tracing::{debug, warn};

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"STXL";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
const HEADER_SIZE: usize = 11;

const CRC_SIZE: usize = 4;

/// Type byte of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnLogRecordType {
    /// A new transaction.
    Begin = 1,
    /// A commit.
    Commit = 2,
    /// A rollback.
    Rollback = 3,
    /// A resolved global commit timestamp.
    GlobalCommit = 4,
    /// A keep-alive refresh.
    KeepAlive = 5,
}

impl TxnLogRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Commit),
            3 => Some(Self::Rollback),
            4 => Some(Self::GlobalCommit),
            5 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One logged change to a transaction record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnLogRecord {
    /// A transaction was recorded.
    Begin {
        /// The new record, in `Active` state.
        view: TxnView,
        /// Keep-alive time at creation, in milliseconds.
        keep_alive: u64,
    },
    /// A transaction committed.
    Commit {
        /// Transaction.
        txn_id: TxnId,
        /// Commit timestamp.
        commit_timestamp: Timestamp,
    },
    /// A transaction rolled back.
    Rollback {
        /// Transaction.
        txn_id: TxnId,
    },
    /// The resolver cached a global commit timestamp.
    GlobalCommit {
        /// Transaction.
        txn_id: TxnId,
        /// Root commit timestamp.
        global_commit_timestamp: Timestamp,
    },
    /// A keep-alive arrived.
    KeepAlive {
        /// Transaction.
        txn_id: TxnId,
        /// Time of the keep-alive, in milliseconds.
        at: u64,
    },
}

impl TxnLogRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> TxnLogRecordType {
        match self {
            Self::Begin { .. } => TxnLogRecordType::Begin,
            Self::Commit { .. } => TxnLogRecordType::Commit,
            Self::Rollback { .. } => TxnLogRecordType::Rollback,
            Self::GlobalCommit { .. } => TxnLogRecordType::GlobalCommit,
            Self::KeepAlive { .. } => TxnLogRecordType::KeepAlive,
        }
    }

    /// Returns the transaction the record is about.
    #[must_use]
    pub fn txn_id(&self) -> TxnId {
        match self {
            Self::Begin { view, .. } => view.txn_id,
            Self::Commit { txn_id, .. }
            | Self::Rollback { txn_id }
            | Self::GlobalCommit { txn_id, .. }
            | Self::KeepAlive { txn_id, .. } => *txn_id,
        }
    }

    /// Encodes the record body as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        match self {
            Self::Begin { view, keep_alive } => to_cbor(&(view, keep_alive)),
            Self::Commit {
                txn_id,
                commit_timestamp,
            } => to_cbor(&(txn_id, commit_timestamp)),
            Self::Rollback { txn_id } => to_cbor(txn_id),
            Self::GlobalCommit {
                txn_id,
                global_commit_timestamp,
            } => to_cbor(&(txn_id, global_commit_timestamp)),
            Self::KeepAlive { txn_id, at } => to_cbor(&(txn_id, at)),
        }
    }

    /// Decodes a record body of the given type.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload does not match the type.
    pub fn decode_payload(record_type: TxnLogRecordType, payload: &[u8]) -> CoreResult<Self> {
        Ok(match record_type {
            TxnLogRecordType::Begin => {
                let (view, keep_alive) = from_cbor(payload)?;
                Self::Begin { view, keep_alive }
            }
            TxnLogRecordType::Commit => {
                let (txn_id, commit_timestamp) = from_cbor(payload)?;
                Self::Commit {
                    txn_id,
                    commit_timestamp,
                }
            }
            TxnLogRecordType::Rollback => Self::Rollback {
                txn_id: from_cbor(payload)?,
            },
            TxnLogRecordType::GlobalCommit => {
                let (txn_id, global_commit_timestamp) = from_cbor(payload)?;
                Self::GlobalCommit {
                    txn_id,
                    global_commit_timestamp,
                }
            }
            TxnLogRecordType::KeepAlive => {
                let (txn_id, at) = from_cbor(payload)?;
                Self::KeepAlive { txn_id, at }
            }
        })
    }
}

fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(payload: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(payload).map_err(|e| CoreError::codec(e.to_string()))
}

/// Append-only log of transaction record changes on a storage backend.
pub struct TxnLog {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_write: bool,
}

impl TxnLog {
    /// Creates a log over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_write: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_write,
        }
    }

    /// Appends a record and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded, exceeds 4 GiB, or
    /// the backend fails.
    pub fn append(&self, record: &TxnLogRecord) -> CoreResult<u64> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("log record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        if self.sync_on_write {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Flushes pending writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend flush fails.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Returns the log size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.backend.lock().len()
    }

    /// Reads every complete record, in append order.
    ///
    /// A record cut short at the tail of the log ends the read cleanly: it was
    /// never acknowledged. Anything else that fails to parse is corruption.
    ///
    /// # Errors
    ///
    /// Returns an error on bad magic, unsupported version, unknown type, CRC
    /// mismatch, or an undecodable payload.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, TxnLogRecord)>> {
        let data = self.backend.lock().read_all()?;
        Ok(parse_records(&data)?.0)
    }

    /// Reads every complete record and cuts off a partial record at the
    /// tail, so that the next append starts on a record boundary.
    ///
    /// # Errors
    ///
    /// Same as [`read_all`](Self::read_all), plus backend failures while
    /// truncating.
    pub fn recover(&self) -> CoreResult<Vec<(u64, TxnLogRecord)>> {
        let mut backend = self.backend.lock();
        let data = backend.read_all()?;
        let (records, end) = parse_records(&data)?;
        if end < data.len() {
            warn!(
                offset = end,
                dropped = data.len() - end,
                "discarding partial record at log tail"
            );
            backend.truncate(end as u64)?;
        }
        Ok(records)
    }

    /// Consumes the log and returns its backend.
    pub fn into_backend(self) -> Box<dyn StorageBackend> {
        self.backend.into_inner()
    }
}

/// Parses complete records from `data`. Returns them with the offset just
/// past the last one.
fn parse_records(data: &[u8]) -> CoreResult<(Vec<(u64, TxnLogRecord)>, usize)> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_SIZE {
            debug!(offset = pos, "truncated log header at tail");
            break;
        }
        if rest[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!("bad magic at offset {pos}")));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version != LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported log version {version} at offset {pos}"
            )));
        }
        let record_type = TxnLogRecordType::from_byte(rest[6]).ok_or_else(|| {
            CoreError::log_corruption(format!("unknown record type {} at offset {pos}", rest[6]))
        })?;
        let payload_len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
        let total = HEADER_SIZE + payload_len + CRC_SIZE;
        if rest.len() < total {
            debug!(offset = pos, "truncated log record at tail");
            break;
        }

        let crc_offset = HEADER_SIZE + payload_len;
        let expected = u32::from_le_bytes([
            rest[crc_offset],
            rest[crc_offset + 1],
            rest[crc_offset + 2],
            rest[crc_offset + 3],
        ]);
        let actual = compute_crc32(&rest[..crc_offset]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let record = TxnLogRecord::decode_payload(record_type, &rest[HEADER_SIZE..crc_offset])?;
        records.push((pos as u64, record));
        pos += total;
    }
    Ok((records, pos))
}

/// CRC32 (IEEE polynomial).
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitx_storage::InMemoryBackend;

    fn sample_records() -> Vec<TxnLogRecord> {
        vec![
            TxnLogRecord::Begin {
                view: TxnView::new(TxnId(1), Timestamp(1)).with_destination_table("t"),
                keep_alive: 1_000,
            },
            TxnLogRecord::KeepAlive {
                txn_id: TxnId(1),
                at: 2_000,
            },
            TxnLogRecord::Commit {
                txn_id: TxnId(1),
                commit_timestamp: Timestamp(2),
            },
            TxnLogRecord::Rollback { txn_id: TxnId(3) },
            TxnLogRecord::GlobalCommit {
                txn_id: TxnId(4),
                global_commit_timestamp: Timestamp(9),
            },
        ]
    }

    fn log_bytes(records: &[TxnLogRecord]) -> Vec<u8> {
        let log = TxnLog::new(Box::new(InMemoryBackend::new()), false);
        for record in records {
            log.append(record).unwrap();
        }
        log.into_backend().read_all().unwrap()
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn append_then_read_preserves_order() {
        let records = sample_records();
        let log = TxnLog::new(Box::new(InMemoryBackend::new()), true);
        let mut offsets = Vec::new();
        for record in &records {
            offsets.push(log.append(record).unwrap());
        }

        let read = log.read_all().unwrap();
        assert_eq!(read.len(), records.len());
        for ((offset, record), (expected_offset, expected)) in
            read.iter().zip(offsets.iter().zip(records.iter()))
        {
            assert_eq!(offset, expected_offset);
            assert_eq!(record, expected);
        }
    }

    #[test]
    fn truncated_tail_is_clean_end() {
        let records = sample_records();
        let mut bytes = log_bytes(&records);
        bytes.truncate(bytes.len() - 3);

        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        let read = log.read_all().unwrap();
        assert_eq!(read.len(), records.len() - 1);
    }

    #[test]
    fn recover_cuts_the_partial_tail_before_new_appends() {
        let records = sample_records();
        let mut bytes = log_bytes(&records);
        bytes.truncate(bytes.len() - 3);

        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert_eq!(log.recover().unwrap().len(), records.len() - 1);
        let extra = TxnLogRecord::Rollback { txn_id: TxnId(7) };
        log.append(&extra).unwrap();

        let read = log.read_all().unwrap();
        assert_eq!(read.len(), records.len());
        assert_eq!(read.last().map(|(_, r)| r), Some(&extra));
        assert_eq!(log.recover().unwrap().len(), records.len());
    }

    #[test]
    fn truncated_header_is_clean_end() {
        let mut bytes = log_bytes(&sample_records()[..1]);
        bytes.extend_from_slice(&LOG_MAGIC);
        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let mut bytes = log_bytes(&sample_records());
        bytes[HEADER_SIZE + 1] ^= 0xFF;
        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bytes)), false);
        assert!(matches!(
            log.read_all(),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_version_and_type_are_fatal() {
        let original = log_bytes(&sample_records()[..1]);

        let mut bad_magic = original.clone();
        bad_magic[0] = b'X';
        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bad_magic)), false);
        assert!(matches!(log.read_all(), Err(CoreError::LogCorruption { .. })));

        let mut bad_version = original.clone();
        bad_version[4] = 9;
        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bad_version)), false);
        assert!(matches!(log.read_all(), Err(CoreError::LogCorruption { .. })));

        let mut bad_type = original;
        bad_type[6] = 42;
        let log = TxnLog::new(Box::new(InMemoryBackend::with_data(bad_type)), false);
        assert!(matches!(log.read_all(), Err(CoreError::LogCorruption { .. })));
    }

    #[test]
    fn record_type_bytes() {
        for record in sample_records() {
            let ty = record.record_type();
            assert_eq!(TxnLogRecordType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(TxnLogRecordType::from_byte(0), None);
    }
}
