//! Row mutation unit.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a mutation does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Insert a row that is expected not to exist.
    Insert,
    /// Update an existing row.
    Update,
    /// Insert or update.
    Upsert,
    /// Delete the row (writes a tombstone).
    Delete,
}

impl MutationKind {
    /// Returns true for the kinds that only ever add a row.
    #[must_use]
    pub const fn is_insert_like(self) -> bool {
        matches!(self, Self::Insert | Self::Upsert)
    }
}

/// A single row mutation: key, encoded value and kind.
///
/// Keys and values are reference-counted [`Bytes`] so a pair can be handed
/// between the call buffer, the pre-flush hook and retry rounds without
/// copying payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvPair {
    kind: MutationKind,
    row_key: Bytes,
    value: Bytes,
}

impl KvPair {
    /// Creates a mutation of the given kind.
    pub fn new(kind: MutationKind, row_key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            row_key: row_key.into(),
            value: value.into(),
        }
    }

    /// Creates an insert.
    pub fn insert(row_key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Insert, row_key, value)
    }

    /// Creates an upsert.
    pub fn upsert(row_key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Upsert, row_key, value)
    }

    /// Creates an update.
    pub fn update(row_key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Update, row_key, value)
    }

    /// Creates a delete. Deletes carry no value.
    pub fn delete(row_key: impl Into<Bytes>) -> Self {
        Self::new(MutationKind::Delete, row_key, Bytes::new())
    }

    /// Returns the mutation kind.
    #[must_use]
    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Returns the row key.
    #[must_use]
    pub fn row_key(&self) -> &Bytes {
        &self.row_key
    }

    /// Returns the encoded value.
    #[must_use]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Approximate heap footprint used for buffer accounting.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.row_key.len() + self.value.len()
    }
}
