//! Property-based test generators using proptest.

use proptest::prelude::*;
use sitx_core::OperationStatus;
use sitx_pipeline::BufferConfiguration;
use sitx_storage::{KvPair, MutationKind};

/// Strategy for short row keys drawn from a small alphabet, so that batches
/// revisit the same rows.
pub fn row_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"abcdefghmnoxyz".to_vec()), 1..4)
}

/// Strategy for mutation kinds.
pub fn mutation_kind_strategy() -> impl Strategy<Value = MutationKind> {
    prop_oneof![
        Just(MutationKind::Insert),
        Just(MutationKind::Update),
        Just(MutationKind::Upsert),
        Just(MutationKind::Delete),
    ]
}

/// Strategy for a single mutation. Deletes carry no value.
pub fn kv_pair_strategy() -> impl Strategy<Value = KvPair> {
    (
        mutation_kind_strategy(),
        row_key_strategy(),
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(kind, key, value)| match kind {
            MutationKind::Delete => KvPair::delete(key),
            _ => KvPair::new(kind, key, value),
        })
}

/// Strategy for a batch of up to `max` mutations.
pub fn mutation_batch_strategy(max: usize) -> impl Strategy<Value = Vec<KvPair>> {
    prop::collection::vec(kv_pair_strategy(), 0..=max)
}

/// Strategy for small buffer thresholds that force frequent flushes.
pub fn buffer_configuration_strategy() -> impl Strategy<Value = BufferConfiguration> {
    (1usize..8, 16usize..2048, 1usize..4).prop_map(|(entries, heap, flushes)| {
        BufferConfiguration::default()
            .max_entries(entries)
            .max_heap_size(heap)
            .max_flushes_per_region(flushes)
    })
}

/// Strategy for every status variant.
pub fn operation_status_strategy() -> impl Strategy<Value = OperationStatus> {
    prop_oneof![
        3 => Just(OperationStatus::Success),
        1 => Just(OperationStatus::NotRun),
        1 => "[a-z]{1,8}".prop_map(OperationStatus::failure),
        1 => "[a-z]{1,8}".prop_map(OperationStatus::write_conflict),
        1 => Just(OperationStatus::additive_write_conflict()),
        1 => "[a-z]{1,8}".prop_map(OperationStatus::bad_family),
        1 => "[a-z]{1,8}".prop_map(OperationStatus::sanity_check_failure),
    ]
}
