//! Read path: which cell versions a transaction sees.

mod controller;
mod packed;
mod read_resolver;
mod visibility;

pub use controller::ReadController;
pub use packed::{encode_packed_row, ColumnMask, PackedRow, PackedTxnFilter};
pub use read_resolver::{AsyncReadResolver, NoopReadResolver, ReadResolver, SynchronousReadResolver};
pub use visibility::TxnFilter;
