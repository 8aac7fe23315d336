//! Bulk transfer engine: segment-based memory descriptors, registration,
//! wire serialization and segmented push/pull with operation-count
//! accounting.

mod descriptor;
mod serialize;
mod transfer;

pub use descriptor::{BulkAccess, BulkHandle};
pub use transfer::{
    bind_transfer, transfer, transfer_id, BulkCallback, BulkCbInfo, BulkOp, BulkOpKind,
};

pub(crate) use transfer::{trigger_entry, BulkOpPool};
