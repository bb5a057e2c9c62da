pub mod ledger;
pub(crate) mod propagate;

pub use ledger::{
    BatchOutcome, FileRecordWriter, PendingChange, RecordWriter, StagedEdit, StagingLedger,
};
