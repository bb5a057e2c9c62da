//! Core engine for organizing DICOM files, editing their attributes,
//! and distributing them to remote archive nodes.
//!
//! Three cooperating layers:
//!
//! - [`model`]: a patient/study/series/instance forest over loaded
//!   datasets, with UID-based dedup, merge, and removal.
//! - [`staging`]: uncommitted tag edits kept apart from the datasets,
//!   with ancestor edits cascading to instances and batch commit
//!   through a pluggable persistence boundary.
//! - [`send`]: background jobs transferring frozen instance snapshots
//!   over stateful storage associations, with per-destination
//!   negotiation and a single transcode retry on syntax rejection.
//!
//! The crate is UI-agnostic; tree change events and job snapshots are
//! the only surfaces a front end needs to observe.

pub mod config;
pub mod error;
pub mod model;
pub mod send;
pub mod staging;
pub mod utils;

pub use config::{load_destinations, parse_destinations, Destination, DestinationConfig};
pub use error::{Error, Result, TransferReason};
pub use model::{HierarchyModel, Level, NodeId, Record, TreeChange};
pub use send::{JobStatus, QueueOptions, SendJobQueue};
pub use staging::{FileRecordWriter, RecordWriter, StagingLedger};
