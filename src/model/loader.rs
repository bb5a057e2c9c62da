//! Loader collaborator boundary: one file path in, one [`Record`] out.
//!
//! Archive walking, container extraction, and dialog flow stay outside
//! the core; whatever feeds paths in, placement logic lives in
//! [`HierarchyModel`](crate::model::HierarchyModel).

use std::path::PathBuf;

use dicom::object::open_file;

use crate::error::{Error, Result};
use crate::model::record::Record;

pub fn load_record(path: PathBuf) -> Result<Record> {
    log::info!("Loading DICOM file: {}", path.display());
    let object = open_file(&path).map_err(|err| {
        log::error!("{}: failed to open DICOM file ({err})", path.display());
        Error::Dicom(format!("{}: {err}", path.display()))
    })?;
    Ok(Record::from_object(object, path))
}

/// Load a batch of paths, collecting per-file failures instead of
/// aborting. Arrival order does not matter for tree placement.
pub fn load_records(paths: Vec<PathBuf>) -> (Vec<Record>, Vec<Error>) {
    let mut records = Vec::with_capacity(paths.len());
    let mut failures = Vec::new();
    for path in paths {
        match load_record(path) {
            Ok(record) => records.push(record),
            Err(err) => failures.push(err),
        }
    }
    if !failures.is_empty() {
        log::warn!("{} file(s) failed to load", failures.len());
    }
    (records, failures)
}
