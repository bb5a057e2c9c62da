//! Pending tag edits layered over the hierarchy.
//!
//! Entries are keyed by (node, tag) and insertion-ordered. The ledger
//! holds node handles only, never nodes: the tree stays exclusively
//! owned by [`HierarchyModel`].

use dicom::core::dictionary::DataDictionary;
use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;

use crate::error::{Error, Result};
use crate::model::{HierarchyModel, Level, NodeId, Record};
use crate::staging::propagate;
use crate::utils::formatting::is_binary_vr;

/// One pending, uncommitted tag change.
///
/// The baseline is snapshotted when the entry is first created and never
/// mutated afterwards: re-staging the same (node, tag) replaces the
/// pending value only, so a discard always restores the true original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEdit {
    pub node: NodeId,
    pub tag: Tag,
    pub baseline: String,
    pub pending: String,
    /// Node where the user initiated the edit. Equal to `node` for a
    /// direct edit; an ancestor handle for a cascaded one.
    pub origin: NodeId,
}

impl StagedEdit {
    pub fn is_direct(&self) -> bool {
        self.node == self.origin
    }
}

/// Entry enriched with tree context for rendering collaborators.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub node: NodeId,
    pub node_path: Vec<String>,
    pub tag: Tag,
    pub tag_alias: String,
    pub baseline: String,
    pub pending: String,
    pub origin: NodeId,
    pub origin_level: Level,
}

/// Aggregated result of a batch commit or discard. Callers that need
/// per-entry detail inspect the surviving entries instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub first_error: Option<String>,
}

/// Persistence boundary for commits. The record passed in already
/// carries the committed value; an `Err` makes the ledger roll the
/// in-memory change back and keep the entry pending.
pub trait RecordWriter {
    fn write(&mut self, record: &Record, tag: Tag, value: &str) -> Result<()>;
}

/// Writer that serializes the dataset back to its file origin.
#[derive(Debug, Default)]
pub struct FileRecordWriter;

impl RecordWriter for FileRecordWriter {
    fn write(&mut self, record: &Record, _tag: Tag, _value: &str) -> Result<()> {
        record.write_to_origin()
    }
}

#[derive(Debug, Default)]
pub struct StagingLedger {
    entries: Vec<StagedEdit>,
}

impl StagingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `new_value` for `tag` on `node`.
    ///
    /// On an Instance node this creates or updates one direct entry. On
    /// a structural node it records an ancestor marker entry and
    /// cascades the edit to every Instance descendant. Staging a value
    /// equal to the baseline removes the entry: no-op edits do not
    /// linger as pending.
    pub fn stage(
        &mut self,
        model: &HierarchyModel,
        node: NodeId,
        tag: Tag,
        new_value: &str,
    ) -> Result<()> {
        let level = model.node(node)?.level();
        match level {
            Level::Instance => {
                let record = model
                    .record(node)
                    .ok_or_else(|| Error::NotEditable("instance node has no record".into()))?;
                if is_binary_vr(record.vr_for(tag)) {
                    return Err(Error::NotEditable(format!(
                        "binary element {tag} is not editable"
                    )));
                }
                self.stage_one(model, node, tag, new_value, node);
                Ok(())
            }
            _ => {
                let instances = model.instances_under(node);
                if instances.is_empty() {
                    return Err(Error::NotEditable(
                        "no instances under node; nothing to edit".into(),
                    ));
                }
                if let Some(record) = model.record(instances[0]) {
                    if is_binary_vr(record.vr_for(tag)) {
                        return Err(Error::NotEditable(format!(
                            "binary element {tag} is not editable"
                        )));
                    }
                }
                // Marker entry so the surface can show where the user
                // acted; its baseline comes from the first instance.
                let baseline_source = model
                    .record(instances[0])
                    .and_then(|r| r.rendered_value(tag))
                    .unwrap_or_default();
                self.upsert_marker(node, tag, &baseline_source, new_value);
                let outcome = propagate::cascade(self, model, node, tag, new_value, &instances);
                log::info!(
                    "cascaded edit of {tag} to {} instance(s), {} direct edit(s) preserved",
                    outcome.staged,
                    outcome.skipped
                );
                Ok(())
            }
        }
    }

    /// Pending value if staged, else the stored value. Structural nodes
    /// answer with their first instance's effective value.
    pub fn effective_value(
        &self,
        model: &HierarchyModel,
        node: NodeId,
        tag: Tag,
    ) -> Option<String> {
        if let Some(entry) = self.get(node, tag) {
            return Some(entry.pending.clone());
        }
        match model.get(node)?.level() {
            Level::Instance => model.record(node)?.rendered_value(tag),
            // Structural nodes answer with their first instance's
            // effective value.
            _ => {
                let first = *model.instances_under(node).first()?;
                self.effective_value(model, first, tag)
            }
        }
    }

    /// Dataset snapshot for an instance with its pending values applied.
    /// Send enqueue freezes job targets through this, so a job carries
    /// the effective state without committing anything.
    pub fn effective_snapshot(
        &self,
        model: &HierarchyModel,
        node: NodeId,
    ) -> Result<dicom::object::DefaultDicomObject> {
        let record = model
            .record(node)
            .ok_or_else(|| Error::NotEditable("instance node has no record".into()))?;
        let overlays: Vec<(Tag, String)> = self
            .entries
            .iter()
            .filter(|e| e.node == node)
            .map(|e| (e.tag, e.pending.clone()))
            .collect();
        record.snapshot_with(&overlays)
    }

    pub fn get(&self, node: NodeId, tag: Tag) -> Option<&StagedEdit> {
        self.entries.iter().find(|e| e.node == node && e.tag == tag)
    }

    /// All entries in staging order, for the pending-changes surface.
    pub fn entries(&self) -> &[StagedEdit] {
        &self.entries
    }

    pub fn pending_changes(&self, model: &HierarchyModel) -> Vec<PendingChange> {
        self.entries
            .iter()
            .map(|entry| PendingChange {
                node: entry.node,
                node_path: model.path_labels(entry.node),
                tag: entry.tag,
                tag_alias: StandardDataDictionary
                    .by_tag(entry.tag)
                    .map(|dict_entry| dict_entry.alias.to_string())
                    .unwrap_or_else(|| "Unknown".to_string()),
                baseline: entry.baseline.clone(),
                pending: entry.pending.clone(),
                origin: entry.origin,
                origin_level: model
                    .get(entry.origin)
                    .map(|n| n.level())
                    .unwrap_or(Level::Instance),
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Entries against `root` or any of its descendants. Gate used by
    /// callers before destructive operations.
    pub fn pending_in_subtree(&self, model: &HierarchyModel, root: NodeId) -> usize {
        self.entries
            .iter()
            .filter(|e| model.is_ancestor_or_self(root, e.node))
            .count()
    }

    /// Discard one entry, reverting its effective value to baseline.
    /// Each discard reverses only its own entry; discarding an ancestor
    /// marker leaves cascaded descendant entries untouched.
    pub fn discard(&mut self, node: NodeId, tag: Tag) -> Result<StagedEdit> {
        let position = self
            .position(node, tag)
            .ok_or_else(|| Error::NotFound(format!("no staged edit for {tag} on {node:?}")))?;
        Ok(self.entries.remove(position))
    }

    pub fn discard_all(&mut self) -> BatchOutcome {
        let outcome = BatchOutcome {
            succeeded: self.entries.len(),
            ..Default::default()
        };
        self.entries.clear();
        outcome
    }

    /// Drop entries referencing removed nodes. Called after
    /// [`HierarchyModel::remove`] with the handles it returned.
    pub fn purge_nodes(&mut self, removed: &[NodeId]) {
        self.entries.retain(|e| !removed.contains(&e.node));
    }

    /// Commit one entry through the persistence boundary. On success the
    /// committed value becomes the record's stored value (and therefore
    /// the baseline any later staging snapshots). On failure the entry
    /// stays pending and the in-memory record is unchanged.
    pub fn commit(
        &mut self,
        model: &mut HierarchyModel,
        writer: &mut dyn RecordWriter,
        node: NodeId,
        tag: Tag,
    ) -> Result<()> {
        let position = self
            .position(node, tag)
            .ok_or_else(|| Error::NotFound(format!("no staged edit for {tag} on {node:?}")))?;
        self.commit_at(model, writer, position)?;
        Ok(())
    }

    /// Commit every entry without per-entry confirmation. A failing
    /// entry is kept pending and counted; it never rolls back or aborts
    /// the rest of the batch.
    pub fn commit_all(
        &mut self,
        model: &mut HierarchyModel,
        writer: &mut dyn RecordWriter,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut position = 0;
        while position < self.entries.len() {
            match self.commit_at(model, writer, position) {
                Ok(()) => outcome.succeeded += 1, // entry removed, same index
                Err(err) => {
                    log::warn!("commit failed for entry {position}: {err}");
                    outcome.failed += 1;
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(err.to_string());
                    }
                    position += 1;
                }
            }
        }
        outcome
    }

    fn commit_at(
        &mut self,
        model: &mut HierarchyModel,
        writer: &mut dyn RecordWriter,
        position: usize,
    ) -> Result<()> {
        let entry = self.entries[position].clone();
        let level = model.node(entry.node)?.level();
        if level != Level::Instance {
            // Ancestor markers carry no write of their own; the
            // cascaded instance entries do.
            self.entries.remove(position);
            return Ok(());
        }

        let previous = model
            .record(entry.node)
            .ok_or_else(|| Error::NotEditable("instance node has no record".into()))?
            .element_snapshot(entry.tag);

        model
            .record_mut(entry.node)
            .expect("record checked above")
            .apply_committed(entry.tag, &entry.pending)?;

        let record = model.record(entry.node).expect("record checked above");
        if let Err(err) = writer.write(record, entry.tag, &entry.pending) {
            model
                .record_mut(entry.node)
                .expect("record checked above")
                .restore_element(entry.tag, previous);
            return Err(err);
        }

        self.entries.remove(position);
        Ok(())
    }

    /// Stage against one instance. `origin == node` marks a direct
    /// edit; anything else is a cascade and must not overwrite a direct
    /// edit already pending on the same tag.
    pub(crate) fn stage_one(
        &mut self,
        model: &HierarchyModel,
        node: NodeId,
        tag: Tag,
        new_value: &str,
        origin: NodeId,
    ) -> StageOutcome {
        let is_cascade = origin != node;
        let pending = new_value.trim().to_string();

        if let Some(position) = self.position(node, tag) {
            let entry = &mut self.entries[position];
            if is_cascade && entry.is_direct() {
                // Leaf-level intent takes precedence over inherited
                // bulk edits.
                return StageOutcome::SkippedDirect;
            }
            if pending == entry.baseline {
                self.entries.remove(position);
                return StageOutcome::Reverted;
            }
            entry.pending = pending;
            entry.origin = origin;
            return StageOutcome::Replaced;
        }

        let baseline = model
            .record(node)
            .and_then(|r| r.rendered_value(tag))
            .unwrap_or_default()
            .trim()
            .to_string();
        if pending == baseline {
            return StageOutcome::Reverted;
        }
        self.entries.push(StagedEdit {
            node,
            tag,
            baseline,
            pending,
            origin,
        });
        StageOutcome::Created
    }

    fn upsert_marker(&mut self, node: NodeId, tag: Tag, baseline: &str, new_value: &str) {
        let pending = new_value.trim().to_string();
        if let Some(position) = self.position(node, tag) {
            if pending == self.entries[position].baseline {
                self.entries.remove(position);
            } else {
                self.entries[position].pending = pending;
            }
            return;
        }
        let baseline = baseline.trim().to_string();
        if pending == baseline {
            return;
        }
        self.entries.push(StagedEdit {
            node,
            tag,
            baseline,
            pending,
            origin: node,
        });
    }

    fn position(&self, node: NodeId, tag: Tag) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.node == node && e.tag == tag)
    }
}

/// What `stage_one` did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    Created,
    Replaced,
    /// Value equalled the baseline; any entry was removed.
    Reverted,
    /// A direct leaf edit was preserved against a cascade.
    SkippedDirect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::testkit::synth_record;
    use dicom::dictionary_std::tags;

    /// Writer that accepts everything without touching disk.
    #[derive(Default)]
    struct MemoryWriter {
        writes: Vec<(String, String)>,
    }

    impl RecordWriter for MemoryWriter {
        fn write(&mut self, record: &Record, _tag: Tag, value: &str) -> Result<()> {
            self.writes
                .push((record.sop_instance_uid().to_string(), value.to_string()));
            Ok(())
        }
    }

    struct FailingWriter;

    impl RecordWriter for FailingWriter {
        fn write(&mut self, _record: &Record, _tag: Tag, _value: &str) -> Result<()> {
            Err(Error::Persistence("disk full".into()))
        }
    }

    fn single_instance() -> (HierarchyModel, NodeId) {
        let mut model = HierarchyModel::new();
        let path = model.insert(synth_record("P1", "ST1", "SE1", "I1", 1));
        (model, path.instance)
    }

    #[test]
    fn stage_then_discard_restores_effective_value() {
        let (model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        let before = ledger
            .effective_value(&model, instance, tags::PATIENT_ID)
            .unwrap();

        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();
        assert_eq!(
            ledger.effective_value(&model, instance, tags::PATIENT_ID),
            Some("X".to_string())
        );

        ledger.discard(instance, tags::PATIENT_ID).unwrap();
        assert_eq!(
            ledger.effective_value(&model, instance, tags::PATIENT_ID),
            Some(before)
        );
        assert!(!ledger.has_pending());
    }

    #[test]
    fn restaging_keeps_original_baseline() {
        let (model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();
        ledger.stage(&model, instance, tags::PATIENT_ID, "Y").unwrap();

        let entry = ledger.get(instance, tags::PATIENT_ID).unwrap();
        assert_eq!(entry.baseline, "P1");
        assert_eq!(entry.pending, "Y");
    }

    #[test]
    fn staging_back_to_baseline_removes_entry() {
        let (model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();
        ledger.stage(&model, instance, tags::PATIENT_ID, "P1").unwrap();
        assert!(!ledger.has_pending());
    }

    #[test]
    fn commit_makes_value_the_new_baseline() {
        let (mut model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        let mut writer = MemoryWriter::default();

        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();
        ledger
            .commit(&mut model, &mut writer, instance, tags::PATIENT_ID)
            .unwrap();
        assert!(!ledger.has_pending());
        assert_eq!(writer.writes, vec![("I1".to_string(), "X".to_string())]);

        // A later staging snapshots the committed value, not the
        // pre-commit one.
        ledger.stage(&model, instance, tags::PATIENT_ID, "Y").unwrap();
        let entry = ledger.get(instance, tags::PATIENT_ID).unwrap();
        assert_eq!(entry.baseline, "X");
    }

    #[test]
    fn failed_commit_keeps_entry_pending_and_value_unchanged() {
        let (mut model, instance) = single_instance();
        let mut ledger = StagingLedger::new();

        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();
        let err = ledger
            .commit(&mut model, &mut FailingWriter, instance, tags::PATIENT_ID)
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert_eq!(ledger.pending_count(), 1);
        assert_eq!(
            model
                .record(instance)
                .unwrap()
                .rendered_value(tags::PATIENT_ID)
                .unwrap(),
            "P1"
        );
    }

    #[test]
    fn batch_commit_aggregates_and_never_aborts() {
        let mut model = HierarchyModel::new();
        let a = model.insert(synth_record("P1", "ST1", "SE1", "I1", 1)).instance;
        let b = model.insert(synth_record("P1", "ST1", "SE1", "I2", 2)).instance;

        let mut ledger = StagingLedger::new();
        ledger.stage(&model, a, tags::PATIENT_ID, "X").unwrap();
        // Unparseable numeric commit fails for this entry only.
        ledger
            .stage(&model, b, tags::INSTANCE_NUMBER, "not-a-number")
            .unwrap();

        let outcome = ledger.commit_all(&mut model, &mut MemoryWriter::default());
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.first_error.is_some());
        assert_eq!(ledger.pending_count(), 1);
        assert!(ledger.get(b, tags::INSTANCE_NUMBER).is_some());
    }

    #[test]
    fn staging_binary_elements_is_rejected() {
        let (model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        let err = ledger
            .stage(&model, instance, tags::PIXEL_DATA, "zzz")
            .unwrap_err();
        assert!(matches!(err, Error::NotEditable(_)));
    }

    #[test]
    fn staging_binary_elements_at_structural_levels_is_rejected() {
        let mut model = HierarchyModel::new();
        let a = model.insert(synth_record("P1", "ST1", "SE1", "I1", 1));
        model.insert(synth_record("P1", "ST1", "SE1", "I2", 2));

        let mut ledger = StagingLedger::new();
        for node in [a.patient, a.study, a.series] {
            let err = ledger
                .stage(&model, node, tags::PIXEL_DATA, "zzz")
                .unwrap_err();
            assert!(matches!(err, Error::NotEditable(_)));
        }
        assert!(!ledger.has_pending());
    }

    #[test]
    fn remove_is_gated_on_pending_edits_unless_forced() {
        let (mut model, instance) = single_instance();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, instance, tags::PATIENT_ID, "X").unwrap();

        let err = model.remove(instance, &ledger, false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let removed = model.remove(instance, &ledger, true).unwrap();
        ledger.purge_nodes(&removed);
        assert!(!ledger.has_pending());
    }
}
