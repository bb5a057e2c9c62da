//! Cascade of a structural edit down to instance entries.

use dicom::core::Tag;

use crate::model::{HierarchyModel, NodeId};
use crate::staging::ledger::{StageOutcome, StagingLedger};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CascadeOutcome {
    pub staged: usize,
    /// Instances where a direct leaf edit on the same tag was preserved.
    pub skipped: usize,
}

/// Stage `value` for `tag` on every instance in `instances`, all with
/// `origin` as the initiating node. Re-running the same cascade is
/// idempotent: existing cascaded entries get their pending value
/// replaced while keeping their original baseline.
pub(crate) fn cascade(
    ledger: &mut StagingLedger,
    model: &HierarchyModel,
    origin: NodeId,
    tag: Tag,
    value: &str,
    instances: &[NodeId],
) -> CascadeOutcome {
    let mut outcome = CascadeOutcome::default();
    for &instance in instances {
        match ledger.stage_one(model, instance, tag, value, origin) {
            StageOutcome::Created | StageOutcome::Replaced => outcome.staged += 1,
            StageOutcome::SkippedDirect => outcome.skipped += 1,
            StageOutcome::Reverted => {}
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::testkit::synth_record;
    use dicom::dictionary_std::tags;

    fn two_series_tree() -> (HierarchyModel, NodeId, Vec<NodeId>) {
        let mut model = HierarchyModel::new();
        let p1 = model.insert(synth_record("P1", "ST1", "SE1", "I1", 1));
        let p2 = model.insert(synth_record("P1", "ST1", "SE1", "I2", 2));
        let p3 = model.insert(synth_record("P1", "ST1", "SE2", "I3", 1));
        let instances = vec![p1.instance, p2.instance, p3.instance];
        (model, p1.study, instances)
    }

    #[test]
    fn structural_edit_reaches_every_instance() {
        let (model, study, instances) = two_series_tree();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON").unwrap();

        for instance in &instances {
            assert_eq!(
                ledger.effective_value(&model, *instance, tags::PATIENT_ID),
                Some("ANON".to_string())
            );
        }
        // Marker on the study plus one entry per instance.
        assert_eq!(ledger.pending_count(), 1 + instances.len());
    }

    #[test]
    fn cascade_preserves_direct_leaf_edits() {
        let (model, study, instances) = two_series_tree();
        let mut ledger = StagingLedger::new();
        ledger
            .stage(&model, instances[1], tags::PATIENT_ID, "KEEP-ME")
            .unwrap();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON").unwrap();

        assert_eq!(
            ledger.effective_value(&model, instances[1], tags::PATIENT_ID),
            Some("KEEP-ME".to_string())
        );
        assert_eq!(
            ledger.effective_value(&model, instances[0], tags::PATIENT_ID),
            Some("ANON".to_string())
        );
    }

    #[test]
    fn direct_edit_after_cascade_takes_over_the_entry() {
        let (model, study, instances) = two_series_tree();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON").unwrap();
        ledger
            .stage(&model, instances[0], tags::PATIENT_ID, "SPECIAL")
            .unwrap();

        let entry = ledger.get(instances[0], tags::PATIENT_ID).unwrap();
        assert!(entry.is_direct());
        assert_eq!(entry.pending, "SPECIAL");
        // Baseline is still the stored value, not the cascaded one.
        assert_eq!(entry.baseline, "P1");
    }

    #[test]
    fn repeated_cascade_is_idempotent() {
        let (model, study, _) = two_series_tree();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON").unwrap();
        let count = ledger.pending_count();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON2").unwrap();

        assert_eq!(ledger.pending_count(), count);
        for entry in ledger.entries() {
            if entry.node != study {
                assert_eq!(entry.pending, "ANON2");
                assert_eq!(entry.origin, study);
            }
        }
    }

    #[test]
    fn discarding_marker_leaves_cascaded_entries() {
        let (model, study, instances) = two_series_tree();
        let mut ledger = StagingLedger::new();
        ledger.stage(&model, study, tags::PATIENT_ID, "ANON").unwrap();

        ledger.discard(study, tags::PATIENT_ID).unwrap();
        assert_eq!(ledger.pending_count(), instances.len());
        assert_eq!(
            ledger.effective_value(&model, instances[0], tags::PATIENT_ID),
            Some("ANON".to_string())
        );
    }

    #[test]
    fn cascade_over_no_instances_stages_nothing() {
        let (model, study, _) = two_series_tree();
        let mut ledger = StagingLedger::new();
        let outcome = cascade(&mut ledger, &model, study, tags::PATIENT_ID, "X", &[]);
        assert_eq!(outcome, CascadeOutcome::default());
        assert!(!ledger.has_pending());
    }
}
