//! End-to-end staging behavior over a populated hierarchy.

mod common;

use dicom::dictionary_std::tags;
use dicomforge::model::{load_record, HierarchyModel, Level, NodeId};
use dicomforge::staging::FileRecordWriter;
use dicomforge::StagingLedger;

use common::synth_record;

/// One patient, two series, three instances.
fn populated_model() -> (HierarchyModel, NodeId, Vec<NodeId>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut model = HierarchyModel::new();
    let first = model.insert(synth_record("P1", "ST1", "SE1", "I1", 1));
    let second = model.insert(synth_record("P1", "ST1", "SE1", "I2", 2));
    let third = model.insert(synth_record("P1", "ST1", "SE2", "I3", 1));
    (
        model,
        first.patient,
        vec![first.instance, second.instance, third.instance],
    )
}

#[test]
fn patient_level_edit_cascades_and_discards_are_per_entry() {
    let (model, patient, instances) = populated_model();
    let mut ledger = StagingLedger::new();

    ledger
        .stage(&model, patient, tags::PATIENT_NAME, "Anon^Anon")
        .unwrap();
    // Marker on the patient plus one entry per instance.
    assert_eq!(ledger.pending_count(), 4);
    for instance in &instances {
        assert_eq!(
            ledger.effective_value(&model, *instance, tags::PATIENT_NAME),
            Some("Anon^Anon".to_string())
        );
    }

    // Discarding one instance entry reverts only that instance.
    ledger.discard(instances[1], tags::PATIENT_NAME).unwrap();
    assert_eq!(ledger.pending_count(), 3);
    assert_eq!(
        ledger.effective_value(&model, instances[1], tags::PATIENT_NAME),
        Some("Name^P1".to_string())
    );
    assert_eq!(
        ledger.effective_value(&model, instances[0], tags::PATIENT_NAME),
        Some("Anon^Anon".to_string())
    );
}

#[test]
fn structural_effective_value_follows_first_instance() {
    let (model, patient, instances) = populated_model();
    let mut ledger = StagingLedger::new();

    assert_eq!(
        ledger.effective_value(&model, patient, tags::PATIENT_ID),
        Some("P1".to_string())
    );

    // A pending edit on the first instance shows through the patient
    // node, which derives its value from that instance.
    ledger
        .stage(&model, instances[0], tags::PATIENT_ID, "EDITED")
        .unwrap();
    assert_eq!(
        ledger.effective_value(&model, instances[0], tags::PATIENT_ID),
        Some("EDITED".to_string())
    );
    assert_eq!(
        ledger.effective_value(&model, patient, tags::PATIENT_ID),
        Some("EDITED".to_string())
    );
}

#[test]
fn pending_changes_surface_lists_entries_in_staging_order() {
    let (model, patient, instances) = populated_model();
    let mut ledger = StagingLedger::new();

    ledger
        .stage(&model, instances[2], tags::STUDY_DESCRIPTION, "Follow-up")
        .unwrap();
    ledger
        .stage(&model, patient, tags::PATIENT_NAME, "Anon^Anon")
        .unwrap();

    let changes = ledger.pending_changes(&model);
    assert_eq!(changes.len(), 5);
    assert_eq!(changes[0].tag, tags::STUDY_DESCRIPTION);
    assert_eq!(changes[0].tag_alias, "StudyDescription");
    assert!(changes[0].node_path.len() == 4); // patient/study/series/instance
    // The cascade origin is reported at patient level.
    assert_eq!(changes[2].origin_level, Level::Patient);
    assert_eq!(changes[2].baseline, "Name^P1");
    assert_eq!(changes[2].pending, "Anon^Anon");
}

#[test]
fn commit_all_writes_files_and_empties_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = HierarchyModel::new();
    let mut instances = Vec::new();
    for (sop, number) in [("I1", 1), ("I2", 2)] {
        let path = dir.path().join(format!("{sop}.dcm"));
        common::synth_object("P1", "ST1", "SE1", sop, number)
            .write_to_file(&path)
            .unwrap();
        let record = load_record(path).unwrap();
        instances.push(model.insert(record).instance);
    }

    let mut ledger = StagingLedger::new();
    let series = model.find("SE1", Level::Series).unwrap();
    ledger
        .stage(&model, series, tags::PATIENT_ID, "ANON")
        .unwrap();

    let outcome = ledger.commit_all(&mut model, &mut FileRecordWriter);
    assert_eq!(outcome.failed, 0);
    assert!(!ledger.has_pending());

    // The files on disk carry the committed value.
    for sop in ["I1", "I2"] {
        let reloaded = load_record(dir.path().join(format!("{sop}.dcm"))).unwrap();
        assert_eq!(reloaded.patient_id(), "ANON");
    }
}

#[test]
fn removal_respects_pending_edits_across_the_subtree() {
    let (mut model, patient, instances) = populated_model();
    let mut ledger = StagingLedger::new();
    ledger
        .stage(&model, instances[2], tags::PATIENT_NAME, "X")
        .unwrap();

    // The edit sits on an instance two levels down; removing the
    // patient is still refused.
    assert!(model.remove(patient, &ledger, false).is_err());

    let removed = model.remove(patient, &ledger, true).unwrap();
    ledger.purge_nodes(&removed);
    assert!(!ledger.has_pending());
    assert_eq!(model.counts().instances, 0);
}
