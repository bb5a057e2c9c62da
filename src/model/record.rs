//! One parsed dataset and its identity within the hierarchy.

use std::path::{Path, PathBuf};

use dicom::core::dictionary::DataDictionary;
use dicom::core::header::Header;
use dicom::core::value::{PrimitiveValue, Value};
use dicom::core::{DataElement, Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::mem::InMemElement;
use dicom::object::DefaultDicomObject;

use crate::error::{Error, Result};
use crate::utils::value_to_string;

/// Immutable-by-default representation of one loaded dataset.
///
/// A `Record` is identified by its file origin and owned by exactly one
/// Instance node. Mutation happens only through the ledger commit path
/// ([`Record::apply_committed`]); everything else reads.
#[derive(Debug, Clone)]
pub struct Record {
    object: DefaultDicomObject,
    path: PathBuf,
    transfer_syntax: String,
    sop_class_uid: String,
    sop_instance_uid: String,
    series_uid: String,
    study_uid: String,
    patient_id: String,
    patient_label: String,
    study_label: String,
    series_label: String,
    instance_label: String,
    instance_number: Option<i64>,
}

impl Record {
    /// Wrap an already-parsed object, extracting the identity attributes
    /// used for tree placement. Missing attributes fall back to
    /// placeholder labels rather than failing the load.
    pub fn from_object(object: DefaultDicomObject, path: PathBuf) -> Record {
        let transfer_syntax = object.meta().transfer_syntax().trim().to_string();

        let patient_id =
            attribute_text(&object, tags::PATIENT_ID).unwrap_or_else(|| "Unknown ID".into());
        let patient_name =
            attribute_text(&object, tags::PATIENT_NAME).unwrap_or_else(|| "Unknown Name".into());
        let study_uid = attribute_text(&object, tags::STUDY_INSTANCE_UID)
            .unwrap_or_else(|| "Unknown StudyUID".into());
        let study_desc = attribute_text(&object, tags::STUDY_DESCRIPTION)
            .unwrap_or_else(|| "No Study Description".into());
        let series_uid = attribute_text(&object, tags::SERIES_INSTANCE_UID)
            .unwrap_or_else(|| "Unknown SeriesUID".into());
        let series_desc = attribute_text(&object, tags::SERIES_DESCRIPTION)
            .unwrap_or_else(|| "No Series Description".into());
        let sop_instance_uid = attribute_text(&object, tags::SOP_INSTANCE_UID)
            .unwrap_or_else(|| file_name_of(&path));
        let sop_class_uid = attribute_text(&object, tags::SOP_CLASS_UID)
            .unwrap_or_else(|| object.meta().media_storage_sop_class_uid().trim().to_string());

        let instance_number = attribute_text(&object, tags::INSTANCE_NUMBER)
            .and_then(|text| text.parse::<i64>().ok());
        let instance_label = match instance_number {
            Some(number) => format!("Instance {number} [{sop_instance_uid}]"),
            None => format!("{} [{sop_instance_uid}]", file_name_of(&path)),
        };

        Record {
            patient_label: format!("{patient_name} ({patient_id})"),
            study_label: format!("{study_desc} [{study_uid}]"),
            series_label: format!("{series_desc} [{series_uid}]"),
            instance_label,
            instance_number,
            object,
            path,
            transfer_syntax,
            sop_class_uid,
            sop_instance_uid,
            series_uid,
            study_uid,
            patient_id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn transfer_syntax(&self) -> &str {
        &self.transfer_syntax
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn study_uid(&self) -> &str {
        &self.study_uid
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn sop_instance_uid(&self) -> &str {
        &self.sop_instance_uid
    }

    pub fn sop_class_uid(&self) -> &str {
        &self.sop_class_uid
    }

    pub fn patient_label(&self) -> &str {
        &self.patient_label
    }

    pub fn study_label(&self) -> &str {
        &self.study_label
    }

    pub fn series_label(&self) -> &str {
        &self.series_label
    }

    pub fn instance_label(&self) -> &str {
        &self.instance_label
    }

    pub fn instance_number(&self) -> Option<i64> {
        self.instance_number
    }

    pub fn object(&self) -> &DefaultDicomObject {
        &self.object
    }

    /// Clone the dataset for a send job. The clone freezes the tag state
    /// at enqueue time; later edits never affect a job in flight.
    pub fn snapshot_object(&self) -> DefaultDicomObject {
        self.object.clone()
    }

    /// Clone of the dataset with the given text values overlaid, each
    /// coerced to its element's VR. Used to freeze effective state into
    /// a send-job snapshot without touching the owned object.
    pub(crate) fn snapshot_with(&self, overlays: &[(Tag, String)]) -> Result<DefaultDicomObject> {
        let mut object = self.object.clone();
        for (tag, text) in overlays {
            let vr = self.vr_for(*tag);
            let value = coerce_by_vr(vr, text)?;
            object.put(DataElement::new(*tag, vr, Value::Primitive(value)));
        }
        Ok(object)
    }

    /// Rendered value of a tag, or `None` if the element is absent.
    pub fn rendered_value(&self, tag: Tag) -> Option<String> {
        let element = self.object.element(tag).ok()?;
        Some(value_to_string(element.value(), element.vr()))
    }

    /// VR used when writing a value to `tag`: the stored element's VR if
    /// present, the dictionary VR otherwise, `LO` as a last resort.
    pub fn vr_for(&self, tag: Tag) -> VR {
        if let Ok(element) = self.object.element(tag) {
            return element.vr();
        }
        StandardDataDictionary
            .by_tag(tag)
            .map(|entry| entry.vr.relaxed())
            .unwrap_or(VR::LO)
    }

    pub(crate) fn element_snapshot(&self, tag: Tag) -> Option<InMemElement> {
        self.object.element(tag).ok().cloned()
    }

    pub(crate) fn restore_element(&mut self, tag: Tag, previous: Option<InMemElement>) {
        match previous {
            Some(element) => {
                self.object.put(element);
            }
            None => {
                self.object.remove_element(tag);
            }
        }
    }

    /// Write a committed value into the dataset, coercing the text to the
    /// element's VR. Only the ledger commit path calls this; identity
    /// attributes edited here do not re-key the tree (callers re-insert
    /// the record if placement must change).
    pub fn apply_committed(&mut self, tag: Tag, text: &str) -> Result<()> {
        let vr = self.vr_for(tag);
        let value = coerce_by_vr(vr, text)?;
        self.object
            .put(DataElement::new(tag, vr, Value::Primitive(value)));
        Ok(())
    }

    /// Persist the current dataset back to its file origin.
    pub fn write_to_origin(&self) -> Result<()> {
        self.object
            .write_to_file(&self.path)
            .map_err(|e| Error::Persistence(format!("{}: {e}", self.path.display())))
    }
}

/// Convert user-entered text into a primitive value acceptable for `vr`.
fn coerce_by_vr(vr: VR, text: &str) -> Result<PrimitiveValue> {
    let trimmed = text.trim();
    let numeric = |what: &str| Error::Persistence(format!("{trimmed:?} is not a valid {what}"));

    let value = match vr {
        VR::IS | VR::SL => PrimitiveValue::from(
            trimmed.parse::<i32>().map_err(|_| numeric("integer"))?,
        ),
        VR::SS => PrimitiveValue::from(trimmed.parse::<i16>().map_err(|_| numeric("integer"))?),
        VR::US => PrimitiveValue::from(trimmed.parse::<u16>().map_err(|_| numeric("integer"))?),
        VR::UL => PrimitiveValue::from(trimmed.parse::<u32>().map_err(|_| numeric("integer"))?),
        VR::SV => PrimitiveValue::from(trimmed.parse::<i64>().map_err(|_| numeric("integer"))?),
        VR::UV => PrimitiveValue::from(trimmed.parse::<u64>().map_err(|_| numeric("integer"))?),
        VR::DS | VR::FD => PrimitiveValue::from(
            trimmed.parse::<f64>().map_err(|_| numeric("decimal"))?,
        ),
        VR::FL => PrimitiveValue::from(trimmed.parse::<f32>().map_err(|_| numeric("decimal"))?),
        _ => PrimitiveValue::from(trimmed),
    };
    Ok(value)
}

fn attribute_text(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
