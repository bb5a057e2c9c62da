//! Shared fixtures: synthetic CT instances small enough to transcode.
#![allow(dead_code)]

use std::path::PathBuf;

use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::meta::FileMetaTableBuilder;
use dicom::object::{DefaultDicomObject, FileDicomObject};
use dicomforge::Record;

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// A complete 2x2 8-bit MONOCHROME2 instance, so transfer-syntax
/// conversion has real pixel data to work with.
pub fn synth_object(
    patient: &str,
    study: &str,
    series: &str,
    sop: &str,
    instance_number: i64,
) -> DefaultDicomObject {
    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LE)
        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop)
        .build()
        .expect("file meta");
    let mut object = FileDicomObject::new_empty_with_meta(meta);

    let put_str = |object: &mut DefaultDicomObject, tag, vr, value: &str| {
        object.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
    };
    put_str(&mut object, tags::PATIENT_ID, VR::LO, patient);
    put_str(
        &mut object,
        tags::PATIENT_NAME,
        VR::PN,
        &format!("Name^{patient}"),
    );
    put_str(&mut object, tags::STUDY_INSTANCE_UID, VR::UI, study);
    put_str(&mut object, tags::SERIES_INSTANCE_UID, VR::UI, series);
    put_str(&mut object, tags::SOP_INSTANCE_UID, VR::UI, sop);
    put_str(&mut object, tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE);
    put_str(
        &mut object,
        tags::INSTANCE_NUMBER,
        VR::IS,
        &instance_number.to_string(),
    );
    put_str(
        &mut object,
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        "MONOCHROME2",
    );

    let put_u16 = |object: &mut DefaultDicomObject, tag, value: u16| {
        object.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
    };
    put_u16(&mut object, tags::SAMPLES_PER_PIXEL, 1);
    put_u16(&mut object, tags::ROWS, 2);
    put_u16(&mut object, tags::COLUMNS, 2);
    put_u16(&mut object, tags::BITS_ALLOCATED, 8);
    put_u16(&mut object, tags::BITS_STORED, 8);
    put_u16(&mut object, tags::HIGH_BIT, 7);
    put_u16(&mut object, tags::PIXEL_REPRESENTATION, 0);
    object.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OB,
        PrimitiveValue::U8(vec![0u8, 64, 128, 255].into()),
    ));
    object
}

pub fn synth_record(
    patient: &str,
    study: &str,
    series: &str,
    sop: &str,
    instance_number: i64,
) -> Record {
    Record::from_object(
        synth_object(patient, study, series, sop, instance_number),
        PathBuf::from(format!("{sop}.dcm")),
    )
}
