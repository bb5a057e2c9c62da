//! Tag and value rendering helpers.
//!
//! Staged-edit baselines are compared as rendered strings, so rendering
//! here must be stable for a given stored value.

use dicom::core::value::{PrimitiveValue, Value};
use dicom::core::{Tag, VR};

/// Render an element value for display and for baseline snapshots.
pub fn value_to_string<I, P>(value: &Value<I, P>, vr: VR) -> String {
    match value {
        Value::Primitive(primitive) => format_primitive_value(primitive, vr),
        Value::Sequence(sequence) => {
            let count = sequence.multiplicity() as usize;
            let suffix = if count == 1 { "" } else { "s" };
            format!("Sequence ({count} item{suffix})")
        }
        Value::PixelSequence(sequence) => {
            let fragments = sequence.fragments().len();
            let suffix = if fragments == 1 { "" } else { "s" };
            format!("Pixel data ({fragments} fragment{suffix})")
        }
    }
}

pub fn format_tag(tag: Tag) -> String {
    format!("{:04X},{:04X}", tag.group(), tag.element())
}

/// Parse `"GGGG,EEEE"` into a [`Tag`].
pub fn parse_tag(text: &str) -> Option<Tag> {
    let (group, element) = text.trim().split_once(',')?;
    let group = u16::from_str_radix(group.trim(), 16).ok()?;
    let element = u16::from_str_radix(element.trim(), 16).ok()?;
    Some(Tag(group, element))
}

fn format_primitive_value(value: &PrimitiveValue, vr: VR) -> String {
    match value {
        PrimitiveValue::Empty => String::new(),
        PrimitiveValue::Tags(values) => values
            .iter()
            .map(|tag| format_tag(*tag))
            .collect::<Vec<_>>()
            .join("\\"),
        PrimitiveValue::U8(_) if is_binary_vr(vr) => {
            format!("Binary data ({} bytes)", value.calculate_byte_len())
        }
        _ => value.to_str().trim().to_string(),
    }
}

pub(crate) fn is_binary_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::UN
    )
}
