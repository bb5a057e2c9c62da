//! Transfer-syntax fallback for rejected instances.
//!
//! One retry per instance per job: on a syntax rejection the snapshot
//! is re-encoded to the destination's accepted native syntax (Explicit
//! VR Little Endian when nothing better is known) and resubmitted once.
//! A second rejection is final for that instance.

use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::pixeldata::Transcode;
use dicom::transfer_syntax::TransferSyntaxRegistry;

use crate::error::{Error, Result, TransferReason};
use crate::send::job::InstanceTarget;

pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

/// Syntax to re-encode into after a rejection. The accepted syntax is
/// honored when it is one the codec can always produce; otherwise the
/// most widely implemented choice.
pub(crate) fn fallback_syntax(accepted: Option<&str>) -> &'static str {
    match accepted {
        Some(IMPLICIT_VR_LE) => IMPLICIT_VR_LE,
        _ => EXPLICIT_VR_LE,
    }
}

/// Re-encode the target's snapshot in place and update its recorded
/// transfer syntax. Runs on the blocking pool; pixel data may be
/// decoded as part of the conversion.
pub(crate) fn transcode_target(target: &mut InstanceTarget, ts_uid: &str) -> Result<()> {
    let ts = TransferSyntaxRegistry.get(ts_uid).ok_or_else(|| {
        Error::transfer(
            TransferReason::SyntaxUnsupported,
            format!("unknown transfer syntax {ts_uid}"),
        )
    })?;
    log::info!(
        "transcoding {} from {} to {ts_uid}",
        target.sop_instance_uid,
        target.transfer_syntax
    );
    target.object.transcode(ts).map_err(|err| {
        Error::transfer(
            TransferReason::SyntaxUnsupported,
            format!("transcoding {} failed: {err}", target.sop_instance_uid),
        )
    })?;
    target.transfer_syntax = ts_uid.to_string();
    Ok(())
}
