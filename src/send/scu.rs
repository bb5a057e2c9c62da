//! [`StoreTransport`] over the DICOM upper layer.
//!
//! Association setup, PDU exchange, and DIMSE status parsing are
//! delegated to `dicom::ul`; this module only composes command sets and
//! maps statuses onto [`StoreOutcome`].

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use dicom::core::{dicom_value, DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::{InMemDicomObject, StandardDataDictionary};
use dicom::transfer_syntax::{entries, TransferSyntaxRegistry};
use dicom::ul::pdu::{PDataValue, PDataValueType, PresentationContextResultReason};
use dicom::ul::{ClientAssociation, ClientAssociationOptions, Pdu};

use crate::config::Destination;
use crate::error::{Error, Result, TransferReason};
use crate::send::association::{Negotiation, PresentationProposal, StoreOutcome, StoreTransport};
use crate::send::job::InstanceTarget;

pub const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";

const C_STORE_RQ: u16 = 0x0001;
const C_ECHO_RQ: u16 = 0x0030;

/// Production SCU transport. One value drives at most one association
/// at a time; the queue creates a fresh one per job.
pub struct ScuTransport {
    connect_timeout: Duration,
    exchange_timeout: Duration,
    association: Option<ClientAssociation<TcpStream>>,
    /// Accepted contexts: (abstract syntax, context id, transfer syntax).
    accepted: Vec<(String, u8, String)>,
    message_id: u16,
}

impl ScuTransport {
    pub fn new(connect_timeout: Duration, exchange_timeout: Duration) -> Self {
        ScuTransport {
            connect_timeout,
            exchange_timeout,
            association: None,
            accepted: Vec::new(),
            message_id: 1,
        }
    }

    fn next_message_id(&mut self) -> u16 {
        let id = self.message_id;
        self.message_id = self.message_id.wrapping_add(1);
        id
    }

    fn context_for(&self, abstract_syntax: &str) -> Result<(u8, String)> {
        self.accepted
            .iter()
            .find(|(class, _, _)| class == abstract_syntax)
            .map(|(_, id, ts)| (*id, ts.clone()))
            .ok_or_else(|| {
                Error::transfer(
                    TransferReason::SyntaxUnsupported,
                    format!("no accepted presentation context for {abstract_syntax}"),
                )
            })
    }

    /// Send one command set (and optional dataset) and read back the
    /// DIMSE status of the response.
    fn dimse_exchange(
        &mut self,
        context_id: u8,
        command: InMemDicomObject<StandardDataDictionary>,
        dataset: Option<(&InstanceTarget, &str)>,
    ) -> Result<u16> {
        let association = self
            .association
            .as_mut()
            .ok_or_else(|| Error::transfer(TransferReason::Protocol, "no open association"))?;

        let mut command_buf = Vec::with_capacity(128);
        command
            .write_dataset_with_ts(&mut command_buf, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))?;
        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: context_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: command_buf,
                }],
            })
            .map_err(|e| exchange_error(e.to_string()))?;

        if let Some((target, ts_uid)) = dataset {
            let ts = TransferSyntaxRegistry.get(ts_uid).ok_or_else(|| {
                Error::transfer(
                    TransferReason::SyntaxUnsupported,
                    format!("unknown transfer syntax {ts_uid}"),
                )
            })?;
            let mut dataset_buf = Vec::with_capacity(4096);
            target
                .object
                .write_dataset_with_ts(&mut dataset_buf, ts)
                .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))?;
            // PDU-sized chunking is the writer's concern.
            let mut pdata = association.send_pdata(context_id);
            pdata
                .write_all(&dataset_buf)
                .map_err(|e| exchange_error(e.to_string()))?;
        }

        let response = association
            .receive()
            .map_err(|e| exchange_error(e.to_string()))?;
        let fragment = match response {
            Pdu::PData { data } => data.into_iter().next().ok_or_else(|| {
                Error::transfer(TransferReason::Protocol, "empty P-DATA response")
            })?,
            Pdu::AbortRQ { .. } => {
                return Err(Error::transfer(
                    TransferReason::Aborted,
                    "association aborted by the destination",
                ))
            }
            other => {
                return Err(Error::transfer(
                    TransferReason::Protocol,
                    format!("unexpected PDU in response: {other:?}"),
                ))
            }
        };
        let response_command = InMemDicomObject::read_dataset_with_ts(
            &fragment.data[..],
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))?;
        response_command
            .element(tags::STATUS)
            .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))?
            .to_int::<u16>()
            .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))
    }
}

impl StoreTransport for ScuTransport {
    fn establish(
        &mut self,
        destination: &Destination,
        calling_ae: &str,
        proposals: &[PresentationProposal],
    ) -> Result<Negotiation> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae)
            .called_ae_title(&destination.ae_title)
            .connection_timeout(self.connect_timeout)
            .read_timeout(self.exchange_timeout);
        // One context per proposal, each carrying its own
        // transfer-syntax list, ids 1, 3, 5... in proposal order.
        for proposal in proposals {
            options = options.with_presentation_context(
                proposal.abstract_syntax.clone(),
                proposal.transfer_syntaxes.clone(),
            );
        }

        let address = destination.addr();
        log::info!("opening association to {} ({address})", destination.label);
        let association = options
            .establish_with(&address)
            .map_err(|e| Error::Negotiation(format!("{}: {e}", destination.label)))?;

        self.accepted = association
            .presentation_contexts()
            .iter()
            .filter(|ctx| ctx.reason == PresentationContextResultReason::Acceptance)
            .filter_map(|ctx| {
                // Context id 2k+1 corresponds to the k-th proposal.
                let index = (ctx.id as usize).checked_sub(1)? / 2;
                let proposal = proposals.get(index)?;
                Some((
                    proposal.abstract_syntax.clone(),
                    ctx.id,
                    ctx.transfer_syntax.trim().to_string(),
                ))
            })
            .collect();
        self.association = Some(association);

        if self.accepted.is_empty() {
            self.abort();
            return Err(Error::Negotiation(format!(
                "{}: no presentation context accepted",
                destination.label
            )));
        }
        Ok(Negotiation::new(
            self.accepted
                .iter()
                .map(|(class, _, ts)| (class.clone(), ts.clone()))
                .collect(),
        ))
    }

    fn store(&mut self, target: &InstanceTarget) -> Result<StoreOutcome> {
        let (context_id, accepted_ts) = self.context_for(&target.sop_class_uid)?;
        let message_id = self.next_message_id();
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, target.sop_class_uid.clone()),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0000]),
            ),
            DataElement::new(
                tags::AFFECTED_SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, target.sop_instance_uid.clone()),
            ),
        ]);

        let status = self.dimse_exchange(context_id, command, Some((target, &accepted_ts)))?;
        log::info!(
            "C-STORE {} -> status 0x{status:04X}",
            target.sop_instance_uid
        );
        Ok(map_store_status(status))
    }

    fn verify(&mut self) -> Result<()> {
        let (context_id, _) = self.context_for(VERIFICATION_SOP_CLASS)?;
        let message_id = self.next_message_id();
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, VERIFICATION_SOP_CLASS),
            ),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
            DataElement::new(
                tags::COMMAND_DATA_SET_TYPE,
                VR::US,
                dicom_value!(U16, [0x0101]),
            ),
        ]);
        let status = self.dimse_exchange(context_id, command, None)?;
        if status != 0x0000 {
            return Err(Error::transfer(
                TransferReason::Rejected(status),
                format!("C-ECHO answered status 0x{status:04X}"),
            ));
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(association) = self.association.take() {
            association
                .release()
                .map_err(|e| Error::transfer(TransferReason::Protocol, e.to_string()))?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(association) = self.association.take() {
            if let Err(err) = association.abort() {
                log::warn!("abort failed: {err}");
            }
        }
    }
}

/// DIMSE status to outcome. Warning statuses count as stored; the
/// "cannot understand" classes are treated as syntax rejections so the
/// transcode fallback gets a chance.
fn map_store_status(status: u16) -> StoreOutcome {
    match status {
        0x0000 => StoreOutcome::Success,
        0xB000 | 0xB006 | 0xB007 => StoreOutcome::Warning(status),
        0x0122 => StoreOutcome::SyntaxRejected,
        s if (0xC000..=0xCFFF).contains(&s) => StoreOutcome::SyntaxRejected,
        other => StoreOutcome::Failed(other),
    }
}

fn exchange_error(detail: String) -> Error {
    let reason = if detail.contains("timed out") || detail.contains("timeout") {
        TransferReason::Timeout
    } else {
        TransferReason::Protocol
    };
    Error::transfer(reason, detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_status_mapping_matches_dimse_semantics() {
        assert_eq!(map_store_status(0x0000), StoreOutcome::Success);
        assert_eq!(map_store_status(0xB000), StoreOutcome::Warning(0xB000));
        assert_eq!(map_store_status(0xB007), StoreOutcome::Warning(0xB007));
        assert_eq!(map_store_status(0x0122), StoreOutcome::SyntaxRejected);
        assert_eq!(map_store_status(0xC123), StoreOutcome::SyntaxRejected);
        assert_eq!(map_store_status(0xA700), StoreOutcome::Failed(0xA700));
    }

    #[test]
    fn timeouts_map_to_the_timeout_reason() {
        let err = exchange_error("operation timed out".into());
        assert!(matches!(
            err,
            Error::Transfer {
                reason: TransferReason::Timeout,
                ..
            }
        ));
    }
}
