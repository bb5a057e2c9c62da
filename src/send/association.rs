//! Association lifecycle and the transport seam.
//!
//! [`AssociationManager`] owns the session state machine; the wire
//! protocol itself lives behind [`StoreTransport`]. Storing outside an
//! established session is rejected at this layer, so no transport ever
//! sees a C-STORE after release.

use crate::config::Destination;
use crate::error::{Error, Result, TransferReason};
use crate::send::job::InstanceTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Associating,
    Established,
    Released,
    Aborted,
}

/// Result of one C-STORE exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Success,
    /// Accepted with a warning status code; counts as sent.
    Warning(u16),
    /// The destination cannot take the instance in its current transfer
    /// syntax. Recoverable through the transcode fallback.
    SyntaxRejected,
    Failed(u16),
}

impl StoreOutcome {
    pub fn counts_as_sent(&self) -> bool {
        matches!(self, StoreOutcome::Success | StoreOutcome::Warning(_))
    }
}

/// One proposed presentation context: an abstract syntax (SOP class)
/// with transfer syntaxes in preference order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationProposal {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// Accepted presentation contexts, keyed by abstract syntax.
#[derive(Debug, Clone, Default)]
pub struct Negotiation {
    accepted: Vec<(String, String)>,
}

impl Negotiation {
    pub fn new(accepted: Vec<(String, String)>) -> Self {
        Negotiation { accepted }
    }

    pub fn transfer_syntax_for(&self, abstract_syntax: &str) -> Option<&str> {
        self.accepted
            .iter()
            .find(|(class, _)| class == abstract_syntax)
            .map(|(_, ts)| ts.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }

    pub fn accepted(&self) -> &[(String, String)] {
        &self.accepted
    }
}

/// Wire protocol seam. The production implementation speaks the DICOM
/// upper layer ([`ScuTransport`](crate::send::scu::ScuTransport));
/// tests substitute scripted ones.
pub trait StoreTransport {
    /// Open an association and negotiate the proposed contexts. An
    /// association with no accepted context is an `Err(Negotiation)`,
    /// with the underlying connection already torn down.
    fn establish(
        &mut self,
        destination: &Destination,
        calling_ae: &str,
        proposals: &[PresentationProposal],
    ) -> Result<Negotiation>;

    /// Transfer one instance over the current association.
    fn store(&mut self, target: &InstanceTarget) -> Result<StoreOutcome>;

    /// C-ECHO over the current association.
    fn verify(&mut self) -> Result<()>;

    fn release(&mut self) -> Result<()>;

    fn abort(&mut self);
}

impl<T: StoreTransport + ?Sized> StoreTransport for Box<T> {
    fn establish(
        &mut self,
        destination: &Destination,
        calling_ae: &str,
        proposals: &[PresentationProposal],
    ) -> Result<Negotiation> {
        (**self).establish(destination, calling_ae, proposals)
    }

    fn store(&mut self, target: &InstanceTarget) -> Result<StoreOutcome> {
        (**self).store(target)
    }

    fn verify(&mut self) -> Result<()> {
        (**self).verify()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }

    fn abort(&mut self) {
        (**self).abort()
    }
}

/// Session state machine over a [`StoreTransport`].
#[derive(Debug)]
pub struct AssociationManager<T> {
    transport: T,
    state: SessionState,
    negotiation: Negotiation,
}

impl<T: StoreTransport> AssociationManager<T> {
    pub fn new(transport: T) -> Self {
        AssociationManager {
            transport,
            state: SessionState::Idle,
            negotiation: Negotiation::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transfer syntax the destination accepted for this SOP class, if
    /// any context for it was negotiated.
    pub fn accepted_syntax_for(&self, sop_class_uid: &str) -> Option<&str> {
        self.negotiation.transfer_syntax_for(sop_class_uid)
    }

    pub fn establish(
        &mut self,
        destination: &Destination,
        calling_ae: &str,
        proposals: &[PresentationProposal],
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Negotiation(format!(
                "cannot associate from state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Associating;
        match self.transport.establish(destination, calling_ae, proposals) {
            Ok(negotiation) => {
                log::info!(
                    "association established with {} ({}): {} context(s) accepted",
                    destination.label,
                    destination.addr(),
                    negotiation.accepted().len()
                );
                self.negotiation = negotiation;
                self.state = SessionState::Established;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Aborted;
                Err(err)
            }
        }
    }

    /// C-ECHO over the established association. Verification failures
    /// are logged, never fatal.
    pub fn verify(&mut self) {
        if self.state != SessionState::Established {
            return;
        }
        match self.transport.verify() {
            Ok(()) => log::info!("verification (C-ECHO) succeeded"),
            Err(err) => log::warn!("verification (C-ECHO) failed: {err}"),
        }
    }

    /// Transfer one instance. Answers `SyntaxRejected` locally when no
    /// negotiated context matches the instance's SOP class and transfer
    /// syntax, without putting anything on the wire.
    pub fn store(&mut self, target: &InstanceTarget) -> Result<StoreOutcome> {
        if self.state != SessionState::Established {
            return Err(Error::transfer(
                TransferReason::Protocol,
                format!("store attempted in state {:?}", self.state),
            ));
        }
        match self.negotiation.transfer_syntax_for(&target.sop_class_uid) {
            None => Ok(StoreOutcome::SyntaxRejected),
            Some(ts) if ts != target.transfer_syntax => Ok(StoreOutcome::SyntaxRejected),
            Some(_) => match self.transport.store(target) {
                Ok(outcome) => Ok(outcome),
                Err(err) => {
                    // The exchange is in an unknown state; tear down.
                    self.transport.abort();
                    self.state = SessionState::Aborted;
                    Err(err)
                }
            },
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if self.state != SessionState::Established {
            return Err(Error::transfer(
                TransferReason::Protocol,
                format!("release attempted in state {:?}", self.state),
            ));
        }
        self.state = SessionState::Released;
        self.transport.release()
    }

    pub fn abort(&mut self) {
        if matches!(
            self.state,
            SessionState::Associating | SessionState::Established
        ) {
            self.transport.abort();
        }
        self.state = SessionState::Aborted;
    }
}
