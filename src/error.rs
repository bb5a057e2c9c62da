//! Error types shared across the crate.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a per-instance transfer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReason {
    /// The destination refused the instance's transfer syntax.
    SyntaxUnsupported,
    /// Connect or DIMSE timeout expired.
    Timeout,
    /// The destination answered with a failure status code.
    Rejected(u16),
    /// The association was aborted mid-transfer.
    Aborted,
    /// Malformed or unexpected protocol exchange.
    Protocol,
}

#[derive(Error, Debug)]
pub enum Error {
    /// UID or node lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation would violate UID uniqueness or another tree invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Staging against a target with no writable Record in scope.
    #[error("not editable: {0}")]
    NotEditable(String),

    /// No common capability could be negotiated with a destination.
    #[error("association negotiation failed: {0}")]
    Negotiation(String),

    /// Per-instance send failure.
    #[error("transfer failed ({reason:?}): {detail}")]
    Transfer {
        reason: TransferReason,
        detail: String,
    },

    /// External write failed during commit, or the committed value could
    /// not be represented under the element's VR.
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside the DICOM codec stack.
    #[error("DICOM error: {0}")]
    Dicom(String),
}

impl Error {
    pub(crate) fn transfer(reason: TransferReason, detail: impl Into<String>) -> Self {
        Error::Transfer {
            reason,
            detail: detail.into(),
        }
    }

    /// True when [`TranscodeFallback`](crate::send) may recover this failure.
    pub fn is_syntax_rejection(&self) -> bool {
        matches!(
            self,
            Error::Transfer {
                reason: TransferReason::SyntaxUnsupported,
                ..
            }
        )
    }
}
