//! Send job state.
//!
//! A job freezes its instance list and dataset snapshots at enqueue
//! time. Later tree mutations or staged edits never affect a job in
//! flight; per-instance results are kept on the job so callers never
//! re-derive failures from logs.

use chrono::{DateTime, Utc};
use dicom::object::DefaultDicomObject;
use uuid::Uuid;

use crate::config::Destination;
use crate::error::TransferReason;
use crate::model::NodeId;

/// Outcome of one instance within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Sent,
    /// Stored with a warning status code; counts as sent.
    Warning(u16),
    Failed {
        reason: TransferReason,
        message: String,
    },
}

impl InstanceStatus {
    pub fn counts_as_sent(&self) -> bool {
        matches!(self, InstanceStatus::Sent | InstanceStatus::Warning(_))
    }
}

/// One frozen instance to transfer.
#[derive(Debug, Clone)]
pub struct InstanceTarget {
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    /// Current encoding of `object`; rewritten by the transcode fallback.
    pub transfer_syntax: String,
    pub object: DefaultDicomObject,
    pub status: InstanceStatus,
    /// Set once the single transcode-and-resubmit has been spent.
    pub retried: bool,
}

impl InstanceTarget {
    pub fn new(
        sop_instance_uid: impl Into<String>,
        sop_class_uid: impl Into<String>,
        transfer_syntax: impl Into<String>,
        object: DefaultDicomObject,
    ) -> Self {
        InstanceTarget {
            sop_instance_uid: sop_instance_uid.into(),
            sop_class_uid: sop_class_uid.into(),
            transfer_syntax: transfer_syntax.into(),
            object,
            status: InstanceStatus::Pending,
            retried: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Associating,
    Sending,
    /// Every instance transferred (warnings included).
    Succeeded,
    /// At least one transferred and at least one did not.
    PartiallyFailed,
    /// Nothing transferred.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded
                | JobStatus::PartiallyFailed
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }
}

#[derive(Debug)]
pub struct SendJob {
    pub id: Uuid,
    /// Subtree root the instances were resolved from. Informational
    /// once the targets are frozen; may no longer exist in the tree.
    pub source: NodeId,
    pub destination: Destination,
    pub targets: Vec<InstanceTarget>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Job-level failure detail (association refusal, cancellation note).
    pub error: Option<String>,
}

impl SendJob {
    pub fn new(source: NodeId, destination: Destination, targets: Vec<InstanceTarget>) -> Self {
        SendJob {
            id: Uuid::new_v4(),
            source,
            destination,
            targets,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn sent_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.status.counts_as_sent())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t.status, InstanceStatus::Failed { .. }))
            .count()
    }

    pub(crate) fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Derive the terminal status from per-instance results. A set
    /// cancel flag wins over the aggregate.
    pub(crate) fn settle(&mut self, cancelled: bool) {
        let status = if cancelled {
            JobStatus::Cancelled
        } else {
            let sent = self.sent_count();
            if sent == self.targets.len() {
                JobStatus::Succeeded
            } else if sent == 0 {
                JobStatus::Failed
            } else {
                JobStatus::PartiallyFailed
            }
        };
        self.finish(status);
    }

    /// Cheap copy of the observable state, without dataset snapshots.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            destination: self.destination.label.clone(),
            status: self.status,
            total: self.targets.len(),
            sent: self.sent_count(),
            failed: self.failed_count(),
            created_at: self.created_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            instances: self
                .targets
                .iter()
                .map(|t| (t.sop_instance_uid.clone(), t.status.clone()))
                .collect(),
        }
    }
}

/// Observable job state handed to status inspectors.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub destination: String,
    pub status: JobStatus,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub instances: Vec<(String, InstanceStatus)>,
}
