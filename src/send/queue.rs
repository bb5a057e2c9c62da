//! Bounded worker pool executing send jobs.
//!
//! Jobs queue on an mpsc channel consumed by a fixed set of workers;
//! each job runs its blocking association work on the blocking pool.
//! Cancellation is cooperative through a per-job flag checked between
//! instance transfers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Destination, DEFAULT_CALLING_AE};
use crate::error::{Error, Result, TransferReason};
use crate::model::{HierarchyModel, NodeId};
use crate::send::association::{
    AssociationManager, PresentationProposal, SessionState, StoreOutcome, StoreTransport,
};
use crate::send::job::{InstanceStatus, InstanceTarget, JobSnapshot, JobStatus, SendJob};
use crate::send::scu::{ScuTransport, VERIFICATION_SOP_CLASS};
use crate::send::transcode::{self, EXPLICIT_VR_LE, IMPLICIT_VR_LE};
use crate::staging::StagingLedger;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub workers: usize,
    pub calling_ae_title: String,
    pub connect_timeout: Duration,
    /// Per-exchange (DIMSE read) timeout; expiry fails the instance,
    /// never the process.
    pub exchange_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            workers: 2,
            calling_ae_title: DEFAULT_CALLING_AE.to_string(),
            connect_timeout: Duration::from_secs(10),
            exchange_timeout: Duration::from_secs(30),
        }
    }
}

pub type BoxTransport = Box<dyn StoreTransport + Send>;

/// Builds one transport per job. The default factory opens real upper
/// layer associations; tests substitute scripted transports.
pub type TransportFactory = Arc<dyn Fn(&QueueOptions) -> BoxTransport + Send + Sync>;

#[derive(Clone)]
struct JobHandle {
    job: Arc<StdMutex<SendJob>>,
    cancel: Arc<AtomicBool>,
}

/// Job queue. Must be created inside a tokio runtime; workers live for
/// the queue's lifetime and drain remaining jobs on [`shutdown`].
///
/// [`shutdown`]: SendJobQueue::shutdown
pub struct SendJobQueue {
    options: QueueOptions,
    jobs: Arc<StdMutex<HashMap<Uuid, JobHandle>>>,
    tx: mpsc::UnboundedSender<Uuid>,
    workers: Vec<JoinHandle<()>>,
}

impl SendJobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self::with_transport(
            options,
            Arc::new(|opts: &QueueOptions| {
                Box::new(ScuTransport::new(opts.connect_timeout, opts.exchange_timeout))
                    as BoxTransport
            }),
        )
    }

    pub fn with_transport(options: QueueOptions, factory: TransportFactory) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Uuid>();
        let rx = Arc::new(AsyncMutex::new(rx));
        let jobs: Arc<StdMutex<HashMap<Uuid, JobHandle>>> = Arc::default();

        let workers = (0..options.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let jobs = Arc::clone(&jobs);
                let factory = Arc::clone(&factory);
                let options = options.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some(id) = next else { break };
                        let handle = {
                            let registry = lock_registry(&jobs);
                            registry.get(&id).cloned()
                        };
                        let Some(handle) = handle else { continue };

                        // Cancelled while still queued: removed from the
                        // pipeline without side effects.
                        if handle.cancel.load(Ordering::SeqCst) {
                            lock_job(&handle.job).settle(true);
                            continue;
                        }

                        let transport = factory(&options);
                        let run = handle.clone();
                        let run_options = options.clone();
                        let joined = tokio::task::spawn_blocking(move || {
                            run_job(&run, transport, &run_options)
                        })
                        .await;
                        if let Err(err) = joined {
                            log::error!("send job {id} panicked: {err}");
                            let mut job = lock_job(&handle.job);
                            job.error = Some(format!("internal failure: {err}"));
                            job.settle(false);
                        }
                    }
                    log::debug!("send worker {worker} exited");
                })
            })
            .collect();

        SendJobQueue {
            options,
            jobs,
            tx,
            workers,
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Queue the instances under `node` for transfer to `destination`.
    ///
    /// Dataset snapshots are frozen here with pending staged values
    /// applied; later edits or tree mutations do not affect the job.
    pub fn enqueue(
        &self,
        model: &HierarchyModel,
        ledger: &StagingLedger,
        node: NodeId,
        destination: &Destination,
    ) -> Result<Uuid> {
        model.node(node)?;
        let instances = model.instances_under(node);
        if instances.is_empty() {
            return Err(Error::NotFound("no instances under node to send".into()));
        }

        let mut targets = Vec::with_capacity(instances.len());
        for instance in instances {
            let record = model
                .record(instance)
                .ok_or_else(|| Error::NotFound(format!("no record on node {instance:?}")))?;
            let object = ledger.effective_snapshot(model, instance)?;
            targets.push(InstanceTarget::new(
                record.sop_instance_uid(),
                record.sop_class_uid(),
                record.transfer_syntax(),
                object,
            ));
        }

        let job = SendJob::new(node, destination.clone(), targets);
        let id = job.id;
        log::info!(
            "queued send job {id}: {} instance(s) to {}",
            job.targets.len(),
            destination.label
        );
        lock_registry(&self.jobs).insert(
            id,
            JobHandle {
                job: Arc::new(StdMutex::new(job)),
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        self.tx
            .send(id)
            .map_err(|_| Error::transfer(TransferReason::Aborted, "send queue is shut down"))?;
        Ok(id)
    }

    /// Request cancellation. A queued job terminates immediately; an
    /// in-flight one stops between instances.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let handle = lock_registry(&self.jobs)
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("send job {id}")))?;
        handle.cancel.store(true, Ordering::SeqCst);
        let mut job = lock_job(&handle.job);
        if job.status == JobStatus::Queued {
            job.finish(JobStatus::Cancelled);
        }
        log::info!("cancellation requested for send job {id}");
        Ok(())
    }

    pub fn job(&self, id: Uuid) -> Option<JobSnapshot> {
        let handle = lock_registry(&self.jobs).get(&id).cloned()?;
        let snapshot = lock_job(&handle.job).snapshot();
        Some(snapshot)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let handles: Vec<JobHandle> = lock_registry(&self.jobs).values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = handles
            .iter()
            .map(|h| lock_job(&h.job).snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Drop terminal jobs from the registry once the caller has
    /// consumed their outcomes. Returns how many were archived.
    pub fn clear_finished(&self) -> usize {
        let mut registry = lock_registry(&self.jobs);
        let before = registry.len();
        registry.retain(|_, handle| !lock_job(&handle.job).status.is_terminal());
        before - registry.len()
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_terminal(&self, id: Uuid) -> Option<JobSnapshot> {
        loop {
            let snapshot = self.job(id)?;
            if snapshot.status.is_terminal() {
                return Some(snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Stop accepting work, wait for the workers to drain every queued
    /// job to a terminal state, and return the final snapshots.
    pub async fn shutdown(self) -> Vec<JobSnapshot> {
        let SendJobQueue {
            jobs, tx, workers, ..
        } = self;
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
        let handles: Vec<JobHandle> = lock_registry(&jobs).values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = handles
            .iter()
            .map(|h| lock_job(&h.job).snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }
}

fn lock_registry(
    jobs: &Arc<StdMutex<HashMap<Uuid, JobHandle>>>,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobHandle>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

fn lock_job(job: &Arc<StdMutex<SendJob>>) -> std::sync::MutexGuard<'_, SendJob> {
    job.lock().unwrap_or_else(|e| e.into_inner())
}

/// One presentation context per SOP class in the job: the file syntaxes
/// seen for that class first, then the two native syntaxes, plus a
/// context for verification.
fn build_proposals(targets: &[InstanceTarget]) -> Vec<PresentationProposal> {
    let mut proposals: Vec<PresentationProposal> = Vec::new();
    for target in targets {
        let proposal = match proposals
            .iter_mut()
            .find(|p| p.abstract_syntax == target.sop_class_uid)
        {
            Some(existing) => existing,
            None => {
                proposals.push(PresentationProposal {
                    abstract_syntax: target.sop_class_uid.clone(),
                    transfer_syntaxes: Vec::new(),
                });
                proposals.last_mut().expect("just pushed")
            }
        };
        if !proposal.transfer_syntaxes.contains(&target.transfer_syntax) {
            proposal.transfer_syntaxes.push(target.transfer_syntax.clone());
        }
    }
    for proposal in &mut proposals {
        for native in [EXPLICIT_VR_LE, IMPLICIT_VR_LE] {
            if !proposal.transfer_syntaxes.iter().any(|ts| ts == native) {
                proposal.transfer_syntaxes.push(native.to_string());
            }
        }
    }
    proposals.push(PresentationProposal {
        abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
        transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
    });
    proposals
}

/// Drive one job to a terminal state. Runs on the blocking pool.
fn run_job(handle: &JobHandle, transport: BoxTransport, options: &QueueOptions) {
    let (id, destination, proposals, total) = {
        let mut job = lock_job(&handle.job);
        job.status = JobStatus::Associating;
        (
            job.id,
            job.destination.clone(),
            build_proposals(&job.targets),
            job.targets.len(),
        )
    };

    let mut manager = AssociationManager::new(transport);
    if let Err(err) = manager.establish(&destination, &options.calling_ae_title, &proposals) {
        log::error!("send job {id}: association failed: {err}");
        let mut job = lock_job(&handle.job);
        job.error = Some(err.to_string());
        job.finish(JobStatus::Failed);
        return;
    }
    manager.verify();
    lock_job(&handle.job).status = JobStatus::Sending;

    for index in 0..total {
        if handle.cancel.load(Ordering::SeqCst) {
            log::info!("send job {id}: cancelled after {index} instance(s)");
            break;
        }
        // Work on a clone so status queries never wait on network I/O.
        let mut target = lock_job(&handle.job).targets[index].clone();
        let association_alive = send_instance(&mut manager, &destination, &mut target);
        {
            let mut job = lock_job(&handle.job);
            job.targets[index] = target;
        }
        if !association_alive {
            log::error!("send job {id}: association lost, remaining instances not attempted");
            break;
        }
    }

    let cancelled = handle.cancel.load(Ordering::SeqCst);
    if manager.state() == SessionState::Established {
        if let Err(err) = manager.release() {
            log::warn!("send job {id}: release failed: {err}");
        }
    }

    let mut job = lock_job(&handle.job);
    job.settle(cancelled);
    log::info!(
        "send job {id} finished: {:?}, {}/{} sent",
        job.status,
        job.sent_count(),
        job.targets.len()
    );
}

/// Transfer one instance, spending the single transcode retry on a
/// syntax rejection. Returns false when the association is unusable and
/// the job must stop.
fn send_instance(
    manager: &mut AssociationManager<BoxTransport>,
    destination: &Destination,
    target: &mut InstanceTarget,
) -> bool {
    match manager.store(target) {
        Ok(StoreOutcome::SyntaxRejected) => retry_with_transcode(manager, destination, target),
        Ok(StoreOutcome::Failed(code)) => {
            target.status = InstanceStatus::Failed {
                reason: TransferReason::Rejected(code),
                message: format!("destination answered status 0x{code:04X}"),
            };
            true
        }
        Ok(outcome) => {
            mark_sent(target, outcome);
            true
        }
        Err(err) => {
            target.status = failed_from(err);
            false
        }
    }
}

fn retry_with_transcode(
    manager: &mut AssociationManager<BoxTransport>,
    destination: &Destination,
    target: &mut InstanceTarget,
) -> bool {
    if target.retried {
        target.status = InstanceStatus::Failed {
            reason: TransferReason::SyntaxUnsupported,
            message: "rejected again after transcoding".into(),
        };
        return true;
    }
    target.retried = true;

    let fallback =
        transcode::fallback_syntax(manager.accepted_syntax_for(&target.sop_class_uid));
    if let Err(err) = transcode::transcode_target(target, fallback) {
        target.status = failed_from(err);
        return true;
    }

    match manager.store(target) {
        Ok(outcome) if outcome.counts_as_sent() => {
            // The fallback path is the one place the destination learns
            // a working syntax for this SOP class.
            destination.note_accepted_syntax(&target.transfer_syntax);
            mark_sent(target, outcome);
            true
        }
        Ok(StoreOutcome::Failed(code)) => {
            target.status = InstanceStatus::Failed {
                reason: TransferReason::Rejected(code),
                message: format!("destination answered status 0x{code:04X}"),
            };
            true
        }
        Ok(_) => {
            target.status = InstanceStatus::Failed {
                reason: TransferReason::SyntaxUnsupported,
                message: "rejected again after transcoding".into(),
            };
            true
        }
        Err(err) => {
            target.status = failed_from(err);
            false
        }
    }
}

fn mark_sent(target: &mut InstanceTarget, outcome: StoreOutcome) {
    target.status = match outcome {
        StoreOutcome::Warning(code) => {
            log::warn!(
                "instance {} stored with warning status 0x{code:04X}",
                target.sop_instance_uid
            );
            InstanceStatus::Warning(code)
        }
        _ => InstanceStatus::Sent,
    };
}

fn failed_from(err: Error) -> InstanceStatus {
    match err {
        Error::Transfer { reason, detail } => InstanceStatus::Failed {
            reason,
            message: detail,
        },
        other => InstanceStatus::Failed {
            reason: TransferReason::Protocol,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::testkit::{synth_record, CT_IMAGE_STORAGE, EXPLICIT_VR_LE as EVRLE};

    #[test]
    fn proposals_group_by_sop_class_and_append_native_syntaxes() {
        let record = synth_record("P1", "ST1", "SE1", "I1", 1);
        let targets = vec![
            InstanceTarget::new("I1", CT_IMAGE_STORAGE, EVRLE, record.snapshot_object()),
            InstanceTarget::new("I2", CT_IMAGE_STORAGE, EVRLE, record.snapshot_object()),
        ];
        let proposals = build_proposals(&targets);

        // One storage context plus the verification context.
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].abstract_syntax, CT_IMAGE_STORAGE);
        assert_eq!(
            proposals[0].transfer_syntaxes,
            vec![EVRLE.to_string(), IMPLICIT_VR_LE.to_string()]
        );
        assert_eq!(proposals[1].abstract_syntax, VERIFICATION_SOP_CLASS);
    }

    #[test]
    fn default_options_use_the_standard_calling_ae() {
        let options = QueueOptions::default();
        assert_eq!(options.calling_ae_title, DEFAULT_CALLING_AE);
        assert!(options.workers >= 1);
    }
}
