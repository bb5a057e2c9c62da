pub mod association;
pub mod job;
pub mod queue;
pub mod scu;
pub mod transcode;

pub use association::{
    AssociationManager, Negotiation, PresentationProposal, SessionState, StoreOutcome,
    StoreTransport,
};
pub use job::{InstanceStatus, InstanceTarget, JobSnapshot, JobStatus, SendJob};
pub use queue::{BoxTransport, QueueOptions, SendJobQueue, TransportFactory};
pub use scu::ScuTransport;
pub use transcode::{EXPLICIT_VR_LE, IMPLICIT_VR_LE};
