//! Site-to-site messages for the execution core.
//!
//! Message contracts only: field layout and helpers. Byte encoding is left to
//! the transport; every type derives `serde` so any codec can carry it.

mod envelope;
mod fault;
mod fragment;
mod heartbeat;
mod initiate;

pub use envelope::{Envelope, SiteMessage, Subject};
pub use fault::{FailureSiteUpdateMessage, SiteFailureFault};
pub use fragment::{
    CompleteTransactionMessage, FragmentResponseMessage, FragmentStatus, FragmentTaskMessage,
};
pub use heartbeat::{HeartbeatMessage, HeartbeatResponseMessage, QueueState};
pub use initiate::{InitiateResponseMessage, InitiateTaskMessage, MultiPartitionParticipantMessage};
