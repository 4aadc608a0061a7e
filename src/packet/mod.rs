//! Packet Layer
//!
//! The request descriptor and everything that moves it: addressing,
//! attribute flags, the shared state/control block, the completion
//! callback stack, service queues, sub-request fan-out, and the
//! per-packet diagnostic tracker.

pub mod address;
pub mod completion;
pub mod fanout;
pub mod flags;
#[allow(clippy::module_inception)]
pub mod packet;
pub mod queue;
pub mod state;
pub mod tracker;

pub use address::{
    ClassId, ObjectId, PackageId, PacketAddress, ServiceId, INVALID_ID,
};
pub use completion::{
    CompletionDisposition, CompletionFn, SyncCompletion,
    COMPLETION_STACK_DEPTH, DEFAULT_LEVEL,
};
pub use fanout::FanOut;
pub use flags::PacketFlags;
pub use packet::{Packet, PacketId, PacketPriority};
pub use queue::PacketQueue;
pub use state::{
    CancelHook, CancelOutcome, ErrorPrecedence, PacketControl, PacketState,
    PacketStatus, StatusCode,
};
pub use tracker::{TrackerAction, TrackerEntry, TrackerRing, TRACKER_DEPTH};
