//! # Packet Transport Core
//!
//! The request-carrying machinery of a storage controller: packets move
//! client I/O between objects, carrying a stack of typed payload
//! operations down and a stack of completion callbacks back up.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Packet                              │
//! │  address │ flags │ state │ tracker │ resource request       │
//! │                                                             │
//! │  payload operation stack        completion callback stack   │
//! │  ┌───────────────────┐          ┌───────────────────┐       │
//! │  │ block / control / │  down ─▶ │ layer N callback  │ ─▲    │
//! │  │ cdb / stripe lock │          │        ...        │  │ up │
//! │  │ / metadata / ...  │          │ layer 0 callback  │  │    │
//! │  └───────────────────┘          └───────────────────┘       │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │
//!     ┌──────────┼─────────────┬──────────────┬─────────────┐
//!     ▼          ▼             ▼              ▼             ▼
//!  ObjectEdge  PacketQueue  FanOut        TimerService   RunQueue
//!  (topology)  (parking)    (sub-request  (expiration)   (deferred
//!                            fan-in)                      completion)
//! ```
//!
//! Packets are owned by value and passed between layers; cancellers and
//! timers act through the shared [`PacketControl`] block instead of
//! holding the packet itself.
//!
//! ## Example
//!
//! ```
//! use packet_transport::{
//!     BlockOpcode, CompletionDisposition, OperationKind, Packet,
//!     PacketStatus,
//! };
//!
//! let mut packet = Packet::new();
//! packet.start()?;
//!
//! // Build a read operation on the payload stack
//! let handle = packet.payload_mut().allocate(OperationKind::Block)?;
//! let block = packet.payload_mut().get_mut(handle)?;
//! block
//!     .as_block_mut()
//!     .expect("block operation")
//!     .build(BlockOpcode::Read, 0x100, 8, 520, 64, None);
//! packet.payload_mut().promote();
//!
//! // Register a completion and unwind
//! packet.set_completion(Box::new(|p| {
//!     assert!(p.status().code == packet_transport::StatusCode::Ok);
//!     CompletionDisposition::Continue
//! }))?;
//! packet.complete_with(PacketStatus::ok())?;
//! # Ok::<(), packet_transport::Error>(())
//! ```

pub mod edge;
pub mod error;
pub mod packet;
pub mod payload;
pub mod resource;
pub mod run_queue;
pub mod timer;

pub use edge::{
    EdgeHook, HookAction, ObjectEdge, PathState, TransportKind,
};
pub use error::{Error, ErrorClass, Result};
pub use packet::{
    CancelHook, CancelOutcome, ClassId, CompletionDisposition, CompletionFn,
    ErrorPrecedence, FanOut, ObjectId, PackageId, Packet, PacketAddress,
    PacketControl, PacketFlags, PacketId, PacketPriority, PacketQueue,
    PacketState, PacketStatus, ServiceId, StatusCode, SyncCompletion,
    TrackerAction, TrackerEntry, TrackerRing, COMPLETION_STACK_DEPTH,
    DEFAULT_LEVEL, INVALID_ID, TRACKER_DEPTH,
};
pub use payload::{
    BlockCount, BlockFlags, BlockOpcode, BlockOperation, BlockSize,
    ControlOperation, Lba, Operation, OperationHandle, OperationKind,
    OperationStack, OperationStatus, PreReadDescriptor,
    PAYLOAD_MEMORY_SIZE, PAYLOAD_SLOT_COUNT,
};
pub use resource::{
    AllocationCompletion, AllocatorStats, PoolConfig, PooledAllocator,
    ResourceAllocator, ResourceGrant, ResourceKind, ResourceRequest,
    CHUNK_SIZE,
};
pub use run_queue::{
    DispatchPolicy, RejectedPacket, RunQueue, RunQueueConfig, RunQueueStats,
    DEPTH_HISTOGRAM_BUCKETS,
};
pub use timer::{TimerHandle, TimerService};
