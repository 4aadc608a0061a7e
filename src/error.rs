//! Error types for the packet transport core
//!
//! Provides structured error types for all transport components including
//! the payload operation stack, the completion stack, sub-request fan-in,
//! resource allocation, and dispatch.

use thiserror::Error;

use crate::payload::OperationKind;

/// Unified error type for the transport core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Payload Stack Errors
    // =========================================================================
    #[error("Operation already pending on payload stack: {pending}")]
    OperationPending { pending: OperationKind },

    #[error("Payload memory exhausted: requested {requested} bytes, remaining {remaining} bytes")]
    PayloadMemoryExhausted { requested: usize, remaining: usize },

    #[error("Payload slots exhausted: all {capacity} slots in use")]
    PayloadSlotsExhausted { capacity: usize },

    #[error("Operation kind mismatch: expected {expected}, found {found}")]
    OperationKindMismatch {
        expected: OperationKind,
        found: OperationKind,
    },

    #[error("Release target is neither the current nor the pending operation")]
    ReleaseNotTop,

    #[error("No current operation on payload stack")]
    NoCurrentOperation,

    #[error("Invalid operation handle: {handle}")]
    InvalidOperationHandle { handle: usize },

    // =========================================================================
    // Completion Stack Errors
    // =========================================================================
    #[error("Completion stack exhausted: level {level} at depth limit {depth}")]
    CompletionStackExhausted { level: i8, depth: usize },

    #[error("No completion level to unwind: level {level}")]
    CompletionStackUnderflow { level: i8 },

    #[error("Completion level mismatch: current {current}, expected {expected}")]
    CompletionLevelMismatch { current: i8, expected: i8 },

    // =========================================================================
    // Packet State Errors
    // =========================================================================
    #[error("Invalid packet state transition: {from} -> {to}")]
    InvalidStateTransition { from: &'static str, to: &'static str },

    #[error("Packet completed more than once")]
    DoubleCompletion,

    #[error("Packet is already on a queue")]
    AlreadyQueued,

    #[error("Packet is not on a queue")]
    NotQueued,

    #[error("Packet completed while resting on a queue")]
    CompletionWhileQueued,

    // =========================================================================
    // Sub-request Errors
    // =========================================================================
    #[error("Subpacket has no master")]
    NoMasterPacket,

    #[error("Master packet still has {remaining} outstanding subpackets")]
    SubpacketsOutstanding { remaining: usize },

    #[error("Master packet was canceled; subpacket rejected")]
    MasterCanceled,

    #[error("Subpacket is still linked to a master")]
    MasterStillLinked,

    // =========================================================================
    // Resource Allocation Errors
    // =========================================================================
    #[error("Resource allocation request already in flight")]
    AllocationInFlight,

    #[error("Resource pool exhausted: requested {requested} chunks, available {available}")]
    PoolExhausted { requested: usize, available: usize },

    #[error("Outstanding resource credits on release: {credits}")]
    OutstandingCredits { credits: u64 },

    #[error("Resource request not complete")]
    AllocationIncomplete,

    // =========================================================================
    // Timer / Dispatch Errors
    // =========================================================================
    #[error("Timer handle not found (expired or canceled): {handle}")]
    TimerNotFound { handle: u64 },

    #[error("Cannot arm a timer with a zero timeout")]
    ZeroTimeout,

    #[error("Run queue is shut down")]
    RunQueueShutdown,

    #[error("Invalid core id {core} (cores: {cores})")]
    InvalidCore { core: usize, cores: usize },
}

/// Classification of an error for caller policy decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Synchronous API misuse; logged, state never silently repaired
    ProtocolMisuse,
    /// Inline budget or external pool exhausted; retry is the caller's call
    ResourceExhaustion,
    /// Expiration delivered through the normal completion path
    Timeout,
    /// Cooperative, best-effort cancellation
    Cancellation,
    /// Corruption risk; reported as a detectable error, never an abort
    Critical,
}

impl Error {
    /// Classify this error for caller policy decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OperationPending { .. }
            | Error::OperationKindMismatch { .. }
            | Error::ReleaseNotTop
            | Error::NoCurrentOperation
            | Error::InvalidOperationHandle { .. }
            | Error::CompletionStackExhausted { .. }
            | Error::CompletionStackUnderflow { .. }
            | Error::CompletionLevelMismatch { .. }
            | Error::InvalidStateTransition { .. }
            | Error::AlreadyQueued
            | Error::NotQueued
            | Error::NoMasterPacket
            | Error::AllocationInFlight
            | Error::AllocationIncomplete
            | Error::ZeroTimeout
            | Error::InvalidCore { .. } => ErrorClass::ProtocolMisuse,

            // A cancel that loses the race to the sweeper: the deadline
            // fired, not a misuse.
            Error::TimerNotFound { .. } => ErrorClass::Timeout,

            Error::PayloadMemoryExhausted { .. }
            | Error::PayloadSlotsExhausted { .. }
            | Error::PoolExhausted { .. }
            | Error::RunQueueShutdown => ErrorClass::ResourceExhaustion,

            Error::MasterCanceled => ErrorClass::Cancellation,

            Error::DoubleCompletion
            | Error::CompletionWhileQueued
            | Error::SubpacketsOutstanding { .. }
            | Error::MasterStillLinked
            | Error::OutstandingCredits { .. } => ErrorClass::Critical,
        }
    }

    /// Check if this error indicates corruption risk
    pub fn is_critical(&self) -> bool {
        matches!(self.class(), ErrorClass::Critical)
    }

    /// Check if this error is retryable by backing off and resubmitting
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::ResourceExhaustion)
    }
}

/// Result type alias using the transport error
pub type Result<T> = std::result::Result<T, Error>;
