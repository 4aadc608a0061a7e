//! Packet State Machine and Shared Control Block
//!
//! Lifecycle state, completion status, and the cancellation hook live in a
//! reference-counted control block so that a thread which no longer owns
//! the packet (a canceler, a timer) can still act on it safely.
//!
//! State transitions are atomic exchanges:
//!
//! ```text
//!   Invalid ──▶ InProgress ──▶ Queued ──▶ InProgress ──▶ ... ──▶ Completed
//!                    │             │
//!                    └── cancel ───┴──▶ Canceled ──▶ Completed
//! ```
//!
//! Cancellation, completion and expiration all funnel through the same
//! exchange on `state`, which is what makes "exactly one terminal
//! completion" hold under concurrency.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::packet::flags::PacketFlags;

// ============================================================================
// Status
// ============================================================================

/// Terminal and transient status codes a packet can carry
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum StatusCode {
    /// No status has been set yet
    #[default]
    Invalid,
    /// Request succeeded
    Ok,
    /// Destination is busy; retry later
    Busy,
    /// The edge toward the destination is not enabled
    EdgeNotEnabled,
    /// Destination object does not exist
    Failed,
    /// Unclassified failure
    GenericFailure,
    /// Resources were not available to service the request
    InsufficientResources,
    /// Cancellation has been requested but not yet observed
    CancelPending,
    /// Request was canceled
    Canceled,
    /// Request exceeded its expiration time
    Expired,
}

impl StatusCode {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            StatusCode::Invalid => 0,
            StatusCode::Ok => 1,
            StatusCode::Busy => 2,
            StatusCode::EdgeNotEnabled => 3,
            StatusCode::Failed => 4,
            StatusCode::GenericFailure => 5,
            StatusCode::InsufficientResources => 6,
            StatusCode::CancelPending => 7,
            StatusCode::Canceled => 8,
            StatusCode::Expired => 9,
        }
    }

    pub(crate) fn from_u32(value: u32) -> Self {
        match value {
            1 => StatusCode::Ok,
            2 => StatusCode::Busy,
            3 => StatusCode::EdgeNotEnabled,
            4 => StatusCode::Failed,
            5 => StatusCode::GenericFailure,
            6 => StatusCode::InsufficientResources,
            7 => StatusCode::CancelPending,
            8 => StatusCode::Canceled,
            9 => StatusCode::Expired,
            _ => StatusCode::Invalid,
        }
    }

    /// Precedence rank used when merging sub-request statuses into a master
    pub fn precedence(self) -> ErrorPrecedence {
        match self {
            StatusCode::Invalid => ErrorPrecedence::NoError,
            StatusCode::Ok => ErrorPrecedence::NoError,
            StatusCode::Canceled | StatusCode::CancelPending => {
                ErrorPrecedence::Canceled
            }
            StatusCode::Busy
            | StatusCode::EdgeNotEnabled
            | StatusCode::Expired => ErrorPrecedence::NotReady,
            StatusCode::Failed => ErrorPrecedence::NotExist,
            StatusCode::GenericFailure
            | StatusCode::InsufficientResources => ErrorPrecedence::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Severity ordering for status merging; higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorPrecedence {
    NoError = 0,
    Canceled = 1,
    NotReady = 2,
    NotExist = 3,
    Unknown = 4,
}

/// Status code plus a transport-specific qualifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub struct PacketStatus {
    pub code: StatusCode,
    pub qualifier: u32,
}

impl PacketStatus {
    pub const INVALID: Self = Self {
        code: StatusCode::Invalid,
        qualifier: 0,
    };

    pub fn new(code: StatusCode, qualifier: u32) -> Self {
        Self { code, qualifier }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, 0)
    }

    /// Merge a sub-request status into an accumulated master status.
    ///
    /// The incoming status replaces the accumulated one when the master has
    /// not been set yet or the incoming code ranks higher in precedence.
    pub fn merge(self, incoming: PacketStatus) -> PacketStatus {
        if self.code == StatusCode::Invalid
            || incoming.code.precedence() > self.code.precedence()
        {
            incoming
        } else {
            self
        }
    }

    fn pack(self) -> u64 {
        (u64::from(self.code.as_u32()) << 32) | u64::from(self.qualifier)
    }

    fn unpack(raw: u64) -> Self {
        Self {
            code: StatusCode::from_u32((raw >> 32) as u32),
            qualifier: raw as u32,
        }
    }
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Coarse lifecycle state of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketState {
    /// Freshly constructed, not yet submitted
    Invalid,
    /// Owned by some execution context and being worked on
    InProgress,
    /// Parked on a service queue
    Queued,
    /// Cancellation has been observed
    Canceled,
    /// Terminal; the completion stack has fully unwound
    Completed,
}

impl PacketState {
    fn as_u32(self) -> u32 {
        match self {
            PacketState::Invalid => 0,
            PacketState::InProgress => 1,
            PacketState::Queued => 2,
            PacketState::Canceled => 3,
            PacketState::Completed => 4,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => PacketState::InProgress,
            2 => PacketState::Queued,
            3 => PacketState::Canceled,
            4 => PacketState::Completed,
            _ => PacketState::Invalid,
        }
    }
}

/// What a cancellation request actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Packet was marked canceled while parked on a queue
    MarkedQueued,
    /// Packet was marked canceled mid-flight and the hook was notified
    MarkedInProgress,
    /// Packet carries `DO_NOT_CANCEL`; request ignored
    Refused,
    /// Packet already reached a terminal or canceled state
    AlreadyDone,
}

/// Hook invoked when an in-flight packet is canceled
pub type CancelHook = Box<dyn FnMut() + Send>;

// ============================================================================
// Control block
// ============================================================================

/// Shared control block for a packet.
///
/// Cloneable via `Arc`, so a canceler or timer can hold onto it after the
/// packet itself has moved to another owner.
pub struct PacketControl {
    state: AtomicU32,
    status: AtomicU64,
    flags: AtomicU32,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl Default for PacketControl {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketControl {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(PacketState::Invalid.as_u32()),
            status: AtomicU64::new(PacketStatus::INVALID.pack()),
            flags: AtomicU32::new(PacketFlags::empty().bits()),
            cancel_hook: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PacketState {
        PacketState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Atomically install a new state, returning the previous one
    pub fn exchange_state(&self, new: PacketState) -> PacketState {
        PacketState::from_u32(
            self.state.swap(new.as_u32(), Ordering::AcqRel),
        )
    }

    pub fn status(&self) -> PacketStatus {
        PacketStatus::unpack(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: PacketStatus) {
        self.status.store(status.pack(), Ordering::Release);
    }

    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: PacketFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: PacketFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn replace_flags(&self, flags: PacketFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Install the hook a canceler will invoke if it catches the packet
    /// mid-flight. Replaces any previous hook.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        *self.cancel_hook.lock() = Some(hook);
    }

    pub fn clear_cancel_hook(&self) {
        *self.cancel_hook.lock() = None;
    }

    /// True when cancellation has been observed and the packet honors it
    pub fn is_canceled(&self) -> bool {
        self.state() == PacketState::Canceled
            && !self.flags().contains(PacketFlags::DO_NOT_CANCEL)
    }

    /// Request cancellation. Idempotent: exactly one caller wins the state
    /// exchange, and only that caller runs the hook.
    pub fn cancel(&self) -> CancelOutcome {
        if self.flags().contains(PacketFlags::DO_NOT_CANCEL) {
            debug!("cancel refused, packet is marked do-not-cancel");
            return CancelOutcome::Refused;
        }
        loop {
            let current = self.state.load(Ordering::Acquire);
            let outcome = match PacketState::from_u32(current) {
                PacketState::Queued => CancelOutcome::MarkedQueued,
                PacketState::InProgress => CancelOutcome::MarkedInProgress,
                PacketState::Invalid
                | PacketState::Canceled
                | PacketState::Completed => {
                    return CancelOutcome::AlreadyDone;
                }
            };
            if self
                .state
                .compare_exchange_weak(
                    current,
                    PacketState::Canceled.as_u32(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            if outcome == CancelOutcome::MarkedInProgress {
                self.set_status(PacketStatus::new(
                    StatusCode::CancelPending,
                    0,
                ));
                if let Some(hook) = self.cancel_hook.lock().as_mut() {
                    hook();
                }
            }
            return outcome;
        }
    }

    /// Move to the terminal `Completed` state, exactly once.
    pub(crate) fn mark_completed(&self) -> Result<()> {
        match self.exchange_state(PacketState::Completed) {
            PacketState::InProgress | PacketState::Canceled => Ok(()),
            PacketState::Completed => {
                error!("packet completed twice");
                Err(Error::DoubleCompletion)
            }
            PacketState::Queued => Err(Error::CompletionWhileQueued),
            PacketState::Invalid => Err(Error::InvalidStateTransition {
                from: "Invalid".into(),
                to: "Completed".into(),
            }),
        }
    }

    /// Reset to the pristine state a reused packet starts from
    pub(crate) fn reset(&self) {
        self.state
            .store(PacketState::Invalid.as_u32(), Ordering::Release);
        self.status
            .store(PacketStatus::INVALID.pack(), Ordering::Release);
        self.flags
            .store(PacketFlags::empty().bits(), Ordering::Release);
        *self.cancel_hook.lock() = None;
    }
}

impl fmt::Debug for PacketControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketControl")
            .field("state", &self.state())
            .field("status", &self.status())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_status_pack_round_trip() {
        let status = PacketStatus::new(StatusCode::Expired, 0xDEAD);
        assert_eq!(PacketStatus::unpack(status.pack()), status);
    }

    #[test]
    fn test_status_survives_json() {
        let status = PacketStatus::new(StatusCode::InsufficientResources, 42);
        let json = serde_json::to_string(&status).unwrap();
        let back: PacketStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_merge_precedence() {
        let ok = PacketStatus::ok();
        let canceled = PacketStatus::new(StatusCode::Canceled, 0);
        let failed = PacketStatus::new(StatusCode::Failed, 7);

        assert_eq!(PacketStatus::INVALID.merge(ok), ok);
        assert_eq!(ok.merge(canceled), canceled);
        assert_eq!(canceled.merge(failed), failed);
        // Lower precedence never overwrites higher
        assert_eq!(failed.merge(ok), failed);
        assert_eq!(failed.merge(canceled), failed);
    }

    #[test]
    fn test_cancel_queued_marks_directly() {
        let control = PacketControl::new();
        control.exchange_state(PacketState::InProgress);
        control.exchange_state(PacketState::Queued);
        assert_eq!(control.cancel(), CancelOutcome::MarkedQueued);
        assert_eq!(control.state(), PacketState::Canceled);
        // The queued path does not touch status; the owner does on dequeue
        assert_eq!(control.status().code, StatusCode::Invalid);
    }

    #[test]
    fn test_cancel_in_progress_runs_hook() {
        let control = PacketControl::new();
        control.exchange_state(PacketState::InProgress);
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = Arc::clone(&hits);
        control.set_cancel_hook(Box::new(move || {
            hook_hits.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(control.cancel(), CancelOutcome::MarkedInProgress);
        assert_eq!(control.status().code, StatusCode::CancelPending);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Second cancel is a no-op
        assert_eq!(control.cancel(), CancelOutcome::AlreadyDone);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_do_not_cancel_refuses() {
        let control = PacketControl::new();
        control.exchange_state(PacketState::InProgress);
        control.set_flags(PacketFlags::DO_NOT_CANCEL);
        assert_eq!(control.cancel(), CancelOutcome::Refused);
        assert_eq!(control.state(), PacketState::InProgress);
        assert!(!control.is_canceled());
    }

    #[test]
    fn test_concurrent_cancel_hook_runs_once() {
        for _ in 0..50 {
            let control = Arc::new(PacketControl::new());
            control.exchange_state(PacketState::InProgress);
            let hits = Arc::new(AtomicUsize::new(0));
            let hook_hits = Arc::clone(&hits);
            control.set_cancel_hook(Box::new(move || {
                hook_hits.fetch_add(1, Ordering::SeqCst);
            }));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let control = Arc::clone(&control);
                    std::thread::spawn(move || control.cancel())
                })
                .collect();
            let outcomes: Vec<_> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(hits.load(Ordering::SeqCst), 1);
            assert_eq!(
                outcomes
                    .iter()
                    .filter(|o| **o == CancelOutcome::MarkedInProgress)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn test_mark_completed_exactly_once() {
        let control = PacketControl::new();
        control.exchange_state(PacketState::InProgress);
        assert!(control.mark_completed().is_ok());
        assert!(matches!(
            control.mark_completed(),
            Err(Error::DoubleCompletion)
        ));
    }
}
