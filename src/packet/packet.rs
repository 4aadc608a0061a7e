//! Request Descriptor
//!
//! The packet is the unit of work everything else in this crate moves
//! around: it carries an address, a payload operation stack, a completion
//! callback stack, lifecycle state, and diagnostic tracking. Packets are
//! owned by value and handed off between layers; concurrent actors such as
//! cancellers and timers hold the shared [`PacketControl`] block instead.
//!
//! Completion is a stack unwind. Layers push callbacks on the way down,
//! and `complete` pops and invokes them from the deepest level back toward
//! level zero:
//!
//! ```text
//!   set_completion(a)   level 0
//!   set_completion(b)   level 1
//!   set_completion(c)   level 2
//!   complete()          runs c, b, a  (unless one claims the packet)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

use crate::edge::ObjectEdge;
use crate::error::{Error, Result};
use crate::packet::address::PacketAddress;
use crate::packet::completion::{
    callback_id, CompletionDisposition, CompletionFn, CompletionStack,
    COMPLETION_STACK_DEPTH, DEFAULT_LEVEL,
};
use crate::packet::fanout::FanOut;
use crate::packet::flags::PacketFlags;
use crate::packet::state::{
    PacketControl, PacketState, PacketStatus, StatusCode,
};
use crate::packet::tracker::{coarse_time_ms, TrackerAction, TrackerRing};
use crate::payload::OperationStack;
use crate::resource::ResourceRequest;

/// Process-unique packet identity, used for queue removal and diagnostics
pub type PacketId = u64;

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(1);

/// Dispatch priority of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PacketPriority {
    Low,
    #[default]
    Normal,
    Urgent,
}

/// The request descriptor
pub struct Packet {
    id: PacketId,
    address: PacketAddress,
    control: Arc<PacketControl>,
    payload: OperationStack,
    completion_stack: CompletionStack,
    current_level: i8,
    /// High-water mark of completion nesting, kept for diagnostics
    callstack_depth: i8,
    resource_request: ResourceRequest,
    edge: Option<Arc<ObjectEdge>>,
    master: Option<Arc<FanOut>>,
    /// Absolute coarse-ms deadline; zero means no expiration
    expiration_time_ms: u64,
    tracker: TrackerRing,
    core_id: Option<usize>,
    priority: PacketPriority,
    tag: Option<u8>,
    pub(crate) on_queue: bool,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Construct a pristine packet in the `Invalid` state
    pub fn new() -> Self {
        Self {
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            address: PacketAddress::INVALID,
            control: Arc::new(PacketControl::new()),
            payload: OperationStack::new(),
            completion_stack: CompletionStack::new(),
            current_level: DEFAULT_LEVEL,
            callstack_depth: DEFAULT_LEVEL,
            resource_request: ResourceRequest::new(),
            edge: None,
            master: None,
            expiration_time_ms: 0,
            tracker: TrackerRing::new(),
            core_id: None,
            priority: PacketPriority::default(),
            tag: None,
            on_queue: false,
        }
    }

    /// Reinitialize this packet for another trip through the system.
    ///
    /// Fails if the previous use left state behind: outstanding resource
    /// credits or a live master link.
    pub fn reuse(&mut self) -> Result<()> {
        self.check_reclaimable()?;
        self.address = PacketAddress::INVALID;
        self.edge = None;
        self.payload.reset();
        self.completion_stack.clear();
        self.current_level = DEFAULT_LEVEL;
        self.callstack_depth = DEFAULT_LEVEL;
        self.expiration_time_ms = 0;
        self.tracker.reset();
        self.core_id = None;
        self.priority = PacketPriority::default();
        self.tag = None;
        self.on_queue = false;
        self.control.reset();
        Ok(())
    }

    /// Verify this packet can be torn down or recycled
    pub fn check_reclaimable(&self) -> Result<()> {
        if self.master.is_some() {
            error!(packet = self.id, "reclaim attempted while linked to a master");
            return Err(Error::MasterStillLinked);
        }
        let credits = self.resource_request.outstanding_credits();
        if credits != 0 {
            error!(packet = self.id, credits, "reclaim attempted with outstanding credits");
            return Err(Error::OutstandingCredits { credits });
        }
        Ok(())
    }

    // ========================================================================
    // Identity and addressing
    // ========================================================================

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn address(&self) -> PacketAddress {
        self.address
    }

    pub fn set_address(&mut self, address: PacketAddress) {
        self.address = address;
    }

    // ========================================================================
    // Shared control block
    // ========================================================================

    /// Handle for cancellers and timers that outlive packet ownership
    pub fn control(&self) -> Arc<PacketControl> {
        Arc::clone(&self.control)
    }

    pub fn state(&self) -> PacketState {
        self.control.state()
    }

    /// Mark the packet in-flight. Legal from `Invalid` (first submission)
    /// only; resubmission goes through `reuse`.
    pub fn start(&mut self) -> Result<()> {
        match self.control.exchange_state(PacketState::InProgress) {
            PacketState::Invalid => Ok(()),
            other => {
                self.control.exchange_state(other);
                Err(Error::InvalidStateTransition {
                    from: "Invalid",
                    to: "InProgress",
                })
            }
        }
    }

    pub fn status(&self) -> PacketStatus {
        self.control.status()
    }

    pub fn set_status(&mut self, status: PacketStatus) {
        self.control.set_status(status);
    }

    pub fn flags(&self) -> PacketFlags {
        self.control.flags()
    }

    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.control.set_flags(flags);
    }

    pub fn clear_flags(&mut self, flags: PacketFlags) {
        self.control.clear_flags(flags);
    }

    pub fn is_canceled(&self) -> bool {
        self.control.is_canceled()
    }

    // ========================================================================
    // Payload
    // ========================================================================

    pub fn payload(&self) -> &OperationStack {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut OperationStack {
        &mut self.payload
    }

    // ========================================================================
    // Resource request
    // ========================================================================

    pub fn resource_request(&self) -> &ResourceRequest {
        &self.resource_request
    }

    pub fn resource_request_mut(&mut self) -> &mut ResourceRequest {
        &mut self.resource_request
    }

    // ========================================================================
    // Edge attachment
    // ========================================================================

    /// Bind the packet to the edge it travels down
    pub fn attach_edge(&mut self, edge: Arc<ObjectEdge>) {
        self.edge = Some(edge);
    }

    pub fn edge(&self) -> Option<&Arc<ObjectEdge>> {
        self.edge.as_ref()
    }

    pub fn detach_edge(&mut self) -> Option<Arc<ObjectEdge>> {
        self.edge.take()
    }

    /// Client index on the attached edge; monitor packets have no edge
    /// and report index 0
    pub fn client_index(&self) -> u32 {
        self.edge.as_deref().map(ObjectEdge::client_index).unwrap_or(0)
    }

    /// Server index on the attached edge, 0 without an edge
    pub fn server_index(&self) -> u32 {
        self.edge.as_deref().map(ObjectEdge::server_index).unwrap_or(0)
    }

    // ========================================================================
    // Sub-request linkage
    // ========================================================================

    /// The fan-out this packet is a sub-request of, if any
    pub fn master(&self) -> Option<&Arc<FanOut>> {
        self.master.as_ref()
    }

    pub(crate) fn link_master(&mut self, master: Arc<FanOut>) {
        self.master = Some(master);
    }

    pub(crate) fn unlink_master(&mut self) -> Option<Arc<FanOut>> {
        self.master.take()
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Absolute coarse-ms deadline, zero when no expiration is set
    pub fn expiration_time_ms(&self) -> u64 {
        self.expiration_time_ms
    }

    pub(crate) fn set_expiration_time_ms(&mut self, deadline_ms: u64) {
        self.expiration_time_ms = deadline_ms;
    }

    pub fn clear_expiration(&mut self) {
        self.expiration_time_ms = 0;
    }

    pub fn is_expired(&self) -> bool {
        self.expiration_time_ms != 0
            && coarse_time_ms() >= self.expiration_time_ms
    }

    // ========================================================================
    // Dispatch hints
    // ========================================================================

    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    pub fn set_core_id(&mut self, core: usize) {
        self.core_id = Some(core);
    }

    pub fn priority(&self) -> PacketPriority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: PacketPriority) {
        self.priority = priority;
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u8) {
        self.tag = Some(tag);
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    pub fn tracker(&self) -> &TrackerRing {
        &self.tracker
    }

    /// Deepest completion nesting this packet has seen
    pub fn callstack_depth(&self) -> i8 {
        self.callstack_depth
    }

    pub fn current_level(&self) -> i8 {
        self.current_level
    }

    // ========================================================================
    // Completion stack
    // ========================================================================

    /// Push a completion callback. The level is pre-incremented, so the
    /// callback runs when the unwind reaches the new level.
    pub fn set_completion(&mut self, callback: CompletionFn) -> Result<()> {
        let next = self.current_level + 1;
        if next as usize >= COMPLETION_STACK_DEPTH {
            error!(
                packet = self.id,
                level = self.current_level,
                "completion stack exhausted"
            );
            return Err(Error::CompletionStackExhausted {
                level: self.current_level,
                depth: COMPLETION_STACK_DEPTH,
            });
        }
        self.tracker.record(callback_id(&callback), TrackerAction::SET);
        self.current_level = next;
        self.callstack_depth = self.callstack_depth.max(next);
        self.completion_stack.set(next as usize, callback);
        Ok(())
    }

    /// Pop the most recently pushed completion callback without running it
    pub fn unset_completion(&mut self) -> Result<CompletionFn> {
        if self.current_level < 0 {
            return Err(Error::CompletionStackUnderflow {
                level: self.current_level,
            });
        }
        let level = self.current_level as usize;
        let callback = self
            .completion_stack
            .take(level)
            .ok_or(Error::CompletionStackUnderflow {
                level: self.current_level,
            })?;
        self.current_level -= 1;
        Ok(callback)
    }

    /// Unwind the completion stack.
    ///
    /// Callbacks run from the current level toward level zero. A callback
    /// returning [`CompletionDisposition::MoreProcessing`] stops the unwind
    /// there; the packet stays in flight and will be completed again later.
    /// [`CompletionDisposition::Restart`] re-reads the level, so a callback
    /// that pushed new work resumes from the new top. Once the stack is
    /// empty the packet transitions to `Completed`, exactly once.
    pub fn complete(&mut self) -> Result<()> {
        if self.on_queue
            && !self.flags().contains(PacketFlags::ALLOW_QUEUED_COMPLETION)
        {
            error!(packet = self.id, "completion attempted while on a queue");
            return Err(Error::CompletionWhileQueued);
        }

        let mut level = self.current_level;
        while level >= 0 {
            if self.current_level != level {
                error!(
                    packet = self.id,
                    current = self.current_level,
                    expected = level,
                    "completion level skew during unwind"
                );
                return Err(Error::CompletionLevelMismatch {
                    current: self.current_level,
                    expected: level,
                });
            }
            self.current_level -= 1;
            match self.completion_stack.take(level as usize) {
                Some(mut callback) => {
                    self.tracker.record(
                        callback_id(&callback),
                        TrackerAction::COMPLETE,
                    );
                    match callback(self) {
                        CompletionDisposition::MoreProcessing => {
                            return Ok(());
                        }
                        CompletionDisposition::Restart => {
                            level = self.current_level;
                        }
                        CompletionDisposition::Continue => {
                            level -= 1;
                        }
                    }
                }
                None => {
                    warn!(
                        packet = self.id,
                        level, "empty completion level during unwind"
                    );
                    level -= 1;
                }
            }
        }
        self.control.mark_completed()
    }

    /// Set a terminal status and unwind in one step
    pub fn complete_with(&mut self, status: PacketStatus) -> Result<()> {
        self.control.set_status(status);
        self.complete()
    }

    /// Stamp the expired status; delivery goes through the normal unwind
    pub(crate) fn mark_expired(&mut self) {
        self.tracker.record(0, TrackerAction::EXPIRED);
        self.control
            .set_status(PacketStatus::new(StatusCode::Expired, 0));
    }

    /// Note an observed cancellation in the diagnostic ring
    pub(crate) fn record_canceled(&mut self) {
        self.tracker.record(0, TrackerAction::CANCELED);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("status", &self.status())
            .field("level", &self.current_level)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_packet() -> Packet {
        let mut packet = Packet::new();
        packet.start().unwrap();
        packet
    }

    #[test]
    fn test_new_packet_defaults() {
        let packet = Packet::new();
        assert_eq!(packet.state(), PacketState::Invalid);
        assert_eq!(packet.status().code, StatusCode::Invalid);
        assert_eq!(packet.current_level(), DEFAULT_LEVEL);
        assert_eq!(packet.expiration_time_ms(), 0);
        assert!(!packet.is_expired());
    }

    #[test]
    fn test_start_is_single_shot() {
        let mut packet = Packet::new();
        assert!(packet.start().is_ok());
        assert_eq!(packet.state(), PacketState::InProgress);
        assert!(packet.start().is_err());
        assert_eq!(packet.state(), PacketState::InProgress);
    }

    #[test]
    fn test_completion_runs_in_reverse_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut packet = started_packet();
        for layer in 0..3u8 {
            let order = Arc::clone(&order);
            packet
                .set_completion(Box::new(move |_p| {
                    order.lock().push(layer);
                    CompletionDisposition::Continue
                }))
                .unwrap();
        }
        assert_eq!(packet.current_level(), 2);
        packet
            .complete_with(PacketStatus::ok())
            .unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert_eq!(packet.state(), PacketState::Completed);
        assert_eq!(packet.current_level(), DEFAULT_LEVEL);
    }

    #[test]
    fn test_more_processing_pauses_unwind() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut packet = started_packet();

        let bottom_hits = Arc::clone(&hits);
        packet
            .set_completion(Box::new(move |_p| {
                bottom_hits.fetch_add(1, Ordering::SeqCst);
                CompletionDisposition::Continue
            }))
            .unwrap();
        packet
            .set_completion(Box::new(|_p| {
                CompletionDisposition::MoreProcessing
            }))
            .unwrap();

        packet.complete_with(PacketStatus::ok()).unwrap();
        // Top callback claimed the packet; nothing below it ran yet
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(packet.state(), PacketState::InProgress);
        assert_eq!(packet.current_level(), 0);

        // A later complete resumes from where the unwind stopped
        packet.complete().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(packet.state(), PacketState::Completed);
    }

    #[test]
    fn test_restart_resumes_from_new_top() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut packet = started_packet();

        let bottom_order = Arc::clone(&order);
        packet
            .set_completion(Box::new(move |_p| {
                bottom_order.lock().push("bottom");
                CompletionDisposition::Continue
            }))
            .unwrap();

        let restart_order = Arc::clone(&order);
        packet
            .set_completion(Box::new(move |p| {
                restart_order.lock().push("restart");
                let pushed_order = Arc::clone(&restart_order);
                p.set_completion(Box::new(move |_p| {
                    pushed_order.lock().push("pushed");
                    CompletionDisposition::Continue
                }))
                .unwrap();
                CompletionDisposition::Restart
            }))
            .unwrap();

        packet.complete_with(PacketStatus::ok()).unwrap();
        assert_eq!(*order.lock(), vec!["restart", "pushed", "bottom"]);
        assert_eq!(packet.state(), PacketState::Completed);
    }

    #[test]
    fn test_double_completion_reported() {
        let mut packet = started_packet();
        packet.complete_with(PacketStatus::ok()).unwrap();
        let err = packet.complete().unwrap_err();
        assert!(matches!(err, Error::DoubleCompletion));
        assert!(err.is_critical());
    }

    #[test]
    fn test_completion_stack_depth_enforced() {
        let mut packet = started_packet();
        for _ in 0..COMPLETION_STACK_DEPTH {
            packet
                .set_completion(Box::new(|_p| CompletionDisposition::Continue))
                .unwrap();
        }
        let err = packet
            .set_completion(Box::new(|_p| CompletionDisposition::Continue))
            .unwrap_err();
        assert!(matches!(err, Error::CompletionStackExhausted { .. }));
    }

    #[test]
    fn test_unset_completion_pops_without_running() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut packet = started_packet();
        let cb_hits = Arc::clone(&hits);
        packet
            .set_completion(Box::new(move |_p| {
                cb_hits.fetch_add(1, Ordering::SeqCst);
                CompletionDisposition::Continue
            }))
            .unwrap();
        assert_eq!(packet.current_level(), 0);
        let _callback = packet.unset_completion().unwrap();
        assert_eq!(packet.current_level(), DEFAULT_LEVEL);
        packet.complete_with(PacketStatus::ok()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(matches!(
            packet.unset_completion(),
            Err(Error::CompletionStackUnderflow { .. })
        ));
    }

    #[test]
    fn test_tracker_records_set_and_complete() {
        let mut packet = started_packet();
        packet
            .set_completion(Box::new(|_p| CompletionDisposition::Continue))
            .unwrap();
        packet.complete_with(PacketStatus::ok()).unwrap();
        let entries = packet.tracker().snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, TrackerAction::SET);
        assert_eq!(entries[1].action, TrackerAction::COMPLETE);
        assert_eq!(entries[0].callback_id, entries[1].callback_id);
        assert_ne!(entries[0].callback_id, 0);
    }

    #[test]
    fn test_reuse_resets_everything() {
        let mut packet = started_packet();
        packet.set_address(PacketAddress::new(1, 2, 3, 4));
        packet.set_flags(PacketFlags::MONITOR_OP);
        packet.set_priority(PacketPriority::Urgent);
        packet.set_core_id(3);
        packet
            .set_completion(Box::new(|_p| CompletionDisposition::Continue))
            .unwrap();
        packet.complete_with(PacketStatus::ok()).unwrap();

        let id = packet.id();
        packet.reuse().unwrap();
        assert_eq!(packet.id(), id);
        assert_eq!(packet.state(), PacketState::Invalid);
        assert_eq!(packet.status().code, StatusCode::Invalid);
        assert_eq!(packet.current_level(), DEFAULT_LEVEL);
        assert_eq!(packet.address(), PacketAddress::INVALID);
        assert!(packet.flags().is_empty());
        assert_eq!(packet.priority(), PacketPriority::Normal);
        assert_eq!(packet.core_id(), None);
        assert!(packet.tracker().snapshot().is_empty());
    }

    #[test]
    fn test_edge_indexes_fall_back_without_edge() {
        use crate::edge::{ObjectEdge, TransportKind};

        let mut packet = Packet::new();
        assert_eq!(packet.client_index(), 0);
        assert_eq!(packet.server_index(), 0);

        let mut edge = ObjectEdge::new(TransportKind::Block, 5, 6);
        edge.set_client_index(2);
        edge.set_server_index(7);
        packet.attach_edge(Arc::new(edge));
        assert_eq!(packet.client_index(), 2);
        assert_eq!(packet.server_index(), 7);
        assert!(packet.detach_edge().is_some());
        assert_eq!(packet.client_index(), 0);
    }

    #[test]
    fn test_expiration_clock() {
        let mut packet = Packet::new();
        packet.set_expiration_time_ms(coarse_time_ms() + 10_000);
        assert!(!packet.is_expired());
        std::thread::sleep(std::time::Duration::from_millis(2));
        packet.set_expiration_time_ms(1);
        assert!(packet.is_expired());
        packet.clear_expiration();
        assert!(!packet.is_expired());
    }
}
