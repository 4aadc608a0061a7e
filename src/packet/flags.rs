//! Packet Attribute Flags
//!
//! A 32-bit attribute mask carried by every packet. A defined subset is
//! inherited by sub-requests when they are fanned out from a master.

use bitflags::bitflags;

bitflags! {
    /// Behavioral attributes of a single packet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// Traversal-only delivery; routers must not dispatch locally
        const TRAVERSE = 0x0000_0001;
        /// Issuer waits synchronously for completion
        const SYNC = 0x0000_0002;
        /// Issued by a background scan, deprioritize accordingly
        const BACKGROUND_SCAN = 0x0000_0004;
        /// Cancellation requests must be ignored for this packet
        const DO_NOT_CANCEL = 0x0000_0008;
        /// Originated outside the system boundary
        const EXTERNAL = 0x0000_0010;
        /// Allowed to proceed while the destination is tearing down
        const ALLOWED_DURING_TEARDOWN = 0x0000_0020;
        /// Completion while still on a service queue is legal
        const ALLOW_QUEUED_COMPLETION = 0x0000_0040;
        /// Internal housekeeping request
        const INTERNAL = 0x0000_0080;
        /// Asynchronous request on behalf of a user thread
        const ASYNC_FROM_USER = 0x0000_0100;
        /// Issuer already holds the covering range lock
        const RANGE_LOCK_HELD = 0x0000_0200;
        /// Issued from a monitor context; inherited by sub-requests
        const MONITOR_OP = 0x0000_0400;
        /// Packet is being reinitialized for reuse
        const REINIT = 0x0000_0800;
        /// Targets an already-consumed region; inherited by sub-requests
        const CONSUMED = 0x0000_1000;
        /// Dispatch must respect the recorded core affinity
        const AFFINITY_SENSITIVE = 0x0000_2000;
        /// Fail immediately rather than wait on a busy queue
        const DO_NOT_QUEUE = 0x0000_4000;
        /// Port hardware completes this packet; inherited by sub-requests
        const COMPLETION_BY_PORT = 0x0000_8000;
        /// Port completion with zero-filled data
        const COMPLETION_BY_PORT_ZERO_FILL = 0x0001_0000;
        /// Contiguous buffer allocation is not required
        const NO_CONTIGUOUS_ALLOCATION = 0x0002_0000;
        /// Skip range lock acquisition for this request
        const DO_NOT_ACQUIRE_RANGE_LOCK = 0x0004_0000;
        /// Must not be held up by a quiesce; inherited by sub-requests
        const DO_NOT_QUIESCE = 0x0008_0000;
        /// Redirected to a peer path; inherited by sub-requests
        const REDIRECTED = 0x0010_0000;
        /// Failure of this packet requires failover handling
        const NEEDS_FAILOVER = 0x0020_0000;
    }
}

impl PacketFlags {
    /// Flags a sub-request inherits from its master at fan-out time
    pub const INHERITABLE: Self = Self::COMPLETION_BY_PORT
        .union(Self::MONITOR_OP)
        .union(Self::REDIRECTED)
        .union(Self::CONSUMED)
        .union(Self::DO_NOT_QUIESCE);
}
