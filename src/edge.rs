//! Object Edge
//!
//! A typed connection from a client object to a server object. The edge
//! carries a path state and a path attribute mask that both sides read
//! concurrently, so they live in atomics. Attribute bits are defined by
//! each transport; the edge treats the mask as opaque.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::packet::{ObjectId, Packet, INVALID_ID};

/// Health of the path an edge represents
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum PathState {
    #[default]
    Invalid,
    /// Traffic may flow
    Enabled,
    /// Temporarily not accepting traffic
    Disabled,
    /// Persistently failed
    Broken,
    /// Power-saving state; wake before use
    Slumber,
    /// Server object is gone
    Gone,
}

impl PathState {
    fn as_u32(self) -> u32 {
        match self {
            PathState::Invalid => 0,
            PathState::Enabled => 1,
            PathState::Disabled => 2,
            PathState::Broken => 3,
            PathState::Slumber => 4,
            PathState::Gone => 5,
        }
    }

    fn from_u32(value: u32) -> Self {
        match value {
            1 => PathState::Enabled,
            2 => PathState::Disabled,
            3 => PathState::Broken,
            4 => PathState::Slumber,
            5 => PathState::Gone,
            _ => PathState::Invalid,
        }
    }
}

/// Which transport protocol an edge speaks
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum TransportKind {
    #[default]
    Invalid,
    Base,
    Block,
    Discovery,
    Ssp,
    Stp,
    Smp,
    Diplex,
}

/// What an installed edge hook decided about a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Deliver the packet normally
    Forward,
    /// The hook consumed the packet; do not deliver
    Intercept,
}

/// Test/monitor hook that sees every packet sent down the edge
pub type EdgeHook = Box<dyn Fn(&mut Packet) -> HookAction + Send + Sync>;

/// A client-to-server connection in the object topology
pub struct ObjectEdge {
    client_id: ObjectId,
    server_id: ObjectId,
    client_index: u32,
    server_index: u32,
    transport: TransportKind,
    path_state: AtomicU32,
    path_attributes: AtomicU32,
    hook: RwLock<Option<EdgeHook>>,
}

impl ObjectEdge {
    pub fn new(
        transport: TransportKind,
        client_id: ObjectId,
        server_id: ObjectId,
    ) -> Self {
        Self {
            client_id,
            server_id,
            client_index: 0,
            server_index: 0,
            transport,
            path_state: AtomicU32::new(PathState::Invalid.as_u32()),
            path_attributes: AtomicU32::new(0),
            hook: RwLock::new(None),
        }
    }

    pub fn client_id(&self) -> ObjectId {
        self.client_id
    }

    pub fn server_id(&self) -> ObjectId {
        self.server_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn client_index(&self) -> u32 {
        self.client_index
    }

    pub fn set_client_index(&mut self, index: u32) {
        self.client_index = index;
    }

    pub fn server_index(&self) -> u32 {
        self.server_index
    }

    pub fn set_server_index(&mut self, index: u32) {
        self.server_index = index;
    }

    // ========================================================================
    // Path state
    // ========================================================================

    pub fn path_state(&self) -> PathState {
        PathState::from_u32(self.path_state.load(Ordering::Acquire))
    }

    pub fn set_path_state(&self, state: PathState) {
        let old = PathState::from_u32(
            self.path_state.swap(state.as_u32(), Ordering::AcqRel),
        );
        if old != state {
            debug!(
                client = self.client_id,
                server = self.server_id,
                ?old,
                new = ?state,
                "edge path state changed"
            );
        }
    }

    /// True when the edge is connected and traffic may flow
    pub fn is_enabled(&self) -> bool {
        self.server_id != INVALID_ID
            && self.path_state() == PathState::Enabled
    }

    // ========================================================================
    // Path attributes (transport-defined bitmask)
    // ========================================================================

    pub fn path_attributes(&self) -> u32 {
        self.path_attributes.load(Ordering::Acquire)
    }

    /// OR attribute bits into the mask, returning the previous mask
    pub fn set_path_attributes(&self, bits: u32) -> u32 {
        self.path_attributes.fetch_or(bits, Ordering::AcqRel)
    }

    /// Clear attribute bits from the mask, returning the previous mask
    pub fn clear_path_attributes(&self, bits: u32) -> u32 {
        self.path_attributes.fetch_and(!bits, Ordering::AcqRel)
    }

    // ========================================================================
    // Hook
    // ========================================================================

    /// Install a hook that observes (and may intercept) outgoing packets
    pub fn set_hook(&self, hook: EdgeHook) {
        *self.hook.write() = Some(hook);
    }

    pub fn remove_hook(&self) {
        *self.hook.write() = None;
    }

    pub fn has_hook(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Run the installed hook against a packet about to be sent.
    /// Without a hook every packet is forwarded.
    pub fn apply_hook(&self, packet: &mut Packet) -> HookAction {
        match self.hook.read().as_ref() {
            Some(hook) => hook(packet),
            None => HookAction::Forward,
        }
    }
}

impl std::fmt::Debug for ObjectEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEdge")
            .field("transport", &self.transport)
            .field("client_id", &self.client_id)
            .field("server_id", &self.server_id)
            .field("path_state", &self.path_state())
            .field("path_attributes", &self.path_attributes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_new_edge_starts_invalid() {
        let edge = ObjectEdge::new(TransportKind::Block, 7, 9);
        assert_eq!(edge.path_state(), PathState::Invalid);
        assert_eq!(edge.path_attributes(), 0);
        assert!(!edge.is_enabled());
    }

    #[test]
    fn test_enable_disable_cycle() {
        let edge = ObjectEdge::new(TransportKind::Block, 7, 9);
        edge.set_path_state(PathState::Enabled);
        assert!(edge.is_enabled());
        edge.set_path_state(PathState::Slumber);
        assert!(!edge.is_enabled());
        edge.set_path_state(PathState::Enabled);
        assert!(edge.is_enabled());
    }

    #[test]
    fn test_unconnected_edge_never_enabled() {
        let edge = ObjectEdge::new(TransportKind::Discovery, 7, INVALID_ID);
        edge.set_path_state(PathState::Enabled);
        assert!(!edge.is_enabled());
    }

    #[test]
    fn test_attribute_mask_set_and_clear() {
        let edge = ObjectEdge::new(TransportKind::Block, 1, 2);
        assert_eq!(edge.set_path_attributes(0x05), 0);
        assert_eq!(edge.path_attributes(), 0x05);
        assert_eq!(edge.set_path_attributes(0x30), 0x05);
        assert_eq!(edge.clear_path_attributes(0x04), 0x35);
        assert_eq!(edge.path_attributes(), 0x31);
    }

    #[test]
    fn test_hook_intercepts() {
        let edge = ObjectEdge::new(TransportKind::Block, 1, 2);
        let mut packet = Packet::new();
        assert_eq!(edge.apply_hook(&mut packet), HookAction::Forward);

        let seen = Arc::new(AtomicUsize::new(0));
        let hook_seen = Arc::clone(&seen);
        edge.set_hook(Box::new(move |_p| {
            hook_seen.fetch_add(1, Ordering::SeqCst);
            HookAction::Intercept
        }));
        assert!(edge.has_hook());
        assert_eq!(edge.apply_hook(&mut packet), HookAction::Intercept);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        edge.remove_hook();
        assert_eq!(edge.apply_hook(&mut packet), HookAction::Forward);
    }
}
