//! Operation Stack
//!
//! A fixed-footprint, bump-allocated LIFO of typed operation records. One of
//! these is embedded in every packet; it is exclusively owned by that packet
//! and never shared.
//!
//! The lifecycle of a record is allocate -> build -> promote -> (serve) ->
//! release, always in LIFO order and always released by the layer that
//! allocated it. At most one allocated-but-not-promoted ("next") record can
//! exist at a time; the stack rejects a second `allocate` until the first is
//! promoted or released, and rejects `release` of anything that is not the
//! current or pending record. Integrity is enforced structurally, not by
//! convention.

use tracing::error;

use crate::error::{Error, Result};
use crate::payload::{Operation, OperationKind};

// =============================================================================
// Constants
// =============================================================================

/// Number of record slots in one payload stack
pub const PAYLOAD_SLOT_COUNT: usize = 8;

/// Inline memory budget in bytes; allocation fails deterministically when
/// exhausted (the region never grows)
pub const PAYLOAD_MEMORY_SIZE: usize = 4 * std::mem::size_of::<Operation>();

// =============================================================================
// Operation Handle
// =============================================================================

/// Opaque handle to a record slot returned by [`OperationStack::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHandle(usize);

impl OperationHandle {
    /// Slot index backing this handle
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

// =============================================================================
// Operation Stack
// =============================================================================

/// One slot of the stack: a record plus the index of the record beneath it
#[derive(Debug, Clone)]
struct Slot {
    record: Operation,
    previous: Option<usize>,
}

/// Per-packet bump-allocated LIFO region of typed operation records
#[derive(Debug)]
pub struct OperationStack {
    slots: [Option<Slot>; PAYLOAD_SLOT_COUNT],
    /// Active record; what receivers see
    current: Option<usize>,
    /// Allocated but not yet promoted record
    next: Option<usize>,
    /// Bump cursor into the inline memory budget
    memory_cursor: usize,
}

impl Default for OperationStack {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStack {
    /// Create an empty operation stack
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            current: None,
            next: None,
            memory_cursor: 0,
        }
    }

    /// Reset the stack for packet reuse; storage is retained
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.current = None;
        self.next = None;
        self.memory_cursor = 0;
    }

    /// Reserve a slot and budget for a record of `kind`.
    ///
    /// Fails if a pending record already exists, if the inline budget is
    /// exhausted, or if no slot is free. Failure never leaves partial state.
    pub fn allocate(&mut self, kind: OperationKind) -> Result<OperationHandle> {
        if let Some(next) = self.next {
            let pending = self.slots[next]
                .as_ref()
                .map(|slot| slot.record.kind())
                .unwrap_or(OperationKind::Invalid);
            error!(%pending, "next operation already allocated");
            return Err(Error::OperationPending { pending });
        }

        let record = Operation::new(kind).ok_or_else(|| {
            error!("cannot allocate a record of the invalid kind");
            Error::OperationKindMismatch {
                expected: kind,
                found: OperationKind::Invalid,
            }
        })?;

        let cost = kind.memory_cost();
        let remaining = PAYLOAD_MEMORY_SIZE - self.memory_cursor;
        if cost > remaining {
            error!(%kind, cost, remaining, "payload memory exhausted");
            return Err(Error::PayloadMemoryExhausted {
                requested: cost,
                remaining,
            });
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                error!(%kind, "payload slots exhausted");
                return Err(Error::PayloadSlotsExhausted {
                    capacity: PAYLOAD_SLOT_COUNT,
                });
            }
        };

        self.slots[index] = Some(Slot {
            record,
            previous: self.current,
        });
        self.next = Some(index);
        self.memory_cursor += cost;
        Ok(OperationHandle(index))
    }

    /// Make the pending record the active one.
    ///
    /// No-op when there is no pending record; a layer that merely forwards a
    /// packet without pushing its own record calls this unconditionally.
    pub fn promote(&mut self) {
        if let Some(index) = self.next.take() {
            self.current = Some(index);
        }
    }

    /// Handle of the pending (allocated, not yet promoted) record
    pub fn pending(&self) -> Option<OperationHandle> {
        self.next.map(OperationHandle)
    }

    /// The active record, whatever its kind
    pub fn current(&self) -> Option<&Operation> {
        self.current
            .and_then(|index| self.slots[index].as_ref())
            .map(|slot| &slot.record)
    }

    /// Mutable access to the active record, whatever its kind
    pub fn current_mut(&mut self) -> Option<&mut Operation> {
        let index = self.current?;
        self.slots[index].as_mut().map(|slot| &mut slot.record)
    }

    /// Handle of the active record
    pub fn current_handle(&self) -> Option<OperationHandle> {
        self.current.map(OperationHandle)
    }

    /// The active record only if its tag matches `kind`
    pub fn current_of(&self, kind: OperationKind) -> Option<&Operation> {
        match self.current() {
            Some(op) if op.kind() == kind => Some(op),
            Some(op) => {
                error!(expected = %kind, found = %op.kind(), "current operation kind mismatch");
                None
            }
            None => {
                error!(expected = %kind, "no current operation");
                None
            }
        }
    }

    /// Mutable access to the active record only if its tag matches `kind`
    pub fn current_of_mut(&mut self, kind: OperationKind) -> Option<&mut Operation> {
        match self.current_mut() {
            Some(op) if op.kind() == kind => Some(op),
            Some(op) => {
                error!(expected = %kind, found = %op.kind(), "current operation kind mismatch");
                None
            }
            None => {
                error!(expected = %kind, "no current operation");
                None
            }
        }
    }

    /// The active block operation, if that is what the current record is
    pub fn current_block(&self) -> Option<&crate::payload::BlockOperation> {
        self.current_of(OperationKind::Block)?.as_block()
    }

    /// Mutable access to the active block operation
    pub fn current_block_mut(&mut self) -> Option<&mut crate::payload::BlockOperation> {
        self.current_of_mut(OperationKind::Block)?.as_block_mut()
    }

    /// The active control operation, if that is what the current record is
    pub fn current_control(&self) -> Option<&crate::payload::ControlOperation> {
        self.current_of(OperationKind::Control)?.as_control()
    }

    /// Mutable access to the active control operation
    pub fn current_control_mut(&mut self) -> Option<&mut crate::payload::ControlOperation> {
        self.current_of_mut(OperationKind::Control)?.as_control_mut()
    }

    /// Walk the `previous` chain from the record beneath current backward to
    /// the nearest record of `kind`.
    ///
    /// Recovers an outer operation while inside an inner one, e.g. the block
    /// operation that spawned the metadata operation on top of it.
    pub fn previous_of(&self, kind: OperationKind) -> Option<&Operation> {
        let mut cursor = self
            .current
            .and_then(|index| self.slots[index].as_ref())
            .and_then(|slot| slot.previous);

        while let Some(index) = cursor {
            let slot = self.slots[index].as_ref()?;
            if slot.record.kind() == kind {
                return Some(&slot.record);
            }
            cursor = slot.previous;
        }
        None
    }

    /// Borrow the record behind a handle
    pub fn get(&self, handle: OperationHandle) -> Result<&Operation> {
        self.slots
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .map(|slot| &slot.record)
            .ok_or(Error::InvalidOperationHandle { handle: handle.0 })
    }

    /// Mutably borrow the record behind a handle
    pub fn get_mut(&mut self, handle: OperationHandle) -> Result<&mut Operation> {
        self.slots
            .get_mut(handle.0)
            .and_then(|slot| slot.as_mut())
            .map(|slot| &mut slot.record)
            .ok_or(Error::InvalidOperationHandle { handle: handle.0 })
    }

    /// Pop a record. Legal only for the current or the pending-next record;
    /// any other target is rejected and the stack is left untouched.
    pub fn release(&mut self, handle: OperationHandle) -> Result<()> {
        let index = handle.0;
        let Some(slot) = self.slots.get(index).and_then(|slot| slot.as_ref()) else {
            error!(handle = index, "release of an empty or out-of-range slot");
            return Err(Error::InvalidOperationHandle { handle: index });
        };
        let cost = slot.record.kind().memory_cost();
        let previous = slot.previous;

        if self.next == Some(index) {
            // Caller is discarding a freshly allocated record, usually on an
            // error path before it was ever promoted.
            self.next = None;
        } else if self.current == Some(index) {
            self.current = previous;
            // A pending record allocated on top of the released one still
            // chains to the freed slot; relink it to the record beneath, or
            // a later allocation reusing the slot would make the chain
            // cyclic.
            if let Some(pending) = self.next {
                if let Some(slot) = self.slots[pending].as_mut() {
                    slot.previous = previous;
                }
            }
        } else {
            error!(handle = index, "release target is not on top of the stack");
            return Err(Error::ReleaseNotTop);
        }

        self.slots[index] = None;
        self.memory_cursor -= cost;
        Ok(())
    }

    /// Current value of the bump cursor, in bytes
    pub fn memory_cursor(&self) -> usize {
        self.memory_cursor
    }

    /// Bytes remaining in the inline budget
    pub fn memory_remaining(&self) -> usize {
        PAYLOAD_MEMORY_SIZE - self.memory_cursor
    }

    /// True when no record is allocated or active
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.next.is_none()
    }
}
