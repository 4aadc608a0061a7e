//! Payload - Typed Operation Records and the Operation Stack
//!
//! Every request descriptor carries a fixed-footprint payload region holding
//! typed operation records. Each layer a packet traverses may push its own
//! record (a RAID object nests a metadata operation inside the client's block
//! operation, a physical drive nests a CDB inside that, and so on); records
//! form a strict LIFO chain and are always released by the layer that
//! allocated them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Operation Stack                         │
//! │  slot 2: CdbOperation      <- current (physical drive)       │
//! │  slot 1: MetadataOperation    previous ──┐                   │
//! │  slot 0: BlockOperation       previous ──┴─> chain to outer  │
//! │                                                              │
//! │  memory cursor: bump-allocated, fixed budget, no growth      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod control;
pub mod opcode;
pub mod records;
pub mod stack;

pub use block::{
    BlockCount, BlockFlags, BlockOpcode, BlockOperation, BlockSize, Lba,
    PreReadDescriptor,
};
pub use control::{ControlOpcode, ControlOperation};
pub use opcode::OperationKind;
pub use records::{
    BufferOperation, CdbOperation, DiplexOperation, DiscoveryOperation, DmrbOperation,
    FisOperation, MemoryOperation, MetadataOperation, PersistentMemoryOperation, SmpOperation,
    StripeLockOperation,
};
pub use stack::{OperationHandle, OperationStack, PAYLOAD_MEMORY_SIZE, PAYLOAD_SLOT_COUNT};

use serde::{Deserialize, Serialize};

/// Completion status carried by every operation record.
///
/// Composing layers decide whether to translate a child's failure into their
/// own status or propagate it verbatim; there is no global error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Not yet completed
    #[default]
    Invalid,
    /// Completed successfully
    Ok,
    /// Generic failure
    Failure,
    /// Server object is busy; retry later
    Busy,
    /// Aborted by cancellation
    Canceled,
    /// Expired before completion
    Timeout,
    /// Server could not obtain resources
    InsufficientResources,
}

/// A typed operation record on the payload stack
#[derive(Debug, Clone)]
pub enum Operation {
    Block(BlockOperation),
    Control(ControlOperation),
    Discovery(DiscoveryOperation),
    Cdb(CdbOperation),
    Fis(FisOperation),
    Dmrb(DmrbOperation),
    Smp(SmpOperation),
    Diplex(DiplexOperation),
    StripeLock(StripeLockOperation),
    Memory(MemoryOperation),
    Metadata(MetadataOperation),
    PersistentMemory(PersistentMemoryOperation),
    Buffer(BufferOperation),
}

macro_rules! typed_accessors {
    ($as_ref:ident, $as_mut:ident, $variant:ident, $ty:ty) => {
        /// Borrow the record if it is of the matching kind
        pub fn $as_ref(&self) -> Option<&$ty> {
            match self {
                Operation::$variant(op) => Some(op),
                _ => None,
            }
        }

        /// Mutably borrow the record if it is of the matching kind
        pub fn $as_mut(&mut self) -> Option<&mut $ty> {
            match self {
                Operation::$variant(op) => Some(op),
                _ => None,
            }
        }
    };
}

impl Operation {
    /// Create a default (unbuilt) record of the given kind.
    ///
    /// Returns `None` for [`OperationKind::Invalid`].
    pub fn new(kind: OperationKind) -> Option<Self> {
        match kind {
            OperationKind::Invalid => None,
            OperationKind::Block => Some(Operation::Block(BlockOperation::default())),
            OperationKind::Control => Some(Operation::Control(ControlOperation::default())),
            OperationKind::Discovery => {
                Some(Operation::Discovery(DiscoveryOperation::default()))
            }
            OperationKind::Cdb => Some(Operation::Cdb(CdbOperation::default())),
            OperationKind::Fis => Some(Operation::Fis(FisOperation::default())),
            OperationKind::Dmrb => Some(Operation::Dmrb(DmrbOperation::default())),
            OperationKind::Smp => Some(Operation::Smp(SmpOperation::default())),
            OperationKind::Diplex => Some(Operation::Diplex(DiplexOperation::default())),
            OperationKind::StripeLock => {
                Some(Operation::StripeLock(StripeLockOperation::default()))
            }
            OperationKind::Memory => Some(Operation::Memory(MemoryOperation::default())),
            OperationKind::Metadata => Some(Operation::Metadata(MetadataOperation::default())),
            OperationKind::PersistentMemory => Some(Operation::PersistentMemory(
                PersistentMemoryOperation::default(),
            )),
            OperationKind::Buffer => Some(Operation::Buffer(BufferOperation::default())),
        }
    }

    /// Kind tag of this record
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Block(_) => OperationKind::Block,
            Operation::Control(_) => OperationKind::Control,
            Operation::Discovery(_) => OperationKind::Discovery,
            Operation::Cdb(_) => OperationKind::Cdb,
            Operation::Fis(_) => OperationKind::Fis,
            Operation::Dmrb(_) => OperationKind::Dmrb,
            Operation::Smp(_) => OperationKind::Smp,
            Operation::Diplex(_) => OperationKind::Diplex,
            Operation::StripeLock(_) => OperationKind::StripeLock,
            Operation::Memory(_) => OperationKind::Memory,
            Operation::Metadata(_) => OperationKind::Metadata,
            Operation::PersistentMemory(_) => OperationKind::PersistentMemory,
            Operation::Buffer(_) => OperationKind::Buffer,
        }
    }

    /// Completion status of this record, regardless of kind
    pub fn status(&self) -> OperationStatus {
        match self {
            Operation::Block(op) => op.status,
            Operation::Control(op) => op.status,
            Operation::Discovery(op) => op.status,
            Operation::Cdb(op) => op.status,
            Operation::Fis(op) => op.status,
            Operation::Dmrb(op) => op.status,
            Operation::Smp(op) => op.status,
            Operation::Diplex(op) => op.status,
            Operation::StripeLock(op) => op.status,
            Operation::Memory(op) => op.status,
            Operation::Metadata(op) => op.status,
            Operation::PersistentMemory(op) => op.status,
            Operation::Buffer(op) => op.status,
        }
    }

    /// Set the completion status of this record, regardless of kind
    pub fn set_status(&mut self, status: OperationStatus, qualifier: u32) {
        match self {
            Operation::Block(op) => op.set_status(status, qualifier),
            Operation::Control(op) => op.set_status(status, qualifier),
            Operation::Discovery(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Cdb(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Fis(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Dmrb(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Smp(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Diplex(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::StripeLock(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Memory(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Metadata(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::PersistentMemory(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
            Operation::Buffer(op) => {
                op.status = status;
                op.status_qualifier = qualifier;
            }
        }
    }

    typed_accessors!(as_block, as_block_mut, Block, BlockOperation);
    typed_accessors!(as_control, as_control_mut, Control, ControlOperation);
    typed_accessors!(as_discovery, as_discovery_mut, Discovery, DiscoveryOperation);
    typed_accessors!(as_cdb, as_cdb_mut, Cdb, CdbOperation);
    typed_accessors!(as_fis, as_fis_mut, Fis, FisOperation);
    typed_accessors!(as_dmrb, as_dmrb_mut, Dmrb, DmrbOperation);
    typed_accessors!(as_smp, as_smp_mut, Smp, SmpOperation);
    typed_accessors!(as_diplex, as_diplex_mut, Diplex, DiplexOperation);
    typed_accessors!(
        as_stripe_lock,
        as_stripe_lock_mut,
        StripeLock,
        StripeLockOperation
    );
    typed_accessors!(as_memory, as_memory_mut, Memory, MemoryOperation);
    typed_accessors!(as_metadata, as_metadata_mut, Metadata, MetadataOperation);
    typed_accessors!(
        as_persistent_memory,
        as_persistent_memory_mut,
        PersistentMemory,
        PersistentMemoryOperation
    );
    typed_accessors!(as_buffer, as_buffer_mut, Buffer, BufferOperation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_invalid_kind_is_none() {
        assert!(Operation::new(OperationKind::Invalid).is_none());
    }

    #[test]
    fn test_kind_round_trip() {
        let kinds = [
            OperationKind::Block,
            OperationKind::Control,
            OperationKind::Discovery,
            OperationKind::Cdb,
            OperationKind::Fis,
            OperationKind::Dmrb,
            OperationKind::Smp,
            OperationKind::Diplex,
            OperationKind::StripeLock,
            OperationKind::Memory,
            OperationKind::Metadata,
            OperationKind::PersistentMemory,
            OperationKind::Buffer,
        ];
        for kind in kinds {
            let op = Operation::new(kind).unwrap();
            assert_eq!(op.kind(), kind);
            assert_eq!(op.status(), OperationStatus::Invalid);
        }
    }

    #[test]
    fn test_typed_accessor_mismatch() {
        let op = Operation::new(OperationKind::Block).unwrap();
        assert!(op.as_block().is_some());
        assert!(op.as_control().is_none());
    }

    #[test]
    fn test_generic_status_set() {
        let mut op = Operation::new(OperationKind::StripeLock).unwrap();
        op.set_status(OperationStatus::Ok, 7);
        assert_eq!(op.status(), OperationStatus::Ok);
        assert_eq!(op.as_stripe_lock().unwrap().status_qualifier, 7);
    }
}
