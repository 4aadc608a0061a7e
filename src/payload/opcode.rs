//! Operation Kind Discriminant
//!
//! Every record on the payload stack carries one of these tags. Receivers
//! use the tag to decide whether the active record is theirs; a mismatch is
//! a protocol error, not a crash.

use serde::{Deserialize, Serialize};

use crate::payload::block::BlockOperation;
use crate::payload::control::ControlOperation;
use crate::payload::records::{
    BufferOperation, CdbOperation, DiplexOperation, DiscoveryOperation, DmrbOperation,
    FisOperation, MemoryOperation, MetadataOperation, PersistentMemoryOperation, SmpOperation,
    StripeLockOperation,
};

/// Discriminant for the typed operation records a payload stack can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// No operation; a released slot
    Invalid,
    /// Logical block I/O (read/write/zero/rebuild/verify)
    Block,
    /// Control-plane operation with an opaque buffer
    Control,
    /// Topology discovery operation
    Discovery,
    /// SCSI CDB pass-through
    Cdb,
    /// SATA FIS pass-through
    Fis,
    /// Legacy DMRB pass-through
    Dmrb,
    /// SAS SMP operation
    Smp,
    /// Diplex enclosure operation
    Diplex,
    /// Stripe lock acquire/release
    StripeLock,
    /// Memory service operation
    Memory,
    /// Metadata service operation
    Metadata,
    /// Persistent memory operation
    PersistentMemory,
    /// Raw buffer hand-off
    Buffer,
}

impl OperationKind {
    /// Fixed memory cost this kind reserves from the inline payload budget.
    ///
    /// Each record has a fixed maximum layout; the cost is the size of that
    /// layout so that budget accounting is deterministic per kind.
    pub const fn memory_cost(self) -> usize {
        match self {
            OperationKind::Invalid => 0,
            OperationKind::Block => std::mem::size_of::<BlockOperation>(),
            OperationKind::Control => std::mem::size_of::<ControlOperation>(),
            OperationKind::Discovery => std::mem::size_of::<DiscoveryOperation>(),
            OperationKind::Cdb => std::mem::size_of::<CdbOperation>(),
            OperationKind::Fis => std::mem::size_of::<FisOperation>(),
            OperationKind::Dmrb => std::mem::size_of::<DmrbOperation>(),
            OperationKind::Smp => std::mem::size_of::<SmpOperation>(),
            OperationKind::Diplex => std::mem::size_of::<DiplexOperation>(),
            OperationKind::StripeLock => std::mem::size_of::<StripeLockOperation>(),
            OperationKind::Memory => std::mem::size_of::<MemoryOperation>(),
            OperationKind::Metadata => std::mem::size_of::<MetadataOperation>(),
            OperationKind::PersistentMemory => {
                std::mem::size_of::<PersistentMemoryOperation>()
            }
            OperationKind::Buffer => std::mem::size_of::<BufferOperation>(),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::Invalid => "invalid",
            OperationKind::Block => "block",
            OperationKind::Control => "control",
            OperationKind::Discovery => "discovery",
            OperationKind::Cdb => "cdb",
            OperationKind::Fis => "fis",
            OperationKind::Dmrb => "dmrb",
            OperationKind::Smp => "smp",
            OperationKind::Diplex => "diplex",
            OperationKind::StripeLock => "stripe-lock",
            OperationKind::Memory => "memory",
            OperationKind::Metadata => "metadata",
            OperationKind::PersistentMemory => "persistent-memory",
            OperationKind::Buffer => "buffer",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_cost_nonzero_for_real_kinds() {
        assert_eq!(OperationKind::Invalid.memory_cost(), 0);
        assert!(OperationKind::Block.memory_cost() > 0);
        assert!(OperationKind::Control.memory_cost() > 0);
        assert!(OperationKind::StripeLock.memory_cost() > 0);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(OperationKind::Block.to_string(), "block");
        assert_eq!(OperationKind::StripeLock.to_string(), "stripe-lock");
    }
}
