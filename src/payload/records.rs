//! Fixed-Layout Operation Records
//!
//! The remaining record kinds the payload stack can hold. The transport only
//! defines the generic record mechanics (tag, status, fixed maximum layout);
//! wire-level field semantics belong to the physical transport and metadata
//! collaborators.

use bytes::Bytes;

use crate::payload::{OperationKind, OperationStatus};

/// Maximum CDB length carried inline
pub const CDB_MAX_LENGTH: usize = 16;

/// Maximum FIS length carried inline
pub const FIS_MAX_LENGTH: usize = 20;

/// Maximum SMP frame length carried inline
pub const SMP_MAX_LENGTH: usize = 40;

// =============================================================================
// Discovery
// =============================================================================

/// Topology discovery operation
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOperation {
    /// Discovery-protocol opcode
    pub opcode: u32,
    /// Opaque command/response buffer
    pub buffer: Bytes,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl DiscoveryOperation {
    pub const KIND: OperationKind = OperationKind::Discovery;

    pub fn build(&mut self, opcode: u32, buffer: Bytes) {
        self.opcode = opcode;
        self.buffer = buffer;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// CDB (SCSI pass-through)
// =============================================================================

/// SCSI CDB pass-through operation
#[derive(Debug, Clone)]
pub struct CdbOperation {
    /// Raw CDB bytes; semantics belong to the physical transport
    pub cdb: [u8; CDB_MAX_LENGTH],
    /// Valid length of `cdb`
    pub cdb_length: usize,
    /// Transfer length in bytes
    pub transfer_count: u32,
    /// Per-command timeout in milliseconds
    pub timeout_ms: u32,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl Default for CdbOperation {
    fn default() -> Self {
        Self {
            cdb: [0; CDB_MAX_LENGTH],
            cdb_length: 0,
            transfer_count: 0,
            timeout_ms: 0,
            status: OperationStatus::Invalid,
            status_qualifier: 0,
        }
    }
}

impl CdbOperation {
    pub const KIND: OperationKind = OperationKind::Cdb;

    pub fn build(&mut self, cdb: &[u8], transfer_count: u32, timeout_ms: u32) {
        let len = cdb.len().min(CDB_MAX_LENGTH);
        self.cdb = [0; CDB_MAX_LENGTH];
        self.cdb[..len].copy_from_slice(&cdb[..len]);
        self.cdb_length = len;
        self.transfer_count = transfer_count;
        self.timeout_ms = timeout_ms;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// FIS (SATA pass-through)
// =============================================================================

/// SATA FIS pass-through operation
#[derive(Debug, Clone)]
pub struct FisOperation {
    /// Raw FIS bytes; semantics belong to the physical transport
    pub fis: [u8; FIS_MAX_LENGTH],
    /// Response FIS from the device
    pub response: [u8; FIS_MAX_LENGTH],
    /// Transfer length in bytes
    pub transfer_count: u32,
    /// Per-command timeout in milliseconds
    pub timeout_ms: u32,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl Default for FisOperation {
    fn default() -> Self {
        Self {
            fis: [0; FIS_MAX_LENGTH],
            response: [0; FIS_MAX_LENGTH],
            transfer_count: 0,
            timeout_ms: 0,
            status: OperationStatus::Invalid,
            status_qualifier: 0,
        }
    }
}

impl FisOperation {
    pub const KIND: OperationKind = OperationKind::Fis;

    pub fn build(&mut self, fis: &[u8], transfer_count: u32, timeout_ms: u32) {
        let len = fis.len().min(FIS_MAX_LENGTH);
        self.fis = [0; FIS_MAX_LENGTH];
        self.fis[..len].copy_from_slice(&fis[..len]);
        self.response = [0; FIS_MAX_LENGTH];
        self.transfer_count = transfer_count;
        self.timeout_ms = timeout_ms;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// DMRB (legacy driver pass-through)
// =============================================================================

/// Legacy DMRB pass-through operation
#[derive(Debug, Clone, Default)]
pub struct DmrbOperation {
    /// Legacy driver operation code
    pub opcode: u32,
    /// Opaque legacy request block
    pub buffer: Bytes,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl DmrbOperation {
    pub const KIND: OperationKind = OperationKind::Dmrb;

    pub fn build(&mut self, opcode: u32, buffer: Bytes) {
        self.opcode = opcode;
        self.buffer = buffer;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// SMP (SAS management)
// =============================================================================

/// SAS SMP management operation
#[derive(Debug, Clone)]
pub struct SmpOperation {
    /// Raw SMP frame; semantics belong to the SAS transport
    pub request: [u8; SMP_MAX_LENGTH],
    /// Valid length of `request`
    pub request_length: usize,
    /// Response frame from the expander
    pub response: [u8; SMP_MAX_LENGTH],
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl Default for SmpOperation {
    fn default() -> Self {
        Self {
            request: [0; SMP_MAX_LENGTH],
            request_length: 0,
            response: [0; SMP_MAX_LENGTH],
            status: OperationStatus::Invalid,
            status_qualifier: 0,
        }
    }
}

impl SmpOperation {
    pub const KIND: OperationKind = OperationKind::Smp;

    pub fn build(&mut self, request: &[u8]) {
        let len = request.len().min(SMP_MAX_LENGTH);
        self.request = [0; SMP_MAX_LENGTH];
        self.request[..len].copy_from_slice(&request[..len]);
        self.request_length = len;
        self.response = [0; SMP_MAX_LENGTH];
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Diplex (enclosure serial protocol)
// =============================================================================

/// Diplex enclosure operation
#[derive(Debug, Clone, Default)]
pub struct DiplexOperation {
    /// Diplex function code
    pub opcode: u32,
    /// Opaque frame buffer
    pub buffer: Bytes,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl DiplexOperation {
    pub const KIND: OperationKind = OperationKind::Diplex;

    pub fn build(&mut self, opcode: u32, buffer: Bytes) {
        self.opcode = opcode;
        self.buffer = buffer;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Stripe Lock
// =============================================================================

/// Type of stripe lock operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StripeLockOpcode {
    #[default]
    Invalid,
    ReadLock,
    WriteLock,
    Unlock,
}

/// Stripe lock acquire/release operation
#[derive(Debug, Clone, Default)]
pub struct StripeLockOperation {
    pub opcode: StripeLockOpcode,
    /// First stripe covered by the lock
    pub stripe_number: u64,
    /// Number of stripes covered
    pub stripe_count: u64,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl StripeLockOperation {
    pub const KIND: OperationKind = OperationKind::StripeLock;

    pub fn build(&mut self, opcode: StripeLockOpcode, stripe_number: u64, stripe_count: u64) {
        self.opcode = opcode;
        self.stripe_number = stripe_number;
        self.stripe_count = stripe_count;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Memory service operation (chunk-level bookkeeping)
#[derive(Debug, Clone, Default)]
pub struct MemoryOperation {
    /// Memory service operation code
    pub opcode: u32,
    /// Number of chunks this operation covers
    pub chunk_count: usize,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl MemoryOperation {
    pub const KIND: OperationKind = OperationKind::Memory;

    pub fn build(&mut self, opcode: u32, chunk_count: usize) {
        self.opcode = opcode;
        self.chunk_count = chunk_count;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Metadata service operation
#[derive(Debug, Clone, Default)]
pub struct MetadataOperation {
    /// Metadata service operation code
    pub opcode: u32,
    /// Byte offset into the metadata region
    pub offset: u64,
    /// Record payload handed to the metadata service
    pub record_data: Bytes,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl MetadataOperation {
    pub const KIND: OperationKind = OperationKind::Metadata;

    pub fn build(&mut self, opcode: u32, offset: u64, record_data: Bytes) {
        self.opcode = opcode;
        self.offset = offset;
        self.record_data = record_data;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Persistent Memory
// =============================================================================

/// Persistent memory operation
#[derive(Debug, Clone, Default)]
pub struct PersistentMemoryOperation {
    /// Persistence service operation code
    pub opcode: u32,
    /// Target offset in the persistent region
    pub offset: u64,
    /// Transfer length in bytes
    pub length: usize,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl PersistentMemoryOperation {
    pub const KIND: OperationKind = OperationKind::PersistentMemory;

    pub fn build(&mut self, opcode: u32, offset: u64, length: usize) {
        self.opcode = opcode;
        self.offset = offset;
        self.length = length;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

// =============================================================================
// Buffer
// =============================================================================

/// Raw buffer hand-off operation
#[derive(Debug, Clone, Default)]
pub struct BufferOperation {
    /// The buffer being handed to the receiver
    pub buffer: Bytes,
    pub status: OperationStatus,
    pub status_qualifier: u32,
}

impl BufferOperation {
    pub const KIND: OperationKind = OperationKind::Buffer;

    pub fn build(&mut self, buffer: Bytes) {
        self.buffer = buffer;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdb_build_truncates_to_max() {
        let mut op = CdbOperation::default();
        let long_cdb = [0xA5u8; 32];
        op.build(&long_cdb, 4096, 30_000);
        assert_eq!(op.cdb_length, CDB_MAX_LENGTH);
        assert_eq!(op.cdb[CDB_MAX_LENGTH - 1], 0xA5);
    }

    #[test]
    fn test_stripe_lock_build() {
        let mut op = StripeLockOperation::default();
        op.build(StripeLockOpcode::WriteLock, 100, 8);
        assert_eq!(op.opcode, StripeLockOpcode::WriteLock);
        assert_eq!(op.stripe_number, 100);
        assert_eq!(op.stripe_count, 8);
        assert_eq!(op.status, OperationStatus::Invalid);
    }

    #[test]
    fn test_smp_response_cleared_on_build() {
        let mut op = SmpOperation::default();
        op.response[0] = 0xFF;
        op.build(&[0x40, 0x00]);
        assert_eq!(op.response[0], 0);
        assert_eq!(op.request_length, 2);
    }
}
