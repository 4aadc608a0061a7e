//! Block Operation Record
//!
//! The payload record for the logical storage-extent protocol. All logical
//! block I/O between the LUN, RAID, virtual-drive, and physical-drive layers
//! travels as one of these records on the payload stack.

use bitflags::bitflags;

use crate::payload::{OperationKind, OperationStatus};

/// Logical block address
pub type Lba = u64;

/// Number of blocks in an operation
pub type BlockCount = u64;

/// Block size in bytes
pub type BlockSize = u32;

/// Type of block operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockOpcode {
    /// The opcode has not been built yet
    #[default]
    Invalid,
    /// Standard read
    Read,
    /// Standard write; unaligned writes carry a pre-read descriptor
    Write,
    /// Write zeros with valid checksums
    Zero,
    /// Check whether an extent is already zeroed
    CheckZeroed,
    /// Write verified against media
    WriteVerify,
    /// Background verify pass
    Verify,
    /// Rebuild a degraded extent
    Rebuild,
    /// Negotiate block size with the server object
    NegotiateBlockSize,
    /// Identify the server object
    Identify,
}

bitflags! {
    /// Behavior flags carried by a block operation
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u32 {
        /// Bypass caches; force media access
        const FORCE_UNIT_ACCESS     = 0x0000_0001;
        /// Verify data checksums while transferring (default on)
        const CHECK_CHECKSUM        = 0x0000_0002;
        /// Deliberately corrupt CRCs (error injection path)
        const CORRUPT_CRC           = 0x0000_0004;
        /// Operation issued by the metadata service
        const METADATA_OP           = 0x0000_0008;
        /// Write even if the extent is quiesced
        const FORCED_WRITE          = 0x0000_0010;
        /// Fail rather than queue under congestion
        const ALLOW_FAIL_CONGESTION = 0x0000_0020;
        /// Do not queue at the server object
        const DO_NOT_QUEUE          = 0x0000_0040;
        /// Unmap rather than write zeros
        const UNMAP                 = 0x0000_0400;
    }
}

/// Pre-read data for writes not aligned to the optimum block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreReadDescriptor {
    /// Start of the pre-read extent
    pub lba: Lba,
    /// Length of the pre-read extent in blocks
    pub block_count: BlockCount,
}

/// Block operation record (fixed maximum layout)
#[derive(Debug, Clone)]
pub struct BlockOperation {
    /// What to do
    pub opcode: BlockOpcode,
    /// First logical block address
    pub lba: Lba,
    /// Number of blocks
    pub block_count: BlockCount,
    /// Exported block size in bytes
    pub block_size: BlockSize,
    /// Blocks per optimum (edgeless) I/O unit
    pub optimum_block_size: BlockSize,
    /// Pre-read data for unaligned writes
    pub pre_read: Option<PreReadDescriptor>,
    /// Behavior flags
    pub flags: BlockFlags,
    /// Completion status set by the server object
    pub status: OperationStatus,
    /// Opcode-specific status detail
    pub status_qualifier: u32,
}

impl Default for BlockOperation {
    fn default() -> Self {
        Self {
            opcode: BlockOpcode::Invalid,
            lba: 0,
            block_count: 0,
            block_size: 0,
            optimum_block_size: 0,
            pre_read: None,
            flags: BlockFlags::empty(),
            status: OperationStatus::Invalid,
            status_qualifier: 0,
        }
    }
}

impl BlockOperation {
    /// Kind tag for this record
    pub const KIND: OperationKind = OperationKind::Block;

    /// Fill the mandatory fields of a freshly allocated block record.
    ///
    /// Status is reset to `Invalid` and checksum verification is enabled by
    /// default; callers that do not want it must clear the flag explicitly.
    pub fn build(
        &mut self,
        opcode: BlockOpcode,
        lba: Lba,
        block_count: BlockCount,
        block_size: BlockSize,
        optimum_block_size: BlockSize,
        pre_read: Option<PreReadDescriptor>,
    ) {
        self.opcode = opcode;
        self.lba = lba;
        self.block_count = block_count;
        self.block_size = block_size;
        self.optimum_block_size = optimum_block_size;
        self.pre_read = pre_read;
        self.flags = BlockFlags::CHECK_CHECKSUM;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }

    /// Set the completion status and qualifier
    pub fn set_status(&mut self, status: OperationStatus, qualifier: u32) {
        self.status = status;
        self.status_qualifier = qualifier;
    }

    /// Check whether a behavior flag is set
    pub fn is_flag_set(&self, flag: BlockFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Set a behavior flag
    pub fn set_flag(&mut self, flag: BlockFlags) {
        self.flags.insert(flag);
    }

    /// Clear a behavior flag
    pub fn clear_flag(&mut self, flag: BlockFlags) {
        self.flags.remove(flag);
    }
}
