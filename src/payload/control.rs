//! Control Operation Record
//!
//! The record for control-plane traffic: an opcode plus an opaque buffer the
//! receiving object interprets. Every monitor and usurper operation in the
//! object graph travels as one of these.

use bytes::Bytes;

use crate::payload::{OperationKind, OperationStatus};

/// Control operation opcode; the receiving class defines the values
pub type ControlOpcode = u32;

/// Control operation record
#[derive(Debug, Clone, Default)]
pub struct ControlOperation {
    /// Class-specific control code
    pub opcode: ControlOpcode,
    /// Opaque request/response buffer
    pub buffer: Bytes,
    /// Expected buffer length; receivers validate against `buffer.len()`
    pub buffer_length: usize,
    /// Completion status set by the receiver
    pub status: OperationStatus,
    /// Opcode-specific status detail
    pub status_qualifier: u32,
}

impl ControlOperation {
    /// Kind tag for this record
    pub const KIND: OperationKind = OperationKind::Control;

    /// Fill the mandatory fields of a freshly allocated control record
    pub fn build(&mut self, opcode: ControlOpcode, buffer: Bytes, buffer_length: usize) {
        self.opcode = opcode;
        self.buffer = buffer;
        self.buffer_length = buffer_length;
        self.status = OperationStatus::Invalid;
        self.status_qualifier = 0;
    }

    /// Set the completion status and qualifier
    pub fn set_status(&mut self, status: OperationStatus, qualifier: u32) {
        self.status = status;
        self.status_qualifier = qualifier;
    }

    /// Validate that the attached buffer matches the declared length
    pub fn buffer_length_matches(&self) -> bool {
        self.buffer.len() == self.buffer_length
    }
}
