//! Packet Addressing Header
//!
//! The 4-tuple an external router uses to deliver a packet to its
//! destination object. Resolution logic lives in the router, not here.

use serde::{Deserialize, Serialize};

/// Package (driver container) identifier
pub type PackageId = u32;

/// Service identifier within a package
pub type ServiceId = u32;

/// Class identifier for class-addressed operations
pub type ClassId = u32;

/// Object identifier within the topology
pub type ObjectId = u32;

/// Reserved invalid id used by all four address components
pub const INVALID_ID: u32 = u32::MAX;

/// Destination address carried by every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketAddress {
    pub package_id: PackageId,
    pub service_id: ServiceId,
    pub class_id: ClassId,
    pub object_id: ObjectId,
}

impl Default for PacketAddress {
    fn default() -> Self {
        Self::INVALID
    }
}

impl PacketAddress {
    /// The unaddressed state every packet starts in
    pub const INVALID: Self = Self {
        package_id: INVALID_ID,
        service_id: INVALID_ID,
        class_id: INVALID_ID,
        object_id: INVALID_ID,
    };

    /// Build a fully specified address
    pub fn new(
        package_id: PackageId,
        service_id: ServiceId,
        class_id: ClassId,
        object_id: ObjectId,
    ) -> Self {
        Self {
            package_id,
            service_id,
            class_id,
            object_id,
        }
    }

    /// True when at least the object id has been filled in
    pub fn is_addressed(&self) -> bool {
        self.object_id != INVALID_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address_is_invalid() {
        let addr = PacketAddress::default();
        assert_eq!(addr, PacketAddress::INVALID);
        assert!(!addr.is_addressed());
    }

    #[test]
    fn test_addressed_when_object_set() {
        let addr = PacketAddress::new(1, 2, INVALID_ID, 42);
        assert!(addr.is_addressed());
    }
}
