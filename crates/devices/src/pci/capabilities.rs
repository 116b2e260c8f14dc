use std::any::Any;

/// Size of the conventional (type 0 header + capability) part of configuration space.
pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
/// Size of the PCI Express configuration space, including the extended capability area.
pub const PCIE_CONFIG_SPACE_SIZE: usize = 4096;

pub const PCI_STATUS_OFFSET: usize = 0x06;
pub const PCI_CAP_PTR_OFFSET: usize = 0x34;
pub const PCI_STATUS_CAPABILITIES_LIST: u16 = 1 << 4;

/// First byte available to the standard capability list.
pub const PCI_CAP_AREA_START: usize = 0x40;
/// The extended capability list always starts here.
pub const PCIE_EXT_CAP_OFFSET: usize = 0x100;

pub const PCI_CAP_ID_VENDOR_SPECIFIC: u8 = 0x09;
pub const PCI_CAP_ID_EXP: u8 = 0x10;

pub const PCI_EXT_CAP_ID_ERR: u16 = 0x0001;
pub const PCI_EXT_CAP_ID_ARI: u16 = 0x000e;
pub const PCI_EXT_CAP_ID_SRIOV: u16 = 0x0010;

/// Raw configuration-space image handed to capabilities for synchronization.
pub type ConfigBytes = [u8; PCIE_CONFIG_SPACE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCapabilityInfo {
    pub id: u8,
    pub offset: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciExtCapabilityInfo {
    pub id: u16,
    pub version: u8,
    pub offset: u16,
}

/// A capability in the standard (0x40..0x100) list.
///
/// The config space owns the ID and next-pointer bytes; implementations render the rest of their
/// structure in `sync_to_config` and pick up guest-writable fields in `sync_from_config`.
pub trait PciCapability: Any {
    fn id(&self) -> u8;
    fn offset(&self) -> u8;
    fn set_offset(&mut self, offset: u8);
    fn len(&self) -> u8;

    fn sync_to_config(&self, config: &mut ConfigBytes);
    fn sync_from_config(&mut self, config: &mut ConfigBytes);

    /// Whether guest writes to bytes of this capability beyond the header may land at all.
    fn guest_writable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A capability in the PCI Express extended list (0x100..0x1000).
///
/// The config space owns the 32-bit header (ID, version, next pointer). Guest writes are routed
/// through `write_config` with an offset relative to the capability base so registers with
/// write-one-to-clear semantics can see exactly which bits were written.
pub trait PciExtCapability: Any {
    fn id(&self) -> u16;
    fn version(&self) -> u8;
    fn offset(&self) -> u16;
    fn set_offset(&mut self, offset: u16);
    fn len(&self) -> u16;

    /// Renders everything after the header.
    fn sync_to_config(&self, config: &mut ConfigBytes);
    fn write_config(&mut self, offset: u16, size: usize, value: u32);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A vendor-specific capability whose body is fixed once installed.
#[derive(Debug, Clone)]
pub struct VendorSpecificCapability {
    offset: u8,
    payload: Vec<u8>,
}

impl VendorSpecificCapability {
    /// `payload` starts at byte 2 of the capability (right after the ID and next pointer).
    pub fn new(payload: Vec<u8>) -> Self {
        Self { offset: 0, payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl PciCapability for VendorSpecificCapability {
    fn id(&self) -> u8 {
        PCI_CAP_ID_VENDOR_SPECIFIC
    }

    fn offset(&self) -> u8 {
        self.offset
    }

    fn set_offset(&mut self, offset: u8) {
        self.offset = offset;
    }

    fn len(&self) -> u8 {
        u8::try_from(2 + self.payload.len()).unwrap_or(u8::MAX)
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = self.offset as usize;
        let end = (base + 2 + self.payload.len()).min(PCI_CONFIG_SPACE_SIZE);
        config[base + 2..end].copy_from_slice(&self.payload[..end - base - 2]);
    }

    fn sync_from_config(&mut self, _config: &mut ConfigBytes) {}

    fn guest_writable(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn read_u16(config: &ConfigBytes, offset: usize) -> u16 {
    u16::from_le_bytes([config[offset], config[offset + 1]])
}

pub(crate) fn write_u16(config: &mut ConfigBytes, offset: usize, value: u16) {
    config[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(config: &mut ConfigBytes, offset: usize, value: u32) {
    config[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Merges a sub-dword register write into the current 32-bit value.
///
/// `offset` is relative to the dword holding the register. Returns the merged value and a mask of
/// the bits the access covered.
pub(crate) fn merge_dword(current: u32, offset: u16, size: usize, value: u32) -> (u32, u32) {
    let shift = u32::from(offset & 3) * 8;
    let width_mask = match size {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    };
    let mask = width_mask << shift;
    let merged = (current & !mask) | ((value << shift) & mask);
    (merged, mask)
}
