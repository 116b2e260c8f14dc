use std::any::Any;

use super::capabilities::{write_u16, ConfigBytes, PciExtCapability, PCI_EXT_CAP_ID_ARI};

pub const PCI_ARI_VER: u8 = 1;
pub const PCI_ARI_SIZEOF: u16 = 8;

const PCI_ARI_CAP: usize = 0x04;
const PCI_ARI_CTRL: usize = 0x06;

/// Alternative Routing-ID Interpretation capability.
///
/// Only advertises the next function number; MFVC/ACS function groups are not implemented so the
/// control register is read-only zero.
#[derive(Debug, Clone)]
pub struct AriCapability {
    offset: u16,
    next_function: u8,
}

impl AriCapability {
    pub fn new(next_function: u8) -> Self {
        Self {
            offset: 0,
            next_function,
        }
    }

    pub fn next_function(&self) -> u8 {
        self.next_function
    }
}

impl PciExtCapability for AriCapability {
    fn id(&self) -> u16 {
        PCI_EXT_CAP_ID_ARI
    }

    fn version(&self) -> u8 {
        PCI_ARI_VER
    }

    fn offset(&self) -> u16 {
        self.offset
    }

    fn set_offset(&mut self, offset: u16) {
        self.offset = offset;
    }

    fn len(&self) -> u16 {
        PCI_ARI_SIZEOF
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = usize::from(self.offset);
        write_u16(config, base + PCI_ARI_CAP, u16::from(self.next_function) << 8);
        write_u16(config, base + PCI_ARI_CTRL, 0);
    }

    fn write_config(&mut self, _offset: u16, _size: usize, _value: u32) {}

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
