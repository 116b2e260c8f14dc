//! PCI Express capability (endpoint flavour) and Function Level Reset plumbing.

use std::any::Any;

use super::capabilities::{
    read_u16, write_u16, write_u32, ConfigBytes, PciCapability, PCI_CAP_ID_EXP,
};
use super::config::PciConfigSpace;

/// Length of a version 2 PCI Express capability structure.
pub const PCI_EXP_VER2_SIZEOF: u8 = 0x3c;

pub const PCI_EXP_FLAGS: usize = 0x02;
pub const PCI_EXP_DEVCAP: usize = 0x04;
pub const PCI_EXP_DEVCTL: usize = 0x08;
pub const PCI_EXP_DEVSTA: usize = 0x0a;
pub const PCI_EXP_LNKCAP: usize = 0x0c;
pub const PCI_EXP_LNKCTL: usize = 0x10;
pub const PCI_EXP_LNKSTA: usize = 0x12;
pub const PCI_EXP_DEVCAP2: usize = 0x24;
pub const PCI_EXP_DEVCTL2: usize = 0x28;

pub const PCI_EXP_FLAGS_VER2: u16 = 0x2;
pub const PCI_EXP_TYPE_ENDPOINT: u16 = 0x0;

pub const PCI_EXP_DEVCAP_RBER: u32 = 1 << 15;
pub const PCI_EXP_DEVCAP_FLR: u32 = 1 << 28;
pub const PCI_EXP_DEVCTL_BCR_FLR: u16 = 1 << 15;

/// Correctable/non-fatal/fatal/UR reporting enables, relaxed ordering, payload, extended tag,
/// phantom functions, aux power, no-snoop and max read request size.
const DEVCTL_WRITABLE: u16 = 0x7fff;
/// Relaxed ordering + no-snoop enabled, 512-byte max read request.
const DEVCTL_DEFAULT: u16 = 0x2810;
/// ASPM control and common clock configuration.
const LNKCTL_WRITABLE: u16 = 0x0043;
/// Completion timeout value/disable.
const DEVCTL2_WRITABLE: u16 = 0x001f;

/// x1 link at 2.5 GT/s.
const LNK_SPEED_WIDTH: u16 = 0x0011;
/// Completion timeout ranges A/B supported.
const DEVCAP2_DEFAULT: u32 = 0x0000_0013;

/// PCI Express capability for an endpoint function.
#[derive(Debug, Clone)]
pub struct PcieCapability {
    offset: u8,
    dev_cap: u32,
    dev_ctl: u16,
    link_ctl: u16,
    dev_ctl2: u16,
}

impl PcieCapability {
    pub fn endpoint() -> Self {
        Self {
            offset: 0,
            dev_cap: PCI_EXP_DEVCAP_RBER,
            dev_ctl: DEVCTL_DEFAULT,
            link_ctl: 0,
            dev_ctl2: 0,
        }
    }

    /// Advertises Function Level Reset and makes Initiate FLR writable.
    pub fn enable_flr(&mut self) {
        self.dev_cap |= PCI_EXP_DEVCAP_FLR;
    }

    pub fn flr_capable(&self) -> bool {
        self.dev_cap & PCI_EXP_DEVCAP_FLR != 0
    }

    pub fn device_control(&self) -> u16 {
        self.dev_ctl
    }

    /// Consumes a latched Initiate FLR request. The bit always reads back as zero afterwards.
    pub fn take_flr_request(&mut self) -> bool {
        let requested = self.dev_ctl & PCI_EXP_DEVCTL_BCR_FLR != 0;
        self.dev_ctl &= !PCI_EXP_DEVCTL_BCR_FLR;
        requested
    }

    pub fn reset(&mut self) {
        self.dev_ctl = DEVCTL_DEFAULT;
        self.link_ctl = 0;
        self.dev_ctl2 = 0;
    }

    fn flags(&self) -> u16 {
        PCI_EXP_FLAGS_VER2 | (PCI_EXP_TYPE_ENDPOINT << 4)
    }

    fn dev_ctl_writable(&self) -> u16 {
        if self.flr_capable() {
            DEVCTL_WRITABLE | PCI_EXP_DEVCTL_BCR_FLR
        } else {
            DEVCTL_WRITABLE
        }
    }
}

impl PciCapability for PcieCapability {
    fn id(&self) -> u8 {
        PCI_CAP_ID_EXP
    }

    fn offset(&self) -> u8 {
        self.offset
    }

    fn set_offset(&mut self, offset: u8) {
        self.offset = offset;
    }

    fn len(&self) -> u8 {
        PCI_EXP_VER2_SIZEOF
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = self.offset as usize;
        write_u16(config, base + PCI_EXP_FLAGS, self.flags());
        write_u32(config, base + PCI_EXP_DEVCAP, self.dev_cap);
        write_u16(config, base + PCI_EXP_DEVCTL, self.dev_ctl);
        write_u16(config, base + PCI_EXP_DEVSTA, 0);
        write_u32(config, base + PCI_EXP_LNKCAP, u32::from(LNK_SPEED_WIDTH));
        write_u16(config, base + PCI_EXP_LNKCTL, self.link_ctl);
        write_u16(config, base + PCI_EXP_LNKSTA, LNK_SPEED_WIDTH);
        write_u32(config, base + PCI_EXP_DEVCAP2, DEVCAP2_DEFAULT);
        write_u16(config, base + PCI_EXP_DEVCTL2, self.dev_ctl2);
    }

    fn sync_from_config(&mut self, config: &mut ConfigBytes) {
        let base = self.offset as usize;
        self.dev_ctl = read_u16(config, base + PCI_EXP_DEVCTL) & self.dev_ctl_writable();
        self.link_ctl = read_u16(config, base + PCI_EXP_LNKCTL) & LNKCTL_WRITABLE;
        self.dev_ctl2 = read_u16(config, base + PCI_EXP_DEVCTL2) & DEVCTL2_WRITABLE;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Second stage of a configuration write on an FLR-capable function.
///
/// Returns true when the write touched Device Control with Initiate FLR set; the caller must then
/// reset the function. The request bit is consumed either way.
pub fn flr_write_config(config: &mut PciConfigSpace, offset: u16, size: usize) -> bool {
    let Some(cap) = config.find_capability(PCI_CAP_ID_EXP) else {
        return false;
    };
    let devctl = u16::from(cap) + PCI_EXP_DEVCTL as u16;
    let overlaps = offset < devctl + 2 && offset + size as u16 > devctl;
    if !overlaps {
        return false;
    }
    let Some(pcie) = config.capability_mut::<PcieCapability>() else {
        return false;
    };
    let requested = pcie.take_flr_request();
    config.sync_capabilities();
    requested
}
