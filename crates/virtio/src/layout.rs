//! Sub-window layout of the modern virtio BAR, shared by the PF and every VF.

use crate::pci::{
    VirtioPciCap, VIRTIO_PCI_CAP_COMMON_CFG, VIRTIO_PCI_CAP_DEVICE_CFG, VIRTIO_PCI_CAP_ISR_CFG,
    VIRTIO_PCI_CAP_NOTIFY_CFG,
};

pub const MODERN_BAR_SIZE: u64 = 0x4000;
pub const REGION_SIZE: u64 = 0x1000;
pub const NOTIFY_OFF_MULTIPLIER: u32 = 4;

/// Size of the exclusive MSI-X BAR on each VF, and where its PBA starts.
pub const VF_MSIX_BAR_SIZE: u64 = 0x4000;
pub const VF_MSIX_PBA_OFFSET: u32 = 0x2000;

const MSIX_ENTRY_SIZE: u64 = 16;
const MSIX_EXCLUSIVE_BAR_MIN: u64 = 0x1000;

/// Layout of an MSI-X BAR that holds nothing but the table and PBA: the table at 0, the PBA in
/// the upper half unless the table already reaches it. Returns `(pba_offset, bar_size)`.
pub fn exclusive_msix_bar(nvectors: u16) -> (u32, u64) {
    let table = u64::from(nvectors) * MSIX_ENTRY_SIZE;
    let pba = u64::from(nvectors).div_ceil(64) * 8;
    let pba_offset = (MSIX_EXCLUSIVE_BAR_MIN / 2).max(table);
    let bar_size = (pba_offset + pba)
        .next_power_of_two()
        .max(MSIX_EXCLUSIVE_BAR_MIN);
    (pba_offset as u32, bar_size)
}

/// Whether a window is serviced by the PF's registers or by the function that was accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    Shared,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtioRegion {
    Common,
    Isr,
    Device,
    Notify,
}

impl VirtioRegion {
    pub const ALL: [Self; 4] = [Self::Common, Self::Isr, Self::Device, Self::Notify];

    pub const fn cfg_type(self) -> u8 {
        match self {
            Self::Common => VIRTIO_PCI_CAP_COMMON_CFG,
            Self::Isr => VIRTIO_PCI_CAP_ISR_CFG,
            Self::Device => VIRTIO_PCI_CAP_DEVICE_CFG,
            Self::Notify => VIRTIO_PCI_CAP_NOTIFY_CFG,
        }
    }

    pub const fn offset(self) -> u64 {
        match self {
            Self::Common => 0x0000,
            Self::Isr => 0x1000,
            Self::Device => 0x2000,
            Self::Notify => 0x3000,
        }
    }

    pub const fn size(self) -> u64 {
        REGION_SIZE
    }

    /// ISR status is read-to-clear and belongs to each function; everything else aliases the
    /// PF.
    pub const fn backing(self) -> Backing {
        match self {
            Self::Isr => Backing::Private,
            _ => Backing::Shared,
        }
    }

    pub fn capability(self, bar: u8) -> VirtioPciCap {
        VirtioPciCap {
            cfg_type: self.cfg_type(),
            bar,
            id: 0,
            offset: self.offset() as u32,
            length: self.size() as u32,
            notify_off_multiplier: (self == Self::Notify).then_some(NOTIFY_OFF_MULTIPLIER),
        }
    }
}

/// Maps a modern-BAR offset to its window and the offset inside it.
///
/// Accesses that straddle two windows or run past the BAR resolve to nothing.
pub fn resolve(offset: u64, size: usize) -> Option<(VirtioRegion, u64)> {
    let end = offset.checked_add(size as u64)?;
    VirtioRegion::ALL.into_iter().find_map(|region| {
        let rel = offset.checked_sub(region.offset())?;
        (end <= region.offset() + region.size()).then_some((region, rel))
    })
}
