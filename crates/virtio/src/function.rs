//! What the PF and its VFs have in common.

use memory::AccessWidth;
use vnet_devices::pci::capabilities::PCIE_CONFIG_SPACE_SIZE;
use vnet_devices::pci::{BusServices, MsixCapability, PciBdf, PciConfigSpace, PciDevice};

use crate::transport::{IsrStatus, VIRTIO_MSI_NO_VECTOR, VIRTIO_PCI_ISR_CONFIG};

/// Which side of the SR-IOV relationship a function is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Pf { total_vfs: u16, num_vfs: u16 },
    Vf { pf: PciBdf, index: u16 },
}

/// Identifies one function of a virtio-net SR-IOV device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionId {
    Pf,
    Vf(u16),
}

/// A virtio-net PCI function as the host bus sees it.
pub trait NetFunction: PciDevice {
    fn kind(&self) -> DeviceKind;
    fn routing_id(&self) -> PciBdf;

    /// Whether configuration and MMIO traffic from the guest reaches this function.
    fn is_guest_visible(&self) -> bool;
}

/// Configuration accesses must be 1, 2 or 4 bytes, naturally aligned and inside the 4 KiB space.
pub(crate) fn config_access_ok(offset: u16, size: usize) -> bool {
    let Some(width) = AccessWidth::from_size(size) else {
        return false;
    };
    width.is_aligned(u64::from(offset)) && usize::from(offset) + size <= PCIE_CONFIG_SPACE_SIZE
}

/// Delivers MSI-X vectors that became unmasked while pending.
pub(crate) fn deliver_pending_msix(
    rid: PciBdf,
    config: &mut PciConfigSpace,
    host: &mut dyn BusServices,
) {
    let Some(msix) = config.capability_mut::<MsixCapability>() else {
        return;
    };
    for (vector, message) in msix.drain_unmasked_pending() {
        tracing::trace!(%rid, vector, "delivering pending vector");
        host.signal_vector(rid, message);
    }
}

/// Raises the configuration-change interrupt of one function.
pub(crate) fn signal_config_change(
    rid: PciBdf,
    config: &mut PciConfigSpace,
    isr: &mut IsrStatus,
    vector: u16,
    host: &mut dyn BusServices,
) {
    isr.raise(VIRTIO_PCI_ISR_CONFIG);
    if vector == VIRTIO_MSI_NO_VECTOR {
        return;
    }
    let Some(msix) = config.capability_mut::<MsixCapability>() else {
        return;
    };
    if let Some(message) = msix.trigger(vector) {
        host.signal_vector(rid, message);
    }
}
