//! Virtio PCI identity and the vendor-specific capabilities that describe the modern BAR.

use vnet_devices::pci::{PciConfigSpace, PciError, VendorSpecificCapability};

pub const PCI_VENDOR_ID_VIRTIO: u16 = 0x1af4;

/// Modern virtio-pci device IDs: `0x1040 + <virtio device id>`.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

/// Revision 1 marks a modern (non-transitional) function.
pub const VIRTIO_PCI_ABI_VERSION: u8 = 1;

pub const PCI_CLASS_NETWORK: u8 = 0x02;
pub const PCI_SUBCLASS_NETWORK_ETHERNET: u8 = 0x00;

pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;

pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// `struct virtio_pci_cap` is 16 bytes; the notify variant appends a 32-bit multiplier.
pub const VIRTIO_PCI_CAP_LEN: u8 = 16;
pub const VIRTIO_PCI_NOTIFY_CAP_LEN: u8 = 20;

pub fn virtio_pci_device_id(device_type: u16) -> u16 {
    VIRTIO_PCI_DEVICE_ID_BASE + device_type
}

/// One `struct virtio_pci_cap` pointing at a window inside a BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioPciCap {
    pub cfg_type: u8,
    pub bar: u8,
    pub id: u8,
    pub offset: u32,
    pub length: u32,
    /// Present only on the notify capability.
    pub notify_off_multiplier: Option<u32>,
}

impl VirtioPciCap {
    pub fn cap_len(&self) -> u8 {
        if self.notify_off_multiplier.is_some() {
            VIRTIO_PCI_NOTIFY_CAP_LEN
        } else {
            VIRTIO_PCI_CAP_LEN
        }
    }

    /// Everything after the ID and next-pointer bytes.
    fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(usize::from(self.cap_len()) - 2);
        payload.push(self.cap_len());
        payload.push(self.cfg_type);
        payload.push(self.bar);
        payload.push(self.id);
        payload.extend_from_slice(&[0, 0]); // padding
        payload.extend_from_slice(&self.offset.to_le_bytes());
        payload.extend_from_slice(&self.length.to_le_bytes());
        if let Some(mult) = self.notify_off_multiplier {
            payload.extend_from_slice(&mult.to_le_bytes());
        }
        payload
    }
}

/// Appends a virtio capability to the standard list at the first free offset and returns that
/// offset.
pub fn add_virtio_cap(config: &mut PciConfigSpace, cap: &VirtioPciCap) -> Result<u8, PciError> {
    let offset = config.add_capability(Box::new(VendorSpecificCapability::new(cap.payload())))?;
    tracing::trace!(cfg_type = cap.cfg_type, bar = cap.bar, offset, "virtio capability");
    Ok(offset)
}
