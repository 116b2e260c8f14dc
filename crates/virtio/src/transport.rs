//! Register state behind the modern BAR windows.
//!
//! [`SharedRegisters`] is owned by the PF and reached by every VF through a weak handle, so a VF
//! window aliases the PF's common, device and notify state instead of copying it. ISR status is
//! the exception: each function keeps its own [`IsrStatus`].

use std::cell::RefCell;
use std::rc::Rc;

use memory::{AccessWidth, MmioHandler};
use vnet_devices::pci::PciBdf;

use crate::devices::VirtioDevice;
use crate::layout::{resolve, Backing, VirtioRegion, NOTIFY_OFF_MULTIPLIER, REGION_SIZE};

pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

pub const VIRTIO_PCI_ISR_QUEUE: u8 = 0x01;
pub const VIRTIO_PCI_ISR_CONFIG: u8 = 0x02;

// struct virtio_pci_common_cfg fields the block is seeded with.
pub const VIRTIO_PCI_COMMON_DF: u64 = 0x04;
pub const VIRTIO_PCI_COMMON_MSIX: u64 = 0x10;
pub const VIRTIO_PCI_COMMON_NUMQ: u64 = 0x12;

pub type SharedRegistersHandle = Rc<RefCell<SharedRegisters>>;

/// A queue notification written by a driver through the notify window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueNotification {
    pub rid: PciBdf,
    pub queue: u16,
}

/// Virtio register state owned by the PF.
pub struct SharedRegisters {
    device: Option<Box<dyn VirtioDevice>>,
    common: Box<[u8; REGION_SIZE as usize]>,
    num_queues: u16,
    notifications: Vec<QueueNotification>,
}

impl SharedRegisters {
    pub fn new(num_queues: u16) -> Self {
        let mut regs = Self {
            device: None,
            common: Box::new([0u8; REGION_SIZE as usize]),
            num_queues,
            notifications: Vec::new(),
        };
        regs.reset_common();
        regs
    }

    pub fn into_handle(self) -> SharedRegistersHandle {
        Rc::new(RefCell::new(self))
    }

    /// Attaches `device` and reseeds the common block from it, returning the device it replaced.
    pub fn attach(&mut self, device: Box<dyn VirtioDevice>) -> Option<Box<dyn VirtioDevice>> {
        self.num_queues = device.num_queues();
        let previous = self.device.replace(device);
        self.reset_common();
        previous
    }

    pub fn detach(&mut self) -> Option<Box<dyn VirtioDevice>> {
        self.device.take()
    }

    pub fn is_attached(&self) -> bool {
        self.device.is_some()
    }

    pub fn device<T: VirtioDevice + 'static>(&self) -> Option<&T> {
        self.device.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn device_mut<T: VirtioDevice + 'static>(&mut self) -> Option<&mut T> {
        self.device.as_mut()?.as_any_mut().downcast_mut::<T>()
    }

    pub fn num_queues(&self) -> u16 {
        self.num_queues
    }

    /// Feature bits offered by the attached device, or 0 with nothing attached.
    pub fn device_features(&self) -> u64 {
        self.device.as_ref().map_or(0, |device| device.device_features())
    }

    /// The configuration-change vector the driver programmed, or [`VIRTIO_MSI_NO_VECTOR`].
    pub fn msix_config(&self) -> u16 {
        let off = VIRTIO_PCI_COMMON_MSIX as usize;
        u16::from_le_bytes([self.common[off], self.common[off + 1]])
    }

    /// Device reset: the common block returns to its seeded state and the device resets.
    pub fn reset(&mut self) {
        self.reset_common();
        self.notifications.clear();
        if let Some(device) = self.device.as_mut() {
            device.reset();
        }
    }

    pub fn take_notifications(&mut self) -> Vec<QueueNotification> {
        std::mem::take(&mut self.notifications)
    }

    fn reset_common(&mut self) {
        self.common.fill(0);
        // device_feature_select resets to 0, so the window starts on the low feature dword.
        let features = VIRTIO_PCI_COMMON_DF as usize;
        let low = self.device_features() as u32;
        self.common[features..features + 4].copy_from_slice(&low.to_le_bytes());
        let msix = VIRTIO_PCI_COMMON_MSIX as usize;
        self.common[msix..msix + 2].copy_from_slice(&VIRTIO_MSI_NO_VECTOR.to_le_bytes());
        let numq = VIRTIO_PCI_COMMON_NUMQ as usize;
        self.common[numq..numq + 2].copy_from_slice(&self.num_queues.to_le_bytes());
    }

    fn common_read(&self, offset: u64, width: AccessWidth) -> u32 {
        let start = offset as usize;
        let mut buf = [0u8; 4];
        buf[..width.bytes()].copy_from_slice(&self.common[start..start + width.bytes()]);
        u32::from_le_bytes(buf)
    }

    fn common_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        let start = offset as usize;
        let bytes = value.to_le_bytes();
        self.common[start..start + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
    }

    fn device_config_len(&self) -> usize {
        self.device.as_ref().map_or(0, |device| device.config_len())
    }

    fn config_modern_read(&self, addr: u64, data: &mut [u8]) -> u32 {
        let Some(device) = self.device.as_ref() else {
            return u32::MAX;
        };
        let in_range = addr
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.device_config_len() as u64);
        if !in_range {
            return u32::MAX;
        }
        device.read_config(addr, data);
        let mut buf = [0u8; 4];
        buf[..data.len()].copy_from_slice(data);
        u32::from_le_bytes(buf)
    }

    pub fn config_modern_readb(&self, addr: u64) -> u32 {
        self.config_modern_read(addr, &mut [0u8; 1])
    }

    pub fn config_modern_readw(&self, addr: u64) -> u32 {
        self.config_modern_read(addr, &mut [0u8; 2])
    }

    pub fn config_modern_readl(&self, addr: u64) -> u32 {
        self.config_modern_read(addr, &mut [0u8; 4])
    }

    fn config_modern_write(&mut self, addr: u64, data: &[u8]) {
        let in_range = addr
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.device_config_len() as u64);
        if !in_range {
            return;
        }
        if let Some(device) = self.device.as_mut() {
            device.write_config(addr, data);
        }
    }

    pub fn config_modern_writeb(&mut self, addr: u64, value: u8) {
        self.config_modern_write(addr, &[value]);
    }

    pub fn config_modern_writew(&mut self, addr: u64, value: u16) {
        self.config_modern_write(addr, &value.to_le_bytes());
    }

    pub fn config_modern_writel(&mut self, addr: u64, value: u32) {
        self.config_modern_write(addr, &value.to_le_bytes());
    }

    fn device_read(&self, offset: u64, width: AccessWidth) -> u32 {
        match width {
            AccessWidth::Byte => self.config_modern_readb(offset),
            AccessWidth::Word => self.config_modern_readw(offset),
            AccessWidth::Dword => self.config_modern_readl(offset),
        }
    }

    fn device_write(&mut self, offset: u64, width: AccessWidth, value: u32) {
        match width {
            AccessWidth::Byte => self.config_modern_writeb(offset, value as u8),
            AccessWidth::Word => self.config_modern_writew(offset, value as u16),
            AccessWidth::Dword => self.config_modern_writel(offset, value),
        }
    }

    fn window_read(&self, region: VirtioRegion, rel: u64, width: AccessWidth) -> u32 {
        match region {
            VirtioRegion::Common => self.common_read(rel, width),
            VirtioRegion::Device => self.device_read(rel, width),
            VirtioRegion::Isr | VirtioRegion::Notify => 0,
        }
    }

    fn window_write(
        &mut self,
        rid: PciBdf,
        region: VirtioRegion,
        rel: u64,
        width: AccessWidth,
        value: u32,
    ) {
        match region {
            VirtioRegion::Common => self.common_write(rel, width, value),
            VirtioRegion::Device => self.device_write(rel, width, value),
            VirtioRegion::Notify => self.notify_write(rid, rel),
            VirtioRegion::Isr => {}
        }
    }

    fn notify_write(&mut self, rid: PciBdf, offset: u64) {
        let mult = u64::from(NOTIFY_OFF_MULTIPLIER);
        if offset % mult != 0 {
            return;
        }
        let Ok(queue) = u16::try_from(offset / mult) else {
            return;
        };
        if queue >= self.num_queues {
            tracing::trace!(%rid, queue, "notification for a queue the device does not have");
            return;
        }
        self.notifications.push(QueueNotification { rid, queue });
    }
}

/// Interrupt status byte of one function. Reading it clears it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IsrStatus(u8);

impl IsrStatus {
    pub fn raise(&mut self, bits: u8) {
        self.0 |= bits;
    }

    pub fn peek(&self) -> u8 {
        self.0
    }

    pub fn read_and_clear(&mut self) -> u8 {
        std::mem::take(&mut self.0)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// The modern BAR of one function.
///
/// `shared` is `None` when the PF that owns the registers is gone; every shared window then
/// behaves as if no device were attached.
pub(crate) struct ModernBar<'a> {
    pub rid: PciBdf,
    pub shared: Option<&'a mut SharedRegisters>,
    pub isr: &'a mut IsrStatus,
}

impl ModernBar<'_> {
    fn private_read(isr: &mut IsrStatus, region: VirtioRegion, rel: u64) -> u32 {
        match region {
            VirtioRegion::Isr if rel == 0 => u32::from(isr.read_and_clear()),
            _ => 0,
        }
    }
}

impl MmioHandler for ModernBar<'_> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        let Some(width) = AccessWidth::from_size(size) else {
            return 0;
        };
        if !width.is_aligned(offset) {
            return 0;
        }
        let Some((region, rel)) = resolve(offset, width.bytes()) else {
            return 0;
        };
        let ready = self.shared.as_deref_mut().filter(|regs| regs.is_attached());
        let Some(regs) = ready else {
            return u64::from(width.all_ones());
        };
        let value = match region.backing() {
            Backing::Shared => regs.window_read(region, rel, width),
            Backing::Private => Self::private_read(self.isr, region, rel),
        };
        u64::from(value & width.mask())
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        let Some(width) = AccessWidth::from_size(size) else {
            return;
        };
        if !width.is_aligned(offset) {
            return;
        }
        let Some((region, rel)) = resolve(offset, width.bytes()) else {
            return;
        };
        let Some(regs) = self.shared.as_deref_mut().filter(|regs| regs.is_attached()) else {
            return;
        };
        let value = value as u32 & width.mask();
        match region.backing() {
            Backing::Shared => regs.window_write(self.rid, region, rel, width, value),
            // ISR status is read-only.
            Backing::Private => {}
        }
    }
}
