//! Routes guest configuration and BAR accesses to the function they address.

use memory::{all_ones, AccessWidth, MmioHandler};
use vnet_devices::pci::{BusServices, MsixCapability};

use crate::function::{config_access_ok, deliver_pending_msix, FunctionId, NetFunction};
use crate::net_pci::VirtioNetPci;
use crate::transport::ModernBar;

impl<H: BusServices> VirtioNetPci<H> {
    /// Configuration read on the PF or one of its VFs. Functions the guest cannot see read as
    /// all-ones, like an empty slot.
    pub fn function_config_read(&mut self, function: FunctionId, offset: u16, size: usize) -> u32 {
        let parts = self.pf_parts();
        match function {
            FunctionId::Pf => {
                if !config_access_ok(offset, size) {
                    return all_ones(size) as u32;
                }
                parts.config.read(offset, size)
            }
            FunctionId::Vf(index) => match parts.vfs.get_mut(usize::from(index)) {
                Some(Some(vf)) => vf.guest_config_read(offset, size),
                _ => all_ones(size) as u32,
            },
        }
    }

    pub fn function_config_write(
        &mut self,
        function: FunctionId,
        offset: u16,
        size: usize,
        value: u32,
    ) {
        match function {
            FunctionId::Pf => self.guest_config_write(offset, size, value),
            FunctionId::Vf(index) => {
                let parts = self.pf_parts();
                if let Some(Some(vf)) = parts.vfs.get_mut(usize::from(index)) {
                    vf.guest_config_write(offset, size, value, parts.host);
                }
            }
        }
    }

    /// Load from `bar` of `function`.
    ///
    /// Widths other than 1, 2 and 4 bytes and misaligned accesses read as zero. Windows whose
    /// backing device is missing read as all-ones.
    pub fn mmio_read(&mut self, function: FunctionId, bar: u8, offset: u64, size: usize) -> u64 {
        let Some(width) = AccessWidth::from_size(size) else {
            return 0;
        };
        if !width.is_aligned(offset) {
            return 0;
        }
        let parts = self.pf_parts();
        match function {
            FunctionId::Pf => {
                if !parts.realized {
                    return all_ones(size);
                }
                if bar == parts.modern_bar {
                    let mut regs = parts.shared.borrow_mut();
                    let mut window = ModernBar {
                        rid: parts.rid,
                        shared: Some(&mut *regs),
                        isr: parts.isr,
                    };
                    window.read(offset, size)
                } else if bar == parts.msix_bar {
                    match parts.config.capability::<MsixCapability>() {
                        Some(msix) => msix.bar_read(bar, offset, size),
                        None => all_ones(size),
                    }
                } else {
                    all_ones(size)
                }
            }
            FunctionId::Vf(index) => match parts.vfs.get_mut(usize::from(index)) {
                Some(Some(vf)) if vf.is_guest_visible() => vf.bar_read(bar, offset, size),
                _ => all_ones(size),
            },
        }
    }

    /// Store to `bar` of `function`. Unsupported widths, misaligned offsets and windows without a
    /// backing device drop the write.
    pub fn mmio_write(
        &mut self,
        function: FunctionId,
        bar: u8,
        offset: u64,
        size: usize,
        value: u64,
    ) {
        let Some(width) = AccessWidth::from_size(size) else {
            return;
        };
        if !width.is_aligned(offset) {
            return;
        }
        let parts = self.pf_parts();
        match function {
            FunctionId::Pf => {
                if !parts.realized {
                    return;
                }
                if bar == parts.modern_bar {
                    let mut regs = parts.shared.borrow_mut();
                    let mut window = ModernBar {
                        rid: parts.rid,
                        shared: Some(&mut *regs),
                        isr: parts.isr,
                    };
                    window.write(offset, size, value);
                } else if bar == parts.msix_bar {
                    if let Some(msix) = parts.config.capability_mut::<MsixCapability>() {
                        msix.bar_write(bar, offset, size, value);
                    }
                    deliver_pending_msix(parts.rid, parts.config, parts.host);
                }
            }
            FunctionId::Vf(index) => {
                if let Some(Some(vf)) = parts.vfs.get_mut(usize::from(index)) {
                    if vf.is_guest_visible() {
                        vf.bar_write(bar, offset, size, value, parts.host);
                    }
                }
            }
        }
    }

    /// An [`MmioHandler`] for one BAR of one function, for hosts that map BARs as windows.
    pub fn bar_handle(&mut self, function: FunctionId, bar: u8) -> BarHandle<'_, H> {
        BarHandle {
            pci: self,
            function,
            bar,
        }
    }
}

pub struct BarHandle<'a, H: BusServices> {
    pci: &'a mut VirtioNetPci<H>,
    function: FunctionId,
    bar: u8,
}

impl<H: BusServices> MmioHandler for BarHandle<'_, H> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        self.pci.mmio_read(self.function, self.bar, offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        self.pci
            .mmio_write(self.function, self.bar, offset, size, value);
    }
}
