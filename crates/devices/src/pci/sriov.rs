//! Single Root I/O Virtualization extended capability.

use std::any::Any;

use super::capabilities::{
    merge_dword, write_u16, write_u32, ConfigBytes, PciExtCapability, PCI_EXT_CAP_ID_SRIOV,
};
use super::config::PciBarDefinition;
use super::error::{PciError, Result};
use super::PciBdf;

pub const PCI_SRIOV_VER: u8 = 1;
pub const PCI_SRIOV_SIZEOF: u16 = 0x40;

pub const PCI_SRIOV_CAP: u16 = 0x04;
pub const PCI_SRIOV_CTRL: u16 = 0x08;
pub const PCI_SRIOV_STATUS: u16 = 0x0a;
pub const PCI_SRIOV_INITIAL_VF: u16 = 0x0c;
pub const PCI_SRIOV_TOTAL_VF: u16 = 0x0e;
pub const PCI_SRIOV_NUM_VF: u16 = 0x10;
pub const PCI_SRIOV_FUNC_LINK: u16 = 0x12;
pub const PCI_SRIOV_VF_OFFSET: u16 = 0x14;
pub const PCI_SRIOV_VF_STRIDE: u16 = 0x16;
pub const PCI_SRIOV_VF_DID: u16 = 0x1a;
pub const PCI_SRIOV_SUP_PGSIZE: u16 = 0x1c;
pub const PCI_SRIOV_SYS_PGSIZE: u16 = 0x20;
pub const PCI_SRIOV_BAR: u16 = 0x24;
pub const PCI_SRIOV_VFM: u16 = 0x3c;

pub const PCI_SRIOV_CTRL_VFE: u16 = 1 << 0;
pub const PCI_SRIOV_CTRL_VFM: u16 = 1 << 1;
pub const PCI_SRIOV_CTRL_INTR: u16 = 1 << 2;
pub const PCI_SRIOV_CTRL_MSE: u16 = 1 << 3;
pub const PCI_SRIOV_CTRL_ARI: u16 = 1 << 4;

/// 4K, 8K, 64K, 256K, 1M and 4M pages.
pub const PCI_SRIOV_SUP_PGSIZE_DEFAULT: u32 = 0x553;

pub const PCI_SRIOV_NUM_BARS: usize = 6;

const CTRL_WRITABLE: u16 = PCI_SRIOV_CTRL_VFE | PCI_SRIOV_CTRL_MSE | PCI_SRIOV_CTRL_ARI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SriovParams {
    pub vf_device_id: u16,
    pub total_vfs: u16,
    pub initial_vfs: u16,
    pub first_vf_offset: u16,
    pub vf_stride: u16,
}

/// What a control-register write asked the PF to do with its VFs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SriovControlChange {
    Enable { num_vfs: u16 },
    Disable,
}

#[derive(Debug, Clone, Copy, Default)]
struct VfBarSlot {
    def: Option<PciBarDefinition>,
    base: u64,
    probe: bool,
}

#[derive(Debug, Clone)]
pub struct SriovCapability {
    offset: u16,
    params: SriovParams,
    control: u16,
    num_vfs: u16,
    system_page_size: u32,
    bars: [VfBarSlot; PCI_SRIOV_NUM_BARS],
    pending: Option<SriovControlChange>,
}

impl SriovCapability {
    pub fn new(params: SriovParams) -> Result<Self> {
        if params.total_vfs == 0 {
            return Err(PciError::capability_init("SR-IOV", "TotalVFs must be non-zero"));
        }
        if params.initial_vfs > params.total_vfs {
            return Err(PciError::capability_init(
                "SR-IOV",
                format!(
                    "InitialVFs {} exceeds TotalVFs {}",
                    params.initial_vfs, params.total_vfs
                ),
            ));
        }
        if params.first_vf_offset == 0 {
            return Err(PciError::capability_init(
                "SR-IOV",
                "First VF Offset of zero aliases the PF",
            ));
        }
        if params.total_vfs > 1 && params.vf_stride == 0 {
            return Err(PciError::capability_init(
                "SR-IOV",
                "VF Stride must be non-zero with more than one VF",
            ));
        }
        let last = u32::from(params.first_vf_offset)
            + u32::from(params.total_vfs - 1) * u32::from(params.vf_stride);
        if last > u32::from(u16::MAX) {
            return Err(PciError::capability_init(
                "SR-IOV",
                "VF routing IDs do not fit in 16 bits",
            ));
        }

        Ok(Self {
            offset: 0,
            params,
            control: 0,
            num_vfs: 0,
            system_page_size: 1,
            bars: [VfBarSlot::default(); PCI_SRIOV_NUM_BARS],
            pending: None,
        })
    }

    pub fn params(&self) -> SriovParams {
        self.params
    }

    pub fn total_vfs(&self) -> u16 {
        self.params.total_vfs
    }

    pub fn num_vfs(&self) -> u16 {
        self.num_vfs
    }

    pub fn vf_enabled(&self) -> bool {
        self.control & PCI_SRIOV_CTRL_VFE != 0
    }

    pub fn vf_memory_enabled(&self) -> bool {
        self.control & PCI_SRIOV_CTRL_MSE != 0
    }

    pub fn system_page_size(&self) -> u32 {
        self.system_page_size
    }

    /// Declares the per-VF BAR at `bar`. A 64-bit BAR also claims `bar + 1` for its high dword.
    pub fn set_vf_bar(&mut self, bar: u8, def: PciBarDefinition) -> Result<()> {
        let index = usize::from(bar);
        if index >= PCI_SRIOV_NUM_BARS {
            return Err(PciError::InvalidBar {
                bar,
                reason: "VF BAR index out of range",
            });
        }
        def.check()
            .map_err(|reason| PciError::InvalidBar { bar, reason })?;
        if index > 0 && self.bars[index - 1].def.is_some_and(|d| d.is_64bit()) {
            return Err(PciError::InvalidBar {
                bar,
                reason: "slot holds the high dword of a 64-bit VF BAR",
            });
        }
        if def.is_64bit() {
            if index + 1 >= PCI_SRIOV_NUM_BARS {
                return Err(PciError::InvalidBar {
                    bar,
                    reason: "64-bit VF BAR cannot occupy the last slot",
                });
            }
            if self.bars[index + 1].def.is_some() {
                return Err(PciError::InvalidBar {
                    bar,
                    reason: "high dword slot is already defined",
                });
            }
        }

        self.bars[index] = VfBarSlot {
            def: Some(def),
            base: 0,
            probe: false,
        };
        Ok(())
    }

    pub fn vf_bar_definition(&self, bar: u8) -> Option<PciBarDefinition> {
        self.bars.get(usize::from(bar)).and_then(|slot| slot.def)
    }

    pub fn vf_bar_base(&self, bar: u8) -> Option<u64> {
        let slot = self.bars.get(usize::from(bar))?;
        slot.def.map(|_| slot.base)
    }

    /// Address of VF `index`'s instance of `bar`: the VF BAR array is packed back to back.
    pub fn vf_bar_address(&self, bar: u8, index: u16) -> Option<u64> {
        let slot = self.bars.get(usize::from(bar))?;
        let def = slot.def?;
        def.size()
            .checked_mul(u64::from(index))
            .and_then(|delta| slot.base.checked_add(delta))
    }

    /// Routing ID of VF slot `index`, or `None` past TotalVFs or off the end of the RID space.
    pub fn vf_routing_id(&self, pf: PciBdf, index: u16) -> Option<PciBdf> {
        if index >= self.params.total_vfs {
            return None;
        }
        let delta = u32::from(self.params.first_vf_offset)
            + u32::from(index) * u32::from(self.params.vf_stride);
        pf.offset_by(u16::try_from(delta).ok()?)
    }

    /// Programs NumVFs as a guest write would. Ignored while VF Enable is set.
    pub fn set_num_vfs(&mut self, num_vfs: u16) {
        if self.vf_enabled() {
            return;
        }
        self.num_vfs = num_vfs.min(self.params.total_vfs);
    }

    /// Flips VF Enable as a guest write would, recording the resulting change.
    pub fn set_vf_enable(&mut self, enable: bool) {
        let control = if enable {
            self.control | PCI_SRIOV_CTRL_VFE
        } else {
            self.control & !PCI_SRIOV_CTRL_VFE
        };
        self.write_control(control);
    }

    /// Returns the VF Enable transition caused by the most recent control write, if any.
    pub fn take_pending_change(&mut self) -> Option<SriovControlChange> {
        self.pending.take()
    }

    pub fn reset(&mut self) {
        self.control = 0;
        self.num_vfs = 0;
        self.system_page_size = 1;
        self.pending = None;
        for slot in &mut self.bars {
            slot.probe = false;
        }
    }

    fn write_control(&mut self, value: u16) {
        let old = self.control;
        self.control = value & CTRL_WRITABLE;

        let was = old & PCI_SRIOV_CTRL_VFE != 0;
        let now = self.vf_enabled();
        self.pending = match (was, now) {
            (false, true) => Some(SriovControlChange::Enable {
                num_vfs: self.num_vfs,
            }),
            (true, false) => Some(SriovControlChange::Disable),
            _ => self.pending,
        };
    }

    fn read_bar_register(&self, index: usize) -> u32 {
        let slot = &self.bars[index];
        if let Some(def) = slot.def {
            return def.encode_low(slot.base, slot.probe);
        }
        if index > 0 {
            let low = &self.bars[index - 1];
            if let Some(def) = low.def.filter(|d| d.is_64bit()) {
                return def.encode_high(low.base, low.probe);
            }
        }
        0
    }

    fn write_bar_register(&mut self, index: usize, value: u32) {
        if let Some(def) = self.bars[index].def {
            let slot = &mut self.bars[index];
            if value == 0xFFFF_FFFF {
                slot.probe = true;
                return;
            }
            let high = if def.is_64bit() { slot.base >> 32 } else { 0 };
            slot.base = def.mask_base(u64::from(value) | (high << 32));
            slot.probe = false;
            return;
        }
        if index == 0 {
            return;
        }
        let low = &mut self.bars[index - 1];
        let Some(def) = low.def.filter(|d| d.is_64bit()) else {
            return;
        };
        if value == 0xFFFF_FFFF {
            low.probe = true;
            return;
        }
        low.base = def.mask_base((low.base & 0xFFFF_FFFF) | (u64::from(value) << 32));
        low.probe = false;
    }

    fn read_dword(&self, offset: u16) -> u32 {
        match offset {
            PCI_SRIOV_CTRL => u32::from(self.control),
            PCI_SRIOV_NUM_VF => u32::from(self.num_vfs),
            PCI_SRIOV_SYS_PGSIZE => self.system_page_size,
            off if (PCI_SRIOV_BAR..PCI_SRIOV_VFM).contains(&off) => {
                self.read_bar_register(usize::from((off - PCI_SRIOV_BAR) / 4))
            }
            _ => 0,
        }
    }
}

impl PciExtCapability for SriovCapability {
    fn id(&self) -> u16 {
        PCI_EXT_CAP_ID_SRIOV
    }

    fn version(&self) -> u8 {
        PCI_SRIOV_VER
    }

    fn offset(&self) -> u16 {
        self.offset
    }

    fn set_offset(&mut self, offset: u16) {
        self.offset = offset;
    }

    fn len(&self) -> u16 {
        PCI_SRIOV_SIZEOF
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = usize::from(self.offset);
        let at = |reg: u16| base + usize::from(reg);
        write_u32(config, at(PCI_SRIOV_CAP), 0);
        write_u16(config, at(PCI_SRIOV_CTRL), self.control);
        write_u16(config, at(PCI_SRIOV_STATUS), 0);
        write_u16(config, at(PCI_SRIOV_INITIAL_VF), self.params.initial_vfs);
        write_u16(config, at(PCI_SRIOV_TOTAL_VF), self.params.total_vfs);
        write_u16(config, at(PCI_SRIOV_NUM_VF), self.num_vfs);
        write_u16(config, at(PCI_SRIOV_FUNC_LINK), 0);
        write_u16(config, at(PCI_SRIOV_VF_OFFSET), self.params.first_vf_offset);
        write_u16(config, at(PCI_SRIOV_VF_STRIDE), self.params.vf_stride);
        write_u16(config, at(PCI_SRIOV_VF_DID), self.params.vf_device_id);
        write_u32(config, at(PCI_SRIOV_SUP_PGSIZE), PCI_SRIOV_SUP_PGSIZE_DEFAULT);
        write_u32(config, at(PCI_SRIOV_SYS_PGSIZE), self.system_page_size);
        for index in 0..PCI_SRIOV_NUM_BARS {
            let reg = PCI_SRIOV_BAR + (index as u16) * 4;
            write_u32(config, at(reg), self.read_bar_register(index));
        }
        write_u32(config, at(PCI_SRIOV_VFM), 0);
    }

    fn write_config(&mut self, offset: u16, size: usize, value: u32) {
        let dword = offset & !3;
        let (merged, _) = merge_dword(self.read_dword(dword), offset, size, value);
        match dword {
            PCI_SRIOV_CTRL => self.write_control(merged as u16),
            PCI_SRIOV_NUM_VF => self.set_num_vfs(merged as u16),
            PCI_SRIOV_SYS_PGSIZE => {
                let size = merged & PCI_SRIOV_SUP_PGSIZE_DEFAULT;
                if size.is_power_of_two() {
                    self.system_page_size = size;
                }
            }
            off if (PCI_SRIOV_BAR..PCI_SRIOV_VFM).contains(&off) => {
                self.write_bar_register(usize::from((off - PCI_SRIOV_BAR) / 4), merged);
            }
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
