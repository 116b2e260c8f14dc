use bitflags::bitflags;

use super::capabilities::{
    read_u16, write_u16, write_u32, ConfigBytes, PciCapability, PciCapabilityInfo,
    PciExtCapability, PciExtCapabilityInfo, PCIE_CONFIG_SPACE_SIZE, PCIE_EXT_CAP_OFFSET,
    PCI_CAP_AREA_START, PCI_CAP_PTR_OFFSET, PCI_CONFIG_SPACE_SIZE, PCI_STATUS_CAPABILITIES_LIST,
    PCI_STATUS_OFFSET,
};
use super::error::{PciError, Result};
use super::msix::MsixCapability;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct PciSubsystemIds {
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

bitflags! {
    /// Type bits in the low dword of a BAR register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PciBarFlags: u32 {
        const IO = 1 << 0;
        const MEM_TYPE_64 = 1 << 2;
        const MEM_PREFETCH = 1 << 3;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarKind {
    Io,
    Mmio32,
    Mmio64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarDefinition {
    Io { size: u32 },
    Mmio32 { size: u32, prefetchable: bool },
    Mmio64 { size: u64, prefetchable: bool },
}

impl PciBarDefinition {
    /// Builds a definition from BAR type flags, as used for SR-IOV VF BAR templates.
    pub fn from_flags(flags: PciBarFlags, size: u64) -> Option<Self> {
        let prefetchable = flags.contains(PciBarFlags::MEM_PREFETCH);
        let def = if flags.contains(PciBarFlags::IO) {
            if flags.intersects(PciBarFlags::MEM_TYPE_64 | PciBarFlags::MEM_PREFETCH) {
                return None;
            }
            Self::Io {
                size: u32::try_from(size).ok()?,
            }
        } else if flags.contains(PciBarFlags::MEM_TYPE_64) {
            Self::Mmio64 { size, prefetchable }
        } else {
            Self::Mmio32 {
                size: u32::try_from(size).ok()?,
                prefetchable,
            }
        };
        def.check().ok()?;
        Some(def)
    }

    pub fn flags(&self) -> PciBarFlags {
        match *self {
            Self::Io { .. } => PciBarFlags::IO,
            Self::Mmio32 { prefetchable, .. } => {
                if prefetchable {
                    PciBarFlags::MEM_PREFETCH
                } else {
                    PciBarFlags::empty()
                }
            }
            Self::Mmio64 { prefetchable, .. } => {
                if prefetchable {
                    PciBarFlags::MEM_TYPE_64 | PciBarFlags::MEM_PREFETCH
                } else {
                    PciBarFlags::MEM_TYPE_64
                }
            }
        }
    }

    pub fn kind(&self) -> PciBarKind {
        match self {
            Self::Io { .. } => PciBarKind::Io,
            Self::Mmio32 { .. } => PciBarKind::Mmio32,
            Self::Mmio64 { .. } => PciBarKind::Mmio64,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Io { size } => u64::from(*size),
            Self::Mmio32 { size, .. } => u64::from(*size),
            Self::Mmio64 { size, .. } => *size,
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Self::Mmio64 { .. })
    }

    /// Checks the size constraints real BAR decoders impose.
    pub fn check(&self) -> std::result::Result<(), &'static str> {
        let (size, min) = match self {
            Self::Io { size } => (u64::from(*size), 4),
            Self::Mmio32 { size, .. } => (u64::from(*size), 0x10),
            Self::Mmio64 { size, .. } => (*size, 0x10),
        };
        if !size.is_power_of_two() {
            return Err("BAR size must be a power of two");
        }
        if size < min {
            return Err("BAR size is below the minimum decode granularity");
        }
        Ok(())
    }

    /// Applies the size alignment and flag-bit masks a BAR decoder applies to a written base.
    pub fn mask_base(&self, base: u64) -> u64 {
        match *self {
            Self::Io { size } => {
                let mask = u64::from(!(size.saturating_sub(1)) & 0xFFFF_FFFC);
                base & mask
            }
            Self::Mmio32 { size, .. } => {
                let mask = u64::from(!(size.saturating_sub(1)) & 0xFFFF_FFF0);
                base & mask
            }
            Self::Mmio64 { size, .. } => base & !(size.saturating_sub(1)) & !0xF,
        }
    }

    /// Value of the low BAR register: the decoded base, or the size mask while probing.
    pub fn encode_low(&self, base: u64, probe: bool) -> u32 {
        match *self {
            Self::Io { size } => {
                let addr = if probe {
                    !(size.saturating_sub(1))
                } else {
                    base as u32
                };
                (addr & 0xFFFF_FFFC) | 0x1
            }
            Self::Mmio32 { size, prefetchable } => {
                let addr = if probe {
                    !(size.saturating_sub(1))
                } else {
                    base as u32
                };
                let mut val = addr & 0xFFFF_FFF0;
                if prefetchable {
                    val |= 1 << 3;
                }
                val
            }
            Self::Mmio64 { size, prefetchable } => {
                let addr = if probe {
                    !(size.saturating_sub(1)) as u32
                } else {
                    base as u32
                };
                // bits 2:1 = 0b10 indicate 64-bit
                let mut val = (addr & 0xFFFF_FFF0) | (0b10 << 1);
                if prefetchable {
                    val |= 1 << 3;
                }
                val
            }
        }
    }

    /// Value of the high dword register of a 64-bit BAR.
    pub fn encode_high(&self, base: u64, probe: bool) -> u32 {
        match *self {
            Self::Mmio64 { size, .. } if probe => (!(size.saturating_sub(1)) >> 32) as u32,
            Self::Mmio64 { .. } => (base >> 32) as u32,
            _ => 0,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciBarRange {
    pub kind: PciBarKind,
    pub base: u64,
    pub size: u64,
}

impl PciBarRange {
    pub fn end_exclusive(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciCommandChange {
    Unchanged,
    Changed { old: u16, new: u16 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciBarChange {
    Unchanged,
    Changed { old: PciBarRange, new: PciBarRange },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciConfigWriteEffects {
    pub command: PciCommandChange,
    pub bar: Option<(u8, PciBarChange)>,
    /// ID of the extended capability the write landed in, if any.
    pub extended: Option<u16>,
}

impl Default for PciConfigWriteEffects {
    fn default() -> Self {
        Self {
            command: PciCommandChange::Unchanged,
            bar: None,
            extended: None,
        }
    }
}

#[derive(Debug, Clone)]
struct PciBarState {
    def: Option<PciBarDefinition>,
    base: u64,
    probe: bool,
}

impl PciBarState {
    fn range(&self) -> Option<PciBarRange> {
        let def = self.def?;
        Some(PciBarRange {
            kind: def.kind(),
            base: self.base,
            size: def.size(),
        })
    }

    fn set_base(&mut self, base: u64) {
        self.base = base;
        self.probe = false;
    }
}

/// PCI Express configuration space for a type 0 (endpoint) function.
///
/// Supports:
/// - 4 KiB config space reads/writes (conventional header + capability list + extended area)
/// - the standard capability list with first-fit placement, fixed placement and removal
/// - the extended capability list rooted at 0x100
/// - BAR size probing (write 0xFFFF_FFFF then read back size mask)
pub struct PciConfigSpace {
    bytes: Box<ConfigBytes>,
    capabilities: Vec<Box<dyn PciCapability>>,
    ext_capabilities: Vec<Box<dyn PciExtCapability>>,
    bars: [PciBarState; 6],
}

impl PciConfigSpace {
    pub const INTERRUPT_LINE_OFFSET: u16 = 0x3C;
    pub const INTERRUPT_PIN_OFFSET: u16 = 0x3D;
    pub const HEADER_TYPE_OFFSET: u16 = 0x0E;

    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut bytes = Box::new([0u8; PCIE_CONFIG_SPACE_SIZE]);
        bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        bytes[0x0e] = 0x00; // header type (type 0)

        let bars = core::array::from_fn(|_| PciBarState {
            def: None,
            base: 0,
            probe: false,
        });

        Self {
            bytes,
            capabilities: Vec::new(),
            ext_capabilities: Vec::new(),
            bars,
        }
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: u16::from_le_bytes([self.bytes[0x00], self.bytes[0x01]]),
            device_id: u16::from_le_bytes([self.bytes[0x02], self.bytes[0x03]]),
        }
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            revision_id: self.bytes[0x08],
            prog_if: self.bytes[0x09],
            subclass: self.bytes[0x0a],
            class: self.bytes[0x0b],
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.bytes[0x08] = revision_id;
        self.bytes[0x09] = prog_if;
        self.bytes[0x0a] = subclass;
        self.bytes[0x0b] = class;
    }

    pub fn subsystem_ids(&self) -> PciSubsystemIds {
        PciSubsystemIds {
            subsystem_vendor_id: u16::from_le_bytes([self.bytes[0x2c], self.bytes[0x2d]]),
            subsystem_id: u16::from_le_bytes([self.bytes[0x2e], self.bytes[0x2f]]),
        }
    }

    pub fn set_subsystem_ids(&mut self, ids: PciSubsystemIds) {
        self.bytes[0x2c..0x2e].copy_from_slice(&ids.subsystem_vendor_id.to_le_bytes());
        self.bytes[0x2e..0x30].copy_from_slice(&ids.subsystem_id.to_le_bytes());
    }

    pub fn header_type(&self) -> u8 {
        self.bytes[usize::from(Self::HEADER_TYPE_OFFSET)]
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        // Read-only to the guest; device code sets it directly.
        self.bytes[usize::from(Self::HEADER_TYPE_OFFSET)] = header_type;
    }

    pub fn command(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x04], self.bytes[0x05]])
    }

    pub fn set_command(&mut self, command: u16) {
        self.bytes[0x04..0x06].copy_from_slice(&command.to_le_bytes());
    }

    pub fn status(&self) -> u16 {
        read_u16(&self.bytes, PCI_STATUS_OFFSET)
    }

    pub fn set_bar_definition(&mut self, index: u8, def: PciBarDefinition) {
        let index = usize::from(index);
        assert!(index < self.bars.len());
        if let Err(reason) = def.check() {
            panic!("BAR{index}: {reason}");
        }

        // A 64-bit BAR consumes the next BAR slot as its high dword, so BAR(N) cannot be defined
        // independently when BAR(N-1) is 64-bit.
        if index > 0
            && matches!(
                self.bars[index - 1].def,
                Some(PciBarDefinition::Mmio64 { .. })
            )
        {
            panic!("BAR{index} overlaps 64-bit BAR{} high dword", index - 1);
        }

        // Overwriting a 64-bit BAR releases its high dword slot.
        if matches!(self.bars[index].def, Some(PciBarDefinition::Mmio64 { .. }))
            && index + 1 < self.bars.len()
        {
            self.clear_bar_slot(index + 1);
        }

        if def.is_64bit() {
            assert!(index + 1 < self.bars.len(), "64-bit BAR must not be BAR5");
            assert!(
                self.bars[index + 1].def.is_none(),
                "BAR{} overlaps 64-bit BAR{index}",
                index + 1
            );
            self.clear_bar_slot(index + 1);
        }

        self.bars[index].def = Some(def);
        self.bars[index].base = 0;
        self.bars[index].probe = false;
        self.write_bar_base_to_bytes(index, 0);
    }

    /// Removes a BAR definition (and the high dword slot of a 64-bit BAR).
    pub fn clear_bar_definition(&mut self, index: u8) {
        let index = usize::from(index);
        let Some(bar) = self.bars.get(index) else {
            return;
        };
        if bar.def.is_some_and(|def| def.is_64bit()) && index + 1 < self.bars.len() {
            self.clear_bar_slot(index + 1);
        }
        self.clear_bar_slot(index);
    }

    pub fn bar_definition(&self, index: u8) -> Option<PciBarDefinition> {
        self.bars.get(usize::from(index)).and_then(|bar| bar.def)
    }

    pub fn bar_range(&self, index: u8) -> Option<PciBarRange> {
        self.bars
            .get(usize::from(index))
            .and_then(|bar| bar.range())
    }

    pub fn set_bar_base(&mut self, index: u8, base: u64) {
        let index = usize::from(index);
        let Some(bar) = self.bars.get_mut(index) else {
            return;
        };
        let base = bar.def.map_or(base, |def| def.mask_base(base));
        bar.set_base(base);
        self.write_bar_base_to_bytes(index, base);
    }

    /// Installs a standard capability at the first free, dword-aligned offset at or above 0x40.
    pub fn add_capability(&mut self, capability: Box<dyn PciCapability>) -> Result<u8> {
        let Some(offset) = self.allocate_capability_offset(capability.len()) else {
            return Err(PciError::ConfigSpaceExhausted {
                id: u16::from(capability.id()),
                len: usize::from(capability.len()),
            });
        };
        self.install_capability(offset, capability);
        Ok(offset)
    }

    /// Installs a standard capability at a fixed offset.
    pub fn add_capability_at(
        &mut self,
        offset: u8,
        capability: Box<dyn PciCapability>,
    ) -> Result<u8> {
        let id = u16::from(capability.id());
        let start = usize::from(offset);
        let len = usize::from(capability.len());
        if start + len > PCI_CONFIG_SPACE_SIZE {
            return Err(PciError::ConfigSpaceExhausted { id, len });
        }
        if start < PCI_CAP_AREA_START
            || start % 4 != 0
            || self.capabilities.iter().any(|cap| {
                ranges_overlap(start, len, usize::from(cap.offset()), usize::from(cap.len()))
            })
        {
            return Err(PciError::CapabilityOverlap {
                id,
                offset: u16::from(offset),
            });
        }
        self.install_capability(offset, capability);
        Ok(offset)
    }

    /// Unlinks the standard capability at `offset` and clears its bytes.
    pub fn remove_capability(&mut self, offset: u8) -> Option<Box<dyn PciCapability>> {
        let index = self
            .capabilities
            .iter()
            .position(|cap| cap.offset() == offset)?;
        let cap = self.capabilities.remove(index);
        let base = usize::from(offset);
        self.bytes[base..base + usize::from(cap.len())].fill(0);
        self.sync_capabilities_list_to_config();
        Some(cap)
    }

    /// Installs an extended capability at a fixed offset in the 0x100..0x1000 area.
    pub fn add_ext_capability(
        &mut self,
        offset: u16,
        mut capability: Box<dyn PciExtCapability>,
    ) -> Result<u16> {
        let id = capability.id();
        let start = usize::from(offset);
        let len = usize::from(capability.len());
        if len < 4 {
            return Err(PciError::capability_init(
                "extended",
                format!("{id:#06x} is shorter than its header"),
            ));
        }
        if start + len > PCIE_CONFIG_SPACE_SIZE {
            return Err(PciError::ConfigSpaceExhausted { id, len });
        }
        if start < PCIE_EXT_CAP_OFFSET
            || start % 4 != 0
            || self.ext_capabilities.iter().any(|cap| {
                ranges_overlap(start, len, usize::from(cap.offset()), usize::from(cap.len()))
            })
        {
            return Err(PciError::CapabilityOverlap { id, offset });
        }

        capability.set_offset(offset);
        self.bytes[start..start + len].fill(0);
        capability.sync_to_config(&mut self.bytes);
        self.ext_capabilities.push(capability);
        self.sync_ext_capabilities_list_to_config();
        Ok(offset)
    }

    /// Unlinks the extended capability with the given ID and clears its bytes.
    pub fn remove_ext_capability(&mut self, id: u16) -> Option<Box<dyn PciExtCapability>> {
        let index = self.ext_capabilities.iter().position(|cap| cap.id() == id)?;
        let cap = self.ext_capabilities.remove(index);
        let base = usize::from(cap.offset());
        self.bytes[base..base + usize::from(cap.len())].fill(0);
        self.sync_ext_capabilities_list_to_config();
        Some(cap)
    }

    pub fn read(&mut self, offset: u16, size: usize) -> u32 {
        assert!(matches!(size, 1 | 2 | 4));
        self.sync_capabilities_to_config();

        let offset = offset as usize;
        assert!(offset + size <= PCIE_CONFIG_SPACE_SIZE);

        if (0x10..=0x27).contains(&offset) {
            let aligned = offset & !0x3;
            let bar_index = (aligned - 0x10) / 4;
            let value = self.read_bar_register(bar_index);
            let shifted = value >> ((offset - aligned) * 8);
            let mask = match size {
                1 => 0xFF,
                2 => 0xFFFF,
                4 => 0xFFFF_FFFF,
                _ => unreachable!(),
            };
            return shifted & mask;
        }

        let mut value = 0u32;
        for i in 0..size {
            value |= (self.bytes[offset + i] as u32) << (8 * i);
        }
        value
    }

    /// Brings the raw byte image up to date with capability-held state (e.g. PBA-driven bits).
    pub fn sync_capabilities(&mut self) {
        self.sync_capabilities_to_config();
    }

    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        let _ = self.write_with_effects(offset, size, value);
    }

    pub fn write_with_effects(
        &mut self,
        offset: u16,
        size: usize,
        value: u32,
    ) -> PciConfigWriteEffects {
        assert!(matches!(size, 1 | 2 | 4));
        let offset = offset as usize;
        assert!(offset + size <= PCIE_CONFIG_SPACE_SIZE);

        let mut effects = PciConfigWriteEffects::default();

        if offset >= PCIE_EXT_CAP_OFFSET {
            effects.extended = self.write_extended(offset, size, value);
            return effects;
        }

        // Capabilities may hold state the byte image has not seen yet; sync before merging the
        // write so `sync_capabilities_from_config` below does not clobber it.
        self.sync_capabilities_to_config();

        if (0x10..=0x27).contains(&offset) {
            // BAR registers only take aligned dword writes; anything narrower is dropped.
            if offset % 4 != 0 || size != 4 {
                return effects;
            }
            let bar_index = (offset - 0x10) / 4;
            let (logical_bar, change) = self.write_bar_register(bar_index, value);
            effects.bar = Some((logical_bar as u8, change));
            return effects;
        }

        let command_overlaps = offset < 0x06 && offset + size > 0x04;
        let old_command = if command_overlaps { self.command() } else { 0 };

        for i in 0..size {
            let addr = offset + i;
            if self.is_read_only_byte(addr) {
                continue;
            }
            self.bytes[addr] = ((value >> (8 * i)) & 0xff) as u8;
        }

        if command_overlaps {
            let new_command = self.command();
            if old_command != new_command {
                effects.command = PciCommandChange::Changed {
                    old: old_command,
                    new: new_command,
                };
            }
        }

        self.sync_capabilities_from_config();
        self.sync_capabilities_to_config();

        effects
    }

    pub fn interrupt_line(&mut self) -> u8 {
        self.read(Self::INTERRUPT_LINE_OFFSET, 1) as u8
    }

    pub fn set_interrupt_line(&mut self, line: u8) {
        self.write(Self::INTERRUPT_LINE_OFFSET, 1, u32::from(line));
    }

    pub fn interrupt_pin(&mut self) -> u8 {
        self.read(Self::INTERRUPT_PIN_OFFSET, 1) as u8
    }

    pub fn set_interrupt_pin(&mut self, pin: u8) {
        // Read-only to the guest; device code sets it directly.
        self.bytes[usize::from(Self::INTERRUPT_PIN_OFFSET)] = pin;
    }

    pub fn capability_list(&mut self) -> Vec<PciCapabilityInfo> {
        self.sync_capabilities_to_config();

        let mut caps = Vec::new();
        let mut offset = self.bytes[PCI_CAP_PTR_OFFSET];
        let mut seen = [false; PCI_CONFIG_SPACE_SIZE];

        while offset != 0 {
            let off = offset as usize;
            if off + 1 >= PCI_CONFIG_SPACE_SIZE {
                break;
            }
            if seen[off] {
                break;
            }
            seen[off] = true;

            let id = self.bytes[off];
            caps.push(PciCapabilityInfo { id, offset });

            offset = self.bytes[off + 1];
        }

        caps
    }

    pub fn find_capability(&mut self, id: u8) -> Option<u8> {
        self.capability_list()
            .into_iter()
            .find(|cap| cap.id == id)
            .map(|cap| cap.offset)
    }

    /// Walks the extended capability list from 0x100, skipping null (ID 0) headers.
    pub fn ext_capability_list(&self) -> Vec<PciExtCapabilityInfo> {
        let mut caps = Vec::new();
        let mut offset = PCIE_EXT_CAP_OFFSET;
        let mut seen = vec![false; PCIE_CONFIG_SPACE_SIZE / 4];

        loop {
            if offset < PCIE_EXT_CAP_OFFSET || offset + 4 > PCIE_CONFIG_SPACE_SIZE {
                break;
            }
            if std::mem::replace(&mut seen[offset / 4], true) {
                break;
            }

            let header = self.read_u32_from_bytes(offset);
            if header == 0 {
                break;
            }
            let id = (header & 0xFFFF) as u16;
            if id != 0 {
                caps.push(PciExtCapabilityInfo {
                    id,
                    version: ((header >> 16) & 0xF) as u8,
                    offset: offset as u16,
                });
            }

            let next = ((header >> 20) & 0xFFC) as usize;
            if next == 0 {
                break;
            }
            offset = next;
        }

        caps
    }

    pub fn find_ext_capability(&self, id: u16) -> Option<u16> {
        self.ext_capability_list()
            .into_iter()
            .find(|cap| cap.id == id)
            .map(|cap| cap.offset)
    }

    /// Disables MSI-X delivery and drops latched PBA bits, as a function reset does.
    pub fn disable_msix(&mut self) {
        if let Some(msix) = self.capability_mut::<MsixCapability>() {
            msix.set_control(false, false);
            msix.clear_pba_pending_bits();
        }
        self.sync_capabilities_to_config();
    }

    pub fn capability<T: 'static>(&self) -> Option<&T> {
        self.capabilities
            .iter()
            .find_map(|cap| cap.as_any().downcast_ref::<T>())
    }

    pub fn capability_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.capabilities
            .iter_mut()
            .find_map(|cap| cap.as_any_mut().downcast_mut::<T>())
    }

    pub fn ext_capability<T: 'static>(&self) -> Option<&T> {
        self.ext_capabilities
            .iter()
            .find_map(|cap| cap.as_any().downcast_ref::<T>())
    }

    pub fn ext_capability_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.ext_capabilities
            .iter_mut()
            .find_map(|cap| cap.as_any_mut().downcast_mut::<T>())
    }

    fn install_capability(&mut self, offset: u8, mut capability: Box<dyn PciCapability>) {
        capability.set_offset(offset);
        let base = usize::from(offset);
        self.bytes[base..base + usize::from(capability.len())].fill(0);
        capability.sync_to_config(&mut self.bytes);
        self.capabilities.push(capability);
        self.sync_capabilities_list_to_config();
    }

    fn allocate_capability_offset(&self, len: u8) -> Option<u8> {
        let len = usize::from(len);
        let mut offset = PCI_CAP_AREA_START;
        while offset + len <= PCI_CONFIG_SPACE_SIZE {
            let blocker = self.capabilities.iter().find(|cap| {
                ranges_overlap(offset, len, usize::from(cap.offset()), usize::from(cap.len()))
            });
            match blocker {
                None => return u8::try_from(offset).ok(),
                Some(cap) => {
                    offset = (usize::from(cap.offset()) + usize::from(cap.len()) + 3) & !3;
                }
            }
        }
        None
    }

    fn write_extended(&mut self, offset: usize, size: usize, value: u32) -> Option<u16> {
        let cap = self.ext_capabilities.iter_mut().find(|cap| {
            let base = usize::from(cap.offset());
            (base..base + usize::from(cap.len())).contains(&offset)
        })?;

        // The header dword (ID, version, next) is read-only.
        let rel = (offset - usize::from(cap.offset())) as u16;
        if rel >= 4 {
            cap.write_config(rel, size, value);
            cap.sync_to_config(&mut self.bytes);
        }
        Some(cap.id())
    }

    fn set_status_bit(&mut self, bit: u16) {
        let new = self.status() | bit;
        write_u16(&mut self.bytes, PCI_STATUS_OFFSET, new);
    }

    fn clear_status_bit(&mut self, bit: u16) {
        let new = self.status() & !bit;
        write_u16(&mut self.bytes, PCI_STATUS_OFFSET, new);
    }

    fn sync_capabilities_to_config(&mut self) {
        for cap in &self.capabilities {
            cap.sync_to_config(&mut self.bytes);
        }
        for cap in &self.ext_capabilities {
            cap.sync_to_config(&mut self.bytes);
        }
    }

    fn sync_capabilities_from_config(&mut self) {
        for cap in &mut self.capabilities {
            cap.sync_from_config(&mut self.bytes);
        }
    }

    /// Rebuilds the standard capability list pointers in installation order.
    fn sync_capabilities_list_to_config(&mut self) {
        if self.capabilities.is_empty() {
            self.bytes[PCI_CAP_PTR_OFFSET] = 0;
            self.clear_status_bit(PCI_STATUS_CAPABILITIES_LIST);
            return;
        }

        self.bytes[PCI_CAP_PTR_OFFSET] = self.capabilities[0].offset();
        self.set_status_bit(PCI_STATUS_CAPABILITIES_LIST);

        for (index, cap) in self.capabilities.iter().enumerate() {
            let base = cap.offset() as usize;
            self.bytes[base] = cap.id();
            self.bytes[base + 1] = self
                .capabilities
                .get(index + 1)
                .map_or(0, |next| next.offset());
        }
    }

    /// Rebuilds the extended capability headers.
    ///
    /// The list must start at 0x100. The capability placed there (if any) leads; the rest follow
    /// in installation order. If nothing lives at 0x100, a null header there points at the first
    /// capability.
    fn sync_ext_capabilities_list_to_config(&mut self) {
        let head = PCIE_EXT_CAP_OFFSET as u16;
        let mut order: Vec<usize> = (0..self.ext_capabilities.len()).collect();
        if let Some(pos) = self
            .ext_capabilities
            .iter()
            .position(|cap| cap.offset() == head)
        {
            order.remove(pos);
            order.insert(0, pos);
        }

        match order.first() {
            None => {
                write_u32(&mut self.bytes, PCIE_EXT_CAP_OFFSET, 0);
                return;
            }
            Some(&first) if self.ext_capabilities[first].offset() != head => {
                let next = u32::from(self.ext_capabilities[first].offset());
                write_u32(&mut self.bytes, PCIE_EXT_CAP_OFFSET, next << 20);
            }
            Some(_) => {}
        }

        for (pos, &index) in order.iter().enumerate() {
            let cap = &self.ext_capabilities[index];
            let next = order
                .get(pos + 1)
                .map_or(0, |&n| u32::from(self.ext_capabilities[n].offset()));
            let header =
                u32::from(cap.id()) | (u32::from(cap.version() & 0xF) << 16) | (next << 20);
            write_u32(&mut self.bytes, usize::from(cap.offset()), header);
        }
    }

    fn is_read_only_byte(&self, addr: usize) -> bool {
        if addr < 0x04 {
            return true;
        }
        // Revision ID / Class Code bytes (0x08..=0x0B) are read-only.
        if (0x08..=0x0B).contains(&addr) {
            return true;
        }
        if addr == usize::from(Self::HEADER_TYPE_OFFSET) {
            return true;
        }
        // Status is device-managed; 32-bit writes to Command carry zeros in the upper half.
        if (PCI_STATUS_OFFSET..PCI_STATUS_OFFSET + 2).contains(&addr) {
            return true;
        }
        // Same for Interrupt Pin next to Interrupt Line.
        if addr == usize::from(Self::INTERRUPT_PIN_OFFSET) {
            return true;
        }
        // Subsystem IDs (0x2C..=0x2F) are read-only.
        if (0x2C..0x30).contains(&addr) {
            return true;
        }
        if addr == PCI_CAP_PTR_OFFSET {
            return true;
        }

        for cap in &self.capabilities {
            let base = cap.offset() as usize;
            let end = base + cap.len() as usize;
            if !(base..end).contains(&addr) {
                continue;
            }
            if addr == base || addr == base + 1 || !cap.guest_writable() {
                return true;
            }
        }

        false
    }

    fn clear_bar_slot(&mut self, index: usize) {
        let off = 0x10 + index * 4;
        self.bytes[off..off + 4].fill(0);
        self.bars[index].def = None;
        self.bars[index].base = 0;
        self.bars[index].probe = false;
    }

    fn read_bar_register(&self, bar_index: usize) -> u32 {
        if bar_index >= self.bars.len() {
            return 0;
        }

        // High dword of a 64-bit BAR: consult the previous BAR's definition/state.
        if self.bars[bar_index].def.is_none() && bar_index > 0 {
            let low = &self.bars[bar_index - 1];
            if let Some(def @ PciBarDefinition::Mmio64 { .. }) = low.def {
                return def.encode_high(low.base, low.probe);
            }
        }

        let bar = &self.bars[bar_index];
        match bar.def {
            Some(def) => def.encode_low(bar.base, bar.probe),
            None => self.read_u32_from_bytes(0x10 + bar_index * 4),
        }
    }

    fn write_bar_base_to_bytes(&mut self, bar_index: usize, base: u64) {
        let offset = 0x10 + bar_index * 4;
        self.bytes[offset..offset + 4].copy_from_slice(&(base as u32).to_le_bytes());

        if self
            .bars
            .get(bar_index)
            .and_then(|bar| bar.def)
            .is_some_and(|def| def.is_64bit())
            && bar_index + 1 < self.bars.len()
        {
            let hi_off = 0x10 + (bar_index + 1) * 4;
            self.bytes[hi_off..hi_off + 4].copy_from_slice(&((base >> 32) as u32).to_le_bytes());
        }
    }

    fn write_bar_register(&mut self, bar_index: usize, value: u32) -> (usize, PciBarChange) {
        if bar_index >= self.bars.len() {
            return (bar_index, PciBarChange::Unchanged);
        }

        // High dword of a 64-bit BAR.
        if self.bars[bar_index].def.is_none()
            && bar_index > 0
            && self.bars[bar_index - 1]
                .def
                .is_some_and(|def| def.is_64bit())
        {
            return self.write_bar64_high(bar_index - 1, value);
        }

        let Some(def) = self.bars[bar_index].def else {
            // Unimplemented BARs are hardwired to zero.
            return (bar_index, PciBarChange::Unchanged);
        };

        if value == 0xFFFF_FFFF {
            self.bars[bar_index].probe = true;
            return (bar_index, PciBarChange::Unchanged);
        }

        let old_range = PciBarRange {
            kind: def.kind(),
            base: self.bars[bar_index].base,
            size: def.size(),
        };

        let new_base = {
            let base = match def {
                PciBarDefinition::Io { .. } => u64::from(value & 0xFFFF_FFFC),
                PciBarDefinition::Mmio32 { .. } => u64::from(value & 0xFFFF_FFF0),
                PciBarDefinition::Mmio64 { .. } => {
                    let low_base = u64::from(value & 0xFFFF_FFF0);
                    let high = self.bars[bar_index].base >> 32;
                    low_base | (high << 32)
                }
            };
            def.mask_base(base)
        };

        self.bars[bar_index].set_base(new_base);
        self.write_bar_base_to_bytes(bar_index, new_base);

        let new_range = PciBarRange {
            kind: def.kind(),
            base: new_base,
            size: def.size(),
        };
        if old_range == new_range {
            (bar_index, PciBarChange::Unchanged)
        } else {
            (
                bar_index,
                PciBarChange::Changed {
                    old: old_range,
                    new: new_range,
                },
            )
        }
    }

    fn write_bar64_high(&mut self, low_index: usize, value: u32) -> (usize, PciBarChange) {
        let Some(def @ PciBarDefinition::Mmio64 { size, .. }) = self.bars[low_index].def else {
            return (low_index, PciBarChange::Unchanged);
        };

        if value == 0xFFFF_FFFF {
            self.bars[low_index].probe = true;
            return (low_index, PciBarChange::Unchanged);
        }

        let old_range = PciBarRange {
            kind: PciBarKind::Mmio64,
            base: self.bars[low_index].base,
            size,
        };

        let low_part = self.bars[low_index].base & 0xFFFF_FFF0;
        let new_base = def.mask_base(low_part | (u64::from(value) << 32));

        self.bars[low_index].set_base(new_base);
        self.write_bar_base_to_bytes(low_index, new_base);

        let new_range = PciBarRange {
            kind: PciBarKind::Mmio64,
            base: new_base,
            size,
        };
        if old_range == new_range {
            (low_index, PciBarChange::Unchanged)
        } else {
            (
                low_index,
                PciBarChange::Changed {
                    old: old_range,
                    new: new_range,
                },
            )
        }
    }

    fn read_u32_from_bytes(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }
}

fn ranges_overlap(a: usize, a_len: usize, b: usize, b_len: usize) -> bool {
    a < b + b_len && b < a + a_len
}

/// A PCI function as seen from configuration cycles.
pub trait PciDevice {
    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        self.config_mut().read(offset, size)
    }

    /// Default configuration write path. Functions that intercept writes (FLR, SR-IOV control)
    /// override this and call back into the config space themselves.
    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        self.config_mut().write(offset, size, value);
    }

    fn reset(&mut self) {
        // BARs remain programmed; command decode and MSI-X delivery start from a clean baseline.
        let cfg = self.config_mut();
        cfg.set_command(0);
        cfg.disable_msix();
    }
}
