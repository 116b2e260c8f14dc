use std::any::Any;

use super::capabilities::{read_u16, write_u16, write_u32, ConfigBytes, PciCapability};
use super::error::{PciError, Result};

/// PCI capability ID for MSI-X.
pub const PCI_CAP_ID_MSIX: u8 = 0x11;
/// Largest table the 11-bit table size field can describe.
pub const MSIX_MAX_VECTORS: u16 = 2048;

const MSIX_CAP_LEN: u8 = 0x0c;
const MSIX_TABLE_ENTRY_SIZE: usize = 16;
const MSIX_ENTRY_CTRL_MASKBIT: u32 = 1;
const MSIX_FLAGS_ENABLE: u16 = 1 << 15;
const MSIX_FLAGS_MASKALL: u16 = 1 << 14;

/// An MSI message as programmed into an MSI-X table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsiMessage {
    pub address: u64,
    pub data: u16,
}

#[derive(Debug, Clone)]
pub struct MsixCapability {
    offset: u8,

    table_size: u16,
    enabled: bool,
    function_mask: bool,

    table_bir: u8,
    table_offset: u32,
    pba_bir: u8,
    pba_offset: u32,

    /// Raw MSI-X table bytes, little-endian, length = `table_size * 16`.
    table: Vec<u8>,
    /// Pending bit array words (bit per vector).
    pba: Vec<u64>,
    /// Vectors the device has claimed for delivery (bit per vector).
    used: Vec<u64>,
}

impl MsixCapability {
    /// Lays out a table and PBA inside BARs of `bar_size` bytes.
    ///
    /// Fails when the vector count is out of range, when either structure is misaligned or does
    /// not fit its BAR, or when the two overlap inside a shared BAR.
    pub fn new(
        table_size: u16,
        table_bir: u8,
        table_offset: u32,
        pba_bir: u8,
        pba_offset: u32,
        bar_size: u64,
    ) -> Result<Self> {
        if table_size == 0 || table_size > MSIX_MAX_VECTORS {
            return Err(PciError::InterruptVectorInit(format!(
                "{table_size} vectors is outside 1..={MSIX_MAX_VECTORS}"
            )));
        }
        if table_bir > 5 || pba_bir > 5 {
            return Err(PciError::InterruptVectorInit(
                "MSI-X structures must live in BAR0..=BAR5".to_string(),
            ));
        }
        if (table_offset & 0x7) != 0 || (pba_offset & 0x7) != 0 {
            return Err(PciError::InterruptVectorInit(
                "MSI-X table and PBA offsets must be 8-byte aligned".to_string(),
            ));
        }

        let table_bytes = usize::from(table_size) * MSIX_TABLE_ENTRY_SIZE;
        let pba_words = usize::from(table_size).div_ceil(64);
        let table_end = u64::from(table_offset) + table_bytes as u64;
        let pba_end = u64::from(pba_offset) + (pba_words * 8) as u64;
        if table_end > bar_size || pba_end > bar_size {
            return Err(PciError::InterruptVectorInit(format!(
                "MSI-X table (end {table_end:#x}) or PBA (end {pba_end:#x}) \
                 exceeds the {bar_size:#x}-byte BAR"
            )));
        }
        if table_bir == pba_bir
            && u64::from(table_offset) < pba_end
            && u64::from(pba_offset) < table_end
        {
            return Err(PciError::InterruptVectorInit(
                "MSI-X table overlaps the PBA".to_string(),
            ));
        }

        let mut cap = Self {
            offset: 0,
            table_size,
            enabled: false,
            function_mask: false,
            table_bir,
            table_offset,
            pba_bir,
            pba_offset,
            table: vec![0u8; table_bytes],
            pba: vec![0u64; pba_words],
            used: vec![0u64; pba_words],
        };
        cap.mask_all_entries();
        Ok(cap)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn function_masked(&self) -> bool {
        self.function_mask
    }

    /// Sets Message Control bits directly (device/platform side).
    pub fn set_control(&mut self, enabled: bool, function_mask: bool) {
        self.enabled = enabled;
        self.function_mask = function_mask;
    }

    pub fn table_size(&self) -> u16 {
        self.table_size
    }

    pub fn table_bir(&self) -> u8 {
        self.table_bir
    }

    pub fn table_offset(&self) -> u32 {
        self.table_offset
    }

    pub fn table_len_bytes(&self) -> usize {
        self.table.len()
    }

    pub fn pba_bir(&self) -> u8 {
        self.pba_bir
    }

    pub fn pba_offset(&self) -> u32 {
        self.pba_offset
    }

    pub fn pba_len_bytes(&self) -> usize {
        self.pba.len() * 8
    }

    pub fn table_read(&self, offset: u64, data: &mut [u8]) {
        let start = offset as usize;
        for (i, out) in data.iter_mut().enumerate() {
            *out = self.table.get(start + i).copied().unwrap_or(0);
        }
    }

    pub fn table_write(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        for (i, b) in data.iter().enumerate() {
            if let Some(slot) = self.table.get_mut(start + i) {
                *slot = *b;
            }
        }
    }

    pub fn pba_read(&self, offset: u64, data: &mut [u8]) {
        let start = offset as usize;
        let len_bytes = self.pba_len_bytes();
        for (i, out) in data.iter_mut().enumerate() {
            let idx = start + i;
            if idx >= len_bytes {
                *out = 0;
                continue;
            }
            let word = idx / 8;
            let byte = idx % 8;
            *out = ((self.pba[word] >> (byte * 8)) & 0xff) as u8;
        }
    }

    /// Reads from a BAR that holds this capability's table and/or PBA.
    ///
    /// `bar` selects which structures are visible; bytes outside both read as zero.
    pub fn bar_read(&self, bar: u8, offset: u64, size: usize) -> u64 {
        let mut buf = [0u8; 8];
        let data = &mut buf[..size.min(8)];
        if let Some(rel) = self.table_relative(bar, offset, data.len()) {
            self.table_read(rel, data);
        } else if let Some(rel) = self.pba_relative(bar, offset, data.len()) {
            self.pba_read(rel, data);
        }
        u64::from_le_bytes(buf)
    }

    /// Writes to a BAR that holds this capability's table and/or PBA. PBA writes are ignored.
    pub fn bar_write(&mut self, bar: u8, offset: u64, size: usize, value: u64) {
        let bytes = value.to_le_bytes();
        let data = &bytes[..size.min(8)];
        if let Some(rel) = self.table_relative(bar, offset, data.len()) {
            self.table_write(rel, data);
        }
    }

    fn table_relative(&self, bar: u8, offset: u64, len: usize) -> Option<u64> {
        let rel = offset.checked_sub(u64::from(self.table_offset))?;
        let fits = rel
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.table.len() as u64);
        (bar == self.table_bir && fits).then_some(rel)
    }

    fn pba_relative(&self, bar: u8, offset: u64, len: usize) -> Option<u64> {
        let rel = offset.checked_sub(u64::from(self.pba_offset))?;
        let fits = rel
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.pba_len_bytes() as u64);
        (bar == self.pba_bir && fits).then_some(rel)
    }

    fn message_control(&self) -> u16 {
        let mut ctrl = (self.table_size - 1) & 0x07ff;
        if self.function_mask {
            ctrl |= MSIX_FLAGS_MASKALL;
        }
        if self.enabled {
            ctrl |= MSIX_FLAGS_ENABLE;
        }
        ctrl
    }

    fn table_offset_bir(&self) -> u32 {
        (self.table_offset & !0x7) | u32::from(self.table_bir & 0x7)
    }

    fn pba_offset_bir(&self) -> u32 {
        (self.pba_offset & !0x7) | u32::from(self.pba_bir & 0x7)
    }

    fn bit_word_and_mask(vector: u16) -> (usize, u64) {
        let vector = usize::from(vector);
        (vector / 64, 1u64 << (vector % 64))
    }

    fn set_pending(&mut self, vector: u16, pending: bool) {
        let (word, mask) = Self::bit_word_and_mask(vector);
        let Some(slot) = self.pba.get_mut(word) else {
            return;
        };
        if pending {
            *slot |= mask;
        } else {
            *slot &= !mask;
        }
    }

    pub fn is_pending(&self, vector: u16) -> bool {
        let (word, mask) = Self::bit_word_and_mask(vector);
        self.pba.get(word).is_some_and(|bits| bits & mask != 0)
    }

    pub fn clear_pba_pending_bits(&mut self) {
        self.pba.fill(0);
    }

    fn entry_base(&self, vector: u16) -> Option<usize> {
        if vector >= self.table_size {
            return None;
        }
        Some(usize::from(vector) * MSIX_TABLE_ENTRY_SIZE)
    }

    fn entry_dword(&self, base: usize, field: usize) -> u32 {
        let off = base + field;
        u32::from_le_bytes([
            self.table[off],
            self.table[off + 1],
            self.table[off + 2],
            self.table[off + 3],
        ])
    }

    pub fn entry_masked(&self, vector: u16) -> bool {
        self.entry_base(vector)
            .map_or(true, |base| self.entry_dword(base, 12) & MSIX_ENTRY_CTRL_MASKBIT != 0)
    }

    fn entry_message(&self, vector: u16) -> Option<MsiMessage> {
        let base = self.entry_base(vector)?;
        let addr_low = u64::from(self.entry_dword(base, 0));
        let addr_high = u64::from(self.entry_dword(base, 4));
        Some(MsiMessage {
            address: addr_low | (addr_high << 32),
            data: self.entry_dword(base, 8) as u16,
        })
    }

    fn mask_all_entries(&mut self) {
        for vector in 0..self.table_size {
            let ctrl = usize::from(vector) * MSIX_TABLE_ENTRY_SIZE + 12;
            self.table[ctrl..ctrl + 4].copy_from_slice(&MSIX_ENTRY_CTRL_MASKBIT.to_le_bytes());
        }
    }

    /// Returns the MSI message that should be delivered for the given table entry index.
    ///
    /// - When MSI-X is disabled or the vector is out of range nothing happens.
    /// - When the function or the vector is masked, this returns `None` and latches the pending
    ///   bit for the vector.
    /// - When delivery is successful, the pending bit is cleared.
    pub fn trigger(&mut self, vector: u16) -> Option<MsiMessage> {
        if !self.enabled || vector >= self.table_size {
            return None;
        }
        if self.function_mask || self.entry_masked(vector) {
            self.set_pending(vector, true);
            return None;
        }
        let msg = self.entry_message(vector)?;
        if msg.address == 0 {
            self.set_pending(vector, true);
            return None;
        }

        self.set_pending(vector, false);
        Some(msg)
    }

    /// Delivers vectors whose pending bit is set but which are no longer masked.
    ///
    /// Call after the guest touches Message Control or the table.
    pub fn drain_unmasked_pending(&mut self) -> Vec<(u16, MsiMessage)> {
        if !self.enabled || self.function_mask {
            return Vec::new();
        }
        let pending: Vec<u16> = (0..self.table_size)
            .filter(|&vector| self.is_pending(vector) && !self.entry_masked(vector))
            .collect();
        pending
            .into_iter()
            .filter_map(|vector| self.trigger(vector).map(|msg| (vector, msg)))
            .collect()
    }

    /// Marks `vector` as in use by the device. Returns false for out-of-range vectors.
    pub fn vector_use(&mut self, vector: u16) -> bool {
        if vector >= self.table_size {
            return false;
        }
        let (word, mask) = Self::bit_word_and_mask(vector);
        self.used[word] |= mask;
        true
    }

    pub fn vector_unuse(&mut self, vector: u16) {
        if vector >= self.table_size {
            return;
        }
        let (word, mask) = Self::bit_word_and_mask(vector);
        self.used[word] &= !mask;
        self.set_pending(vector, false);
    }

    pub fn unuse_all_vectors(&mut self) {
        self.used.fill(0);
        self.pba.fill(0);
    }

    pub fn is_vector_used(&self, vector: u16) -> bool {
        let (word, mask) = Self::bit_word_and_mask(vector);
        self.used.get(word).is_some_and(|bits| bits & mask != 0)
    }

    pub fn used_vector_count(&self) -> usize {
        self.used.iter().map(|bits| bits.count_ones() as usize).sum()
    }

    /// Function-reset state: delivery disabled, every entry masked, no pending bits.
    ///
    /// Vector use is a device-side reservation and survives reset.
    pub fn reset(&mut self) {
        self.enabled = false;
        self.function_mask = false;
        self.table.fill(0);
        self.mask_all_entries();
        self.pba.fill(0);
    }
}

impl PciCapability for MsixCapability {
    fn id(&self) -> u8 {
        PCI_CAP_ID_MSIX
    }

    fn offset(&self) -> u8 {
        self.offset
    }

    fn set_offset(&mut self, offset: u8) {
        self.offset = offset;
    }

    fn len(&self) -> u8 {
        MSIX_CAP_LEN
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = self.offset as usize;
        write_u16(config, base + 0x02, self.message_control());
        write_u32(config, base + 0x04, self.table_offset_bir());
        write_u32(config, base + 0x08, self.pba_offset_bir());
    }

    fn sync_from_config(&mut self, config: &mut ConfigBytes) {
        let base = self.offset as usize;
        let ctrl = read_u16(config, base + 0x02);
        self.enabled = (ctrl & MSIX_FLAGS_ENABLE) != 0;
        self.function_mask = (ctrl & MSIX_FLAGS_MASKALL) != 0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{MsiMessage, MsixCapability, PCI_CAP_ID_MSIX};
    use crate::pci::config::PciConfigSpace;
    use crate::pci::error::PciError;

    fn enable(config: &mut PciConfigSpace) -> u16 {
        let cap_offset = config.find_capability(PCI_CAP_ID_MSIX).unwrap() as u16;
        let ctrl = config.read(cap_offset + 0x02, 2) as u16;
        config.write(cap_offset + 0x02, 2, (ctrl | (1 << 15)) as u32);
        cap_offset
    }

    fn program_entry(msix: &mut MsixCapability, vector: u16, data: u32, masked: bool) {
        let base = u64::from(vector) * 16;
        msix.table_write(base, &0xfee0_0000u32.to_le_bytes());
        msix.table_write(base + 0x4, &0u32.to_le_bytes());
        msix.table_write(base + 0x8, &data.to_le_bytes());
        msix.table_write(base + 0xc, &u32::from(masked).to_le_bytes());
    }

    #[test]
    fn programming_msix_updates_device_state() {
        let mut config = PciConfigSpace::new(0x1234, 0x5678);
        config
            .add_capability(Box::new(MsixCapability::new(2, 1, 0, 1, 0x800, 0x1000).unwrap()))
            .unwrap();
        let cap_offset = enable(&mut config);

        let ctrl = config.read(cap_offset + 0x02, 2) as u16;
        // Table size is N-1 in bits 0..=10.
        assert_eq!(ctrl & 0x07ff, 1);
        assert_eq!(config.read(cap_offset + 0x04, 4), 0x0000_0001);
        assert_eq!(config.read(cap_offset + 0x08, 4), 0x0000_0801);

        let msix = config.capability::<MsixCapability>().unwrap();
        assert!(msix.enabled());
    }

    #[test]
    fn layout_errors_are_reported_as_vector_init_failures() {
        assert!(matches!(
            MsixCapability::new(0, 1, 0, 1, 0x800, 0x1000),
            Err(PciError::InterruptVectorInit(_))
        ));
        // 600 entries need 0x2580 bytes, which runs into a PBA at 0x2000.
        assert!(matches!(
            MsixCapability::new(600, 1, 0, 1, 0x2000, 0x4000),
            Err(PciError::InterruptVectorInit(_))
        ));
        assert!(matches!(
            MsixCapability::new(4, 1, 0, 1, 0x0ffc, 0x1000),
            Err(PciError::InterruptVectorInit(_))
        ));
        assert!(MsixCapability::new(512, 1, 0, 1, 0x2000, 0x4000).is_ok());
    }

    #[test]
    fn entries_start_masked() {
        let msix = MsixCapability::new(4, 1, 0, 1, 0x800, 0x1000).unwrap();
        assert!((0..4).all(|vector| msix.entry_masked(vector)));
    }

    #[test]
    fn masked_vector_sets_pending_bit_and_fires_once_unmasked() {
        let mut config = PciConfigSpace::new(0x1234, 0x5678);
        config
            .add_capability(Box::new(MsixCapability::new(2, 1, 0, 1, 0x800, 0x1000).unwrap()))
            .unwrap();
        enable(&mut config);

        let msix = config.capability_mut::<MsixCapability>().unwrap();
        program_entry(msix, 1, 0x45, true);
        assert_eq!(msix.trigger(1), None);
        assert_eq!(msix.bar_read(1, 0x800, 4) & 0b10, 0b10);

        // Unmask through the BAR, the way a guest would.
        msix.bar_write(1, 16 + 0xc, 4, 0);
        let delivered = msix.drain_unmasked_pending();
        assert_eq!(
            delivered,
            vec![(
                1,
                MsiMessage {
                    address: 0xfee0_0000,
                    data: 0x45
                }
            )]
        );
        assert!(!msix.is_pending(1));
    }

    #[test]
    fn vector_use_is_tracked_and_survives_reset() {
        let mut msix = MsixCapability::new(10, 1, 0, 1, 0x2000, 0x4000).unwrap();
        for vector in 0..10 {
            assert!(msix.vector_use(vector));
        }
        assert!(!msix.vector_use(10));
        assert_eq!(msix.used_vector_count(), 10);

        msix.set_control(true, false);
        program_entry(&mut msix, 3, 0x33, false);
        msix.reset();
        assert!(!msix.enabled());
        assert!(msix.entry_masked(3));
        assert_eq!(msix.used_vector_count(), 10);

        msix.vector_unuse(3);
        assert!(!msix.is_vector_used(3));
        msix.unuse_all_vectors();
        assert_eq!(msix.used_vector_count(), 0);
    }

    #[test]
    fn pba_is_read_only_through_the_bar() {
        let mut msix = MsixCapability::new(2, 1, 0, 1, 0x800, 0x1000).unwrap();
        msix.set_control(true, true);
        assert_eq!(msix.trigger(0), None);
        msix.bar_write(1, 0x800, 4, 0);
        assert!(msix.is_pending(0));
        // Other BARs see nothing.
        assert_eq!(msix.bar_read(4, 0x800, 4), 0);
    }

    #[test]
    fn accesses_at_the_top_of_the_address_space_miss_both_structures() {
        let mut msix = MsixCapability::new(2, 1, 0, 1, 0x800, 0x1000).unwrap();
        msix.set_control(true, false);
        program_entry(&mut msix, 0, 0x45, false);

        let top = u64::MAX - 3;
        assert_eq!(msix.bar_read(1, top, 4), 0);
        assert_eq!(msix.bar_read(1, u64::MAX, 1), 0);
        msix.bar_write(1, top, 4, 0xdead_beef);
        assert_eq!(msix.bar_read(1, 0x8, 4), 0x45);
    }
}
