/// A device window that services guest loads and stores.
///
/// `offset` is relative to the start of the window (for example the base of a PCI BAR), and
/// `size` is the access width in bytes. Reads take `&mut self` because device registers may have
/// read side effects (read-to-clear status bytes).
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

/// Returns the open-bus value for an access of `size` bytes.
pub fn all_ones(size: usize) -> u64 {
    match size {
        0 => 0,
        1..=7 => (1u64 << (size * 8)) - 1,
        _ => u64::MAX,
    }
}

/// Access widths accepted by register windows that follow the byte/word/dword convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
}

impl AccessWidth {
    /// Classifies an access size in bytes. Anything other than 1, 2 or 4 is unsupported.
    pub const fn from_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            _ => None,
        }
    }

    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
        }
    }

    /// All-ones value truncated to this width.
    pub const fn all_ones(self) -> u32 {
        self.mask()
    }

    /// Naturally aligned accesses only.
    pub const fn is_aligned(self, offset: u64) -> bool {
        offset % (self.bytes() as u64) == 0
    }
}

/// Descriptor for an MMIO window a device exposes through a BAR.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MmioRegion {
    name: String,
    size: u64,
}

impl MmioRegion {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        assert!(size.is_power_of_two(), "MMIO region size must be a power of two");
        Self {
            name: name.into(),
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns true when `[offset, offset + len)` lies entirely inside the window.
    pub fn contains(&self, offset: u64, len: usize) -> bool {
        offset
            .checked_add(len as u64)
            .is_some_and(|end| end <= self.size)
    }
}
