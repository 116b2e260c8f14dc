//! PCI Express function model: configuration space, capabilities and the host bus seam.

pub mod aer;
pub mod ari;
pub mod capabilities;
pub mod config;
pub mod host;
pub mod msix;
pub mod pcie;
pub mod sriov;

mod error;

pub use aer::{AerCapability, AerLogEntry};
pub use ari::AriCapability;
pub use capabilities::{
    PciCapability, PciCapabilityInfo, PciExtCapability, PciExtCapabilityInfo,
    VendorSpecificCapability,
};
pub use config::{
    PciBarChange, PciBarDefinition, PciBarFlags, PciBarKind, PciBarRange, PciClassCode,
    PciCommandChange, PciConfigSpace, PciConfigWriteEffects, PciDevice, PciSubsystemIds,
    PciVendorDeviceId,
};
pub use error::{PciError, Result};
pub use host::{BusLog, BusServices, RegisteredBar, VectorAllocation};
pub use msix::{MsiMessage, MsixCapability};
pub use pcie::{flr_write_config, PcieCapability};
pub use sriov::{SriovCapability, SriovControlChange, SriovParams};

pub const PCI_COMMAND_IO: u16 = 1 << 0;
pub const PCI_COMMAND_MEMORY: u16 = 1 << 1;
pub const PCI_COMMAND_MASTER: u16 = 1 << 2;

/// PCI bus/device/function identifier. With ARI the device and function fields together form an
/// 8-bit function number; the packed 16-bit routing ID is the same either way.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// bus < 256, device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs this BDF into its 16-bit routing ID.
    ///
    /// Layout (LSB..MSB):
    /// - bits 0..=2: function (0-7)
    /// - bits 3..=7: device (0-31)
    /// - bits 8..=15: bus (0-255)
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `device >= 32` or `function >= 8`.
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }

    /// Unpacks a routing ID produced by [`PciBdf::pack_u16`].
    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }

    /// The routing ID `delta` functions past this one, as SR-IOV computes VF RIDs.
    pub fn offset_by(self, delta: u16) -> Option<Self> {
        self.pack_u16().checked_add(delta).map(Self::unpack_u16)
    }
}

impl From<PciBdf> for u16 {
    fn from(value: PciBdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for PciBdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl core::cmp::Ord for PciBdf {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.bus, self.device, self.function).cmp(&(other.bus, other.device, other.function))
    }
}

impl core::cmp::PartialOrd for PciBdf {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl core::fmt::Display for PciBdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// PCI INTx interrupt pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PciInterruptPin {
    IntA,
    IntB,
    IntC,
    IntD,
}

impl PciInterruptPin {
    pub const fn index(self) -> usize {
        match self {
            Self::IntA => 0,
            Self::IntB => 1,
            Self::IntC => 2,
            Self::IntD => 3,
        }
    }

    /// Converts to the PCI config-space encoding (1 = INTA#, 2 = INTB#, ...).
    pub const fn to_config_u8(self) -> u8 {
        self.index() as u8 + 1
    }

    pub const fn from_config_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::IntA),
            2 => Some(Self::IntB),
            3 => Some(Self::IntC),
            4 => Some(Self::IntD),
            _ => None,
        }
    }
}
