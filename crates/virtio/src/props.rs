//! User-facing device properties (`vectors`, `queues`, `x-pcie-flr-init`, ...).

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VirtioNetError};

pub const DEFAULT_MODERN_MEM_BAR: u8 = 4;
pub const DEFAULT_MSIX_BAR: u8 = 1;

/// Standard capability offset of the PCIe endpoint capability on every VF.
pub const DEFAULT_VF_PCIE_OFFSET: u8 = 0xa0;
pub const DEFAULT_VF_AER_OFFSET: u16 = 0x100;
pub const DEFAULT_VF_AER_LOG_MAX: u16 = 1;
pub const DEFAULT_VF_ARI_OFFSET: u16 = 0x160;

/// An Ethernet MAC address written as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The conventional 52:54:00 emulator prefix with the first NIC suffix.
    pub const DEFAULT: Self = Self([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
}

impl Default for MacAddress {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.split(':');
        for byte in mac.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("MAC address {s:?} has fewer than six octets"))?;
            if part.len() != 2 {
                return Err(format!("MAC octet {part:?} must be two hex digits"));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("MAC octet {part:?} is not hexadecimal"))?;
        }
        if parts.next().is_some() {
            return Err(format!("MAC address {s:?} has more than six octets"));
        }
        Ok(Self(mac))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

/// Where each VF places its PCI Express capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct VfCapabilityProps {
    pub pcie_offset: u8,
    pub aer_offset: u16,
    /// Header log depth of the VF AER capability. 0 or anything above 128 makes VF realization
    /// fail.
    pub aer_log_max: u16,
    pub ari_offset: u16,
}

impl Default for VfCapabilityProps {
    fn default() -> Self {
        Self {
            pcie_offset: DEFAULT_VF_PCIE_OFFSET,
            aer_offset: DEFAULT_VF_AER_OFFSET,
            aer_log_max: DEFAULT_VF_AER_LOG_MAX,
            ari_offset: DEFAULT_VF_ARI_OFFSET,
        }
    }
}

/// Properties of a `virtio-net-pci` physical function.
///
/// Parsed from JSON with the same kebab-case keys a machine description uses:
///
/// ```json
/// { "queues": 4, "x-pcie-flr-init": true, "mac": "52:54:00:12:34:57" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VirtioNetPciProps {
    /// MSI-X vector count. Derived from `queues` when absent.
    #[serde(default)]
    pub vectors: Option<u16>,
    /// Number of RX/TX queue pairs.
    #[serde(default = "default_queues")]
    pub queues: u16,
    /// Advertise Function Level Reset on the PF and on every VF.
    #[serde(rename = "x-pcie-flr-init", default)]
    pub pcie_flr_init: bool,
    #[serde(default = "default_true")]
    pub ioeventfd: bool,
    #[serde(default)]
    pub bootindex: Option<i32>,
    #[serde(default)]
    pub mac: MacAddress,
    #[serde(default = "default_modern_mem_bar")]
    pub modern_mem_bar: u8,
    #[serde(default = "default_msix_bar")]
    pub msix_bar: u8,
    #[serde(default)]
    pub vf_capabilities: VfCapabilityProps,
}

fn default_queues() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

fn default_modern_mem_bar() -> u8 {
    DEFAULT_MODERN_MEM_BAR
}

fn default_msix_bar() -> u8 {
    DEFAULT_MSIX_BAR
}

impl Default for VirtioNetPciProps {
    fn default() -> Self {
        Self {
            vectors: None,
            queues: default_queues(),
            pcie_flr_init: false,
            ioeventfd: true,
            bootindex: None,
            mac: MacAddress::DEFAULT,
            modern_mem_bar: DEFAULT_MODERN_MEM_BAR,
            msix_bar: DEFAULT_MSIX_BAR,
            vf_capabilities: VfCapabilityProps::default(),
        }
    }
}

impl VirtioNetPciProps {
    pub fn from_json(json: &str) -> Result<Self> {
        let props: Self = serde_json::from_str(json)?;
        props.validate()?;
        Ok(props)
    }

    /// MSI-X vectors per function: one per queue of every pair, one for the control queue and
    /// one for configuration changes, unless `vectors` overrides it.
    pub fn nvectors(&self) -> u16 {
        match self.vectors {
            Some(vectors) => vectors,
            None => {
                let pairs = u32::from(self.queues.max(1));
                u16::try_from(2 * pairs + 2).unwrap_or(u16::MAX)
            }
        }
    }

    /// Rejects combinations that cannot be laid out at all.
    ///
    /// Both BARs are 64-bit on the VFs, so each one claims its index and the next.
    pub fn validate(&self) -> Result<()> {
        if self.vectors == Some(0) {
            return Err(VirtioNetError::InvalidProperties(
                "vectors must be at least 1".to_string(),
            ));
        }
        for (name, bar) in [
            ("modern-mem-bar", self.modern_mem_bar),
            ("msix-bar", self.msix_bar),
        ] {
            if bar > 4 {
                return Err(VirtioNetError::InvalidProperties(format!(
                    "{name} {bar} leaves no room for the upper half of a 64-bit BAR"
                )));
            }
        }
        if self.modern_mem_bar.abs_diff(self.msix_bar) < 2 {
            return Err(VirtioNetError::InvalidProperties(format!(
                "modern-mem-bar {} and msix-bar {} overlap",
                self.modern_mem_bar, self.msix_bar
            )));
        }
        Ok(())
    }
}
