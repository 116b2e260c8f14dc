//! Advanced Error Reporting extended capability.

use std::any::Any;
use std::collections::VecDeque;

use super::capabilities::{
    merge_dword, write_u32, ConfigBytes, PciExtCapability, PCI_EXT_CAP_ID_ERR,
};
use super::error::{PciError, Result};

pub const PCI_ERR_VER: u8 = 1;
/// Space reserved for an endpoint AER structure.
pub const PCI_ERR_SIZEOF: u16 = 0x40;
/// Bytes actually defined for an endpoint (through the end of the header log).
const PCI_ERR_ENDPOINT_LEN: u16 = 0x2c;
/// Upper bound on recorded headers a function may keep.
pub const PCIE_AER_LOG_MAX_LIMIT: u16 = 128;

pub const PCI_ERR_UNCOR_STATUS: u16 = 0x04;
pub const PCI_ERR_UNCOR_MASK: u16 = 0x08;
pub const PCI_ERR_UNCOR_SEVER: u16 = 0x0c;
pub const PCI_ERR_COR_STATUS: u16 = 0x10;
pub const PCI_ERR_COR_MASK: u16 = 0x14;
pub const PCI_ERR_CAP: u16 = 0x18;
pub const PCI_ERR_HEADER_LOG: u16 = 0x1c;

pub const PCI_ERR_UNC_DLP: u32 = 1 << 4;
pub const PCI_ERR_UNC_SDN: u32 = 1 << 5;
pub const PCI_ERR_UNC_POISON_TLP: u32 = 1 << 12;
pub const PCI_ERR_UNC_FCP: u32 = 1 << 13;
pub const PCI_ERR_UNC_COMP_TIME: u32 = 1 << 14;
pub const PCI_ERR_UNC_COMP_ABORT: u32 = 1 << 15;
pub const PCI_ERR_UNC_UNX_COMP: u32 = 1 << 16;
pub const PCI_ERR_UNC_RX_OVER: u32 = 1 << 17;
pub const PCI_ERR_UNC_MALF_TLP: u32 = 1 << 18;
pub const PCI_ERR_UNC_ECRC: u32 = 1 << 19;
pub const PCI_ERR_UNC_UNSUP: u32 = 1 << 20;
const PCI_ERR_UNC_SUPPORTED: u32 = PCI_ERR_UNC_DLP
    | PCI_ERR_UNC_SDN
    | PCI_ERR_UNC_POISON_TLP
    | PCI_ERR_UNC_FCP
    | PCI_ERR_UNC_COMP_TIME
    | PCI_ERR_UNC_COMP_ABORT
    | PCI_ERR_UNC_UNX_COMP
    | PCI_ERR_UNC_RX_OVER
    | PCI_ERR_UNC_MALF_TLP
    | PCI_ERR_UNC_ECRC
    | PCI_ERR_UNC_UNSUP;
pub const PCI_ERR_UNC_SEVERITY_DEFAULT: u32 = PCI_ERR_UNC_DLP
    | PCI_ERR_UNC_SDN
    | PCI_ERR_UNC_FCP
    | PCI_ERR_UNC_RX_OVER
    | PCI_ERR_UNC_MALF_TLP;

pub const PCI_ERR_COR_RCVR: u32 = 1 << 0;
pub const PCI_ERR_COR_BAD_TLP: u32 = 1 << 6;
pub const PCI_ERR_COR_BAD_DLLP: u32 = 1 << 7;
pub const PCI_ERR_COR_REP_ROLL: u32 = 1 << 8;
pub const PCI_ERR_COR_REP_TIMER: u32 = 1 << 12;
pub const PCI_ERR_COR_ADV_NFAT: u32 = 1 << 13;
pub const PCI_ERR_COR_INTERNAL: u32 = 1 << 14;
pub const PCI_ERR_COR_HL_OVERFLOW: u32 = 1 << 15;
const PCI_ERR_COR_SUPPORTED: u32 = PCI_ERR_COR_RCVR
    | PCI_ERR_COR_BAD_TLP
    | PCI_ERR_COR_BAD_DLLP
    | PCI_ERR_COR_REP_ROLL
    | PCI_ERR_COR_REP_TIMER
    | PCI_ERR_COR_ADV_NFAT
    | PCI_ERR_COR_INTERNAL
    | PCI_ERR_COR_HL_OVERFLOW;
pub const PCI_ERR_COR_MASK_DEFAULT: u32 = PCI_ERR_COR_ADV_NFAT;

const PCI_ERR_CAP_FEP_MASK: u32 = 0x1f;
const PCI_ERR_CAP_MHRC: u32 = 1 << 9;
const PCI_ERR_CAP_MHRE: u32 = 1 << 10;

/// One recorded uncorrectable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AerLogEntry {
    pub status: u32,
    pub header: [u32; 4],
}

#[derive(Debug, Clone)]
pub struct AerCapability {
    offset: u16,
    size: u16,
    log_max: u16,
    uncor_status: u32,
    uncor_mask: u32,
    uncor_severity: u32,
    cor_status: u32,
    cor_mask: u32,
    multi_header_enabled: bool,
    /// Errors recorded but not yet surfaced through the first-error pointer/header log.
    log: VecDeque<AerLogEntry>,
    /// The error currently surfaced in the header log.
    current: Option<AerLogEntry>,
}

impl AerCapability {
    /// `size` is the space the structure occupies; `log_max` bounds how many headers are kept.
    pub fn new(version: u8, size: u16, log_max: u16) -> Result<Self> {
        if version != PCI_ERR_VER {
            return Err(PciError::capability_init(
                "AER",
                format!("unsupported version {version}"),
            ));
        }
        if size < PCI_ERR_ENDPOINT_LEN || size % 4 != 0 {
            return Err(PciError::capability_init(
                "AER",
                format!("structure size {size:#x} cannot hold the header log"),
            ));
        }
        if log_max == 0 || log_max > PCIE_AER_LOG_MAX_LIMIT {
            return Err(PciError::capability_init(
                "AER",
                format!("log_max {log_max} is outside 1..={PCIE_AER_LOG_MAX_LIMIT}"),
            ));
        }
        Ok(Self {
            offset: 0,
            size,
            log_max,
            uncor_status: 0,
            uncor_mask: 0,
            uncor_severity: PCI_ERR_UNC_SEVERITY_DEFAULT,
            cor_status: 0,
            cor_mask: PCI_ERR_COR_MASK_DEFAULT,
            multi_header_enabled: false,
            log: VecDeque::new(),
            current: None,
        })
    }

    pub fn uncorrectable_status(&self) -> u32 {
        self.uncor_status
    }

    pub fn correctable_status(&self) -> u32 {
        self.cor_status
    }

    pub fn first_error(&self) -> Option<AerLogEntry> {
        self.current
    }

    pub fn logged_errors(&self) -> usize {
        self.log.len()
    }

    /// Whether an unmasked uncorrectable error of this kind would be fatal.
    pub fn is_fatal(&self, status: u32) -> bool {
        self.uncor_severity & status != 0
    }

    fn multi_header_capable(&self) -> bool {
        self.log_max > 1
    }

    /// Records an uncorrectable error. Returns false when the error is masked.
    pub fn inject_uncorrectable(&mut self, status: u32, header: [u32; 4]) -> bool {
        let status = status & PCI_ERR_UNC_SUPPORTED;
        if status == 0 || self.uncor_mask & status == status {
            return false;
        }
        let status = status & !self.uncor_mask;
        let entry = AerLogEntry { status, header };

        if self.current.is_none() && self.uncor_status & status == 0 {
            self.current = Some(entry);
        } else if self.multi_header_enabled && self.log.len() < usize::from(self.log_max) {
            self.log.push_back(entry);
        } else if self.current.is_some() {
            // Header log full: surface Header Log Overflow as a correctable error.
            self.cor_status |= PCI_ERR_COR_HL_OVERFLOW & !self.cor_mask;
        }
        self.uncor_status |= status;
        true
    }

    /// Records a correctable error. Returns false when the error is masked.
    pub fn inject_correctable(&mut self, status: u32) -> bool {
        let status = status & PCI_ERR_COR_SUPPORTED & !self.cor_mask;
        if status == 0 {
            return false;
        }
        self.cor_status |= status;
        true
    }

    pub fn reset(&mut self) {
        self.uncor_status = 0;
        self.uncor_mask = 0;
        self.uncor_severity = PCI_ERR_UNC_SEVERITY_DEFAULT;
        self.cor_status = 0;
        self.cor_mask = PCI_ERR_COR_MASK_DEFAULT;
        self.multi_header_enabled = false;
        self.log.clear();
        self.current = None;
    }

    fn capabilities_control(&self) -> u32 {
        let mut value = self
            .current
            .map_or(0, |entry| entry.status.trailing_zeros() & PCI_ERR_CAP_FEP_MASK);
        if self.multi_header_capable() {
            value |= PCI_ERR_CAP_MHRC;
        }
        if self.multi_header_enabled {
            value |= PCI_ERR_CAP_MHRE;
        }
        value
    }

    /// Clearing the status bit that the first-error pointer references advances the log.
    fn advance_log(&mut self) {
        while let Some(entry) = self.current {
            if self.uncor_status & entry.status != 0 {
                return;
            }
            self.current = self.log.pop_front();
        }
    }
}

impl PciExtCapability for AerCapability {
    fn id(&self) -> u16 {
        PCI_EXT_CAP_ID_ERR
    }

    fn version(&self) -> u8 {
        PCI_ERR_VER
    }

    fn offset(&self) -> u16 {
        self.offset
    }

    fn set_offset(&mut self, offset: u16) {
        self.offset = offset;
    }

    fn len(&self) -> u16 {
        self.size
    }

    fn sync_to_config(&self, config: &mut ConfigBytes) {
        let base = usize::from(self.offset);
        write_u32(config, base + usize::from(PCI_ERR_UNCOR_STATUS), self.uncor_status);
        write_u32(config, base + usize::from(PCI_ERR_UNCOR_MASK), self.uncor_mask);
        write_u32(config, base + usize::from(PCI_ERR_UNCOR_SEVER), self.uncor_severity);
        write_u32(config, base + usize::from(PCI_ERR_COR_STATUS), self.cor_status);
        write_u32(config, base + usize::from(PCI_ERR_COR_MASK), self.cor_mask);
        write_u32(config, base + usize::from(PCI_ERR_CAP), self.capabilities_control());
        let header = self.current.map_or([0; 4], |entry| entry.header);
        for (i, dword) in header.iter().enumerate() {
            write_u32(config, base + usize::from(PCI_ERR_HEADER_LOG) + i * 4, *dword);
        }
    }

    fn write_config(&mut self, offset: u16, size: usize, value: u32) {
        let reg = offset & !3;
        match reg {
            PCI_ERR_UNCOR_STATUS => {
                let (written, _) = merge_dword(0, offset, size, value);
                self.uncor_status &= !written;
                self.advance_log();
            }
            PCI_ERR_UNCOR_MASK => {
                let (merged, _) = merge_dword(self.uncor_mask, offset, size, value);
                self.uncor_mask = merged & PCI_ERR_UNC_SUPPORTED;
            }
            PCI_ERR_UNCOR_SEVER => {
                let (merged, _) = merge_dword(self.uncor_severity, offset, size, value);
                self.uncor_severity = merged & PCI_ERR_UNC_SUPPORTED;
            }
            PCI_ERR_COR_STATUS => {
                let (written, _) = merge_dword(0, offset, size, value);
                self.cor_status &= !written;
            }
            PCI_ERR_COR_MASK => {
                let (merged, _) = merge_dword(self.cor_mask, offset, size, value);
                self.cor_mask = merged & PCI_ERR_COR_SUPPORTED;
            }
            PCI_ERR_CAP => {
                let (merged, _) = merge_dword(self.capabilities_control(), offset, size, value);
                self.multi_header_enabled =
                    self.multi_header_capable() && merged & PCI_ERR_CAP_MHRE != 0;
            }
            // Header log and reserved space are read-only.
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

#[cfg(test)]
mod tests {
    use super::{
        AerCapability, PCI_ERR_COR_BAD_TLP, PCI_ERR_COR_HL_OVERFLOW, PCI_ERR_SIZEOF,
        PCI_ERR_UNC_COMP_ABORT, PCI_ERR_UNC_POISON_TLP, PCI_ERR_UNC_UNSUP,
    };
    use crate::pci::capabilities::PCI_EXT_CAP_ID_ERR;
    use crate::pci::config::PciConfigSpace;
    use crate::pci::error::PciError;

    fn config_with_aer(log_max: u16) -> PciConfigSpace {
        let mut config = PciConfigSpace::new(0x1af4, 0x1041);
        config
            .add_ext_capability(
                0x100,
                Box::new(AerCapability::new(1, PCI_ERR_SIZEOF, log_max).unwrap()),
            )
            .unwrap();
        config
    }

    #[test]
    fn header_and_defaults_are_visible_in_config_space() {
        let mut config = config_with_aer(1);
        // ID 0x0001, version 1, end of list.
        assert_eq!(config.read(0x100, 4), 0x0001_0001);
        assert_eq!(config.read(0x10c, 4), 0x0006_2030);
        assert_eq!(config.read(0x114, 4), 0x0000_2000);
        assert_eq!(config.find_ext_capability(PCI_EXT_CAP_ID_ERR), Some(0x100));
    }

    #[test]
    fn invalid_parameters_fail_initialization() {
        assert!(matches!(
            AerCapability::new(1, PCI_ERR_SIZEOF, 129),
            Err(PciError::CapabilityInit { name: "AER", .. })
        ));
        assert!(AerCapability::new(1, PCI_ERR_SIZEOF, 0).is_err());
        assert!(AerCapability::new(2, PCI_ERR_SIZEOF, 1).is_err());
        assert!(AerCapability::new(1, 0x20, 1).is_err());
    }

    #[test]
    fn uncorrectable_status_is_write_one_to_clear() {
        let mut config = config_with_aer(1);
        {
            let aer = config.ext_capability_mut::<AerCapability>().unwrap();
            assert!(aer.inject_uncorrectable(PCI_ERR_UNC_POISON_TLP, [1, 2, 3, 4]));
            assert!(aer.inject_uncorrectable(PCI_ERR_UNC_UNSUP, [5, 6, 7, 8]));
        }
        assert_eq!(config.read(0x104, 4), PCI_ERR_UNC_POISON_TLP | PCI_ERR_UNC_UNSUP);
        // First error pointer names bit 12, header log holds its TLP header.
        assert_eq!(config.read(0x118, 4) & 0x1f, 12);
        assert_eq!(config.read(0x11c, 4), 1);

        // Writing zeros clears nothing; a byte write clears only its lane.
        config.write(0x104, 4, 0);
        assert_eq!(config.read(0x104, 4), PCI_ERR_UNC_POISON_TLP | PCI_ERR_UNC_UNSUP);
        config.write(0x105, 1, PCI_ERR_UNC_POISON_TLP >> 8);
        assert_eq!(config.read(0x104, 4), PCI_ERR_UNC_UNSUP);
        assert_eq!(config.read(0x11c, 4), 0);
    }

    #[test]
    fn masked_errors_are_not_recorded() {
        let mut config = config_with_aer(1);
        config.write(0x108, 4, PCI_ERR_UNC_COMP_ABORT);
        let aer = config.ext_capability_mut::<AerCapability>().unwrap();
        assert!(!aer.inject_uncorrectable(PCI_ERR_UNC_COMP_ABORT, [0; 4]));
        assert_eq!(aer.uncorrectable_status(), 0);
        assert!(aer.inject_correctable(PCI_ERR_COR_BAD_TLP));
        assert_eq!(aer.correctable_status(), PCI_ERR_COR_BAD_TLP);
    }

    #[test]
    fn multi_header_recording_advances_the_first_error_pointer() {
        let mut config = config_with_aer(4);
        // Enable multiple header recording.
        let cap = config.read(0x118, 4);
        assert_ne!(cap & (1 << 9), 0);
        config.write(0x118, 4, cap | (1 << 10));

        {
            let aer = config.ext_capability_mut::<AerCapability>().unwrap();
            aer.inject_uncorrectable(PCI_ERR_UNC_POISON_TLP, [0x11; 4]);
            aer.inject_uncorrectable(PCI_ERR_UNC_UNSUP, [0x22; 4]);
            assert_eq!(aer.logged_errors(), 1);
        }
        config.write(0x104, 4, PCI_ERR_UNC_POISON_TLP);
        assert_eq!(config.read(0x118, 4) & 0x1f, 20);
        assert_eq!(config.read(0x11c, 4), 0x22);
    }

    #[test]
    fn single_header_log_overflow_is_reported_as_correctable() {
        let mut config = config_with_aer(1);
        config.write(0x114, 4, 0);
        let aer = config.ext_capability_mut::<AerCapability>().unwrap();
        aer.inject_uncorrectable(PCI_ERR_UNC_POISON_TLP, [0; 4]);
        aer.inject_uncorrectable(PCI_ERR_UNC_UNSUP, [0; 4]);
        assert_eq!(aer.correctable_status() & PCI_ERR_COR_HL_OVERFLOW, PCI_ERR_COR_HL_OVERFLOW);

        aer.reset();
        assert_eq!(aer.uncorrectable_status(), 0);
        assert!(aer.first_error().is_none());
    }
}
