//! Virtual functions.
//!
//! A VF carries its own configuration space, MSI-X table and ISR byte. Its modern BAR windows
//! reach the PF's [`SharedRegisters`] through a weak handle, so a VF never keeps its PF alive.

use std::cell::RefCell;
use std::rc::Weak;

use memory::{all_ones, MmioHandler, MmioRegion};
use vnet_devices::pci::aer::{PCI_ERR_SIZEOF, PCI_ERR_VER};
use vnet_devices::pci::capabilities::{PCI_EXT_CAP_ID_ARI, PCI_EXT_CAP_ID_ERR};
use vnet_devices::pci::{
    flr_write_config, AerCapability, AriCapability, BusServices, MsixCapability,
    PciBarDefinition, PciBdf, PciClassCode, PciConfigSpace, PciDevice, PciError,
    PciSubsystemIds, PcieCapability,
};

use crate::error::{Result, VirtioNetError};
use crate::function::{
    config_access_ok, deliver_pending_msix, signal_config_change, DeviceKind, NetFunction,
};
use crate::layout::{VirtioRegion, VF_MSIX_BAR_SIZE, VF_MSIX_PBA_OFFSET};
use crate::lifecycle::{InstallLog, Installed};
use crate::pci::add_virtio_cap;
use crate::props::VfCapabilityProps;
use crate::transport::{IsrStatus, ModernBar, SharedRegisters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfState {
    Uninitialized,
    BarsRegistered,
    CapabilitiesInstalled,
    VectorsArmed,
    Active,
    Quiescing,
    Destroyed,
}

/// Fields a VF takes over from its PF when the slot is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfTemplate {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: PciClassCode,
    pub subsystem: PciSubsystemIds,
    pub nvectors: u16,
    pub flr: bool,
    pub modern_bar: u8,
    pub modern_bar_def: PciBarDefinition,
    pub msix_bar: u8,
    pub msix_bar_def: PciBarDefinition,
    pub caps: VfCapabilityProps,
}

pub struct VirtioNetVf {
    index: u16,
    pf: PciBdf,
    rid: PciBdf,
    state: VfState,
    template: VfTemplate,
    config: PciConfigSpace,
    shared: Weak<RefCell<SharedRegisters>>,
    isr: IsrStatus,
    installed: InstallLog,
}

impl VirtioNetVf {
    pub fn new(
        index: u16,
        pf: PciBdf,
        rid: PciBdf,
        template: VfTemplate,
        shared: Weak<RefCell<SharedRegisters>>,
    ) -> Self {
        let mut config = PciConfigSpace::new(template.vendor_id, template.device_id);
        let class = template.class;
        config.set_class_code(class.class, class.subclass, class.prog_if, class.revision_id);
        config.set_subsystem_ids(template.subsystem);
        Self {
            index,
            pf,
            rid,
            state: VfState::Uninitialized,
            template,
            config,
            shared,
            isr: IsrStatus::default(),
            installed: InstallLog::default(),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn state(&self) -> VfState {
        self.state
    }

    pub fn template(&self) -> &VfTemplate {
        &self.template
    }

    pub fn isr(&self) -> IsrStatus {
        self.isr
    }

    pub fn installed(&self) -> &[Installed] {
        self.installed.entries()
    }

    fn transition(&mut self, next: VfState) {
        tracing::debug!(
            vf = self.index,
            rid = %self.rid,
            from = ?self.state,
            to = ?next,
            "VF state"
        );
        self.state = next;
    }

    /// Brings the VF up. On failure everything installed so far is released again and the VF
    /// ends up [`VfState::Destroyed`]; its routing ID stays reserved by the PF.
    pub fn realize(&mut self, host: &mut dyn BusServices) -> Result<()> {
        if self.state != VfState::Uninitialized {
            return Err(VirtioNetError::AlreadyRealized);
        }
        match self.install(host) {
            Ok(()) => {
                self.transition(VfState::Active);
                Ok(())
            }
            Err(err) => {
                tracing::error!(vf = self.index, rid = %self.rid, %err, "VF realization failed");
                host.report_fatal_config_error(self.rid, &err.to_string());
                tracing::warn!(vf = self.index, rid = %self.rid, "rolling back VF");
                self.transition(VfState::Quiescing);
                self.installed.unwind(self.rid, &mut self.config, host);
                self.transition(VfState::Destroyed);
                Err(err.into())
            }
        }
    }

    fn install(&mut self, host: &mut dyn BusServices) -> std::result::Result<(), PciError> {
        let t = self.template;

        for (bar, def, name) in [
            (t.modern_bar, t.modern_bar_def, "virtio-net-vf-modern"),
            (t.msix_bar, t.msix_bar_def, "virtio-net-vf-msix"),
        ] {
            host.register_bar(self.rid, bar, &MmioRegion::new(name, def.size()), def)?;
            self.installed.record(Installed::Bar(bar));
        }
        self.transition(VfState::BarsRegistered);

        for region in VirtioRegion::ALL {
            let offset = add_virtio_cap(&mut self.config, &region.capability(t.modern_bar))?;
            self.installed.record(Installed::Capability(offset));
        }

        let msix = MsixCapability::new(
            t.nvectors,
            t.msix_bar,
            0,
            t.msix_bar,
            VF_MSIX_PBA_OFFSET,
            VF_MSIX_BAR_SIZE,
        )?;
        let offset = self.config.add_capability(Box::new(msix))?;
        self.installed.record(Installed::Capability(offset));
        host.allocate_interrupt_vectors(self.rid, t.nvectors)?;
        self.installed.record(Installed::HostVectors);

        let mut pcie = PcieCapability::endpoint();
        if t.flr {
            pcie.enable_flr();
        }
        match self.config.add_capability_at(t.caps.pcie_offset, Box::new(pcie)) {
            Ok(offset) => self.installed.record(Installed::Capability(offset)),
            Err(err) => {
                tracing::warn!(
                    vf = self.index,
                    rid = %self.rid,
                    %err,
                    "VF has no PCI Express capability"
                );
            }
        }

        // ARI before AER: unwinding removes AER first.
        self.config
            .add_ext_capability(t.caps.ari_offset, Box::new(AriCapability::new(0)))?;
        self.installed.record(Installed::ExtCapability(PCI_EXT_CAP_ID_ARI));

        let aer = AerCapability::new(PCI_ERR_VER, PCI_ERR_SIZEOF, t.caps.aer_log_max)?;
        self.config.add_ext_capability(t.caps.aer_offset, Box::new(aer))?;
        self.installed.record(Installed::ExtCapability(PCI_EXT_CAP_ID_ERR));
        self.transition(VfState::CapabilitiesInstalled);

        if let Some(msix) = self.config.capability_mut::<MsixCapability>() {
            for vector in 0..t.nvectors {
                msix.vector_use(vector);
            }
        }
        for vector in 0..t.nvectors {
            host.enable_interrupt_vector(self.rid, vector);
        }
        self.installed.record(Installed::VectorsInUse(t.nvectors));
        self.transition(VfState::VectorsArmed);
        Ok(())
    }

    /// Releases everything the VF installed, newest first. Safe in any state and on repeat.
    pub fn teardown(&mut self, host: &mut dyn BusServices) {
        if self.state == VfState::Destroyed && self.installed.is_empty() {
            return;
        }
        self.transition(VfState::Quiescing);
        self.installed.unwind(self.rid, &mut self.config, host);
        self.isr.clear();
        self.transition(VfState::Destroyed);
    }

    /// Reset hold phase: interrupt and error state go back to power-on values. The PF's shared
    /// registers are left alone.
    pub fn reset_function(&mut self) {
        self.config.set_command(0);
        if let Some(msix) = self.config.capability_mut::<MsixCapability>() {
            msix.reset();
        }
        if let Some(pcie) = self.config.capability_mut::<PcieCapability>() {
            pcie.reset();
        }
        if let Some(aer) = self.config.ext_capability_mut::<AerCapability>() {
            aer.reset();
        }
        self.config.sync_capabilities();
        self.isr.clear();
    }

    fn function_level_reset(&mut self) {
        tracing::debug!(vf = self.index, rid = %self.rid, "function level reset");
        let resumed = self.state;
        self.transition(VfState::Quiescing);
        self.reset_function();
        self.transition(resumed);
    }

    /// Configuration write as the guest issues it. Reports whether the write requested an FLR.
    pub(crate) fn guest_config_write(
        &mut self,
        offset: u16,
        size: usize,
        value: u32,
        host: &mut dyn BusServices,
    ) -> bool {
        if !self.is_guest_visible() || !config_access_ok(offset, size) {
            return false;
        }
        let flr = self.intercept_config_write(offset, size, value);
        deliver_pending_msix(self.rid, &mut self.config, host);
        flr
    }

    /// Default write first, then FLR side effects only when FLR was negotiated for the device.
    fn intercept_config_write(&mut self, offset: u16, size: usize, value: u32) -> bool {
        self.config.write(offset, size, value);
        if !self.template.flr {
            return false;
        }
        let requested = flr_write_config(&mut self.config, offset, size);
        if requested {
            self.function_level_reset();
        }
        requested
    }

    pub(crate) fn guest_config_read(&mut self, offset: u16, size: usize) -> u32 {
        if !self.is_guest_visible() || !config_access_ok(offset, size) {
            return all_ones(size) as u32;
        }
        self.config.read(offset, size)
    }

    pub(crate) fn bar_read(&mut self, bar: u8, offset: u64, size: usize) -> u64 {
        if bar == self.template.modern_bar {
            let shared = self.shared.upgrade();
            let mut regs = shared.as_ref().map(|rc| rc.borrow_mut());
            let mut window = ModernBar {
                rid: self.rid,
                shared: regs.as_deref_mut(),
                isr: &mut self.isr,
            };
            window.read(offset, size)
        } else if bar == self.template.msix_bar {
            match self.config.capability::<MsixCapability>() {
                Some(msix) => msix.bar_read(bar, offset, size),
                None => all_ones(size),
            }
        } else {
            all_ones(size)
        }
    }

    pub(crate) fn bar_write(
        &mut self,
        bar: u8,
        offset: u64,
        size: usize,
        value: u64,
        host: &mut dyn BusServices,
    ) {
        if bar == self.template.modern_bar {
            let shared = self.shared.upgrade();
            let mut regs = shared.as_ref().map(|rc| rc.borrow_mut());
            let mut window = ModernBar {
                rid: self.rid,
                shared: regs.as_deref_mut(),
                isr: &mut self.isr,
            };
            window.write(offset, size, value);
        } else if bar == self.template.msix_bar {
            if let Some(msix) = self.config.capability_mut::<MsixCapability>() {
                msix.bar_write(bar, offset, size, value);
            }
            deliver_pending_msix(self.rid, &mut self.config, host);
        }
    }

    pub(crate) fn notify_config_change(&mut self, vector: u16, host: &mut dyn BusServices) {
        if !self.is_guest_visible() {
            return;
        }
        signal_config_change(self.rid, &mut self.config, &mut self.isr, vector, host);
    }
}

impl PciDevice for VirtioNetVf {
    fn config(&self) -> &PciConfigSpace {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        if !config_access_ok(offset, size) {
            return all_ones(size) as u32;
        }
        self.config.read(offset, size)
    }

    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        if !config_access_ok(offset, size) {
            return;
        }
        self.intercept_config_write(offset, size, value);
    }

    fn reset(&mut self) {
        self.reset_function();
    }
}

impl NetFunction for VirtioNetVf {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Vf {
            pf: self.pf,
            index: self.index,
        }
    }

    fn routing_id(&self) -> PciBdf {
        self.rid
    }

    fn is_guest_visible(&self) -> bool {
        self.state == VfState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    use vnet_devices::pci::{BusLog, PciBarDefinition};

    use crate::devices::net::VirtioNet;
    use crate::props::MacAddress;

    const PF: PciBdf = PciBdf::new(0, 3, 0);
    const RID: PciBdf = PciBdf::new(0, 0x13, 0);

    fn template() -> VfTemplate {
        let bar = PciBarDefinition::Mmio64 {
            size: 0x4000,
            prefetchable: true,
        };
        VfTemplate {
            vendor_id: 0x1af4,
            device_id: 0x1041,
            class: PciClassCode {
                class: 0x02,
                subclass: 0x00,
                prog_if: 0,
                revision_id: 1,
            },
            subsystem: PciSubsystemIds {
                subsystem_vendor_id: 0x1af4,
                subsystem_id: 1,
            },
            nvectors: 4,
            flr: false,
            modern_bar: 4,
            modern_bar_def: bar,
            msix_bar: 1,
            msix_bar_def: bar,
            caps: VfCapabilityProps::default(),
        }
    }

    #[test]
    fn state_walk_on_success() {
        let mut host = BusLog::new();
        let mut vf = VirtioNetVf::new(0, PF, RID, template(), Weak::new());
        assert_eq!(vf.state(), VfState::Uninitialized);
        assert!(!vf.is_guest_visible());

        vf.realize(&mut host).unwrap();
        assert_eq!(vf.state(), VfState::Active);
        assert_eq!(host.vectors(RID).unwrap().enabled.len(), 4);

        vf.teardown(&mut host);
        assert_eq!(vf.state(), VfState::Destroyed);
        assert!(!host.holds_resources(RID));
        vf.teardown(&mut host);
        assert_eq!(vf.state(), VfState::Destroyed);
    }

    #[test]
    fn windows_read_all_ones_once_the_pf_registers_are_gone() {
        let mut host = BusLog::new();
        let shared = SharedRegisters::new(3).into_handle();
        shared
            .borrow_mut()
            .attach(Box::new(VirtioNet::new(MacAddress::DEFAULT, 1)));

        let mut vf = VirtioNetVf::new(0, PF, RID, template(), Rc::downgrade(&shared));
        vf.realize(&mut host).unwrap();
        assert_eq!(vf.bar_read(4, 0x2000, 1), 0x52);

        drop(shared);
        assert_eq!(vf.bar_read(4, 0x2000, 4), 0xffff_ffff);
        assert_eq!(vf.bar_read(4, 0x1000, 1), 0xff);
        vf.bar_write(4, 0x10, 2, 0, &mut host);
        assert_eq!(vf.bar_read(4, 0x10, 2), 0xffff);

        // The MSI-X BAR is the VF's own and keeps working.
        vf.bar_write(1, 0x8, 4, 0x41, &mut host);
        assert_eq!(vf.bar_read(1, 0x8, 4), 0x41);
    }

    #[test]
    fn hidden_vf_ignores_configuration_writes() {
        let mut host = BusLog::new();
        let mut vf = VirtioNetVf::new(0, PF, RID, template(), Weak::new());
        assert_eq!(vf.guest_config_read(0, 4), 0xffff_ffff);
        assert!(!vf.guest_config_write(0x04, 2, 0x6, &mut host));

        vf.realize(&mut host).unwrap();
        assert_eq!(vf.guest_config_read(0, 4), 0x1041_1af4);
        vf.guest_config_write(0x04, 2, 0x6, &mut host);
        assert_eq!(vf.config().command(), 0x6);
    }
}
