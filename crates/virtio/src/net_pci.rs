//! The `virtio-net-pci` physical function.

use std::rc::Rc;

use memory::{all_ones, MmioRegion};
use vnet_devices::pci::capabilities::{PCI_EXT_CAP_ID_ARI, PCI_EXT_CAP_ID_SRIOV};
use vnet_devices::pci::{
    flr_write_config, AriCapability, BusServices, MsixCapability, PciBarDefinition, PciBarFlags,
    PciBdf, PciConfigSpace, PciDevice, PciError, PciInterruptPin, PciSubsystemIds,
    PcieCapability, SriovCapability, SriovControlChange, SriovParams,
};

use crate::devices::net::{VirtioNet, VIRTIO_DEVICE_TYPE_NET};
use crate::devices::VirtioDevice;
use crate::error::{Result, VirtioNetError};
use crate::function::{
    config_access_ok, deliver_pending_msix, signal_config_change, DeviceKind, NetFunction,
};
use crate::layout::{exclusive_msix_bar, VirtioRegion, MODERN_BAR_SIZE, VF_MSIX_BAR_SIZE};
use crate::lifecycle::{InstallLog, Installed};
use crate::pci::{
    add_virtio_cap, virtio_pci_device_id, PCI_CLASS_NETWORK, PCI_SUBCLASS_NETWORK_ETHERNET,
    PCI_VENDOR_ID_VIRTIO, VIRTIO_PCI_ABI_VERSION,
};
use crate::props::VirtioNetPciProps;
use crate::transport::{IsrStatus, QueueNotification, SharedRegisters, SharedRegistersHandle};
use crate::vf::{VfTemplate, VirtioNetVf};

pub const VIRTIO_NET_VF_DEVICE_ID: u16 = 0x1041;
pub const VIRTIO_NET_SRIOV_TOTAL_VFS: u16 = 8;
pub const VIRTIO_NET_SRIOV_INITIAL_VFS: u16 = 8;
pub const VIRTIO_NET_SRIOV_VF_OFFSET: u16 = 0x80;
pub const VIRTIO_NET_SRIOV_VF_STRIDE: u16 = 2;

pub const PF_ARI_OFFSET: u16 = 0x100;
pub const PF_SRIOV_OFFSET: u16 = 0x160;

/// Both VF BARs are 64-bit prefetchable memory.
pub const VF_BAR_FLAGS: PciBarFlags = PciBarFlags::MEM_TYPE_64.union(PciBarFlags::MEM_PREFETCH);

/// An SR-IOV capable virtio-net PCI Express function.
///
/// The PF owns the virtio register block every VF aliases, the host collaborator all functions
/// share, and the VF slots themselves. VFs exist only between an SR-IOV enable and the matching
/// disable, reset or PF teardown.
pub struct VirtioNetPci<H: BusServices> {
    bdf: PciBdf,
    props: VirtioNetPciProps,
    nvectors: u16,
    config: PciConfigSpace,
    shared: SharedRegistersHandle,
    isr: IsrStatus,
    host: H,
    installed: InstallLog,
    realized: bool,
    vfs: Vec<Option<VirtioNetVf>>,
}

impl<H: BusServices> VirtioNetPci<H> {
    pub fn new(bdf: PciBdf, props: VirtioNetPciProps, host: H) -> Result<Self> {
        props.validate()?;
        let nvectors = props.nvectors();

        let mut config = PciConfigSpace::new(
            PCI_VENDOR_ID_VIRTIO,
            virtio_pci_device_id(VIRTIO_DEVICE_TYPE_NET),
        );
        config.set_class_code(
            PCI_CLASS_NETWORK,
            PCI_SUBCLASS_NETWORK_ETHERNET,
            0,
            VIRTIO_PCI_ABI_VERSION,
        );
        config.set_subsystem_ids(PciSubsystemIds {
            subsystem_vendor_id: PCI_VENDOR_ID_VIRTIO,
            subsystem_id: VIRTIO_DEVICE_TYPE_NET,
        });
        config.set_interrupt_pin(PciInterruptPin::IntA.to_config_u8());

        // Until a device is attached the queue count follows the properties.
        let num_queues = props.queues.max(1).saturating_mul(2).saturating_add(1);

        Ok(Self {
            bdf,
            props,
            nvectors,
            config,
            shared: SharedRegisters::new(num_queues).into_handle(),
            isr: IsrStatus::default(),
            host,
            installed: InstallLog::default(),
            realized: false,
            vfs: Vec::new(),
        })
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn props(&self) -> &VirtioNetPciProps {
        &self.props
    }

    pub fn nvectors(&self) -> u16 {
        self.nvectors
    }

    pub fn is_realized(&self) -> bool {
        self.realized
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn shared(&self) -> &SharedRegistersHandle {
        &self.shared
    }

    pub fn isr(&self) -> IsrStatus {
        self.isr
    }

    pub fn installed(&self) -> &[Installed] {
        self.installed.entries()
    }

    /// Installs the capability chain, registers BARs and vectors, and advertises SR-IOV with the
    /// default VF layout. On failure every step taken so far is undone and the host is told the
    /// device cannot come up.
    pub fn realize(&mut self) -> Result<()> {
        if self.realized {
            return Err(VirtioNetError::AlreadyRealized);
        }
        if let Err(err) = self.install() {
            tracing::error!(rid = %self.bdf, %err, "virtio-net-pci realization failed");
            self.host
                .report_fatal_config_error(self.bdf, &err.to_string());
            self.installed
                .unwind(self.bdf, &mut self.config, &mut self.host);
            self.vfs.clear();
            return Err(err);
        }
        self.realized = true;
        tracing::info!(
            rid = %self.bdf,
            nvectors = self.nvectors,
            total_vfs = VIRTIO_NET_SRIOV_TOTAL_VFS,
            "virtio-net-pci realized"
        );
        Ok(())
    }

    fn install(&mut self) -> Result<()> {
        let modern_bar = self.props.modern_mem_bar;
        let msix_bar = self.props.msix_bar;
        let (pba_offset, msix_bar_size) = exclusive_msix_bar(self.nvectors);

        self.install_bar(
            modern_bar,
            "virtio-net-pci-modern",
            PciBarDefinition::Mmio64 {
                size: MODERN_BAR_SIZE,
                prefetchable: true,
            },
        )?;
        self.install_bar(
            msix_bar,
            "virtio-net-pci-msix",
            PciBarDefinition::Mmio32 {
                size: msix_bar_size as u32,
                prefetchable: false,
            },
        )?;

        for region in VirtioRegion::ALL {
            let offset = add_virtio_cap(&mut self.config, &region.capability(modern_bar))?;
            self.installed.record(Installed::Capability(offset));
        }

        let msix = MsixCapability::new(
            self.nvectors,
            msix_bar,
            0,
            msix_bar,
            pba_offset,
            msix_bar_size,
        )?;
        let offset = self.config.add_capability(Box::new(msix))?;
        self.installed.record(Installed::Capability(offset));
        self.host.allocate_interrupt_vectors(self.bdf, self.nvectors)?;
        self.installed.record(Installed::HostVectors);
        if let Some(msix) = self.config.capability_mut::<MsixCapability>() {
            for vector in 0..self.nvectors {
                msix.vector_use(vector);
            }
        }
        for vector in 0..self.nvectors {
            self.host.enable_interrupt_vector(self.bdf, vector);
        }
        self.installed.record(Installed::VectorsInUse(self.nvectors));

        let mut pcie = PcieCapability::endpoint();
        if self.props.pcie_flr_init {
            pcie.enable_flr();
        }
        let offset = self.config.add_capability(Box::new(pcie))?;
        self.installed.record(Installed::Capability(offset));

        self.config
            .add_ext_capability(PF_ARI_OFFSET, Box::new(AriCapability::new(0)))?;
        self.installed.record(Installed::ExtCapability(PCI_EXT_CAP_ID_ARI));

        self.initialize_sriov(
            PF_SRIOV_OFFSET,
            VIRTIO_NET_VF_DEVICE_ID,
            VIRTIO_NET_SRIOV_TOTAL_VFS,
            VIRTIO_NET_SRIOV_INITIAL_VFS,
            VIRTIO_NET_SRIOV_VF_OFFSET,
            VIRTIO_NET_SRIOV_VF_STRIDE,
        )?;
        self.register_vf_bar_template(modern_bar, VF_BAR_FLAGS, MODERN_BAR_SIZE)?;
        self.register_vf_bar_template(msix_bar, VF_BAR_FLAGS, VF_MSIX_BAR_SIZE)?;
        Ok(())
    }

    fn install_bar(&mut self, bar: u8, name: &str, def: PciBarDefinition) -> Result<()> {
        self.config.set_bar_definition(bar, def);
        self.installed.record(Installed::Bar(bar));
        self.host
            .register_bar(self.bdf, bar, &MmioRegion::new(name, def.size()), def)?;
        Ok(())
    }

    /// Adds the SR-IOV extended capability. Allowed once, after the PF's BARs exist.
    pub fn initialize_sriov(
        &mut self,
        offset: u16,
        vf_device_id: u16,
        total_vfs: u16,
        initial_vfs: u16,
        first_vf_offset: u16,
        vf_stride: u16,
    ) -> Result<()> {
        if self.config.ext_capability::<SriovCapability>().is_some() {
            return Err(VirtioNetError::SriovAlreadyInitialized);
        }
        if self.config.bar_definition(self.props.modern_mem_bar).is_none() {
            return Err(VirtioNetError::NotRealized);
        }
        let sriov = SriovCapability::new(SriovParams {
            vf_device_id,
            total_vfs,
            initial_vfs,
            first_vf_offset,
            vf_stride,
        })?;
        self.config.add_ext_capability(offset, Box::new(sriov))?;
        self.installed.record(Installed::ExtCapability(PCI_EXT_CAP_ID_SRIOV));
        self.vfs = (0..total_vfs).map(|_| None).collect();
        tracing::debug!(rid = %self.bdf, offset, total_vfs, "SR-IOV capability installed");
        Ok(())
    }

    /// Declares the size and type of one BAR every VF will carry.
    pub fn register_vf_bar_template(
        &mut self,
        bar: u8,
        flags: PciBarFlags,
        size: u64,
    ) -> Result<()> {
        let sriov = self
            .config
            .ext_capability_mut::<SriovCapability>()
            .ok_or(VirtioNetError::SriovNotInitialized)?;
        let def = PciBarDefinition::from_flags(flags, size).ok_or(PciError::InvalidBar {
            bar,
            reason: "unsupported VF BAR type or size",
        })?;
        sriov.set_vf_bar(bar, def)?;
        Ok(())
    }

    pub fn attach(&mut self, device: Box<dyn VirtioDevice>) -> Option<Box<dyn VirtioDevice>> {
        tracing::debug!(
            rid = %self.bdf,
            device_type = device.device_type(),
            features = device.device_features(),
            queues = device.num_queues(),
            "device attached"
        );
        self.shared.borrow_mut().attach(device)
    }

    /// Attaches the virtio-net device described by the PF's properties.
    pub fn attach_default_device(&mut self) {
        let device = VirtioNet::new(self.props.mac, self.props.queues);
        self.attach(Box::new(device));
    }

    pub fn detach(&mut self) -> Option<Box<dyn VirtioDevice>> {
        self.shared.borrow_mut().detach()
    }

    pub fn take_notifications(&mut self) -> Vec<QueueNotification> {
        self.shared.borrow_mut().take_notifications()
    }

    pub fn sriov(&self) -> Option<&SriovCapability> {
        self.config.ext_capability::<SriovCapability>()
    }

    pub fn vf(&self, index: u16) -> Option<&VirtioNetVf> {
        self.vfs.get(usize::from(index))?.as_ref()
    }

    pub fn vf_mut(&mut self, index: u16) -> Option<&mut VirtioNetVf> {
        self.vfs.get_mut(usize::from(index))?.as_mut()
    }

    /// VFs currently reachable by the guest.
    pub fn active_vfs(&self) -> impl Iterator<Item = &VirtioNetVf> + '_ {
        self.vfs
            .iter()
            .flatten()
            .filter(|vf| vf.is_guest_visible())
    }

    /// Enables `num_vfs` VFs the way a driver would: program NumVFs, then set VF Enable. Any VFs
    /// already enabled are torn down first. Returns how many came up.
    pub fn enable_vfs(&mut self, num_vfs: u16) -> Result<u16> {
        if !self.realized {
            return Err(VirtioNetError::NotRealized);
        }
        self.vf_template()?;
        let sriov = self
            .config
            .ext_capability_mut::<SriovCapability>()
            .ok_or(VirtioNetError::SriovNotInitialized)?;
        if sriov.vf_enabled() {
            sriov.set_vf_enable(false);
            self.apply_sriov_change()?;
        }
        let sriov = self
            .config
            .ext_capability_mut::<SriovCapability>()
            .ok_or(VirtioNetError::SriovNotInitialized)?;
        sriov.set_num_vfs(num_vfs);
        sriov.set_vf_enable(true);
        self.apply_sriov_change()
    }

    pub fn disable_vfs(&mut self) -> Result<()> {
        let sriov = self
            .config
            .ext_capability_mut::<SriovCapability>()
            .ok_or(VirtioNetError::SriovNotInitialized)?;
        sriov.set_vf_enable(false);
        self.apply_sriov_change()?;
        Ok(())
    }

    fn apply_sriov_change(&mut self) -> Result<u16> {
        let change = self
            .config
            .ext_capability_mut::<SriovCapability>()
            .and_then(|sriov| sriov.take_pending_change());
        match change {
            Some(SriovControlChange::Enable { num_vfs }) => {
                let template = match self.vf_template() {
                    Ok(template) => template,
                    Err(err) => {
                        if let Some(sriov) = self.config.ext_capability_mut::<SriovCapability>() {
                            sriov.set_vf_enable(false);
                            sriov.take_pending_change();
                        }
                        return Err(err);
                    }
                };
                Ok(self.create_vfs(num_vfs, template))
            }
            Some(SriovControlChange::Disable) => {
                self.destroy_vfs();
                Ok(0)
            }
            None => Ok(0),
        }
    }

    fn vf_template(&self) -> Result<VfTemplate> {
        let sriov = self
            .config
            .ext_capability::<SriovCapability>()
            .ok_or(VirtioNetError::SriovNotInitialized)?;
        let modern_bar = self.props.modern_mem_bar;
        let msix_bar = self.props.msix_bar;
        let modern_bar_def = sriov
            .vf_bar_definition(modern_bar)
            .ok_or(VirtioNetError::MissingVfBarTemplate(modern_bar))?;
        let msix_bar_def = sriov
            .vf_bar_definition(msix_bar)
            .ok_or(VirtioNetError::MissingVfBarTemplate(msix_bar))?;
        let identity = self.config.vendor_device_id();
        Ok(VfTemplate {
            vendor_id: identity.vendor_id,
            device_id: sriov.params().vf_device_id,
            class: self.config.class_code(),
            subsystem: self.config.subsystem_ids(),
            nvectors: self.nvectors,
            flr: self.props.pcie_flr_init,
            modern_bar,
            modern_bar_def,
            msix_bar,
            msix_bar_def,
            caps: self.props.vf_capabilities,
        })
    }

    fn create_vfs(&mut self, num_vfs: u16, template: VfTemplate) -> u16 {
        let mut active = 0;
        for index in 0..num_vfs {
            let Some(rid) = self
                .sriov()
                .and_then(|sriov| sriov.vf_routing_id(self.bdf, index))
            else {
                continue;
            };
            let mut vf =
                VirtioNetVf::new(index, self.bdf, rid, template, Rc::downgrade(&self.shared));
            match vf.realize(&mut self.host) {
                Ok(()) => active += 1,
                Err(err) => tracing::warn!(vf = index, %rid, %err, "VF slot left disabled"),
            }
            if let Some(slot) = self.vfs.get_mut(usize::from(index)) {
                *slot = Some(vf);
            }
        }
        tracing::info!(rid = %self.bdf, requested = num_vfs, active, "VFs enabled");
        active
    }

    /// Tears every VF down, highest slot first.
    fn destroy_vfs(&mut self) {
        let mut destroyed = 0;
        for slot in self.vfs.iter_mut().rev() {
            if let Some(mut vf) = slot.take() {
                vf.teardown(&mut self.host);
                destroyed += 1;
            }
        }
        if destroyed != 0 {
            tracing::info!(rid = %self.bdf, destroyed, "VFs disabled");
        }
    }

    /// Signals a device configuration change on the PF and every active VF.
    pub fn notify_config_change(&mut self) {
        let vector = self.shared.borrow().msix_config();
        signal_config_change(
            self.bdf,
            &mut self.config,
            &mut self.isr,
            vector,
            &mut self.host,
        );
        for vf in self.vfs.iter_mut().flatten() {
            vf.notify_config_change(vector, &mut self.host);
        }
    }

    fn reset_function(&mut self) {
        self.destroy_vfs();
        if let Some(sriov) = self.config.ext_capability_mut::<SriovCapability>() {
            sriov.reset();
        }
        self.config.set_command(0);
        if let Some(msix) = self.config.capability_mut::<MsixCapability>() {
            msix.reset();
        }
        if let Some(pcie) = self.config.capability_mut::<PcieCapability>() {
            pcie.reset();
        }
        self.config.sync_capabilities();
        self.shared.borrow_mut().reset();
        self.isr.clear();
    }

    /// Device removal: VFs go first, then the device, then everything the PF installed in
    /// reverse order. Calling it again does nothing.
    pub fn teardown(&mut self) {
        self.destroy_vfs();
        self.vfs.clear();
        self.detach();
        self.installed
            .unwind(self.bdf, &mut self.config, &mut self.host);
        if self.realized {
            tracing::info!(rid = %self.bdf, "virtio-net-pci torn down");
        }
        self.realized = false;
    }

    pub(crate) fn guest_config_write(&mut self, offset: u16, size: usize, value: u32) {
        if !config_access_ok(offset, size) {
            return;
        }
        let effects = self.config.write_with_effects(offset, size, value);
        if effects.extended == Some(PCI_EXT_CAP_ID_SRIOV) {
            if let Err(err) = self.apply_sriov_change() {
                tracing::error!(rid = %self.bdf, %err, "VF enable rejected");
            }
        }
        if self.props.pcie_flr_init && flr_write_config(&mut self.config, offset, size) {
            tracing::debug!(rid = %self.bdf, "function level reset");
            self.reset_function();
        }
        deliver_pending_msix(self.bdf, &mut self.config, &mut self.host);
    }

    pub(crate) fn pf_parts(&mut self) -> PfParts<'_, H> {
        PfParts {
            rid: self.bdf,
            realized: self.realized,
            modern_bar: self.props.modern_mem_bar,
            msix_bar: self.props.msix_bar,
            config: &mut self.config,
            shared: &self.shared,
            isr: &mut self.isr,
            host: &mut self.host,
            vfs: &mut self.vfs,
        }
    }
}

/// Disjoint borrows of the PF's state for the MMIO dispatcher.
pub(crate) struct PfParts<'a, H> {
    pub rid: PciBdf,
    pub realized: bool,
    pub modern_bar: u8,
    pub msix_bar: u8,
    pub config: &'a mut PciConfigSpace,
    pub shared: &'a SharedRegistersHandle,
    pub isr: &'a mut IsrStatus,
    pub host: &'a mut H,
    pub vfs: &'a mut Vec<Option<VirtioNetVf>>,
}

impl<H: BusServices> PciDevice for VirtioNetPci<H> {
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
        self.guest_config_write(offset, size, value);
    }

    fn reset(&mut self) {
        tracing::debug!(rid = %self.bdf, "reset");
        self.reset_function();
    }
}

impl<H: BusServices> NetFunction for VirtioNetPci<H> {
    fn kind(&self) -> DeviceKind {
        let (total_vfs, num_vfs) = self
            .sriov()
            .map_or((0, 0), |sriov| (sriov.total_vfs(), sriov.num_vfs()));
        DeviceKind::Pf { total_vfs, num_vfs }
    }

    fn routing_id(&self) -> PciBdf {
        self.bdf
    }

    fn is_guest_visible(&self) -> bool {
        self.realized
    }
}
