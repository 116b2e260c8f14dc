use vnet_devices::pci::capabilities::{PCI_EXT_CAP_ID_ARI, PCI_EXT_CAP_ID_ERR};
use vnet_devices::pci::{BusLog, PciBdf, PciDevice, PciError};
use vnet_virtio::lifecycle::Installed;
use vnet_virtio::{
    FunctionId, NetFunction, VfCapabilityProps, VfState, VirtioNetError, VirtioNetPci,
    VirtioNetPciProps,
};

const PF: PciBdf = PciBdf::new(0, 3, 0);

fn realized(props: VirtioNetPciProps, host: BusLog) -> VirtioNetPci<BusLog> {
    let mut pci = VirtioNetPci::new(PF, props, host).unwrap();
    pci.realize().unwrap();
    pci
}

fn vf_rid(index: u16) -> PciBdf {
    PF.offset_by(0x80 + index * 2).unwrap()
}

#[test]
fn aer_failure_rolls_back_every_vf() {
    let props = VirtioNetPciProps {
        vf_capabilities: VfCapabilityProps {
            aer_log_max: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut pci = realized(props, BusLog::new());
    pci.attach_default_device();

    assert_eq!(pci.enable_vfs(2).unwrap(), 0);
    assert_eq!(pci.active_vfs().count(), 0);

    for index in 0..2 {
        let vf = pci.vf(index).expect("slot stays reserved");
        assert_eq!(vf.state(), VfState::Destroyed);
        assert!(vf.installed().is_empty());
        assert!(!vf.is_guest_visible());
        assert!(!pci.host().holds_resources(vf_rid(index)));

        let function = FunctionId::Vf(index);
        assert_eq!(pci.function_config_read(function, 0, 4), 0xffff_ffff);
        assert_eq!(pci.mmio_read(function, 4, 0x2000, 4), 0xffff_ffff);
    }

    let fatal: Vec<PciBdf> = pci.host().fatal_errors().iter().map(|(rid, _)| *rid).collect();
    assert_eq!(fatal, vec![vf_rid(0), vf_rid(1)]);

    // The PF is unaffected.
    assert!(pci.is_realized());
    assert_eq!(pci.function_config_read(FunctionId::Pf, 0, 4), 0x1041_1af4);
    assert_eq!(pci.mmio_read(FunctionId::Pf, 4, 0x2000, 1), 0x52);

    // Disabling clears the reserved slots.
    pci.disable_vfs().unwrap();
    assert!(pci.vf(0).is_none());
}

#[test]
fn vector_failure_only_takes_down_that_vf() {
    let mut host = BusLog::new();
    host.fail_vector_allocation_for(vf_rid(1));
    let mut pci = realized(VirtioNetPciProps::default(), host);

    assert_eq!(pci.enable_vfs(3).unwrap(), 2);
    assert_eq!(pci.vf(0).unwrap().state(), VfState::Active);
    assert_eq!(pci.vf(1).unwrap().state(), VfState::Destroyed);
    assert_eq!(pci.vf(2).unwrap().state(), VfState::Active);

    assert!(!pci.host().holds_resources(vf_rid(1)));
    assert_eq!(pci.host().bar_count(vf_rid(2)), 2);

    let (rid, message) = &pci.host().fatal_errors()[0];
    assert_eq!(*rid, vf_rid(1));
    assert!(message.contains("vectors"), "{message}");
}

#[test]
fn oversized_vector_table_overlaps_the_vf_pba() {
    let props = VirtioNetPciProps {
        vectors: Some(513),
        ..Default::default()
    };
    let mut pci = realized(props, BusLog::new());

    assert_eq!(pci.enable_vfs(1).unwrap(), 0);
    let vf = pci.vf(0).unwrap();
    assert_eq!(vf.state(), VfState::Destroyed);
    assert_eq!(pci.host().bar_count(vf_rid(0)), 0);
    assert!(pci.host().fatal_errors()[0].1.contains("overlaps"));
}

#[test]
fn direct_realize_reports_the_failure() {
    let mut host = BusLog::new();
    host.fail_bar_registration_for(vf_rid(0), 1);
    let mut pci = realized(VirtioNetPciProps::default(), host);

    assert_eq!(pci.enable_vfs(1).unwrap(), 0);
    // Only the modern BAR got through before the failure, and it is gone again.
    assert_eq!(pci.host().bar_count(vf_rid(0)), 0);

    let vf = pci.vf_mut(0).unwrap();
    assert!(matches!(
        vf.realize(&mut BusLog::new()),
        Err(VirtioNetError::AlreadyRealized)
    ));
}

#[test]
fn misplaced_pcie_capability_is_not_fatal() {
    let props = VirtioNetPciProps {
        vf_capabilities: VfCapabilityProps {
            pcie_offset: 0x70,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut pci = realized(props, BusLog::new());

    assert_eq!(pci.enable_vfs(1).unwrap(), 1);
    let vf = pci.vf_mut(0).unwrap();
    assert_eq!(vf.state(), VfState::Active);
    assert_eq!(vf.config_mut().find_capability(0x10), None);
    assert!(pci.host().fatal_errors().is_empty());
}

#[test]
fn teardown_releases_in_reverse_install_order() {
    let mut pci = realized(VirtioNetPciProps::default(), BusLog::new());
    pci.enable_vfs(1).unwrap();

    let installed = pci.vf(0).unwrap().installed().to_vec();
    assert_eq!(installed.first(), Some(&Installed::Bar(4)));
    assert_eq!(installed.get(1), Some(&Installed::Bar(1)));
    assert!(installed.contains(&Installed::HostVectors));
    assert_eq!(
        installed.last(),
        Some(&Installed::VectorsInUse(pci.nvectors()))
    );
    let position = |id| installed.iter().position(|i| *i == Installed::ExtCapability(id));
    assert!(position(PCI_EXT_CAP_ID_ARI) < position(PCI_EXT_CAP_ID_ERR));
    assert!(position(PCI_EXT_CAP_ID_ARI).is_some());

    // The chain still starts with AER at 0x100 and links on to ARI.
    let vf = FunctionId::Vf(0);
    assert_eq!(pci.function_config_read(vf, 0x100, 4), 0x1601_0001);
    assert_eq!(pci.function_config_read(vf, 0x160, 4), 0x0001_000e);

    pci.disable_vfs().unwrap();
    assert!(!pci.host().holds_resources(vf_rid(0)));
    assert!(pci.host().fatal_errors().is_empty());
}

#[test]
fn vf_error_type_wraps_the_pci_error() {
    let err: VirtioNetError = PciError::InterruptVectorInit("no room".to_string()).into();
    assert!(err.to_string().contains("no room"));
}
