use vnet_devices::pci::capabilities::{PCI_EXT_CAP_ID_ARI, PCI_EXT_CAP_ID_SRIOV};
use vnet_devices::pci::{BusLog, PciBarDefinition, PciBdf, PciDevice, PciError};
use vnet_virtio::net_pci::{PF_SRIOV_OFFSET, VF_BAR_FLAGS};
use vnet_virtio::{
    DeviceKind, FunctionId, NetFunction, VirtioNetError, VirtioNetPci, VirtioNetPciProps,
};

const PF: PciBdf = PciBdf::new(0, 3, 0);

fn pf_with(props: VirtioNetPciProps) -> VirtioNetPci<BusLog> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    VirtioNetPci::new(PF, props, BusLog::new()).unwrap()
}

fn read(pci: &mut VirtioNetPci<BusLog>, offset: u16, size: usize) -> u32 {
    pci.function_config_read(FunctionId::Pf, offset, size)
}

#[test]
fn four_queue_pairs_allocate_ten_vectors() {
    let mut pci = pf_with(VirtioNetPciProps {
        queues: 4,
        ..Default::default()
    });
    assert_eq!(pci.nvectors(), 10);
    pci.realize().unwrap();

    let alloc = pci.host().vectors(PF).unwrap();
    assert_eq!(alloc.count, 10);
    assert_eq!(alloc.enabled.len(), 10);

    // Message control reports table size - 1.
    assert_eq!(read(&mut pci, 0x86, 2) & 0x07ff, 9);
}

#[test]
fn identity_and_bars() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();

    assert_eq!(read(&mut pci, 0x00, 4), 0x1041_1af4);
    assert_eq!(read(&mut pci, 0x08, 1), 1);
    assert_eq!(read(&mut pci, 0x0b, 1), 0x02);
    assert_eq!(read(&mut pci, 0x2c, 4), 0x0001_1af4);
    assert_eq!(read(&mut pci, 0x3d, 1), 1);

    let modern = pci.host().bar(PF, 4).unwrap();
    assert_eq!(
        modern.def,
        PciBarDefinition::Mmio64 {
            size: 0x4000,
            prefetchable: true
        }
    );
    let msix = pci.host().bar(PF, 1).unwrap();
    assert_eq!(
        msix.def,
        PciBarDefinition::Mmio32 {
            size: 0x1000,
            prefetchable: false
        }
    );
}

#[test]
fn capability_chain_layout() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();

    assert_eq!(read(&mut pci, 0x34, 1), 0x40);
    let chain: Vec<(u8, u8)> = pci
        .config_mut()
        .capability_list()
        .iter()
        .map(|cap| (cap.id, cap.offset))
        .collect();
    assert_eq!(
        chain,
        vec![
            (0x09, 0x40),
            (0x09, 0x50),
            (0x09, 0x60),
            (0x09, 0x70),
            (0x11, 0x84),
            (0x10, 0x90),
        ]
    );

    // cfg_type of each virtio capability, in chain order.
    assert_eq!(read(&mut pci, 0x43, 1), 1);
    assert_eq!(read(&mut pci, 0x53, 1), 3);
    assert_eq!(read(&mut pci, 0x63, 1), 4);
    assert_eq!(read(&mut pci, 0x73, 1), 2);
    assert_eq!(read(&mut pci, 0x72, 1), 20);
    assert_eq!(read(&mut pci, 0x80, 4), 4);

    assert_eq!(read(&mut pci, 0x100, 4), 0x1601_000e);
    assert_eq!(read(&mut pci, PF_SRIOV_OFFSET, 4), 0x0001_0010);
}

#[test]
fn sriov_capability_defaults() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();

    assert_eq!(read(&mut pci, 0x16c, 2), 8); // InitialVFs
    assert_eq!(read(&mut pci, 0x16e, 2), 8); // TotalVFs
    assert_eq!(read(&mut pci, 0x170, 2), 0); // NumVFs
    assert_eq!(read(&mut pci, 0x174, 2), 0x80);
    assert_eq!(read(&mut pci, 0x176, 2), 2);
    assert_eq!(read(&mut pci, 0x17a, 2), 0x1041);

    let sriov = pci.sriov().unwrap();
    assert_eq!(sriov.vf_bar_definition(4).unwrap().size(), 0x4000);
    assert_eq!(sriov.vf_bar_definition(1).unwrap().size(), 0x4000);
    assert!(sriov.vf_bar_definition(4).unwrap().is_64bit());

    assert_eq!(
        pci.kind(),
        DeviceKind::Pf {
            total_vfs: 8,
            num_vfs: 0
        }
    );
}

#[test]
fn vector_allocation_failure_unwinds_everything() {
    let mut host = BusLog::new();
    host.fail_vector_allocation_for(PF);
    let mut pci = VirtioNetPci::new(PF, VirtioNetPciProps::default(), host).unwrap();

    let err = pci.realize().unwrap_err();
    assert!(matches!(
        err,
        VirtioNetError::Pci(PciError::InterruptVectorInit(_))
    ));
    assert!(!pci.is_realized());
    assert!(!pci.is_guest_visible());
    assert!(!pci.host().holds_resources(PF));
    assert_eq!(pci.host().fatal_errors().len(), 1);
    assert_eq!(pci.host().fatal_errors()[0].0, PF);
    assert!(pci.installed().is_empty());
    assert!(pci.config_mut().capability_list().is_empty());
    assert_eq!(pci.config().find_ext_capability(PCI_EXT_CAP_ID_ARI), None);
    assert!(pci.config().bar_definition(4).is_none());
}

#[test]
fn bar_registration_failure_unwinds_the_first_bar() {
    let mut host = BusLog::new();
    host.fail_bar_registration_for(PF, 1);
    let mut pci = VirtioNetPci::new(PF, VirtioNetPciProps::default(), host).unwrap();

    assert!(matches!(
        pci.realize(),
        Err(VirtioNetError::Pci(PciError::BarRegistration { bar: 1, .. }))
    ));
    assert_eq!(pci.host().bar_count(PF), 0);
    assert!(pci.config().bar_definition(4).is_none());
    assert!(pci.config().bar_definition(1).is_none());
}

#[test]
fn realize_twice_is_rejected() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();
    assert!(matches!(
        pci.realize(),
        Err(VirtioNetError::AlreadyRealized)
    ));
}

#[test]
fn sriov_initializes_once_after_bars() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    assert!(matches!(
        pci.initialize_sriov(0x200, 0x1041, 4, 4, 0x80, 2),
        Err(VirtioNetError::NotRealized)
    ));
    assert!(matches!(
        pci.register_vf_bar_template(4, VF_BAR_FLAGS, 0x4000),
        Err(VirtioNetError::SriovNotInitialized)
    ));

    pci.realize().unwrap();
    assert!(matches!(
        pci.initialize_sriov(0x200, 0x1041, 4, 4, 0x80, 2),
        Err(VirtioNetError::SriovAlreadyInitialized)
    ));
    assert_eq!(
        pci.config().find_ext_capability(PCI_EXT_CAP_ID_SRIOV),
        Some(PF_SRIOV_OFFSET)
    );
}

#[test]
fn teardown_is_idempotent() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();
    pci.attach_default_device();
    assert_eq!(pci.enable_vfs(2).unwrap(), 2);

    pci.teardown();
    assert!(!pci.is_realized());
    assert!(!pci.shared().borrow().is_attached());
    assert!(!pci.host().holds_resources(PF));
    assert!(!pci.host().holds_resources(PciBdf::new(0, 0x13, 0)));
    assert!(!pci.host().holds_resources(PciBdf::new(0, 0x13, 2)));
    assert!(pci.vf(0).is_none());

    pci.teardown();
    assert!(pci.installed().is_empty());
    assert!(pci.host().fatal_errors().is_empty());
}

#[test]
fn explicit_vector_count_and_custom_bars() {
    let props = VirtioNetPciProps::from_json(
        r#"{ "vectors": 3, "modern-mem-bar": 2, "msix-bar": 0 }"#,
    )
    .unwrap();
    let mut pci = pf_with(props);
    pci.realize().unwrap();

    assert_eq!(pci.host().vectors(PF).unwrap().count, 3);
    assert!(pci.host().bar(PF, 2).is_some());
    assert!(pci.host().bar(PF, 0).is_some());
    // The common capability points at the modern BAR.
    assert_eq!(read(&mut pci, 0x44, 1), 2);
}

#[test]
fn config_reads_outside_the_space_read_all_ones() {
    let mut pci = pf_with(VirtioNetPciProps::default());
    pci.realize().unwrap();
    pci.enable_vfs(1).unwrap();

    assert_eq!(pci.config_read(0x1000, 4), 0xffff_ffff);
    assert_eq!(pci.config_read(0xffe, 4), 0xffff_ffff);
    assert_eq!(pci.config_read(0x02, 4), 0xffff_ffff);
    assert_eq!(pci.config_read(0, 8), 0xffff_ffff);
    assert_eq!(pci.config_read(0, 4), 0x1041_1af4);

    let vf = pci.vf_mut(0).unwrap();
    assert_eq!(vf.config_read(0x1000, 4), 0xffff_ffff);
    assert_eq!(vf.config_read(0xfff, 2), 0xffff);
    assert_eq!(vf.config_read(0x01, 2), 0xffff);
    assert_eq!(vf.config_read(0, 4), 0x1041_1af4);
}
