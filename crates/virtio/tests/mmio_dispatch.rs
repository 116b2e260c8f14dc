use memory::MmioHandler;
use proptest::prelude::*;
use vnet_devices::pci::{BusLog, MsiMessage, PciBdf};
use vnet_virtio::devices::net::VirtioNet;
use vnet_virtio::devices::VirtioDevice;
use vnet_virtio::transport::{
    VIRTIO_MSI_NO_VECTOR, VIRTIO_PCI_COMMON_DF, VIRTIO_PCI_COMMON_MSIX, VIRTIO_PCI_COMMON_NUMQ,
    VIRTIO_PCI_ISR_CONFIG,
};
use vnet_virtio::{FunctionId, MacAddress, VirtioNetPci, VirtioNetPciProps};

const PF: PciBdf = PciBdf::new(0, 3, 0);
const MODERN: u8 = 4;
const MSIX: u8 = 1;

fn with_vfs(num_vfs: u16) -> VirtioNetPci<BusLog> {
    let mut pci = VirtioNetPci::new(PF, VirtioNetPciProps::default(), BusLog::new()).unwrap();
    pci.realize().unwrap();
    assert_eq!(pci.enable_vfs(num_vfs).unwrap(), num_vfs);
    pci
}

#[test]
fn vf_reads_all_ones_until_a_device_is_attached() {
    let mut pci = with_vfs(1);
    let vf = FunctionId::Vf(0);
    for offset in [0x0, 0x1000, 0x2000] {
        assert_eq!(pci.mmio_read(vf, MODERN, offset, 4), 0xffff_ffff);
    }
    assert_eq!(pci.mmio_read(vf, MODERN, 0x2000, 1), 0xff);

    // Dropped: nothing is attached to take it.
    pci.mmio_write(vf, MODERN, VIRTIO_PCI_COMMON_MSIX, 2, 3);

    pci.attach_default_device();
    assert_eq!(
        pci.mmio_read(vf, MODERN, VIRTIO_PCI_COMMON_MSIX, 2),
        u64::from(VIRTIO_MSI_NO_VECTOR)
    );
}

#[test]
fn device_window_exposes_the_mac() {
    let props = VirtioNetPciProps::from_json(r#"{ "mac": "02:00:00:aa:bb:cc" }"#).unwrap();
    let mut pci = VirtioNetPci::new(PF, props, BusLog::new()).unwrap();
    pci.realize().unwrap();
    pci.enable_vfs(2).unwrap();
    pci.attach_default_device();

    for function in [FunctionId::Pf, FunctionId::Vf(0), FunctionId::Vf(1)] {
        assert_eq!(pci.mmio_read(function, MODERN, 0x2000, 4), 0xaa00_0002);
        assert_eq!(pci.mmio_read(function, MODERN, 0x2004, 2), 0xccbb);
    }

    // Past the end of the 12-byte virtio-net structure.
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, 0x2010, 4), 0xffff_ffff);

    let mac: MacAddress = "02:00:00:aa:bb:cc".parse().unwrap();
    assert_eq!(
        pci.shared().borrow().device::<VirtioNet>().unwrap().mac(),
        mac
    );
}

#[test]
fn vf_writes_alias_the_pf_registers() {
    let mut pci = with_vfs(2);
    pci.attach_default_device();

    pci.mmio_write(FunctionId::Vf(1), MODERN, VIRTIO_PCI_COMMON_MSIX, 2, 5);
    assert_eq!(pci.shared().borrow().msix_config(), 5);
    assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, VIRTIO_PCI_COMMON_MSIX, 2), 5);
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, VIRTIO_PCI_COMMON_MSIX, 2), 5);
}

#[test]
fn isr_is_private_and_clears_on_read() {
    let mut pci = with_vfs(2);
    pci.attach_default_device();
    pci.notify_config_change();

    let isr = u64::from(VIRTIO_PCI_ISR_CONFIG);
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, 0x1000, 1), isr);
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, 0x1000, 1), 0);

    // Neither the sibling nor the PF saw VF0's read.
    assert_eq!(pci.vf(1).unwrap().isr().peek(), VIRTIO_PCI_ISR_CONFIG);
    assert_eq!(pci.isr().peek(), VIRTIO_PCI_ISR_CONFIG);
    assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, 0x1000, 1), isr);
    assert_eq!(pci.isr().peek(), 0);
}

#[test]
fn unsupported_widths_and_misaligned_accesses_read_zero() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();
    let vf = FunctionId::Vf(0);

    assert_eq!(pci.mmio_read(vf, MODERN, 0, 8), 0);
    assert_eq!(pci.mmio_read(vf, MODERN, 0, 3), 0);
    assert_eq!(pci.mmio_read(vf, MODERN, 0x2001, 2), 0);
    assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, 0x12, 8), 0);

    pci.mmio_write(vf, MODERN, VIRTIO_PCI_COMMON_MSIX, 8, 1);
    assert_eq!(pci.shared().borrow().msix_config(), VIRTIO_MSI_NO_VECTOR);
}

#[test]
fn disabled_and_unknown_functions_read_all_ones() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();

    assert_eq!(pci.mmio_read(FunctionId::Vf(5), MODERN, 0, 4), 0xffff_ffff);
    assert_eq!(pci.mmio_read(FunctionId::Vf(100), MODERN, 0, 2), 0xffff);
    assert_eq!(pci.function_config_read(FunctionId::Vf(5), 0, 4), 0xffff_ffff);
    // A BAR the function does not implement.
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), 2, 0, 4), 0xffff_ffff);

    pci.disable_vfs().unwrap();
    assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, 0, 4), 0xffff_ffff);
}

#[test]
fn detaching_the_device_blanks_every_window() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();
    pci.notify_config_change();
    assert!(pci.detach().is_some());

    for offset in [0x0, 0x1000, 0x2000, 0x3000] {
        assert_eq!(pci.mmio_read(FunctionId::Vf(0), MODERN, offset, 4), 0xffff_ffff);
        assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, offset, 4), 0xffff_ffff);
    }
}

#[test]
fn notify_writes_are_recorded_per_function() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();

    pci.mmio_write(FunctionId::Vf(0), MODERN, 0x3000 + 4, 2, 1);
    pci.mmio_write(FunctionId::Pf, MODERN, 0x3000, 2, 0);
    // Queue 40 does not exist on a single-pair device.
    pci.mmio_write(FunctionId::Pf, MODERN, 0x3000 + 40 * 4, 2, 40);
    assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, 0x3000, 4), 0);

    let notified: Vec<(PciBdf, u16)> = pci
        .take_notifications()
        .into_iter()
        .map(|n| (n.rid, n.queue))
        .collect();
    assert_eq!(notified, vec![(PciBdf::new(0, 0x13, 0), 1), (PF, 0)]);
}

#[test]
fn vf_msix_delivers_config_change_through_its_own_table() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();
    let vf = FunctionId::Vf(0);
    let rid = PciBdf::new(0, 0x13, 0);

    // Table entry 0: address, data, unmasked.
    pci.mmio_write(vf, MSIX, 0x0, 4, 0xfee0_0000);
    pci.mmio_write(vf, MSIX, 0x4, 4, 0);
    pci.mmio_write(vf, MSIX, 0x8, 4, 0x41);
    pci.mmio_write(vf, MSIX, 0xc, 4, 0);
    assert_eq!(pci.mmio_read(vf, MSIX, 0x8, 4), 0x41);

    pci.function_config_write(vf, 0x86, 2, 0x8000); // MSI-X Enable
    pci.mmio_write(vf, MODERN, VIRTIO_PCI_COMMON_MSIX, 2, 0);

    pci.notify_config_change();
    assert_eq!(
        pci.host_mut().take_signalled(),
        vec![(
            rid,
            MsiMessage {
                address: 0xfee0_0000,
                data: 0x41
            }
        )]
    );
}

#[test]
fn masked_vector_is_delivered_once_unmasked() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();
    let vf = FunctionId::Vf(0);

    pci.mmio_write(vf, MSIX, 0x0, 4, 0xfee0_0000);
    pci.mmio_write(vf, MSIX, 0x8, 4, 0x22);
    pci.function_config_write(vf, 0x86, 2, 0x8000);
    pci.mmio_write(vf, MODERN, VIRTIO_PCI_COMMON_MSIX, 2, 0);

    pci.notify_config_change();
    assert!(pci.host().signalled().is_empty());
    // PBA bit 0.
    assert_eq!(pci.mmio_read(vf, MSIX, 0x2000, 4), 1);

    pci.mmio_write(vf, MSIX, 0xc, 4, 0);
    assert_eq!(pci.host().signalled().len(), 1);
    assert_eq!(pci.mmio_read(vf, MSIX, 0x2000, 4), 0);
}

#[test]
fn msix_accesses_at_the_top_of_the_bar_are_ignored() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();
    let top = 0xffff_ffff_ffff_fffc;

    for function in [FunctionId::Pf, FunctionId::Vf(0)] {
        pci.mmio_write(function, MSIX, 0x8, 4, 0x41);
        assert_eq!(pci.mmio_read(function, MSIX, top, 4), 0);
        assert_eq!(pci.mmio_read(function, MSIX, top + 2, 2), 0);
        pci.mmio_write(function, MSIX, top, 4, 0xdead_beef);
        assert_eq!(pci.mmio_read(function, MSIX, 0x8, 4), 0x41);
    }
}

#[test]
fn queue_count_and_features_follow_the_attached_device() {
    let mut pci = with_vfs(1);
    assert_eq!(pci.shared().borrow().num_queues(), 3);

    let net = VirtioNet::new(MacAddress::DEFAULT, 4);
    let features = net.device_features();
    pci.attach(Box::new(net));

    for function in [FunctionId::Pf, FunctionId::Vf(0)] {
        assert_eq!(pci.mmio_read(function, MODERN, VIRTIO_PCI_COMMON_NUMQ, 2), 9);
        assert_eq!(
            pci.mmio_read(function, MODERN, VIRTIO_PCI_COMMON_DF, 4),
            features & 0xffff_ffff
        );
    }

    // The last queue of the four-pair device is the control queue.
    pci.mmio_write(FunctionId::Vf(0), MODERN, 0x3000 + 8 * 4, 2, 8);
    let queues: Vec<u16> = pci.take_notifications().into_iter().map(|n| n.queue).collect();
    assert_eq!(queues, vec![8]);
}

#[test]
fn bar_handle_routes_like_the_dispatcher() {
    let mut pci = with_vfs(1);
    pci.attach_default_device();

    let mut bar = pci.bar_handle(FunctionId::Vf(0), MODERN);
    bar.write(VIRTIO_PCI_COMMON_MSIX, 2, 7);
    assert_eq!(bar.read(VIRTIO_PCI_COMMON_MSIX, 2), 7);
    assert_eq!(bar.read(0, 8), 0);
    assert_eq!(pci.shared().borrow().msix_config(), 7);
}

proptest! {
    #[test]
    fn common_round_trips_at_every_width(
        vf in 0u16..4,
        width in prop::sample::select(vec![1usize, 2, 4]),
        slot in 0u64..0x1000,
        value in any::<u32>(),
    ) {
        let mut pci = with_vfs(4);
        pci.attach_default_device();
        let offset = (slot * width as u64) % 0x1000;
        let value = u64::from(value) & (u64::MAX >> (64 - 8 * width));

        pci.mmio_write(FunctionId::Vf(vf), MODERN, offset, width, value);
        prop_assert_eq!(pci.mmio_read(FunctionId::Pf, MODERN, offset, width), value);
        for other in 0..4 {
            prop_assert_eq!(pci.mmio_read(FunctionId::Vf(other), MODERN, offset, width), value);
        }
    }
}
