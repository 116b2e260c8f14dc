use crate::devices::VirtioDevice;
use crate::pci::VIRTIO_F_VERSION_1;
use crate::props::MacAddress;

pub const VIRTIO_DEVICE_TYPE_NET: u16 = 1;

pub const VIRTIO_NET_F_MTU: u64 = 1 << 3;
pub const VIRTIO_NET_F_MAC: u64 = 1 << 5;
pub const VIRTIO_NET_F_STATUS: u64 = 1 << 16;
pub const VIRTIO_NET_F_CTRL_VQ: u64 = 1 << 17;
pub const VIRTIO_NET_F_MQ: u64 = 1 << 22;

pub const VIRTIO_NET_S_LINK_UP: u16 = 1;

pub const DEFAULT_MTU: u16 = 1500;

// struct virtio_net_config
const CFG_MAC: usize = 0;
const CFG_STATUS: usize = 6;
const CFG_MAX_VIRTQUEUE_PAIRS: usize = 8;
const CFG_MTU: usize = 10;
const CFG_LEN: usize = 12;

/// Configuration-only virtio-net device.
pub struct VirtioNet {
    mac: MacAddress,
    status: u16,
    max_queue_pairs: u16,
    mtu: u16,
}

impl VirtioNet {
    pub fn new(mac: MacAddress, max_queue_pairs: u16) -> Self {
        Self {
            mac,
            status: VIRTIO_NET_S_LINK_UP,
            max_queue_pairs: max_queue_pairs.max(1),
            mtu: DEFAULT_MTU,
        }
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn link_up(&self) -> bool {
        self.status & VIRTIO_NET_S_LINK_UP != 0
    }

    pub fn set_link_up(&mut self, up: bool) {
        if up {
            self.status |= VIRTIO_NET_S_LINK_UP;
        } else {
            self.status &= !VIRTIO_NET_S_LINK_UP;
        }
    }

    fn config_bytes(&self) -> [u8; CFG_LEN] {
        let mut cfg = [0u8; CFG_LEN];
        cfg[CFG_MAC..CFG_MAC + 6].copy_from_slice(&self.mac.0);
        cfg[CFG_STATUS..CFG_STATUS + 2].copy_from_slice(&self.status.to_le_bytes());
        cfg[CFG_MAX_VIRTQUEUE_PAIRS..CFG_MAX_VIRTQUEUE_PAIRS + 2]
            .copy_from_slice(&self.max_queue_pairs.to_le_bytes());
        cfg[CFG_MTU..CFG_MTU + 2].copy_from_slice(&self.mtu.to_le_bytes());
        cfg
    }
}

impl VirtioDevice for VirtioNet {
    fn device_type(&self) -> u16 {
        VIRTIO_DEVICE_TYPE_NET
    }

    fn device_features(&self) -> u64 {
        let mut features = VIRTIO_F_VERSION_1
            | VIRTIO_NET_F_MAC
            | VIRTIO_NET_F_STATUS
            | VIRTIO_NET_F_MTU
            | VIRTIO_NET_F_CTRL_VQ;
        if self.max_queue_pairs > 1 {
            features |= VIRTIO_NET_F_MQ;
        }
        features
    }

    /// RX/TX per pair plus the control queue.
    fn num_queues(&self) -> u16 {
        self.max_queue_pairs.saturating_mul(2).saturating_add(1)
    }

    fn config_len(&self) -> usize {
        CFG_LEN
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        let cfg = self.config_bytes();
        let start = offset as usize;
        if start < cfg.len() {
            let end = (start + data.len()).min(cfg.len());
            data[..end - start].copy_from_slice(&cfg[start..end]);
        }
    }

    // The MAC is read-only once VIRTIO_F_VERSION_1 is offered.
    fn write_config(&mut self, _offset: u64, _data: &[u8]) {}

    fn reset(&mut self) {}

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn core::any::Any {
        self
    }
}
