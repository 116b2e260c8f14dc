pub mod net;

use core::any::Any;

/// The device half of a virtio function: identity, features and its configuration structure.
///
/// Queue processing lives with the backend; the PCI transport only needs what is reachable through
/// the modern BAR windows.
pub trait VirtioDevice {
    fn device_type(&self) -> u16;
    fn device_features(&self) -> u64;
    fn num_queues(&self) -> u16;

    /// Length of the device-specific configuration structure in bytes.
    fn config_len(&self) -> usize;
    fn read_config(&self, offset: u64, data: &mut [u8]);
    fn write_config(&mut self, offset: u64, data: &[u8]);

    fn reset(&mut self);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
