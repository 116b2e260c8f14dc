//! MMIO plumbing shared by the device models.

pub mod bus;

pub use bus::{all_ones, AccessWidth, MmioHandler, MmioRegion};
