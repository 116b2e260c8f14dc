//! SR-IOV capable virtio-net PCI Express device model.
//!
//! [`VirtioNetPci`] is the physical function. Realizing it builds the capability chain (virtio
//! vendor capabilities, MSI-X, PCI Express, ARI and SR-IOV); enabling VFs through the SR-IOV
//! capability creates [`VirtioNetVf`]s that alias the PF's virtio registers. Guest traffic enters
//! through [`VirtioNetPci::function_config_read`] and friends, or through [`BarHandle`].
#![forbid(unsafe_code)]

pub mod devices;
pub mod error;
pub mod function;
pub mod layout;
pub mod lifecycle;
pub mod mmio;
pub mod net_pci;
pub mod pci;
pub mod props;
pub mod transport;
pub mod vf;

pub use error::{Result, VirtioNetError};
pub use function::{DeviceKind, FunctionId, NetFunction};
pub use mmio::BarHandle;
pub use net_pci::VirtioNetPci;
pub use props::{MacAddress, VfCapabilityProps, VirtioNetPciProps};
pub use vf::{VfState, VirtioNetVf};
