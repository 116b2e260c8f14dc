use thiserror::Error;
use vnet_devices::pci::PciError;

/// Result type for virtio-net PCI function lifecycle operations.
pub type Result<T> = std::result::Result<T, VirtioNetError>;

#[derive(Debug, Error)]
pub enum VirtioNetError {
    #[error(transparent)]
    Pci(#[from] PciError),

    #[error("SR-IOV capability is already initialized")]
    SriovAlreadyInitialized,

    #[error("SR-IOV capability has not been initialized")]
    SriovNotInitialized,

    #[error("no VF BAR template registered for BAR{0}")]
    MissingVfBarTemplate(u8),

    #[error("device is not realized")]
    NotRealized,

    #[error("device is already realized")]
    AlreadyRealized,

    #[error("invalid device properties: {0}")]
    InvalidProperties(String),

    #[error("failed to parse device properties")]
    PropertyParse(#[from] serde_json::Error),
}
