use thiserror::Error;

/// Result type used by the PCI configuration-space model.
pub type Result<T> = std::result::Result<T, PciError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PciError {
    /// No free, dword-aligned range of the required length is left in the capability area.
    #[error("no room for capability {id:#06x} ({len} bytes) in configuration space")]
    ConfigSpaceExhausted { id: u16, len: usize },

    #[error("capability {id:#06x} at {offset:#x} overlaps an existing capability or header")]
    CapabilityOverlap { id: u16, offset: u16 },

    #[error("failed to initialize {name} capability: {reason}")]
    CapabilityInit { name: &'static str, reason: String },

    #[error("MSI-X vector initialization failed: {0}")]
    InterruptVectorInit(String),

    #[error("BAR{bar} registration failed: {reason}")]
    BarRegistration { bar: u8, reason: String },

    #[error("invalid BAR{bar}: {reason}")]
    InvalidBar { bar: u8, reason: &'static str },
}

impl PciError {
    pub(crate) fn capability_init(name: &'static str, reason: impl Into<String>) -> Self {
        Self::CapabilityInit {
            name,
            reason: reason.into(),
        }
    }
}
