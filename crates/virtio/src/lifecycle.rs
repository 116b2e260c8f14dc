//! Ordered record of what a function installed, so failures and teardown unwind in reverse.

use vnet_devices::pci::{BusServices, MsixCapability, PciBdf, PciConfigSpace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// A BAR registered with the host.
    Bar(u8),
    /// A standard capability at the given offset.
    Capability(u8),
    /// An extended capability with the given ID.
    ExtCapability(u16),
    /// Interrupt vectors allocated by the host.
    HostVectors,
    /// Vectors `0..count` marked in use and enabled on the host.
    VectorsInUse(u16),
}

#[derive(Debug, Default, Clone)]
pub struct InstallLog {
    entries: Vec<Installed>,
}

impl InstallLog {
    pub fn record(&mut self, entry: Installed) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Installed] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases everything recorded, newest first. Running it again is a no-op.
    pub fn unwind(
        &mut self,
        rid: PciBdf,
        config: &mut PciConfigSpace,
        host: &mut dyn BusServices,
    ) {
        while let Some(entry) = self.entries.pop() {
            tracing::trace!(%rid, ?entry, "unwinding");
            match entry {
                Installed::Bar(bar) => {
                    host.unregister_bar(rid, bar);
                    if config.bar_definition(bar).is_some() {
                        config.clear_bar_definition(bar);
                    }
                }
                Installed::Capability(offset) => {
                    config.remove_capability(offset);
                }
                Installed::ExtCapability(id) => {
                    config.remove_ext_capability(id);
                }
                Installed::HostVectors => host.release_interrupt_vectors(rid),
                Installed::VectorsInUse(count) => {
                    for vector in 0..count {
                        host.disable_interrupt_vector(rid, vector);
                    }
                    if let Some(msix) = config.capability_mut::<MsixCapability>() {
                        msix.unuse_all_vectors();
                    }
                }
            }
        }
    }
}
