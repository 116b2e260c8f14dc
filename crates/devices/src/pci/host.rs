//! The host side of a PCI function: BAR mapping and interrupt delivery.

use std::collections::{BTreeMap, BTreeSet};

use memory::MmioRegion;

use super::config::PciBarDefinition;
use super::error::{PciError, Result};
use super::msix::MsiMessage;
use super::PciBdf;

/// Services a PCI function consumes from the bus it sits on.
///
/// Devices never map memory or deliver interrupts themselves; they describe what they need and
/// the host wires it up. Every call is keyed by the requesting function's routing ID so SR-IOV
/// VFs and their PF can share one host.
pub trait BusServices {
    fn register_bar(
        &mut self,
        rid: PciBdf,
        bar: u8,
        region: &MmioRegion,
        def: PciBarDefinition,
    ) -> Result<()>;
    fn unregister_bar(&mut self, rid: PciBdf, bar: u8);

    fn allocate_interrupt_vectors(&mut self, rid: PciBdf, count: u16) -> Result<()>;
    fn release_interrupt_vectors(&mut self, rid: PciBdf);
    fn enable_interrupt_vector(&mut self, rid: PciBdf, vector: u16);
    fn disable_interrupt_vector(&mut self, rid: PciBdf, vector: u16);
    fn signal_vector(&mut self, rid: PciBdf, message: MsiMessage);

    /// Called when a function cannot come up because its configuration space is unusable.
    fn report_fatal_config_error(&mut self, rid: PciBdf, message: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredBar {
    pub name: String,
    pub size: u64,
    pub def: PciBarDefinition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorAllocation {
    pub count: u16,
    pub enabled: BTreeSet<u16>,
}

/// A [`BusServices`] implementation that records every request.
///
/// Used by tests and by hosts that poll for MSI messages instead of delivering them directly.
#[derive(Debug, Default)]
pub struct BusLog {
    bars: BTreeMap<(PciBdf, u8), RegisteredBar>,
    vectors: BTreeMap<PciBdf, VectorAllocation>,
    signalled: Vec<(PciBdf, MsiMessage)>,
    fatal_errors: Vec<(PciBdf, String)>,
    fail_vector_allocation: BTreeSet<PciBdf>,
    fail_bar_registration: BTreeSet<(PciBdf, u8)>,
}

impl BusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes vector allocation for `rid` fail, as a host out of interrupt resources would.
    pub fn fail_vector_allocation_for(&mut self, rid: PciBdf) {
        self.fail_vector_allocation.insert(rid);
    }

    pub fn fail_bar_registration_for(&mut self, rid: PciBdf, bar: u8) {
        self.fail_bar_registration.insert((rid, bar));
    }

    pub fn bar(&self, rid: PciBdf, bar: u8) -> Option<&RegisteredBar> {
        self.bars.get(&(rid, bar))
    }

    pub fn bar_count(&self, rid: PciBdf) -> usize {
        self.bars.keys().filter(|(owner, _)| *owner == rid).count()
    }

    pub fn vectors(&self, rid: PciBdf) -> Option<&VectorAllocation> {
        self.vectors.get(&rid)
    }

    /// Whether the host holds any BAR or vector on behalf of `rid`.
    pub fn holds_resources(&self, rid: PciBdf) -> bool {
        self.bar_count(rid) != 0 || self.vectors.contains_key(&rid)
    }

    pub fn signalled(&self) -> &[(PciBdf, MsiMessage)] {
        &self.signalled
    }

    pub fn take_signalled(&mut self) -> Vec<(PciBdf, MsiMessage)> {
        std::mem::take(&mut self.signalled)
    }

    pub fn fatal_errors(&self) -> &[(PciBdf, String)] {
        &self.fatal_errors
    }
}

impl BusServices for BusLog {
    fn register_bar(
        &mut self,
        rid: PciBdf,
        bar: u8,
        region: &MmioRegion,
        def: PciBarDefinition,
    ) -> Result<()> {
        if self.fail_bar_registration.contains(&(rid, bar)) {
            return Err(PciError::BarRegistration {
                bar,
                reason: format!("host refused {} for {rid}", region.name()),
            });
        }
        if self.bars.contains_key(&(rid, bar)) {
            return Err(PciError::BarRegistration {
                bar,
                reason: format!("already registered for {rid}"),
            });
        }
        self.bars.insert(
            (rid, bar),
            RegisteredBar {
                name: region.name().to_string(),
                size: region.size(),
                def,
            },
        );
        Ok(())
    }

    fn unregister_bar(&mut self, rid: PciBdf, bar: u8) {
        self.bars.remove(&(rid, bar));
    }

    fn allocate_interrupt_vectors(&mut self, rid: PciBdf, count: u16) -> Result<()> {
        if self.fail_vector_allocation.contains(&rid) {
            return Err(PciError::InterruptVectorInit(format!(
                "host has no room for {count} vectors for {rid}"
            )));
        }
        self.vectors.insert(
            rid,
            VectorAllocation {
                count,
                enabled: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn release_interrupt_vectors(&mut self, rid: PciBdf) {
        self.vectors.remove(&rid);
    }

    fn enable_interrupt_vector(&mut self, rid: PciBdf, vector: u16) {
        match self.vectors.get_mut(&rid) {
            Some(alloc) if vector < alloc.count => {
                alloc.enabled.insert(vector);
            }
            _ => tracing::warn!(%rid, vector, "enabling a vector that was never allocated"),
        }
    }

    fn disable_interrupt_vector(&mut self, rid: PciBdf, vector: u16) {
        if let Some(alloc) = self.vectors.get_mut(&rid) {
            alloc.enabled.remove(&vector);
        }
    }

    fn signal_vector(&mut self, rid: PciBdf, message: MsiMessage) {
        self.signalled.push((rid, message));
    }

    fn report_fatal_config_error(&mut self, rid: PciBdf, message: &str) {
        self.fatal_errors.push((rid, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar() -> PciBarDefinition {
        PciBarDefinition::Mmio64 {
            size: 0x4000,
            prefetchable: true,
        }
    }

    #[test]
    fn bars_are_keyed_by_function_and_index() {
        let mut log = BusLog::new();
        let region = MmioRegion::new("virtio-net-pci", 0x4000);
        let pf = PciBdf::new(0, 3, 0);
        let vf = PciBdf::new(0, 0x13, 0);

        log.register_bar(pf, 4, &region, bar()).unwrap();
        log.register_bar(vf, 4, &region, bar()).unwrap();
        assert!(matches!(
            log.register_bar(pf, 4, &region, bar()),
            Err(PciError::BarRegistration { bar: 4, .. })
        ));

        log.unregister_bar(vf, 4);
        assert_eq!(log.bar_count(vf), 0);
        assert_eq!(log.bar(pf, 4).unwrap().size, 0x4000);
    }

    #[test]
    fn vectors_outside_the_allocation_are_not_enabled() {
        let mut log = BusLog::new();
        let rid = PciBdf::new(0, 3, 0);
        log.allocate_interrupt_vectors(rid, 2).unwrap();
        log.enable_interrupt_vector(rid, 1);
        log.enable_interrupt_vector(rid, 2);
        assert_eq!(
            log.vectors(rid).unwrap().enabled.iter().copied().collect::<Vec<_>>(),
            vec![1]
        );

        log.release_interrupt_vectors(rid);
        assert!(!log.holds_resources(rid));
    }

    #[test]
    fn injected_failures() {
        let mut log = BusLog::new();
        let rid = PciBdf::new(0, 3, 0);
        log.fail_vector_allocation_for(rid);
        log.fail_bar_registration_for(rid, 1);

        assert!(matches!(
            log.allocate_interrupt_vectors(rid, 4),
            Err(PciError::InterruptVectorInit(_))
        ));
        let region = MmioRegion::new("virtio-net-msix", 0x4000);
        assert!(log.register_bar(rid, 1, &region, bar()).is_err());
        assert!(!log.holds_resources(rid));
    }
}
