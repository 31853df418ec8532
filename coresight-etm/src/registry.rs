//! Ownership container for the up-to-four tracked ETM instances.
//!
//! The pools live inside each [`Etm`], so the registry carries no allocator
//! state of its own; it only answers "which instance owns this register
//! window" and hands out mutable access per slot.

use crate::error::EtmError;
use crate::etm::{Etm, MAX_INSTANCES};
use crate::memory::EtmMemory;

/// Slot-per-instance registry, indexed by the instance's core index.
pub struct EtmRegistry<M: EtmMemory> {
    slots: [Option<Etm<M>>; MAX_INSTANCES as usize],
}

impl<M: EtmMemory> EtmRegistry<M> {
    /// An empty registry.
    pub fn new() -> Self {
        EtmRegistry {
            slots: [None, None, None, None],
        }
    }

    /// Store `etm` in the slot matching its instance index.
    pub fn register(&mut self, etm: Etm<M>) -> Result<(), EtmError> {
        let index = etm.index();
        let slot = &mut self.slots[index as usize];
        if slot.is_some() {
            return Err(EtmError::SlotOccupied(index));
        }
        *slot = Some(etm);
        Ok(())
    }

    /// The instance at `index`, if registered.
    pub fn get(&self, index: u8) -> Option<&Etm<M>> {
        self.slots.get(index as usize)?.as_ref()
    }

    /// Mutable access to the instance at `index`, if registered.
    pub fn get_mut(&mut self, index: u8) -> Option<&mut Etm<M>> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// Find the instance owning the register window at `base_address`.
    pub fn find_by_base(&mut self, base_address: usize) -> Option<&mut Etm<M>> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|etm| etm.base_address() == base_address)
    }

    /// Take the instance at `index` back out, e.g. to unmap its window.
    pub fn remove(&mut self, index: u8) -> Option<Etm<M>> {
        self.slots.get_mut(index as usize)?.take()
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Whether no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the registered instances.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Etm<M>> {
        self.slots.iter_mut().flatten()
    }
}

impl<M: EtmMemory> Default for EtmRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Registry tests only need window identity, not register behavior.
    struct StubWindow {
        base: usize,
    }

    impl EtmMemory for StubWindow {
        fn read_word(&mut self, _offset: u32) -> u32 {
            0
        }

        fn write_word(&mut self, _offset: u32, _value: u32) {}

        fn base_address(&self) -> usize {
            self.base
        }
    }

    fn etm(index: u8, base: usize) -> Etm<StubWindow> {
        Etm::new(StubWindow { base }, index).unwrap()
    }

    #[test]
    fn registers_and_looks_up_four_instances() {
        let mut registry = EtmRegistry::new();
        for index in 0..4 {
            registry
                .register(etm(index, 0xF880_0000 + 0x1000 * index as usize))
                .unwrap();
        }
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get(2).unwrap().index(), 2);
        assert_eq!(registry.get_mut(3).unwrap().index(), 3);
    }

    #[test]
    fn rejects_duplicate_index() {
        let mut registry = EtmRegistry::new();
        registry.register(etm(1, 0x1000)).unwrap();
        assert!(matches!(
            registry.register(etm(1, 0x2000)),
            Err(EtmError::SlotOccupied(1))
        ));
    }

    #[test]
    fn finds_instance_by_window_identity() {
        let mut registry = EtmRegistry::new();
        registry.register(etm(0, 0xF880_0000)).unwrap();
        registry.register(etm(3, 0xF888_0000)).unwrap();

        assert_eq!(registry.find_by_base(0xF888_0000).unwrap().index(), 3);
        assert!(registry.find_by_base(0xDEAD_0000).is_none());
    }

    #[test]
    fn remove_returns_ownership() {
        let mut registry = EtmRegistry::new();
        registry.register(etm(2, 0x3000)).unwrap();
        let etm = registry.remove(2).unwrap();
        assert_eq!(etm.index(), 2);
        assert!(registry.is_empty());
        assert!(registry.remove(2).is_none());
    }
}
