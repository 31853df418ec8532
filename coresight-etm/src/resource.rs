//! Watermark allocators for the four scarce resource classes of one ETM
//! instance.
//!
//! Address comparators and resource selectors can be consumed either as
//! singles or as even-aligned pairs. Singles are taken from the top of the
//! pool (`high` downward) and pairs from the bottom (`low` upward, two at a
//! time), so the two allocation modes never collide until the pool is
//! genuinely full. Allocation is pure bookkeeping; register programming
//! happens separately in [`crate::Etm`].

use std::fmt;

use crate::error::EtmError;

/// The four scarce resource classes of an ETMv4 implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    /// Program-counter address comparators (8).
    AddressComparator,
    /// Resource selectors (16, indices 0 and 1 hardwired FALSE/TRUE).
    ResourceSelector,
    /// External input selectors routing PMU event buses (4).
    ExternalInputSelector,
    /// 16-bit hardware counters (4, counter 0 is the large-counter base).
    Counter,
}

impl ResourceClass {
    /// Total number of resources of this class per instance.
    pub const fn capacity(self) -> u8 {
        match self {
            ResourceClass::AddressComparator => 8,
            ResourceClass::ResourceSelector => 16,
            ResourceClass::ExternalInputSelector => 4,
            ResourceClass::Counter => 4,
        }
    }

    /// Initial `(low, high)` watermarks. Resource selectors start at
    /// `low = 2`: indices 0 and 1 are the hardwired constant resources and
    /// are never handed out.
    const fn initial_watermarks(self) -> (i8, i8) {
        match self {
            ResourceClass::AddressComparator => (0, 7),
            ResourceClass::ResourceSelector => (2, 15),
            ResourceClass::ExternalInputSelector => (0, 3),
            ResourceClass::Counter => (0, 3),
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceClass::AddressComparator => "address comparators",
            ResourceClass::ResourceSelector => "resource selectors",
            ResourceClass::ExternalInputSelector => "external input selectors",
            ResourceClass::Counter => "counters",
        })
    }
}

/// Watermark allocator for one resource class of one instance.
///
/// Invariant: `low <= high + 1` after every operation. `low > high` means
/// the pool is exhausted.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    class: ResourceClass,
    instance: u8,
    low: i8,
    high: i8,
}

impl ResourcePool {
    pub(crate) fn new(class: ResourceClass, instance: u8) -> Self {
        let (low, high) = class.initial_watermarks();
        ResourcePool {
            class,
            instance,
            low,
            high,
        }
    }

    /// Allocate one resource from the top of the pool.
    pub fn allocate_single(&mut self) -> Result<u8, EtmError> {
        if self.high >= self.low {
            let index = self.high as u8;
            self.high -= 1;
            debug_assert!(self.low <= self.high + 1);
            Ok(index)
        } else {
            Err(self.exhausted())
        }
    }

    /// Allocate an even-aligned pair from the bottom of the pool, returning
    /// the base index. The pair occupies `base` and `base + 1`.
    pub fn allocate_pair(&mut self) -> Result<u8, EtmError> {
        if self.low + 1 <= self.high {
            let base = self.low as u8;
            self.low += 2;
            debug_assert!(base % 2 == 0);
            debug_assert!(self.low <= self.high + 1);
            Ok(base)
        } else {
            Err(self.exhausted())
        }
    }

    /// Restore the initial watermarks, releasing every grant at once. Only
    /// meaningful together with a register reset of the instance.
    pub fn reset(&mut self) {
        let (low, high) = self.class.initial_watermarks();
        self.low = low;
        self.high = high;
    }

    /// Number of resources still allocatable.
    pub fn remaining(&self) -> u8 {
        (self.high - self.low + 1).max(0) as u8
    }

    /// The resource class this pool manages.
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    #[cfg(test)]
    pub(crate) fn watermarks(&self) -> (i8, i8) {
        (self.low, self.high)
    }

    fn exhausted(&self) -> EtmError {
        EtmError::ResourceExhausted {
            class: self.class,
            instance: self.instance,
        }
    }
}

/// The four per-instance pools, owned by the [`crate::Etm`] they belong to.
#[derive(Debug, Clone)]
pub struct ResourcePools {
    /// Address comparator pool.
    pub addr_cmp: ResourcePool,
    /// Resource selector pool (indices 2..=15).
    pub resource_sel: ResourcePool,
    /// External input selector pool.
    pub ext_input_sel: ResourcePool,
    /// Counter pool.
    pub counter: ResourcePool,
}

impl ResourcePools {
    pub(crate) fn new(instance: u8) -> Self {
        ResourcePools {
            addr_cmp: ResourcePool::new(ResourceClass::AddressComparator, instance),
            resource_sel: ResourcePool::new(ResourceClass::ResourceSelector, instance),
            ext_input_sel: ResourcePool::new(ResourceClass::ExternalInputSelector, instance),
            counter: ResourcePool::new(ResourceClass::Counter, instance),
        }
    }

    pub(crate) fn reset_all(&mut self) {
        self.addr_cmp.reset();
        self.resource_sel.reset();
        self.ext_input_sel.reset();
        self.counter.reset();
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;
    use crate::error::EtmError;

    #[test]
    fn address_comparator_pairs_exhaust_at_four() {
        let mut pool = ResourcePool::new(ResourceClass::AddressComparator, 0);
        let bases: Vec<u8> = (0..4).map(|_| pool.allocate_pair().unwrap()).collect();
        assert_eq!(bases, vec![0, 2, 4, 6]);
        assert_eq!(
            pool.allocate_pair(),
            Err(EtmError::ResourceExhausted {
                class: ResourceClass::AddressComparator,
                instance: 0,
            })
        );
    }

    #[test]
    fn resource_selectors_skip_reserved_indices() {
        let mut pool = ResourcePool::new(ResourceClass::ResourceSelector, 2);
        let granted: Vec<u8> = (0..14).map(|_| pool.allocate_single().unwrap()).collect();
        let expected: Vec<u8> = (2..=15).rev().collect();
        assert_eq!(granted, expected);
        assert_eq!(
            pool.allocate_single(),
            Err(EtmError::ResourceExhausted {
                class: ResourceClass::ResourceSelector,
                instance: 2,
            })
        );
    }

    #[test_case(ResourceClass::AddressComparator)]
    #[test_case(ResourceClass::ResourceSelector)]
    #[test_case(ResourceClass::ExternalInputSelector)]
    #[test_case(ResourceClass::Counter)]
    fn singles_never_exceed_capacity(class: ResourceClass) {
        let mut pool = ResourcePool::new(class, 1);
        let mut granted = 0;
        while pool.allocate_single().is_ok() {
            granted += 1;
        }
        let reserved = match class {
            ResourceClass::ResourceSelector => 2,
            _ => 0,
        };
        assert_eq!(granted, class.capacity() - reserved);
    }

    #[test]
    fn mixed_allocation_keeps_grants_disjoint() {
        let mut pool = ResourcePool::new(ResourceClass::AddressComparator, 0);
        let mut granted = Vec::new();

        granted.push(pool.allocate_single().unwrap());
        let base = pool.allocate_pair().unwrap();
        granted.extend([base, base + 1]);
        granted.push(pool.allocate_single().unwrap());
        let base = pool.allocate_pair().unwrap();
        granted.extend([base, base + 1]);

        let (low, high) = pool.watermarks();
        assert!(low <= high + 1);

        let mut sorted = granted.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), granted.len(), "overlapping grants: {granted:?}");
    }

    #[test]
    fn pair_bases_are_even_under_interleaving() {
        let mut pool = ResourcePool::new(ResourceClass::ResourceSelector, 0);
        pool.allocate_single().unwrap();
        let first = pool.allocate_pair().unwrap();
        pool.allocate_single().unwrap();
        let second = pool.allocate_pair().unwrap();
        assert_eq!(first % 2, 0);
        assert_eq!(second % 2, 0);
        assert_ne!(first, second);
    }

    #[test]
    fn watermark_invariant_holds_after_every_call() {
        let mut pool = ResourcePool::new(ResourceClass::ResourceSelector, 0);
        for step in 0..32 {
            if step % 3 == 0 {
                let _ = pool.allocate_pair();
            } else {
                let _ = pool.allocate_single();
            }
            let (low, high) = pool.watermarks();
            assert!(low <= high + 1, "invariant broken at step {step}");
        }
    }

    #[test]
    fn reset_restores_initial_watermarks() {
        let mut pools = ResourcePools::new(0);
        pools.addr_cmp.allocate_pair().unwrap();
        pools.resource_sel.allocate_single().unwrap();
        pools.ext_input_sel.allocate_single().unwrap();
        pools.counter.allocate_single().unwrap();

        pools.reset_all();

        assert_eq!(pools.addr_cmp.watermarks(), (0, 7));
        assert_eq!(pools.resource_sel.watermarks(), (2, 15));
        assert_eq!(pools.ext_input_sel.watermarks(), (0, 3));
        assert_eq!(pools.counter.watermarks(), (0, 3));
    }

    #[test]
    fn pair_allocation_with_reserved_low_mark() {
        // Resource selector pairs start above the hardwired selectors.
        let mut pool = ResourcePool::new(ResourceClass::ResourceSelector, 0);
        assert_eq!(pool.allocate_pair().unwrap(), 2);
        assert_eq!(pool.allocate_pair().unwrap(), 4);
    }

    #[test]
    fn remaining_tracks_grants() {
        let mut pool = ResourcePool::new(ResourceClass::ExternalInputSelector, 0);
        assert_eq!(pool.remaining(), 4);
        pool.allocate_single().unwrap();
        assert_eq!(pool.remaining(), 3);
        pool.allocate_pair().unwrap();
        assert_eq!(pool.remaining(), 1);
    }
}
