//! Per-CPU search order over the buddy allocator registry.

use alloc::vec::Vec;
use core::ops::Range;

/// The order in which one CPU searches the buddy allocators.
///
/// A steal order is a sequence of tiers, each a set of disjoint half-open
/// index ranges into the registry of [`LockedBuddy`] instances. The first
/// tier added is the CPU's local tier; later tiers are typically the rest of
/// its NUMA node and then the whole machine. Each index appears at most once
/// across all tiers.
///
/// Steal orders are built once at boot and never modified afterwards.
///
/// [`LockedBuddy`]: crate::LockedBuddy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StealOrder {
    tiers: Vec<Vec<Range<usize>>>,
}

impl StealOrder {
    /// Creates an empty steal order.
    pub const fn new() -> StealOrder {
        StealOrder { tiers: Vec::new() }
    }

    /// Appends a tier covering `[low, high)`, minus every index that an
    /// earlier tier already covers.
    ///
    /// A range that straddles an earlier one is split around it, and the
    /// part above is queued first, so CPUs that share a node start stealing
    /// from different ends. The tier is added even if nothing remains of it.
    pub fn add(&mut self, low: usize, high: usize) {
        let mut tier = Vec::new();
        insert(&self.tiers, &mut tier, low, high);
        self.tiers.push(tier);
    }

    /// Returns `true` if `idx` is in the local tier.
    pub fn is_local(&self, idx: usize) -> bool {
        self.get_local().iter().any(|r| r.contains(&idx))
    }

    /// Returns the ranges of the local tier.
    pub fn get_local(&self) -> &[Range<usize>] {
        self.tiers.first().map_or(&[], |t| t.as_slice())
    }

    /// Returns the tiers, local first.
    pub fn tiers(&self) -> impl Iterator<Item = &[Range<usize>]> + '_ {
        self.tiers.iter().map(|t| t.as_slice())
    }

    /// Iterates over every index in order, tier by tier.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.tiers.iter().flatten().flat_map(|r| r.clone())
    }
}

fn insert(prior: &[Vec<Range<usize>>], tier: &mut Vec<Range<usize>>, low: usize, high: usize) {
    if low >= high {
        return;
    }

    let overlap = prior
        .iter()
        .flatten()
        .chain(tier.iter())
        .find(|r| r.start < high && low < r.end)
        .cloned();

    match overlap {
        None => push_merged(tier, low..high),
        Some(r) => {
            insert(prior, tier, r.end, high);
            insert(prior, tier, low, r.start);
        }
    }
}

fn push_merged(tier: &mut Vec<Range<usize>>, new: Range<usize>) {
    if let Some(r) = tier.iter_mut().find(|r| r.end == new.start) {
        r.end = new.end;
    } else if let Some(r) = tier.iter_mut().find(|r| r.start == new.end) {
        r.start = new.start;
    } else {
        tier.push(new);
    }
}
