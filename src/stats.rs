//! Allocator statistics.

use alloc::vec::Vec;
use core::fmt;

use crate::{order_size, NUM_ORDERS};

/// Statistics for a single buddy allocator.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BuddyStats {
    /// Total free bytes, summed over the free lists.
    pub free_bytes: usize,
    /// The number of free blocks of each order.
    pub nfree: [usize; NUM_ORDERS],
    /// Bytes at the front of the region used for bitmaps and descriptors.
    pub metadata_bytes: usize,
    /// Bytes of the region that are neither metadata nor usable pages.
    pub waste_bytes: usize,
}

impl BuddyStats {
    /// Returns the free bytes implied by the per-order counts.
    pub fn counted_bytes(&self) -> usize {
        self.nfree
            .iter()
            .enumerate()
            .map(|(order, n)| n * order_size(order))
            .sum()
    }
}

impl core::ops::AddAssign<&BuddyStats> for BuddyStats {
    fn add_assign(&mut self, rhs: &BuddyStats) {
        self.free_bytes += rhs.free_bytes;
        self.metadata_bytes += rhs.metadata_bytes;
        self.waste_bytes += rhs.waste_bytes;
        for (a, b) in self.nfree.iter_mut().zip(rhs.nfree.iter()) {
            *a += b;
        }
    }
}

/// An aggregate report over every buddy allocator in a [`Kalloc`].
///
/// [`Kalloc`]: crate::Kalloc
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Statistics for each buddy allocator, in registry order.
    pub allocators: Vec<BuddyStats>,
    /// The sum of every allocator's statistics.
    pub total: BuddyStats,
    /// Free pages held in per-CPU hot caches, which the buddy allocators do
    /// not count as free.
    pub hot_pages: usize,
}

impl fmt::Display for BuddyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Free: {} KiB", self.free_bytes / 1024)?;
        writeln!(f, "Metadata: {} KiB", self.metadata_bytes / 1024)?;
        writeln!(f, "Waste: {} bytes", self.waste_bytes)?;
        write!(f, "Blocks:")?;
        self.nfree.iter().try_for_each(|n| write!(f, " {n}"))?;
        writeln!(f)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buddies: [")?;
        self.allocators
            .iter()
            .try_for_each(|s| write!(f, " {}", s.free_bytes / 1024))?;
        writeln!(f, " ] KiB free")?;
        writeln!(f, "hot pages: {}", self.hot_pages)?;
        (0..20).try_for_each(|_| f.write_str("~"))?;
        writeln!(f)?;
        write!(f, "{}", self.total)
    }
}
