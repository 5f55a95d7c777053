//! Boot-time partitioning of physical memory into buddy allocators.
//!
//! The physical memory map and the NUMA topology are supplied by the
//! platform. This module only consumes them: usable memory in each node is
//! divided into one chunk per CPU (or one per node), each chunk becomes a
//! [`BuddyAllocator`], and every CPU gets a [`StealOrder`] that visits its
//! own allocators, then the rest of its node, then everything else.

use alloc::vec::Vec;
use core::{ops::Range, ptr::NonNull};

use log::{info, warn};

use crate::{
    kalloc::Config, polyfill::NonNullStrict, round_down, BuddyAllocator, LockedBuddy,
    StealOrder, MIN_SIZE,
};

/// A range of usable memory from the physical memory map.
#[derive(Copy, Clone, Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Describes `len` usable bytes at `ptr`.
    ///
    /// # Safety
    ///
    /// The memory must be valid for reads and writes for `len` bytes, and
    /// once handed to [`Kalloc::new`] it must not be accessed except through
    /// the allocator.
    ///
    /// [`Kalloc::new`]: crate::Kalloc::new
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Region {
        ptr.addr()
            .get()
            .checked_add(len)
            .expect("region end overflows usize");
        Region { ptr, len }
    }

    /// Returns a pointer to the start of the region.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the first address of the region.
    #[inline]
    pub fn base(&self) -> usize {
        self.ptr.addr().get()
    }

    /// Returns the first address above the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.base() + self.len
    }

    /// Returns the length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the part of this region inside `range`, if any.
    fn clip(&self, range: &Range<usize>) -> Option<Region> {
        let lo = self.base().max(range.start);
        let hi = self.end().min(range.end);
        (lo < hi).then(|| self.sub(lo, hi - lo))
    }

    /// Returns the `len` bytes at `addr`, which must lie inside this region.
    fn sub(&self, addr: usize, len: usize) -> Region {
        debug_assert!(self.base() <= addr && addr + len <= self.end());
        let addr = core::num::NonZeroUsize::new(addr).expect("region at address zero");
        Region {
            ptr: self.ptr.with_addr(addr),
            len,
        }
    }
}

/// A set of CPUs and the memory nearest to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumaNode {
    /// IDs of the CPUs in this node.
    pub cpus: Vec<usize>,
    /// Physical address ranges belonging to this node.
    pub mems: Vec<Range<usize>>,
}

/// The machine's NUMA topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    /// The nodes, in the order their allocators are laid out.
    pub nodes: Vec<NumaNode>,
}

impl Topology {
    /// The fallback used without real topology data: one node holding all
    /// memory and CPUs `0..ncpu`.
    pub fn single_node(ncpu: usize) -> Topology {
        info!("numa: assuming single NUMA node");
        Topology {
            nodes: alloc::vec![NumaNode {
                cpus: (0..ncpu).collect(),
                mems: alloc::vec![0..usize::MAX],
            }],
        }
    }

    /// Returns one more than the highest CPU ID in any node.
    pub fn ncpu(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|n| n.cpus.iter())
            .map(|&c| c + 1)
            .max()
            .unwrap_or(0)
    }
}

/// The allocators and search orders built at boot.
pub(crate) struct Layout {
    pub buddies: Vec<LockedBuddy>,
    /// Indexed by CPU ID.
    pub steal: Vec<StealOrder>,
    /// The NUMA node of each CPU, if it belongs to one.
    pub node_of: Vec<Option<usize>>,
}

/// Divides `map` among the nodes of `topology`.
///
/// # Safety
///
/// Every region in `map` must satisfy the contract of [`Region::new`], and
/// the regions must not overlap.
pub(crate) unsafe fn partition(topology: &Topology, map: &[Region], config: &Config) -> Layout {
    let ncpu = topology.ncpu();

    // In load-balanced mode any allocator may be handed any page, so each
    // one tracks the whole span of memory.
    let span = config.load_balance.then(|| {
        let lo = map.iter().map(Region::base).min().unwrap_or(0);
        let hi = map.iter().map(Region::end).max().unwrap_or(0);
        lo..hi
    });

    let mut buddies = Vec::new();
    let mut local = alloc::vec![0..0; ncpu];
    let mut node_range = alloc::vec![0..0; ncpu];
    let mut node_of = alloc::vec![None; ncpu];

    for (node_id, node) in topology.nodes.iter().enumerate() {
        let pieces: Vec<Region> = map
            .iter()
            .flat_map(|r| node.mems.iter().filter_map(move |m| r.clip(m)))
            .collect();
        let total: usize = pieces.iter().map(Region::len).sum();

        let subnodes = if config.buddy_per_cpu {
            node.cpus.len().max(1)
        } else {
            1
        };
        let share = round_down(total / subnodes, MIN_SIZE);

        let node_first = buddies.len();
        let mut pieces = pieces.into_iter().peekable();
        let mut subnode_ranges = Vec::with_capacity(subnodes);

        for _ in 0..subnodes {
            let first = buddies.len();
            let mut budget = share;

            while budget > 0 {
                let piece = match pieces.peek_mut() {
                    Some(p) => p,
                    None => break,
                };

                let take = budget.min(piece.len);
                let chunk = piece.sub(piece.base(), take);
                budget -= take;
                if take == piece.len {
                    pieces.next();
                } else {
                    *piece = piece.sub(piece.base() + take, piece.len - take);
                }

                // SAFETY: chunks are disjoint parts of the caller's regions.
                match unsafe {
                    BuddyAllocator::new(chunk.ptr, chunk.len, span.clone(), config.checks)
                } {
                    Ok(buddy) => {
                        info!(
                            "kalloc: buddy {} on node {}: {:#x}-{:#x}, {} KiB free",
                            buddies.len(),
                            node_id,
                            chunk.base(),
                            chunk.end(),
                            buddy.free_bytes() / 1024,
                        );
                        buddies.push(LockedBuddy::new(buddy));
                    }
                    Err(e) => warn!(
                        "kalloc: skipping {:#x}-{:#x} on node {}: {}",
                        chunk.base(),
                        chunk.end(),
                        node_id,
                        e
                    ),
                }
            }

            subnode_ranges.push(first..buddies.len());
        }

        info!(
            "numa: node {}: {} CPUs, {} MiB in {} buddies",
            node_id,
            node.cpus.len(),
            total >> 20,
            buddies.len() - node_first,
        );

        for (i, &cpu) in node.cpus.iter().enumerate() {
            local[cpu] = subnode_ranges[i.min(subnodes - 1)].clone();
            node_range[cpu] = node_first..buddies.len();
            node_of[cpu] = Some(node_id);
        }
    }

    let steal = (0..ncpu)
        .map(|cpu| {
            let mut order = StealOrder::new();
            order.add(local[cpu].start, local[cpu].end);
            if !config.load_balance {
                order.add(node_range[cpu].start, node_range[cpu].end);
                order.add(0, buddies.len());
            }
            order
        })
        .collect();

    Layout {
        buddies,
        steal,
        node_of,
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::{tests::Arena, Checks, MAX_SIZE};

    fn config(per_cpu: bool) -> Config {
        Config {
            buddy_per_cpu: per_cpu,
            load_balance: false,
            checks: Checks::SHADOW,
        }
    }

    #[test]
    fn single_node_per_cpu() {
        let arena = Arena::new(4 * MAX_SIZE);
        let map = [arena.region(0, 4 * MAX_SIZE)];
        let layout = unsafe { partition(&Topology::single_node(4), &map, &config(true)) };

        assert_eq!(layout.buddies.len(), 4);
        for cpu in 0..4 {
            let s = &layout.steal[cpu];
            assert_eq!(s.get_local(), &[cpu..cpu + 1]);
            assert_eq!(s.iter().count(), 4);
            assert_eq!(layout.node_of[cpu], Some(0));
        }

        let total: usize = layout.buddies.iter().map(|b| b.free_bytes()).sum();
        assert!(total > 3 * MAX_SIZE);
        assert!(total <= 4 * MAX_SIZE);
    }

    #[test]
    fn per_node_buddy_is_shared() {
        let arena = Arena::new(2 * MAX_SIZE);
        let map = [arena.region(0, 2 * MAX_SIZE)];
        let layout = unsafe { partition(&Topology::single_node(3), &map, &config(false)) };

        assert_eq!(layout.buddies.len(), 1);
        for cpu in 0..3 {
            assert!(layout.steal[cpu].is_local(0));
        }
    }

    #[test]
    fn two_nodes_steal_locally_first() {
        let arena = Arena::new(4 * MAX_SIZE);
        let split = arena.base() + 2 * MAX_SIZE;
        let map = [arena.region(0, 4 * MAX_SIZE)];
        let topology = Topology {
            nodes: std::vec![
                NumaNode {
                    cpus: std::vec![0, 1],
                    mems: std::vec![0..split],
                },
                NumaNode {
                    cpus: std::vec![2, 3],
                    mems: std::vec![split..usize::MAX],
                },
            ],
        };
        let layout = unsafe { partition(&topology, &map, &config(true)) };

        assert_eq!(layout.buddies.len(), 4);
        let order: Vec<Vec<Range<usize>>> =
            layout.steal[3].tiers().map(|t| t.to_vec()).collect();
        assert_eq!(order, [std::vec![3..4], std::vec![2..3], std::vec![0..2]]);
        assert_eq!(layout.node_of[1], Some(0));
        assert_eq!(layout.node_of[2], Some(1));

        // Node 0's allocators hold only node 0 memory.
        for b in &layout.buddies[..2] {
            for (ptr, _) in b.lock().free_blocks() {
                assert!(ptr.addr().get() < split);
            }
        }
    }

    #[test]
    fn tiny_chunks_are_skipped() {
        let arena = Arena::new(MAX_SIZE);
        let map = [arena.region(0, 2 * MIN_SIZE)];
        // Two CPUs share two pages: each chunk is too small for its metadata
        // plus a page.
        let layout = unsafe { partition(&Topology::single_node(2), &map, &config(true)) };

        assert!(layout.buddies.is_empty());
        assert!(layout.steal[0].iter().next().is_none());
    }

    #[test]
    fn load_balanced_steal_order_is_local_only() {
        let arena = Arena::new(2 * MAX_SIZE);
        let map = [arena.region(0, 2 * MAX_SIZE)];
        let mut cfg = config(true);
        cfg.load_balance = true;
        let layout = unsafe { partition(&Topology::single_node(2), &map, &cfg) };

        assert_eq!(layout.buddies.len(), 2);
        assert_eq!(layout.steal[1].iter().collect::<Vec<_>>(), [1]);

        // Both allocators can accept pages from the other's chunk.
        let page = layout.buddies[0].lock().alloc(MIN_SIZE).unwrap();
        assert!(layout.buddies[1].contains(page));
    }
}
