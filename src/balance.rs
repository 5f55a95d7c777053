//! Rebalancing free memory between CPUs' pools.
//!
//! In load-balanced mode each CPU allocates only from its local tier, its
//! *pool*. When an allocation fails there, the CPU pulls memory from another
//! pool: first
//! those on the same NUMA node, then the rest, starting at a rotating offset
//! so that CPUs do not all pick on the same victim.
//!
//! A pull only ever moves memory from a pool with more free bytes to one with
//! fewer, and at most `MAX_SIZE` bytes or half the victim's free memory per
//! move. Memory is moved one block at a time and no two allocator locks are
//! held together.

use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::debug;

use crate::{buddy::order_fitting, order_size, round_down, LockedBuddy, MAX_SIZE, MIN_SIZE};

/// One CPU's pool: the allocators of its local tier.
#[derive(Clone, Copy)]
pub(crate) struct Pool<'a> {
    pub buddies: &'a [LockedBuddy],
    pub local: &'a [Range<usize>],
    pub node: Option<usize>,
}

/// The result of a rebalancing attempt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Moved {
    pub bytes: usize,
    pub blocks: usize,
}

impl<'a> Pool<'a> {
    fn members(&self) -> impl Iterator<Item = &'a LockedBuddy> + '_ {
        let buddies = self.buddies;
        self.local.iter().flat_map(move |r| buddies[r.clone()].iter())
    }

    /// Free bytes across the pool, each allocator read under its lock.
    pub fn balance_count(&self) -> usize {
        self.members().map(LockedBuddy::free_bytes).sum()
    }

    fn same_as(&self, other: &Pool<'_>) -> bool {
        self.local == other.local
    }

    /// Moves up to `min(free / 2, MAX_SIZE)` bytes from this pool into
    /// `target`, in whole pages.
    pub fn balance_move_to(&self, target: &Pool<'_>) -> Moved {
        let amount = round_down(self.balance_count() / 2, MIN_SIZE).min(MAX_SIZE);
        let mut moved = Moved::default();

        for victim in self.members() {
            while moved.bytes < amount {
                let want = amount - moved.bytes;
                let taken = victim.lock().withdraw_at_most(order_fitting(want));
                let (ptr, order) = match taken {
                    Some(t) => t,
                    None => break,
                };
                let size = order_size(order);

                match target.members().find(|b| b.contains(ptr)) {
                    // SAFETY: the block was just removed from `victim`, so
                    // nothing else holds it and it is free nowhere.
                    Some(dst) => unsafe { dst.lock().donate(ptr, size) },
                    None => {
                        // The target cannot track this memory; put it back.
                        // SAFETY: as above, and `victim` tracks it.
                        unsafe { victim.lock().donate(ptr, size) };
                        return moved;
                    }
                }

                moved.bytes += size;
                moved.blocks += 1;
            }
        }

        moved
    }
}

/// Chooses victims for a CPU whose pool is empty.
pub(crate) struct Balancer {
    cursor: AtomicUsize,
}

impl Balancer {
    pub const fn new() -> Balancer {
        Balancer {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pulls memory into the pool of CPU `me` from the first other pool that
    /// has more free bytes, nearest first. `pool(cpu)` returns the pool of
    /// `cpu`.
    pub fn balance<'a>(
        &self,
        me: usize,
        ncpu: usize,
        pool: impl Fn(usize) -> Pool<'a>,
    ) -> Moved {
        let target = pool(me);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let others = (0..ncpu).map(|i| (start + i) % ncpu).filter(|&c| c != me);
        let same_node = others.clone().filter(|&c| pool(c).node == target.node);
        let remote = others.filter(|&c| pool(c).node != target.node);

        for cpu in same_node.chain(remote) {
            let victim = pool(cpu);
            if victim.same_as(&target) {
                continue;
            }

            if victim.balance_count() <= target.balance_count() {
                continue;
            }

            let moved = victim.balance_move_to(&target);
            if moved.blocks > 0 {
                debug!(
                    "kalloc: balance: cpu {} took {} KiB from cpu {}",
                    me,
                    moved.bytes / 1024,
                    cpu
                );
                return moved;
            }
        }

        Moved::default()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::{tests::Arena, BuddyAllocator, Checks};

    /// Two allocators that each track the other's memory.
    fn pair(arena: &Arena) -> Vec<LockedBuddy> {
        let span = arena.base()..arena.base() + 2 * MAX_SIZE;
        (0..2)
            .map(|i| {
                let r = arena.region(i * MAX_SIZE, MAX_SIZE);
                let b = unsafe {
                    BuddyAllocator::new(r.ptr(), r.len(), Some(span.clone()), Checks::SHADOW)
                }
                .unwrap();
                LockedBuddy::new(b)
            })
            .collect()
    }

    #[test]
    fn pulls_half_up_to_max_size() {
        let arena = Arena::new(2 * MAX_SIZE);
        let buddies = pair(&arena);
        let locals = [0..1, 1..2];
        let pool = |cpu: usize| Pool {
            buddies: &buddies,
            local: core::slice::from_ref(&locals[cpu]),
            node: Some(0),
        };

        // Drain CPU 1's pool.
        let mut held = Vec::new();
        while let Some(p) = buddies[1].lock().alloc(MIN_SIZE) {
            held.push(p);
        }
        let before = pool(0).balance_count();

        let moved = Balancer::new().balance(1, 2, pool);
        assert!(moved.bytes > 0);
        assert_eq!(moved.bytes, round_down(before / 2, MIN_SIZE).min(MAX_SIZE));
        assert_eq!(pool(1).balance_count(), moved.bytes);
        assert_eq!(pool(0).balance_count(), before - moved.bytes);

        // The moved memory is usable from its new home.
        let p = buddies[1].lock().alloc(MIN_SIZE).unwrap();
        assert!(buddies[0].owns(p));
        unsafe { buddies[1].lock().free(p, MIN_SIZE) };
    }

    #[test]
    fn never_pulls_from_a_poorer_pool() {
        let arena = Arena::new(2 * MAX_SIZE);
        let buddies = pair(&arena);
        let locals = [0..1, 1..2];
        let pool = |cpu: usize| Pool {
            buddies: &buddies,
            local: core::slice::from_ref(&locals[cpu]),
            node: Some(0),
        };

        let mut held = Vec::new();
        for b in &buddies {
            while let Some(p) = b.lock().alloc(MIN_SIZE) {
                held.push(p);
            }
        }

        assert_eq!(Balancer::new().balance(0, 2, pool), Moved::default());
    }

    #[test]
    fn shared_pool_is_skipped() {
        let arena = Arena::new(2 * MAX_SIZE);
        let buddies = pair(&arena);
        let local = [0..2];
        let pool = |_: usize| Pool {
            buddies: &buddies,
            local: &local,
            node: Some(0),
        };

        assert_eq!(Balancer::new().balance(0, 2, pool), Moved::default());
    }
}
