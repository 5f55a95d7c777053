//! The kernel-facing page allocator.
//!
//! [`Kalloc`] owns every [`LockedBuddy`] built at boot and the per-CPU state
//! around them. Single pages go through a per-CPU cache; everything else
//! walks the CPU's [`StealOrder`] and takes the first allocator that can
//! satisfy the request.

use alloc::{boxed::Box, vec::Vec};
use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, info, trace, warn};

use crate::{
    balance::{Balancer, Pool},
    fence,
    hot::HotCache,
    numa::{self, Region, Topology},
    order_of, order_size,
    platform::Platform,
    polyfill::NonNullStrict,
    stats::{BuddyStats, Report},
    Checks, LockedBuddy, StealOrder, KALLOC_HOT_PAGES, PGSIZE,
};

/// Boot-time configuration of a [`Kalloc`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Build one buddy allocator per CPU rather than one per NUMA node.
    pub buddy_per_cpu: bool,
    /// Confine each CPU to its local allocators and rebalance free memory
    /// between CPUs on exhaustion.
    pub load_balance: bool,
    /// Consistency checks to enable.
    pub checks: Checks,
}

impl Default for Config {
    /// Per-CPU allocators, with load balancing and checks following the
    /// crate features.
    fn default() -> Self {
        Config {
            buddy_per_cpu: true,
            load_balance: cfg!(feature = "load-balance"),
            checks: Checks::for_build(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    page_alloc: AtomicUsize,
    page_free: AtomicUsize,
    hot_refill: AtomicUsize,
    hot_flush: AtomicUsize,
    hot_steal: AtomicUsize,
    hot_remote_free: AtomicUsize,
    remote_alloc: AtomicUsize,
    balance_moves: AtomicUsize,
}

#[inline]
fn bump(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// A snapshot of one CPU's allocation counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuStats {
    /// Single pages allocated.
    pub page_alloc: usize,
    /// Single pages freed.
    pub page_free: usize,
    /// Times the hot cache was refilled.
    pub hot_refill: usize,
    /// Times the hot cache was flushed.
    pub hot_flush: usize,
    /// Pages refilled from allocators outside the local tier.
    pub hot_steal: usize,
    /// Flushed pages returned to allocators outside the local tier.
    pub hot_remote_free: usize,
    /// Blocks allocated from outside the local tier.
    pub remote_alloc: usize,
    /// Blocks pulled in from other CPUs by the balancer.
    pub balance_moves: usize,
    /// Pages currently in the hot cache.
    pub hot_pages: usize,
}

struct PerCpu {
    steal: StealOrder,
    node: Option<usize>,
    /// Only touched inside `Platform::with_cpu` for this CPU.
    hot: UnsafeCell<HotCache>,
    /// Mirrors the hot cache's length for readers on other CPUs.
    hot_len: AtomicUsize,
    counters: Counters,
}

/// A NUMA-aware page allocator.
///
/// # Example
///
/// ```no_run
/// # use core::ptr::NonNull;
/// use numa_kalloc::{Config, Kalloc, Platform, Region, Topology, PGSIZE};
///
/// struct Uniprocessor;
///
/// unsafe impl Platform for Uniprocessor {
///     fn with_cpu<R>(&self, f: impl FnOnce(usize) -> R) -> R {
///         f(0)
///     }
/// }
///
/// # fn usable_memory() -> (NonNull<u8>, usize) { unimplemented!() }
/// let (ptr, len) = usable_memory();
/// let map = [unsafe { Region::new(ptr, len) }];
/// let kalloc = unsafe {
///     Kalloc::new(&Topology::single_node(1), &map, Uniprocessor, Config::default())
/// };
///
/// let page = kalloc.alloc(PGSIZE).expect("out of memory");
/// unsafe { kalloc.free(page, PGSIZE) };
/// ```
pub struct Kalloc<P> {
    buddies: Box<[LockedBuddy]>,
    cpus: Box<[PerCpu]>,
    balancer: Balancer,
    platform: P,
    config: Config,
}

// SAFETY: the buddy allocators are behind locks, and each hot cache is only
// reached through `Platform::with_cpu`, which hands a CPU ID to one caller
// at a time.
unsafe impl<P: Platform + Sync> Sync for Kalloc<P> {}
// SAFETY: the allocator owns the memory behind every pointer it stores.
unsafe impl<P: Platform + Send> Send for Kalloc<P> {}

impl<P: Platform> Kalloc<P> {
    /// Builds the allocators for the memory in `map`, partitioned according
    /// to `topology`.
    ///
    /// Chunks of memory too small to hold their own metadata are skipped with
    /// a warning.
    ///
    /// # Safety
    ///
    /// The regions in `map` must not overlap, and must satisfy the contract
    /// of [`Region::new`]. `platform` must only report CPU IDs that appear in
    /// `topology`.
    pub unsafe fn new(topology: &Topology, map: &[Region], platform: P, config: Config) -> Self {
        // SAFETY: forwarded from the caller.
        let layout = unsafe { numa::partition(topology, map, &config) };

        let cpus: Box<[PerCpu]> = layout
            .steal
            .into_iter()
            .zip(layout.node_of)
            .map(|(steal, node)| PerCpu {
                steal,
                node,
                hot: UnsafeCell::new(HotCache::new()),
                hot_len: AtomicUsize::new(0),
                counters: Counters::default(),
            })
            .collect();

        let kalloc = Kalloc {
            buddies: layout.buddies.into_boxed_slice(),
            cpus,
            balancer: Balancer::new(),
            platform,
            config,
        };

        if config.checks.contains(Checks::FENCE) {
            for buddy in kalloc.buddies.iter() {
                let guard = buddy.lock();
                for (ptr, order) in guard.free_blocks() {
                    // SAFETY: free blocks are owned by the allocator.
                    unsafe { fence::poison(ptr, order_size(order)) };
                }
            }
        }

        info!(
            "kalloc: {} buddies, {} CPUs, {} MiB free",
            kalloc.buddies.len(),
            kalloc.cpus.len(),
            kalloc.buddies.iter().map(|b| b.free_bytes()).sum::<usize>() >> 20,
        );

        kalloc
    }

    /// Returns the configuration this allocator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the buddy allocators, in registry order.
    pub fn buddies(&self) -> &[LockedBuddy] {
        &self.buddies
    }

    /// Returns the steal order of `cpu`.
    pub fn steal_order(&self, cpu: usize) -> &StealOrder {
        &self.cpus[cpu].steal
    }

    /// Allocates a block of `size` bytes, aligned to `size`.
    ///
    /// Returns `None` if no allocator reachable from the current CPU can
    /// satisfy the request.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two in `[MIN_SIZE, MAX_SIZE]`, or
    /// if fencing is enabled and the block was written to while free.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let order = order_of(size);

        let ptr = self.platform.with_cpu(|cpu| {
            if size == PGSIZE {
                self.alloc_page(cpu)
            } else {
                self.alloc_general(cpu, order)
            }
        });

        let ptr = match ptr {
            Some(ptr) => ptr,
            None => {
                warn!("kalloc: out of memory for {size:#x} bytes");
                return None;
            }
        };

        let checks = self.config.checks;
        if checks.contains(Checks::SHADOW) {
            self.claim(self.region_owner(ptr), ptr, order);
        }
        if checks.contains(Checks::FENCE) {
            // SAFETY: the block was just allocated and is `size` bytes.
            unsafe { fence::check_and_fill(ptr, size) };
        }

        Some(ptr)
    }

    /// Like [`alloc`](Self::alloc), but zeroes the block.
    #[track_caller]
    pub fn zalloc(&self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.alloc(size)?;
        // SAFETY: the block is `size` bytes and exclusively ours.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Frees a block returned by [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Panics if `size` is invalid or no allocator tracks `ptr`. With
    /// [`Checks::SHADOW`], also panics on a double free or a size mismatch.
    /// These checks run before the block is touched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.alloc(size)` with the same
    /// `size`, and must not be used after this call.
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let order = order_of(size);
        let checks = self.config.checks;

        if !checks.is_empty() {
            let addr = ptr.addr().get();
            assert_eq!(addr % size, 0, "kalloc: freeing misaligned block {addr:#x}");

            let owner = self.region_owner(ptr);
            if checks.contains(Checks::SHADOW) {
                self.unclaim(owner, ptr, order);
            }
        }

        if checks.contains(Checks::FENCE) {
            // SAFETY: the caller gives the block back to us.
            unsafe { fence::poison(ptr, size) };
        }

        self.platform.with_cpu(|cpu| {
            if size == PGSIZE {
                self.free_page(cpu, ptr);
            } else {
                self.release(cpu, ptr, size);
            }
        });
    }

    /// Returns statistics for buddy allocator `idx`.
    pub fn stats(&self, idx: usize) -> BuddyStats {
        self.buddies[idx].lock().stats()
    }

    /// Returns statistics for every buddy allocator and their sum.
    pub fn report(&self) -> Report {
        let allocators: Vec<BuddyStats> = self.buddies.iter().map(|b| b.lock().stats()).collect();

        let mut total = BuddyStats::default();
        for s in &allocators {
            total += s;
        }

        Report {
            allocators,
            total,
            hot_pages: self
                .cpus
                .iter()
                .map(|c| c.hot_len.load(Ordering::Relaxed))
                .sum(),
        }
    }

    /// Returns the counters of `cpu`.
    pub fn cpu_stats(&self, cpu: usize) -> CpuStats {
        let c = &self.cpus[cpu];
        let get = |a: &AtomicUsize| a.load(Ordering::Relaxed);

        CpuStats {
            page_alloc: get(&c.counters.page_alloc),
            page_free: get(&c.counters.page_free),
            hot_refill: get(&c.counters.hot_refill),
            hot_flush: get(&c.counters.hot_flush),
            hot_steal: get(&c.counters.hot_steal),
            hot_remote_free: get(&c.counters.hot_remote_free),
            remote_alloc: get(&c.counters.remote_alloc),
            balance_moves: get(&c.counters.balance_moves),
            hot_pages: get(&c.hot_len),
        }
    }

    /// # Safety
    ///
    /// Must be called inside `with_cpu` for `cpu`, and the returned
    /// reference must not outlive that call or be duplicated.
    #[allow(clippy::mut_from_ref)]
    unsafe fn hot(&self, cpu: usize) -> &mut HotCache {
        unsafe { &mut *self.cpus[cpu].hot.get() }
    }

    fn alloc_page(&self, cpu: usize) -> Option<NonNull<u8>> {
        let c = &self.cpus[cpu];
        // SAFETY: called from `with_cpu(cpu)`.
        let hot = unsafe { self.hot(cpu) };

        if hot.len() == 0 {
            self.refill(cpu, hot);
        }

        let ptr = match hot.pop() {
            Some(p) => {
                c.hot_len.store(hot.len(), Ordering::Relaxed);
                Some(p)
            }
            None => self.alloc_general(cpu, 0),
        };

        if ptr.is_some() {
            bump(&c.counters.page_alloc, 1);
        }
        ptr
    }

    /// Fills the hot cache to half capacity, walking the steal order.
    fn refill(&self, cpu: usize, hot: &mut HotCache) {
        let c = &self.cpus[cpu];
        let target = KALLOC_HOT_PAGES / 2;

        for idx in c.steal.iter() {
            if hot.len() >= target {
                break;
            }

            let mut buddy = self.buddies[idx].lock();
            let mut got = 0;
            while hot.len() < target {
                match buddy.withdraw(0) {
                    Some(p) => hot.push(p),
                    None => break,
                }
                got += 1;
            }
            drop(buddy);

            if got > 0 && !c.steal.is_local(idx) {
                bump(&c.counters.hot_steal, got);
            }
        }

        if hot.len() > 0 {
            bump(&c.counters.hot_refill, 1);
            trace!("kalloc: cpu {} refilled {} hot pages", cpu, hot.len());
        }
        c.hot_len.store(hot.len(), Ordering::Relaxed);
    }

    fn alloc_general(&self, cpu: usize, order: usize) -> Option<NonNull<u8>> {
        if let Some(p) = self.walk(cpu, order) {
            return Some(p);
        }

        if self.config.load_balance {
            let moved = self.balancer.balance(cpu, self.cpus.len(), |c| self.pool(c));
            if moved.blocks > 0 {
                bump(&self.cpus[cpu].counters.balance_moves, moved.blocks);
                return self.walk(cpu, order);
            }
        }

        None
    }

    fn walk(&self, cpu: usize, order: usize) -> Option<NonNull<u8>> {
        let c = &self.cpus[cpu];

        for idx in c.steal.iter() {
            let ptr = self.buddies[idx].lock().withdraw(order);
            if let Some(ptr) = ptr {
                if !c.steal.is_local(idx) {
                    bump(&c.counters.remote_alloc, 1);
                    debug!(
                        "kalloc: cpu {} allocated {:#x} bytes from remote buddy {}",
                        cpu,
                        order_size(order),
                        idx
                    );
                }
                return Some(ptr);
            }
        }

        None
    }

    fn pool(&self, cpu: usize) -> Pool<'_> {
        let c = &self.cpus[cpu];
        Pool {
            buddies: &self.buddies,
            local: c.steal.get_local(),
            node: c.node,
        }
    }

    fn free_page(&self, cpu: usize, ptr: NonNull<u8>) {
        let c = &self.cpus[cpu];
        // SAFETY: called from `with_cpu(cpu)`.
        let hot = unsafe { self.hot(cpu) };

        if hot.is_full() {
            let mut remote = 0;
            hot.flush_half(|page| {
                if !self.release(cpu, page, PGSIZE) {
                    remote += 1;
                }
            });

            bump(&c.counters.hot_flush, 1);
            bump(&c.counters.hot_remote_free, remote);
            trace!("kalloc: cpu {} flushed hot pages, {} remote", cpu, remote);
        }

        hot.push(ptr);
        c.hot_len.store(hot.len(), Ordering::Relaxed);
        bump(&c.counters.page_free, 1);
    }

    /// Returns a block to the allocator it belongs to. Returns `true` if
    /// that allocator is in the local tier of `cpu`.
    #[track_caller]
    fn release(&self, cpu: usize, ptr: NonNull<u8>, size: usize) -> bool {
        let steal = &self.cpus[cpu].steal;
        let idx = match self.owner(cpu, ptr) {
            Some(idx) => idx,
            None => panic!(
                "kalloc: freeing {:#x}, which no allocator tracks",
                ptr.addr().get()
            ),
        };

        // SAFETY: `ptr` is a block of `size` bytes handed back by the caller
        // of `free`, already checked against the shadow if that is enabled.
        unsafe { self.buddies[idx].lock().donate(ptr, size) };

        steal.is_local(idx)
    }

    /// Returns the allocator whose region holds `ptr`. Its shadow bitmap
    /// records which of its blocks are held by callers, wherever they were
    /// allocated from.
    #[track_caller]
    fn region_owner(&self, ptr: NonNull<u8>) -> &LockedBuddy {
        match self.buddies.iter().find(|b| b.owns(ptr)) {
            Some(b) => b,
            None => panic!(
                "kalloc: {:#x} is not in any allocator's region",
                ptr.addr().get()
            ),
        }
    }

    fn claim(&self, owner: &LockedBuddy, ptr: NonNull<u8>, order: usize) {
        let addr = ptr.addr().get();
        if owner.lock().swap_shadow(addr, order, true) == Some(true) {
            panic!("kalloc: {addr:#x} handed out twice at order {order}");
        }
    }

    #[track_caller]
    fn unclaim(&self, owner: &LockedBuddy, ptr: NonNull<u8>, order: usize) {
        let addr = ptr.addr().get();
        if owner.lock().swap_shadow(addr, order, false) == Some(false) {
            panic!("kalloc: double free or wrong size at {addr:#x}, order {order}");
        }
    }

    /// Finds the allocator a freed block goes back to.
    ///
    /// Without load balancing that is the allocator whose region holds the
    /// block. With it every allocator tracks all memory, so the block goes
    /// to the first one, local tier first, that is below its soft limit, or
    /// failing that to the first that can track it.
    fn owner(&self, cpu: usize, ptr: NonNull<u8>) -> Option<usize> {
        let steal = &self.cpus[cpu].steal;
        let candidates = || steal.iter().chain(0..self.buddies.len());

        if !self.config.load_balance {
            return candidates().find(|&i| self.buddies[i].owns(ptr));
        }

        candidates()
            .find(|&i| {
                let b = &self.buddies[i];
                b.contains(ptr) && b.free_bytes() < b.free_limit()
            })
            .or_else(|| candidates().find(|&i| self.buddies[i].contains(ptr)))
    }
}

impl<P> fmt::Debug for Kalloc<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kalloc")
            .field("buddies", &self.buddies)
            .field("ncpu", &self.cpus.len())
            .field("config", &self.config)
            .finish()
    }
}
