//! A binary-buddy page allocator.
//!
//! A `BuddyAllocator` manages one contiguous region of memory in blocks of
//! `MIN_SIZE << order` bytes, for orders `0..=MAX_ORDER`. Its metadata is
//! carved from the front of the region it is given:
//!
//! - one free-list descriptor per `MIN_SIZE` page of the tracked range;
//! - per order below `MAX_ORDER`, a pair bitmap with one bit per buddy pair,
//!   set iff exactly one buddy of the pair is free;
//! - optionally, per order, an allocation shadow bitmap with one bit per
//!   block, set while the block is handed out at exactly that order (see
//!   [`Checks::SHADOW`]).
//!
//! Two free buddies are always merged immediately, so the pair bit alone
//! decides on free whether to coalesce.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case        |
//! |--------------------------|-----------|-------------------|
//! | Allocate                 | O(1)      | O(MAX_ORDER)      |
//! | Deallocate               | O(1)      | O(MAX_ORDER)      |
//! | Statistics               | O(free blocks)                |
//!
//! #### Fragmentation
//!
//! Sizes are exact powers of two, so there is no internal fragmentation
//! beyond what the caller accepts by rounding its own requests. The tracked
//! range is rounded outward to `MAX_SIZE`, so every block has a buddy; bytes
//! of the region that are not page-aligned are reported as waste.

use core::{fmt, mem, ops::Range, ptr::NonNull};

use crate::{
    base::BasePtr,
    bitmap::Bitmap,
    freelist::{FreeList, Links, MAX_PAGES},
    order_of, order_size,
    polyfill::NonNullStrict,
    round_down, round_up,
    stats::BuddyStats,
    AllocInitError, Checks, MAX_ORDER, MAX_SIZE, MIN_SIZE, NUM_ORDERS,
};

struct OrderHead {
    blocks: FreeList,
    /// One bit per buddy pair. There are no pairs at `MAX_ORDER`.
    pairs: Option<Bitmap>,
    /// One bit per block, set while the block is handed out at this order.
    shadow: Option<Bitmap>,
}

/// A binary-buddy allocator over one region of memory.
///
/// The allocator is not internally synchronized; see
/// [`LockedBuddy`](crate::LockedBuddy).
pub struct BuddyAllocator {
    base: BasePtr,
    /// The region this allocator was built on.
    region: Range<usize>,
    links: Links,
    orders: [OrderHead; NUM_ORDERS],
    free_bytes: usize,
    metadata_bytes: usize,
    waste_bytes: usize,
}

// SAFETY: The allocator has exclusive ownership of its metadata, and the
// memory it hands out is not accessed through it.
unsafe impl Send for BuddyAllocator {}

/// Carves metadata from the front of a region.
struct MetaCursor {
    cur: usize,
}

impl MetaCursor {
    fn take(&mut self, bytes: usize, align: usize) -> usize {
        let at = round_up(self.cur, align);
        self.cur = at + bytes;
        at
    }
}

/// Computes the metadata footprint for `num_pages` tracked pages, starting
/// at `start`. Returns the address of the descriptor array, the address of
/// each order's pair and shadow bitmaps, and the end of the metadata.
#[allow(clippy::type_complexity)]
fn plan_metadata(
    start: usize,
    num_pages: usize,
    shadow: bool,
) -> (usize, [(usize, Option<usize>); NUM_ORDERS], usize) {
    let mut cursor = MetaCursor { cur: start };
    let links = cursor.take(Links::map_bytes(num_pages), mem::align_of::<u64>());

    let mut bitmaps = [(0, None); NUM_ORDERS];
    for (order, slot) in bitmaps.iter_mut().enumerate() {
        if order < MAX_ORDER {
            slot.0 = cursor.take(Bitmap::map_bytes(pair_count(num_pages, order)), 8);
        }
        if shadow {
            slot.1 = Some(cursor.take(Bitmap::map_bytes(num_pages >> order), 8));
        }
    }

    (links, bitmaps, cursor.cur)
}

#[inline]
fn pair_count(num_pages: usize, order: usize) -> usize {
    num_pages >> (order + 1)
}

/// Returns the largest order whose blocks fit in `len` bytes.
#[inline]
pub(crate) fn order_fitting(len: usize) -> usize {
    debug_assert!(len >= MIN_SIZE);
    let log2 = (usize::BITS - 1 - len.leading_zeros()) as usize;
    core::cmp::min(log2 - MIN_SIZE.trailing_zeros() as usize, MAX_ORDER)
}

impl BuddyAllocator {
    /// Constructs a buddy allocator containing the memory in
    /// `[region, region + len)`.
    ///
    /// If `track` is given, the allocator can additionally accept memory in
    /// that address range through [`donate`](Self::donate). In either case
    /// the tracked range is rounded outward to `MAX_SIZE`.
    ///
    /// Metadata is bump-allocated from the front of the region; the rest of
    /// the region, trimmed to whole pages, becomes free memory.
    ///
    /// # Errors
    ///
    /// Returns an error, and tracks no memory, if the region is empty or
    /// too small to hold its own metadata with at least one page left over.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `len` bytes, and must
    /// not be accessed except through this allocator for as long as it
    /// exists.
    pub unsafe fn new(
        region: NonNull<u8>,
        len: usize,
        track: Option<Range<usize>>,
        checks: Checks,
    ) -> Result<BuddyAllocator, AllocInitError> {
        if len == 0 {
            return Err(AllocInitError::EmptyRegion);
        }

        let start = region.addr().get();
        let end = start.checked_add(len).ok_or(AllocInitError::EmptyRegion)?;

        let (lo, hi) = match track {
            Some(t) if !t.is_empty() => (t.start.min(start), t.end.max(end)),
            Some(_) => return Err(AllocInitError::EmptyRegion),
            None => (start, end),
        };
        let base = round_down(lo, MAX_SIZE);
        let limit = round_up(hi, MAX_SIZE);

        let num_pages = (limit - base) / MIN_SIZE;
        if num_pages > MAX_PAGES {
            return Err(AllocInitError::TooManyPages);
        }

        let shadow = checks.contains(Checks::SHADOW);
        let (links_at, bitmaps_at, meta_end) = plan_metadata(start, num_pages, shadow);
        let metadata_bytes = meta_end - start;

        let usable_lo = round_up(meta_end, MIN_SIZE);
        let usable_hi = round_down(end, MIN_SIZE);
        if usable_lo >= usable_hi {
            return Err(AllocInitError::MetadataTooLarge(metadata_bytes));
        }

        let prov = region.as_ptr();
        let at = |addr: usize| sptr::Strict::with_addr(prov, addr);

        // SAFETY: every metadata address lies in `[start, meta_end)`, which
        // is inside the region, and the planned ranges do not overlap.
        let links = unsafe { Links::new(at(links_at).cast(), num_pages) };
        // Everything starts out allocated, with no pair having a free half;
        // releasing the usable range below then builds the real state.
        let orders: [OrderHead; NUM_ORDERS] = core::array::from_fn(|order| {
            let (pairs_at, shadow_at) = bitmaps_at[order];
            OrderHead {
                blocks: FreeList::new(),
                pairs: (order < MAX_ORDER).then(|| unsafe {
                    Bitmap::new(pair_count(num_pages, order), at(pairs_at).cast(), false)
                }),
                shadow: shadow_at.map(|addr| unsafe {
                    Bitmap::new(num_pages >> order, at(addr).cast(), false)
                }),
            }
        });

        let mut buddy = BuddyAllocator {
            base: BasePtr::new(region, base, limit - base),
            region: start..end,
            links,
            orders,
            free_bytes: 0,
            metadata_bytes,
            waste_bytes: len - metadata_bytes - (usable_hi - usable_lo),
        };

        // Release the usable range as maximal aligned blocks.
        let mut addr = usable_lo;
        while addr < usable_hi {
            let align_order = ((addr - base).trailing_zeros() as usize)
                .saturating_sub(MIN_SIZE.trailing_zeros() as usize);
            let order = align_order.min(order_fitting(usable_hi - addr));
            buddy.release(addr, order);
            buddy.free_bytes += order_size(order);
            addr += order_size(order);
        }

        Ok(buddy)
    }

    /// Returns the lowest address this allocator can track.
    #[inline]
    pub fn base(&self) -> usize {
        self.base.addr()
    }

    /// Returns the first address above the range this allocator can track.
    #[inline]
    pub fn limit(&self) -> usize {
        self.base.limit()
    }

    /// Returns `true` if `ptr` lies in the tracked range.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr().get())
    }

    /// Returns `true` if `ptr` lies in the region this allocator was built
    /// on. Regions of different allocators never overlap, even where their
    /// tracked ranges do.
    #[inline]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(&ptr.addr().get())
    }

    /// Returns the region this allocator was built on.
    #[inline]
    pub fn region(&self) -> Range<usize> {
        self.region.clone()
    }

    /// Returns `true` if this allocator has no free memory.
    #[inline]
    pub fn empty(&self) -> bool {
        self.free_bytes == 0
    }

    /// Returns the number of free bytes. Unlike [`stats`](Self::stats),
    /// this is O(1).
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Allocates a block of `size` bytes.
    ///
    /// Returns `None` if no block is available.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two in `[MIN_SIZE, MAX_SIZE]`.
    #[track_caller]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.alloc_order(order_of(size))
    }

    /// Allocates a block of order `order`.
    pub fn alloc_order(&mut self, order: usize) -> Option<NonNull<u8>> {
        let ptr = self.withdraw(order)?;
        self.swap_shadow(ptr.addr().get(), order, true);
        Some(ptr)
    }

    /// Removes the whole free block of the largest order not above
    /// `max_order`, splitting a larger block only if nothing smaller is free.
    ///
    /// Returns the block and its order.
    pub fn alloc_at_most(&mut self, max_order: usize) -> Option<(NonNull<u8>, usize)> {
        let (ptr, order) = self.withdraw_at_most(max_order)?;
        self.swap_shadow(ptr.addr().get(), order, true);
        Some((ptr, order))
    }

    /// Like [`alloc_order`](Self::alloc_order), but leaves the shadow bitmap
    /// alone. The block can only come back through [`donate`](Self::donate).
    pub(crate) fn withdraw(&mut self, order: usize) -> Option<NonNull<u8>> {
        assert!(order <= MAX_ORDER);

        let from = (order..NUM_ORDERS).find(|&o| !self.orders[o].blocks.is_empty())?;
        let addr = self.take(from);

        // Split down to the requested order, keeping the front half and
        // freeing the back half at each step.
        for level in (order..from).rev() {
            let back = addr + order_size(level);
            let back_idx = self.base.page_index(back);
            self.orders[level].blocks.push(&mut self.links, back_idx);

            let now_one_free = self.flip_pair(addr, level);
            assert!(now_one_free, "split found a half-free buddy pair");
        }

        self.free_bytes -= order_size(order);
        Some(self.base.with_addr(addr))
    }

    /// Like [`alloc_at_most`](Self::alloc_at_most), but leaves the shadow
    /// bitmap alone.
    pub(crate) fn withdraw_at_most(&mut self, max_order: usize) -> Option<(NonNull<u8>, usize)> {
        assert!(max_order <= MAX_ORDER);

        match (0..=max_order)
            .rev()
            .find(|&o| !self.orders[o].blocks.is_empty())
        {
            Some(order) => {
                let addr = self.take(order);
                self.free_bytes -= order_size(order);
                Some((self.base.with_addr(addr), order))
            }
            None => self.withdraw(max_order).map(|p| (p, max_order)),
        }
    }

    /// Frees a block previously allocated with `alloc(size)`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is invalid. With [`Checks::SHADOW`], also panics if
    /// the block is not currently allocated at that size, before any state
    /// is modified.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated from this allocator
    /// with exactly `size` bytes, and must not be used after this call.
    #[track_caller]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let order = order_of(size);
        let addr = ptr.addr().get();
        assert!(self.base.contains_addr(addr), "freed block is not tracked here");
        assert_eq!(addr % size, 0, "freed block is misaligned");

        if self.swap_shadow(addr, order, false) == Some(false) {
            panic!("buddy: double free or wrong size at {addr:#x}, order {order}");
        }

        self.release(addr, order);
        self.free_bytes += size;
    }

    /// Adds a block that this allocator did not hand out, but whose address
    /// lies in its tracked range.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes for `size` bytes, aligned to
    /// `size`, owned by the caller, and not free in this allocator.
    #[track_caller]
    pub unsafe fn donate(&mut self, ptr: NonNull<u8>, size: usize) {
        let order = order_of(size);
        let addr = ptr.addr().get();
        assert!(self.base.contains_addr(addr), "donated block is not tracked here");
        assert_eq!(addr % size, 0, "donated block is misaligned");

        // The block may have been handed out here before and freed
        // elsewhere.
        self.swap_shadow(addr, order, false);

        self.release(addr, order);
        self.free_bytes += size;
    }

    /// Returns statistics for this allocator.
    ///
    /// This walks every free list.
    pub fn stats(&self) -> BuddyStats {
        let mut stats = BuddyStats {
            free_bytes: 0,
            nfree: [0; NUM_ORDERS],
            metadata_bytes: self.metadata_bytes,
            waste_bytes: self.waste_bytes,
        };

        for (order, head) in self.orders.iter().enumerate() {
            let n = head.blocks.iter(&self.links).count();
            debug_assert_eq!(n, head.blocks.len());
            stats.nfree[order] = n;
            stats.free_bytes += n * order_size(order);
        }

        stats
    }

    /// Iterates over every free block and its order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        self.orders.iter().enumerate().flat_map(move |(order, head)| {
            head.blocks
                .iter(&self.links)
                .map(move |idx| (self.base.with_addr(self.base.page_addr(idx)), order))
        })
    }

    /// Returns the pair bit for the pair containing `addr` at `order`, or
    /// `None` at `MAX_ORDER`.
    #[cfg(test)]
    pub(crate) fn pair_bit(&self, addr: usize, order: usize) -> Option<bool> {
        let pair = self.pair_index(addr, order);
        self.orders[order].pairs.as_ref().map(|p| p.get(pair))
    }

    /// Pops a block from the free list of `order`.
    fn take(&mut self, order: usize) -> usize {
        let idx = self.orders[order]
            .blocks
            .pop(&mut self.links)
            .expect("take from empty free list");
        let addr = self.base.page_addr(idx);

        if order < MAX_ORDER {
            let one_free = self.flip_pair(addr, order);
            // Now both buddies must be allocated, otherwise they would have
            // been merged.
            assert!(!one_free, "allocated block had a free buddy");
        }

        addr
    }

    /// Returns a block to the free lists, coalescing with free buddies.
    fn release(&mut self, mut addr: usize, mut order: usize) {
        loop {
            if order < MAX_ORDER && !self.flip_pair(addr, order) {
                // The buddy is also free. Remove it from its list, combine
                // the two and free the parent one order up.
                let buddy = self.buddy_of(addr, order);
                let buddy_idx = self.base.page_index(buddy);
                self.orders[order].blocks.remove(&mut self.links, buddy_idx);

                addr = self.parent_of(addr, order);
                order += 1;
                continue;
            }

            let idx = self.base.page_index(addr);
            self.orders[order].blocks.push(&mut self.links, idx);
            return;
        }
    }

    #[inline]
    fn buddy_of(&self, addr: usize, order: usize) -> usize {
        self.base.addr() + ((addr - self.base.addr()) ^ order_size(order))
    }

    /// Returns the address of the block that `addr` and its buddy split from.
    #[inline]
    fn parent_of(&self, addr: usize, order: usize) -> usize {
        self.base.addr() + ((addr - self.base.addr()) & !order_size(order))
    }

    #[inline]
    fn pair_index(&self, addr: usize, order: usize) -> usize {
        self.base.page_index(addr) >> (order + 1)
    }

    /// Flips the pair bit for the pair containing `addr` and returns its new
    /// value.
    fn flip_pair(&mut self, addr: usize, order: usize) -> bool {
        let pair = self.pair_index(addr, order);
        self.orders[order]
            .pairs
            .as_mut()
            .expect("no buddy pairs at MAX_ORDER")
            .flip(pair)
    }

    #[inline]
    fn shadow_index(&self, addr: usize, order: usize) -> usize {
        self.base.page_index(addr) >> order
    }

    /// Sets whether the block at `addr` is handed out at `order` and returns
    /// the previous setting, or `None` without [`Checks::SHADOW`].
    pub(crate) fn swap_shadow(
        &mut self,
        addr: usize,
        order: usize,
        handed_out: bool,
    ) -> Option<bool> {
        let idx = self.shadow_index(addr, order);
        let shadow = self.orders[order].shadow.as_mut()?;
        let was = shadow.get(idx);
        shadow.set(idx, handed_out);
        Some(was)
    }
}

impl fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("limit", &format_args!("{:#x}", self.limit()))
            .field("free_bytes", &self.free_bytes)
            .finish()
    }
}
