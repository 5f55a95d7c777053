//! Per-CPU cache of recently freed pages.

use core::ptr::NonNull;

use crate::{polyfill::NonNullStrict, KALLOC_HOT_PAGES};

/// A stack of free pages owned by one CPU.
///
/// Pages in the cache are allocated from the buddy allocators' point of view.
pub(crate) struct HotCache {
    pages: [Option<NonNull<u8>>; KALLOC_HOT_PAGES],
    count: usize,
}

impl HotCache {
    pub const fn new() -> HotCache {
        HotCache {
            pages: [None; KALLOC_HOT_PAGES],
            count: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count == KALLOC_HOT_PAGES
    }

    /// Pushes a page. The cache must not be full.
    #[inline]
    pub fn push(&mut self, page: NonNull<u8>) {
        assert!(!self.is_full(), "hot page cache overflow");
        self.pages[self.count] = Some(page);
        self.count += 1;
    }

    /// Pops the most recently pushed page.
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        self.count = self.count.checked_sub(1)?;
        self.pages[self.count].take()
    }

    /// Removes the oldest half of the cache, sorted by address so that
    /// neighbouring pages go back to their allocator together, and hands
    /// each page to `f`. The remaining pages keep their order.
    pub fn flush_half(&mut self, mut f: impl FnMut(NonNull<u8>)) {
        let half = self.count / 2;
        let lower = &mut self.pages[..half];
        lower.sort_unstable_by_key(|p| p.map_or(0, |p| p.addr().get()));

        for slot in lower.iter_mut() {
            if let Some(page) = slot.take() {
                f(page);
            }
        }

        self.pages.copy_within(half..self.count, 0);
        for slot in &mut self.pages[self.count - half..self.count] {
            *slot = None;
        }
        self.count -= half;
    }
}
