//! A buddy allocator behind a spinlock.

use core::{
    fmt,
    ops::Range,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use spin::{Mutex, MutexGuard};

use crate::BuddyAllocator;

/// One spinlock, one [`BuddyAllocator`] and a soft free-byte limit.
///
/// The lock is never held across a call that takes another `LockedBuddy`'s
/// lock, so no two of these are ever held at once by one CPU.
pub struct LockedBuddy {
    inner: Mutex<BuddyAllocator>,
    /// Above this many free bytes the pool declines donated memory. Only
    /// consulted in load-balanced mode.
    free_limit: AtomicUsize,
    /// Cached copies of the tracked bounds, so ownership lookups do not need
    /// the lock.
    base: usize,
    limit: usize,
    region: Range<usize>,
}

impl LockedBuddy {
    /// Wraps `buddy`, setting the soft limit to its current free bytes.
    pub fn new(buddy: BuddyAllocator) -> LockedBuddy {
        LockedBuddy {
            free_limit: AtomicUsize::new(buddy.free_bytes()),
            base: buddy.base(),
            limit: buddy.limit(),
            region: buddy.region(),
            inner: Mutex::new(buddy),
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, BuddyAllocator> {
        self.inner.lock()
    }

    /// Returns `true` if `ptr` lies in this allocator's tracked range.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = sptr::Strict::addr(ptr.as_ptr());
        self.base <= addr && addr < self.limit
    }

    /// Returns `true` if `ptr` lies in the region this allocator was built
    /// on.
    #[inline]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.region.contains(&sptr::Strict::addr(ptr.as_ptr()))
    }

    /// Returns the soft free-byte limit.
    #[inline]
    pub fn free_limit(&self) -> usize {
        self.free_limit.load(Ordering::Relaxed)
    }

    /// Sets the soft free-byte limit.
    #[inline]
    pub fn set_free_limit(&self, limit: usize) {
        self.free_limit.store(limit, Ordering::Relaxed);
    }

    /// Reads the free byte count under the lock.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes()
    }
}

impl fmt::Debug for LockedBuddy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuddy")
            .field("base", &format_args!("{:#x}", self.base))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field(
                "region",
                &format_args!("{:#x}..{:#x}", self.region.start, self.region.end),
            )
            .field("free_limit", &self.free_limit())
            .finish()
    }
}
