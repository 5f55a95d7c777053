use core::{num::NonZeroUsize, ptr::NonNull};

use crate::{polyfill::NonNullStrict, MIN_SIZE};

/// The range of addresses tracked by an allocator.
///
/// Tracked ranges are rounded outward to `MAX_SIZE`, so `base` need not lie
/// inside the memory the allocator was given. Pointers handed out are derived
/// from `prov`, which carries the provenance of that memory.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    prov: NonNull<u8>,
    base: usize,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` tracking `[base, base + extent)`.
    ///
    /// The returned value assumes the provenance of `prov`.
    #[inline]
    pub fn new(prov: NonNull<u8>, base: usize, extent: usize) -> BasePtr {
        base.checked_add(extent)
            .expect("tracked range limit overflows usize");

        BasePtr { prov, base, extent }
    }

    /// Returns the lowest tracked address.
    #[inline]
    pub fn addr(self) -> usize {
        self.base
    }

    /// Returns the first address above the tracked range.
    #[inline]
    pub fn limit(self) -> usize {
        self.base + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: usize) -> bool {
        self.base <= addr && addr < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    #[inline]
    pub fn offset_to(self, addr: usize) -> usize {
        debug_assert!(self.contains_addr(addr));

        addr.checked_sub(self.base).unwrap()
    }

    /// Returns the index of the `MIN_SIZE` page starting at `addr`.
    #[inline]
    pub fn page_index(self, addr: usize) -> usize {
        self.offset_to(addr) / MIN_SIZE
    }

    /// Returns the address of page `index`.
    #[inline]
    pub fn page_addr(self, index: usize) -> usize {
        self.base + index * MIN_SIZE
    }

    /// Creates a new pointer with the given address.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_addr(self, addr: usize) -> NonNull<u8> {
        debug_assert!(self.contains_addr(addr));

        let addr = NonZeroUsize::new(addr).expect("tracked block at address zero");
        self.prov.with_addr(addr)
    }
}
