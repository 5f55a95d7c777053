#![deny(unsafe_op_in_unsafe_fn)]

use std::{alloc::Layout, ptr::NonNull};

use alloc_hater::Subject;
use numa_kalloc::{
    AllocInitError, BuddyAllocator, Checks, Config, Kalloc, Platform, Region, Topology, MAX_SIZE,
};

/// Memory from the global allocator, aligned to `MAX_SIZE`.
struct Backing {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Backing {
    fn new(len: usize) -> Option<Backing> {
        let layout = Layout::from_size_align(len, MAX_SIZE).ok()?;
        if layout.size() == 0 {
            return None;
        }
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        Some(Backing { ptr, layout })
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub struct BuddySubject {
    // Dropped before the memory it manages.
    buddy: BuddyAllocator,
    _backing: Backing,
}

impl BuddySubject {
    /// Creates a buddy allocator over `len` bytes starting `offset` bytes
    /// into a `MAX_SIZE`-aligned buffer.
    pub fn new(offset: usize, len: usize) -> Result<Self, AllocInitError> {
        let backing = Backing::new(offset + len).ok_or(AllocInitError::EmptyRegion)?;
        let start = unsafe { NonNull::new_unchecked(backing.ptr.as_ptr().add(offset)) };
        let buddy = unsafe { BuddyAllocator::new(start, len, None, Checks::SHADOW)? };

        Ok(BuddySubject {
            buddy,
            _backing: backing,
        })
    }
}

impl Subject for BuddySubject {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.buddy.alloc(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.buddy.free(ptr, size) };
    }
}

/// A single CPU, which the subject's owner has to itself.
pub struct OneCpu;

unsafe impl Platform for OneCpu {
    fn with_cpu<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        f(0)
    }
}

pub struct KallocSubject {
    kalloc: Kalloc<OneCpu>,
    _backing: Backing,
}

impl KallocSubject {
    /// Creates a front end over `len` bytes, split among `nbuddies`
    /// allocators that all serve CPU 0.
    pub fn new(len: usize, nbuddies: usize, load_balance: bool) -> Option<Self> {
        let backing = Backing::new(len)?;
        let map = [unsafe { Region::new(backing.ptr, len) }];

        // Extra CPUs in the topology only own memory; CPU 0 steals from them.
        let topology = Topology::single_node(nbuddies.max(1));
        let config = Config {
            buddy_per_cpu: true,
            load_balance,
            checks: Checks::SHADOW | Checks::FENCE,
        };
        let kalloc = unsafe { Kalloc::new(&topology, &map, OneCpu, config) };

        Some(KallocSubject {
            kalloc,
            _backing: backing,
        })
    }

    pub fn kalloc(&self) -> &Kalloc<OneCpu> {
        &self.kalloc
    }
}

impl Subject for KallocSubject {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.kalloc.alloc(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.kalloc.free(ptr, size) };
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, ArbSize, Evaluator};
    use numa_kalloc::{MIN_SIZE, PGSIZE};

    use super::*;

    fn ops() -> Vec<AllocatorOp> {
        (0..600)
            .map(|i| match i % 5 {
                0 | 2 => AllocatorOp::Alloc(ArbSize(PGSIZE)),
                1 => AllocatorOp::Alloc(ArbSize(MIN_SIZE << (i % 7))),
                3 => AllocatorOp::Dealloc(i * 7),
                _ => AllocatorOp::Dealloc(i / 3),
            })
            .collect()
    }

    #[test]
    fn buddy_survives_evaluation() {
        let subject = BuddySubject::new(12345, 3 * MAX_SIZE / 2).unwrap();
        Evaluator::new(subject).evaluate(ops()).unwrap();
    }

    #[test]
    fn kalloc_survives_evaluation() {
        for load_balance in [false, true] {
            let subject = KallocSubject::new(2 * MAX_SIZE, 2, load_balance).unwrap();
            let initial = subject.kalloc().report().total.free_bytes;

            let mut eval = Evaluator::new(subject);
            eval.evaluate(ops()).unwrap();

            let report = eval.into_subject().kalloc().report();
            assert_eq!(report.total.free_bytes + report.hot_pages * PGSIZE, initial);
        }
    }
}
