//! Free lists threaded through a descriptor array.
//!
//! Every `MIN_SIZE` page in an allocator's tracked range has a `Link`
//! descriptor, stored in the allocator's metadata. A free block of any order
//! is represented by the descriptor of its first page. The free memory itself
//! is never written, so freed bytes are never aliased with list structure.

use core::mem;

/// Marks the absence of a neighbour.
const NIL: u32 = u32::MAX;

/// The largest page count a descriptor array can index.
pub const MAX_PAGES: usize = NIL as usize;

#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct Link {
    prev: u32,
    next: u32,
}

impl Link {
    const UNLINKED: Link = Link {
        prev: NIL,
        next: NIL,
    };
}

/// The descriptor array for a tracked range.
pub struct Links {
    ptr: *mut Link,
    len: usize,
}

impl Links {
    /// Returns the number of bytes needed for `num_pages` descriptors.
    #[inline]
    pub fn map_bytes(num_pages: usize) -> usize {
        num_pages * mem::size_of::<Link>()
    }

    /// Constructs a descriptor array of `num_pages` entries at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned for `Link`, valid for reads and writes for
    /// `Links::map_bytes(num_pages)` bytes, and not aliased for the lifetime
    /// of the returned value.
    pub unsafe fn new(ptr: *mut Link, num_pages: usize) -> Links {
        assert!(num_pages <= MAX_PAGES);
        assert!(ptr.align_offset(mem::align_of::<Link>()) == 0);

        for i in 0..num_pages {
            unsafe { ptr.add(i).write(Link::UNLINKED) };
        }

        Links { ptr, len: num_pages }
    }

    #[inline]
    fn get(&self, index: u32) -> Link {
        assert!((index as usize) < self.len);
        unsafe { self.ptr.add(index as usize).read() }
    }

    #[inline]
    fn get_mut(&mut self, index: u32) -> &mut Link {
        assert!((index as usize) < self.len);
        unsafe { &mut *self.ptr.add(index as usize) }
    }
}

/// An unordered list of free blocks of one order.
#[derive(Debug)]
pub struct FreeList {
    head: u32,
    len: usize,
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: NIL, len: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == NIL
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pushes the block starting at page `index` onto the front of the list.
    pub fn push(&mut self, links: &mut Links, index: usize) {
        let index = index as u32;

        if self.head != NIL {
            links.get_mut(self.head).prev = index;
        }

        *links.get_mut(index) = Link {
            prev: NIL,
            next: self.head,
        };

        self.head = index;
        self.len += 1;
    }

    /// Removes and returns the block at the front of the list.
    pub fn pop(&mut self, links: &mut Links) -> Option<usize> {
        if self.head == NIL {
            return None;
        }

        let index = self.head;
        self.remove(links, index as usize);
        Some(index as usize)
    }

    /// Removes the block starting at page `index` from the list.
    ///
    /// The block must be on this list.
    pub fn remove(&mut self, links: &mut Links, index: usize) {
        let index = index as u32;
        let removed = links.get(index);

        match removed.prev {
            // If there's no previous block, then `removed` is the head.
            NIL => {
                assert_eq!(self.head, index, "removed block is not on this free list");
                self.head = removed.next;
            }
            p => links.get_mut(p).next = removed.next,
        }

        if removed.next != NIL {
            links.get_mut(removed.next).prev = removed.prev;
        }

        *links.get_mut(index) = Link::UNLINKED;
        self.len -= 1;
    }

    /// Iterates over the page indices of the blocks on the list.
    pub fn iter<'a>(&self, links: &'a Links) -> Iter<'a> {
        Iter {
            links,
            cur: self.head,
        }
    }
}

pub struct Iter<'a> {
    links: &'a Links,
    cur: u32,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }

        let index = self.cur;
        self.cur = self.links.get(index).next;
        Some(index as usize)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;

    fn links(v: &mut Vec<Link>) -> Links {
        unsafe { Links::new(v.as_mut_ptr(), v.len()) }
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut v = std::vec![Link::UNLINKED; 8];
        let mut links = links(&mut v);
        let mut list = FreeList::new();

        list.push(&mut links, 3);
        list.push(&mut links, 5);
        list.push(&mut links, 0);
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop(&mut links), Some(0));
        assert_eq!(list.pop(&mut links), Some(5));
        assert_eq!(list.pop(&mut links), Some(3));
        assert_eq!(list.pop(&mut links), None);
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_head_and_tail() {
        let mut v = std::vec![Link::UNLINKED; 8];
        let mut links = links(&mut v);
        let mut list = FreeList::new();

        for i in [1, 2, 4, 6] {
            list.push(&mut links, i);
        }

        list.remove(&mut links, 4);
        assert_eq!(list.iter(&links).collect::<Vec<_>>(), [6, 2, 1]);

        list.remove(&mut links, 6);
        assert_eq!(list.iter(&links).collect::<Vec<_>>(), [2, 1]);

        list.remove(&mut links, 1);
        assert_eq!(list.iter(&links).collect::<Vec<_>>(), [2]);
        assert_eq!(list.len(), 1);
    }
}
