//! Junk-filling of free memory.
//!
//! Free blocks are filled with `FREE_JUNK`. When a block is allocated its
//! contents are checked before it is filled with `ALLOC_JUNK`, so a write
//! through a dangling pointer is caught at the next allocation of the
//! block.

use core::ptr::NonNull;

use crate::polyfill::NonNullStrict;

pub(crate) const FREE_JUNK: u8 = 0x01;
pub(crate) const ALLOC_JUNK: u8 = 0x02;

/// Fills a block that is about to become free.
///
/// # Safety
///
/// `ptr` must be valid for writes of `size` bytes.
pub(crate) unsafe fn poison(ptr: NonNull<u8>, size: usize) {
    unsafe { ptr.as_ptr().write_bytes(FREE_JUNK, size) };
}

/// Checks a block that has just been allocated, then fills it.
///
/// # Panics
///
/// Panics if any byte of the block has changed since it was poisoned.
///
/// # Safety
///
/// `ptr` must be valid for reads and writes of `size` bytes.
pub(crate) unsafe fn check_and_fill(ptr: NonNull<u8>, size: usize) {
    let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
    if let Some(off) = bytes.iter().position(|&b| b != FREE_JUNK) {
        panic!(
            "kalloc: free memory at {:#x} was modified (found {:#04x})",
            ptr.addr().get() + off,
            bytes[off]
        );
    }
    bytes.fill(ALLOC_JUNK);
}
