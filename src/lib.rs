//! A NUMA-aware physical page allocator for multiprocessor kernels.
//!
//! Memory is divided at boot into binary [`BuddyAllocator`]s, one per NUMA
//! node or per CPU, each wrapped in a spinlock ([`LockedBuddy`]). Every CPU
//! owns a [`StealOrder`] that lists those allocators from nearest to
//! farthest, and a small unlocked cache of recently freed pages. The
//! [`Kalloc`] front end ties these together:
//!
//! - single pages ([`PGSIZE`]) are served from the CPU's hot cache, which is
//!   refilled from and flushed to the buddy allocators in half-capacity
//!   batches;
//! - larger power-of-two blocks walk the steal order, taking the first
//!   allocator that can satisfy the request.
//!
//! With [`Config::load_balance`] set, each CPU only allocates from its local
//! tier, and on exhaustion pulls memory over from other CPUs' pools instead.
//!
//! Nothing in this crate blocks or sleeps. Out-of-memory is reported as
//! `None`; invalid sizes and detected corruption panic.

#![no_std]
#![doc(html_root_url = "https://docs.rs/numa_kalloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
// This is necessary to allow `polyfill` to shadow methods which are inherent
// on newer toolchains.
#![allow(unstable_name_collisions)]

extern crate alloc;

mod balance;
mod base;
mod bitmap;
mod fence;
mod freelist;
mod hot;
mod polyfill;

pub mod buddy;
pub mod kalloc;
pub mod locked;
pub mod numa;
pub mod platform;
pub mod stats;
pub mod steal;


use core::fmt;

pub use crate::{
    buddy::BuddyAllocator,
    kalloc::{Config, CpuStats, Kalloc},
    locked::LockedBuddy,
    numa::{NumaNode, Region, Topology},
    platform::Platform,
    stats::{BuddyStats, Report},
    steal::StealOrder,
};

/// The size of an order-0 block. This must be a power of two.
pub const MIN_SIZE: usize = 4096;

/// The maximum block order.
///
/// Larger orders allow larger allocations, at the cost of coarser alignment
/// of each allocator's tracked range.
pub const MAX_ORDER: usize = 12;

/// The largest block a buddy allocator can hand out.
pub const MAX_SIZE: usize = MIN_SIZE << MAX_ORDER;

/// The number of distinct block orders.
pub const NUM_ORDERS: usize = MAX_ORDER + 1;

/// The size of a single page.
pub const PGSIZE: usize = MIN_SIZE;

/// The maximum number of recently freed pages cached per CPU.
pub const KALLOC_HOT_PAGES: usize = 128;

bitflags::bitflags! {
    /// Optional consistency checks.
    ///
    /// Both checks cost time, and `SHADOW` also costs metadata.
    pub struct Checks: u32 {
        /// Keep an allocation shadow bitmap in every buddy allocator and
        /// assert, before each free, that the block is allocated at the
        /// order being freed. [`Kalloc`] keeps the bit in the allocator
        /// whose region holds the block, so pages going into the hot cache
        /// and blocks donated under load balancing are checked too.
        const SHADOW = 1 << 0;
        /// Fill freed memory with a sentinel byte and verify that it is
        /// intact when the memory is allocated again.
        const FENCE = 1 << 1;
    }
}

impl Checks {
    /// Returns the checks enabled by the current build configuration.
    ///
    /// `SHADOW` is on in debug builds or with the `buddy-debug` feature;
    /// `FENCE` is on with the `fence` feature.
    pub fn for_build() -> Checks {
        let mut checks = Checks::empty();
        if cfg!(any(debug_assertions, feature = "buddy-debug")) {
            checks |= Checks::SHADOW;
        }
        if cfg!(feature = "fence") {
            checks |= Checks::FENCE;
        }
        checks
    }
}

impl Default for Checks {
    fn default() -> Self {
        Checks::for_build()
    }
}

/// An allocation size that the buddy allocators cannot represent.
///
/// Requesting such a size is a programmer error rather than an allocation
/// failure, so the public entry points panic with this value's message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SizeError {
    /// The size is below [`MIN_SIZE`].
    TooSmall(usize),
    /// The size is above [`MAX_SIZE`].
    TooLarge(usize),
    /// The size is not a power of two.
    NotPowerOfTwo(usize),
}

impl fmt::Display for SizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeError::TooSmall(s) => write!(f, "size {s:#x} < MIN_SIZE"),
            SizeError::TooLarge(s) => write!(f, "size {s:#x} > MAX_SIZE"),
            SizeError::NotPowerOfTwo(s) => write!(f, "size {s:#x} is not a power of two"),
        }
    }
}

/// Converts a block size to its order.
///
/// # Errors
///
/// Returns an error unless `size` is a power of two in
/// `[MIN_SIZE, MAX_SIZE]`. Sizes are never rounded.
#[inline]
pub fn size_to_order(size: usize) -> Result<usize, SizeError> {
    if size < MIN_SIZE {
        return Err(SizeError::TooSmall(size));
    }
    if size > MAX_SIZE {
        return Err(SizeError::TooLarge(size));
    }
    if !size.is_power_of_two() {
        return Err(SizeError::NotPowerOfTwo(size));
    }

    Ok((size.trailing_zeros() - MIN_SIZE.trailing_zeros()) as usize)
}

/// Returns the size of a block of order `order`.
#[inline]
pub const fn order_size(order: usize) -> usize {
    MIN_SIZE << order
}

/// Like [`size_to_order`], but panics on an invalid size.
#[inline]
#[track_caller]
pub(crate) fn order_of(size: usize) -> usize {
    match size_to_order(size) {
        Ok(order) => order,
        Err(e) => panic!("kalloc: {e}"),
    }
}

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// The region cannot hold the metadata needed to track it.
    ///
    /// The variant contains the number of metadata bytes required.
    MetadataTooLarge(usize),

    /// The region, or the range it is asked to track, is empty.
    EmptyRegion,

    /// The tracked range has more pages than a free list index can name.
    TooManyPages,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::MetadataTooLarge(n) => {
                write!(f, "region cannot hold {n} bytes of metadata")
            }
            AllocInitError::EmptyRegion => f.write_str("region is empty"),
            AllocInitError::TooManyPages => f.write_str("tracked range has too many pages"),
        }
    }
}

#[inline]
pub(crate) const fn round_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

#[inline]
pub(crate) const fn round_up(addr: usize, align: usize) -> usize {
    round_down(addr.saturating_add(align - 1), align)
}
