//! A small library for ~~hating on~~ evaluating the correctness of page
//! allocators.
//!
//! A [`Subject`] hands out power-of-two blocks by size. The [`Evaluator`]
//! drives it with arbitrary operations, paints every live block with the ID
//! of the operation that allocated it and checks the paint before the block
//! is freed, so overlapping allocations and writes to freed memory show up
//! as a failed verification.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

/// The smallest block size generated, as a shift.
pub const MIN_SHIFT: u32 = 12;

/// The largest block size generated, as a shift.
pub const MAX_SHIFT: u32 = 24;

/// A power-of-two block size in `[1 << MIN_SHIFT, 1 << MAX_SHIFT]`, biased
/// towards small blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArbSize(pub usize);

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let span = MAX_SHIFT - MIN_SHIFT + 1;
        let shift = match bool::arbitrary(u)? {
            true => u32::arbitrary(u)? % 3,
            false => u32::arbitrary(u)? % span,
        };

        Ok(ArbSize(1 << (MIN_SHIFT + shift)))
    }
}

#[derive(Clone, Debug, arbitrary::Arbitrary)]
pub enum AllocatorOp {
    Alloc(ArbSize),
    Dealloc(usize),
}

pub trait Subject {
    /// Allocates a block of `size` bytes.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Deallocates the block of `size` bytes pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `size`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize);
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated block.
    ptr: NonNull<u8>,
    // The size it was allocated with.
    size: usize,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `size` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the returned `Block` until
    ///  said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize, id: u64) -> Block {
        let mut b = Block { ptr, size, id };
        b.paint(id);
        b
    }

    /// Returns the `Block`'s memory as a mutable slice of uninitialized bytes.
    pub fn as_uninit_slice_mut(&mut self) -> &mut [MaybeUninit<u8>] {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        unsafe { slice::from_raw_parts_mut(self.ptr.cast().as_ptr(), self.size) }
    }

    pub fn into_raw_parts(self) -> (NonNull<u8>, usize) {
        (self.ptr, self.size)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        let id_bytes = id.to_le_bytes().into_iter().cycle();
        for (byte, value) in self.as_uninit_slice_mut().iter_mut().zip(id_bytes) {
            byte.write(value);
        }
        self.id = id;
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: the block was painted on creation, so every byte is
        // initialized.
        let slice: &[u8] = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id: u64 = op_id.try_into().unwrap();
            match op {
                AllocatorOp::Alloc(ArbSize(size)) => {
                    let ptr = match self.subject.allocate(size) {
                        Some(p) => p,
                        None => continue,
                    };

                    if ptr.as_ptr() as usize % size != 0 {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    let block = unsafe { Block::init(ptr, size, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => continue,
                    };

                    if !block.verify() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    block.paint(op_id);
                    let (ptr, size) = block.into_raw_parts();
                    unsafe { self.subject.deallocate(ptr, size) };
                }
            }

            completed.push(op);
        }

        let mut intact = true;
        for block in blocks {
            intact &= block.verify();
            let (ptr, size) = block.into_raw_parts();
            unsafe { self.subject.deallocate(ptr, size) };
        }

        match intact {
            true => Ok(()),
            false => Err(Failed {
                completed,
                failed_op: None,
            }),
        }
    }
}
