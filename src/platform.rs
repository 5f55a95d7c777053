//! The interface to the CPU the allocator is running on.

/// Identifies the current CPU and keeps the caller on it.
///
/// [`Kalloc`](crate::Kalloc) keeps per-CPU state that is accessed without
/// locks, so it may only be touched by code that cannot be preempted or
/// migrated while doing so. This trait is the only way the allocator reaches
/// that state.
///
/// # Safety
///
/// For the duration of a call to [`with_cpu`](Self::with_cpu), no other call
/// to `with_cpu` on any thread may be passed the same CPU ID, and the ID must
/// be less than the number of CPUs in the topology the allocator was built
/// with. In a kernel this means disabling preemption (or interrupts) before
/// reading the CPU ID and restoring it afterwards.
pub unsafe trait Platform {
    /// Runs `f` with the ID of the current CPU, pinned to that CPU.
    fn with_cpu<R>(&self, f: impl FnOnce(usize) -> R) -> R;
}

// SAFETY: forwards to `P`.
unsafe impl<P: Platform + ?Sized> Platform for &P {
    #[inline]
    fn with_cpu<R>(&self, f: impl FnOnce(usize) -> R) -> R {
        (**self).with_cpu(f)
    }
}
