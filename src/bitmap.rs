use core::mem;

pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the number of bytes needed to back a bitmap of `num_bits` bits.
    #[inline]
    pub fn map_bytes(num_bits: usize) -> usize {
        Self::num_words(num_bits) * mem::size_of::<u64>()
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with
    /// every bit set to `fill`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::map_bytes(num_bits)` many bytes, and it must be properly
    ///   aligned for `u64`.
    /// - No other live `Bitmap` or reference may overlap that memory.
    pub unsafe fn new(num_bits: usize, map: *mut u64, fill: bool) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        let word = if fill { u64::MAX } else { 0 };
        for i in 0..Self::num_words(num_bits) {
            unsafe { map.add(i).write(word) };
        }

        Bitmap { num_bits, map }
    }

    #[inline]
    pub fn num_words(num_bits: usize) -> usize {
        num_bits
            .checked_add(u64::BITS as usize - 1)
            .expect("bitmap size overflows usize")
            / u64::BITS as usize
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(word).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        unsafe {
            let word_ptr = self.map.add(word);
            let old = word_ptr.read();
            word_ptr.write(match value {
                true => old | mask,
                false => old & !mask,
            });
        }
    }

    /// Toggles the value of the indexed bit and returns its new value.
    #[inline]
    pub fn flip(&mut self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word, mask) = Self::index_and_mask(index);

        unsafe {
            let word_ptr = self.map.add(word);
            let new = word_ptr.read() ^ mask;
            word_ptr.write(new);
            new & mask != 0
        }
    }
}
