use axerrno::{ax_err, ax_err_type, AxResult};
use bitvec::prelude::{BitArray, Lsb0};

/// Hands out small integer ids starting at 1, so that 0 never names a
/// live object.
#[derive(Debug)]
pub struct IdAllocator {
    capacity: usize,
    used: BitArray<[u64; 4], Lsb0>,
}

impl IdAllocator {
    /// The largest capacity an allocator can have.
    pub const MAX_CAPACITY: usize = 255;

    pub const fn new(capacity: usize) -> Self {
        assert!(capacity <= Self::MAX_CAPACITY);
        Self {
            capacity,
            used: BitArray::ZERO,
        }
    }

    /// Number of ids currently allocated.
    pub fn allocated(&self) -> usize {
        self.used.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.used.not_any()
    }

    /// Allocates the lowest free id.
    pub fn alloc(&mut self) -> AxResult<u8> {
        let index = self.used[..self.capacity]
            .first_zero()
            .ok_or_else(|| ax_err_type!(NoMemory, "all ids are in use"))?;
        self.used.set(index, true);
        Ok(index as u8 + 1)
    }

    /// Returns `id` to the allocator.
    pub fn free(&mut self, id: u8) -> AxResult {
        let index = (id as usize).wrapping_sub(1);
        if index >= self.capacity || !self.used[index] {
            return ax_err!(InvalidInput, "freeing an id that is not allocated");
        }
        self.used.set(index, false);
        Ok(())
    }
}
