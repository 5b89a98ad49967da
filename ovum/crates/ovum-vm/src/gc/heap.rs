//! Raw heap storage backing the collector.
//!
//! Three regions exist:
//!
//! - gen0: one fixed-size reserved nursery, bump-allocated and locked into
//!   physical memory. Exhaustion triggers a cycle and the bump pointer is
//!   reset after survivors have been moved out.
//! - gen1: individually allocated chunks for objects promoted out of gen0.
//! - the large-object heap: individually allocated chunks for allocations
//!   at or above the large-object threshold; these never move.
//!
//! Gen1 and LOH chunks come from the global allocator with 8-byte
//! alignment; the byte accounting needed by the cycle heuristics lives
//! with the collector itself.

use memmap2::MmapMut;

/// Size of the gen0 nursery.
pub const GEN0_SIZE: usize = 1536 * 1024;

/// Allocations of at least this many bytes (header included) go to the
/// large object heap.
pub const LARGE_OBJECT_SIZE: usize = 87_040;

/// When gen1 holds at least this many dead bytes, the next cycle collects
/// gen1 as well.
pub const GEN1_DEAD_OBJECTS_THRESHOLD: usize = 768 * 1024;

/// Rounds up to the collector's 8-byte allocation granularity.
#[inline]
pub fn align_up(size: usize) -> usize {
    (size + 7) & !7
}

/// The gen0 nursery: a reserved, page-locked region with a bump pointer.
pub struct Gen0Heap {
    map: MmapMut,
    base: usize,
    end: usize,
    current: usize,
}

impl Gen0Heap {
    pub fn new(size: usize) -> std::io::Result<Self> {
        let map = MmapMut::map_anon(size)?;

        // Keep the nursery out of swap. Best effort: allocation still
        // works if the lock limit is too low.
        #[cfg(unix)]
        unsafe {
            libc::mlock(map.as_ptr() as *const libc::c_void, size);
        }

        let base = map.as_ptr() as usize;
        Ok(Self {
            map,
            base,
            end: base + size,
            current: base,
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Moves the bump pointer to `address`. Used when allocation has to
    /// skip past a pinned object.
    #[inline]
    pub fn set_current(&mut self, address: usize) {
        debug_assert!(address >= self.base && address <= self.end);
        self.current = address;
    }

    /// Bump-allocates `size` bytes (already aligned). Returns null when
    /// the nursery is exhausted; the memory is zeroed on success.
    pub fn bump(&mut self, size: usize) -> *mut u8 {
        debug_assert_eq!(size, align_up(size));
        let result = self.current;
        let next = self.current + size;
        if next > self.end {
            return std::ptr::null_mut();
        }
        self.current = next;
        unsafe {
            std::ptr::write_bytes(result as *mut u8, 0, size);
        }
        result as *mut u8
    }

    /// True if the address lies inside the nursery.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end
    }

    /// Resets the bump pointer after a cycle has evacuated the nursery.
    pub fn reset(&mut self) {
        self.current = self.base;
        let _ = &self.map; // region stays mapped for the VM's lifetime
    }
}

/// Allocates an individually-freed chunk (gen1 or LOH). The memory is not
/// zeroed; gen1 chunks are filled by copying and LOH allocation zeroes
/// explicitly.
pub fn alloc_chunk(size: usize) -> *mut u8 {
    let Ok(layout) = std::alloc::Layout::from_size_align(size, 8) else {
        return std::ptr::null_mut();
    };
    unsafe { std::alloc::alloc(layout) }
}

/// Frees a chunk previously returned by [`alloc_chunk`] with the same
/// size.
pub unsafe fn free_chunk(ptr: *mut u8, size: usize) {
    let layout = std::alloc::Layout::from_size_align_unchecked(size, 8);
    std::alloc::dealloc(ptr, layout);
}
