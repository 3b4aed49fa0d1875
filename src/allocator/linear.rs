use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Alignment of the arena's backing block. Commands needing more than this
/// are still placed correctly, the first one just pays for the padding.
pub const ARENA_ALIGN: usize = 64;

/// A fixed-size linear (bump) arena backing one command chunk.
///
/// The arena hands out memory by advancing a cursor and never frees
/// individual allocations; the owner resets it once everything placed in it
/// has been consumed. It is not thread-safe and is only ever touched by the
/// thread that currently owns the chunk.
pub struct LinearArena {
    base_ptr: NonNull<u8>,
    capacity: usize,
    cursor: usize,
}

impl LinearArena {
    /// Creates a new arena with the specified capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LinearArena capacity must be non-zero");
        let layout = Self::layout(capacity);

        let ptr = unsafe { alloc(layout) };
        let Some(base_ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self {
            base_ptr,
            capacity,
            cursor: 0,
        }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity, ARENA_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid arena layout for capacity {capacity}"),
        }
    }

    /// Returns the cursor position an allocation of `layout` would end at,
    /// together with its start offset, or None if it does not fit.
    fn placement(&self, layout: Layout) -> Option<(usize, usize)> {
        let current = unsafe { self.base_ptr.as_ptr().add(self.cursor) };
        let start = self.cursor.checked_add(current.align_offset(layout.align()))?;
        let end = start.checked_add(layout.size())?;
        (end <= self.capacity).then_some((start, end))
    }

    /// Returns true if an allocation of `layout` fits in the remaining space.
    pub fn fits(&self, layout: Layout) -> bool {
        self.placement(layout).is_some()
    }

    /// Allocates memory with the given layout.
    ///
    /// Returns None without moving the cursor if there is insufficient space.
    pub fn alloc(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let (start, end) = self.placement(layout)?;
        self.cursor = end;
        NonNull::new(unsafe { self.base_ptr.as_ptr().add(start) })
    }

    /// Moves `value` into the arena.
    ///
    /// On failure the value is handed back so the caller can retry elsewhere.
    pub fn alloc_val<T>(&mut self, value: T) -> Result<NonNull<T>, T> {
        let Some(ptr) = self.alloc(Layout::new::<T>()) else {
            return Err(value);
        };
        let ptr = ptr.cast::<T>();
        unsafe {
            ptr.as_ptr().write(value);
        }
        Ok(ptr)
    }

    /// Resets the arena, reclaiming all memory.
    ///
    /// # Safety
    ///
    /// This invalidates all pointers previously handed out. Every value placed
    /// in the arena must already have been moved out or dropped in place.
    pub unsafe fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Returns the number of bytes currently allocated, including padding.
    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    /// Returns the number of bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Returns the total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for LinearArena {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base_ptr.as_ptr(), Self::layout(self.capacity));
        }
    }
}

// The arena owns its block and moves between threads with its chunk
// (producer -> worker -> recycle pool). It is NOT Sync.
unsafe impl Send for LinearArena {}
