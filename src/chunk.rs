//! Fixed-capacity chunks of recorded commands.
//!
//! A chunk is the unit handed from the producer to the submission worker.
//! Commands are bump-allocated into the chunk's arena and linked in record
//! order, so recording costs a cursor bump plus a move and never touches the
//! global allocator once the chunk exists.

use crate::allocator::LinearArena;
use crate::command::{self, CommandHeader, TypedCommand, command_extent};
use std::ptr::NonNull;

/// Payload bytes per chunk used by the scheduler.
pub const DEFAULT_CHUNK_CAPACITY: usize = 512;

/// A fixed-size arena holding a singly linked list of recorded commands.
pub struct CommandChunk<S, const CAPACITY: usize = DEFAULT_CHUNK_CAPACITY> {
    arena: LinearArena,
    head: Option<NonNull<CommandHeader<S>>>,
    tail: Option<NonNull<CommandHeader<S>>>,
    len: usize,
}

// Every recorded closure is required to be Send, and the chunk is only
// ever accessed by the single thread that currently owns it.
unsafe impl<S, const CAPACITY: usize> Send for CommandChunk<S, CAPACITY> {}

impl<S, const CAPACITY: usize> CommandChunk<S, CAPACITY> {
    /// Creates an empty chunk with its own arena.
    pub fn new() -> Self {
        CommandChunk {
            arena: LinearArena::new(CAPACITY),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Appends `command` to the chunk.
    ///
    /// Returns the closure back untouched if the chunk does not have room for
    /// it; the chunk is not modified in that case. A closure that could never
    /// fit in an empty chunk is rejected at compile time.
    pub fn record<F>(&mut self, command: F) -> Result<(), F>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        const {
            assert!(
                command_extent::<S, F>() <= CAPACITY,
                "recorded command does not fit in a command chunk"
            )
        };

        let node = match self.arena.alloc_val(TypedCommand::new(command)) {
            Ok(node) => node.cast::<CommandHeader<S>>(),
            Err(rejected) => return Err(rejected.into_inner()),
        };

        match self.tail {
            Some(tail) => unsafe { (*tail.as_ptr()).next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
        Ok(())
    }

    /// Executes every recorded command in record order, then empties the chunk.
    ///
    /// Each command runs exactly once and its captured state is dropped as
    /// soon as it returns. If a command panics, the commands after it are
    /// dropped without running and the chunk is still left empty.
    pub fn execute_all(&mut self, sink: &mut S) {
        let mut drain = Drain { chunk: self };
        while let Some(node) = drain.chunk.head {
            unsafe {
                drain.chunk.head = (*node.as_ptr()).next;
                drain.chunk.len -= 1;
                command::execute(node, sink);
            }
        }
    }

    /// Drops every recorded command without running it and empties the chunk.
    pub fn clear(&mut self) {
        while let Some(node) = self.head {
            unsafe {
                self.head = (*node.as_ptr()).next;
                command::discard(node);
            }
        }
        self.tail = None;
        self.len = 0;
        // Every command has been consumed or dropped in place above.
        unsafe { self.arena.reset() };
    }

    /// Returns true if nothing has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.arena.used_bytes() == 0
    }

    /// Number of commands waiting in the chunk.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Arena bytes consumed so far, including alignment padding.
    pub fn used_bytes(&self) -> usize {
        self.arena.used_bytes()
    }

    /// Arena bytes still available.
    pub fn remaining(&self) -> usize {
        self.arena.remaining()
    }

    /// Total arena size in bytes.
    pub fn capacity(&self) -> usize {
        CAPACITY
    }
}

impl<S, const CAPACITY: usize> Default for CommandChunk<S, CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, const CAPACITY: usize> Drop for CommandChunk<S, CAPACITY> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Resets the chunk once replay ends, including by unwinding.
struct Drain<'a, S, const CAPACITY: usize> {
    chunk: &'a mut CommandChunk<S, CAPACITY>,
}

impl<S, const CAPACITY: usize> Drop for Drain<'_, S, CAPACITY> {
    fn drop(&mut self) {
        self.chunk.clear();
    }
}
