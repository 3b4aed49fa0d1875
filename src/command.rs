//! Type-erased recorded commands.
//!
//! A recorded command is a closure over the command buffer manager that is
//! written directly into a chunk's arena. Every command starts with a
//! [`CommandHeader`] carrying its entry points and the intrusive link to the
//! next command, so a chunk can replay its list without knowing any of the
//! concrete closure types.

use crate::allocator::linear::ARENA_ALIGN;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

/// Header shared by every recorded command.
pub struct CommandHeader<S> {
    /// Moves the closure out of the arena and calls it.
    call: unsafe fn(NonNull<CommandHeader<S>>, &mut S),
    /// Drops the closure in place without calling it.
    discard: unsafe fn(NonNull<CommandHeader<S>>),
    pub(crate) next: Option<NonNull<CommandHeader<S>>>,
}

/// A closure together with its header, as laid out in the arena.
///
/// `repr(C)` keeps the header at offset zero so a pointer to the header is
/// also a pointer to the whole command.
#[repr(C)]
pub struct TypedCommand<S, F> {
    header: CommandHeader<S>,
    func: ManuallyDrop<F>,
}

impl<S, F> TypedCommand<S, F>
where
    F: FnOnce(&mut S) + Send + 'static,
{
    pub(crate) fn new(func: F) -> Self {
        TypedCommand {
            header: CommandHeader {
                call: Self::call,
                discard: Self::discard,
                next: None,
            },
            func: ManuallyDrop::new(func),
        }
    }

    /// Hands the closure back to the caller.
    pub(crate) fn into_inner(self) -> F {
        ManuallyDrop::into_inner(self.func)
    }

    unsafe fn call(header: NonNull<CommandHeader<S>>, sink: &mut S) {
        let this = header.cast::<Self>().as_ptr();
        let func = unsafe { ManuallyDrop::take(&mut (*this).func) };
        func(sink);
    }

    unsafe fn discard(header: NonNull<CommandHeader<S>>) {
        let this = header.cast::<Self>().as_ptr();
        unsafe { ManuallyDrop::drop(&mut (*this).func) };
    }
}

/// Runs the command at `header`, consuming its closure.
///
/// # Safety
///
/// `header` must point at a live command that has been neither executed nor
/// discarded. Afterwards the command's memory holds no live value.
pub(crate) unsafe fn execute<S>(header: NonNull<CommandHeader<S>>, sink: &mut S) {
    unsafe {
        let call = (*header.as_ptr()).call;
        call(header, sink);
    }
}

/// Drops the command at `header` without running it.
///
/// # Safety
///
/// Same contract as [`execute`].
pub(crate) unsafe fn discard<S>(header: NonNull<CommandHeader<S>>) {
    unsafe {
        let discard = (*header.as_ptr()).discard;
        discard(header);
    }
}

/// Size in bytes of the header every command carries.
pub const COMMAND_HEADER_SIZE: usize = mem::size_of::<CommandHeader<()>>();

/// Number of arena bytes a command recording `F` occupies, before alignment
/// padding in front of it.
pub const fn command_footprint<S, F>() -> usize {
    mem::size_of::<TypedCommand<S, F>>()
}

/// Arena bytes a command recording `F` needs in an empty chunk, counting the
/// worst-case padding when it is aligned beyond the arena's base alignment.
pub const fn command_extent<S, F>() -> usize {
    command_footprint::<S, F>() + mem::align_of::<TypedCommand<S, F>>().saturating_sub(ARENA_ALIGN)
}
