//! Lock helpers shared by the scheduler's threads.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, ignoring poisoning.
///
/// A command that panics on the worker poisons whatever it held; the data
/// behind these locks stays structurally valid, and the panic itself is
/// reported separately.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
