//! Small internal helpers shared across the engine.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// The engine's invariant is that no user callback runs while an internal
/// lock is held, so a poisoned lock can only mean a panic inside the engine
/// itself; the data is still structurally valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Last path segment of a type name: `my_app::actions::Increment` -> `Increment`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}
