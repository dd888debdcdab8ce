//! Scope guard for releasing half-open trial slots.
//!
//! A trial call admitted while the breaker is half-open holds one slot. The
//! slot must be returned even when the caller's future is dropped mid-call,
//! otherwise the breaker would stay saturated forever.

/// A guard that executes a closure when dropped, unless defused.
pub struct ScopeGuard<T, F: FnOnce(T)> {
    value: Option<T>,
    dropper: Option<F>,
}

impl<T, F: FnOnce(T)> ScopeGuard<T, F> {
    /// Disarm the guard and hand back the value without running the closure.
    pub fn defuse(mut self) -> Option<T> {
        self.dropper = None;
        self.value.take()
    }
}

impl<T, F: FnOnce(T)> Drop for ScopeGuard<T, F> {
    fn drop(&mut self) {
        if let (Some(value), Some(dropper)) = (self.value.take(), self.dropper.take()) {
            dropper(value);
        }
    }
}

/// Create a scope guard that will execute `dropper` with `value` when dropped.
pub fn guard<T, F: FnOnce(T)>(value: T, dropper: F) -> ScopeGuard<T, F> {
    ScopeGuard {
        value: Some(value),
        dropper: Some(dropper),
    }
}
