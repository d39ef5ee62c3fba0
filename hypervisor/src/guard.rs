//! The module containing the [`ScopeGuard`] type.
//!
//! Every scope that temporarily modifies CPU-visible state (CR0, CR3, CR4,
//! GDTR, VMX operation) registers a guard whose inverse action runs on every
//! early return. Guards drop in reverse declaration order; once the last
//! fallible step of a scope has succeeded, the guards are cancelled and the
//! new state stays in effect.

/// Runs a deferred action on drop unless [`ScopeGuard::cancel`] was called.
pub struct ScopeGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Registers `action` to run when the guard goes out of scope.
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Defuses the guard; the action will not run.
    pub fn cancel(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<F: FnOnce()> core::fmt::Debug for ScopeGuard<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ScopeGuard;
    use core::cell::Cell;

    #[test]
    fn runs_on_drop_in_reverse_order() {
        let order = Cell::new(0u32);
        {
            let _first = ScopeGuard::new(|| order.set(order.get() * 10 + 1));
            let _second = ScopeGuard::new(|| order.set(order.get() * 10 + 2));
        }
        assert_eq!(order.get(), 21);
    }

    #[test]
    fn cancelled_guard_does_not_run() {
        let fired = Cell::new(false);
        {
            let guard = ScopeGuard::new(|| fired.set(true));
            guard.cancel();
        }
        assert!(!fired.get());
    }

    #[test]
    fn runs_on_early_return() {
        fn fallible(fired: &Cell<bool>) -> Result<(), ()> {
            let _guard = ScopeGuard::new(|| fired.set(true));
            Err(())?;
            unreachable!();
        }
        let fired = Cell::new(false);
        assert!(fallible(&fired).is_err());
        assert!(fired.get());
    }
}
