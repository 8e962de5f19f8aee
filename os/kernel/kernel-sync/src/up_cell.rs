use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

/// Exclusive access to single-CPU kernel state without a lock.
///
/// The PMM and the page tables are only ever touched by the running thread
/// or by an interrupt on top of it, never in parallel. `UpCell` hands out
/// one `&mut T` at a time and reports a nested attempt (say, a fault taken
/// in the middle of a mapping change) instead of aliasing.
pub struct UpCell<T> {
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

/// A second borrow was attempted while the first was still active.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("state re-entered while already borrowed")]
pub struct Reentered;

// Safety: one borrower at a time, enforced by `borrowed`.
unsafe impl<T: Send> Sync for UpCell<T> {}

impl<T> UpCell<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access to the value.
    ///
    /// # Errors
    /// [`Reentered`] if the value is already borrowed further up the stack.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, Reentered> {
        if self.borrowed.swap(true, Ordering::Acquire) {
            return Err(Reentered);
        }

        struct Release<'a>(&'a AtomicBool);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }

        let _release = Release(&self.borrowed);
        // SAFETY: the flag above guarantees this is the only live reference.
        Ok(f(unsafe { &mut *self.value.get() }))
    }

    #[inline]
    pub fn is_borrowed(&self) -> bool {
        self.borrowed.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for UpCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_borrow_is_refused() {
        let cell = UpCell::new(1);
        let inner = cell.try_with(|v| {
            *v += 1;
            cell.try_with(|_| ())
        });
        assert_eq!(inner, Ok(Err(Reentered)));
        assert_eq!(cell.try_with(|v| *v), Ok(2));
    }

    #[test]
    fn borrow_ends_on_panic() {
        let cell = UpCell::new(0);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.try_with(|_| panic!("boom")).ok();
        }));
        assert!(res.is_err());
        assert!(!cell.is_borrowed());
    }
}
