//! A fair, FIFO ticket spinlock.
//!
//! Acquisition hands out a monotonically increasing ticket via a fetch-add
//! on `tail`, then spins until `head` reaches that ticket. Release bumps
//! `head`. Unlike a bare test-and-set spinlock, waiters are served strictly
//! in arrival order, so no core can be starved by a stream of latecomers.
//!
//! On a build without the `smp` feature there is only one core in flight at
//! a time by construction, so acquisition degenerates to a single fetch-add
//! with no spin loop.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

/// A mutual-exclusion lock with FIFO fairness among waiters.
pub struct TicketLock<T> {
    tail: AtomicU64,
    head: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialised by the ticket protocol; `T: Send`
// is sufficient for the lock itself to be `Sync`, same requirement as
// `spin::Mutex`.
unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until this caller's ticket is served.
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let my_ticket = self.tail.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "smp")]
        while self.head.load(Ordering::Acquire) != my_ticket {
            hint::spin_loop();
        }

        #[cfg(not(feature = "smp"))]
        {
            // Single core in flight: the ticket we were just handed is by
            // construction the only outstanding one.
            debug_assert_eq!(self.head.load(Ordering::Relaxed), my_ticket);
        }

        TicketLockGuard { lock: self }
    }

    /// Attempt to acquire without spinning. Succeeds only if no other ticket
    /// is currently outstanding ahead of the next one to be issued.
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self
            .tail
            .compare_exchange(head, head + 1, Ordering::Acquire, Ordering::Relaxed);
        tail.ok().map(|_| TicketLockGuard { lock: self })
    }

    fn unlock(&self) {
        self.head.fetch_add(1, Ordering::Release);
    }
}

/// RAII guard releasing a [`TicketLock`] on drop.
pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves this caller's ticket is being served.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard proves this caller's ticket is being served.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_roundtrip() {
        let lock = TicketLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = TicketLock::new(());
        let first = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(first);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn tickets_are_served_in_order() {
        let lock = TicketLock::new(0u64);
        for expected in 0..8u64 {
            let guard = lock.lock();
            assert_eq!(*guard, expected);
            drop(guard);
            *lock.lock() += 1;
        }
    }
}
