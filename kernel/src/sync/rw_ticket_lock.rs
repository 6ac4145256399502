//! Reader-writer ticket lock with strict FIFO fairness.
//!
//! Three monotonically increasing counters are packed into one 64-bit word
//! so every transition is a single atomic RMW or CAS on that word:
//!
//! ```text
//! bit  0..16  WritersTail  (u16)
//! bit 16..32  ReadersTail  (u16)
//! bit 32..48  Head         (u16) — next ticket to hand out
//! bit 48..64  unused
//! ```
//!
//! `Head` is bumped by both `AcquireAsReader` and `AcquireAsWriter` to hand
//! out a ticket; the caller then spins until its ticket is reached by the
//! matching tail. Because `WritersTail` and `ReadersTail` share the low 32
//! bits, releasing a writer (which must advance both) is a single add to
//! that half of the word. Groups of readers admitted back-to-back run
//! concurrently; a writer ticket blocks every reader behind it.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

const WRITERS_TAIL_SHIFT: u32 = 0;
const READERS_TAIL_SHIFT: u32 = 16;
const HEAD_SHIFT: u32 = 32;
const FIELD_MASK: u64 = 0xFFFF;

fn field(word: u64, shift: u32) -> u16 {
    ((word >> shift) & FIELD_MASK) as u16
}

/// A reader-writer lock with FIFO ticket ordering between readers and
/// writers.
pub struct RwTicketLock<T> {
    word: AtomicU64,
    data: UnsafeCell<T>,
}

// SAFETY: all mutation of `word` is through atomic RMW/CAS; access to
// `data` is gated by the ticket protocol exactly like a conventional
// reader-writer lock, so `T: Send + Sync` suffices for `Sync`.
unsafe impl<T: Send> Send for RwTicketLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwTicketLock<T> {}

impl<T> RwTicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            word: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock for shared (read) access.
    pub fn read(&self) -> RwTicketReadGuard<'_, T> {
        let prev = self.word.fetch_add(1u64 << HEAD_SHIFT, Ordering::Relaxed);
        let my_ticket = field(prev, HEAD_SHIFT);

        while field(self.word.load(Ordering::Acquire), READERS_TAIL_SHIFT) != my_ticket {
            hint::spin_loop();
        }

        // Publish: admit the next ticket behind us too.
        self.word
            .fetch_add(1u64 << READERS_TAIL_SHIFT, Ordering::Release);

        RwTicketReadGuard { lock: self }
    }

    /// Acquire the lock for exclusive (write) access.
    pub fn write(&self) -> RwTicketWriteGuard<'_, T> {
        let prev = self.word.fetch_add(1u64 << HEAD_SHIFT, Ordering::Relaxed);
        let my_ticket = field(prev, HEAD_SHIFT);

        while field(self.word.load(Ordering::Acquire), WRITERS_TAIL_SHIFT) != my_ticket {
            hint::spin_loop();
        }

        RwTicketWriteGuard { lock: self }
    }

    fn release_reader(&self) {
        self.word
            .fetch_add(1u64 << WRITERS_TAIL_SHIFT, Ordering::Release);
    }

    fn release_writer(&self) {
        // Advance WritersTail and ReadersTail together in one store to the
        // low 32 bits.
        self.word
            .fetch_add((1u64 << WRITERS_TAIL_SHIFT) | (1u64 << READERS_TAIL_SHIFT), Ordering::Release);
    }

    /// Attempt to upgrade a read guard to a write guard in place.
    ///
    /// Succeeds only if the caller is the sole active reader and no further
    /// ticket has been handed out behind it. On failure the read guard is
    /// handed back unchanged; the caller must drop it and reacquire as a
    /// writer rather than retry the upgrade in a loop.
    fn try_upgrade(&self) -> bool {
        let w = self.word.load(Ordering::Acquire);
        let writers_tail = field(w, WRITERS_TAIL_SHIFT);
        let readers_tail = field(w, READERS_TAIL_SHIFT);
        let head = field(w, HEAD_SHIFT);

        if readers_tail.wrapping_sub(writers_tail) != 1 || head != readers_tail {
            return false;
        }

        let new_w = w - (1u64 << READERS_TAIL_SHIFT);
        self.word
            .compare_exchange(w, new_w, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    fn downgrade_writer(&self) {
        self.word
            .fetch_add(1u64 << READERS_TAIL_SHIFT, Ordering::Release);
    }
}

/// RAII shared-access guard.
pub struct RwTicketReadGuard<'a, T> {
    lock: &'a RwTicketLock<T>,
}

impl<'a, T> RwTicketReadGuard<'a, T> {
    /// Try to upgrade to exclusive access without releasing the read lock
    /// in between. Returns the write guard on success, or `self` back on
    /// failure so the caller can drop-and-reacquire.
    pub fn try_upgrade(self) -> Result<RwTicketWriteGuard<'a, T>, Self> {
        if self.lock.try_upgrade() {
            let lock = self.lock;
            core::mem::forget(self);
            Ok(RwTicketWriteGuard { lock })
        } else {
            Err(self)
        }
    }
}

impl<T> Deref for RwTicketReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves our reader ticket has been admitted.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwTicketReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_reader();
    }
}

/// RAII exclusive-access guard.
pub struct RwTicketWriteGuard<'a, T> {
    lock: &'a RwTicketLock<T>,
}

impl<'a, T> RwTicketWriteGuard<'a, T> {
    /// Downgrade to shared access without releasing the lock in between.
    pub fn downgrade(self) -> RwTicketReadGuard<'a, T> {
        self.lock.downgrade_writer();
        let lock = self.lock;
        core::mem::forget(self);
        RwTicketReadGuard { lock }
    }
}

impl<T> Deref for RwTicketWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard proves our writer ticket is being served.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwTicketWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard proves our writer ticket is being served.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwTicketWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_roundtrip() {
        let lock = RwTicketLock::new(0u32);
        *lock.write() += 1;
        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn concurrent_readers_see_same_value() {
        let lock = RwTicketLock::new(42u32);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn upgrade_succeeds_for_sole_reader() {
        let lock = RwTicketLock::new(1u32);
        let reader = lock.read();
        let mut writer = reader.try_upgrade().unwrap_or_else(|_| panic!("upgrade should succeed"));
        *writer += 1;
        drop(writer);
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn upgrade_fails_with_second_reader_outstanding() {
        let lock = RwTicketLock::new(0u32);
        let r1 = lock.read();
        let r2 = lock.read();
        let r1 = r1.try_upgrade().expect_err("upgrade must fail with two live readers");
        drop(r1);
        drop(r2);
    }

    #[test]
    fn downgrade_then_read() {
        let lock = RwTicketLock::new(7u32);
        let writer = lock.write();
        let reader = writer.downgrade();
        assert_eq!(*reader, 7);
    }
}
