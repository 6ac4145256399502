//! RAII wrappers for kernel resources.
//!
//! Covers the two shapes the memory subsystem actually needs: a guard that
//! returns a physical frame to the PMM on drop, and the generic scope-guard/
//! tracked-lock helpers used throughout for debug logging around lock
//! acquisition.

use core::ops::{Deref, DerefMut};

use spin::MutexGuard;

use crate::mm::pmm;
use crate::mm::{PageSize, PhysicalAddress};
use crate::println;

/// Owns one physical frame; returns it to the PMM when dropped unless
/// [`FrameGuard::leak`] is called first.
pub struct FrameGuard {
    addr: PhysicalAddress,
    size: PageSize,
}

impl FrameGuard {
    pub fn new(addr: PhysicalAddress, size: PageSize) -> Self {
        Self { addr, size }
    }

    pub fn addr(&self) -> PhysicalAddress {
        self.addr
    }

    /// Release ownership without freeing the frame (e.g. it has been handed
    /// off to a page table mapping that now owns its lifetime).
    pub fn leak(self) -> PhysicalAddress {
        let addr = self.addr;
        core::mem::forget(self);
        addr
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Err(e) = pmm::pmm().free_frame(self.addr, self.size, true) {
            println!("[raii] warning: failed to free frame {:#x}: {e}", self.addr.as_u64());
        }
    }
}

/// RAII lock guard that logs acquisition and release, useful while
/// debugging lock-ordering issues between `large_lock`/`split_lock` pairs.
pub struct TrackedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    name: &'static str,
}

impl<'a, T> TrackedMutexGuard<'a, T> {
    pub fn new(guard: MutexGuard<'a, T>, name: &'static str) -> Self {
        Self { guard, name }
    }
}

impl<T> Drop for TrackedMutexGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.name;
    }
}

impl<T> Deref for TrackedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for TrackedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Generic scope guard that runs cleanup code on drop.
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Cancel the cleanup.
    pub fn cancel(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[macro_export]
macro_rules! defer {
    ($e:expr) => {
        let _guard = $crate::raii::ScopeGuard::new(|| $e);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_guard_runs_on_drop() {
        let mut cleaned = false;
        {
            let _guard = ScopeGuard::new(|| {
                cleaned = true;
            });
        }
        assert!(cleaned);
    }

    #[test]
    fn scope_guard_cancel_skips_cleanup() {
        let mut cleaned = false;
        {
            let guard = ScopeGuard::new(|| {
                cleaned = true;
            });
            guard.cancel();
        }
        assert!(!cleaned);
    }
}
