//! Reusable SMP barrier with a generation counter.
//!
//! Each call to [`SmpBarrier::reach`] blocks until `target` participants
//! have called it; the last arriver bumps the generation and releases
//! everyone else. Because release is keyed off the generation rather than
//! resetting the arrival count, the same barrier can be reused across many
//! rounds without any participant needing to call an explicit reset —
//! `reset` exists only for repurposing a barrier for a different `target`
//! and is only safe when no participant is currently inside `reach`.

use core::hint;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SmpBarrier {
    target: AtomicUsize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
}

impl SmpBarrier {
    pub const fn new(target: usize) -> Self {
        Self {
            target: AtomicUsize::new(target),
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    /// Block until `target` participants have called `reach` in this
    /// generation.
    pub fn reach(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        let target = self.target.load(Ordering::Relaxed);
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == target {
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
        } else {
            while self.generation.load(Ordering::Acquire) == generation {
                hint::spin_loop();
            }
        }
    }

    /// Repurpose the barrier for a new participant count. Only safe when no
    /// thread is currently inside `reach`.
    pub fn reset(&self, target: usize) {
        self.target.store(target, Ordering::Relaxed);
        self.arrived.store(0, Ordering::Relaxed);
    }

    /// Current generation, mostly useful for tests that want to observe a
    /// round completing without joining it.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_participant_passes_immediately() {
        let barrier = SmpBarrier::new(1);
        barrier.reach();
        assert_eq!(barrier.generation(), 1);
    }

    #[test]
    fn reusable_across_rounds() {
        let barrier = SmpBarrier::new(1);
        barrier.reach();
        barrier.reach();
        barrier.reach();
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn reset_changes_target() {
        let barrier = SmpBarrier::new(4);
        barrier.reset(1);
        barrier.reach();
        assert_eq!(barrier.generation(), 1);
    }
}
