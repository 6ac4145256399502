//! Per-CPU storage.
//!
//! Thread-local state is modelled as a register pointing at a per-core
//! block rather than through any OS-level TLS mechanism. The full
//! scheduler that would normally own that register and its bring-up
//! sequence is out of scope here, so this module provides the minimal
//! version of the contract the memory subsystem actually needs: a
//! fixed-size array of per-core blocks indexed by `current_cpu_id()`.

use core::sync::atomic::{AtomicU32, Ordering};

/// Upper bound on the number of cores this kernel build supports. The core
/// set is fixed at boot, not hot-plugged.
pub const MAX_CPUS: usize = 16;

/// Sentinel meaning "no index queued" for the handle table's per-core free
/// list head.
pub const NO_LOCAL_FREE: u32 = u32::MAX;

/// Per-core block. Only the fields the handle table needs are modelled;
/// additional per-CPU state (current task, TSS, IST stacks) belongs to the
/// scheduler and is out of scope.
pub struct PerCpuBlock {
    /// Head of this core's handle-table free list (an index into the
    /// handle table, or [`NO_LOCAL_FREE`]).
    pub handle_local_free_index: AtomicU32,
    /// Number of entries currently queued on this core's free list.
    pub handle_local_free_count: AtomicU32,
}

impl PerCpuBlock {
    const fn new() -> Self {
        Self {
            handle_local_free_index: AtomicU32::new(NO_LOCAL_FREE),
            handle_local_free_count: AtomicU32::new(0),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const INIT_BLOCK: PerCpuBlock = PerCpuBlock::new();
static BLOCKS: [PerCpuBlock; MAX_CPUS] = [INIT_BLOCK; MAX_CPUS];

/// Identify the calling core.
///
/// Derived from the initial local APIC ID reported by `CPUID.01H:EBX[31:24]`.
#[cfg(target_arch = "x86_64")]
pub fn current_cpu_id() -> u8 {
    // SAFETY: CPUID leaf 1 is available on every x86_64 CPU.
    let cpuid = unsafe { core::arch::x86_64::__cpuid(0x1) };
    ((cpuid.ebx >> 24) & 0xFF) as u8
}

/// Look up the per-core block for the calling core.
pub fn this_cpu() -> &'static PerCpuBlock {
    let id = current_cpu_id() as usize;
    debug_assert!(id < MAX_CPUS, "CPU id {id} exceeds MAX_CPUS");
    &BLOCKS[id % MAX_CPUS]
}

/// Look up the per-core block for a specific core, used by cross-core
/// maintenance paths (e.g. the free-list rebalancer draining every core at
/// shutdown).
pub fn cpu(id: u8) -> &'static PerCpuBlock {
    &BLOCKS[id as usize % MAX_CPUS]
}

/// Iterate every core's block, for global accounting (tests, stats).
pub fn all() -> &'static [PerCpuBlock; MAX_CPUS] {
    &BLOCKS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_block_has_no_local_free() {
        let block = PerCpuBlock::new();
        assert_eq!(
            block.handle_local_free_index.load(Ordering::Relaxed),
            NO_LOCAL_FREE
        );
        assert_eq!(block.handle_local_free_count.load(Ordering::Relaxed), 0);
    }
}
