//! Handle table: an indirection from a 32-bit `Handle` to `{ reference
//! count, owning process id, free-list link }`, backed by a growable array
//! of atomics rather than a lock per entry.
//!
//! Allocation tries, in order: this core's local free list (no lock), the
//! global lock-free free stack (CAS loop, same idiom as the large-frame
//! free stack in [`crate::mm::pmm`]), then a bump of the table's cursor.
//! Deallocation always returns an index to the local free list first;
//! once that list grows past [`FREE_LIST_THRESHOLD`], the oldest
//! [`FREE_LIST_REMOVAL_COUNT`] entries are spliced onto the global stack so
//! no one core can hoard every freed handle.

#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::percpu;
use crate::sync::RwTicketLock;

/// Index into a handle table.
pub type Handle = u32;

const NIL: u32 = u32::MAX;
/// Marks a free (unallocated) entry's owning process.
const PROCESS_ID_FREE: u16 = 0xFFFF;

/// A local free list is drained to the global stack once it holds more than
/// this many entries.
pub const FREE_LIST_THRESHOLD: usize = 100;
/// How many of the oldest local entries move to the global stack each time
/// the threshold is crossed.
pub const FREE_LIST_REMOVAL_COUNT: usize = 90;

struct HandleSlot {
    reference_count: AtomicU16,
    process_id: AtomicU16,
    /// Free-list link (local or global — an index is on at most one list at
    /// a time, per the table's invariant).
    local_index: AtomicU32,
}

impl HandleSlot {
    const fn free(process_id: u16) -> Self {
        Self {
            reference_count: AtomicU16::new(0),
            process_id: AtomicU16::new(process_id),
            local_index: AtomicU32::new(NIL),
        }
    }
}

/// A snapshot of one entry, returned from [`HandleTable::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub reference_count: u16,
    pub process_id: u16,
}

/// A process-wide handle table.
pub struct HandleTable {
    slots: RwTicketLock<Vec<HandleSlot>>,
    cursor: AtomicU32,
    maximum: u32,
    global_free_head: AtomicU32,
    process_id: u16,
}

impl HandleTable {
    pub fn new(process_id: u16, maximum: u32) -> Self {
        Self {
            slots: RwTicketLock::new(Vec::new()),
            cursor: AtomicU32::new(0),
            maximum,
            global_free_head: AtomicU32::new(NIL),
            process_id,
        }
    }

    fn with_slot<R>(&self, index: u32, f: impl FnOnce(&HandleSlot) -> R) -> R {
        let slots = self.slots.read();
        f(&slots[index as usize])
    }

    fn grow_to_include(&self, index: u32) {
        let mut slots = self.slots.write();
        while (slots.len() as u32) <= index {
            slots.push(HandleSlot::free(PROCESS_ID_FREE));
        }
    }

    fn pop_global_free(&self) -> Option<u32> {
        loop {
            let head = self.global_free_head.load(Ordering::Acquire);
            if head == NIL {
                return None;
            }
            let next = self.with_slot(head, |slot| slot.local_index.load(Ordering::Acquire));
            if self
                .global_free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// `Allocate`: construct a fresh entry and return its handle.
    pub fn allocate(&self) -> KernelResult<Handle> {
        let block = percpu::this_cpu();

        let index = loop {
            let head = block.handle_local_free_index.load(Ordering::Acquire);
            if head != percpu::NO_LOCAL_FREE {
                let next = self.with_slot(head, |slot| slot.local_index.load(Ordering::Acquire));
                block.handle_local_free_index.store(next, Ordering::Release);
                block.handle_local_free_count.fetch_sub(1, Ordering::AcqRel);
                break head;
            }
            if let Some(global) = self.pop_global_free() {
                break global;
            }
            let cursor = self.cursor.fetch_add(1, Ordering::AcqRel);
            if cursor >= self.maximum {
                self.cursor.fetch_sub(1, Ordering::AcqRel);
                return Err(KernelError::HandleTableFull);
            }
            self.grow_to_include(cursor);
            break cursor;
        };

        self.with_slot(index, |slot| {
            slot.reference_count.store(1, Ordering::Relaxed);
            slot.local_index.store(NIL, Ordering::Relaxed);
            // Publish last: Lookup/Get must never observe a non-sentinel
            // process id before the rest of the entry is initialized.
            slot.process_id.store(self.process_id, Ordering::Release);
        });
        Ok(index)
    }

    /// `Deallocate`: retire `handle`, chaining it onto this core's free
    /// list. `ProcessId` is set to the free sentinel before the free-list
    /// link is touched, so a concurrent `Lookup` either sees the live entry
    /// or already sees it retired — never a half-written link.
    pub fn deallocate(&self, handle: Handle) -> KernelResult<()> {
        self.with_slot(handle, |slot| {
            if slot.process_id.load(Ordering::Acquire) == PROCESS_ID_FREE {
                return Err(KernelError::HandleUnallocated);
            }
            slot.process_id.store(PROCESS_ID_FREE, Ordering::Release);
            Ok(())
        })?;

        let block = percpu::this_cpu();
        let old_head = block.handle_local_free_index.load(Ordering::Acquire);
        self.with_slot(handle, |slot| slot.local_index.store(old_head, Ordering::Release));
        block.handle_local_free_index.store(handle, Ordering::Release);
        let count = block.handle_local_free_count.fetch_add(1, Ordering::AcqRel) + 1;

        if count as usize > FREE_LIST_THRESHOLD {
            self.rebalance_local(block);
        }
        Ok(())
    }

    /// Splice the oldest [`FREE_LIST_REMOVAL_COUNT`] entries off this core's
    /// free list onto the global stack.
    fn rebalance_local(&self, block: &percpu::PerCpuBlock) {
        let count = block.handle_local_free_count.load(Ordering::Acquire) as usize;
        if count <= FREE_LIST_REMOVAL_COUNT {
            return;
        }
        let keep = count - FREE_LIST_REMOVAL_COUNT;

        let mut prev = percpu::NO_LOCAL_FREE;
        let mut cur = block.handle_local_free_index.load(Ordering::Acquire);
        for _ in 0..keep {
            if cur == percpu::NO_LOCAL_FREE {
                return;
            }
            prev = cur;
            cur = self.with_slot(cur, |slot| slot.local_index.load(Ordering::Acquire));
        }
        if prev == percpu::NO_LOCAL_FREE || cur == percpu::NO_LOCAL_FREE {
            return;
        }

        // Detach the chunk starting at `cur` from the local list.
        self.with_slot(prev, |slot| slot.local_index.store(NIL, Ordering::Release));
        block
            .handle_local_free_count
            .fetch_sub(FREE_LIST_REMOVAL_COUNT as u32, Ordering::AcqRel);

        let mut tail = cur;
        loop {
            let next = self.with_slot(tail, |slot| slot.local_index.load(Ordering::Acquire));
            if next == NIL {
                break;
            }
            tail = next;
        }

        loop {
            let global_head = self.global_free_head.load(Ordering::Acquire);
            self.with_slot(tail, |slot| slot.local_index.store(global_head, Ordering::Release));
            if self
                .global_free_head
                .compare_exchange(global_head, cur, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// `Lookup`: direct indexed read. Rejects any index at or beyond the
    /// cursor, and any entry whose `ProcessId` reads as the free sentinel —
    /// checked before `LocalIndex` is ever touched.
    pub fn get(&self, handle: Handle) -> KernelResult<HandleInfo> {
        if handle >= self.cursor.load(Ordering::Acquire) {
            return Err(KernelError::HandleUnallocated);
        }
        self.with_slot(handle, |slot| {
            let process_id = slot.process_id.load(Ordering::Acquire);
            if process_id == PROCESS_ID_FREE {
                return Err(KernelError::HandleUnallocated);
            }
            Ok(HandleInfo {
                reference_count: slot.reference_count.load(Ordering::Acquire),
                process_id,
            })
        })
    }

    pub fn add_reference(&self, handle: Handle) -> KernelResult<u16> {
        self.get(handle)?;
        Ok(self.with_slot(handle, |slot| slot.reference_count.fetch_add(1, Ordering::AcqRel) + 1))
    }

    pub fn release_reference(&self, handle: Handle) -> KernelResult<u16> {
        self.get(handle)?;
        let remaining = self.with_slot(handle, |slot| slot.reference_count.fetch_sub(1, Ordering::AcqRel) - 1);
        if remaining == 0 {
            self.deallocate(handle)?;
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_lookup_then_deallocate() {
        let table = HandleTable::new(7, 1024);
        let h = table.allocate().unwrap();
        let info = table.get(h).unwrap();
        assert_eq!(info.process_id, 7);
        assert_eq!(info.reference_count, 1);
        table.deallocate(h).unwrap();
        assert!(table.get(h).is_err());
    }

    #[test]
    fn deallocated_handle_is_reused() {
        let table = HandleTable::new(1, 1024);
        let a = table.allocate().unwrap();
        table.deallocate(a).unwrap();
        let b = table.allocate().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn double_deallocate_is_rejected() {
        let table = HandleTable::new(1, 1024);
        let h = table.allocate().unwrap();
        table.deallocate(h).unwrap();
        assert!(table.deallocate(h).is_err());
    }

    #[test]
    fn table_full_once_maximum_reached() {
        let table = HandleTable::new(1, 4);
        for _ in 0..4 {
            table.allocate().unwrap();
        }
        assert!(table.allocate().is_err());
    }

    #[test]
    fn reference_counting_deallocates_at_zero() {
        let table = HandleTable::new(1, 1024);
        let h = table.allocate().unwrap();
        table.add_reference(h).unwrap();
        assert_eq!(table.release_reference(h).unwrap(), 1);
        assert!(table.get(h).is_ok());
        assert_eq!(table.release_reference(h).unwrap(), 0);
        assert!(table.get(h).is_err());
    }

    #[test]
    fn local_free_list_rebalances_to_global_stack() {
        let table = HandleTable::new(1, 4096);
        let mut handles = Vec::new();
        for _ in 0..(FREE_LIST_THRESHOLD + 10) {
            handles.push(table.allocate().unwrap());
        }
        for h in &handles {
            table.deallocate(*h).unwrap();
        }
        // Some entries should have been spliced onto the global stack by
        // now; the table should still be able to satisfy fresh allocations
        // from recycled indices rather than growing the cursor further.
        let cursor_before = table.cursor.load(Ordering::Relaxed);
        for _ in 0..(FREE_LIST_THRESHOLD + 10) {
            table.allocate().unwrap();
        }
        let cursor_after = table.cursor.load(Ordering::Relaxed);
        assert_eq!(cursor_before, cursor_after);
    }
}
