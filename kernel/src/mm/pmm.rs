//! Physical frame allocator.
//!
//! Physical memory is partitioned into one or more [`AllocationSpace`]s at
//! boot (one per contiguous usable range the bootloader reports). Each space
//! tracks its 2 MiB frames with a [`LargeFrameDescriptor`] array and, for
//! frames that have been split, a self-describing [`SplitPage`] written into
//! the frame's own first 4 KiB sub-frame.
//!
//! Two locks guard a space's bookkeeping, always taken in a fixed order —
//! `large_lock` first, `split_lock` second, never the reverse — regardless
//! of which order a given call site happens to need them in. Most calls
//! only ever need one of them: `large_lock` for whole-2MiB allocation/free
//! and the large free stack, `split_lock` for everything that walks or
//! mutates a split frame's sub-descriptor array. Splitting a frame (moving
//! it out of the large free stack and into the split list) is the one
//! operation that touches both.

#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::OnceLock;
use crate::sync::TicketLock;

use super::frame_desc::{
    LargeFrameDescriptor, LargeStatus, SmallStatus, SplitPage, LARGE_FRAME_SIZE, NIL,
    RESERVED_SUB_INDEX, SMALL_FRAME_SIZE, SUB_FRAMES_PER_LARGE,
};
use super::{phys_to_virt, PageSize, PhysicalAddress};

/// How many physical frames to reference-count for, and at what
/// granularity: small (4 KiB) or large (2 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMagnitude {
    Small,
    Large,
    /// Caller has no preference; the allocator picks large when a whole
    /// frame is requested and the space has one free, small otherwise.
    Any,
}

/// Restricts which allocation spaces a request may be served from, by the
/// width of address they can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMagnitude {
    /// Any space is eligible.
    Any,
    /// Only spaces whose every frame fits in 32 bits — needed for memory
    /// that will be referenced by hardware or early boot code that can't
    /// address above 4 GiB.
    Below4G,
}

struct AllocationSpace {
    base: PhysicalAddress,
    large_count: u32,
    descriptors: Vec<LargeFrameDescriptor>,
    /// Top of the large free stack, index into `descriptors`, or [`NIL`].
    large_free_head: AtomicU32,
    large_lock: TicketLock<()>,
    split_lock: TicketLock<()>,
    /// Head of the doubly-linked list of split frames with at least one
    /// free sub-frame.
    split_list_head: AtomicU32,
}

impl AllocationSpace {
    fn new(base: PhysicalAddress, size_bytes: u64) -> Self {
        let large_count = (size_bytes / LARGE_FRAME_SIZE) as u32;
        let mut descriptors = Vec::with_capacity(large_count as usize);
        for i in 0..large_count {
            let desc = LargeFrameDescriptor::new();
            let next = if i + 1 < large_count { i + 1 } else { NIL };
            desc.set_next_index(next);
            descriptors.push(desc);
        }
        Self {
            base,
            large_count,
            descriptors,
            large_free_head: AtomicU32::new(if large_count == 0 { NIL } else { 0 }),
            large_lock: TicketLock::new(()),
            split_lock: TicketLock::new(()),
            split_list_head: AtomicU32::new(NIL),
        }
    }

    fn large_base(&self, index: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + index as u64 * LARGE_FRAME_SIZE)
    }

    fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.allocation_end()
    }

    fn large_index_of(&self, addr: PhysicalAddress) -> u32 {
        ((addr.as_u64() - self.base.as_u64()) / LARGE_FRAME_SIZE) as u32
    }

    /// Pop a large frame off the free stack via CAS loop. Returns its index.
    fn pop_large_free(&self) -> Option<u32> {
        loop {
            let head = self.large_free_head.load(Ordering::Acquire);
            if head == NIL {
                return None;
            }
            let next = self.descriptors[head as usize].next_index();
            if self
                .large_free_head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(head);
            }
        }
    }

    /// Push a large frame index back onto the free stack.
    fn push_large_free(&self, index: u32) {
        loop {
            let head = self.large_free_head.load(Ordering::Acquire);
            self.descriptors[index as usize].set_next_index(head);
            if self
                .large_free_head
                .compare_exchange(head, index, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Remove `index` from the large free stack if it is on it. Caller
    /// holds `large_lock`, so this walk never races a concurrent push/pop.
    fn unlink_large_free(&self, index: u32) -> bool {
        let head = self.large_free_head.load(Ordering::Acquire);
        if head == index {
            self.large_free_head
                .store(self.descriptors[index as usize].next_index(), Ordering::Release);
            return true;
        }
        let mut cursor = head;
        while cursor != NIL {
            let next = self.descriptors[cursor as usize].next_index();
            if next == index {
                self.descriptors[cursor as usize].set_next_index(self.descriptors[index as usize].next_index());
                return true;
            }
            cursor = next;
        }
        false
    }

    /// Exclusive end of this space's physical range.
    fn allocation_end(&self) -> u64 {
        self.base.as_u64() + self.large_count as u64 * LARGE_FRAME_SIZE
    }

    fn matches_address_magnitude(&self, magnitude: AddressMagnitude) -> bool {
        match magnitude {
            AddressMagnitude::Any => true,
            AddressMagnitude::Below4G => self.allocation_end() <= (1u64 << 32),
        }
    }

    fn split_page_mut(&self, large_index: u32) -> &'static mut SplitPage {
        let base = self.large_base(large_index);
        let virt = phys_to_virt(base);
        // SAFETY: `base` is the backing frame of a `Split` or `Full` large
        // frame, whose first sub-frame was written as a `SplitPage` by
        // `split_large`; the split lock is held by every caller.
        unsafe { &mut *virt.as_mut_ptr::<SplitPage>() }
    }

    fn unlink_split_list(&self, index: u32, desc: &LargeFrameDescriptor) {
        let (prev, next) = desc.split_links();
        if prev != NIL {
            self.descriptors[prev as usize].set_split_links(
                self.descriptors[prev as usize].split_links().0,
                next,
            );
        } else {
            self.split_list_head.store(next, Ordering::Release);
        }
        if next != NIL {
            let (next_prev, next_next) = self.descriptors[next as usize].split_links();
            let _ = next_prev;
            self.descriptors[next as usize].set_split_links(prev, next_next);
        }
        desc.set_split_links(NIL, NIL);
        let _ = index;
    }

    fn push_split_list(&self, index: u32, desc: &LargeFrameDescriptor) {
        let old_head = self.split_list_head.load(Ordering::Acquire);
        desc.set_split_links(NIL, old_head);
        if old_head != NIL {
            let (_, old_next) = self.descriptors[old_head as usize].split_links();
            self.descriptors[old_head as usize].set_split_links(index, old_next);
        }
        self.split_list_head.store(index, Ordering::Release);
    }

    /// Split large frame `index`: carve its own first sub-frame into a
    /// `SplitPage`, mark every other sub-frame free, and move it from the
    /// large free stack onto the split list. Caller holds `large_lock` and
    /// `split_lock`.
    fn split_large(&self, index: u32) {
        let page = self.split_page_mut(index);
        page.init_in_place();
        let desc = &self.descriptors[index as usize];
        desc.set_status(LargeStatus::Split);
        desc.set_split_free_count((SUB_FRAMES_PER_LARGE - 1) as u16);
        desc.set_split_next_free(1);
        self.push_split_list(index, desc);
    }

    /// Allocate one small frame from any split frame with room, splitting a
    /// fresh large frame first if none exists.
    fn allocate_small(&self, reference_count: u32) -> Option<PhysicalAddress> {
        let _large_guard = self.large_lock.lock();
        let _split_guard = self.split_lock.lock();

        let large_index = match self.split_list_head.load(Ordering::Acquire) {
            NIL => {
                let fresh = self.pop_large_free()?;
                self.split_large(fresh);
                fresh
            }
            head => head,
        };

        let desc = &self.descriptors[large_index as usize];
        let page = self.split_page_mut(large_index);
        let sub_index = desc.split_next_free();
        debug_assert_ne!(sub_index, RESERVED_SUB_INDEX);
        let next_free = page.sub[sub_index as usize].next_index();
        page.sub[sub_index as usize].set_status(SmallStatus::Used);
        page.sub[sub_index as usize].set_reference_count(reference_count.max(1) as u16);
        desc.set_split_next_free(next_free);
        let remaining = desc.split_free_count() - 1;
        desc.set_split_free_count(remaining);

        if remaining == 0 {
            self.unlink_split_list(large_index, desc);
            desc.set_status(LargeStatus::Full);
        }

        Some(SplitPage::sub_frame_address(
            self.large_base(large_index),
            sub_index,
        ))
    }

    /// Free a small frame previously handed out by [`Self::allocate_small`].
    fn free_small(&self, addr: PhysicalAddress) -> KernelResult<()> {
        let large_index = self.large_index_of(addr);
        let offset = addr.as_u64() - self.large_base(large_index).as_u64();
        let sub_index = (offset / SMALL_FRAME_SIZE) as u16;
        if sub_index == RESERVED_SUB_INDEX {
            return Err(KernelError::InvalidArgument);
        }

        let _large_guard = self.large_lock.lock();
        let _split_guard = self.split_lock.lock();

        let desc = &self.descriptors[large_index as usize];
        let status = desc.status();
        if status != LargeStatus::Split && status != LargeStatus::Full {
            return Err(KernelError::DoubleFree);
        }
        let page = self.split_page_mut(large_index);
        if page.sub[sub_index as usize].status() != SmallStatus::Used {
            return Err(KernelError::DoubleFree);
        }
        page.sub[sub_index as usize].set_status(SmallStatus::Free);
        page.sub[sub_index as usize].set_reference_count(0);
        page.sub[sub_index as usize].set_next_index(desc.split_next_free());
        desc.set_split_next_free(sub_index);
        let free_count = desc.split_free_count() + 1;
        desc.set_split_free_count(free_count);

        if status == LargeStatus::Full {
            self.push_split_list(large_index, desc);
            desc.set_status(LargeStatus::Split);
        }

        // All sub-frames but the reserved descriptor page are free: coalesce
        // back into one large free frame.
        if free_count as usize == SUB_FRAMES_PER_LARGE - 1 {
            self.unlink_split_list(large_index, desc);
            desc.set_status(LargeStatus::Free);
            desc.set_split_free_count(0);
            self.push_large_free(large_index);
        }

        Ok(())
    }

    fn allocate_large(&self, reference_count: u32) -> Option<PhysicalAddress> {
        let _guard = self.large_lock.lock();
        let index = self.pop_large_free()?;
        let desc = &self.descriptors[index as usize];
        desc.set_status(LargeStatus::Used);
        desc.set_reference_count(reference_count.max(1));
        Some(self.large_base(index))
    }

    fn free_large(&self, addr: PhysicalAddress) -> KernelResult<()> {
        let index = self.large_index_of(addr);
        let _guard = self.large_lock.lock();
        let desc = &self.descriptors[index as usize];
        if desc.status() != LargeStatus::Used {
            return Err(KernelError::DoubleFree);
        }
        desc.set_status(LargeStatus::Free);
        desc.set_reference_count(0);
        self.push_large_free(index);
        Ok(())
    }

    fn adjust_reference_count(&self, addr: PhysicalAddress, diff: i32) -> KernelResult<u32> {
        let large_index = self.large_index_of(addr);
        let desc = &self.descriptors[large_index as usize];
        match desc.status() {
            LargeStatus::Used => Ok(desc.adjust_reference_count(diff)),
            LargeStatus::Split | LargeStatus::Full => {
                let _guard = self.split_lock.lock();
                let offset = addr.as_u64() - self.large_base(large_index).as_u64();
                let sub_index = (offset / SMALL_FRAME_SIZE) as usize;
                let page = self.split_page_mut(large_index);
                Ok(page.sub[sub_index].adjust_reference_count(diff) as u32)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Try to reserve every large frame overlapping `[start, end)`. On
    /// partial failure, frames already reserved by this call are rolled
    /// back to `Free` before returning the error.
    fn reserve_range(&self, start: PhysicalAddress, end: PhysicalAddress) -> KernelResult<()> {
        let clamp_start = start.as_u64().max(self.base.as_u64());
        let clamp_end = end.as_u64().min(self.allocation_end());
        if clamp_start >= clamp_end {
            return Ok(());
        }

        let first = self.large_index_of(PhysicalAddress::new(clamp_start));
        let last = self.large_index_of(PhysicalAddress::new(clamp_end - 1));

        let _guard = self.large_lock.lock();
        let mut reserved = Vec::new();
        for index in first..=last {
            let desc = &self.descriptors[index as usize];
            if desc.cas_status(LargeStatus::Free, LargeStatus::Reserved) {
                // Must come out of the free stack too, or `pop_large_free`
                // can still hand this index out as `Used` while it reads
                // `Reserved`.
                self.unlink_large_free(index);
                reserved.push(index);
            } else if desc.status() != LargeStatus::Reserved {
                for rolled_back in reserved {
                    self.descriptors[rolled_back as usize].set_status(LargeStatus::Free);
                    self.push_large_free(rolled_back);
                }
                return Err(KernelError::RangeUnavailable);
            }
        }
        Ok(())
    }
}

/// The physical memory manager: an ordered set of allocation spaces.
pub struct Pmm {
    spaces: Vec<AllocationSpace>,
}

impl Pmm {
    fn space_for(&self, addr: PhysicalAddress) -> KernelResult<&AllocationSpace> {
        self.spaces
            .iter()
            .find(|space| space.contains(addr))
            .ok_or(KernelError::InvalidArgument)
    }

    /// Allocate one physical frame of the given size, restricted to spaces
    /// matching `address_magnitude`, with its reference count initialised to
    /// `max(1, reference_count)`.
    pub fn allocate_frame(
        &self,
        magnitude: FrameMagnitude,
        address_magnitude: AddressMagnitude,
        reference_count: u32,
    ) -> KernelResult<PhysicalAddress> {
        let start = crate::bench::read_timestamp();
        let eligible = |space: &&AllocationSpace| space.matches_address_magnitude(address_magnitude);
        let result = match magnitude {
            FrameMagnitude::Large => self
                .spaces
                .iter()
                .filter(eligible)
                .find_map(|space| space.allocate_large(reference_count))
                .ok_or(KernelError::OutOfMemory),
            FrameMagnitude::Small => self
                .spaces
                .iter()
                .filter(eligible)
                .find_map(|space| space.allocate_small(reference_count))
                .ok_or(KernelError::OutOfMemory),
            FrameMagnitude::Any => self
                .spaces
                .iter()
                .filter(eligible)
                .find_map(|space| space.allocate_large(reference_count))
                .or_else(|| {
                    self.spaces
                        .iter()
                        .filter(eligible)
                        .find_map(|space| space.allocate_small(reference_count))
                })
                .ok_or(KernelError::OutOfMemory),
        };
        let _elapsed = crate::bench::read_timestamp() - start;
        result
    }

    /// Free a previously allocated frame. `ignore_reference_count` bypasses
    /// reference-count bookkeeping and frees unconditionally (used for
    /// frames the caller knows are uniquely owned).
    pub fn free_frame(
        &self,
        addr: PhysicalAddress,
        size: PageSize,
        ignore_reference_count: bool,
    ) -> KernelResult<()> {
        let space = self.space_for(addr)?;
        if !ignore_reference_count {
            let remaining = space.adjust_reference_count(addr, -1)?;
            if remaining > 0 {
                return Ok(());
            }
        }
        match size {
            PageSize::Large => space.free_large(addr),
            PageSize::Small => space.free_small(addr),
        }
    }

    pub fn adjust_reference_count(&self, addr: PhysicalAddress, diff: i32) -> KernelResult<u32> {
        self.space_for(addr)?.adjust_reference_count(addr, diff)
    }

    /// Reserve every frame overlapping `[start, end)` across every space, in
    /// address order, atomically from the caller's perspective: a later
    /// space's failure rolls back every space reserved earlier in this call.
    pub fn reserve_range(&self, start: PhysicalAddress, end: PhysicalAddress) -> KernelResult<()> {
        let mut committed = Vec::new();
        for space in &self.spaces {
            match space.reserve_range(start, end) {
                Ok(()) => committed.push(space),
                Err(e) => {
                    rollback_reserved(&committed, start, end);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Undo a successful `reserve_range` on every space already committed when a
/// later space in the same call fails.
fn rollback_reserved(spaces: &[&AllocationSpace], start: PhysicalAddress, end: PhysicalAddress) {
    for space in spaces {
        let clamp_start = start.as_u64().max(space.base.as_u64());
        let clamp_end = end.as_u64().min(space.allocation_end());
        if clamp_start >= clamp_end {
            continue;
        }
        let first = space.large_index_of(PhysicalAddress::new(clamp_start));
        let last = space.large_index_of(PhysicalAddress::new(clamp_end - 1));
        let _guard = space.large_lock.lock();
        for index in first..=last {
            let desc = &space.descriptors[index as usize];
            if desc.status() == LargeStatus::Reserved {
                desc.set_status(LargeStatus::Free);
                space.push_large_free(index);
            }
        }
    }
}

static PMM: OnceLock<Pmm> = OnceLock::new();

/// Build the allocation spaces from the bootloader's usable-memory ranges.
pub fn init(usable_ranges: &[(PhysicalAddress, PhysicalAddress)]) {
    let spaces = usable_ranges
        .iter()
        .filter(|(start, end)| end.as_u64() > start.as_u64())
        .map(|(start, end)| {
            let aligned_start = start.align_down(LARGE_FRAME_SIZE).offset(
                if start.is_aligned(LARGE_FRAME_SIZE) {
                    0
                } else {
                    LARGE_FRAME_SIZE
                },
            );
            let size = end.as_u64().saturating_sub(aligned_start.as_u64());
            AllocationSpace::new(aligned_start, size)
        })
        .collect();
    let _ = PMM.set(Pmm { spaces });
}

/// Borrow the global PMM. Panics if [`init`] has not run yet.
pub fn pmm() -> &'static Pmm {
    PMM.get().expect("PMM accessed before mm::init")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_space() -> AllocationSpace {
        super::super::set_phys_mem_offset(0xFFFF_8000_0000_0000);
        AllocationSpace::new(PhysicalAddress::new(0), 4 * LARGE_FRAME_SIZE)
    }

    #[test]
    fn large_allocate_and_free_round_trips() {
        let space = test_space();
        let a = space.allocate_large(1).expect("space should have free large frames");
        let b = space.allocate_large(1).expect("space should still have free large frames");
        assert_ne!(a, b);
        space.free_large(a).unwrap();
        let c = space.allocate_large(1).expect("freed frame should be reusable");
        assert_eq!(a, c);
    }

    #[test]
    fn splitting_then_exhausting_coalesces_back() {
        let space = test_space();
        let mut allocated = Vec::new();
        // SUB_FRAMES_PER_LARGE - 1 usable sub-frames per split large frame.
        for _ in 0..(SUB_FRAMES_PER_LARGE - 1) {
            allocated.push(space.allocate_small(1).expect("split frame has room"));
        }
        assert_eq!(
            space.descriptors[0].status(),
            LargeStatus::Full,
            "all sub-frames consumed should mark the large frame Full"
        );
        for addr in allocated {
            space.free_small(addr).unwrap();
        }
        assert_eq!(
            space.descriptors[0].status(),
            LargeStatus::Free,
            "freeing every sub-frame should coalesce back to a whole large frame"
        );
    }

    #[test]
    fn double_free_of_small_frame_is_rejected() {
        let space = test_space();
        let addr = space.allocate_small(1).unwrap();
        space.free_small(addr).unwrap();
        assert!(space.free_small(addr).is_err());
    }

    #[test]
    fn reserve_range_unlinks_frame_from_large_free_stack() {
        let space = test_space();
        let target = space.large_free_head.load(Ordering::Acquire);
        let start = space.large_base(target);
        let end = PhysicalAddress::new(start.as_u64() + LARGE_FRAME_SIZE);
        space.reserve_range(start, end).unwrap();
        assert_eq!(
            space.descriptors[target as usize].status(),
            LargeStatus::Reserved
        );
        for _ in 0..(space.large_count - 1) {
            let index = space.pop_large_free().expect("remaining frames still free");
            assert_ne!(index, target, "reserved frame must not be reachable from the free stack");
        }
        assert_eq!(space.pop_large_free(), None);
    }

    #[test]
    fn reserve_range_rejects_overlap_with_in_use_frame() {
        let space = test_space();
        let used = space.allocate_large(1).unwrap();
        let start = used;
        let end = PhysicalAddress::new(used.as_u64() + LARGE_FRAME_SIZE);
        assert!(space.reserve_range(start, end).is_err());
    }
}
