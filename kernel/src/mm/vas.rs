//! Virtual address space: an AVL tree of non-overlapping memory regions,
//! keyed by start address, guarded by a reader-writer lock.
//!
//! The tree is arena-allocated: nodes live in a `Vec<RegionNode>` and
//! reference each other by `u32` index rather than by pointer, so there is
//! no parent back-pointer to keep consistent during rotation (the design
//! notes call this out explicitly — a pointer-based tree here would need a
//! parent link purely to make rotations cheap, which reintroduces the cycle
//! the arena is meant to avoid). Removed nodes are pushed onto a free list
//! and reused by later insertions instead of shrinking the vector.

#![allow(dead_code)]

extern crate alloc;

use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::RwTicketLock;

use super::VirtualAddress;

const NIL: u32 = u32::MAX;

bitflags! {
    /// Permission and scope flags carried by a [`MemoryRegion`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u8 {
        /// Mapped identically into every process's top-level table.
        const GLOBAL     = 1 << 0;
        const USERLAND   = 1 << 1;
        const WRITABLE   = 1 << 2;
        const EXECUTABLE = 1 << 3;
    }
}

/// How a region's pages are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    /// A physical frame is mapped for every page up front.
    Committed,
    /// No page-table entry exists until the first compatible fault.
    AllocateOnDemand,
    /// Virtual address is taken but deliberately left unmapped (guard
    /// pages, reservations); any access faults.
    Reserved,
}

/// What a region is used for, purely descriptive (surfaces in diagnostics
/// and decides eligibility for canonical merging alongside flags/type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionContent {
    Generic,
    ThreadStack,
    HandleTable,
    KernelHeap,
    IsaDma,
}

/// A read-only snapshot of one region, returned from lookups. The tree
/// itself stays behind the lock; callers never get a live reference into
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: MemoryFlags,
    pub kind: RegionType,
    pub content: RegionContent,
}

impl MemoryRegion {
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.start.as_u64() && addr.as_u64() < self.end.as_u64()
    }

    fn mergeable_with(&self, other: &MemoryRegion) -> bool {
        self.flags == other.flags && self.kind == other.kind && self.content == other.content
    }
}

struct RegionNode {
    start: u64,
    end: u64,
    flags: MemoryFlags,
    kind: RegionType,
    content: RegionContent,
    left: u32,
    right: u32,
    height: i32,
}

impl RegionNode {
    fn region(&self) -> MemoryRegion {
        MemoryRegion {
            start: VirtualAddress::new(self.start),
            end: VirtualAddress::new(self.end),
            flags: self.flags,
            kind: self.kind,
            content: self.content,
        }
    }
}

/// Arena-allocated AVL tree of [`RegionNode`]s, ordered by `start`.
struct RegionTree {
    nodes: Vec<RegionNode>,
    free: Vec<u32>,
    root: u32,
}

fn height(nodes: &[RegionNode], index: u32) -> i32 {
    if index == NIL {
        0
    } else {
        nodes[index as usize].height
    }
}

fn update_height(nodes: &mut [RegionNode], index: u32) {
    let (l, r) = (nodes[index as usize].left, nodes[index as usize].right);
    nodes[index as usize].height = 1 + height(nodes, l).max(height(nodes, r));
}

fn balance_factor(nodes: &[RegionNode], index: u32) -> i32 {
    let (l, r) = (nodes[index as usize].left, nodes[index as usize].right);
    height(nodes, l) - height(nodes, r)
}

/// Right rotation around `index`, returning the new subtree root.
fn rotate_right(nodes: &mut [RegionNode], index: u32) -> u32 {
    let left = nodes[index as usize].left;
    let left_right = nodes[left as usize].right;
    nodes[left as usize].right = index;
    nodes[index as usize].left = left_right;
    update_height(nodes, index);
    update_height(nodes, left);
    left
}

/// Left rotation around `index`, returning the new subtree root.
fn rotate_left(nodes: &mut [RegionNode], index: u32) -> u32 {
    let right = nodes[index as usize].right;
    let right_left = nodes[right as usize].left;
    nodes[right as usize].left = index;
    nodes[index as usize].right = right_left;
    update_height(nodes, index);
    update_height(nodes, right);
    right
}

fn rebalance(nodes: &mut [RegionNode], index: u32) -> u32 {
    update_height(nodes, index);
    let bf = balance_factor(nodes, index);

    if bf > 1 {
        let left = nodes[index as usize].left;
        if balance_factor(nodes, left) < 0 {
            nodes[index as usize].left = rotate_left(nodes, left);
        }
        return rotate_right(nodes, index);
    }
    if bf < -1 {
        let right = nodes[index as usize].right;
        if balance_factor(nodes, right) > 0 {
            nodes[index as usize].right = rotate_right(nodes, right);
        }
        return rotate_left(nodes, index);
    }
    index
}

impl RegionTree {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
        }
    }

    fn alloc_node(&mut self, start: u64, end: u64, flags: MemoryFlags, kind: RegionType, content: RegionContent) -> u32 {
        let node = RegionNode {
            start,
            end,
            flags,
            kind,
            content,
            left: NIL,
            right: NIL,
            height: 1,
        };
        if let Some(index) = self.free.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    /// Find the region, if any, whose `[start, end)` contains `addr`.
    fn find(&self, addr: u64) -> Option<MemoryRegion> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if addr < node.start {
                cur = node.left;
            } else if addr >= node.end {
                cur = node.right;
            } else {
                return Some(node.region());
            }
        }
        None
    }

    /// True if `[start, end)` overlaps any existing region.
    fn overlaps(&self, start: u64, end: u64) -> bool {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if end <= node.start {
                cur = node.left;
            } else if start >= node.end {
                cur = node.right;
            } else {
                return true;
            }
        }
        false
    }

    /// Insert `[start, end)`, merging with an immediately adjacent region of
    /// identical flags/type/content if one exists on either side.
    fn insert(
        &mut self,
        mut start: u64,
        mut end: u64,
        flags: MemoryFlags,
        kind: RegionType,
        content: RegionContent,
    ) -> KernelResult<()> {
        if self.overlaps(start, end) {
            return Err(KernelError::RegionOverlap);
        }
        let candidate = MemoryRegion {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
            flags,
            kind,
            content,
        };
        if let Some(left_neighbor) = self.adjacent_region_ending_at(start) {
            if left_neighbor.mergeable_with(&candidate) {
                start = left_neighbor.start.as_u64();
                self.remove(left_neighbor.start.as_u64());
            }
        }
        if let Some(right_neighbor) = self.adjacent_region_starting_at(end) {
            if right_neighbor.mergeable_with(&candidate) {
                end = right_neighbor.end.as_u64();
                self.remove(right_neighbor.start.as_u64());
            }
        }
        self.root = self.insert_at(self.root, start, end, flags, kind, content);
        Ok(())
    }

    /// The region (if any) whose `end` is exactly `addr`. Since regions
    /// never overlap, that region — if it exists — is the one containing
    /// `addr - 1`, so this reuses the ordinary BST search rather than
    /// scanning by a key the tree isn't ordered on.
    fn adjacent_region_ending_at(&self, addr: u64) -> Option<MemoryRegion> {
        if addr == 0 {
            return None;
        }
        self.find(addr - 1).filter(|r| r.end.as_u64() == addr)
    }

    fn adjacent_region_starting_at(&self, addr: u64) -> Option<MemoryRegion> {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if node.start == addr {
                return Some(node.region());
            } else if addr < node.start {
                cur = node.left;
            } else {
                cur = node.right;
            }
        }
        None
    }

    fn insert_at(
        &mut self,
        index: u32,
        start: u64,
        end: u64,
        flags: MemoryFlags,
        kind: RegionType,
        content: RegionContent,
    ) -> u32 {
        if index == NIL {
            return self.alloc_node(start, end, flags, kind, content);
        }
        if start < self.nodes[index as usize].start {
            let left = self.nodes[index as usize].left;
            let new_left = self.insert_at(left, start, end, flags, kind, content);
            self.nodes[index as usize].left = new_left;
        } else {
            let right = self.nodes[index as usize].right;
            let new_right = self.insert_at(right, start, end, flags, kind, content);
            self.nodes[index as usize].right = new_right;
        }
        rebalance(&mut self.nodes, index)
    }

    /// Remove the region whose start address is exactly `start`.
    fn remove(&mut self, start: u64) -> Option<MemoryRegion> {
        let mut removed = None;
        self.root = self.remove_at(self.root, start, &mut removed);
        removed
    }

    fn remove_at(&mut self, index: u32, start: u64, removed: &mut Option<MemoryRegion>) -> u32 {
        if index == NIL {
            return NIL;
        }
        if start < self.nodes[index as usize].start {
            let left = self.nodes[index as usize].left;
            let new_left = self.remove_at(left, start, removed);
            self.nodes[index as usize].left = new_left;
        } else if start > self.nodes[index as usize].start {
            let right = self.nodes[index as usize].right;
            let new_right = self.remove_at(right, start, removed);
            self.nodes[index as usize].right = new_right;
        } else {
            *removed = Some(self.nodes[index as usize].region());
            let (left, right) = (self.nodes[index as usize].left, self.nodes[index as usize].right);
            if left == NIL {
                self.free.push(index);
                return right;
            } else if right == NIL {
                self.free.push(index);
                return left;
            }
            // Two children: replace with the in-order successor (leftmost
            // of the right subtree), then delete that successor from the
            // right subtree.
            let mut succ = right;
            while self.nodes[succ as usize].left != NIL {
                succ = self.nodes[succ as usize].left;
            }
            let succ_start = self.nodes[succ as usize].start;
            let succ_end = self.nodes[succ as usize].end;
            let succ_flags = self.nodes[succ as usize].flags;
            let succ_kind = self.nodes[succ as usize].kind;
            let succ_content = self.nodes[succ as usize].content;
            let mut dummy = None;
            let new_right = self.remove_at(right, succ_start, &mut dummy);
            self.nodes[index as usize].right = new_right;
            self.nodes[index as usize].start = succ_start;
            self.nodes[index as usize].end = succ_end;
            self.nodes[index as usize].flags = succ_flags;
            self.nodes[index as usize].kind = succ_kind;
            self.nodes[index as usize].content = succ_content;
        }
        rebalance(&mut self.nodes, index)
    }

    /// Largest gap of at least `size` bytes within `[lo, hi)`, scanning
    /// in-order. First-fit: returns the first gap found, not necessarily
    /// the smallest or largest.
    fn first_fit_gap(&self, lo: u64, hi: u64, size: u64) -> Option<u64> {
        let mut cursor = lo;
        let mut found = None;
        self.in_order(self.root, &mut |region| {
            if found.is_some() {
                return;
            }
            let start = region.start.as_u64().max(lo);
            let end = region.end.as_u64().min(hi);
            if start > cursor && start - cursor >= size {
                found = Some(cursor);
                return;
            }
            if end > cursor {
                cursor = end;
            }
        });
        if found.is_none() && hi.saturating_sub(cursor) >= size {
            found = Some(cursor);
        }
        found
    }

    fn in_order(&self, index: u32, visit: &mut impl FnMut(MemoryRegion)) {
        if index == NIL {
            return;
        }
        self.in_order(self.nodes[index as usize].left, visit);
        visit(self.nodes[index as usize].region());
        self.in_order(self.nodes[index as usize].right, visit);
    }
}

/// One process's (or the kernel's) virtual address space: the region tree
/// plus the monotonic cursor that hands out fresh kernel-heap ranges.
pub struct VirtualAddressSpace {
    tree: RwTicketLock<RegionTree>,
    heap_cursor: AtomicU64,
    heap_start: u64,
    heap_end: u64,
}

impl VirtualAddressSpace {
    pub fn new(heap_start: u64, heap_end: u64) -> Self {
        Self {
            tree: RwTicketLock::new(RegionTree::new()),
            heap_cursor: AtomicU64::new(heap_start),
            heap_start,
            heap_end,
        }
    }

    /// Insert a region covering `[start, end)`, merging with adjacent
    /// compatible neighbors.
    pub fn insert_region(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: MemoryFlags,
        kind: RegionType,
        content: RegionContent,
    ) -> KernelResult<()> {
        self.tree
            .write()
            .insert(start.as_u64(), end.as_u64(), flags, kind, content)
    }

    /// Remove the region starting exactly at `start`.
    pub fn remove_region(&self, start: VirtualAddress) -> KernelResult<MemoryRegion> {
        self.tree
            .write()
            .remove(start.as_u64())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Region containing `addr`, if any.
    pub fn find_region(&self, addr: VirtualAddress) -> Option<MemoryRegion> {
        self.tree.read().find(addr.as_u64())
    }

    /// Bump-allocate a fresh range of `size` bytes from the kernel-heap
    /// cursor. The cursor never rewinds; `remove_region` (via `FreePages`)
    /// only ever drops the tree's bookkeeping for a range, it does not
    /// return the range to circulation here.
    pub fn bump_heap_range(&self, size: u64) -> KernelResult<VirtualAddress> {
        let start = self.heap_cursor.fetch_add(size, Ordering::AcqRel);
        if start + size > self.heap_end {
            return Err(KernelError::AddressSpaceExhausted);
        }
        Ok(VirtualAddress::new(start))
    }

    /// First-fit free range of `size` bytes within `[lo, hi)`, scanning the
    /// region tree. Used for user-space `AllocatePages` requests, which
    /// (unlike the kernel heap) may reuse ranges freed by `FreePages`.
    pub fn find_free_range(&self, lo: u64, hi: u64, size: u64) -> KernelResult<VirtualAddress> {
        self.tree
            .read()
            .first_fit_gap(lo, hi, size)
            .map(VirtualAddress::new)
            .ok_or(KernelError::AddressSpaceExhausted)
    }

    pub fn heap_bounds(&self) -> (u64, u64) {
        (self.heap_start, self.heap_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: u64) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn insert_and_find_region() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        vas.insert_region(
            va(0x2000),
            va(0x3000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::Generic,
        )
        .unwrap();
        let found = vas.find_region(va(0x2500)).expect("address inside region");
        assert_eq!(found.start, va(0x2000));
        assert_eq!(found.end, va(0x3000));
        assert!(vas.find_region(va(0x3500)).is_none());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        vas.insert_region(
            va(0x2000),
            va(0x4000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::Generic,
        )
        .unwrap();
        let err = vas
            .insert_region(
                va(0x3000),
                va(0x5000),
                MemoryFlags::WRITABLE,
                RegionType::Committed,
                RegionContent::Generic,
            )
            .unwrap_err();
        assert_eq!(err, KernelError::RegionOverlap);
    }

    #[test]
    fn adjacent_matching_regions_merge() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        vas.insert_region(
            va(0x2000),
            va(0x3000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::ThreadStack,
        )
        .unwrap();
        vas.insert_region(
            va(0x3000),
            va(0x4000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::ThreadStack,
        )
        .unwrap();
        let merged = vas.find_region(va(0x3500)).unwrap();
        assert_eq!(merged.start, va(0x2000));
        assert_eq!(merged.end, va(0x4000));
    }

    #[test]
    fn remove_then_reinsert_same_range() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        vas.insert_region(
            va(0x2000),
            va(0x3000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::Generic,
        )
        .unwrap();
        vas.remove_region(va(0x2000)).unwrap();
        assert!(vas.find_region(va(0x2500)).is_none());
        vas.insert_region(
            va(0x2000),
            va(0x3000),
            MemoryFlags::EXECUTABLE,
            RegionType::Reserved,
            RegionContent::Generic,
        )
        .unwrap();
        assert!(vas.find_region(va(0x2500)).is_some());
    }

    #[test]
    fn heap_cursor_never_rewinds() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        let a = vas.bump_heap_range(0x100).unwrap();
        let b = vas.bump_heap_range(0x100).unwrap();
        assert!(b.as_u64() >= a.as_u64() + 0x100);
    }

    #[test]
    fn many_insertions_stay_balanced_and_searchable() {
        let vas = VirtualAddressSpace::new(0x1000, 0x1000_0000);
        for i in 0..64u64 {
            let start = 0x10000 + i * 0x2000;
            vas.insert_region(
                va(start),
                va(start + 0x1000),
                MemoryFlags::WRITABLE,
                RegionType::AllocateOnDemand,
                RegionContent::Generic,
            )
            .unwrap();
        }
        for i in 0..64u64 {
            let start = 0x10000 + i * 0x2000;
            assert!(vas.find_region(va(start)).is_some());
            assert!(vas.find_region(va(start + 0x1800)).is_none());
        }
    }

    #[test]
    fn find_free_range_skips_occupied_gaps() {
        let vas = VirtualAddressSpace::new(0x1000, 0x10000);
        vas.insert_region(
            va(0x1000),
            va(0x2000),
            MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::Generic,
        )
        .unwrap();
        let free = vas.find_free_range(0x1000, 0x5000, 0x1000).unwrap();
        assert_eq!(free, va(0x2000));
    }
}
