//! 4-level x86-64 page tables.
//!
//! Entry layout follows the standard AMD64 PTE with two extensions the
//! hardware leaves unused (bits available to software): bit 10 is the
//! *content lock* and bit 11 is the *properties lock*, the two per-mapping
//! locks the fault path and `SetPageFlags` take before touching a mapping's
//! backing frame or its flags respectively.

#![allow(dead_code)]

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::{phys_to_virt, PhysicalAddress, VirtualAddress};

pub const PAGE_TABLE_ENTRIES: usize = 512;

bitflags! {
    /// Software- and hardware-defined bits of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT        = 1 << 0;
        const WRITABLE       = 1 << 1;
        const USER           = 1 << 2;
        const WRITE_THROUGH  = 1 << 3;
        const NO_CACHE       = 1 << 4;
        const ACCESSED       = 1 << 5;
        const DIRTY          = 1 << 6;
        const HUGE           = 1 << 7;
        const GLOBAL         = 1 << 8;
        /// Content lock: held while the frame a leaf entry points at is
        /// being replaced (on-demand commit, copy, frame migration).
        const CONTENT_LOCK   = 1 << 10;
        /// Properties lock: held while this entry's own flags are being
        /// changed (`SetPageFlags`, permission narrowing).
        const PROPERTIES_LOCK = 1 << 11;
        const NO_EXECUTE     = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One entry of a page table at any level.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn addr(&self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & ADDR_MASK))
    }

    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PageFlags) {
        self.0 = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        let addr = self.0 & ADDR_MASK;
        self.0 = addr | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn has_lock(&self, lock: PageFlags) -> bool {
        self.0 & lock.bits() != 0
    }

    /// Atomically try to set `lock` (CONTENT_LOCK or PROPERTIES_LOCK) on this
    /// entry, failing if it is already held. Page tables are only ever
    /// mutated under the owning VAS's coarse lock, so this is a plain
    /// read-modify-write rather than a hardware CAS.
    pub fn try_acquire(&mut self, lock: PageFlags) -> bool {
        if self.0 & lock.bits() != 0 {
            false
        } else {
            self.0 |= lock.bits();
            true
        }
    }

    pub fn release(&mut self, lock: PageFlags) {
        self.0 &= !lock.bits();
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::empty()
    }
}

/// A 4 KiB, 512-entry page table at any level of the hierarchy.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); PAGE_TABLE_ENTRIES],
        }
    }

    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// Anything that can hand the page-table walker a fresh, zeroed frame to use
/// as an intermediate table. Implemented by the PMM so the VMM never needs
/// to know about allocation spaces.
pub trait FrameAllocator {
    fn allocate_zeroed_frame(&mut self) -> Option<PhysicalAddress>;
    fn free_frame(&mut self, addr: PhysicalAddress);
}

/// Mutable access to one page-table hierarchy, rooted at a PML4 physical
/// frame. All walks go through [`phys_to_virt`] rather than assuming
/// identity mapping, since intermediate tables live at arbitrary physical
/// addresses discovered at allocation time.
pub struct PageMapper {
    l4_phys: PhysicalAddress,
}

impl PageMapper {
    /// # Safety
    /// `l4_phys` must be the physical address of a valid, zeroed (or
    /// previously-populated) PML4 frame that stays alive for as long as
    /// this mapper is used.
    pub unsafe fn new(l4_phys: PhysicalAddress) -> Self {
        Self { l4_phys }
    }

    pub fn l4_phys(&self) -> PhysicalAddress {
        self.l4_phys
    }

    fn table_at(addr: PhysicalAddress) -> &'static mut PageTable {
        let virt = phys_to_virt(addr);
        // SAFETY: `addr` is a page-table frame obtained either from the
        // root or from a present entry we just walked through; `phys_to_virt`
        // resolves it inside the kernel's direct physical map.
        unsafe { &mut *virt.as_mut_ptr::<PageTable>() }
    }

    fn l4(&self) -> &'static mut PageTable {
        Self::table_at(self.l4_phys)
    }

    /// Walk to (creating as needed) the L1 table that would hold `page`'s
    /// leaf entry, returning that table and the index within it.
    fn walk_create(
        &mut self,
        page: VirtualAddress,
        allocator: &mut impl FrameAllocator,
    ) -> Result<(&'static mut PageTable, usize), &'static str> {
        let [l4i, l3i, l2i, l1i] = page.page_table_indices();

        let mut table = self.l4();
        for (level_index, next_is_leaf_level) in
            [(l4i, false), (l3i, false), (l2i, true)].into_iter()
        {
            let entry = &mut table[level_index];
            if !entry.is_present() {
                let frame = allocator
                    .allocate_zeroed_frame()
                    .ok_or("out of memory allocating page-table frame")?;
                entry.set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
            } else if entry.flags().contains(PageFlags::HUGE) {
                return Err("address already mapped by a large page");
            }
            let next_phys = entry.addr().expect("present entry always has an address");
            table = Self::table_at(next_phys);
            let _ = next_is_leaf_level;
        }

        Ok((table, l1i))
    }

    /// Map a single 4 KiB page.
    pub fn map_page(
        &mut self,
        page: VirtualAddress,
        frame: PhysicalAddress,
        flags: PageFlags,
        allocator: &mut impl FrameAllocator,
    ) -> Result<(), &'static str> {
        let (l1, index) = self.walk_create(page, allocator)?;
        let entry = &mut l1[index];
        if entry.is_present() {
            return Err("page already mapped");
        }
        entry.set(frame, flags | PageFlags::PRESENT);
        Ok(())
    }

    /// Unmap a single 4 KiB page, returning the frame it pointed to.
    pub fn unmap_page(&mut self, page: VirtualAddress) -> Result<PhysicalAddress, &'static str> {
        let [l4i, l3i, l2i, l1i] = page.page_table_indices();
        let mut table = self.l4();
        for level_index in [l4i, l3i, l2i] {
            let entry = &table[level_index];
            if !entry.is_present() {
                return Err("page not mapped");
            }
            let next = entry.addr().unwrap();
            table = Self::table_at(next);
        }
        let entry = &mut table[l1i];
        let frame = entry.addr().ok_or("page not mapped")?;
        entry.clear();
        Ok(frame)
    }

    /// Look up the current mapping for `page` without modifying it.
    pub fn translate(&self, page: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        let [l4i, l3i, l2i, l1i] = page.page_table_indices();
        let mut table = self.l4();
        for level_index in [l4i, l3i, l2i] {
            let entry = &table[level_index];
            if !entry.is_present() {
                return None;
            }
            table = Self::table_at(entry.addr().unwrap());
        }
        let entry = &table[l1i];
        entry.addr().map(|addr| (addr, entry.flags()))
    }

    /// Change the flags on an already-present leaf entry, taking the
    /// properties lock for the duration.
    pub fn set_flags(&mut self, page: VirtualAddress, flags: PageFlags) -> Result<(), &'static str> {
        let [l4i, l3i, l2i, l1i] = page.page_table_indices();
        let mut table = self.l4();
        for level_index in [l4i, l3i, l2i] {
            let entry = &table[level_index];
            if !entry.is_present() {
                return Err("page not mapped");
            }
            table = Self::table_at(entry.addr().unwrap());
        }
        let entry = &mut table[l1i];
        if !entry.is_present() {
            return Err("page not mapped");
        }
        if !entry.try_acquire(PageFlags::PROPERTIES_LOCK) {
            return Err("properties lock held");
        }
        let addr = entry.addr().unwrap();
        entry.set(addr, flags | PageFlags::PRESENT);
        entry.release(PageFlags::PROPERTIES_LOCK);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_addr_and_flags() {
        let mut entry = PageTableEntry::empty();
        assert!(entry.is_unused());
        entry.set(PhysicalAddress::new(0x2000), PageFlags::PRESENT | PageFlags::WRITABLE);
        assert_eq!(entry.addr(), Some(PhysicalAddress::new(0x2000)));
        assert!(entry.flags().contains(PageFlags::WRITABLE));
        entry.clear();
        assert!(entry.is_unused());
    }

    #[test]
    fn content_lock_is_exclusive() {
        let mut entry = PageTableEntry::empty();
        entry.set(PhysicalAddress::new(0x3000), PageFlags::PRESENT);
        assert!(entry.try_acquire(PageFlags::CONTENT_LOCK));
        assert!(!entry.try_acquire(PageFlags::CONTENT_LOCK));
        entry.release(PageFlags::CONTENT_LOCK);
        assert!(entry.try_acquire(PageFlags::CONTENT_LOCK));
    }
}
