//! Virtual memory manager.
//!
//! Each address space pairs a [`PageMapper`] (the page-table hierarchy) with
//! a [`VirtualAddressSpace`] (the AVL region tree that remembers what each
//! mapped — or deliberately unmapped — range is for). The mapper's
//! structural mutations (installing intermediate tables) are serialised by
//! a coarse [`TicketLock`]; the region tree has its own reader-writer lock.
//! Individual leaf-entry content/properties locks are acquired by the
//! page-fault path and `SetPageFlags` directly on the entry, not through
//! this outer lock.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::sync::once_lock::OnceLock;
use crate::sync::TicketLock;

use super::page_table::{FrameAllocator as PtFrameAllocator, PageFlags, PageMapper};
use super::pmm::{self, AddressMagnitude, FrameMagnitude};
use super::vas::{MemoryFlags, RegionContent, RegionType, VirtualAddressSpace};
use super::{phys_to_virt, PageSize, PhysicalAddress, VirtualAddress};

/// Identity-mapped ISA-DMA region at the bottom of every address space.
pub const ISA_DMA_SIZE: u64 = 16 * 1024 * 1024;

/// Kernel dynamic-allocation range. Chosen well clear of the identity-mapped
/// low memory and the conventional higher-half split at PML4 index 256
/// (`0xFFFF_8000_0000_0000`).
pub const KERNEL_HEAP_START: u64 = 0xFFFF_9000_0000_0000;
pub const KERNEL_HEAP_END: u64 = 0xFFFF_9000_4000_0000;

/// User address range a process's `AllocatePages(..., VirtualUser, ...)`
/// calls are satisfied from.
pub const USER_REGION_START: u64 = 0x0000_0000_0010_0000;
pub const USER_REGION_END: u64 = 0x0000_7FFF_FFFF_F000;

const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Options accepted by [`allocate_pages`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocationOptions: u32 {
        /// Back every page with a physical frame immediately.
        const COMMIT             = 1 << 0;
        /// Leave page-table entries absent; the fault handler commits on
        /// first compatible access.
        const ALLOCATE_ON_DEMAND = 1 << 1;
        /// Reserve one unmapped guard page immediately before the region.
        const GUARD_LOW          = 1 << 2;
        /// Reserve one unmapped guard page immediately after the region.
        const GUARD_HIGH         = 1 << 3;
        /// Satisfy the request from the process's user region instead of
        /// the shared kernel heap cursor.
        const VIRTUAL_USER       = 1 << 4;
    }
}

fn region_type_of(options: AllocationOptions) -> RegionType {
    if options.contains(AllocationOptions::ALLOCATE_ON_DEMAND) {
        RegionType::AllocateOnDemand
    } else if options.contains(AllocationOptions::COMMIT) {
        RegionType::Committed
    } else {
        RegionType::Reserved
    }
}

/// Translate a region's bookkeeping flags into the page-table entry bits a
/// mapping for it should carry. Mirrors [`super::page_fault::commit_page`]'s
/// translation, since both paths are committing a frame into a region with
/// known `MemoryFlags`.
pub(crate) fn page_flags_from_memory_flags(flags: MemoryFlags) -> PageFlags {
    let mut page_flags = PageFlags::PRESENT;
    if flags.contains(MemoryFlags::WRITABLE) {
        page_flags |= PageFlags::WRITABLE;
    }
    if flags.contains(MemoryFlags::USERLAND) {
        page_flags |= PageFlags::USER;
    }
    if !flags.contains(MemoryFlags::EXECUTABLE) {
        page_flags |= PageFlags::NO_EXECUTE;
    }
    if flags.contains(MemoryFlags::GLOBAL) {
        page_flags |= PageFlags::GLOBAL;
    }
    page_flags
}

/// Bridges the page-table walker's frame needs to the PMM without exposing
/// allocation-space internals to the VMM.
struct PmmFrameAllocator;

impl PtFrameAllocator for PmmFrameAllocator {
    fn allocate_zeroed_frame(&mut self) -> Option<PhysicalAddress> {
        let addr = pmm::pmm()
            .allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)
            .ok()?;
        let virt = phys_to_virt(addr);
        // SAFETY: `addr` was just allocated from the PMM, is exclusively
        // owned by this call, and is frame-sized.
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        Some(addr)
    }

    fn free_frame(&mut self, addr: PhysicalAddress) {
        let _ = pmm::pmm().free_frame(addr, PageSize::Small, true);
    }
}

/// One process's address space (or the distinguished kernel space shared by
/// every process).
pub struct AddressSpace {
    mapper: TicketLock<PageMapper>,
    vas: VirtualAddressSpace,
    is_kernel: bool,
    active_core_count: AtomicU32,
}

impl AddressSpace {
    fn new(l4_phys: PhysicalAddress, is_kernel: bool, heap_start: u64, heap_end: u64) -> Self {
        Self {
            // SAFETY: `l4_phys` was just allocated and zeroed by the caller.
            mapper: TicketLock::new(unsafe { PageMapper::new(l4_phys) }),
            vas: VirtualAddressSpace::new(heap_start, heap_end),
            is_kernel,
            active_core_count: AtomicU32::new(0),
        }
    }

    /// Construct a fresh user address space, sharing no virtual ranges with
    /// the kernel beyond the identity-mapped ISA-DMA page and whatever the
    /// architecture's top-level table structurally must share (kernel PML4
    /// entries are copied in wholesale so every process's higher half is the
    /// current kernel mapping).
    pub fn new_user() -> KernelResult<Self> {
        let l4_phys = pmm::pmm()
            .allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)
            .map_err(|_| KernelError::OutOfMemory)?;
        let virt = phys_to_virt(l4_phys);
        // SAFETY: freshly allocated frame, exclusively owned here.
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        let space = Self::new(l4_phys, false, 0, 0);
        kernel_space().copy_kernel_entries_into(&space);
        Ok(space)
    }

    /// Copy every populated PML4 entry at or above index 256 (the
    /// conventional higher-half split) from this address space into
    /// `other`, so kernel mappings are visible from every process without
    /// per-process page-table maintenance.
    fn copy_kernel_entries_into(&self, other: &AddressSpace) {
        let src = self.mapper.lock();
        let dst = other.mapper.lock();
        // SAFETY: both L4 frames are owned exclusively by their respective
        // locks for the duration of this call.
        let src_table = unsafe { &mut *phys_to_virt(src.l4_phys()).as_mut_ptr::<super::page_table::PageTable>() };
        let dst_table = unsafe { &mut *phys_to_virt(dst.l4_phys()).as_mut_ptr::<super::page_table::PageTable>() };
        for index in 256..super::page_table::PAGE_TABLE_ENTRIES {
            dst_table[index] = src_table[index];
        }
    }

    pub fn vas(&self) -> &VirtualAddressSpace {
        &self.vas
    }

    pub fn l4_phys(&self) -> PhysicalAddress {
        self.mapper.lock().l4_phys()
    }

    /// Build a user-style address space directly from an already-allocated,
    /// zeroed PML4 frame, for use by other modules' tests (the fault-
    /// dispatch tests in particular need an `AddressSpace` without going
    /// through the kernel-space bring-up in [`init`]).
    #[cfg(test)]
    pub(crate) fn new_for_test(l4_phys: PhysicalAddress) -> Self {
        Self::new(l4_phys, false, 0, 0x1_0000_0000)
    }
}

static KERNEL_SPACE: OnceLock<AddressSpace> = OnceLock::new();

/// Bring up the kernel's own address space: a fresh PML4, the identity map
/// for the low ISA-DMA region, and a region tree covering the kernel heap
/// range.
pub fn init() {
    let l4_phys = pmm::pmm()
        .allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)
        .expect("no memory for kernel PML4");
    let virt = phys_to_virt(l4_phys);
    // SAFETY: freshly allocated frame, not yet visible to any other code.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
    let space = AddressSpace::new(l4_phys, true, KERNEL_HEAP_START, KERNEL_HEAP_END);

    let mut allocator = PmmFrameAllocator;
    {
        let mut mapper = space.mapper.lock();
        let mut addr = 0u64;
        while addr < ISA_DMA_SIZE {
            let page = VirtualAddress::new(addr);
            let frame = PhysicalAddress::new(addr);
            let _ = mapper.map_page(
                page,
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL,
                &mut allocator,
            );
            addr += PAGE_SIZE;
        }
    }
    space
        .vas
        .insert_region(
            VirtualAddress::new(0),
            VirtualAddress::new(ISA_DMA_SIZE),
            MemoryFlags::GLOBAL | MemoryFlags::WRITABLE,
            RegionType::Committed,
            RegionContent::IsaDma,
        )
        .expect("ISA-DMA region does not overlap an empty tree");

    let _ = KERNEL_SPACE.set(space);
}

/// Borrow the kernel address space. Panics if [`init`] has not run.
pub fn kernel_space() -> &'static AddressSpace {
    KERNEL_SPACE.get().expect("vmm accessed before mm::init")
}

/// `AllocatePages(process, size, options, flags, content, vaddr)`.
///
/// Rounds `size` up to a whole number of 4 KiB pages, picks a virtual range
/// (from `vaddr` if given, else the kernel heap cursor or — when
/// `VIRTUAL_USER` is set — a first-fit gap in the process's user region),
/// inserts the corresponding region, and either commits physical frames now
/// (`COMMIT`) or leaves the range unmapped for the fault handler
/// (`ALLOCATE_ON_DEMAND`).
pub fn allocate_pages(
    space: &AddressSpace,
    size: u64,
    options: AllocationOptions,
    flags: MemoryFlags,
    content: RegionContent,
    vaddr: Option<VirtualAddress>,
) -> KernelResult<VirtualAddress> {
    let page_count = size.div_ceil(PAGE_SIZE).max(1);
    let region_pages = page_count * PAGE_SIZE;
    let guard_low = options.contains(AllocationOptions::GUARD_LOW);
    let guard_high = options.contains(AllocationOptions::GUARD_HIGH);
    let total = region_pages + if guard_low { PAGE_SIZE } else { 0 } + if guard_high { PAGE_SIZE } else { 0 };

    let range_start = match vaddr {
        Some(v) => v.as_u64(),
        None if options.contains(AllocationOptions::VIRTUAL_USER) => {
            space.vas.find_free_range(USER_REGION_START, USER_REGION_END, total)?.as_u64()
        }
        None => space.vas.bump_heap_range(total)?.as_u64(),
    };

    let mut cursor = range_start;
    if guard_low {
        space.vas.insert_region(
            VirtualAddress::new(cursor),
            VirtualAddress::new(cursor + PAGE_SIZE),
            flags,
            RegionType::Reserved,
            content,
        )?;
        cursor += PAGE_SIZE;
    }
    let region_start = cursor;
    let region_end = cursor + region_pages;
    space
        .vas
        .insert_region(VirtualAddress::new(region_start), VirtualAddress::new(region_end), flags, region_type_of(options), content)?;
    cursor = region_end;
    if guard_high {
        space.vas.insert_region(
            VirtualAddress::new(cursor),
            VirtualAddress::new(cursor + PAGE_SIZE),
            flags,
            RegionType::Reserved,
            content,
        )?;
    }

    if options.contains(AllocationOptions::COMMIT) {
        let page_flags = page_flags_from_memory_flags(flags);
        let mut mapper = space.mapper.lock();
        let mut allocator = PmmFrameAllocator;
        let mut addr = region_start;
        while addr < region_end {
            let frame = pmm::pmm()
                .allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)
                .map_err(|_| KernelError::OutOfMemory)?;
            mapper
                .map_page(VirtualAddress::new(addr), frame, page_flags, &mut allocator)
                .map_err(|_| KernelError::AlreadyMapped)?;
            addr += PAGE_SIZE;
        }
    }

    Ok(VirtualAddress::new(region_start))
}

/// `FreePages(process, vaddr)`: unmaps and frees every committed page in
/// the region starting at `vaddr`, then drops the region from the tree. The
/// virtual range itself is not returned to the kernel heap cursor (only
/// `find_free_range`'s user-region search can reuse it).
pub fn free_pages(space: &AddressSpace, vaddr: VirtualAddress) -> KernelResult<()> {
    let region = space.vas.remove_region(vaddr)?;
    if region.kind == RegionType::Committed {
        let mut mapper = space.mapper.lock();
        let mut addr = region.start.as_u64();
        while addr < region.end.as_u64() {
            if let Ok(frame) = mapper.unmap_page(VirtualAddress::new(addr)) {
                let _ = pmm::pmm().free_frame(frame, PageSize::Small, false);
                tlb::flush_address(VirtualAddress::new(addr));
            }
            addr += PAGE_SIZE;
        }
    }
    Ok(())
}

/// `MapPage(process, vaddr, paddr, flags, desc)`. Increments the physical
/// descriptor's reference count when `track_reference_count` is set.
pub fn map_page(
    space: &AddressSpace,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    flags: PageFlags,
    track_reference_count: bool,
) -> KernelResult<()> {
    let mut mapper = space.mapper.lock();
    let mut allocator = PmmFrameAllocator;
    mapper
        .map_page(vaddr, paddr, flags | PageFlags::PRESENT, &mut allocator)
        .map_err(|_| KernelError::AlreadyMapped)?;
    if track_reference_count {
        let _ = pmm::pmm().adjust_reference_count(paddr, 1);
    }
    Ok(())
}

/// `UnmapPage(process, vaddr) -> (paddr, desc)`.
pub fn unmap_page(space: &AddressSpace, vaddr: VirtualAddress) -> KernelResult<PhysicalAddress> {
    let paddr = {
        let mut mapper = space.mapper.lock();
        mapper.unmap_page(vaddr).map_err(|_| KernelError::NotMapped)?
    };
    tlb::flush_address(vaddr);
    Ok(paddr)
}

/// `Translate(process, vaddr) -> paddr`. Best-effort: does not exclude a
/// concurrent mutator.
pub fn translate(space: &AddressSpace, vaddr: VirtualAddress) -> KernelResult<PhysicalAddress> {
    let mapper = space.mapper.lock();
    mapper.translate(vaddr).map(|(addr, _)| addr).ok_or(KernelError::NotMapped)
}

pub fn get_page_flags(space: &AddressSpace, vaddr: VirtualAddress) -> KernelResult<PageFlags> {
    let mapper = space.mapper.lock();
    mapper.translate(vaddr).map(|(_, flags)| flags).ok_or(KernelError::NotMapped)
}

pub fn set_page_flags(space: &AddressSpace, vaddr: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
    {
        let mut mapper = space.mapper.lock();
        mapper
            .set_flags(vaddr, flags | PageFlags::PRESENT)
            .map_err(|_| KernelError::MappingLocked)?;
    }
    tlb::flush_address(vaddr);
    Ok(())
}

pub fn invalidate_page(vaddr: VirtualAddress) {
    tlb::flush_address(vaddr);
}

/// `Switch(oldProc, newProc)`: adjusts active-core accounting and loads the
/// new top-level table's physical address into the architectural
/// page-table base register. Invalidation of non-global entries happens
/// implicitly as a side effect of the reload.
pub fn switch(old: &AddressSpace, new: &AddressSpace) {
    old.active_core_count.fetch_sub(1, Ordering::AcqRel);
    new.active_core_count.fetch_add(1, Ordering::AcqRel);
    let l4 = new.l4_phys();

    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) l4.as_u64());
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = l4;
}

/// Architecture-specific TLB management.
pub mod tlb {
    use super::VirtualAddress;

    #[cfg(target_arch = "x86_64")]
    pub fn flush_address(addr: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) addr.as_u64());
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn flush_address(addr: VirtualAddress) {
        unsafe {
            let page = addr.as_u64() >> 12;
            core::arch::asm!("tlbi vae1, {}", in(reg) page);
            core::arch::asm!("dsb sy");
            core::arch::asm!("isb");
        }
    }

    #[cfg(target_arch = "riscv64")]
    pub fn flush_address(addr: VirtualAddress) {
        unsafe {
            core::arch::asm!("sfence.vma {}, zero", in(reg) addr.as_u64());
        }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn flush_all() {
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3);
            core::arch::asm!("mov cr3, {}", in(reg) cr3);
        }
    }

    #[cfg(target_arch = "aarch64")]
    pub fn flush_all() {
        unsafe {
            core::arch::asm!("tlbi vmalle1");
            core::arch::asm!("dsb sy");
            core::arch::asm!("isb");
        }
    }

    #[cfg(target_arch = "riscv64")]
    pub fn flush_all() {
        unsafe {
            core::arch::asm!("sfence.vma");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        super::super::set_phys_mem_offset(0xFFFF_8000_0000_0000);
        pmm::init(&[(PhysicalAddress::new(0), PhysicalAddress::new(64 * 1024 * 1024))]);
    }

    #[test]
    fn map_then_translate_then_unmap() {
        setup();
        let l4 = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let virt = phys_to_virt(l4);
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, 4096) };
        let space = AddressSpace::new(l4, false, 0, 0);

        let frame = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let page = VirtualAddress::new(0x40_0000);
        map_page(&space, page, frame, PageFlags::PRESENT | PageFlags::WRITABLE, false).unwrap();
        assert_eq!(translate(&space, page).unwrap(), frame);

        let freed = unmap_page(&space, page).unwrap();
        assert_eq!(freed, frame);
        assert!(translate(&space, page).is_err());
    }

    #[test]
    fn double_map_same_page_fails() {
        setup();
        let l4 = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let virt = phys_to_virt(l4);
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, 4096) };
        let space = AddressSpace::new(l4, false, 0, 0);

        let frame_a = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let frame_b = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let page = VirtualAddress::new(0x40_0000);
        map_page(&space, page, frame_a, PageFlags::PRESENT, false).unwrap();
        assert!(map_page(&space, page, frame_b, PageFlags::PRESENT, false).is_err());
    }
}
