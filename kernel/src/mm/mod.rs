//! Memory management: physical frame allocator, virtual address space
//! manager, and the address newtypes shared across both.

#![allow(dead_code)]

pub mod frame_desc;
pub mod page_fault;
pub mod page_table;
pub mod pmm;
pub mod vas;
pub mod vmm;

use core::fmt;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub const fn is_aligned(&self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    pub const fn align_down(&self, align: u64) -> Self {
        Self(self.0 & !(align - 1))
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Indices into the four levels of the x86-64 page-table hierarchy this
    /// address resolves through (PML4, PDPT, PD, PT).
    pub const fn page_table_indices(&self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1ff) as usize,
            ((self.0 >> 30) & 0x1ff) as usize,
            ((self.0 >> 21) & 0x1ff) as usize,
            ((self.0 >> 12) & 0x1ff) as usize,
        ]
    }

    pub const fn page_offset(&self) -> u64 {
        self.0 & 0xfff
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Offset of the direct physical memory map within kernel virtual address
/// space.
///
/// Every physical frame this kernel touches directly (page-table frames,
/// split-frame sub-descriptor pages) needs a real translation. `bootloader_api`
/// maps all of physical memory starting at `BootInfo.physical_memory_offset`
/// before the kernel entry point runs; that value is latched into this
/// static during `init` and every `phys_to_virt` call after that reads it.
static PHYS_MEM_OFFSET: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Record the physical memory map offset the bootloader set up. Must be
/// called exactly once, before any call to [`phys_to_virt`].
pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, core::sync::atomic::Ordering::Release);
}

/// Translate a physical address into the kernel's direct-map virtual
/// address for it.
pub fn phys_to_virt(addr: PhysicalAddress) -> VirtualAddress {
    let offset = PHYS_MEM_OFFSET.load(core::sync::atomic::Ordering::Acquire);
    VirtualAddress::new(offset + addr.as_u64())
}

/// Translate a direct-map virtual address back to its physical address.
/// Only valid for addresses previously produced by [`phys_to_virt`].
pub fn virt_to_phys(addr: VirtualAddress) -> PhysicalAddress {
    let offset = PHYS_MEM_OFFSET.load(core::sync::atomic::Ordering::Acquire);
    PhysicalAddress::new(addr.as_u64() - offset)
}

/// Page sizes this kernel maps and allocates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB.
    Small = 4096,
    /// 2 MiB.
    Large = 2 * 1024 * 1024,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        self as u64
    }
}

/// Bring up the memory subsystem: latch the physical memory offset handed
/// in by the bootloader, then initialize the PMM and VMM in dependency
/// order (the VMM's page-table frames are themselves allocated through the
/// PMM).
pub fn init(physical_memory_offset: u64, usable_ranges: &[(PhysicalAddress, PhysicalAddress)]) {
    set_phys_mem_offset(physical_memory_offset);
    pmm::init(usable_ranges);
    vmm::init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_to_virt_round_trips() {
        set_phys_mem_offset(0xFFFF_8000_0000_0000);
        let paddr = PhysicalAddress::new(0x1234_5000);
        let vaddr = phys_to_virt(paddr);
        assert_eq!(virt_to_phys(vaddr), paddr);
    }

    #[test]
    fn page_table_indices_split_canonical_address() {
        // 0xFFFF_8000_0010_0000 -> PML4 256, PDPT 0, PD 0, PT 256
        let addr = VirtualAddress::new(0xFFFF_8000_0010_0000);
        assert_eq!(addr.page_table_indices(), [256, 0, 0, 256]);
    }
}
