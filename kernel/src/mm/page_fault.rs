//! Page-fault dispatch: on-demand commit, or a fatal segmentation fault.
//!
//! Decodes the x86 page-fault error code bit-for-bit, then dispatches in
//! three steps: look up the faulting region, commit a frame if the region
//! allows it, else treat the fault as fatal. Copy-on-write and automatic
//! stack growth are out of scope — every other fault is a segmentation
//! fault.

#![allow(dead_code)]

use crate::error::{KernelError, KernelResult};

use super::pmm::{self, AddressMagnitude, FrameMagnitude};
use super::vas::RegionType;
use super::vmm::{self, AddressSpace};
use super::{phys_to_virt, PageSize, VirtualAddress};

/// Bit layout of the error code the CPU pushes for a `#PF` exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultErrorCode(u32);

impl PageFaultErrorCode {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Fault was caused by a page-level protection violation rather than a
    /// not-present page.
    pub fn protection_violation(&self) -> bool {
        self.0 & 0x1 != 0
    }

    pub fn write(&self) -> bool {
        self.0 & 0x2 != 0
    }

    pub fn user_mode(&self) -> bool {
        self.0 & 0x4 != 0
    }

    pub fn reserved_write(&self) -> bool {
        self.0 & 0x8 != 0
    }

    pub fn instruction_fetch(&self) -> bool {
        self.0 & 0x10 != 0
    }
}

/// Outcome of dispatching one page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A physical frame was committed and mapped; the faulting instruction
    /// can be retried.
    Resolved,
    /// No region covers the address, or the region forbids the access that
    /// faulted: the caller should terminate the faulting context.
    SegmentationFault,
}

/// Checks whether the access implied by `error` is compatible with a
/// region's flags: a write fault needs `WRITABLE`, an instruction fetch
/// needs `EXECUTABLE` (i.e. *not* `NO_EXECUTE`).
fn access_permitted(error: PageFaultErrorCode, region_flags: super::vas::MemoryFlags) -> bool {
    use super::vas::MemoryFlags;
    if error.write() && !region_flags.contains(MemoryFlags::WRITABLE) {
        return false;
    }
    if error.instruction_fetch() && !region_flags.contains(MemoryFlags::EXECUTABLE) {
        return false;
    }
    true
}

/// Dispatch a page fault raised while `space` was the active address space.
///
/// 1. Look up the region containing `fault_addr`. No region: segfault.
/// 2. If the region is `AllocateOnDemand` and the faulting access is
///    compatible with the region's flags: allocate one 4 KiB frame, map it
///    with the region's flags, and report `Resolved`.
/// 3. Otherwise: segfault.
pub fn handle(space: &AddressSpace, fault_addr: VirtualAddress, error: PageFaultErrorCode) -> FaultOutcome {
    let Some(region) = space.vas().find_region(fault_addr) else {
        return FaultOutcome::SegmentationFault;
    };

    if region.kind != RegionType::AllocateOnDemand || !access_permitted(error, region.flags) {
        return FaultOutcome::SegmentationFault;
    }

    match commit_page(space, fault_addr, region.flags) {
        Ok(()) => FaultOutcome::Resolved,
        Err(_) => FaultOutcome::SegmentationFault,
    }
}

fn commit_page(space: &AddressSpace, fault_addr: VirtualAddress, region_flags: super::vas::MemoryFlags) -> KernelResult<()> {
    let page = fault_addr.align_down(PageSize::Small.bytes());
    let frame = pmm::pmm()
        .allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)
        .map_err(|_| KernelError::OutOfMemory)?;
    let virt = phys_to_virt(frame);
    // SAFETY: `frame` was just allocated and is not yet mapped anywhere
    // else.
    unsafe {
        core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PageSize::Small.bytes() as usize);
    }

    let page_flags = vmm::page_flags_from_memory_flags(region_flags);
    vmm::map_page(space, page, frame, page_flags, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vas::{MemoryFlags, RegionContent};
    use crate::mm::vmm::AddressSpace;

    fn setup_space() -> AddressSpace {
        crate::mm::set_phys_mem_offset(0xFFFF_8000_0000_0000);
        pmm::init(&[(crate::mm::PhysicalAddress::new(0), crate::mm::PhysicalAddress::new(64 * 1024 * 1024))]);
        let l4 = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1).unwrap();
        let virt = phys_to_virt(l4);
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, 4096) };
        AddressSpace::new_for_test(l4)
    }

    #[test]
    fn fault_with_no_region_segfaults() {
        let space = setup_space();
        let outcome = handle(&space, VirtualAddress::new(0x99_0000), PageFaultErrorCode::new(0));
        assert_eq!(outcome, FaultOutcome::SegmentationFault);
    }

    #[test]
    fn demand_paged_region_resolves_on_first_fault() {
        let space = setup_space();
        space
            .vas()
            .insert_region(
                VirtualAddress::new(0x40_0000),
                VirtualAddress::new(0x40_1000),
                MemoryFlags::WRITABLE,
                RegionType::AllocateOnDemand,
                RegionContent::Generic,
            )
            .unwrap();
        let outcome = handle(&space, VirtualAddress::new(0x40_0123), PageFaultErrorCode::new(0x2));
        assert_eq!(outcome, FaultOutcome::Resolved);
        assert!(vmm::translate(&space, VirtualAddress::new(0x40_0000)).is_ok());
    }

    #[test]
    fn write_to_read_only_region_segfaults() {
        let space = setup_space();
        space
            .vas()
            .insert_region(
                VirtualAddress::new(0x50_0000),
                VirtualAddress::new(0x50_1000),
                MemoryFlags::empty(),
                RegionType::AllocateOnDemand,
                RegionContent::Generic,
            )
            .unwrap();
        let outcome = handle(&space, VirtualAddress::new(0x50_0010), PageFaultErrorCode::new(0x2));
        assert_eq!(outcome, FaultOutcome::SegmentationFault);
    }

    #[test]
    fn reserved_region_always_segfaults() {
        let space = setup_space();
        space
            .vas()
            .insert_region(
                VirtualAddress::new(0x60_0000),
                VirtualAddress::new(0x60_1000),
                MemoryFlags::empty(),
                RegionType::Reserved,
                RegionContent::Generic,
            )
            .unwrap();
        let outcome = handle(&space, VirtualAddress::new(0x60_0010), PageFaultErrorCode::new(0));
        assert_eq!(outcome, FaultOutcome::SegmentationFault);
    }
}
