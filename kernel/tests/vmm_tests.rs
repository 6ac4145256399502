//! Virtual memory manager integration tests: page allocation, mapping,
//! and on-demand commit via the page-fault path, against the kernel's
//! own address space.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(beelzebub_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo};

use beelzebub_kernel::error::KernelError;
use beelzebub_kernel::mm::page_fault::{self, PageFaultErrorCode};
use beelzebub_kernel::mm::vas::{MemoryFlags, RegionContent, RegionType};
use beelzebub_kernel::mm::vmm::{self, AllocationOptions};
use beelzebub_kernel::mm::PhysicalAddress;

entry_point!(kernel_main);

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    let offset = boot_info.physical_memory_offset.into_option().unwrap();
    let ranges: alloc::vec::Vec<(PhysicalAddress, PhysicalAddress)> = boot_info
        .memory_regions
        .iter()
        .filter(|r| r.kind == bootloader_api::info::MemoryRegionKind::Usable)
        .map(|r| (PhysicalAddress::new(r.start), PhysicalAddress::new(r.end)))
        .collect();
    beelzebub_kernel::init(offset, &ranges);

    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    beelzebub_kernel::test_panic_handler(info)
}

#[test_case]
const COMMITTED_ALLOCATION_IS_IMMEDIATELY_MAPPED: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let space = vmm::kernel_space();
    let range = vmm::allocate_pages(
        space,
        4096,
        AllocationOptions::COMMIT,
        MemoryFlags::WRITABLE | MemoryFlags::GLOBAL,
        RegionContent::Generic,
        None,
    )?;
    vmm::translate(space, range)?;
    vmm::free_pages(space, range)
};

#[test_case]
const DEMAND_PAGED_ALLOCATION_IS_UNMAPPED_UNTIL_FAULTED: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let space = vmm::kernel_space();
    let range = vmm::allocate_pages(
        space,
        4096,
        AllocationOptions::ALLOCATE_ON_DEMAND,
        MemoryFlags::WRITABLE,
        RegionContent::Generic,
        None,
    )?;
    if vmm::translate(space, range).is_ok() {
        return Err(KernelError::AlreadyMapped);
    }
    let outcome = page_fault::handle(space, range, PageFaultErrorCode::new(0x2));
    if outcome != page_fault::FaultOutcome::Resolved {
        return Err(KernelError::InvalidArgument);
    }
    vmm::translate(space, range)?;
    vmm::free_pages(space, range)
};

#[test_case]
const GUARD_PAGES_STAY_RESERVED_AND_UNMAPPED: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let space = vmm::kernel_space();
    let range = vmm::allocate_pages(
        space,
        4096,
        AllocationOptions::COMMIT | AllocationOptions::GUARD_LOW | AllocationOptions::GUARD_HIGH,
        MemoryFlags::WRITABLE,
        RegionContent::ThreadStack,
        None,
    )?;
    let guard_low = beelzebub_kernel::mm::VirtualAddress::new(range.as_u64() - 4096);
    match space.vas().find_region(guard_low) {
        Some(region) if region.kind == RegionType::Reserved => {}
        _ => return Err(KernelError::InvalidArgument),
    }
    if vmm::translate(space, guard_low).is_ok() {
        return Err(KernelError::AlreadyMapped);
    }
    vmm::free_pages(space, range)
};
