//! Physical frame allocator integration tests: small/large allocation,
//! double free, reference counting, and range reservation, against the
//! real allocation-space layout built from a bootloader memory map.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(beelzebub_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo};

use beelzebub_kernel::error::KernelError;
use beelzebub_kernel::mm::pmm::{self, AddressMagnitude, FrameMagnitude};
use beelzebub_kernel::mm::{PageSize, PhysicalAddress};

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
const ALLOCATE_THEN_FREE_SMALL_FRAME: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let frame = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)?;
    pmm::pmm().free_frame(frame, PageSize::Small, true)
};

#[test_case]
const ALLOCATE_THEN_FREE_LARGE_FRAME: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let frame = pmm::pmm().allocate_frame(FrameMagnitude::Large, AddressMagnitude::Any, 1)?;
    pmm::pmm().free_frame(frame, PageSize::Large, true)
};

#[test_case]
const DOUBLE_FREE_IS_REJECTED: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let frame = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)?;
    pmm::pmm().free_frame(frame, PageSize::Small, true)?;
    match pmm::pmm().free_frame(frame, PageSize::Small, true) {
        Err(_) => Ok(()),
        Ok(()) => Err(KernelError::InvalidArgument),
    }
};

#[test_case]
const REFERENCE_COUNT_DELAYS_FREE: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let frame = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)?;
    pmm::pmm().adjust_reference_count(frame, 1)?; // now at 2
    pmm::pmm().free_frame(frame, PageSize::Small, false)?; // drops to 1, stays allocated
    pmm::pmm().free_frame(frame, PageSize::Small, false) // drops to 0, actually freed
};

#[test_case]
const MANY_SMALL_ALLOCATIONS_ARE_DISTINCT: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let mut seen = alloc::vec::Vec::new();
    for _ in 0..256 {
        let frame = pmm::pmm().allocate_frame(FrameMagnitude::Small, AddressMagnitude::Any, 1)?;
        if seen.contains(&frame) {
            return Err(KernelError::InvalidArgument);
        }
        seen.push(frame);
    }
    for frame in seen {
        pmm::pmm().free_frame(frame, PageSize::Small, true)?;
    }
    Ok(())
};
