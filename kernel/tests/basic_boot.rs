//! Smoke test: the kernel boots, brings up the memory subsystem, and the
//! custom test harness itself reports results correctly.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(beelzebub_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader_api::{entry_point, BootInfo};

use beelzebub_kernel::error::KernelError;
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

extern crate alloc;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    beelzebub_kernel::test_panic_handler(info)
}

#[test_case]
const SIMPLE_ARITHMETIC: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    if 2 + 2 != 4 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};

#[test_case]
const PHYS_TO_VIRT_ROUND_TRIPS: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let paddr = PhysicalAddress::new(0x20_0000);
    let vaddr = beelzebub_kernel::mm::phys_to_virt(paddr);
    if beelzebub_kernel::mm::virt_to_phys(vaddr) != paddr {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};
