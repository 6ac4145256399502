#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader_api::{entry_point, BootInfo};

use beelzebub_kernel::boot_config::BootConfig;
use beelzebub_kernel::mm::PhysicalAddress;
use beelzebub_kernel::println;

entry_point!(kernel_main);

/// `bootloader_api` hands us a memory map and framebuffer, not a command
/// line; the boot command line is instead baked in at build time and can
/// be overridden with `BEELZEBUB_CMDLINE` in the build environment.
const BOOT_CMDLINE: &str = match option_env!("BEELZEBUB_CMDLINE") {
    Some(cmdline) => cmdline,
    None => "",
};

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    println!("beelzebub v{}", env!("CARGO_PKG_VERSION"));
    println!("bringing up memory subsystem...");

    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not map all physical memory");

    let usable_ranges: alloc::vec::Vec<(PhysicalAddress, PhysicalAddress)> = boot_info
        .memory_regions
        .iter()
        .filter(|region| region.kind == bootloader_api::info::MemoryRegionKind::Usable)
        .map(|region| (PhysicalAddress::new(region.start), PhysicalAddress::new(region.end)))
        .collect();

    beelzebub_kernel::init(physical_memory_offset, &usable_ranges);

    // Parsed after `init` so unrecognised tokens can be logged through the
    // real log facade rather than being dropped on the floor.
    let boot_config = BootConfig::parse(BOOT_CMDLINE);
    println!(
        "boot config: smp={} term={:?} tests={:?}",
        boot_config.smp, boot_config.terminal, boot_config.tests
    );

    println!("memory subsystem ready");

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("[KERNEL PANIC] {info}");
    loop {
        core::hint::spin_loop();
    }
}
