//! Beelzebub kernel library
//!
//! Exposes the memory subsystem (physical frame allocator, virtual address
//! space manager, page-fault dispatch), the handle table, and the
//! low-level synchronisation primitives they are all built on, plus the
//! ambient scaffolding (logging, serial console, panic/test harness) every
//! one of those modules relies on.

#![no_std]
#![cfg_attr(all(test, target_os = "none"), no_main)]
#![feature(custom_test_frameworks)]
#![cfg_attr(target_os = "none", test_runner(crate::test_runner))]
#![cfg_attr(target_os = "none", reexport_test_harness_main = "test_main")]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

// Host target (cargo test on the dev machine) uses the system allocator so
// the unit tests scattered through these modules can use `Vec`/`String`
// without a bare-metal heap behind them.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Start of the region backing [`ALLOCATOR`], established by [`init`] once
/// the bootloader's usable memory map is known.
const KERNEL_HEAP_SIZE: usize = 2 * 1024 * 1024;

#[macro_use]
pub mod print;
#[macro_use]
pub mod serial;

pub mod bench;
pub mod boot_config;
pub mod error;
pub mod handle;
pub mod intrinsics;
pub mod log_service;
pub mod mm;
pub mod percpu;
pub mod raii;
pub mod sync;

mod test_framework;

// Unconditionally public (not gated behind `cfg(test)`): the `tests/*.rs`
// integration binaries link this crate as an ordinary dependency, never
// with `--cfg test`, so anything they need has to be real, non-test-gated
// API surface.
pub use test_framework::{exit_qemu, test_panic_handler, test_runner, QemuExitCode, Testable};

/// Bring up every subsystem this crate owns. Called once, from the boot
/// entry point, with the physical memory offset and usable RAM ranges the
/// bootloader handed us.
pub fn init(physical_memory_offset: u64, usable_ranges: &[(mm::PhysicalAddress, mm::PhysicalAddress)]) {
    log_service::init_log_facade();
    mm::init(physical_memory_offset, usable_ranges);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    init_kernel_heap();
}

/// Carve [`KERNEL_HEAP_SIZE`] bytes out of the kernel heap virtual range
/// and hand them to the global allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn init_kernel_heap() {
    use mm::vas::{MemoryFlags, RegionContent};
    use mm::vmm::{self, AllocationOptions};

    let space = vmm::kernel_space();
    let range = vmm::allocate_pages(
        space,
        KERNEL_HEAP_SIZE as u64,
        AllocationOptions::COMMIT,
        MemoryFlags::WRITABLE | MemoryFlags::GLOBAL,
        RegionContent::KernelHeap,
        None,
    )
    .expect("failed to reserve kernel heap range");

    // SAFETY: `range` was just committed by `allocate_pages` and is not
    // aliased by anything else; this runs once, before any other code
    // touches the allocator.
    unsafe {
        ALLOCATOR
            .lock()
            .init(range.as_u64() as *mut u8, KERNEL_HEAP_SIZE);
    }
}

#[cfg(all(test, target_os = "none"))]
#[no_mangle]
pub extern "C" fn _start() -> ! {
    test_main();
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(test, target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    test_framework::test_panic_handler(info)
}

/// Heap allocation failure is unrecoverable in a `no_std` kernel; the
/// `alloc_error_handler` ABI requires `-> !`.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("allocation error: {layout:?}");
}
