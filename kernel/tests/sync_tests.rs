//! Low-level synchronisation primitive integration tests. No real
//! multi-core contention runs here (the test harness is single-core), but
//! each primitive's single-threaded API contract is exercised end to end.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(beelzebub_kernel::test_runner)]
#![reexport_test_harness_main = "test_main"]

extern crate alloc;

use bootloader_api::{entry_point, BootInfo};

use beelzebub_kernel::error::KernelError;
use beelzebub_kernel::mm::PhysicalAddress;
use beelzebub_kernel::sync::{RwTicketLock, SmpBarrier, TicketLock};

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
const TICKET_LOCK_SERIALISES_ACCESS: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let lock = TicketLock::new(0u32);
    {
        let mut guard = lock.lock();
        *guard += 1;
    }
    if *lock.lock() != 1 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};

#[test_case]
const RW_TICKET_LOCK_ALLOWS_CONCURRENT_READERS: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let lock = RwTicketLock::new(alloc::vec![1, 2, 3]);
    let a = lock.read();
    let b = lock.read();
    if a.len() != 3 || b.len() != 3 {
        return Err(KernelError::InvalidArgument);
    }
    drop(a);
    drop(b);
    lock.write().push(4);
    if lock.read().len() != 4 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};

#[test_case]
const RW_TICKET_LOCK_UPGRADE_THEN_DOWNGRADE: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let lock = RwTicketLock::new(10u32);
    let read_guard = lock.read();
    let mut write_guard = match read_guard.try_upgrade() {
        Ok(g) => g,
        Err(_) => return Err(KernelError::InvalidArgument), // sole reader, upgrade must succeed
    };
    *write_guard += 1;
    let read_guard = write_guard.downgrade();
    if *read_guard != 11 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};

#[test_case]
const SMP_BARRIER_TRACKS_GENERATION: &dyn beelzebub_kernel::Testable = &|| -> Result<(), KernelError> {
    let barrier = SmpBarrier::new(1);
    let start = barrier.generation();
    barrier.reach();
    if barrier.generation() != start + 1 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(())
};
