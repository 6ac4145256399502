//! `no_std` test framework: serial-reported results and a QEMU exit code,
//! since there is no host process to return an exit status to.

use core::panic::PanicInfo;

use crate::error::KernelError;
use crate::{serial_print, serial_println};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Anything `#[test_case]` can register: either `fn() -> Result<(), KernelError>`
/// for assertions that can fail, or a bare closure panics propagate through.
pub trait Testable {
    fn run(&self) -> Result<(), KernelError>;
}

impl<T> Testable for T
where
    T: Fn() -> Result<(), KernelError>,
{
    fn run(&self) -> Result<(), KernelError> {
        serial_print!("{}...\t", core::any::type_name::<T>());
        match self() {
            Ok(()) => {
                serial_println!("[ok]");
                Ok(())
            }
            Err(e) => {
                serial_println!("[failed]: {e}");
                Err(e)
            }
        }
    }
}

pub fn test_runner(tests: &[&dyn Testable]) -> ! {
    serial_println!("running {} tests", tests.len());
    let mut passed = 0;
    let mut failed = 0;
    for test in tests {
        match test.run() {
            Ok(()) => passed += 1,
            Err(_) => failed += 1,
        }
    }
    serial_println!("\ntest results: {passed} passed, {failed} failed");
    if failed == 0 {
        exit_qemu(QemuExitCode::Success);
    } else {
        exit_qemu(QemuExitCode::Failed);
    }
}

pub fn test_panic_handler(info: &PanicInfo) -> ! {
    serial_println!("[failed]\n");
    serial_println!("error: {info}\n");
    exit_qemu(QemuExitCode::Failed);
}

/// Exit QEMU with `exit_code`, via the `isa-debug-exit` device at port
/// `0xf4` (x86_64) or the platform-equivalent firmware shutdown call.
pub fn exit_qemu(_exit_code: QemuExitCode) -> ! {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: port 0xf4 is the QEMU debug-exit device configured for this
    // kernel's test runs; writing to it terminates the VM, so the
    // instruction after this block is never reached.
    unsafe {
        use x86_64::instructions::port::Port;
        let mut port = Port::new(0xf4);
        port.write(_exit_code as u32);
        core::hint::unreachable_unchecked();
    }

    #[cfg(target_arch = "aarch64")]
    {
        const PSCI_SYSTEM_OFF: u32 = 0x8400_0008;
        // SAFETY: PSCI SYSTEM_OFF is a standard ARM PSCI call; QEMU's
        // virt machine implements it as a hypervisor trap that halts the VM.
        unsafe {
            core::arch::asm!(
                "mov w0, {psci_off:w}",
                "hvc #0",
                psci_off = in(reg) PSCI_SYSTEM_OFF,
                options(noreturn)
            );
        }
    }

    #[cfg(target_arch = "riscv64")]
    {
        const SBI_SHUTDOWN: usize = 8;
        // SAFETY: SBI shutdown (EID 8) traps to OpenSBI, which QEMU's
        // riscv64 virt machine provides; the ecall never returns.
        unsafe {
            core::arch::asm!(
                "li a7, {sbi_shutdown}",
                "ecall",
                sbi_shutdown = const SBI_SHUTDOWN,
                options(noreturn)
            );
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    loop {
        core::hint::spin_loop();
    }
}

/// Define a `#[test_case]` from an expression evaluating to
/// `Result<(), KernelError>`.
#[macro_export]
macro_rules! kernel_test {
    ($name:ident, $test:expr) => {
        #[test_case]
        const $name: &dyn $crate::Testable = &|| -> Result<(), $crate::error::KernelError> { $test };
    };
}
