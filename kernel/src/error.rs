//! Kernel error taxonomy.
//!
//! One flat enum grouped by the subsystem that raises each variant: the
//! physical frame allocator, the virtual address space manager, the handle
//! table, and a catch-all for argument validation and the ambient
//! scaffolding (boot, config parsing). Kept as a single `#[must_use]` enum
//! rather than a per-module error type so `?` composes across subsystem
//! boundaries without a wrapper type at every call site.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    // -- Argument / generic --
    /// An argument failed a precondition (bad alignment, zero length, range
    /// out of the address space, ...).
    InvalidArgument,
    /// Feature compiled out or not yet implemented on this build.
    NotImplemented,
    /// Called before the owning subsystem's `init` ran.
    NotInitialized { subsystem: &'static str },

    // -- Physical frame allocator (PMM) --
    /// No frame of the requested magnitude was available in any space.
    OutOfMemory,
    /// `FreeFrame` or `AdjustReferenceCount` targeted an address that is
    /// not currently allocated (or already free).
    DoubleFree,
    /// `ReserveRange` could not reserve the full range because part of it
    /// was already `Used` or `Split`.
    RangeUnavailable,

    // -- Virtual address space manager (VMM) --
    /// The target virtual page already has a mapping.
    AlreadyMapped,
    /// The target virtual page has no mapping.
    NotMapped,
    /// The content lock or properties lock on a page-table entry was
    /// already held by a concurrent operation.
    MappingLocked,
    /// The requested virtual range overlaps an existing VAS region.
    RegionOverlap,
    /// No virtual range of the requested size and alignment was free.
    AddressSpaceExhausted,

    // -- Handle table --
    /// The table has no free slots and cannot grow further.
    HandleTableFull,
    /// The handle index does not correspond to a live entry (never
    /// allocated, already deallocated, or owned by a different process).
    HandleUnallocated,
    /// `pcid` was outside the range the table was initialized for.
    InvalidProcessId,

    /// Legacy string error, kept for interop with ambient scaffolding
    /// (panic messages, boot log lines) that predates this taxonomy.
    LegacyError { message: &'static str },
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {subsystem}")
            }
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::DoubleFree => write!(f, "frame not currently allocated"),
            Self::RangeUnavailable => write!(f, "range overlaps in-use or split frames"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
            Self::NotMapped => write!(f, "page not mapped"),
            Self::MappingLocked => write!(f, "mapping locked by a concurrent operation"),
            Self::RegionOverlap => write!(f, "region overlaps an existing mapping"),
            Self::AddressSpaceExhausted => write!(f, "no free virtual range of that size"),
            Self::HandleTableFull => write!(f, "handle table full"),
            Self::HandleUnallocated => write!(f, "handle not allocated"),
            Self::InvalidProcessId => write!(f, "invalid process id"),
            Self::LegacyError { message } => write!(f, "{message}"),
        }
    }
}

impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> Self {
        Self::LegacyError { message: msg }
    }
}

#[macro_export]
macro_rules! kernel_error {
    ($variant:ident) => {
        $crate::error::KernelError::$variant
    };
    (NotInitialized { $subsystem:expr }) => {
        $crate::error::KernelError::NotInitialized {
            subsystem: $subsystem,
        }
    };
}
