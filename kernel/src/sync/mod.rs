//! Low-level synchronisation primitives.
//!
//! Everything above this module (the PMM, the VMM, the handle table)
//! is built on the four primitives exported here plus the general-
//! purpose lazy-init and lock-free helpers kept in `once_lock` and
//! `lockfree_queue`.

pub mod barrier;
pub mod interrupt_guard;
pub mod lockfree_queue;
pub mod once_lock;
pub mod rw_ticket_lock;
pub mod ticket_lock;

pub use barrier::SmpBarrier;
pub use interrupt_guard::InterruptGuard;
pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use rw_ticket_lock::RwTicketLock;
pub use ticket_lock::TicketLock;
