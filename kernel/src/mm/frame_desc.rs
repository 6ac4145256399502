//! Frame descriptor layout.
//!
//! A [`LargeFrameDescriptor`] tracks one 2 MiB-aligned physical frame. When
//! split into 4 KiB pieces, the descriptor's `sub` pointer addresses a
//! [`SplitPage`] living in the *first 4 KiB sub-frame of the large frame
//! itself* — the split frame describes itself, which is why sub-descriptor
//! index 0 is permanently `Reserved`.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::mm::PhysicalAddress;

/// Bytes in a small (4 KiB) frame.
pub const SMALL_FRAME_SIZE: u64 = 4096;
/// Bytes in a large (2 MiB) frame.
pub const LARGE_FRAME_SIZE: u64 = 2 * 1024 * 1024;
/// Number of small frames inside one large frame.
pub const SUB_FRAMES_PER_LARGE: usize = (LARGE_FRAME_SIZE / SMALL_FRAME_SIZE) as usize;

/// Sub-descriptor index reserved for the split page's own backing storage.
pub const RESERVED_SUB_INDEX: u16 = 0;

/// No-link sentinel for free-stack `next` fields.
pub const NIL: u32 = u32::MAX;
const NIL16: u16 = u16::MAX;

/// Status of a 2 MiB large frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LargeStatus {
    Free = 0,
    Used = 1,
    Split = 2,
    Full = 3,
    Reserved = 4,
}

impl LargeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LargeStatus::Free,
            1 => LargeStatus::Used,
            2 => LargeStatus::Split,
            3 => LargeStatus::Full,
            4 => LargeStatus::Reserved,
            _ => unreachable!("invalid LargeStatus byte {v}"),
        }
    }
}

/// Status of a 4 KiB small frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmallStatus {
    Free = 0,
    Used = 1,
    Reserved = 2,
}

impl SmallStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SmallStatus::Free,
            1 => SmallStatus::Used,
            2 => SmallStatus::Reserved,
            _ => unreachable!("invalid SmallStatus byte {v}"),
        }
    }
}

/// Descriptor for one 2 MiB-aligned physical frame.
pub struct LargeFrameDescriptor {
    status: AtomicU8,
    /// Reference count; meaningful only while `Used`.
    reference_count: AtomicU32,
    /// Large free-stack link (index of the next `Free` descriptor), or
    /// [`NIL`].
    next_index: AtomicU32,
    /// Doubly-linked non-full split list, meaningful only while `Split`.
    split_prev: AtomicU32,
    split_next: AtomicU32,
    /// Count of free sub-frames, meaningful only while `Split` or `Full`.
    split_free_count: AtomicU16,
    /// Free-stack top within the sub-frames, meaningful only while `Split`
    /// or `Full`.
    split_next_free: AtomicU16,
}

impl LargeFrameDescriptor {
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(LargeStatus::Free as u8),
            reference_count: AtomicU32::new(0),
            next_index: AtomicU32::new(NIL),
            split_prev: AtomicU32::new(NIL),
            split_next: AtomicU32::new(NIL),
            split_free_count: AtomicU16::new(0),
            split_next_free: AtomicU16::new(0),
        }
    }

    pub fn status(&self) -> LargeStatus {
        LargeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: LargeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Atomically transition from `expected` to `new`, failing if the
    /// current status no longer matches.
    pub fn cas_status(&self, expected: LargeStatus, new: LargeStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    pub fn set_reference_count(&self, value: u32) {
        self.reference_count.store(value, Ordering::Release);
    }

    /// Add `diff` to the reference count. Returns the new value.
    pub fn adjust_reference_count(&self, diff: i32) -> u32 {
        if diff >= 0 {
            self.reference_count.fetch_add(diff as u32, Ordering::AcqRel) + diff as u32
        } else {
            self.reference_count
                .fetch_sub((-diff) as u32, Ordering::AcqRel)
                .wrapping_sub((-diff) as u32)
        }
    }

    pub fn next_index(&self) -> u32 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, idx: u32) {
        self.next_index.store(idx, Ordering::Release);
    }

    pub fn split_links(&self) -> (u32, u32) {
        (
            self.split_prev.load(Ordering::Acquire),
            self.split_next.load(Ordering::Acquire),
        )
    }

    pub fn set_split_links(&self, prev: u32, next: u32) {
        self.split_prev.store(prev, Ordering::Release);
        self.split_next.store(next, Ordering::Release);
    }

    pub fn split_free_count(&self) -> u16 {
        self.split_free_count.load(Ordering::Acquire)
    }

    pub fn set_split_free_count(&self, count: u16) {
        self.split_free_count.store(count, Ordering::Release);
    }

    pub fn split_next_free(&self) -> u16 {
        self.split_next_free.load(Ordering::Acquire)
    }

    pub fn set_split_next_free(&self, idx: u16) {
        self.split_next_free.store(idx, Ordering::Release);
    }
}

impl Default for LargeFrameDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor for one 4 KiB slice of a split large frame.
#[repr(C)]
pub struct SmallFrameDescriptor {
    status: AtomicU8,
    _pad: [u8; 1],
    reference_count: AtomicU16,
    next_index: AtomicU16,
}

impl SmallFrameDescriptor {
    const fn new() -> Self {
        Self {
            status: AtomicU8::new(SmallStatus::Free as u8),
            _pad: [0],
            reference_count: AtomicU16::new(0),
            next_index: AtomicU16::new(NIL16),
        }
    }

    const fn reserved() -> Self {
        Self {
            status: AtomicU8::new(SmallStatus::Reserved as u8),
            _pad: [0],
            reference_count: AtomicU16::new(0),
            next_index: AtomicU16::new(NIL16),
        }
    }

    pub fn status(&self) -> SmallStatus {
        SmallStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: SmallStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn reference_count(&self) -> u16 {
        self.reference_count.load(Ordering::Acquire)
    }

    pub fn set_reference_count(&self, value: u16) {
        self.reference_count.store(value, Ordering::Release);
    }

    pub fn adjust_reference_count(&self, diff: i32) -> u16 {
        if diff >= 0 {
            self.reference_count
                .fetch_add(diff as u16, Ordering::AcqRel)
                + diff as u16
        } else {
            self.reference_count
                .fetch_sub((-diff) as u16, Ordering::AcqRel)
                .wrapping_sub((-diff) as u16)
        }
    }

    pub fn next_index(&self) -> u16 {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, idx: u16) {
        self.next_index.store(idx, Ordering::Release);
    }
}

/// The self-describing first page of a split large frame: 512 small-frame
/// descriptors (index 0 permanently reserved for this very page) plus the
/// bookkeeping the parent split list needs.
#[repr(C)]
pub struct SplitPage {
    pub sub: [SmallFrameDescriptor; SUB_FRAMES_PER_LARGE],
}

const _: () = assert!(core::mem::size_of::<SplitPage>() <= SMALL_FRAME_SIZE as usize);

impl SplitPage {
    /// Construct a freshly split page in place: every sub-frame free except
    /// index 0, linked into a LIFO free stack from the top down.
    pub fn init_in_place(&mut self) {
        self.sub[0] = SmallFrameDescriptor::reserved();
        for i in 1..SUB_FRAMES_PER_LARGE {
            let next = if i + 1 < SUB_FRAMES_PER_LARGE {
                (i + 1) as u16
            } else {
                NIL16
            };
            self.sub[i] = SmallFrameDescriptor::new();
            self.sub[i].set_next_index(next);
        }
    }

    /// Physical address of sub-frame `index` within the large frame that
    /// starts at `large_base`.
    pub fn sub_frame_address(large_base: PhysicalAddress, index: u16) -> PhysicalAddress {
        PhysicalAddress::new(large_base.as_u64() + index as u64 * SMALL_FRAME_SIZE)
    }
}
