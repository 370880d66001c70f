//! Per-physical-page metadata (spec.md §3).
//!
//! Flags and list-membership are split the way the teacher's
//! `RawPage`/`PageFlags(AtomicU32)` (`src/kernel/mem/page_alloc/raw_page.rs`)
//! separates an atomic flags word from the page's other fields, rather
//! than packing everything into one overloaded integer.

use crate::encl::Encl;
use crate::sync::Spin;
use bitflags::bitflags;
use intrusive_collections::{intrusive_adapter, LinkedListLink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

bitflags! {
    /// Flag bits packed into an `EpcPage`'s descriptor (spec.md §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const ENCLAVE             = 1 << 0;
        const VERSION_ARRAY       = 1 << 1;
        const RECLAIMABLE         = 1 << 2;
        const RECLAIM_IN_PROGRESS = 1 << 3;
        /// Set once a successful `EWB` has written this page out.
        const RECLAIMED           = 1 << 4;
    }
}

/// Atomic flags word, matching the teacher's `PageFlags(AtomicU32)`
/// has/set/clear shape.
#[derive(Debug, Default)]
pub struct AtomicPageFlags(AtomicU32);

impl AtomicPageFlags {
    pub const fn new(flags: PageFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    pub fn get(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub fn has(&self, flag: PageFlags) -> bool {
        self.get().contains(flag)
    }

    pub fn insert(&self, flag: PageFlags) {
        self.0.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, flag: PageFlags) {
        self.0.fetch_and(!flag.bits(), Ordering::AcqRel);
    }
}

/// An opaque handle to a virtualized-EPC page, owned by the
/// virtualization backend (out of scope, spec.md §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtHandle(pub u64);

/// The tagged reference `EpcPage::owner` carries, discriminated in
/// practice by the `ENCLAVE`/`VERSION_ARRAY` flag bits (spec.md §9).
///
/// Holds `Weak<Encl>` rather than `Arc<Encl>`: an EPC page never keeps
/// its owning enclave alive (spec.md §9 "cyclic references"). Code that
/// needs the enclave upgrades via `Weak::upgrade`, Rust's native
/// get-unless-zero primitive, and only holds the upgraded `Arc` across
/// the blocking operations that need it.
pub enum PageOwner {
    /// A regular enclave (child) page: which enclave, and the page's
    /// index within it (used to request its backing slot).
    Enclave(Weak<Encl>, usize),
    /// A version-array page: the enclave whose replay-protection
    /// nonces it stores.
    VersionArray(Weak<Encl>),
    /// A page handed to the virtualization backend, opaque to this
    /// crate (spec.md §1).
    Virt(VirtHandle),
}

/// One 4 KiB hardware-protected page.
///
/// List membership (free / unsanitized / LRU-reclaimable /
/// LRU-unreclaimable) is a single [`LinkedListLink`] field: a page can
/// only ever be threaded through one of the `LinkedList<Adapter>`
/// instances that address it, which is what makes "exactly one of the
/// lists" (spec.md §3 invariant 1) structural rather than merely
/// documented. A page that is isolated for reclaim (`RECLAIM_IN_PROGRESS`)
/// is unlinked from every list and owned instead by the reclaimer's
/// local batch (spec.md §4.3) — that batch *is* the "isolation list".
pub struct EpcPage {
    list_link: LinkedListLink,
    /// Physical frame number. Immutable after the page is carved out of
    /// its section at boot.
    pub pfn: u64,
    /// Index of the owning [`crate::section::EpcSection`] in the global
    /// section array. Immutable after boot.
    pub section_idx: usize,
    pub flags: AtomicPageFlags,
    /// Valid iff `RECLAIMED` is set: the version-array slot offset the
    /// page's replay-protection nonce was written to.
    va_slot: AtomicU32,
    pub owner: Spin<Option<PageOwner>>,
    /// Back-pointer to the charged cgroup, when cgroup accounting is
    /// enabled (spec.md §3). `None` means globally-accounted.
    pub cgroup_ref: Spin<Option<u64>>,
}

const NO_VA_SLOT: u32 = u32::MAX;

impl EpcPage {
    pub fn new(pfn: u64, section_idx: usize) -> Self {
        Self {
            list_link: LinkedListLink::new(),
            pfn,
            section_idx,
            flags: AtomicPageFlags::new(PageFlags::empty()),
            va_slot: AtomicU32::new(NO_VA_SLOT),
            owner: Spin::new(None),
            cgroup_ref: Spin::new(None),
        }
    }

    pub fn va_slot(&self) -> Option<u32> {
        match self.va_slot.load(Ordering::Acquire) {
            NO_VA_SLOT => None,
            slot => Some(slot),
        }
    }

    pub fn set_va_slot(&self, slot: u32) {
        self.va_slot.store(slot, Ordering::Release);
    }

    pub fn clear_va_slot(&self) {
        self.va_slot.store(NO_VA_SLOT, Ordering::Release);
    }
}

// SAFETY: `EpcPage`'s fields are all internally synchronized (atomics,
// `Spin`); sharing `&EpcPage` across threads is sound.
unsafe impl Sync for EpcPage {}

intrusive_adapter!(pub FreeListAdapter = intrusive_collections::UnsafeRef<EpcPage>: EpcPage { list_link: LinkedListLink });
intrusive_adapter!(pub UnsanitizedListAdapter = intrusive_collections::UnsafeRef<EpcPage>: EpcPage { list_link: LinkedListLink });
intrusive_adapter!(pub LruListAdapter = intrusive_collections::UnsafeRef<EpcPage>: EpcPage { list_link: LinkedListLink });

pub type EpcPageRef = intrusive_collections::UnsafeRef<EpcPage>;
pub type FreeList = intrusive_collections::LinkedList<FreeListAdapter>;
pub type UnsanitizedList = intrusive_collections::LinkedList<UnsanitizedListAdapter>;
pub type LruList = intrusive_collections::LinkedList<LruListAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let page = EpcPage::new(0, 0);
        assert!(!page.flags.has(PageFlags::RECLAIMABLE));
        page.flags.insert(PageFlags::RECLAIMABLE);
        assert!(page.flags.has(PageFlags::RECLAIMABLE));
        page.flags.insert(PageFlags::RECLAIM_IN_PROGRESS);
        assert!(page.flags.has(PageFlags::RECLAIMABLE));
        assert!(page.flags.has(PageFlags::RECLAIM_IN_PROGRESS));
        page.flags.remove(PageFlags::RECLAIM_IN_PROGRESS);
        assert!(!page.flags.has(PageFlags::RECLAIM_IN_PROGRESS));
        assert!(page.flags.has(PageFlags::RECLAIMABLE));
    }

    #[test]
    fn va_slot_none_until_set() {
        let page = EpcPage::new(0, 0);
        assert_eq!(page.va_slot(), None);
        page.set_va_slot(41);
        assert_eq!(page.va_slot(), Some(41));
        page.clear_va_slot();
        assert_eq!(page.va_slot(), None);
    }
}
