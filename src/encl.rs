//! The enclave model (spec.md §3 `SgxEncl`): just enough of an
//! enclave's kernel-side bookkeeping for the page cache to reason about
//! ownership, reclaimability and teardown. Lifecycle operations that
//! create or initialize an enclave are out of scope (spec.md §1); this
//! module only models the state the page cache reads and mutates.

use crate::mm_list::EnclMmList;
use crate::page::EpcPageRef;
use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

bitflags! {
    /// Enclave lifecycle flags (spec.md §3, §4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnclFlags: u32 {
        const CREATED     = 1 << 0;
        const INITIALIZED = 1 << 1;
        /// Set once teardown has begun; no new pages may be added
        /// (spec.md §4.4).
        const DEAD        = 1 << 2;
        /// Set by the OOM handler when this enclave is chosen as the
        /// victim (spec.md §4.4).
        const OOM         = 1 << 3;
    }
}

const VA_SLOTS_PER_PAGE: usize = crate::config::VA_SLOTS_PER_PAGE;
const VA_SLOT_WORDS: usize = VA_SLOTS_PER_PAGE / 64;

/// One version-array page: 512 replay-protection nonce slots, tracked
/// with a bitmap rather than a free list — slots are fixed-size and
/// dense, so a bitmap scan is the simpler and more cache-friendly
/// choice here (unlike `EpcPage` list membership, which genuinely needs
/// intrusive linking).
pub struct VaPage {
    pub page: EpcPageRef,
    used: [u64; VA_SLOT_WORDS],
}

impl VaPage {
    pub fn new(page: EpcPageRef) -> Self {
        Self {
            page,
            used: [0; VA_SLOT_WORDS],
        }
    }

    pub fn alloc_slot(&mut self) -> Option<u32> {
        for (word_idx, word) in self.used.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                *word |= 1 << bit;
                return Some((word_idx as u32) * 64 + bit);
            }
        }
        None
    }

    pub fn free_slot(&mut self, slot: u32) {
        let word_idx = (slot / 64) as usize;
        let bit = slot % 64;
        self.used[word_idx] &= !(1 << bit);
    }

    pub fn is_empty(&self) -> bool {
        self.used.iter().all(|word| *word == 0)
    }
}

/// State guarded by the per-enclave lock (spec.md §5 level 3).
pub struct EnclLocked {
    pub secs: Option<EpcPageRef>,
    pub va_pages: Vec<VaPage>,
    pub child_count: usize,
}

/// An enclave, as the page cache needs to see it.
pub struct Encl {
    id: u64,
    pub flags: AtomicU32,
    pub mm_list: EnclMmList,
    pub base: u64,
    pub size: u64,
    locked: Mutex<EnclLocked>,
}

static NEXT_ENCL_ID: AtomicU64 = AtomicU64::new(1);

impl Encl {
    /// Allocate the next sequential enclave id and build a fresh,
    /// empty enclave covering `[base, base + size)`.
    pub fn new(base: u64, size: u64) -> Self {
        Self::with_id(NEXT_ENCL_ID.fetch_add(1, Ordering::Relaxed), base, size)
    }

    pub fn with_id(id: u64, base: u64, size: u64) -> Self {
        Self {
            id,
            flags: AtomicU32::new(EnclFlags::CREATED.bits()),
            mm_list: EnclMmList::new(),
            base,
            size,
            locked: Mutex::new(EnclLocked {
                secs: None,
                va_pages: Vec::new(),
                child_count: 0,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> EnclFlags {
        EnclFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_dead(&self) -> bool {
        self.flags().contains(EnclFlags::DEAD)
    }

    /// Mark the enclave dead. Idempotent; called once by teardown
    /// (spec.md §4.4) and again, harmlessly, by the OOM handler if it
    /// races with a normal destroy.
    pub fn mark_dead(&self) {
        self.flags.fetch_or(EnclFlags::DEAD.bits(), Ordering::AcqRel);
    }

    pub fn mark_oom(&self) {
        self.flags.fetch_or(EnclFlags::OOM.bits(), Ordering::AcqRel);
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, EnclLocked> {
        self.locked.lock().unwrap()
    }

    pub fn page_count(&self) -> u64 {
        self.size / 4096
    }
}

impl EnclLocked {
    /// Allocate a replay-protection slot from any VA page with room,
    /// returning `(pfn of the VA page, slot index)`. Callers that get
    /// `None` must add another VA page (spec.md §4.3: growing the VA
    /// page list on demand during reclaim is itself out of scope —
    /// allocating the backing `EpcPage` for a new VA page goes through
    /// the same allocator path as any enclave page).
    pub fn alloc_va_slot(&mut self) -> Option<(u64, u32)> {
        for va_page in self.va_pages.iter_mut() {
            if let Some(slot) = va_page.alloc_slot() {
                return Some((va_page.page.pfn, slot));
            }
        }
        None
    }

    pub fn add_va_page(&mut self, page: EpcPageRef) {
        self.va_pages.push(VaPage::new(page));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = Encl::new(0, 4096);
        let b = Encl::new(0, 4096);
        assert!(b.id() > a.id());
    }

    #[test]
    fn va_slot_allocation_fills_then_exhausts() {
        let mut va = VaPage::new(unsafe {
            intrusive_collections::UnsafeRef::from_raw(
                Box::leak(Box::new(crate::page::EpcPage::new(0, 0))) as *const _,
            )
        });
        assert!(va.is_empty());
        let first = va.alloc_slot().unwrap();
        assert_eq!(first, 0);
        assert!(!va.is_empty());
        va.free_slot(first);
        assert!(va.is_empty());
    }

    #[test]
    fn dead_flag_is_sticky() {
        let encl = Encl::new(0, 4096);
        assert!(!encl.is_dead());
        encl.mark_dead();
        assert!(encl.is_dead());
        encl.mark_dead();
        assert!(encl.is_dead());
    }
}
