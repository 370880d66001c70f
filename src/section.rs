//! EPC sections: the hardware-described contiguous physical ranges EPC
//! pages are carved from at boot (spec.md §3, §4.1).
//!
//! Grounded on the teacher's `src/kernel/mem/page_alloc.rs` free-list
//! pool, which also splits "all pages in this pool" across a spinlocked
//! intrusive list rather than a bitmap or buddy tree.

use crate::page::{EpcPage, EpcPageRef, FreeList, UnsanitizedList};
use crate::sync::Spin;
use intrusive_collections::UnsafeRef;

/// One contiguous EPC range as reported by the platform at boot
/// (spec.md §3's section list).
pub struct EpcSection {
    pub base_pfn: u64,
    pub page_count: usize,
    /// Pages never yet handed to any enclave; sanitized, ready to
    /// allocate.
    free: Spin<FreeList>,
    /// Pages this section owns that still need their one-time boot
    /// sanitization pass (spec.md §4.5) before they can move to `free`.
    unsanitized: Spin<UnsanitizedList>,
    free_count: std::sync::atomic::AtomicUsize,
    /// Backing storage for every `EpcPage` in this section, indexed by
    /// offset from `base_pfn`. Pages never move or reallocate: the
    /// section owns them for the life of the process, and the free/
    /// unsanitized/LRU lists only ever link `UnsafeRef`s into them.
    pages: Vec<EpcPage>,
}

impl EpcSection {
    /// Build a section covering `page_count` pages starting at
    /// `base_pfn`, with every page initially unsanitized (spec.md
    /// §4.5: real hardware EPC contents are undefined at boot and must
    /// be `EREMOVE`d before use).
    pub fn new(section_idx: usize, base_pfn: u64, page_count: usize) -> Self {
        let mut pages = Vec::with_capacity(page_count);
        for i in 0..page_count {
            pages.push(EpcPage::new(base_pfn + i as u64, section_idx));
        }

        let mut unsanitized = UnsanitizedList::new(Default::default());
        for page in pages.iter() {
            // SAFETY: `pages` is never resized or reallocated again
            // (capacity fixed above), and each page is pushed into
            // exactly one list.
            unsafe {
                unsanitized.push_back(UnsafeRef::from_raw(page as *const EpcPage));
            }
        }

        Self {
            base_pfn,
            page_count,
            free: Spin::new(FreeList::new(Default::default())),
            unsanitized: Spin::new(unsanitized),
            // Pre-set to the full page count at boot (spec.md §4.1
            // "Section setup"): sanitization moves pages onto the free
            // list one by one afterward, so `free_count` overstates real
            // availability for the duration of that pass rather than
            // understating it (spec.md §9 Open Question 1) — callers
            // only consult it to drive reclaim watermarks and must
            // tolerate the transient discrepancy.
            free_count: std::sync::atomic::AtomicUsize::new(page_count),
            pages,
        }
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn contains(&self, pfn: u64) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.page_count as u64
    }

    /// Pop the next page awaiting sanitization, if any. Called by the
    /// boot sanitizer (spec.md §4.5); does not touch `free_count`.
    pub fn pop_unsanitized(&self) -> Option<EpcPageRef> {
        self.unsanitized.lock().pop_front()
    }

    /// Return a page to the unsanitized list. Used if a sanitization
    /// attempt must be retried later.
    pub fn push_unsanitized(&self, page: EpcPageRef) {
        self.unsanitized.lock().push_back(page);
    }

    /// Move a freshly sanitized page onto the free list, observable to
    /// `alloc_one` from this point on. Does not touch `free_count`: it
    /// was already pre-set to the section's full page count at boot, so
    /// this only makes the page physically reachable, not newly
    /// counted.
    pub fn push_free(&self, page: EpcPageRef) {
        self.free.lock().push_back(page);
    }

    /// Pop one free page for allocation, or `None` if this section is
    /// exhausted (spec.md §4.1). The free count is decremented
    /// optimistically before the pop completes in the fully general
    /// case, but here pop and count update happen under the same lock
    /// acquisition, so no transient over/under-count is visible through
    /// this API — the benign transient overstatement spec.md §9 accepts
    /// is strictly at the whole-system `total_free_count` level, which
    /// sums per-section counts without a global lock (spec.md §9 Open
    /// Question 1).
    pub fn alloc_one(&self) -> Option<EpcPageRef> {
        let mut free = self.free.lock();
        let page = free.pop_front()?;
        drop(free);
        self.free_count
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        Some(page)
    }

    /// Return a page to the free list (spec.md §4.1 `free`).
    pub fn free_page(&self, page: EpcPageRef) {
        self.free.lock().push_back(page);
        self.free_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn page_at(&self, pfn: u64) -> Option<&EpcPage> {
        if !self.contains(pfn) {
            return None;
        }
        self.pages.get((pfn - self.base_pfn) as usize)
    }

    /// Visit every page this section owns, regardless of which list (if
    /// any) currently links it. Used by whole-enclave teardown (spec.md
    /// §4.4), which must find every page an enclave owns, not just the
    /// ones presently reclaimable.
    pub fn for_each_page(&self, mut f: impl FnMut(&EpcPage)) {
        for page in &self.pages {
            f(page);
        }
    }

    /// Obtain the intrusive-list handle for the page at `pfn`, for
    /// callers (whole-enclave teardown) that found the pfn via
    /// [`Self::for_each_page`] and now need to unlink it from whatever
    /// list currently holds it.
    pub fn page_ref_at(&self, pfn: u64) -> Option<EpcPageRef> {
        let page = self.page_at(pfn)?;
        // SAFETY: `page` borrows from `self.pages`, which is never
        // resized or moved after construction, so the raw pointer stays
        // valid for the section's lifetime.
        Some(unsafe { UnsafeRef::from_raw(page as *const EpcPage) })
    }
}

// SAFETY: all interior mutability in `EpcSection` goes through `Spin`
// or atomics; `pages` itself is never mutated after construction.
unsafe impl Sync for EpcSection {}
