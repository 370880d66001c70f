//! LRU tracking and isolation (spec.md §3, §4.2, §4.3 Phase 1).
//!
//! One `EpcLru` holds a page's reclaimable and unreclaimable lists plus
//! the lock that orders beneath the enclave lock and above the section
//! lock (spec.md §5 level 4). Global accounting uses one instance; a
//! cgroup hierarchy would keep one `EpcLru` per cgroup, looked up by
//! `EpcLru::for_page` — the teacher's zoned free lists
//! (`src/kernel/mem/page_alloc/zones.rs`) make the same choice of one
//! lock-guarded list set per accounting scope rather than a single
//! global list with per-entry tags.

use crate::encl::Encl;
use crate::error::EpcError;
use crate::page::{EpcPage, EpcPageRef, LruList, PageFlags, PageOwner};
use crate::sync::Spin;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// An isolated page paired with its upgraded owner, the reclaimer's
/// private working set during a reclaim pass (spec.md §4.3: "the
/// isolation list" is this batch, not a fifth intrusive list — a page
/// unlinked from `EpcLru` and not yet relinked anywhere else is, by
/// construction, owned by exactly the caller holding this struct).
pub struct Isolated {
    pub page: EpcPageRef,
    pub owner: IsolatedOwner,
}

/// The owning enclave of an isolated page, already upgraded from the
/// `Weak` stored on the page — held for the duration of the reclaim
/// pass so the enclave cannot be freed out from under the pass. A page
/// whose owner fails to upgrade never becomes an `Isolated` at all
/// (spec.md §4.2 `isolate`: "on failure, clear `RECLAIMABLE` and unlink
/// without moving") — see `isolate_aged`.
pub enum IsolatedOwner {
    Enclave(Arc<Encl>, usize),
    VersionArray(Arc<Encl>),
}

/// One accounting scope's reclaimable/unreclaimable page lists.
pub struct EpcLru {
    reclaimable: Spin<LruList>,
    unreclaimable: Spin<LruList>,
    reclaimable_count: std::sync::atomic::AtomicUsize,
}

impl Default for EpcLru {
    fn default() -> Self {
        Self::new()
    }
}

impl EpcLru {
    pub fn new() -> Self {
        Self {
            reclaimable: Spin::new(LruList::new(Default::default())),
            unreclaimable: Spin::new(LruList::new(Default::default())),
            reclaimable_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn reclaimable_count(&self) -> usize {
        self.reclaimable_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Record a page as tracked by this scope, placing it on the
    /// reclaimable or unreclaimable list per its current flags (spec.md
    /// §4.2). Called once a page is assigned an owner.
    pub fn record(&self, page: EpcPageRef) {
        if page.flags.has(PageFlags::RECLAIMABLE) {
            self.reclaimable.lock().push_back(page);
            self.reclaimable_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.unreclaimable.lock().push_back(page);
        }
    }

    /// Move a page already tracked by this scope between the
    /// reclaimable and unreclaimable lists, reflecting a change to its
    /// `RECLAIMABLE` flag. No-op if the page isn't linked in either list
    /// (e.g. currently isolated).
    pub fn reclassify(&self, page: &EpcPage, now_reclaimable: bool) {
        let pfn = page.pfn;
        let removed = {
            let mut reclaimable = self.reclaimable.lock();
            Self::unlink(&mut reclaimable, pfn)
        }
        .or_else(|| {
            let mut unreclaimable = self.unreclaimable.lock();
            Self::unlink(&mut unreclaimable, pfn)
        });

        if let Some(page_ref) = removed {
            if now_reclaimable {
                self.reclaimable.lock().push_back(page_ref);
                self.reclaimable_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                self.unreclaimable.lock().push_back(page_ref);
            }
        }
    }

    /// Stop tracking a page entirely — called from `free` (spec.md
    /// §4.1). Returns [`EpcError::Busy`] without removing anything if
    /// the page is mid-reclaim (`RECLAIM_IN_PROGRESS`): the reclaimer
    /// owns the page's list membership until it finishes (spec.md §4.3
    /// scenario S5, concurrent drop during reclaim).
    pub fn drop_page(&self, page: &EpcPage) -> Result<(), EpcError> {
        if page.flags.has(PageFlags::RECLAIM_IN_PROGRESS) {
            return Err(EpcError::Busy);
        }
        let pfn = page.pfn;
        let mut reclaimable = self.reclaimable.lock();
        if Self::unlink(&mut reclaimable, pfn).is_some() {
            self.reclaimable_count
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(());
        }
        drop(reclaimable);
        let mut unreclaimable = self.unreclaimable.lock();
        Self::unlink(&mut unreclaimable, pfn);
        Ok(())
    }

    fn unlink(list: &mut LruList, pfn: u64) -> Option<EpcPageRef> {
        let mut cursor = list.front_mut();
        while let Some(page) = cursor.get() {
            if page.pfn == pfn {
                return cursor.remove();
            }
            cursor.move_next();
        }
        None
    }

    /// Scan up to `scan_limit` pages off the reclaimable list, aging
    /// each with `is_young` (spec.md §4.3 Phase 1 combines isolation
    /// with the access-bit aging test). A page whose owner's
    /// get-unless-zero upgrade fails (spec.md §4.2 `isolate`: the owner
    /// is already being freed) is never isolated at all — it just has
    /// `RECLAIMABLE` cleared and is unlinked, not moved anywhere, since
    /// whatever is tearing its owner down already owns the page's fate.
    /// Otherwise, if `ignore_age` is clear and `is_young` reports true,
    /// the page is rotated to the tail of the reclaimable list instead
    /// of being isolated (spec.md §8 scenario S4); scanning stops once
    /// `batch_size` pages have been isolated or `scan_limit` pages have
    /// been examined, whichever comes first.
    pub fn isolate_aged(
        &self,
        batch_size: usize,
        scan_limit: usize,
        ignore_age: bool,
        mut is_young: impl FnMut(&EpcPage, &IsolatedOwner) -> bool,
    ) -> Vec<Isolated> {
        let mut reclaimable = self.reclaimable.lock();
        let mut batch = Vec::with_capacity(batch_size);
        let mut scanned = 0;
        let mut requeued = Vec::new();
        let mut dropped = 0;
        while batch.len() < batch_size && scanned < scan_limit {
            let Some(page) = reclaimable.pop_front() else {
                break;
            };
            scanned += 1;
            let Some(owner) = owner_of(&page) else {
                page.flags.remove(PageFlags::RECLAIMABLE);
                dropped += 1;
                continue;
            };
            let young = !ignore_age && is_young(&page, &owner);
            if young {
                requeued.push(page);
                continue;
            }
            page.flags.insert(PageFlags::RECLAIM_IN_PROGRESS);
            batch.push(Isolated { page, owner });
        }
        for page in requeued {
            reclaimable.push_back(page);
        }
        drop(reclaimable);
        self.reclaimable_count.fetch_sub(
            batch.len() + dropped,
            std::sync::atomic::Ordering::Relaxed,
        );
        batch
    }

    /// Return a page that failed some step of reclaim back onto the
    /// reclaimable list, clearing `RECLAIM_IN_PROGRESS` (spec.md §4.3:
    /// retry path for transient failures other than `NOT_TRACKED`,
    /// which is retried in place without ever leaving the batch).
    pub fn unisolate(&self, page: EpcPageRef) {
        page.flags.remove(PageFlags::RECLAIM_IN_PROGRESS);
        self.reclaimable.lock().push_back(page);
        self.reclaimable_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

impl EpcLru {
    /// Walk the unreclaimable list from the tail (spec.md §4.4: the
    /// OOM handler picks from pages the reclaimer could never evict)
    /// looking for one whose owner is a still-live, not-yet-dead
    /// enclave. Returns that enclave without removing anything from the
    /// list — victim selection only chooses who to tear down, teardown
    /// itself drains their pages through the ordinary free path.
    pub fn select_oom_victim(&self) -> Option<Arc<Encl>> {
        let unreclaimable = self.unreclaimable.lock();
        let mut cursor = unreclaimable.back();
        while let Some(page) = cursor.get() {
            if let Some(owner) = page.owner.lock().as_ref() {
                let encl = match owner {
                    PageOwner::Enclave(weak, _) => upgrade_enclave(weak),
                    PageOwner::VersionArray(weak) => upgrade_enclave(weak),
                    PageOwner::Virt(_) => None,
                };
                if let Some(encl) = encl {
                    if !encl.is_dead() {
                        return Some(encl);
                    }
                }
            }
            cursor.move_prev();
        }
        None
    }

    /// Fallback for when no live enclave victim exists: collect the
    /// handles of any virtualized pages sitting on the unreclaimable
    /// list, so the OOM handler can ask the virtualization backend to
    /// free capacity instead of giving up outright (spec.md §4.4's OOM
    /// handler / §1's virtualization-backend boundary).
    pub fn unreclaimable_virt_handles(&self) -> Vec<crate::page::VirtHandle> {
        let unreclaimable = self.unreclaimable.lock();
        let mut handles = Vec::new();
        let mut cursor = unreclaimable.back();
        while let Some(page) = cursor.get() {
            if let Some(PageOwner::Virt(handle)) = page.owner.lock().as_ref() {
                handles.push(*handle);
            }
            cursor.move_prev();
        }
        handles
    }
}

fn upgrade_enclave(weak: &Weak<Encl>) -> Option<Arc<Encl>> {
    weak.upgrade()
}

/// Get-unless-zero on a page's owner: `None` means the owner is gone or
/// mid-teardown (a dropped `Weak`, or no owner recorded at all), in
/// which case the caller must not isolate the page (spec.md §4.2).
fn owner_of(page: &EpcPage) -> Option<IsolatedOwner> {
    match page.owner.lock().as_ref()? {
        PageOwner::Enclave(weak, idx) => {
            upgrade_enclave(weak).map(|encl| IsolatedOwner::Enclave(encl, *idx))
        }
        PageOwner::VersionArray(weak) => upgrade_enclave(weak).map(IsolatedOwner::VersionArray),
        PageOwner::Virt(_) => None,
    }
}

/// Registry of LRU scopes: one global instance plus one per cgroup,
/// looked up by the page's `cgroup_ref` (spec.md §3 "a page belongs to
/// exactly one LRU: global, or its cgroup's").
#[derive(Default)]
pub struct LruRegistry {
    global: Arc<EpcLru>,
    by_cgroup: RwLock<HashMap<u64, Arc<EpcLru>>>,
}

impl LruRegistry {
    pub fn new() -> Self {
        Self {
            global: Arc::new(EpcLru::new()),
            by_cgroup: RwLock::new(HashMap::new()),
        }
    }

    pub fn global(&self) -> Arc<EpcLru> {
        self.global.clone()
    }

    /// The LRU scope a page belongs to, selected by its `cgroup_ref`
    /// (spec.md §4.6). Creates the cgroup's `EpcLru` on first use.
    pub fn for_page(&self, page: &EpcPage) -> Arc<EpcLru> {
        match *page.cgroup_ref.lock() {
            Some(cgroup_ref) => self.for_cgroup(cgroup_ref),
            None => self.global.clone(),
        }
    }

    pub fn for_cgroup(&self, cgroup_ref: u64) -> Arc<EpcLru> {
        if let Some(lru) = self.by_cgroup.read().unwrap().get(&cgroup_ref) {
            return lru.clone();
        }
        self.by_cgroup
            .write()
            .unwrap()
            .entry(cgroup_ref)
            .or_insert_with(|| Arc::new(EpcLru::new()))
            .clone()
    }
}
