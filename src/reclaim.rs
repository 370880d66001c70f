//! The three-phase reclaim pipeline (spec.md §4.3): isolate & age,
//! block + track, write back. Driven by [`crate::daemon`] on watermark
//! wake-ups and by [`crate::alloc`] on direct reclaim; neither calls
//! hardware or backing-store collaborators directly, only through this
//! module, so both paths share one retry/epoch protocol.

use crate::backing::BackingStore;
use crate::encl::Encl;
use crate::error::EpcError;
use crate::hw::{EwbOutcome, Hardware};
use crate::lru::{EpcLru, IsolatedOwner};
use crate::mm_list::IpiBroadcast;
use crate::page::{EpcPageRef, PageFlags};
use std::sync::Arc;

/// Upper bound on `NOT_TRACKED` retries for a single page before giving
/// up and requeueing it (spec.md §4.3: `NOT_TRACKED` must be retried,
/// but a misbehaving owner must not wedge the reclaimer forever).
const MAX_EWB_RETRIES: u32 = 4;

/// What one reclaim pass accomplished, handed back to the caller so it
/// can update free counts and cgroup charges — this module only drives
/// hardware and backing-store collaborators, it never touches section
/// free lists itself (spec.md §5: the section lock is the innermost
/// lock, acquired last, by the allocator).
#[derive(Default)]
pub struct ReclaimOutcome {
    /// Pages successfully written back; ready to return to the free
    /// list.
    pub reclaimed: Vec<EpcPageRef>,
}

impl ReclaimOutcome {
    pub fn len(&self) -> usize {
        self.reclaimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run one reclaim pass against `lru`.
///
/// `alloc_va_slot` is asked for a `(va page pfn, slot)` pair for each
/// page that needs one; it should consult the owning enclave's VA page
/// list and, if none has room, allocate and attach a fresh VA page
/// (itself going through the ordinary allocator path — out of this
/// module's scope to orchestrate, spec.md §1 draws the reclaimer/
/// allocator boundary there).
pub fn reclaim_batch(
    lru: &EpcLru,
    hw: &dyn Hardware,
    backing: &dyn BackingStore,
    ipi: &dyn IpiBroadcast,
    scan_limit: usize,
    batch_size: usize,
    ignore_age: bool,
    mut alloc_va_slot: impl FnMut(&Arc<Encl>) -> Option<(u64, u32)>,
) -> ReclaimOutcome {
    // Phase 1: isolate & age. A page whose owner's get-unless-zero
    // upgrade fails never reaches this closure at all — `isolate_aged`
    // unlinks it without isolating (spec.md §4.2), so every isolated
    // page here is guaranteed to have a live owner.
    let isolated = lru.isolate_aged(batch_size, scan_limit, ignore_age, |page, owner| {
        let IsolatedOwner::Enclave(encl, _) | IsolatedOwner::VersionArray(encl) = owner;
        let mut young = false;
        encl.mm_list.walk_with_retry(|mm| {
            if mm.test_and_clear_young(page.pfn) {
                young = true;
            }
        });
        young
    });

    let mut outcome = ReclaimOutcome::default();
    if isolated.is_empty() {
        return outcome;
    }

    let live: Vec<(_, Arc<Encl>)> = isolated
        .into_iter()
        .map(|isolated_page| {
            let IsolatedOwner::Enclave(ref encl, _) | IsolatedOwner::VersionArray(ref encl) =
                isolated_page.owner;
            let encl = encl.clone();
            (isolated_page, encl)
        })
        .collect();

    // Phase 2: block. Invalidate every PTE mapping the page so no new
    // enclave entry can load it while write-back runs (spec.md §4.3).
    // Tracking the epoch and flushing stale CPUs is deferred entirely to
    // phase 3's NOT_TRACKED handling below — blocking alone says nothing
    // about whether a CPU is already inside with a stale epoch.
    for (isolated_page, encl) in &live {
        encl.mm_list
            .walk_with_retry(|mm| mm.zap(isolated_page.page.pfn));
        if let Err(e) = hw.eblock(isolated_page.page.pfn) {
            log::warn!("EBLOCK failed for pfn {}: {:?}", isolated_page.page.pfn, e);
        }
    }

    // Phase 3: write back, with the NOT_TRACKED retry protocol:
    // `track` then retry once; if still untracked, flush every CPU
    // that might still be inside via IPI, then retry once more
    // (spec.md §4.3 point 2).
    for (isolated_page, encl) in live {
        let page = isolated_page.page;
        let page_index = match &*page.owner.lock() {
            Some(crate::page::PageOwner::Enclave(_, idx)) => *idx,
            _ => 0,
        };

        let Ok(backing_slot) = backing.get_backing(&encl, page_index) else {
            lru.unisolate(page);
            continue;
        };

        let Some((va_pfn, va_slot)) = alloc_va_slot(&encl) else {
            lru.unisolate(page);
            continue;
        };

        let mut retries = 0u32;
        loop {
            match hw.ewb(page.pfn, va_pfn, va_slot, &backing_slot) {
                EwbOutcome::Success => {
                    page.set_va_slot(va_slot);
                    page.flags.insert(PageFlags::RECLAIMED);
                    page.flags.remove(PageFlags::RECLAIM_IN_PROGRESS);
                    backing.put_backing(&backing_slot, true);
                    outcome.reclaimed.push(page);
                    break;
                }
                EwbOutcome::NotTracked => {
                    retries += 1;
                    match retries {
                        1 => {
                            if let Some(secs_pfn) = encl.lock().secs.as_ref().map(|s| s.pfn) {
                                if let Err(e) = hw.etrack(secs_pfn) {
                                    log::warn!(
                                        "ETRACK failed for enclave {}: {:?}",
                                        encl.id(),
                                        e
                                    );
                                }
                            }
                        }
                        2 => {
                            // Computed after the track above so no CPU
                            // that entered after the epoch advance is
                            // missed (spec.md §4.3 point 2).
                            let mask = encl.mm_list.cpu_mask();
                            ipi.broadcast(&mask);
                        }
                        n if n > MAX_EWB_RETRIES => {
                            log::debug!(
                                "EWB kept reporting NOT_TRACKED for pfn {} after track+IPI, requeueing",
                                page.pfn
                            );
                            lru.unisolate(page);
                            break;
                        }
                        _ => {}
                    }
                }
                EwbOutcome::Failure(e) => {
                    log::warn!("EWB failed for pfn {}: {:?}", page.pfn, e);
                    lru.unisolate(page);
                    break;
                }
            }
        }
    }

    outcome
}

/// Whether direct reclaim (spec.md §4.1, invoked from `alloc` when the
/// free count is below the low watermark) should keep scanning.
pub fn should_continue(outcome: &ReclaimOutcome, _target: usize) -> Result<(), EpcError> {
    if outcome.is_empty() {
        Err(EpcError::NoMemory)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encl::Encl;
    use crate::hw::sim::SimHardware;
    use crate::backing::sim::SimBackingStore;
    use crate::mm_list::sim::RecordingIpi;
    use crate::lru::EpcLru;
    use crate::page::{EpcPage, PageOwner};
    use intrusive_collections::UnsafeRef;

    fn leaked_page(pfn: u64) -> EpcPageRef {
        let page = Box::leak(Box::new(EpcPage::new(pfn, 0)));
        page.flags.insert(PageFlags::RECLAIMABLE);
        unsafe { UnsafeRef::from_raw(page as *const EpcPage) }
    }

    #[test]
    fn ownerless_page_is_unlinked_without_isolation() {
        let lru = EpcLru::new();
        let page = leaked_page(5);
        lru.record(page);
        assert_eq!(lru.reclaimable_count(), 1);

        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();

        let outcome = reclaim_batch(&lru, &hw, &backing, &ipi, 16, 16, false, |_| None);
        assert!(outcome.is_empty());
        assert_eq!(hw.remove_calls(), 0);
        assert_eq!(lru.reclaimable_count(), 0);
        assert!(!page.flags.has(PageFlags::RECLAIMABLE));
    }

    #[test]
    fn live_owner_page_is_blocked_tracked_and_written_back() {
        let lru = EpcLru::new();
        let encl = Arc::new(Encl::new(0, 4096));
        let va_page = leaked_page(100);
        encl.lock().add_va_page(va_page);

        let page = leaked_page(7);
        *page.owner.lock() = Some(PageOwner::Enclave(Arc::downgrade(&encl), 0));
        lru.record(page);

        let mm = Arc::new(crate::mm_list::sim::SimMm::new());
        let attached = Arc::new(crate::mm_list::AttachedMm::new(
            crate::mm_list::MmId(1),
            mm.clone(),
        ));
        encl.mm_list.attach(Arc::downgrade(&attached));

        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();

        let outcome = reclaim_batch(&lru, &hw, &backing, &ipi, 16, 16, false, |encl| {
            encl.lock().alloc_va_slot()
        });

        assert_eq!(outcome.reclaimed.len(), 1);
        assert!(mm.is_zapped(7));
        assert_eq!(hw.eblock_calls(), 1);
        assert_eq!(hw.etrack_calls(), 1);
        assert_eq!(hw.ewb_calls(), 1);
        assert_eq!(ipi.call_count(), 1);
    }

    #[test]
    fn not_tracked_is_retried_until_success() {
        let lru = EpcLru::new();
        let encl = Arc::new(Encl::new(0, 4096));
        let va_page = leaked_page(100);
        encl.lock().add_va_page(va_page);

        let page = leaked_page(7);
        *page.owner.lock() = Some(PageOwner::Enclave(Arc::downgrade(&encl), 0));
        lru.record(page);

        let hw = SimHardware::new();
        // Two NOT_TRACKED results before success: the protocol's first
        // retry follows an ETRACK, the second follows an IPI flush, a
        // third NOT_TRACKED would give up (spec.md §8 scenario S3).
        hw.script_ewb(7, vec![EwbOutcome::NotTracked, EwbOutcome::NotTracked]);
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();

        let outcome = reclaim_batch(&lru, &hw, &backing, &ipi, 16, 16, false, |encl| {
            encl.lock().alloc_va_slot()
        });

        assert_eq!(outcome.reclaimed.len(), 1);
        assert_eq!(hw.ewb_calls(), 3);
        assert_eq!(hw.etrack_calls(), 1);
        assert_eq!(ipi.call_count(), 1);
    }

    #[test]
    fn young_page_is_skipped_this_pass() {
        let lru = EpcLru::new();
        let encl = Arc::new(Encl::new(0, 4096));
        let page = leaked_page(7);
        *page.owner.lock() = Some(PageOwner::Enclave(Arc::downgrade(&encl), 0));
        lru.record(page);

        let mm = Arc::new(crate::mm_list::sim::SimMm::new());
        mm.mark_young(7);
        let attached = Arc::new(crate::mm_list::AttachedMm::new(
            crate::mm_list::MmId(1),
            mm.clone(),
        ));
        encl.mm_list.attach(Arc::downgrade(&attached));

        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();

        let outcome = reclaim_batch(&lru, &hw, &backing, &ipi, 16, 16, false, |encl| {
            encl.lock().alloc_va_slot()
        });
        assert!(outcome.is_empty());
        assert_eq!(lru.reclaimable_count(), 1);
        assert!(!mm.is_zapped(7));
    }

    #[test]
    fn ignore_age_skips_the_young_check() {
        let lru = EpcLru::new();
        let encl = Arc::new(Encl::new(0, 4096));
        let va_page = leaked_page(100);
        encl.lock().add_va_page(va_page);

        let page = leaked_page(7);
        *page.owner.lock() = Some(PageOwner::Enclave(Arc::downgrade(&encl), 0));
        lru.record(page);

        let mm = Arc::new(crate::mm_list::sim::SimMm::new());
        mm.mark_young(7);
        let attached = Arc::new(crate::mm_list::AttachedMm::new(
            crate::mm_list::MmId(1),
            mm.clone(),
        ));
        encl.mm_list.attach(Arc::downgrade(&attached));

        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();

        let outcome = reclaim_batch(&lru, &hw, &backing, &ipi, 16, 16, true, |encl| {
            encl.lock().alloc_va_slot()
        });
        assert_eq!(outcome.reclaimed.len(), 1);
    }
}
