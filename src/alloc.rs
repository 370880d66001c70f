//! Allocation and free (spec.md §4.1): the direct path callers go
//! through to obtain and release EPC pages, triggering direct reclaim
//! itself when a section or cgroup is under its low watermark.

use crate::cgroup::EpcCgroupOps;
use crate::config::EpcConfig;
use crate::encl::Encl;
use crate::error::EpcError;
use crate::hw::Hardware;
use crate::lru::EpcLru;
use crate::page::{EpcPageRef, PageFlags, PageOwner};
use crate::reclaim::{self, ReclaimOutcome};
use crate::section::EpcSection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Next section to try first, advanced on every call so repeated
/// exhaustion of one section doesn't starve the rest — matching the
/// teacher's zoned allocator's "try this zone, then the next" fallback
/// (`src/kernel/mem/page_alloc/zones.rs`) rather than always scanning
/// from section 0.
static NEXT_SECTION: AtomicUsize = AtomicUsize::new(0);

fn alloc_one_from_sections(sections: &[EpcSection]) -> Option<EpcPageRef> {
    let n = sections.len();
    if n == 0 {
        return None;
    }
    let start = NEXT_SECTION.fetch_add(1, Ordering::Relaxed) % n;
    for offset in 0..n {
        let idx = (start + offset) % n;
        let section = &sections[idx];
        log::trace!("alloc_one: probing section {idx}");
        if let Some(page) = section.alloc_one() {
            return Some(page);
        }
    }
    None
}

pub fn total_free_count(sections: &[EpcSection]) -> usize {
    sections.iter().map(|s| s.free_count()).sum()
}

/// Hook into whatever signal-delivery mechanism the caller's thread runs
/// under (out of scope to implement here, spec.md §1); direct reclaim
/// only needs to know whether it should abandon its loop and let the
/// caller re-drive the syscall (spec.md §4.1 step 2, §5 "Cancellation").
/// Mirrors [`crate::daemon::Freezer`]'s shape — a single poll method the
/// allocator checks on every iteration rather than blocking on.
pub trait SignalCheck: Send + Sync {
    fn is_signal_pending(&self) -> bool;
}

/// A checker that never reports a pending signal, for tests and for
/// callers with no signal-delivery concept of their own.
pub struct NeverPending;

impl SignalCheck for NeverPending {
    fn is_signal_pending(&self) -> bool {
        false
    }
}

/// Collaborators a call to [`alloc`] needs in order to trigger direct
/// reclaim without the allocator owning the full reclaim pipeline
/// itself.
pub struct AllocContext<'a> {
    pub sections: &'a [EpcSection],
    pub lru: &'a EpcLru,
    pub hw: &'a dyn crate::hw::Hardware,
    pub backing: &'a dyn crate::backing::BackingStore,
    pub ipi: &'a dyn crate::mm_list::IpiBroadcast,
    pub cgroup: Option<&'a dyn EpcCgroupOps>,
    pub config: &'a EpcConfig,
    pub signal: &'a dyn SignalCheck,
}

/// Allocate one EPC page for `owner`, charging `cgroup_ref` if cgroup
/// accounting is enabled. When the free count is already at or below
/// `config.low_watermark`, runs direct reclaim inline before giving up
/// with [`EpcError::NoMemory`] (spec.md §4.1, §8 scenario S2).
pub fn alloc(
    ctx: &AllocContext<'_>,
    owner: PageOwner,
    cgroup_ref: Option<u64>,
    reclaim_allowed: bool,
) -> Result<EpcPageRef, EpcError> {
    if let (Some(cgroup_ref), Some(cgroup)) = (cgroup_ref, ctx.cgroup) {
        cgroup.try_charge(cgroup_ref)?;
    }

    let page = match try_alloc_one(ctx, reclaim_allowed) {
        Ok(page) => page,
        Err(e) => {
            log::debug!("alloc failed: {e}");
            if let (Some(cgroup_ref), Some(cgroup)) = (cgroup_ref, ctx.cgroup) {
                cgroup.uncharge(cgroup_ref);
            }
            return Err(e);
        }
    };

    // Only enclave child pages are reclaimable at hardware granularity;
    // version-array and virtualized-EPC pages go on the unreclaimable
    // list (spec.md §3 GLOSSARY "Reclaimable / Unreclaimable", §9 owner
    // sum type). A SECS (root) page is never handed to this path at all
    // — it lives solely in `EnclLocked::secs`, outside any LRU.
    let flag_bits = match owner {
        PageOwner::Enclave(_, _) => PageFlags::ENCLAVE | PageFlags::RECLAIMABLE,
        PageOwner::VersionArray(_) => PageFlags::VERSION_ARRAY,
        PageOwner::Virt(_) => PageFlags::empty(),
    };

    *page.owner.lock() = Some(owner);
    *page.cgroup_ref.lock() = cgroup_ref;
    page.flags.insert(flag_bits);
    ctx.lru.record(page);

    Ok(page)
}

/// Mirrors spec.md §4.1's loop ordering exactly: a total absence of
/// reclaimable pages is `NoMemory` regardless of `reclaim_allowed`
/// (there would be nothing for a reclaim pass to do), but when pages
/// *are* reclaimable and the caller simply isn't allowed to wait on
/// reclaim, the failure is `Busy` (spec.md §7's `Busy` row), not
/// `NoMemory` (spec.md §8 scenario: direct reclaim distinguishes the
/// two).
fn try_alloc_one(ctx: &AllocContext<'_>, reclaim_allowed: bool) -> Result<EpcPageRef, EpcError> {
    if let Some(page) = alloc_one_from_sections(ctx.sections) {
        return Ok(page);
    }
    if ctx.lru.reclaimable_count() == 0 {
        return Err(EpcError::NoMemory);
    }
    if !reclaim_allowed {
        return Err(EpcError::Busy);
    }

    // Direct reclaim: keep running reclaim passes until either a page
    // frees up or reclaim stops making progress (spec.md §4.1). Checked
    // every iteration so a pending signal aborts the loop and hands the
    // caller back an `EpcError::Restart` to re-drive its syscall (spec.md
    // §4.1 step 2, §5 "Cancellation") instead of riding out however many
    // reclaim passes it takes to free a page.
    loop {
        if ctx.signal.is_signal_pending() {
            return Err(EpcError::Restart);
        }
        log::debug!("alloc: sections exhausted, running direct reclaim");
        let outcome = run_direct_reclaim(ctx);
        if outcome.is_empty() {
            return Err(EpcError::NoMemory);
        }
        free_reclaimed(ctx, outcome);
        if let Some(page) = alloc_one_from_sections(ctx.sections) {
            return Ok(page);
        }
        if ctx.lru.reclaimable_count() == 0 {
            return Err(EpcError::NoMemory);
        }
    }
}

fn run_direct_reclaim(ctx: &AllocContext<'_>) -> ReclaimOutcome {
    reclaim::reclaim_batch(
        ctx.lru,
        ctx.hw,
        ctx.backing,
        ctx.ipi,
        ctx.config.scan_batch,
        ctx.config.max_batch,
        false,
        |encl: &Arc<Encl>| encl.lock().alloc_va_slot(),
    )
}

fn free_reclaimed(ctx: &AllocContext<'_>, outcome: ReclaimOutcome) {
    for page in outcome.reclaimed {
        let cgroup_ref = *page.cgroup_ref.lock();
        if let (Some(cgroup_ref), Some(cgroup)) = (cgroup_ref, ctx.cgroup) {
            cgroup.uncharge(cgroup_ref);
        }
        return_page_to_section(ctx.sections, page);
    }
}

fn return_page_to_section(sections: &[EpcSection], page: EpcPageRef) {
    let section = &sections[page.section_idx];
    *page.owner.lock() = None;
    *page.cgroup_ref.lock() = None;
    page.clear_va_slot();
    page.flags.remove(PageFlags::RECLAIMABLE | PageFlags::RECLAIMED);
    section.free_page(page);
}

/// Release a page back to its section's free list (spec.md §4.1
/// `free`). Fails with [`EpcError::Busy`] if the page is mid-reclaim;
/// callers must retry after the in-flight reclaim pass finishes (spec.md
/// §8 scenario S5). `lru.drop_page` returning `Ok` already establishes
/// that no reclaim flag is set (the "assert no reclaim flags" in
/// spec.md §4.1 is structural here, not a runtime check). Runs the
/// hardware *remove* instruction before the page can be reused; a
/// failure means the page is compromised, so it is warned about and
/// leaked rather than returned to the free list (spec.md §4.1, §7).
pub fn free(
    sections: &[EpcSection],
    lru: &EpcLru,
    hw: &dyn Hardware,
    cgroup: Option<&dyn EpcCgroupOps>,
    page: EpcPageRef,
) -> Result<(), EpcError> {
    lru.drop_page(&page)?;

    if let Err(e) = hw.ereg_remove(page.pfn) {
        log::warn!(
            "EREMOVE failed for pfn {} on free: {e} — leaking page, charge stays put",
            page.pfn
        );
        return Ok(());
    }

    let cgroup_ref = *page.cgroup_ref.lock();
    if let (Some(cgroup_ref), Some(cgroup)) = (cgroup_ref, cgroup) {
        cgroup.uncharge(cgroup_ref);
    }

    return_page_to_section(sections, page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::sim::SimBackingStore;
    use crate::config::EpcConfig;
    use crate::hw::sim::SimHardware;
    use crate::lru::EpcLru;
    use crate::mm_list::sim::RecordingIpi;
    use crate::section::EpcSection;

    fn boot_section(page_count: usize) -> EpcSection {
        let section = EpcSection::new(0, 0, page_count);
        while let Some(page) = section.pop_unsanitized() {
            section.push_free(page);
        }
        section
    }

    #[test]
    fn alloc_then_free_round_trips_free_count() {
        let sections = vec![boot_section(2)];
        let lru = EpcLru::new();
        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(0, 2);
        let ctx = AllocContext {
            sections: &sections,
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
            signal: &NeverPending,
        };

        assert_eq!(total_free_count(&sections), 2);
        let page = alloc(&ctx, PageOwner::Virt(crate::page::VirtHandle(1)), None, false).unwrap();
        assert_eq!(total_free_count(&sections), 1);
        free(&sections, &lru, &hw, None, page).unwrap();
        assert_eq!(total_free_count(&sections), 2);
    }

    #[test]
    fn alloc_fails_without_reclaim_when_sections_exhausted() {
        let sections = vec![boot_section(1)];
        let lru = EpcLru::new();
        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(0, 2);
        let ctx = AllocContext {
            sections: &sections,
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
            signal: &NeverPending,
        };

        let _held = alloc(&ctx, PageOwner::Virt(crate::page::VirtHandle(1)), None, false).unwrap();
        let result = alloc(&ctx, PageOwner::Virt(crate::page::VirtHandle(2)), None, false);
        assert!(matches!(result, Err(EpcError::NoMemory)));
    }

    #[test]
    fn busy_when_reclaimable_pages_exist_but_reclaim_not_allowed() {
        // A reclaimable (enclave-owned) page exists, so exhaustion
        // should surface Busy, not NoMemory, when reclaim_allowed=false
        // (spec.md §4.1 step 2, §7's Busy row).
        let sections = vec![boot_section(1)];
        let lru = EpcLru::new();
        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(0, 2);
        let ctx = AllocContext {
            sections: &sections,
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
            signal: &NeverPending,
        };

        let encl = Arc::new(Encl::new(0, 4096));
        let _held = alloc(
            &ctx,
            PageOwner::Enclave(Arc::downgrade(&encl), 0),
            None,
            false,
        )
        .unwrap();
        assert_eq!(lru.reclaimable_count(), 1);

        let result = alloc(
            &ctx,
            PageOwner::Enclave(Arc::downgrade(&encl), 1),
            None,
            false,
        );
        assert!(matches!(result, Err(EpcError::Busy)));
    }

    #[test]
    fn version_array_and_virt_pages_are_not_reclaimable() {
        let sections = vec![boot_section(2)];
        let lru = EpcLru::new();
        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(0, 2);
        let ctx = AllocContext {
            sections: &sections,
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
            signal: &NeverPending,
        };

        let encl = Arc::new(Encl::new(0, 4096));
        let va_page = alloc(&ctx, PageOwner::VersionArray(Arc::downgrade(&encl)), None, false)
            .unwrap();
        assert!(!va_page.flags.has(PageFlags::RECLAIMABLE));
        assert!(va_page.flags.has(PageFlags::VERSION_ARRAY));
        assert_eq!(lru.reclaimable_count(), 0);

        let virt_page = alloc(
            &ctx,
            PageOwner::Virt(crate::page::VirtHandle(9)),
            None,
            false,
        )
        .unwrap();
        assert!(!virt_page.flags.has(PageFlags::RECLAIMABLE));
        assert_eq!(lru.reclaimable_count(), 0);
    }

    struct AlwaysPending;

    impl SignalCheck for AlwaysPending {
        fn is_signal_pending(&self) -> bool {
            true
        }
    }

    #[test]
    fn pending_signal_aborts_direct_reclaim_with_restart() {
        // Sections exhausted but a reclaimable page exists, so direct
        // reclaim would normally run; a pending signal must cut it off
        // with `Restart` before any reclaim pass is attempted (spec.md
        // §4.1 step 2, §5 "Cancellation").
        let sections = vec![boot_section(1)];
        let lru = EpcLru::new();
        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(0, 2);
        let ctx = AllocContext {
            sections: &sections,
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
            signal: &NeverPending,
        };

        let encl = Arc::new(Encl::new(0, 4096));
        let _held = alloc(
            &ctx,
            PageOwner::Enclave(Arc::downgrade(&encl), 0),
            None,
            false,
        )
        .unwrap();

        let ctx = AllocContext {
            signal: &AlwaysPending,
            ..ctx
        };
        let result = alloc(
            &ctx,
            PageOwner::Enclave(Arc::downgrade(&encl), 1),
            None,
            true,
        );
        assert!(matches!(result, Err(EpcError::Restart)));
        assert_eq!(hw.ewb_calls(), 0);
    }
}
