//! Background reclaim daemon (spec.md §4.1, §4.3): wakes on a
//! watermark-crossing signal or periodically, runs reclaim passes until
//! the high watermark is met, then sleeps again.
//!
//! Shaped after the teacher's kernel thread + `Condvar` wake pattern for
//! its own housekeeping daemons (`src/kernel/task` uses a parked/wake
//! model for idle kernel threads rather than a busy poll loop).

use crate::alloc::total_free_count;
use crate::backing::BackingStore;
use crate::cgroup::EpcCgroupOps;
use crate::config::EpcConfig;
use crate::hw::Hardware;
use crate::lru::EpcLru;
use crate::mm_list::IpiBroadcast;
use crate::reclaim::{self, ReclaimOutcome};
use crate::section::EpcSection;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Hook into whatever system-wide freeze/thaw mechanism suspends kernel
/// threads for suspend-to-RAM or hibernation (out of scope to implement
/// here, spec.md §1); the daemon only needs to know whether it is
/// currently allowed to run.
pub trait Freezer: Send + Sync {
    fn is_frozen(&self) -> bool;
}

/// A freezer that never freezes, for tests and for systems with no
/// suspend/resume support.
pub struct NeverFrozen;

impl Freezer for NeverFrozen {
    fn is_frozen(&self) -> bool {
        false
    }
}

/// Shared wake state: a boolean "should check watermarks now" flag plus
/// the `Condvar` the daemon sleeps on, matching `std::sync::Condvar`'s
/// own documented spurious-wake-safe usage pattern.
#[derive(Default)]
struct WakeState {
    pending: bool,
    stop: bool,
}

pub struct DaemonHandle {
    wake: Arc<(Mutex<WakeState>, Condvar)>,
}

impl DaemonHandle {
    /// Signal the daemon that a watermark may have been crossed (spec.md
    /// §4.1: called from `free` and from direct reclaim's caller paths).
    pub fn request_wake(&self) {
        let (lock, cvar) = &*self.wake;
        lock.lock().unwrap().pending = true;
        cvar.notify_one();
    }

    pub fn stop(&self) {
        let (lock, cvar) = &*self.wake;
        lock.lock().unwrap().stop = true;
        cvar.notify_one();
    }
}

/// Everything the daemon loop needs, borrowed for the lifetime of one
/// [`run_once`] call — kept as a bag of references rather than a struct
/// the daemon owns outright, so the same collaborators can be reused by
/// direct reclaim without lifetime contortions.
pub struct DaemonContext<'a> {
    pub sections: &'a [EpcSection],
    pub lru: &'a EpcLru,
    pub hw: &'a dyn Hardware,
    pub backing: &'a dyn BackingStore,
    pub ipi: &'a dyn IpiBroadcast,
    pub cgroup: Option<&'a dyn EpcCgroupOps>,
    pub config: &'a EpcConfig,
}

/// Run reclaim passes until the high watermark is reached or a pass
/// makes no progress (spec.md §4.1: background reclaim targets the
/// *high* watermark, unlike direct reclaim which only needs one page).
pub fn run_once(ctx: &DaemonContext<'_>) -> usize {
    let mut total = 0;
    while total_free_count(ctx.sections) < ctx.config.high_watermark {
        let outcome: ReclaimOutcome = reclaim::reclaim_batch(
            ctx.lru,
            ctx.hw,
            ctx.backing,
            ctx.ipi,
            ctx.config.scan_batch,
            ctx.config.max_batch,
            false,
            |encl| encl.lock().alloc_va_slot(),
        );
        if outcome.is_empty() {
            break;
        }
        for page in outcome.reclaimed {
            let section = &ctx.sections[page.section_idx];
            *page.owner.lock() = None;
            let cgroup_ref = *page.cgroup_ref.lock();
            *page.cgroup_ref.lock() = None;
            page.clear_va_slot();
            page.flags.remove(
                crate::page::PageFlags::RECLAIMABLE | crate::page::PageFlags::RECLAIMED,
            );
            if let (Some(cgroup_ref), Some(cgroup)) = (cgroup_ref, ctx.cgroup) {
                cgroup.uncharge(cgroup_ref);
            }
            section.free_page(page);
            total += 1;
        }
    }
    total
}

/// Block until either a wake is requested, `stop` is set, or the
/// periodic check interval elapses — mirroring watermark daemons that
/// both react to explicit signals and periodically re-check on their
/// own (spec.md §4.1 "wakes on a watermark-crossing signal or
/// periodically").
fn wait_for_wake(wake: &(Mutex<WakeState>, Condvar), poll_interval: Duration) -> WakeOutcome {
    let (lock, cvar) = wake;
    let guard = lock.lock().unwrap();
    let (mut guard, _timeout) = cvar
        .wait_timeout_while(guard, poll_interval, |state| !state.pending && !state.stop)
        .unwrap();
    if guard.stop {
        return WakeOutcome::Stop;
    }
    guard.pending = false;
    WakeOutcome::Woken
}

enum WakeOutcome {
    Woken,
    Stop,
}

/// Spawn the background daemon thread. The returned [`DaemonHandle`]
/// can request an early wake or ask the daemon to stop; the thread
/// exits once it observes `stop`.
///
/// Collaborators are `'static` + `Send + Sync` (rather than the
/// borrowed [`DaemonContext`] `run_once` takes) because the daemon
/// outlives the call that spawns it.
pub fn spawn(
    sections: Arc<Vec<EpcSection>>,
    lru: Arc<EpcLru>,
    hw: Arc<dyn Hardware>,
    backing: Arc<dyn BackingStore>,
    ipi: Arc<dyn IpiBroadcast>,
    cgroup: Option<Arc<dyn EpcCgroupOps>>,
    config: EpcConfig,
    freezer: Arc<dyn Freezer>,
    poll_interval: Duration,
) -> (DaemonHandle, std::thread::JoinHandle<()>) {
    let wake = Arc::new((Mutex::new(WakeState::default()), Condvar::new()));
    let wake_for_thread = wake.clone();

    let join = std::thread::spawn(move || loop {
        match wait_for_wake(&wake_for_thread, poll_interval) {
            WakeOutcome::Stop => break,
            WakeOutcome::Woken => {}
        }
        if freezer.is_frozen() {
            continue;
        }
        let ctx = DaemonContext {
            sections: sections.as_slice(),
            lru: &lru,
            hw: hw.as_ref(),
            backing: backing.as_ref(),
            ipi: ipi.as_ref(),
            cgroup: cgroup.as_deref(),
            config: &config,
        };
        run_once(&ctx);
    });

    (DaemonHandle { wake }, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::sim::SimBackingStore;
    use crate::hw::sim::SimHardware;
    use crate::lru::EpcLru;
    use crate::encl::Encl;
    use crate::mm_list::sim::RecordingIpi;
    use crate::page::{PageFlags, PageOwner};
    use std::sync::Arc;

    fn boot_sections(page_count: usize) -> Vec<EpcSection> {
        let section = EpcSection::new(0, 0, page_count);
        while let Some(page) = section.pop_unsanitized() {
            section.push_free(page);
        }
        vec![section]
    }

    #[test]
    fn run_once_reclaims_until_high_watermark() {
        let sections = boot_sections(5);
        let lru = EpcLru::new();
        let encl = Arc::new(Encl::new(0, 4096 * 4));

        // One page becomes the enclave's VA page, the other four are
        // reclaimable children (spec.md §4.3): consume all 5 free pages,
        // mark the four enclave children reclaimable so the daemon has
        // something to reclaim.
        let va_page = sections[0].alloc_one().unwrap();
        encl.lock().add_va_page(va_page);

        let mut held = Vec::new();
        for idx in 0..4 {
            let page = sections[0].alloc_one().unwrap();
            page.flags.insert(PageFlags::RECLAIMABLE);
            *page.owner.lock() = Some(PageOwner::Enclave(Arc::downgrade(&encl), idx));
            lru.record(page);
            held.push(page);
        }
        assert_eq!(total_free_count(&sections), 0);

        let hw = SimHardware::new();
        let backing = SimBackingStore::new();
        let ipi = RecordingIpi::new();
        let config = EpcConfig::new(1, 3);
        let ctx = DaemonContext {
            sections: sections.as_slice(),
            lru: &lru,
            hw: &hw,
            backing: &backing,
            ipi: &ipi,
            cgroup: None,
            config: &config,
        };

        let reclaimed = run_once(&ctx);
        assert!(reclaimed >= 3, "expected to reach high watermark, reclaimed {reclaimed}");
        assert!(total_free_count(&sections) >= 3);
    }

    #[test]
    fn handle_wake_and_stop_unblock_the_loop() {
        let sections = Arc::new(boot_sections(1));
        let lru = Arc::new(EpcLru::new());
        let hw: Arc<dyn Hardware> = Arc::new(SimHardware::new());
        let backing: Arc<dyn BackingStore> = Arc::new(SimBackingStore::new());
        let ipi: Arc<dyn IpiBroadcast> = Arc::new(RecordingIpi::new());
        let config = EpcConfig::new(0, 1);
        let freezer: Arc<dyn Freezer> = Arc::new(NeverFrozen);

        let (handle, join) = spawn(
            sections,
            lru,
            hw,
            backing,
            ipi,
            None,
            config,
            freezer,
            Duration::from_secs(60),
        );
        handle.request_wake();
        handle.stop();
        join.join().unwrap();
    }
}
