//! Boot-time sanitization (spec.md §4.5): every EPC page's hardware
//! state is undefined until `EREMOVE`d once at boot, before it can join
//! a section's free list.

use crate::hw::Hardware;
use crate::section::EpcSection;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop flag, checked between pages so a caller can cancel a
/// long-running sanitization pass (e.g. on shutdown racing boot).
#[derive(Default)]
pub struct StopRequest(AtomicBool);

impl StopRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run the two-pass sanitization sweep over one section: `EREMOVE`
/// every page once, then move everything that succeeded onto the free
/// list (spec.md §4.5). A page whose `EREMOVE` fails — a root page with
/// still-live children reported by firmware — is put back on the
/// unsanitized list for a later retry rather than dropped; boot cannot
/// proceed until every page sanitizes, but this module only performs
/// one sweep per call so the caller can interleave sweeps across
/// sections and yield between them.
///
/// Returns the number of pages sanitized this sweep.
pub fn sanitize_section(section: &EpcSection, hw: &dyn Hardware, stop: &StopRequest) -> usize {
    let mut sanitized = 0;
    let mut retry = Vec::new();

    while let Some(page) = section.pop_unsanitized() {
        if stop.is_set() {
            section.push_unsanitized(page);
            break;
        }
        match hw.ereg_remove(page.pfn) {
            Ok(()) => {
                section.push_free(page);
                sanitized += 1;
            }
            Err(_) => retry.push(page),
        }
        // Cooperative yield point: this sweep can run on the boot
        // thread alongside other startup work, so give it up
        // periodically rather than monopolizing the scheduler for
        // however long the whole section takes.
        std::thread::yield_now();
    }

    for page in retry {
        section.push_unsanitized(page);
    }

    sanitized
}

/// Run sweeps over every section until each has no unsanitized pages
/// left, or `stop` is signaled. Returns the total number of pages
/// sanitized.
pub fn sanitize_all(sections: &[EpcSection], hw: &dyn Hardware, stop: &StopRequest) -> usize {
    let mut total = 0;
    loop {
        if stop.is_set() {
            break;
        }
        let mut made_progress = false;
        for section in sections {
            let sanitized_here = sanitize_section(section, hw, stop);
            total += sanitized_here;
            made_progress |= sanitized_here > 0;
        }
        if !made_progress {
            break;
        }
    }
    total
}

/// The daemon's boot-time call (spec.md §4.4 step 1): exactly two
/// passes over every section. The first pass clears every page whose
/// `EREMOVE` succeeds immediately; root (SECS) pages with live children
/// fail and are deferred. By the second pass those children have
/// already been removed in the first, so the deferred root pages now
/// succeed. [`sanitize_all`] generalizes this into "keep sweeping while
/// making progress" for callers that can't assume two passes suffice;
/// the daemon uses this narrower, spec-literal form instead.
pub fn boot_sanitize(sections: &[EpcSection], hw: &dyn Hardware, stop: &StopRequest) -> usize {
    let mut total = 0;
    for _pass in 0..2 {
        if stop.is_set() {
            break;
        }
        for section in sections {
            total += sanitize_section(section, hw, stop);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimHardware;

    #[test]
    fn every_page_ends_up_free() {
        let section = EpcSection::new(0, 0, 8);
        let hw = SimHardware::new();
        let stop = StopRequest::new();
        let sanitized = sanitize_section(&section, &hw, &stop);
        assert_eq!(sanitized, 8);
        assert_eq!(section.free_count(), 8);
        assert_eq!(hw.remove_calls(), 8);
    }

    #[test]
    fn failed_remove_is_retried_on_next_sweep() {
        let section = EpcSection::new(0, 0, 2);
        let hw = SimHardware::new();
        hw.fail_remove(0);
        let stop = StopRequest::new();

        let first = sanitize_section(&section, &hw, &stop);
        assert_eq!(first, 1);
        // Pre-set to the full page count at boot (spec.md §9 Open
        // Question 1); only pfn 1 is actually poppable from `free` at
        // this point.
        assert_eq!(section.free_count(), 2);

        hw.allow_remove(0);
        let second = sanitize_section(&section, &hw, &stop);
        assert_eq!(second, 1);
        assert_eq!(section.free_count(), 2);
        assert!(section.alloc_one().is_some());
        assert!(section.alloc_one().is_some());
        assert!(section.alloc_one().is_none());
    }

    #[test]
    fn boot_sanitize_runs_exactly_two_passes() {
        let sections = vec![EpcSection::new(0, 0, 4)];
        let hw = SimHardware::new();
        let stop = StopRequest::new();

        let total = boot_sanitize(&sections, &hw, &stop);
        assert_eq!(total, 4);
        assert_eq!(sections[0].free_count(), 4);
        // A page that sanitizes cleanly in the first pass must not be
        // double-counted or re-removed by the second.
        assert_eq!(hw.remove_calls(), 4);
    }

    #[test]
    fn boot_sanitize_leaves_persistently_failing_page_unsanitized() {
        let sections = vec![EpcSection::new(0, 0, 2)];
        let hw = SimHardware::new();
        hw.fail_remove(0); // models a root page whose child never clears
        let stop = StopRequest::new();

        let total = boot_sanitize(&sections, &hw, &stop);
        assert_eq!(total, 1); // only pfn 1 ever succeeds
        // free_count still reports the full page count (spec.md §9 Open
        // Question 1) even though only one page actually sanitized;
        // alloc_one only ever yields the one that's genuinely free.
        assert_eq!(sections[0].free_count(), 2);
        assert!(sections[0].alloc_one().is_some());
        assert!(sections[0].alloc_one().is_none());
        assert!(sections[0].pop_unsanitized().is_some());
    }

    #[test]
    fn stop_request_halts_sweep_early() {
        let section = EpcSection::new(0, 0, 4);
        let hw = SimHardware::new();
        let stop = StopRequest::new();
        stop.signal();
        let sanitized = sanitize_section(&section, &hw, &stop);
        assert_eq!(sanitized, 0);
    }
}
