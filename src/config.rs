//! Tunable constants and per-system configuration (spec.md §6).

/// Default number of pages the reclaimer scans per wake-up of the
/// background daemon, and per direct-reclaim iteration.
pub const SCAN_BATCH: usize = 16;

/// Hard ceiling on the number of pages isolated into a single reclaim
/// batch, regardless of caller-requested scan size.
pub const MAX_BATCH: usize = 32;

/// Upper bound on the number of hardware-reported EPC sections a system
/// may register.
pub const MAX_SECTIONS: usize = 16;

/// Default number of replay-protection slots held by one version-array
/// page. Mirrors a 4 KiB VA page holding one nonce per evicted page.
pub const VA_SLOTS_PER_PAGE: usize = 512;

/// Runtime-configurable watermarks and batch sizes for one [`crate::EpcSystem`].
///
/// Kept as plain fields (not global `const`s) so tests can exercise
/// small section sizes without waiting on production-scale watermarks.
#[derive(Debug, Clone, Copy)]
pub struct EpcConfig {
    pub scan_batch: usize,
    pub max_batch: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

impl EpcConfig {
    pub const fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            scan_batch: SCAN_BATCH,
            max_batch: MAX_BATCH,
            low_watermark,
            high_watermark,
        }
    }
}

impl Default for EpcConfig {
    fn default() -> Self {
        Self::new(32, 64)
    }
}
