//! Sleepable-RCU-flavored walk over an enclave's attached memory maps
//! (spec.md §3 `mm_list`/`mm_list_version`, §9 "sleepable RCU over
//! mm-list").
//!
//! Real page-table walking (`encl_find`, `encl_test_and_clear_young`)
//! is out of scope (spec.md §1: the page-fault handler is an external
//! collaborator); [`MmOps`] is the named interface a real page-fault
//! subsystem would implement, and [`sim::SimMm`] is the test double.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Opaque identifier for one attached `mm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmId(pub u64);

/// Real VMA lookup / access-bit / unmap operations, delegated to the
/// (out-of-scope) page-fault and mapping subsystem.
pub trait MmOps: Send + Sync {
    /// Test-and-clear the hardware access ("young") bit on the PTE
    /// mapping `pfn`, if one is currently installed.
    fn test_and_clear_young(&self, pfn: u64) -> bool;

    /// Invalidate any PTE mapping `pfn` in this address space.
    fn zap(&self, pfn: u64);
}

/// One memory map attached to an enclave.
pub struct AttachedMm {
    pub id: MmId,
    /// CPU this mm is believed to currently be scheduled on, or `None`.
    /// Used to compute the IPI mask after `ETRACK` (spec.md §4.3).
    current_cpu: AtomicI64,
    /// Address-space read lock (lock order level 2, spec.md §5).
    /// Real implementations would guard actual page tables here; this
    /// crate delegates the walk itself to `ops`, so the lock only
    /// needs to model mutual exclusion with anything that mutates the
    /// address space concurrently.
    space: RwLock<()>,
    ops: Arc<dyn MmOps>,
}

const NO_CPU: i64 = -1;

impl AttachedMm {
    pub fn new(id: MmId, ops: Arc<dyn MmOps>) -> Self {
        Self {
            id,
            current_cpu: AtomicI64::new(NO_CPU),
            space: RwLock::new(()),
            ops,
        }
    }

    pub fn set_current_cpu(&self, cpu: Option<u32>) {
        self.current_cpu
            .store(cpu.map(|c| c as i64).unwrap_or(NO_CPU), Ordering::Release);
    }

    pub fn current_cpu(&self) -> Option<u32> {
        match self.current_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu as u32),
        }
    }

    /// Acquire the address-space read lock and test-and-clear the
    /// access bit for `pfn` (spec.md §4.3 aging test).
    pub fn test_and_clear_young(&self, pfn: u64) -> bool {
        let _guard = self.space.read().unwrap();
        self.ops.test_and_clear_young(pfn)
    }

    /// Acquire the address-space read lock and invalidate `pfn`'s PTE
    /// (spec.md §4.3 Phase 2 — Block).
    pub fn zap(&self, pfn: u64) {
        let _guard = self.space.read().unwrap();
        self.ops.zap(pfn);
    }
}

/// A minimal, `Mutex`-backed stand-in for an atomic-pointer-swap
/// publish/read primitive, grounded on the teacher's own
/// `src/sync/arcswap.rs` (`ArcSwap<T>`: `swap`/`borrow` on an
/// `AtomicPtr`). Reimplemented on a `Mutex<Arc<T>>` rather than raw
/// pointer arithmetic: this crate runs hosted, so there is no need to
/// accept `unsafe` pointer juggling to get the same externally-visible
/// "atomic snapshot publish" behavior.
struct ArcSwap<T> {
    inner: Mutex<Arc<T>>,
}

impl<T> ArcSwap<T> {
    fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Arc::new(value)),
        }
    }

    fn load(&self) -> Arc<T> {
        self.inner.lock().unwrap().clone()
    }

    fn store(&self, value: Arc<T>) {
        *self.inner.lock().unwrap() = value;
    }
}

/// The enclave's list of attached memory maps, with the
/// generation-counter retry protocol spec.md §5/§9 describe in place of
/// real sleepable RCU.
pub struct EnclMmList {
    snapshot: ArcSwap<Vec<Weak<AttachedMm>>>,
    version: AtomicU64,
}

impl Default for EnclMmList {
    fn default() -> Self {
        Self::new()
    }
}

impl EnclMmList {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Append a newly attached mm. The version bump is published with a
    /// release store pairing with the load-acquire a walker re-checks
    /// at the end of its traversal, so a reader observing the new
    /// version also observes this append (spec.md §5).
    pub fn attach(&self, mm: Weak<AttachedMm>) {
        let mut next = (*self.snapshot.load()).clone();
        next.push(mm);
        self.snapshot.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn detach(&self, id: MmId) {
        let mut next = (*self.snapshot.load()).clone();
        next.retain(|weak| weak.upgrade().is_some_and(|mm| mm.id != id));
        self.snapshot.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Walk every attached mm still alive, calling `visit` for each.
    /// Retried whenever `version` changed during the walk (spec.md §5),
    /// so a concurrent `attach` during the walk is never silently
    /// missed.
    pub fn walk_with_retry(&self, mut visit: impl FnMut(&Arc<AttachedMm>)) {
        loop {
            let before = self.version.load(Ordering::Acquire);
            let snapshot = self.snapshot.load();
            for weak in snapshot.iter() {
                if let Some(mm) = weak.upgrade() {
                    visit(&mm);
                }
            }
            let after = self.version.load(Ordering::Acquire);
            if before == after {
                break;
            }
        }
    }

    /// Compute the set of CPUs any currently-attached, still-live mm is
    /// scheduled on. Must be called *after* `ETRACK` (spec.md §5: "no
    /// CPU that entered after the epoch advance is missed").
    pub fn cpu_mask(&self) -> std::collections::BTreeSet<u32> {
        let mut mask = std::collections::BTreeSet::new();
        self.walk_with_retry(|mm| {
            if let Some(cpu) = mm.current_cpu() {
                mask.insert(cpu);
            }
        });
        mask
    }
}

/// Broadcast a no-op IPI to every CPU in the mask, forcing each to
/// cross a kernel boundary before returning to user mode (spec.md §9).
pub trait IpiBroadcast: Send + Sync {
    fn broadcast(&self, cpus: &std::collections::BTreeSet<u32>);
}

/// Test double recording every broadcast it was asked to perform.
pub mod sim {
    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct RecordingIpi {
        calls: StdMutex<Vec<std::collections::BTreeSet<u32>>>,
    }

    impl Default for RecordingIpi {
        fn default() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    impl RecordingIpi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn last_mask(&self) -> Option<std::collections::BTreeSet<u32>> {
            self.calls.lock().unwrap().last().cloned()
        }
    }

    impl IpiBroadcast for RecordingIpi {
        fn broadcast(&self, cpus: &std::collections::BTreeSet<u32>) {
            self.calls.lock().unwrap().push(cpus.clone());
        }
    }

    /// A [`super::MmOps`] double with a programmable per-page access
    /// bit, for aging/blocking tests.
    pub struct SimMm {
        young: StdMutex<std::collections::HashSet<u64>>,
        zapped: StdMutex<std::collections::HashSet<u64>>,
    }

    impl Default for SimMm {
        fn default() -> Self {
            Self {
                young: StdMutex::new(std::collections::HashSet::new()),
                zapped: StdMutex::new(std::collections::HashSet::new()),
            }
        }
    }

    impl SimMm {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mark_young(&self, pfn: u64) {
            self.young.lock().unwrap().insert(pfn);
        }

        pub fn is_zapped(&self, pfn: u64) -> bool {
            self.zapped.lock().unwrap().contains(&pfn)
        }
    }

    impl super::MmOps for SimMm {
        fn test_and_clear_young(&self, pfn: u64) -> bool {
            self.young.lock().unwrap().remove(&pfn)
        }

        fn zap(&self, pfn: u64) {
            self.zapped.lock().unwrap().insert(pfn);
        }
    }
}
