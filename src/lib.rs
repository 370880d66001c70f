//! Enclave Page Cache (EPC) manager core.
//!
//! Tracks the fixed, non-swappable pool of hardware-protected physical
//! pages a trusted-execution extension carves out of system memory,
//! overcommitting it by paging enclave pages out to ordinary backing
//! storage (encrypted and integrity-protected by hardware on eviction)
//! and back in on demand. This crate owns the allocator, the
//! three-phase hardware eviction protocol, LRU tracking, the background
//! reclaim daemon and direct-reclaim path, the OOM handler, and
//! boot-time sanitization. Enclave lifecycle, page-fault handling, the
//! virtualization backend, cgroup policy, and backing-store I/O are
//! named collaborator interfaces, not implemented here.

pub mod alloc;
pub mod backing;
pub mod cgroup;
pub mod config;
pub mod daemon;
pub mod encl;
pub mod error;
pub mod hw;
pub mod lru;
pub mod mm_list;
pub mod oom;
pub mod page;
pub mod provision;
pub mod reclaim;
pub mod sanitize;
pub mod section;
pub mod sync;

use alloc::SignalCheck;
use backing::BackingStore;
use cgroup::EpcCgroupOps;
use config::EpcConfig;
use daemon::{DaemonHandle, Freezer};
use encl::Encl;
use error::EpcError;
use hw::Hardware;
use lru::LruRegistry;
use mm_list::IpiBroadcast;
use oom::VirtEpcOps;
use page::{EpcPageRef, PageOwner};
use section::EpcSection;
use std::sync::Arc;
use std::time::Duration;

/// One hardware-reported EPC section's boot parameters: physical base
/// pfn and page count (spec.md §4.1 "Section setup").
#[derive(Debug, Clone, Copy)]
pub struct SectionDesc {
    pub base_pfn: u64,
    pub page_count: usize,
}

/// Everything the process needs to initialize the page cache: the
/// hardware-reported section layout plus the collaborator interfaces
/// this crate depends on but does not implement (spec.md §1's boundary:
/// enclave lifecycle, page-fault handling, the virtualization backend,
/// cgroup policy, backing-store I/O, and the caller's signal state).
pub struct EpcInit {
    pub sections: Vec<SectionDesc>,
    pub config: EpcConfig,
    pub hw: Arc<dyn Hardware>,
    pub backing: Arc<dyn BackingStore>,
    pub ipi: Arc<dyn IpiBroadcast>,
    pub cgroup: Option<Arc<dyn EpcCgroupOps>>,
    pub virt: Option<Arc<dyn VirtEpcOps>>,
    pub freezer: Arc<dyn Freezer>,
    pub signal: Arc<dyn SignalCheck>,
    pub daemon_poll_interval: Duration,
}

/// Process-wide EPC state: the section array, the LRU registry, and the
/// daemon handle, all process-singleton (spec.md §9 "Global state").
/// Constructed once via [`EpcSystem::init`]; torn down via
/// [`EpcSystem::shutdown`].
pub struct EpcSystem {
    sections: Arc<Vec<EpcSection>>,
    lru: LruRegistry,
    config: EpcConfig,
    hw: Arc<dyn Hardware>,
    backing: Arc<dyn BackingStore>,
    ipi: Arc<dyn IpiBroadcast>,
    cgroup: Option<Arc<dyn EpcCgroupOps>>,
    virt: Option<Arc<dyn VirtEpcOps>>,
    signal: Arc<dyn SignalCheck>,
    daemon: DaemonHandle,
    daemon_thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EpcSystem {
    /// Build every section's page array, sanitize it (spec.md §4.4 step
    /// 1 — run before the daemon starts taking watermark wake-ups so no
    /// caller can allocate a page that hasn't been `EREMOVE`d yet), then
    /// spawn the background reclaim daemon.
    pub fn init(init: EpcInit) -> Arc<Self> {
        let sections: Vec<EpcSection> = init
            .sections
            .iter()
            .enumerate()
            .map(|(idx, desc)| EpcSection::new(idx, desc.base_pfn, desc.page_count))
            .collect();

        let stop = sanitize::StopRequest::new();
        sanitize::boot_sanitize(&sections, init.hw.as_ref(), &stop);

        let sections = Arc::new(sections);
        let lru = LruRegistry::new();

        let (daemon, daemon_thread) = daemon::spawn(
            sections.clone(),
            lru.global(),
            init.hw.clone(),
            init.backing.clone(),
            init.ipi.clone(),
            init.cgroup.clone(),
            init.config,
            init.freezer,
            init.daemon_poll_interval,
        );

        Arc::new(Self {
            sections,
            lru,
            config: init.config,
            hw: init.hw,
            backing: init.backing,
            ipi: init.ipi,
            cgroup: init.cgroup,
            virt: init.virt,
            signal: init.signal,
            daemon,
            daemon_thread: std::sync::Mutex::new(Some(daemon_thread)),
        })
    }

    /// Stop the daemon and join its thread. Idempotent.
    pub fn shutdown(&self) {
        self.daemon.stop();
        if let Some(handle) = self.daemon_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn total_free_count(&self) -> usize {
        alloc::total_free_count(self.sections.as_slice())
    }

    /// Allocate one EPC page (spec.md §4.1 `alloc`). Runs direct
    /// reclaim inline when sections are exhausted and `reclaim_allowed`
    /// is set; otherwise fails immediately with [`EpcError::Busy`] if
    /// some page is reclaimable (just not right now) or
    /// [`EpcError::NoMemory`] if nothing is reclaimable anywhere. If a
    /// signal becomes pending partway through direct reclaim (per the
    /// `signal` collaborator given at [`EpcSystem::init`]), returns
    /// [`EpcError::Restart`] so the caller can re-drive its syscall
    /// (spec.md §4.1 step 2, §5 "Cancellation").
    pub fn alloc(
        &self,
        owner: PageOwner,
        cgroup_ref: Option<u64>,
        reclaim_allowed: bool,
    ) -> Result<EpcPageRef, EpcError> {
        let lru_scope = match cgroup_ref {
            Some(cgroup_ref) => self.lru.for_cgroup(cgroup_ref),
            None => self.lru.global(),
        };

        let ctx = alloc::AllocContext {
            sections: self.sections.as_slice(),
            lru: lru_scope.as_ref(),
            hw: self.hw.as_ref(),
            backing: self.backing.as_ref(),
            ipi: self.ipi.as_ref(),
            cgroup: self.cgroup.as_deref(),
            config: &self.config,
            signal: self.signal.as_ref(),
        };

        let result = alloc::alloc(&ctx, owner, cgroup_ref, reclaim_allowed);
        if result.is_ok() && self.total_free_count() < self.config.low_watermark {
            self.daemon.request_wake();
        }
        result
    }

    /// Release a page back to its section (spec.md §4.1 `free`).
    pub fn free(&self, page: EpcPageRef) -> Result<(), EpcError> {
        let cgroup_ref = *page.cgroup_ref.lock();
        let lru_scope = match cgroup_ref {
            Some(cgroup_ref) => self.lru.for_cgroup(cgroup_ref),
            None => self.lru.global(),
        };
        alloc::free(
            self.sections.as_slice(),
            lru_scope.as_ref(),
            self.hw.as_ref(),
            self.cgroup.as_deref(),
            page,
        )
    }

    /// Run the OOM handler once (spec.md §4.6): destroy the enclave
    /// owning the global LRU's least-recently-used unreclaimable page,
    /// or ask the virtualization backend to give back capacity if none
    /// is found.
    pub fn run_oom(&self) -> Option<Arc<Encl>> {
        let global = self.lru.global();
        oom::run_oom(
            self.sections.as_slice(),
            global.as_ref(),
            self.hw.as_ref(),
            self.virt.as_deref(),
        )
    }

    /// The capability gate (spec.md §4.7).
    pub fn authorize(
        &self,
        handle: &provision::ProvisionHandle,
        attrs: &mut provision::EnclAttributes,
    ) -> bool {
        provision::authorize(handle, attrs)
    }
}
