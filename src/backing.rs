//! Backing-store contract (spec.md §3, §6). Real shmem-backed I/O is
//! out of scope (spec.md §1); this module only specs the
//! `get_backing`/`put_backing` collaborator interface and a scriptable
//! test double.

use crate::encl::Encl;
use crate::error::EpcError;
use std::sync::Arc;

/// One backing slot: the pair of ordinary pages holding an evicted EPC
/// page's encrypted contents and integrity metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backing {
    pub contents_pfn: u64,
    pub metadata_pfn: u64,
    pub metadata_offset: u32,
}

/// The external shmem-backed store an enclave's evicted pages live in.
pub trait BackingStore: Send + Sync {
    fn get_backing(&self, encl: &Arc<Encl>, page_index: usize) -> Result<Backing, EpcError>;
    fn put_backing(&self, backing: &Backing, dirty: bool);
}

/// An always-succeeding (unless told otherwise) backing store for
/// tests: hands out synthetic, monotonically increasing pfns.
pub mod sim {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct SimBackingStore {
        next_pfn: AtomicU64,
        fail_indices: Mutex<HashSet<(u64, usize)>>,
    }

    impl SimBackingStore {
        pub fn new() -> Self {
            Self {
                next_pfn: AtomicU64::new(1 << 20),
                fail_indices: Mutex::new(HashSet::new()),
            }
        }

        /// Make `get_backing` fail for this `(enclave id, page index)`
        /// pair until cleared.
        pub fn fail_for(&self, encl_id: u64, page_index: usize) {
            self.fail_indices
                .lock()
                .unwrap()
                .insert((encl_id, page_index));
        }

        pub fn allow_for(&self, encl_id: u64, page_index: usize) {
            self.fail_indices
                .lock()
                .unwrap()
                .remove(&(encl_id, page_index));
        }
    }

    impl BackingStore for SimBackingStore {
        fn get_backing(&self, encl: &Arc<Encl>, page_index: usize) -> Result<Backing, EpcError> {
            if self
                .fail_indices
                .lock()
                .unwrap()
                .contains(&(encl.id(), page_index))
            {
                return Err(EpcError::NoMemory);
            }
            let contents_pfn = self.next_pfn.fetch_add(2, Ordering::Relaxed);
            Ok(Backing {
                contents_pfn,
                metadata_pfn: contents_pfn + 1,
                metadata_offset: (page_index as u32) * 8,
            })
        }

        fn put_backing(&self, _backing: &Backing, _dirty: bool) {}
    }
}
