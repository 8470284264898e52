//! # User-Pointer Backing
//!
//! Buffer objects whose pages belong to a client process mapping. The pages
//! can change under the driver whenever the process remaps the range, so each
//! pin records the notifier sequence it was taken at. A submission that
//! observes a newer sequence at dispatch must be retried.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ember_core::Result;
use spin::Mutex;

/// A pinned snapshot of a user range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedPages {
    /// Page frame numbers
    pages: Vec<u64>,
    /// Notifier sequence at pin time
    seq: u64,
}

impl PinnedPages {
    /// Create a snapshot
    pub fn new(pages: Vec<u64>, seq: u64) -> Self {
        Self { pages, seq }
    }

    /// Page frame numbers
    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Notifier sequence at pin time
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether both snapshots name the same frames
    pub fn same_pages(&self, other: &PinnedPages) -> bool {
        self.pages == other.pages
    }
}

/// Process memory backing a user-pointer buffer
pub trait UserMemory: Send + Sync {
    /// Process that owns the range
    fn owner(&self) -> u32;

    /// Fault in and pin the range. May block.
    fn pin_pages(&self) -> Result<PinnedPages>;

    /// Drop a pin taken by [`UserMemory::pin_pages`]
    fn unpin_pages(&self, pages: PinnedPages);

    /// Current notifier sequence; bumped on every invalidation
    fn notifier_seq(&self) -> u64;
}

// =============================================================================
// BACKING
// =============================================================================

/// User backing attached to a buffer object
pub struct UserBacking {
    memory: Arc<dyn UserMemory>,
    bound: Mutex<Option<PinnedPages>>,
}

impl UserBacking {
    /// Wrap `memory`; nothing is bound until the first validation
    pub fn new(memory: Arc<dyn UserMemory>) -> Self {
        Self {
            memory,
            bound: Mutex::new(None),
        }
    }

    /// The process memory
    pub fn memory(&self) -> &Arc<dyn UserMemory> {
        &self.memory
    }

    /// Whether `pages` are the frames currently bound
    pub fn is_bound_to(&self, pages: &PinnedPages) -> bool {
        self.bound
            .lock()
            .as_ref()
            .is_some_and(|bound| bound.same_pages(pages))
    }

    /// Bind `pages`, returning the previous binding for the caller to unpin
    pub fn bind(&self, pages: PinnedPages) -> Option<PinnedPages> {
        self.bound.lock().replace(pages)
    }

    /// Whether the process mapping changed since `seq` was sampled
    pub fn changed_since(&self, seq: u64) -> bool {
        self.memory.notifier_seq() != seq
    }
}

impl fmt::Debug for UserBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserBacking")
            .field("owner", &self.memory.owner())
            .field("bound", &self.bound.lock().is_some())
            .finish()
    }
}

// =============================================================================
// HOST USER MEMORY
// =============================================================================

/// In-memory stand-in for a process mapping
#[derive(Debug)]
pub struct HostUserMemory {
    owner: u32,
    pages: Mutex<Vec<u64>>,
    seq: AtomicU64,
    pins: AtomicU32,
}

impl HostUserMemory {
    /// Create a mapping of `page_count` pages starting at frame `first_pfn`
    pub fn new(owner: u32, first_pfn: u64, page_count: u64) -> Self {
        Self {
            owner,
            pages: Mutex::new((first_pfn..first_pfn + page_count).collect()),
            seq: AtomicU64::new(1),
            pins: AtomicU32::new(0),
        }
    }

    /// Move the mapping to new frames and notify
    pub fn remap(&self, first_pfn: u64) {
        let mut pages = self.pages.lock();
        let count = pages.len() as u64;
        *pages = (first_pfn..first_pfn + count).collect();
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Notify without changing the frames
    pub fn invalidate(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
    }

    /// Outstanding pins
    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }
}

impl UserMemory for HostUserMemory {
    fn owner(&self) -> u32 {
        self.owner
    }

    fn pin_pages(&self) -> Result<PinnedPages> {
        let pages = self.pages.lock().clone();
        self.pins.fetch_add(1, Ordering::AcqRel);
        Ok(PinnedPages::new(pages, self.notifier_seq()))
    }

    fn unpin_pages(&self, _pages: PinnedPages) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }

    fn notifier_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_changes_pages_and_seq() {
        let mem = HostUserMemory::new(100, 0x500, 2);
        let first = mem.pin_pages().unwrap();
        mem.remap(0x900);
        let second = mem.pin_pages().unwrap();

        assert!(!first.same_pages(&second));
        assert!(second.seq() > first.seq());
        assert_eq!(mem.pin_count(), 2);
        mem.unpin_pages(first);
        mem.unpin_pages(second);
        assert_eq!(mem.pin_count(), 0);
    }

    #[test]
    fn test_backing_bind() {
        let mem: Arc<dyn UserMemory> = Arc::new(HostUserMemory::new(1, 0x10, 1));
        let backing = UserBacking::new(mem.clone());
        let pages = mem.pin_pages().unwrap();
        let seq = pages.seq();

        assert!(!backing.is_bound_to(&pages));
        assert!(backing.bind(pages.clone()).is_none());
        assert!(backing.is_bound_to(&pages));
        assert!(!backing.changed_since(seq));
    }
}
