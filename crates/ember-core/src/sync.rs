//! # Sync Sets
//!
//! The set of fences a job must wait for before it may run.
//!
//! A [`SyncSet`] keeps at most one fence per fence context. Fences on the same
//! timeline signal in order, so the later one subsumes the earlier. Fences
//! that have already signalled cleanly are never recorded.

use core::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::fence::FenceRef;

// =============================================================================
// INTERRUPTS
// =============================================================================

/// Pending-signal flag for one client.
///
/// Blocking waits on the submission path poll it and abort with
/// [`Error::Interrupted`] when raised.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    raised: AtomicBool,
}

impl InterruptFlag {
    /// Create a lowered flag
    pub const fn new() -> Self {
        Self {
            raised: AtomicBool::new(false),
        }
    }

    /// Raise the flag
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Check the flag without consuming it
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Lower the flag, returning whether it was raised
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Back off inside a polling wait
#[inline]
pub fn relax() {
    #[cfg(feature = "std")]
    std::thread::yield_now();
    #[cfg(not(feature = "std"))]
    core::hint::spin_loop();
}

// =============================================================================
// SYNC SET
// =============================================================================

/// Fences a job depends on, keyed by fence context
#[derive(Debug, Clone, Default)]
pub struct SyncSet {
    fences: HashMap<u64, FenceRef>,
}

impl SyncSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency.
    ///
    /// Returns `true` if the set changed.
    pub fn add(&mut self, fence: &FenceRef) -> bool {
        if fence.is_signaled() && fence.error().is_none() {
            return false;
        }

        match self.fences.get(&fence.context()) {
            Some(existing) if !fence.is_later(existing) => false,
            _ => {
                self.fences.insert(fence.context(), fence.clone());
                true
            },
        }
    }

    /// Union `other` into this set
    pub fn merge(&mut self, other: &SyncSet) {
        for fence in other.fences.values() {
            self.add(fence);
        }
    }

    /// Union this set into `target`
    pub fn fold_into(&self, target: &mut SyncSet) {
        target.merge(self);
    }

    /// Whether every dependency has signalled
    pub fn is_satisfied(&self) -> bool {
        self.fences.values().all(|f| f.is_signaled())
    }

    /// First error carried by a signalled dependency
    pub fn first_error(&self) -> Option<Error> {
        self.fences
            .values()
            .filter(|f| f.is_signaled())
            .find_map(|f| f.error())
    }

    /// Drop dependencies that have signalled without error
    pub fn prune(&mut self) {
        self.fences
            .retain(|_, f| !f.is_signaled() || f.error().is_some());
    }

    /// Block until every dependency signals
    pub fn wait(
        &self,
        clock: &dyn Clock,
        timeout_ns: u64,
        interrupt: Option<&InterruptFlag>,
    ) -> Result<()> {
        let deadline = clock.now_ns().saturating_add(timeout_ns);
        for fence in self.fences.values() {
            let remaining = deadline.saturating_sub(clock.now_ns());
            fence.wait_timeout(clock, remaining, interrupt)?;
        }
        Ok(())
    }

    /// Iterate over the recorded fences
    pub fn iter(&self) -> impl Iterator<Item = &FenceRef> {
        self.fences.values()
    }

    /// Number of recorded fences
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    /// Whether no fence is recorded
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}
