//! # Reservations
//!
//! Every buffer object carries a reservation: a lock with at most one
//! exclusive holder or any number of shared readers, plus the list of fences
//! that still use the buffer.
//!
//! Exclusive holders are identified by a [`Ticket`]. Tickets are stamped in
//! increasing order, so a smaller ticket is an older acquirer. When two
//! acquirers collide the younger one backs off ([`Error::Deadlock`]) and the
//! older one waits, which rules out circular waits.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::sync::relax;
use ember_core::{Error, FenceOwner, FenceRef, InterruptFlag, Result};
use spin::Mutex;

// =============================================================================
// TICKETS
// =============================================================================

/// Acquisition stamp; lower values are older and win conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    /// Raw stamp
    pub const fn stamp(self) -> u64 {
        self.0
    }

    /// Whether `self` was stamped before `other`
    pub fn is_older_than(self, other: Ticket) -> bool {
        self.0 < other.0
    }
}

/// Hands out tickets in increasing order
#[derive(Debug)]
pub struct TicketSource {
    next: AtomicU64,
}

impl TicketSource {
    /// Create a source starting at stamp 1
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Stamp a new ticket
    pub fn next(&self) -> Ticket {
        Ticket(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TicketSource {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// FENCE USAGE
// =============================================================================

/// How a fence uses the buffer it is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FenceUsage {
    /// Memory management (moves, clears); everyone waits
    Kernel,
    /// GPU writes
    Write,
    /// GPU reads
    Read,
    /// Tracked for lifetime only; never waited on implicitly
    Bookkeep,
}

/// Which reservation fences a new submission must wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Only kernel fences; user work is ordered by explicit dependencies
    Explicit,
    /// Every fence not produced by the submitting context
    NotEqualOwner,
}

/// A fence recorded on a reservation
#[derive(Debug, Clone)]
pub struct ResvFence {
    /// The fence
    pub fence: FenceRef,
    /// Usage
    pub usage: FenceUsage,
}

// =============================================================================
// RESERVATION
// =============================================================================

/// Outcome of a non-blocking lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// Lock taken
    Acquired,
    /// Caller already holds it
    AlreadyHeld,
    /// Exclusively held by another ticket
    HeldBy(Ticket),
    /// Held by shared readers
    Readers(u32),
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<Ticket>,
    readers: u32,
}

/// Reservation slot of one buffer object
#[derive(Debug, Default)]
pub struct Reservation {
    state: Mutex<LockState>,
    fences: Mutex<Vec<ResvFence>>,
}

impl Reservation {
    /// Create an unlocked reservation with no fences
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the exclusive lock without waiting
    pub fn try_lock(&self, ticket: Ticket) -> LockAttempt {
        let mut state = self.state.lock();
        match state.holder {
            Some(holder) if holder == ticket => LockAttempt::AlreadyHeld,
            Some(holder) => LockAttempt::HeldBy(holder),
            None if state.readers > 0 => LockAttempt::Readers(state.readers),
            None => {
                state.holder = Some(ticket);
                LockAttempt::Acquired
            },
        }
    }

    /// Take the exclusive lock.
    ///
    /// Waits for younger holders and readers. Returns [`Error::Deadlock`] if
    /// an older ticket holds the lock; the caller must drop everything it
    /// holds and retry.
    pub fn lock(
        &self,
        ticket: Ticket,
        no_wait: bool,
        interrupt: Option<&InterruptFlag>,
    ) -> Result<()> {
        loop {
            match self.try_lock(ticket) {
                LockAttempt::Acquired => return Ok(()),
                LockAttempt::AlreadyHeld => return Err(Error::InvalidArgument),
                LockAttempt::HeldBy(holder) if holder.is_older_than(ticket) => {
                    return Err(Error::Deadlock);
                },
                LockAttempt::HeldBy(_) | LockAttempt::Readers(_) => {},
            }
            if no_wait {
                return Err(Error::WouldBlock);
            }
            if interrupt.is_some_and(|flag| flag.is_raised()) {
                return Err(Error::Interrupted);
            }
            relax();
        }
    }

    /// Take the exclusive lock after backing off, holding nothing else.
    ///
    /// Waits for any holder regardless of age.
    pub fn lock_slow(&self, ticket: Ticket, interrupt: Option<&InterruptFlag>) -> Result<()> {
        loop {
            match self.try_lock(ticket) {
                LockAttempt::Acquired => return Ok(()),
                LockAttempt::AlreadyHeld => return Err(Error::InvalidArgument),
                LockAttempt::HeldBy(_) | LockAttempt::Readers(_) => {},
            }
            if interrupt.is_some_and(|flag| flag.is_raised()) {
                return Err(Error::Interrupted);
            }
            relax();
        }
    }

    /// Release the exclusive lock held by `ticket`
    pub fn unlock(&self, ticket: Ticket) {
        let mut state = self.state.lock();
        if state.holder == Some(ticket) {
            state.holder = None;
        } else {
            log::warn!("reservation unlock by non-holder {:?}", ticket);
        }
    }

    /// Try to take a shared read lock
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        if state.holder.is_some() {
            return false;
        }
        state.readers += 1;
        true
    }

    /// Release a shared read lock
    pub fn unlock_shared(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
    }

    /// Current exclusive holder
    pub fn holder(&self) -> Option<Ticket> {
        self.state.lock().holder
    }

    /// Whether anyone holds the reservation
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.holder.is_some() || state.readers > 0
    }

    /// Whether `ticket` holds the exclusive lock
    pub fn is_locked_by(&self, ticket: Ticket) -> bool {
        self.state.lock().holder == Some(ticket)
    }

    // =========================================================================
    // Fences
    // =========================================================================

    /// Make room for `count` more fences so publishing cannot fail
    pub fn reserve_fences(&self, count: usize) -> Result<()> {
        self.fences
            .lock()
            .try_reserve(count)
            .map_err(|_| Error::OutOfMemory)
    }

    /// Record a fence.
    ///
    /// Replaces an older fence from the same context with the same or weaker
    /// usage, and drops fences that have already signalled.
    pub fn add_fence(&self, fence: &FenceRef, usage: FenceUsage) {
        let mut fences = self.fences.lock();
        fences.retain(|f| !f.fence.is_signaled());

        if let Some(slot) = fences
            .iter_mut()
            .find(|f| f.fence.context() == fence.context() && f.usage >= usage)
        {
            if !slot.fence.is_later(fence) {
                slot.fence = fence.clone();
                slot.usage = usage;
            }
            return;
        }

        fences.push(ResvFence {
            fence: fence.clone(),
            usage,
        });
    }

    /// Fences a submission from `owner` must wait for under `mode`
    pub fn fences_for(&self, mode: SyncMode, owner: FenceOwner) -> Vec<FenceRef> {
        self.fences
            .lock()
            .iter()
            .filter(|f| !f.fence.is_signaled() || f.fence.error().is_some())
            .filter(|f| match (mode, f.usage) {
                (_, FenceUsage::Bookkeep) => false,
                (_, FenceUsage::Kernel) => true,
                (SyncMode::Explicit, _) => false,
                (SyncMode::NotEqualOwner, _) => f.fence.owner() != owner,
            })
            .map(|f| f.fence.clone())
            .collect()
    }

    /// Snapshot of every recorded fence
    pub fn fences(&self) -> Vec<ResvFence> {
        self.fences.lock().clone()
    }

    /// Whether every recorded fence has signalled
    pub fn is_idle(&self) -> bool {
        self.fences.lock().iter().all(|f| f.fence.is_signaled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Fence;

    #[test]
    fn test_exclusive_lock() {
        let tickets = TicketSource::new();
        let (a, b) = (tickets.next(), tickets.next());
        let resv = Reservation::new();

        assert_eq!(resv.try_lock(a), LockAttempt::Acquired);
        assert_eq!(resv.try_lock(a), LockAttempt::AlreadyHeld);
        assert_eq!(resv.try_lock(b), LockAttempt::HeldBy(a));
        assert!(!resv.try_lock_shared());
        resv.unlock(a);
        assert!(!resv.is_locked());
    }

    #[test]
    fn test_younger_backs_off() {
        let tickets = TicketSource::new();
        let (old, young) = (tickets.next(), tickets.next());
        let resv = Reservation::new();

        resv.try_lock(old);
        assert_eq!(resv.lock(young, false, None), Err(Error::Deadlock));
    }

    #[test]
    fn test_no_wait_and_interrupt() {
        let tickets = TicketSource::new();
        let (old, young) = (tickets.next(), tickets.next());
        let resv = Reservation::new();

        resv.try_lock(young);
        assert_eq!(resv.lock(old, true, None), Err(Error::WouldBlock));

        let flag = InterruptFlag::new();
        flag.raise();
        assert_eq!(resv.lock(old, false, Some(&flag)), Err(Error::Interrupted));
    }

    #[test]
    fn test_readers_block_writers() {
        let tickets = TicketSource::new();
        let t = tickets.next();
        let resv = Reservation::new();

        assert!(resv.try_lock_shared());
        assert_eq!(resv.try_lock(t), LockAttempt::Readers(1));
        resv.unlock_shared();
        assert_eq!(resv.try_lock(t), LockAttempt::Acquired);
    }

    #[test]
    fn test_sync_mode_filtering() {
        let resv = Reservation::new();
        let kernel = Fence::new(1, 1, FenceOwner::Kernel);
        let mine = Fence::new(2, 1, FenceOwner::Context(7));
        let theirs = Fence::new(3, 1, FenceOwner::Context(8));
        let bookkeep = Fence::new(4, 1, FenceOwner::Context(8));

        resv.add_fence(&kernel, FenceUsage::Kernel);
        resv.add_fence(&mine, FenceUsage::Write);
        resv.add_fence(&theirs, FenceUsage::Read);
        resv.add_fence(&bookkeep, FenceUsage::Bookkeep);

        let explicit = resv.fences_for(SyncMode::Explicit, FenceOwner::Context(7));
        assert_eq!(explicit.len(), 1);
        assert_eq!(explicit[0].context(), 1);

        let implicit = resv.fences_for(SyncMode::NotEqualOwner, FenceOwner::Context(7));
        let mut contexts: Vec<u64> = implicit.iter().map(|f| f.context()).collect();
        contexts.sort_unstable();
        assert_eq!(contexts, [1, 3]);
    }

    #[test]
    fn test_same_context_fence_replaced() {
        let resv = Reservation::new();
        let first = Fence::new(5, 1, FenceOwner::Context(1));
        let second = Fence::new(5, 2, FenceOwner::Context(1));

        resv.add_fence(&first, FenceUsage::Read);
        resv.add_fence(&second, FenceUsage::Read);
        assert_eq!(resv.fences().len(), 1);
        assert_eq!(resv.fences()[0].fence.seqno(), 2);

        assert!(!resv.is_idle());
        second.signal();
        assert!(resv.is_idle());
    }
}
