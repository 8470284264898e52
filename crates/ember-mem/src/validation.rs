//! # Validation List
//!
//! The deduplicated set of buffers one submission must reserve, kept in
//! global id order, and the all-or-nothing acquisition over it.
//!
//! ## Acquisition
//!
//! ```text
//!   for bo in list (ascending id):
//!       free / younger holder / readers  ──► wait while holding, then take it
//!       older holder                     ──► drop everything, wait for that
//!                                            bo holding nothing, restart
//! ```
//!
//! The ticket is kept across restarts, so a backed-off submission only gets
//! older and eventually wins every conflict.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{Error, InterruptFlag, Result};

use crate::bo::{BoId, BufferObject};
use crate::reservation::Ticket;
use crate::userptr::PinnedPages;

// =============================================================================
// ENTRIES
// =============================================================================

/// Why a buffer is on the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Named by the client's buffer list
    Explicit,
    /// Root page table of the client VM
    PageTableRoot,
    /// Context save area
    ContextArea,
    /// Target of the user fence write
    UserFence,
}

/// One buffer on the list
#[derive(Debug)]
pub struct ValidationEntry {
    /// The buffer
    pub bo: Arc<BufferObject>,
    /// Why it is on the list
    pub origin: EntryOrigin,
    /// Fences may be added by several jobs
    pub shared: bool,
    /// Eviction priority (0..=32)
    pub priority: u32,
    /// Freshly pinned user pages, held until validation
    pub user_pages: Option<PinnedPages>,
    /// Bound user pages are stale and must be replaced
    pub user_invalidated: bool,
    /// Notifier sequence sampled when the user pages were checked
    pub user_seq: Option<u64>,
}

/// Buffers a submission reserves, ordered by id
#[derive(Debug, Default)]
pub struct ValidationList {
    entries: BTreeMap<BoId, ValidationEntry>,
}

impl ValidationList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer.
    ///
    /// A buffer already on the list keeps its origin; the shared flag and
    /// priority are widened. Returns `true` if the buffer was new.
    pub fn add(
        &mut self,
        bo: &Arc<BufferObject>,
        origin: EntryOrigin,
        shared: bool,
        priority: u32,
    ) -> bool {
        if let Some(entry) = self.entries.get_mut(&bo.id()) {
            entry.shared |= shared;
            entry.priority = entry.priority.max(priority);
            return false;
        }
        self.entries.insert(
            bo.id(),
            ValidationEntry {
                bo: bo.clone(),
                origin,
                shared,
                priority,
                user_pages: None,
                user_invalidated: false,
                user_seq: None,
            },
        );
        true
    }

    /// Look up an entry
    pub fn get(&self, id: BoId) -> Option<&ValidationEntry> {
        self.entries.get(&id)
    }

    /// Whether `id` is on the list
    pub fn contains(&self, id: BoId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Entries in acquisition order
    pub fn iter(&self) -> impl Iterator<Item = &ValidationEntry> {
        self.entries.values()
    }

    /// Mutable entries in acquisition order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ValidationEntry> {
        self.entries.values_mut()
    }

    /// Number of buffers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reserve every buffer, or none.
    ///
    /// On success each buffer also has room for `ctx.fence_slots` new fences.
    pub fn lock_all(&self, ctx: &AcquireCtx<'_>) -> Result<LockedSet> {
        let mut prelocked: Option<Arc<BufferObject>> = None;
        let mut restarts = 0u32;

        'restart: loop {
            let mut locked = LockedSet::new(ctx.ticket);
            if let Some(bo) = prelocked.take() {
                locked.bos.push(bo);
            }

            for entry in self.entries.values() {
                if locked.contains(entry.bo.id()) {
                    continue;
                }
                match entry.bo.resv().lock(ctx.ticket, ctx.no_wait, ctx.interrupt) {
                    Ok(()) => locked.bos.push(entry.bo.clone()),
                    Err(Error::Deadlock) => {
                        // An older submission holds it: back off completely.
                        locked.release();
                        if ctx.no_wait {
                            return Err(Error::WouldBlock);
                        }
                        restarts += 1;
                        log::trace!(
                            "ticket {}: backing off bo {} (restart {})",
                            ctx.ticket.stamp(),
                            entry.bo.id(),
                            restarts
                        );
                        entry.bo.resv().lock_slow(ctx.ticket, ctx.interrupt)?;
                        prelocked = Some(entry.bo.clone());
                        continue 'restart;
                    },
                    Err(e) => return Err(e),
                }
            }

            for bo in locked.iter() {
                bo.resv().reserve_fences(ctx.fence_slots)?;
            }
            return Ok(locked);
        }
    }
}

// =============================================================================
// ACQUISITION
// =============================================================================

/// Parameters for [`ValidationList::lock_all`]
#[derive(Debug, Clone, Copy)]
pub struct AcquireCtx<'a> {
    /// Ticket of the acquiring submission
    pub ticket: Ticket,
    /// Fail with [`Error::WouldBlock`] instead of waiting
    pub no_wait: bool,
    /// Aborts waits with [`Error::Interrupted`]
    pub interrupt: Option<&'a InterruptFlag>,
    /// Fence slots to reserve on every buffer
    pub fence_slots: usize,
}

/// Buffers held by one ticket.
///
/// Releasing is explicit through [`LockedSet::release`]; anything still held
/// when the set is dropped is released then.
#[derive(Debug)]
pub struct LockedSet {
    ticket: Ticket,
    bos: Vec<Arc<BufferObject>>,
}

impl LockedSet {
    fn new(ticket: Ticket) -> Self {
        Self {
            ticket,
            bos: Vec::new(),
        }
    }

    /// Ticket holding the buffers
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Whether `id` is held
    pub fn contains(&self, id: BoId) -> bool {
        self.bos.iter().any(|bo| bo.id() == id)
    }

    /// Held buffers
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BufferObject>> {
        self.bos.iter()
    }

    /// Number of held buffers
    pub fn len(&self) -> usize {
        self.bos.len()
    }

    /// Whether nothing is held
    pub fn is_empty(&self) -> bool {
        self.bos.is_empty()
    }

    /// Unlock everything
    pub fn release(&mut self) {
        for bo in self.bos.drain(..) {
            bo.resv().unlock(self.ticket);
        }
    }
}

impl Drop for LockedSet {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::{BoDesc, BoRegistry};
    use crate::reservation::TicketSource;
    use ember_core::PAGE_SIZE;

    fn pool(registry: &BoRegistry, n: usize) -> Vec<Arc<BufferObject>> {
        (0..n)
            .map(|_| registry.create(BoDesc::gtt(PAGE_SIZE)).unwrap())
            .collect()
    }

    fn ctx(ticket: Ticket) -> AcquireCtx<'static> {
        AcquireCtx {
            ticket,
            no_wait: false,
            interrupt: None,
            fence_slots: 2,
        }
    }

    #[test]
    fn test_dedup_widens() {
        let registry = BoRegistry::new();
        let bos = pool(&registry, 1);
        let mut list = ValidationList::new();

        assert!(list.add(&bos[0], EntryOrigin::Explicit, false, 2));
        assert!(!list.add(&bos[0], EntryOrigin::UserFence, true, 8));
        let entry = list.get(bos[0].id()).unwrap();
        assert_eq!(entry.origin, EntryOrigin::Explicit);
        assert!(entry.shared);
        assert_eq!(entry.priority, 8);
    }

    #[test]
    fn test_lock_all_and_release() {
        let registry = BoRegistry::new();
        let tickets = TicketSource::new();
        let bos = pool(&registry, 3);
        let mut list = ValidationList::new();
        for bo in bos.iter().rev() {
            list.add(bo, EntryOrigin::Explicit, true, 0);
        }

        let ids: Vec<BoId> = list.iter().map(|e| e.bo.id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let t = tickets.next();
        let mut locked = list.lock_all(&ctx(t)).unwrap();
        assert_eq!(locked.len(), 3);
        assert!(bos.iter().all(|bo| bo.resv().is_locked_by(t)));
        locked.release();
        assert!(bos.iter().all(|bo| !bo.resv().is_locked()));
    }

    #[test]
    fn test_no_wait_rolls_back() {
        let registry = BoRegistry::new();
        let tickets = TicketSource::new();
        let bos = pool(&registry, 3);
        let (other, mine) = (tickets.next(), tickets.next());
        bos[2].resv().try_lock(other);

        let mut list = ValidationList::new();
        for bo in &bos {
            list.add(bo, EntryOrigin::Explicit, false, 0);
        }
        let acquire = AcquireCtx {
            no_wait: true,
            ..ctx(mine)
        };
        assert_eq!(list.lock_all(&acquire).unwrap_err(), Error::WouldBlock);
        assert!(!bos[0].resv().is_locked());
        assert!(!bos[1].resv().is_locked());
        bos[2].resv().unlock(other);
    }

    #[test]
    fn test_interrupt_rolls_back() {
        let registry = BoRegistry::new();
        let tickets = TicketSource::new();
        let bos = pool(&registry, 2);
        let (mine, younger) = (tickets.next(), tickets.next());
        bos[1].resv().try_lock(younger);

        let mut list = ValidationList::new();
        for bo in &bos {
            list.add(bo, EntryOrigin::Explicit, false, 0);
        }
        let flag = InterruptFlag::new();
        flag.raise();
        let acquire = AcquireCtx {
            interrupt: Some(&flag),
            ..ctx(mine)
        };
        assert_eq!(list.lock_all(&acquire).unwrap_err(), Error::Interrupted);
        assert!(!bos[0].resv().is_locked());
        bos[1].resv().unlock(younger);
    }

    #[test]
    fn test_younger_backs_off_from_older() {
        let registry = BoRegistry::new();
        let tickets = TicketSource::new();
        let bos = Arc::new(pool(&registry, 2));
        let (older, younger) = (tickets.next(), tickets.next());
        bos[1].resv().try_lock(older);

        let mut list = ValidationList::new();
        for bo in bos.iter() {
            list.add(bo, EntryOrigin::Explicit, false, 0);
        }

        let holder = bos.clone();
        let handle = std::thread::spawn(move || {
            // Wait until the younger acquirer has backed off bo 0.
            while holder[0].resv().is_locked() || !holder[1].resv().is_locked() {
                std::thread::yield_now();
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
            holder[1].resv().unlock(older);
        });

        let locked = list.lock_all(&ctx(younger)).unwrap();
        assert_eq!(locked.len(), 2);
        handle.join().unwrap();
        drop(locked);
        assert!(!bos[0].resv().is_locked());
    }
}
