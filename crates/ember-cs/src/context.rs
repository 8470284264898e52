//! # Contexts
//!
//! A context is a client's handle on the GPU: one scheduling entity per
//! hardware queue, plus a bounded history of completion fences that
//! sequence numbers returned by `submit` refer to.
//!
//! ```text
//!   Context
//!   ├── Entity (Gfx.0.0)      fence contexts n, n+1
//!   ├── Entity (Compute.0.0)  fence contexts m, m+1
//!   └── history
//!        └── EngineKey → ring[depth] of SchedFence, next_seq
//! ```
//!
//! Sequence numbers start at 1 and grow by one per submission whose leader
//! ran on that engine. The history lock also orders fence publication, so a
//! waiter that sees a sequence number always finds its fence.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ember_core::{EngineKey, Error, FenceRef, Malformed, Result, SchedFence};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::queue::HwQueue;

// =============================================================================
// ENTITY
// =============================================================================

/// A context's stream of jobs on one hardware queue
pub struct Entity {
    key: EngineKey,
    /// First of two fence contexts: scheduled, then finished
    fence_context: u64,
    queue: Arc<dyn HwQueue>,
    next_seqno: AtomicU64,
}

impl Entity {
    /// Create an entity on `queue`
    pub fn new(key: EngineKey, fence_context: u64, queue: Arc<dyn HwQueue>) -> Self {
        Self {
            key,
            fence_context,
            queue,
            next_seqno: AtomicU64::new(1),
        }
    }

    /// Engine key
    pub fn key(&self) -> EngineKey {
        self.key
    }

    /// Fence context of the scheduled fences
    pub fn fence_context(&self) -> u64 {
        self.fence_context
    }

    /// Target queue
    pub fn queue(&self) -> &Arc<dyn HwQueue> {
        &self.queue
    }

    pub(crate) fn next_seqno(&self) -> u64 {
        self.next_seqno.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("key", &self.key)
            .field("fence_context", &self.fence_context)
            .finish()
    }
}

// =============================================================================
// HISTORY
// =============================================================================

#[derive(Debug)]
struct HistoryRing {
    slots: Vec<Option<SchedFence>>,
    next_seq: u64,
}

/// Completion fences of recent submissions, per engine
#[derive(Debug)]
pub struct ContextHistory {
    rings: HashMap<EngineKey, HistoryRing>,
    depth: usize,
}

impl ContextHistory {
    fn new(depth: usize) -> Self {
        Self {
            rings: HashMap::new(),
            depth,
        }
    }

    fn slot(&self, seq: u64) -> usize {
        (seq as usize) & (self.depth - 1)
    }

    /// Fences of submission `seq` on `key`.
    ///
    /// A sequence number that has not been handed out yet is an error; one
    /// that has aged out of the history is reported as `None` (complete).
    pub fn get(&self, key: EngineKey, seq: u64) -> Result<Option<SchedFence>> {
        let next_seq = self.rings.get(&key).map_or(1, |ring| ring.next_seq);
        if seq >= next_seq {
            return Err(Error::InvalidArgument);
        }
        if seq.saturating_add(self.depth as u64) < next_seq {
            return Ok(None);
        }
        Ok(self
            .rings
            .get(&key)
            .and_then(|ring| ring.slots[self.slot(seq)].clone()))
    }

    /// Finished fence occupying the slot the next submission on `key` takes
    pub fn pending_slot(&self, key: EngineKey) -> Option<FenceRef> {
        let ring = self.rings.get(&key)?;
        ring.slots[self.slot(ring.next_seq)]
            .as_ref()
            .map(|fence| fence.finished.clone())
    }

    /// Last sequence number handed out on `key`
    pub fn last_seq(&self, key: EngineKey) -> u64 {
        self.rings.get(&key).map_or(0, |ring| ring.next_seq - 1)
    }

    /// Record `fence` and return its sequence number
    pub(crate) fn push(&mut self, key: EngineKey, fence: SchedFence) -> Result<u64> {
        if !self.rings.contains_key(&key) {
            let mut slots = Vec::new();
            slots
                .try_reserve_exact(self.depth)
                .map_err(|_| Error::OutOfMemory)?;
            slots.resize(self.depth, None);
            self.rings.insert(key, HistoryRing { slots, next_seq: 1 });
        }
        let depth = self.depth;
        let ring = self.rings.get_mut(&key).ok_or(Error::InvalidArgument)?;
        let seq = ring.next_seq;
        ring.slots[(seq as usize) & (depth - 1)] = Some(fence);
        ring.next_seq += 1;
        Ok(seq)
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

/// A client's submission context
#[derive(Debug)]
pub struct Context {
    global_id: u64,
    entities: BTreeMap<EngineKey, Arc<Entity>>,
    history: Mutex<ContextHistory>,
    guilty: Arc<AtomicBool>,
    generation: AtomicU64,
    preamble_presented: AtomicBool,
}

impl Context {
    /// Create a context; `history_depth` must be a power of two
    pub(crate) fn new(
        global_id: u64,
        generation: u64,
        entities: BTreeMap<EngineKey, Arc<Entity>>,
        history_depth: usize,
    ) -> Result<Self> {
        if !history_depth.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            global_id,
            entities,
            history: Mutex::new(ContextHistory::new(history_depth)),
            guilty: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(generation),
            preamble_presented: AtomicBool::new(false),
        })
    }

    /// Device-wide id; fences this context produces carry it as owner
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Entity for `key`, if its queue can take work
    pub fn entity(&self, key: EngineKey) -> Result<&Arc<Entity>> {
        let entity = self.entities.get(&key).ok_or(Malformed::NoRunnableQueue)?;
        if !entity.queue().is_ready() {
            log::warn!("ctx {}: queue {} not ready", self.global_id, key);
            return Err(Malformed::NoRunnableQueue.into());
        }
        Ok(entity)
    }

    /// Lock the history
    pub fn history(&self) -> MutexGuard<'_, ContextHistory> {
        self.history.lock()
    }

    /// Whether a hardware failure was blamed on this context
    pub fn is_guilty(&self) -> bool {
        self.guilty.load(Ordering::Acquire)
    }

    /// Blame a hardware failure on this context
    pub fn mark_guilty(&self) {
        if !self.guilty.swap(true, Ordering::AcqRel) {
            log::warn!("ctx {}: marked guilty", self.global_id);
        }
    }

    pub(crate) fn guilty_flag(&self) -> Arc<AtomicBool> {
        self.guilty.clone()
    }

    /// Device recovery generation this context was last valid at
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Clear the guilty state and adopt `generation`
    pub fn reset(&self, generation: u64) {
        self.guilty.store(false, Ordering::Release);
        self.generation.store(generation, Ordering::Release);
        self.preamble_presented.store(false, Ordering::Release);
        log::debug!("ctx {}: reset at generation {}", self.global_id, generation);
    }

    /// Record that a preamble was submitted; returns `true` the first time
    pub(crate) fn present_preamble(&self) -> bool {
        !self.preamble_presented.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SoftwareQueue;
    use ember_core::{EngineType, FenceOwner};

    fn gfx() -> EngineKey {
        EngineKey::new(EngineType::Gfx, 0, 0)
    }

    fn context(depth: usize) -> Context {
        let queue = Arc::new(SoftwareQueue::new(gfx()));
        let mut entities = BTreeMap::new();
        entities.insert(gfx(), Arc::new(Entity::new(gfx(), 2, queue)));
        Context::new(1, 0, entities, depth).unwrap()
    }

    #[test]
    fn test_history_depth_must_be_power_of_two() {
        for depth in [0, 3, 24] {
            assert!(matches!(
                Context::new(1, 0, BTreeMap::new(), depth),
                Err(Error::InvalidArgument)
            ));
        }
        assert!(Context::new(1, 0, BTreeMap::new(), 1).is_ok());
    }

    #[test]
    fn test_history_sequence() {
        let ctx = context(4);
        let mut history = ctx.history();
        assert!(matches!(history.get(gfx(), 1), Err(Error::InvalidArgument)));

        for n in 1..=6u64 {
            let seq = history.push(gfx(), SchedFence::new(2, n, FenceOwner::Kernel)).unwrap();
            assert_eq!(seq, n);
        }
        assert_eq!(history.last_seq(gfx()), 6);
        assert!(matches!(history.get(gfx(), 7), Err(Error::InvalidArgument)));
        assert_eq!(history.get(gfx(), 6).unwrap().unwrap().finished.seqno(), 6);
        assert_eq!(history.get(gfx(), 3).unwrap().unwrap().finished.seqno(), 3);
        assert!(history.get(gfx(), 2).unwrap().is_none());
        assert_eq!(history.pending_slot(gfx()).unwrap().seqno(), 3);
    }

    #[test]
    fn test_unknown_or_stopped_engine() {
        let ctx = context(32);
        let compute = EngineKey::new(EngineType::Compute, 0, 0);
        assert_eq!(
            ctx.entity(compute).unwrap_err(),
            Error::Malformed(Malformed::NoRunnableQueue)
        );
        assert!(ctx.entity(gfx()).is_ok());
    }

    #[test]
    fn test_guilty_and_reset() {
        let ctx = context(32);
        assert!(ctx.present_preamble());
        assert!(!ctx.present_preamble());
        ctx.mark_guilty();
        assert!(ctx.is_guilty());
        ctx.reset(3);
        assert!(!ctx.is_guilty());
        assert_eq!(ctx.generation(), 3);
        assert!(ctx.present_preamble());
    }
}
