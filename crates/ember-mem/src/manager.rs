//! # Placement
//!
//! The memory manager decides where buffers physically live. The submission
//! path only asks it to place a buffer in a set of domains and reports the
//! resulting traffic to the migration throttle.
//!
//! [`HeapManager`] is a capacity-accounting reference implementation: VRAM
//! with a CPU-visible window, GTT, and unbounded system memory.

use ember_core::{Error, Result};
use spin::Mutex;

use crate::bo::BufferObject;
use crate::domain::{BoFlags, Domain};
use crate::reservation::Ticket;

// =============================================================================
// INTERFACE
// =============================================================================

/// Snapshot of memory usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// VRAM capacity
    pub vram_size: u64,
    /// VRAM in use
    pub vram_used: u64,
    /// VRAM held by pinned buffers
    pub vram_pinned: u64,
    /// CPU-visible VRAM capacity
    pub visible_vram_size: u64,
    /// CPU-visible VRAM in use
    pub visible_vram_used: u64,
    /// GTT capacity
    pub gtt_size: u64,
    /// GTT in use
    pub gtt_used: u64,
}

impl MemoryUsage {
    /// Whether all of VRAM is CPU-visible
    pub fn vram_fully_visible(&self) -> bool {
        self.visible_vram_size >= self.vram_size
    }
}

/// Bytes copied by one placement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    /// Bytes moved
    pub bytes: u64,
    /// Bytes moved into CPU-visible VRAM
    pub visible_bytes: u64,
}

impl MoveOutcome {
    /// Sum two outcomes
    pub fn merge(&mut self, other: MoveOutcome) {
        self.bytes += other.bytes;
        self.visible_bytes += other.visible_bytes;
    }
}

/// Memory allocator and placement engine
pub trait MemoryManager: Send + Sync {
    /// Current usage
    fn usage(&self) -> MemoryUsage;

    /// Place `bo` in one of `domains`, moving it if it is elsewhere.
    ///
    /// `ticket` must hold the buffer's reservation.
    fn place(&self, bo: &BufferObject, ticket: Ticket, domains: Domain) -> Result<MoveOutcome>;

    /// Make `bo` physically contiguous and GPU-addressable
    fn make_contiguous(&self, bo: &BufferObject, ticket: Ticket) -> Result<MoveOutcome>;

    /// Place `bo` and pin it there
    fn pin(&self, bo: &BufferObject, ticket: Ticket) -> Result<MoveOutcome>;

    /// Move `bo` out to unmapped system memory
    fn evict(&self, bo: &BufferObject, ticket: Ticket) -> Result<()>;
}

// =============================================================================
// HEAP MANAGER
// =============================================================================

/// Heap manager configuration
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// VRAM capacity
    pub vram_size: u64,
    /// CPU-visible VRAM capacity (the BAR window)
    pub visible_vram_size: u64,
    /// GTT capacity
    pub gtt_size: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            vram_size: 256 * 1024 * 1024,
            visible_vram_size: 64 * 1024 * 1024,
            gtt_size: 512 * 1024 * 1024,
        }
    }
}

/// GPU offset where GTT placements start
const GTT_BASE: u64 = 1 << 40;

#[derive(Debug, Default)]
struct HeapState {
    vram_used: u64,
    vram_pinned: u64,
    visible_used: u64,
    gtt_used: u64,
    next_vram: u64,
    next_gtt: u64,
}

/// Heap manager statistics
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    /// Placements that moved data
    pub moves: u64,
    /// Bytes moved
    pub bytes_moved: u64,
    /// Placements refused for lack of space
    pub failures: u64,
}

/// Capacity-accounting memory manager
#[derive(Debug)]
pub struct HeapManager {
    config: HeapConfig,
    state: Mutex<HeapState>,
    stats: Mutex<HeapStats>,
}

impl HeapManager {
    /// Create a manager with the given capacities
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HeapState::default()),
            stats: Mutex::new(HeapStats::default()),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> HeapStats {
        self.stats.lock().clone()
    }

    /// Charge `size` bytes to `domain`, returning the GPU offset and visibility
    fn charge(
        &self,
        state: &mut HeapState,
        domain: Domain,
        size: u64,
        flags: BoFlags,
    ) -> Option<(Option<u64>, bool)> {
        if domain == Domain::VRAM {
            if state.vram_used + size > self.config.vram_size {
                return None;
            }
            let visible = flags.contains(BoFlags::CPU_ACCESS_REQUIRED);
            if visible {
                if state.visible_used + size > self.config.visible_vram_size {
                    return None;
                }
                state.visible_used += size;
            }
            state.vram_used += size;
            let offset = state.next_vram;
            state.next_vram += size;
            Some((Some(offset), visible))
        } else if domain == Domain::GTT {
            if state.gtt_used + size > self.config.gtt_size {
                return None;
            }
            state.gtt_used += size;
            let offset = GTT_BASE + state.next_gtt;
            state.next_gtt += size;
            Some((Some(offset), false))
        } else {
            Some((None, false))
        }
    }

    fn uncharge(state: &mut HeapState, domain: Domain, size: u64, visible: bool) {
        if domain == Domain::VRAM {
            state.vram_used = state.vram_used.saturating_sub(size);
            if visible {
                state.visible_used = state.visible_used.saturating_sub(size);
            }
        } else if domain == Domain::GTT {
            state.gtt_used = state.gtt_used.saturating_sub(size);
        }
    }
}

impl MemoryManager for HeapManager {
    fn usage(&self) -> MemoryUsage {
        let state = self.state.lock();
        MemoryUsage {
            vram_size: self.config.vram_size,
            vram_used: state.vram_used,
            vram_pinned: state.vram_pinned,
            visible_vram_size: self.config.visible_vram_size,
            visible_vram_used: state.visible_used,
            gtt_size: self.config.gtt_size,
            gtt_used: state.gtt_used,
        }
    }

    fn place(&self, bo: &BufferObject, ticket: Ticket, domains: Domain) -> Result<MoveOutcome> {
        let mut placement = bo.placement_mut(ticket)?;
        let wanted = domains & bo.allowed_domains();
        if wanted.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if wanted.contains(placement.domain) && placement.gpu_offset.is_some() {
            return Ok(MoveOutcome::default());
        }
        if placement.is_pinned() {
            return Err(Error::WouldBlock);
        }

        let mut state = self.state.lock();
        for domain in Domain::PREFERENCE {
            if !wanted.contains(domain) {
                continue;
            }
            let Some((offset, visible)) = self.charge(&mut state, domain, bo.size(), bo.flags()) else {
                continue;
            };
            Self::uncharge(&mut state, placement.domain, bo.size(), placement.visible);

            placement.domain = domain;
            placement.gpu_offset = offset;
            placement.visible = visible;
            placement.contiguous = domain == Domain::GTT
                || (domain == Domain::VRAM && bo.flags().contains(BoFlags::VRAM_CONTIGUOUS));

            let outcome = MoveOutcome {
                bytes: bo.size(),
                visible_bytes: if visible { bo.size() } else { 0 },
            };
            let mut stats = self.stats.lock();
            stats.moves += 1;
            stats.bytes_moved += outcome.bytes;
            log::trace!("bo {}: placed in {:?}", bo.id(), domain);
            return Ok(outcome);
        }

        self.stats.lock().failures += 1;
        log::debug!("bo {}: no room in {:?}", bo.id(), wanted);
        Err(Error::OutOfMemory)
    }

    fn make_contiguous(&self, bo: &BufferObject, ticket: Ticket) -> Result<MoveOutcome> {
        let mut outcome = MoveOutcome::default();
        if !bo.placement().domain.is_gpu_accessible() {
            outcome.merge(self.place(bo, ticket, bo.allowed_domains())?);
        }

        let mut placement = bo.placement_mut(ticket)?;
        if placement.contiguous {
            return Ok(outcome);
        }
        if placement.is_pinned() {
            return Err(Error::WouldBlock);
        }

        // Re-allocate in place; capacity is already charged.
        let mut state = self.state.lock();
        placement.gpu_offset = Some(state.next_vram);
        state.next_vram += bo.size();
        placement.contiguous = true;
        outcome.bytes += bo.size();
        if placement.visible {
            outcome.visible_bytes += bo.size();
        }
        Ok(outcome)
    }

    fn pin(&self, bo: &BufferObject, ticket: Ticket) -> Result<MoveOutcome> {
        let mut outcome = match self.place(bo, ticket, bo.preferred_domains()) {
            Err(Error::OutOfMemory) => self.place(bo, ticket, bo.allowed_domains())?,
            other => other?,
        };
        if bo.flags().contains(BoFlags::VRAM_CONTIGUOUS) {
            outcome.merge(self.make_contiguous(bo, ticket)?);
        }
        bo.pin(ticket)?;
        if bo.placement().domain == Domain::VRAM {
            self.state.lock().vram_pinned += bo.size();
        }
        Ok(outcome)
    }

    fn evict(&self, bo: &BufferObject, ticket: Ticket) -> Result<()> {
        let mut placement = bo.placement_mut(ticket)?;
        if placement.is_pinned() {
            return Err(Error::WouldBlock);
        }
        Self::uncharge(&mut self.state.lock(), placement.domain, bo.size(), placement.visible);
        placement.domain = Domain::CPU;
        placement.gpu_offset = None;
        placement.visible = false;
        placement.contiguous = false;
        Ok(())
    }
}
