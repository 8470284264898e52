//! # Jobs
//!
//! A job is the unit handed to one hardware queue: the command buffers a
//! submission targets at one engine, the fences it must wait for, and the
//! fence pair it publishes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use ember_core::{EngineKey, Error, FenceOwner, FenceRef, GpuAddr, SchedFence, SyncSet};
use ember_mem::BufferObject;

use crate::context::Entity;
use crate::wire::{IbFlags, ShadowDesc};

/// One command buffer of a job
#[derive(Debug, Clone)]
pub struct CmdBuf {
    /// GPU virtual address
    pub va: GpuAddr,
    /// Length in bytes
    pub len: u32,
    /// Flags from the descriptor
    pub flags: IbFlags,
    /// Validated private copy, for engines that validate a copy
    pub body: Option<Vec<u8>>,
}

/// Where the leader writes its sequence number on completion
#[derive(Debug, Clone)]
pub struct UserFenceTarget {
    /// Fence buffer
    pub bo: Arc<BufferObject>,
    /// Byte offset inside the buffer
    pub offset: u64,
    /// GPU address, known once the buffer is placed
    pub addr: Option<GpuAddr>,
}

bitflags::bitflags! {
    /// Preamble bookkeeping for the hardware
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PreambleStatus: u32 {
        /// The job carries a preamble command buffer
        const PRESENT = 1 << 0;
        /// First preamble this context has ever submitted
        const PRESENT_FIRST = 1 << 1;
    }
}

/// Work for one hardware queue
#[derive(Debug)]
pub struct Job {
    entity: Arc<Entity>,
    pub(crate) cmd_bufs: Vec<CmdBuf>,
    pub(crate) sync: SyncSet,
    fence: Option<SchedFence>,
    pub(crate) gang_leader: Option<FenceRef>,
    generation: u64,
    pub(crate) user_fence: Option<UserFenceTarget>,
    pub(crate) uf_sequence: u64,
    pub(crate) preamble: PreambleStatus,
    pub(crate) shadow: Option<ShadowDesc>,
    owner: FenceOwner,
    guilty: Arc<AtomicBool>,
}

impl Job {
    /// Create a job with room for `cmd_bufs` command buffers
    pub(crate) fn new(
        entity: Arc<Entity>,
        cmd_bufs: usize,
        owner: FenceOwner,
        guilty: Arc<AtomicBool>,
        generation: u64,
    ) -> ember_core::Result<Self> {
        let mut bufs = Vec::new();
        bufs.try_reserve_exact(cmd_bufs)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            entity,
            cmd_bufs: bufs,
            sync: SyncSet::new(),
            fence: None,
            gang_leader: None,
            generation,
            user_fence: None,
            uf_sequence: 0,
            preamble: PreambleStatus::empty(),
            shadow: None,
            owner,
            guilty,
        })
    }

    /// Target entity
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Target engine
    pub fn key(&self) -> EngineKey {
        self.entity.key()
    }

    /// Command buffers in submission order
    pub fn cmd_bufs(&self) -> &[CmdBuf] {
        &self.cmd_bufs
    }

    /// Fences the job waits for
    pub fn sync(&self) -> &SyncSet {
        &self.sync
    }

    /// Published fences, once armed
    pub fn fence(&self) -> Option<&SchedFence> {
        self.fence.as_ref()
    }

    /// Gang leader's finished fence, for gangs of more than one job
    pub fn gang_leader(&self) -> Option<&FenceRef> {
        self.gang_leader.as_ref()
    }

    /// Device recovery generation captured at creation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// User fence written on completion
    pub fn user_fence(&self) -> Option<&UserFenceTarget> {
        self.user_fence.as_ref()
    }

    /// Value written to the user fence
    pub fn uf_sequence(&self) -> u64 {
        self.uf_sequence
    }

    /// Preamble bookkeeping
    pub fn preamble(&self) -> PreambleStatus {
        self.preamble
    }

    /// Graphics shadow metadata
    pub fn shadow(&self) -> Option<&ShadowDesc> {
        self.shadow.as_ref()
    }

    /// Producer recorded on the published fences
    pub fn owner(&self) -> FenceOwner {
        self.owner
    }

    /// Create the fence pair. Arming twice keeps the first pair.
    pub(crate) fn arm(&mut self) -> &SchedFence {
        let entity = &self.entity;
        let owner = self.owner;
        self.fence
            .get_or_insert_with(|| SchedFence::new(entity.fence_context(), entity.next_seqno(), owner))
    }

    /// Fail the armed fences, if any
    pub(crate) fn cancel(&self, error: Error) {
        if let Some(fence) = &self.fence {
            fence.cancel(error);
        }
    }

    /// Report a hardware failure caused by this job; its context turns guilty
    pub fn mark_guilty(&self) {
        self.guilty.store(true, Ordering::Release);
    }
}
