//! # Submission Parser
//!
//! Turns a decoded chunk stream into a gang of jobs.
//!
//! ```text
//!   bytes ──decode_stream──▶ chunks
//!                              │
//!            pass 1 ──────────┤  count command buffers per engine,
//!                              │  user fence, buffer list, gang size
//!                              ▼
//!                          jobs[0..n]   (jobs[n-1] is the gang leader)
//!                              │
//!            pass 2 ──────────┘  bind command buffers, resolve
//!                                dependencies and sync objects
//! ```
//!
//! A [`Submission`] owns every partial result. Dropping it at any stage
//! cancels armed fences, unpins user pages and releases reservations.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use arrayvec::ArrayVec;
use ember_core::{
    EngineKey, EngineType, Error, FenceOwner, GpuAddr, Malformed, Result, PAGE_SIZE,
};
use ember_mem::{LockedSet, MoveOutcome, Ticket, ValidationList};

use crate::bo_list::BoList;
use crate::chunk::{decode_stream, Chunk};
use crate::client::Client;
use crate::config::MAX_GANG_SIZE;
use crate::context::{Context, Entity};
use crate::device::Device;
use crate::job::{CmdBuf, Job, PreambleStatus, UserFenceTarget};
use crate::syncobj::PostDep;
use crate::wire::{DepDesc, IbDesc, IbFlags, StreamFlags, SyncobjFlags};

/// Constant-engine and draw-engine roles on the graphics engine
const PREEMPT_ROLES: usize = 2;

/// A submission on its way through the pipeline
pub struct Submission<'a> {
    pub(crate) device: &'a Device,
    pub(crate) client: &'a Client,
    pub(crate) ctx: Arc<Context>,
    pub(crate) flags: StreamFlags,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) jobs: ArrayVec<Job, MAX_GANG_SIZE>,
    pub(crate) bo_list: Option<Arc<BoList>>,
    pub(crate) validated: ValidationList,
    pub(crate) locked: Option<LockedSet>,
    pub(crate) post_deps: Vec<PostDep>,
    pub(crate) ticket: Option<Ticket>,
    pub(crate) moved: MoveOutcome,
    preempt_ibs: [u32; PREEMPT_ROLES],
    signal_chunk_seen: bool,
}

impl<'a> Submission<'a> {
    /// Decode `bytes` and build the jobs of the submission
    pub(crate) fn parse(
        device: &'a Device,
        client: &'a Client,
        ctx_handle: u32,
        bytes: &[u8],
        bo_list: Option<u32>,
    ) -> Result<Self> {
        let ctx = client.context(ctx_handle)?;
        if ctx.is_guilty() {
            log::debug!("ctx {}: guilty, refusing submission", ctx.global_id());
            return Err(Error::Canceled);
        }
        let stream = decode_stream(bytes)?;
        let bo_list = bo_list.map(|handle| client.bo_list(handle)).transpose()?;

        let mut sub = Self {
            device,
            client,
            ctx,
            flags: stream.flags,
            chunks: stream.chunks,
            jobs: ArrayVec::new(),
            bo_list,
            validated: ValidationList::new(),
            locked: None,
            post_deps: Vec::new(),
            ticket: None,
            moved: MoveOutcome::default(),
            preempt_ibs: [0; PREEMPT_ROLES],
            signal_chunk_seen: false,
        };

        let chunks = mem::take(&mut sub.chunks);
        let parsed = sub
            .pass1(&chunks)
            .and_then(|()| chunks.iter().try_for_each(|chunk| sub.pass2(chunk)));
        sub.chunks = chunks;
        parsed?;

        log::trace!(
            "ctx {}: parsed {} chunks into {} jobs",
            sub.ctx.global_id(),
            sub.chunks.len(),
            sub.jobs.len()
        );
        Ok(sub)
    }

    // =========================================================================
    // Pass 1
    // =========================================================================

    fn pass1(&mut self, chunks: &[Chunk]) -> Result<()> {
        let max_gang = self.device.config().max_gang_size;
        let mut slots: ArrayVec<(Arc<Entity>, usize), MAX_GANG_SIZE> = ArrayVec::new();
        let mut user_fence: Option<UserFenceTarget> = None;

        for chunk in chunks {
            match chunk {
                Chunk::CmdBuf(ib) => {
                    let entity = self.ctx.entity(engine_key(ib)?)?;
                    let idx = match slots.iter().position(|(e, _)| Arc::ptr_eq(e, entity)) {
                        Some(idx) => idx,
                        None => {
                            if slots.len() >= max_gang {
                                return Err(Malformed::GangTooLarge.into());
                            }
                            slots
                                .try_push((entity.clone(), 0))
                                .map_err(|_| Malformed::GangTooLarge)?;
                            slots.len() - 1
                        },
                    };
                    let (entity, count) = &mut slots[idx];
                    *count += 1;
                    if *count > entity.queue().caps().max_cmd_bufs {
                        return Err(Malformed::TooManyCmdBufs.into());
                    }
                },
                Chunk::UserFence(desc) => {
                    if user_fence.is_some() {
                        return Err(Malformed::DuplicateUserFence.into());
                    }
                    let bo = self.client.bo(desc.handle)?;
                    let offset = u64::from(desc.offset);
                    if bo.size() != PAGE_SIZE || offset + 8 > bo.size() {
                        return Err(Malformed::UserFenceRange.into());
                    }
                    if bo.is_userptr() {
                        return Err(Error::InvalidArgument);
                    }
                    user_fence = Some(UserFenceTarget {
                        bo,
                        offset,
                        addr: None,
                    });
                },
                Chunk::BoHandles { entries, .. } => {
                    if self.bo_list.is_some() {
                        return Err(Malformed::ConflictingBoList.into());
                    }
                    self.bo_list = Some(Arc::new(BoList::resolve(self.client, entries)?));
                },
                Chunk::Unrecognized { id, .. } => {
                    return Err(Malformed::UnknownChunk(*id).into());
                },
                _ => {},
            }
        }

        if slots.is_empty() {
            return Err(Malformed::NoCommandBuffers.into());
        }

        let generation = self.device.generation();
        let owner = FenceOwner::Context(self.ctx.global_id());
        for (entity, count) in slots {
            let job = Job::new(entity, count, owner, self.ctx.guilty_flag(), generation)?;
            self.jobs.push(job);
        }

        let ctx_generation = self.ctx.generation();
        let leader = self.leader_mut()?;
        leader.user_fence = user_fence;
        if leader.generation() != ctx_generation {
            log::debug!(
                "ctx generation {} is stale (device at {})",
                ctx_generation,
                generation
            );
            return Err(Error::Canceled);
        }
        Ok(())
    }

    // =========================================================================
    // Pass 2
    // =========================================================================

    fn pass2(&mut self, chunk: &Chunk) -> Result<()> {
        match chunk {
            Chunk::CmdBuf(ib) => self.add_cmd_buf(ib),
            Chunk::Dependencies { scheduled, deps } => deps
                .iter()
                .try_for_each(|dep| self.add_dependency(dep, *scheduled)),
            Chunk::SyncobjIn(sems) => sems
                .iter()
                .try_for_each(|sem| self.add_syncobj_wait(sem.handle, 0, SyncobjFlags::empty())),
            Chunk::TimelineWait(points) => points.iter().try_for_each(|p| {
                let flags = SyncobjFlags::from_bits(p.flags).ok_or(Error::InvalidArgument)?;
                self.add_syncobj_wait(p.handle, p.point, flags)
            }),
            Chunk::SyncobjOut(sems) => self.add_post_deps(sems.iter().map(|s| (s.handle, 0))),
            Chunk::TimelineSignal(points) => {
                self.add_post_deps(points.iter().map(|p| (p.handle, p.point)))
            },
            Chunk::Shadow(shadow) => {
                for job in self.jobs.iter_mut() {
                    if job.key().engine == EngineType::Gfx {
                        job.shadow = Some(*shadow);
                    }
                }
                Ok(())
            },
            Chunk::UserFence(_) | Chunk::BoHandles { .. } | Chunk::Unrecognized { .. } => Ok(()),
        }
    }

    fn add_cmd_buf(&mut self, ib: &IbDesc) -> Result<()> {
        let key = engine_key(ib)?;
        let wants_user_fence = self.jobs.last().is_some_and(|job| job.user_fence.is_some());
        let job = self
            .jobs
            .iter_mut()
            .find(|job| job.key() == key)
            .ok_or(Error::InvalidArgument)?;

        if wants_user_fence && !job.entity().queue().caps().user_fence {
            return Err(Malformed::UserFenceUnsupported.into());
        }

        let flags = IbFlags::from_bits_truncate(ib.flags);
        if key.engine == EngineType::Gfx && flags.contains(IbFlags::PREEMPT) {
            let role = usize::from(!flags.contains(IbFlags::CE));
            self.preempt_ibs[role] += 1;
            if self.preempt_ibs[role] > 1 {
                return Err(Malformed::PreemptLimit.into());
            }
        }
        if flags.contains(IbFlags::PREAMBLE) {
            job.preamble |= PreambleStatus::PRESENT;
        }

        job.cmd_bufs.push(CmdBuf {
            va: GpuAddr::new(ib.va_start),
            len: ib.ib_bytes,
            flags,
            body: None,
        });
        Ok(())
    }

    fn add_dependency(&mut self, dep: &DepDesc, scheduled: bool) -> Result<()> {
        let ctx = self
            .client
            .context(dep.ctx_id)
            .map_err(|_| Error::InvalidArgument)?;
        let key = EngineKey::from_raw(dep.ip_type, dep.ip_instance, dep.ring)
            .ok_or(Error::InvalidArgument)?;

        let Some(fence) = ctx.history().get(key, dep.handle)? else {
            return Ok(());
        };
        let fence = if scheduled {
            fence.scheduled
        } else {
            fence.finished
        };
        self.leader_mut()?.sync.add(&fence);
        Ok(())
    }

    fn add_syncobj_wait(&mut self, handle: u32, point: u64, flags: SyncobjFlags) -> Result<()> {
        let syncobj = self.client.syncobj(handle)?;
        let fence = if flags.contains(SyncobjFlags::WAIT_FOR_SUBMIT) {
            syncobj.wait_for_submit(
                point,
                self.device.clock(),
                self.device.config().wait_timeout_ns,
                Some(self.client.interrupt()),
            )?
        } else {
            syncobj.find_fence(point).map_err(|e| {
                log::debug!("syncobj {}: no fence for point {}", handle, point);
                e
            })?
        };
        if let Some(fence) = fence {
            self.leader_mut()?.sync.add(&fence);
        }
        Ok(())
    }

    fn add_post_deps(&mut self, targets: impl Iterator<Item = (u32, u64)>) -> Result<()> {
        if self.signal_chunk_seen {
            return Err(Malformed::DuplicateSignalChunk.into());
        }
        self.signal_chunk_seen = true;
        for (handle, point) in targets {
            let syncobj = self.client.syncobj(handle)?;
            self.post_deps
                .try_reserve(1)
                .map_err(|_| Error::OutOfMemory)?;
            self.post_deps.push(PostDep { syncobj, point });
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn leader_mut(&mut self) -> Result<&mut Job> {
        self.jobs.last_mut().ok_or(Error::InvalidArgument)
    }

    /// Decoded chunks in stream order
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Jobs; the last one is the gang leader
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// The gang leader
    pub fn leader(&self) -> Option<&Job> {
        self.jobs.last()
    }

    /// Buffers the submission reserves
    pub fn validation_list(&self) -> &ValidationList {
        &self.validated
    }

    /// Reservations held, once acquired
    pub fn locked(&self) -> Option<&LockedSet> {
        self.locked.as_ref()
    }

    /// Sync objects signalled on dispatch
    pub fn post_deps(&self) -> &[PostDep] {
        &self.post_deps
    }

    /// Bytes moved while placing buffers
    pub fn moved(&self) -> MoveOutcome {
        self.moved
    }

    /// Ticket the reservations are held with
    pub fn ticket(&self) -> Option<Ticket> {
        self.ticket
    }

    /// Hand the submission to the hardware; returns its sequence number
    pub fn commit(mut self) -> Result<u64> {
        self.dispatch()
    }

    // =========================================================================
    // Unwind
    // =========================================================================

    /// Undo everything the submission still holds
    fn unwind(&mut self) {
        for job in self.jobs.drain(..) {
            job.cancel(Error::Canceled);
        }
        for entry in self.validated.iter_mut() {
            if let (Some(pages), Some(user)) = (entry.user_pages.take(), entry.bo.user_backing()) {
                user.memory().unpin_pages(pages);
            }
        }
        if let Some(mut locked) = self.locked.take() {
            locked.release();
        }
    }
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        self.unwind();
    }
}

impl core::fmt::Debug for Submission<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Submission")
            .field("ctx", &self.ctx.global_id())
            .field("chunks", &self.chunks.len())
            .field("jobs", &self.jobs.len())
            .field("validated", &self.validated.len())
            .field("ticket", &self.ticket)
            .finish()
    }
}

fn engine_key(ib: &IbDesc) -> Result<EngineKey> {
    EngineKey::from_raw(ib.ip_type, ib.ip_instance, ib.ring)
        .ok_or_else(|| Malformed::NoRunnableQueue.into())
}
