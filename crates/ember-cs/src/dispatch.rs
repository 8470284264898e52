//! # Gang Dispatch
//!
//! The commit point of a submission. Everything up to the history push can
//! still fail without a trace; after it the sequence number is visible and
//! the jobs go to their queues. A queue that refuses a job past that point
//! fails the rest of the gang through its fences, never through the return
//! value.
//!
//! ```text
//!   lock history  (history slot still busy: unlock, wait, relock)
//!     every target queue ready?  (no: Canceled)
//!     arm jobs ─▶ leader waits on followers ─▶ gang leader refs
//!     user pages unchanged?  (no: cancel, Again)
//!     push leader fence to history ─▶ seq
//!     publish fences to buffers (leader: write, followers: read)
//!     signal post-deps, first preamble
//!   unlock history
//!   release reservations
//!   push followers, then the leader
//! ```

use core::mem;

use ember_core::{Error, Result};
use ember_mem::FenceUsage;
use spin::MutexGuard;

use crate::context::{Context, ContextHistory};
use crate::job::PreambleStatus;
use crate::parser::Submission;

impl Submission<'_> {
    /// Lock the history once the slot the leader takes holds no running
    /// submission
    fn lock_free_slot<'c>(&self, ctx: &'c Context) -> Result<MutexGuard<'c, ContextHistory>> {
        let device = self.device;
        let leader_key = self.leader().ok_or(Error::InvalidArgument)?.key();
        loop {
            let history = ctx.history();
            let Some(previous) = history
                .pending_slot(leader_key)
                .filter(|fence| !fence.is_signaled())
            else {
                return Ok(history);
            };
            drop(history);
            log::trace!("ctx {}: history slot busy, waiting", ctx.global_id());
            previous.wait_timeout(
                device.clock(),
                device.config().wait_timeout_ns,
                Some(self.client.interrupt()),
            )?;
        }
    }

    /// Arm, publish and queue the gang; returns the sequence number
    pub(crate) fn dispatch(&mut self) -> Result<u64> {
        let ctx = self.ctx.clone();
        let mut history = self.lock_free_slot(&ctx)?;

        if let Some(job) = self.jobs.iter().find(|job| !job.entity().queue().is_ready()) {
            log::debug!("{}: queue stopped before commit", job.key());
            return Err(Error::Canceled);
        }

        for job in self.jobs.iter_mut() {
            job.arm();
        }

        let (leader, followers) = self
            .jobs
            .split_last_mut()
            .ok_or(Error::InvalidArgument)?;
        let leader_fence = leader.fence().cloned().ok_or(Error::InvalidArgument)?;
        for follower in followers.iter_mut() {
            if let Some(fence) = follower.fence() {
                leader.sync.add(&fence.finished);
            }
        }
        if !followers.is_empty() {
            for follower in followers.iter_mut() {
                follower.gang_leader = Some(leader_fence.finished.clone());
            }
            leader.gang_leader = Some(leader_fence.finished.clone());
        }

        let changed = self.validated.iter().find(|entry| {
            match (entry.bo.user_backing(), entry.user_seq) {
                (Some(user), Some(seq)) => user.changed_since(seq),
                _ => false,
            }
        });
        if let Some(entry) = changed {
            log::debug!("bo {}: user pages changed, retry", entry.bo.id());
            drop(history);
            for job in self.jobs.iter() {
                job.cancel(Error::Again);
            }
            return Err(Error::Again);
        }


        let leader_key = leader.key();
        let seq = match history.push(leader_key, leader_fence.clone()) {
            Ok(seq) => seq,
            Err(e) => {
                drop(history);
                for job in self.jobs.iter() {
                    job.cancel(e);
                }
                return Err(e);
            },
        };

        let locked = self.locked.as_ref().ok_or(Error::InvalidArgument)?;
        for bo in locked.iter() {
            for follower in followers.iter() {
                if let Some(fence) = follower.fence() {
                    bo.resv().add_fence(&fence.finished, FenceUsage::Read);
                }
            }
            bo.resv().add_fence(&leader_fence.finished, FenceUsage::Write);
        }

        leader.uf_sequence = seq;
        for dep in &self.post_deps {
            dep.signal(&leader_fence.finished);
        }
        if leader.preamble.contains(PreambleStatus::PRESENT) && ctx.present_preamble() {
            leader.preamble |= PreambleStatus::PRESENT_FIRST;
        }
        drop(history);

        if let Some(mut locked) = self.locked.take() {
            locked.release();
        }

        let mut jobs = mem::take(&mut self.jobs);
        let leader = jobs.pop();
        let mut pending = jobs.into_iter().chain(leader);
        while let Some(job) = pending.next() {
            let queue = job.entity().queue().clone();
            let key = job.key();
            let fence = job.fence().cloned();
            if let Err(e) = queue.push_job(job) {
                log::error!("{}: push failed after seq {}: {}", key, seq, e);
                if let Some(fence) = fence {
                    fence.cancel(e);
                }
                for job in pending {
                    job.cancel(e);
                }
                break;
            }
            log::trace!("{}: queued job for seq {}", key, seq);
        }
        Ok(seq)
    }
}
