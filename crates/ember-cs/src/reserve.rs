//! # Buffer Reservation
//!
//! Builds the validation list, reserves every buffer on it with the
//! submission's ticket and places each buffer within the migration budget.
//!
//! ```text
//!   explicit list ─┐
//!   VM root ───────┤
//!   context area ──┼──▶ ValidationList ──pin user pages──▶ lock_all
//!   user fence ────┘                                          │
//!                                        rebind user pages ◀──┘
//!                                                │
//!                          budget() ──▶ place each buffer
//!
//! Bytes moved here, for the user fence and by the patch pass all add up in
//! `Submission::moved`; the device charges the throttle once per submission.
//! ```

use ember_core::{Error, GpuAddr, Result};
use ember_mem::{AcquireCtx, BoFlags, Domain, EntryOrigin, MoveBudget, Ticket};

use crate::parser::Submission;
use crate::wire::StreamFlags;

impl Submission<'_> {
    /// Reserve and place every buffer the submission touches
    pub(crate) fn reserve(&mut self) -> Result<()> {
        self.build_validation_list();
        self.pin_user_pages()?;

        let device = self.device;
        let ticket = device.next_ticket();
        self.ticket = Some(ticket);
        let acquire = AcquireCtx {
            ticket,
            no_wait: self.flags.contains(StreamFlags::NO_WAIT),
            interrupt: Some(self.client.interrupt()),
            fence_slots: 1 + self.jobs.len(),
        };
        self.locked = Some(self.validated.lock_all(&acquire)?);

        self.bind_user_pages(ticket)?;

        let budget = device
            .throttle()
            .budget(device.clock(), &device.memory().usage());
        self.place_all(ticket, budget)?;
        self.map_user_fence(ticket)?;
        log::trace!(
            "ticket {}: reserved {} bos, moved {} bytes",
            ticket.stamp(),
            self.validated.len(),
            self.moved.bytes
        );
        Ok(())
    }

    fn build_validation_list(&mut self) {
        if let Some(list) = &self.bo_list {
            for item in list.iter() {
                self.validated
                    .add(&item.bo, EntryOrigin::Explicit, true, item.priority);
            }
        }
        if let Some(root) = self.client.vm().root() {
            self.validated
                .add(root, EntryOrigin::PageTableRoot, false, 0);
        }
        if let Some(csa) = self.client.csa() {
            self.validated
                .add(&csa.bo, EntryOrigin::ContextArea, false, 0);
        }
        if let Some(uf) = self.jobs.last().and_then(|job| job.user_fence()) {
            self.validated
                .add(&uf.bo, EntryOrigin::UserFence, false, 0);
        }
    }

    /// Pin the current pages of every user-pointer buffer.
    ///
    /// Pages matching the bound ones are released right away; others stay
    /// pinned until the buffer is rebound under its reservation.
    fn pin_user_pages(&mut self) -> Result<()> {
        let pid = self.client.pid();
        for entry in self.validated.iter_mut() {
            let Some(user) = entry.bo.user_backing() else {
                continue;
            };
            let memory = user.memory();
            if memory.owner() != pid {
                return Err(Error::PermissionDenied);
            }

            let seq = memory.notifier_seq();
            let pages = memory.pin_pages()?;
            entry.user_seq = Some(seq);
            if user.is_bound_to(&pages) {
                memory.unpin_pages(pages);
            } else {
                entry.user_pages = Some(pages);
                entry.user_invalidated = true;
            }
        }
        Ok(())
    }

    fn bind_user_pages(&mut self, ticket: Ticket) -> Result<()> {
        let memory = self.device.memory();
        for entry in self.validated.iter_mut() {
            if !entry.user_invalidated {
                continue;
            }
            let (Some(pages), Some(user)) = (entry.user_pages.take(), entry.bo.user_backing())
            else {
                continue;
            };
            if let Err(e) = memory.evict(&entry.bo, ticket) {
                entry.user_pages = Some(pages);
                return Err(e);
            }
            if let Some(old) = user.bind(pages) {
                user.memory().unpin_pages(old);
            }
            log::trace!("bo {}: user pages rebound", entry.bo.id());
        }
        Ok(())
    }

    fn place_all(&mut self, ticket: Ticket, budget: MoveBudget) -> Result<()> {
        let memory = self.device.memory();
        let small_bar = !memory.usage().vram_fully_visible();

        for entry in self.validated.iter() {
            let bo = &entry.bo;
            if bo.placement().is_pinned() {
                continue;
            }

            let domains = if self.moved.bytes >= budget.max_bytes {
                bo.allowed_domains()
            } else if small_bar
                && bo.flags().contains(BoFlags::CPU_ACCESS_REQUIRED)
                && self.moved.visible_bytes >= budget.max_vis_bytes
            {
                bo.allowed_domains()
            } else {
                bo.preferred_domains()
            };

            let outcome = match memory.place(bo, ticket, domains) {
                Err(Error::OutOfMemory) if domains != bo.allowed_domains() => {
                    memory.place(bo, ticket, bo.allowed_domains())
                },
                other => other,
            }
            .map_err(|e| {
                if e == Error::OutOfMemory {
                    log::error!("bo {}: no room in {:?}", bo.id(), bo.allowed_domains());
                }
                e
            })?;
            self.moved.merge(outcome);
        }
        Ok(())
    }

    /// Give the user fence a GPU address
    fn map_user_fence(&mut self, ticket: Ticket) -> Result<()> {
        let memory = self.device.memory();
        let Some(uf) = self.jobs.last_mut().and_then(|job| job.user_fence.as_mut()) else {
            return Ok(());
        };
        if uf.bo.placement().gpu_offset.is_none() {
            let outcome = memory.place(&uf.bo, ticket, Domain::GTT)?;
            self.moved.merge(outcome);
        }
        let base = uf.bo.placement().gpu_offset.ok_or(Error::OutOfMemory)?;
        uf.addr = Some(GpuAddr::new(base + uf.offset));
        Ok(())
    }
}
