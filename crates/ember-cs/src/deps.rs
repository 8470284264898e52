//! # Dependency Resolution
//!
//! Implicit synchronization: the fences already attached to the reserved
//! buffers and the client's last page-table update become dependencies of
//! the gang.

use ember_core::{Error, FenceOwner, Result, SyncSet};
use ember_mem::{BoFlags, SyncMode};

use crate::parser::Submission;

impl Submission<'_> {
    /// Collect implicit dependencies into every job of the gang
    pub(crate) fn resolve_dependencies(&mut self) -> Result<()> {
        let device = self.device;
        let owner = FenceOwner::Context(self.ctx.global_id());
        let leader_key = self.leader().ok_or(Error::InvalidArgument)?.key();

        // The history slot this submission will take must be free.
        let previous = self.ctx.history().pending_slot(leader_key);
        if let Some(previous) = previous {
            previous.wait_timeout(
                device.clock(),
                device.config().wait_timeout_ns,
                Some(self.client.interrupt()),
            )?;
        }

        let locked = self.locked.as_ref().ok_or(Error::InvalidArgument)?;
        let mut implicit = SyncSet::new();
        for bo in locked.iter() {
            let mode = if bo.flags().contains(BoFlags::EXPLICIT_SYNC) {
                SyncMode::Explicit
            } else {
                SyncMode::NotEqualOwner
            };
            for fence in bo.resv().fences_for(mode, owner) {
                implicit.add(&fence);
            }
        }
        if let Some(update) = self.client.vm().last_update() {
            implicit.add(&update);
        }

        let (leader, followers) = self
            .jobs
            .split_last_mut()
            .ok_or(Error::InvalidArgument)?;
        implicit.fold_into(&mut leader.sync);
        for follower in followers {
            follower.sync.merge(&leader.sync);
        }
        log::trace!(
            "ctx {}: leader waits on {} fences",
            self.ctx.global_id(),
            leader.sync.len()
        );
        Ok(())
    }
}
