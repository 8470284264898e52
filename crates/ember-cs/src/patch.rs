//! # Patch Pass
//!
//! Engines that cannot be trusted with user command streams get their
//! command buffers checked on the CPU. Each buffer address is resolved
//! through the client VM to a reserved buffer object, made contiguous, then
//! validated either as a private copy or in place.

use alloc::vec::Vec;

use ember_core::{Error, Result, ValidationFailure};

use crate::parser::Submission;
use crate::queue::ValidationMode;

impl Submission<'_> {
    /// Validate command buffers of engines that require it
    pub(crate) fn patch(&mut self) -> Result<()> {
        let device = self.device;
        let vm = self.client.vm();
        let locked = self.locked.as_ref().ok_or(Error::InvalidArgument)?;
        let ticket = locked.ticket();

        for job in self.jobs.iter_mut() {
            let queue = job.entity().queue().clone();
            let mode = queue.caps().validation;
            if mode == ValidationMode::None {
                continue;
            }
            let key = job.key();

            for cmd in job.cmd_bufs.iter_mut() {
                let va = cmd.va.raw();
                let mapping = vm
                    .lookup(cmd.va)
                    .ok_or(ValidationFailure::UnmappedAddress(va))?;
                if !locked.contains(mapping.bo.id()) {
                    return Err(ValidationFailure::NotReserved(va).into());
                }
                let out_of_range = ValidationFailure::OutOfRange { va, len: cmd.len };
                let end = cmd
                    .va
                    .checked_add(u64::from(cmd.len))
                    .ok_or(out_of_range)?;
                if end > mapping.range.end {
                    return Err(out_of_range.into());
                }

                let outcome = device.memory().make_contiguous(&mapping.bo, ticket)?;
                self.moved.merge(outcome);

                let start = mapping.bo_offset(cmd.va) as usize;
                let len = cmd.len as usize;
                match mode {
                    ValidationMode::CopyOut => {
                        let mut body = Vec::new();
                        body.try_reserve_exact(len)
                            .map_err(|_| Error::OutOfMemory)?;
                        body.resize(len, 0);
                        mapping.bo.read(start as u64, &mut body)?;
                        if let Some(validator) = queue.validator() {
                            validator.validate(key, &mut body)?;
                        }
                        cmd.body = Some(body);
                    },
                    ValidationMode::InPlace => {
                        if let Some(validator) = queue.validator() {
                            mapping.bo.with_contents(|bytes| {
                                validator.validate(key, &mut bytes[start..start + len])
                            })??;
                        }
                    },
                    ValidationMode::None => {},
                }
            }
        }
        Ok(())
    }
}
