//! # Fence Queries
//!
//! Look up and wait on the fences behind sequence numbers returned by
//! `submit`.

use ember_core::{EngineKey, Error, FenceRef, Result};

use crate::client::Client;
use crate::device::Device;

/// One `(context, engine, sequence)` triple to wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceQuery {
    /// Context handle
    pub ctx: u32,
    /// Engine the leader ran on
    pub key: EngineKey,
    /// Sequence number
    pub seq: u64,
}

/// Result of [`Device::wait_fences`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// The wait condition was met before the timeout
    pub signaled: bool,
    /// First fence found signalled (wait-any)
    pub first_index: usize,
    /// Error carried by the reported fence
    pub error: Option<Error>,
}

impl Device {
    /// Completion fence of `seq`; `None` once it has aged out of the history
    pub fn query_fence(
        &self,
        client: &Client,
        ctx: u32,
        key: EngineKey,
        seq: u64,
    ) -> Result<Option<FenceRef>> {
        let context = client.context(ctx)?;
        let fence = context.history().get(key, seq)?;
        Ok(fence.map(|fence| fence.finished))
    }

    /// Wait for `seq` to complete; returns `false` on timeout
    pub fn wait_cs(
        &self,
        client: &Client,
        ctx: u32,
        key: EngineKey,
        seq: u64,
        timeout_ns: u64,
    ) -> Result<bool> {
        let Some(fence) = self.query_fence(client, ctx, key, seq)? else {
            return Ok(true);
        };
        match fence.wait_timeout(self.clock(), timeout_ns, Some(client.interrupt())) {
            Ok(()) => Ok(true),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wait for all of `queries`, or for the first of them to complete
    pub fn wait_fences(
        &self,
        client: &Client,
        queries: &[FenceQuery],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<WaitOutcome> {
        if queries.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut fences = alloc::vec::Vec::new();
        fences
            .try_reserve_exact(queries.len())
            .map_err(|_| Error::OutOfMemory)?;
        for query in queries {
            fences.push(self.query_fence(client, query.ctx, query.key, query.seq)?);
        }

        let clock = self.clock();
        let interrupt = client.interrupt();
        let deadline = clock.now_ns().saturating_add(timeout_ns);

        if wait_all {
            let mut error = None;
            for fence in fences.iter().flatten() {
                let remaining = deadline.saturating_sub(clock.now_ns());
                match fence.wait_timeout(clock, remaining, Some(interrupt)) {
                    Ok(()) => error = error.or(fence.error()),
                    Err(Error::Timeout) => {
                        return Ok(WaitOutcome {
                            signaled: false,
                            first_index: 0,
                            error: None,
                        })
                    },
                    Err(e) => return Err(e),
                }
            }
            return Ok(WaitOutcome {
                signaled: true,
                first_index: 0,
                error,
            });
        }

        loop {
            let done = fences
                .iter()
                .position(|fence| fence.as_ref().map_or(true, |f| f.is_signaled()));
            if let Some(index) = done {
                return Ok(WaitOutcome {
                    signaled: true,
                    first_index: index,
                    error: fences[index].as_ref().and_then(|f| f.error()),
                });
            }
            if interrupt.is_raised() {
                return Err(Error::Interrupted);
            }
            if clock.now_ns() >= deadline {
                return Ok(WaitOutcome {
                    signaled: false,
                    first_index: 0,
                    error: None,
                });
            }
            ember_core::sync::relax();
        }
    }
}
