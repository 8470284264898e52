//! # Fences
//!
//! Reference-counted completion signals.
//!
//! A fence belongs to a *fence context* (one timeline, e.g. one queue entity)
//! and carries a sequence number that orders it within that context. Fences
//! are shared as [`FenceRef`] between the producing job, every reservation that
//! records it, the context history and every waiter. The last holder to drop
//! its reference frees it.
//!
//! Exported fences support the three operations external users need:
//! reading the current error, waiting with a timeout, and attaching a
//! callback that runs on signal.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::sync::{relax, InterruptFlag};

/// Shared fence reference
pub type FenceRef = Arc<Fence>;

type Callback = Box<dyn FnOnce(&Fence) + Send>;

// =============================================================================
// FENCE OWNER
// =============================================================================

/// Producer of a fence, used to filter implicit synchronization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceOwner {
    /// Memory moves and page-table updates; always waited on
    Kernel,
    /// Work submitted through the context with this global id
    Context(u64),
    /// Imported from outside the submission path
    Foreign,
}

// =============================================================================
// FENCE
// =============================================================================

/// A completion signal with an associated error code
pub struct Fence {
    /// Timeline this fence belongs to
    context: u64,
    /// Position on the timeline
    seqno: u64,
    /// Producer
    owner: FenceOwner,
    /// Fast-path signalled flag
    signaled: AtomicBool,
    /// Error and pending callbacks
    inner: Mutex<FenceInner>,
}

#[derive(Default)]
struct FenceInner {
    error: Option<Error>,
    callbacks: Vec<Callback>,
}

impl Fence {
    /// Create an unsignalled fence
    pub fn new(context: u64, seqno: u64, owner: FenceOwner) -> FenceRef {
        Arc::new(Self {
            context,
            seqno,
            owner,
            signaled: AtomicBool::new(false),
            inner: Mutex::new(FenceInner::default()),
        })
    }

    /// Create a fence that is already signalled
    pub fn signaled(context: u64, seqno: u64, owner: FenceOwner) -> FenceRef {
        let fence = Self::new(context, seqno, owner);
        fence.signal();
        fence
    }

    /// Fence context (timeline id)
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Sequence number within the context
    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Producer
    pub fn owner(&self) -> FenceOwner {
        self.owner
    }

    /// Check whether the fence has signalled
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Error recorded on the fence, if any
    pub fn error(&self) -> Option<Error> {
        self.inner.lock().error
    }

    /// Record an error. Ignored once the fence has signalled.
    pub fn set_error(&self, error: Error) {
        let mut inner = self.inner.lock();
        if !self.signaled.load(Ordering::Acquire) {
            inner.error = Some(error);
        }
    }

    /// Signal the fence and run its callbacks.
    ///
    /// Returns `false` if it had already signalled.
    pub fn signal(&self) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if self.signaled.load(Ordering::Acquire) {
                return false;
            }
            self.signaled.store(true, Ordering::Release);
            core::mem::take(&mut inner.callbacks)
        };

        for callback in callbacks {
            callback(self);
        }
        true
    }

    /// Record `error` and signal
    pub fn cancel(&self, error: Error) {
        self.set_error(error);
        self.signal();
    }

    /// Run `callback` when the fence signals.
    ///
    /// Hands the callback back if the fence has already signalled.
    pub fn add_callback<F>(&self, callback: F) -> core::result::Result<(), F>
    where
        F: FnOnce(&Fence) + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if self.signaled.load(Ordering::Acquire) {
            return Err(callback);
        }
        inner.callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Wait until signalled, `timeout_ns` elapses, or `interrupt` is raised
    pub fn wait_timeout(
        &self,
        clock: &dyn Clock,
        timeout_ns: u64,
        interrupt: Option<&InterruptFlag>,
    ) -> Result<()> {
        let deadline = clock.now_ns().saturating_add(timeout_ns);
        loop {
            if self.is_signaled() {
                return Ok(());
            }
            if interrupt.is_some_and(|flag| flag.is_raised()) {
                return Err(Error::Interrupted);
            }
            if clock.now_ns() >= deadline {
                return Err(Error::Timeout);
            }
            relax();
        }
    }

    /// Whether `self` comes after `other` on the same timeline
    pub fn is_later(&self, other: &Fence) -> bool {
        self.seqno > other.seqno
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("context", &self.context)
            .field("seqno", &self.seqno)
            .field("owner", &self.owner)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

// =============================================================================
// SCHEDULER FENCE PAIR
// =============================================================================

/// The two fences a scheduled job publishes.
///
/// `scheduled` signals when the job is handed to hardware, `finished` when it
/// completes. Dependencies may ask for either.
#[derive(Debug, Clone)]
pub struct SchedFence {
    /// Signalled when the job starts running
    pub scheduled: FenceRef,
    /// Signalled when the job completes
    pub finished: FenceRef,
}

impl SchedFence {
    /// Create the pair on the two timelines starting at `base_context`
    pub fn new(base_context: u64, seqno: u64, owner: FenceOwner) -> Self {
        Self {
            scheduled: Fence::new(base_context, seqno, owner),
            finished: Fence::new(base_context + 1, seqno, owner),
        }
    }

    /// Fail both fences
    pub fn cancel(&self, error: Error) {
        self.scheduled.cancel(error);
        self.finished.cancel(error);
    }
}

// =============================================================================
// CONTEXT ALLOCATOR
// =============================================================================

/// Allocates fence-context ids for one device
#[derive(Debug)]
pub struct FenceContexts {
    next: AtomicU64,
}

impl FenceContexts {
    /// Create an allocator; context 0 is never handed out
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate `count` consecutive contexts and return the first
    pub fn alloc(&self, count: u64) -> u64 {
        self.next.fetch_add(count, Ordering::Relaxed)
    }
}

impl Default for FenceContexts {
    fn default() -> Self {
        Self::new()
    }
}
