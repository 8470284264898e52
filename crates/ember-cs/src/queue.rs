//! # Hardware Queues
//!
//! The seam between the submission path and the hardware rings.
//!
//! ```text
//!   dispatch ──push_job──▶ HwQueue ──▶ ring / firmware
//!                            │
//!                            └── caps(): limits, user fence, validation
//! ```
//!
//! [`SoftwareQueue`] runs jobs on the host. It is used for bring-up and
//! keeps the same ordering rules a hardware scheduler would: jobs of one
//! entity run in order, and a job runs only once its sync set is satisfied.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use ember_core::{EngineKey, EngineType, Error, Result};
use spin::Mutex;

use crate::job::Job;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// How an engine's command buffers are checked before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Trusted; no CPU-side check
    None,
    /// Copy the commands out of the buffer and validate the copy
    CopyOut,
    /// Validate the commands inside the buffer
    InPlace,
}

/// Per-engine submission limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCaps {
    /// Command buffers accepted per job
    pub max_cmd_bufs: usize,
    /// Engine can write a user fence on completion
    pub user_fence: bool,
    /// Command-buffer validation
    pub validation: ValidationMode,
}

impl EngineCaps {
    /// Typical limits for an engine class
    pub const fn for_engine(engine: EngineType) -> Self {
        match engine {
            EngineType::Gfx | EngineType::Compute => Self {
                max_cmd_bufs: 8,
                user_fence: true,
                validation: ValidationMode::None,
            },
            EngineType::Dma => Self {
                max_cmd_bufs: 4,
                user_fence: true,
                validation: ValidationMode::None,
            },
            EngineType::VideoDecode => Self {
                max_cmd_bufs: 1,
                user_fence: false,
                validation: ValidationMode::CopyOut,
            },
            EngineType::VideoEncode => Self {
                max_cmd_bufs: 1,
                user_fence: false,
                validation: ValidationMode::InPlace,
            },
        }
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Engine-specific command stream checker
pub trait CommandValidator: Send + Sync {
    /// Check (and possibly rewrite) `commands` for `key`
    fn validate(&self, key: EngineKey, commands: &mut [u8]) -> Result<()>;
}

/// A hardware queue jobs are pushed to
pub trait HwQueue: Send + Sync {
    /// Engine served by this queue
    fn key(&self) -> EngineKey;

    /// Submission limits
    fn caps(&self) -> EngineCaps;

    /// Whether the queue accepts work
    fn is_ready(&self) -> bool;

    /// Command-stream checker for validating engines
    fn validator(&self) -> Option<&dyn CommandValidator> {
        None
    }

    /// Take ownership of an armed job
    fn push_job(&self, job: Job) -> Result<()>;
}

// =============================================================================
// SOFTWARE QUEUE
// =============================================================================

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Jobs accepted
    pub pushed: u64,
    /// Jobs run to completion
    pub completed: u64,
    /// Jobs that hit an injected fault
    pub faulted: u64,
}

/// In-order host queue
pub struct SoftwareQueue {
    key: EngineKey,
    caps: EngineCaps,
    ready: AtomicBool,
    fault_next: AtomicBool,
    validator: Option<Arc<dyn CommandValidator>>,
    pending: Mutex<VecDeque<Job>>,
    stats: Mutex<QueueStats>,
}

impl SoftwareQueue {
    /// Create a ready queue with the default limits for `key`'s engine
    pub fn new(key: EngineKey) -> Self {
        Self::with_caps(key, EngineCaps::for_engine(key.engine))
    }

    /// Create a ready queue with explicit limits
    pub fn with_caps(key: EngineKey, caps: EngineCaps) -> Self {
        Self {
            key,
            caps,
            ready: AtomicBool::new(true),
            fault_next: AtomicBool::new(false),
            validator: None,
            pending: Mutex::new(VecDeque::new()),
            stats: Mutex::new(QueueStats::default()),
        }
    }

    /// Attach a command-stream checker
    pub fn with_validator(mut self, validator: Arc<dyn CommandValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Take the queue in or out of service
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Make the next job fail as if the engine hung
    pub fn inject_fault(&self) {
        self.fault_next.store(true, Ordering::Release);
    }

    /// Jobs waiting to run
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Get statistics
    pub fn stats(&self) -> QueueStats {
        self.stats.lock().clone()
    }

    /// Run every job that can run now; returns how many ran
    pub fn run_ready(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = {
                let mut pending = self.pending.lock();
                match Self::next_runnable(&pending) {
                    Some(idx) => pending.remove(idx),
                    None => None,
                }
            };
            let Some(job) = job else {
                break;
            };
            self.execute(job);
            ran += 1;
        }
        ran
    }

    /// First job whose dependencies are met and that has no earlier job
    /// from the same entity still pending
    fn next_runnable(pending: &VecDeque<Job>) -> Option<usize> {
        pending.iter().enumerate().find_map(|(idx, job)| {
            let context = job.entity().fence_context();
            let behind = pending
                .iter()
                .take(idx)
                .any(|earlier| earlier.entity().fence_context() == context);
            (!behind && job.sync().is_satisfied()).then_some(idx)
        })
    }

    fn execute(&self, job: Job) {
        let Some(fence) = job.fence() else {
            log::warn!("{}: dropping unarmed job", self.key);
            return;
        };
        fence.scheduled.signal();

        if let Some(error) = job.sync().first_error() {
            fence.finished.set_error(error);
        }

        if self.fault_next.swap(false, Ordering::AcqRel) {
            log::warn!("{}: job {} hung", self.key, fence.finished.seqno());
            job.mark_guilty();
            fence.finished.cancel(Error::Timeout);
            self.stats.lock().faulted += 1;
            return;
        }

        if let Some(uf) = job.user_fence() {
            let value = job.uf_sequence().to_le_bytes();
            if let Err(e) = uf.bo.write(uf.offset, &value) {
                log::warn!("{}: user fence write failed: {}", self.key, e);
            }
        }
        log::trace!("{}: job {} done", self.key, fence.finished.seqno());
        fence.finished.signal();
        self.stats.lock().completed += 1;
    }
}

impl HwQueue for SoftwareQueue {
    fn key(&self) -> EngineKey {
        self.key
    }

    fn caps(&self) -> EngineCaps {
        self.caps
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn validator(&self) -> Option<&dyn CommandValidator> {
        self.validator.as_deref()
    }

    fn push_job(&self, job: Job) -> Result<()> {
        if !self.is_ready() {
            log::warn!("{}: push to stopped queue", self.key);
            return Err(Error::Canceled);
        }
        self.pending.lock().push_back(job);
        self.stats.lock().pushed += 1;
        Ok(())
    }
}

impl core::fmt::Debug for SoftwareQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SoftwareQueue")
            .field("key", &self.key)
            .field("caps", &self.caps)
            .field("ready", &self.is_ready())
            .field("pending", &self.pending())
            .finish()
    }
}
