//! # EMBER Core
//!
//! Foundational types for the EMBER command-submission path.
//!
//! This crate has no knowledge of buffer objects or chunk formats. It provides
//! the pieces every later stage shares:
//!
//! - the error taxonomy and caller-visible error codes,
//! - strongly typed addresses and engine identifiers,
//! - a pluggable monotonic clock,
//! - reference-counted completion fences,
//! - sync sets (the fences a job must wait for).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ember-core                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Fence /   │  │   Types     │  │     Error           │  │
//! │  │  SyncSet    │  │ (GpuAddr,   │  │   Taxonomy          │  │
//! │  │             │  │  EngineKey) │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod clock;
pub mod error;
pub mod fence;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use clock::{Clock, ManualClock};
#[cfg(feature = "std")]
pub use clock::MonotonicClock;
pub use error::{Error, ErrorClass, Malformed, Result, ValidationFailure};
pub use fence::{Fence, FenceContexts, FenceOwner, FenceRef, SchedFence};
pub use sync::{InterruptFlag, SyncSet};
pub use types::{EngineKey, EngineType, GpuAddr, PAGE_SIZE};
