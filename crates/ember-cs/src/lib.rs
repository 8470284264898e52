//! # EMBER Command Submission
//!
//! Takes a client's chunked command stream and turns it into jobs on
//! hardware queues.
//!
//! ## Pipeline
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         EMBER CS                                  │
//! │                                                                   │
//! │  bytes ─▶ ┌──────────┐   ┌───────────┐   ┌─────────┐              │
//! │           │  Parser  │─▶ │  Reserve  │─▶ │  Patch  │              │
//! │           │ (2 pass) │   │ (tickets, │   │ (CPU    │              │
//! │           └──────────┘   │  budget)  │   │  check) │              │
//! │                          └───────────┘   └────┬────┘              │
//! │                                               ▼                   │
//! │           ┌──────────────┐   ┌──────────────────────┐             │
//! │  seq ◀─── │   Dispatch   │◀─ │ Dependency resolution│             │
//! │           │ (gang, hist) │   │ (implicit + explicit)│             │
//! │           └──────┬───────┘   └──────────────────────┘             │
//! │                  ▼                                                │
//! │           ┌──────────────┐                                        │
//! │           │  HW queues   │                                        │
//! │           └──────────────┘                                        │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let device = Device::new(CsConfig::default(), clock, memory)?;
//! device.add_queue(Arc::new(SoftwareQueue::new(gfx)))?;
//! let client = device.open_client(pid)?;
//! let ctx = device.create_context(&client)?;
//! let seq = device.submit(&client, ctx, &stream, None)?;
//! device.wait_cs(&client, ctx, gfx, seq, timeout_ns)?;
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

pub mod bo_list;
pub mod chunk;
pub mod client;
pub mod config;
pub mod context;
mod deps;
pub mod device;
mod dispatch;
pub mod job;
pub mod parser;
mod patch;
pub mod queue;
mod reserve;
pub mod syncobj;
pub mod wait;
pub mod wire;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use bo_list::{BoList, BoListItem};
pub use chunk::{decode_stream, encode_stream, Chunk, ChunkStream, ChunkWriter};
pub use client::{Client, ContextArea, HandleTable};
pub use config::{CsConfig, MAX_GANG_SIZE};
pub use context::{Context, ContextHistory, Entity};
pub use device::{ClientOptions, CsStats, Device, CSA_SIZE, CSA_VA};
pub use job::{CmdBuf, Job, PreambleStatus, UserFenceTarget};
pub use parser::Submission;
pub use queue::{
    CommandValidator, EngineCaps, HwQueue, QueueStats, SoftwareQueue, ValidationMode,
};
pub use syncobj::{PostDep, SyncObject};
pub use wait::{FenceQuery, WaitOutcome};
pub use wire::{IbFlags, StreamFlags, SyncobjFlags};
