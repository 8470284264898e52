//! # EMBER Memory
//!
//! Buffer objects and everything a submission needs to make them usable:
//! reservation, placement, migration throttling and address lookup.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EMBER Memory                             │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                    Validation List                        │  │
//! │  │        (ordered BO set, ticketed lock_all → LockedSet)    │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                              │                                  │
//! │  ┌─────────────────┐  ┌─────┴─────┐  ┌────────────────────┐     │
//! │  │   Migration     │  │  Buffer   │  │      GPU VM        │     │
//! │  │   Throttle      │  │  Objects  │  │   (VA → mapping)   │     │
//! │  └─────────────────┘  └───────────┘  └────────────────────┘     │
//! │           │                 │                                   │
//! │  ┌────────┴─────────────────┴───────────────────────────────┐   │
//! │  │            Memory Manager (VRAM / GTT / CPU)              │   │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! A buffer's placement may only change while its reservation is held by
//! the caller's [`Ticket`]. Acquisition of several reservations always goes
//! through [`ValidationList::lock_all`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bo;
pub mod domain;
pub mod manager;
pub mod reservation;
pub mod throttle;
pub mod userptr;
pub mod validation;
pub mod vm;

// Re-exports
pub use bo::{BoDesc, BoId, BoRegistry, BufferObject, Placement};
pub use domain::{BoFlags, Domain};
pub use manager::{HeapConfig, HeapManager, MemoryManager, MemoryUsage, MoveOutcome};
pub use reservation::{FenceUsage, Reservation, SyncMode, Ticket, TicketSource};
pub use throttle::{MigrationThrottle, MoveBudget, ThrottleConfig};
pub use userptr::{HostUserMemory, PinnedPages, UserBacking, UserMemory};
pub use validation::{AcquireCtx, EntryOrigin, LockedSet, ValidationEntry, ValidationList};
pub use vm::{GpuVm, Mapping, VaRange};
