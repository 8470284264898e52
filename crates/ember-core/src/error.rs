//! # EMBER Error Handling
//!
//! Typed errors for the command-submission path.
//!
//! Error handling in EMBER follows these principles:
//! - Errors are typed and grouped into a small taxonomy ([`ErrorClass`])
//! - No panics on submission paths
//! - Every error maps to one caller-visible code ([`Error::errno`])
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// EMBER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// CALLER-VISIBLE CODES
// =============================================================================

/// POSIX error numbers returned to callers of the submit entry point
pub mod errno {
    /// Operation not permitted
    pub const EPERM: i32 = 1;
    /// No such object
    pub const ENOENT: i32 = 2;
    /// Interrupted wait
    pub const EINTR: i32 = 4;
    /// Try again
    pub const EAGAIN: i32 = 11;
    /// Out of memory
    pub const ENOMEM: i32 = 12;
    /// Bad address
    pub const EFAULT: i32 = 14;
    /// Resource busy
    pub const EBUSY: i32 = 16;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Resource deadlock avoided
    pub const EDEADLK: i32 = 35;
    /// Timer expired
    pub const ETIME: i32 = 62;
    /// Operation canceled
    pub const ECANCELED: i32 = 125;
}

// =============================================================================
// ERROR ENUM
// =============================================================================

/// EMBER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidArgument,
    /// Handle does not name a live object
    InvalidHandle,
    /// Caller-supplied bytes could not be read in full
    Fault,
    /// Operation timed out
    Timeout,
    /// Operation not permitted for this caller
    PermissionDenied,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Allocation or placement failed
    OutOfMemory,

    // =========================================================================
    // Contention Errors (retryable)
    // =========================================================================
    /// A wait was interrupted by a pending signal
    Interrupted,
    /// A conflicting holder exists and the caller asked not to wait
    WouldBlock,
    /// State changed underneath the submission; reissue it
    Again,
    /// Lost a reservation race to an older ticket (never leaves the acquire loop)
    Deadlock,

    // =========================================================================
    // Context Errors
    // =========================================================================
    /// Context is guilty or its GPU state was lost since last use
    Canceled,

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// Malformed submission stream
    Malformed(Malformed),
    /// Command buffer validation failed
    Validation(ValidationFailure),
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Reasons a submission stream is rejected during parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Stream declares no chunks
    NoChunks,
    /// Chunk id outside the known set
    UnknownChunk(u32),
    /// Chunk payload shorter than its type's structure
    ChunkTooShort {
        /// Chunk id
        id: u32,
        /// Declared payload length in bytes
        len: u32,
    },
    /// More distinct engine targets than the gang maximum
    GangTooLarge,
    /// More command buffers on one engine than it accepts
    TooManyCmdBufs,
    /// Target engine does not exist or has no runnable queue
    NoRunnableQueue,
    /// More than one user-fence chunk
    DuplicateUserFence,
    /// User-fence buffer is not one page or the offset overflows it
    UserFenceRange,
    /// Target engine cannot write a user fence
    UserFenceUnsupported,
    /// Buffer list given twice (chunk and handle, or two chunks)
    ConflictingBoList,
    /// Buffer-list entry stride is smaller than an entry
    BadBoListStride,
    /// No command buffers in the whole submission
    NoCommandBuffers,
    /// More than one preemptible command buffer for one role
    PreemptLimit,
    /// More than one signal chunk
    DuplicateSignalChunk,
}

/// Reasons a command buffer fails in-place validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    /// No VM mapping covers the address
    UnmappedAddress(u64),
    /// Mapping exists but its BO is not reserved by this submission
    NotReserved(u64),
    /// Command buffer runs past the end of its mapping
    OutOfRange {
        /// Start address
        va: u64,
        /// Length in bytes
        len: u32,
    },
    /// Engine validator refused the command stream
    Rejected,
}

// =============================================================================
// TAXONOMY
// =============================================================================

/// Coarse error classes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad chunk length/type/count; nothing dispatched
    Malformed,
    /// Allocation failure; partial state unwound
    Exhausted,
    /// Contention; caller may reissue
    Transient,
    /// Context is guilty or stale until reset
    StaleContext,
    /// Address or size checks failed
    Validation,
    /// Anything else
    Internal,
}

impl Error {
    /// Error class used for propagation policy
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Malformed(_) | Self::InvalidArgument | Self::InvalidHandle | Self::Fault => {
                ErrorClass::Malformed
            },
            Self::OutOfMemory => ErrorClass::Exhausted,
            Self::Interrupted | Self::WouldBlock | Self::Again | Self::Deadlock => {
                ErrorClass::Transient
            },
            Self::Canceled => ErrorClass::StaleContext,
            Self::Validation(_) => ErrorClass::Validation,
            Self::Timeout | Self::PermissionDenied => ErrorClass::Internal,
        }
    }

    /// Whether reissuing the identical submission may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Caller-visible error number
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument | Self::Malformed(_) | Self::Validation(_) => errno::EINVAL,
            Self::InvalidHandle => errno::ENOENT,
            Self::Fault => errno::EFAULT,
            Self::Timeout => errno::ETIME,
            Self::PermissionDenied => errno::EPERM,
            Self::OutOfMemory => errno::ENOMEM,
            Self::Interrupted => errno::EINTR,
            Self::WouldBlock => errno::EBUSY,
            Self::Again => errno::EAGAIN,
            Self::Deadlock => errno::EDEADLK,
            Self::Canceled => errno::ECANCELED,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::Fault => write!(f, "submission stream truncated"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Interrupted => write!(f, "wait interrupted"),
            Self::WouldBlock => write!(f, "resource busy"),
            Self::Again => write!(f, "state changed, try again"),
            Self::Deadlock => write!(f, "reservation backoff"),
            Self::Canceled => write!(f, "context canceled"),
            Self::Malformed(m) => write!(f, "malformed submission: {}", m),
            Self::Validation(v) => write!(f, "validation failed: {}", v),
        }
    }
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChunks => write!(f, "no chunks"),
            Self::UnknownChunk(id) => write!(f, "unknown chunk id {:#x}", id),
            Self::ChunkTooShort { id, len } => {
                write!(f, "chunk {:#x} too short ({} bytes)", id, len)
            },
            Self::GangTooLarge => write!(f, "too many engine targets"),
            Self::TooManyCmdBufs => write!(f, "too many command buffers for engine"),
            Self::NoRunnableQueue => write!(f, "engine has no runnable queue"),
            Self::DuplicateUserFence => write!(f, "more than one user fence"),
            Self::UserFenceRange => write!(f, "user fence outside its buffer"),
            Self::UserFenceUnsupported => write!(f, "engine cannot write user fences"),
            Self::ConflictingBoList => write!(f, "buffer list supplied twice"),
            Self::BadBoListStride => write!(f, "buffer list stride too small"),
            Self::NoCommandBuffers => write!(f, "no command buffers"),
            Self::PreemptLimit => write!(f, "more than one preemptible command buffer"),
            Self::DuplicateSignalChunk => write!(f, "more than one signal chunk"),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnmappedAddress(va) => write!(f, "no mapping at {:#x}", va),
            Self::NotReserved(va) => write!(f, "buffer at {:#x} not reserved", va),
            Self::OutOfRange { va, len } => {
                write!(f, "{:#x}+{:#x} exceeds its mapping", va, len)
            },
            Self::Rejected => write!(f, "engine rejected command stream"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<Malformed> for Error {
    fn from(e: Malformed) -> Self {
        Error::Malformed(e)
    }
}

impl From<ValidationFailure> for Error {
    fn from(e: ValidationFailure) -> Self {
        Error::Validation(e)
    }
}
