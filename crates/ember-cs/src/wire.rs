//! # Wire Format
//!
//! Little-endian layout of a submission stream.
//!
//! ```text
//! ┌──────────────┬───────────────────────────┬──────────┬─────┬──────────┐
//! │ StreamHeader │ ChunkHeader × num_chunks  │ payload0 │ ... │ payloadN │
//! └──────────────┴───────────────────────────┴──────────┴─────┴──────────┘
//! ```
//!
//! Each payload is `length_dw * 4` bytes. The descriptor structs below are
//! the minimum payload of their chunk type; longer payloads are accepted and
//! the excess ignored.

use core::mem::size_of;

use bytemuck::{Pod, Zeroable};
use static_assertions::assert_eq_size;

// =============================================================================
// CHUNK IDS
// =============================================================================

/// Chunk type identifiers
pub mod chunk_id {
    /// Command buffer descriptor
    pub const IB: u32 = 0x01;
    /// User fence descriptor
    pub const FENCE: u32 = 0x02;
    /// Dependencies on earlier submissions
    pub const DEPENDENCIES: u32 = 0x03;
    /// Binary sync objects to wait on
    pub const SYNCOBJ_IN: u32 = 0x04;
    /// Binary sync objects to signal
    pub const SYNCOBJ_OUT: u32 = 0x05;
    /// Inline buffer list
    pub const BO_HANDLES: u32 = 0x06;
    /// Dependencies on the start of earlier submissions
    pub const SCHEDULED_DEPENDENCIES: u32 = 0x07;
    /// Timeline points to wait on
    pub const SYNCOBJ_TIMELINE_WAIT: u32 = 0x08;
    /// Timeline points to signal
    pub const SYNCOBJ_TIMELINE_SIGNAL: u32 = 0x09;
    /// Graphics shadow metadata
    pub const CP_GFX_SHADOW: u32 = 0x0a;
}

// =============================================================================
// HEADERS
// =============================================================================

/// Stream header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StreamHeader {
    /// Number of chunk headers that follow
    pub num_chunks: u32,
    /// [`StreamFlags`]
    pub flags: u32,
}

/// Chunk header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ChunkHeader {
    /// Chunk type
    pub chunk_id: u32,
    /// Payload length in dwords
    pub length_dw: u32,
}

bitflags::bitflags! {
    /// Stream-wide flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StreamFlags: u32 {
        /// Fail with a busy error instead of waiting for buffer reservations
        const NO_WAIT = 1 << 0;
    }
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

bitflags::bitflags! {
    /// Command buffer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IbFlags: u32 {
        /// Runs on the constant engine role of the graphics engine
        const CE = 1 << 0;
        /// Preamble; may be skipped after the first submission of a context
        const PREAMBLE = 1 << 1;
        /// May be preempted mid-stream
        const PREEMPT = 1 << 2;
    }
}

/// Command buffer descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IbDesc {
    /// Reserved
    pub _pad: u32,
    /// [`IbFlags`]
    pub flags: u32,
    /// GPU virtual address of the commands
    pub va_start: u64,
    /// Length in bytes
    pub ib_bytes: u32,
    /// Engine type
    pub ip_type: u32,
    /// Engine instance
    pub ip_instance: u32,
    /// Ring within the instance
    pub ring: u32,
}

/// User fence descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FenceDesc {
    /// Buffer handle
    pub handle: u32,
    /// Byte offset of the 64-bit fence value
    pub offset: u32,
}

/// Dependency on an earlier submission
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DepDesc {
    /// Engine type
    pub ip_type: u32,
    /// Engine instance
    pub ip_instance: u32,
    /// Ring within the instance
    pub ring: u32,
    /// Context handle
    pub ctx_id: u32,
    /// Sequence number returned by the earlier submit
    pub handle: u64,
}

/// Binary sync object reference
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SemDesc {
    /// Sync object handle
    pub handle: u32,
}

/// Buffer list header; `bo_number` entries of `bo_info_size` bytes follow
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BoListHeader {
    /// Entry count
    pub bo_number: u32,
    /// Entry stride in bytes
    pub bo_info_size: u32,
}

/// Buffer list entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BoListEntry {
    /// Buffer handle
    pub bo_handle: u32,
    /// Eviction priority (clamped to 32)
    pub bo_priority: u32,
}

bitflags::bitflags! {
    /// Timeline sync object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyncobjFlags: u32 {
        /// Wait for the point to be submitted instead of failing
        const WAIT_FOR_SUBMIT = 1 << 0;
    }
}

/// Timeline sync object reference
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SyncobjDesc {
    /// Sync object handle
    pub handle: u32,
    /// [`SyncobjFlags`]
    pub flags: u32,
    /// Timeline point; 0 means binary
    pub point: u64,
}

/// Graphics shadow metadata
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShadowDesc {
    /// Shadow buffer address
    pub shadow_va: u64,
    /// Context save area address
    pub csa_va: u64,
    /// Global data share backup address
    pub gds_va: u64,
    /// Flags
    pub flags: u64,
}

assert_eq_size!(StreamHeader, [u8; 8]);
assert_eq_size!(ChunkHeader, [u8; 8]);
assert_eq_size!(IbDesc, [u8; 32]);
assert_eq_size!(FenceDesc, [u8; 8]);
assert_eq_size!(DepDesc, [u8; 24]);
assert_eq_size!(SemDesc, [u8; 4]);
assert_eq_size!(BoListHeader, [u8; 8]);
assert_eq_size!(BoListEntry, [u8; 8]);
assert_eq_size!(SyncobjDesc, [u8; 16]);
assert_eq_size!(ShadowDesc, [u8; 32]);

/// Minimum payload size of a chunk type, `None` for unknown ids
pub const fn min_payload(id: u32) -> Option<usize> {
    match id {
        chunk_id::IB => Some(size_of::<IbDesc>()),
        chunk_id::FENCE => Some(size_of::<FenceDesc>()),
        chunk_id::DEPENDENCIES | chunk_id::SCHEDULED_DEPENDENCIES => Some(size_of::<DepDesc>()),
        chunk_id::SYNCOBJ_IN | chunk_id::SYNCOBJ_OUT => Some(size_of::<SemDesc>()),
        chunk_id::BO_HANDLES => Some(size_of::<BoListHeader>()),
        chunk_id::SYNCOBJ_TIMELINE_WAIT | chunk_id::SYNCOBJ_TIMELINE_SIGNAL => {
            Some(size_of::<SyncobjDesc>())
        },
        chunk_id::CP_GFX_SHADOW => Some(size_of::<ShadowDesc>()),
        _ => None,
    }
}

/// Read a `T` from the start of `bytes`
pub(crate) fn read<T: Pod>(bytes: &[u8]) -> Option<T> {
    bytes
        .get(..size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
}

/// Read `bytes.len() / size_of::<T>()` consecutive `T`s
pub(crate) fn read_array<T: Pod>(bytes: &[u8]) -> impl Iterator<Item = T> + '_ {
    bytes
        .chunks_exact(size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_min_payloads() {
        assert_eq!(min_payload(chunk_id::IB), Some(32));
        assert_eq!(min_payload(chunk_id::DEPENDENCIES), Some(24));
        assert_eq!(min_payload(chunk_id::SYNCOBJ_TIMELINE_SIGNAL), Some(16));
        assert_eq!(min_payload(0x77), None);
    }

    #[test]
    fn test_unaligned_read() {
        let desc = SyncobjDesc {
            handle: 3,
            flags: 1,
            point: 0x1122_3344_5566_7788,
        };
        let mut bytes = [0u8; 17];
        bytes[1..].copy_from_slice(bytemuck::bytes_of(&desc));
        assert_eq!(read::<SyncobjDesc>(&bytes[1..]), Some(desc));
        assert_eq!(read::<SyncobjDesc>(&bytes[2..]), None);
    }

    #[test]
    fn test_read_array_ignores_tail() {
        let sems = [SemDesc { handle: 1 }, SemDesc { handle: 2 }];
        let mut bytes = bytemuck::cast_slice::<SemDesc, u8>(&sems).to_vec();
        bytes.push(0xff);
        let handles: Vec<u32> = read_array::<SemDesc>(&bytes).map(|s| s.handle).collect();
        assert_eq!(handles, [1, 2]);
    }
}
