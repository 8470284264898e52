//! # Chunks
//!
//! Typed view of a submission stream. [`decode_stream`] copies the stream
//! headers and payloads out of caller memory and turns each payload into a
//! [`Chunk`]; [`ChunkWriter`] produces canonical streams for tools and tests.

use alloc::vec::Vec;
use core::mem::size_of;

use ember_core::{EngineKey, Error, GpuAddr, Malformed, Result};

use crate::wire::{
    self, chunk_id, BoListEntry, BoListHeader, ChunkHeader, DepDesc, FenceDesc, IbDesc, IbFlags,
    SemDesc, ShadowDesc, StreamFlags, StreamHeader, SyncobjDesc,
};

// =============================================================================
// CHUNK
// =============================================================================

/// One decoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Command buffer
    CmdBuf(IbDesc),
    /// User fence location
    UserFence(FenceDesc),
    /// Dependencies on earlier submissions
    Dependencies {
        /// Wait for the dependency to start rather than finish
        scheduled: bool,
        /// Dependency records
        deps: Vec<DepDesc>,
    },
    /// Binary sync objects to wait on
    SyncobjIn(Vec<SemDesc>),
    /// Binary sync objects to signal
    SyncobjOut(Vec<SemDesc>),
    /// Inline buffer list
    BoHandles {
        /// Entry stride in bytes
        stride: u32,
        /// Entries
        entries: Vec<BoListEntry>,
    },
    /// Timeline points to wait on
    TimelineWait(Vec<SyncobjDesc>),
    /// Timeline points to signal
    TimelineSignal(Vec<SyncobjDesc>),
    /// Graphics shadow metadata
    Shadow(ShadowDesc),
    /// Chunk id this build does not know
    Unrecognized {
        /// Chunk id
        id: u32,
        /// Raw payload
        payload: Vec<u8>,
    },
}

impl Chunk {
    /// Decode the payload of a chunk with type `id`
    pub fn decode(id: u32, payload: &[u8]) -> Result<Self> {
        let Some(min) = wire::min_payload(id) else {
            return Ok(Self::Unrecognized {
                id,
                payload: copy_bytes(payload)?,
            });
        };
        if payload.len() < min {
            return Err(Malformed::ChunkTooShort {
                id,
                len: payload.len() as u32,
            }
            .into());
        }

        let chunk = match id {
            chunk_id::IB => Self::CmdBuf(read(payload)?),
            chunk_id::FENCE => Self::UserFence(read(payload)?),
            chunk_id::DEPENDENCIES | chunk_id::SCHEDULED_DEPENDENCIES => Self::Dependencies {
                scheduled: id == chunk_id::SCHEDULED_DEPENDENCIES,
                deps: read_vec(payload)?,
            },
            chunk_id::SYNCOBJ_IN => Self::SyncobjIn(read_vec(payload)?),
            chunk_id::SYNCOBJ_OUT => Self::SyncobjOut(read_vec(payload)?),
            chunk_id::BO_HANDLES => decode_bo_list(payload)?,
            chunk_id::SYNCOBJ_TIMELINE_WAIT => Self::TimelineWait(read_vec(payload)?),
            chunk_id::SYNCOBJ_TIMELINE_SIGNAL => Self::TimelineSignal(read_vec(payload)?),
            chunk_id::CP_GFX_SHADOW => Self::Shadow(read(payload)?),
            _ => {
                return Ok(Self::Unrecognized {
                    id,
                    payload: copy_bytes(payload)?,
                })
            },
        };
        Ok(chunk)
    }

    /// Wire id of this chunk
    pub fn id(&self) -> u32 {
        match self {
            Self::CmdBuf(_) => chunk_id::IB,
            Self::UserFence(_) => chunk_id::FENCE,
            Self::Dependencies { scheduled: false, .. } => chunk_id::DEPENDENCIES,
            Self::Dependencies { scheduled: true, .. } => chunk_id::SCHEDULED_DEPENDENCIES,
            Self::SyncobjIn(_) => chunk_id::SYNCOBJ_IN,
            Self::SyncobjOut(_) => chunk_id::SYNCOBJ_OUT,
            Self::BoHandles { .. } => chunk_id::BO_HANDLES,
            Self::TimelineWait(_) => chunk_id::SYNCOBJ_TIMELINE_WAIT,
            Self::TimelineSignal(_) => chunk_id::SYNCOBJ_TIMELINE_SIGNAL,
            Self::Shadow(_) => chunk_id::CP_GFX_SHADOW,
            Self::Unrecognized { id, .. } => *id,
        }
    }

    /// Append the canonical payload of this chunk to `out`
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::CmdBuf(ib) => out.extend_from_slice(bytemuck::bytes_of(ib)),
            Self::UserFence(fence) => out.extend_from_slice(bytemuck::bytes_of(fence)),
            Self::Dependencies { deps, .. } => out.extend_from_slice(bytemuck::cast_slice(deps)),
            Self::SyncobjIn(sems) | Self::SyncobjOut(sems) => {
                out.extend_from_slice(bytemuck::cast_slice(sems))
            },
            Self::BoHandles { stride, entries } => {
                let header = BoListHeader {
                    bo_number: entries.len() as u32,
                    bo_info_size: *stride,
                };
                out.extend_from_slice(bytemuck::bytes_of(&header));
                let pad = (*stride as usize).saturating_sub(size_of::<BoListEntry>());
                for entry in entries {
                    out.extend_from_slice(bytemuck::bytes_of(entry));
                    out.resize(out.len() + pad, 0);
                }
            },
            Self::TimelineWait(points) | Self::TimelineSignal(points) => {
                out.extend_from_slice(bytemuck::cast_slice(points))
            },
            Self::Shadow(shadow) => out.extend_from_slice(bytemuck::bytes_of(shadow)),
            Self::Unrecognized { payload, .. } => {
                out.extend_from_slice(payload);
                out.resize(out.len().next_multiple_of(4), 0);
            },
        }
    }
}

fn copy_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(bytes.len())
        .map_err(|_| Error::OutOfMemory)?;
    out.extend_from_slice(bytes);
    Ok(out)
}

fn read<T: bytemuck::Pod>(payload: &[u8]) -> Result<T> {
    wire::read(payload).ok_or(Error::Fault)
}

fn read_vec<T: bytemuck::Pod>(payload: &[u8]) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(payload.len() / size_of::<T>())
        .map_err(|_| Error::OutOfMemory)?;
    out.extend(wire::read_array::<T>(payload));
    Ok(out)
}

fn decode_bo_list(payload: &[u8]) -> Result<Chunk> {
    let header: BoListHeader = read(payload)?;
    let stride = header.bo_info_size as usize;
    if stride < size_of::<BoListEntry>() {
        return Err(Malformed::BadBoListStride.into());
    }
    let body = &payload[size_of::<BoListHeader>()..];
    let needed = (header.bo_number as usize)
        .checked_mul(stride)
        .ok_or(Error::InvalidArgument)?;
    if body.len() < needed {
        return Err(Malformed::ChunkTooShort {
            id: chunk_id::BO_HANDLES,
            len: payload.len() as u32,
        }
        .into());
    }

    let mut entries = Vec::new();
    entries
        .try_reserve_exact(header.bo_number as usize)
        .map_err(|_| Error::OutOfMemory)?;
    for record in body[..needed].chunks_exact(stride) {
        entries.push(read::<BoListEntry>(record)?);
    }
    Ok(Chunk::BoHandles {
        stride: header.bo_info_size,
        entries,
    })
}

// =============================================================================
// STREAM
// =============================================================================

/// A decoded submission stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStream {
    /// Stream-wide flags
    pub flags: StreamFlags,
    /// Chunks in stream order
    pub chunks: Vec<Chunk>,
}

/// Copy and decode a whole submission stream
pub fn decode_stream(bytes: &[u8]) -> Result<ChunkStream> {
    let header: StreamHeader = wire::read(bytes).ok_or(Error::Fault)?;
    if header.num_chunks == 0 {
        return Err(Malformed::NoChunks.into());
    }
    let flags = StreamFlags::from_bits(header.flags).ok_or(Error::InvalidArgument)?;

    let count = header.num_chunks as usize;
    let headers_len = count
        .checked_mul(size_of::<ChunkHeader>())
        .ok_or(Error::Fault)?;
    let headers = bytes
        .get(size_of::<StreamHeader>()..)
        .and_then(|rest| rest.get(..headers_len))
        .ok_or(Error::Fault)?;

    let mut chunks = Vec::new();
    chunks.try_reserve_exact(count).map_err(|_| Error::OutOfMemory)?;

    let mut cursor = size_of::<StreamHeader>() + headers_len;
    for chunk_header in wire::read_array::<ChunkHeader>(headers) {
        let len = (chunk_header.length_dw as usize)
            .checked_mul(4)
            .ok_or(Error::Fault)?;
        let end = cursor.checked_add(len).ok_or(Error::Fault)?;
        let payload = bytes.get(cursor..end).ok_or(Error::Fault)?;
        chunks.push(Chunk::decode(chunk_header.chunk_id, payload)?);
        cursor = end;
    }

    Ok(ChunkStream { flags, chunks })
}

// =============================================================================
// WRITER
// =============================================================================

/// Builder for canonical submission streams
#[derive(Debug, Default, Clone)]
pub struct ChunkWriter {
    flags: StreamFlags,
    chunks: Vec<Chunk>,
}

impl ChunkWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Set stream flags
    pub fn flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Append a decoded chunk
    pub fn chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Append a command buffer
    pub fn cmd_buf(self, key: EngineKey, va: GpuAddr, len: u32, flags: IbFlags) -> Self {
        self.chunk(Chunk::CmdBuf(IbDesc {
            _pad: 0,
            flags: flags.bits(),
            va_start: va.raw(),
            ib_bytes: len,
            ip_type: key.engine.raw(),
            ip_instance: key.instance,
            ring: key.ring,
        }))
    }

    /// Append a user fence
    pub fn user_fence(self, handle: u32, offset: u32) -> Self {
        self.chunk(Chunk::UserFence(FenceDesc { handle, offset }))
    }

    /// Append a dependency on `(ctx, key, seq)`
    pub fn dependency(self, ctx: u32, key: EngineKey, seq: u64, scheduled: bool) -> Self {
        let dep = DepDesc {
            ip_type: key.engine.raw(),
            ip_instance: key.instance,
            ring: key.ring,
            ctx_id: ctx,
            handle: seq,
        };
        self.chunk(Chunk::Dependencies {
            scheduled,
            deps: alloc::vec![dep],
        })
    }

    /// Append binary sync objects to wait on
    pub fn syncobj_in(self, handles: &[u32]) -> Self {
        let sems = handles.iter().map(|&handle| SemDesc { handle }).collect();
        self.chunk(Chunk::SyncobjIn(sems))
    }

    /// Append binary sync objects to signal
    pub fn syncobj_out(self, handles: &[u32]) -> Self {
        let sems = handles.iter().map(|&handle| SemDesc { handle }).collect();
        self.chunk(Chunk::SyncobjOut(sems))
    }

    /// Append an inline buffer list of `(handle, priority)` pairs
    pub fn bo_list(self, bos: &[(u32, u32)]) -> Self {
        let entries = bos
            .iter()
            .map(|&(bo_handle, bo_priority)| BoListEntry {
                bo_handle,
                bo_priority,
            })
            .collect();
        self.chunk(Chunk::BoHandles {
            stride: size_of::<BoListEntry>() as u32,
            entries,
        })
    }

    /// Append timeline points to wait on
    pub fn timeline_wait(self, points: &[SyncobjDesc]) -> Self {
        self.chunk(Chunk::TimelineWait(points.to_vec()))
    }

    /// Append timeline points to signal
    pub fn timeline_signal(self, points: &[SyncobjDesc]) -> Self {
        self.chunk(Chunk::TimelineSignal(points.to_vec()))
    }

    /// Append a raw chunk
    pub fn raw(self, id: u32, payload: &[u8]) -> Self {
        self.chunk(Chunk::Unrecognized {
            id,
            payload: payload.to_vec(),
        })
    }

    /// Serialize the stream
    pub fn finish(self) -> Vec<u8> {
        encode_stream(self.flags, &self.chunks)
    }
}

/// Serialize `chunks` as a stream
pub fn encode_stream(flags: StreamFlags, chunks: &[Chunk]) -> Vec<u8> {
    let mut payloads = Vec::new();
    let mut headers = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let start = payloads.len();
        chunk.encode(&mut payloads);
        headers.push(ChunkHeader {
            chunk_id: chunk.id(),
            length_dw: ((payloads.len() - start) / 4) as u32,
        });
    }

    let header = StreamHeader {
        num_chunks: chunks.len() as u32,
        flags: flags.bits(),
    };
    let mut out = Vec::with_capacity(
        size_of::<StreamHeader>() + headers.len() * size_of::<ChunkHeader>() + payloads.len(),
    );
    out.extend_from_slice(bytemuck::bytes_of(&header));
    out.extend_from_slice(bytemuck::cast_slice(&headers));
    out.extend_from_slice(&payloads);
    out
}
