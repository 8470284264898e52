//! # Buffer Objects
//!
//! GPU-addressable memory with placement state and a reservation slot.
//!
//! Buffer ids are handed out in increasing order by one [`BoRegistry`] per
//! device. That order is the global acquisition order used when a submission
//! reserves several buffers at once.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use ember_core::{Error, Result, PAGE_SIZE};
use spin::{Mutex, MutexGuard};

use crate::domain::{BoFlags, Domain};
use crate::reservation::{Reservation, Ticket};
use crate::userptr::{UserBacking, UserMemory};

/// Buffer object identifier
pub type BoId = u64;

// =============================================================================
// PLACEMENT
// =============================================================================

/// Where a buffer currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Current domain
    pub domain: Domain,
    /// GPU offset inside the domain, if GPU-accessible
    pub gpu_offset: Option<u64>,
    /// Whether the backing is physically contiguous
    pub contiguous: bool,
    /// Whether the placement lies in CPU-visible VRAM
    pub visible: bool,
    /// Pin count; pinned buffers never move
    pub pin_count: u32,
}

impl Placement {
    const fn unplaced() -> Self {
        Self {
            domain: Domain::CPU,
            gpu_offset: None,
            contiguous: false,
            visible: false,
            pin_count: 0,
        }
    }

    /// Whether the buffer is pinned
    pub const fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// Creation parameters
#[derive(Debug, Clone, Copy)]
pub struct BoDesc {
    /// Size in bytes (rounded up to a page)
    pub size: u64,
    /// Domains the buffer should live in
    pub preferred: Domain,
    /// Domains the buffer may live in
    pub allowed: Domain,
    /// Creation flags
    pub flags: BoFlags,
}

impl BoDesc {
    /// VRAM-preferred buffer that may fall back to GTT
    pub const fn vram(size: u64) -> Self {
        Self {
            size,
            preferred: Domain::VRAM,
            allowed: Domain::VRAM.union(Domain::GTT),
            flags: BoFlags::empty(),
        }
    }

    /// GTT-only buffer
    pub const fn gtt(size: u64) -> Self {
        Self {
            size,
            preferred: Domain::GTT,
            allowed: Domain::GTT,
            flags: BoFlags::empty(),
        }
    }

    /// Replace the flags
    pub const fn with_flags(mut self, flags: BoFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A buffer object
#[derive(Debug)]
pub struct BufferObject {
    /// Global id, also the acquisition order
    id: BoId,
    /// Size in bytes
    size: u64,
    /// Preferred domains
    preferred: Domain,
    /// Allowed domains
    allowed: Domain,
    /// Creation flags
    flags: BoFlags,
    /// Reservation slot
    resv: Reservation,
    /// Placement; written only under the reservation
    placement: Mutex<Placement>,
    /// User-pointer backing
    user: Option<UserBacking>,
    /// CPU view, allocated on first access
    contents: Mutex<Vec<u8>>,
}

impl BufferObject {
    /// Get buffer ID
    pub fn id(&self) -> BoId {
        self.id
    }

    /// Get size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Preferred domains
    pub fn preferred_domains(&self) -> Domain {
        self.preferred
    }

    /// Allowed domains
    pub fn allowed_domains(&self) -> Domain {
        self.allowed
    }

    /// Creation flags
    pub fn flags(&self) -> BoFlags {
        self.flags
    }

    /// Reservation slot
    pub fn resv(&self) -> &Reservation {
        &self.resv
    }

    /// Snapshot of the placement
    pub fn placement(&self) -> Placement {
        *self.placement.lock()
    }

    /// Mutable placement; `ticket` must hold the reservation
    pub fn placement_mut(&self, ticket: Ticket) -> Result<MutexGuard<'_, Placement>> {
        if !self.resv.is_locked_by(ticket) {
            log::debug!("bo {}: placement change without reservation", self.id);
            return Err(Error::InvalidArgument);
        }
        Ok(self.placement.lock())
    }

    /// Pin in place; `ticket` must hold the reservation
    pub fn pin(&self, ticket: Ticket) -> Result<()> {
        self.placement_mut(ticket)?.pin_count += 1;
        Ok(())
    }

    /// Drop a pin; `ticket` must hold the reservation
    pub fn unpin(&self, ticket: Ticket) -> Result<()> {
        let mut placement = self.placement_mut(ticket)?;
        placement.pin_count = placement.pin_count.saturating_sub(1);
        Ok(())
    }

    /// User-pointer backing, if any
    pub fn user_backing(&self) -> Option<&UserBacking> {
        self.user.as_ref()
    }

    /// Whether the buffer is backed by process memory
    pub fn is_userptr(&self) -> bool {
        self.user.is_some()
    }

    /// Run `f` on the CPU view
    pub fn with_contents<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut contents = self.contents.lock();
        if contents.is_empty() {
            let len = usize::try_from(self.size).map_err(|_| Error::OutOfMemory)?;
            contents.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
            contents.resize(len, 0);
        }
        Ok(f(&mut contents))
    }

    /// Copy bytes into the CPU view
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or(Error::InvalidArgument)?;
        self.with_contents(|bytes| bytes[offset as usize..end as usize].copy_from_slice(data))
    }

    /// Copy bytes out of the CPU view
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(out.len() as u64)
            .filter(|&end| end <= self.size)
            .ok_or(Error::InvalidArgument)?;
        self.with_contents(|bytes| out.copy_from_slice(&bytes[offset as usize..end as usize]))
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry statistics
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    /// Buffers created
    pub created: u64,
    /// Bytes created
    pub bytes: u64,
    /// User-pointer buffers created
    pub userptr: u64,
}

/// Creates buffer objects with globally ordered ids
#[derive(Debug)]
pub struct BoRegistry {
    next_id: AtomicU64,
    stats: Mutex<RegistryStats>,
}

impl BoRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            stats: Mutex::new(RegistryStats {
                created: 0,
                bytes: 0,
                userptr: 0,
            }),
        }
    }

    /// Create a buffer object
    pub fn create(&self, desc: BoDesc) -> Result<Arc<BufferObject>> {
        self.build(desc, None)
    }

    /// Create a buffer backed by process memory; it may only live in GTT
    pub fn create_userptr(
        &self,
        size: u64,
        memory: Arc<dyn UserMemory>,
    ) -> Result<Arc<BufferObject>> {
        let desc = BoDesc::gtt(size);
        let bo = self.build(desc, Some(UserBacking::new(memory)))?;
        self.stats.lock().userptr += 1;
        Ok(bo)
    }

    fn build(&self, desc: BoDesc, user: Option<UserBacking>) -> Result<Arc<BufferObject>> {
        if desc.size == 0 || desc.allowed.is_empty() || !desc.allowed.contains(desc.preferred) {
            return Err(Error::InvalidArgument);
        }
        let size = desc
            .size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(Error::InvalidArgument)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut stats = self.stats.lock();
            stats.created += 1;
            stats.bytes += size;
        }
        log::trace!("bo {}: created, {} bytes, preferred {:?}", id, size, desc.preferred);

        Ok(Arc::new(BufferObject {
            id,
            size,
            preferred: desc.preferred,
            allowed: desc.allowed,
            flags: desc.flags,
            resv: Reservation::new(),
            placement: Mutex::new(Placement::unplaced()),
            user,
            contents: Mutex::new(Vec::new()),
        }))
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStats {
        self.stats.lock().clone()
    }
}

impl Default for BoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::TicketSource;
    use crate::userptr::HostUserMemory;

    #[test]
    fn test_ids_increase() {
        let registry = BoRegistry::new();
        let a = registry.create(BoDesc::vram(100)).unwrap();
        let b = registry.create(BoDesc::gtt(PAGE_SIZE)).unwrap();
        assert!(a.id() < b.id());
        assert_eq!(a.size(), PAGE_SIZE);
        assert_eq!(registry.stats().created, 2);
    }

    #[test]
    fn test_invalid_desc() {
        let registry = BoRegistry::new();
        assert_eq!(registry.create(BoDesc::vram(0)).unwrap_err(), Error::InvalidArgument);

        let mut desc = BoDesc::gtt(PAGE_SIZE);
        desc.preferred = Domain::VRAM;
        assert!(registry.create(desc).is_err());
    }

    #[test]
    fn test_placement_requires_reservation() {
        let registry = BoRegistry::new();
        let tickets = TicketSource::new();
        let bo = registry.create(BoDesc::vram(PAGE_SIZE)).unwrap();
        let ticket = tickets.next();

        assert!(bo.pin(ticket).is_err());
        bo.resv().try_lock(ticket);
        bo.pin(ticket).unwrap();
        assert!(bo.placement().is_pinned());
        bo.resv().unlock(ticket);
    }

    #[test]
    fn test_contents_bounds() {
        let registry = BoRegistry::new();
        let bo = registry.create(BoDesc::gtt(PAGE_SIZE)).unwrap();
        bo.write(8, &[1, 2, 3, 4]).unwrap();

        let mut out = [0u8; 4];
        bo.read(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(bo.write(PAGE_SIZE - 2, &[0; 4]).is_err());
    }

    #[test]
    fn test_userptr_is_gtt_only() {
        let registry = BoRegistry::new();
        let mem = Arc::new(HostUserMemory::new(42, 0x100, 1));
        let bo = registry.create_userptr(PAGE_SIZE, mem).unwrap();
        assert!(bo.is_userptr());
        assert_eq!(bo.allowed_domains(), Domain::GTT);
    }
}
