//! # Client GPU Virtual Memory
//!
//! Per-client mapping table from GPU virtual addresses to buffer objects.
//! The page tables themselves are managed elsewhere; this table is what the
//! submission path consults to find the buffer behind a command-buffer
//! address, and what orders new work after pending page-table updates.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use ember_core::{Error, FenceRef, GpuAddr, Result, PAGE_SIZE};
use spin::Mutex;

use crate::bo::BufferObject;

// =============================================================================
// VIRTUAL ADDRESS RANGE
// =============================================================================

/// A range in GPU virtual address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    /// Start address
    pub start: GpuAddr,
    /// End address (exclusive)
    pub end: GpuAddr,
}

impl VaRange {
    /// Create a range, failing on overflow
    pub fn new(start: GpuAddr, size: u64) -> Option<Self> {
        start.checked_add(size).map(|end| Self { start, end })
    }

    /// Get range size
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Check if address is in range
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Check if `other` lies entirely inside this range
    pub fn covers(&self, other: &VaRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if ranges overlap
    pub fn overlaps(&self, other: &VaRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// =============================================================================
// MAPPINGS
// =============================================================================

/// One mapping of a buffer range into the VM
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Mapped virtual range
    pub range: VaRange,
    /// Backing buffer
    pub bo: Arc<BufferObject>,
    /// Offset of `range.start` inside the buffer
    pub offset: u64,
}

impl Mapping {
    /// Byte offset of `va` inside the backing buffer
    pub fn bo_offset(&self, va: GpuAddr) -> u64 {
        self.offset + (va - self.range.start)
    }
}

/// A client's GPU virtual address space
#[derive(Debug, Default)]
pub struct GpuVm {
    /// Root page-table buffer, when page tables are driver-managed
    root: Option<Arc<BufferObject>>,
    /// Mappings keyed by start address
    mappings: Mutex<BTreeMap<GpuAddr, Mapping>>,
    /// Last page-table update
    last_update: Mutex<Option<FenceRef>>,
}

impl GpuVm {
    /// Create a VM whose page tables live outside the buffer registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a VM with a root page-table buffer
    pub fn with_root(root: Arc<BufferObject>) -> Self {
        Self {
            root: Some(root),
            ..Self::default()
        }
    }

    /// Root page-table buffer
    pub fn root(&self) -> Option<&Arc<BufferObject>> {
        self.root.as_ref()
    }

    /// Map `size` bytes of `bo` starting at `offset` to `va`
    pub fn map(&self, va: GpuAddr, bo: &Arc<BufferObject>, offset: u64, size: u64) -> Result<()> {
        if size == 0 || !va.is_aligned(PAGE_SIZE) || offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        if offset.checked_add(size).map_or(true, |end| end > bo.size()) {
            return Err(Error::InvalidArgument);
        }
        let range = VaRange::new(va, size).ok_or(Error::InvalidArgument)?;

        let mut mappings = self.mappings.lock();
        let clash = mappings
            .range(..range.end)
            .next_back()
            .is_some_and(|(_, m)| m.range.overlaps(&range));
        if clash {
            return Err(Error::InvalidArgument);
        }
        mappings.insert(
            va,
            Mapping {
                range,
                bo: bo.clone(),
                offset,
            },
        );
        log::trace!("vm: mapped bo {} at {}", bo.id(), va);
        Ok(())
    }

    /// Remove the mapping starting at `va`
    pub fn unmap(&self, va: GpuAddr) -> Result<Arc<BufferObject>> {
        self.mappings
            .lock()
            .remove(&va)
            .map(|m| m.bo)
            .ok_or(Error::InvalidArgument)
    }

    /// Mapping containing `va`
    pub fn lookup(&self, va: GpuAddr) -> Option<Mapping> {
        self.mappings
            .lock()
            .range(..=va)
            .next_back()
            .filter(|(_, m)| m.range.contains(va))
            .map(|(_, m)| m.clone())
    }

    /// Number of mappings
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Record a page-table update
    pub fn set_last_update(&self, fence: FenceRef) {
        *self.last_update.lock() = Some(fence);
    }

    /// Last page-table update, if any
    pub fn last_update(&self) -> Option<FenceRef> {
        self.last_update.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::{BoDesc, BoRegistry};

    #[test]
    fn test_map_and_lookup() {
        let registry = BoRegistry::new();
        let bo = registry.create(BoDesc::vram(2 * PAGE_SIZE)).unwrap();
        let vm = GpuVm::new();

        vm.map(GpuAddr::new(0x1000), &bo, 0, 2 * PAGE_SIZE).unwrap();
        let mapping = vm.lookup(GpuAddr::new(0x2ff0)).unwrap();
        assert_eq!(mapping.bo.id(), bo.id());
        assert_eq!(mapping.bo_offset(GpuAddr::new(0x2ff0)), 0x1ff0);
        assert!(vm.lookup(GpuAddr::new(0x3000)).is_none());
        assert!(vm.lookup(GpuAddr::new(0x0fff)).is_none());
    }

    #[test]
    fn test_overlap_rejected() {
        let registry = BoRegistry::new();
        let bo = registry.create(BoDesc::vram(4 * PAGE_SIZE)).unwrap();
        let vm = GpuVm::new();

        vm.map(GpuAddr::new(0x4000), &bo, 0, 2 * PAGE_SIZE).unwrap();
        assert!(vm.map(GpuAddr::new(0x5000), &bo, 0, PAGE_SIZE).is_err());
        assert!(vm.map(GpuAddr::new(0x2000), &bo, 0, 4 * PAGE_SIZE).is_err());
        vm.map(GpuAddr::new(0x6000), &bo, PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(vm.mapping_count(), 2);
    }

    #[test]
    fn test_map_past_bo_end() {
        let registry = BoRegistry::new();
        let bo = registry.create(BoDesc::vram(PAGE_SIZE)).unwrap();
        let vm = GpuVm::new();
        assert!(vm.map(GpuAddr::new(0x1000), &bo, 0, 2 * PAGE_SIZE).is_err());
        assert!(vm.map(GpuAddr::new(0x1001), &bo, 0, PAGE_SIZE).is_err());
    }

    #[test]
    fn test_unmap() {
        let registry = BoRegistry::new();
        let bo = registry.create(BoDesc::gtt(PAGE_SIZE)).unwrap();
        let vm = GpuVm::new();
        vm.map(GpuAddr::new(0x8000), &bo, 0, PAGE_SIZE).unwrap();
        assert_eq!(vm.unmap(GpuAddr::new(0x8000)).unwrap().id(), bo.id());
        assert!(vm.unmap(GpuAddr::new(0x8000)).is_err());
    }
}
