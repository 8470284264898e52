//! # EMBER Core Types
//!
//! Strongly typed addresses and engine identifiers shared by every stage.

use core::fmt;
use core::ops::{Add, Sub};

/// CPU and GPU page size used for user fences and mappings
pub const PAGE_SIZE: u64 = 4096;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in a client's GPU virtual address space. It is NOT a CPU
/// pointer and cannot be dereferenced directly.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(pub u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Offset by bytes, failing on overflow
    #[inline]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<GpuAddr> for GpuAddr {
    type Output = u64;

    fn sub(self, rhs: GpuAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// ENGINE TYPE
// =============================================================================

/// Hardware engine class a command buffer targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum EngineType {
    /// Graphics engine (constant + draw roles)
    Gfx = 0,
    /// Compute engine
    Compute = 1,
    /// DMA / copy engine
    Dma = 2,
    /// Video decode engine
    VideoDecode = 3,
    /// Video encode engine
    VideoEncode = 4,
}

impl EngineType {
    /// Number of engine classes
    pub const COUNT: usize = 5;

    /// Decode the wire value
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Gfx),
            1 => Some(Self::Compute),
            2 => Some(Self::Dma),
            3 => Some(Self::VideoDecode),
            4 => Some(Self::VideoEncode),
            _ => None,
        }
    }

    /// Wire value
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// ENGINE KEY
// =============================================================================

/// (engine type, engine instance, ring) triple naming one hardware queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EngineKey {
    /// Engine class
    pub engine: EngineType,
    /// Engine instance
    pub instance: u32,
    /// Ring within the instance
    pub ring: u32,
}

impl EngineKey {
    /// Create a new key
    pub const fn new(engine: EngineType, instance: u32, ring: u32) -> Self {
        Self {
            engine,
            instance,
            ring,
        }
    }

    /// Decode raw wire values
    pub fn from_raw(ip_type: u32, instance: u32, ring: u32) -> Option<Self> {
        EngineType::from_raw(ip_type).map(|engine| Self::new(engine, instance, ring))
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}.{}", self.engine, self.instance, self.ring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_type_roundtrip() {
        for raw in 0..EngineType::COUNT as u32 {
            let engine = EngineType::from_raw(raw).unwrap();
            assert_eq!(engine.raw(), raw);
        }
        assert!(EngineType::from_raw(99).is_none());
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(GpuAddr::new(0x1000).checked_add(0x40), Some(GpuAddr::new(0x1040)));
        assert!(GpuAddr::new(u64::MAX).checked_add(1).is_none());
        assert!(GpuAddr::new(0x2000).is_aligned(PAGE_SIZE));
    }
}
