//! # Memory Domains
//!
//! Where a buffer object's backing store lives, and the creation flags that
//! constrain where it may go.

bitflags::bitflags! {
    /// Memory domains a buffer may occupy
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Domain: u32 {
        /// System memory not mapped for the GPU
        const CPU = 1 << 0;
        /// System memory mapped through the GART
        const GTT = 1 << 1;
        /// Device-local memory
        const VRAM = 1 << 2;
    }
}

impl Domain {
    /// Domains in order of preference for GPU access
    pub const PREFERENCE: [Domain; 3] = [Domain::VRAM, Domain::GTT, Domain::CPU];

    /// Whether the GPU can address this domain
    pub const fn is_gpu_accessible(self) -> bool {
        self.intersects(Domain::VRAM.union(Domain::GTT))
    }
}

bitflags::bitflags! {
    /// Buffer object creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BoFlags: u32 {
        /// CPU must be able to map the buffer (visible VRAM only)
        const CPU_ACCESS_REQUIRED = 1 << 0;
        /// CPU will never map the buffer
        const NO_CPU_ACCESS = 1 << 1;
        /// Only kernel fences order access; user work syncs explicitly
        const EXPLICIT_SYNC = 1 << 2;
        /// Must be physically contiguous when placed in VRAM
        const VRAM_CONTIGUOUS = 1 << 3;
    }
}
