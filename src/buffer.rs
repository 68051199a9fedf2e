//! Graphic buffer handles and the allocator collaborator
//!
//! Buffers are owned by gralloc (or, in tests and the simulator, by the
//! [`crate::simulated::HeapAllocator`]). The composer only ever holds
//! handles: an id, the geometry the allocation was made with, and the
//! per-plane descriptors the display controller needs.

use crate::image::PixelFormat;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque buffer identity, unique per allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Process-wide unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

bitflags! {
    /// Gralloc usage bits the composer cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BufferUsage: u64 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const GPU_TEXTURE = 1 << 8;
        const GPU_RENDER_TARGET = 1 << 9;
        const COMPOSER_OVERLAY = 1 << 11;
        const PROTECTED = 1 << 14;
        const VIDEO_ENCODER = 1 << 16;
        /// Secure-heap allocation, only reachable through the secure DMA path
        const SECURE = 1 << 28;
        /// Destination of a memory-to-memory unit
        const HW_PROCESSING = 1 << 29;
        /// Vendor interlace signalling, top field first
        const INTERLACE_TFF = 1 << 30;
        /// Vendor interlace signalling, bottom field first
        const INTERLACE_BFF = 1 << 31;
    }
}

/// Field order of interlaced video content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interlace {
    TopFieldFirst,
    BottomFieldFirst,
}

/// Handle to an allocated graphic buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    pub id: BufferId,
    pub width: u32,
    pub height: u32,
    /// Row stride in pixels
    pub stride: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// Per-plane descriptors handed to the display controller
    pub plane_fds: Vec<i32>,
    pub compressed: bool,
}

impl BufferHandle {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        let planes = format.desc().planes as usize;
        let id = BufferId::next();
        Self {
            id,
            width,
            height,
            stride: width,
            format,
            usage,
            // Synthetic plane descriptors derived from the id keep the
            // window-config diff stable across frames for the same buffer
            plane_fds: (0..planes).map(|p| (id.0 as i32) * 4 + p as i32).collect(),
            compressed: false,
        }
    }

    pub fn with_compression(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn interlace(&self) -> Option<Interlace> {
        if self.usage.contains(BufferUsage::INTERLACE_BFF) {
            Some(Interlace::BottomFieldFirst)
        } else if self.usage.contains(BufferUsage::INTERLACE_TFF) {
            Some(Interlace::TopFieldFirst)
        } else {
            None
        }
    }

    pub fn size_bytes(&self) -> u64 {
        u64::from(self.stride) * u64::from(self.height) * u64::from(self.format.bpp()) / 8
    }
}

/// Allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn matches(&self, handle: &BufferHandle) -> bool {
        self.width == handle.width
            && self.height == handle.height
            && self.format == handle.format
            && self.usage == handle.usage
    }
}

/// Buffer allocator collaborator (gralloc)
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    fn allocate(&self, desc: &BufferDescriptor) -> Result<BufferHandle, String>;

    fn free(&self, handle: BufferHandle);
}
