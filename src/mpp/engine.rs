//! Memory-to-memory engine collaborators
//!
//! The scaler and the 2D blitter are opaque drivers. A processing unit
//! describes one job as an [`EngineImageInfo`] whose variant matches the
//! unit's physical engine, hands it to the engine, and gets back the
//! fences of the job.

use super::PhysicalType;
use crate::display::DisplayId;
use crate::fence::{Fence, FenceFd, FenceTracker};
use crate::image::{ExynosImage, Rect};
use std::fmt;
use std::sync::Arc;

/// Scaler job: exactly one source and one destination
#[derive(Debug, Clone, PartialEq)]
pub struct ScalerImageInfo {
    pub src: ExynosImage,
    pub dst: ExynosImage,
    /// Release fence of the destination buffer from its previous use
    pub dst_wait: Option<FenceFd>,
}

/// One source of a blit job
#[derive(Debug, Clone, PartialEq)]
pub struct BlitLayerInfo {
    pub src: ExynosImage,
    /// Placement inside the destination buffer
    pub dst_rect: Rect,
}

/// Blit job: any number of z-ordered sources blended into one destination
#[derive(Debug, Clone, PartialEq)]
pub struct BlitImageInfo {
    pub layers: Vec<BlitLayerInfo>,
    pub dst: ExynosImage,
    pub dst_wait: Option<FenceFd>,
    /// Clear the destination before blending
    pub clear: bool,
}

/// Job description, tagged by the engine that understands it
#[derive(Debug, Clone, PartialEq)]
pub enum EngineImageInfo {
    Scaler(ScalerImageInfo),
    Blit(BlitImageInfo),
}

impl EngineImageInfo {
    pub fn source_count(&self) -> usize {
        match self {
            EngineImageInfo::Scaler(_) => 1,
            EngineImageInfo::Blit(blit) => blit.layers.len(),
        }
    }

    pub fn dst(&self) -> &ExynosImage {
        match self {
            EngineImageInfo::Scaler(job) => &job.dst,
            EngineImageInfo::Blit(job) => &job.dst,
        }
    }
}

/// Fences produced by a job
#[derive(Debug)]
pub struct EngineOutput {
    /// Signals when the destination is written
    pub dst_acquire: Fence,
    /// One per source, signals when the engine is done reading it
    pub src_release: Vec<Fence>,
}

/// Answer of an engine asked to take a job at some priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityStatus {
    Ready,
    /// Still busy with an in-flight request of higher priority
    Busy,
}

/// Driver of one memory-to-memory engine
pub trait M2mEngine: Send + fmt::Debug {
    /// Runs a job synchronously with respect to submission. Completion is
    /// signalled through the returned fences.
    fn execute(&mut self, info: &EngineImageInfo) -> Result<EngineOutput, String>;

    /// Asks whether a job for `display` at `priority` may start this frame
    fn request_priority(&mut self, display: DisplayId, priority: u32) -> PriorityStatus;

    /// Aborts the engine's current configuration
    fn stop(&mut self);
}

/// Creates engines for memory-to-memory units at start-up
pub trait EngineFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        physical: PhysicalType,
        unit: &str,
        tracker: Arc<FenceTracker>,
    ) -> Box<dyn M2mEngine>;
}
