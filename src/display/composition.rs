//! Composition targets
//!
//! Besides its layers a display places up to two synthetic sources on
//! hardware: the client target rendered by the GPU and the "Exynos" target
//! rendered by the blitter. Each covers a contiguous run of layer indices.

use super::DisplayId;
use crate::buffer::BufferHandle;
use crate::error::AssignError;
use crate::fence::{close_opt, Fence, FenceOwner};
use crate::image::{Dataspace, ExynosImage};
use crate::layer::LayerSignature;
use crate::resource::table::SourceId;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompositionKind {
    /// Rendered by the GPU
    Client,
    /// Rendered by the 2D blitter
    Exynos,
}

#[derive(Debug)]
pub struct CompositionInfo {
    kind: CompositionKind,
    display: DisplayId,
    /// Inclusive range of covered layer indices
    range: Option<(usize, usize)>,
    window_index: Option<usize>,
    /// Source image scanned out by the window
    image: ExynosImage,
    target: Option<BufferHandle>,
    dataspace: Dataspace,
    acquire_fence: Option<Fence>,
    /// Previous frame's output is reused unchanged
    skip: bool,
    prev_signature: Option<Vec<LayerSignature>>,
}

impl CompositionInfo {
    pub fn new(kind: CompositionKind, display: DisplayId) -> Self {
        Self {
            kind,
            display,
            range: None,
            window_index: None,
            image: ExynosImage::default(),
            target: None,
            dataspace: Dataspace::SRGB,
            acquire_fence: None,
            skip: false,
            prev_signature: None,
        }
    }

    pub fn kind(&self) -> CompositionKind {
        self.kind
    }

    pub fn source_id(&self) -> SourceId {
        match self.kind {
            CompositionKind::Client => SourceId::ClientTarget(self.display),
            CompositionKind::Exynos => SourceId::ExynosTarget(self.display),
        }
    }

    fn owner(&self) -> FenceOwner {
        match self.kind {
            CompositionKind::Client => FenceOwner::ClientTarget(self.display),
            CompositionKind::Exynos => FenceOwner::ExynosTarget(self.display),
        }
    }

    pub fn has_composition_layer(&self) -> bool {
        self.range.is_some()
    }

    pub fn range(&self) -> Option<(usize, usize)> {
        self.range
    }

    pub fn first_index(&self) -> Option<usize> {
        self.range.map(|(first, _)| first)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.range.map(|(_, last)| last)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.range
            .map_or(false, |(first, last)| first <= index && index <= last)
    }

    pub fn set_range(&mut self, range: Option<(usize, usize)>) {
        self.range = range;
    }

    /// Whether both targets claim a common layer index
    pub fn overlaps(&self, other: &CompositionInfo) -> bool {
        match (self.range, other.range) {
            (Some((a0, a1)), Some((b0, b1))) => a0 <= b1 && b0 <= a1,
            _ => false,
        }
    }

    pub fn window_index(&self) -> Option<usize> {
        self.window_index
    }

    pub fn set_window_index(&mut self, window: Option<usize>) {
        self.window_index = window;
    }

    pub fn image(&self) -> &ExynosImage {
        &self.image
    }

    pub fn set_image(&mut self, image: ExynosImage) {
        self.image = image;
    }

    /// Clears what the previous assignment pass decided
    pub fn reset_pass(&mut self) {
        self.range = None;
        self.window_index = None;
    }

    pub fn target(&self) -> Option<&BufferHandle> {
        self.target.as_ref()
    }

    pub fn dataspace(&self) -> Dataspace {
        self.dataspace
    }

    /// New target buffer. A still-held fence of the previous one is closed.
    pub fn set_target(
        &mut self,
        target: Option<BufferHandle>,
        acquire: Option<Fence>,
        dataspace: Dataspace,
    ) {
        close_opt(&mut self.acquire_fence);
        self.target = target;
        self.dataspace = dataspace;
        let owner = self.owner();
        self.acquire_fence = acquire.map(|f| f.moved_to(owner));
    }

    pub fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }

    pub fn skip(&self) -> bool {
        self.skip
    }

    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    pub fn prev_signature(&self) -> Option<&[LayerSignature]> {
        self.prev_signature.as_deref()
    }

    pub fn set_prev_signature(&mut self, signature: Option<Vec<LayerSignature>>) {
        self.prev_signature = signature;
    }

    pub fn close_fences(&mut self) {
        close_opt(&mut self.acquire_fence);
    }

    /// Range bookkeeping must describe real layers
    pub fn check_range(&self, layer_count: usize) -> Result<(), AssignError> {
        match self.range {
            Some((first, last)) if first > last || last >= layer_count => {
                Err(AssignError::Invariant(format!(
                    "{:?} target range {}..={} with {} layers",
                    self.kind, first, last, layer_count
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  {:?} target: range={} win={} skip={} buffer={:?}",
            self.kind,
            self.range
                .map(|(a, b)| format!("{}..={}", a, b))
                .unwrap_or_else(|| "-".into()),
            self.window_index
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".into()),
            self.skip,
            self.target.as_ref().map(|b| b.id)
        );
        if self.range.is_some() {
            let _ = writeln!(out, "    {}", self.image);
        }
    }
}

impl Drop for CompositionInfo {
    fn drop(&mut self) {
        self.close_fences();
    }
}
