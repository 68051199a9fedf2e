//! Processing units
//!
//! An [`ExynosMpp`] wraps one partition of a hardware block: an on-the-fly
//! DPP channel that reads a buffer during scan-out, or a logical slice of a
//! memory-to-memory engine (scaler or 2D blitter) that writes a new buffer.
//!
//! A unit answers capability queries ([`ExynosMpp::is_supported`],
//! [`ExynosMpp::is_assignable`]), keeps the ordered list of sources bound to
//! it for the current frame, executes memory-to-memory jobs and tracks
//! whether its hardware is still busy with an earlier frame. The binding of
//! sources to units is mirrored in [`crate::resource::table`]; only the
//! resource manager calls [`ExynosMpp::assign`] and
//! [`ExynosMpp::reset_assigned_state`], always together with the table.

pub mod engine;
pub(crate) mod reaper;
pub mod restriction;

use crate::buffer::{BufferAllocator, BufferDescriptor, BufferUsage};
use crate::config::{CapacityConfig, ResourceConfig};
use crate::display::{DisplayId, DisplayInfo};
use crate::error::{AssignError, MppError};
use crate::fence::{close_opt, Fence, FenceKind, FenceOwner, FenceTracker};
use crate::image::{BlendMode, ColorStandard, ExynosImage, PixelFormat, RestrictionClass, Transform};
use crate::resource::table::SourceId;
use bitflags::bitflags;
use engine::{
    BlitImageInfo, BlitLayerInfo, EngineFactory, EngineImageInfo, M2mEngine, PriorityStatus,
    ScalerImageInfo,
};
use log::{debug, warn};
use reaper::{HwRequest, MppShared, PendingFree, PrevFrame, Reaper};
use restriction::RestrictionTable;
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Silicon block a unit belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PhysicalType {
    /// Overlay DMA, RGB only
    DppG,
    /// Overlay DMA with AFBC decoding
    DppGf,
    /// Overlay DMA with YUV
    DppVg,
    /// Overlay DMA with YUV and AFBC
    DppVgf,
    /// Overlay DMA with YUV, AFBC, rotation, scaling and HDR
    DppVgrfs,
    /// Memory-to-memory scaler
    Msc,
    /// Memory-to-memory 2D blitter
    G2d,
}

impl PhysicalType {
    pub fn kind(self) -> MppKind {
        match self {
            PhysicalType::Msc | PhysicalType::G2d => MppKind::M2m,
            _ => MppKind::Otf,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PhysicalType::DppG => "DPP_G",
            PhysicalType::DppGf => "DPP_GF",
            PhysicalType::DppVg => "DPP_VG",
            PhysicalType::DppVgf => "DPP_VGF",
            PhysicalType::DppVgrfs => "DPP_VGRFS",
            PhysicalType::Msc => "MSC",
            PhysicalType::G2d => "G2D",
        }
    }

    fn default_attr(self) -> MppAttr {
        match self {
            PhysicalType::DppG => MppAttr::empty(),
            PhysicalType::DppGf => MppAttr::AFBC,
            PhysicalType::DppVg => MppAttr::YUV | MppAttr::DRM,
            PhysicalType::DppVgf => MppAttr::YUV | MppAttr::AFBC | MppAttr::DRM,
            PhysicalType::DppVgrfs => {
                MppAttr::YUV
                    | MppAttr::AFBC
                    | MppAttr::SCALE
                    | MppAttr::ROT_90
                    | MppAttr::FLIP_H
                    | MppAttr::FLIP_V
                    | MppAttr::DRM
                    | MppAttr::HDR
            }
            PhysicalType::Msc => {
                MppAttr::YUV
                    | MppAttr::SCALE
                    | MppAttr::ROT_90
                    | MppAttr::FLIP_H
                    | MppAttr::FLIP_V
                    | MppAttr::DRM
            }
            PhysicalType::G2d => {
                MppAttr::YUV
                    | MppAttr::AFBC
                    | MppAttr::SCALE
                    | MppAttr::ROT_90
                    | MppAttr::FLIP_H
                    | MppAttr::FLIP_V
                    | MppAttr::HDR
            }
        }
    }
}

/// Usage-mode partition of a physical block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LogicalType {
    DppG,
    DppGf,
    DppVg,
    DppVgf,
    DppVgrfs,
    Msc,
    /// Single-layer YUV conversion on the blitter
    G2dYuv,
    /// Single-layer RGB processing on the blitter
    G2dRgb,
    /// Multi-layer blending into the blit composition target
    G2dCombo,
}

impl LogicalType {
    pub fn name(self) -> &'static str {
        match self {
            LogicalType::DppG => "DPP_G",
            LogicalType::DppGf => "DPP_GF",
            LogicalType::DppVg => "DPP_VG",
            LogicalType::DppVgf => "DPP_VGF",
            LogicalType::DppVgrfs => "DPP_VGRFS",
            LogicalType::Msc => "MSC",
            LogicalType::G2dYuv => "G2D_YUV",
            LogicalType::G2dRgb => "G2D_RGB",
            LogicalType::G2dCombo => "G2D_COMBO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MppKind {
    /// On-the-fly: reads its source during scan-out
    Otf,
    /// Memory-to-memory: writes a new buffer
    M2m,
}

/// Index of a unit in the resource manager's inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MppId(pub usize);

bitflags! {
    /// Hardware features of a unit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    pub struct MppAttr: u32 {
        const AFBC = 1 << 0;
        const YUV = 1 << 1;
        const SCALE = 1 << 2;
        const ROT_90 = 1 << 3;
        const FLIP_H = 1 << 4;
        const FLIP_V = 1 << 5;
        const DRM = 1 << 6;
        const HDR = 1 << 7;
        /// Secure DMA channel, scanned out on the topmost window
        const SECURE_DMA = 1 << 8;
    }
}

bitflags! {
    /// Reasons a unit declined an image or a source. Capability checks stop
    /// at the first failing rule, so a check result carries one bit; the
    /// per-layer diagnostic map accumulates bits across units.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct Rejection: u32 {
        const DISABLED = 1 << 0;
        const SRC_FORMAT = 1 << 1;
        const DST_FORMAT = 1 << 2;
        const CSC = 1 << 3;
        const BLENDING = 1 << 4;
        const ROTATION = 1 << 5;
        const DRM = 1 << 6;
        const COMPRESSION = 1 << 7;
        const MIN_SRC_FULL_SIZE = 1 << 8;
        const MIN_SRC_CROP_SIZE = 1 << 9;
        const MAX_DST_SIZE = 1 << 10;
        const MIN_DST_SIZE = 1 << 11;
        const DST_ALIGN = 1 << 12;
        const MAX_DOWNSCALE = 1 << 13;
        const MAX_UPSCALE = 1 << 14;
        const MAX_SRC_FULL_SIZE = 1 << 15;
        const SRC_FULL_ALIGN = 1 << 16;
        const MAX_SRC_CROP_SIZE = 1 << 17;
        const SRC_CROP_ALIGN = 1 << 18;
        const SRC_OFFSET_ALIGN = 1 << 19;
        /// Assignment state or source slots do not allow another source
        const NOT_ASSIGNABLE = 1 << 24;
        /// Capacity budget of the physical unit is exhausted
        const CAPACITY = 1 << 25;
        /// Engine is busy with a higher priority request
        const BUSY = 1 << 26;
    }
}

/// Hardware busy state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HwState {
    Idle,
    Running,
}

/// Assignment state, as reported for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AssignStatus {
    Free,
    Reserved(DisplayId),
    Assigned(DisplayId),
}

/// Lifetime counters of a unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MppStats {
    pub jobs: u64,
    pub reused_frames: u64,
    pub buffers_allocated: u64,
    pub buffers_freed: u64,
    pub idle_transitions: u64,
    pub fence_timeouts: u64,
}

/// Time-budget model of a memory-to-memory engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CapacityModel {
    pub clock_mhz: f64,
    pub ppc_rgb: f64,
    pub ppc_yuv: f64,
}

impl CapacityModel {
    pub fn for_physical(physical: PhysicalType, config: &CapacityConfig) -> Option<Self> {
        match physical {
            PhysicalType::G2d => Some(Self {
                clock_mhz: config.g2d_clock_mhz,
                ppc_rgb: config.g2d_ppc_rgb,
                ppc_yuv: config.g2d_ppc_yuv,
            }),
            PhysicalType::Msc => Some(Self {
                clock_mhz: config.msc_clock_mhz,
                ppc_rgb: config.msc_ppc_rgb,
                ppc_yuv: config.msc_ppc_yuv,
            }),
            _ => None,
        }
    }

    /// Microseconds the engine needs to process `src` into `dst`
    pub fn required_us(&self, src: &ExynosImage, dst: &ExynosImage) -> f64 {
        let src_pixels = f64::from(src.w) * f64::from(src.h);
        let dst_pixels = f64::from(dst.w) * f64::from(dst.h);
        let ppc = match src.restriction_class() {
            RestrictionClass::Rgb => self.ppc_rgb,
            RestrictionClass::Yuv => self.ppc_yuv,
        };
        src_pixels.max(dst_pixels) / ppc / self.clock_mhz
    }
}

/// Capacity already used on a physical unit, and its budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacityPool {
    pub used_us: f64,
    pub budget_us: f64,
}

impl CapacityPool {
    pub fn unlimited() -> Self {
        Self {
            used_us: 0.0,
            budget_us: f64::INFINITY,
        }
    }
}

/// One source bound to a unit for the current frame
#[derive(Debug, Clone, PartialEq)]
pub struct MppSource {
    pub id: SourceId,
    pub src: ExynosImage,
    pub dst: ExynosImage,
}

/// Static description of a unit, produced by the SoC topology
#[derive(Debug, Clone, PartialEq)]
pub struct MppSpec {
    pub physical: PhysicalType,
    pub logical: LogicalType,
    pub physical_index: u32,
    pub logical_index: u32,
    /// Extra attributes on top of the physical type's
    pub extra_attr: MppAttr,
    pub max_sources: usize,
    /// Reserved for the primary display from start-up
    pub reserved_for_primary: bool,
    /// Destination buffers follow the display resolution
    pub resolution_pinned: bool,
}

/// Collaborators every unit is built with
#[derive(Debug, Clone)]
pub struct MppContext {
    pub tracker: Arc<FenceTracker>,
    pub allocator: Arc<dyn BufferAllocator>,
    pub engines: Arc<dyn EngineFactory>,
    pub capacity: CapacityConfig,
    pub resource: ResourceConfig,
}

/// Output of the last memory-to-memory job
#[derive(Debug)]
struct DstOutput {
    image: ExynosImage,
    acquire: Option<Fence>,
    slot: usize,
}

/// Result of [`ExynosMpp::do_post_processing`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Executed,
    /// Sources are unchanged, last frame's output is reused
    Reused,
}

/// Diagnostic snapshot of a unit
#[derive(Debug, Clone, Serialize)]
pub struct MppInfo {
    pub name: String,
    pub physical: PhysicalType,
    pub logical: LogicalType,
    pub enabled: bool,
    pub assign: AssignStatus,
    pub hw_state: HwState,
    pub sources: usize,
    pub used_capacity_us: f64,
    pub stats: MppStats,
}

/// One processing unit
#[derive(Debug)]
pub struct ExynosMpp {
    id: MppId,
    name: String,
    physical_type: PhysicalType,
    logical_type: LogicalType,
    physical_index: u32,
    logical_index: u32,
    attr: MppAttr,
    restrictions: RestrictionTable,
    max_sources: usize,
    capacity: Option<CapacityModel>,
    used_capacity_us: f64,
    enabled: bool,
    reserved_for: Option<DisplayId>,
    assigned_to: Option<DisplayId>,
    prev_assigned: Option<DisplayId>,
    reserved_for_primary: bool,
    resolution_pinned: bool,
    sources: Vec<MppSource>,
    engine: Option<Box<dyn M2mEngine>>,
    dst_index: usize,
    src_release: Vec<Option<Fence>>,
    dst_output: Option<DstOutput>,
    tracker: Arc<FenceTracker>,
    shared: Arc<MppShared>,
    reaper: Reaper,
}

impl ExynosMpp {
    pub fn new(id: MppId, spec: &MppSpec, ctx: &MppContext) -> Self {
        let kind = spec.physical.kind();
        let name = match kind {
            MppKind::Otf => format!("{}{}", spec.physical.name(), spec.physical_index),
            MppKind::M2m => format!(
                "{}{}_{}{}",
                spec.physical.name(),
                spec.physical_index,
                spec.logical.name(),
                spec.logical_index
            ),
        };
        let (engine, allocator) = match kind {
            MppKind::Otf => (None, None),
            MppKind::M2m => (
                Some(ctx.engines.create(spec.physical, &name, Arc::clone(&ctx.tracker))),
                Some(Arc::clone(&ctx.allocator)),
            ),
        };
        let shared = Arc::new(MppShared::new(
            name.clone(),
            ctx.resource.dst_buffer_count,
            allocator,
            Duration::from_millis(ctx.resource.fence_wait_timeout_ms),
        ));
        let reaper = Reaper::spawn(Arc::clone(&shared));
        debug!("created processing unit {}", name);

        Self {
            id,
            name,
            physical_type: spec.physical,
            logical_type: spec.logical,
            physical_index: spec.physical_index,
            logical_index: spec.logical_index,
            attr: spec.physical.default_attr() | spec.extra_attr,
            restrictions: RestrictionTable::for_physical(spec.physical),
            max_sources: spec.max_sources.max(1),
            capacity: CapacityModel::for_physical(spec.physical, &ctx.capacity),
            used_capacity_us: 0.0,
            enabled: true,
            reserved_for: None,
            assigned_to: None,
            prev_assigned: None,
            reserved_for_primary: spec.reserved_for_primary,
            resolution_pinned: spec.resolution_pinned,
            sources: Vec::new(),
            engine,
            dst_index: 0,
            src_release: Vec::new(),
            dst_output: None,
            tracker: Arc::clone(&ctx.tracker),
            shared,
            reaper,
        }
    }

    pub fn id(&self) -> MppId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the physical block, shared by every logical partition
    pub fn physical_name(&self) -> String {
        format!("{}{}", self.physical_type.name(), self.physical_index)
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.physical_type
    }

    pub fn logical_type(&self) -> LogicalType {
        self.logical_type
    }

    pub fn physical_index(&self) -> u32 {
        self.physical_index
    }

    pub fn logical_index(&self) -> u32 {
        self.logical_index
    }

    pub fn kind(&self) -> MppKind {
        self.physical_type.kind()
    }

    pub fn is_otf(&self) -> bool {
        self.kind() == MppKind::Otf
    }

    pub fn is_m2m(&self) -> bool {
        self.kind() == MppKind::M2m
    }

    pub fn attr(&self) -> MppAttr {
        self.attr
    }

    pub fn is_secure_dma(&self) -> bool {
        self.attr.contains(MppAttr::SECURE_DMA)
    }

    pub fn restrictions(&self) -> &RestrictionTable {
        &self.restrictions
    }

    pub fn max_sources(&self) -> usize {
        self.max_sources
    }

    pub fn sources(&self) -> &[MppSource] {
        &self.sources
    }

    pub fn capacity_model(&self) -> Option<&CapacityModel> {
        self.capacity.as_ref()
    }

    pub fn used_capacity_us(&self) -> f64 {
        self.used_capacity_us
    }

    pub fn reserved_for_primary(&self) -> bool {
        self.reserved_for_primary
    }

    pub fn resolution_pinned(&self) -> bool {
        self.resolution_pinned
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Administrative enable/disable. A disabled unit rejects everything.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            debug!("{}: {}", self.name, if enabled { "enabled" } else { "disabled" });
        }
        self.enabled = enabled;
    }

    pub fn assigned_display(&self) -> Option<DisplayId> {
        self.assigned_to
    }

    pub fn reserved_display(&self) -> Option<DisplayId> {
        self.reserved_for
    }

    pub fn assign_status(&self) -> AssignStatus {
        match (self.assigned_to, self.reserved_for) {
            (Some(display), _) => AssignStatus::Assigned(display),
            (None, Some(display)) => AssignStatus::Reserved(display),
            (None, None) => AssignStatus::Free,
        }
    }

    pub fn reserve(&mut self, display: DisplayId) {
        self.reserved_for = Some(display);
    }

    pub fn cancel_reservation(&mut self) {
        self.reserved_for = None;
    }

    pub fn hw_state(&self) -> HwState {
        self.shared.hw.lock().state
    }

    pub fn stats(&self) -> MppStats {
        self.shared.hw.lock().stats
    }

    /// Formats the unit can read
    fn supports_src_format(&self, format: PixelFormat) -> bool {
        match self.physical_type {
            PhysicalType::DppG | PhysicalType::DppGf => matches!(
                format,
                PixelFormat::Rgba8888
                    | PixelFormat::Rgbx8888
                    | PixelFormat::Bgra8888
                    | PixelFormat::Rgb565
            ),
            PhysicalType::DppVg => matches!(
                format,
                PixelFormat::Rgba8888
                    | PixelFormat::Rgbx8888
                    | PixelFormat::Bgra8888
                    | PixelFormat::Rgb565
                    | PixelFormat::Nv12
                    | PixelFormat::Nv21
                    | PixelFormat::Nv12M
            ),
            PhysicalType::DppVgf | PhysicalType::DppVgrfs => {
                // Three-plane layouts and half-float need a conversion
                !matches!(
                    format,
                    PixelFormat::Yv12 | PixelFormat::I420 | PixelFormat::RgbaFp16 | PixelFormat::Rgb888
                ) && (self.physical_type == PhysicalType::DppVgrfs || !format.is_sbwc())
            }
            PhysicalType::Msc => !matches!(
                format,
                PixelFormat::RgbaFp16 | PixelFormat::Rgba1010102 | PixelFormat::Nv12MSbwc
            ),
            PhysicalType::G2d => true,
        }
    }

    /// Formats the unit can write. On-the-fly units feed the blender and
    /// have no destination format of their own.
    fn supports_dst_format(&self, format: PixelFormat) -> bool {
        match self.physical_type {
            PhysicalType::Msc => matches!(
                format,
                PixelFormat::Rgba8888 | PixelFormat::Rgbx8888 | PixelFormat::Nv12M | PixelFormat::Nv12
            ),
            PhysicalType::G2d => matches!(
                format,
                PixelFormat::Rgba8888
                    | PixelFormat::Rgbx8888
                    | PixelFormat::Bgra8888
                    | PixelFormat::Rgba1010102
                    | PixelFormat::Nv12M
            ),
            _ => true,
        }
    }

    fn supports_blending(&self, src: &ExynosImage) -> bool {
        match self.physical_type {
            PhysicalType::Msc => src.blending != BlendMode::Coverage,
            _ => true,
        }
    }

    fn supports_csc(&self, src: &ExynosImage, dst: &ExynosImage) -> bool {
        if src.dataspace.is_hdr() && !self.attr.contains(MppAttr::HDR) {
            return false;
        }
        if src.format.is_yuv() == dst.format.is_yuv() && self.is_m2m() {
            return true;
        }
        if self.is_otf() && src.format.is_rgb() {
            return true;
        }
        let standard = src.dataspace.standard;
        standard == ColorStandard::Unspecified || standard.has_csc_matrix()
    }

    fn supports_transform(&self, transform: Transform) -> bool {
        (!transform.contains(Transform::ROT_90) || self.attr.contains(MppAttr::ROT_90))
            && (!transform.contains(Transform::FLIP_H) || self.attr.contains(MppAttr::FLIP_H))
            && (!transform.contains(Transform::FLIP_V) || self.attr.contains(MppAttr::FLIP_V))
    }

    /// Capability check of `src` processed into `dst`. Rules are evaluated
    /// in a fixed order and the first failing one is returned.
    pub fn is_supported(
        &self,
        display: &DisplayInfo,
        src: &ExynosImage,
        dst: &ExynosImage,
    ) -> Result<(), Rejection> {
        let result = self.check_support(src, dst);
        if let Err(reason) = result {
            log::trace!(
                "{}: {} rejected {} -> {}: {:?}",
                display.id,
                self.name,
                src,
                dst,
                reason
            );
        }
        result
    }

    fn check_support(&self, src: &ExynosImage, dst: &ExynosImage) -> Result<(), Rejection> {
        fn reject(failed: bool, bit: Rejection) -> Result<(), Rejection> {
            if failed {
                Err(bit)
            } else {
                Ok(())
            }
        }

        reject(!self.enabled, Rejection::DISABLED)?;
        reject(!self.supports_src_format(src.format), Rejection::SRC_FORMAT)?;
        reject(!self.supports_dst_format(dst.format), Rejection::DST_FORMAT)?;
        reject(!self.supports_csc(src, dst), Rejection::CSC)?;
        reject(!self.supports_blending(src), Rejection::BLENDING)?;
        reject(!self.supports_transform(src.transform), Rejection::ROTATION)?;
        reject(
            src.is_protected() && !self.attr.contains(MppAttr::DRM),
            Rejection::DRM,
        )?;
        reject(
            src.compressed && !self.attr.contains(MppAttr::AFBC),
            Rejection::COMPRESSION,
        )?;

        let src_class = src.restriction_class();
        let dst_class = dst.restriction_class();
        let src_limits = self.restrictions.src(src_class);
        let dst_limits = self.restrictions.dst(dst_class);
        let rotated = src.transform.swaps_dimensions();

        reject(
            src.full_width < src_limits.min_full_width
                || src.full_height < src_limits.min_full_height,
            Rejection::MIN_SRC_FULL_SIZE,
        )?;
        reject(
            src.w < src_limits.min_crop_width || src.h < src_limits.min_crop_height,
            Rejection::MIN_SRC_CROP_SIZE,
        )?;

        let (max_dst_w, max_dst_h) = if rotated {
            (dst_limits.max_crop_height, dst_limits.max_crop_width)
        } else {
            (dst_limits.max_crop_width, dst_limits.max_crop_height)
        };
        reject(dst.w > max_dst_w || dst.h > max_dst_h, Rejection::MAX_DST_SIZE)?;
        reject(
            dst.w < dst_limits.min_crop_width || dst.h < dst_limits.min_crop_height,
            Rejection::MIN_DST_SIZE,
        )?;
        reject(
            !aligned_i32(dst.x, dst_limits.crop_x_align)
                || !aligned_i32(dst.y, dst_limits.crop_y_align)
                || !aligned(dst.w, dst_limits.crop_width_align)
                || !aligned(dst.h, dst_limits.crop_height_align),
            Rejection::DST_ALIGN,
        )?;

        // Scale ratios compare the source against the destination as seen
        // after rotation
        let (src_w, src_h) = src.rotated_size();
        let (src_w, src_h) = (u64::from(src_w), u64::from(src_h));
        let (dst_w, dst_h) = (u64::from(dst.w), u64::from(dst.h));
        let max_down = u64::from(self.restrictions.max_downscale(src_class));
        let max_up = u64::from(self.restrictions.max_upscale(src_class));
        reject(
            src_w > dst_w * max_down || src_h > dst_h * max_down,
            Rejection::MAX_DOWNSCALE,
        )?;
        reject(
            dst_w > src_w * max_up || dst_h > src_h * max_up,
            Rejection::MAX_UPSCALE,
        )?;

        // Protected buffers come from the secure heap, whose allocations
        // already satisfy the remaining constraints
        if !src.is_protected() {
            reject(
                src.full_width > src_limits.max_full_width
                    || src.full_height > src_limits.max_full_height,
                Rejection::MAX_SRC_FULL_SIZE,
            )?;
            reject(
                !aligned(src.full_width, src_limits.full_width_align)
                    || !aligned(src.full_height, src_limits.full_height_align),
                Rejection::SRC_FULL_ALIGN,
            )?;
            reject(
                src.w > src_limits.max_crop_width || src.h > src_limits.max_crop_height,
                Rejection::MAX_SRC_CROP_SIZE,
            )?;
            reject(
                !aligned(src.w, src_limits.crop_width_align)
                    || !aligned(src.h, src_limits.crop_height_align),
                Rejection::SRC_CROP_ALIGN,
            )?;
            reject(
                !aligned_i32(src.x, src_limits.crop_x_align)
                    || !aligned_i32(src.y, src_limits.crop_y_align),
                Rejection::SRC_OFFSET_ALIGN,
            )?;
        }

        Ok(())
    }

    /// Capacity a source would add to this unit's physical pool
    pub fn required_capacity_us(&self, src: &ExynosImage, dst: &ExynosImage) -> f64 {
        self.capacity
            .as_ref()
            .map_or(0.0, |model| model.required_us(src, dst))
    }

    /// Whether the assignment state admits another source from `display`
    pub fn is_assignable_state(&self, display: DisplayId) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(reserved) = self.reserved_for {
            if reserved != display {
                return false;
            }
        }
        match self.assigned_to {
            Some(assigned) => assigned == display && self.sources.len() < self.max_sources,
            None => {
                // Hardware still running a previous frame may only be
                // picked up again by the display that started it
                self.hw_state() == HwState::Idle
                    || self.prev_assigned == Some(display)
                    || self.reserved_for == Some(display)
            }
        }
    }

    /// Whether `src`/`dst` can be added now: the assignment state allows it
    /// and the physical unit has budget left
    pub fn is_assignable(
        &self,
        display: &DisplayInfo,
        src: &ExynosImage,
        dst: &ExynosImage,
        pool: &CapacityPool,
    ) -> Result<(), Rejection> {
        if !self.is_assignable_state(display.id) {
            return Err(Rejection::NOT_ASSIGNABLE);
        }
        let required = self.required_capacity_us(src, dst);
        if pool.used_us + required > pool.budget_us {
            debug!(
                "{}: {} capacity exceeded ({:.1} + {:.1} > {:.1} us)",
                display.id, self.name, pool.used_us, required, pool.budget_us
            );
            return Err(Rejection::CAPACITY);
        }
        Ok(())
    }

    /// Binds a source for this frame. Sources are kept in z-order when the
    /// unit blends several of them.
    pub fn assign(&mut self, display: DisplayId, source: MppSource) -> Result<(), AssignError> {
        if self.sources.iter().any(|s| s.id == source.id) {
            return Err(AssignError::Invariant(format!(
                "{} assigned twice to {}",
                source.id, self.name
            )));
        }
        if let Some(assigned) = self.assigned_to {
            if assigned != display {
                return Err(AssignError::Invariant(format!(
                    "{} already serves {} and cannot take {}",
                    self.name, assigned, display
                )));
            }
        }
        if self.sources.len() >= self.max_sources {
            return Err(AssignError::Invariant(format!(
                "{} has no free source slot",
                self.name
            )));
        }

        self.used_capacity_us += self.required_capacity_us(&source.src, &source.dst);
        self.sources.push(source);
        if self.max_sources > 1 {
            self.sources.sort_by_key(|s| s.src.z_order);
        }
        self.assigned_to = Some(display);
        Ok(())
    }

    /// Detaches `source`, or every source when `None`. Returns how many
    /// were removed. The unit becomes free once the last one is gone.
    pub fn reset_assigned_state(&mut self, source: Option<&SourceId>) -> usize {
        let before = self.sources.len();
        match source {
            Some(id) => self.sources.retain(|s| &s.id != id),
            None => self.sources.clear(),
        }
        let removed = before - self.sources.len();

        self.used_capacity_us = match &self.capacity {
            Some(model) => self
                .sources
                .iter()
                .map(|s| model.required_us(&s.src, &s.dst))
                .sum(),
            None => 0.0,
        };

        if self.sources.is_empty() {
            if self.assigned_to.is_some() {
                self.prev_assigned = self.assigned_to;
            }
            self.assigned_to = None;
        }
        removed
    }

    /// Remembers `display` as the last user without any source bound,
    /// used after a frame was presented
    pub fn set_prev_assigned(&mut self, display: Option<DisplayId>) {
        self.prev_assigned = display;
    }

    /// Asks the engine whether a job may start this frame
    pub fn request_priority(&mut self, display: DisplayId, priority: u32) -> PriorityStatus {
        match self.engine.as_mut() {
            Some(engine) => engine.request_priority(display, priority),
            None => PriorityStatus::Ready,
        }
    }

    /// Marks the hardware running. `fence` signals when the job (or the
    /// scan-out) that started it completes.
    pub fn request_running(&mut self, fence: Option<Fence>) {
        {
            let mut hw = self.shared.hw.lock();
            hw.state = HwState::Running;
            hw.generation += 1;
        }
        if let Some(fence) = fence {
            self.set_hw_state_fence(fence);
        }
    }

    /// Queues a completion fence the worker waits on before going idle
    pub fn set_hw_state_fence(&mut self, fence: Fence) {
        let fence = fence.moved_to(FenceOwner::Reaper(self.name.clone()));
        fence.allow_pending();
        self.shared.push_hw(HwRequest::Fence(fence));
        if !self.reaper.is_running() {
            self.reaper.flush();
        }
    }

    /// Requests the idle state. It is reached once every queued
    /// completion fence has signaled.
    pub fn request_idle(&mut self) {
        let generation = self.shared.hw.lock().generation;
        self.shared.push_hw(HwRequest::Idle { generation });
        if !self.reaper.is_running() {
            self.reaper.flush();
        }
    }

    /// Blocks until the worker has processed every queued request
    pub fn wait_reaper_drained(&self, timeout: Duration) -> bool {
        self.shared.wait_drained(timeout)
    }

    /// Keep destination buffers across idle transitions
    pub fn set_retain_buffers(&mut self, retain: bool) {
        self.shared.hw.lock().retain_buffers = retain;
    }

    /// Handle through which the reallocation worker swaps this unit's
    /// destination buffers
    pub fn dst_ring(&self) -> DstRing {
        DstRing {
            shared: Arc::clone(&self.shared),
        }
    }

    fn close_fences(fences: Vec<Option<Fence>>) {
        for mut fence in fences {
            close_opt(&mut fence);
        }
    }

    /// Compares the bound sources and the requested output with the last
    /// executed job
    fn can_use_prev_frame(&self, prev: &PrevFrame, dst: &ExynosImage) -> bool {
        prev.sources.len() == self.sources.len()
            && prev
                .sources
                .iter()
                .zip(&self.sources)
                .all(|((src, dst), cur)| src.same_content_as(&cur.src) && dst.same_content_as(&cur.dst))
            && prev.dst.full_width == dst.full_width
            && prev.dst.full_height == dst.full_height
            && prev.dst.format == dst.format
    }

    /// Executes the frame's job on a memory-to-memory unit.
    ///
    /// `acquire` carries one optional acquire fence per bound source, in
    /// source order. Every fence passed in is closed before returning, on
    /// success and on failure. On success the source release fences and
    /// the destination image become available through
    /// [`ExynosMpp::take_src_release_fence`] and
    /// [`ExynosMpp::take_dst_image`].
    pub fn do_post_processing(
        &mut self,
        acquire: Vec<Option<Fence>>,
        dst: &ExynosImage,
        skip_unchanged: bool,
    ) -> Result<JobOutcome, MppError> {
        self.src_release.clear();
        self.dst_output = None;

        if self.engine.is_none() {
            Self::close_fences(acquire);
            return Err(MppError::InvalidState {
                unit: self.name.clone(),
                reason: "not a memory-to-memory unit".into(),
            });
        }
        if self.sources.is_empty() || acquire.len() != self.sources.len() {
            let reason = format!(
                "{} acquire fences for {} sources",
                acquire.len(),
                self.sources.len()
            );
            Self::close_fences(acquire);
            return Err(MppError::InvalidState {
                unit: self.name.clone(),
                reason,
            });
        }

        let mut usage = BufferUsage::HW_PROCESSING;
        if self.sources.iter().any(|s| s.src.is_protected()) {
            usage |= BufferUsage::PROTECTED;
        }
        let desc = BufferDescriptor {
            width: dst.full_width,
            height: dst.full_height,
            format: dst.format,
            usage,
        };

        let mut hw = self.shared.hw.lock();

        if skip_unchanged {
            let reusable = hw.prev_frame.as_ref().and_then(|prev| {
                let buffer = hw.dst_bufs.get(prev.slot)?.buffer.clone()?;
                self.can_use_prev_frame(prev, dst).then(|| (prev.slot, buffer))
            });
            if let Some((slot, buffer)) = reusable {
                hw.stats.reused_frames += 1;
                drop(hw);
                debug!("{}: sources unchanged, reusing slot {}", self.name, slot);
                Self::close_fences(acquire);
                let mut image = dst.clone();
                image.usage = usage;
                image.buffer = Some(buffer);
                self.src_release = (0..self.sources.len()).map(|_| None).collect();
                self.dst_output = Some(DstOutput {
                    image,
                    acquire: None,
                    slot,
                });
                return Ok(JobOutcome::Reused);
            }
        }

        let ring = hw.dst_bufs.len();
        if ring == 0 {
            drop(hw);
            Self::close_fences(acquire);
            return Err(MppError::InvalidState {
                unit: self.name.clone(),
                reason: "no destination buffer ring".into(),
            });
        }
        let slot = (self.dst_index + 1) % ring;
        self.dst_index = slot;

        let needs_alloc = hw.dst_bufs[slot]
            .buffer
            .as_ref()
            .map_or(true, |b| !desc.matches(b));
        if needs_alloc {
            if let Some(old) = hw.dst_bufs[slot].buffer.take() {
                let fence = hw.dst_bufs[slot].release_fence.take();
                self.shared.push_free(PendingFree { buffer: old, fence });
            }
            let allocated = match &self.shared.allocator {
                Some(allocator) => allocator.allocate(&desc),
                None => Err("no allocator".to_string()),
            };
            match allocated {
                Ok(buffer) => {
                    hw.stats.buffers_allocated += 1;
                    hw.dst_bufs[slot].buffer = Some(buffer);
                }
                Err(reason) => {
                    hw.prev_frame = None;
                    drop(hw);
                    Self::close_fences(acquire);
                    return Err(MppError::Allocation {
                        unit: self.name.clone(),
                        reason,
                    });
                }
            }
        }
        let buffer = hw.dst_bufs[slot].buffer.clone();
        let dst_wait = hw.dst_bufs[slot].release_fence.take();
        drop(hw);

        let mut dst_image = dst.clone();
        dst_image.usage = usage;
        dst_image.buffer = buffer;
        dst_image.release_fence = dst_wait.as_ref().map(Fence::fd);
        dst_image.acquire_fence = None;

        let info = match self.physical_type {
            PhysicalType::Msc => {
                let mut src = self.sources[0].src.clone();
                src.acquire_fence = acquire[0].as_ref().map(Fence::fd);
                EngineImageInfo::Scaler(ScalerImageInfo {
                    src,
                    dst: dst_image.clone(),
                    dst_wait: dst_image.release_fence,
                })
            }
            _ => EngineImageInfo::Blit(BlitImageInfo {
                layers: self
                    .sources
                    .iter()
                    .zip(&acquire)
                    .map(|(s, fence)| {
                        let mut src = s.src.clone();
                        src.acquire_fence = fence.as_ref().map(Fence::fd);
                        BlitLayerInfo {
                            src,
                            dst_rect: s.dst.rect(),
                        }
                    })
                    .collect(),
                dst: dst_image.clone(),
                dst_wait: dst_image.release_fence,
                clear: self.logical_type == LogicalType::G2dCombo,
            }),
        };

        let result = match self.engine.as_mut() {
            Some(engine) => engine.execute(&info),
            None => Err("engine missing".to_string()),
        };

        // The driver holds its own references from here on
        let mut dst_wait = dst_wait;
        close_opt(&mut dst_wait);
        Self::close_fences(acquire);

        let output = match result {
            Ok(output) => output,
            Err(reason) => {
                warn!("{}: engine failed: {}", self.name, reason);
                self.shared.hw.lock().prev_frame = None;
                return Err(MppError::Engine {
                    unit: self.name.clone(),
                    reason,
                });
            }
        };

        let engine::EngineOutput {
            dst_acquire,
            src_release,
        } = output;
        let owner = FenceOwner::Mpp(self.name.clone());
        let hw_fence = dst_acquire.dup(FenceKind::HwState, owner.clone());
        self.request_running(Some(hw_fence));

        {
            let mut hw = self.shared.hw.lock();
            hw.stats.jobs += 1;
            hw.prev_frame = Some(PrevFrame {
                sources: self
                    .sources
                    .iter()
                    .map(|s| (s.src.clone(), s.dst.clone()))
                    .collect(),
                dst: dst.clone(),
                slot,
            });
        }

        self.src_release = src_release
            .into_iter()
            .map(|f| Some(f.moved_to(owner.clone())))
            .collect();
        self.src_release.resize_with(self.sources.len(), || None);
        dst_image.acquire_fence = Some(dst_acquire.fd());
        self.dst_output = Some(DstOutput {
            image: dst_image,
            acquire: Some(dst_acquire.moved_to(owner)),
            slot,
        });
        Ok(JobOutcome::Executed)
    }

    /// Release fence of source `index` of the last job. Only meaningful
    /// after [`ExynosMpp::do_post_processing`] returned for this frame.
    pub fn take_src_release_fence(&mut self, index: usize) -> Option<Fence> {
        self.src_release.get_mut(index).and_then(Option::take)
    }

    /// Destination image of the last job and the fence that signals when
    /// it is written. Only meaningful after
    /// [`ExynosMpp::do_post_processing`] returned for this frame.
    pub fn take_dst_image(&mut self) -> Option<(ExynosImage, Option<Fence>)> {
        let output = self.dst_output.as_mut()?;
        let image = output.image.clone();
        Some((image, output.acquire.take()))
    }

    /// Attaches the fence of the destination's reader (display scan-out)
    /// to the slot written last. The slot is not rewritten before it
    /// signals.
    pub fn set_dst_release_fence(&mut self, fence: Fence) {
        let Some(slot) = self.dst_output.as_ref().map(|o| o.slot) else {
            fence.close();
            return;
        };
        let fence = fence.moved_to(FenceOwner::Mpp(self.name.clone()));
        fence.allow_pending();
        let mut hw = self.shared.hw.lock();
        if let Some(entry) = hw.dst_bufs.get_mut(slot) {
            close_opt(&mut entry.release_fence);
            entry.release_fence = Some(fence);
        } else {
            drop(hw);
            fence.close();
        }
    }

    /// Drops per-frame outputs that nobody collected
    pub fn clear_frame_outputs(&mut self) {
        for mut fence in self.src_release.drain(..) {
            close_opt(&mut fence);
        }
        if let Some(mut output) = self.dst_output.take() {
            close_opt(&mut output.acquire);
        }
    }

    pub fn info(&self) -> MppInfo {
        let hw = self.shared.hw.lock();
        MppInfo {
            name: self.name.clone(),
            physical: self.physical_type,
            logical: self.logical_type,
            enabled: self.enabled,
            assign: self.assign_status(),
            hw_state: hw.state,
            sources: self.sources.len(),
            used_capacity_us: self.used_capacity_us,
            stats: hw.stats,
        }
    }

    pub fn dump(&self, out: &mut String) {
        let info = self.info();
        let _ = writeln!(
            out,
            "  {} {:?} {:?} {:?} sources={}/{} capacity={:.1}us jobs={} reused={} freed={}{}",
            info.name,
            info.logical,
            info.assign,
            info.hw_state,
            info.sources,
            self.max_sources,
            info.used_capacity_us,
            info.stats.jobs,
            info.stats.reused_frames,
            info.stats.buffers_freed,
            if self.enabled { "" } else { " disabled" }
        );
        for source in &self.sources {
            let _ = writeln!(out, "    {} src {} dst {}", source.id, source.src, source.dst);
        }
    }
}

impl fmt::Display for ExynosMpp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Drop for ExynosMpp {
    fn drop(&mut self) {
        self.clear_frame_outputs();
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        let buffers: Vec<_> = {
            let mut hw = self.shared.hw.lock();
            hw.dst_bufs
                .iter_mut()
                .filter_map(|slot| {
                    close_opt(&mut slot.release_fence);
                    slot.buffer.take()
                })
                .collect()
        };
        if let Some(allocator) = &self.shared.allocator {
            for buffer in buffers {
                allocator.free(buffer);
            }
        }
        debug!("{}: destroyed ({} fences open)", self.name, self.tracker.stats().open());
    }
}

/// Handle on a unit's destination ring, usable from another thread
#[derive(Debug, Clone)]
pub struct DstRing {
    shared: Arc<MppShared>,
}

impl DstRing {
    pub fn unit(&self) -> &str {
        &self.shared.name
    }

    /// Replaces every destination buffer with one matching `desc`. Old
    /// buffers are freed by the unit's worker once their readers are done.
    /// Returns how many buffers were allocated.
    pub fn reallocate(&self, desc: &BufferDescriptor) -> Result<usize, MppError> {
        let allocator = self.shared.allocator.as_ref().ok_or_else(|| MppError::InvalidState {
            unit: self.shared.name.clone(),
            reason: "not a memory-to-memory unit".into(),
        })?;

        let mut hw = self.shared.hw.lock();
        let mut allocated = 0;
        for index in 0..hw.dst_bufs.len() {
            if hw.dst_bufs[index]
                .buffer
                .as_ref()
                .map_or(false, |b| desc.matches(b))
            {
                continue;
            }
            let buffer = allocator
                .allocate(desc)
                .map_err(|reason| MppError::Allocation {
                    unit: self.shared.name.clone(),
                    reason,
                })?;
            let slot = &mut hw.dst_bufs[index];
            if let Some(old) = slot.buffer.replace(buffer) {
                let fence = slot.release_fence.take();
                self.shared.push_free(PendingFree { buffer: old, fence });
            }
            allocated += 1;
        }
        hw.stats.buffers_allocated += allocated as u64;
        hw.prev_frame = None;
        hw.retain_buffers = true;
        Ok(allocated)
    }

    /// Buffers currently backing the ring
    pub fn allocated(&self) -> usize {
        self.shared
            .hw
            .lock()
            .dst_bufs
            .iter()
            .filter(|slot| slot.buffer.is_some())
            .count()
    }
}

fn aligned(value: u32, align: u32) -> bool {
    align <= 1 || value % align == 0
}

fn aligned_i32(value: i32, align: u32) -> bool {
    align <= 1 || value.rem_euclid(align as i32) == 0
}

#[cfg(test)]
mod tests;
