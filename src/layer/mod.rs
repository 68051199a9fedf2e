//! Layers
//!
//! An [`ExynosLayer`] is one visual element submitted by the display
//! server. It keeps the raw submission (buffer, crop, frame, blending...),
//! derives the pre-processed source and destination images the resource
//! manager works on, and carries the per-validate decisions: overlay
//! priority, tentative composition type, window index and the rejection
//! reasons collected from every unit that declined it.
//!
//! Which units a layer is bound to is not stored here. The binding lives in
//! the resource manager's assignment table so that both sides of the
//! relation are always updated together.

use crate::buffer::{BufferHandle, Interlace};
use crate::display::{DisplayId, DisplayInfo};
use crate::fence::{close_opt, Fence, FenceOwner};
use crate::image::{
    BlendMode, Dataspace, ExynosImage, FRect, PixelFormat, Rect, Transform,
};
use crate::mpp::{LogicalType, Rejection};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

/// Identity of a layer within its display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u32);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer{}", self.0)
    }
}

/// Order in which layers compete for resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OverlayPriority {
    /// Never placed on hardware
    None,
    Low,
    /// Wide-gamut or HDR content
    High,
    /// Protected content, wins every contention
    Max,
}

/// Composition type as spoken with the display server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionType {
    #[default]
    Invalid,
    Client,
    Device,
    SolidColor,
    Cursor,
    Sideband,
}

/// Internal composition decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValidateType {
    /// Composed by the GPU into the client target
    Client,
    /// Scanned out from its own window
    Device,
    /// Blended by the blitter into the blit composition target
    Exynos,
}

/// Why a layer ended in client composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClientReason {
    /// Requested by the display server, flagged skip, or forced by policy
    Requested,
    /// No unit combination accepted it
    NoResource,
    /// Sits between client-composited layers
    Sandwiched,
    /// Moved out of an overlapping blit composition range
    Overlap,
    /// The blit composition target could not be placed
    BlitTargetFailed,
    /// A unit it needed was busy this frame
    Busy,
    /// No window left for it
    NoWindow,
}

bitflags! {
    /// Per-layer flags from the display server
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct LayerFlags: u32 {
        /// Always composed by the client
        const SKIP = 1 << 0;
        /// Dim layer, scanned out as a solid color
        const DIM = 1 << 1;
    }
}

/// Solid color of a color layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn argb(&self) -> u32 {
        (u32::from(self.a) << 24)
            | (u32::from(self.r) << 16)
            | (u32::from(self.g) << 8)
            | u32::from(self.b)
    }
}

/// Geometry and content of a client-composited layer, compared frame to
/// frame to detect a static client composition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSignature {
    pub id: LayerId,
    pub buffer: Option<u64>,
    pub crop: Rect,
    pub frame: Rect,
    pub transform: u32,
    pub blending: BlendMode,
    pub plane_alpha: u32,
    pub z_order: u32,
}

/// One layer
#[derive(Debug)]
pub struct ExynosLayer {
    id: LayerId,
    display: DisplayId,

    // Submission
    buffer: Option<BufferHandle>,
    acquire_fence: Option<Fence>,
    source_crop: FRect,
    display_frame: Rect,
    blending: BlendMode,
    transform: Transform,
    z_order: u32,
    plane_alpha: f32,
    dataspace: Dataspace,
    color: Color,
    flags: LayerFlags,
    requested: CompositionType,

    // Derived by pre-processing
    src_img: ExynosImage,
    dst_img: ExynosImage,
    priority: OverlayPriority,

    // Decisions
    committed: CompositionType,
    validate_type: ValidateType,
    client_reason: Option<ClientReason>,
    window_index: Option<usize>,
    rejections: BTreeMap<LogicalType, Rejection>,
    overlay_info: Rejection,
    m2m_out: Option<ExynosImage>,
    release_fence: Option<Fence>,
}

impl ExynosLayer {
    pub fn new(id: LayerId, display: DisplayId) -> Self {
        Self {
            id,
            display,
            buffer: None,
            acquire_fence: None,
            source_crop: FRect::default(),
            display_frame: Rect::default(),
            blending: BlendMode::Premultiplied,
            transform: Transform::empty(),
            z_order: 0,
            plane_alpha: 1.0,
            dataspace: Dataspace::default(),
            color: Color::default(),
            flags: LayerFlags::empty(),
            requested: CompositionType::Invalid,
            src_img: ExynosImage::default(),
            dst_img: ExynosImage::default(),
            priority: OverlayPriority::Low,
            committed: CompositionType::Invalid,
            validate_type: ValidateType::Client,
            client_reason: None,
            window_index: None,
            rejections: BTreeMap::new(),
            overlay_info: Rejection::empty(),
            m2m_out: None,
            release_fence: None,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn display(&self) -> DisplayId {
        self.display
    }

    fn owner(&self) -> FenceOwner {
        FenceOwner::Layer(self.display, self.id)
    }

    /// New buffer with its acquire fence. A fence still held from an
    /// earlier submission is closed.
    pub fn set_buffer(&mut self, buffer: Option<BufferHandle>, acquire: Option<Fence>) {
        close_opt(&mut self.acquire_fence);
        self.buffer = buffer;
        let owner = self.owner();
        self.acquire_fence = acquire.map(|f| f.moved_to(owner));
    }

    pub fn set_source_crop(&mut self, crop: FRect) {
        self.source_crop = crop;
    }

    pub fn set_display_frame(&mut self, frame: Rect) {
        self.display_frame = frame;
    }

    pub fn set_blend_mode(&mut self, blending: BlendMode) {
        self.blending = blending;
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn set_z_order(&mut self, z_order: u32) {
        self.z_order = z_order;
    }

    pub fn set_plane_alpha(&mut self, alpha: f32) {
        self.plane_alpha = alpha.clamp(0.0, 1.0);
    }

    pub fn set_dataspace(&mut self, dataspace: Dataspace) {
        self.dataspace = dataspace;
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    pub fn set_flags(&mut self, flags: LayerFlags) {
        self.flags = flags;
    }

    /// Composition type the display server asks for. It is also the
    /// current type until a validate proposes another one.
    pub fn set_composition_type(&mut self, requested: CompositionType) {
        self.requested = requested;
        self.committed = requested;
    }

    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref()
    }

    pub fn source_crop(&self) -> FRect {
        self.source_crop
    }

    pub fn display_frame(&self) -> Rect {
        self.display_frame
    }

    pub fn blending(&self) -> BlendMode {
        self.blending
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn z_order(&self) -> u32 {
        self.z_order
    }

    pub fn plane_alpha(&self) -> f32 {
        self.plane_alpha
    }

    pub fn dataspace(&self) -> Dataspace {
        self.dataspace
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    pub fn requested(&self) -> CompositionType {
        self.requested
    }

    pub fn committed(&self) -> CompositionType {
        self.committed
    }

    pub fn priority(&self) -> OverlayPriority {
        self.priority
    }

    pub fn validate_type(&self) -> ValidateType {
        self.validate_type
    }

    pub fn client_reason(&self) -> Option<ClientReason> {
        self.client_reason
    }

    pub fn window_index(&self) -> Option<usize> {
        self.window_index
    }

    pub fn src_image(&self) -> &ExynosImage {
        &self.src_img
    }

    pub fn dst_image(&self) -> &ExynosImage {
        &self.dst_img
    }

    pub fn m2m_out_image(&self) -> Option<&ExynosImage> {
        self.m2m_out.as_ref()
    }

    pub fn overlay_info(&self) -> Rejection {
        self.overlay_info
    }

    pub fn rejections(&self) -> &BTreeMap<LogicalType, Rejection> {
        &self.rejections
    }

    pub fn acquire_fence(&self) -> Option<&Fence> {
        self.acquire_fence.as_ref()
    }

    pub fn take_acquire_fence(&mut self) -> Option<Fence> {
        self.acquire_fence.take()
    }

    /// Scanned out as a plain color, no buffer involved
    pub fn is_color(&self) -> bool {
        self.requested == CompositionType::SolidColor || self.flags.contains(LayerFlags::DIM)
    }

    pub fn is_cursor(&self) -> bool {
        self.requested == CompositionType::Cursor
    }

    pub fn is_protected(&self) -> bool {
        self.src_img.is_protected()
    }

    /// The display server or a flag leaves this layer no choice
    pub fn must_be_client(&self) -> bool {
        self.flags.contains(LayerFlags::SKIP)
            || matches!(
                self.requested,
                CompositionType::Client | CompositionType::Sideband | CompositionType::Invalid
            )
            || (!self.is_color() && self.buffer.is_none())
    }

    /// Derives the overlay priority and the pre-processed source and
    /// destination images from the submission.
    ///
    /// `min_dst` is the smallest output the scalers accept; protected and
    /// wide-gamut layers are grown to it so that they keep a hardware path.
    pub fn do_pre_process(&mut self, display: &DisplayInfo, min_dst: (u32, u32)) {
        let mut src = ExynosImage {
            transform: self.transform,
            blending: self.blending,
            plane_alpha: self.plane_alpha,
            dataspace: self.dataspace,
            z_order: self.z_order,
            acquire_fence: self.acquire_fence.as_ref().map(Fence::fd),
            ..ExynosImage::default()
        };

        if let Some(buffer) = &self.buffer {
            src.full_width = buffer.stride.max(buffer.width);
            src.full_height = buffer.height;
            src.format = buffer.format;
            src.usage = buffer.usage;
            src.compressed = buffer.compressed;
            src.buffer = Some(buffer.clone());

            let crop = if buffer.format.is_yuv() {
                self.source_crop.round_out()
            } else {
                self.source_crop.truncate()
            };
            src.x = crop.left;
            src.y = crop.top;
            src.w = crop.width().max(0) as u32;
            src.h = crop.height().max(0) as u32;

            if let Some(interlace) = buffer.interlace() {
                // Each field is half the frame; bottom-field-first content
                // starts one stride into the doubled line
                src.full_height /= 2;
                src.full_width = buffer.stride * 2;
                src.y /= 2;
                src.h /= 2;
                if interlace == Interlace::BottomFieldFirst {
                    src.x += buffer.stride as i32;
                }
            }
        } else {
            // Color layers read nothing; their source is their frame
            src.format = PixelFormat::Rgba8888;
            src.full_width = self.display_frame.width().max(0) as u32;
            src.full_height = self.display_frame.height().max(0) as u32;
            src.w = src.full_width;
            src.h = src.full_height;
        }

        self.priority = if self.must_be_client() {
            OverlayPriority::None
        } else if src.is_protected() {
            OverlayPriority::Max
        } else if self.dataspace.standard.is_wide_gamut() {
            OverlayPriority::High
        } else {
            OverlayPriority::Low
        };

        let mut frame = self.display_frame;
        if matches!(self.priority, OverlayPriority::Max | OverlayPriority::High) {
            frame = grow_to_minimum(frame, min_dst, display.width, display.height);
        }

        self.dst_img = ExynosImage {
            full_width: display.width,
            full_height: display.height,
            x: frame.left,
            y: frame.top,
            w: frame.width().max(0) as u32,
            h: frame.height().max(0) as u32,
            format: PixelFormat::Rgba8888,
            blending: self.blending,
            plane_alpha: self.plane_alpha,
            z_order: self.z_order,
            ..ExynosImage::default()
        };
        self.src_img = src;
    }

    /// Clears the per-pass decisions. Called at the top of every
    /// assignment pass; demotions recorded with [`ExynosLayer::demote`]
    /// survive until [`ExynosLayer::reset_validate_info`].
    pub fn reset_validate_data(&mut self) {
        self.validate_type = if self.client_reason.is_some() {
            ValidateType::Client
        } else {
            ValidateType::Device
        };
        self.window_index = None;
        self.m2m_out = None;
    }

    /// Clears everything decided during the previous validate
    pub fn reset_validate_info(&mut self) {
        self.client_reason = if self.must_be_client() {
            Some(ClientReason::Requested)
        } else {
            None
        };
        self.rejections.clear();
        self.overlay_info = Rejection::empty();
        self.reset_validate_data();
    }

    /// Sends the layer to client composition for the rest of this validate
    pub fn demote(&mut self, reason: ClientReason) {
        if self.client_reason.is_none() {
            self.client_reason = Some(reason);
        }
        self.validate_type = ValidateType::Client;
        self.window_index = None;
        self.m2m_out = None;
    }

    /// Undoes a demotion that was only needed for this frame's conflicts
    pub fn clear_demotion(&mut self) {
        if self.client_reason != Some(ClientReason::Requested) {
            self.client_reason = None;
        }
    }

    pub fn set_validate_type(&mut self, validate_type: ValidateType) {
        self.validate_type = validate_type;
        if validate_type != ValidateType::Client {
            self.client_reason = None;
        }
    }

    pub fn set_window_index(&mut self, index: Option<usize>) {
        self.window_index = index;
    }

    pub fn set_m2m_out_image(&mut self, image: Option<ExynosImage>) {
        self.m2m_out = image;
    }

    /// Records why a logical unit type declined this layer
    pub fn add_rejection(&mut self, logical: LogicalType, reason: Rejection) {
        *self.rejections.entry(logical).or_default() |= reason;
        self.overlay_info |= reason;
    }

    /// Composition type reported to the display server for the validated
    /// decision
    pub fn reported_type(&self) -> CompositionType {
        match self.validate_type {
            ValidateType::Client => CompositionType::Client,
            ValidateType::Exynos => CompositionType::Device,
            ValidateType::Device => match self.requested {
                CompositionType::SolidColor => CompositionType::SolidColor,
                CompositionType::Cursor => CompositionType::Cursor,
                _ if self.flags.contains(LayerFlags::DIM) => CompositionType::SolidColor,
                _ => CompositionType::Device,
            },
        }
    }

    /// Commits a type the display decided on top of the validated one
    pub fn commit(&mut self, committed: CompositionType) {
        self.committed = committed;
    }

    pub fn set_release_fence(&mut self, fence: Option<Fence>) {
        close_opt(&mut self.release_fence);
        let owner = self.owner();
        self.release_fence = fence.map(|f| f.moved_to(owner));
    }

    pub fn take_release_fence(&mut self) -> Option<Fence> {
        self.release_fence.take()
    }

    /// Closes every fence the layer holds
    pub fn close_fences(&mut self) {
        close_opt(&mut self.acquire_fence);
        close_opt(&mut self.release_fence);
    }

    pub fn signature(&self) -> LayerSignature {
        LayerSignature {
            id: self.id,
            buffer: self.buffer.as_ref().map(|b| b.id.0),
            crop: self.source_crop.round_out(),
            frame: self.display_frame,
            transform: self.transform.bits(),
            blending: self.blending,
            plane_alpha: (self.plane_alpha * 255.0).round() as u32,
            z_order: self.z_order,
        }
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  {} z={} {:?} prio={:?} req={:?} committed={:?} validated={:?}{} win={} info={:#x}",
            self.id,
            self.z_order,
            self.buffer.as_ref().map(|b| b.id),
            self.priority,
            self.requested,
            self.committed,
            self.validate_type,
            self.client_reason
                .map(|r| format!(" ({:?})", r))
                .unwrap_or_default(),
            self.window_index
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".into()),
            self.overlay_info.bits()
        );
        let _ = writeln!(out, "    src {}", self.src_img);
        let _ = writeln!(out, "    dst {}", self.dst_img);
        if let Some(mid) = &self.m2m_out {
            let _ = writeln!(out, "    mid {}", mid);
        }
    }
}

impl Drop for ExynosLayer {
    fn drop(&mut self) {
        self.close_fences();
    }
}

/// Grows `frame` to at least `min` on each axis and moves it back inside
/// the panel, shifting left/up instead of running past the right/bottom
/// edge
pub fn grow_to_minimum(frame: Rect, min: (u32, u32), width: u32, height: u32) -> Rect {
    fn fit(start: i32, len: i32, min: i32, limit: i32) -> (i32, i32) {
        if len >= min {
            return (start, start + len);
        }
        let len = min.min(limit);
        let mut start = start;
        if start + len > limit {
            start = limit - len;
        }
        let start = start.max(0);
        (start, start + len)
    }

    let (left, right) = fit(
        frame.left,
        frame.width(),
        min.0 as i32,
        width as i32,
    );
    let (top, bottom) = fit(
        frame.top,
        frame.height(),
        min.1 as i32,
        height as i32,
    );
    Rect::new(left, top, right, bottom)
}
