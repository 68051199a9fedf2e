//! Image descriptors and geometry helpers
//!
//! [`ExynosImage`] is the plain value every capability query and every
//! processing unit works on: a rectangle of pixels inside a backing buffer
//! plus the attributes that decide which hardware may touch it.

pub mod format;

use crate::buffer::{BufferHandle, BufferUsage};
use crate::fence::FenceFd;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use format::{
    BlendMode, ColorStandard, Dataspace, DpuFormat, PixelFormat, RestrictionClass, Transform,
};

/// Rounds `x` down to a multiple of `a`. An alignment of zero is treated
/// as no alignment.
pub fn pixel_align_down(x: u32, a: u32) -> u32 {
    if a == 0 {
        return x;
    }
    x - x % a
}

/// Rounds `x` up to a multiple of `a`. An alignment of zero is treated as
/// no alignment.
pub fn pixel_align(x: u32, a: u32) -> u32 {
    if a == 0 {
        return x;
    }
    match x % a {
        0 => x,
        rem => x + (a - rem),
    }
}

/// Signed variant of [`pixel_align_down`] used for panel coordinates
pub fn pixel_align_down_i32(x: i32, a: u32) -> i32 {
    if a == 0 {
        return x;
    }
    let a = a as i32;
    x - x.rem_euclid(a)
}

/// Integer rectangle in left/top/right/bottom form, as submitted by the
/// display server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Intersection with `other`, `None` when they do not overlap
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.left, self.top, self.right, self.bottom)
    }
}

/// Fractional source crop
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    /// Rounds outward: top/left floored, bottom/right ceiled
    pub fn round_out(&self) -> Rect {
        Rect::new(
            self.left.floor() as i32,
            self.top.floor() as i32,
            self.right.ceil() as i32,
            self.bottom.ceil() as i32,
        )
    }

    /// Truncating conversion used for RGB sources
    pub fn truncate(&self) -> Rect {
        Rect::new(
            self.left as i32,
            self.top as i32,
            self.right as i32,
            self.bottom as i32,
        )
    }
}

/// Content protection mode of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Protection {
    #[default]
    None,
    Normal,
    Secure,
}

impl Protection {
    pub fn from_usage(usage: BufferUsage) -> Self {
        if usage.contains(BufferUsage::SECURE) {
            Protection::Secure
        } else if usage.contains(BufferUsage::PROTECTED) {
            Protection::Normal
        } else {
            Protection::None
        }
    }

    pub fn is_protected(self) -> bool {
        self != Protection::None
    }
}

/// Describes a rectangular source or destination of pixels
#[derive(Debug, Clone, PartialEq)]
pub struct ExynosImage {
    /// Backing buffer dimensions
    pub full_width: u32,
    pub full_height: u32,
    /// Crop (source) or placement (destination) rectangle
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    pub buffer: Option<BufferHandle>,
    pub dataspace: Dataspace,
    pub blending: BlendMode,
    pub transform: Transform,
    pub compressed: bool,
    pub plane_alpha: f32,
    pub z_order: u32,
    /// Borrowed fence descriptors, for diagnostics only. Ownership of the
    /// fences themselves stays with the layer or unit holding them.
    pub acquire_fence: Option<FenceFd>,
    pub release_fence: Option<FenceFd>,
}

impl Default for ExynosImage {
    fn default() -> Self {
        Self {
            full_width: 0,
            full_height: 0,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::empty(),
            buffer: None,
            dataspace: Dataspace::default(),
            blending: BlendMode::None,
            transform: Transform::empty(),
            compressed: false,
            plane_alpha: 1.0,
            z_order: 0,
            acquire_fence: None,
            release_fence: None,
        }
    }
}

impl ExynosImage {
    /// Image covering a whole `width` x `height` surface
    pub fn full_surface(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            full_width: width,
            full_height: height,
            w: width,
            h: height,
            format,
            ..Self::default()
        }
    }

    pub fn restriction_class(&self) -> RestrictionClass {
        self.format.restriction_class()
    }

    pub fn protection(&self) -> Protection {
        Protection::from_usage(self.usage)
    }

    pub fn is_protected(&self) -> bool {
        self.protection().is_protected()
    }

    pub fn rect(&self) -> Rect {
        Rect::new(
            self.x,
            self.y,
            self.x + self.w as i32,
            self.y + self.h as i32,
        )
    }

    /// Width and height after applying the transform's 90 degree swap
    pub fn rotated_size(&self) -> (u32, u32) {
        if self.transform.swaps_dimensions() {
            (self.h, self.w)
        } else {
            (self.w, self.h)
        }
    }

    /// Crop lies inside the backing buffer and is not empty
    pub fn is_crop_valid(&self) -> bool {
        self.w > 0
            && self.h > 0
            && self.x >= 0
            && self.y >= 0
            && self.x as u32 + self.w <= self.full_width
            && self.y as u32 + self.h <= self.full_height
    }

    /// Compares every attribute that affects the pixels a processing unit
    /// would produce. Fences are ignored.
    pub fn same_content_as(&self, other: &ExynosImage) -> bool {
        let buffer_id = |img: &ExynosImage| img.buffer.as_ref().map(|b| b.id);
        self.full_width == other.full_width
            && self.full_height == other.full_height
            && self.x == other.x
            && self.y == other.y
            && self.w == other.w
            && self.h == other.h
            && self.format == other.format
            && self.usage == other.usage
            && buffer_id(self) == buffer_id(other)
            && self.dataspace == other.dataspace
            && self.blending == other.blending
            && self.transform == other.transform
            && self.compressed == other.compressed
            && self.plane_alpha == other.plane_alpha
            && self.z_order == other.z_order
    }
}

impl fmt::Display for ExynosImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} [{}, {}, {}x{}] {} tr={:#x} blend={:?} alpha={:.2} z={}{}{}",
            self.full_width,
            self.full_height,
            self.x,
            self.y,
            self.w,
            self.h,
            self.format,
            self.transform.bits(),
            self.blending,
            self.plane_alpha,
            self.z_order,
            if self.compressed { " afbc" } else { "" },
            match self.protection() {
                Protection::None => "",
                Protection::Normal => " drm",
                Protection::Secure => " secure",
            }
        )
    }
}
