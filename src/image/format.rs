//! Pixel formats, dataspaces, transforms and blend modes
//!
//! The buffer format enumeration used by gralloc and the format codes the
//! display controller understands are different enumerations; the table in
//! this module is the single place where one is translated into the other.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Buffer pixel formats (gralloc side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8888,
    Rgbx8888,
    Rgb888,
    Rgb565,
    Bgra8888,
    Rgba1010102,
    RgbaFp16,
    /// YCbCr 4:2:0 semi-planar, single allocation
    Nv12,
    /// YCrCb 4:2:0 semi-planar
    Nv21,
    /// YCbCr 4:2:0 semi-planar, one allocation per plane
    Nv12M,
    /// YCbCr 4:2:0 semi-planar, 10 bit per component
    P010,
    /// YCbCr 4:2:0 semi-planar with bandwidth compression
    Nv12MSbwc,
    Yv12,
    I420,
}

/// Restriction classification of an image. Every hardware size and
/// alignment table exists once per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestrictionClass {
    Rgb = 0,
    Yuv = 1,
}

impl RestrictionClass {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Display-controller pixel format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum DpuFormat {
    Argb8888 = 0,
    Abgr8888 = 1,
    Rgba8888 = 2,
    Bgra8888 = 3,
    Xrgb8888 = 4,
    Xbgr8888 = 5,
    Rgbx8888 = 6,
    Bgrx8888 = 7,
    Rgb565 = 13,
    Abgr2101010 = 16,
    Rgba1010102 = 17,
    Nv12 = 22,
    Nv21 = 23,
    Nv12M = 24,
    Yuv420 = 26,
    Yvu420 = 27,
    Nv12MP010 = 32,
    Nv12MSbwc = 40,
}

/// Static description of a buffer format
#[derive(Debug, Clone, Copy)]
pub struct FormatDesc {
    pub format: PixelFormat,
    pub name: &'static str,
    pub class: RestrictionClass,
    /// Bits per pixel summed over all planes
    pub bpp: u32,
    pub planes: u32,
    pub ten_bit: bool,
    pub sbwc: bool,
    /// Display-controller code, when the controller can scan the format out
    pub dpu: Option<DpuFormat>,
}

const FORMAT_TABLE: &[FormatDesc] = &[
    FormatDesc { format: PixelFormat::Rgba8888, name: "RGBA_8888", class: RestrictionClass::Rgb, bpp: 32, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Abgr8888) },
    FormatDesc { format: PixelFormat::Rgbx8888, name: "RGBX_8888", class: RestrictionClass::Rgb, bpp: 32, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Xbgr8888) },
    FormatDesc { format: PixelFormat::Rgb888, name: "RGB_888", class: RestrictionClass::Rgb, bpp: 24, planes: 1, ten_bit: false, sbwc: false, dpu: None },
    FormatDesc { format: PixelFormat::Rgb565, name: "RGB_565", class: RestrictionClass::Rgb, bpp: 16, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Rgb565) },
    FormatDesc { format: PixelFormat::Bgra8888, name: "BGRA_8888", class: RestrictionClass::Rgb, bpp: 32, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Argb8888) },
    FormatDesc { format: PixelFormat::Rgba1010102, name: "RGBA_1010102", class: RestrictionClass::Rgb, bpp: 32, planes: 1, ten_bit: true, sbwc: false, dpu: Some(DpuFormat::Abgr2101010) },
    FormatDesc { format: PixelFormat::RgbaFp16, name: "RGBA_FP16", class: RestrictionClass::Rgb, bpp: 64, planes: 1, ten_bit: false, sbwc: false, dpu: None },
    FormatDesc { format: PixelFormat::Nv12, name: "YCbCr_420_SP", class: RestrictionClass::Yuv, bpp: 12, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Nv12) },
    FormatDesc { format: PixelFormat::Nv21, name: "YCrCb_420_SP", class: RestrictionClass::Yuv, bpp: 12, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Nv21) },
    FormatDesc { format: PixelFormat::Nv12M, name: "YCbCr_420_SP_M", class: RestrictionClass::Yuv, bpp: 12, planes: 2, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Nv12M) },
    FormatDesc { format: PixelFormat::P010, name: "YCbCr_P010_M", class: RestrictionClass::Yuv, bpp: 24, planes: 2, ten_bit: true, sbwc: false, dpu: Some(DpuFormat::Nv12MP010) },
    FormatDesc { format: PixelFormat::Nv12MSbwc, name: "YCbCr_420_SP_M_SBWC", class: RestrictionClass::Yuv, bpp: 12, planes: 2, ten_bit: false, sbwc: true, dpu: Some(DpuFormat::Nv12MSbwc) },
    FormatDesc { format: PixelFormat::Yv12, name: "YV12", class: RestrictionClass::Yuv, bpp: 12, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Yvu420) },
    FormatDesc { format: PixelFormat::I420, name: "YCbCr_420_P", class: RestrictionClass::Yuv, bpp: 12, planes: 1, ten_bit: false, sbwc: false, dpu: Some(DpuFormat::Yuv420) },
];

impl PixelFormat {
    /// Table entry of this format
    pub fn desc(self) -> &'static FormatDesc {
        // The table lists every variant in declaration order
        &FORMAT_TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }

    pub fn is_yuv(self) -> bool {
        self.desc().class == RestrictionClass::Yuv
    }

    pub fn is_rgb(self) -> bool {
        !self.is_yuv()
    }

    pub fn is_10bit(self) -> bool {
        self.desc().ten_bit
    }

    pub fn is_sbwc(self) -> bool {
        self.desc().sbwc
    }

    pub fn restriction_class(self) -> RestrictionClass {
        self.desc().class
    }

    pub fn bpp(self) -> u32 {
        self.desc().bpp
    }

    /// Whether the format carries a per-pixel alpha channel
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8888
                | PixelFormat::Bgra8888
                | PixelFormat::Rgba1010102
                | PixelFormat::RgbaFp16
        )
    }

    /// Display-controller code, before any per-generation filtering
    pub fn dpu_format(self) -> Option<DpuFormat> {
        self.desc().dpu
    }

    pub fn all() -> impl Iterator<Item = PixelFormat> {
        FORMAT_TABLE.iter().map(|d| d.format)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Color standard part of a dataspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorStandard {
    #[default]
    Unspecified,
    Bt709,
    Bt601_625,
    Bt601_625Unadjusted,
    Bt601_525,
    Bt601_525Unadjusted,
    Bt2020,
    Bt2020ConstantLuminance,
    Bt470M,
    Film,
    DciP3,
    AdobeRgb,
}

impl ColorStandard {
    /// Wide-gamut standards raise a layer's overlay priority
    pub fn is_wide_gamut(self) -> bool {
        matches!(
            self,
            ColorStandard::Bt2020 | ColorStandard::Bt2020ConstantLuminance | ColorStandard::DciP3
        )
    }

    /// Standards a YUV/RGB conversion matrix exists for
    pub fn has_csc_matrix(self) -> bool {
        !matches!(
            self,
            ColorStandard::Unspecified | ColorStandard::Film | ColorStandard::AdobeRgb
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferFunction {
    #[default]
    Unspecified,
    Linear,
    Srgb,
    Smpte170M,
    Gamma2_2,
    St2084,
    Hlg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorRange {
    #[default]
    Unspecified,
    Full,
    Limited,
    Extended,
}

/// Dataspace of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Dataspace {
    pub standard: ColorStandard,
    pub transfer: TransferFunction,
    pub range: ColorRange,
}

impl Dataspace {
    pub const SRGB: Dataspace = Dataspace {
        standard: ColorStandard::Bt709,
        transfer: TransferFunction::Srgb,
        range: ColorRange::Full,
    };

    pub const BT601_LIMITED: Dataspace = Dataspace {
        standard: ColorStandard::Bt601_625,
        transfer: TransferFunction::Smpte170M,
        range: ColorRange::Limited,
    };

    pub const BT2020_PQ: Dataspace = Dataspace {
        standard: ColorStandard::Bt2020,
        transfer: TransferFunction::St2084,
        range: ColorRange::Limited,
    };

    pub fn is_hdr(&self) -> bool {
        matches!(
            self.transfer,
            TransferFunction::St2084 | TransferFunction::Hlg
        )
    }
}

bitflags! {
    /// Rotation/flip transform. 180 and 270 degree rotations are the
    /// combinations of the three basic bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Transform: u32 {
        const FLIP_H = 1;
        const FLIP_V = 2;
        const ROT_90 = 4;
        const ROT_180 = Self::FLIP_H.bits() | Self::FLIP_V.bits();
        const ROT_270 = Self::ROT_180.bits() | Self::ROT_90.bits();
    }
}

impl Transform {
    /// True when width and height trade places
    pub fn swaps_dimensions(self) -> bool {
        self.contains(Transform::ROT_90)
    }
}

/// Layer blending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    None,
    #[default]
    Premultiplied,
    Coverage,
}
