//! Per-window hardware configuration
//!
//! One [`WinConfig`] describes what a hardware window scans out: a buffer
//! through a DPP channel, a solid color, or nothing. The configuration is
//! built at the very end of present, after every processing unit ran, and
//! checked numerically before it reaches the controller.

use crate::buffer::BufferId;
use crate::error::WinConfigError;
use crate::image::{pixel_align_down, pixel_align_down_i32, BlendMode, Dataspace, DpuFormat, ExynosImage, Rect, Transform};
use crate::mpp::restriction::SizeRestriction;
use crate::resource::table::SourceId;
use serde::Serialize;
use std::fmt;

/// Crop alignment the controller needs for YUV sources
pub const YUV_CROP_ALIGN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum WinState {
    #[default]
    Disabled,
    Buffer,
    Color,
}

/// Rectangle inside a surface of `f_w` x `f_h`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct WinRect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
    pub f_w: u32,
    pub f_h: u32,
}

impl WinRect {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.x + self.w as i32, self.y + self.h as i32)
    }
}

impl fmt::Display for WinRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}x{}] of {}x{}",
            self.x, self.y, self.w, self.h, self.f_w, self.f_h
        )
    }
}

/// Engine that wrote a compressed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CompressionSource {
    #[default]
    None,
    Gpu,
    G2d,
}

/// Configuration of one hardware window
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct WinConfig {
    pub state: WinState,
    /// What this window shows, for diagnostics
    pub source: Option<SourceId>,
    pub buffer: Option<BufferId>,
    pub plane_fds: Vec<i32>,
    pub src: WinRect,
    pub dst: WinRect,
    pub format: Option<DpuFormat>,
    pub blending: BlendMode,
    pub plane_alpha: u8,
    pub transform: u32,
    pub dataspace: Dataspace,
    /// Solid color as ARGB, for [`WinState::Color`]
    pub color: u32,
    pub protection: bool,
    pub compression: bool,
    pub compression_src: CompressionSource,
    /// DPP channel feeding the window
    pub channel: Option<usize>,
}

impl WinConfig {
    pub fn is_enabled(&self) -> bool {
        self.state != WinState::Disabled
    }
}

impl fmt::Display for WinConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            WinState::Disabled => f.write_str("disabled"),
            WinState::Color => write!(f, "color {:#010x} dst {}", self.color, self.dst),
            WinState::Buffer => write!(
                f,
                "{} ch={} {:?} src {} dst {} {:?} alpha={} tr={:#x}{}{}",
                self.source.map(|s| s.to_string()).unwrap_or_default(),
                self.channel.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
                self.format,
                self.src,
                self.dst,
                self.blending,
                self.plane_alpha,
                self.transform,
                if self.protection { " protected" } else { "" },
                if self.compression { " afbc" } else { "" },
            ),
        }
    }
}

/// Clips `dst` to a `width` x `height` panel and cuts the matching part out
/// of the source crop, honoring the source's rotation and flips. The crop
/// is then aligned to the feeding channel's source `limits`, or only for
/// YUV when the channel is unknown. Returns `None` when nothing of the
/// destination is visible or the aligned crop is below the channel minimum.
pub fn clip_to_panel(
    src: &ExynosImage,
    dst: Rect,
    width: u32,
    height: u32,
    limits: Option<&SizeRestriction>,
) -> Option<(WinRect, WinRect)> {
    let panel = Rect::from_size(width, height);
    let visible = dst.intersect(&panel)?;
    if visible.is_empty() || src.w == 0 || src.h == 0 {
        return None;
    }

    let dst_w = f64::from(dst.width());
    let dst_h = f64::from(dst.height());
    let left = f64::from(visible.left - dst.left) / dst_w;
    let top = f64::from(visible.top - dst.top) / dst_h;
    let right = f64::from(dst.right - visible.right) / dst_w;
    let bottom = f64::from(dst.bottom - visible.bottom) / dst_h;

    // Undo the rotation first, then the flips
    let (mut cut_l, mut cut_t, mut cut_r, mut cut_b) = if src.transform.contains(Transform::ROT_90)
    {
        (top, right, bottom, left)
    } else {
        (left, top, right, bottom)
    };
    if src.transform.contains(Transform::FLIP_H) {
        std::mem::swap(&mut cut_l, &mut cut_r);
    }
    if src.transform.contains(Transform::FLIP_V) {
        std::mem::swap(&mut cut_t, &mut cut_b);
    }

    let src_w = f64::from(src.w);
    let src_h = f64::from(src.h);
    let off_l = (cut_l * src_w).round() as u32;
    let off_t = (cut_t * src_h).round() as u32;
    let off_r = (cut_r * src_w).round() as u32;
    let off_b = (cut_b * src_h).round() as u32;

    let mut x = src.x + off_l as i32;
    let mut y = src.y + off_t as i32;
    let mut w = src.w.saturating_sub(off_l + off_r);
    let mut h = src.h.saturating_sub(off_t + off_b);

    match limits {
        Some(limits) => {
            x = pixel_align_down_i32(x, limits.crop_x_align);
            y = pixel_align_down_i32(y, limits.crop_y_align);
            w = pixel_align_down(w, limits.crop_width_align);
            h = pixel_align_down(h, limits.crop_height_align);
            if w < limits.min_crop_width || h < limits.min_crop_height {
                return None;
            }
        }
        None if src.format.is_yuv() => {
            x = pixel_align_down_i32(x, YUV_CROP_ALIGN);
            y = pixel_align_down_i32(y, YUV_CROP_ALIGN);
            w = pixel_align_down(w, YUV_CROP_ALIGN);
            h = pixel_align_down(h, YUV_CROP_ALIGN);
        }
        None => {}
    }
    if w == 0 || h == 0 {
        return None;
    }

    let src_rect = WinRect {
        x,
        y,
        w,
        h,
        f_w: src.full_width,
        f_h: src.full_height,
    };
    let dst_rect = WinRect {
        x: visible.left,
        y: visible.top,
        w: visible.width() as u32,
        h: visible.height() as u32,
        f_w: width,
        f_h: height,
    };
    Some((src_rect, dst_rect))
}

/// Numeric checks of a full frame configuration
pub fn validate_win_config(
    configs: &[WinConfig],
    width: u32,
    height: u32,
    max_windows: usize,
) -> Result<(), WinConfigError> {
    let enabled = configs.iter().filter(|c| c.is_enabled()).count();
    if configs.len() > max_windows || enabled > max_windows {
        return Err(WinConfigError::TooManyWindows {
            count: configs.len().max(enabled),
            max: max_windows,
        });
    }

    let panel = Rect::from_size(width, height);
    for (window, config) in configs.iter().enumerate() {
        if !config.is_enabled() {
            continue;
        }
        let dst = config.dst.rect();
        if config.dst.w == 0 || config.dst.h == 0 || !panel.contains(&dst) {
            return Err(WinConfigError::DestinationOutOfBounds {
                window,
                detail: config.dst.to_string(),
            });
        }
        if config.state != WinState::Buffer {
            continue;
        }

        let src = &config.src;
        let inside = src.x >= 0
            && src.y >= 0
            && src.x as u64 + u64::from(src.w) <= u64::from(src.f_w)
            && src.y as u64 + u64::from(src.h) <= u64::from(src.f_h);
        if src.w == 0 || src.h == 0 || !inside {
            return Err(WinConfigError::InvalidCrop {
                window,
                detail: src.to_string(),
            });
        }

        let yuv = matches!(
            config.format,
            Some(
                DpuFormat::Nv12
                    | DpuFormat::Nv21
                    | DpuFormat::Nv12M
                    | DpuFormat::Yuv420
                    | DpuFormat::Yvu420
                    | DpuFormat::Nv12MP010
                    | DpuFormat::Nv12MSbwc
            )
        );
        let align = YUV_CROP_ALIGN as i32;
        if yuv
            && (src.x % align != 0
                || src.y % align != 0
                || src.w % YUV_CROP_ALIGN != 0
                || src.h % YUV_CROP_ALIGN != 0)
        {
            return Err(WinConfigError::MisalignedCrop {
                window,
                detail: src.to_string(),
            });
        }

        if let Some(channel) = config.channel {
            if let Some(first) = configs[..window]
                .iter()
                .position(|c| c.state == WinState::Buffer && c.channel == Some(channel))
            {
                return Err(WinConfigError::ChannelConflict {
                    first,
                    second: window,
                    channel,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{PixelFormat, RestrictionClass};
    use crate::mpp::restriction::RestrictionTable;
    use crate::mpp::PhysicalType;

    fn buffer_window(channel: usize, src: WinRect, dst: WinRect) -> WinConfig {
        WinConfig {
            state: WinState::Buffer,
            src,
            dst,
            format: Some(DpuFormat::Abgr8888),
            plane_alpha: 255,
            channel: Some(channel),
            ..WinConfig::default()
        }
    }

    fn full(w: u32, h: u32) -> WinRect {
        WinRect {
            x: 0,
            y: 0,
            w,
            h,
            f_w: w,
            f_h: h,
        }
    }

    #[test]
    fn test_clip_unscaled() {
        let src = ExynosImage::full_surface(200, 100, PixelFormat::Rgba8888);
        let (s, d) = clip_to_panel(&src, Rect::new(-50, 0, 150, 100), 100, 100, None).unwrap();
        assert_eq!((s.x, s.y, s.w, s.h), (50, 0, 100, 100));
        assert_eq!((d.x, d.y, d.w, d.h), (0, 0, 100, 100));
    }

    #[test]
    fn test_clip_scaled_and_rotated() {
        // 100x200 source rotated into a 400x200 frame hanging off the right
        let mut src = ExynosImage::full_surface(100, 200, PixelFormat::Rgba8888);
        src.transform = Transform::ROT_90;
        let (s, d) = clip_to_panel(&src, Rect::new(0, 0, 400, 200), 200, 200, None).unwrap();
        assert_eq!((d.w, d.h), (200, 200));
        // Cutting the right half of the frame drops the top half of the source
        assert_eq!((s.x, s.y, s.w, s.h), (0, 100, 100, 100));
    }

    #[test]
    fn test_clip_yuv_is_aligned() {
        let mut src = ExynosImage::full_surface(100, 100, PixelFormat::Nv12);
        src.x = 1;
        src.w = 99;
        let (s, _) = clip_to_panel(&src, Rect::new(0, 0, 99, 100), 200, 200, None).unwrap();
        assert_eq!((s.x, s.w), (0, 98));
    }

    #[test]
    fn test_clip_at_the_panel_edge_follows_channel_alignment() {
        let limits = RestrictionTable::for_physical(PhysicalType::DppVg);
        let yuv = limits.src(RestrictionClass::Yuv);

        // Hanging 51 pixels off the left edge leaves an odd crop offset
        let src = ExynosImage::full_surface(320, 240, PixelFormat::Nv12M);
        let (s, d) = clip_to_panel(&src, Rect::new(-51, 0, 269, 240), 1080, 2400, Some(yuv)).unwrap();
        assert_eq!((d.x, d.w), (0, 269));
        assert_eq!((s.x, s.y, s.w, s.h), (50, 0, 268, 240));
        assert_eq!(s.x as u32 % yuv.crop_x_align, 0);
        assert_eq!(s.w % yuv.crop_width_align, 0);

        // Same geometry on an RGB source keeps the exact cut
        let rgb = ExynosImage::full_surface(320, 240, PixelFormat::Rgba8888);
        let limits_rgb = limits.src(RestrictionClass::Rgb);
        let (s, _) = clip_to_panel(&rgb, Rect::new(-51, 0, 269, 240), 1080, 2400, Some(limits_rgb)).unwrap();
        assert_eq!((s.x, s.w), (51, 269));
    }

    #[test]
    fn test_clip_below_channel_minimum_is_dropped() {
        let limits = RestrictionTable::for_physical(PhysicalType::DppVg);
        let yuv = limits.src(RestrictionClass::Yuv);
        let src = ExynosImage::full_surface(320, 240, PixelFormat::Nv12M);
        // 21 visible columns align down to 20, under the 32 pixel minimum
        assert!(clip_to_panel(&src, Rect::new(-299, 0, 21, 240), 1080, 2400, Some(yuv)).is_none());
        // Without channel limits only the YUV alignment applies
        let (s, _) = clip_to_panel(&src, Rect::new(-299, 0, 21, 240), 1080, 2400, None).unwrap();
        assert_eq!(s.w, 20);
    }

    #[test]
    fn test_clip_invisible() {
        let src = ExynosImage::full_surface(10, 10, PixelFormat::Rgba8888);
        assert!(clip_to_panel(&src, Rect::new(200, 200, 210, 210), 100, 100, None).is_none());
    }

    #[test]
    fn test_validation_failures() {
        let ok = buffer_window(0, full(100, 100), full(100, 100));
        assert!(validate_win_config(&[ok.clone()], 100, 100, 4).is_ok());

        let out = buffer_window(0, full(100, 100), WinRect { x: 10, ..full(100, 100) });
        assert!(matches!(
            validate_win_config(&[out], 100, 100, 4),
            Err(WinConfigError::DestinationOutOfBounds { window: 0, .. })
        ));

        let crop = buffer_window(0, WinRect { w: 120, ..full(100, 100) }, full(100, 100));
        assert!(matches!(
            validate_win_config(&[crop], 100, 100, 4),
            Err(WinConfigError::InvalidCrop { .. })
        ));

        let mut yuv = buffer_window(0, WinRect { x: 1, w: 98, ..full(100, 100) }, full(100, 100));
        yuv.format = Some(DpuFormat::Nv12M);
        assert!(matches!(
            validate_win_config(&[yuv], 100, 100, 4),
            Err(WinConfigError::MisalignedCrop { .. })
        ));

        let second = buffer_window(0, full(100, 100), full(100, 100));
        assert_eq!(
            validate_win_config(&[ok.clone(), second], 100, 100, 4),
            Err(WinConfigError::ChannelConflict {
                first: 0,
                second: 1,
                channel: 0
            })
        );

        let many = vec![WinConfig::default(); 5];
        assert!(matches!(
            validate_win_config(&many, 100, 100, 4),
            Err(WinConfigError::TooManyWindows { count: 5, max: 4 })
        ));
    }

    #[test]
    fn test_color_windows_skip_crop_checks() {
        let color = WinConfig {
            state: WinState::Color,
            dst: full(50, 50),
            color: 0xff00_0000,
            ..WinConfig::default()
        };
        assert!(validate_win_config(&[color], 100, 100, 4).is_ok());
    }
}
