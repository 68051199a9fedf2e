//! Unit tests for the fixed-point assignment
//!
//! Scenarios run against the 9810 inventory with a primary display that
//! has seven windows and five regular overlay channels.

use super::*;
use crate::buffer::BufferHandle;
use crate::config::{CapacityConfig, DisplayConfig, HwcControl, ResourceConfig};
use crate::display::backend::ControllerGeneration;
use crate::display::composition::CompositionKind;
use crate::display::DisplayId;
use crate::fence::FenceTracker;
use crate::image::{FRect, Rect};
use crate::layer::{ClientReason, Color, CompositionType, LayerFlags, LayerId};
use crate::mpp::{ExynosMpp, MppContext};
use crate::resource::topology::inventory;
use crate::simulated::{HeapAllocator, SimEngineControl, SimEngineFactory};
use std::sync::Arc;

const PRIMARY: DisplayId = DisplayId(0);

struct Fixture {
    rm: ResourceManager,
    control: HwcControl,
    engines: SimEngineControl,
    info: DisplayInfo,
    layers: Vec<ExynosLayer>,
    client: CompositionInfo,
    exynos: CompositionInfo,
}

fn fixture_with(resource: ResourceConfig) -> Fixture {
    let control = HwcControl::new(ControlConfig::default());
    let engines = SimEngineControl::default();
    let ctx = MppContext {
        tracker: FenceTracker::new(),
        allocator: HeapAllocator::new(),
        engines: Arc::new(SimEngineFactory::new(engines.clone())),
        capacity: CapacityConfig::default(),
        resource,
    };
    let rm = ResourceManager::new(
        &ctx,
        control.clone(),
        &inventory(ControllerGeneration::Decon9810),
        Some(PRIMARY),
    );
    Fixture {
        rm,
        control,
        engines,
        info: DisplayInfo::from_config(PRIMARY, &DisplayConfig::primary()),
        layers: Vec::new(),
        client: CompositionInfo::new(CompositionKind::Client, PRIMARY),
        exynos: CompositionInfo::new(CompositionKind::Exynos, PRIMARY),
    }
}

fn fixture() -> Fixture {
    fixture_with(ResourceConfig::default())
}

impl Fixture {
    fn push(&mut self, width: u32, height: u32, format: PixelFormat, usage: BufferUsage, frame: Rect) -> usize {
        let index = self.layers.len();
        let mut layer = ExynosLayer::new(LayerId(index as u32 + 1), PRIMARY);
        layer.set_buffer(Some(BufferHandle::new(width, height, format, usage)), None);
        layer.set_source_crop(FRect::from_size(width, height));
        layer.set_display_frame(frame);
        layer.set_z_order(index as u32);
        layer.set_composition_type(CompositionType::Device);
        self.layers.push(layer);
        index
    }

    fn push_rgb(&mut self, frame: Rect) -> usize {
        let (w, h) = (frame.width() as u32, frame.height() as u32);
        self.push(w, h, PixelFormat::Rgba8888, BufferUsage::COMPOSER_OVERLAY, frame)
    }

    /// `count` small layers in a column, none overlapping
    fn push_tiles(&mut self, count: usize) {
        for i in 0..count {
            let top = i as i32 * 256;
            self.push_rgb(Rect::new(0, top, 256, top + 256));
        }
    }

    fn source(&self, index: usize) -> SourceId {
        SourceId::Layer(PRIMARY, self.layers[index].id())
    }

    fn otf_name(&self, index: usize) -> Option<&str> {
        let id = self.rm.table().otf(&self.source(index))?;
        self.rm.mpp(id).map(ExynosMpp::name)
    }

    fn assign(&mut self) -> Result<AssignReport, AssignError> {
        let min_dst = self.rm.min_scaler_output();
        for layer in &mut self.layers {
            layer.do_pre_process(&self.info, min_dst);
        }
        let mut req = AssignRequest {
            info: &self.info,
            layers: &mut self.layers,
            client: &mut self.client,
            exynos: &mut self.exynos,
        };
        self.rm.assign_resources(&mut req)
    }
}

#[test]
fn test_single_layer_takes_the_first_channel() {
    let mut fx = fixture();
    fx.push_rgb(Rect::from_size(1080, 2400));

    let report = fx.assign().unwrap();
    assert_eq!(report.iterations, 1);
    assert_eq!(report.windows_used, 1);
    assert_eq!(report.device_layers, 1);
    assert!(!report.secure_dma_used);
    assert_eq!(fx.otf_name(0), Some("DPP_G0"));
    assert_eq!(fx.layers[0].window_index(), Some(0));
    assert!(fx.client.range().is_none());
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_empty_display_converges() {
    let mut fx = fixture();
    let report = fx.assign().unwrap();
    assert_eq!(report.windows_used, 0);
    assert!(fx.rm.table().display_units(PRIMARY).is_empty());
}

#[test]
fn test_channels_follow_capabilities() {
    let mut fx = fixture();
    fx.push_rgb(Rect::from_size(1080, 2400));
    // Plain video needs a YUV channel
    fx.push(1080, 608, PixelFormat::Nv12M, BufferUsage::COMPOSER_OVERLAY, Rect::new(0, 600, 1080, 1208));
    // Upscaled twice needs a scaling channel
    fx.push(540, 600, PixelFormat::Rgba8888, BufferUsage::COMPOSER_OVERLAY, Rect::new(0, 1200, 1080, 2400));

    let report = fx.assign().unwrap();
    assert_eq!(report.device_layers, 3);
    assert_eq!(fx.otf_name(0), Some("DPP_G0"));
    assert_eq!(fx.otf_name(1), Some("DPP_VG0"));
    // First scaling channel still free
    assert_eq!(fx.otf_name(2), Some("DPP_VGF0"));
    let windows: Vec<Option<usize>> = fx.layers.iter().map(ExynosLayer::window_index).collect();
    assert_eq!(windows, vec![Some(0), Some(1), Some(2)]);
}

#[test]
fn test_color_layer_needs_a_window_only() {
    let mut fx = fixture();
    fx.push_rgb(Rect::from_size(1080, 2400));
    let mut color = ExynosLayer::new(LayerId(99), PRIMARY);
    color.set_display_frame(Rect::new(0, 0, 1080, 100));
    color.set_z_order(1);
    color.set_color(Color {
        r: 0,
        g: 0,
        b: 0,
        a: 0x80,
    });
    color.set_composition_type(CompositionType::SolidColor);
    fx.layers.push(color);

    let report = fx.assign().unwrap();
    assert_eq!(report.device_layers, 2);
    assert_eq!(report.windows_used, 2);
    assert!(fx.otf_name(1).is_none());
    assert_eq!(fx.layers[1].window_index(), Some(1));
}

#[test]
fn test_overflow_goes_to_the_blitter() {
    let mut fx = fixture();
    fx.push_tiles(8);

    let report = fx.assign().unwrap();
    assert_eq!(report.client_layers, 0);
    assert_eq!(report.device_layers + report.blit_layers, 8);
    assert!(report.blit_layers > 0);
    assert!(report.windows_used <= fx.info.max_windows);

    // Blit members are contiguous and topmost
    let (first, last) = fx.exynos.range().unwrap();
    assert_eq!(last, 7);
    assert_eq!(last - first + 1, report.blit_layers);
    for i in first..=last {
        assert_eq!(fx.layers[i].validate_type(), ValidateType::Exynos);
        assert_eq!(
            fx.rm.table().m2m(&fx.source(i)).and_then(|id| fx.rm.mpp(id)).map(ExynosMpp::name),
            Some("G2D0_G2D_COMBO0")
        );
    }
    assert!(fx.rm.table().otf(&SourceId::ExynosTarget(PRIMARY)).is_some());
    assert!(fx.exynos.window_index().is_some());
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_overflow_without_blitter_goes_to_the_client() {
    let mut fx = fixture();
    fx.control.set_use_blit_composition(false);
    fx.push_tiles(8);

    let report = fx.assign().unwrap();
    assert_eq!(report.blit_layers, 0);
    assert_eq!(report.device_layers + report.client_layers, 8);
    assert!(report.client_layers >= 3);

    let (first, last) = fx.client.range().unwrap();
    assert_eq!(last, 7);
    for layer in &fx.layers[first..=last] {
        assert_eq!(layer.validate_type(), ValidateType::Client);
        assert_eq!(layer.client_reason(), Some(ClientReason::NoResource));
    }
    for layer in &fx.layers[..first] {
        assert_eq!(layer.validate_type(), ValidateType::Device);
    }
    // A topmost client target rides the secure channel
    assert!(report.secure_dma_used);
    assert_eq!(fx.client.window_index(), Some(fx.info.max_windows - 1));
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_protected_layer_wins_a_drm_channel() {
    let mut fx = fixture();
    fx.control.set_use_blit_composition(false);
    fx.push(
        1080,
        608,
        PixelFormat::Nv12M,
        BufferUsage::COMPOSER_OVERLAY | BufferUsage::PROTECTED,
        Rect::new(0, 0, 1080, 608),
    );
    fx.push_tiles(6);

    let report = fx.assign().unwrap();
    assert_eq!(fx.layers[0].priority(), OverlayPriority::Max);
    assert_eq!(fx.layers[0].validate_type(), ValidateType::Device);
    assert_eq!(fx.otf_name(0), Some("DPP_VG0"));
    assert!(report.client_layers > 0);
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_topmost_protected_rgb_uses_the_secure_channel() {
    let mut fx = fixture();
    fx.push_rgb(Rect::from_size(1080, 2400));
    fx.push(
        1080,
        600,
        PixelFormat::Rgba8888,
        BufferUsage::COMPOSER_OVERLAY | BufferUsage::PROTECTED,
        Rect::new(0, 0, 1080, 600),
    );

    let report = fx.assign().unwrap();
    assert!(report.secure_dma_used);
    assert_eq!(fx.otf_name(1), Some("DPP_G1"));
    assert_eq!(fx.layers[1].window_index(), Some(fx.info.max_windows - 1));
    assert_eq!(fx.layers[0].window_index(), Some(0));
}

/// Five full-width strips on a display with three windows, the protected
/// one at `drm`
fn five_strips_with_drm(drm: usize) -> Fixture {
    let mut fx = fixture();
    fx.control.set_use_blit_composition(false);
    fx.info.max_windows = 3;
    for i in 0..5 {
        let frame = Rect::new(0, i * 400, 1080, i * 400 + 400);
        let usage = if i as usize == drm {
            BufferUsage::COMPOSER_OVERLAY | BufferUsage::PROTECTED
        } else {
            BufferUsage::COMPOSER_OVERLAY
        };
        fx.push(1080, 400, PixelFormat::Rgba8888, usage, frame);
    }
    fx
}

fn on_secure_channel(fx: &Fixture, source: &SourceId) -> bool {
    fx.rm
        .table()
        .otf(source)
        .map_or(false, |id| fx.rm.secure_dma_ids().contains(&id))
}

#[test]
fn test_protected_layer_in_the_middle_keeps_its_window() {
    let mut fx = five_strips_with_drm(2);

    let report = fx.assign().unwrap();
    assert!(report.iterations > 1);
    assert_eq!(fx.layers[2].priority(), OverlayPriority::Max);
    assert_eq!(fx.layers[2].validate_type(), ValidateType::Device);
    assert!(fx.otf_name(2).is_some());

    // Everything above the bottom layer except the protected one is composed by the GPU
    assert_eq!(fx.layers[0].validate_type(), ValidateType::Device);
    for i in [1, 3, 4] {
        assert_eq!(fx.layers[i].validate_type(), ValidateType::Client, "layer {}", i);
    }
    assert_eq!(fx.client.range(), Some((1, 4)));

    // Not topmost, so neither it nor the target below it takes the secure channel
    assert!(!report.secure_dma_used);
    assert!(!on_secure_channel(&fx, &fx.source(2)));
    assert!(!on_secure_channel(&fx, &SourceId::ClientTarget(PRIMARY)));
    assert_eq!(fx.layers[0].window_index(), Some(0));
    assert_eq!(fx.client.window_index(), Some(1));
    assert_eq!(fx.layers[2].window_index(), Some(2));
    assert!(fx.rm.check_invariants().is_ok());

    // Stable across a second validate
    let again = fx.assign().unwrap();
    assert_eq!(again.device_layers, report.device_layers);
    assert_eq!(fx.layers[2].window_index(), Some(2));
}

#[test]
fn test_topmost_protected_layer_alone_on_the_secure_channel() {
    let mut fx = five_strips_with_drm(4);

    let report = fx.assign().unwrap();
    assert!(report.iterations > 1);
    assert!(report.secure_dma_used);
    assert_eq!(fx.layers[4].validate_type(), ValidateType::Device);
    assert_eq!(fx.otf_name(4), Some("DPP_G1"));
    assert_eq!(fx.layers[4].window_index(), Some(fx.info.max_windows - 1));

    for i in 1..4 {
        assert_eq!(fx.layers[i].validate_type(), ValidateType::Client, "layer {}", i);
        assert_eq!(fx.layers[i].client_reason(), Some(ClientReason::NoWindow));
    }
    assert_eq!(fx.client.range(), Some((1, 3)));
    assert!(!on_secure_channel(&fx, &SourceId::ClientTarget(PRIMARY)));
    assert!(!on_secure_channel(&fx, &fx.source(0)));

    // Regular windows stay below the secure one
    assert_eq!(fx.layers[0].window_index(), Some(0));
    assert_eq!(fx.client.window_index(), Some(1));
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_client_target_above_a_protected_layer_takes_the_secure_channel() {
    let mut fx = fixture();
    fx.push_rgb(Rect::new(0, 0, 1080, 800));
    fx.push(
        1080,
        800,
        PixelFormat::Rgba8888,
        BufferUsage::COMPOSER_OVERLAY | BufferUsage::PROTECTED,
        Rect::new(0, 800, 1080, 1600),
    );
    fx.push_rgb(Rect::new(0, 1600, 1080, 2400));
    fx.layers[2].set_composition_type(CompositionType::Client);

    let report = fx.assign().unwrap();
    assert!(report.secure_dma_used);
    assert_eq!(fx.client.range(), Some((2, 2)));
    assert!(on_secure_channel(&fx, &SourceId::ClientTarget(PRIMARY)));
    assert_eq!(fx.client.window_index(), Some(fx.info.max_windows - 1));

    // The protected layer is below the target, so it uses a regular channel
    assert_eq!(fx.layers[1].validate_type(), ValidateType::Device);
    assert!(!on_secure_channel(&fx, &fx.source(1)));
    assert_eq!(fx.layers[0].window_index(), Some(0));
    assert_eq!(fx.layers[1].window_index(), Some(1));
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_forced_gpu_composition() {
    let mut fx = fixture();
    fx.control.set_force_gpu(true);
    fx.push_tiles(3);

    let report = fx.assign().unwrap();
    assert_eq!(report.client_layers, 3);
    assert_eq!(fx.client.range(), Some((0, 2)));
    assert!(fx.client.window_index().is_some());
    assert!(fx.layers.iter().all(|l| l.client_reason() == Some(ClientReason::Requested)));
    assert!(fx.rm.table().otf(&SourceId::ClientTarget(PRIMARY)).is_some());
}

#[test]
fn test_layer_between_client_layers_is_sandwiched() {
    let mut fx = fixture();
    fx.push_tiles(3);
    fx.layers[0].set_flags(LayerFlags::SKIP);
    fx.layers[2].set_composition_type(CompositionType::Client);

    let report = fx.assign().unwrap();
    assert_eq!(report.client_layers, 3);
    assert_eq!(fx.layers[1].client_reason(), Some(ClientReason::Sandwiched));
    assert_eq!(fx.client.range(), Some((0, 2)));
}

#[test]
fn test_iteration_ceiling_falls_back_to_the_client() {
    let mut fx = fixture_with(ResourceConfig {
        max_assign_iterations: 1,
        ..ResourceConfig::default()
    });
    fx.control.set_use_blit_composition(false);
    fx.push_tiles(8);

    let err = fx.assign().unwrap_err();
    assert_eq!(err, AssignError::NotConverged { iterations: 1 });
    assert!(fx.layers.iter().all(|l| l.validate_type() == ValidateType::Client));
    assert_eq!(fx.client.range(), Some((0, 7)));
    // The lone client target is topmost, so it may take the secure channel
    // and with it the last window
    let client = fx.rm.table().otf(&SourceId::ClientTarget(PRIMARY));
    assert_eq!(client.and_then(|id| fx.rm.mpp(id)).map(ExynosMpp::name), Some("DPP_G1"));
    assert_eq!(fx.client.window_index(), Some(fx.info.max_windows - 1));
    let units = fx.rm.table().display_units(PRIMARY);
    assert_eq!(units.len(), 1);
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_client_fallback_without_secure_channel_takes_window_zero() {
    let mut fx = fixture_with(ResourceConfig {
        max_assign_iterations: 1,
        ..ResourceConfig::default()
    });
    fx.control.set_use_blit_composition(false);
    fx.control.set_mpp_enabled("DPP_G1", false);
    fx.push_tiles(8);

    assert!(fx.assign().is_err());
    let client = fx.rm.table().otf(&SourceId::ClientTarget(PRIMARY));
    assert_eq!(client.and_then(|id| fx.rm.mpp(id)).map(ExynosMpp::name), Some("DPP_G0"));
    assert_eq!(fx.client.window_index(), Some(0));
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_ranges_stay_disjoint() {
    let mut fx = fixture();
    fx.push_tiles(9);
    fx.layers[1].set_composition_type(CompositionType::Client);

    let report = fx.assign().unwrap();
    assert!(!fx.client.overlaps(&fx.exynos));
    for (i, layer) in fx.layers.iter().enumerate() {
        match layer.validate_type() {
            ValidateType::Client => assert!(fx.client.contains(i)),
            ValidateType::Exynos => assert!(fx.exynos.contains(i)),
            ValidateType::Device => {
                assert!(!fx.exynos.contains(i));
                assert!(layer.window_index().is_some());
            }
        }
    }
    assert_eq!(
        report.device_layers + report.client_layers + report.blit_layers,
        9
    );
}

#[test]
fn test_revalidate_gives_the_same_assignment() {
    let mut fx = fixture();
    fx.push_tiles(8);
    let first = fx.assign().unwrap();
    let bindings: Vec<_> = (0..8)
        .map(|i| (fx.rm.table().otf(&fx.source(i)), fx.rm.table().m2m(&fx.source(i))))
        .collect();
    let windows: Vec<_> = fx.layers.iter().map(ExynosLayer::window_index).collect();

    let second = fx.assign().unwrap();
    assert_eq!(first.device_layers, second.device_layers);
    assert_eq!(first.blit_layers, second.blit_layers);
    assert_eq!(first.windows_used, second.windows_used);
    for i in 0..8 {
        assert_eq!(
            (fx.rm.table().otf(&fx.source(i)), fx.rm.table().m2m(&fx.source(i))),
            bindings[i]
        );
    }
    let again: Vec<_> = fx.layers.iter().map(ExynosLayer::window_index).collect();
    assert_eq!(again, windows);
}

#[test]
fn test_busy_blitter_sends_its_members_to_the_client() {
    let mut fx = fixture();
    fx.engines.set_busy("G2D0_G2D_COMBO0", true);
    fx.push_tiles(8);

    let report = fx.assign().unwrap();
    assert_eq!(report.blit_layers, 0);
    assert!(report.client_layers > 0);
    assert!(fx.exynos.range().is_none());
    assert!(fx
        .layers
        .iter()
        .any(|l| l.client_reason() == Some(ClientReason::Busy)));
    assert!(fx.rm.check_invariants().is_ok());

    // Not busy any more: the next frame uses it again
    fx.engines.set_busy("G2D0_G2D_COMBO0", false);
    let report = fx.assign().unwrap();
    assert!(report.blit_layers > 0);
}

#[test]
fn test_disabled_channel_is_skipped() {
    let mut fx = fixture();
    fx.control.set_mpp_enabled("DPP_G0", false);
    fx.push_rgb(Rect::from_size(1080, 2400));

    fx.assign().unwrap();
    assert_eq!(fx.otf_name(0), Some("DPP_GF0"));
    assert!(fx.layers[0].rejections().contains_key(&LogicalType::DppG));
}

#[test]
fn test_candidate_out_images_split_large_upscales() {
    let fx = fixture();
    let src = ExynosImage::full_surface(64, 64, PixelFormat::Nv12M);
    let dst = ExynosImage::full_surface(1080, 1080, PixelFormat::Rgba8888);
    let images = fx.rm.candidate_out_images(&src, &dst);
    assert_eq!(images.len(), 2);
    assert_eq!((images[0].w, images[0].h), (135, 135));
    assert_eq!((images[1].w, images[1].h), (1080, 1080));
    assert!(images.iter().all(|i| i.format == PixelFormat::Rgba8888));

    let same = ExynosImage::full_surface(1080, 1080, PixelFormat::Nv12M);
    assert_eq!(fx.rm.candidate_out_images(&same, &dst).len(), 1);
}
