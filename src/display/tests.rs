//! Unit tests for the display state machine
//!
//! Each test drives one display against the simulated controller and
//! engines, through validate, accept and present.

use super::*;
use crate::buffer::BufferUsage;
use crate::config::{CapacityConfig, ResourceConfig};
use crate::fence::FenceTracker;
use crate::image::{FRect, PixelFormat};
use crate::layer::{Color, LayerFlags};
use crate::mpp::{HwState, MppContext};
use crate::resource::topology::inventory;
use crate::simulated::{DeconControl, HeapAllocator, SimEngineControl, SimEngineFactory, SimulatedDecon};
use std::time::Duration;

struct Fixture {
    display: ExynosDisplay,
    rm: ResourceManager,
    tracker: Arc<FenceTracker>,
    control: HwcControl,
    decon: DeconControl,
}

fn fixture_for(config: DisplayConfig) -> Fixture {
    let tracker = FenceTracker::new();
    let control = HwcControl::new(ControlConfig::default());
    let ctx = MppContext {
        tracker: Arc::clone(&tracker),
        allocator: HeapAllocator::new(),
        engines: Arc::new(SimEngineFactory::new(SimEngineControl::default())),
        capacity: CapacityConfig::default(),
        resource: ResourceConfig::default(),
    };
    let id = DisplayId(0);
    let primary = (config.kind == DisplayKind::Primary).then_some(id);
    let rm = ResourceManager::new(&ctx, control.clone(), &inventory(config.generation), primary);
    let decon = DeconControl::default();
    let backend = SimulatedDecon::new(config.generation, Arc::clone(&tracker), decon.clone());
    let display = ExynosDisplay::new(
        DisplayInfo::from_config(id, &config),
        Box::new(backend),
        Arc::clone(&tracker),
        control.clone(),
        Arc::new(DumpRing::disabled()),
    );
    Fixture {
        display,
        rm,
        tracker,
        control,
        decon,
    }
}

fn fixture() -> Fixture {
    fixture_for(DisplayConfig::primary())
}

impl Fixture {
    fn add_layer(&mut self, width: u32, height: u32, format: PixelFormat, frame: Rect) -> LayerId {
        let id = self.display.create_layer();
        let z = self.display.layers().len() as u32;
        let buffer = BufferHandle::new(width, height, format, BufferUsage::COMPOSER_OVERLAY);
        let acquire = self.tracker.create_signaled(FenceKind::Acquire, FenceOwner::Caller);
        let layer = self.display.layer_mut(id).unwrap();
        layer.set_buffer(Some(buffer), Some(acquire));
        layer.set_source_crop(FRect::from_size(width, height));
        layer.set_display_frame(frame);
        layer.set_z_order(z);
        layer.set_composition_type(CompositionType::Device);
        id
    }

    fn add_fullscreen(&mut self) -> LayerId {
        let (w, h) = (self.display.info().width, self.display.info().height);
        self.add_layer(w, h, PixelFormat::Rgba8888, Rect::from_size(w, h))
    }

    /// Same buffers, fresh acquire fences
    fn resubmit(&mut self) {
        let ids: Vec<LayerId> = self.display.layers().iter().map(|l| l.id()).collect();
        for id in ids {
            let acquire = self.tracker.create_signaled(FenceKind::Acquire, FenceOwner::Caller);
            let layer = self.display.layer_mut(id).unwrap();
            let buffer = layer.buffer().cloned();
            layer.set_buffer(buffer, Some(acquire));
        }
    }

    fn set_client_target(&mut self) {
        let (w, h) = (self.display.info().width, self.display.info().height);
        let target = BufferHandle::new(
            w,
            h,
            PixelFormat::Rgba8888,
            BufferUsage::COMPOSER_OVERLAY | BufferUsage::GPU_RENDER_TARGET,
        );
        let acquire = self.tracker.create_signaled(FenceKind::Acquire, FenceOwner::Caller);
        self.display
            .set_client_target(Some(target), Some(acquire), Dataspace::SRGB);
    }

    fn frame(&mut self, others_active: bool) -> (ValidateOutcome, PresentOutcome) {
        let validated = self.display.validate(&mut self.rm).unwrap();
        self.display.accept().unwrap();
        let presented = self.display.present(&mut self.rm, others_active).unwrap();
        (validated, presented)
    }

    fn unit_state(&self, name: &str) -> HwState {
        let mpp = self.rm.find(name).unwrap();
        assert!(mpp.wait_reaper_drained(Duration::from_secs(5)));
        mpp.hw_state()
    }
}

#[test]
fn test_present_requires_validate() {
    let mut fx = fixture();
    fx.add_fullscreen();
    assert_eq!(
        fx.display.present(&mut fx.rm, false).unwrap_err(),
        HwcError::NotValidated
    );
    assert_eq!(fx.display.accept().unwrap_err(), HwcError::NotValidated);

    let (_, presented) = fx.frame(false);
    presented.close();
    assert_eq!(fx.display.state(), RenderingState::Presented);
    // A presented frame needs a new validate
    assert_eq!(
        fx.display.present(&mut fx.rm, false).unwrap_err(),
        HwcError::NotValidated
    );
}

#[test]
fn test_present_accepts_implicitly() {
    let mut fx = fixture();
    fx.add_fullscreen();
    fx.display.validate(&mut fx.rm).unwrap();
    let presented = fx.display.present(&mut fx.rm, false).unwrap();
    assert!(presented.submitted);
    presented.close();
}

#[test]
fn test_single_opaque_layer_round_trip() {
    let mut fx = fixture();
    fx.decon.set_auto_signal(false);
    let id = fx.add_fullscreen();
    fx.display.layer_mut(id).unwrap().set_blend_mode(BlendMode::Premultiplied);

    let (validated, presented) = fx.frame(false);
    assert!(!validated.has_changes());
    let report = validated.report.unwrap();
    assert_eq!(report.client_layers, 0);
    assert_eq!(report.windows_used, 1);

    let configs = fx.decon.last_config().unwrap();
    let enabled: Vec<&WinConfig> = configs.iter().filter(|c| c.is_enabled()).collect();
    assert_eq!(enabled.len(), 1);
    assert_eq!(configs[0].state, WinState::Buffer);
    assert_eq!(configs[0].blending, BlendMode::None);
    assert_eq!(configs[0].plane_alpha, 255);
    assert_eq!(configs[0].dst.w, 1080);
    assert_eq!(configs[0].dst.h, 2400);

    // Scanning out until the controller retires the frame
    assert_eq!(fx.rm.find("DPP_G0").unwrap().hw_state(), HwState::Running);
    assert_eq!(presented.releases.len(), 1);
    assert_eq!(presented.releases[0].0, id);
    fx.decon.signal_all();
    assert_eq!(fx.unit_state("DPP_G0"), HwState::Idle);
    presented.close();
    assert_eq!(fx.tracker.stats().leaks_reported, 0);
}

#[test]
fn test_forced_client_composition_reports_changes() {
    let mut fx = fixture();
    let id = fx.add_fullscreen();
    fx.control.set_force_gpu(true);
    fx.set_client_target();

    let validated = fx.display.validate(&mut fx.rm).unwrap();
    assert_eq!(validated.changes, vec![(id, CompositionType::Client)]);
    fx.display.accept().unwrap();
    assert_eq!(fx.display.layer(id).unwrap().committed(), CompositionType::Client);
    let presented = fx.display.present(&mut fx.rm, false).unwrap();
    // The client target takes the only window, the layer gets no release
    assert!(presented.releases.is_empty());
    let configs = fx.decon.last_config().unwrap();
    assert_eq!(
        configs[0].source,
        Some(SourceId::ClientTarget(DisplayId(0)))
    );
    presented.close();

    fx.set_client_target();
    fx.resubmit();
    let validated = fx.display.validate(&mut fx.rm).unwrap();
    assert!(validated.changes.is_empty());
    fx.display.present(&mut fx.rm, false).unwrap().close();
}

#[test]
fn test_color_layer_uses_a_color_window() {
    let mut fx = fixture();
    fx.add_fullscreen();
    let id = fx.display.create_layer();
    {
        let layer = fx.display.layer_mut(id).unwrap();
        layer.set_display_frame(Rect::new(0, 0, 1080, 200));
        layer.set_z_order(5);
        layer.set_color(Color {
            r: 0x10,
            g: 0x20,
            b: 0x30,
            a: 0xff,
        });
        layer.set_composition_type(CompositionType::SolidColor);
    }

    let (validated, presented) = fx.frame(false);
    assert!(validated.changes.is_empty());
    let configs = fx.decon.last_config().unwrap();
    let color = &configs[1];
    assert_eq!(color.state, WinState::Color);
    assert_eq!(color.color, 0xff10_2030);
    assert_eq!((color.dst.w, color.dst.h), (1080, 200));
    assert!(color.channel.is_none());
    // Color layers have nothing to release
    assert!(presented.releases.iter().all(|(l, _)| *l != id));
    presented.close();
}

#[test]
fn test_dim_layer_is_reported_as_solid_color() {
    let mut fx = fixture();
    let id = fx.add_fullscreen();
    fx.display.layer_mut(id).unwrap().set_flags(LayerFlags::DIM);
    let (validated, presented) = fx.frame(false);
    assert_eq!(validated.changes, vec![(id, CompositionType::SolidColor)]);
    presented.close();
}

#[test]
fn test_failed_submission_blanks_the_display() {
    let mut fx = fixture();
    fx.add_fullscreen();
    fx.decon.fail_next_submit();

    fx.display.validate(&mut fx.rm).unwrap();
    let err = fx.display.present(&mut fx.rm, false).unwrap_err();
    assert_eq!(err, HwcError::NoResources);
    assert_eq!(fx.display.state(), RenderingState::None);
    assert_eq!(fx.decon.clears(), 1);
    assert!(fx.display.last_configs().is_none());
    assert_eq!(fx.tracker.stats().open(), 0);

    // The next frame goes through
    fx.resubmit();
    let (_, presented) = fx.frame(false);
    assert!(presented.submitted);
    presented.close();
}

#[test]
fn test_unchanged_configuration_is_not_resubmitted() {
    let mut fx = fixture();
    fx.control.set_skip_window_config(true);
    fx.add_fullscreen();

    let (_, first) = fx.frame(false);
    assert!(first.submitted);
    first.close();

    fx.resubmit();
    let (_, second) = fx.frame(false);
    assert!(!second.submitted);
    assert!(second.retire.is_some());
    assert_eq!(fx.decon.submissions(), 1);
    second.close();

    // Another active display forces the submission
    fx.resubmit();
    let (_, third) = fx.frame(true);
    assert!(third.submitted);
    assert_eq!(fx.decon.submissions(), 2);
    third.close();
}

#[test]
fn test_static_client_composition_is_skipped() {
    let mut fx = fixture();
    fx.control.set_skip_static(true);
    fx.add_fullscreen();
    let skipped = fx.add_layer(540, 600, PixelFormat::Rgba8888, Rect::new(0, 0, 540, 600));
    fx.display.layer_mut(skipped).unwrap().set_flags(LayerFlags::SKIP);
    fx.set_client_target();

    let (validated, presented) = fx.frame(false);
    assert_eq!(validated.changes, vec![(skipped, CompositionType::Client)]);
    assert!(!fx.display.client_target().skip());
    presented.close();

    fx.resubmit();
    let validated = fx.display.validate(&mut fx.rm).unwrap();
    assert!(fx.display.client_target().skip());
    assert_eq!(validated.changes, vec![(skipped, CompositionType::Device)]);
    fx.display.accept().unwrap();
    fx.display.present(&mut fx.rm, false).unwrap().close();

    // Geometry changes end the skip
    fx.resubmit();
    fx.display
        .layer_mut(skipped)
        .unwrap()
        .set_display_frame(Rect::new(0, 100, 540, 700));
    let validated = fx.display.validate(&mut fx.rm).unwrap();
    assert!(!fx.display.client_target().skip());
    assert_eq!(validated.changes, vec![(skipped, CompositionType::Client)]);
    fx.display.accept().unwrap();
    fx.display.present(&mut fx.rm, false).unwrap().close();
    assert_eq!(fx.tracker.stats().leaks_reported, 0);
}

#[test]
fn test_power_off_releases_everything() {
    let mut fx = fixture();
    let id = fx.add_fullscreen();
    let (_, presented) = fx.frame(false);
    presented.close();
    assert!(!fx.rm.table().display_units(DisplayId(0)).is_empty());

    fx.display.set_power_mode(PowerMode::Off, &mut fx.rm);
    assert!(!fx.display.is_active());
    assert!(fx.rm.table().display_units(DisplayId(0)).is_empty());
    assert_eq!(fx.decon.clears(), 1);
    assert_eq!(fx.display.state(), RenderingState::None);

    fx.resubmit();
    let validated = fx.display.validate(&mut fx.rm).unwrap();
    assert!(validated.report.is_none());
    assert_eq!(fx.display.layer(id).unwrap().validate_type(), ValidateType::Client);
    let presented = fx.display.present(&mut fx.rm, false).unwrap();
    assert!(presented.retire.is_none());
    assert!(!presented.submitted);
    assert_eq!(fx.decon.submissions(), 1);
    assert_eq!(fx.unit_state("DPP_G0"), HwState::Idle);
    assert_eq!(fx.tracker.stats().leaks_reported, 0);

    fx.display.set_power_mode(PowerMode::On, &mut fx.rm);
    fx.resubmit();
    let (_, presented) = fx.frame(false);
    assert!(presented.submitted);
    presented.close();
}

#[test]
fn test_doze_keeps_scanning_out() {
    let mut fx = fixture();
    fx.add_fullscreen();
    fx.display.set_power_mode(PowerMode::Doze, &mut fx.rm);
    assert!(fx.display.is_active());
    let (_, presented) = fx.frame(false);
    assert!(presented.retire.is_some());
    presented.close();
}

#[test]
fn test_virtual_display_needs_plug_and_output() {
    let mut fx = fixture_for(DisplayConfig::virtual_display());
    assert!(!fx.display.is_plugged());
    fx.add_fullscreen();

    let (_, presented) = fx.frame(false);
    assert!(presented.retire.is_none());
    assert_eq!(fx.decon.submissions(), 0);

    fx.display.set_plugged(true, &mut fx.rm);
    fx.resubmit();
    let (_, presented) = fx.frame(false);
    // No output buffer yet: nothing to write into
    assert!(presented.retire.is_none());

    let output = BufferHandle::new(1920, 1080, PixelFormat::Rgba8888, BufferUsage::HW_PROCESSING);
    fx.display.set_output_buffer(output, None).unwrap();
    fx.resubmit();
    let (_, presented) = fx.frame(false);
    assert!(presented.retire.is_some());
    presented.close();
    assert_eq!(fx.tracker.stats().leaks_reported, 0);
}

#[test]
fn test_output_buffer_only_on_virtual_displays() {
    let mut fx = fixture();
    let output = BufferHandle::new(1080, 2400, PixelFormat::Rgba8888, BufferUsage::HW_PROCESSING);
    let release = fx.tracker.create(FenceKind::Release, FenceOwner::Caller);
    assert_eq!(
        fx.display.set_output_buffer(output, Some(release)).unwrap_err(),
        HwcError::Unsupported
    );
    assert_eq!(fx.tracker.stats().open(), 0);
}

#[test]
fn test_unknown_layer_is_rejected() {
    let mut fx = fixture();
    assert_eq!(
        fx.display.destroy_layer(LayerId(42), &mut fx.rm).unwrap_err(),
        HwcError::BadLayer
    );
    assert!(fx.display.layer_mut(LayerId(42)).is_err());
}

#[test]
fn test_destroyed_layer_gives_its_channel_back() {
    let mut fx = fixture();
    let id = fx.add_fullscreen();
    let (_, presented) = fx.frame(false);
    presented.close();
    let source = SourceId::Layer(DisplayId(0), id);
    assert!(fx.rm.table().otf(&source).is_some());

    fx.display.destroy_layer(id, &mut fx.rm).unwrap();
    assert!(fx.rm.table().otf(&source).is_none());
    assert!(fx.display.layers().is_empty());
    assert!(fx.rm.check_invariants().is_ok());
}

#[test]
fn test_revalidate_is_idempotent() {
    let mut fx = fixture();
    fx.add_fullscreen();
    fx.add_layer(1080, 608, PixelFormat::Nv12M, Rect::new(0, 600, 1080, 1208));
    fx.add_layer(256, 256, PixelFormat::Rgba8888, Rect::new(100, 100, 356, 356));

    let (_, first) = fx.frame(false);
    first.close();
    let configs = fx.decon.last_config().unwrap();

    fx.resubmit();
    let (validated, second) = fx.frame(false);
    second.close();
    assert!(validated.changes.is_empty());
    assert_eq!(fx.decon.last_config().unwrap(), configs);
}

#[test]
fn test_dump_lists_windows_and_units() {
    let mut fx = fixture();
    fx.add_fullscreen();
    let (_, presented) = fx.frame(false);
    presented.close();
    let dump = fx.display.dump(&fx.rm);
    assert!(dump.starts_with("display0 Primary 1080x2400"));
    assert!(dump.contains("win0:"));
    assert!(dump.contains("DPP_G0"));
}

#[test]
fn test_resolution_change_invalidates() {
    let mut fx = fixture();
    fx.add_fullscreen();
    let (_, presented) = fx.frame(false);
    presented.close();

    fx.display.set_resolution(720, 1600, &mut fx.rm);
    assert_eq!(fx.display.info().width, 720);
    assert_eq!(fx.display.state(), RenderingState::None);
    assert!(fx.display.last_configs().is_none());
    assert!(fx.rm.wait_realloc(Duration::from_secs(5)));
}
