//! Unit tests for processing units
//!
//! Capability rule ordering, assignment bookkeeping, capacity admission and
//! memory-to-memory execution against the simulated engines.

use super::*;
use crate::config::DisplayConfig;
use crate::display::DisplayInfo;
use crate::fence::FenceTracker;
use crate::image::{Dataspace, ExynosImage, PixelFormat};
use crate::layer::LayerId;
use crate::simulated::{HeapAllocator, SimEngineControl, SimEngineFactory};

struct Fixture {
    ctx: MppContext,
    allocator: Arc<HeapAllocator>,
    engines: SimEngineControl,
}

fn fixture() -> Fixture {
    let allocator = HeapAllocator::new();
    let engines = SimEngineControl::default();
    let ctx = MppContext {
        tracker: FenceTracker::new(),
        allocator: allocator.clone(),
        engines: Arc::new(SimEngineFactory::new(engines.clone())),
        capacity: CapacityConfig::default(),
        resource: ResourceConfig {
            fence_wait_timeout_ms: 2000,
            ..ResourceConfig::default()
        },
    };
    Fixture {
        ctx,
        allocator,
        engines,
    }
}

fn unit(fx: &Fixture, physical: PhysicalType, logical: LogicalType, max_sources: usize) -> ExynosMpp {
    ExynosMpp::new(
        MppId(0),
        &MppSpec {
            physical,
            logical,
            physical_index: 0,
            logical_index: 0,
            extra_attr: MppAttr::empty(),
            max_sources,
            reserved_for_primary: false,
            resolution_pinned: false,
        },
        &fx.ctx,
    )
}

fn primary() -> DisplayInfo {
    DisplayInfo::from_config(DisplayId(0), &DisplayConfig::primary())
}

fn external() -> DisplayInfo {
    DisplayInfo::from_config(DisplayId(1), &DisplayConfig::external())
}

fn image(w: u32, h: u32, format: PixelFormat) -> ExynosImage {
    ExynosImage::full_surface(w, h, format)
}

fn source(layer: u32, src: ExynosImage, dst: ExynosImage) -> MppSource {
    MppSource {
        id: SourceId::Layer(DisplayId(0), LayerId(layer)),
        src,
        dst,
    }
}

#[test]
fn test_plain_rgb_layer_is_supported_by_every_overlay() {
    let fx = fixture();
    let src = image(1080, 2400, PixelFormat::Rgba8888);
    let dst = src.clone();
    for physical in [
        PhysicalType::DppG,
        PhysicalType::DppGf,
        PhysicalType::DppVg,
        PhysicalType::DppVgf,
        PhysicalType::DppVgrfs,
    ] {
        let mpp = unit(&fx, physical, LogicalType::DppG, 1);
        assert_eq!(mpp.is_supported(&primary(), &src, &dst), Ok(()), "{:?}", physical);
    }
}

#[test]
fn test_first_failing_rule_is_reported() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::DppG, LogicalType::DppG, 1);

    // Format is checked before rotation
    let mut src = image(1920, 1080, PixelFormat::Nv12);
    src.transform = Transform::ROT_90;
    let dst = image(1080, 1920, PixelFormat::Rgba8888);
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::SRC_FORMAT));

    src.format = PixelFormat::Rgba8888;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::ROTATION));

    let mut src = image(1080, 2400, PixelFormat::Rgba8888);
    src.usage = BufferUsage::PROTECTED;
    assert_eq!(
        mpp.is_supported(&primary(), &src, &src.clone()),
        Err(Rejection::DRM)
    );

    let mut src = image(1080, 2400, PixelFormat::Rgba8888);
    src.compressed = true;
    assert_eq!(
        mpp.is_supported(&primary(), &src, &src.clone()),
        Err(Rejection::COMPRESSION)
    );
}

#[test]
fn test_disabled_unit_rejects_everything() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 1);
    let src = image(64, 64, PixelFormat::Rgba8888);
    mpp.set_enabled(false);
    assert_eq!(
        mpp.is_supported(&primary(), &src, &src.clone()),
        Err(Rejection::DISABLED)
    );
    assert!(!mpp.is_assignable_state(DisplayId(0)));
}

#[test]
fn test_scaling_limits() {
    let fx = fixture();
    let fixed = unit(&fx, PhysicalType::DppG, LogicalType::DppG, 1);
    let scaler = unit(&fx, PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 1);

    let src = image(1920, 1080, PixelFormat::Rgba8888);
    let mut dst = image(960, 540, PixelFormat::Rgba8888);
    assert_eq!(fixed.is_supported(&primary(), &src, &dst), Err(Rejection::MAX_DOWNSCALE));
    assert_eq!(scaler.is_supported(&primary(), &src, &dst), Ok(()));

    dst.w = 480;
    dst.h = 270;
    assert_eq!(scaler.is_supported(&primary(), &src, &dst), Err(Rejection::MAX_DOWNSCALE));

    let small = image(100, 100, PixelFormat::Rgba8888);
    let mut big = image(1000, 1000, PixelFormat::Rgba8888);
    big.w = 1000;
    assert_eq!(scaler.is_supported(&primary(), &small, &big), Err(Rejection::MAX_UPSCALE));
}

#[test]
fn test_destination_limit_follows_rotation() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 1);
    let mut src = image(2400, 1080, PixelFormat::Rgba8888);
    src.transform = Transform::ROT_90;
    // Destination limits are checked against the rotated size
    let mut dst = image(1080, 2400, PixelFormat::Rgba8888);
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Ok(()));
    dst.h = 4200;
    dst.full_height = 4200;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::MAX_DST_SIZE));
}

#[test]
fn test_yuv_crop_alignment_skipped_for_protected_content() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::DppVgf, LogicalType::DppVgf, 1);
    let mut src = image(1920, 1080, PixelFormat::Nv12M);
    src.dataspace = Dataspace::BT601_LIMITED;
    src.x = 1;
    src.w = 1919;
    let mut dst = image(1080, 2400, PixelFormat::Rgba8888);
    dst.w = 1919;
    dst.h = 1080;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::SRC_CROP_ALIGN));

    src.w = 1918;
    dst.w = 1918;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::SRC_OFFSET_ALIGN));

    src.usage = BufferUsage::PROTECTED;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Ok(()));
}

#[test]
fn test_csc_requires_known_standard() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::DppVg, LogicalType::DppVg, 1);
    let mut src = image(1920, 1080, PixelFormat::Nv12);
    let dst = image(1920, 1080, PixelFormat::Rgba8888);
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Ok(()));
    src.dataspace.standard = ColorStandard::Film;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::CSC));

    src.dataspace = Dataspace::BT2020_PQ;
    assert_eq!(mpp.is_supported(&primary(), &src, &dst), Err(Rejection::CSC));
    let hdr = unit(&fx, PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 1);
    assert_eq!(hdr.is_supported(&primary(), &src, &dst), Ok(()));
}

#[test]
fn test_assignment_is_exclusive_per_display() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 2);
    let img = image(256, 256, PixelFormat::Rgba8888);
    let pool = CapacityPool::unlimited();

    assert!(mpp.is_assignable(&primary(), &img, &img, &pool).is_ok());
    mpp.assign(DisplayId(0), source(1, img.clone(), img.clone())).unwrap();
    assert_eq!(mpp.assign_status(), AssignStatus::Assigned(DisplayId(0)));

    assert_eq!(
        mpp.is_assignable(&external(), &img, &img, &pool),
        Err(Rejection::NOT_ASSIGNABLE)
    );
    assert!(mpp
        .assign(DisplayId(1), source(9, img.clone(), img.clone()))
        .is_err());

    // Second slot for the same display, then full
    assert!(mpp.is_assignable(&primary(), &img, &img, &pool).is_ok());
    mpp.assign(DisplayId(0), source(2, img.clone(), img.clone())).unwrap();
    assert_eq!(
        mpp.is_assignable(&primary(), &img, &img, &pool),
        Err(Rejection::NOT_ASSIGNABLE)
    );
}

#[test]
fn test_double_assignment_is_an_invariant_violation() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 4);
    let img = image(64, 64, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, img.clone(), img.clone())).unwrap();
    assert!(matches!(
        mpp.assign(DisplayId(0), source(1, img.clone(), img.clone())),
        Err(AssignError::Invariant(_))
    ));
}

#[test]
fn test_sources_are_kept_in_z_order() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 4);
    for (layer, z) in [(1, 5), (2, 1), (3, 3)] {
        let mut img = image(64, 64, PixelFormat::Rgba8888);
        img.z_order = z;
        mpp.assign(DisplayId(0), source(layer, img.clone(), img)).unwrap();
    }
    let order: Vec<u32> = mpp.sources().iter().map(|s| s.src.z_order).collect();
    assert_eq!(order, vec![1, 3, 5]);
}

#[test]
fn test_reset_frees_unit_but_keeps_reservation() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::DppG, LogicalType::DppG, 1);
    let img = image(64, 64, PixelFormat::Rgba8888);
    mpp.reserve(DisplayId(0));
    assert_eq!(
        mpp.is_assignable(&external(), &img, &img, &CapacityPool::unlimited()),
        Err(Rejection::NOT_ASSIGNABLE)
    );

    mpp.assign(DisplayId(0), source(1, img.clone(), img.clone())).unwrap();
    let id = SourceId::Layer(DisplayId(0), LayerId(1));
    assert_eq!(mpp.reset_assigned_state(Some(&id)), 1);
    assert_eq!(mpp.assign_status(), AssignStatus::Reserved(DisplayId(0)));
    assert_eq!(mpp.reset_assigned_state(None), 0);

    mpp.cancel_reservation();
    assert_eq!(mpp.assign_status(), AssignStatus::Free);
}

#[test]
fn test_capacity_budget_is_enforced() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dRgb, 1);
    let src = image(1080, 2400, PixelFormat::Rgba8888);
    let required = mpp.required_capacity_us(&src, &src);
    // 1080 * 2400 pixels at 2 pixels per cycle and 667 MHz
    assert!((required - 1080.0 * 2400.0 / 2.0 / 667.0).abs() < 1e-6);

    let pool = CapacityPool {
        used_us: 16_000.0,
        budget_us: 16_666.0,
    };
    assert_eq!(
        mpp.is_assignable(&primary(), &src, &src, &pool),
        Err(Rejection::CAPACITY)
    );
    let pool = CapacityPool {
        used_us: 0.0,
        budget_us: 16_666.0,
    };
    assert!(mpp.is_assignable(&primary(), &src, &src, &pool).is_ok());
}

#[test]
fn test_overlays_have_no_capacity_cost() {
    let fx = fixture();
    let mpp = unit(&fx, PhysicalType::DppVg, LogicalType::DppVg, 1);
    let src = image(4096, 4096, PixelFormat::Rgba8888);
    assert_eq!(mpp.required_capacity_us(&src, &src), 0.0);
}

fn composition_dst() -> ExynosImage {
    image(1080, 2400, PixelFormat::Rgba8888)
}

#[test]
fn test_post_processing_reuses_unchanged_frame() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 4);
    let src = image(1080, 1200, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src.clone(), src.clone())).unwrap();

    let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
    let outcome = mpp.do_post_processing(acquire, &composition_dst(), true).unwrap();
    assert_eq!(outcome, JobOutcome::Executed);
    assert_eq!(fx.allocator.allocated_count(), 1);
    assert_eq!(fx.engines.executed(mpp.name()), 1);
    assert_eq!(mpp.hw_state(), HwState::Running);

    let (dst, fence) = mpp.take_dst_image().unwrap();
    assert!(dst.buffer.is_some());
    let release = mpp.take_src_release_fence(0).unwrap();
    fence.unwrap().close();
    release.close();

    let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
    let outcome = mpp.do_post_processing(acquire, &composition_dst(), true).unwrap();
    assert_eq!(outcome, JobOutcome::Reused);
    assert_eq!(fx.engines.executed(mpp.name()), 1);
    assert_eq!(fx.allocator.allocated_count(), 1);
    let (reused, fence) = mpp.take_dst_image().unwrap();
    assert_eq!(reused.buffer.map(|b| b.id), dst.buffer.map(|b| b.id));
    assert!(fence.is_none());
    assert!(mpp.take_src_release_fence(0).is_none());

    // Any source change runs the engine again into the next ring slot
    mpp.reset_assigned_state(None);
    let mut moved = src.clone();
    moved.y = 10;
    moved.h = 1100;
    mpp.assign(DisplayId(0), source(1, moved.clone(), moved)).unwrap();
    let acquire = vec![None];
    let outcome = mpp.do_post_processing(acquire, &composition_dst(), true).unwrap();
    assert_eq!(outcome, JobOutcome::Executed);
    assert_eq!(fx.allocator.allocated_count(), 2);
    mpp.clear_frame_outputs();
}

#[test]
fn test_post_processing_without_skip_policy_always_runs() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dRgb, 1);
    let src = image(512, 512, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src.clone(), src.clone())).unwrap();
    for _ in 0..2 {
        let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
        let dst = image(512, 512, PixelFormat::Rgba8888);
        assert_eq!(
            mpp.do_post_processing(acquire, &dst, false).unwrap(),
            JobOutcome::Executed
        );
        mpp.clear_frame_outputs();
    }
    assert_eq!(fx.engines.executed(mpp.name()), 2);
}

#[test]
fn test_engine_failure_closes_every_fence() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::Msc, LogicalType::Msc, 1);
    let src = image(1920, 1080, PixelFormat::Nv12M);
    let dst = image(1920, 1080, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src, dst.clone())).unwrap();

    fx.engines.set_failing(mpp.name(), true);
    let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
    let err = mpp.do_post_processing(acquire, &dst, true).unwrap_err();
    assert!(matches!(err, MppError::Engine { .. }));
    assert!(mpp.take_dst_image().is_none());
    assert_eq!(tracker.stats().open(), 0);
}

#[test]
fn test_allocation_failure_closes_every_fence() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dRgb, 1);
    let src = image(512, 512, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src.clone(), src.clone())).unwrap();

    fx.allocator.fail_next_allocation();
    let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
    let err = mpp.do_post_processing(acquire, &src, true).unwrap_err();
    assert!(matches!(err, MppError::Allocation { .. }));
    assert_eq!(tracker.stats().open(), 0);
}

#[test]
fn test_overlay_cannot_post_process() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::DppG, LogicalType::DppG, 1);
    let acquire = vec![Some(tracker.create(FenceKind::Acquire, FenceOwner::Caller))];
    let err = mpp
        .do_post_processing(acquire, &composition_dst(), false)
        .unwrap_err();
    assert!(matches!(err, MppError::InvalidState { .. }));
    assert_eq!(tracker.stats().open(), 0);
}

#[test]
fn test_idle_transition_waits_for_completion_and_frees_buffers() {
    let fx = fixture();
    fx.engines.set_auto_signal(false);
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dRgb, 1);
    let src = image(256, 256, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src.clone(), src.clone())).unwrap();
    mpp.do_post_processing(vec![None], &src, true).unwrap();
    mpp.clear_frame_outputs();
    assert_eq!(mpp.hw_state(), HwState::Running);

    mpp.reset_assigned_state(None);
    mpp.request_idle();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(mpp.hw_state(), HwState::Running);

    fx.engines.signal_pending();
    assert!(mpp.wait_reaper_drained(Duration::from_secs(5)));
    assert_eq!(mpp.hw_state(), HwState::Idle);
    assert_eq!(fx.allocator.live_count(), 0);
    assert_eq!(mpp.stats().idle_transitions, 1);
    assert_eq!(tracker.stats().open(), 0);
}

#[test]
fn test_idle_transition_keeps_buffers_until_scanout_is_done() {
    let fx = fixture();
    let tracker = Arc::clone(&fx.ctx.tracker);
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dRgb, 1);
    let src = image(256, 256, PixelFormat::Rgba8888);
    mpp.assign(DisplayId(0), source(1, src.clone(), src.clone())).unwrap();
    mpp.do_post_processing(vec![None], &src, true).unwrap();

    // The panel still reads the output
    let scanout = tracker.create(FenceKind::Retire, FenceOwner::Driver);
    let signaler = scanout.dup(FenceKind::Retire, FenceOwner::Driver);
    mpp.set_dst_release_fence(scanout);
    mpp.clear_frame_outputs();

    mpp.reset_assigned_state(None);
    mpp.request_idle();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fx.allocator.live_count(), 1);
    assert_eq!(mpp.stats().buffers_freed, 0);

    signaler.signal();
    signaler.close();
    assert!(mpp.wait_reaper_drained(Duration::from_secs(5)));
    assert_eq!(mpp.hw_state(), HwState::Idle);
    assert_eq!(fx.allocator.live_count(), 0);
    assert_eq!(mpp.stats().buffers_freed, 1);
    assert_eq!(mpp.stats().fence_timeouts, 0);
    assert_eq!(tracker.stats().open(), 0);
}

#[test]
fn test_retained_buffers_survive_idle() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 4);
    let ring = mpp.dst_ring();
    let desc = BufferDescriptor {
        width: 1080,
        height: 2400,
        format: PixelFormat::Rgba8888,
        usage: BufferUsage::HW_PROCESSING,
    };
    assert_eq!(ring.reallocate(&desc).unwrap(), 3);
    assert_eq!(ring.allocated(), 3);
    // Same descriptor again is a no-op
    assert_eq!(ring.reallocate(&desc).unwrap(), 0);

    mpp.request_running(None);
    mpp.request_idle();
    assert!(mpp.wait_reaper_drained(Duration::from_secs(5)));
    assert_eq!(mpp.hw_state(), HwState::Idle);
    assert_eq!(ring.allocated(), 3);

    mpp.set_retain_buffers(false);
    drop(mpp);
    assert_eq!(fx.allocator.live_count(), 0);
}

#[test]
fn test_busy_engine_reports_busy() {
    let fx = fixture();
    let mut mpp = unit(&fx, PhysicalType::G2d, LogicalType::G2dYuv, 1);
    assert_eq!(mpp.request_priority(DisplayId(0), 1), PriorityStatus::Ready);
    fx.engines.set_busy(mpp.name(), true);
    assert_eq!(mpp.request_priority(DisplayId(0), 1), PriorityStatus::Busy);

    let mut overlay = unit(&fx, PhysicalType::DppG, LogicalType::DppG, 1);
    assert_eq!(overlay.request_priority(DisplayId(0), 1), PriorityStatus::Ready);
}

#[test]
fn test_names() {
    let fx = fixture();
    let otf = unit(&fx, PhysicalType::DppVgrfs, LogicalType::DppVgrfs, 1);
    let m2m = unit(&fx, PhysicalType::G2d, LogicalType::G2dCombo, 1);
    assert_eq!(otf.name(), "DPP_VGRFS0");
    assert_eq!(m2m.name(), "G2D0_G2D_COMBO0");
    assert_eq!(m2m.physical_name(), "G2D0");
}
