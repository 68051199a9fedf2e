//! Simulated hardware collaborators
//!
//! Heap-backed allocator, memory-to-memory engines and display controller
//! used by the `hwc-sim` binary, the benchmarks and the tests. Each comes
//! with a cloneable control handle to inject failures, stall completion
//! and inspect what reached the "hardware".

use crate::buffer::{BufferAllocator, BufferDescriptor, BufferHandle, BufferId};
use crate::config::HwcConfig;
use crate::device::ExynosDevice;
use crate::display::backend::{ControllerGeneration, WindowConfigBackend};
use crate::display::window_config::WinConfig;
use crate::display::DisplayId;
use crate::error::BackendError;
use crate::fence::{Fence, FenceKind, FenceOwner, FenceTracker, SyncPoint};
use crate::mpp::engine::{EngineFactory, EngineImageInfo, EngineOutput, M2mEngine, PriorityStatus};
use crate::mpp::PhysicalType;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct HeapState {
    allocated: u64,
    live: HashSet<BufferId>,
    fail_next: bool,
}

/// Allocator handing out plain handles and counting them
#[derive(Debug, Default)]
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Buffers allocated since creation
    pub fn allocated_count(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Buffers allocated and not freed yet
    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn fail_next_allocation(&self) {
        self.state.lock().fail_next = true;
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, desc: &BufferDescriptor) -> Result<BufferHandle, String> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(format!(
                "out of memory for {}x{} {}",
                desc.width, desc.height, desc.format
            ));
        }
        let handle = BufferHandle::new(desc.width, desc.height, desc.format, desc.usage);
        state.allocated += 1;
        state.live.insert(handle.id);
        trace!("allocated buffer {} ({} bytes)", handle.id.0, handle.size_bytes());
        Ok(handle)
    }

    fn free(&self, handle: BufferHandle) {
        if !self.state.lock().live.remove(&handle.id) {
            warn!("buffer {} freed twice", handle.id.0);
        }
    }
}

#[derive(Debug, Default, Clone)]
struct UnitState {
    executed: u64,
    failing: bool,
    busy: bool,
}

#[derive(Debug)]
struct EngineShared {
    units: HashMap<String, UnitState>,
    auto_signal: bool,
    pending: Vec<Arc<SyncPoint>>,
    last_job: HashMap<String, EngineImageInfo>,
}

impl Default for EngineShared {
    fn default() -> Self {
        Self {
            units: HashMap::new(),
            auto_signal: true,
            pending: Vec::new(),
            last_job: HashMap::new(),
        }
    }
}

/// Control handle shared by every simulated engine of one factory
#[derive(Debug, Clone, Default)]
pub struct SimEngineControl {
    shared: Arc<Mutex<EngineShared>>,
}

impl SimEngineControl {
    /// Jobs run by the unit named `unit`
    pub fn executed(&self, unit: &str) -> u64 {
        self.shared
            .lock()
            .units
            .get(unit)
            .map_or(0, |u| u.executed)
    }

    /// Jobs run by every unit
    pub fn total_executed(&self) -> u64 {
        self.shared.lock().units.values().map(|u| u.executed).sum()
    }

    pub fn last_job(&self, unit: &str) -> Option<EngineImageInfo> {
        self.shared.lock().last_job.get(unit).cloned()
    }

    /// Makes every job of `unit` fail before it produces a fence
    pub fn set_failing(&self, unit: &str, failing: bool) {
        self.shared
            .lock()
            .units
            .entry(unit.to_string())
            .or_default()
            .failing = failing;
    }

    /// Makes `unit` answer busy to priority requests
    pub fn set_busy(&self, unit: &str, busy: bool) {
        self.shared
            .lock()
            .units
            .entry(unit.to_string())
            .or_default()
            .busy = busy;
    }

    /// With auto-signal off, jobs complete only on [`Self::signal_pending`]
    pub fn set_auto_signal(&self, auto_signal: bool) {
        self.shared.lock().auto_signal = auto_signal;
    }

    /// Completes every job still in flight
    pub fn signal_pending(&self) {
        let pending = std::mem::take(&mut self.shared.lock().pending);
        for point in pending {
            point.signal();
        }
    }
}

#[derive(Debug)]
struct SimEngine {
    unit: String,
    physical: PhysicalType,
    tracker: Arc<FenceTracker>,
    control: SimEngineControl,
}

impl M2mEngine for SimEngine {
    fn execute(&mut self, info: &EngineImageInfo) -> Result<EngineOutput, String> {
        let mut shared = self.control.shared.lock();
        let auto_signal = shared.auto_signal;
        let unit = shared.units.entry(self.unit.clone()).or_default();
        if unit.failing {
            return Err(format!("{} rejected the job", self.unit));
        }
        let valid = matches!(
            (self.physical, info),
            (PhysicalType::Msc, EngineImageInfo::Scaler(_)) | (PhysicalType::G2d, EngineImageInfo::Blit(_))
        );
        if !valid {
            return Err(format!("{} cannot run this kind of job", self.unit));
        }
        unit.executed += 1;
        shared.last_job.insert(self.unit.clone(), info.clone());

        let point = Arc::new(SyncPoint::new());
        let dst_acquire =
            self.tracker
                .create_on(Arc::clone(&point), FenceKind::MppOutput, FenceOwner::Driver);
        let src_release = (0..info.source_count())
            .map(|_| {
                self.tracker
                    .create_on(Arc::clone(&point), FenceKind::Release, FenceOwner::Driver)
            })
            .collect();
        if auto_signal {
            point.signal();
        } else {
            shared.pending.push(point);
        }
        debug!("{}: job with {} sources", self.unit, info.source_count());
        Ok(EngineOutput {
            dst_acquire,
            src_release,
        })
    }

    fn request_priority(&mut self, _display: DisplayId, _priority: u32) -> PriorityStatus {
        let shared = self.control.shared.lock();
        match shared.units.get(&self.unit) {
            Some(unit) if unit.busy => PriorityStatus::Busy,
            _ => PriorityStatus::Ready,
        }
    }

    fn stop(&mut self) {
        debug!("{}: stopped", self.unit);
    }
}

/// Builds [`SimEngine`]s sharing one control handle
#[derive(Debug)]
pub struct SimEngineFactory {
    control: SimEngineControl,
}

impl SimEngineFactory {
    pub fn new(control: SimEngineControl) -> Self {
        Self { control }
    }
}

impl EngineFactory for SimEngineFactory {
    fn create(
        &self,
        physical: PhysicalType,
        unit: &str,
        tracker: Arc<FenceTracker>,
    ) -> Box<dyn M2mEngine> {
        Box::new(SimEngine {
            unit: unit.to_string(),
            physical,
            tracker,
            control: self.control.clone(),
        })
    }
}

#[derive(Debug)]
struct DeconState {
    submissions: u64,
    clears: u64,
    last_config: Option<Vec<WinConfig>>,
    fail_next: bool,
    auto_signal: bool,
    pending: Vec<Arc<SyncPoint>>,
}

impl Default for DeconState {
    fn default() -> Self {
        Self {
            submissions: 0,
            clears: 0,
            last_config: None,
            fail_next: false,
            auto_signal: true,
            pending: Vec::new(),
        }
    }
}

/// Control handle of one [`SimulatedDecon`]
#[derive(Debug, Clone, Default)]
pub struct DeconControl {
    state: Arc<Mutex<DeconState>>,
}

impl DeconControl {
    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn clears(&self) -> u64 {
        self.state.lock().clears
    }

    /// Configuration of the last accepted submission. `None` after a clear.
    pub fn last_config(&self) -> Option<Vec<WinConfig>> {
        self.state.lock().last_config.clone()
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next = true;
    }

    /// With auto-signal off, retire fences signal only on [`Self::signal_all`]
    pub fn set_auto_signal(&self, auto_signal: bool) {
        self.state.lock().auto_signal = auto_signal;
    }

    pub fn signal_all(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending);
        for point in pending {
            point.signal();
        }
    }
}

/// Display controller that accepts every valid configuration
#[derive(Debug)]
pub struct SimulatedDecon {
    generation: ControllerGeneration,
    tracker: Arc<FenceTracker>,
    control: DeconControl,
}

impl SimulatedDecon {
    pub fn new(
        generation: ControllerGeneration,
        tracker: Arc<FenceTracker>,
        control: DeconControl,
    ) -> Self {
        Self {
            generation,
            tracker,
            control,
        }
    }
}

impl WindowConfigBackend for SimulatedDecon {
    fn generation(&self) -> ControllerGeneration {
        self.generation
    }

    fn deliver(
        &mut self,
        configs: &[WinConfig],
        acquire: Vec<Option<Fence>>,
    ) -> Result<Fence, BackendError> {
        // The driver owns the acquire fences from here on
        for fence in acquire.into_iter().flatten() {
            fence.close();
        }

        let mut state = self.control.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(BackendError::Submit("ioctl WIN_CONFIG failed".into()));
        }
        state.submissions += 1;
        state.last_config = Some(configs.to_vec());

        let point = Arc::new(SyncPoint::new());
        let retire = self
            .tracker
            .create_on(Arc::clone(&point), FenceKind::Retire, FenceOwner::Driver);
        if state.auto_signal {
            point.signal();
        } else {
            state.pending.push(point);
        }
        trace!(
            "{}: frame {} with {} windows",
            self.generation,
            state.submissions,
            configs.iter().filter(|c| c.is_enabled()).count()
        );
        Ok(retire)
    }

    fn clear(&mut self) -> Result<(), BackendError> {
        let mut state = self.control.state.lock();
        state.clears += 1;
        state.last_config = None;
        Ok(())
    }
}

/// Device wired to simulated collaborators, with their control handles
#[derive(Debug)]
pub struct SimulatedDevice {
    pub device: ExynosDevice,
    pub allocator: Arc<HeapAllocator>,
    pub engines: SimEngineControl,
    pub decons: BTreeMap<DisplayId, DeconControl>,
}

impl SimulatedDevice {
    pub fn new(config: &HwcConfig) -> anyhow::Result<Self> {
        let allocator = HeapAllocator::new();
        let engines = SimEngineControl::default();
        let mut decons = BTreeMap::new();
        let device = ExynosDevice::new(
            config,
            allocator.clone(),
            Arc::new(SimEngineFactory::new(engines.clone())),
            |id, display, tracker| {
                let control = DeconControl::default();
                decons.insert(id, control.clone());
                Box::new(SimulatedDecon::new(display.generation, tracker, control))
            },
        )?;
        Ok(Self {
            device,
            allocator,
            engines,
            decons,
        })
    }

    /// Controller of `display`
    pub fn decon(&self, display: DisplayId) -> Option<&DeconControl> {
        self.decons.get(&display)
    }
}
