//! Device facade
//!
//! [`ExynosDevice`] is what the display server talks to. It owns every
//! display behind its own lock and the resource manager behind a shared
//! one. Calls that touch both take the display lock first and the
//! resource lock second; nothing takes them in the other order.

use crate::buffer::{BufferAllocator, BufferHandle};
use crate::config::{DisplayConfig, HwcConfig, HwcControl};
use crate::display::backend::{ControllerGeneration, WindowConfigBackend};
use crate::display::{
    DisplayId, DisplayInfo, DisplayKind, ExynosDisplay, PowerMode, PresentOutcome,
    ValidateOutcome,
};
use crate::error::HwcError;
use crate::fence::{Fence, FenceTracker};
use crate::image::Dataspace;
use crate::layer::{ExynosLayer, LayerId};
use crate::logging::DumpRing;
use crate::mpp::engine::EngineFactory;
use crate::mpp::{HwState, MppContext, MppInfo};
use crate::resource::topology::inventory;
use crate::resource::{ResourceManager, DEFAULT_RESERVATION};
use anyhow::Result;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

type SharedDisplay = Arc<Mutex<ExynosDisplay>>;

/// The hardware composer device
#[derive(Debug)]
pub struct ExynosDevice {
    control: HwcControl,
    tracker: Arc<FenceTracker>,
    resources: Arc<Mutex<ResourceManager>>,
    displays: BTreeMap<DisplayId, SharedDisplay>,
    dumps: Arc<DumpRing>,
}

impl ExynosDevice {
    /// Builds the device from `config`. `backend` makes the window
    /// configuration backend of each display. Display ids follow the
    /// order of `config.displays`.
    pub fn new<F>(
        config: &HwcConfig,
        allocator: Arc<dyn BufferAllocator>,
        engines: Arc<dyn EngineFactory>,
        mut backend: F,
    ) -> Result<Self>
    where
        F: FnMut(DisplayId, &DisplayConfig, Arc<FenceTracker>) -> Box<dyn WindowConfigBackend>,
    {
        config.validate()?;

        let control = HwcControl::new(config.control.clone());
        let tracker = FenceTracker::new();
        tracker.set_debug(config.control.fence_debug);
        let dumps = Arc::new(DumpRing::new(config.dump.clone()));

        let ids = (0u32..).map(DisplayId);
        let primary = config
            .displays
            .iter()
            .zip(ids.clone())
            .find(|(d, _)| d.kind == DisplayKind::Primary)
            .map(|(d, id)| (id, d.generation));
        let generation = primary
            .map(|(_, g)| g)
            .or_else(|| config.displays.first().map(|d| d.generation))
            .unwrap_or_default();

        let ctx = MppContext {
            tracker: Arc::clone(&tracker),
            allocator,
            engines,
            capacity: config.capacity.clone(),
            resource: config.resource.clone(),
        };
        let mut resources = ResourceManager::new(
            &ctx,
            control.clone(),
            &inventory(generation),
            primary.map(|(id, _)| id),
        );

        let mut displays = BTreeMap::new();
        for (display_config, id) in config.displays.iter().zip(ids) {
            let info = DisplayInfo::from_config(id, display_config);
            if display_config.kind == DisplayKind::External {
                resources.reserve_for_display(id, DEFAULT_RESERVATION);
            }
            let display = ExynosDisplay::new(
                info,
                backend(id, display_config, Arc::clone(&tracker)),
                Arc::clone(&tracker),
                control.clone(),
                Arc::clone(&dumps),
            );
            displays.insert(id, Arc::new(Mutex::new(display)));
        }
        info!(
            "device up: {} displays, units for {}",
            displays.len(),
            generation
        );

        Ok(Self {
            control,
            tracker,
            resources: Arc::new(Mutex::new(resources)),
            displays,
            dumps,
        })
    }

    /// Runtime toggles, the administrative service's entry point
    pub fn control(&self) -> &HwcControl {
        &self.control
    }

    pub fn tracker(&self) -> &Arc<FenceTracker> {
        &self.tracker
    }

    pub fn dumps(&self) -> &Arc<DumpRing> {
        &self.dumps
    }

    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.displays.keys().copied().collect()
    }

    fn display(&self, id: DisplayId) -> Result<&SharedDisplay, HwcError> {
        self.displays.get(&id).ok_or(HwcError::BadDisplay)
    }

    /// Runs `f` on a display under its lock
    pub fn with_display<R>(
        &self,
        id: DisplayId,
        f: impl FnOnce(&ExynosDisplay) -> R,
    ) -> Result<R, HwcError> {
        Ok(f(&self.display(id)?.lock()))
    }

    /// Runs `f` on the resource manager under its lock
    pub fn with_resources<R>(&self, f: impl FnOnce(&ResourceManager) -> R) -> R {
        f(&self.resources.lock())
    }

    pub fn mpp_infos(&self) -> Vec<MppInfo> {
        self.resources.lock().infos()
    }

    pub fn create_layer(&self, display: DisplayId) -> Result<LayerId, HwcError> {
        Ok(self.display(display)?.lock().create_layer())
    }

    pub fn destroy_layer(&self, display: DisplayId, layer: LayerId) -> Result<(), HwcError> {
        let mut display = self.display(display)?.lock();
        let mut resources = self.resources.lock();
        display.destroy_layer(layer, &mut resources)
    }

    /// Edits a layer's state. The display needs a new validate afterwards.
    pub fn with_layer<R>(
        &self,
        display: DisplayId,
        layer: LayerId,
        f: impl FnOnce(&mut ExynosLayer) -> R,
    ) -> Result<R, HwcError> {
        let mut display = self.display(display)?.lock();
        let result = f(display.layer_mut(layer)?);
        display.invalidate();
        Ok(result)
    }

    pub fn set_client_target(
        &self,
        display: DisplayId,
        target: Option<BufferHandle>,
        acquire: Option<Fence>,
        dataspace: Dataspace,
    ) -> Result<(), HwcError> {
        let display = match self.display(display) {
            Ok(display) => display,
            Err(err) => {
                if let Some(fence) = acquire {
                    fence.close();
                }
                return Err(err);
            }
        };
        display.lock().set_client_target(target, acquire, dataspace);
        Ok(())
    }

    pub fn set_output_buffer(
        &self,
        display: DisplayId,
        buffer: BufferHandle,
        release: Option<Fence>,
    ) -> Result<(), HwcError> {
        let display = match self.display(display) {
            Ok(display) => display,
            Err(err) => {
                if let Some(fence) = release {
                    fence.close();
                }
                return Err(err);
            }
        };
        display.lock().set_output_buffer(buffer, release)
    }

    pub fn validate(&self, display: DisplayId) -> Result<ValidateOutcome, HwcError> {
        let mut display = self.display(display)?.lock();
        let mut resources = self.resources.lock();
        display.validate(&mut resources)
    }

    pub fn accept(&self, display: DisplayId) -> Result<(), HwcError> {
        self.display(display)?.lock().accept()
    }

    pub fn present(&self, display: DisplayId) -> Result<PresentOutcome, HwcError> {
        let shared = self.display(display)?;
        // Other displays are looked at before this one is locked
        let others_active = self
            .displays
            .iter()
            .filter(|(id, _)| **id != display)
            .any(|(_, other)| other.lock().is_active());
        let mut display = shared.lock();
        let mut resources = self.resources.lock();
        display.present(&mut resources, others_active)
    }

    /// Validate, accept and present in one go. Fences of the outcome
    /// belong to the caller.
    pub fn run_frame(&self, display: DisplayId) -> Result<(ValidateOutcome, PresentOutcome), HwcError> {
        let validated = self.validate(display)?;
        self.accept(display)?;
        let presented = self.present(display)?;
        Ok((validated, presented))
    }

    pub fn set_power_mode(&self, display: DisplayId, mode: PowerMode) -> Result<(), HwcError> {
        let mut display = self.display(display)?.lock();
        let mut resources = self.resources.lock();
        display.set_power_mode(mode, &mut resources);
        Ok(())
    }

    /// Hot-plug of an external display
    pub fn set_connected(&self, display: DisplayId, connected: bool) -> Result<(), HwcError> {
        let mut display = self.display(display)?.lock();
        if display.info().kind != DisplayKind::External {
            return Err(HwcError::Unsupported);
        }
        let id = display.id();
        let mut resources = self.resources.lock();
        if connected {
            resources.reserve_for_display(id, DEFAULT_RESERVATION);
        }
        display.set_plugged(connected, &mut resources);
        if !connected {
            resources.release_reservations(id);
        }
        Ok(())
    }

    /// Brings a virtual display up with its reserved channels
    pub fn init_virtual(&self, display: DisplayId) -> Result<(), HwcError> {
        let mut display = self.display(display)?.lock();
        if display.info().kind != DisplayKind::Virtual {
            return Err(HwcError::BadDisplay);
        }
        if display.is_plugged() {
            return Ok(());
        }
        let id = display.id();
        let mut resources = self.resources.lock();
        resources.reserve_for_display(id, DEFAULT_RESERVATION);
        display.set_plugged(true, &mut resources);
        Ok(())
    }

    pub fn deinit_virtual(&self, display: DisplayId) -> Result<(), HwcError> {
        let mut display = self.display(display)?.lock();
        if display.info().kind != DisplayKind::Virtual {
            return Err(HwcError::BadDisplay);
        }
        let id = display.id();
        let mut resources = self.resources.lock();
        display.set_plugged(false, &mut resources);
        resources.release_reservations(id);
        Ok(())
    }

    /// Switches a display to a new resolution
    pub fn set_active_config(
        &self,
        display: DisplayId,
        width: u32,
        height: u32,
    ) -> Result<(), HwcError> {
        if width == 0 || height == 0 {
            return Err(HwcError::BadParameter);
        }
        let mut display = self.display(display)?.lock();
        let mut resources = self.resources.lock();
        display.set_resolution(width, height, &mut resources);
        Ok(())
    }

    /// Blocks until every unit's reaper drained and no reallocation is in
    /// flight. Returns false on timeout.
    pub fn wait_hardware_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let resources = self.resources.lock();
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let drained = resources
            .mpps()
            .iter()
            .all(|mpp| mpp.wait_reaper_drained(remaining()));
        drained && resources.wait_realloc(remaining())
    }

    /// Units currently running, by name
    pub fn running_units(&self) -> Vec<String> {
        self.resources
            .lock()
            .mpps()
            .iter()
            .filter(|m| m.hw_state() == HwState::Running)
            .map(|m| m.name().to_string())
            .collect()
    }

    pub fn generation(&self, display: DisplayId) -> Result<ControllerGeneration, HwcError> {
        self.with_display(display, |d| d.info().generation)
    }

    /// State of every display and unit
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for display in self.displays.values() {
            let display = display.lock();
            let resources = self.resources.lock();
            let _ = writeln!(out, "{}", display.dump(&resources));
        }
        debug!("device dump: {} bytes", out.len());
        out
    }
}
