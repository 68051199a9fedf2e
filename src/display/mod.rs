//! Display state machine
//!
//! An [`ExynosDisplay`] owns the layers of one sink (panel, external
//! monitor or virtual display), its two composition targets and the
//! window-configuration backend of its display controller. A frame goes
//! through three calls:
//!
//! - [`ExynosDisplay::validate`] pre-processes the layers, runs the resource
//!   assignment and reports which layers changed composition type;
//! - [`ExynosDisplay::accept`] commits the proposed types;
//! - [`ExynosDisplay::present`] runs the memory-to-memory jobs, builds one
//!   [`WinConfig`] per hardware window, submits it and fans the retire
//!   fence out to the layers and processing units.
//!
//! A present that fails leaves a cleared screen behind, closes every fence
//! the frame held and writes a diagnostic dump.

pub mod backend;
pub mod composition;
pub mod window_config;

use crate::buffer::BufferHandle;
use crate::config::{ControlConfig, DisplayConfig, HwcControl};
use crate::error::{AssignError, HwcError, PresentError};
use crate::fence::{close_opt, Fence, FenceKind, FenceOwner, FenceSet, FenceTracker};
use crate::image::{BlendMode, Dataspace, ExynosImage, Rect};
use crate::layer::{
    ClientReason, CompositionType, ExynosLayer, LayerId, LayerSignature, OverlayPriority,
    ValidateType,
};
use crate::logging::DumpRing;
use crate::mpp::MppId;
use crate::resource::table::SourceId;
use crate::resource::{AssignReport, AssignRequest, ResourceManager};
use backend::{ControllerGeneration, WindowConfigBackend};
use composition::{CompositionInfo, CompositionKind};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use window_config::{
    clip_to_panel, validate_win_config, CompressionSource, WinConfig, WinRect, WinState,
};

/// Display identifier, stable for the lifetime of the device
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    Primary,
    External,
    Virtual,
}

/// Geometry and limits of a display, as the assignment sees them
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayInfo {
    pub id: DisplayId,
    pub kind: DisplayKind,
    pub width: u32,
    pub height: u32,
    /// Hardware windows this display may configure
    pub max_windows: usize,
    pub frame_interval_us: f64,
    pub generation: ControllerGeneration,
}

impl DisplayInfo {
    pub fn from_config(id: DisplayId, config: &DisplayConfig) -> Self {
        Self {
            id,
            kind: config.kind,
            width: config.width,
            height: config.height,
            max_windows: config
                .max_windows
                .min(config.generation.caps().max_windows),
            frame_interval_us: config.frame_interval_us(),
            generation: config.generation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RenderingState {
    None,
    Validated,
    AcceptedChange,
    Presented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Off,
    Doze,
    DozeSuspend,
    On,
}

/// Display-level request attached to a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LayerRequest {
    /// Clear the client target under this layer before composing into it
    ClearClientTarget,
}

/// Result of a validate
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidateOutcome {
    /// Layers whose proposed type differs from their current one
    pub changes: Vec<(LayerId, CompositionType)>,
    pub requests: Vec<(LayerId, LayerRequest)>,
    /// `None` when the assignment failed and every layer went to the client
    pub report: Option<AssignReport>,
}

impl ValidateOutcome {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty() || !self.requests.is_empty()
    }
}

/// Result of a present. Every fence in here belongs to the caller.
#[derive(Debug, Default)]
pub struct PresentOutcome {
    pub retire: Option<Fence>,
    pub releases: Vec<(LayerId, Fence)>,
    /// The configuration reached the controller this frame
    pub submitted: bool,
}

impl PresentOutcome {
    /// Closes every fence, for callers that do not track them
    pub fn close(self) {
        if let Some(retire) = self.retire {
            retire.close();
        }
        for (_, fence) in self.releases {
            fence.close();
        }
    }
}

/// One display
#[derive(Debug)]
pub struct ExynosDisplay {
    info: DisplayInfo,
    state: RenderingState,
    power: PowerMode,
    plugged: bool,
    layers: Vec<ExynosLayer>,
    next_layer_id: u32,
    client: CompositionInfo,
    exynos: CompositionInfo,
    /// Client composition of this frame is the previous one, unchanged
    static_skip: bool,
    backend: Box<dyn WindowConfigBackend>,
    last_configs: Option<Vec<WinConfig>>,
    last_retire: Option<Fence>,
    /// Units used by the last presented frame
    prev_units: Vec<MppId>,
    output: Option<BufferHandle>,
    output_fence: Option<Fence>,
    tracker: Arc<FenceTracker>,
    control: HwcControl,
    dumps: Arc<DumpRing>,
    last_report: Option<AssignReport>,
    frames: u64,
}

impl ExynosDisplay {
    pub fn new(
        info: DisplayInfo,
        backend: Box<dyn WindowConfigBackend>,
        tracker: Arc<FenceTracker>,
        control: HwcControl,
        dumps: Arc<DumpRing>,
    ) -> Self {
        if backend.generation() != info.generation {
            warn!(
                "{}: configured for {} but the backend drives {}",
                info.id,
                info.generation,
                backend.generation()
            );
        }
        info!(
            "{}: {:?} {}x{} with {} windows",
            info.id, info.kind, info.width, info.height, info.max_windows
        );
        Self {
            client: CompositionInfo::new(CompositionKind::Client, info.id),
            exynos: CompositionInfo::new(CompositionKind::Exynos, info.id),
            plugged: info.kind != DisplayKind::Virtual,
            info,
            state: RenderingState::None,
            power: PowerMode::On,
            layers: Vec::new(),
            next_layer_id: 1,
            static_skip: false,
            backend,
            last_configs: None,
            last_retire: None,
            prev_units: Vec::new(),
            output: None,
            output_fence: None,
            tracker,
            control,
            dumps,
            last_report: None,
            frames: 0,
        }
    }

    pub fn id(&self) -> DisplayId {
        self.info.id
    }

    pub fn info(&self) -> &DisplayInfo {
        &self.info
    }

    pub fn state(&self) -> RenderingState {
        self.state
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power
    }

    pub fn is_plugged(&self) -> bool {
        self.plugged
    }

    /// Connected and powered enough to scan out
    pub fn is_active(&self) -> bool {
        self.plugged && matches!(self.power, PowerMode::On | PowerMode::Doze)
    }

    pub fn layers(&self) -> &[ExynosLayer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&ExynosLayer> {
        self.layers.iter().find(|l| l.id() == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Result<&mut ExynosLayer, HwcError> {
        self.layers
            .iter_mut()
            .find(|l| l.id() == id)
            .ok_or(HwcError::BadLayer)
    }

    pub fn client_target(&self) -> &CompositionInfo {
        &self.client
    }

    pub fn exynos_target(&self) -> &CompositionInfo {
        &self.exynos
    }

    pub fn last_configs(&self) -> Option<&[WinConfig]> {
        self.last_configs.as_deref()
    }

    pub fn last_report(&self) -> Option<&AssignReport> {
        self.last_report.as_ref()
    }

    /// Frames presented so far, skipped ones included
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Layer state changed; the next present needs a validate first
    pub fn invalidate(&mut self) {
        self.state = RenderingState::None;
    }

    pub fn create_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_layer_id);
        self.next_layer_id += 1;
        self.layers.push(ExynosLayer::new(id, self.info.id));
        self.state = RenderingState::None;
        debug!("{}: created {}", self.info.id, id);
        id
    }

    /// Removes a layer and whatever units it still held
    pub fn destroy_layer(&mut self, id: LayerId, rm: &mut ResourceManager) -> Result<(), HwcError> {
        let index = self
            .layers
            .iter()
            .position(|l| l.id() == id)
            .ok_or(HwcError::BadLayer)?;
        rm.detach(&SourceId::Layer(self.info.id, id));
        self.layers.remove(index);
        self.state = RenderingState::None;
        debug!("{}: destroyed {}", self.info.id, id);
        Ok(())
    }

    /// Buffer the GPU renders the client composition into
    pub fn set_client_target(
        &mut self,
        target: Option<BufferHandle>,
        acquire: Option<Fence>,
        dataspace: Dataspace,
    ) {
        self.client.set_target(target, acquire, dataspace);
    }

    /// Output buffer of a virtual display for the next frame
    pub fn set_output_buffer(
        &mut self,
        buffer: BufferHandle,
        release: Option<Fence>,
    ) -> Result<(), HwcError> {
        if self.info.kind != DisplayKind::Virtual {
            if let Some(fence) = release {
                fence.close();
            }
            return Err(HwcError::Unsupported);
        }
        close_opt(&mut self.output_fence);
        self.output = Some(buffer);
        self.output_fence = release.map(|f| f.moved_to(FenceOwner::Display(self.info.id)));
        Ok(())
    }

    /// Connects or disconnects the sink. A disconnected display gives its
    /// units back.
    pub fn set_plugged(&mut self, plugged: bool, rm: &mut ResourceManager) {
        if self.plugged == plugged {
            return;
        }
        info!(
            "{}: {}",
            self.info.id,
            if plugged { "connected" } else { "disconnected" }
        );
        self.plugged = plugged;
        if !plugged {
            self.release_resources(rm);
        }
        self.state = RenderingState::None;
    }

    pub fn set_power_mode(&mut self, mode: PowerMode, rm: &mut ResourceManager) {
        if self.power == mode {
            return;
        }
        info!("{}: power {:?} -> {:?}", self.info.id, self.power, mode);
        self.power = mode;
        if !self.is_active() {
            self.release_resources(rm);
        }
        self.state = RenderingState::None;
    }

    /// Switches the panel to a new resolution. Destination buffers sized
    /// for the panel are reallocated in the background.
    pub fn set_resolution(&mut self, width: u32, height: u32, rm: &mut ResourceManager) {
        if (self.info.width, self.info.height) == (width, height) {
            return;
        }
        info!(
            "{}: resolution {}x{} -> {}x{}",
            self.info.id, self.info.width, self.info.height, width, height
        );
        self.info.width = width;
        self.info.height = height;
        self.last_configs = None;
        self.client.set_prev_signature(None);
        self.state = RenderingState::None;
        rm.request_dst_realloc(&self.info);
    }

    /// Drops every binding, fence and configuration of the display
    fn release_resources(&mut self, rm: &mut ResourceManager) {
        let display = self.info.id;
        let mut units = std::mem::take(&mut self.prev_units);
        units.extend(rm.table().display_units(display));
        rm.release_display(display, &units);

        for layer in &mut self.layers {
            layer.close_fences();
        }
        self.client.close_fences();
        self.client.reset_pass();
        self.client.set_prev_signature(None);
        self.exynos.close_fences();
        self.exynos.reset_pass();
        close_opt(&mut self.output_fence);

        if let Err(err) = self.backend.clear() {
            warn!("{}: failed to clear the controller: {}", display, err);
        }
        self.last_configs = None;
        close_opt(&mut self.last_retire);
        self.last_report = None;
        self.static_skip = false;
    }

    fn sort_layers(&mut self) {
        self.layers.sort_by_key(|l| (l.z_order(), l.id()));
    }

    fn layer_index(&self, source: &SourceId) -> Option<usize> {
        match source {
            SourceId::Layer(_, id) => self.layers.iter().position(|l| l.id() == *id),
            _ => None,
        }
    }

    /// Type reported for layer `index` by the last validate
    fn decided_type(&self, index: usize) -> CompositionType {
        let layer = &self.layers[index];
        if self.static_skip
            && self.client.contains(index)
            && layer.validate_type() == ValidateType::Client
        {
            return CompositionType::Device;
        }
        layer.reported_type()
    }

    /// Decides the composition of every layer for the next frame
    pub fn validate(&mut self, rm: &mut ResourceManager) -> Result<ValidateOutcome, HwcError> {
        let control = self.control.snapshot();
        let display = self.info.id;
        self.tracker.set_debug(control.fence_debug);
        self.sort_layers();
        self.static_skip = false;

        if self.is_active() {
            let min_dst = rm.min_scaler_output();
            for layer in &mut self.layers {
                layer.do_pre_process(&self.info, min_dst);
            }

            let result = {
                let mut req = AssignRequest {
                    info: &self.info,
                    layers: &mut self.layers,
                    client: &mut self.client,
                    exynos: &mut self.exynos,
                };
                rm.assign_resources(&mut req)
            };
            self.last_report = match result {
                Ok(report) => Some(report),
                Err(AssignError::NotConverged { iterations }) => {
                    warn!(
                        "{}: no stable assignment after {} passes, composing on the GPU",
                        display, iterations
                    );
                    None
                }
                Err(err) => {
                    let title = format!("{}: resource assignment failed: {}", display, err);
                    self.dumps.write(&title, &self.dump(rm));
                    self.last_report = None;
                    self.state = RenderingState::None;
                    return Err(err.into());
                }
            };
            self.update_static_skip(&control);
        } else {
            self.validate_inactive(rm);
        }

        let mut outcome = ValidateOutcome {
            report: self.last_report.clone(),
            ..ValidateOutcome::default()
        };
        for (index, layer) in self.layers.iter().enumerate() {
            let decided = self.decided_type(index);
            if decided != layer.committed() {
                outcome.changes.push((layer.id(), decided));
            }
            if layer.validate_type() == ValidateType::Device
                && layer.priority() == OverlayPriority::Max
                && self.client.contains(index)
            {
                outcome
                    .requests
                    .push((layer.id(), LayerRequest::ClearClientTarget));
            }
        }

        debug!(
            "{}: validated, {} changes, {} requests",
            display,
            outcome.changes.len(),
            outcome.requests.len()
        );
        self.state = RenderingState::Validated;
        Ok(outcome)
    }

    /// Nothing is scanned out: every layer goes to the client and the
    /// display keeps no unit
    fn validate_inactive(&mut self, rm: &mut ResourceManager) {
        let display = self.info.id;
        let units = std::mem::take(&mut self.prev_units);
        rm.release_display(display, &units);
        self.client.reset_pass();
        self.exynos.reset_pass();
        for layer in &mut self.layers {
            layer.reset_validate_info();
            layer.demote(ClientReason::NoResource);
        }
        if !self.layers.is_empty() {
            self.client.set_range(Some((0, self.layers.len() - 1)));
        }
        self.last_report = None;
    }

    fn update_static_skip(&mut self, control: &ControlConfig) {
        let signature: Option<Vec<LayerSignature>> = self.client.range().map(|(first, last)| {
            self.layers[first..=last]
                .iter()
                .filter(|l| l.validate_type() == ValidateType::Client)
                .map(ExynosLayer::signature)
                .collect()
        });
        let unchanged = control.skip_static
            && signature.is_some()
            && self.client.target().is_some()
            && self.client.prev_signature() == signature.as_deref();
        if unchanged {
            debug!("{}: client composition unchanged, reusing the target", self.info.id);
        }
        self.static_skip = unchanged;
        self.client.set_skip(unchanged);
        self.client.set_prev_signature(signature);
    }

    /// Commits the types proposed by the last validate
    pub fn accept(&mut self) -> Result<(), HwcError> {
        if !matches!(
            self.state,
            RenderingState::Validated | RenderingState::AcceptedChange
        ) {
            return Err(HwcError::NotValidated);
        }
        let decided: Vec<CompositionType> =
            (0..self.layers.len()).map(|i| self.decided_type(i)).collect();
        for (layer, committed) in self.layers.iter_mut().zip(decided) {
            layer.commit(committed);
        }
        self.state = RenderingState::AcceptedChange;
        Ok(())
    }

    /// Puts the validated frame on screen. `others_active` forces a
    /// submission even when the configuration did not change.
    pub fn present(
        &mut self,
        rm: &mut ResourceManager,
        others_active: bool,
    ) -> Result<PresentOutcome, HwcError> {
        match self.state {
            RenderingState::Validated => self.accept()?,
            RenderingState::AcceptedChange => {}
            _ => return Err(HwcError::NotValidated),
        }
        let display = self.info.id;
        let control = self.control.snapshot();
        self.frames += 1;

        let writes_nowhere = self.info.kind == DisplayKind::Virtual && self.output.is_none();
        if writes_nowhere && self.is_active() {
            warn!("{}: no output buffer, frame dropped", display);
        }
        let result = if self.is_active() && !writes_nowhere {
            self.present_frame(rm, &control, others_active)
        } else {
            Ok(self.present_inactive())
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail_frame(rm, &err);
                self.tracker.frame_end(display);
                return Err(err.into());
            }
        };
        self.state = RenderingState::Presented;
        self.tracker.frame_end(display);
        Ok(outcome)
    }

    fn present_inactive(&mut self) -> PresentOutcome {
        for layer in &mut self.layers {
            layer.close_fences();
        }
        self.client.close_fences();
        self.exynos.close_fences();
        close_opt(&mut self.output_fence);
        PresentOutcome::default()
    }

    fn present_frame(
        &mut self,
        rm: &mut ResourceManager,
        control: &ControlConfig,
        others_active: bool,
    ) -> Result<PresentOutcome, PresentError> {
        let display = self.info.id;
        let windows = self.info.max_windows;
        let mut configs = vec![WinConfig::default(); windows];
        let mut fences = FenceSet::with_slots(windows);
        let mut m2m_used = Vec::new();

        self.run_exynos_composition(rm, control, &mut configs, &mut fences, &mut m2m_used)?;
        for index in 0..self.layers.len() {
            match self.layers[index].validate_type() {
                ValidateType::Client => {
                    if let Some(fence) = self.layers[index].take_acquire_fence() {
                        fence.close();
                    }
                }
                ValidateType::Exynos => {}
                ValidateType::Device => self.configure_layer(
                    index,
                    rm,
                    control,
                    &mut configs,
                    &mut fences,
                    &mut m2m_used,
                )?,
            }
        }
        self.configure_client_target(rm, &mut configs, &mut fences)?;

        // Nothing lies below the bottom window
        if let Some(bottom) = configs.iter_mut().find(|c| c.is_enabled()) {
            if bottom.state == WinState::Buffer {
                bottom.blending = BlendMode::None;
            }
        }
        validate_win_config(&configs, self.info.width, self.info.height, windows)?;

        let unchanged = control.skip_window_config
            && !others_active
            && self.last_configs.as_deref() == Some(&configs[..]);
        let (retire, submitted) = match (&self.last_retire, unchanged) {
            (Some(last), true) => {
                debug!("{}: configuration unchanged, submission skipped", display);
                drop(fences);
                (last.dup(FenceKind::Retire, FenceOwner::Display(display)), false)
            }
            _ => {
                let retire = self.backend.deliver(&configs, fences.into_slots())?;
                (retire.moved_to(FenceOwner::Display(display)), true)
            }
        };
        close_opt(&mut self.output_fence);

        for layer in &mut self.layers {
            if layer.validate_type() != ValidateType::Device || layer.is_color() {
                continue;
            }
            let source = SourceId::Layer(display, layer.id());
            if rm.table().m2m(&source).is_none() {
                let owner = FenceOwner::Layer(display, layer.id());
                layer.set_release_fence(Some(retire.dup(FenceKind::Release, owner)));
            }
        }

        let units = rm.table().display_units(display);
        for &id in &units {
            let Some(mpp) = rm.mpp_mut(id) else {
                continue;
            };
            let owner = FenceOwner::Mpp(mpp.name().to_string());
            if mpp.is_otf() {
                // Running until the controller retires this frame
                mpp.request_running(Some(retire.dup(FenceKind::HwState, owner)));
                mpp.request_idle();
            } else if m2m_used.contains(&id) {
                mpp.set_dst_release_fence(retire.dup(FenceKind::Release, owner));
            }
        }
        for id in &self.prev_units {
            if units.contains(id) {
                continue;
            }
            if let Some(mpp) = rm.mpp_mut(*id) {
                if mpp.assigned_display().is_none() {
                    mpp.request_idle();
                }
            }
        }
        self.prev_units = units;

        let releases = self
            .layers
            .iter_mut()
            .filter_map(|l| {
                let id = l.id();
                l.take_release_fence()
                    .map(|f| (id, f.moved_to(FenceOwner::Caller)))
            })
            .collect();

        close_opt(&mut self.last_retire);
        let kept = retire.dup(FenceKind::Retire, FenceOwner::Display(display));
        kept.allow_pending();
        self.last_retire = Some(kept);
        self.last_configs = Some(configs);

        Ok(PresentOutcome {
            retire: Some(retire.moved_to(FenceOwner::Caller)),
            releases,
            submitted,
        })
    }

    /// Runs the blitter over the blit composition members and puts its
    /// output on the target's window
    fn run_exynos_composition(
        &mut self,
        rm: &mut ResourceManager,
        control: &ControlConfig,
        configs: &mut [WinConfig],
        fences: &mut FenceSet,
        m2m_used: &mut Vec<MppId>,
    ) -> Result<(), PresentError> {
        let Some((first, last)) = self.exynos.range() else {
            return Ok(());
        };
        let display = self.info.id;
        let mut members: Vec<SourceId> = self.layers[first..=last]
            .iter()
            .map(|l| SourceId::Layer(display, l.id()))
            .collect();
        let combo = rm.table().m2m(&members[0]).ok_or_else(|| {
            PresentError::Invariant(format!("{} has no blitter", members[0]))
        })?;
        let mpp = rm.mpp_mut(combo).ok_or_else(|| {
            PresentError::Invariant(format!("unknown processing unit {}", combo.0))
        })?;

        // The unit must blend exactly the layers of the range
        let bound: Vec<SourceId> = mpp.sources().iter().map(|s| s.id).collect();
        let mut sorted = bound.clone();
        sorted.sort();
        members.sort();
        if sorted != members {
            return Err(PresentError::Invariant(format!(
                "{} blends {:?} but the blit range holds {:?}",
                mpp.name(),
                bound,
                members
            )));
        }

        let mut acquire: Vec<Option<Fence>> = Vec::with_capacity(bound.len());
        for source in &bound {
            let fence = match self.layer_index(source) {
                Some(i) => self.layers[i].take_acquire_fence(),
                None => None,
            };
            acquire.push(fence);
        }
        let target = self.exynos.image().clone();
        mpp.do_post_processing(acquire, &target, control.skip_m2m_processing)?;
        for (k, source) in bound.iter().enumerate() {
            let mut release = mpp.take_src_release_fence(k);
            match self.layer_index(source) {
                Some(i) => self.layers[i].set_release_fence(release),
                None => close_opt(&mut release),
            }
        }
        let (image, acquire) = mpp.take_dst_image().ok_or_else(|| {
            PresentError::Invariant(format!("{} produced no output", mpp.name()))
        })?;
        m2m_used.push(combo);

        self.exynos
            .set_target(image.buffer.clone(), acquire, image.dataspace);
        self.exynos.set_image(image.clone());
        let source = self.exynos.source_id();
        let config = buffer_window(
            self.backend.as_ref(),
            &self.info,
            rm,
            source,
            &image,
            Rect::from_size(self.info.width, self.info.height),
            CompressionSource::G2d,
        )?;
        let fence = self.exynos.take_acquire_fence();
        place_window(configs, fences, self.exynos.window_index(), config, fence, source)
    }

    /// Window of one device-composited layer, through its own
    /// memory-to-memory unit when it has one
    fn configure_layer(
        &mut self,
        index: usize,
        rm: &mut ResourceManager,
        control: &ControlConfig,
        configs: &mut [WinConfig],
        fences: &mut FenceSet,
        m2m_used: &mut Vec<MppId>,
    ) -> Result<(), PresentError> {
        let display = self.info.id;
        let layer = &mut self.layers[index];
        let source = SourceId::Layer(display, layer.id());
        let window = layer.window_index();

        if layer.is_color() {
            if let Some(fence) = layer.take_acquire_fence() {
                fence.close();
            }
            let config = color_window(&self.info, source, layer.display_frame(), layer.color().argb());
            return place_window(configs, fences, window, config, None, source);
        }

        let m2m = rm.table().m2m(&source);
        let (image, acquire, producer) = match m2m {
            Some(id) => {
                let mid = layer.m2m_out_image().cloned().ok_or_else(|| {
                    PresentError::Invariant(format!("{} has a unit but no output image", source))
                })?;
                let mpp = rm.mpp_mut(id).ok_or_else(|| {
                    PresentError::Invariant(format!("unknown processing unit {}", id.0))
                })?;
                let acquire = layer.take_acquire_fence();
                mpp.do_post_processing(vec![acquire], &mid, control.skip_m2m_processing)?;
                layer.set_release_fence(mpp.take_src_release_fence(0));
                let (image, fence) = mpp.take_dst_image().ok_or_else(|| {
                    PresentError::Invariant(format!("{} produced no output", mpp.name()))
                })?;
                m2m_used.push(id);
                (image, fence, CompressionSource::G2d)
            }
            None => (
                layer.src_image().clone(),
                layer.take_acquire_fence(),
                CompressionSource::Gpu,
            ),
        };

        let config = buffer_window(
            self.backend.as_ref(),
            &self.info,
            rm,
            source,
            &image,
            layer.dst_image().rect(),
            producer,
        )?;
        place_window(configs, fences, window, config, acquire, source)
    }

    fn configure_client_target(
        &mut self,
        rm: &ResourceManager,
        configs: &mut [WinConfig],
        fences: &mut FenceSet,
    ) -> Result<(), PresentError> {
        if self.client.range().is_none() {
            // A target set for a frame without client composition
            self.client.close_fences();
            return Ok(());
        }
        let source = self.client.source_id();
        let mut image = self.client.image().clone();
        if let Some(target) = self.client.target() {
            image.format = target.format;
            image.compressed = target.compressed;
            image.buffer = Some(target.clone());
        }
        image.dataspace = self.client.dataspace();

        let config = buffer_window(
            self.backend.as_ref(),
            &self.info,
            rm,
            source,
            &image,
            Rect::from_size(self.info.width, self.info.height),
            CompressionSource::Gpu,
        )?;
        let fence = self.client.take_acquire_fence();
        place_window(configs, fences, self.client.window_index(), config, fence, source)
    }

    /// Leaves the sink blank and the frame's bookkeeping clean after a
    /// failed present
    fn fail_frame(&mut self, rm: &mut ResourceManager, err: &PresentError) {
        let display = self.info.id;
        for layer in &mut self.layers {
            layer.close_fences();
        }
        self.client.close_fences();
        self.exynos.close_fences();
        close_opt(&mut self.output_fence);
        for id in rm.table().display_units(display) {
            if let Some(mpp) = rm.mpp_mut(id) {
                mpp.clear_frame_outputs();
            }
        }

        let title = format!("{}: present failed: {}", display, err);
        self.dumps.write(&title, &self.dump(rm));

        if let Err(clear_err) = self.backend.clear() {
            error!("{}: failed to blank the screen: {}", display, clear_err);
        }
        self.last_configs = None;
        close_opt(&mut self.last_retire);
        self.state = RenderingState::None;
    }

    /// Complete state of the display for diagnostics
    pub fn dump(&self, rm: &ResourceManager) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {:?} {}x{} {} state={:?} power={:?}{} frames={}",
            self.info.id,
            self.info.kind,
            self.info.width,
            self.info.height,
            self.info.generation,
            self.state,
            self.power,
            if self.plugged { "" } else { " unplugged" },
            self.frames
        );
        for layer in &self.layers {
            layer.dump(&mut out);
        }
        self.client.dump(&mut out);
        self.exynos.dump(&mut out);
        if let Some(configs) = &self.last_configs {
            for (window, config) in configs.iter().enumerate() {
                let _ = writeln!(out, "  win{}: {}", window, config);
            }
        }
        rm.dump(&mut out);
        out.push_str(&self.tracker.dump());
        out
    }
}

fn plane_alpha(alpha: f32) -> u8 {
    (alpha.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Buffer window scanning `image` out at `dst`. `None` when nothing of
/// it is on the panel.
fn buffer_window(
    backend: &dyn WindowConfigBackend,
    info: &DisplayInfo,
    rm: &ResourceManager,
    source: SourceId,
    image: &ExynosImage,
    dst: Rect,
    producer: CompressionSource,
) -> Result<Option<WinConfig>, PresentError> {
    let channel = rm.table().otf(&source);
    let limits = channel
        .and_then(|id| rm.mpp(id))
        .map(|mpp| mpp.restrictions().src(image.restriction_class()));
    let Some((src_rect, dst_rect)) = clip_to_panel(image, dst, info.width, info.height, limits) else {
        debug!("{}: {} is off screen", info.id, source);
        return Ok(None);
    };
    let format = backend.translate_format(image.format)?;
    let buffer = image.buffer.as_ref();
    let tag_producer = image.compressed && info.generation.caps().compression_source;

    Ok(Some(WinConfig {
        state: WinState::Buffer,
        source: Some(source),
        buffer: buffer.map(|b| b.id),
        plane_fds: buffer.map(|b| b.plane_fds.clone()).unwrap_or_default(),
        src: src_rect,
        dst: dst_rect,
        format: Some(format),
        blending: image.blending,
        plane_alpha: plane_alpha(image.plane_alpha),
        transform: image.transform.bits(),
        dataspace: image.dataspace,
        color: 0,
        protection: image.is_protected(),
        compression: image.compressed,
        compression_src: if tag_producer {
            producer
        } else {
            CompressionSource::None
        },
        channel: channel.map(|id| id.0),
    }))
}

fn color_window(info: &DisplayInfo, source: SourceId, frame: Rect, argb: u32) -> Option<WinConfig> {
    let visible = frame.intersect(&Rect::from_size(info.width, info.height))?;
    if visible.is_empty() {
        return None;
    }
    Some(WinConfig {
        state: WinState::Color,
        source: Some(source),
        dst: WinRect {
            x: visible.left,
            y: visible.top,
            w: visible.width() as u32,
            h: visible.height() as u32,
            f_w: info.width,
            f_h: info.height,
        },
        plane_alpha: u8::MAX,
        color: argb,
        ..WinConfig::default()
    })
}

/// Puts `config` on `window` and its acquire fence in the frame's set
fn place_window(
    configs: &mut [WinConfig],
    fences: &mut FenceSet,
    window: Option<usize>,
    config: Option<WinConfig>,
    mut fence: Option<Fence>,
    source: SourceId,
) -> Result<(), PresentError> {
    let Some(window) = window.filter(|&w| w < configs.len()) else {
        close_opt(&mut fence);
        return Err(PresentError::Invariant(format!(
            "{} has no valid window ({:?})",
            source, window
        )));
    };
    if configs[window].is_enabled() {
        close_opt(&mut fence);
        return Err(PresentError::Invariant(format!(
            "window {} is taken by {:?} and {}",
            window, configs[window].source, source
        )));
    }
    match config {
        Some(config) => {
            configs[window] = config;
            fences.put(window, fence);
        }
        None => close_opt(&mut fence),
    }
    Ok(())
}

#[cfg(test)]
mod tests;
