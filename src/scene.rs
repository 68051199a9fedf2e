//! Scene files for the simulator
//!
//! A scene lists the layers a display server would submit, in TOML:
//!
//! ```toml
//! frames = 3
//!
//! [[layers]]
//! display = 0
//! width = 1080
//! height = 2400
//! format = "rgba8888"
//! blend = "none"
//!
//! [[layers]]
//! display = 0
//! width = 1920
//! height = 1080
//! format = "nv12_m"
//! frame = [0, 600, 1080, 1208]
//! z = 1
//! ```
//!
//! [`run_scene`] plays the scene on a device for the requested number of
//! frames and records, per frame and display, what was decided.

use crate::buffer::{BufferHandle, BufferUsage};
use crate::device::ExynosDevice;
use crate::display::window_config::WinConfig;
use crate::display::{DisplayId, DisplayKind};
use crate::fence::{FenceKind, FenceOwner};
use crate::image::{BlendMode, Dataspace, FRect, PixelFormat, Rect, Transform};
use crate::layer::{ClientReason, Color, CompositionType, LayerFlags, LayerId};
use crate::resource::AssignReport;
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default = "Scene::default_frames")]
    pub frames: u32,
    #[serde(default)]
    pub layers: Vec<SceneLayer>,
}

/// One layer as the display server describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLayer {
    #[serde(default)]
    pub display: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default = "SceneLayer::default_format")]
    pub format: PixelFormat,
    /// Source crop, the whole buffer when absent
    #[serde(default)]
    pub crop: Option<[f32; 4]>,
    /// Destination on the display, the buffer size at the origin when absent
    #[serde(default)]
    pub frame: Option<[i32; 4]>,
    /// Z-order, the layer's position in the file when absent
    #[serde(default)]
    pub z: Option<u32>,
    #[serde(default = "SceneLayer::default_composition")]
    pub composition: CompositionType,
    #[serde(default)]
    pub blend: BlendMode,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub dataspace: Option<Dataspace>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default = "SceneLayer::default_plane_alpha")]
    pub plane_alpha: f32,
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default)]
    pub flags: LayerFlags,
    /// A new buffer every frame instead of the same one
    #[serde(default)]
    pub animated: bool,
}

impl Scene {
    fn default_frames() -> u32 {
        1
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scene file: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid scene file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let scene: Scene = toml::from_str(contents).context("Failed to parse scene")?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn validate(&self) -> Result<()> {
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.width == 0 || layer.height == 0 {
                anyhow::bail!("Layer {} has an empty buffer", index);
            }
            if !(0.0..=1.0).contains(&layer.plane_alpha) {
                anyhow::bail!(
                    "Layer {} plane_alpha {} is outside [0, 1]",
                    index,
                    layer.plane_alpha
                );
            }
            if let Some([l, t, r, b]) = layer.frame {
                if r <= l || b <= t {
                    anyhow::bail!("Layer {} has an empty frame", index);
                }
            }
        }
        Ok(())
    }

    /// Displays the scene draws on
    pub fn displays(&self) -> BTreeSet<DisplayId> {
        self.layers.iter().map(|l| DisplayId(l.display)).collect()
    }
}

impl SceneLayer {
    fn default_format() -> PixelFormat {
        PixelFormat::Rgba8888
    }

    fn default_composition() -> CompositionType {
        CompositionType::Device
    }

    fn default_plane_alpha() -> f32 {
        1.0
    }

    fn usage(&self) -> BufferUsage {
        let mut usage = BufferUsage::COMPOSER_OVERLAY | BufferUsage::GPU_TEXTURE;
        if self.protected {
            usage |= BufferUsage::PROTECTED;
        }
        if self.secure {
            usage |= BufferUsage::PROTECTED | BufferUsage::SECURE;
        }
        usage
    }

    fn buffer(&self) -> BufferHandle {
        BufferHandle::new(self.width, self.height, self.format, self.usage())
            .with_compression(self.compressed)
    }
}

/// Decision for one layer in one frame
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub layer: LayerId,
    pub composition: CompositionType,
    pub window: Option<usize>,
    pub client_reason: Option<ClientReason>,
}

/// What one display did in one frame
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame: u32,
    pub display: DisplayId,
    pub changes: usize,
    pub assignment: Option<AssignReport>,
    pub submitted: bool,
    pub layers: Vec<LayerReport>,
    pub windows: Vec<WinConfig>,
}

struct PlacedLayer {
    display: DisplayId,
    id: LayerId,
    buffer: Option<BufferHandle>,
}

/// Plays `scene` on `device`. Layers are created on first use, virtual
/// displays are brought up, and every fence handed back is closed.
pub fn run_scene(device: &ExynosDevice, scene: &Scene) -> Result<Vec<FrameReport>> {
    let known: BTreeSet<DisplayId> = device.display_ids().into_iter().collect();
    let displays = scene.displays();
    if let Some(missing) = displays.difference(&known).next() {
        anyhow::bail!("Scene uses {} which the device does not have", missing);
    }

    let mut kinds = BTreeMap::new();
    for &display in &displays {
        let kind = device.with_display(display, |d| d.info().kind)?;
        if kind == DisplayKind::Virtual {
            device.init_virtual(display)?;
        }
        kinds.insert(display, kind);
    }

    let mut placed = Vec::with_capacity(scene.layers.len());
    for (index, desc) in scene.layers.iter().enumerate() {
        let display = DisplayId(desc.display);
        let id = device.create_layer(display)?;
        let z = desc.z.unwrap_or(index as u32);
        device.with_layer(display, id, |layer| {
            let crop = desc
                .crop
                .map(|[l, t, r, b]| FRect::new(l, t, r, b))
                .unwrap_or_else(|| FRect::from_size(desc.width, desc.height));
            let frame = desc
                .frame
                .map(|[l, t, r, b]| Rect::new(l, t, r, b))
                .unwrap_or_else(|| Rect::from_size(desc.width, desc.height));
            layer.set_source_crop(crop);
            layer.set_display_frame(frame);
            layer.set_z_order(z);
            layer.set_blend_mode(desc.blend);
            layer.set_transform(desc.transform);
            layer.set_plane_alpha(desc.plane_alpha);
            layer.set_flags(desc.flags);
            if let Some(dataspace) = desc.dataspace {
                layer.set_dataspace(dataspace);
            }
            if let Some(color) = desc.color {
                layer.set_color(color);
            }
            layer.set_composition_type(desc.composition);
        })?;
        placed.push(PlacedLayer {
            display,
            id,
            buffer: None,
        });
    }
    info!(
        "scene: {} layers on {} displays for {} frames",
        placed.len(),
        displays.len(),
        scene.frames
    );

    let tracker = device.tracker();
    let mut targets: BTreeMap<DisplayId, BufferHandle> = BTreeMap::new();
    let mut reports = Vec::new();
    for frame in 0..scene.frames {
        for (desc, layer) in scene.layers.iter().zip(&mut placed) {
            if desc.composition == CompositionType::SolidColor {
                continue;
            }
            if layer.buffer.is_none() || desc.animated {
                layer.buffer = Some(desc.buffer());
            }
            let buffer = layer.buffer.clone();
            let acquire = tracker.create_signaled(FenceKind::Acquire, FenceOwner::Caller);
            device.with_layer(layer.display, layer.id, |l| l.set_buffer(buffer, Some(acquire)))?;
        }

        for &display in &displays {
            let (width, height) = device.with_display(display, |d| (d.info().width, d.info().height))?;
            let target = targets
                .entry(display)
                .or_insert_with(|| {
                    BufferHandle::new(
                        width,
                        height,
                        PixelFormat::Rgba8888,
                        BufferUsage::COMPOSER_OVERLAY | BufferUsage::GPU_RENDER_TARGET,
                    )
                })
                .clone();
            let acquire = tracker.create_signaled(FenceKind::Acquire, FenceOwner::Caller);
            device.set_client_target(display, Some(target), Some(acquire), Dataspace::SRGB)?;

            if kinds.get(&display) == Some(&DisplayKind::Virtual) {
                let output = BufferHandle::new(
                    width,
                    height,
                    PixelFormat::Rgba8888,
                    BufferUsage::HW_PROCESSING | BufferUsage::VIDEO_ENCODER,
                );
                device.set_output_buffer(display, output, None)?;
            }

            let (validated, presented) = device.run_frame(display)?;
            let submitted = presented.submitted;
            presented.close();

            let (layers, windows) = device.with_display(display, |d| {
                let layers = d
                    .layers()
                    .iter()
                    .map(|l| LayerReport {
                        layer: l.id(),
                        composition: l.committed(),
                        window: l.window_index(),
                        client_reason: l.client_reason(),
                    })
                    .collect();
                let windows = d
                    .last_configs()
                    .map(|c| c.iter().filter(|w| w.is_enabled()).cloned().collect())
                    .unwrap_or_default();
                (layers, windows)
            })?;
            debug!("frame {} on {}: {} changes", frame, display, validated.changes.len());
            reports.push(FrameReport {
                frame,
                display,
                changes: validated.changes.len(),
                assignment: validated.report,
                submitted,
                layers,
                windows,
            });
        }
    }
    Ok(reports)
}
