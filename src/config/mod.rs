//! Configuration management for the hardware composer
//!
//! This module handles loading, parsing and validating configuration from
//! TOML files. It carries the per-SoC calibration values (capacity model,
//! retry bound, buffer counts), the display inventory, and the runtime
//! control toggles that the administrative service flips while the
//! composer runs.
//!
//! The toggles are not ambient globals: [`HwcControl`] is created once at
//! start-up and handed by reference to the resource manager and to every
//! display, which read a consistent snapshot at the start of each pass.

use crate::display::backend::ControllerGeneration;
use crate::display::DisplayKind;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Main configuration struct containing every composer setting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HwcConfig {
    /// Runtime control toggles (initial values)
    #[serde(default)]
    pub control: ControlConfig,

    /// Resource assignment and processing unit settings
    #[serde(default)]
    pub resource: ResourceConfig,

    /// Admission-control capacity model for memory-to-memory units
    #[serde(default)]
    pub capacity: CapacityConfig,

    /// Diagnostic dump ring
    #[serde(default)]
    pub dump: DumpConfig,

    /// Display sinks present on this device
    #[serde(default = "HwcConfig::default_displays")]
    pub displays: Vec<DisplayConfig>,
}

/// How overlapping client/blit composition ranges are resolved when both
/// candidates move the same number of layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverlapTieBreak {
    /// Shrink the blit-composition range (move its layers to the client)
    #[default]
    PreferClient,
    /// Shrink the client-composition range (move its layers to the blitter)
    PreferBlit,
}

/// Runtime toggles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Send every layer to client (GPU) composition
    pub force_gpu: bool,

    /// Reuse the previous client target when the client-composited layer
    /// set did not change
    pub skip_static: bool,

    /// Let memory-to-memory units reuse last frame's output when all of
    /// their sources are unchanged
    pub skip_m2m_processing: bool,

    /// Skip the controller submission when the window configuration is
    /// identical to the last one
    pub skip_window_config: bool,

    /// Allow the secure DMA channel to carry the client target when the
    /// client range is the topmost one
    pub secure_dma_for_client: bool,

    /// Allow the blitter to pre-compose layers that got no overlay
    pub use_blit_composition: bool,

    /// Greedily pull adjacent device layers into the blit composition
    pub maximize_blitter: bool,

    /// Tie-break for overlapping composition ranges
    pub overlap_tie_break: OverlapTieBreak,

    /// Log every fence transition
    pub fence_debug: bool,

    /// Processing units disabled by the administrator, by name
    pub disabled_mpps: Vec<String>,
}

/// Resource manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    /// Ceiling of the fixed-point assignment iteration
    pub max_assign_iterations: u32,

    /// Destination buffers per memory-to-memory unit
    pub dst_buffer_count: usize,

    /// Bounded wait of the fence-reaping workers (milliseconds)
    pub fence_wait_timeout_ms: u64,
}

/// Capacity model constants. Required time of a job is
/// `pixels / pixels_per_cycle / clock`, summed across every logical
/// partition of one physical unit and compared against
/// `budget_ratio * frame interval`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacityConfig {
    pub g2d_clock_mhz: f64,
    pub g2d_ppc_rgb: f64,
    pub g2d_ppc_yuv: f64,
    pub msc_clock_mhz: f64,
    pub msc_ppc_rgb: f64,
    pub msc_ppc_yuv: f64,
    pub budget_ratio: f64,
}

/// Diagnostic dump settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DumpConfig {
    /// Directory of the dump ring (dumps only go to the log when unset)
    pub directory: Option<PathBuf>,

    /// Number of files in the ring
    pub max_files: usize,

    /// Per-file size cap in bytes
    pub max_file_size: u64,
}

/// One display sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    pub kind: DisplayKind,
    pub width: u32,
    pub height: u32,
    #[serde(default = "DisplayConfig::default_refresh_hz")]
    pub refresh_hz: u32,
    pub max_windows: usize,
    #[serde(default)]
    pub generation: ControllerGeneration,
}

impl Default for HwcConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            resource: ResourceConfig::default(),
            capacity: CapacityConfig::default(),
            dump: DumpConfig::default(),
            displays: Self::default_displays(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            force_gpu: false,
            skip_static: false,
            skip_m2m_processing: true,
            skip_window_config: false,
            secure_dma_for_client: true,
            use_blit_composition: true,
            maximize_blitter: false,
            overlap_tie_break: OverlapTieBreak::PreferClient,
            fence_debug: false,
            disabled_mpps: Vec::new(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_assign_iterations: 200,
            dst_buffer_count: 3,
            fence_wait_timeout_ms: 3000,
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            g2d_clock_mhz: 667.0,
            g2d_ppc_rgb: 2.0,
            g2d_ppc_yuv: 1.0,
            msc_clock_mhz: 533.0,
            msc_ppc_rgb: 2.0,
            msc_ppc_yuv: 2.0,
            budget_ratio: 1.0,
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_files: 4,
            max_file_size: 512 * 1024,
        }
    }
}

impl DisplayConfig {
    fn default_refresh_hz() -> u32 {
        60
    }

    /// Primary panel of the reference board
    pub fn primary() -> Self {
        Self {
            kind: DisplayKind::Primary,
            width: 1080,
            height: 2400,
            refresh_hz: 60,
            max_windows: 7,
            generation: ControllerGeneration::Decon9810,
        }
    }

    pub fn external() -> Self {
        Self {
            kind: DisplayKind::External,
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            max_windows: 4,
            generation: ControllerGeneration::Decon9810,
        }
    }

    pub fn virtual_display() -> Self {
        Self {
            kind: DisplayKind::Virtual,
            width: 1920,
            height: 1080,
            refresh_hz: 60,
            max_windows: 4,
            generation: ControllerGeneration::Decon9810,
        }
    }

    /// Frame interval in microseconds
    pub fn frame_interval_us(&self) -> f64 {
        1_000_000.0 / f64::from(self.refresh_hz.max(1))
    }
}

impl HwcConfig {
    fn default_displays() -> Vec<DisplayConfig> {
        vec![
            DisplayConfig::primary(),
            DisplayConfig::external(),
            DisplayConfig::virtual_display(),
        ]
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: HwcConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.resource.max_assign_iterations == 0 {
            anyhow::bail!("Invalid max_assign_iterations: must be at least 1");
        }

        if self.resource.dst_buffer_count < 2 {
            anyhow::bail!(
                "Invalid dst_buffer_count {}: processing units need at least double buffering",
                self.resource.dst_buffer_count
            );
        }

        let capacity = &self.capacity;
        let constants = [
            ("g2d_clock_mhz", capacity.g2d_clock_mhz),
            ("g2d_ppc_rgb", capacity.g2d_ppc_rgb),
            ("g2d_ppc_yuv", capacity.g2d_ppc_yuv),
            ("msc_clock_mhz", capacity.msc_clock_mhz),
            ("msc_ppc_rgb", capacity.msc_ppc_rgb),
            ("msc_ppc_yuv", capacity.msc_ppc_yuv),
            ("budget_ratio", capacity.budget_ratio),
        ];
        for (name, value) in constants {
            if !(value.is_finite() && value > 0.0) {
                anyhow::bail!("Invalid capacity.{}: must be a positive number", name);
            }
        }

        if self.dump.max_files == 0 {
            anyhow::bail!("Invalid dump.max_files: must be at least 1");
        }

        if self.displays.is_empty() {
            anyhow::bail!("At least one display must be configured");
        }

        let primaries = self
            .displays
            .iter()
            .filter(|d| d.kind == DisplayKind::Primary)
            .count();
        if primaries > 1 {
            anyhow::bail!("Only one primary display may be configured, found {}", primaries);
        }

        for display in &self.displays {
            if display.width == 0 || display.height == 0 {
                anyhow::bail!("Display {:?} has a zero dimension", display.kind);
            }
            if display.max_windows == 0 {
                anyhow::bail!("Display {:?} needs at least one window", display.kind);
            }
            if display.refresh_hz == 0 {
                anyhow::bail!("Display {:?} has a zero refresh rate", display.kind);
            }
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}

/// Thread-safe runtime control flags.
///
/// Cloning shares the underlying flags. Readers take a [`snapshot`] once per
/// pass so a toggle flipped mid-frame takes effect on the next frame.
///
/// [`snapshot`]: HwcControl::snapshot
#[derive(Debug, Clone, Default)]
pub struct HwcControl {
    inner: Arc<RwLock<ControlConfig>>,
}

impl HwcControl {
    pub fn new(initial: ControlConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Consistent copy of every flag
    pub fn snapshot(&self) -> ControlConfig {
        self.inner.read().clone()
    }

    pub fn force_gpu(&self) -> bool {
        self.inner.read().force_gpu
    }

    pub fn set_force_gpu(&self, enabled: bool) {
        self.inner.write().force_gpu = enabled;
    }

    pub fn set_skip_static(&self, enabled: bool) {
        self.inner.write().skip_static = enabled;
    }

    pub fn set_skip_m2m_processing(&self, enabled: bool) {
        self.inner.write().skip_m2m_processing = enabled;
    }

    pub fn set_skip_window_config(&self, enabled: bool) {
        self.inner.write().skip_window_config = enabled;
    }

    pub fn set_use_blit_composition(&self, enabled: bool) {
        self.inner.write().use_blit_composition = enabled;
    }

    pub fn set_maximize_blitter(&self, enabled: bool) {
        self.inner.write().maximize_blitter = enabled;
    }

    pub fn set_overlap_tie_break(&self, tie_break: OverlapTieBreak) {
        self.inner.write().overlap_tie_break = tie_break;
    }

    pub fn set_fence_debug(&self, enabled: bool) {
        self.inner.write().fence_debug = enabled;
    }

    /// Enable or disable a processing unit by name
    pub fn set_mpp_enabled(&self, name: &str, enabled: bool) {
        let mut control = self.inner.write();
        control.disabled_mpps.retain(|n| n != name);
        if !enabled {
            control.disabled_mpps.push(name.to_string());
        }
    }

    pub fn is_mpp_disabled(&self, name: &str) -> bool {
        self.inner.read().disabled_mpps.iter().any(|n| n == name)
    }
}
