//! # Exynos hardware composer core
//!
//! Decides, frame by frame, how the layers of each display reach the
//! screen: on a hardware overlay channel, through a memory-to-memory
//! scaler or blitter first, or composed by the GPU into the client target.
//!
//! ## Architecture
//!
//! - `mpp`: processing units (overlay channels, scaler, blitter), their
//!   capability checks, jobs and hardware-state reaper
//! - `resource`: the device-wide inventory and the fixed-point assignment
//! - `layer`: one layer, its pre-processing and per-frame decisions
//! - `display`: the validate / accept / present state machine and the
//!   window configuration backends
//! - `fence`: fence handles and leak tracking
//! - `device`: the display-server-facing entry points
//! - `simulated`: software collaborators for the simulator and the tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use exynos_hwc::config::HwcConfig;
//! use exynos_hwc::display::DisplayId;
//! use exynos_hwc::simulated::SimulatedDevice;
//!
//! fn main() -> anyhow::Result<()> {
//!     let sim = SimulatedDevice::new(&HwcConfig::default())?;
//!     let layer = sim.device.create_layer(DisplayId(0))?;
//!     let (validated, presented) = sim.device.run_frame(DisplayId(0))?;
//!     println!("{} changes for {}", validated.changes.len(), layer);
//!     presented.close();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod fence;
pub mod image;
pub mod layer;
pub mod logging;
pub mod mpp;
pub mod resource;
pub mod scene;
pub mod simulated;

pub use config::{HwcConfig, HwcControl};
pub use device::ExynosDevice;
pub use display::{DisplayId, ExynosDisplay, PowerMode};
pub use error::HwcError;
pub use layer::{CompositionType, ExynosLayer, LayerId};
pub use resource::ResourceManager;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
