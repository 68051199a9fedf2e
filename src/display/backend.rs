//! Window-configuration backends
//!
//! Display-controller generations differ in which pixel formats they scan
//! out and in a few configuration bits. Instead of sprinkling generation
//! checks over the present path, each generation is described by a
//! capability table and the submission itself goes through the
//! [`WindowConfigBackend`] strategy chosen when the display is created.

use super::window_config::WinConfig;
use crate::error::BackendError;
use crate::fence::Fence;
use crate::image::{DpuFormat, PixelFormat};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display-controller generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerGeneration {
    Decon8895,
    #[default]
    Decon9810,
}

/// What a controller generation supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationCaps {
    /// Hardware windows of the controller
    pub max_windows: usize,
    /// Scans out 10-bit formats
    pub ten_bit: bool,
    /// Decodes SBWC-compressed YUV
    pub sbwc: bool,
    /// Needs to be told which engine produced a compressed buffer
    pub compression_source: bool,
}

impl ControllerGeneration {
    pub fn caps(self) -> GenerationCaps {
        match self {
            ControllerGeneration::Decon8895 => GenerationCaps {
                max_windows: 7,
                ten_bit: false,
                sbwc: false,
                compression_source: false,
            },
            ControllerGeneration::Decon9810 => GenerationCaps {
                max_windows: 7,
                ten_bit: true,
                sbwc: true,
                compression_source: true,
            },
        }
    }

    /// Controller encoding of a buffer format
    pub fn translate_format(self, format: PixelFormat) -> Result<DpuFormat, BackendError> {
        let caps = self.caps();
        let unsupported = || BackendError::UnsupportedFormat(format.name().to_string());
        if format.is_10bit() && !caps.ten_bit {
            return Err(unsupported());
        }
        if format.is_sbwc() && !caps.sbwc {
            return Err(unsupported());
        }
        format.dpu_format().ok_or_else(unsupported)
    }

    pub fn name(self) -> &'static str {
        match self {
            ControllerGeneration::Decon8895 => "decon-8895",
            ControllerGeneration::Decon9810 => "decon-9810",
        }
    }
}

impl fmt::Display for ControllerGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Submission path to one display controller
pub trait WindowConfigBackend: Send + fmt::Debug {
    fn generation(&self) -> ControllerGeneration;

    /// Submits one frame. `acquire` holds one optional fence per window and
    /// is consumed on success and on failure. Returns the retire fence
    /// filled in by the driver.
    fn deliver(
        &mut self,
        configs: &[WinConfig],
        acquire: Vec<Option<Fence>>,
    ) -> Result<Fence, BackendError>;

    /// Disables every window, leaving a blank screen
    fn clear(&mut self) -> Result<(), BackendError>;

    fn translate_format(&self, format: PixelFormat) -> Result<DpuFormat, BackendError> {
        self.generation().translate_format(format)
    }
}
