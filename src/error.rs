//! Error types for the hardware composer
//!
//! Two layers of errors exist. [`HwcError`] is what the display-server
//! facing API returns, with the stable numeric codes of the HWC2 protocol.
//! The internal enums below describe failures of individual subsystems and
//! convert into an [`HwcError`] at the protocol boundary.
//!
//! Capability rejections are not errors: they are reported as
//! [`crate::mpp::Rejection`] bitmasks and resolved inside the resource
//! manager.

use thiserror::Error;

/// Protocol-level result codes
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum HwcError {
    #[error("bad config")]
    BadConfig = 1,
    #[error("bad display")]
    BadDisplay = 2,
    #[error("bad layer")]
    BadLayer = 3,
    #[error("bad parameter")]
    BadParameter = 4,
    #[error("validation produced changes the client has not accepted")]
    HasChanges = 5,
    #[error("no resources")]
    NoResources = 6,
    #[error("display has not been validated")]
    NotValidated = 7,
    #[error("unsupported")]
    Unsupported = 8,
}

impl HwcError {
    /// Numeric code as defined by the composer protocol
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Failures of the resource assignment algorithm
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssignError {
    /// The fixed-point iteration hit its ceiling. Every layer has already
    /// been moved to client composition when this is returned.
    #[error("resource assignment did not converge after {iterations} passes")]
    NotConverged { iterations: u32 },

    /// Not even the client composition target could get an overlay.
    #[error("no overlay can carry the client composition target")]
    ClientTargetUnassignable,

    /// Bookkeeping disagrees with the layer list
    #[error("assignment invariant violated: {0}")]
    Invariant(String),
}

/// Failures of a processing unit while executing a frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MppError {
    #[error("{unit}: engine failed: {reason}")]
    Engine { unit: String, reason: String },

    #[error("{unit}: destination buffer allocation failed: {reason}")]
    Allocation { unit: String, reason: String },

    #[error("{unit}: {reason}")]
    InvalidState { unit: String, reason: String },
}

/// Failures reported by a window-configuration backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("window configuration submit failed: {0}")]
    Submit(String),

    #[error("pixel format {0} has no display-controller encoding")]
    UnsupportedFormat(String),
}

/// Numeric validation failures of a window configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WinConfigError {
    #[error("window {window}: destination {detail} is outside the panel")]
    DestinationOutOfBounds { window: usize, detail: String },

    #[error("window {window}: source crop {detail} is invalid")]
    InvalidCrop { window: usize, detail: String },

    #[error("window {window}: source crop {detail} is misaligned")]
    MisalignedCrop { window: usize, detail: String },

    #[error("windows {first} and {second} share DPP channel {channel}")]
    ChannelConflict {
        first: usize,
        second: usize,
        channel: usize,
    },

    #[error("{count} windows configured but the controller has {max}")]
    TooManyWindows { count: usize, max: usize },
}

/// Anything that can make a frame presentation fail
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresentError {
    #[error(transparent)]
    Mpp(#[from] MppError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    WinConfig(#[from] WinConfigError),

    #[error("present invariant violated: {0}")]
    Invariant(String),
}

impl From<AssignError> for HwcError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::NotConverged { .. } | AssignError::ClientTargetUnassignable => {
                HwcError::NoResources
            }
            AssignError::Invariant(_) => HwcError::BadConfig,
        }
    }
}

impl From<PresentError> for HwcError {
    fn from(err: PresentError) -> Self {
        match err {
            PresentError::Backend(BackendError::UnsupportedFormat(_)) => HwcError::Unsupported,
            PresentError::Mpp(_) | PresentError::Backend(_) => HwcError::NoResources,
            PresentError::WinConfig(_) | PresentError::Invariant(_) => HwcError::BadConfig,
        }
    }
}
