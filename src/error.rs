//! Error types for SMC access, value decoding and configuration.
//!
//! Only connection-open failures ([`SmcError::NoDeviceFound`], [`SmcError::NotPrivileged`],
//! [`SmcError::OpenFailed`]) reach callers of the reading functions. Per-key failures are
//! absorbed and turned into "no reading".

use std::io;
use std::path::PathBuf;

use crate::smc::{Quantity, SmcKey, TypeTag};

#[derive(thiserror::Error, Debug)]
pub enum SmcError {
    // ============================================================================
    // Connection
    // ============================================================================
    #[error("no AppleSMC service found in the IOKit registry")]
    NoDeviceFound,

    #[error("SMC access denied; reading sensors may require elevated privileges")]
    NotPrivileged,

    #[error("failed to open SMC service (IOKit status {0:#010x})")]
    OpenFailed(i32),

    // ============================================================================
    // Per-key transport
    // ============================================================================
    #[error("SMC call for key {key} failed with IOKit status {status:#010x}")]
    TransportFailure { key: SmcKey, status: i32 },

    #[error("SMC key {0} not found")]
    KeyNotFound(SmcKey),

    #[error("SMC returned result code {code} for key {key}")]
    SmcStatus { key: SmcKey, code: u8 },

    #[error("SMC key {key} declared {size} bytes, more than the 32-byte buffer")]
    DataSizeOverflow { key: SmcKey, size: u32 },

    #[error("SMC key enumeration failed at index {index} (status {status})")]
    Enumeration { index: u32, status: i32 },

    #[error("SMC key {key} could not be decoded: {source}")]
    Decode {
        key: SmcKey,
        #[source]
        source: DecodeError,
    },

    #[error("invalid SMC key {0:?}: expected exactly 4 ASCII characters")]
    InvalidKey(String),
}

impl SmcError {
    /// True for failures raised while opening the connection, as opposed to failures of a
    /// single key read.
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NoDeviceFound | Self::NotPrivileged | Self::OpenFailed(_)
        )
    }
}

/// Reasons a successfully transported value produced no reading.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("key returned no data")]
    Empty,

    #[error("unsupported data type {0}")]
    UnsupportedType(TypeTag),

    #[error("data type {data_type} cannot be decoded from {actual} bytes")]
    Length { data_type: TypeTag, actual: usize },

    #[error("data type {found} is not a valid encoding for {quantity}")]
    TypeMismatch { quantity: Quantity, found: TypeTag },

    #[error("{value} is outside the plausible range ({min}, {max})")]
    OutOfRange { value: f64, min: f64, max: f64 },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures of the IOReport energy sampler. These never reach callers of the readings; they
/// only decide whether the SMC power keys are used instead.
#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("IOReport has no channels in group {0:?}")]
    MissingChannels(String),

    #[error("failed to create IOReport subscription")]
    SubscriptionFailed,

    #[error("failed to take IOReport sample")]
    SampleFailed,
}
