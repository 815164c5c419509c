//! Error types shared by every ironseal workflow.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for resolution, provisioning, unlock and update paths.
#[derive(Debug, Error)]
pub enum IronsealError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialise error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid key file {path}: {reason}")]
    InvalidKeyFile { path: PathBuf, reason: String },

    #[error("parameter `{0}` has no value and no default")]
    MissingParameter(String),

    #[error("invalid value for parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("cyclic parameter reference: {0}")]
    CyclicReference(String),

    #[error("invalid device layout: {0}")]
    InvalidLayout(String),

    #[error("device too small: layout needs {required_mb} MB, device offers {available_mb} MB")]
    Capacity { required_mb: u64, available_mb: u64 },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("invalid credential")]
    InvalidCredential,

    #[error("device integrity check failed: {0}")]
    DeviceIntegrity(String),

    #[error("device validity window ended at {0}")]
    Expired(String),

    #[error("device is locked")]
    Locked,

    #[error("unlock is not permitted under virtualization `{0}`")]
    Virtualized(String),

    #[error("virtualization could not be determined: {0}")]
    VirtualizationUnknown(String),

    /// The job machinery itself failed: spawn error, panic or lost result.
    #[error("background job failed: {0}")]
    Job(String),

    #[error("job already started")]
    AlreadyStarted,

    #[error("operation already in progress: {0}")]
    Busy(String),

    #[error("provider error: {0}")]
    Provider(String),
}

/// Convenience alias used throughout the crate.
pub type IronsealResult<T> = std::result::Result<T, IronsealError>;

impl IronsealError {
    /// Wrap a collaborator (backend, runner, host) failure.
    pub fn provider(err: impl std::fmt::Display) -> Self {
        IronsealError::Provider(err.to_string())
    }
}

impl From<ironseal_provider::UnknownVariant> for IronsealError {
    fn from(err: ironseal_provider::UnknownVariant) -> Self {
        IronsealError::InvalidLayout(err.to_string())
    }
}
