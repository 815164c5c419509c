//! Core building blocks shared by the ironseal binaries.
//!
//! Template resolution, provisioning, metadata sealing and the runtime unlock
//! and update machinery live here so the daemon and CLI only wire collaborators
//! together.

pub mod config;
pub mod crypto;
pub mod error;
pub mod host;
pub mod job;
pub mod keyfile;
pub mod logging;
pub mod metadata;
pub mod service;
pub mod template;
pub mod unlock;
pub mod update;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigFormat, CryptoCfg, DeviceCfg, RuntimeConfig, UnlockCfg, UpdatesCfg};
pub use crypto::Credential;
pub use error::{IronsealError, IronsealResult};
pub use host::{HostControl, TerminationControl, TerminationMode};
pub use job::{Job, JobError, JobState, Progress};
pub use metadata::DeviceMetadata;
pub use service::{Event, IronsealService, RuntimeContext};
pub use template::{resolve, DeviceFormatPlan, FormatTemplate};
pub use unlock::{FailureReason, UnlockState};
pub use update::{
    publish_image, BuildVersion, DirectoryUpdateSource, FileImageInstaller, ImageInstaller,
    UpdateAction, UpdateSource,
};
