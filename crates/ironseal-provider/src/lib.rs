#![forbid(unsafe_code)]

//! Collaborator contracts shared across ironseal.
//!
//! The core crate composes and sequences these primitives; concrete system
//! integrations live in `ironseal-luks` and tests substitute in-memory fakes.

pub mod command;
pub mod device;

pub use command::{CommandOutput, CommandRunner};
pub use device::{
    partition_node_name, DeviceBackend, EncryptionKind, FilesystemKind, MetadataState, PartitionSlot, PartitionType,
    TableKind, UnknownVariant,
};
