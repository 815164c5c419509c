//! Block device contract used by the provisioner and the unlock path.
//!
//! Implementations own the irreversible writes. Callers are responsible for
//! sequencing them (capacity check first, rollback on failure).

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// Returned by the `FromStr` impls below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} `{}`", self.kind, self.value)
    }
}

impl Error for UnknownVariant {}

/// Partition table flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Dos,
    Gpt,
    Hybrid,
}

impl FromStr for TableKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dos" | "msdos" | "mbr" => Ok(Self::Dos),
            "gpt" => Ok(Self::Gpt),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(UnknownVariant {
                kind: "partition table type",
                value: value.to_string(),
            }),
        }
    }
}

/// Partition table entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionType {
    Bios,
    Efi,
    Linux,
}

impl PartitionType {
    /// Boot-type entries are limited to one per device.
    pub fn is_boot(self) -> bool {
        matches!(self, Self::Bios | Self::Efi)
    }
}

impl FromStr for PartitionType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BIOS" | "BOOT" => Ok(Self::Bios),
            "EFI" => Ok(Self::Efi),
            "LINUX" => Ok(Self::Linux),
            _ => Err(UnknownVariant {
                kind: "partition type",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemKind {
    Fat,
    Exfat,
    Ntfs,
    Ext4,
    Btrfs,
}

impl FromStr for FilesystemKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fat" | "vfat" | "fat32" => Ok(Self::Fat),
            "exfat" => Ok(Self::Exfat),
            "ntfs" => Ok(Self::Ntfs),
            "ext4" => Ok(Self::Ext4),
            "btrfs" => Ok(Self::Btrfs),
            _ => Err(UnknownVariant {
                kind: "filesystem",
                value: value.to_string(),
            }),
        }
    }
}

/// Authenticated-encryption container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionKind {
    Luks1,
    Luks2,
}

impl FromStr for EncryptionKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "luks" | "luks2" => Ok(Self::Luks2),
            "luks1" => Ok(Self::Luks1),
            _ => Err(UnknownVariant {
                kind: "encryption type",
                value: value.to_string(),
            }),
        }
    }
}

/// One physical slot in a partition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSlot {
    /// 1-based table index.
    pub number: u32,
    pub kind: Option<PartitionType>,
    /// `None` consumes the remaining space (minus the metadata region).
    pub size_mb: Option<u64>,
}

/// Marker stored with the metadata region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataState {
    Sealed,
    Incomplete,
}

/// Kernel partition naming: disks whose name ends in a digit (`nvme0n1`,
/// `loop0`, `mmcblk0`) take a `p` separator before the partition number.
pub fn partition_node_name(device: &str, number: u32) -> String {
    let separator = if device.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    format!("{device}{separator}{number}")
}

/// Primitive device operations. All methods are expected to be already-correct
/// for the single step they perform; none of them roll anything back.
pub trait DeviceBackend {
    type Error: Error + Send + Sync + 'static;

    /// Usable capacity of `device` in MB (10^6 bytes).
    fn capacity_mb(&self, device: &str) -> Result<u64, Self::Error>;

    /// Remove partition table, filesystem and container signatures.
    fn wipe(&self, device: &str) -> Result<(), Self::Error>;

    /// Write a fresh partition table, leaving `reserved_tail_mb` unallocated at
    /// the end. Returns the partition node for each slot, in slot order.
    fn write_partition_table(
        &self,
        device: &str,
        table: TableKind,
        slots: &[PartitionSlot],
        reserved_tail_mb: u64,
    ) -> Result<Vec<String>, Self::Error>;

    /// Node of partition `number` on `device` (e.g. `/dev/sda2`, `/dev/nvme0n1p2`).
    fn partition_node(&self, device: &str, number: u32) -> String {
        partition_node_name(device, number)
    }

    fn format_filesystem(
        &self,
        node: &str,
        filesystem: FilesystemKind,
        label: &str,
    ) -> Result<(), Self::Error>;

    /// Initialise an encrypted container on `node` keyed by `master_key`, with
    /// `passphrase` wrapping that key in the only keyslot.
    fn create_container(
        &self,
        node: &str,
        kind: EncryptionKind,
        master_key: &[u8],
        passphrase: &[u8],
    ) -> Result<(), Self::Error>;

    /// Open the container as `/dev/mapper/<mapping>` and return that path.
    fn open_container(
        &self,
        node: &str,
        mapping: &str,
        passphrase: &[u8],
    ) -> Result<String, Self::Error>;

    fn close_container(&self, mapping: &str) -> Result<(), Self::Error>;

    /// Binary backup of the container header.
    fn container_header(&self, node: &str) -> Result<Vec<u8>, Self::Error>;

    /// SHA-256 over the partition table areas of `device` (leading and
    /// trailing alignment regions, which hold the primary and backup tables).
    fn table_digest(&self, device: &str) -> Result<[u8; 32], Self::Error>;

    /// SHA-256 over the raw contents of a partition node.
    fn partition_digest(&self, node: &str) -> Result<[u8; 32], Self::Error>;

    fn write_metadata(
        &self,
        device: &str,
        state: MetadataState,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    /// Returns `None` when no metadata region is present.
    fn read_metadata(&self, device: &str)
        -> Result<Option<(MetadataState, Vec<u8>)>, Self::Error>;
}
