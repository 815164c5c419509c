//! System-backed `DeviceBackend` implementation.
//!
//! Partitioning goes through `sfdisk`, containers through `cryptsetup`,
//! filesystems through the matching `mkfs.*` tool. The sealed metadata lives
//! in the reserved tail of the raw device, laid out by [`crate::tail`].

use crate::command::{
    action_unsupported, classify_close_failure, classify_format_failure, classify_open_failure,
    mapping_absent, SystemRunner,
};
use crate::tail::{self, MetadataTail, FOOTER_LEN};
use ironseal_core::error::{IronsealError, IronsealResult};
use ironseal_core::RuntimeConfig;
use ironseal_provider::{
    CommandOutput, CommandRunner, DeviceBackend, EncryptionKind, FilesystemKind, MetadataState,
    PartitionSlot, PartitionType, TableKind,
};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const MB: u64 = 1_000_000;
const SECTOR: u64 = 512;
/// 1 MiB partition alignment, in sectors.
const ALIGN_SECTORS: u64 = 2_048;
const BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";
const SECRET_DIR: &str = "/dev/shm";

/// Device backend that shells out to the host partitioning and crypto tools.
#[derive(Debug, Clone)]
pub struct SystemDeviceBackend<R = SystemRunner> {
    runner: R,
    metadata_reserved_mb: u64,
}

impl SystemDeviceBackend<SystemRunner> {
    /// Build a backend from configuration with the tool timeout it specifies.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            SystemRunner::new(config.tool_timeout()),
            config.device.metadata_reserved_mb,
        )
    }
}

impl<R> SystemDeviceBackend<R>
where
    R: CommandRunner<Error = IronsealError>,
{
    pub fn new(runner: R, metadata_reserved_mb: u64) -> Self {
        Self {
            runner,
            metadata_reserved_mb,
        }
    }

    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> IronsealResult<CommandOutput> {
        debug!("running {program} {}", args.join(" "));
        self.runner.run(program, args, stdin)
    }

    /// Run and require a zero exit status.
    fn run_ok(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> IronsealResult<CommandOutput> {
        let out = self.run(program, args, stdin)?;
        if out.success() {
            return Ok(out);
        }
        Err(IronsealError::Provider(format!(
            "{program} {} exited with code {}: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            out.status,
            out.diagnostic()
        )))
    }

    fn settle(&self) {
        match self.run("udevadm", &args(&["settle"]), None) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("udevadm settle exited with {}: {}", out.status, out.diagnostic()),
            Err(err) => warn!("udevadm settle unavailable: {err}"),
        }
    }

    fn tail(&self, device: &str) -> IronsealResult<MetadataTail> {
        Ok(MetadataTail::new(
            device_size(device)?,
            self.metadata_reserved_mb.saturating_mul(MB),
        ))
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Temporary file for key material, on tmpfs when available. Removed on drop.
fn secret_file(contents: &[u8]) -> IronsealResult<NamedTempFile> {
    let mut file = if Path::new(SECRET_DIR).is_dir() {
        NamedTempFile::new_in(SECRET_DIR).or_else(|_| NamedTempFile::new())?
    } else {
        NamedTempFile::new()?
    };
    file.write_all(contents)?;
    file.flush()?;
    Ok(file)
}

fn path_arg(file: &NamedTempFile) -> String {
    file.path().to_string_lossy().into_owned()
}

fn device_size(device: &str) -> IronsealResult<u64> {
    let mut file = File::open(device)?;
    Ok(file.seek(SeekFrom::End(0))?)
}

fn align_up(sector: u64) -> u64 {
    sector.div_ceil(ALIGN_SECTORS) * ALIGN_SECTORS
}

fn type_code(table: TableKind, kind: Option<PartitionType>) -> &'static str {
    match (table, kind) {
        (_, Some(PartitionType::Efi)) => "U",
        (TableKind::Dos, Some(PartitionType::Bios)) => "L, bootable",
        (_, Some(PartitionType::Bios)) => BIOS_BOOT_GUID,
        (_, Some(PartitionType::Linux)) | (_, None) => "L",
    }
}

/// Build the `sfdisk` input script. Every partition gets an explicit aligned
/// start and size so the unsized one stops short of the metadata tail.
pub(crate) fn partition_script(
    table: TableKind,
    slots: &[PartitionSlot],
    device_bytes: u64,
    reserved_bytes: u64,
) -> IronsealResult<String> {
    let label = match table {
        TableKind::Dos => "dos",
        TableKind::Gpt | TableKind::Hybrid => "gpt",
    };
    let usable_end = device_bytes.saturating_sub(reserved_bytes) / SECTOR;

    let mut script = format!("label: {label}\n");
    let mut next = ALIGN_SECTORS;
    for slot in slots {
        let start = align_up(next);
        let size = match slot.size_mb {
            Some(mb) => mb.checked_mul(MB).map(|bytes| bytes.div_ceil(SECTOR)).ok_or_else(|| {
                IronsealError::InvalidLayout(format!(
                    "partition {} size of {mb} MB overflows",
                    slot.number
                ))
            })?,
            None => usable_end.saturating_sub(start) / ALIGN_SECTORS * ALIGN_SECTORS,
        };
        let end = start.checked_add(size).filter(|end| size > 0 && *end <= usable_end);
        let Some(end) = end else {
            return Err(IronsealError::Capacity {
                required_mb: start
                    .saturating_add(size.max(1))
                    .saturating_mul(SECTOR)
                    .saturating_add(reserved_bytes)
                    / MB
                    + 1,
                available_mb: device_bytes / MB,
            });
        };
        let _ = writeln!(
            script,
            "start={start}, size={size}, type={}",
            type_code(table, slot.kind)
        );
        next = end;
    }
    Ok(script)
}

fn mkfs_invocation(filesystem: FilesystemKind, node: &str, label: &str) -> (&'static str, Vec<String>) {
    match filesystem {
        FilesystemKind::Fat => {
            let label: String = label.to_ascii_uppercase().chars().take(11).collect();
            ("mkfs.vfat", args(&["-F", "32", "-n", &label, node]))
        }
        FilesystemKind::Exfat => ("mkfs.exfat", args(&["-n", label, node])),
        FilesystemKind::Ntfs => ("mkfs.ntfs", args(&["-Q", "-F", "-L", label, node])),
        FilesystemKind::Ext4 => ("mkfs.ext4", args(&["-F", "-q", "-L", label, node])),
        FilesystemKind::Btrfs => ("mkfs.btrfs", args(&["-f", "-L", label, node])),
    }
}

fn luks_type(kind: EncryptionKind) -> &'static str {
    match kind {
        EncryptionKind::Luks1 => "luks1",
        EncryptionKind::Luks2 => "luks2",
    }
}

impl<R> DeviceBackend for SystemDeviceBackend<R>
where
    R: CommandRunner<Error = IronsealError>,
{
    type Error = IronsealError;

    fn capacity_mb(&self, device: &str) -> IronsealResult<u64> {
        Ok(device_size(device)? / MB)
    }

    fn wipe(&self, device: &str) -> IronsealResult<()> {
        self.run_ok("wipefs", &args(&["--all", "--force", device]), None)?;

        if let Some(start) = self.tail(device)?.footer_start() {
            let mut file = OpenOptions::new().write(true).open(device)?;
            file.seek(SeekFrom::Start(start))?;
            file.write_all(&[0u8; FOOTER_LEN as usize])?;
            file.sync_all()?;
        }
        self.settle();
        info!("wiped signatures and metadata footer on {device}");
        Ok(())
    }

    fn write_partition_table(
        &self,
        device: &str,
        table: TableKind,
        slots: &[PartitionSlot],
        reserved_tail_mb: u64,
    ) -> IronsealResult<Vec<String>> {
        let reserved = reserved_tail_mb.checked_mul(MB).ok_or_else(|| {
            IronsealError::InvalidLayout(format!("reserved tail of {reserved_tail_mb} MB overflows"))
        })?;
        let script = partition_script(table, slots, device_size(device)?, reserved)?;
        self.run_ok(
            "sfdisk",
            &args(&["--wipe", "always", "--quiet", device]),
            Some(script.as_bytes()),
        )?;
        self.settle();
        Ok(slots
            .iter()
            .map(|slot| self.partition_node(device, slot.number))
            .collect())
    }

    fn format_filesystem(&self, node: &str, filesystem: FilesystemKind, label: &str) -> IronsealResult<()> {
        let (program, argv) = mkfs_invocation(filesystem, node, label);
        self.run_ok(program, &argv, None)?;
        Ok(())
    }

    fn create_container(
        &self,
        node: &str,
        kind: EncryptionKind,
        master_key: &[u8],
        passphrase: &[u8],
    ) -> IronsealResult<()> {
        let volume_key = secret_file(master_key)?;
        let key_file = secret_file(passphrase)?;
        let key_bits = (master_key.len() * 8).to_string();
        let out = self.run(
            "cryptsetup",
            &args(&[
                "luksFormat",
                "--batch-mode",
                "--type",
                luks_type(kind),
                "--key-size",
                &key_bits,
                "--volume-key-file",
                &path_arg(&volume_key),
                "--key-file",
                &path_arg(&key_file),
                node,
            ]),
            None,
        )?;
        if out.success() {
            return Ok(());
        }
        Err(IronsealError::Provider(format!(
            "{} (exit code {})",
            classify_format_failure(node, &out.diagnostic()),
            out.status
        )))
    }

    fn open_container(&self, node: &str, mapping: &str, passphrase: &[u8]) -> IronsealResult<String> {
        let mapped = format!("/dev/mapper/{mapping}");
        let primary = args(&[
            "open", "--type", "luks", "--batch-mode", "--key-file", "-", node, mapping,
        ]);
        let mut out = self.run("cryptsetup", &primary, Some(passphrase))?;
        if !out.success() && action_unsupported(&out) {
            let fallback = args(&["luksOpen", "--batch-mode", "--key-file", "-", node, mapping]);
            out = self.run("cryptsetup", &fallback, Some(passphrase))?;
        }
        if out.success() {
            return Ok(mapped);
        }
        Err(IronsealError::Provider(format!(
            "{} (exit code {})",
            classify_open_failure(mapping, node, &out.diagnostic()),
            out.status
        )))
    }

    fn close_container(&self, mapping: &str) -> IronsealResult<()> {
        let mut out = self.run("cryptsetup", &args(&["close", mapping]), None)?;
        if !out.success() && action_unsupported(&out) {
            out = self.run("cryptsetup", &args(&["luksClose", mapping]), None)?;
        }
        if out.success() || mapping_absent(&out) {
            return Ok(());
        }
        Err(IronsealError::Provider(format!(
            "{} (exit code {})",
            classify_close_failure(mapping, &out.diagnostic()),
            out.status
        )))
    }

    fn container_header(&self, node: &str) -> IronsealResult<Vec<u8>> {
        let scratch = tempfile::tempdir()?;
        let backup = scratch.path().join("header.img");
        self.run_ok(
            "cryptsetup",
            &args(&[
                "luksHeaderBackup",
                node,
                "--header-backup-file",
                &backup.to_string_lossy(),
            ]),
            None,
        )?;
        Ok(fs::read(&backup)?)
    }

    fn table_digest(&self, device: &str) -> IronsealResult<[u8; 32]> {
        let size = device_size(device)?;
        let mut file = File::open(device)?;
        Ok(tail::table_digest(&mut file, size)?)
    }

    fn partition_digest(&self, node: &str) -> IronsealResult<[u8; 32]> {
        let mut file = File::open(node)?;
        let mut hasher = Sha256::new();
        let hashed = io::copy(&mut file, &mut hasher)?;
        debug!("hashed {hashed} bytes of {node}");
        Ok(hasher.finalize().into())
    }

    fn write_metadata(&self, device: &str, state: MetadataState, payload: &[u8]) -> IronsealResult<()> {
        let tail = self.tail(device)?;
        let mut file = OpenOptions::new().read(true).write(true).open(device)?;
        tail.write(&mut file, state, payload, |file| file.sync_data())?;
        info!("wrote {state:?} metadata ({} bytes) to {device}", payload.len());
        Ok(())
    }

    fn read_metadata(&self, device: &str) -> IronsealResult<Option<(MetadataState, Vec<u8>)>> {
        let tail = self.tail(device)?;
        let mut file = File::open(device)?;
        tail.read(&mut file)
    }
}
