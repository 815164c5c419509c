//! Key file handling for KEY decryptors and signing keys.
//!
//! A key file holds exactly 32 bytes of material, stored either raw or as 64
//! hex digits. Whitespace inside hex files is ignored so keys can be pasted
//! from terminals.

use crate::error::{IronsealError, IronsealResult};
use std::fs;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;

/// On-disk representation chosen when writing a key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    Raw,
    Hex,
}

/// Decoded key material together with the encoding it was read from.
#[derive(Debug)]
pub struct KeyMaterial {
    pub bytes: Zeroizing<[u8; KEY_LEN]>,
    pub encoding: KeyEncoding,
}

pub fn read_key_file(path: &Path) -> IronsealResult<KeyMaterial> {
    let contents = Zeroizing::new(fs::read(path)?);
    decode_key_bytes(path, &contents)
}

/// Decode either a 32-byte binary key or a 64-digit hex string.
pub fn decode_key_bytes(origin: &Path, bytes: &[u8]) -> IronsealResult<KeyMaterial> {
    if bytes.len() == KEY_LEN {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        return Ok(KeyMaterial {
            bytes: key,
            encoding: KeyEncoding::Raw,
        });
    }

    let mut digits = Zeroizing::new(Vec::with_capacity(bytes.len()));
    for byte in bytes {
        if byte.is_ascii_whitespace() {
            continue;
        }
        if !byte.is_ascii_hexdigit() {
            return Err(invalid_key(
                origin,
                format!("found non-hex byte 0x{byte:02x}"),
            ));
        }
        digits.push(*byte);
    }

    if digits.is_empty() {
        return Err(invalid_key(origin, "file is empty"));
    }
    if digits.len() != KEY_LEN * 2 {
        return Err(invalid_key(
            origin,
            format!(
                "expected {} hex digits or {KEY_LEN} raw bytes (got {} digits)",
                KEY_LEN * 2,
                digits.len()
            ),
        ));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    hex::decode_to_slice(&digits[..], &mut key[..])
        .map_err(|err| invalid_key(origin, format!("hex decode failed: {err}")))?;

    Ok(KeyMaterial {
        bytes: key,
        encoding: KeyEncoding::Hex,
    })
}

/// Atomically write key material to `path` with mode 0400.
///
/// Existing ownership is carried over when the destination is replaced.
pub fn write_key_file(path: &Path, key: &[u8], encoding: KeyEncoding) -> IronsealResult<()> {
    let dest = resolve_write_path(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    fs::create_dir_all(&parent)?;

    let ownership = fs::metadata(&dest)
        .ok()
        .map(|meta| (meta.uid(), meta.gid()));

    let encoded: Zeroizing<Vec<u8>> = match encoding {
        KeyEncoding::Raw => Zeroizing::new(key.to_vec()),
        KeyEncoding::Hex => Zeroizing::new(format!("{}\n", hex::encode(key)).into_bytes()),
    };

    let mut temp = NamedTempFile::new_in(&parent)?;
    temp.as_file_mut().write_all(&encoded)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400))?;

    if let Some((uid, gid)) = ownership {
        let rc = unsafe { libc::fchown(temp.as_file().as_raw_fd(), uid, gid) };
        if rc != 0 {
            return Err(IronsealError::Io(std::io::Error::last_os_error()));
        }
    }

    let _ = temp.as_file().sync_all();
    temp.persist(&dest).map_err(|err| IronsealError::Io(err.error))?;
    let _ = fs::File::open(&parent).and_then(|dir| dir.sync_all());
    Ok(())
}

fn resolve_write_path(path: &Path) -> IronsealResult<PathBuf> {
    let mut candidate = path.to_path_buf();
    for _ in 0..16 {
        let meta = match fs::symlink_metadata(&candidate) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(IronsealError::Io(err)),
        };
        if !meta.file_type().is_symlink() {
            return Ok(candidate);
        }
        let target = fs::read_link(&candidate)?;
        candidate = if target.is_absolute() {
            target
        } else {
            candidate
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(target)
        };
    }

    Err(invalid_key(path, "symlink resolution depth exceeded"))
}

fn invalid_key(path: &Path, reason: impl Into<String>) -> IronsealError {
    IronsealError::InvalidKeyFile {
        path: PathBuf::from(path),
        reason: reason.into(),
    }
}
