//! Metadata tail of a raw device.
//!
//! The last [`TABLE_TAIL`] bytes are left alone for the backup GPT. In front
//! of them sits a fixed-size footer, and the rest of the reserved tail is
//! split into two payload regions. A write fills the region the current
//! footer does not point at, flushes, and only then rewrites the footer, so
//! an interrupted write leaves the previous metadata readable.
//!
//! Footer layout: magic (8) | state (1) | region (1) | back u64 BE (8) |
//! payload length u64 BE (8) | SHA-256 (32) | zero pad. `back` is the
//! distance from the footer start back to the payload start.

use ironseal_core::error::{IronsealError, IronsealResult};
use ironseal_provider::MetadataState;
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Bytes at the very end of the device kept for the backup partition table.
pub(crate) const TABLE_TAIL: u64 = 1_048_576;
pub(crate) const FOOTER_LEN: u64 = 4_096;
const FOOTER_MAGIC: &[u8; 8] = b"IRNSEAL1";
const FOOTER_FIELDS: usize = 58;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Footer {
    state: MetadataState,
    region: u8,
    back: u64,
    len: u64,
    digest: [u8; 32],
}

fn state_byte(state: MetadataState) -> u8 {
    match state {
        MetadataState::Sealed => 1,
        MetadataState::Incomplete => 2,
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

impl Footer {
    fn encode(&self) -> Vec<u8> {
        let mut footer = Vec::with_capacity(FOOTER_LEN as usize);
        footer.extend_from_slice(FOOTER_MAGIC);
        footer.push(state_byte(self.state));
        footer.push(self.region);
        footer.extend_from_slice(&self.back.to_be_bytes());
        footer.extend_from_slice(&self.len.to_be_bytes());
        footer.extend_from_slice(&self.digest);
        footer.resize(FOOTER_LEN as usize, 0);
        footer
    }

    /// `None` when no footer is present; malformed fields are integrity errors.
    fn decode(bytes: &[u8]) -> IronsealResult<Option<Self>> {
        if bytes.len() < FOOTER_FIELDS || &bytes[..8] != FOOTER_MAGIC {
            return Ok(None);
        }
        let state = match bytes[8] {
            1 => MetadataState::Sealed,
            2 => MetadataState::Incomplete,
            other => {
                return Err(IronsealError::DeviceIntegrity(format!(
                    "unknown metadata state byte {other}"
                )))
            }
        };
        let region = bytes[9];
        if region > 1 {
            return Err(IronsealError::DeviceIntegrity(format!(
                "unknown metadata region {region}"
            )));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[26..58]);
        Ok(Some(Self {
            state,
            region,
            back: be_u64(&bytes[10..18]),
            len: be_u64(&bytes[18..26]),
            digest,
        }))
    }
}

/// Geometry of the metadata tail for a device of `size` bytes with `reserved`
/// bytes set aside at its end.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MetadataTail {
    size: u64,
    reserved: u64,
}

impl MetadataTail {
    pub(crate) fn new(size: u64, reserved: u64) -> Self {
        Self { size, reserved }
    }

    pub(crate) fn footer_start(&self) -> Option<u64> {
        self.size.checked_sub(TABLE_TAIL)?.checked_sub(FOOTER_LEN)
    }

    /// Bytes available in front of the footer for both payload regions.
    fn payload_area(&self) -> u64 {
        self.reserved.saturating_sub(TABLE_TAIL + FOOTER_LEN)
    }

    fn region_len(&self) -> u64 {
        self.payload_area() / 2
    }

    fn read_footer<D: Read + Seek>(&self, device: &mut D) -> IronsealResult<Option<Footer>> {
        let Some(start) = self.footer_start() else {
            return Ok(None);
        };
        device.seek(SeekFrom::Start(start))?;
        let mut bytes = vec![0u8; FOOTER_LEN as usize];
        device.read_exact(&mut bytes)?;
        Footer::decode(&bytes)
    }

    pub(crate) fn read<D: Read + Seek>(
        &self,
        device: &mut D,
    ) -> IronsealResult<Option<(MetadataState, Vec<u8>)>> {
        let (Some(footer_start), Some(footer)) = (self.footer_start(), self.read_footer(device)?)
        else {
            return Ok(None);
        };
        if footer.len > footer.back
            || footer.back > self.payload_area()
            || footer.back > footer_start
        {
            return Err(IronsealError::DeviceIntegrity(format!(
                "metadata footer points outside the reserved tail (back {}, length {})",
                footer.back, footer.len
            )));
        }

        device.seek(SeekFrom::Start(footer_start - footer.back))?;
        let mut payload = vec![0u8; footer.len as usize];
        device.read_exact(&mut payload)?;
        if Sha256::digest(&payload).as_slice() != footer.digest.as_slice() {
            return Err(IronsealError::DeviceIntegrity(
                "metadata checksum mismatch".to_string(),
            ));
        }
        debug!(
            "read {:?} metadata from region {} ({} bytes)",
            footer.state, footer.region, footer.len
        );
        Ok(Some((footer.state, payload)))
    }

    /// Write `payload` into the inactive region, then flip the footer.
    /// `barrier` runs after each step and must make the bytes durable.
    pub(crate) fn write<D, F>(
        &self,
        device: &mut D,
        state: MetadataState,
        payload: &[u8],
        mut barrier: F,
    ) -> IronsealResult<()>
    where
        D: Read + Write + Seek,
        F: FnMut(&mut D) -> io::Result<()>,
    {
        let region_len = self.region_len();
        let footer_start = match self.footer_start() {
            Some(start) if region_len > 0 && self.reserved <= self.size => start,
            _ => {
                return Err(IronsealError::Provider(format!(
                    "a {} byte metadata tail does not fit a {} byte device",
                    self.reserved, self.size
                )))
            }
        };
        let len = payload.len() as u64;
        if len > region_len {
            return Err(IronsealError::Provider(format!(
                "metadata of {len} bytes exceeds the {region_len} byte region of the reserved tail"
            )));
        }

        let active = match self.read_footer(device) {
            Ok(footer) => footer.map(|footer| footer.region),
            Err(err) => {
                debug!("ignoring unreadable metadata footer: {err}");
                None
            }
        };
        let region = match active {
            Some(0) => 1,
            _ => 0,
        };
        let back = (2 - u64::from(region)) * region_len;

        device.seek(SeekFrom::Start(footer_start - back))?;
        device.write_all(payload)?;
        barrier(device)?;

        let footer = Footer {
            state,
            region,
            back,
            len,
            digest: Sha256::digest(payload).into(),
        };
        device.seek(SeekFrom::Start(footer_start))?;
        device.write_all(&footer.encode())?;
        barrier(device)?;
        info!("wrote {state:?} metadata ({len} bytes) to region {region}");
        Ok(())
    }
}

/// SHA-256 over the leading and trailing [`TABLE_TAIL`] bytes, where the
/// primary and backup partition tables live.
pub(crate) fn table_digest<D: Read + Seek>(device: &mut D, size: u64) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let head = size.min(TABLE_TAIL);
    device.seek(SeekFrom::Start(0))?;
    io::copy(&mut device.by_ref().take(head), &mut hasher)?;

    let tail_start = size.saturating_sub(TABLE_TAIL);
    device.seek(SeekFrom::Start(tail_start))?;
    io::copy(&mut device.by_ref().take(size - tail_start), &mut hasher)?;
    Ok(hasher.finalize().into())
}
