//! Unlock state machine and the credential check it runs in the background.
//!
//! [`UnlockMachine`] is pure bookkeeping owned by the control loop: state,
//! attempt counter and the power-off failsafe deadline. [`unlock_device`] is
//! the blocking body that verifies metadata, unwraps a payload and opens the
//! encrypted partitions; the service runs it inside a [`crate::job::Job`].

use crate::crypto::Credential;
use crate::error::{IronsealError, IronsealResult};
use crate::metadata::DeviceMetadata;
use crate::template::SecretField;
use chrono::{DateTime, NaiveDate, Utc};
use ironseal_provider::{DeviceBackend, MetadataState};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Unprotected metadata field holding the device's own end of validity.
pub const VALID_TO_FIELD: &str = "valid-to";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Credential,
    Integrity,
    TooManyAttempts,
    Other,
}

impl FailureReason {
    pub fn classify(err: &IronsealError) -> Self {
        match err {
            IronsealError::InvalidCredential => FailureReason::Credential,
            IronsealError::DeviceIntegrity(_) => FailureReason::Integrity,
            _ => FailureReason::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockState {
    Locked,
    Unlocking,
    Unlocked,
    Failed(FailureReason),
}

/// What the control loop should do with an unlock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already unlocked; report success without touching any credential.
    AlreadyUnlocked,
    /// Start the credential check.
    Proceed,
    /// A check is already running.
    InProgress,
    /// Refused before any credential work.
    Rejected(FailureReason),
}

#[derive(Debug)]
pub struct UnlockMachine {
    state: UnlockState,
    attempts: u32,
    max_attempts: u32,
    integrity_latched: bool,
    failsafe_delay: Duration,
    failsafe_deadline: Option<Instant>,
}

impl UnlockMachine {
    /// Starts `Locked` with the failsafe armed from `now`.
    pub fn new(max_attempts: u32, failsafe_delay: Duration, now: Instant) -> Self {
        Self {
            state: UnlockState::Locked,
            attempts: 0,
            max_attempts,
            integrity_latched: false,
            failsafe_delay,
            failsafe_deadline: Some(now + failsafe_delay),
        }
    }

    pub fn state(&self) -> UnlockState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_unlocked(&self) -> bool {
        self.state == UnlockState::Unlocked
    }

    pub fn failsafe_deadline(&self) -> Option<Instant> {
        self.failsafe_deadline
    }

    pub fn failsafe_expired(&self, now: Instant) -> bool {
        !self.is_unlocked() && self.failsafe_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn rearm_failsafe(&mut self, now: Instant) {
        self.failsafe_deadline = Some(now + self.failsafe_delay);
    }

    /// Decide whether an unlock request may enter `Unlocking`.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            UnlockState::Unlocked => return Admission::AlreadyUnlocked,
            UnlockState::Unlocking => return Admission::InProgress,
            _ => {}
        }
        if self.integrity_latched {
            return self.reject(FailureReason::Integrity, now);
        }
        if self.attempts >= self.max_attempts {
            return self.reject(FailureReason::TooManyAttempts, now);
        }
        self.state = UnlockState::Unlocking;
        Admission::Proceed
    }

    /// Refuse without counting an attempt (expired device, forbidden hypervisor,
    /// lockout already reached).
    pub fn reject(&mut self, reason: FailureReason, now: Instant) -> Admission {
        self.state = UnlockState::Failed(reason);
        self.rearm_failsafe(now);
        Admission::Rejected(reason)
    }

    pub fn succeed(&mut self) {
        self.state = UnlockState::Unlocked;
        self.failsafe_deadline = None;
    }

    /// Record a failed check and return the reason to report.
    ///
    /// Every failure counts toward the lockout. An integrity failure keeps its
    /// own reason and blocks further attempts for the session; the others turn
    /// into `TooManyAttempts` once the limit is reached.
    pub fn fail(&mut self, reason: FailureReason, now: Instant) -> FailureReason {
        self.attempts += 1;
        let reported = match reason {
            FailureReason::Integrity => {
                self.integrity_latched = true;
                FailureReason::Integrity
            }
            _ if self.attempts >= self.max_attempts => FailureReason::TooManyAttempts,
            other => other,
        };
        self.state = UnlockState::Failed(reported);
        self.rearm_failsafe(now);
        reported
    }
}

/// Inputs for the background unlock check.
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub device: String,
    pub mapping_prefix: String,
    pub trusted_signers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOutcome {
    pub decryptor: String,
    /// Mapper paths opened, in layout order.
    pub opened: Vec<String>,
}

/// Verify metadata, unwrap a payload with `credential`, then open every
/// encrypted partition the payload covers.
///
/// Signatures and recorded digests are checked before any keyslot is touched
/// so a tampered device reports `DeviceIntegrity` even for a wrong credential.
pub fn unlock_device<B: DeviceBackend>(
    backend: &B,
    request: &UnlockRequest,
    credential: &Credential,
) -> IronsealResult<UnlockOutcome> {
    let metadata = load_metadata(backend, &request.device)?;
    metadata.verify(&request.trusted_signers)?;
    check_validity(&metadata, Utc::now())?;
    metadata.verify_contents(backend, &request.device)?;

    let (decryptor, payload) = metadata.unwrap_any(credential)?;
    debug!("credential accepted by decryptor `{decryptor}`");

    let mut mappings: Vec<String> = Vec::new();
    let mut opened = Vec::new();
    for entry in &metadata.layout {
        let (Some(slot), Some(_)) = (entry.slot, entry.encryption) else {
            continue;
        };
        let Some(password) = payload.secret(&entry.id, SecretField::Password) else {
            continue;
        };
        let node = backend.partition_node(&request.device, slot);
        let mapping = format!("{}{}", request.mapping_prefix, entry.id);
        match backend.open_container(&node, &mapping, password.as_bytes()) {
            Ok(mapped) => {
                info!("opened {} as {mapped}", entry.id);
                mappings.push(mapping);
                opened.push(mapped);
            }
            Err(err) => {
                warn!("opening {} failed; closing {} mapping(s)", entry.id, mappings.len());
                close_all(backend, &mappings);
                return Err(IronsealError::provider(err));
            }
        }
    }

    Ok(UnlockOutcome { decryptor, opened })
}

/// Close `mappings` in reverse order so a later attempt starts clean.
fn close_all<B: DeviceBackend>(backend: &B, mappings: &[String]) {
    for mapping in mappings.iter().rev() {
        if let Err(err) = backend.close_container(mapping) {
            warn!("could not close {mapping}: {err}");
        }
    }
}

/// Read and decode the sealed metadata region of `device`.
pub fn load_metadata<B: DeviceBackend>(backend: &B, device: &str) -> IronsealResult<DeviceMetadata> {
    match backend.read_metadata(device).map_err(IronsealError::provider)? {
        None => Err(IronsealError::DeviceIntegrity(format!(
            "no metadata found on {device}"
        ))),
        Some((MetadataState::Incomplete, _)) => Err(IronsealError::DeviceIntegrity(format!(
            "{device} is marked incomplete"
        ))),
        Some((MetadataState::Sealed, bytes)) => DeviceMetadata::from_bytes(&bytes),
    }
}

/// Enforce the signed `valid-to` field when the device carries one.
pub fn check_validity(metadata: &DeviceMetadata, now: DateTime<Utc>) -> IronsealResult<()> {
    let Some(value) = metadata.unprotected.get(VALID_TO_FIELD) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(IronsealError::DeviceIntegrity(format!(
            "`{VALID_TO_FIELD}` is not a string"
        )));
    };
    let end = parse_valid_to(text).ok_or_else(|| {
        IronsealError::DeviceIntegrity(format!("unparseable `{VALID_TO_FIELD}` {text}"))
    })?;
    if now > end {
        warn!("device validity ended at {end}");
        return Err(IronsealError::Expired(text.to_string()));
    }
    Ok(())
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates (end of that day).
pub fn parse_valid_to(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(stamp) = DateTime::parse_from_rfc3339(text) {
        return Some(stamp.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|naive| naive.and_utc())
}

/// Human-readable message for an `UnlockFailed` event.
pub fn failure_message(reason: FailureReason, err: Option<&IronsealError>) -> String {
    match (reason, err) {
        (FailureReason::TooManyAttempts, _) => "too many failed attempts".to_string(),
        (FailureReason::Credential, _) => "invalid credential".to_string(),
        (FailureReason::Integrity, Some(err)) => format!("device is not trustworthy: {err}"),
        (FailureReason::Integrity, None) => "device is not trustworthy".to_string(),
        (FailureReason::Other, Some(err)) => err.to_string(),
        (FailureReason::Other, None) => "unlock refused".to_string(),
    }
}
