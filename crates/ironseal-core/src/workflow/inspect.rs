//! Read-only inspection of a provisioned device.

use super::{event, WorkflowLevel, WorkflowReport};
use crate::crypto::Credential;
use crate::error::{IronsealError, IronsealResult};
use crate::metadata::DeviceMetadata;
use ironseal_provider::{DeviceBackend, MetadataState};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct InspectOptions {
    /// Pinned signer keys; empty trusts the embedded ones.
    pub trusted_signers: BTreeMap<String, String>,
    /// When present, report which decryptor accepts it.
    pub credential: Option<Credential>,
}

/// Report the metadata state, layout, signature status and, optionally,
/// whether a credential opens any payload. Secrets are never printed.
pub fn inspect<B: DeviceBackend>(
    backend: &B,
    device: &str,
    options: &InspectOptions,
) -> IronsealResult<WorkflowReport> {
    let mut events = Vec::new();
    let title = format!("Inspected {device}");

    let (state, bytes) = match backend.read_metadata(device).map_err(IronsealError::provider)? {
        Some(found) => found,
        None => {
            events.push(event(
                WorkflowLevel::Warn,
                "No ironseal metadata region found",
            ));
            return Ok(WorkflowReport { title, events });
        }
    };

    if state == MetadataState::Incomplete {
        events.push(event(
            WorkflowLevel::Error,
            "Device is marked INCOMPLETE; re-provision it before use",
        ));
        return Ok(WorkflowReport { title, events });
    }

    let metadata = match DeviceMetadata::from_bytes(&bytes) {
        Ok(metadata) => metadata,
        Err(err) => {
            events.push(event(WorkflowLevel::Error, err.to_string()));
            return Ok(WorkflowReport { title, events });
        }
    };

    for entry in &metadata.layout {
        let slot = entry
            .slot
            .map(|n| format!("slot {n}"))
            .unwrap_or_else(|| "dormant".to_string());
        let encryption = entry
            .encryption
            .map(|kind| format!("{kind:?}"))
            .unwrap_or_else(|| "plain".to_string());
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "Partition {} [{slot}] {:?} {:?} {encryption} label={}",
                entry.id, entry.kind, entry.filesystem, entry.label
            ),
        ));
    }
    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Decryptors: {}",
            metadata.keyslots.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    ));

    match metadata.verify(&options.trusted_signers) {
        Ok(()) => events.push(event(
            WorkflowLevel::Success,
            format!(
                "Signatures valid: {}",
                metadata.signatures.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        )),
        Err(err) => {
            events.push(event(WorkflowLevel::Error, err.to_string()));
            return Ok(WorkflowReport { title, events });
        }
    }

    match metadata.verify_contents(backend, device) {
        Ok(()) => events.push(event(
            WorkflowLevel::Success,
            "Partition table and immutable partitions match their recorded digests",
        )),
        Err(err) => events.push(event(WorkflowLevel::Error, err.to_string())),
    }

    if let Some(credential) = &options.credential {
        match metadata.unwrap_any(credential) {
            Ok((name, payload)) => events.push(event(
                WorkflowLevel::Security,
                format!(
                    "Credential opens decryptor `{name}` covering partitions: {}",
                    payload.partitions().join(", ")
                ),
            )),
            Err(err) => events.push(event(WorkflowLevel::Warn, err.to_string())),
        }
    }

    Ok(WorkflowReport { title, events })
}
