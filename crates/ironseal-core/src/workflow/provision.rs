//! Provisioning workflow that partitions, encrypts and seals a target device.
//!
//! Ordering matters: every credential and signing key is loaded and the
//! capacity is checked before the first destructive write. Once the device
//! has been touched, any failure wipes it again, and if that wipe fails too an
//! `incomplete` marker is written so the device can never pass as sealed.

use super::{event, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::crypto::{self, Credential};
use crate::error::{IronsealError, IronsealResult};
use crate::keyfile::read_key_file;
use crate::metadata::{DeviceMetadata, LayoutEntry, ProtectedPayload};
use crate::template::{DecryptorSpec, DeviceFormatPlan, SecretField, SecretRef, SignatureSpec};
use ed25519_dalek::SigningKey;
use ironseal_provider::{DeviceBackend, MetadataState};
use log::{error, info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

/// Floor reserved for the partition that consumes the remaining space.
pub const UNSIZED_MINIMUM_MB: u64 = 1;
const MASTER_KEY_LEN: usize = 64;
const RANDOM_PASSWORD_BYTES: usize = 32;
const PROVISION_MAPPING_PREFIX: &str = "ironseal-provision-";

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub metadata_reserved_mb: u64,
    pub pbkdf2_iterations: u32,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            metadata_reserved_mb: 5,
            pbkdf2_iterations: 600_000,
        }
    }
}

struct PartitionSecrets {
    password: Zeroizing<String>,
    header_hex: Zeroizing<String>,
}

/// Execute `plan` against `backend`. See the module docs for the failure model.
pub fn provision<B>(
    backend: &B,
    plan: &DeviceFormatPlan,
    options: &ProvisionOptions,
) -> IronsealResult<WorkflowReport>
where
    B: DeviceBackend,
{
    let mut events = Vec::new();
    let device = plan.device.as_str();

    let signers = load_signers(plan)?;
    let credentials = load_credentials(plan)?;
    events.push(event(
        WorkflowLevel::Info,
        format!(
            "Loaded {} signing key(s) and {} decryptor credential(s)",
            signers.len(),
            credentials.len()
        ),
    ));

    let required = plan.required_mb(UNSIZED_MINIMUM_MB, options.metadata_reserved_mb)?;
    let available = backend.capacity_mb(device).map_err(IronsealError::provider)?;
    if required > available {
        return Err(IronsealError::Capacity {
            required_mb: required,
            available_mb: available,
        });
    }
    events.push(event(
        WorkflowLevel::Info,
        format!("Capacity check passed for {device}: {required} MB of {available} MB"),
    ));

    info!("provisioning {device}");
    match write_device(backend, plan, options, signers, credentials, &mut events) {
        Ok(()) => {
            events.push(event(
                WorkflowLevel::Success,
                format!("Device {device} provisioned and sealed"),
            ));
            Ok(WorkflowReport {
                title: format!("Provisioned {device}"),
                events,
            })
        }
        Err(err) => {
            error!("provisioning {device} failed: {err}");
            roll_back(backend, device, &err);
            Err(IronsealError::Provisioning(err.to_string()))
        }
    }
}

fn load_signers(plan: &DeviceFormatPlan) -> IronsealResult<BTreeMap<String, SigningKey>> {
    let mut signers = BTreeMap::new();
    for (name, spec) in &plan.signatures {
        let SignatureSpec::Key { private_key_file } = spec;
        let material = read_key_file(private_key_file)?;
        signers.insert(name.clone(), crypto::signing_key_from_bytes(&material.bytes));
    }
    Ok(signers)
}

fn load_credentials(plan: &DeviceFormatPlan) -> IronsealResult<BTreeMap<String, Credential>> {
    let mut credentials = BTreeMap::new();
    for (name, spec) in &plan.decryptors {
        let credential = match spec {
            DecryptorSpec::Password { password } => Credential::password(password.clone()),
            DecryptorSpec::Key { key_file } => Credential::key(*read_key_file(key_file)?.bytes),
        };
        credentials.insert(name.clone(), credential);
    }
    Ok(credentials)
}

fn write_device<B: DeviceBackend>(
    backend: &B,
    plan: &DeviceFormatPlan,
    options: &ProvisionOptions,
    signers: BTreeMap<String, SigningKey>,
    mut credentials: BTreeMap<String, Credential>,
    events: &mut Vec<WorkflowEvent>,
) -> IronsealResult<()> {
    let device = plan.device.as_str();
    backend.wipe(device).map_err(IronsealError::provider)?;

    let assignments = plan.slots();
    let slots: Vec<_> = assignments.iter().map(|entry| entry.slot.clone()).collect();
    let nodes = backend
        .write_partition_table(device, plan.table, &slots, options.metadata_reserved_mb)
        .map_err(IronsealError::provider)?;
    if nodes.len() != slots.len() {
        return Err(IronsealError::Provisioning(format!(
            "backend reported {} partition nodes for {} slots",
            nodes.len(),
            slots.len()
        )));
    }
    events.push(event(
        WorkflowLevel::Info,
        format!("Wrote {:?} partition table with {} slot(s)", plan.table, slots.len()),
    ));

    let mut secrets: BTreeMap<String, PartitionSecrets> = BTreeMap::new();
    let mut layout = Vec::with_capacity(plan.partitions.len());

    for (assignment, node) in assignments.iter().zip(&nodes) {
        let part = &plan.partitions[assignment.live];
        match part.encryption {
            Some(kind) => {
                let password = match &part.password {
                    Some(password) => Zeroizing::new(password.clone()),
                    None => Zeroizing::new(hex::encode(
                        &crypto::random_bytes::<RANDOM_PASSWORD_BYTES>()[..],
                    )),
                };
                let master_key = crypto::random_bytes::<MASTER_KEY_LEN>();
                backend
                    .create_container(node, kind, &master_key[..], password.as_bytes())
                    .map_err(IronsealError::provider)?;

                let mapping = format!("{PROVISION_MAPPING_PREFIX}{}", part.id);
                let mapped = backend
                    .open_container(node, &mapping, password.as_bytes())
                    .map_err(IronsealError::provider)?;
                let formatted = backend.format_filesystem(&mapped, part.filesystem, &part.label);
                let closed = backend.close_container(&mapping);
                formatted.map_err(IronsealError::provider)?;
                closed.map_err(IronsealError::provider)?;

                let header = backend
                    .container_header(node)
                    .map_err(IronsealError::provider)?;
                secrets.insert(
                    part.id.clone(),
                    PartitionSecrets {
                        password,
                        header_hex: Zeroizing::new(hex::encode(header)),
                    },
                );
                events.push(event(
                    WorkflowLevel::Security,
                    format!(
                        "Encrypted {} ({:?}, {:?}) on {node}",
                        part.id, kind, part.filesystem
                    ),
                ));
            }
            None => {
                backend
                    .format_filesystem(node, part.filesystem, &part.label)
                    .map_err(IronsealError::provider)?;
                events.push(event(
                    WorkflowLevel::Info,
                    format!("Formatted {} ({:?}) on {node}", part.id, part.filesystem),
                ));
            }
        }

        layout.push(layout_entry(plan, assignment.live, Some(assignment.slot.number)));
        for &dormant in &assignment.dormant {
            layout.push(layout_entry(plan, dormant, None));
            events.push(event(
                WorkflowLevel::Info,
                format!(
                    "Hybrid member {} left dormant behind slot {}",
                    plan.partitions[dormant].id, assignment.slot.number
                ),
            ));
        }
    }

    record_digests(backend, device, &mut layout, events)?;

    let mut payloads = BTreeMap::new();
    for (name, template) in &plan.protected {
        let credential = credentials.remove(name).ok_or_else(|| {
            IronsealError::InvalidLayout(format!("protected payload `{name}` has no decryptor"))
        })?;
        let payload = fill_payload(template, &secrets)?;
        payloads.insert(name.clone(), (payload, credential));
    }

    let table_digest = backend
        .table_digest(device)
        .map_err(IronsealError::provider)?;
    let mut metadata = DeviceMetadata::seal(
        plan.unprotected.clone(),
        layout,
        &payloads,
        options.pbkdf2_iterations,
    )?;
    metadata.table_digest = Some(hex::encode(table_digest));
    metadata.sign(&signers)?;
    events.push(event(
        WorkflowLevel::Security,
        format!(
            "Sealed {} protected payload(s), signed by {}",
            payloads.len(),
            signers.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    ));

    backend
        .write_metadata(device, MetadataState::Sealed, &metadata.to_bytes()?)
        .map_err(IronsealError::provider)?;
    Ok(())
}

/// Fingerprint every materialised immutable partition once all writes are done.
fn record_digests<B: DeviceBackend>(
    backend: &B,
    device: &str,
    layout: &mut [LayoutEntry],
    events: &mut Vec<WorkflowEvent>,
) -> IronsealResult<()> {
    for entry in layout.iter_mut().filter(|entry| entry.immutable) {
        let Some(slot) = entry.slot else {
            continue;
        };
        let node = backend.partition_node(device, slot);
        let digest = backend
            .partition_digest(&node)
            .map_err(IronsealError::provider)?;
        entry.digest = Some(hex::encode(digest));
        events.push(event(
            WorkflowLevel::Security,
            format!("Recorded digest of immutable partition {}", entry.id),
        ));
    }
    Ok(())
}

fn layout_entry(plan: &DeviceFormatPlan, index: usize, slot: Option<u32>) -> LayoutEntry {
    let part = &plan.partitions[index];
    LayoutEntry {
        id: part.id.clone(),
        slot,
        kind: part.kind,
        label: part.label.clone(),
        filesystem: part.filesystem,
        encryption: part.encryption,
        immutable: part.immutable,
        size_mb: part.size_mb,
        digest: None,
    }
}

/// Replace `@id/field` keys with the generated secrets. Literal fields pass through.
fn fill_payload(
    template: &Map<String, Value>,
    secrets: &BTreeMap<String, PartitionSecrets>,
) -> IronsealResult<ProtectedPayload> {
    let mut filled = Map::new();
    for (key, value) in template {
        let resolved = match SecretRef::parse(key) {
            None => value.clone(),
            Some(reference) => {
                let reference = reference?;
                let secret = secrets.get(&reference.partition).ok_or_else(|| {
                    IronsealError::Provisioning(format!(
                        "no generated secret for partition `{}`",
                        reference.partition
                    ))
                })?;
                match reference.field {
                    SecretField::Password => Value::String(secret.password.to_string()),
                    SecretField::Header => Value::String(secret.header_hex.to_string()),
                }
            }
        };
        filled.insert(key.clone(), resolved);
    }
    Ok(ProtectedPayload(filled))
}

fn roll_back<B: DeviceBackend>(backend: &B, device: &str, cause: &IronsealError) {
    match backend.wipe(device) {
        Ok(()) => warn!("rolled back {device} by wiping it"),
        Err(wipe_err) => {
            error!("rollback wipe of {device} failed: {wipe_err}");
            let marker = json!({ "reason": cause.to_string() }).to_string();
            if let Err(mark_err) =
                backend.write_metadata(device, MetadataState::Incomplete, marker.as_bytes())
            {
                error!("could not mark {device} incomplete: {mark_err}");
            }
        }
    }
}
