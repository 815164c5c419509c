//! In-memory collaborators shared by the unit and scenario tests.

use crate::crypto;
use crate::error::{IronsealError, IronsealResult};
use crate::host::HostControl;
use crate::keyfile::{write_key_file, KeyEncoding};
use crate::template::{self, DeviceFormatPlan, FormatTemplate};
use crate::update::{BuildVersion, ImageInstaller, UpdateCandidate, UpdateSource};
use crate::workflow::{provision, ProvisionOptions};
use ed25519_dalek::SigningKey;
use ironseal_provider::{
    partition_node_name, DeviceBackend, EncryptionKind, FilesystemKind, MetadataState,
    PartitionSlot, TableKind,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

pub(crate) const DEVICE: &str = "/dev/sdz";
pub(crate) const USER_PASSWORD: &str = "abc123";
pub(crate) const TEST_ITERATIONS: u32 = 1_000;

#[derive(Debug, Clone)]
pub(crate) struct Container {
    pub master_key: Vec<u8>,
    pub passphrases: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(crate) struct BackendState {
    pub capacity_mb: u64,
    pub wipes: u32,
    /// Number of wipes that succeed before every further wipe fails.
    pub wipe_budget: Option<u32>,
    pub tables: Vec<(TableKind, Vec<PartitionSlot>, u64)>,
    pub formatted: Vec<(String, FilesystemKind, String)>,
    pub containers: BTreeMap<String, Container>,
    pub open: BTreeMap<String, String>,
    /// Raw bytes standing in for each partition node.
    pub contents: BTreeMap<String, Vec<u8>>,
    pub metadata: Option<(MetadataState, Vec<u8>)>,
    pub fail_on: Option<&'static str>,
    /// Partition node whose container refuses to open.
    pub fail_open_node: Option<String>,
    pub calls: Vec<String>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    pub state: Arc<Mutex<BackendState>>,
}

impl MockBackend {
    pub fn with_capacity(capacity_mb: u64) -> Self {
        let backend = Self::default();
        backend.state.lock().unwrap().capacity_mb = capacity_mb;
        backend
    }

    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().unwrap().fail_on = Some(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn metadata(&self) -> Option<(MetadataState, Vec<u8>)> {
        self.state.lock().unwrap().metadata.clone()
    }

    pub fn set_metadata(&self, state: MetadataState, bytes: Vec<u8>) {
        self.state.lock().unwrap().metadata = Some((state, bytes));
    }

    fn enter(&self, operation: &'static str, detail: &str) -> IronsealResult<std::sync::MutexGuard<'_, BackendState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{operation} {detail}"));
        if state.fail_on == Some(operation) {
            return Err(IronsealError::Provider(format!("{operation} failed on {detail}")));
        }
        Ok(state)
    }
}

impl DeviceBackend for MockBackend {
    type Error = IronsealError;

    fn capacity_mb(&self, device: &str) -> IronsealResult<u64> {
        Ok(self.enter("capacity", device)?.capacity_mb)
    }

    fn wipe(&self, device: &str) -> IronsealResult<()> {
        let mut state = self.enter("wipe", device)?;
        if state.wipe_budget.is_some_and(|budget| state.wipes >= budget) {
            return Err(IronsealError::Provider(format!("wipefs failed on {device}")));
        }
        state.wipes += 1;
        state.containers.clear();
        state.formatted.clear();
        state.contents.clear();
        state.metadata = None;
        Ok(())
    }

    fn write_partition_table(
        &self,
        device: &str,
        table: TableKind,
        slots: &[PartitionSlot],
        reserved_tail_mb: u64,
    ) -> IronsealResult<Vec<String>> {
        let mut state = self.enter("table", device)?;
        state.tables.push((table, slots.to_vec(), reserved_tail_mb));
        Ok(slots
            .iter()
            .map(|slot| partition_node_name(device, slot.number))
            .collect())
    }

    fn format_filesystem(
        &self,
        node: &str,
        filesystem: FilesystemKind,
        label: &str,
    ) -> IronsealResult<()> {
        let mut state = self.enter("format", node)?;
        state
            .contents
            .insert(node.to_string(), format!("{filesystem:?}:{label}").into_bytes());
        state
            .formatted
            .push((node.to_string(), filesystem, label.to_string()));
        Ok(())
    }

    fn create_container(
        &self,
        node: &str,
        _kind: EncryptionKind,
        master_key: &[u8],
        passphrase: &[u8],
    ) -> IronsealResult<()> {
        let mut state = self.enter("create", node)?;
        state
            .contents
            .insert(node.to_string(), [b"LUKS".as_slice(), master_key].concat());
        state.containers.insert(
            node.to_string(),
            Container {
                master_key: master_key.to_vec(),
                passphrases: vec![passphrase.to_vec()],
            },
        );
        Ok(())
    }

    fn open_container(&self, node: &str, mapping: &str, passphrase: &[u8]) -> IronsealResult<String> {
        let mut state = self.enter("open", node)?;
        if state.fail_open_node.as_deref() == Some(node) {
            return Err(IronsealError::Provider(format!("device-mapper busy on {node}")));
        }
        let accepted = state
            .containers
            .get(node)
            .is_some_and(|c| c.passphrases.iter().any(|p| p == passphrase));
        if !accepted {
            return Err(IronsealError::Provider(format!(
                "no key available with this passphrase on {node}"
            )));
        }
        state.open.insert(mapping.to_string(), node.to_string());
        Ok(format!("/dev/mapper/{mapping}"))
    }

    fn close_container(&self, mapping: &str) -> IronsealResult<()> {
        let mut state = self.enter("close", mapping)?;
        state
            .open
            .remove(mapping)
            .map(|_| ())
            .ok_or_else(|| IronsealError::Provider(format!("{mapping} is not active")))
    }

    fn container_header(&self, node: &str) -> IronsealResult<Vec<u8>> {
        self.enter("header", node)?;
        Ok(format!("HDR:{node}").into_bytes())
    }

    fn table_digest(&self, device: &str) -> IronsealResult<[u8; 32]> {
        let state = self.enter("table_digest", device)?;
        Ok(Sha256::digest(format!("{:?}", state.tables.last()).as_bytes()).into())
    }

    fn partition_digest(&self, node: &str) -> IronsealResult<[u8; 32]> {
        let state = self.enter("partition_digest", node)?;
        let contents = state.contents.get(node).map(Vec::as_slice).unwrap_or_default();
        Ok(Sha256::digest(contents).into())
    }

    fn write_metadata(&self, device: &str, state: MetadataState, payload: &[u8]) -> IronsealResult<()> {
        let mut guard = self.enter("write_metadata", device)?;
        guard.metadata = Some((state, payload.to_vec()));
        Ok(())
    }

    fn read_metadata(&self, device: &str) -> IronsealResult<Option<(MetadataState, Vec<u8>)>> {
        Ok(self.enter("read_metadata", device)?.metadata.clone())
    }
}

#[derive(Debug, Default)]
pub(crate) struct HostState {
    pub networking: Vec<bool>,
    pub power_offs: u32,
    pub virtualization: Option<String>,
    pub fail_virtualization: bool,
    pub fail_networking: bool,
}

#[derive(Clone, Default)]
pub(crate) struct MockHost {
    pub state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn networking(&self) -> Option<bool> {
        self.state.lock().unwrap().networking.last().copied()
    }

    pub fn power_offs(&self) -> u32 {
        self.state.lock().unwrap().power_offs
    }
}

impl HostControl for MockHost {
    fn set_networking(&self, enabled: bool) -> IronsealResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_networking {
            return Err(IronsealError::Provider("nmcli not found".into()));
        }
        state.networking.push(enabled);
        Ok(())
    }

    fn power_off(&self) -> IronsealResult<()> {
        self.state.lock().unwrap().power_offs += 1;
        Ok(())
    }

    fn virtualization(&self) -> IronsealResult<Option<String>> {
        let state = self.state.lock().unwrap();
        if state.fail_virtualization {
            return Err(IronsealError::Provider("systemd-detect-virt not found".into()));
        }
        Ok(state.virtualization.clone())
    }
}

pub(crate) fn update_signing_key() -> SigningKey {
    crypto::signing_key_from_bytes(&[7u8; 32])
}

pub(crate) fn sign_image(image: &[u8]) -> Vec<u8> {
    let digest: [u8; 32] = Sha256::digest(image).into();
    crypto::sign(&update_signing_key(), &digest).to_vec()
}

/// Update source serving one in-memory build.
#[derive(Default)]
pub(crate) struct MemorySource {
    pub offer: Option<(String, Vec<u8>, Vec<u8>)>,
    pub downloads: Mutex<u32>,
}

impl MemorySource {
    pub fn offering(version: &str, image: &[u8]) -> Self {
        Self {
            offer: Some((version.to_string(), image.to_vec(), sign_image(image))),
            downloads: Mutex::new(0),
        }
    }
}

impl UpdateSource for MemorySource {
    fn latest(&self) -> IronsealResult<Option<UpdateCandidate>> {
        Ok(self.offer.as_ref().map(|(version, _, signature)| UpdateCandidate {
            version: BuildVersion::parse(version).unwrap(),
            image: "image.bin".into(),
            signature: signature.clone(),
        }))
    }

    fn download(&self, _: &UpdateCandidate, dest: &mut dyn Write) -> IronsealResult<u64> {
        *self.downloads.lock().unwrap() += 1;
        let (_, image, _) = self.offer.as_ref().unwrap();
        dest.write_all(image)?;
        Ok(image.len() as u64)
    }
}

#[derive(Default)]
pub(crate) struct RecordingInstaller {
    pub installed: Mutex<Vec<(Vec<u8>, String)>>,
}

impl ImageInstaller for RecordingInstaller {
    fn install(&self, image: &Path, version: &BuildVersion) -> IronsealResult<()> {
        self.installed
            .lock()
            .unwrap()
            .push((fs::read(image)?, version.to_string()));
        Ok(())
    }
}

/// Key files and resolved plan for the standard three-partition device.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub plan: DeviceFormatPlan,
    pub rescue_key: [u8; 32],
    pub signer_public_hex: String,
}

pub(crate) fn device_template() -> FormatTemplate {
    serde_json::from_value(json!({
        "parameters": {
            "pw": { "descr": "user password", "type": "password" },
            "rescue_key": { "descr": "rescue key file", "type": "file-path" },
            "sign_key": { "descr": "build signing key", "type": "file-path" },
            "created": { "descr": "build date", "type": "timestamp", "attest": true }
        },
        "dev-format": {
            "device": "{_dev}",
            "type": "gpt",
            "partitions": [
                { "id": "efi", "type": "EFI", "label": "EFI", "filesystem": "fat",
                  "size-mb": 64 },
                { "id": "system", "type": "Linux", "label": "system", "encryption": "luks",
                  "immutable": true, "filesystem": "ext4", "password": "{pw}", "size-mb": 512 },
                { "id": "data", "type": "Linux", "label": "data", "encryption": "luks",
                  "filesystem": "ext4", "size-mb": null }
            ],
            "unprotected": { "model": "{_model=generic}" },
            "protected": {
                "user": { "@system/password": null, "@data/password": null,
                          "@data/header": null },
                "rescue": { "@system/password": null, "@data/password": null,
                            "contact": "ops@example.org" }
            },
            "decryptors": {
                "user": { "type": "password", "password": "{pw}" },
                "rescue": { "type": "key", "key-file": "{rescue_key}" }
            },
            "signatures": {
                "build": { "type": "key", "private-key-file": "{sign_key}" }
            }
        }
    }))
    .unwrap()
}

pub(crate) fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let rescue_key = [0x42u8; 32];
    let sign_secret = [0x17u8; 32];
    let rescue_path = dir.path().join("rescue.key");
    let sign_path = dir.path().join("build.key");
    write_key_file(&rescue_path, &rescue_key, KeyEncoding::Raw).unwrap();
    write_key_file(&sign_path, &sign_secret, KeyEncoding::Hex).unwrap();

    let values: BTreeMap<String, String> = [
        ("_dev", DEVICE.to_string()),
        ("pw", USER_PASSWORD.to_string()),
        ("rescue_key", rescue_path.display().to_string()),
        ("sign_key", sign_path.display().to_string()),
        ("created", "2024-02-01 10:00:00".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let plan = template::resolve(&device_template(), &values).unwrap();
    let signer_public_hex = hex::encode(
        crypto::signing_key_from_bytes(&sign_secret)
            .verifying_key()
            .as_bytes(),
    );

    Fixture {
        dir,
        plan,
        rescue_key,
        signer_public_hex,
    }
}

pub(crate) fn test_options() -> ProvisionOptions {
    ProvisionOptions {
        metadata_reserved_mb: 5,
        pbkdf2_iterations: TEST_ITERATIONS,
    }
}

/// A backend holding a freshly provisioned copy of the standard device.
pub(crate) fn provisioned() -> (MockBackend, Fixture) {
    let fixture = fixture();
    let backend = MockBackend::with_capacity(4_096);
    provision(&backend, &fixture.plan, &test_options()).unwrap();
    (backend, fixture)
}
