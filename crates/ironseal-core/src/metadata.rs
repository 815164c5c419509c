//! On-device metadata: layout, sealed payloads, keyslots and signatures.
//!
//! The signed message is the canonical JSON of the unprotected section (user
//! fields, attestations and layout) followed by every sealed payload in name
//! order, each framed with its name and length. Keyslots are deliberately not
//! covered so that a password can be re-wrapped without the build-time
//! signing key.
//!
//! The unprotected section also carries SHA-256 digests of the partition
//! table and of every immutable partition, rechecked by
//! [`DeviceMetadata::verify_contents`].

use crate::crypto::{self, Credential, DataKey, Keyslot, Sealed};
use crate::error::{IronsealError, IronsealResult};
use crate::template::{SecretField, SecretRef};
use ed25519_dalek::{SigningKey, VerifyingKey};
use ironseal_provider::{DeviceBackend, EncryptionKind, FilesystemKind, PartitionType};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use zeroize::Zeroizing;

pub const METADATA_FORMAT: u32 = 1;

/// Where a partition ended up on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub id: String,
    /// Table slot, `None` for dormant hybrid members.
    pub slot: Option<u32>,
    #[serde(rename = "type")]
    pub kind: PartitionType,
    pub label: String,
    pub filesystem: FilesystemKind,
    pub encryption: Option<EncryptionKind>,
    pub immutable: bool,
    pub size_mb: Option<u64>,
    /// Hex SHA-256 of the raw partition, recorded for immutable partitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Hex ed25519 verifying key embedded at build time.
    pub public_key: String,
    #[serde(with = "crypto::hex_bytes")]
    pub signature: Vec<u8>,
}

/// Decrypted protected payload. Partition secrets sit under `@id/field` keys.
#[derive(Clone, PartialEq)]
pub struct ProtectedPayload(pub Map<String, Value>);

impl std::fmt::Debug for ProtectedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl ProtectedPayload {
    pub fn secret(&self, partition: &str, field: SecretField) -> Option<&str> {
        let key = match field {
            SecretField::Password => format!("@{partition}/password"),
            SecretField::Header => format!("@{partition}/header"),
        };
        self.0.get(&key).and_then(Value::as_str)
    }

    /// Partition ids whose password this payload carries.
    pub fn partitions(&self) -> Vec<String> {
        self.0
            .keys()
            .filter_map(|key| SecretRef::parse(key).and_then(Result::ok))
            .filter(|reference| reference.field == SecretField::Password)
            .map(|reference| reference.partition)
            .collect()
    }

    fn to_bytes(&self) -> IronsealResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(&self.0)?))
    }

    fn from_bytes(bytes: &[u8]) -> IronsealResult<Self> {
        serde_json::from_slice(bytes)
            .map(ProtectedPayload)
            .map_err(|_| IronsealError::InvalidCredential)
    }
}

/// Everything persisted in the device metadata region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub format: u32,
    pub unprotected: Map<String, Value>,
    pub layout: Vec<LayoutEntry>,
    /// Hex SHA-256 of the partition table areas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_digest: Option<String>,
    pub protected: BTreeMap<String, Sealed>,
    pub keyslots: BTreeMap<String, Keyslot>,
    pub signatures: BTreeMap<String, SignatureRecord>,
}

/// Verify `signature` over `unprotected` followed by the framed ciphertexts.
pub fn verify_signature<'a>(
    public_key: &VerifyingKey,
    unprotected: &[u8],
    protected: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    signature: &[u8],
) -> bool {
    crypto::verify(public_key, &frame(unprotected, protected), signature)
}

fn frame<'a>(unprotected: &[u8], protected: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Vec<u8> {
    let mut message = unprotected.to_vec();
    for (name, ciphertext) in protected {
        message.extend_from_slice(name.as_bytes());
        message.push(0);
        message.extend_from_slice(&(ciphertext.len() as u64).to_be_bytes());
        message.extend_from_slice(ciphertext);
    }
    message
}

impl DeviceMetadata {
    /// Seal each payload under a fresh data key and wrap that key for the
    /// decryptor of the same name. Signatures are added by [`Self::sign`].
    pub fn seal(
        unprotected: Map<String, Value>,
        layout: Vec<LayoutEntry>,
        payloads: &BTreeMap<String, (ProtectedPayload, Credential)>,
        pbkdf2_iterations: u32,
    ) -> IronsealResult<Self> {
        let mut protected = BTreeMap::new();
        let mut keyslots = BTreeMap::new();
        for (name, (payload, credential)) in payloads {
            let data_key = crypto::random_data_key();
            protected.insert(name.clone(), crypto::seal(&data_key, &payload.to_bytes()?)?);
            keyslots.insert(
                name.clone(),
                Keyslot::wrap(&data_key, credential, pbkdf2_iterations)?,
            );
        }

        Ok(Self {
            format: METADATA_FORMAT,
            unprotected,
            layout,
            table_digest: None,
            protected,
            keyslots,
            signatures: BTreeMap::new(),
        })
    }

    pub fn unprotected_bytes(&self) -> IronsealResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Unprotected<'a> {
            format: u32,
            fields: &'a Map<String, Value>,
            layout: &'a [LayoutEntry],
            #[serde(skip_serializing_if = "Option::is_none")]
            table_digest: Option<&'a str>,
        }
        Ok(serde_json::to_vec(&Unprotected {
            format: self.format,
            fields: &self.unprotected,
            layout: &self.layout,
            table_digest: self.table_digest.as_deref(),
        })?)
    }

    pub fn signed_message(&self) -> IronsealResult<Vec<u8>> {
        let protected: Vec<(&str, Vec<u8>)> = self
            .protected
            .iter()
            .map(|(name, sealed)| (name.as_str(), sealed.signed_bytes()))
            .collect();
        Ok(frame(
            &self.unprotected_bytes()?,
            protected.iter().map(|(name, bytes)| (*name, bytes.as_slice())),
        ))
    }

    pub fn sign(&mut self, signers: &BTreeMap<String, SigningKey>) -> IronsealResult<()> {
        let message = self.signed_message()?;
        for (name, key) in signers {
            self.signatures.insert(
                name.clone(),
                SignatureRecord {
                    public_key: hex::encode(key.verifying_key().to_bytes()),
                    signature: crypto::sign(key, &message).to_vec(),
                },
            );
        }
        Ok(())
    }

    /// Check signatures before anything protected is trusted.
    ///
    /// With `trusted` signers configured, each of them must have a valid
    /// signature and embedded keys are ignored. Otherwise every embedded
    /// signature must verify against its own embedded key.
    pub fn verify(&self, trusted: &BTreeMap<String, String>) -> IronsealResult<()> {
        if self.signatures.is_empty() {
            return Err(IronsealError::DeviceIntegrity("metadata is unsigned".into()));
        }
        let message = self.signed_message()?;

        let checks: Vec<(&String, &str)> = if trusted.is_empty() {
            self.signatures
                .iter()
                .map(|(name, record)| (name, record.public_key.as_str()))
                .collect()
        } else {
            trusted.iter().map(|(name, key)| (name, key.as_str())).collect()
        };

        for (name, public_hex) in checks {
            let record = self.signatures.get(name).ok_or_else(|| {
                IronsealError::DeviceIntegrity(format!("signature `{name}` is missing"))
            })?;
            let public_key = crypto::parse_public_key(public_hex)?;
            if !crypto::verify(&public_key, &message, &record.signature) {
                warn!("signature `{name}` does not match device metadata");
                return Err(IronsealError::DeviceIntegrity(format!(
                    "signature `{name}` does not match"
                )));
            }
            debug!("signature `{name}` verified");
        }
        Ok(())
    }

    /// Recompute the recorded table and immutable partition digests on
    /// `device`. Call after [`Self::verify`] so the recorded values are trusted.
    pub fn verify_contents<B: DeviceBackend>(&self, backend: &B, device: &str) -> IronsealResult<()> {
        if let Some(expected) = &self.table_digest {
            let actual = backend
                .table_digest(device)
                .map_err(IronsealError::provider)?;
            if hex::encode(actual) != *expected {
                warn!("partition table of {device} changed since sealing");
                return Err(IronsealError::DeviceIntegrity(
                    "partition table has been modified".into(),
                ));
            }
        }

        for entry in self.layout.iter().filter(|entry| entry.immutable) {
            let Some(slot) = entry.slot else {
                continue;
            };
            let Some(expected) = &entry.digest else {
                return Err(IronsealError::DeviceIntegrity(format!(
                    "immutable partition `{}` has no recorded digest",
                    entry.id
                )));
            };
            let node = backend.partition_node(device, slot);
            let actual = backend
                .partition_digest(&node)
                .map_err(IronsealError::provider)?;
            if hex::encode(actual) != *expected {
                warn!("immutable partition {} on {node} changed since sealing", entry.id);
                return Err(IronsealError::DeviceIntegrity(format!(
                    "immutable partition `{}` has been modified",
                    entry.id
                )));
            }
            debug!("immutable partition {} unchanged", entry.id);
        }
        Ok(())
    }

    fn open_with(&self, name: &str, credential: &Credential) -> IronsealResult<(DataKey, ProtectedPayload)> {
        let slot = self
            .keyslots
            .get(name)
            .ok_or(IronsealError::InvalidCredential)?;
        let sealed = self
            .protected
            .get(name)
            .ok_or(IronsealError::InvalidCredential)?;
        let data_key = slot.unwrap_key(credential)?;
        let plain = crypto::open(&data_key, sealed)?;
        Ok((data_key, ProtectedPayload::from_bytes(&plain)?))
    }

    /// Unwrap the payload of one named decryptor.
    pub fn unwrap(&self, decryptor: &str, credential: &Credential) -> IronsealResult<ProtectedPayload> {
        self.open_with(decryptor, credential).map(|(_, payload)| payload)
    }

    /// Try every decryptor that accepts this kind of credential.
    pub fn unwrap_any(&self, credential: &Credential) -> IronsealResult<(String, ProtectedPayload)> {
        let wants_password = matches!(credential, Credential::Password(_));
        for (name, slot) in &self.keyslots {
            if slot.is_password() != wants_password {
                continue;
            }
            if let Ok(payload) = self.unwrap(name, credential) {
                return Ok((name.clone(), payload));
            }
        }
        Err(IronsealError::InvalidCredential)
    }

    /// Re-wrap every password keyslot that `current` opens under `new`.
    /// Returns the names of the decryptors that changed.
    pub fn change_password(
        &mut self,
        current: &str,
        new: &str,
        pbkdf2_iterations: u32,
    ) -> IronsealResult<Vec<String>> {
        let current = Credential::password(current);
        let mut changed = Vec::new();
        let names: Vec<String> = self
            .keyslots
            .iter()
            .filter(|(_, slot)| slot.is_password())
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            let Ok((data_key, _)) = self.open_with(&name, &current) else {
                continue;
            };
            let slot = Keyslot::wrap_with_password(&data_key, new.as_bytes(), pbkdf2_iterations)?;
            self.keyslots.insert(name.clone(), slot);
            changed.push(name);
        }

        if changed.is_empty() {
            return Err(IronsealError::InvalidCredential);
        }
        Ok(changed)
    }

    pub fn layout_entry(&self, id: &str) -> Option<&LayoutEntry> {
        self.layout.iter().find(|entry| entry.id == id)
    }

    pub fn to_bytes(&self) -> IronsealResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> IronsealResult<Self> {
        let metadata: Self = serde_json::from_slice(bytes)
            .map_err(|err| IronsealError::DeviceIntegrity(format!("unreadable metadata: {err}")))?;
        if metadata.format != METADATA_FORMAT {
            return Err(IronsealError::DeviceIntegrity(format!(
                "unsupported metadata format {}",
                metadata.format
            )));
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ITER: u32 = 1_000;

    fn payload() -> ProtectedPayload {
        let Value::Object(map) = json!({ "@data/password": "p4ss", "note": "rescue" }) else {
            unreachable!()
        };
        ProtectedPayload(map)
    }

    fn sealed_metadata() -> (DeviceMetadata, SigningKey) {
        let mut payloads = BTreeMap::new();
        payloads.insert("user".to_string(), (payload(), Credential::password("userpw")));
        payloads.insert("rescue".to_string(), (payload(), Credential::key([5u8; 32])));
        let mut unprotected = Map::new();
        unprotected.insert("model".into(), json!("demo"));
        let mut metadata = DeviceMetadata::seal(unprotected, Vec::new(), &payloads, ITER).unwrap();

        let signer = crypto::signing_key_from_bytes(&[8u8; 32]);
        let mut signers = BTreeMap::new();
        signers.insert("build".to_string(), signer.clone());
        metadata.sign(&signers).unwrap();
        (metadata, signer)
    }

    #[test]
    fn every_decryptor_recovers_the_same_payload() {
        let (metadata, _) = sealed_metadata();
        let via_user = metadata
            .unwrap("user", &Credential::password("userpw"))
            .unwrap();
        let via_rescue = metadata.unwrap("rescue", &Credential::key([5u8; 32])).unwrap();
        assert_eq!(via_user, payload());
        assert_eq!(via_user, via_rescue);
        assert_eq!(via_user.secret("data", SecretField::Password), Some("p4ss"));
        assert_eq!(via_user.partitions(), vec!["data".to_string()]);
    }

    #[test]
    fn wrong_credentials_fail_uniformly() {
        let (metadata, _) = sealed_metadata();
        for (name, credential) in [
            ("user", Credential::password("nope")),
            ("user", Credential::key([5u8; 32])),
            ("rescue", Credential::key([6u8; 32])),
            ("missing", Credential::password("userpw")),
        ] {
            assert!(matches!(
                metadata.unwrap(name, &credential),
                Err(IronsealError::InvalidCredential)
            ));
        }
        assert!(matches!(
            metadata.unwrap_any(&Credential::password("nope")),
            Err(IronsealError::InvalidCredential)
        ));
        let (name, _) = metadata.unwrap_any(&Credential::key([5u8; 32])).unwrap();
        assert_eq!(name, "rescue");
    }

    #[test]
    fn signatures_detect_flipped_ciphertext() {
        let (mut metadata, _) = sealed_metadata();
        metadata.verify(&BTreeMap::new()).unwrap();

        if let Some(sealed) = metadata.protected.get_mut("user") {
            sealed.ciphertext[0] ^= 0xff;
        }
        assert!(matches!(
            metadata.verify(&BTreeMap::new()),
            Err(IronsealError::DeviceIntegrity(_))
        ));
    }

    #[test]
    fn signatures_detect_unprotected_edits() {
        let (mut metadata, _) = sealed_metadata();
        metadata.unprotected.insert("model".into(), json!("forged"));
        assert!(metadata.verify(&BTreeMap::new()).is_err());
    }

    #[test]
    fn signatures_cover_recorded_digests() {
        let system = LayoutEntry {
            id: "system".into(),
            slot: Some(2),
            kind: PartitionType::Linux,
            label: "SYSTEM".into(),
            filesystem: FilesystemKind::Ext4,
            encryption: None,
            immutable: true,
            size_mb: Some(64),
            digest: Some(hex::encode([1u8; 32])),
        };
        let mut payloads = BTreeMap::new();
        payloads.insert("user".to_string(), (payload(), Credential::password("userpw")));
        let mut metadata =
            DeviceMetadata::seal(Map::new(), vec![system], &payloads, ITER).unwrap();
        metadata.table_digest = Some(hex::encode([2u8; 32]));
        let mut signers = BTreeMap::new();
        signers.insert("build".to_string(), crypto::signing_key_from_bytes(&[8u8; 32]));
        metadata.sign(&signers).unwrap();
        metadata.verify(&BTreeMap::new()).unwrap();

        let mut forged = metadata.clone();
        forged.layout[0].digest = Some(hex::encode([3u8; 32]));
        assert!(forged.verify(&BTreeMap::new()).is_err());

        let mut forged = metadata.clone();
        forged.table_digest = None;
        assert!(forged.verify(&BTreeMap::new()).is_err());

        let restored = DeviceMetadata::from_bytes(&metadata.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.table_digest, metadata.table_digest);
        restored.verify(&BTreeMap::new()).unwrap();
    }

    #[test]
    fn trusted_signers_override_embedded_keys() {
        let (mut metadata, signer) = sealed_metadata();
        let mut trusted = BTreeMap::new();
        trusted.insert(
            "build".to_string(),
            hex::encode(signer.verifying_key().to_bytes()),
        );
        metadata.verify(&trusted).unwrap();

        // Re-signing with an attacker key passes self-verification but not the pinned key.
        let attacker = crypto::signing_key_from_bytes(&[1u8; 32]);
        metadata.unprotected.insert("model".into(), json!("forged"));
        let mut signers = BTreeMap::new();
        signers.insert("build".to_string(), attacker);
        metadata.sign(&signers).unwrap();
        metadata.verify(&BTreeMap::new()).unwrap();
        assert!(matches!(
            metadata.verify(&trusted),
            Err(IronsealError::DeviceIntegrity(_))
        ));
    }

    #[test]
    fn free_function_verifies_split_inputs() {
        let (metadata, signer) = sealed_metadata();
        let unprotected = metadata.unprotected_bytes().unwrap();
        let ciphertexts: Vec<(String, Vec<u8>)> = metadata
            .protected
            .iter()
            .map(|(name, sealed)| (name.clone(), sealed.signed_bytes()))
            .collect();
        let signature = &metadata.signatures["build"].signature;
        assert!(verify_signature(
            &signer.verifying_key(),
            &unprotected,
            ciphertexts.iter().map(|(n, b)| (n.as_str(), b.as_slice())),
            signature,
        ));
    }

    #[test]
    fn change_password_keeps_signatures_valid() {
        let (mut metadata, _) = sealed_metadata();
        let changed = metadata.change_password("userpw", "newpw", ITER).unwrap();
        assert_eq!(changed, vec!["user".to_string()]);
        metadata.verify(&BTreeMap::new()).unwrap();
        assert!(metadata.unwrap("user", &Credential::password("userpw")).is_err());
        assert_eq!(
            metadata.unwrap("user", &Credential::password("newpw")).unwrap(),
            payload()
        );
        assert!(matches!(
            metadata.change_password("userpw", "again", ITER),
            Err(IronsealError::InvalidCredential)
        ));
    }

    #[test]
    fn bytes_round_trip_and_reject_garbage() {
        let (metadata, _) = sealed_metadata();
        let restored = DeviceMetadata::from_bytes(&metadata.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, metadata);
        assert!(matches!(
            DeviceMetadata::from_bytes(b"not json"),
            Err(IronsealError::DeviceIntegrity(_))
        ));
    }
}
