use super::*;
use crate::crypto::Credential;
use crate::error::IronsealError;
use crate::metadata::DeviceMetadata;
use crate::template::{self, SecretField, SignatureSpec};
use crate::testing::{
    fixture, provisioned, test_options, MockBackend, DEVICE, USER_PASSWORD,
};
use crate::unlock::{unlock_device, UnlockRequest};
use ironseal_provider::{MetadataState, TableKind};
use serde_json::json;
use std::collections::BTreeMap;

fn sealed_metadata(backend: &MockBackend) -> DeviceMetadata {
    match backend.metadata() {
        Some((MetadataState::Sealed, bytes)) => DeviceMetadata::from_bytes(&bytes).unwrap(),
        other => panic!("expected sealed metadata, got {other:?}"),
    }
}

fn trusted(name: &str, key_hex: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(name.to_string(), key_hex.to_string())])
}

#[test]
fn provision_seals_device_for_every_decryptor() {
    let (backend, fixture) = provisioned();
    let metadata = sealed_metadata(&backend);

    metadata
        .verify(&trusted("build", &fixture.signer_public_hex))
        .unwrap();
    assert_eq!(
        metadata.unprotected["attested"]["created"],
        json!("2024-02-01 10:00:00")
    );
    assert_eq!(metadata.unprotected["model"], json!("generic"));

    let slots: Vec<_> = metadata.layout.iter().map(|e| (e.id.as_str(), e.slot)).collect();
    assert_eq!(
        slots,
        vec![("efi", Some(1)), ("system", Some(2)), ("data", Some(3))]
    );

    let user = metadata
        .unwrap("user", &Credential::password(USER_PASSWORD))
        .unwrap();
    let rescue = metadata
        .unwrap("rescue", &Credential::key(fixture.rescue_key))
        .unwrap();

    assert_eq!(user.secret("system", SecretField::Password), Some(USER_PASSWORD));
    let data_password = user.secret("data", SecretField::Password).unwrap();
    assert_eq!(data_password.len(), 64);
    assert_eq!(rescue.secret("data", SecretField::Password), Some(data_password));
    assert_eq!(
        user.secret("data", SecretField::Header),
        Some(hex::encode("HDR:/dev/sdz3").as_str())
    );
    assert_eq!(rescue.0["contact"], json!("ops@example.org"));

    let state = backend.state.lock().unwrap();
    assert!(state.open.is_empty(), "provisioning mappings must be closed");
    assert_eq!(state.containers["/dev/sdz3"].passphrases.len(), 1);
    assert_eq!(state.containers["/dev/sdz3"].passphrases[0], data_password.as_bytes());
}

#[test]
fn report_never_contains_secrets() {
    let fixture = fixture();
    let backend = MockBackend::with_capacity(4_096);
    let report = provision(&backend, &fixture.plan, &test_options()).unwrap();
    assert!(!report.has_errors());
    assert!(report
        .events
        .iter()
        .all(|event| !event.message.contains(USER_PASSWORD)));
    assert!(report
        .events
        .iter()
        .any(|event| event.level == WorkflowLevel::Success));
}

#[test]
fn capacity_is_checked_before_any_write() {
    let fixture = fixture();
    let backend = MockBackend::with_capacity(100);
    let err = provision(&backend, &fixture.plan, &test_options()).unwrap_err();
    match err {
        IronsealError::Capacity {
            required_mb,
            available_mb,
        } => {
            assert_eq!(required_mb, 64 + 512 + UNSIZED_MINIMUM_MB + 5);
            assert_eq!(available_mb, 100);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(backend.calls(), vec![format!("capacity {DEVICE}")]);
}

#[test]
fn unreadable_signing_key_fails_before_touching_device() {
    let mut fixture = fixture();
    fixture.plan.signatures.insert(
        "build".into(),
        SignatureSpec::Key {
            private_key_file: fixture.dir.path().join("missing.key"),
        },
    );
    let backend = MockBackend::with_capacity(4_096);
    assert!(provision(&backend, &fixture.plan, &test_options()).is_err());
    assert!(backend.calls().is_empty());
}

#[test]
fn mid_write_failure_wipes_the_device() {
    let fixture = fixture();
    let backend = MockBackend::with_capacity(4_096);
    backend.fail_on("header");

    let err = provision(&backend, &fixture.plan, &test_options()).unwrap_err();
    assert!(matches!(err, IronsealError::Provisioning(_)));
    let state = backend.state.lock().unwrap();
    assert_eq!(state.wipes, 2);
    assert!(state.metadata.is_none());
    assert!(state.containers.is_empty());
}

#[test]
fn failed_rollback_leaves_incomplete_marker() {
    let fixture = fixture();
    let backend = MockBackend::with_capacity(4_096);
    {
        let mut state = backend.state.lock().unwrap();
        state.wipe_budget = Some(1);
        state.fail_on = Some("format");
    }

    assert!(provision(&backend, &fixture.plan, &test_options()).is_err());
    let (state, bytes) = backend.metadata().unwrap();
    assert_eq!(state, MetadataState::Incomplete);
    let marker: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(marker["reason"].as_str().unwrap().contains("format failed"));

    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: BTreeMap::new(),
    };
    assert!(matches!(
        unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)),
        Err(IronsealError::DeviceIntegrity(_))
    ));

    backend.state.lock().unwrap().fail_on = None;
    let report = inspect(&backend, DEVICE, &InspectOptions::default()).unwrap();
    assert!(report.has_errors());
}

#[test]
fn hybrid_dormant_member_is_never_materialised() {
    let base = fixture();
    let sign_key = base.dir.path().join("build.key");
    let tpl: crate::template::FormatTemplate = serde_json::from_value(json!({
        "parameters": {},
        "dev-format": {
            "device": "{_dev}",
            "type": "hybrid",
            "hybrid-partitions": ["decoy", "real"],
            "partitions": [
                { "id": "efi", "type": "EFI", "label": "EFI", "filesystem": "fat", "size-mb": 64 },
                { "id": "decoy", "type": "Linux", "label": "decoy", "filesystem": "fat",
                  "size-mb": 100 },
                { "id": "real", "type": "Linux", "label": "real", "encryption": "luks",
                  "filesystem": "ext4", "size-mb": 300 },
                { "id": "data", "type": "Linux", "label": "data", "encryption": "luks",
                  "filesystem": "ext4", "size-mb": null }
            ],
            "protected": { "user": { "@data/password": null } },
            "decryptors": { "user": { "type": "password", "password": "pw" } },
            "signatures": { "build": { "type": "key", "private-key-file": sign_key } }
        }
    }))
    .unwrap();
    let values = BTreeMap::from([("_dev".to_string(), DEVICE.to_string())]);
    let plan = template::resolve(&tpl, &values).unwrap();

    let backend = MockBackend::with_capacity(4_096);
    provision(&backend, &plan, &test_options()).unwrap();

    let state = backend.state.lock().unwrap();
    let (table, slots, reserved) = &state.tables[0];
    assert_eq!(*table, TableKind::Hybrid);
    assert_eq!(*reserved, 5);
    let sizes: Vec<_> = slots.iter().map(|s| s.size_mb).collect();
    assert_eq!(sizes, vec![Some(64), Some(300), None]);

    let formatted: Vec<_> = state.formatted.iter().map(|(node, ..)| node.as_str()).collect();
    assert!(formatted.contains(&"/dev/sdz2"));
    assert!(!state.containers.contains_key("/dev/sdz2"));
    assert!(state.formatted.iter().all(|(_, _, label)| label != "real"));
    drop(state);

    let metadata = sealed_metadata(&backend);
    let real = metadata.layout_entry("real").unwrap();
    assert_eq!(real.slot, None);
    assert_eq!(metadata.layout_entry("decoy").unwrap().slot, Some(2));
    assert_eq!(metadata.layout_entry("data").unwrap().slot, Some(3));
}

#[test]
fn unlock_with_either_decryptor_opens_every_partition() {
    let (backend, fixture) = provisioned();
    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &fixture.signer_public_hex),
    };

    let outcome = unlock_device(&backend, &request, &Credential::key(fixture.rescue_key)).unwrap();
    assert_eq!(outcome.decryptor, "rescue");
    assert_eq!(
        outcome.opened,
        vec![
            "/dev/mapper/ironseal-system".to_string(),
            "/dev/mapper/ironseal-data".to_string()
        ]
    );

    assert!(matches!(
        unlock_device(&backend, &request, &Credential::key([1u8; 32])),
        Err(IronsealError::InvalidCredential)
    ));
    assert!(matches!(
        unlock_device(&backend, &request, &Credential::password("nope")),
        Err(IronsealError::InvalidCredential)
    ));
}

#[test]
fn failed_open_closes_mappings_already_opened() {
    let (backend, fixture) = provisioned();
    backend.state.lock().unwrap().fail_open_node = Some("/dev/sdz3".into());
    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &fixture.signer_public_hex),
    };

    assert!(matches!(
        unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)),
        Err(IronsealError::Provider(_))
    ));
    {
        let state = backend.state.lock().unwrap();
        assert!(state.open.is_empty());
        assert!(state.calls.iter().any(|call| call == "close ironseal-system"));
    }

    backend.state.lock().unwrap().fail_open_node = None;
    let outcome = unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)).unwrap();
    assert_eq!(outcome.opened.len(), 2);
}

#[test]
fn immutable_partitions_carry_recorded_digests() {
    let (backend, fixture) = provisioned();
    let metadata = sealed_metadata(&backend);
    assert!(metadata.table_digest.is_some());
    assert!(metadata.layout_entry("system").unwrap().digest.is_some());
    assert_eq!(metadata.layout_entry("data").unwrap().digest, None);
    metadata.verify_contents(&backend, DEVICE).unwrap();

    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &fixture.signer_public_hex),
    };
    backend
        .state
        .lock()
        .unwrap()
        .contents
        .insert("/dev/sdz3".into(), b"rewritten data".to_vec());
    unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)).unwrap();
}

#[test]
fn tampered_immutable_partition_refuses_unlock() {
    let (backend, fixture) = provisioned();
    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &fixture.signer_public_hex),
    };
    backend
        .state
        .lock()
        .unwrap()
        .contents
        .insert("/dev/sdz2".into(), b"implanted".to_vec());

    let Err(IronsealError::DeviceIntegrity(message)) =
        unlock_device(&backend, &request, &Credential::password(USER_PASSWORD))
    else {
        panic!("modified immutable partition must fail integrity");
    };
    assert!(message.contains("system"));
    assert!(backend.state.lock().unwrap().open.is_empty());

    let report = inspect(&backend, DEVICE, &InspectOptions::default()).unwrap();
    assert!(report.has_errors());
}

#[test]
fn rewritten_partition_table_refuses_unlock() {
    let (backend, fixture) = provisioned();
    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &fixture.signer_public_hex),
    };
    {
        let mut state = backend.state.lock().unwrap();
        let (kind, mut slots, reserved) = state.tables.last().cloned().unwrap();
        slots.pop();
        state.tables.push((kind, slots, reserved));
    }
    assert!(matches!(
        unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)),
        Err(IronsealError::DeviceIntegrity(message)) if message.contains("partition table")
    ));
}

#[test]
fn pinned_signer_mismatch_is_an_integrity_failure() {
    let (backend, _fixture) = provisioned();
    let other = hex::encode(
        crate::crypto::signing_key_from_bytes(&[9u8; 32])
            .verifying_key()
            .as_bytes(),
    );
    let request = UnlockRequest {
        device: DEVICE.into(),
        mapping_prefix: "ironseal-".into(),
        trusted_signers: trusted("build", &other),
    };
    assert!(matches!(
        unlock_device(&backend, &request, &Credential::password(USER_PASSWORD)),
        Err(IronsealError::DeviceIntegrity(_))
    ));
    assert!(backend.state.lock().unwrap().open.is_empty());
}

#[test]
fn inspect_names_the_decryptor_a_credential_opens() {
    let (backend, fixture) = provisioned();
    let options = InspectOptions {
        trusted_signers: trusted("build", &fixture.signer_public_hex),
        credential: Some(Credential::key(fixture.rescue_key)),
    };
    let report = inspect(&backend, DEVICE, &options).unwrap();
    assert!(!report.has_errors());
    assert!(report.events.iter().any(|event| {
        event.level == WorkflowLevel::Security && event.message.contains("`rescue`")
    }));
    assert!(report
        .events
        .iter()
        .any(|event| event.message.contains("Partition data [slot 3]")));

    let blank = MockBackend::with_capacity(10);
    let report = inspect(&blank, DEVICE, &InspectOptions::default()).unwrap();
    assert!(report
        .events
        .iter()
        .any(|event| event.level == WorkflowLevel::Warn));
}
