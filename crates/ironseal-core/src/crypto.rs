//! Sealing, keyslot wrapping and signature primitives.
//!
//! Every protected payload is AES-256-GCM sealed under its own random data key.
//! A decryptor's keyslot wraps that data key under either a PBKDF2-derived key
//! (password decryptors) or a 32-byte key file (key decryptors). Any failure to
//! unwrap or open is reported as the same `InvalidCredential`.

use crate::error::{IronsealError, IronsealResult};
use crate::keyfile::KEY_LEN;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
pub const SIGNATURE_LEN: usize = 64;

/// Symmetric key protecting one payload.
pub type DataKey = Zeroizing<[u8; KEY_LEN]>;

/// Fill a fresh buffer from the OS RNG.
pub fn random_bytes<const N: usize>() -> Zeroizing<[u8; N]> {
    let mut out = Zeroizing::new([0u8; N]);
    OsRng.fill_bytes(&mut out[..]);
    out
}

pub fn random_data_key() -> DataKey {
    random_bytes::<KEY_LEN>()
}

/// Nonce plus AEAD ciphertext, hex encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// Bytes covered by signatures: nonce followed by ciphertext.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nonce.len() + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> IronsealResult<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(IronsealError::provider)?;
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce[..]), plaintext)
        .map_err(|_| IronsealError::Provider("AEAD encryption failed".to_string()))?;
    Ok(Sealed {
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Authenticated decryption. Wrong keys and altered bytes look identical.
pub fn open(key: &[u8; KEY_LEN], sealed: &Sealed) -> IronsealResult<Zeroizing<Vec<u8>>> {
    if sealed.nonce.len() != NONCE_LEN {
        return Err(IronsealError::InvalidCredential);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| IronsealError::InvalidCredential)?;
    cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| IronsealError::InvalidCredential)
}

pub fn derive_password_key(password: &[u8], salt: &[u8], iterations: u32) -> DataKey {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out[..]);
    out
}

/// Credential presented to a decryptor.
pub enum Credential {
    Password(Zeroizing<String>),
    Key(Zeroizing<[u8; KEY_LEN]>),
}

impl Credential {
    pub fn password(value: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(value.into()))
    }

    pub fn key(bytes: [u8; KEY_LEN]) -> Self {
        Credential::Key(Zeroizing::new(bytes))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Credential::Password(..)"),
            Credential::Key(_) => f.write_str("Credential::Key(..)"),
        }
    }
}

/// Data key wrapped for one decryptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Keyslot {
    Password {
        #[serde(with = "hex_bytes")]
        salt: Vec<u8>,
        iterations: u32,
        wrapped: Sealed,
    },
    Key {
        wrapped: Sealed,
    },
}

impl Keyslot {
    pub fn wrap_with_password(
        data_key: &[u8; KEY_LEN],
        password: &[u8],
        iterations: u32,
    ) -> IronsealResult<Self> {
        let salt = random_bytes::<SALT_LEN>();
        let kek = derive_password_key(password, &salt[..], iterations);
        Ok(Keyslot::Password {
            salt: salt.to_vec(),
            iterations,
            wrapped: seal(&kek, &data_key[..])?,
        })
    }

    pub fn wrap_with_key(data_key: &[u8; KEY_LEN], key: &[u8; KEY_LEN]) -> IronsealResult<Self> {
        Ok(Keyslot::Key {
            wrapped: seal(key, &data_key[..])?,
        })
    }

    pub fn wrap(
        data_key: &[u8; KEY_LEN],
        credential: &Credential,
        iterations: u32,
    ) -> IronsealResult<Self> {
        match credential {
            Credential::Password(password) => {
                Self::wrap_with_password(data_key, password.as_bytes(), iterations)
            }
            Credential::Key(key) => Self::wrap_with_key(data_key, key),
        }
    }

    pub fn is_password(&self) -> bool {
        matches!(self, Keyslot::Password { .. })
    }

    /// Recover the data key. A credential of the wrong kind fails like a wrong value.
    pub fn unwrap_key(&self, credential: &Credential) -> IronsealResult<DataKey> {
        let plain = match (self, credential) {
            (
                Keyslot::Password {
                    salt,
                    iterations,
                    wrapped,
                },
                Credential::Password(password),
            ) => {
                let kek = derive_password_key(password.as_bytes(), salt, *iterations);
                open(&kek, wrapped)?
            }
            (Keyslot::Key { wrapped }, Credential::Key(key)) => open(key, wrapped)?,
            _ => return Err(IronsealError::InvalidCredential),
        };

        if plain.len() != KEY_LEN {
            return Err(IronsealError::InvalidCredential);
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&plain);
        Ok(key)
    }
}

pub fn signing_key_from_bytes(secret: &[u8; KEY_LEN]) -> SigningKey {
    SigningKey::from_bytes(secret)
}

pub fn sign(key: &SigningKey, message: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(message).to_bytes()
}

pub fn parse_public_key(hex_key: &str) -> IronsealResult<VerifyingKey> {
    let mut bytes = [0u8; KEY_LEN];
    hex::decode_to_slice(hex_key.trim(), &mut bytes).map_err(|err| {
        IronsealError::DeviceIntegrity(format!("malformed public key: {err}"))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|err| IronsealError::DeviceIntegrity(format!("invalid public key: {err}")))
}

/// Plain boolean check; callers decide how a mismatch is surfaced.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&bytes)).is_ok()
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
