//! Key material for signed assertions.
//!
//! Keys live in a JSON keystore file:
//!
//! ```json
//! {
//!   "type": "workbench-keystore",
//!   "entries": {
//!     "signing": { "kind": "key_pair", "certificate": "<base64>", "sealed_key": "<base64>" },
//!     "encrypting": { "kind": "secret_key", "sealed_key": "<base64>" }
//!   },
//!   "salt": "<hex>",
//!   "mac": "<hex>"
//! }
//! ```
//!
//! Passwords never key anything directly: each is stretched with Argon2id and
//! the keystore's random `salt` (see [`crypto::password_keys`]). `mac` is an
//! HMAC-SHA256 over the serialized `entries`, keyed with the MAC key of the
//! keystore password. Key pair secrets are sealed with the sealing key of their
//! own key password, secret keys with that of the keystore password.

use crate::crypto::{self, KEY_LEN, SALT_LEN, SealError};
use crate::metrics_defs::KEYSTORE_LOADS;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::counter;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const KEYSTORE_TYPE: &str = "workbench-keystore";

type HmacSha256 = Hmac<Sha256>;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("unable to read keystore {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse keystore: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported keystore type: {0}")]
    UnsupportedType(String),
    #[error("keystore integrity check failed")]
    Integrity,
    #[error("keystore has no entry named {0}")]
    MissingEntry(String),
    #[error("keystore entry {0} has the wrong kind")]
    WrongEntryKind(String),
    #[error("unable to unseal keystore entry {alias}: {source}")]
    Unseal {
        alias: String,
        #[source]
        source: SealError,
    },
    #[error("keystore entry {0} is malformed")]
    Malformed(String),
    #[error("unable to derive keys from the keystore passwords: {0}")]
    KeyDerivation(#[source] SealError),
    #[error("unable to write keystore: {0}")]
    Write(std::io::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum KeystoreEntry {
    KeyPair {
        certificate: String,
        sealed_key: String,
    },
    SecretKey {
        sealed_key: String,
    },
}

#[derive(Serialize, Deserialize, Debug)]
struct KeystoreFile {
    #[serde(rename = "type")]
    keystore_type: String,
    entries: BTreeMap<String, KeystoreEntry>,
    salt: String,
    mac: String,
}

/// Where the keystore lives and which entries to use.
#[derive(Clone)]
pub struct KeystoreSource {
    pub path: PathBuf,
    pub keystore_type: String,
    pub password: String,
    pub signing_alias: String,
    pub signing_password: String,
    pub encrypting_alias: String,
}

impl fmt::Debug for KeystoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreSource")
            .field("path", &self.path)
            .field("keystore_type", &self.keystore_type)
            .field("signing_alias", &self.signing_alias)
            .field("encrypting_alias", &self.encrypting_alias)
            .finish_non_exhaustive()
    }
}

pub struct KeyMaterial {
    pub signing_key: SigningKey,
    pub certificate: VerifyingKey,
    pub encryption_key: [u8; KEY_LEN],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("certificate", &hex::encode(self.certificate.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Loads key material on first use and keeps it for the life of the process.
/// Concurrent first callers share a single load; a failed load is retried on
/// the next call.
pub struct KeyLoader {
    source: KeystoreSource,
    keys: OnceCell<Arc<KeyMaterial>>,
}

impl KeyLoader {
    pub fn new(source: KeystoreSource) -> Self {
        KeyLoader {
            source,
            keys: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.keys.initialized()
    }

    pub async fn get(&self) -> Result<Arc<KeyMaterial>, KeyError> {
        let keys = self
            .keys
            .get_or_try_init(|| async {
                tracing::debug!(path = %self.source.path.display(), "loading keystore");
                let data = tokio::fs::read(&self.source.path)
                    .await
                    .map_err(|source| {
                        counter!(KEYSTORE_LOADS, "outcome" => "error").increment(1);
                        KeyError::Io {
                            path: self.source.path.clone(),
                            source,
                        }
                    })?;
                let loaded = load_key_material(&data, &self.source).map(Arc::new);
                let outcome = if loaded.is_ok() { "ok" } else { "error" };
                counter!(KEYSTORE_LOADS, "outcome" => outcome).increment(1);
                loaded
            })
            .await?;

        Ok(keys.clone())
    }
}

fn load_key_material(data: &[u8], source: &KeystoreSource) -> Result<KeyMaterial, KeyError> {
    let file: KeystoreFile = serde_json::from_slice(data)?;

    if source.keystore_type != KEYSTORE_TYPE {
        return Err(KeyError::UnsupportedType(source.keystore_type.clone()));
    }
    if file.keystore_type != KEYSTORE_TYPE {
        return Err(KeyError::UnsupportedType(file.keystore_type));
    }

    let salt = hex::decode(&file.salt).map_err(|_| KeyError::Integrity)?;
    let keystore_keys =
        crypto::password_keys(&source.password, &salt).map_err(KeyError::KeyDerivation)?;

    let expected = hex::decode(&file.mac).map_err(|_| KeyError::Integrity)?;
    keystore_mac(&keystore_keys.mac, &file.entries)?
        .verify_slice(&expected)
        .map_err(|_| KeyError::Integrity)?;

    let signing_keys = crypto::password_keys(&source.signing_password, &salt)
        .map_err(KeyError::KeyDerivation)?;
    let (certificate, signing_key) =
        unseal_key_pair(&file.entries, &source.signing_alias, &signing_keys.seal)?;
    let encryption_key =
        unseal_secret_key(&file.entries, &source.encrypting_alias, &keystore_keys.seal)?;

    if signing_key.verifying_key() != certificate {
        return Err(KeyError::Malformed(source.signing_alias.clone()));
    }

    Ok(KeyMaterial {
        signing_key,
        certificate,
        encryption_key,
    })
}

fn keystore_mac(
    key: &[u8; KEY_LEN],
    entries: &BTreeMap<String, KeystoreEntry>,
) -> Result<HmacSha256, KeyError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| KeyError::Integrity)?;
    mac.update(&serde_json::to_vec(entries)?);
    Ok(mac)
}

fn unseal(alias: &str, sealed_b64: &str, key: &[u8; KEY_LEN]) -> Result<Vec<u8>, KeyError> {
    let sealed = STANDARD
        .decode(sealed_b64)
        .map_err(|_| KeyError::Malformed(alias.to_string()))?;
    crypto::open(key, &sealed).map_err(|source| KeyError::Unseal {
        alias: alias.to_string(),
        source,
    })
}

fn to_key_bytes(alias: &str, bytes: &[u8]) -> Result<[u8; KEY_LEN], KeyError> {
    bytes
        .try_into()
        .map_err(|_| KeyError::Malformed(alias.to_string()))
}

fn unseal_key_pair(
    entries: &BTreeMap<String, KeystoreEntry>,
    alias: &str,
    key: &[u8; KEY_LEN],
) -> Result<(VerifyingKey, SigningKey), KeyError> {
    let entry = entries
        .get(alias)
        .ok_or_else(|| KeyError::MissingEntry(alias.to_string()))?;
    let KeystoreEntry::KeyPair {
        certificate,
        sealed_key,
    } = entry
    else {
        return Err(KeyError::WrongEntryKind(alias.to_string()));
    };

    let cert_bytes = STANDARD
        .decode(certificate)
        .map_err(|_| KeyError::Malformed(alias.to_string()))?;
    let certificate = VerifyingKey::from_bytes(&to_key_bytes(alias, &cert_bytes)?)
        .map_err(|_| KeyError::Malformed(alias.to_string()))?;

    let secret = unseal(alias, sealed_key, key)?;
    let signing_key = SigningKey::from_bytes(&to_key_bytes(alias, &secret)?);

    Ok((certificate, signing_key))
}

fn unseal_secret_key(
    entries: &BTreeMap<String, KeystoreEntry>,
    alias: &str,
    key: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN], KeyError> {
    let entry = entries
        .get(alias)
        .ok_or_else(|| KeyError::MissingEntry(alias.to_string()))?;
    let KeystoreEntry::SecretKey { sealed_key } = entry else {
        return Err(KeyError::WrongEntryKind(alias.to_string()));
    };

    let secret = unseal(alias, sealed_key, key)?;
    to_key_bytes(alias, &secret)
}

/// Writes keystore files in the format [`KeyLoader`] reads.
pub struct KeystoreBuilder {
    salt: [u8; SALT_LEN],
    entries: BTreeMap<String, KeystoreEntry>,
}

impl Default for KeystoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KeystoreBuilder {
    /// Starts an empty keystore with a fresh salt.
    pub fn new() -> Self {
        KeystoreBuilder {
            salt: crypto::random_salt(),
            entries: BTreeMap::new(),
        }
    }

    fn seal(&self, alias: &str, password: &str, secret: &[u8]) -> Result<String, KeyError> {
        let keys = crypto::password_keys(password, &self.salt).map_err(KeyError::KeyDerivation)?;
        let sealed = crypto::seal(&keys.seal, secret).map_err(|source| KeyError::Unseal {
            alias: alias.to_string(),
            source,
        })?;
        Ok(STANDARD.encode(sealed))
    }

    pub fn key_pair(
        mut self,
        alias: &str,
        signing_key: &SigningKey,
        key_password: &str,
    ) -> Result<Self, KeyError> {
        let sealed_key = self.seal(alias, key_password, signing_key.as_bytes())?;
        self.entries.insert(
            alias.to_string(),
            KeystoreEntry::KeyPair {
                certificate: STANDARD.encode(signing_key.verifying_key().as_bytes()),
                sealed_key,
            },
        );
        Ok(self)
    }

    pub fn secret_key(
        mut self,
        alias: &str,
        key: &[u8; KEY_LEN],
        keystore_password: &str,
    ) -> Result<Self, KeyError> {
        let sealed_key = self.seal(alias, keystore_password, key)?;
        self.entries
            .insert(alias.to_string(), KeystoreEntry::SecretKey { sealed_key });
        Ok(self)
    }

    pub fn to_json(&self, keystore_password: &str) -> Result<Vec<u8>, KeyError> {
        let keys =
            crypto::password_keys(keystore_password, &self.salt).map_err(KeyError::KeyDerivation)?;
        let mac = keystore_mac(&keys.mac, &self.entries)?;
        let file = KeystoreFile {
            keystore_type: KEYSTORE_TYPE.to_string(),
            entries: self.entries.clone(),
            salt: hex::encode(self.salt),
            mac: hex::encode(mac.finalize().into_bytes()),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn write(&self, path: &Path, keystore_password: &str) -> Result<(), KeyError> {
        std::fs::write(path, self.to_json(keystore_password)?).map_err(KeyError::Write)
    }
}

/// Generates a fresh signing key.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::from_bytes(&crypto::random_key())
}
