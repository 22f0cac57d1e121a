use crate::crypto::{self, KEY_LEN};
use crate::keys::{KEYSTORE_TYPE, KeyLoader, KeystoreBuilder, KeystoreSource, generate_signing_key};
use crate::session::{RequestContext, Session};
use ed25519_dalek::SigningKey;
use http::Method;
use std::path::PathBuf;
use tempfile::TempDir;

pub const TEST_KEYSTORE_PASSWORD: &str = "keystore-secret";
pub const TEST_SIGNING_PASSWORD: &str = "signing-secret";

pub struct TestKeystore {
    pub path: PathBuf,
    pub signing_key: SigningKey,
    pub encryption_key: [u8; KEY_LEN],
}

impl TestKeystore {
    pub fn source(&self) -> KeystoreSource {
        KeystoreSource {
            path: self.path.clone(),
            keystore_type: KEYSTORE_TYPE.into(),
            password: TEST_KEYSTORE_PASSWORD.into(),
            signing_alias: "signing".into(),
            signing_password: TEST_SIGNING_PASSWORD.into(),
            encrypting_alias: "encrypting".into(),
        }
    }

    pub fn loader(&self) -> KeyLoader {
        KeyLoader::new(self.source())
    }
}

/// Writes a keystore with a "signing" key pair and an "encrypting" secret key.
/// The keystore is removed when the returned directory is dropped.
pub fn write_test_keystore() -> (TempDir, TestKeystore) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keystore.json");
    let signing_key = generate_signing_key();
    let encryption_key = crypto::random_key();

    KeystoreBuilder::new()
        .key_pair("signing", &signing_key, TEST_SIGNING_PASSWORD)
        .unwrap()
        .secret_key("encrypting", &encryption_key, TEST_KEYSTORE_PASSWORD)
        .unwrap()
        .write(&path, TEST_KEYSTORE_PASSWORD)
        .unwrap();

    (
        dir,
        TestKeystore {
            path,
            signing_key,
            encryption_key,
        },
    )
}

pub fn alice() -> Session {
    Session {
        principal: Some("alice@example.org".into()),
        username: Some("alice".into()),
        email: Some("alice@example.org".into()),
        assertion_urls: vec![],
        proxy_granting_ticket: None,
    }
}

/// A context for an authenticated request from 10.0.0.7.
pub fn alice_context(method: Method, content_type: Option<&str>) -> RequestContext {
    RequestContext {
        session_id: Some("alice-session".into()),
        method,
        content_type: content_type.map(str::to_string),
        remote_addr: Some("10.0.0.7".parse().unwrap()),
        ..Default::default()
    }
    .with_session(alice())
}
