//! Signed and encrypted identity assertions for the secured dispatcher.
//!
//! An assertion binds the user's identity to the login assertions the
//! identity provider issued for the session. Before building one, every
//! assertion URL in the session is fetched and its SHA-256 digest is embedded
//! in the claims, so a backend can tell which upstream login the call derives
//! from. The claims are signed with the workbench signing key, then sealed
//! with the shared encryption key and base64 encoded for use as a header value.

use crate::crypto::{self, SealError};
use crate::keys::{KeyError, KeyLoader};
use crate::session::RequestContext;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

const LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(thiserror::Error, Debug)]
pub enum AssertionError {
    #[error("user is not authenticated")]
    NotAuthenticated,
    #[error("session has no identity provider assertions")]
    NoSourceAssertions,
    #[error("unable to retrieve assertion from {url}: {reason}")]
    Probe { url: String, reason: String },
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error("unable to seal the assertion: {0}")]
    Seal(#[from] SealError),
    #[error("unable to encode the assertion: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("malformed assertion")]
    Malformed,
    #[error("assertion signature is invalid")]
    BadSignature,
}

impl AssertionError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            AssertionError::NotAuthenticated
                | AssertionError::NoSourceAssertions
                | AssertionError::Probe { .. }
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AssertionClaims {
    pub subject: String,
    pub principal: String,
    pub email: Option<String>,
    pub issued_at_ms: u64,
    /// `subject|issued_at_ms`, the token backends check the subject against
    pub binding: String,
    pub assertion_id: String,
    /// Hex SHA-256 digests of the identity provider assertions
    pub source_assertions: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct SignedAssertion {
    claims: String,
    signature: String,
    certificate: String,
}

/// Produces the value of the assertion header for a request.
#[async_trait]
pub trait AssertionBuilder: Send + Sync {
    async fn build(&self, ctx: &RequestContext) -> Result<String, AssertionError>;
}

/// Fetches identity provider assertions. The identity provider usually runs
/// next to the workbench with a locally issued certificate, so this client
/// does not verify certificates. The relaxed policy only applies to this
/// client.
pub struct AssertionUrlProbe {
    client: reqwest::Client,
    use_loopback_interface: bool,
}

impl AssertionUrlProbe {
    pub fn new(use_loopback_interface: bool, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;

        Ok(AssertionUrlProbe {
            client,
            use_loopback_interface,
        })
    }

    fn retrieval_url(&self, original: &str) -> Result<Url, AssertionError> {
        let probe_error = |reason: String| AssertionError::Probe {
            url: original.to_string(),
            reason,
        };

        let mut url = Url::parse(original).map_err(|e| probe_error(e.to_string()))?;
        if self.use_loopback_interface {
            url.set_host(Some(LOOPBACK_HOST))
                .map_err(|e| probe_error(e.to_string()))?;
        }
        Ok(url)
    }

    /// Returns the hex SHA-256 digest of the assertion served at `url`.
    pub async fn fetch_digest(&self, url: &str) -> Result<String, AssertionError> {
        let retrieval_url = self.retrieval_url(url)?;
        let probe_error = |reason: String| AssertionError::Probe {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(retrieval_url)
            .send()
            .await
            .map_err(|e| probe_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(probe_error(format!("status {}", response.status())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| probe_error(e.to_string()))?;

        Ok(hex::encode(Sha256::digest(&body)))
    }
}

pub struct SignedAssertionBuilder {
    keys: Arc<KeyLoader>,
    probe: AssertionUrlProbe,
}

impl SignedAssertionBuilder {
    pub fn new(keys: Arc<KeyLoader>, probe: AssertionUrlProbe) -> Self {
        SignedAssertionBuilder { keys, probe }
    }
}

#[async_trait]
impl AssertionBuilder for SignedAssertionBuilder {
    async fn build(&self, ctx: &RequestContext) -> Result<String, AssertionError> {
        let (Some(principal), Some(subject)) = (ctx.principal(), ctx.username()) else {
            return Err(AssertionError::NotAuthenticated);
        };

        let urls = ctx.assertion_urls();
        if urls.is_empty() {
            return Err(AssertionError::NoSourceAssertions);
        }

        let mut source_assertions = Vec::with_capacity(urls.len());
        for url in urls {
            source_assertions.push(self.probe.fetch_digest(url).await?);
        }

        let keys = self.keys.get().await?;

        let mut assertion_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut assertion_id);

        let issued_at_ms = now_ms();
        let claims = AssertionClaims {
            subject: subject.to_string(),
            principal: principal.to_string(),
            email: ctx.email().map(str::to_string),
            issued_at_ms,
            binding: format!("{subject}|{issued_at_ms}"),
            assertion_id: hex::encode(assertion_id),
            source_assertions,
        };

        let claims_json = serde_json::to_string(&claims)?;
        let signature = keys.signing_key.sign(claims_json.as_bytes());
        let signed = SignedAssertion {
            claims: claims_json,
            signature: STANDARD.encode(signature.to_bytes()),
            certificate: STANDARD.encode(keys.certificate.as_bytes()),
        };

        let sealed = crypto::seal(&keys.encryption_key, &serde_json::to_vec(&signed)?)?;
        Ok(STANDARD.encode(sealed))
    }
}

/// Decrypts an encoded assertion and checks its signature against `certificate`.
pub fn open_assertion(
    encoded: &str,
    encryption_key: &[u8; crypto::KEY_LEN],
    certificate: &VerifyingKey,
) -> Result<AssertionClaims, AssertionError> {
    let sealed = STANDARD
        .decode(encoded)
        .map_err(|_| AssertionError::Malformed)?;
    let plaintext = crypto::open(encryption_key, &sealed)?;
    let signed: SignedAssertion = serde_json::from_slice(&plaintext)?;

    let embedded = STANDARD
        .decode(&signed.certificate)
        .map_err(|_| AssertionError::Malformed)?;
    if embedded.as_slice() != certificate.as_bytes() {
        return Err(AssertionError::BadSignature);
    }

    let signature_bytes = STANDARD
        .decode(&signed.signature)
        .map_err(|_| AssertionError::Malformed)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| AssertionError::Malformed)?;
    certificate
        .verify(signed.claims.as_bytes(), &signature)
        .map_err(|_| AssertionError::BadSignature)?;

    let claims: AssertionClaims = serde_json::from_str(&signed.claims)?;
    if claims.binding != format!("{}|{}", claims.subject, claims.issued_at_ms) {
        return Err(AssertionError::Malformed);
    }
    Ok(claims)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
