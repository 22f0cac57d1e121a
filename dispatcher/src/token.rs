use crate::crypto::{self, KEY_LEN, SealError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const KEY_HEADER: &str = "-----BEGIN FOUNDATIONAL API KEY-----";
const KEY_FOOTER: &str = "-----END FOUNDATIONAL API KEY-----";

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("no foundational API key file configured")]
    MissingKeyFile,
    #[error("unable to read key file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} does not contain a valid key")]
    InvalidKey(PathBuf),
    #[error("unable to seal token: {0}")]
    Seal(#[from] SealError),
    #[error("token is not valid base64")]
    Decode,
    #[error("token is malformed")]
    Malformed,
}

/// Encrypted `username|timestamp` tokens for the foundational API.
pub struct FoundationalApiTokenGenerator {
    key: [u8; KEY_LEN],
}

impl fmt::Debug for FoundationalApiTokenGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoundationalApiTokenGenerator")
            .finish_non_exhaustive()
    }
}

impl FoundationalApiTokenGenerator {
    /// Reads the armored key file. The key must be present at startup.
    pub fn from_key_file(path: Option<&Path>) -> Result<Self, TokenError> {
        let path = path.ok_or(TokenError::MissingKeyFile)?;
        let contents = std::fs::read_to_string(path).map_err(|source| TokenError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let encoded: String = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != KEY_HEADER && *line != KEY_FOOTER)
            .collect();
        let key = STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| <[u8; KEY_LEN]>::try_from(bytes).ok())
            .ok_or_else(|| TokenError::InvalidKey(path.to_path_buf()))?;

        Ok(FoundationalApiTokenGenerator { key })
    }

    pub fn generate_token(&self, username: &str) -> Result<String, TokenError> {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let plaintext = format!("{username}|{timestamp_ms}");
        Ok(STANDARD.encode(crypto::seal(&self.key, plaintext.as_bytes())?))
    }

    /// Returns the plaintext `username|timestamp` of a token.
    pub fn decrypt_token(&self, token: &str) -> Result<String, TokenError> {
        let sealed = STANDARD.decode(token).map_err(|_| TokenError::Decode)?;
        let plaintext = crypto::open(&self.key, &sealed)?;
        String::from_utf8(plaintext).map_err(|_| TokenError::Malformed)
    }
}

/// Writes a new random key in the armored format `from_key_file` reads.
pub fn write_key_file(path: &Path) -> std::io::Result<()> {
    let encoded = STANDARD.encode(crypto::random_key());
    std::fs::write(path, format!("{KEY_HEADER}\n{encoded}\n{KEY_FOOTER}\n"))
}
