// AES-256-GCM sealing shared by the keystore, the assertion builder and the
// foundational API token generator. Sealed output is `nonce || ciphertext`.
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("sealed data is too short")]
    Truncated,
    #[error("key derivation failed")]
    KeyDerivation,
}

pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::Encrypt)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, SealError> {
    if sealed.len() < NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SealError::Decrypt)
}

/// Independent sealing and MAC keys stretched from one password.
pub struct PasswordKeys {
    pub seal: [u8; KEY_LEN],
    pub mac: [u8; KEY_LEN],
}

/// Derives [`PasswordKeys`] with Argon2id.
pub fn password_keys(password: &str, salt: &[u8]) -> Result<PasswordKeys, SealError> {
    let mut output = [0u8; 2 * KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut output)
        .map_err(|_| SealError::KeyDerivation)?;

    let mut keys = PasswordKeys {
        seal: [0u8; KEY_LEN],
        mac: [0u8; KEY_LEN],
    };
    keys.seal.copy_from_slice(&output[..KEY_LEN]);
    keys.mac.copy_from_slice(&output[KEY_LEN..]);
    Ok(keys)
}

pub fn random_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_key_fails() {
        let salt = random_salt();
        let right = password_keys("right", &salt).unwrap();
        let wrong = password_keys("wrong", &salt).unwrap();

        let sealed = seal(&right.seal, b"secret").unwrap();
        assert_eq!(open(&wrong.seal, &sealed), Err(SealError::Decrypt));
        assert_eq!(open(&right.seal, &sealed).unwrap(), b"secret");
    }

    #[test]
    fn test_password_keys_depend_on_salt() {
        let first = password_keys("same", &[1u8; SALT_LEN]).unwrap();
        let again = password_keys("same", &[1u8; SALT_LEN]).unwrap();
        let other = password_keys("same", &[2u8; SALT_LEN]).unwrap();

        assert_eq!(first.seal, again.seal);
        assert_ne!(first.seal, other.seal);
        assert_ne!(first.seal, first.mac);
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(matches!(
            password_keys("password", b"salt"),
            Err(SealError::KeyDerivation)
        ));
    }

    #[test]
    fn test_nonce_differs_per_seal() {
        let key = random_key();
        assert_ne!(seal(&key, b"same").unwrap(), seal(&key, b"same").unwrap());
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(open(&random_key(), b"short"), Err(SealError::Truncated));
    }
}
