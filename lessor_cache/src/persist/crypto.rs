//! Encryption of persisted records

use std::fmt;

use ring::{
    aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN},
    rand::{SecureRandom, SystemRandom},
};

use crate::error::StorageError;

const KEY_LEN: usize = 32;

/// Seals and opens persisted records
///
/// The additional data binds each record to the host's identity; a record
/// cannot be opened with different additional data.
pub trait Wrapper: Send + Sync + fmt::Debug {
    /// Encrypts `plaintext`
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Decrypts a record produced by [`Wrapper::encrypt`]
    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StorageError>;
}

/// AES-256-GCM with a random nonce prepended to each record
pub struct AeadWrapper {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl fmt::Debug for AeadWrapper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("AeadWrapper { key }")
    }
}

impl AeadWrapper {
    fn new(key: &[u8]) -> Result<Self, StorageError> {
        let key = UnboundKey::new(&aead::AES_256_GCM, key).map_err(|_| StorageError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(key),
            rng: SystemRandom::new(),
        })
    }
}

impl Wrapper for AeadWrapper {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| StorageError::Encrypt)?;

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad),
                &mut sealed,
            )
            .map_err(|_| StorageError::Encrypt)?;

        let mut record = Vec::with_capacity(NONCE_LEN + sealed.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, StorageError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(StorageError::Decrypt);
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| StorageError::Decrypt)?;

        let mut buf = sealed.to_vec();
        let len = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut buf)
            .map_err(|_| StorageError::Decrypt)?
            .len();
        buf.truncate(len);
        Ok(buf)
    }
}

/// Owns the key used to encrypt the persistent store
///
/// The key is recoverable from its retrieval token, which is written to the
/// store once when it is created and read back on later opens.
pub struct KeyManager {
    key: Vec<u8>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("KeyManager { key }")
    }
}

impl KeyManager {
    /// Generates a fresh key
    pub fn generate() -> Result<Self, StorageError> {
        Self::generate_with_rng(&SystemRandom::new())
    }

    /// Generates a fresh key using the provided source of randomness
    pub fn generate_with_rng(rng: &dyn SecureRandom) -> Result<Self, StorageError> {
        let mut key = vec![0; KEY_LEN];
        rng.fill(&mut key).map_err(|_| StorageError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Recovers a key from its retrieval token
    pub fn from_retrieval_token(token: &[u8]) -> Result<Self, StorageError> {
        if token.len() != KEY_LEN {
            return Err(StorageError::InvalidKey);
        }

        Ok(Self { key: token.to_vec() })
    }

    /// The retrieval token for this key
    pub fn retrieval_token(&self) -> &[u8] {
        &self.key
    }

    /// A wrapper encrypting with this key
    pub fn wrapper(&self) -> Result<AeadWrapper, StorageError> {
        AeadWrapper::new(&self.key)
    }
}
