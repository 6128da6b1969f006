use crate::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

// Argon2id cost: 32 MiB of memory, three passes, four lanes.
const KDF_MEMORY_KIB: u32 = 32 * 1024;
const KDF_TIME: u32 = 3;
const KDF_LANES: u32 = 4;

/// Encrypts limit cells with a key bound to the license holder, so cells
/// can't be forged by writing to the store directly.
#[derive(Clone)]
pub struct LimitCrypto {
    cipher: Aes256Gcm,
}

// === impl LimitCrypto ===

impl LimitCrypto {
    /// Derives the cell key from the license's customer id and email.
    pub fn derive(customer_id: &str, customer_email: &str) -> Result<Self> {
        let params = Params::new(KDF_MEMORY_KIB, KDF_TIME, KDF_LANES, Some(KEY_SIZE))
            .map_err(Error::crypto)?;
        let kdf = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = Sha256::digest(customer_email.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        kdf.hash_password_into(customer_id.as_bytes(), &salt, &mut key)
            .map_err(Error::crypto)?;
        Ok(Self::from_key(key))
    }

    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypts `plaintext` under a fresh nonce, returning base64 of the
    /// nonce followed by the ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(Error::crypto)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<String> {
        let sealed = STANDARD.decode(sealed.trim()).map_err(Error::crypto)?;
        if sealed.len() < NONCE_SIZE {
            return Err(Error::Crypto("sealed value is too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(Error::crypto)?;
        String::from_utf8(plaintext).map_err(Error::crypto)
    }
}

impl std::fmt::Debug for LimitCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitCrypto").finish_non_exhaustive()
    }
}
