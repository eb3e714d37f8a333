//! Encryption of session private keys under master-credential-derived keys.
//!
//! Session scalars are never persisted in the clear. The vault encrypts them
//! with AES-256-GCM under a 32-byte key derived from the master credential
//! id. Derivation itself is a collaborator capability
//! ([`MasterKeyDerivation`]); the built-in implementation uses HKDF-SHA256
//! over an operator-held root secret. Derived keys are cached per credential
//! id, never persisted, and zeroized when the cache is cleared or dropped.
//!
//! Stored ciphertext layout: 12-byte IV ‖ ciphertext ‖ 16-byte GCM tag,
//! hex-encoded with a `0x` prefix. Two legacy encodings are still accepted on
//! read: a 66-character `0x` hex string is an *unencrypted* 32-byte scalar
//! (logged as a warning, callers must plan migration), and bare base64 is
//! decoded as raw ciphertext bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use alloy::hex;
use alloy::primitives::B256;
use async_trait::async_trait;
use dashmap::DashMap;
use hkdf::Hkdf;
use rand::Rng;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::session::KeyHash;
use crate::util::b64;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Length of a legacy hex-encoded unencrypted scalar: `0x` + 64 hex chars.
const LEGACY_SCALAR_HEX_LEN: usize = 66;

/// The long-lived identity on whose behalf sessions are created.
///
/// Only the credential id (which keys the encryption) and the public half are
/// ever seen by the core.
#[derive(Debug, Clone)]
pub struct MasterCredential {
    pub credential_id: String,
    pub key_hash: KeyHash,
    pub public_key: MasterPublicKey,
}

/// Uncompressed public key coordinates of a master credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterPublicKey {
    pub x: B256,
    pub y: B256,
}

/// A 32-byte AES-256-GCM key, zeroized on drop.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; 32]>);

impl SymmetricKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never reach logs.
        write!(f, "SymmetricKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// GCM tag mismatch: the ciphertext was modified or the key is wrong.
    #[error("ciphertext failed authentication")]
    Tampered,
    /// Input shorter than IV plus tag cannot be a valid ciphertext.
    #[error("ciphertext too short")]
    Truncated,
    /// The stored value is neither hex nor base64.
    #[error("unrecognized ciphertext encoding")]
    Malformed,
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Capability that turns a credential id into a 32-byte encryption key.
///
/// Treated as deterministic and collision-free; the derivation mechanism is
/// owned by the master-credential holder.
#[async_trait]
pub trait MasterKeyDerivation: Send + Sync {
    async fn derive(&self, credential_id: &str) -> Result<[u8; 32], CredentialError>;
}

/// HKDF-SHA256 derivation over an operator-held root secret, with the
/// credential id as the info string.
pub struct HkdfKeyDerivation {
    root_secret: Zeroizing<[u8; 32]>,
}

impl HkdfKeyDerivation {
    pub fn new(root_secret: [u8; 32]) -> Self {
        Self {
            root_secret: Zeroizing::new(root_secret),
        }
    }
}

#[async_trait]
impl MasterKeyDerivation for HkdfKeyDerivation {
    async fn derive(&self, credential_id: &str) -> Result<[u8; 32], CredentialError> {
        let hk = Hkdf::<Sha256>::new(None, self.root_secret.as_ref());
        let mut okm = [0u8; 32];
        hk.expand(credential_id.as_bytes(), &mut okm)
            .map_err(|e| CredentialError::Derivation(e.to_string()))?;
        Ok(okm)
    }
}

/// AES-256-GCM vault for session private keys.
pub struct CredentialVault {
    derivation: Arc<dyn MasterKeyDerivation>,
    cache: DashMap<String, SymmetricKey>,
}

impl CredentialVault {
    pub fn new(derivation: Arc<dyn MasterKeyDerivation>) -> Self {
        Self {
            derivation,
            cache: DashMap::new(),
        }
    }

    /// Derive (or fetch from cache) the encryption key for a credential id.
    #[tracing::instrument(skip(self))]
    pub async fn derive_key(&self, credential_id: &str) -> Result<SymmetricKey, CredentialError> {
        if let Some(key) = self.cache.get(credential_id) {
            return Ok(key.clone());
        }
        let bytes = self.derivation.derive(credential_id).await?;
        let key = SymmetricKey::new(bytes);
        self.cache
            .insert(credential_id.to_string(), key.clone());
        Ok(key)
    }

    /// Drop all cached keys. Each entry zeroizes on drop.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Encrypt a plaintext under the given key. Output carries a fresh
    /// 12-byte IV followed by the ciphertext and 16-byte tag.
    pub fn encrypt(&self, plaintext: &[u8], key: &SymmetricKey) -> Vec<u8> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let iv: [u8; IV_LEN] = rand::rng().random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Encrypt and encode for the persisted session layout (`0x` hex).
    pub fn encrypt_to_string(&self, plaintext: &[u8], key: &SymmetricKey) -> String {
        format!("0x{}", hex::encode(self.encrypt(plaintext, key)))
    }

    /// Decrypt raw IV-prefixed ciphertext bytes.
    pub fn decrypt(
        &self,
        data: &[u8],
        key: &SymmetricKey,
    ) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(CredentialError::Truncated);
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CredentialError::Tampered)
    }

    /// Decode a persisted ciphertext string and decrypt it.
    ///
    /// Accepts the current `0x`-hex layout, the legacy 66-character hex form
    /// (an unencrypted scalar, returned as-is with a warning), and bare
    /// base64.
    pub fn decrypt_stored(
        &self,
        stored: &str,
        key: &SymmetricKey,
    ) -> Result<Zeroizing<Vec<u8>>, CredentialError> {
        if let Some(hex_body) = stored.strip_prefix("0x") {
            if stored.len() == LEGACY_SCALAR_HEX_LEN {
                tracing::warn!(
                    "session key stored as legacy unencrypted scalar; migrate to encrypted storage"
                );
                let scalar = hex::decode(hex_body).map_err(|_| CredentialError::Malformed)?;
                return Ok(Zeroizing::new(scalar));
            }
            let data = hex::decode(hex_body).map_err(|_| CredentialError::Malformed)?;
            return self.decrypt(&data, key);
        }
        let data = b64::decode(stored).map_err(|_| CredentialError::Malformed)?;
        self.decrypt(&data, key)
    }
}
