//! AES-256-GCM and ChaCha20-Poly1305 AEAD encryption with HKDF key derivation

use crate::error::ChunkError;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the per-artifact HKDF salt
pub const SALT_LEN: usize = 32;
/// Length of the AEAD nonce
pub const NONCE_LEN: usize = 12;

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl EncryptionKey {
    /// Parse a 64-character hex string into a key
    pub fn from_hex(s: &str) -> Result<Self, ChunkError> {
        let mut bytes = crate::fingerprint::ChunkChecksum::from_hex(s.trim())
            .map_err(|_| ChunkError::InvalidConfig("encryption key must be 64 hex characters".into()))?
            .0;
        let key = EncryptionKey(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; NONCE_LEN]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    #[serde(rename = "aes-256-gcm")]
    AesGcm256,
    /// ChaCha20-Poly1305, constant-time, fast on non-AES hardware
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    pub(crate) fn code(&self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm256 => 1,
            EncryptionAlgorithm::ChaCha20Poly1305 => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self, ChunkError> {
        match code {
            1 => Ok(EncryptionAlgorithm::AesGcm256),
            2 => Ok(EncryptionAlgorithm::ChaCha20Poly1305),
            other => Err(ChunkError::format(format!(
                "unknown cipher code {}",
                other
            ))),
        }
    }
}

/// Encrypted payload: ciphertext (with 16-byte auth tag), salt, nonce, algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Ciphertext with 16-byte AEAD authentication tag appended
    pub ciphertext: Vec<u8>,
    /// Salt the artifact key was derived with
    pub salt: [u8; SALT_LEN],
    /// Nonce used for this encryption operation
    pub nonce: Nonce,
    /// Algorithm (needed for decryption)
    pub algo: EncryptionAlgorithm,
}

/// Derive a per-artifact key from master key + salt using HKDF-SHA256
pub fn derive_artifact_key(
    master_key: &EncryptionKey,
    salt: &[u8; SALT_LEN],
) -> Result<EncryptionKey, ChunkError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), &master_key.0);
    let mut okm = [0u8; 32];
    hk.expand(b"peersync-artifact-key", &mut okm)
        .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?;
    Ok(EncryptionKey(okm))
}

fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a cryptographically random 12-byte nonce
pub fn random_nonce() -> Nonce {
    Nonce(random_bytes())
}

/// Encrypt plaintext under a fresh salt-derived key. Salt and nonce are stored in the result.
pub fn encrypt(
    plaintext: &[u8],
    master_key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<EncryptedPayload, ChunkError> {
    let salt: [u8; SALT_LEN] = random_bytes();
    let key = derive_artifact_key(master_key, &salt)?;
    let nonce = random_nonce();
    let ciphertext = match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&nonce.0);
            cipher
                .encrypt(n, plaintext)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?
        }
    };
    Ok(EncryptedPayload {
        ciphertext,
        salt,
        nonce,
        algo,
    })
}

/// Decrypt an EncryptedPayload. Returns DecryptionAuthFailed if tampered/corrupted.
pub fn decrypt(payload: &EncryptedPayload, master_key: &EncryptionKey) -> Result<Vec<u8>, ChunkError> {
    let key = derive_artifact_key(master_key, &payload.salt)?;
    match payload.algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?;
            let n = aes_gcm::Nonce::from_slice(&payload.nonce.0);
            cipher
                .decrypt(n, payload.ciphertext.as_ref())
                .map_err(|_| ChunkError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ChunkError::EncryptionFailed(e.to_string()))?;
            let n = chacha20poly1305::Nonce::from_slice(&payload.nonce.0);
            cipher
                .decrypt(n, payload.ciphertext.as_ref())
                .map_err(|_| ChunkError::DecryptionAuthFailed)
        }
    }
}
