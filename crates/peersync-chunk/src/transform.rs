//! Ordered transform chain applied to multichunks, database files and manifests.
//!
//! Each transform wraps the output of the previous one in a frame that starts
//! with a one-byte tag, so a reader can tell when the persisted chain and the
//! configured chain disagree:
//!
//! ```text
//! compress: [b'C'][algorithm code][compressed bytes]
//! encrypt:  [b'E'][cipher code][salt 32B][nonce 12B][ciphertext + tag]
//! ```

use crate::compression::{compress, decompress, CompressionAlgorithm};
use crate::encryption::{
    decrypt, encrypt, EncryptedPayload, EncryptionAlgorithm, EncryptionKey, Nonce, NONCE_LEN,
    SALT_LEN,
};
use crate::error::ChunkError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

const COMPRESS_TAG: u8 = b'C';
const ENCRYPT_TAG: u8 = b'E';

/// One step of the transform chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    /// Compress the stream
    Compress(CompressionAlgorithm),
    /// Encrypt the stream with an AEAD cipher
    Encrypt(EncryptionAlgorithm),
}

impl Transform {
    fn tag(&self) -> u8 {
        match self {
            Transform::Compress(_) => COMPRESS_TAG,
            Transform::Encrypt(_) => ENCRYPT_TAG,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Transform::Compress(_) => "compress",
            Transform::Encrypt(_) => "encrypt",
        }
    }
}

/// Forward/reverse application of an ordered list of transforms
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    steps: Vec<Transform>,
    key: Option<EncryptionKey>,
}

impl TransformChain {
    /// Build a chain. Rejects repeated transform kinds and encryption without a key.
    pub fn new(steps: Vec<Transform>, key: Option<EncryptionKey>) -> Result<Self, ChunkError> {
        validate_chain(&steps, key.is_some())?;
        Ok(Self { steps, key })
    }

    /// A chain that passes data through untouched
    pub fn plain() -> Self {
        Self::default()
    }

    /// Configured steps, in write order
    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    /// Apply every step first-to-last
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, ChunkError> {
        let mut current = data.to_vec();
        for step in &self.steps {
            current = self.apply(step, &current)?;
        }
        debug!(input = data.len(), output = current.len(), steps = self.steps.len(), "encoded");
        Ok(current)
    }

    /// Reverse every step last-to-first
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>, ChunkError> {
        let mut current = data.to_vec();
        for step in self.steps.iter().rev() {
            current = self.reverse(step, &current)?;
        }
        Ok(current)
    }

    fn apply(&self, step: &Transform, data: &[u8]) -> Result<Vec<u8>, ChunkError> {
        match step {
            Transform::Compress(algo) => {
                let body = compress(data, *algo)?;
                let mut out = Vec::with_capacity(body.len() + 2);
                out.push(COMPRESS_TAG);
                out.push(algo.code());
                out.extend_from_slice(&body);
                Ok(out)
            }
            Transform::Encrypt(algo) => {
                let key = self.key.as_ref().ok_or(ChunkError::MissingKey)?;
                let payload = encrypt(data, key, *algo)?;
                let mut out =
                    Vec::with_capacity(2 + SALT_LEN + NONCE_LEN + payload.ciphertext.len());
                out.push(ENCRYPT_TAG);
                out.push(algo.code());
                out.extend_from_slice(&payload.salt);
                out.extend_from_slice(&payload.nonce.0);
                out.extend_from_slice(&payload.ciphertext);
                Ok(out)
            }
        }
    }

    fn reverse(&self, step: &Transform, frame: &[u8]) -> Result<Vec<u8>, ChunkError> {
        if frame.len() < 2 {
            return Err(ChunkError::format(format!(
                "{} frame too short ({} bytes)",
                step.kind(),
                frame.len()
            )));
        }
        if frame[0] != step.tag() {
            return Err(ChunkError::format(format!(
                "expected {} frame, found tag 0x{:02x}",
                step.kind(),
                frame[0]
            )));
        }
        match step {
            Transform::Compress(_) => {
                let algo = CompressionAlgorithm::from_code(frame[1])?;
                decompress(&frame[2..], algo)
            }
            Transform::Encrypt(_) => {
                let key = self.key.as_ref().ok_or(ChunkError::MissingKey)?;
                let algo = EncryptionAlgorithm::from_code(frame[1])?;
                let body = &frame[2..];
                if body.len() < SALT_LEN + NONCE_LEN {
                    return Err(ChunkError::format("encrypt frame missing salt or nonce"));
                }
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&body[..SALT_LEN]);
                let mut nonce = [0u8; NONCE_LEN];
                nonce.copy_from_slice(&body[SALT_LEN..SALT_LEN + NONCE_LEN]);
                let payload = EncryptedPayload {
                    ciphertext: body[SALT_LEN + NONCE_LEN..].to_vec(),
                    salt,
                    nonce: Nonce(nonce),
                    algo,
                };
                decrypt(&payload, key)
            }
        }
    }
}

/// Check that a chain is usable: no transform kind twice, and a key when encrypting
pub fn validate_chain(steps: &[Transform], has_key: bool) -> Result<(), ChunkError> {
    let compress = steps
        .iter()
        .filter(|s| matches!(s, Transform::Compress(_)))
        .count();
    let encrypt = steps
        .iter()
        .filter(|s| matches!(s, Transform::Encrypt(_)))
        .count();
    if compress > 1 || encrypt > 1 {
        return Err(ChunkError::InvalidConfig(
            "transform chain repeats a transform kind".into(),
        ));
    }
    if encrypt == 1 && !has_key {
        return Err(ChunkError::MissingKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;
    use crate::fingerprint::MultiChunkId;
    use crate::multichunk::{MultiChunkReader, MultiChunkWriter, DEFAULT_MULTICHUNK_CAPACITY};
    use proptest::prelude::*;

    fn key() -> Option<EncryptionKey> {
        Some(EncryptionKey([7u8; 32]))
    }

    fn full_chain() -> TransformChain {
        TransformChain::new(
            vec![
                Transform::Compress(CompressionAlgorithm::Zstd { level: 3 }),
                Transform::Encrypt(EncryptionAlgorithm::AesGcm256),
            ],
            key(),
        )
        .unwrap()
    }

    #[test]
    fn plain_chain_is_identity() {
        let chain = TransformChain::plain();
        assert_eq!(chain.encode(b"abc").unwrap(), b"abc");
        assert_eq!(chain.decode(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn outermost_frame_is_last_step() {
        let encoded = full_chain().encode(b"hello hello hello").unwrap();
        assert_eq!(encoded[0], ENCRYPT_TAG);
        let compress_only =
            TransformChain::new(vec![Transform::Compress(CompressionAlgorithm::Lz4)], None).unwrap();
        assert_eq!(compress_only.encode(b"x").unwrap()[0], COMPRESS_TAG);
    }

    #[test]
    fn flipped_ciphertext_byte_is_integrity_error() {
        let chain = full_chain();
        let mut encoded = chain.encode(&vec![5u8; 10_000]).unwrap();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0x40;
        let err = chain.decode(&encoded).unwrap_err();
        assert!(err.is_integrity(), "{:?}", err);
    }

    #[test]
    fn mismatched_chain_is_format_error() {
        let encoded = full_chain().encode(b"data").unwrap();
        let other =
            TransformChain::new(vec![Transform::Compress(CompressionAlgorithm::Lz4)], None).unwrap();
        assert!(matches!(other.decode(&encoded), Err(ChunkError::Format { .. })));
    }

    #[test]
    fn wrong_key_is_integrity_error() {
        let encoded = full_chain().encode(b"data").unwrap();
        let wrong = TransformChain::new(
            vec![
                Transform::Compress(CompressionAlgorithm::Zstd { level: 3 }),
                Transform::Encrypt(EncryptionAlgorithm::AesGcm256),
            ],
            Some(EncryptionKey([8u8; 32])),
        )
        .unwrap();
        assert!(matches!(wrong.decode(&encoded), Err(ChunkError::DecryptionAuthFailed)));
    }

    #[test]
    fn invalid_chains_rejected() {
        assert!(matches!(
            TransformChain::new(vec![Transform::Encrypt(EncryptionAlgorithm::AesGcm256)], None),
            Err(ChunkError::MissingKey)
        ));
        assert!(TransformChain::new(
            vec![
                Transform::Compress(CompressionAlgorithm::Lz4),
                Transform::Compress(CompressionAlgorithm::None),
            ],
            None,
        )
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_chunk_pack_transform_roundtrip(
            data in prop::collection::vec(0u8..=255, 0..40_000),
            encrypt_first in any::<bool>(),
        ) {
            let steps = if encrypt_first {
                vec![
                    Transform::Encrypt(EncryptionAlgorithm::ChaCha20Poly1305),
                    Transform::Compress(CompressionAlgorithm::Lz4),
                ]
            } else {
                vec![
                    Transform::Compress(CompressionAlgorithm::Lz4),
                    Transform::Encrypt(EncryptionAlgorithm::ChaCha20Poly1305),
                ]
            };
            let chain = TransformChain::new(steps, key()).unwrap();

            let mut writer = MultiChunkWriter::new(MultiChunkId::random(), Vec::new(), DEFAULT_MULTICHUNK_CAPACITY).unwrap();
            for chunk in Chunker::new().chunk_stream(&data[..]) {
                writer.write(&chunk.unwrap()).unwrap();
            }
            let stored = chain.encode(&writer.close().unwrap()).unwrap();

            let plain = chain.decode(&stored).unwrap();
            let chunks = MultiChunkReader::open(&plain[..]).unwrap().read_all().unwrap();
            let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(reassembled, data);
        }
    }
}
