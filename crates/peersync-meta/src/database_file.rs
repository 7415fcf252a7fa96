//! Codec for remote database files: one database version per file.

use peersync_chunk::TransformChain;

use crate::error::MetaError;
use crate::types::DatabaseVersion;

const MAGIC: &[u8; 4] = b"PSDB";
const FORMAT_VERSION: u8 = 1;

/// Serialize a database version and run it through the transform chain.
pub fn encode_database_version(
    version: &DatabaseVersion,
    chain: &TransformChain,
) -> Result<Vec<u8>, MetaError> {
    let body = bincode::serialize(version).map_err(|e| MetaError::format("database file", e))?;
    let mut plain = Vec::with_capacity(MAGIC.len() + 1 + body.len());
    plain.extend_from_slice(MAGIC);
    plain.push(FORMAT_VERSION);
    plain.extend_from_slice(&body);
    Ok(chain.encode(&plain)?)
}

/// Reverse the transform chain and deserialize one database version.
pub fn decode_database_version(
    bytes: &[u8],
    chain: &TransformChain,
) -> Result<DatabaseVersion, MetaError> {
    let plain = chain.decode(bytes)?;
    if plain.len() < MAGIC.len() + 1 || &plain[..MAGIC.len()] != MAGIC {
        return Err(MetaError::format("database file", "bad magic"));
    }
    if plain[MAGIC.len()] != FORMAT_VERSION {
        return Err(MetaError::format(
            "database file",
            format!("unsupported format version {}", plain[MAGIC.len()]),
        ));
    }
    bincode::deserialize(&plain[MAGIC.len() + 1..]).map_err(|e| MetaError::format("database file", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DatabaseVersionHeader, Timestamp};
    use crate::vector_clock::VectorClock;
    use peersync_chunk::{CompressionAlgorithm, EncryptionAlgorithm, EncryptionKey, Transform};

    fn version() -> DatabaseVersion {
        let mut clock = VectorClock::new();
        clock.increment("A");
        DatabaseVersion::new(DatabaseVersionHeader {
            client: "A".into(),
            timestamp: Timestamp::from_millis(42),
            vector_clock: clock,
        })
    }

    fn chain() -> TransformChain {
        TransformChain::new(
            vec![
                Transform::Compress(CompressionAlgorithm::Lz4),
                Transform::Encrypt(EncryptionAlgorithm::AesGcm256),
            ],
            Some(EncryptionKey([3; 32])),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_through_chain() {
        let bytes = encode_database_version(&version(), &chain()).unwrap();
        assert_eq!(decode_database_version(&bytes, &chain()).unwrap(), version());
    }

    #[test]
    fn plain_file_starts_with_magic() {
        let bytes = encode_database_version(&version(), &TransformChain::plain()).unwrap();
        assert_eq!(&bytes[..4], b"PSDB");
    }

    #[test]
    fn tampered_file_is_integrity_error() {
        let mut bytes = encode_database_version(&version(), &chain()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let err = decode_database_version(&bytes, &chain()).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn wrong_magic_is_format_error() {
        let err = decode_database_version(b"XXXX\x01", &TransformChain::plain()).unwrap_err();
        assert!(matches!(err, MetaError::Format { .. }));
    }
}
