//! Per-folder sync configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use peersync_chunk::transform::validate_chain;
use peersync_chunk::{
    Chunker, ChunkerConfig, EncryptionKey, PackerConfig, Transform, TransformChain,
    DEFAULT_MULTICHUNK_CAPACITY,
};
use peersync_meta::{HeaderComparator, TieBreak};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::retry::RetryConfig;

/// Name of the state directory created inside the synced folder by default
pub const DEFAULT_STATE_DIR: &str = ".peersync";

/// Retry settings as they appear in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First backoff in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Add up to 50% random jitter
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            initial_backoff_ms: defaults.initial_backoff.as_millis() as u64,
            max_backoff_ms: defaults.max_backoff.as_millis() as u64,
            backoff_multiplier: defaults.backoff_multiplier,
            jitter: defaults.jitter,
        }
    }
}

/// Configuration of one synced folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity of this client in vector clocks and remote names
    pub client_id: String,
    /// Folder being synced
    pub local_dir: PathBuf,
    /// Database, cache and scratch files; `<local_dir>/.peersync` when unset
    pub state_dir: Option<PathBuf>,
    /// Chunking strategy
    pub chunker: ChunkerConfig,
    /// Content bytes per multichunk before it is sealed
    pub multichunk_capacity: usize,
    /// Transforms applied to every remote artifact, in write order
    pub transforms: Vec<Transform>,
    /// 32-byte master key as 64 hex digits, required by an encrypt transform
    pub encryption_key_hex: Option<String>,
    /// Remote call retries
    pub retry: RetrySettings,
    /// Ordering of concurrent database versions
    pub tie_break: TieBreak,
    /// Quiet period after a local change before a cycle starts
    pub settle_delay_ms: u64,
    /// Marker inserted into the names of conflict copies
    pub conflict_suffix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            local_dir: PathBuf::from("."),
            state_dir: None,
            chunker: ChunkerConfig::default(),
            multichunk_capacity: DEFAULT_MULTICHUNK_CAPACITY,
            transforms: Vec::new(),
            encryption_key_hex: None,
            retry: RetrySettings::default(),
            tie_break: TieBreak::default(),
            settle_delay_ms: 3000,
            conflict_suffix: "conflicted copy".to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults for `client_id` syncing `local_dir`
    pub fn new(client_id: impl Into<String>, local_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: client_id.into(),
            local_dir: local_dir.into(),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: SyncConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: SyncConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(SyncError::Config("client_id must not be empty".into()));
        }
        if self.client_id.contains(['/', '\\']) {
            return Err(SyncError::Config(format!(
                "client_id {:?} must not contain path separators",
                self.client_id
            )));
        }
        self.chunker
            .validate()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        if self.multichunk_capacity == 0 {
            return Err(SyncError::Config("multichunk_capacity must be positive".into()));
        }
        let key = self.encryption_key()?;
        validate_chain(&self.transforms, key.is_some())
            .map_err(|e| SyncError::Config(e.to_string()))?;
        if self.retry.backoff_multiplier < 1.0 {
            return Err(SyncError::Config("retry.backoff_multiplier must be at least 1.0".into()));
        }
        if self.conflict_suffix.trim().is_empty() {
            return Err(SyncError::Config("conflict_suffix must not be empty".into()));
        }
        Ok(())
    }

    fn encryption_key(&self) -> Result<Option<EncryptionKey>> {
        self.encryption_key_hex
            .as_deref()
            .map(|hex| EncryptionKey::from_hex(hex).map_err(|e| SyncError::Config(e.to_string())))
            .transpose()
    }

    /// Directory holding the database, chunk cache and scratch files
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.local_dir.join(DEFAULT_STATE_DIR))
    }

    /// The configured transform chain
    pub fn transform_chain(&self) -> Result<TransformChain> {
        let key = self.encryption_key()?;
        TransformChain::new(self.transforms.clone(), key).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Chunker for the configured strategy
    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::with_config(self.chunker).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Packer settings
    pub fn packer_config(&self) -> PackerConfig {
        PackerConfig {
            capacity: self.multichunk_capacity,
        }
    }

    /// Retry settings for remote calls
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter: self.retry.jitter,
        }
    }

    /// Header comparator for the configured tie-break
    pub fn comparator(&self) -> HeaderComparator {
        HeaderComparator::new(self.tie_break)
    }

    /// Settle delay as a duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peersync_chunk::{CompressionAlgorithm, EncryptionAlgorithm};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_default_values() {
        let config = SyncConfig::new("laptop", "/data/docs");
        assert_eq!(config.state_dir(), PathBuf::from("/data/docs/.peersync"));
        assert_eq!(config.tie_break, TieBreak::ConsiderTime);
        assert_eq!(config.conflict_suffix, "conflicted copy");
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.transforms.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
client_id = "desk"
local_dir = "/home/me/sync"
state_dir = "/var/lib/peersync/desk"
multichunk_capacity = 1048576
tie_break = "ignore-time"
settle_delay_ms = 500

[chunker]
kind = "fixed-offset"
size = 8192

[retry]
max_retries = 5
jitter = false
            "#
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.client_id, "desk");
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/peersync/desk"));
        assert_eq!(config.chunker, ChunkerConfig::FixedOffset { size: 8192 });
        assert_eq!(config.tie_break, TieBreak::IgnoreTime);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert!(!config.retry.jitter);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_json_with_transforms() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "client_id": "phone",
                "local_dir": "/sdcard/sync",
                "transforms": [
                    {{"compress": {{"algorithm": "zstd", "level": 3}}}},
                    {{"encrypt": "chacha20-poly1305"}}
                ],
                "encryption_key_hex": "{}"
            }}"#,
            KEY
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.transforms,
            vec![
                Transform::Compress(CompressionAlgorithm::Zstd { level: 3 }),
                Transform::Encrypt(EncryptionAlgorithm::ChaCha20Poly1305),
            ]
        );
        config.validate().unwrap();
        let chain = config.transform_chain().unwrap();
        assert_eq!(chain.decode(&chain.encode(b"abc").unwrap()).unwrap(), b"abc");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(SyncConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let mut config = SyncConfig::new("", "/x");
        assert!(config.validate().is_err());

        config.client_id = "a/b".into();
        assert!(config.validate().is_err());

        config.client_id = "a".into();
        config.transforms = vec![Transform::Encrypt(EncryptionAlgorithm::AesGcm256)];
        assert!(config.validate().is_err(), "encryption without key");

        config.encryption_key_hex = Some("abcd".into());
        assert!(config.validate().is_err(), "short key");

        config.encryption_key_hex = Some(KEY.into());
        config.validate().unwrap();

        config.transforms.push(Transform::Encrypt(EncryptionAlgorithm::ChaCha20Poly1305));
        assert!(config.validate().is_err(), "repeated transform kind");

        config.transforms.truncate(1);
        config.chunker = ChunkerConfig::FixedOffset { size: 70_000 };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_retry_config_conversion() {
        let mut config = SyncConfig::new("a", "/x");
        config.retry.initial_backoff_ms = 5;
        config.retry.max_backoff_ms = 50;
        let retry = config.retry_config();
        assert_eq!(retry.initial_backoff, Duration::from_millis(5));
        assert_eq!(retry.max_backoff, Duration::from_millis(50));
        assert_eq!(config.settle_delay(), Duration::from_secs(3));
    }
}
