//! Declarative option schema for [`SyncConfig`].
//!
//! Each option has a name, a kind, its default as text, a description, a
//! validator, and a setter. Front ends set options by name without knowing
//! the config struct.

use std::path::PathBuf;

use peersync_chunk::{ChunkerConfig, CompressionAlgorithm, EncryptionAlgorithm, EncryptionKey, Transform};
use peersync_meta::TieBreak;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Value type of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Free text
    Text,
    /// Filesystem path
    Path,
    /// Unsigned integer
    Integer,
    /// Decimal number
    Decimal,
    /// `true` or `false`
    Bool,
    /// One of a fixed set of words
    Choice(&'static [&'static str]),
    /// Comma-separated list
    List,
}

/// One settable option
pub struct OptionSpec {
    /// Option name
    pub name: &'static str,
    /// Value type
    pub kind: OptionKind,
    /// Default, as it would be typed
    pub default: &'static str,
    /// One-line help text
    pub description: &'static str,
    /// Check a value without applying it
    pub validate: fn(&str) -> std::result::Result<(), String>,
    apply: fn(&mut SyncConfig, &str) -> std::result::Result<(), String>,
}

fn parse_u64(v: &str) -> std::result::Result<u64, String> {
    v.trim()
        .parse::<u64>()
        .map_err(|e| format!("{:?} is not an unsigned integer: {}", v, e))
}

fn parse_bool(v: &str) -> std::result::Result<bool, String> {
    match v.trim() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("{:?} is not a boolean", other)),
    }
}

fn parse_multiplier(v: &str) -> std::result::Result<f64, String> {
    let m = v
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("{:?} is not a number: {}", v, e))?;
    if m.is_finite() && m >= 1.0 {
        Ok(m)
    } else {
        Err(format!("multiplier must be at least 1.0, got {}", m))
    }
}

fn parse_client_id(v: &str) -> std::result::Result<String, String> {
    let v = v.trim();
    if v.is_empty() || v.contains(['/', '\\']) {
        Err(format!("{:?} is not a valid client id", v))
    } else {
        Ok(v.to_string())
    }
}

/// `fixed:<size>` or `cdc:<min>:<avg>:<max>`
fn parse_chunker(v: &str) -> std::result::Result<ChunkerConfig, String> {
    let parts: Vec<&str> = v.trim().split(':').collect();
    let config = match parts.as_slice() {
        ["fixed", size] => ChunkerConfig::FixedOffset {
            size: parse_u64(size)? as usize,
        },
        ["cdc", min, avg, max] => ChunkerConfig::ContentDefined {
            min_size: parse_u64(min)? as usize,
            avg_size: parse_u64(avg)? as usize,
            max_size: parse_u64(max)? as usize,
        },
        _ => return Err(format!("{:?} is neither fixed:<size> nor cdc:<min>:<avg>:<max>", v)),
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn parse_transform(v: &str) -> std::result::Result<Transform, String> {
    let t = match v.trim() {
        "lz4" => Transform::Compress(CompressionAlgorithm::Lz4),
        "zstd" => Transform::Compress(CompressionAlgorithm::Zstd { level: 3 }),
        "aes-256-gcm" => Transform::Encrypt(EncryptionAlgorithm::AesGcm256),
        "chacha20-poly1305" => Transform::Encrypt(EncryptionAlgorithm::ChaCha20Poly1305),
        other => match other.strip_prefix("zstd:") {
            Some(level) => Transform::Compress(CompressionAlgorithm::Zstd {
                level: level
                    .parse::<i32>()
                    .map_err(|e| format!("bad zstd level {:?}: {}", level, e))?,
            }),
            None => return Err(format!("unknown transform {:?}", other)),
        },
    };
    Ok(t)
}

/// Comma-separated transforms in write order; `none` or empty for no transforms
fn parse_transforms(v: &str) -> std::result::Result<Vec<Transform>, String> {
    let v = v.trim();
    if v.is_empty() || v == "none" {
        return Ok(Vec::new());
    }
    v.split(',').map(parse_transform).collect()
}

fn parse_tie_break(v: &str) -> std::result::Result<TieBreak, String> {
    match v.trim() {
        "consider-time" => Ok(TieBreak::ConsiderTime),
        "ignore-time" => Ok(TieBreak::IgnoreTime),
        other => Err(format!("unknown tie-break {:?}", other)),
    }
}

fn parse_key(v: &str) -> std::result::Result<String, String> {
    EncryptionKey::from_hex(v).map_err(|e| e.to_string())?;
    Ok(v.trim().to_string())
}

fn parse_text(v: &str) -> std::result::Result<String, String> {
    if v.trim().is_empty() {
        Err("value must not be empty".to_string())
    } else {
        Ok(v.to_string())
    }
}

/// Every option [`SyncConfig::set_option`] accepts
pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "client-id",
        kind: OptionKind::Text,
        default: "",
        description: "Identity of this client in vector clocks and remote file names",
        validate: |v| parse_client_id(v).map(drop),
        apply: |c, v| {
            c.client_id = parse_client_id(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "local-dir",
        kind: OptionKind::Path,
        default: ".",
        description: "Folder being synced",
        validate: |v| parse_text(v).map(drop),
        apply: |c, v| {
            c.local_dir = PathBuf::from(parse_text(v)?);
            Ok(())
        },
    },
    OptionSpec {
        name: "state-dir",
        kind: OptionKind::Path,
        default: "<local-dir>/.peersync",
        description: "Database, chunk cache and scratch files",
        validate: |v| parse_text(v).map(drop),
        apply: |c, v| {
            c.state_dir = Some(PathBuf::from(parse_text(v)?));
            Ok(())
        },
    },
    OptionSpec {
        name: "chunker",
        kind: OptionKind::Text,
        default: "cdc:4096:16384:65535",
        description: "Chunking strategy: fixed:<size> or cdc:<min>:<avg>:<max>",
        validate: |v| parse_chunker(v).map(drop),
        apply: |c, v| {
            c.chunker = parse_chunker(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "multichunk-capacity",
        kind: OptionKind::Integer,
        default: "4194304",
        description: "Content bytes per multichunk before it is sealed",
        validate: |v| match parse_u64(v)? {
            0 => Err("capacity must be positive".to_string()),
            _ => Ok(()),
        },
        apply: |c, v| {
            c.multichunk_capacity = parse_u64(v)? as usize;
            Ok(())
        },
    },
    OptionSpec {
        name: "transforms",
        kind: OptionKind::List,
        default: "none",
        description: "Transforms in write order: lz4, zstd[:level], aes-256-gcm, chacha20-poly1305",
        validate: |v| parse_transforms(v).map(drop),
        apply: |c, v| {
            c.transforms = parse_transforms(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "encryption-key",
        kind: OptionKind::Text,
        default: "",
        description: "32-byte master key as 64 hex digits",
        validate: |v| parse_key(v).map(drop),
        apply: |c, v| {
            c.encryption_key_hex = Some(parse_key(v)?);
            Ok(())
        },
    },
    OptionSpec {
        name: "retry.max-retries",
        kind: OptionKind::Integer,
        default: "3",
        description: "Retries of a failed remote call",
        validate: |v| parse_u64(v).map(drop),
        apply: |c, v| {
            c.retry.max_retries = u32::try_from(parse_u64(v)?).map_err(|e| e.to_string())?;
            Ok(())
        },
    },
    OptionSpec {
        name: "retry.initial-backoff-ms",
        kind: OptionKind::Integer,
        default: "100",
        description: "First retry delay in milliseconds",
        validate: |v| parse_u64(v).map(drop),
        apply: |c, v| {
            c.retry.initial_backoff_ms = parse_u64(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "retry.max-backoff-ms",
        kind: OptionKind::Integer,
        default: "10000",
        description: "Retry delay ceiling in milliseconds",
        validate: |v| parse_u64(v).map(drop),
        apply: |c, v| {
            c.retry.max_backoff_ms = parse_u64(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "retry.backoff-multiplier",
        kind: OptionKind::Decimal,
        default: "2.0",
        description: "Growth factor between retry delays",
        validate: |v| parse_multiplier(v).map(drop),
        apply: |c, v| {
            c.retry.backoff_multiplier = parse_multiplier(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "retry.jitter",
        kind: OptionKind::Bool,
        default: "true",
        description: "Add random jitter to retry delays",
        validate: |v| parse_bool(v).map(drop),
        apply: |c, v| {
            c.retry.jitter = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "tie-break",
        kind: OptionKind::Choice(&["consider-time", "ignore-time"]),
        default: "consider-time",
        description: "Ordering of concurrent database versions",
        validate: |v| parse_tie_break(v).map(drop),
        apply: |c, v| {
            c.tie_break = parse_tie_break(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "settle-delay-ms",
        kind: OptionKind::Integer,
        default: "3000",
        description: "Quiet period after a local change before a sync starts",
        validate: |v| parse_u64(v).map(drop),
        apply: |c, v| {
            c.settle_delay_ms = parse_u64(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "conflict-suffix",
        kind: OptionKind::Text,
        default: "conflicted copy",
        description: "Marker in the names of conflict copies",
        validate: |v| parse_text(v).map(drop),
        apply: |c, v| {
            c.conflict_suffix = parse_text(v)?.trim().to_string();
            Ok(())
        },
    },
];

/// Look up an option by name
pub fn find_option(name: &str) -> Option<&'static OptionSpec> {
    OPTIONS.iter().find(|o| o.name == name)
}

/// One line per option: name, kind, default and description
pub fn describe_options() -> Vec<String> {
    OPTIONS
        .iter()
        .map(|o| {
            let kind = match o.kind {
                OptionKind::Choice(choices) => choices.join("|"),
                other => format!("{:?}", other).to_lowercase(),
            };
            format!(
                "{:<26} {:<28} default: {:<22} {}",
                o.name, kind, o.default, o.description
            )
        })
        .collect()
}

impl SyncConfig {
    /// Validate and apply one option by name
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let spec = find_option(name).ok_or_else(|| SyncError::Config(format!("unknown option {:?}", name)))?;
        (spec.validate)(value).map_err(|e| SyncError::Config(format!("{}: {}", name, e)))?;
        (spec.apply)(self, value).map_err(|e| SyncError::Config(format!("{}: {}", name, e)))
    }
}
