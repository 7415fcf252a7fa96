//! Names of files in the shared remote repository.
//!
//! ```text
//! db-<client>-<seq>          one database version, seq zero-padded to 10 digits
//! multichunk-<hex id>        one multichunk
//! tx-<client>-<hex>          transaction manifest
//! temp-<client>-<hex>        staged upload or file being deleted
//! ```
//!
//! The client part may itself contain `-`; parsing splits on the last one.

use std::fmt;
use std::str::FromStr;

use peersync_chunk::MultiChunkId;
use uuid::Uuid;

use crate::error::MetaError;
use crate::types::ClientId;

/// Prefix of database files
pub const DATABASE_PREFIX: &str = "db-";
/// Prefix of multichunk files
pub const MULTICHUNK_PREFIX: &str = "multichunk-";
/// Prefix of transaction manifests
pub const TRANSACTION_PREFIX: &str = "tx-";
/// Prefix of staged files
pub const TEMP_PREFIX: &str = "temp-";

/// A parsed remote file name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RemoteFile {
    /// Database version `sequence` of `client`
    Database {
        /// Producing client
        client: ClientId,
        /// Client's own vector clock counter for that version
        sequence: u64,
    },
    /// A multichunk container
    MultiChunk(MultiChunkId),
    /// A transaction manifest
    Transaction {
        /// Client running the transaction
        client: ClientId,
        /// Random id
        id: String,
    },
    /// A staged file
    Temp {
        /// Client that staged it
        client: ClientId,
        /// Random id
        id: String,
    },
}

fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn split_client<'a>(rest: &'a str, name: &str) -> Result<(&'a str, &'a str), MetaError> {
    match rest.rsplit_once('-') {
        Some((client, tail)) if !client.is_empty() && !tail.is_empty() => Ok((client, tail)),
        _ => Err(MetaError::InvalidRemoteName(name.to_string())),
    }
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl RemoteFile {
    /// Database file for `client` at `sequence`
    pub fn database(client: &str, sequence: u64) -> Self {
        RemoteFile::Database {
            client: client.to_string(),
            sequence,
        }
    }

    /// A new, uniquely named transaction manifest
    pub fn new_transaction(client: &str) -> Self {
        RemoteFile::Transaction {
            client: client.to_string(),
            id: random_id(),
        }
    }

    /// A new, uniquely named temp file
    pub fn new_temp(client: &str) -> Self {
        RemoteFile::Temp {
            client: client.to_string(),
            id: random_id(),
        }
    }

    /// Full remote name
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Owning client, if the name carries one
    pub fn client(&self) -> Option<&str> {
        match self {
            RemoteFile::Database { client, .. }
            | RemoteFile::Transaction { client, .. }
            | RemoteFile::Temp { client, .. } => Some(client),
            RemoteFile::MultiChunk(_) => None,
        }
    }

    /// Parse a remote name
    pub fn parse(name: &str) -> Result<Self, MetaError> {
        let invalid = || MetaError::InvalidRemoteName(name.to_string());
        if let Some(rest) = name.strip_prefix(DATABASE_PREFIX) {
            let (client, seq) = split_client(rest, name)?;
            if !seq.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            let sequence = seq.parse::<u64>().map_err(|_| invalid())?;
            Ok(RemoteFile::database(client, sequence))
        } else if let Some(rest) = name.strip_prefix(MULTICHUNK_PREFIX) {
            MultiChunkId::from_hex(rest)
                .map(RemoteFile::MultiChunk)
                .map_err(|_| invalid())
        } else if let Some(rest) = name.strip_prefix(TRANSACTION_PREFIX) {
            let (client, id) = split_client(rest, name)?;
            if !is_hex(id) {
                return Err(invalid());
            }
            Ok(RemoteFile::Transaction {
                client: client.to_string(),
                id: id.to_string(),
            })
        } else if let Some(rest) = name.strip_prefix(TEMP_PREFIX) {
            let (client, id) = split_client(rest, name)?;
            if !is_hex(id) {
                return Err(invalid());
            }
            Ok(RemoteFile::Temp {
                client: client.to_string(),
                id: id.to_string(),
            })
        } else {
            Err(invalid())
        }
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFile::Database { client, sequence } => {
                write!(f, "{}{}-{:010}", DATABASE_PREFIX, client, sequence)
            }
            RemoteFile::MultiChunk(id) => write!(f, "{}{}", MULTICHUNK_PREFIX, id.to_hex()),
            RemoteFile::Transaction { client, id } => {
                write!(f, "{}{}-{}", TRANSACTION_PREFIX, client, id)
            }
            RemoteFile::Temp { client, id } => write!(f, "{}{}-{}", TEMP_PREFIX, client, id),
        }
    }
}

impl FromStr for RemoteFile {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RemoteFile::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names_are_zero_padded() {
        assert_eq!(RemoteFile::database("A", 7).name(), "db-A-0000000007");
    }

    #[test]
    fn parse_accepts_plain_and_padded_sequences() {
        assert_eq!(RemoteFile::parse("db-A-12").unwrap(), RemoteFile::database("A", 12));
        assert_eq!(
            RemoteFile::parse("db-my-laptop-0000000003").unwrap(),
            RemoteFile::database("my-laptop", 3)
        );
    }

    #[test]
    fn parse_roundtrips_every_kind() {
        let names = vec![
            RemoteFile::database("A", 1),
            RemoteFile::MultiChunk(MultiChunkId::random()),
            RemoteFile::new_transaction("B"),
            RemoteFile::new_temp("host-1"),
        ];
        for file in names {
            assert_eq!(RemoteFile::parse(&file.name()).unwrap(), file);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "db-", "db-A", "db-A-x1", "multichunk-zz", "tx-A-", "temp--ab", "other"] {
            assert!(RemoteFile::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn client_is_exposed() {
        assert_eq!(RemoteFile::database("A", 1).client(), Some("A"));
        assert_eq!(RemoteFile::MultiChunk(MultiChunkId([0; 32])).client(), None);
    }
}
