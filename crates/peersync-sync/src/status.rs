//! Read-only operations: local status and unknown remote versions.

use peersync_meta::{RemoteFile, DATABASE_PREFIX};
use tracing::{debug, instrument};

use crate::context::SyncContext;
use crate::error::Result;
use crate::indexer::ChangeSet;

/// A remote database file this client has not applied
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnknownDatabase {
    /// Producing client
    pub client: String,
    /// The client's sequence number
    pub sequence: u64,
    /// Remote file name
    pub name: String,
}

/// Remote database files of other clients newer than what is applied here
/// and not yet analysed by a down cycle, ordered by client and sequence.
#[instrument(skip_all, fields(client = %ctx.client()))]
pub async fn ls_remote(ctx: &SyncContext) -> Result<Vec<UnknownDatabase>> {
    let db = ctx.database();
    let known = db.known_database_versions()?;
    let listed = ctx.transactions().list(DATABASE_PREFIX).await?;
    let mut unknown = Vec::new();
    for name in listed.into_keys() {
        match RemoteFile::parse(&name) {
            Ok(RemoteFile::Database { client, sequence }) => {
                if client != ctx.client()
                    && sequence > known.get(&client)
                    && !db.is_known_database_file(&name)?
                {
                    unknown.push(UnknownDatabase { client, sequence, name });
                }
            }
            _ => debug!(name = %name, "ignoring unrecognised remote file"),
        }
    }
    unknown.sort();
    Ok(unknown)
}

/// Local changes that the next up would upload
#[instrument(skip_all, fields(client = %ctx.client()))]
pub fn status(ctx: &SyncContext) -> Result<ChangeSet> {
    Ok(ctx.indexer().index(ctx.deduper()?)?.changes)
}
