//! Persistent backing and the commit-marker recovery protocol (spec §4.5).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FabricTableError, Result};
use crate::identifiers::{FabricId, FabricIndex, NodeId, RootPublicKeyBytes, VendorId};

/// Storage effects consumed by the fabric table (spec §6).
///
/// Keys are short byte strings; values are small (at most a few KiB: a
/// certificate, a key handle, or a metadata record). Writes are assumed
/// atomic at the per-record granularity only — multi-record atomicity is the
/// job of the commit marker, never the storage implementation.
#[async_trait]
pub trait FabricStorage: Send + Sync {
    /// Read a record, or `None` if the key is absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Write (insert or overwrite) a record.
    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()>;
    /// Delete a record. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Total number of records currently stored.
    async fn num_keys(&self) -> Result<usize>;
}

/// The largest `FabricIndex` the table will ever probe for orphaned records.
pub const MAX_FABRICS: u16 = 254;

/// Storage key for the singleton ordered list of committed indices.
pub const INDEX_LIST_KEY: &str = "fabric/index_list";
/// Storage key for the persisted Last Known Good Time.
pub const LKGT_KEY: &str = "fabric/lkgt";
/// Storage key for the in-flight commit marker.
pub const COMMIT_MARKER_KEY: &str = "fabric/commit_marker";

/// Build the storage key for a fabric's metadata record.
pub fn meta_key(ix: FabricIndex) -> String {
    format!("fabric/{}/meta", ix.value())
}
/// Build the storage key for a fabric's RCAC.
pub fn rcac_key(ix: FabricIndex) -> String {
    format!("fabric/{}/rcac", ix.value())
}
/// Build the storage key for a fabric's ICAC (optional).
pub fn icac_key(ix: FabricIndex) -> String {
    format!("fabric/{}/icac", ix.value())
}
/// Build the storage key for a fabric's NOC.
pub fn noc_key(ix: FabricIndex) -> String {
    format!("fabric/{}/noc", ix.value())
}
/// Build the storage key for a fabric's operational key record.
pub fn op_key_key(ix: FabricIndex) -> String {
    format!("fabric/{}/opkey", ix.value())
}

/// `FabricMeta[ix]`: the redundant, cheaply-loadable cache of a fabric's
/// identity fields (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricMetaRecord {
    /// Administrative vendor tag.
    pub vendor_id: VendorId,
    /// Human-readable label, mutable independently of the certificate set.
    pub fabric_label: String,
    /// Whether this fabric is visible to identity-advertising mechanisms.
    pub advertise_identity: bool,
    /// Node identifier extracted from the NOC.
    pub node_id: NodeId,
    /// Fabric identifier extracted from the NOC.
    pub fabric_id: FabricId,
    /// Root public key extracted from the RCAC.
    pub root_public_key: RootPublicKeyBytes,
}

impl FabricMetaRecord {
    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| FabricTableError::internal(format!("failed to encode FabricMeta: {e}")))
    }

    /// Deserialize from a stored record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| FabricTableError::storage_failure(format!("corrupt FabricMeta record: {e}")))
    }
}

/// Ordered list of committed fabric indices, plus the cursor for the next
/// allocation (spec §4.1 "FabricIndex allocation").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricIndexList {
    /// Committed indices, ascending.
    pub indices: Vec<FabricIndex>,
    /// The next index `SetFabricIndexForNextAddition` pinned, if any.
    pub pinned_next: Option<FabricIndex>,
}

impl FabricIndexList {
    /// Serialize for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| FabricTableError::internal(format!("failed to encode index list: {e}")))
    }

    /// Deserialize from a stored record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| {
            FabricTableError::storage_failure(format!("corrupt fabric index list: {e}"))
        })
    }

    /// Smallest positive integer not currently occupied.
    pub fn next_available(&self) -> FabricIndex {
        if let Some(pinned) = self.pinned_next {
            return pinned;
        }
        let mut candidate = FabricIndex::MIN;
        loop {
            if !self.indices.contains(&candidate) {
                return candidate;
            }
            candidate = match candidate.next() {
                Some(next) => next,
                None => return candidate,
            };
        }
    }
}

/// Outcome of replaying the commit marker at init (spec §4.2 "Failure semantics").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMarkerOutcome {
    /// No marker was present; storage was already consistent.
    Clean,
    /// The marker's generation was fully written; init finished the commit
    /// (updated the index list if needed, then deleted the marker).
    RolledForward {
        /// The index whose commit was completed.
        index: FabricIndex,
    },
    /// The marker's generation was incomplete; init rolled back by deleting
    /// every record at that index and the marker itself.
    RolledBack {
        /// The index whose partial write was discarded.
        index: FabricIndex,
    },
}

/// Replay the commit marker protocol against `storage` (spec §4.5).
///
/// Must run once, synchronously, before the table accepts any other calls.
/// Returns the outcome so the caller can populate
/// [`crate::lkgt::GetDeletedFabricFromCommitMarker`]-equivalent state.
pub async fn replay_commit_marker(storage: &dyn FabricStorage) -> Result<CommitMarkerOutcome> {
    let marker = match storage.read(COMMIT_MARKER_KEY).await? {
        Some(bytes) => bytes,
        None => return Ok(CommitMarkerOutcome::Clean),
    };
    if marker.len() != 1 {
        return Err(FabricTableError::storage_failure(
            "commit marker record has unexpected length",
        ));
    }
    let ix = FabricIndex::new(marker[0])
        .map_err(|_| FabricTableError::storage_failure("commit marker names reserved index 0"))?;

    let index_list = match storage.read(INDEX_LIST_KEY).await? {
        Some(bytes) => FabricIndexList::decode(&bytes)?,
        None => FabricIndexList::default(),
    };

    if index_list.indices.contains(&ix) {
        // The index list already names this index: the write sequence made
        // it past "write FabricIndexList" before the crash. Finish by
        // deleting the marker (spec step 4).
        storage.delete(COMMIT_MARKER_KEY).await?;
        return Ok(CommitMarkerOutcome::RolledForward { index: ix });
    }

    // All records at `ix` are orphans of a partial write: roll back.
    storage.delete(&meta_key(ix)).await?;
    storage.delete(&rcac_key(ix)).await?;
    storage.delete(&icac_key(ix)).await?;
    storage.delete(&noc_key(ix)).await?;
    storage.delete(&op_key_key(ix)).await?;
    storage.delete(COMMIT_MARKER_KEY).await?;
    Ok(CommitMarkerOutcome::RolledBack { index: ix })
}
