//! The fabric table itself: in-memory state, iteration, and lookup (spec §4.1).

use tracing::debug;

use crate::cert::CertificateParser;
use crate::entry::{FabricEntry, FabricEntryView};
use crate::error::{FabricTableError, Result};
use crate::identifiers::{CatValues, FabricId, FabricIndex, NodeId, RootPublicKeyBytes};
use crate::keystore::OperationalKeystore;
use crate::lifecycle::LifecycleState;
use crate::lkgt::LastKnownGoodTime;
use crate::storage::{
    self, replay_commit_marker, CommitMarkerOutcome, FabricIndexList, FabricMetaRecord,
    FabricStorage,
};
use crate::{Clock, Config};

/// External parameters the table needs at construction time (spec §6 "Config").
#[derive(Debug, Clone, Copy)]
pub struct FabricTableConfig {
    /// Epoch-seconds timestamp the running firmware image was built at.
    pub firmware_build_epoch_seconds: u32,
}

impl Config for FabricTableConfig {
    fn firmware_build_epoch_seconds(&self) -> u32 {
        self.firmware_build_epoch_seconds
    }
}

/// The fabric membership table.
///
/// Owns the in-memory committed entries, the pending-state machine
/// ([`crate::lifecycle::LifecycleState`]), and the Last Known Good Time
/// floor. Delegates to a [`FabricStorage`], an [`OperationalKeystore`], and a
/// [`CertificateParser`], none of which it assumes anything about beyond
/// their trait contracts.
///
/// Per spec §5, every public method here runs to completion on the single
/// cooperative task that owns the table; no method suspends mid-transaction,
/// and the table must not be re-entered from within a callback one of its
/// own calls invokes.
pub struct FabricTable {
    pub(crate) storage: Box<dyn FabricStorage>,
    pub(crate) keystore: Box<dyn OperationalKeystore>,
    pub(crate) certs: Box<dyn CertificateParser>,
    pub(crate) config: FabricTableConfig,

    pub(crate) clock: Option<Box<dyn Clock>>,

    pub(crate) committed: Vec<FabricEntry>,
    pub(crate) state: LifecycleState,
    pub(crate) lkgt: LastKnownGoodTime,
    pub(crate) permit_colliding: bool,
    pub(crate) deleted_from_commit_marker: Option<FabricIndex>,
    pub(crate) pinned_next: Option<FabricIndex>,

    #[cfg(feature = "test-utils")]
    pub(crate) force_abort_commit_after_marker: bool,
}

impl FabricTable {
    /// Initialize the table from persistent storage.
    ///
    /// Replays the commit-marker protocol first (spec §4.5), then scans for
    /// orphaned records left by an interrupted Delete, then loads the
    /// committed entries and the Last Known Good Time. `clock` is the
    /// optional real-time source of spec §6; pass `None` when the host has no
    /// battery-backed RTC or network time yet, and chain validation falls
    /// back to the Last Known Good Time floor.
    pub async fn init(
        storage: Box<dyn FabricStorage>,
        keystore: Box<dyn OperationalKeystore>,
        certs: Box<dyn CertificateParser>,
        config: FabricTableConfig,
        clock: Option<Box<dyn Clock>>,
    ) -> Result<Self> {
        let marker_outcome = replay_commit_marker(storage.as_ref()).await?;
        let deleted_from_commit_marker = match marker_outcome {
            CommitMarkerOutcome::RolledBack { index } => Some(index),
            CommitMarkerOutcome::RolledForward { .. } | CommitMarkerOutcome::Clean => None,
        };

        let index_list = match storage.read(storage::INDEX_LIST_KEY).await? {
            Some(bytes) => FabricIndexList::decode(&bytes)?,
            None => FabricIndexList::default(),
        };

        Self::scan_and_delete_orphans(storage.as_ref(), &index_list).await?;

        let mut committed = Vec::with_capacity(index_list.indices.len());
        for &ix in &index_list.indices {
            committed.push(Self::load_entry(storage.as_ref(), ix).await?);
        }
        committed.sort_by_key(|e| e.fabric_index);

        let lkgt = LastKnownGoodTime::load(storage.as_ref(), config.firmware_build_epoch_seconds)
            .await?;

        Ok(Self {
            storage,
            keystore,
            certs,
            config,
            clock,
            committed,
            state: LifecycleState::Idle,
            lkgt,
            permit_colliding: false,
            deleted_from_commit_marker,
            pinned_next: index_list.pinned_next,
            #[cfg(feature = "test-utils")]
            force_abort_commit_after_marker: false,
        })
    }

    async fn load_entry(storage: &dyn FabricStorage, ix: FabricIndex) -> Result<FabricEntry> {
        let meta_bytes = storage
            .read(&storage::meta_key(ix))
            .await?
            .ok_or_else(|| {
                FabricTableError::storage_failure(format!(
                    "index list names fabric {ix} but its metadata record is missing"
                ))
            })?;
        let meta = FabricMetaRecord::decode(&meta_bytes)?;

        let rcac = storage.read(&storage::rcac_key(ix)).await?.ok_or_else(|| {
            FabricTableError::storage_failure(format!("fabric {ix} is missing its RCAC record"))
        })?;
        let icac = storage.read(&storage::icac_key(ix)).await?;
        let noc = storage.read(&storage::noc_key(ix)).await?.ok_or_else(|| {
            FabricTableError::storage_failure(format!("fabric {ix} is missing its NOC record"))
        })?;
        let key_ref_bytes = storage.read(&storage::op_key_key(ix)).await?.ok_or_else(|| {
            FabricTableError::storage_failure(format!("fabric {ix} is missing its key record"))
        })?;
        let key_ref = bincode::deserialize(&key_ref_bytes).map_err(|e| {
            FabricTableError::storage_failure(format!("corrupt key record for fabric {ix}: {e}"))
        })?;

        Ok(FabricEntry {
            fabric_index: ix,
            fabric_id: meta.fabric_id,
            node_id: meta.node_id,
            root_public_key: meta.root_public_key,
            vendor_id: meta.vendor_id,
            fabric_label: meta.fabric_label,
            advertise_identity: meta.advertise_identity,
            rcac,
            icac,
            noc,
            key_ref,
        })
    }

    async fn scan_and_delete_orphans(
        storage: &dyn FabricStorage,
        index_list: &FabricIndexList,
    ) -> Result<()> {
        for raw in 1..=storage::MAX_FABRICS as u8 {
            let ix = match FabricIndex::new(raw) {
                Ok(ix) => ix,
                Err(_) => continue,
            };
            if index_list.indices.contains(&ix) {
                continue;
            }
            if storage.read(&storage::meta_key(ix)).await?.is_some() {
                debug!(fabric_index = %ix, "deleting orphaned fabric record");
                storage.delete(&storage::meta_key(ix)).await?;
                storage.delete(&storage::rcac_key(ix)).await?;
                storage.delete(&storage::icac_key(ix)).await?;
                storage.delete(&storage::noc_key(ix)).await?;
                storage.delete(&storage::op_key_key(ix)).await?;
            }
        }
        Ok(())
    }

    /// Number of committed entries (spec §4.1 `FabricCount`).
    pub fn fabric_count(&self) -> u32 {
        self.committed.len() as u32
    }

    /// Find a committed entry by index, or the pending entry if `ix` is the
    /// reserved pending index.
    pub fn find_fabric_with_index(&self, ix: FabricIndex) -> Option<FabricEntryView> {
        if let Some(pending_index) = self.state.pending_index() {
            if pending_index == ix {
                if let Some(entry) = self.state.pending_entry() {
                    let mut view = FabricEntryView::from(entry);
                    view.is_pending = true;
                    return Some(view);
                }
            }
        }
        self.committed
            .iter()
            .find(|e| e.fabric_index == ix)
            .map(FabricEntryView::from)
    }

    /// Find a committed (or pending) entry by `(RootPublicKey, FabricId)`.
    pub fn find_fabric(
        &self,
        root_public_key: &RootPublicKeyBytes,
        fabric_id: FabricId,
    ) -> Option<FabricEntryView> {
        self.iter()
            .find(|e| &e.root_public_key == root_public_key && e.fabric_id == fabric_id)
    }

    /// Find a committed (or pending) entry by `(RootPublicKey, FabricId, NodeId)`.
    pub fn find_identity(
        &self,
        root_public_key: &RootPublicKeyBytes,
        fabric_id: FabricId,
        node_id: NodeId,
    ) -> Option<FabricEntryView> {
        self.iter().find(|e| {
            &e.root_public_key == root_public_key
                && e.fabric_id == fabric_id
                && e.node_id == node_id
        })
    }

    /// Iterate every committed entry, substituting the pending projection
    /// when a pending update shadows a committed index, and additionally
    /// yielding the pending entry when a pending add is active. Order is by
    /// `FabricIndex` ascending (spec §4.1).
    pub fn iter(&self) -> impl Iterator<Item = FabricEntryView> + '_ {
        let pending_update_index = match &self.state {
            LifecycleState::PendingUpdate { index, .. } => Some(*index),
            _ => None,
        };
        let pending_add = match &self.state {
            LifecycleState::PendingAdd { index, entry } => Some((*index, entry)),
            _ => None,
        };

        let committed_iter = self.committed.iter().map(move |e| {
            if Some(e.fabric_index) == pending_update_index {
                if let Some(pending) = self.state.pending_entry() {
                    let mut view = FabricEntryView::from(pending);
                    view.is_pending = true;
                    return view;
                }
            }
            FabricEntryView::from(e)
        });

        let pending_add_iter = pending_add.into_iter().map(|(_, entry)| {
            let mut view = FabricEntryView::from(entry);
            view.is_pending = true;
            view
        });

        committed_iter.chain(pending_add_iter)
    }

    /// Smallest positive integer not currently occupied by a committed or
    /// reserved-pending entry.
    ///
    /// Fails with `InsufficientSpace` once every index up to
    /// [`storage::MAX_FABRICS`] is occupied; the table never reports or
    /// allocates an index beyond that bound (spec §7 `InsufficientSpace`).
    pub fn peek_fabric_index_for_next_addition(&self) -> Result<FabricIndex> {
        if let Some(pinned) = self.pinned_next {
            return Ok(pinned);
        }
        let occupied_pending = self.state.pending_index();
        let mut candidate = FabricIndex::MIN;
        loop {
            if candidate.value() as u16 > storage::MAX_FABRICS {
                return Err(FabricTableError::insufficient_space(format!(
                    "no fabric index available: all {} slots are occupied",
                    storage::MAX_FABRICS
                )));
            }
            let occupied = self.committed.iter().any(|e| e.fabric_index == candidate)
                || occupied_pending == Some(candidate);
            if !occupied {
                return Ok(candidate);
            }
            match candidate.next() {
                Some(next) => candidate = next,
                None => {
                    return Err(FabricTableError::insufficient_space(format!(
                        "no fabric index available: all {} slots are occupied",
                        storage::MAX_FABRICS
                    )))
                }
            }
        }
    }

    /// Pin the next allocation to a specific index.
    ///
    /// Per spec §9's Open Question resolution, this requires no pending
    /// state to be active; otherwise it fails `IncorrectState` rather than
    /// racing a concurrent Add.
    pub async fn set_fabric_index_for_next_addition(&mut self, ix: FabricIndex) -> Result<()> {
        if !matches!(self.state, LifecycleState::Idle) {
            return Err(FabricTableError::incorrect_state(
                "cannot pin the next fabric index while a pending operation is active",
            ));
        }
        if ix.is_undefined() {
            return Err(FabricTableError::invalid_argument(
                "fabric index 0 cannot be pinned for next addition",
            ));
        }
        if ix.value() as u16 > storage::MAX_FABRICS {
            return Err(FabricTableError::invalid_argument(format!(
                "fabric index {ix} exceeds the {} slot limit",
                storage::MAX_FABRICS
            )));
        }
        if self.committed.iter().any(|e| e.fabric_index == ix) {
            return Err(FabricTableError::fabric_exists(format!(
                "fabric index {ix} is already committed"
            )));
        }
        self.pinned_next = Some(ix);
        self.persist_index_list().await
    }

    pub(crate) async fn persist_index_list(&self) -> Result<()> {
        let list = FabricIndexList {
            indices: self.committed.iter().map(|e| e.fabric_index).collect(),
            pinned_next: self.pinned_next,
        };
        self.storage.write(storage::INDEX_LIST_KEY, list.encode()?).await
    }

    /// Fetch the raw RCAC bytes for a committed or pending entry.
    pub fn fetch_root_cert(&self, ix: FabricIndex) -> Result<Vec<u8>> {
        self.find_entry_for_read(ix).map(|e| e.rcac.clone())
    }

    /// Fetch the raw NOC bytes for a committed or pending entry.
    pub fn fetch_noc_cert(&self, ix: FabricIndex) -> Result<Vec<u8>> {
        self.find_entry_for_read(ix).map(|e| e.noc.clone())
    }

    /// Fetch the raw ICAC bytes for a committed or pending entry, if present.
    pub fn fetch_icac_cert(&self, ix: FabricIndex) -> Result<Vec<u8>> {
        let entry = self.find_entry_for_read(ix)?;
        entry
            .icac
            .clone()
            .ok_or_else(|| FabricTableError::not_found(format!("fabric {ix} has no ICAC")))
    }

    /// Fetch the root public key for a committed or pending entry.
    pub fn fetch_root_pubkey(&self, ix: FabricIndex) -> Result<RootPublicKeyBytes> {
        self.find_entry_for_read(ix).map(|e| e.root_public_key.clone())
    }

    /// Fetch the CATs embedded in a committed or pending entry's NOC.
    pub fn fetch_cats(&self, ix: FabricIndex) -> Result<CatValues> {
        let entry = self.find_entry_for_read(ix)?;
        self.certs.extract_cats(&entry.noc)
    }

    pub(crate) fn find_entry_for_read(&self, ix: FabricIndex) -> Result<&FabricEntry> {
        if let Some(pending_index) = self.state.pending_index() {
            if pending_index == ix {
                if let Some(entry) = self.state.pending_entry() {
                    return Ok(entry);
                }
            }
        }
        self.committed
            .iter()
            .find(|e| e.fabric_index == ix)
            .ok_or_else(|| {
                FabricTableError::invalid_fabric_index(format!("no fabric at index {ix}"))
            })
    }

    /// Current Last Known Good Time, in epoch seconds.
    pub fn get_last_known_good_time(&self) -> u32 {
        self.lkgt.get()
    }

    /// `GetDeletedFabricFromCommitMarker`: returns the index lost to an
    /// interrupted commit, once per boot (spec §4.5).
    pub fn get_deleted_fabric_from_commit_marker(&mut self) -> Option<FabricIndex> {
        self.deleted_from_commit_marker.take()
    }

    /// `ClearCommitMarker`: acknowledge consumption of the deleted-fabric
    /// notification. A no-op if there was nothing to clear (idempotent).
    pub async fn clear_commit_marker(&mut self) -> Result<()> {
        self.storage.delete(storage::COMMIT_MARKER_KEY).await
    }

    /// Place the table in "permit colliding fabrics" mode (invariant I4).
    pub fn permit_colliding_fabrics(&mut self) {
        self.permit_colliding = true;
    }
}
