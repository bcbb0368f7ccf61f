//! The pending-state machine and its Add/Update/Commit/Revert algorithms
//! (spec §4.2).

use tracing::{debug, instrument, warn};

use crate::cert::{RequiredUsage, ValidContext};
use crate::entry::FabricEntry;
use crate::error::{FabricTableError, Result};
use crate::identifiers::{FabricId, FabricIndex, RootPublicKeyBytes, VendorId};
use crate::keystore::{KeyRef, PendingKeyTag};
use crate::storage::{self, FabricIndexList, FabricMetaRecord};
use crate::table::FabricTable;
use crate::Config;

/// The fabric table's current position in the pending-state machine
/// (spec §4.2, §9).
///
/// No mutator may run unless the current state permits it; callers get
/// `IncorrectState` otherwise. Exactly one pending operation may be in
/// flight at a time (invariant P1).
#[derive(Debug, Clone)]
pub enum LifecycleState {
    /// No pending operation.
    Idle,
    /// A trusted root certificate has been staked out, but no fabric entry
    /// has been composed against it yet.
    PendingRootOnly {
        /// The staged RCAC bytes.
        rcac: Vec<u8>,
    },
    /// A brand new fabric is staged at a reserved, not-yet-committed index.
    PendingAdd {
        /// The reserved index.
        index: FabricIndex,
        /// The fully composed pending entry.
        entry: FabricEntry,
    },
    /// Replacement certificates are staged, shadowing an existing committed
    /// index until Commit or Revert.
    PendingUpdate {
        /// The existing committed index being shadowed.
        index: FabricIndex,
        /// The fully composed pending entry (same index, new certs/key).
        entry: FabricEntry,
    },
}

impl LifecycleState {
    /// The reserved/shadowed index a pending Add or Update occupies, if any.
    pub fn pending_index(&self) -> Option<FabricIndex> {
        match self {
            Self::PendingAdd { index, .. } | Self::PendingUpdate { index, .. } => Some(*index),
            Self::Idle | Self::PendingRootOnly { .. } => None,
        }
    }

    /// The staged entry of a pending Add or Update, if any.
    pub fn pending_entry(&self) -> Option<&FabricEntry> {
        match self {
            Self::PendingAdd { entry, .. } | Self::PendingUpdate { entry, .. } => Some(entry),
            Self::Idle | Self::PendingRootOnly { .. } => None,
        }
    }
}

/// Parameters shared by both Add entry points.
struct AddInputs<'a> {
    noc: &'a [u8],
    icac: Option<&'a [u8]>,
    vendor_id: VendorId,
}

impl FabricTable {
    /// The time used to validate certificate time windows (spec §4.2 step 2,
    /// §6 "Clock"): the real clock's reading when one is configured and
    /// reporting, maxed against the monotone `max(LastKnownGoodTime,
    /// firmwareBuildTime)` floor so a misbehaving clock can never move
    /// validation backwards. Falls back to the floor alone when no clock is
    /// configured or it reports unavailable.
    fn effective_time(&self) -> u32 {
        let floor = self.lkgt.get().max(self.config.firmware_build_epoch_seconds());
        match self.clock.as_ref().and_then(|c| c.now_epoch_seconds()) {
            Some(now) => now.max(floor),
            None => floor,
        }
    }

    fn valid_context(&self) -> ValidContext {
        ValidContext {
            effective_time_epoch_s: self.effective_time(),
            required_usage: RequiredUsage::default(),
        }
    }

    /// `AddNewPendingTrustedRootCert`: stake out a pending root certificate
    /// (spec §4.2 transition table, Idle → PendingRootOnly).
    #[instrument(skip(self, rcac))]
    pub fn add_new_pending_trusted_root_cert(&mut self, rcac: Vec<u8>) -> Result<()> {
        if !matches!(self.state, LifecycleState::Idle) {
            return Err(FabricTableError::incorrect_state(
                "a pending operation is already in progress",
            ));
        }
        if rcac.is_empty() {
            return Err(FabricTableError::invalid_argument("RCAC must not be empty"));
        }
        debug!("staged pending trusted root certificate");
        self.state = LifecycleState::PendingRootOnly { rcac };
        Ok(())
    }

    fn check_collision(&self, root_public_key: &RootPublicKeyBytes, fabric_id: FabricId) -> Result<()> {
        if self.permit_colliding {
            return Ok(());
        }
        let colliding = self
            .committed
            .iter()
            .any(|e| &e.root_public_key == root_public_key && e.fabric_id == fabric_id);
        if colliding {
            return Err(FabricTableError::fabric_exists(format!(
                "a committed fabric already has fabric id {} under this root",
                fabric_id.0
            )));
        }
        Ok(())
    }

    async fn compose_pending_add(
        &mut self,
        inputs: AddInputs<'_>,
        resolved_key_public: p256::ecdsa::VerifyingKey,
        key_ref: KeyRef,
    ) -> Result<FabricIndex> {
        let rcac = match &self.state {
            LifecycleState::PendingRootOnly { rcac } => rcac.clone(),
            _ => {
                return Err(FabricTableError::incorrect_state(
                    "AddNewPendingFabric requires a staged trusted root certificate",
                ))
            }
        };

        let context = self.valid_context();
        let verified = self
            .certs
            .verify_chain(inputs.noc, inputs.icac, &rcac, &context)
            .map_err(|e| {
                warn!(error = %e, "chain validation failed for pending fabric");
                e
            })?;

        if verified.noc_public_key != resolved_key_public {
            return Err(FabricTableError::invalid_credentials(
                "operational key public key does not match the NOC's subject public key",
            ));
        }

        let root_public_key =
            RootPublicKeyBytes(verified.root_public_key.to_encoded_point(false).as_bytes().to_vec());

        self.check_collision(&root_public_key, verified.fabric_id)?;

        let index = self.peek_fabric_index_for_next_addition()?;
        let entry = FabricEntry {
            fabric_index: index,
            fabric_id: verified.fabric_id,
            node_id: verified.node_id,
            root_public_key,
            vendor_id: inputs.vendor_id,
            fabric_label: String::new(),
            advertise_identity: true,
            rcac,
            icac: inputs.icac.map(|b| b.to_vec()),
            noc: inputs.noc.to_vec(),
            key_ref,
        };

        debug!(
            fabric_index = %index,
            fabric_id = verified.fabric_id.0,
            root_public_key = %entry.root_public_key.to_hex(),
            "staged pending fabric add"
        );
        self.state = LifecycleState::PendingAdd { index, entry };
        Ok(index)
    }

    /// `AddNewPendingFabricWithOperationalKeystore`: compose a pending fabric
    /// entry using a key the caller previously staged via
    /// [`crate::keystore::OperationalKeystore::allocate_pending`] (spec §4.2
    /// step 3, "WithKeystore path").
    #[instrument(skip(self, noc, icac))]
    pub async fn add_new_pending_fabric_with_keystore(
        &mut self,
        noc: &[u8],
        icac: Option<&[u8]>,
        vendor_id: VendorId,
    ) -> Result<FabricIndex> {
        if !self.keystore.has_pending_key().await {
            return Err(FabricTableError::incorrect_state(
                "no pending operational key has been allocated",
            ));
        }
        if !matches!(self.keystore.pending_tag().await, Some(PendingKeyTag::AwaitingAdd)) {
            return Err(FabricTableError::incorrect_state(
                "pending operational key is not tagged for a new fabric",
            ));
        }
        let resolved_key_public = self.keystore.pending_public_key().await?;
        self.compose_pending_add(
            AddInputs { noc, icac, vendor_id },
            resolved_key_public,
            KeyRef::Internal,
        )
        .await
    }

    /// `AddNewPendingFabricWithProvidedOpKey`: compose a pending fabric entry
    /// using a keypair the caller constructed and hands in directly
    /// (spec §4.2 step 3, "WithProvidedOpKey path").
    #[instrument(skip(self, noc, icac, public_key))]
    pub async fn add_new_pending_fabric_with_provided_op_key(
        &mut self,
        noc: &[u8],
        icac: Option<&[u8]>,
        vendor_id: VendorId,
        public_key: p256::ecdsa::VerifyingKey,
        externally_owned: bool,
    ) -> Result<FabricIndex> {
        self.keystore
            .allocate_pending_external(PendingKeyTag::AwaitingAdd, public_key)
            .await?;
        let key_ref = if externally_owned {
            KeyRef::External
        } else {
            KeyRef::Internal
        };
        self.compose_pending_add(AddInputs { noc, icac, vendor_id }, public_key, key_ref)
            .await
    }

    /// `UpdatePendingFabricWithKeystore`: stage replacement certificates for
    /// an existing committed index (spec §4.2 "Update algorithm").
    #[instrument(skip(self, noc, icac))]
    pub async fn update_pending_fabric_with_keystore(
        &mut self,
        index: FabricIndex,
        noc: &[u8],
        icac: Option<&[u8]>,
    ) -> Result<()> {
        if !matches!(self.state, LifecycleState::Idle) {
            return Err(FabricTableError::incorrect_state(
                "a pending operation is already in progress",
            ));
        }
        if !matches!(
            self.keystore.pending_tag().await,
            Some(PendingKeyTag::ExistingIndex(tag_index)) if tag_index == index
        ) {
            return Err(FabricTableError::invalid_fabric_index(
                "no pending operational key is tagged to this fabric index",
            ));
        }
        let existing = self
            .committed
            .iter()
            .find(|e| e.fabric_index == index)
            .cloned()
            .ok_or_else(|| {
                FabricTableError::invalid_fabric_index(format!("no committed fabric at index {index}"))
            })?;

        let context = self.valid_context();
        let verified = self
            .certs
            .verify_chain(noc, icac, &existing.rcac, &context)?;

        if verified.fabric_id != existing.fabric_id {
            return Err(FabricTableError::invalid_argument(
                "updated NOC's fabric id does not match the existing entry",
            ));
        }

        let resolved_key_public = self.keystore.pending_public_key().await?;
        if verified.noc_public_key != resolved_key_public {
            return Err(FabricTableError::invalid_credentials(
                "operational key public key does not match the updated NOC's subject public key",
            ));
        }

        let entry = FabricEntry {
            fabric_index: index,
            fabric_id: existing.fabric_id,
            node_id: verified.node_id,
            root_public_key: existing.root_public_key,
            vendor_id: existing.vendor_id,
            fabric_label: existing.fabric_label,
            advertise_identity: existing.advertise_identity,
            rcac: existing.rcac,
            icac: icac.map(|b| b.to_vec()),
            noc: noc.to_vec(),
            key_ref: KeyRef::Internal,
        };

        debug!(fabric_index = %index, "staged pending fabric update");
        self.state = LifecycleState::PendingUpdate { index, entry };
        Ok(())
    }

    /// `CommitPendingFabricData`: atomically persist the staged pending
    /// entry and make it visible under its final index (spec §4.2 "Commit").
    #[instrument(skip(self))]
    pub async fn commit_pending_fabric_data(&mut self) -> Result<()> {
        let (index, entry, is_update) = match &self.state {
            LifecycleState::PendingAdd { index, entry } => (*index, entry.clone(), false),
            LifecycleState::PendingUpdate { index, entry } => (*index, entry.clone(), true),
            LifecycleState::Idle | LifecycleState::PendingRootOnly { .. } => {
                return Err(FabricTableError::incorrect_state(
                    "no pending fabric to commit",
                ))
            }
        };

        let had_icac_before = if is_update {
            self.committed
                .iter()
                .find(|e| e.fabric_index == index)
                .map(|e| e.icac.is_some())
                .unwrap_or(false)
        } else {
            false
        };

        // 1. write key record, certificates, metadata (canonical order).
        let key_ref_bytes = bincode::serialize(&entry.key_ref)
            .map_err(|e| FabricTableError::internal(format!("failed to encode key ref: {e}")))?;
        self.storage.write(&storage::op_key_key(index), key_ref_bytes).await?;
        self.storage.write(&storage::rcac_key(index), entry.rcac.clone()).await?;
        if let Some(icac) = &entry.icac {
            self.storage.write(&storage::icac_key(index), icac.clone()).await?;
        }
        self.storage.write(&storage::noc_key(index), entry.noc.clone()).await?;
        let meta = FabricMetaRecord {
            vendor_id: entry.vendor_id,
            fabric_label: entry.fabric_label.clone(),
            advertise_identity: entry.advertise_identity,
            node_id: entry.node_id,
            fabric_id: entry.fabric_id,
            root_public_key: entry.root_public_key.clone(),
        };
        self.storage.write(&storage::meta_key(index), meta.encode()?).await?;

        // 2. write the commit marker before the index-list write.
        self.storage
            .write(storage::COMMIT_MARKER_KEY, vec![index.value()])
            .await?;

        #[cfg(feature = "test-utils")]
        if self.force_abort_commit_after_marker {
            return Err(FabricTableError::storage_failure(
                "forced commit abort for testing",
            ));
        }

        // 3. write the new index-membership record.
        let mut indices: Vec<FabricIndex> =
            self.committed.iter().map(|e| e.fabric_index).collect();
        if !indices.contains(&index) {
            indices.push(index);
        }
        let pinned_next = if self.pinned_next == Some(index) {
            None
        } else {
            self.pinned_next
        };
        let list = FabricIndexList { indices, pinned_next };
        self.storage.write(storage::INDEX_LIST_KEY, list.encode()?).await?;

        // 4. delete the commit marker and any now-unreferenced stale records.
        self.storage.delete(storage::COMMIT_MARKER_KEY).await?;
        if is_update && had_icac_before && entry.icac.is_none() {
            self.storage.delete(&storage::icac_key(index)).await?;
        }

        // 5. advance Last Known Good Time if warranted, then persist it.
        let mut candidates = vec![self.certs.not_before(&entry.rcac)?, self.certs.not_before(&entry.noc)?];
        if let Some(icac) = &entry.icac {
            candidates.push(self.certs.not_before(icac)?);
        }
        if let Some(min_not_before) = candidates.into_iter().min() {
            self.lkgt.advance(min_not_before);
        }
        self.lkgt.commit();
        self.lkgt.save(self.storage.as_ref()).await?;

        self.keystore.activate_pending(index).await?;

        if is_update {
            if let Some(slot) = self.committed.iter_mut().find(|e| e.fabric_index == index) {
                *slot = entry;
            }
        } else {
            self.committed.push(entry);
            self.committed.sort_by_key(|e| e.fabric_index);
        }
        self.pinned_next = pinned_next;
        self.state = LifecycleState::Idle;

        debug!(fabric_index = %index, "committed pending fabric data");
        Ok(())
    }

    /// `RevertPendingFabricData`: discard the staged pending entry (spec §4.2
    /// "Revert").
    #[instrument(skip(self))]
    pub async fn revert_pending_fabric_data(&mut self) -> Result<()> {
        if matches!(self.state, LifecycleState::Idle) {
            return Err(FabricTableError::incorrect_state(
                "no pending operation to revert",
            ));
        }
        self.keystore.revert_pending().await?;
        self.lkgt.revert();
        self.state = LifecycleState::Idle;
        debug!("reverted pending fabric data");
        Ok(())
    }

    /// `Delete`: remove a committed entry and release its key.
    ///
    /// Disallowed while a pending operation is staged against the same
    /// index, to avoid leaving a pending Add/Update dangling against a base
    /// that no longer exists (spec §9 Open Questions: underspecified in the
    /// source, resolved conservatively here).
    #[instrument(skip(self))]
    pub async fn delete(&mut self, index: FabricIndex) -> Result<()> {
        if !self.committed.iter().any(|e| e.fabric_index == index) {
            return Err(FabricTableError::invalid_fabric_index(format!(
                "no committed fabric at index {index}"
            )));
        }
        if self.state.pending_index() == Some(index) {
            return Err(FabricTableError::incorrect_state(format!(
                "fabric index {index} has a pending operation in progress"
            )));
        }

        self.committed.retain(|e| e.fabric_index != index);
        self.persist_index_list().await?;

        self.storage.delete(&storage::meta_key(index)).await?;
        self.storage.delete(&storage::rcac_key(index)).await?;
        self.storage.delete(&storage::icac_key(index)).await?;
        self.storage.delete(&storage::noc_key(index)).await?;
        self.storage.delete(&storage::op_key_key(index)).await?;
        self.keystore.remove(index).await?;

        debug!(fabric_index = %index, "deleted fabric");
        Ok(())
    }

    /// `SetLastKnownGoodChipEpochTime`: accept `t` iff it does not move the
    /// floor backwards, is not earlier than firmware build time, and is not
    /// earlier than any committed certificate's NotBefore — RCAC, ICAC (when
    /// present), and NOC alike (spec §4.6, §8).
    pub async fn set_last_known_good_time(&mut self, t: u32) -> Result<()> {
        if t < self.config.firmware_build_epoch_seconds() {
            return Err(FabricTableError::invalid_argument(
                "proposed time precedes firmware build time",
            ));
        }
        for entry in &self.committed {
            let mut not_befores = vec![
                self.certs.not_before(&entry.rcac)?,
                self.certs.not_before(&entry.noc)?,
            ];
            if let Some(icac) = &entry.icac {
                not_befores.push(self.certs.not_before(icac)?);
            }
            if let Some(&latest_not_before) = not_befores.iter().max() {
                if t < latest_not_before {
                    return Err(FabricTableError::invalid_argument(format!(
                        "proposed time precedes fabric {}'s certificate validity",
                        entry.fabric_index
                    )));
                }
            }
        }
        self.lkgt.try_set(t)?;
        self.lkgt.commit();
        self.lkgt.save(self.storage.as_ref()).await
    }

    /// Mutate the fabric label of a committed entry.
    ///
    /// Committed immediately when no pending state exists against this
    /// index (spec §3 "Mutate"); label mutation is independent of the
    /// certificate pending-state machine.
    pub async fn set_fabric_label(&mut self, index: FabricIndex, label: String) -> Result<()> {
        FabricEntry::validate_label(&label)?;
        let entry = self
            .committed
            .iter_mut()
            .find(|e| e.fabric_index == index)
            .ok_or_else(|| {
                FabricTableError::invalid_fabric_index(format!("no committed fabric at index {index}"))
            })?;
        entry.fabric_label = label.clone();
        let meta = FabricMetaRecord {
            vendor_id: entry.vendor_id,
            fabric_label: label,
            advertise_identity: entry.advertise_identity,
            node_id: entry.node_id,
            fabric_id: entry.fabric_id,
            root_public_key: entry.root_public_key.clone(),
        };
        self.storage.write(&storage::meta_key(index), meta.encode()?).await
    }

    /// Mutate the advertise-identity flag of a committed entry.
    pub async fn set_advertise_identity(&mut self, index: FabricIndex, advertise: bool) -> Result<()> {
        let entry = self
            .committed
            .iter_mut()
            .find(|e| e.fabric_index == index)
            .ok_or_else(|| {
                FabricTableError::invalid_fabric_index(format!("no committed fabric at index {index}"))
            })?;
        entry.advertise_identity = advertise;
        let meta = FabricMetaRecord {
            vendor_id: entry.vendor_id,
            fabric_label: entry.fabric_label.clone(),
            advertise_identity: advertise,
            node_id: entry.node_id,
            fabric_id: entry.fabric_id,
            root_public_key: entry.root_public_key.clone(),
        };
        self.storage.write(&storage::meta_key(index), meta.encode()?).await
    }

    /// Sign `message` with the operational keypair committed at `index`
    /// (GLOSSARY "CASE", spec §4.3).
    pub async fn sign_with_op_keypair(
        &self,
        index: FabricIndex,
        message: &[u8],
    ) -> Result<p256::ecdsa::Signature> {
        if !self.committed.iter().any(|e| e.fabric_index == index) {
            return Err(FabricTableError::invalid_fabric_index(format!(
                "no committed fabric at index {index}"
            )));
        }
        self.keystore.sign(index, message).await
    }

    /// Find the committed fabric, if any, whose destination ID matches
    /// `candidate_destination_id` under `ipk` and `initiator_random` (spec
    /// §4.3 "CASE-facing helpers"). Every committed entry is checked in
    /// constant time relative to a match/no-match outcome for that entry;
    /// the loop itself still short-circuits once found.
    pub fn find_destination_id_candidate(
        &self,
        ipk: &[u8],
        initiator_random: &[u8; 32],
        candidate_destination_id: &[u8; 32],
    ) -> Result<Option<FabricIndex>> {
        for entry in &self.committed {
            let root_public_key =
                p256::ecdsa::VerifyingKey::from_sec1_bytes(&entry.root_public_key.0).map_err(|e| {
                    FabricTableError::internal(format!(
                        "corrupt root public key for fabric {}: {e}",
                        entry.fabric_index
                    ))
                })?;
            let computed = crate::cert::compute_destination_id(
                ipk,
                initiator_random,
                &root_public_key,
                entry.fabric_id,
                entry.node_id,
            )?;
            if crate::cert::destination_id_matches(&computed, candidate_destination_id) {
                return Ok(Some(entry.fabric_index));
            }
        }
        Ok(None)
    }

    /// Allocate a short-lived keypair for CASE session ECDH, unrelated to any
    /// fabric membership (spec §4.4).
    pub async fn allocate_ephemeral_keypair_for_case(
        &self,
    ) -> Result<crate::keystore::EphemeralKeypair> {
        self.keystore.allocate_ephemeral().await
    }

    /// Release a previously allocated ephemeral CASE keypair.
    pub async fn release_ephemeral_keypair(
        &self,
        handle: crate::keystore::EphemeralKeyHandle,
    ) -> Result<()> {
        self.keystore.release_ephemeral(handle).await
    }
}

#[cfg(feature = "test-utils")]
impl FabricTable {
    /// Force the next `commit_pending_fabric_data` call to fail immediately
    /// after writing the commit marker, simulating a crash mid-commit
    /// (spec §8 scenario S6).
    pub fn set_force_abort_commit_for_test(&mut self, abort: bool) {
        self.force_abort_commit_after_marker = abort;
    }
}
