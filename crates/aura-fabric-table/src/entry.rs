//! The fabric entry data model (spec §3, §4.1).

use serde::{Deserialize, Serialize};

use crate::error::{FabricTableError, Result};
use crate::identifiers::{FabricId, FabricIndex, NodeId, RootPublicKeyBytes, VendorId};
use crate::keystore::KeyRef;

/// Maximum length, in bytes, of a [`FabricEntry::fabric_label`].
pub const MAX_FABRIC_LABEL_BYTES: usize = 32;

/// The persisted record of a single fabric membership (spec §3).
///
/// `FabricEntry` owns no cryptographic private key material directly — only
/// a [`KeyRef`] tag describing how the keystore reaches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricEntry {
    /// Unique, stable index for this entry within the table.
    pub fabric_index: FabricIndex,
    /// Fabric identifier extracted from the NOC subject (invariant I2).
    pub fabric_id: FabricId,
    /// Node identifier extracted from the NOC subject (invariant I2).
    pub node_id: NodeId,
    /// Root public key extracted from the RCAC (invariant I3).
    pub root_public_key: RootPublicKeyBytes,
    /// Administrative tag supplied by the caller at Add time.
    pub vendor_id: VendorId,
    /// Mutable human-readable label, empty by default.
    pub fabric_label: String,
    /// Whether this fabric is visible to identity-advertising mechanisms.
    pub advertise_identity: bool,
    /// Root certificate bytes.
    pub rcac: Vec<u8>,
    /// Intermediate certificate bytes, if the chain uses one.
    pub icac: Option<Vec<u8>>,
    /// Node operational certificate bytes.
    pub noc: Vec<u8>,
    /// How the operational private key for this fabric is reached.
    pub key_ref: KeyRef,
}

impl FabricEntry {
    /// Validate the fabric label length invariant (spec §3 "≤32 bytes").
    pub fn validate_label(label: &str) -> Result<()> {
        if label.len() > MAX_FABRIC_LABEL_BYTES {
            return Err(FabricTableError::invalid_argument(format!(
                "fabric label is {} bytes, exceeds the {} byte limit",
                label.len(),
                MAX_FABRIC_LABEL_BYTES
            )));
        }
        Ok(())
    }

    /// The `(RootPublicKey, FabricId)` identity tuple used by invariant I4
    /// and by [`crate::table::FabricTable::find_fabric`].
    pub fn identity_key(&self) -> (&RootPublicKeyBytes, FabricId) {
        (&self.root_public_key, self.fabric_id)
    }
}

/// A lightweight, owned snapshot of a fabric entry returned to callers.
///
/// Per spec §9, iteration and lookup return owned views rather than raw
/// pointers into the mutable table, so the borrow checker — not caller
/// discipline — prevents use-after-mutation. A `FabricEntryView` is valid
/// forever; it simply stops reflecting the table's current state the moment
/// the table mutates.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricEntryView {
    /// Unique, stable index for this entry within the table.
    pub fabric_index: FabricIndex,
    /// Fabric identifier extracted from the NOC subject.
    pub fabric_id: FabricId,
    /// Node identifier extracted from the NOC subject.
    pub node_id: NodeId,
    /// Root public key extracted from the RCAC.
    pub root_public_key: RootPublicKeyBytes,
    /// Administrative tag supplied by the caller at Add time.
    pub vendor_id: VendorId,
    /// Mutable human-readable label.
    pub fabric_label: String,
    /// Whether this fabric is visible to identity-advertising mechanisms.
    pub advertise_identity: bool,
    /// Whether this entry is a pending add/update shadowing committed state.
    pub is_pending: bool,
}

impl From<&FabricEntry> for FabricEntryView {
    fn from(entry: &FabricEntry) -> Self {
        Self {
            fabric_index: entry.fabric_index,
            fabric_id: entry.fabric_id,
            node_id: entry.node_id,
            root_public_key: entry.root_public_key.clone(),
            vendor_id: entry.vendor_id,
            fabric_label: entry.fabric_label.clone(),
            advertise_identity: entry.advertise_identity,
            is_pending: false,
        }
    }
}
