//! Identifier newtypes used across the fabric table (spec §3, GLOSSARY).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FabricTableError, Result};

/// Small positive integer naming a fabric entry in this node.
///
/// Index `0` is reserved as "undefined" and is never assigned to a
/// committed or pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FabricIndex(u8);

impl FabricIndex {
    /// The reserved "no fabric" sentinel value.
    pub const UNDEFINED: FabricIndex = FabricIndex(0);
    /// Smallest valid (non-reserved) index.
    pub const MIN: FabricIndex = FabricIndex(1);
    /// Largest index the table will allocate.
    pub const MAX: FabricIndex = FabricIndex(u8::MAX);

    /// Construct a `FabricIndex`, rejecting the reserved value `0`.
    pub fn new(value: u8) -> Result<Self> {
        if value == 0 {
            return Err(FabricTableError::invalid_argument(
                "fabric index 0 is reserved for \"undefined\"",
            ));
        }
        Ok(Self(value))
    }

    /// Whether this is the reserved "undefined" index.
    pub fn is_undefined(&self) -> bool {
        self.0 == 0
    }

    /// Raw integer value.
    pub fn value(&self) -> u8 {
        self.0
    }

    pub(crate) fn next(&self) -> Option<FabricIndex> {
        self.0.checked_add(1).map(FabricIndex)
    }
}

impl Default for FabricIndex {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit fabric identifier extracted from the NOC subject.
///
/// Not necessarily unique across the table on its own; uniqueness is
/// enforced jointly with [`RootPublicKeyBytes`] unless colliding fabrics are
/// explicitly permitted (invariant I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FabricId(pub u64);

/// 64-bit node identifier extracted from the NOC subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// 16-bit administrative vendor tag supplied by the caller at Add time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorId(pub u16);

/// Raw encoded P-256 point bytes for a fabric's root public key.
///
/// Kept as raw bytes (rather than a `p256::PublicKey`) at the identifier
/// layer so `FabricEntry` stays trivially `Eq`/`Hash`/`Serialize`; callers
/// that need curve operations convert via [`crate::cert::decode_public_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootPublicKeyBytes(pub Vec<u8>);

impl RootPublicKeyBytes {
    /// Uncompressed SEC1 P-256 points are 65 bytes.
    pub const ENCODED_LEN: usize = 65;

    /// Lowercase hex encoding, for log fields (never logged at `info` or
    /// above — root keys are not secret, but a noisy default is still bad
    /// practice).
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// CASE Authenticated Tags extracted from a NOC, at most three per the
/// Matter specification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatValues {
    values: Vec<u32>,
}

impl CatValues {
    /// Maximum number of CATs a single NOC may carry.
    pub const MAX_CATS: usize = 3;

    /// Build a `CatValues` from at most [`Self::MAX_CATS`] tags.
    pub fn new(values: Vec<u32>) -> Result<Self> {
        if values.len() > Self::MAX_CATS {
            return Err(FabricTableError::invalid_argument(format!(
                "NOC carries {} CATs, at most {} are permitted",
                values.len(),
                Self::MAX_CATS
            )));
        }
        Ok(Self { values })
    }

    /// The empty set of CATs.
    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    /// Iterate over the tags.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.iter().copied()
    }

    /// Whether a given tag (ignoring its version nibble) is present.
    pub fn contains(&self, tag: u32) -> bool {
        self.values.contains(&tag)
    }

    /// Number of CATs present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no CATs are present.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
