//! Operational keystore abstraction (spec §4.4).
//!
//! Keys live outside [`crate::entry::FabricEntry`] proper. The table only
//! ever holds a [`KeyRef`] tag; the actual P-256 private key material is
//! reached through the [`OperationalKeystore`] trait, which may be backed by
//! a software keystore, a hardware secure element, or (for externally-owned
//! keys) nothing the table controls at all.

use async_trait::async_trait;
use p256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identifiers::FabricIndex;

/// How the private key for a fabric's operational certificate is reached.
///
/// This replaces the raw-pointer "externally owned" aliasing hack from the
/// source implementation (spec §9) with a tagged variant whose ownership is
/// explicit at the type level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRef {
    /// The keystore generated and owns this key; it is zeroized on Delete or
    /// Revert.
    Internal,
    /// The caller constructed the keypair and handed in only a reference;
    /// the table must not attempt to destroy the key material.
    External,
}

/// Where a pending (not-yet-committed) operational key is tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKeyTag {
    /// Tagged to an existing committed index (the Update path).
    ExistingIndex(FabricIndex),
    /// Tagged "awaiting the next Add" (no index exists yet).
    AwaitingAdd,
}

/// A certificate signing request produced by [`OperationalKeystore::allocate_pending`].
#[derive(Debug, Clone)]
pub struct CertificateSigningRequest {
    /// DER-encoded PKCS#10 CSR bytes.
    pub csr_der: Vec<u8>,
    /// The public key the CSR attests to; the caller cross-checks this
    /// against the NOC's subject public key before accepting the CSR
    /// (spec §4.3: "never trust just the chain").
    pub public_key: VerifyingKey,
}

/// Operational keystore contract consumed by the fabric table (spec §4.4, §6).
///
/// All methods that accept a `FabricIndex` must validate it against the
/// table's notion of committed/pending state before delegating; the
/// keystore itself only tracks "does a key exist for this tag", not fabric
/// membership.
#[async_trait]
pub trait OperationalKeystore: Send + Sync {
    /// Whether a pending key is currently staged (at most one at a time,
    /// mirroring [`crate::lifecycle`]'s single-pending-operation invariant).
    async fn has_pending_key(&self) -> bool;

    /// The tag the currently staged pending key was allocated under, if any.
    async fn pending_tag(&self) -> Option<PendingKeyTag>;

    /// The public key of the currently staged pending key, if any. Used by
    /// the Add/Update algorithms to cross-check the NOC's subject public key
    /// against the key actually backing it (spec §4.3: "never trust just the
    /// chain").
    async fn pending_public_key(&self) -> Result<VerifyingKey>;

    /// Generate a fresh P-256 keypair and return a CSR over its public key,
    /// tagging the pending key to `tag`.
    async fn allocate_pending(&self, tag: PendingKeyTag) -> Result<CertificateSigningRequest>;

    /// Register an externally-owned keypair's public key as the pending key
    /// for `tag`, without the keystore taking ownership of private material.
    async fn allocate_pending_external(
        &self,
        tag: PendingKeyTag,
        public_key: VerifyingKey,
    ) -> Result<()>;

    /// Promote the pending key into its final slot at `index`. Called only
    /// from [`crate::lifecycle`]'s Commit path.
    async fn activate_pending(&self, index: FabricIndex) -> Result<()>;

    /// Erase the pending key, wherever it was tagged. Called only from
    /// Revert.
    async fn revert_pending(&self) -> Result<()>;

    /// Sign `message` with the key committed at `index`.
    ///
    /// Must refuse with [`crate::error::FabricTableError::IncorrectState`] if
    /// the key at `index` is still pending (not yet activated).
    async fn sign(&self, index: FabricIndex, message: &[u8]) -> Result<Signature>;

    /// Fetch the public key committed at `index`, for cross-checking against
    /// a NOC's subject public key.
    async fn public_key(&self, index: FabricIndex) -> Result<VerifyingKey>;

    /// Remove and zeroize (if internally owned) the key at `index`.
    async fn remove(&self, index: FabricIndex) -> Result<()>;

    /// Generate a short-lived keypair unrelated to any fabric, used only for
    /// CASE session ECDH. Must work even with zero fabrics and no pending
    /// state.
    async fn allocate_ephemeral(&self) -> Result<EphemeralKeypair>;

    /// Destroy a previously allocated ephemeral keypair.
    async fn release_ephemeral(&self, handle: EphemeralKeyHandle) -> Result<()>;
}

/// Opaque handle to an ephemeral CASE keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EphemeralKeyHandle(pub u64);

/// A short-lived P-256 keypair for CASE session ECDH.
#[derive(Debug, Clone)]
pub struct EphemeralKeypair {
    /// Handle used to release this keypair later.
    pub handle: EphemeralKeyHandle,
    /// The public half, sent to the peer.
    pub public_key: VerifyingKey,
}
