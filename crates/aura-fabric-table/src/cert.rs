//! Certificate validation and identity extraction (spec §4.3).
//!
//! The certificate parser itself is a black-box external collaborator: the
//! fabric table only depends on the [`CertificateParser`] trait, never on a
//! concrete ASN.1/X.509 implementation. A deterministic test double lives in
//! [`crate::testutil`].

use hmac::{Hmac, Mac};
use p256::ecdsa::VerifyingKey;
use sha2::Sha256;

use crate::error::{FabricTableError, Result};
use crate::identifiers::{CatValues, FabricId, NodeId};

/// Key-usage / extended-key-usage flags a chain must carry for operational
/// certificates (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredUsage {
    /// `KeyUsage` must include `digitalSignature`.
    pub digital_signature: bool,
    /// `ExtendedKeyUsage` must include `serverAuth`.
    pub server_auth: bool,
}

impl Default for RequiredUsage {
    fn default() -> Self {
        Self {
            digital_signature: true,
            server_auth: true,
        }
    }
}

/// Context under which a certificate chain is validated.
#[derive(Debug, Clone, Copy)]
pub struct ValidContext {
    /// Effective time used for NotBefore/NotAfter checks: `max(LastKnownGoodTime, firmwareBuildTime)`.
    pub effective_time_epoch_s: u32,
    /// Usage flags the leaf certificate must satisfy.
    pub required_usage: RequiredUsage,
}

/// Identity fields recovered from a verified chain.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    /// Node identifier extracted from the NOC subject.
    pub node_id: NodeId,
    /// Fabric identifier extracted from the NOC subject.
    pub fabric_id: FabricId,
    /// The NOC's subject public key (the operational public key).
    pub noc_public_key: VerifyingKey,
    /// The RCAC's public key (the fabric's root public key).
    pub root_public_key: VerifyingKey,
}

/// Black-box certificate parser / chain verifier (spec §4.3, §6).
///
/// Implementations are expected to be pure and side-effect free; the fabric
/// table never retries a parse call, so a transient failure must be surfaced
/// as [`FabricTableError::InvalidCredentials`] / [`FabricTableError::InvalidArgument`], not silently
/// swallowed.
pub trait CertificateParser: Send + Sync {
    /// Extract `(NodeId, FabricId)` from a NOC without validating its chain.
    fn extract_node_and_fabric_id(&self, noc: &[u8]) -> Result<(NodeId, FabricId)>;

    /// Extract the P-256 public key embedded in a certificate (RCAC or NOC).
    fn extract_public_key(&self, cert: &[u8]) -> Result<VerifyingKey>;

    /// Extract the CATs embedded in a NOC's subject, if any.
    fn extract_cats(&self, noc: &[u8]) -> Result<CatValues>;

    /// Extract the earliest `NotBefore` among the certificates named, used to
    /// advance Last Known Good Time on commit.
    fn not_before(&self, cert: &[u8]) -> Result<u32>;

    /// Verify `noc` chains to `rcac` (through `icac` when present) and
    /// satisfies `context`. Returns the identity extracted from the
    /// now-trusted chain.
    fn verify_chain(
        &self,
        noc: &[u8],
        icac: Option<&[u8]>,
        rcac: &[u8],
        context: &ValidContext,
    ) -> Result<VerifiedChain>;
}

/// Compute the canonical destination identifier (spec §4.3, GLOSSARY "IPK").
///
/// `HMAC-SHA256(key = ipk, message = initiator_random || root_public_key ||
/// fabric_id || node_id)`, matching the construction the CASE protocol uses
/// both to generate outgoing destination IDs and to match incoming ones
/// against every candidate committed fabric.
pub fn compute_destination_id(
    ipk: &[u8],
    initiator_random: &[u8; 32],
    root_public_key: &VerifyingKey,
    fabric_id: FabricId,
    node_id: NodeId,
) -> Result<[u8; 32]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(ipk)
        .map_err(|e| FabricTableError::invalid_argument(format!("bad IPK length: {e}")))?;
    mac.update(initiator_random);
    mac.update(&root_public_key.to_encoded_point(false).as_bytes()[1..]);
    mac.update(&fabric_id.0.to_be_bytes());
    mac.update(&node_id.0.to_be_bytes());
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Verify that a computed destination ID matches `candidate_destination_id`
/// in constant time.
pub fn destination_id_matches(computed: &[u8; 32], candidate: &[u8; 32]) -> bool {
    use subtle::ConstantTimeEq;
    computed.ct_eq(candidate).into()
}
