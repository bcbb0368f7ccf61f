//! Deterministic test doubles for [`crate::storage::FabricStorage`],
//! [`crate::keystore::OperationalKeystore`], and [`crate::cert::CertificateParser`].
//!
//! None of this module implements real X.509; certificates here are a small
//! self-describing bincode record, self-signed for roots and chained via
//! plain ECDSA signatures otherwise. It exists to let tests exercise the
//! lifecycle state machine's actual rules (time windows, key cross-checks,
//! chain linkage) without pulling in an ASN.1 stack.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::cert::{CertificateParser, ValidContext, VerifiedChain};
use crate::error::{FabricTableError, Result};
use crate::identifiers::{CatValues, FabricId, FabricIndex, NodeId};
use crate::keystore::{
    CertificateSigningRequest, EphemeralKeyHandle, EphemeralKeypair, KeyRef, OperationalKeystore,
    PendingKeyTag,
};
use crate::storage::FabricStorage;

/// In-memory [`FabricStorage`] backed by a `HashMap`, for fast single-process
/// tests (no filesystem, no async runtime I/O).
#[derive(Default)]
pub struct MemoryStorage {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key currently present, for assertions about record
    /// counts (spec §8 scenario S1: "exactly 7 records for a single fabric").
    pub fn key_snapshot(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl FabricStorage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.records.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }

    async fn num_keys(&self) -> Result<usize> {
        Ok(self.records.lock().unwrap().len())
    }
}

#[async_trait]
impl FabricStorage for std::sync::Arc<MemoryStorage> {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.as_ref().read(key).await
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.as_ref().write(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.as_ref().delete(key).await
    }

    async fn num_keys(&self) -> Result<usize> {
        self.as_ref().num_keys().await
    }
}

struct StagedKey {
    tag: PendingKeyTag,
    signing_key: Option<SigningKey>,
    public_key: VerifyingKey,
}

struct ActiveKey {
    signing_key: Option<SigningKey>,
    public_key: VerifyingKey,
}

/// In-memory [`OperationalKeystore`] test double.
///
/// Generates real P-256 keypairs for internally-owned keys so `sign` round
/// trips through genuine ECDSA; externally-provided public keys are recorded
/// without private material, matching the production contract that the
/// table never touches external key bytes directly.
#[derive(Default)]
pub struct TestKeystore {
    pending: Mutex<Option<StagedKey>>,
    active: Mutex<HashMap<FabricIndex, ActiveKey>>,
    next_ephemeral: Mutex<u64>,
}

impl TestKeystore {
    /// Construct an empty keystore.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OperationalKeystore for TestKeystore {
    async fn has_pending_key(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }

    async fn pending_tag(&self) -> Option<PendingKeyTag> {
        self.pending.lock().unwrap().as_ref().map(|k| k.tag)
    }

    async fn pending_public_key(&self) -> Result<VerifyingKey> {
        self.pending
            .lock()
            .unwrap()
            .as_ref()
            .map(|k| k.public_key)
            .ok_or_else(|| FabricTableError::incorrect_state("no pending operational key"))
    }

    async fn allocate_pending(&self, tag: PendingKeyTag) -> Result<CertificateSigningRequest> {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let public_key = *signing_key.verifying_key();
        let csr_der = public_key.to_encoded_point(false).as_bytes().to_vec();
        *self.pending.lock().unwrap() = Some(StagedKey {
            tag,
            signing_key: Some(signing_key),
            public_key,
        });
        Ok(CertificateSigningRequest { csr_der, public_key })
    }

    async fn allocate_pending_external(
        &self,
        tag: PendingKeyTag,
        public_key: VerifyingKey,
    ) -> Result<()> {
        *self.pending.lock().unwrap() = Some(StagedKey {
            tag,
            signing_key: None,
            public_key,
        });
        Ok(())
    }

    async fn activate_pending(&self, index: FabricIndex) -> Result<()> {
        let staged = self
            .pending
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| FabricTableError::incorrect_state("no pending operational key"))?;
        self.active.lock().unwrap().insert(
            index,
            ActiveKey {
                signing_key: staged.signing_key,
                public_key: staged.public_key,
            },
        );
        Ok(())
    }

    async fn revert_pending(&self) -> Result<()> {
        *self.pending.lock().unwrap() = None;
        Ok(())
    }

    async fn sign(&self, index: FabricIndex, message: &[u8]) -> Result<Signature> {
        let active = self.active.lock().unwrap();
        let key = active
            .get(&index)
            .ok_or_else(|| FabricTableError::key_not_found(format!("no active key at index {index}")))?;
        let signing_key = key
            .signing_key
            .as_ref()
            .ok_or_else(|| FabricTableError::key_not_found("key is externally owned, cannot sign locally"))?;
        Ok(signing_key.sign(message))
    }

    async fn public_key(&self, index: FabricIndex) -> Result<VerifyingKey> {
        self.active
            .lock()
            .unwrap()
            .get(&index)
            .map(|k| k.public_key)
            .ok_or_else(|| FabricTableError::key_not_found(format!("no active key at index {index}")))
    }

    async fn remove(&self, index: FabricIndex) -> Result<()> {
        self.active.lock().unwrap().remove(&index);
        Ok(())
    }

    async fn allocate_ephemeral(&self) -> Result<EphemeralKeypair> {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let public_key = *signing_key.verifying_key();
        let mut next = self.next_ephemeral.lock().unwrap();
        let handle = EphemeralKeyHandle(*next);
        *next += 1;
        Ok(EphemeralKeypair { handle, public_key })
    }

    async fn release_ephemeral(&self, _handle: EphemeralKeyHandle) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl OperationalKeystore for std::sync::Arc<TestKeystore> {
    async fn has_pending_key(&self) -> bool {
        self.as_ref().has_pending_key().await
    }

    async fn pending_tag(&self) -> Option<PendingKeyTag> {
        self.as_ref().pending_tag().await
    }

    async fn pending_public_key(&self) -> Result<VerifyingKey> {
        self.as_ref().pending_public_key().await
    }

    async fn allocate_pending(&self, tag: PendingKeyTag) -> Result<CertificateSigningRequest> {
        self.as_ref().allocate_pending(tag).await
    }

    async fn allocate_pending_external(
        &self,
        tag: PendingKeyTag,
        public_key: VerifyingKey,
    ) -> Result<()> {
        self.as_ref().allocate_pending_external(tag, public_key).await
    }

    async fn activate_pending(&self, index: FabricIndex) -> Result<()> {
        self.as_ref().activate_pending(index).await
    }

    async fn revert_pending(&self) -> Result<()> {
        self.as_ref().revert_pending().await
    }

    async fn sign(&self, index: FabricIndex, message: &[u8]) -> Result<Signature> {
        self.as_ref().sign(index, message).await
    }

    async fn public_key(&self, index: FabricIndex) -> Result<VerifyingKey> {
        self.as_ref().public_key(index).await
    }

    async fn remove(&self, index: FabricIndex) -> Result<()> {
        self.as_ref().remove(index).await
    }

    async fn allocate_ephemeral(&self) -> Result<EphemeralKeypair> {
        self.as_ref().allocate_ephemeral().await
    }

    async fn release_ephemeral(&self, handle: EphemeralKeyHandle) -> Result<()> {
        self.as_ref().release_ephemeral(handle).await
    }
}

/// What role a [`TestCertificateAuthority`]-issued certificate plays in a
/// chain. Recorded in the body so `verify_chain` can tell a root from a leaf
/// without guessing from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CertRole {
    Root,
    Intermediate,
    Noc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CertBody {
    role: CertRole,
    subject_public_key: Vec<u8>,
    issuer_public_key: Vec<u8>,
    not_before: u32,
    not_after: u32,
    fabric_id: u64,
    node_id: u64,
    cats: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedCert {
    body: CertBody,
    signature: Vec<u8>,
}

impl SignedCert {
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("test certificate always encodes")
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| FabricTableError::invalid_credentials(format!("malformed test certificate: {e}")))
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.body.subject_public_key)
            .map_err(|e| FabricTableError::invalid_credentials(format!("bad subject key: {e}")))
    }

    fn issuer_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.body.issuer_public_key)
            .map_err(|e| FabricTableError::invalid_credentials(format!("bad issuer key: {e}")))
    }

    fn check_signature(&self) -> Result<()> {
        let issuer = self.issuer_key()?;
        let body_bytes = bincode::serialize(&self.body)
            .map_err(|e| FabricTableError::internal(format!("failed to re-encode cert body: {e}")))?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|e| FabricTableError::invalid_credentials(format!("malformed signature: {e}")))?;
        issuer
            .verify(&body_bytes, &signature)
            .map_err(|_| FabricTableError::invalid_credentials("certificate signature does not verify"))
    }

    fn check_time_window(&self, effective_time: u32) -> Result<()> {
        if effective_time < self.body.not_before || effective_time > self.body.not_after {
            return Err(FabricTableError::invalid_credentials(format!(
                "certificate not valid at time {effective_time} (window {}..{})",
                self.body.not_before, self.body.not_after
            )));
        }
        Ok(())
    }
}

/// A minimal self-signed-root certificate authority used only by tests.
pub struct TestCertificateAuthority;

impl TestCertificateAuthority {
    fn sign_body(signing_key: &SigningKey, body: &CertBody) -> Vec<u8> {
        let body_bytes = bincode::serialize(body).expect("test cert body always encodes");
        let signature: Signature = signing_key.sign(&body_bytes);
        signature.to_vec()
    }

    /// Issue a self-signed root certificate.
    pub fn issue_root(
        root_signing_key: &SigningKey,
        fabric_id: u64,
        not_before: u32,
        not_after: u32,
    ) -> Vec<u8> {
        let subject_public_key = root_signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let body = CertBody {
            role: CertRole::Root,
            subject_public_key: subject_public_key.clone(),
            issuer_public_key: subject_public_key,
            not_before,
            not_after,
            fabric_id,
            node_id: 0,
            cats: Vec::new(),
        };
        let signature = Self::sign_body(root_signing_key, &body);
        SignedCert { body, signature }.encode()
    }

    /// Issue an intermediate certificate under `root_signing_key`.
    pub fn issue_icac(
        root_signing_key: &SigningKey,
        icac_public_key: &VerifyingKey,
        fabric_id: u64,
        not_before: u32,
        not_after: u32,
    ) -> Vec<u8> {
        let issuer_public_key = root_signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let body = CertBody {
            role: CertRole::Intermediate,
            subject_public_key: icac_public_key.to_encoded_point(false).as_bytes().to_vec(),
            issuer_public_key,
            not_before,
            not_after,
            fabric_id,
            node_id: 0,
            cats: Vec::new(),
        };
        let signature = Self::sign_body(root_signing_key, &body);
        SignedCert { body, signature }.encode()
    }

    /// Issue a node operational certificate under `issuer_signing_key` (the
    /// root when no ICAC is used, otherwise the intermediate).
    pub fn issue_noc(
        issuer_signing_key: &SigningKey,
        noc_public_key: &VerifyingKey,
        fabric_id: u64,
        node_id: u64,
        cats: Vec<u32>,
        not_before: u32,
        not_after: u32,
    ) -> Vec<u8> {
        let issuer_public_key = issuer_signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let body = CertBody {
            role: CertRole::Noc,
            subject_public_key: noc_public_key.to_encoded_point(false).as_bytes().to_vec(),
            issuer_public_key,
            not_before,
            not_after,
            fabric_id,
            node_id,
            cats,
        };
        let signature = Self::sign_body(issuer_signing_key, &body);
        SignedCert { body, signature }.encode()
    }
}

impl CertificateParser for TestCertificateAuthority {
    fn extract_node_and_fabric_id(&self, noc: &[u8]) -> Result<(NodeId, FabricId)> {
        let cert = SignedCert::decode(noc)?;
        Ok((NodeId(cert.body.node_id), FabricId(cert.body.fabric_id)))
    }

    fn extract_public_key(&self, cert: &[u8]) -> Result<VerifyingKey> {
        SignedCert::decode(cert)?.verifying_key()
    }

    fn extract_cats(&self, noc: &[u8]) -> Result<CatValues> {
        let cert = SignedCert::decode(noc)?;
        CatValues::new(cert.body.cats)
    }

    fn not_before(&self, cert: &[u8]) -> Result<u32> {
        Ok(SignedCert::decode(cert)?.body.not_before)
    }

    fn verify_chain(
        &self,
        noc: &[u8],
        icac: Option<&[u8]>,
        rcac: &[u8],
        context: &ValidContext,
    ) -> Result<VerifiedChain> {
        let root = SignedCert::decode(rcac)?;
        if root.body.role != CertRole::Root {
            return Err(FabricTableError::invalid_credentials("RCAC is not a root certificate"));
        }
        root.check_signature()?;
        root.check_time_window(context.effective_time_epoch_s)?;

        let noc_issuer_public_key = match icac {
            Some(icac_bytes) => {
                let intermediate = SignedCert::decode(icac_bytes)?;
                if intermediate.body.role != CertRole::Intermediate {
                    return Err(FabricTableError::invalid_credentials(
                        "ICAC is not an intermediate certificate",
                    ));
                }
                if intermediate.body.issuer_public_key != root.body.subject_public_key {
                    return Err(FabricTableError::invalid_credentials(
                        "ICAC was not issued by this RCAC",
                    ));
                }
                if intermediate.body.fabric_id != root.body.fabric_id {
                    return Err(FabricTableError::invalid_credentials(
                        "ICAC fabric id does not match RCAC",
                    ));
                }
                intermediate.check_signature()?;
                intermediate.check_time_window(context.effective_time_epoch_s)?;
                intermediate.body.subject_public_key
            }
            None => root.body.subject_public_key.clone(),
        };

        let leaf = SignedCert::decode(noc)?;
        if leaf.body.role != CertRole::Noc {
            return Err(FabricTableError::invalid_credentials("NOC is not a leaf certificate"));
        }
        if leaf.body.issuer_public_key != noc_issuer_public_key {
            return Err(FabricTableError::invalid_credentials(
                "NOC was not issued by the expected intermediate/root",
            ));
        }
        if leaf.body.fabric_id != root.body.fabric_id {
            return Err(FabricTableError::invalid_credentials(
                "NOC fabric id does not match RCAC",
            ));
        }
        leaf.check_signature()?;
        leaf.check_time_window(context.effective_time_epoch_s)?;

        Ok(VerifiedChain {
            node_id: NodeId(leaf.body.node_id),
            fabric_id: FabricId(leaf.body.fabric_id),
            noc_public_key: leaf.verifying_key()?,
            root_public_key: root.verifying_key()?,
        })
    }
}

/// Fix an externally-owned key reference for assertions in tests that care
/// about [`KeyRef`] without going through a full Add flow.
pub fn external_key_ref() -> KeyRef {
    KeyRef::External
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_round_trips_with_icac() {
        let root_key = SigningKey::random(&mut rand_core::OsRng);
        let icac_key = SigningKey::random(&mut rand_core::OsRng);
        let noc_key = SigningKey::random(&mut rand_core::OsRng);

        let rcac = TestCertificateAuthority::issue_root(&root_key, 1, 0, 1_000_000);
        let icac = TestCertificateAuthority::issue_icac(
            &root_key,
            icac_key.verifying_key(),
            1,
            0,
            1_000_000,
        );
        let noc = TestCertificateAuthority::issue_noc(
            &icac_key,
            noc_key.verifying_key(),
            1,
            42,
            vec![],
            0,
            1_000_000,
        );

        let parser = TestCertificateAuthority;
        let context = ValidContext {
            effective_time_epoch_s: 500,
            required_usage: Default::default(),
        };
        let verified = parser.verify_chain(&noc, Some(&icac), &rcac, &context).unwrap();
        assert_eq!(verified.node_id, NodeId(42));
        assert_eq!(verified.fabric_id, FabricId(1));
    }

    #[test]
    fn chain_rejects_expired_noc() {
        let root_key = SigningKey::random(&mut rand_core::OsRng);
        let noc_key = SigningKey::random(&mut rand_core::OsRng);

        let rcac = TestCertificateAuthority::issue_root(&root_key, 1, 0, 1_000_000);
        let noc = TestCertificateAuthority::issue_noc(&root_key, noc_key.verifying_key(), 1, 42, vec![], 0, 100);

        let parser = TestCertificateAuthority;
        let context = ValidContext {
            effective_time_epoch_s: 500,
            required_usage: Default::default(),
        };
        assert!(parser.verify_chain(&noc, None, &rcac, &context).is_err());
    }

    #[tokio::test]
    async fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.read("k").await.unwrap(), None);
        storage.write("k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), Some(vec![1, 2, 3]));
        storage.delete("k").await.unwrap();
        assert_eq!(storage.read("k").await.unwrap(), None);
    }
}
