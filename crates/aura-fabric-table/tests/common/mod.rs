//! Shared harness for the scenario integration tests (spec §8).

use std::sync::Arc;

use aura_fabric_table::keystore::{OperationalKeystore, PendingKeyTag};
use aura_fabric_table::testutil::{MemoryStorage, TestCertificateAuthority, TestKeystore};
use aura_fabric_table::{FabricId, FabricIndex, FabricTable, FabricTableConfig, NodeId, VendorId};
use p256::ecdsa::SigningKey;

pub const FIRMWARE_BUILD_EPOCH_S: u32 = 1_650_000_000;
pub const NOT_BEFORE: u32 = 1_600_000_000;
pub const NOT_AFTER: u32 = 2_000_000_000;

/// A table wired to test doubles the caller keeps handles to, so assertions
/// can inspect storage contents and mint certificates against the same
/// keystore the table delegates to.
pub struct Harness {
    pub table: FabricTable,
    pub storage: Arc<MemoryStorage>,
    pub keystore: Arc<TestKeystore>,
}

pub async fn fresh_harness() -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let keystore = Arc::new(TestKeystore::new());
    let table = FabricTable::init(
        Box::new(Arc::clone(&storage)),
        Box::new(Arc::clone(&keystore)),
        Box::new(TestCertificateAuthority),
        FabricTableConfig {
            firmware_build_epoch_seconds: FIRMWARE_BUILD_EPOCH_S,
        },
        None,
    )
    .await
    .unwrap();
    Harness {
        table,
        storage,
        keystore,
    }
}

/// Reopen a table against `storage`'s existing records with a fresh
/// keystore, simulating a reboot (spec §4.5 recovery).
pub async fn reopen(storage: Arc<MemoryStorage>, keystore: Arc<TestKeystore>) -> FabricTable {
    FabricTable::init(
        Box::new(storage),
        Box::new(keystore),
        Box::new(TestCertificateAuthority),
        FabricTableConfig {
            firmware_build_epoch_seconds: FIRMWARE_BUILD_EPOCH_S,
        },
        None,
    )
    .await
    .unwrap()
}

/// Stage a fresh root certificate and mint a NOC against the keystore's
/// pending key, the way a commissioner would off-board a CSR to a CA and
/// hand back a signed NOC (spec §4.2, §4.4).
pub async fn stage_root_and_noc(
    harness: &mut Harness,
    root_signing_key: &SigningKey,
    fabric_id: u64,
    node_id: u64,
) -> (Vec<u8>, Vec<u8>) {
    let rcac = TestCertificateAuthority::issue_root(root_signing_key, fabric_id, NOT_BEFORE, NOT_AFTER);
    harness
        .table
        .add_new_pending_trusted_root_cert(rcac.clone())
        .unwrap();
    let csr = harness
        .keystore
        .allocate_pending(PendingKeyTag::AwaitingAdd)
        .await
        .unwrap();
    let noc = TestCertificateAuthority::issue_noc(
        root_signing_key,
        &csr.public_key,
        fabric_id,
        node_id,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );
    (rcac, noc)
}

/// Add and commit a single fabric end to end, returning its index.
pub async fn add_and_commit_fabric(
    harness: &mut Harness,
    root_signing_key: &SigningKey,
    fabric_id: u64,
    node_id: u64,
) -> FabricIndex {
    let (_, noc) = stage_root_and_noc(harness, root_signing_key, fabric_id, node_id).await;
    let index = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc, None, VendorId(0xFFF1))
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();
    index
}

pub fn fabric(id: u64) -> FabricId {
    FabricId(id)
}

pub fn node(id: u64) -> NodeId {
    NodeId(id)
}
