//! Literal scenarios from spec §8.

mod common;

use assert_matches::assert_matches;
use aura_fabric_table::keystore::{OperationalKeystore, PendingKeyTag};
use aura_fabric_table::testutil::TestCertificateAuthority;
use aura_fabric_table::{FabricIndex, FabricTableError, VendorId};
use p256::ecdsa::SigningKey;

use common::{fabric, fresh_harness, node, reopen, stage_root_and_noc, NOT_AFTER, NOT_BEFORE};

fn idx(v: u8) -> FabricIndex {
    FabricIndex::new(v).unwrap()
}

/// S1: a fresh Add (with an ICAC in the chain) followed by Commit leaves
/// exactly one fabric, advances the allocation cursor, and persists exactly
/// seven records (key, rcac, icac, noc, meta, index list, LKGT).
#[tokio::test]
async fn s1_fresh_add_with_icac_then_commit() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let icac_key = SigningKey::random(&mut rand_core::OsRng);

    let rcac = TestCertificateAuthority::issue_root(&root_key, 1, NOT_BEFORE, NOT_AFTER);
    harness
        .table
        .add_new_pending_trusted_root_cert(rcac)
        .unwrap();
    let icac = TestCertificateAuthority::issue_icac(
        &root_key,
        icac_key.verifying_key(),
        1,
        NOT_BEFORE,
        NOT_AFTER,
    );
    let csr = harness
        .keystore
        .allocate_pending(PendingKeyTag::AwaitingAdd)
        .await
        .unwrap();
    let noc = TestCertificateAuthority::issue_noc(
        &icac_key,
        &csr.public_key,
        1,
        42,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );

    let index = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc, Some(&icac), VendorId(0xFFF1))
        .await
        .unwrap();
    assert_eq!(index, idx(1));

    harness.table.commit_pending_fabric_data().await.unwrap();

    assert_eq!(harness.table.fabric_count(), 1);
    assert_eq!(harness.table.peek_fabric_index_for_next_addition().unwrap(), idx(2));
    assert_eq!(harness.storage.key_snapshot().len(), 7);
}

/// S2: adding a second fabric with the same `(RootPublicKey, FabricId)` as an
/// already-committed one is rejected unless colliding fabrics are permitted.
#[tokio::test]
async fn s2_colliding_fabric_rejected() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);

    let (rcac, noc1) = stage_root_and_noc(&mut harness, &root_key, 7, 1).await;
    harness
        .table
        .add_new_pending_fabric_with_keystore(&noc1, None, VendorId(1))
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();

    harness
        .table
        .add_new_pending_trusted_root_cert(rcac)
        .unwrap();
    let csr = harness
        .keystore
        .allocate_pending(PendingKeyTag::AwaitingAdd)
        .await
        .unwrap();
    let noc2 = TestCertificateAuthority::issue_noc(
        &root_key,
        &csr.public_key,
        7,
        2,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );
    let err = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc2, None, VendorId(1))
        .await
        .unwrap_err();
    assert_matches!(err, FabricTableError::FabricExists { .. });
}

/// S3: with colliding fabrics explicitly permitted, two entries under the
/// same root and fabric id coexist and are disambiguated by `FindIdentity`.
#[tokio::test]
async fn s3_permit_colliding_disambiguated_by_node_id() {
    let mut harness = fresh_harness().await;
    harness.table.permit_colliding_fabrics();
    let root_key = SigningKey::random(&mut rand_core::OsRng);

    let (rcac, noc1) = stage_root_and_noc(&mut harness, &root_key, 7, 1).await;
    let index1 = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc1, None, VendorId(1))
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();

    harness
        .table
        .add_new_pending_trusted_root_cert(rcac)
        .unwrap();
    let csr = harness
        .keystore
        .allocate_pending(PendingKeyTag::AwaitingAdd)
        .await
        .unwrap();
    let noc2 = TestCertificateAuthority::issue_noc(
        &root_key,
        &csr.public_key,
        7,
        2,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );
    let index2 = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc2, None, VendorId(1))
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();

    assert_eq!(harness.table.fabric_count(), 2);
    let root_pubkey = harness.table.fetch_root_pubkey(index1).unwrap();
    let found1 = harness
        .table
        .find_identity(&root_pubkey, fabric(7), node(1))
        .unwrap();
    let found2 = harness
        .table
        .find_identity(&root_pubkey, fabric(7), node(2))
        .unwrap();
    assert_eq!(found1.fabric_index, index1);
    assert_eq!(found2.fabric_index, index2);
}

/// S4: Add without Commit, then Revert, restores the table to its pre-Add
/// state — no storage records were ever written, and the next-allocation
/// cursor returns to its original value.
#[tokio::test]
async fn s4_add_then_revert_restores_prior_state() {
    let mut harness = fresh_harness().await;
    let before_keys = harness.storage.key_snapshot();
    let before_peek = harness.table.peek_fabric_index_for_next_addition().unwrap();
    assert_eq!(before_peek, idx(1));

    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let (_, noc) = stage_root_and_noc(&mut harness, &root_key, 1, 1).await;
    let index = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc, None, VendorId(1))
        .await
        .unwrap();
    assert_eq!(index, idx(1));
    assert_eq!(harness.table.peek_fabric_index_for_next_addition().unwrap(), idx(2));

    harness.table.revert_pending_fabric_data().await.unwrap();

    assert_eq!(harness.table.fabric_count(), 0);
    assert_eq!(harness.table.peek_fabric_index_for_next_addition().unwrap(), before_peek);
    assert_eq!(harness.storage.key_snapshot(), before_keys);
}

/// S5: Update with a new NodeId and no ICAC, then Commit. Signing succeeds
/// under the new operational key and the old key is no longer the one on
/// record.
#[tokio::test]
async fn s5_update_new_node_id_then_commit_rotates_signing_key() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);

    let (_rcac, noc) = stage_root_and_noc(&mut harness, &root_key, 1, 10).await;
    let index = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc, None, VendorId(1))
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();
    let old_public_key = harness.keystore.public_key(index).await.unwrap();

    harness
        .keystore
        .allocate_pending(PendingKeyTag::ExistingIndex(index))
        .await
        .unwrap();
    let new_public_key = harness.keystore.pending_public_key().await.unwrap();
    let new_noc = TestCertificateAuthority::issue_noc(
        &root_key,
        &new_public_key,
        1,
        99,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );

    harness
        .table
        .update_pending_fabric_with_keystore(index, &new_noc, None)
        .await
        .unwrap();
    harness.table.commit_pending_fabric_data().await.unwrap();

    let rotated_public_key = harness.keystore.public_key(index).await.unwrap();
    assert_ne!(rotated_public_key, old_public_key);
    assert_eq!(rotated_public_key, new_public_key);

    let message = b"case-sigma2";
    let signature = harness.table.sign_with_op_keypair(index, message).await.unwrap();
    use p256::ecdsa::signature::Verifier;
    assert!(rotated_public_key.verify(message, &signature).is_ok());
    assert!(old_public_key.verify(message, &signature).is_err());
}

/// S6: a forced crash right after the commit marker is written rolls back on
/// the next `init`; `GetDeletedFabricFromCommitMarker` fires exactly once,
/// and `ClearCommitMarker` leaves no orphaned records.
#[tokio::test]
async fn s6_forced_commit_abort_rolls_back_on_reinit() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let (_, noc) = stage_root_and_noc(&mut harness, &root_key, 1, 1).await;
    let index = harness
        .table
        .add_new_pending_fabric_with_keystore(&noc, None, VendorId(1))
        .await
        .unwrap();

    harness.table.set_force_abort_commit_for_test(true);
    let err = harness.table.commit_pending_fabric_data().await.unwrap_err();
    assert_matches!(err, FabricTableError::StorageFailure { .. });

    // Simulate a reboot: fresh keystore, same storage.
    let fresh_keystore = std::sync::Arc::new(aura_fabric_table::testutil::TestKeystore::new());
    let mut table2 = reopen(harness.storage.clone(), fresh_keystore).await;

    assert_eq!(table2.fabric_count(), 0);
    assert_eq!(table2.get_deleted_fabric_from_commit_marker(), Some(index));
    assert_eq!(table2.get_deleted_fabric_from_commit_marker(), None);

    table2.clear_commit_marker().await.unwrap();

    let remaining = harness.storage.key_snapshot();
    assert!(remaining.iter().all(|k| !k.starts_with(&format!("fabric/{}/", index.value()))));
    assert!(!remaining.iter().any(|k| k == "fabric/commit_marker"));
}
