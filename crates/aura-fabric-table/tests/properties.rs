//! Quantified properties and boundary cases from spec §8, beyond the named
//! scenarios in `scenarios.rs`.

mod common;

use assert_matches::assert_matches;
use aura_fabric_table::keystore::OperationalKeystore;
use aura_fabric_table::storage::FabricStorage as _;
use aura_fabric_table::testutil::{MemoryStorage, TestCertificateAuthority, TestKeystore};
use aura_fabric_table::{FabricIndex, FabricTable, FabricTableConfig, FabricTableError, VendorId};
use p256::ecdsa::SigningKey;

use common::{add_and_commit_fabric, fresh_harness, reopen, stage_root_and_noc, NOT_AFTER, NOT_BEFORE};

fn idx(v: u8) -> FabricIndex {
    FabricIndex::new(v).unwrap()
}

async fn dump(storage: &aura_fabric_table::testutil::MemoryStorage) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    for key in storage.key_snapshot() {
        let value = storage.read(&key).await.unwrap().unwrap();
        out.push((key, value));
    }
    out
}

/// Add followed by Revert leaves storage byte-for-byte identical to before
/// the Add began, even with a pre-existing committed fabric in the table.
#[tokio::test]
async fn add_then_revert_is_storage_no_op_with_existing_fabric() {
    let mut harness = fresh_harness().await;
    let root_a = SigningKey::random(&mut rand_core::OsRng);
    add_and_commit_fabric(&mut harness, &root_a, 1, 1).await;

    let before = dump(&harness.storage).await;

    let root_b = SigningKey::random(&mut rand_core::OsRng);
    let (_, noc_b) = stage_root_and_noc(&mut harness, &root_b, 2, 2).await;
    harness
        .table
        .add_new_pending_fabric_with_keystore(&noc_b, None, VendorId(1))
        .await
        .unwrap();
    harness.table.revert_pending_fabric_data().await.unwrap();

    let after = dump(&harness.storage).await;
    assert_eq!(before, after);
}

/// `SetLastKnownGoodChipEpochTime` boundary behavior: rejects anything before
/// firmware build time, rejects anything before a committed cert's
/// `NotBefore`, and accepts exactly the firmware build time itself.
#[tokio::test]
async fn set_last_known_good_time_boundaries() {
    // A firmware build time older than the fabric's own certificate validity
    // window, so the cert's NotBefore floor and the firmware floor are
    // genuinely distinct checks.
    let firmware_build = NOT_BEFORE - 10_000;
    let storage = std::sync::Arc::new(MemoryStorage::new());
    let keystore = std::sync::Arc::new(TestKeystore::new());
    let mut table = FabricTable::init(
        Box::new(std::sync::Arc::clone(&storage)),
        Box::new(std::sync::Arc::clone(&keystore)),
        Box::new(TestCertificateAuthority),
        FabricTableConfig {
            firmware_build_epoch_seconds: firmware_build,
        },
        None,
    )
    .await
    .unwrap();

    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let rcac = TestCertificateAuthority::issue_root(&root_key, 1, NOT_BEFORE, NOT_AFTER);
    table.add_new_pending_trusted_root_cert(rcac).unwrap();
    let csr = keystore
        .allocate_pending(aura_fabric_table::keystore::PendingKeyTag::AwaitingAdd)
        .await
        .unwrap();
    let noc = TestCertificateAuthority::issue_noc(
        &root_key,
        &csr.public_key,
        1,
        1,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );
    table
        .add_new_pending_fabric_with_keystore(&noc, None, VendorId(1))
        .await
        .unwrap();
    table.commit_pending_fabric_data().await.unwrap();

    // Committing already advanced LKGT to the certificate's NotBefore, since
    // that exceeds the (deliberately older) firmware build time.
    assert_eq!(table.get_last_known_good_time(), NOT_BEFORE);

    let err = table
        .set_last_known_good_time(firmware_build - 1)
        .await
        .unwrap_err();
    assert_matches!(err, FabricTableError::InvalidArgument { .. });

    let err = table.set_last_known_good_time(NOT_BEFORE - 1).await.unwrap_err();
    assert_matches!(err, FabricTableError::InvalidArgument { .. });

    table.set_last_known_good_time(NOT_BEFORE).await.unwrap();
    assert_eq!(table.get_last_known_good_time(), NOT_BEFORE);

    table.set_last_known_good_time(NOT_BEFORE + 5_000).await.unwrap();
    assert_eq!(table.get_last_known_good_time(), NOT_BEFORE + 5_000);
}

/// Deleting a committed fabric frees its index for reuse by the next Add.
#[tokio::test]
async fn delete_frees_index_for_reuse() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let index = add_and_commit_fabric(&mut harness, &root_key, 1, 1).await;
    assert_eq!(index, idx(1));
    assert_eq!(harness.table.peek_fabric_index_for_next_addition().unwrap(), idx(2));

    harness.table.delete(index).await.unwrap();
    assert_eq!(harness.table.fabric_count(), 0);
    assert_eq!(harness.table.peek_fabric_index_for_next_addition().unwrap(), idx(1));
}

/// A fabric committed, then recovered via a fresh `init` against the same
/// storage, has every field equal to what was committed.
#[tokio::test]
async fn round_trip_through_reinit_preserves_fields() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let index = add_and_commit_fabric(&mut harness, &root_key, 11, 22).await;
    let before = harness.table.find_fabric_with_index(index).unwrap();

    let fresh_keystore = std::sync::Arc::new(aura_fabric_table::testutil::TestKeystore::new());
    let table2 = reopen(harness.storage.clone(), fresh_keystore).await;
    let after = table2.find_fabric_with_index(index).unwrap();

    assert_eq!(before.fabric_index, after.fabric_index);
    assert_eq!(before.fabric_id, after.fabric_id);
    assert_eq!(before.node_id, after.node_id);
    assert_eq!(before.root_public_key, after.root_public_key);
    assert_eq!(before.vendor_id, after.vendor_id);
    assert_eq!(before.fabric_label, after.fabric_label);
    assert_eq!(before.advertise_identity, after.advertise_identity);
    assert!(!after.is_pending);
}

/// Toggling `advertise_identity` twice returns it to its original value.
#[tokio::test]
async fn advertise_identity_double_toggle_is_identity() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let index = add_and_commit_fabric(&mut harness, &root_key, 1, 1).await;
    let original = harness.table.find_fabric_with_index(index).unwrap().advertise_identity;

    harness.table.set_advertise_identity(index, !original).await.unwrap();
    assert_eq!(
        harness.table.find_fabric_with_index(index).unwrap().advertise_identity,
        !original
    );

    harness.table.set_advertise_identity(index, original).await.unwrap();
    assert_eq!(
        harness.table.find_fabric_with_index(index).unwrap().advertise_identity,
        original
    );
}

/// The fabric label is last-writer-wins and survives a restart.
#[tokio::test]
async fn fabric_label_survives_restart() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let index = add_and_commit_fabric(&mut harness, &root_key, 1, 1).await;

    harness.table.set_fabric_label(index, "kitchen".into()).await.unwrap();
    harness.table.set_fabric_label(index, "living room".into()).await.unwrap();

    let fresh_keystore = std::sync::Arc::new(aura_fabric_table::testutil::TestKeystore::new());
    let table2 = reopen(harness.storage.clone(), fresh_keystore).await;
    assert_eq!(
        table2.find_fabric_with_index(index).unwrap().fabric_label,
        "living room"
    );
}

/// Starting a second pending operation while one is already in flight fails
/// with `IncorrectState` rather than silently replacing it.
#[tokio::test]
async fn two_pending_operations_without_resolution_is_incorrect_state() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let rcac = TestCertificateAuthority::issue_root(&root_key, 1, NOT_BEFORE, NOT_AFTER);

    harness
        .table
        .add_new_pending_trusted_root_cert(rcac.clone())
        .unwrap();
    let err = harness
        .table
        .add_new_pending_trusted_root_cert(rcac)
        .unwrap_err();
    assert_matches!(err, FabricTableError::IncorrectState { .. });
}

/// Updating a committed fabric with a NOC carrying a different `FabricId`
/// than the entry being updated is rejected. The chain-validation step
/// catches this before the lifecycle's own fabric id cross-check ever runs,
/// since a NOC's fabric id must already agree with its RCAC to pass chain
/// verification at all.
#[tokio::test]
async fn update_with_mismatched_fabric_id_is_rejected() {
    let mut harness = fresh_harness().await;
    let root_key = SigningKey::random(&mut rand_core::OsRng);
    let index = add_and_commit_fabric(&mut harness, &root_key, 1, 1).await;

    harness
        .keystore
        .allocate_pending(aura_fabric_table::keystore::PendingKeyTag::ExistingIndex(index))
        .await
        .unwrap();
    let new_public_key = harness.keystore.pending_public_key().await.unwrap();
    let mismatched_noc = TestCertificateAuthority::issue_noc(
        &root_key,
        &new_public_key,
        2, // different fabric id than the committed entry's 1
        1,
        vec![],
        NOT_BEFORE,
        NOT_AFTER,
    );

    let err = harness
        .table
        .update_pending_fabric_with_keystore(index, &mismatched_noc, None)
        .await
        .unwrap_err();
    assert_matches!(err, FabricTableError::InvalidCredentials { .. });
}
