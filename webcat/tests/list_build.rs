// SPDX-License-Identifier: MIT

//! End-to-end replay: the list builder's verification and replay logic
//! run over leaves and transparency records produced by the real FSM
//! driver, checking that the log alone reproduces the authoritative list.

mod common;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use webcat::{
    api::{self, ApiState},
    builder::{apply_action, encode_list, verify_entry, ListRecord, ListTable, TransparencyEntry},
    config::ConfirmationMode,
    db::TransparencyRecord,
    fsm::SubmissionState,
    sigsum::Hash,
};

use common::{
    expire_wait, get_submission, ingest, instance, sigstore_headers, Instance, GITHUB_SIGNER,
};

/// Drive one submission to completion under the instance's current
/// headers.
async fn complete(instance: &Instance, domain: &str) {
    let uid = ingest(&instance.db, domain).await;
    instance.driver.advance(&uid).await.unwrap();
    expire_wait(&instance.db, &uid).await;
    instance.driver.advance(&uid).await.unwrap();
    assert_eq!(
        get_submission(&instance.db, &uid).await.status,
        SubmissionState::Completed,
        "{domain} should complete"
    );
}

/// Fetch a leaf's transparency record the way the builder does: by the
/// leaf checksum, through the data server endpoint.
async fn fetch_entry(instance: &Instance, checksum: &Hash) -> TransparencyEntry {
    let state = ApiState {
        db: instance.db.clone(),
    };
    let (status, body) = api::transparency(State(state), Path(checksum.to_hex())).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(body.0).unwrap()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn replaying_the_log_reproduces_the_list() {
    let headers = sigstore_headers(GITHUB_SIGNER, "1", "add");
    let instance = instance(ConfirmationMode::Recheck, headers).await;

    complete(&instance, "a.test").await;
    complete(&instance, "b.test").await;
    instance
        .prober
        .set_headers(sigstore_headers(GITHUB_SIGNER, "1", "delete"));
    complete(&instance, "a.test").await;

    // Replay every leaf the way the builder does.
    let leaves = instance.log.leaves();
    assert_eq!(leaves.len(), 3);
    let submit_key = instance.keypair.public();
    let mut table = ListTable::new();
    for leaf in &leaves {
        assert_eq!(leaf.key_hash, submit_key.key_hash());
        let entry = fetch_entry(&instance, &leaf.checksum).await;
        let payload = verify_entry(leaf, &entry, &submit_key).unwrap();
        apply_action(&mut table, &payload).unwrap();
    }

    // Only b.test survives the add/add/delete stream.
    assert_eq!(table.len(), 1);
    let output = encode_list(&table).unwrap();
    assert_eq!(output.len(), 64);
    assert_eq!(&output[..32], Hash::of(b"b.test").as_bytes());

    // The replayed table matches the authoritative list the driver built.
    let mut conn = instance.db.acquire().await.unwrap();
    let authoritative: Vec<(String, String, i64)> =
        sqlx::query_as("SELECT domain, signers, threshold FROM list_entries ORDER BY domain")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
    assert_eq!(authoritative.len(), 1);
    let authoritative_table: ListTable = authoritative
        .into_iter()
        .map(|(domain, signers, threshold)| (domain, ListRecord { signers, threshold }))
        .collect();
    assert_eq!(table, authoritative_table);

    // Re-encoding is byte-stable.
    assert_eq!(output, encode_list(&authoritative_table).unwrap());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn tampered_data_server_response_fails_verification() {
    let headers = sigstore_headers(GITHUB_SIGNER, "1", "add");
    let instance = instance(ConfirmationMode::Recheck, headers).await;
    complete(&instance, "a.test").await;

    let leaves = instance.log.leaves();
    let leaf = &leaves[0];
    let entry = fetch_entry(&instance, &leaf.checksum).await;
    let submit_key = instance.keypair.public();

    // The untampered entry verifies.
    verify_entry(leaf, &entry, &submit_key).unwrap();

    // A payload swap is caught by the hash check.
    let mut tampered = entry.clone();
    tampered.payload = tampered.payload.replace("a.test", "evil.test");
    assert!(verify_entry(leaf, &tampered, &submit_key).is_err());

    // A hash swap is caught by the leaf binding even if it matches the
    // payload.
    let mut tampered = entry.clone();
    tampered.payload = tampered.payload.replace("a.test", "evil.test");
    tampered.hash = Hash::of(tampered.payload.as_bytes()).to_hex();
    assert!(verify_entry(leaf, &tampered, &submit_key).is_err());

    // A signature swap is caught by the signature equality check.
    let mut tampered = entry;
    tampered.signature = hex::encode([0_u8; 64]);
    assert!(verify_entry(leaf, &tampered, &submit_key).is_err());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn transparency_records_resolve_by_both_hashes() {
    let headers = sigstore_headers(GITHUB_SIGNER, "1", "add");
    let instance = instance(ConfirmationMode::Recheck, headers).await;
    complete(&instance, "a.test").await;

    let leaf = instance.log.leaves()[0];
    let mut conn = instance.db.acquire().await.unwrap();
    let by_checksum = TransparencyRecord::get_by_hash(&mut conn, &leaf.checksum.to_hex())
        .await
        .unwrap()
        .expect("lookup by leaf checksum");
    let by_hash = TransparencyRecord::get_by_hash(&mut conn, &by_checksum.hash)
        .await
        .unwrap()
        .expect("lookup by payload hash");
    assert_eq!(by_checksum.id, by_hash.id);

    // The stored hashes are consistent with the leaf.
    let message = Hash::from_hex(&by_hash.hash).unwrap();
    assert_eq!(Hash::of(message.as_bytes()), leaf.checksum);
    assert_eq!(by_hash.leaf_hash, leaf.checksum.to_hex());
}
