//! Validation round scenarios, driven end to end through the facade.

use crate::mock_infrastructure::TestCluster;
use std::time::Duration;
use stratus_core::store::{EphemeralStore, PersistentStore};
use stratus_core::types::{NodeType, ValidateResults, ValidationStatus};
use stratus_core::CoreError;

fn results(round_id: u64, device_id: &str, cids: &[&str], random_count: u32) -> ValidateResults {
    ValidateResults {
        round_id,
        device_id: device_id.to_string(),
        validator_id: String::new(),
        cids: cids.iter().map(|c| (*c).to_string()).collect(),
        random_count,
        bandwidth: 512.0,
        cost_time: 120,
        is_cancel: false,
        is_timeout: false,
    }
}

async fn elect(cluster: &TestCluster, validators: &[&str]) {
    cluster
        .ephemeral
        .set_validators(
            &validators.iter().map(|v| (*v).to_string()).collect::<Vec<_>>(),
            Duration::from_secs(600),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn single_validator_receives_one_batch_with_both_edges() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.register_and_connect("e2", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    cluster.seed_blocks("e2", &[(1, "CIDB")], 4).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(7).await.unwrap();

    let validator = cluster.transport_of("c1");
    assert_eq!(validator.validate_batch_count(), 1);
    let urls = validator.batch_urls(0);
    assert_eq!(
        urls,
        vec![TestCluster::addr_of("e1"), TestCluster::addr_of("e2")]
    );
    assert_eq!(cluster.ephemeral.verifying_count().await.unwrap(), 2);
}

#[tokio::test]
async fn self_assigned_candidate_is_dropped_not_reassigned() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("c2", NodeType::Candidate).await;
    cluster.seed_blocks("c1", &[(1, "CIDA")], 4).await;
    cluster.seed_blocks("c2", &[(1, "CIDB")], 4).await;
    elect(&cluster, &["c1", "c2"]).await;

    // Seed 3 draws validator index 1 for both candidates: c1 goes to c2,
    // c2 draws itself and is silently dropped.
    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(3).await.unwrap();

    let c2 = cluster.transport_of("c2");
    assert_eq!(c2.validate_batch_count(), 1);
    assert_eq!(c2.batch_urls(0), vec![TestCluster::addr_of("c1")]);
    assert_eq!(cluster.transport_of("c1").validate_batch_count(), 0);
    assert_eq!(cluster.ephemeral.verifying_count().await.unwrap(), 1);
}

#[tokio::test]
async fn successful_scoring_through_facade() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    // Seed 42 with max_fid 10 draws fids 5 then 7.
    cluster.seed_blocks("e1", &[(5, "CIDA"), (7, "CIDB")], 10).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(42).await.unwrap();
    let round = engine.current_round();

    cluster
        .scheduler
        .validate_block_result("c1", results(round, "e1", &["CIDA", "CIDB"], 2))
        .await
        .unwrap();

    let row = cluster.persistent.validation_result(round, "e1").await.unwrap();
    assert_eq!(row.status, ValidationStatus::Success);
    assert_eq!(row.validator_id, "c1");
    assert_eq!(row.block_count, 2);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn mismatched_cid_fails_with_diagnostic() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(5, "CIDA"), (7, "CIDB")], 10).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(42).await.unwrap();
    let round = engine.current_round();

    cluster
        .scheduler
        .validate_block_result("c1", results(round, "e1", &["CIDA", "CIDX"], 2))
        .await
        .unwrap();

    let row = cluster.persistent.validation_result(round, "e1").await.unwrap();
    assert_eq!(row.status, ValidationStatus::Fail);
    assert!(row.msg.contains("resultCid=CIDX,cid_db=CIDB,fid=7,index=1"), "msg: {}", row.msg);
}

#[tokio::test]
async fn missing_result_times_out_at_next_preflight() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(11).await.unwrap();
    let first_round = engine.current_round();
    assert_eq!(cluster.ephemeral.verifying_count().await.unwrap(), 1);

    // No result arrives; the next preflight settles the device as timeout
    // and the new round proceeds independently.
    engine.run_round_with_seed(12).await.unwrap();
    let row = cluster.persistent.validation_result(first_round, "e1").await.unwrap();
    assert_eq!(row.status, ValidationStatus::Timeout);
    assert_eq!(row.msg, "time out");

    let second = cluster
        .persistent
        .validation_result(engine.current_round(), "e1")
        .await
        .unwrap();
    assert_eq!(second.status, ValidationStatus::Created);
}

#[tokio::test]
async fn stale_round_results_are_rejected() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(5).await.unwrap();

    let err = cluster
        .scheduler
        .validate_block_result("c1", results(999, "e1", &["CIDA"], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::RoundMismatch { .. }));
}

#[tokio::test]
async fn unregistered_validator_cannot_report() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(5).await.unwrap();
    let round = engine.current_round();

    let err = cluster
        .scheduler
        .validate_block_result("ghost", results(round, "e1", &["CIDA"], 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownDevice(_)));
}

#[tokio::test]
async fn cancelled_audit_is_recorded_as_cancelled() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    elect(&cluster, &["c1"]).await;

    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(5).await.unwrap();
    let round = engine.current_round();

    let mut res = results(round, "e1", &[], 0);
    res.is_cancel = true;
    cluster.scheduler.validate_block_result("c1", res).await.unwrap();

    let row = cluster.persistent.validation_result(round, "e1").await.unwrap();
    assert_eq!(row.status, ValidationStatus::Cancelled);
}

#[tokio::test]
async fn disabled_engine_skips_rounds_entirely() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 4).await;
    elect(&cluster, &["c1"]).await;

    cluster.scheduler.validate_switch(false);
    let engine = cluster.scheduler.validation();
    engine.run_round_with_seed(5).await.unwrap();

    assert_eq!(cluster.transport_of("c1").validate_batch_count(), 0);
    assert!(!engine.is_running());
}
