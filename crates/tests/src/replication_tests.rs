//! Replication scenarios through the facade.

use crate::mock_infrastructure::TestCluster;
use chrono::{Duration as ChronoDuration, Utc};
use stratus_core::config::AppConfig;
use stratus_core::store::PersistentStore;
use stratus_core::types::{
    carfile_hash, CacheCarfileInfo, CacheResultInfo, NodeType, RecordStatus, ReplicaStatus,
};

fn edge_only_cluster() -> TestCluster {
    let mut config = AppConfig::default();
    config.replication.candidate_replicas = 0;
    TestCluster::with_config(config)
}

fn request(cid: &str, need: u32) -> CacheCarfileInfo {
    CacheCarfileInfo {
        carfile_cid: cid.to_string(),
        need_reliability: need,
        expired_time: Utc::now() + ChronoDuration::hours(1),
        device_id: None,
    }
}

fn success(hash: &str) -> CacheResultInfo {
    CacheResultInfo {
        carfile_hash: hash.to_string(),
        status: ReplicaStatus::Succeeded,
        msg: String::new(),
        done_size: 4096,
        done_blocks: 16,
        total_block_count: 16,
        carfile_size: 4096,
        disk_usage: 12.5,
    }
}

fn failure(hash: &str) -> CacheResultInfo {
    CacheResultInfo {
        carfile_hash: hash.to_string(),
        status: ReplicaStatus::Failed,
        msg: "fetch failed".into(),
        done_size: 0,
        done_blocks: 0,
        total_block_count: 0,
        carfile_size: 0,
        disk_usage: 12.5,
    }
}

#[tokio::test]
async fn replicate_to_three_then_node_quit_restores() {
    let cluster = edge_only_cluster();
    for node in ["n1", "n2", "n3", "n4"] {
        cluster.register_and_connect(node, NodeType::Edge).await;
    }
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 3)).await.unwrap();
    cluster.drain_replication().await;

    // Deficit 3 over four free edges: the three lowest ids are dispatched.
    for node in ["n1", "n2", "n3"] {
        assert_eq!(
            cluster.persistent.replica(&hash, node).await.unwrap().status,
            ReplicaStatus::Running
        );
        assert_eq!(cluster.transport_of(node).cache_instructions.lock().len(), 1);
    }

    for node in ["n1", "n2", "n3"] {
        cluster.scheduler.cache_result(node, success(&hash)).await.unwrap();
    }
    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.cur_reliability, 3);

    // n2 quits: reliability drops and the record re-enters running.
    cluster.scheduler.node_quit(&["n2".to_string()]).await.unwrap();
    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.status, RecordStatus::Running);
    assert_eq!(record.cur_reliability, 2);
    assert!(cluster.persistent.replica(&hash, "n2").await.is_err());

    // The manager selects n4; its success restores the target.
    cluster.drain_replication().await;
    assert_eq!(
        cluster.persistent.replica(&hash, "n4").await.unwrap().status,
        ReplicaStatus::Running
    );
    cluster.scheduler.cache_result("n4", success(&hash)).await.unwrap();
    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.cur_reliability, 3);
}

#[tokio::test]
async fn node_quit_is_idempotent() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;
    cluster.register_and_connect("n2", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.drain_replication().await;
    cluster.scheduler.cache_result("n1", success(&hash)).await.unwrap();

    cluster.scheduler.node_quit(&["n1".to_string()]).await.unwrap();
    cluster.scheduler.node_quit(&["n1".to_string()]).await.unwrap();

    assert!(cluster.persistent.replicas_on_device("n1").await.unwrap().is_empty());
}

#[tokio::test]
async fn double_cache_request_keeps_single_record() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.drain_replication().await;

    assert_eq!(cluster.persistent.replicas_of(&hash).await.unwrap().len(), 1);
    let (records, total) = cluster.persistent.carfile_records(1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn double_remove_equals_single_remove() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.drain_replication().await;
    cluster.scheduler.cache_result("n1", success(&hash)).await.unwrap();

    cluster.scheduler.remove_carfile("cid-a").await.unwrap();
    cluster.scheduler.remove_carfile("cid-a").await.unwrap();

    // The holder was told to delete exactly once per removal pass.
    assert_eq!(cluster.transport_of("n1").removed_cids.lock().len(), 1);
    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.status, RecordStatus::Removed);
}

#[tokio::test]
async fn failed_edge_is_replaced_within_budget() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;
    cluster.register_and_connect("n2", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.drain_replication().await;

    cluster.scheduler.cache_result("n1", failure(&hash)).await.unwrap();
    cluster.drain_replication().await;

    assert_eq!(
        cluster.persistent.replica(&hash, "n1").await.unwrap().status,
        ReplicaStatus::Failed
    );
    assert_eq!(
        cluster.persistent.replica(&hash, "n2").await.unwrap().status,
        ReplicaStatus::Running
    );

    cluster.scheduler.cache_result("n2", success(&hash)).await.unwrap();
    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.cur_reliability, 1);
}

#[tokio::test]
async fn edges_pull_from_the_root_candidate() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 2)).await.unwrap();
    cluster.drain_replication().await;

    // Only the candidate is dispatched until it holds content.
    assert!(cluster.persistent.replica(&hash, "e1").await.is_err());
    let c1_instr = cluster.transport_of("c1").cache_instructions.lock()[0].clone();
    assert!(c1_instr.sources.is_empty(), "candidates seed from the content network");

    cluster.scheduler.cache_result("c1", success(&hash)).await.unwrap();
    cluster.drain_replication().await;

    let e1_instr = cluster.transport_of("e1").cache_instructions.lock()[0].clone();
    assert_eq!(e1_instr.sources.len(), 1);
    assert_eq!(e1_instr.sources[0].device_id, "c1");
    assert!(e1_instr.sources[0].url.contains(&TestCluster::addr_of("c1")));
}

#[tokio::test]
async fn expired_time_reset_does_not_touch_replicas() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster.scheduler.cache_carfile(request("cid-a", 1)).await.unwrap();
    cluster.drain_replication().await;

    let later = Utc::now() + ChronoDuration::days(7);
    cluster.scheduler.reset_expired_time("cid-a", later).await.unwrap();

    let record = cluster.persistent.carfile_record(&hash).await.unwrap();
    assert_eq!(record.expired_time, later);
    assert_eq!(
        cluster.persistent.replica(&hash, "n1").await.unwrap().status,
        ReplicaStatus::Running
    );
}

#[tokio::test]
async fn undone_records_listing_and_reexecution() {
    let cluster = edge_only_cluster();
    cluster.register_and_connect("n1", NodeType::Edge).await;

    cluster.scheduler.cache_carfile(request("cid-a", 2)).await.unwrap();
    cluster.drain_replication().await;

    let page = cluster.scheduler.undone_records(1).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].carfile_cid, "cid-a");

    let enqueued = cluster.scheduler.execute_undone_task().await.unwrap();
    assert_eq!(enqueued, 1);
}
