//! Node lifecycle, auth, and download scenarios.

use crate::mock_infrastructure::TestCluster;
use chrono::{Duration as ChronoDuration, Utc};
use stratus_core::auth::Permission;
use stratus_core::store::PersistentStore;
use stratus_core::types::{carfile_hash, CacheCarfileInfo, CacheResultInfo, NodeType, ReplicaStatus};
use stratus_core::CoreError;

#[tokio::test]
async fn reconnect_keeps_a_single_session() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;
    // Second connect replaces the session.
    cluster
        .scheduler
        .node_connect("e1", NodeType::Edge, &TestCluster::addr_of("e1"), String::new())
        .await
        .unwrap();

    assert_eq!(cluster.scheduler.online_devices(NodeType::Edge), vec!["e1".to_string()]);
}

#[tokio::test]
async fn connect_with_wrong_type_is_rejected_without_state_change() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;
    let err = cluster
        .scheduler
        .node_connect("e1", NodeType::Candidate, &TestCluster::addr_of("e1"), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TypeMismatch { .. }));
    // The original edge session survives.
    assert_eq!(cluster.scheduler.online_devices(NodeType::Edge), vec!["e1".to_string()]);
    assert!(cluster.scheduler.online_devices(NodeType::Candidate).is_empty());
}

#[tokio::test]
async fn startup_reset_is_scoped_to_this_scheduler() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;

    // A row owned by a peer scheduler must survive our startup reset.
    let mut foreign = cluster.persistent.node("e1").await.unwrap();
    foreign.device_id = "peer-node".into();
    foreign.server_name = "sched-other".into();
    cluster.persistent.upsert_node(&foreign).await.unwrap();

    cluster.scheduler.startup().await.unwrap();
    assert!(!cluster.persistent.node("e1").await.unwrap().is_online);
    assert!(cluster.persistent.node("peer-node").await.unwrap().is_online);
}

#[tokio::test]
async fn node_token_flow_end_to_end() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;
    let secret = cluster.persistent.registration("e1").await.unwrap().secret;

    let token = cluster
        .scheduler
        .auth_node_new(&[Permission::Write], "e1", &secret)
        .await
        .unwrap();
    let perms = cluster.scheduler.auth_verify(&token, Some("e1")).await.unwrap();
    assert_eq!(perms, vec![Permission::Write]);

    // A different device context invalidates the token.
    cluster.register_and_connect("e2", NodeType::Edge).await;
    assert!(cluster.scheduler.auth_verify(&token, Some("e2")).await.is_err());
}

#[tokio::test]
async fn download_infos_cover_online_successful_holders() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster
        .scheduler
        .cache_carfile(CacheCarfileInfo {
            carfile_cid: "cid-a".into(),
            need_reliability: 2,
            expired_time: Utc::now() + ChronoDuration::hours(1),
            device_id: None,
        })
        .await
        .unwrap();
    cluster.drain_replication().await;
    let result = CacheResultInfo {
        carfile_hash: hash.clone(),
        status: ReplicaStatus::Succeeded,
        msg: String::new(),
        done_size: 64,
        done_blocks: 2,
        total_block_count: 2,
        carfile_size: 64,
        disk_usage: 3.0,
    };
    cluster.scheduler.cache_result("c1", result.clone()).await.unwrap();
    cluster.drain_replication().await;
    cluster.scheduler.cache_result("e1", result).await.unwrap();

    let infos = cluster.scheduler.download_infos("cid-a", "user-pk").await.unwrap();
    assert_eq!(infos.len(), 2);
    let devices: Vec<&str> = infos.iter().map(|i| i.device_id.as_str()).collect();
    assert!(devices.contains(&"c1"));
    assert!(devices.contains(&"e1"));
    // Edges carry more weight than candidates for user downloads.
    let edge = infos.iter().find(|i| i.device_id == "e1").unwrap();
    let candidate = infos.iter().find(|i| i.device_id == "c1").unwrap();
    assert!(edge.weight > candidate.weight);
    assert!(infos.iter().all(|i| !i.signature.is_empty()));

    // The holder going offline drops it from subsequent instructions.
    cluster.scheduler.node_disconnect("e1").await.unwrap();
    let infos = cluster.scheduler.download_infos("cid-a", "user-pk").await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].device_id, "c1");
}

#[tokio::test]
async fn devices_info_reflects_counters_and_presence() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;
    let hash = carfile_hash("cid-a");

    cluster
        .scheduler
        .cache_carfile(CacheCarfileInfo {
            carfile_cid: "cid-a".into(),
            need_reliability: 1,
            expired_time: Utc::now() + ChronoDuration::hours(1),
            device_id: Some("e1".into()),
        })
        .await
        .unwrap();
    cluster
        .scheduler
        .cache_result(
            "e1",
            CacheResultInfo {
                carfile_hash: hash,
                status: ReplicaStatus::Succeeded,
                msg: String::new(),
                done_size: 256,
                done_blocks: 4,
                total_block_count: 4,
                carfile_size: 256,
                disk_usage: 42.0,
            },
        )
        .await
        .unwrap();

    let info = cluster.scheduler.devices_info("e1").await.unwrap();
    assert!(info.is_online);
    assert_eq!(info.block_count, 4);
    assert!((info.disk_usage - 42.0).abs() < f64::EPSILON);

    cluster.scheduler.node_disconnect("e1").await.unwrap();
    let info = cluster.scheduler.devices_info("e1").await.unwrap();
    assert!(!info.is_online);
}

#[tokio::test]
async fn register_nodes_allocates_usable_registrations() {
    let cluster = TestCluster::new();
    let regs = cluster.scheduler.register_nodes(NodeType::Candidate, 3).await.unwrap();
    assert_eq!(regs.len(), 3);
    for reg in &regs {
        assert!(reg.device_id.starts_with("c_"));
        // Each registration immediately supports a connect.
        cluster
            .scheduler
            .node_connect(
                &reg.device_id,
                NodeType::Candidate,
                &TestCluster::addr_of(&reg.device_id),
                String::new(),
            )
            .await
            .unwrap();
    }
    assert_eq!(cluster.scheduler.online_devices(NodeType::Candidate).len(), 3);
}
