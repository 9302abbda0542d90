//! Election scenarios.

use crate::mock_infrastructure::TestCluster;
use stratus_core::store::EphemeralStore;
use stratus_core::types::NodeType;

#[tokio::test]
async fn election_with_single_candidate_elects_it() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.register_and_connect("e2", NodeType::Edge).await;

    let validators = cluster.scheduler.election().start_elect_with_seed(1).await.unwrap();
    assert_eq!(validators, vec!["c1".to_string()]);
    assert_eq!(cluster.ephemeral.validators().await.unwrap(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn election_without_candidates_is_empty_and_rounds_noop() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("e1", NodeType::Edge).await;
    cluster.seed_blocks("e1", &[(1, "CIDA")], 5).await;

    let validators = cluster.scheduler.election().start_elect_with_seed(1).await.unwrap();
    assert!(validators.is_empty());

    // The subsequent round is a logged no-op, not an error.
    let engine = cluster.scheduler.validation();
    engine.set_enabled(true);
    engine.run_round_with_seed(42).await.unwrap();
    assert!(!engine.is_running());
    assert_eq!(cluster.ephemeral.verifying_count().await.unwrap(), 0);
}

#[tokio::test]
async fn election_is_visible_through_online_validator_query() {
    let cluster = TestCluster::new();
    cluster.register_and_connect("c1", NodeType::Candidate).await;
    cluster.register_and_connect("c2", NodeType::Candidate).await;

    cluster.scheduler.election().start_elect_with_seed(2).await.unwrap();
    let online = cluster.scheduler.online_validators().await.unwrap();
    assert!(!online.is_empty());

    // A validator that goes offline drops out of the online view while the
    // persisted list is unchanged.
    let victim = online[0].clone();
    cluster.scheduler.node_disconnect(&victim).await.unwrap();
    let remaining = cluster.scheduler.online_validators().await.unwrap();
    assert!(!remaining.contains(&victim));
}
