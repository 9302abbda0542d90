//! Validation round engine.
//!
//! Runs on a fixed period. One round walks five phases:
//!
//! 1. **Preflight** — advance the round counter, pick the round seed, and
//!    force-timeout every device still sitting in the verifying set from the
//!    previous round. This dead-man's switch is the only timeout mechanism
//!    for audit results.
//! 2. **State check** — a disabled engine returns to idle immediately.
//! 3. **Partition** — assign every online node a validator uniformly at
//!    random; a candidate drawing itself is silently dropped, never
//!    reassigned.
//! 4. **Dispatch** — one concurrent unit of work per validator: skip targets
//!    with no cached content, insert the `created` result row, mark the
//!    device verifying, and hand the validator its challenge batch. A failed
//!    validator RPC is logged only; its targets time out at the next
//!    preflight.
//! 5. **Collection** — audited nodes post results through the API; each is
//!    scored against the shared-seed RNG stream and finished exactly once.
//!    When the verifying set drains the engine returns to idle.

pub mod rng;

use crate::config::ValidationConfig;
use crate::error::CoreError;
use crate::registry::NodeRegistry;
use crate::store::{EphemeralStore, PersistentStore};
use crate::types::{
    normalized_cid_hash, NodeType, ReqValidate, ValidateResults, ValidationResultRow,
    ValidationStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use rng::SeededRng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const MSG_TIMEOUT: &str = "time out";
const MSG_CANCELLED: &str = "cancelled by user download";

/// One audited device inside a round plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTarget {
    pub device_id: String,
    pub node_type: NodeType,
    pub remote_addr: String,
}

/// The audit round engine.
pub struct ValidationEngine {
    registry: Arc<NodeRegistry>,
    persistent: Arc<dyn PersistentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    config: ValidationConfig,
    server_name: String,
    enabled: AtomicBool,
    /// True while a round has unresolved targets.
    running: AtomicBool,
    seed: AtomicU64,
    current_round: AtomicU64,
    /// Per-device block-index bound captured at dispatch, read at scoring.
    max_fids: DashMap<String, u64>,
    /// Signals the periodic driver to re-arm its interval.
    timer_reset: watch::Sender<u64>,
}

impl ValidationEngine {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        persistent: Arc<dyn PersistentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        config: ValidationConfig,
        server_name: String,
    ) -> Self {
        let enabled = config.enabled;
        let (timer_reset, _) = watch::channel(0);
        Self {
            registry,
            persistent,
            ephemeral,
            config,
            server_name,
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            seed: AtomicU64::new(0),
            current_round: AtomicU64::new(0),
            max_fids: DashMap::new(),
            timer_reset,
        }
    }

    /// Flips the validation switch. Takes effect at the next round.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn current_round(&self) -> u64 {
        self.current_round.load(Ordering::SeqCst)
    }

    /// Starts the periodic round driver.
    #[must_use]
    pub fn spawn_periodic(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut reset_rx = self.timer_reset.subscribe();
        let period = engine.interval();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = engine.run_round().await {
                            error!(error = %e, "validation round failed");
                        }
                    }
                    _ = reset_rx.changed() => {
                        timer = tokio::time::interval_at(
                            tokio::time::Instant::now() + period,
                            period,
                        );
                    }
                    _ = shutdown_rx.recv() => {
                        info!("validation engine shutting down");
                        break;
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.interval_minutes * 60)
    }

    /// Manual single-round trigger.
    ///
    /// Fails with [`CoreError::InProgress`] while a round is unresolved.
    /// Otherwise enables validation, pushes the periodic timer one full
    /// interval out, and runs a round immediately.
    pub async fn start_once(&self) -> Result<(), CoreError> {
        if self.is_running() {
            return Err(CoreError::InProgress);
        }
        self.set_enabled(true);
        // Re-arm the periodic driver so the next scheduled round is one
        // interval away from now.
        let _ = self.timer_reset.send(self.current_round.load(Ordering::SeqCst));
        self.run_round().await
    }

    /// Runs one round with a clock-derived seed.
    pub async fn run_round(&self) -> Result<(), CoreError> {
        use std::time::{SystemTime, UNIX_EPOCH};
        let seed = SystemTime::now().duration_since(UNIX_EPOCH).map_or(1, |d| d.as_nanos() as u64);
        self.run_round_with_seed(seed).await
    }

    /// Runs one round with an explicit seed.
    pub async fn run_round_with_seed(&self, seed: u64) -> Result<(), CoreError> {
        // Phase 1: preflight.
        let (previous_round, current_round) = self.ephemeral.incr_round_id().await?;
        self.current_round.store(current_round, Ordering::SeqCst);
        self.seed.store(seed, Ordering::SeqCst);

        let leftover = self.ephemeral.verifying().await?;
        if !leftover.is_empty() {
            info!(count = leftover.len(), round = previous_round, "timing out unresolved audits");
            for device_id in &leftover {
                if let Err(e) = self
                    .finish_result(previous_round, device_id, ValidationStatus::Timeout, MSG_TIMEOUT)
                    .await
                {
                    error!(%device_id, error = %e, "failed to record audit timeout");
                }
            }
        }
        self.ephemeral.clear_verifying().await?;

        // Phase 2: state check.
        if !self.is_enabled() {
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        // Phase 3: partition.
        let validators = self.ephemeral.validators().await?;
        if validators.is_empty() {
            info!("validator list is empty, skipping round");
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        let plan = self.partition(&validators, seed);
        if plan.is_empty() {
            info!("no online nodes to audit, skipping round");
            self.running.store(false, Ordering::SeqCst);
            return Ok(());
        }
        debug!(round = current_round, validators = plan.len(), "round plan built");

        // Phase 4: dispatch, one concurrent unit per validator.
        let dispatches = plan.into_iter().map(|(validator_id, targets)| {
            self.dispatch_to_validator(validator_id, targets, seed, current_round)
        });
        futures::future::join_all(dispatches).await;

        // Every target may have been skipped; don't stay running on nothing.
        if self.ephemeral.verifying_count().await? == 0 {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Builds the round plan: every online node is assigned one validator
    /// uniformly at random from the shared-seed stream. Candidates drawing
    /// themselves are dropped. Iteration is in sorted device order so a given
    /// seed always yields the same plan.
    #[must_use]
    pub fn partition(
        &self,
        validators: &[String],
        seed: u64,
    ) -> BTreeMap<String, Vec<AuditTarget>> {
        let mut rng = SeededRng::new(seed);
        let mut plan: BTreeMap<String, Vec<AuditTarget>> = BTreeMap::new();

        for device_id in self.registry.online_by_type(NodeType::Edge) {
            let Some(session) = self.registry.lookup(&device_id) else { continue };
            let validator = &validators[rng.draw(validators.len() as u64) as usize];
            plan.entry(validator.clone()).or_default().push(AuditTarget {
                device_id,
                node_type: NodeType::Edge,
                remote_addr: session.remote_addr.clone(),
            });
        }

        for device_id in self.registry.online_by_type(NodeType::Candidate) {
            let Some(session) = self.registry.lookup(&device_id) else { continue };
            let validator = &validators[rng.draw(validators.len() as u64) as usize];
            if *validator == device_id {
                // A candidate never audits itself; the lost assignment is
                // accepted rather than redrawn.
                debug!(%device_id, "dropping self-assigned candidate");
                continue;
            }
            plan.entry(validator.clone()).or_default().push(AuditTarget {
                device_id,
                node_type: NodeType::Candidate,
                remote_addr: session.remote_addr.clone(),
            });
        }

        plan
    }

    async fn dispatch_to_validator(
        &self,
        validator_id: String,
        targets: Vec<AuditTarget>,
        seed: u64,
        round_id: u64,
    ) {
        let mut batch = Vec::with_capacity(targets.len());
        for target in targets {
            let device_id = &target.device_id;

            match self.persistent.device_block_count(device_id).await {
                Ok(0) => {
                    debug!(%device_id, "no cached content, skipping audit");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%device_id, error = %e, "failed to count cached content");
                    continue;
                }
            }

            let max_fid = match self.ephemeral.node_max_fid(device_id).await {
                Ok(v) if v > 0 => v,
                Ok(_) => {
                    debug!(%device_id, "empty block-index space, skipping audit");
                    continue;
                }
                Err(e) => {
                    warn!(%device_id, error = %e, "failed to read max fid");
                    continue;
                }
            };
            self.max_fids.insert(device_id.clone(), max_fid);

            let row = ValidationResultRow {
                round_id,
                device_id: device_id.clone(),
                validator_id: validator_id.clone(),
                status: ValidationStatus::Created,
                start_time: Utc::now(),
                end_time: None,
                block_count: 0,
                bandwidth: 0.0,
                duration: 0,
                msg: String::new(),
                server_name: self.server_name.clone(),
            };
            if let Err(e) = self.persistent.insert_validation_result(&row).await {
                error!(%device_id, error = %e, "failed to insert validation row");
                continue;
            }
            if let Err(e) = self.ephemeral.add_verifying(device_id).await {
                error!(%device_id, error = %e, "failed to mark device verifying");
                continue;
            }

            batch.push(ReqValidate {
                seed,
                node_url: target.remote_addr.clone(),
                duration: self.config.challenge_duration_secs,
                round_id,
                node_type: target.node_type,
                max_fid,
            });
        }

        if batch.is_empty() {
            return;
        }

        let Some(validator) = self.registry.candidate(&validator_id) else {
            error!(%validator_id, "validator has no live session");
            return;
        };
        match validator.transport().validate_blocks(batch).await {
            Ok(()) => debug!(%validator_id, "challenge batch dispatched"),
            // Targets stay in the verifying set and roll over to timeout at
            // the next preflight.
            Err(e) => error!(%validator_id, error = %e, "validator dispatch failed"),
        }
    }

    /// Processes a result posted by an audited node (phase 5).
    pub async fn handle_result(&self, results: ValidateResults) -> Result<(), CoreError> {
        let current = self.current_round.load(Ordering::SeqCst);
        if results.round_id != current {
            return Err(CoreError::RoundMismatch { expected: current, got: results.round_id });
        }

        let (status, msg) = self.score(&results).await;
        crate::metrics::record_validation_result(status);

        let outcome = match status {
            ValidationStatus::Success => {
                self.finish_success(&results).await
            }
            _ => self.finish_result(results.round_id, &results.device_id, status, &msg).await,
        };

        self.ephemeral.remove_verifying(&results.device_id).await?;
        if self.ephemeral.verifying_count().await? == 0 {
            self.running.store(false, Ordering::SeqCst);
        }
        outcome
    }

    /// Scores one result into its terminal status.
    async fn score(&self, results: &ValidateResults) -> (ValidationStatus, String) {
        if results.is_cancel {
            return (ValidationStatus::Cancelled, MSG_CANCELLED.to_string());
        }
        if results.is_timeout {
            return (ValidationStatus::Timeout, MSG_TIMEOUT.to_string());
        }
        if results.cids.is_empty() || results.random_count == 0 {
            return (
                ValidationStatus::Fail,
                "result is empty or random count is 0".to_string(),
            );
        }

        let fid_map = match self.persistent.device_fid_map(&results.device_id).await {
            Ok(map) if !map.is_empty() => map,
            Ok(_) => {
                return (ValidationStatus::Other, "block map is empty".to_string());
            }
            Err(e) => {
                return (ValidationStatus::Other, format!("failed to query block map: {e}"));
            }
        };

        let Some(max_fid) = self.max_fids.get(&results.device_id).map(|v| *v) else {
            return (ValidationStatus::Other, "max fid unknown for device".to_string());
        };

        let seed = self.seed.load(Ordering::SeqCst);
        let mut rng = SeededRng::new(seed);
        let mut checked = 0u32;
        for index in 0..results.random_count as usize {
            let fid = rng.draw(max_fid) + 1;
            let Some(expected_cid) = fid_map.get(&fid) else {
                // The node has no entry at this index; the draw is skipped,
                // not counted as a mismatch.
                continue;
            };
            let Some(result_cid) = results.cids.get(index) else {
                return (
                    ValidationStatus::Fail,
                    format!("missing result cid at index={index}"),
                );
            };
            if !cids_match(expected_cid, result_cid) {
                return (
                    ValidationStatus::Fail,
                    format!("resultCid={result_cid},cid_db={expected_cid},fid={fid},index={index}"),
                );
            }
            checked += 1;
        }

        if checked == 0 {
            return (ValidationStatus::Fail, "no cids checked".to_string());
        }
        (ValidationStatus::Success, "ok".to_string())
    }

    async fn finish_success(&self, results: &ValidateResults) -> Result<(), CoreError> {
        self.persistent
            .finish_validation_result(
                results.round_id,
                &results.device_id,
                ValidationStatus::Success,
                "ok",
                results.cids.len() as u32,
                results.bandwidth,
                results.cost_time,
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    async fn finish_result(
        &self,
        round_id: u64,
        device_id: &str,
        status: ValidationStatus,
        msg: &str,
    ) -> Result<(), CoreError> {
        self.persistent
            .finish_validation_result(round_id, device_id, status, msg, 0, 0.0, 0, Utc::now())
            .await?;
        Ok(())
    }
}

/// Compares two CIDs by normalized hash; unparsable CIDs never match.
fn cids_match(expected: &str, actual: &str) -> bool {
    match (normalized_cid_hash(expected), normalized_cid_hash(actual)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests_support::registry_with_online;
    use crate::store::memory::{MemoryEphemeralStore, MemoryPersistentStore};
    use crate::store::Region;
    use std::time::Duration;

    struct Fixture {
        engine: ValidationEngine,
        persistent: Arc<MemoryPersistentStore>,
        ephemeral: Arc<MemoryEphemeralStore>,
    }

    async fn fixture(devices: &[(&str, NodeType)], validators: &[&str]) -> Fixture {
        let registry = registry_with_online(devices).await;
        let persistent = Arc::new(MemoryPersistentStore::new(Region::parse("test").unwrap()));
        let ephemeral = Arc::new(MemoryEphemeralStore::new());
        ephemeral
            .set_validators(
                &validators.iter().map(|v| (*v).to_string()).collect::<Vec<_>>(),
                Duration::from_secs(600),
            )
            .await
            .unwrap();
        let engine = ValidationEngine::new(
            registry,
            Arc::clone(&persistent) as Arc<dyn PersistentStore>,
            Arc::clone(&ephemeral) as Arc<dyn EphemeralStore>,
            ValidationConfig { enabled: true, interval_minutes: 5, challenge_duration_secs: 10 },
            "sched-test".into(),
        );
        Fixture { engine, persistent, ephemeral }
    }

    async fn seed_device_blocks(f: &Fixture, device_id: &str, entries: &[(u64, &str)], max_fid: u64) {
        for (fid, cid) in entries {
            f.persistent.set_device_fid(device_id, *fid, cid).await.unwrap();
        }
        f.ephemeral.set_node_max_fid(device_id, max_fid).await.unwrap();
    }

    fn result(round_id: u64, device_id: &str, cids: &[&str], random_count: u32) -> ValidateResults {
        ValidateResults {
            round_id,
            device_id: device_id.to_string(),
            validator_id: "c1".into(),
            cids: cids.iter().map(|c| (*c).to_string()).collect(),
            random_count,
            bandwidth: 100.0,
            cost_time: 250,
            is_cancel: false,
            is_timeout: false,
        }
    }

    #[tokio::test]
    async fn test_partition_single_validator_gets_all_edges() {
        let f = fixture(
            &[("c1", NodeType::Candidate), ("e1", NodeType::Edge), ("e2", NodeType::Edge)],
            &["c1"],
        )
        .await;
        let plan = f.engine.partition(&["c1".to_string()], 1);
        assert_eq!(plan.len(), 1);
        let targets = &plan["c1"];
        let ids: Vec<&str> = targets.iter().map(|t| t.device_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn test_partition_drops_self_assigned_candidate() {
        let f = fixture(&[("c1", NodeType::Candidate), ("c2", NodeType::Candidate)], &["c1", "c2"])
            .await;
        // Seed 3 draws validator index 1 twice: c1 → c2, c2 → itself (dropped).
        let plan = f.engine.partition(&["c1".to_string(), "c2".to_string()], 3);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan["c2"].len(), 1);
        assert_eq!(plan["c2"][0].device_id, "c1");
        for (validator, targets) in &plan {
            assert!(targets.iter().all(|t| t.device_id != *validator));
        }
    }

    #[tokio::test]
    async fn test_partition_is_deterministic() {
        let f = fixture(
            &[
                ("c1", NodeType::Candidate),
                ("c2", NodeType::Candidate),
                ("e1", NodeType::Edge),
                ("e2", NodeType::Edge),
            ],
            &["c1", "c2"],
        )
        .await;
        let validators = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(f.engine.partition(&validators, 99), f.engine.partition(&validators, 99));
    }

    #[tokio::test]
    async fn test_round_skips_when_disabled() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(1, "CIDA")], 5).await;
        f.engine.set_enabled(false);
        f.engine.run_round_with_seed(42).await.unwrap();
        assert!(!f.engine.is_running());
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 0);
        assert!(f.persistent.validation_result(1, "e1").await.is_err());
    }

    #[tokio::test]
    async fn test_round_no_ops_without_validators() {
        let f = fixture(&[("e1", NodeType::Edge)], &[]).await;
        seed_device_blocks(&f, "e1", &[(1, "CIDA")], 5).await;
        f.engine.run_round_with_seed(42).await.unwrap();
        assert!(!f.engine.is_running());
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_skips_contentless_targets() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        // e1 has no cached content at all; nothing is dispatched.
        f.engine.run_round_with_seed(42).await.unwrap();
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 0);
        assert!(!f.engine.is_running());
    }

    #[tokio::test]
    async fn test_scoring_success() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        // Seed 42 with max_fid 10 draws fids 5 then 7.
        seed_device_blocks(&f, "e1", &[(5, "CIDA"), (7, "CIDB")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();
        assert!(f.engine.is_running());

        f.engine.handle_result(result(1, "e1", &["CIDA", "CIDB"], 2)).await.unwrap();

        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Success);
        assert_eq!(row.block_count, 2);
        assert!(row.end_time.is_some());
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 0);
        assert!(!f.engine.is_running());
    }

    #[tokio::test]
    async fn test_scoring_mismatch_records_diagnostic() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA"), (7, "CIDB")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();

        f.engine.handle_result(result(1, "e1", &["CIDA", "CIDX"], 2)).await.unwrap();

        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Fail);
        assert!(row.msg.contains("resultCid=CIDX,cid_db=CIDB,fid=7,index=1"), "msg: {}", row.msg);
    }

    #[tokio::test]
    async fn test_scoring_rejects_stale_round() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();

        let err = f.engine.handle_result(result(9, "e1", &["CIDA"], 1)).await.unwrap_err();
        assert!(matches!(err, CoreError::RoundMismatch { expected: 1, got: 9 }));
        // The device is still awaiting a valid result.
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scoring_empty_result_fails() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();

        f.engine.handle_result(result(1, "e1", &[], 0)).await.unwrap();
        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Fail);
        assert!(row.msg.contains("random count is 0"));
    }

    #[tokio::test]
    async fn test_scoring_all_draws_skipped_fails() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        // Block map has no entry at any drawn fid (5, 7).
        seed_device_blocks(&f, "e1", &[(9, "CIDZ")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();

        f.engine.handle_result(result(1, "e1", &["CIDZ", "CIDZ"], 2)).await.unwrap();
        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Fail);
        assert_eq!(row.msg, "no cids checked");
    }

    #[tokio::test]
    async fn test_scoring_cancel_is_not_fault() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();

        let mut res = result(1, "e1", &[], 0);
        res.is_cancel = true;
        f.engine.handle_result(res).await.unwrap();
        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_rollover_to_next_round() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA")], 10).await;

        // Round 1 dispatches e1; no result ever arrives.
        f.engine.run_round_with_seed(42).await.unwrap();
        assert_eq!(f.ephemeral.verifying_count().await.unwrap(), 1);

        // Round 2 preflight times the device out for round 1.
        f.engine.run_round_with_seed(43).await.unwrap();
        let row = f.persistent.validation_result(1, "e1").await.unwrap();
        assert_eq!(row.status, ValidationStatus::Timeout);
        assert_eq!(row.msg, MSG_TIMEOUT);
        // Round 2 proceeds independently with its own row.
        let row2 = f.persistent.validation_result(2, "e1").await.unwrap();
        assert_eq!(row2.status, ValidationStatus::Created);
    }

    #[tokio::test]
    async fn test_start_once_rejected_while_running() {
        let f = fixture(&[("c1", NodeType::Candidate), ("e1", NodeType::Edge)], &["c1"]).await;
        seed_device_blocks(&f, "e1", &[(5, "CIDA")], 10).await;
        f.engine.run_round_with_seed(42).await.unwrap();
        assert!(f.engine.is_running());

        let err = f.engine.start_once().await.unwrap_err();
        assert!(matches!(err, CoreError::InProgress));
    }
}

