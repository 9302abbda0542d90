//! Carfile replication manager.
//!
//! Drives every carfile record through its state machine:
//!
//! ```text
//! pending ──► running ──► succeeded
//!    ▲           │  ▲          │
//!    │           │  └──(quit)──┘
//!    │           ├──► failed        (retry budget exhausted)
//!    └───────────┴──► removed
//! ```
//!
//! A caching request enqueues the carfile on the ephemeral waiting queue; the
//! queue worker computes the replica deficit and dispatches fetch
//! instructions — candidate tier first (the root candidate seeds from the
//! content network), then edges pointed at succeeded candidate sources. Nodes
//! report progress through `CacheResult` callbacks; a dispatch that stays
//! silent past its deadline key is failed by the expiry sweeper.
//!
//! Per-carfile mutations are serialized through a per-hash async mutex;
//! different carfiles proceed independently. No lock is held across a node
//! RPC — dispatch happens after the row mutation is durable, and a dispatch
//! failure is absorbed by the same replacement budget as a node-reported
//! failure.

mod selection;

use crate::config::ReplicationConfig;
use crate::error::CoreError;
use crate::registry::NodeRegistry;
use crate::store::{BaseField, EphemeralStore, PersistentStore, WaitingTask};
use crate::types::{
    carfile_hash, CacheCarfileInfo, CacheInstruction, CacheResultInfo, CarfileRecord,
    DownloadSource, RecordStatus, RemoveCarfileResultInfo, Replica, ReplicaStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

pub use selection::SelectedNodes;

/// Page size for record listings.
pub const RECORD_PAGE_SIZE: usize = 20;

const MSG_DISPATCH_TIMEOUT: &str = "dispatch timed out";

/// Devices whose deletion ack is still outstanding for a removed carfile.
struct RemovalState {
    waiting: HashSet<String>,
    deadline: Instant,
}

pub struct ReplicaManager {
    registry: Arc<NodeRegistry>,
    persistent: Arc<dyn PersistentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    config: ReplicationConfig,
    backup_cache_count: AtomicU32,
    /// Per-carfile mutation locks; carfiles never contend with each other.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Replacement dispatches consumed per carfile.
    retries: DashMap<String, u32>,
    pending_removals: DashMap<String, RemovalState>,
}

impl ReplicaManager {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        persistent: Arc<dyn PersistentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        config: ReplicationConfig,
    ) -> Self {
        let backup_cache_count = config.backup_cache_count;
        Self {
            registry,
            persistent,
            ephemeral,
            config,
            backup_cache_count: AtomicU32::new(backup_cache_count),
            locks: DashMap::new(),
            retries: DashMap::new(),
            pending_removals: DashMap::new(),
        }
    }

    async fn lock_for(&self, carfile_hash: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(carfile_hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Current replacement budget per carfile.
    #[must_use]
    pub fn backup_cache_count(&self) -> u32 {
        self.backup_cache_count.load(Ordering::SeqCst)
    }

    pub fn reset_backup_cache_count(&self, count: u32) {
        self.backup_cache_count.store(count, Ordering::SeqCst);
    }

    /// Accepts a caching request.
    ///
    /// Creating, raising, or extending are all routed here:
    /// - no record → create it (a zero target completes immediately);
    /// - target already met → only the expiry is refreshed;
    /// - otherwise the target is updated and the carfile re-enters the queue.
    ///
    /// Repeating the same call is a no-op beyond the expiry refresh; replica
    /// rows are never duplicated because selection skips nodes that already
    /// hold a non-failed replica.
    pub async fn cache_carfile(&self, info: CacheCarfileInfo) -> Result<(), CoreError> {
        if info.carfile_cid.trim().is_empty() {
            return Err(CoreError::InvalidRequest("empty carfile cid".into()));
        }
        let hash = carfile_hash(&info.carfile_cid);
        let _guard = self.lock_for(&hash).await;

        let now = Utc::now();
        let record = match self.persistent.carfile_record(&hash).await {
            Ok(mut existing) => {
                if existing.status == RecordStatus::Removed {
                    // A removed carfile can be cached again from scratch.
                    existing.need_reliability = info.need_reliability;
                    existing.cur_reliability =
                        self.persistent.succeeded_replica_count(&hash).await?;
                    existing.status = RecordStatus::Pending;
                    existing.end_time = None;
                    existing.expired_time = info.expired_time;
                    self.ephemeral.incr_base_field(BaseField::CarfileCount, 1).await?;
                    existing
                } else if existing.cur_reliability >= info.need_reliability {
                    existing.expired_time = info.expired_time;
                    self.persistent.upsert_carfile_record(&existing).await?;
                    debug!(carfile = %info.carfile_cid, "target already met, refreshed expiry");
                    return Ok(());
                } else {
                    existing.need_reliability = info.need_reliability;
                    existing.expired_time = info.expired_time;
                    if existing.status.is_terminal() {
                        existing.status = RecordStatus::Pending;
                        existing.end_time = None;
                        self.retries.remove(&hash);
                    }
                    existing
                }
            }
            Err(e) if e.is_not_found() => {
                self.ephemeral.incr_base_field(BaseField::CarfileCount, 1).await?;
                let mut record = CarfileRecord {
                    carfile_cid: info.carfile_cid.clone(),
                    carfile_hash: hash.clone(),
                    need_reliability: info.need_reliability,
                    cur_reliability: 0,
                    total_size: 0,
                    total_blocks: 0,
                    status: RecordStatus::Pending,
                    expired_time: info.expired_time,
                    created_time: now,
                    end_time: None,
                };
                if record.need_reliability == 0 {
                    record.status = RecordStatus::Succeeded;
                    record.end_time = Some(now);
                }
                record
            }
            Err(e) => return Err(CoreError::Store(e)),
        };

        self.persistent.upsert_carfile_record(&record).await?;
        if record.status == RecordStatus::Succeeded {
            crate::metrics::record_record_finished(RecordStatus::Succeeded);
            return Ok(());
        }

        if let Some(device_id) = info.device_id {
            drop(_guard);
            return self.cache_to_device(&record, &device_id).await;
        }

        self.ephemeral
            .push_waiting(&WaitingTask {
                carfile_hash: hash,
                carfile_cid: info.carfile_cid,
            })
            .await?;
        Ok(())
    }

    /// Direct placement onto a named device, bypassing selection.
    async fn cache_to_device(
        &self,
        record: &CarfileRecord,
        device_id: &str,
    ) -> Result<(), CoreError> {
        let _guard = self.lock_for(&record.carfile_hash).await;
        match self.persistent.replica(&record.carfile_hash, device_id).await {
            Ok(existing) if existing.status != ReplicaStatus::Failed => {
                // Active dispatch exists for this pair; the request is a no-op.
                return Ok(());
            }
            Ok(_) | Err(_) => {}
        }
        let Some(session) = self.registry.lookup(device_id) else {
            return Err(CoreError::InvalidRequest(format!("device {device_id} is not online")));
        };
        let is_candidate = session.node_type == crate::types::NodeType::Candidate;
        let sources = if is_candidate { Vec::new() } else { self.candidate_sources(record).await? };
        self.dispatch_replica(record, device_id, is_candidate, sources).await
    }

    /// Pops one waiting carfile and advances it. Returns `false` when the
    /// queue was empty.
    pub async fn process_waiting_once(&self) -> Result<bool, CoreError> {
        let Some(task) = self.ephemeral.pop_waiting().await? else {
            return Ok(false);
        };
        if let Err(e) = self.run_task(&task.carfile_hash).await {
            error!(carfile_hash = %task.carfile_hash, error = %e, "cache task failed");
        }
        Ok(true)
    }

    /// Advances one carfile toward its reliability target.
    async fn run_task(&self, hash: &str) -> Result<(), CoreError> {
        let _guard = self.lock_for(hash).await;

        let mut record = match self.persistent.carfile_record(hash).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                debug!(carfile_hash = %hash, "queued carfile no longer exists");
                return Ok(());
            }
            Err(e) => return Err(CoreError::Store(e)),
        };
        if record.status == RecordStatus::Removed {
            return Ok(());
        }

        // cur_reliability is always recomputed from the replica rows, never
        // trusted from the record.
        record.cur_reliability = self.persistent.succeeded_replica_count(hash).await?;
        if record.cur_reliability >= record.need_reliability {
            self.finish_record(&mut record, RecordStatus::Succeeded).await?;
            return Ok(());
        }

        record.status = RecordStatus::Running;
        record.end_time = None;
        self.persistent.upsert_carfile_record(&record).await?;

        let selected = self.select_nodes(&record).await?;
        if selected.is_empty() {
            warn!(carfile = %record.carfile_cid, "no eligible nodes for dispatch");
            return Ok(());
        }

        let mut dispatch_failures = 0u32;
        for device_id in &selected.candidates {
            if let Err(e) = self.dispatch_replica(&record, device_id, true, Vec::new()).await {
                warn!(%device_id, error = %e, "candidate dispatch failed");
                dispatch_failures += 1;
            }
        }

        if !selected.edges.is_empty() {
            let sources = self.candidate_sources(&record).await?;
            if sources.is_empty() && self.config.candidate_replicas > 0 {
                // Edges pull from the candidate tier; until a candidate
                // replica succeeds there is nothing to point them at. The
                // carfile re-enters the queue when one does.
                debug!(carfile = %record.carfile_cid, "no candidate sources yet, deferring edges");
            } else {
                for device_id in &selected.edges {
                    if let Err(e) =
                        self.dispatch_replica(&record, device_id, false, sources.clone()).await
                    {
                        warn!(%device_id, error = %e, "edge dispatch failed");
                        dispatch_failures += 1;
                    }
                }
            }
        }

        for _ in 0..dispatch_failures {
            self.consume_retry_or_fail(&mut record).await?;
        }
        Ok(())
    }

    /// Creates the replica row and hands the node its fetch instruction.
    async fn dispatch_replica(
        &self,
        record: &CarfileRecord,
        device_id: &str,
        is_candidate: bool,
        sources: Vec<DownloadSource>,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        let replica = Replica {
            carfile_hash: record.carfile_hash.clone(),
            device_id: device_id.to_string(),
            status: ReplicaStatus::Pending,
            done_size: 0,
            done_blocks: 0,
            is_candidate,
            created_time: now,
            end_time: None,
        };
        self.persistent.upsert_replica(&replica).await?;
        crate::metrics::record_replica_transition(ReplicaStatus::Pending);

        let Some(session) = self.registry.lookup(device_id) else {
            self.fail_replica_row(&record.carfile_hash, device_id, "node offline at dispatch")
                .await?;
            return Err(CoreError::InvalidRequest(format!("device {device_id} is not online")));
        };

        self.ephemeral
            .begin_caching(device_id, &record.carfile_hash, self.dispatch_timeout())
            .await?;

        let instruction = CacheInstruction {
            carfile_cid: record.carfile_cid.clone(),
            carfile_hash: record.carfile_hash.clone(),
            sources,
        };
        match session.transport().cache_carfile(instruction).await {
            Ok(()) => {
                let mut running = replica;
                running.status = ReplicaStatus::Running;
                self.persistent.upsert_replica(&running).await?;
                crate::metrics::record_replica_transition(ReplicaStatus::Running);
                debug!(device_id, carfile = %record.carfile_cid, "replica dispatched");
                Ok(())
            }
            Err(e) => {
                self.ephemeral.end_caching(device_id, &record.carfile_hash).await?;
                self.fail_replica_row(&record.carfile_hash, device_id, "dispatch rpc failed")
                    .await?;
                Err(CoreError::Transport(e))
            }
        }
    }

    /// Online candidate-tier sources an edge can pull this carfile from.
    async fn candidate_sources(
        &self,
        record: &CarfileRecord,
    ) -> Result<Vec<DownloadSource>, CoreError> {
        let replicas = self.persistent.replicas_of(&record.carfile_hash).await?;
        let mut sources = Vec::new();
        for replica in replicas {
            if !replica.is_candidate || replica.status != ReplicaStatus::Succeeded {
                continue;
            }
            if let Some(session) = self.registry.candidate(&replica.device_id) {
                sources.push(DownloadSource {
                    url: format!("https://{}", session.remote_addr),
                    device_id: replica.device_id.clone(),
                });
            }
        }
        Ok(sources)
    }

    /// Processes a node's caching progress callback.
    ///
    /// Results are deduplicated by `(carfile_hash, device_id, status)`: a
    /// node resending a terminal result cannot double-count. Late results for
    /// a removed record are accepted without effect.
    pub async fn handle_cache_result(
        &self,
        device_id: &str,
        info: CacheResultInfo,
    ) -> Result<(), CoreError> {
        let hash = info.carfile_hash.clone();
        let _guard = self.lock_for(&hash).await;

        self.ephemeral.set_device_disk_usage(device_id, info.disk_usage).await?;

        let mut replica = match self.persistent.replica(&hash, device_id).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                // Rows are gone once a removal finalizes; the late result is
                // accepted and dropped.
                if let Ok(record) = self.persistent.carfile_record(&hash).await {
                    if record.status == RecordStatus::Removed {
                        debug!(device_id, carfile_hash = %hash, "late result for removed carfile");
                        return Ok(());
                    }
                }
                debug!(device_id, carfile_hash = %hash, "result for unknown replica");
                return Ok(());
            }
            Err(e) => return Err(CoreError::Store(e)),
        };

        if replica.status.is_terminal() {
            // Resend of a settled replica; nothing to record.
            debug!(device_id, carfile_hash = %hash, status = %info.status, "duplicate result");
            return Ok(());
        }

        match info.status {
            ReplicaStatus::Running => {
                replica.status = ReplicaStatus::Running;
                replica.done_size = info.done_size;
                replica.done_blocks = info.done_blocks;
                self.persistent.upsert_replica(&replica).await?;
                // Progress re-arms the dispatch deadline.
                self.ephemeral
                    .begin_caching(device_id, &hash, self.dispatch_timeout())
                    .await?;
                Ok(())
            }
            ReplicaStatus::Succeeded => {
                replica.status = ReplicaStatus::Succeeded;
                replica.done_size = info.done_size;
                replica.done_blocks = info.done_blocks;
                replica.end_time = Some(Utc::now());
                self.persistent.upsert_replica(&replica).await?;
                self.ephemeral.end_caching(device_id, &hash).await?;
                self.ephemeral
                    .incr_device_field(
                        device_id,
                        crate::store::DeviceField::BlockCount,
                        i64::from(info.done_blocks),
                    )
                    .await?;
                crate::metrics::record_replica_transition(ReplicaStatus::Succeeded);
                self.on_replica_succeeded(&hash, &info).await
            }
            ReplicaStatus::Failed => {
                self.ephemeral.end_caching(device_id, &hash).await?;
                self.fail_replica_row(&hash, device_id, &info.msg).await?;
                let mut record = self.persistent.carfile_record(&hash).await?;
                self.consume_retry_or_fail(&mut record).await
            }
            ReplicaStatus::Pending => {
                Err(CoreError::InvalidRequest("pending is not a reportable status".into()))
            }
        }
    }

    /// Advances the record after one replica reached `succeeded`.
    async fn on_replica_succeeded(
        &self,
        hash: &str,
        info: &CacheResultInfo,
    ) -> Result<(), CoreError> {
        let mut record = self.persistent.carfile_record(hash).await?;
        if info.carfile_size > 0 {
            record.total_size = info.carfile_size;
        }
        if info.total_block_count > 0 {
            record.total_blocks = info.total_block_count;
        }
        record.cur_reliability = self.persistent.succeeded_replica_count(hash).await?;

        if record.cur_reliability >= record.need_reliability {
            self.ephemeral.remove_waiting(hash).await?;
            self.finish_record(&mut record, RecordStatus::Succeeded).await?;
        } else {
            self.persistent.upsert_carfile_record(&record).await?;
            // Still deficient; let the queue worker fill the remainder (the
            // fresh candidate source may unblock edge dispatches).
            self.ephemeral
                .push_waiting(&WaitingTask {
                    carfile_hash: hash.to_string(),
                    carfile_cid: record.carfile_cid.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Burns one replacement from the carfile's retry budget, or settles the
    /// record as failed once the budget is gone and nothing is in flight.
    async fn consume_retry_or_fail(&self, record: &mut CarfileRecord) -> Result<(), CoreError> {
        let hash = record.carfile_hash.clone();
        let budget = self.backup_cache_count();
        let used = self.retries.get(&hash).map(|v| *v).unwrap_or(0);

        if used < budget {
            self.retries.insert(hash.clone(), used + 1);
            info!(carfile = %record.carfile_cid, used = used + 1, budget, "scheduling replacement");
            self.ephemeral
                .push_waiting(&WaitingTask {
                    carfile_hash: hash,
                    carfile_cid: record.carfile_cid.clone(),
                })
                .await?;
            return Ok(());
        }

        let replicas = self.persistent.replicas_of(&hash).await?;
        let in_flight = replicas.iter().any(|r| !r.status.is_terminal());
        record.cur_reliability = self.persistent.succeeded_replica_count(&hash).await?;
        if !in_flight && record.cur_reliability < record.need_reliability {
            warn!(carfile = %record.carfile_cid, "retry budget exhausted, failing record");
            self.finish_record(record, RecordStatus::Failed).await?;
        }
        Ok(())
    }

    async fn finish_record(
        &self,
        record: &mut CarfileRecord,
        status: RecordStatus,
    ) -> Result<(), CoreError> {
        record.status = status;
        record.end_time = Some(Utc::now());
        self.persistent.upsert_carfile_record(record).await?;
        self.retries.remove(&record.carfile_hash);
        crate::metrics::record_record_finished(status);
        info!(carfile = %record.carfile_cid, status = %status, "record finished");
        Ok(())
    }

    async fn fail_replica_row(
        &self,
        hash: &str,
        device_id: &str,
        msg: &str,
    ) -> Result<(), CoreError> {
        let mut replica = match self.persistent.replica(hash, device_id).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(CoreError::Store(e)),
        };
        if replica.status.is_terminal() {
            return Ok(());
        }
        replica.status = ReplicaStatus::Failed;
        replica.end_time = Some(Utc::now());
        self.persistent.upsert_replica(&replica).await?;
        crate::metrics::record_replica_transition(ReplicaStatus::Failed);
        debug!(device_id, carfile_hash = %hash, msg, "replica failed");
        Ok(())
    }

    /// Fails every dispatch whose deadline key expired.
    pub async fn check_expired_dispatches_once(&self) -> Result<usize, CoreError> {
        let expired = self.ephemeral.take_expired_caching().await?;
        let count = expired.len();
        for entry in expired {
            let _guard = self.lock_for(&entry.carfile_hash).await;
            warn!(device_id = %entry.device_id, carfile_hash = %entry.carfile_hash, "dispatch deadline lapsed");
            self.fail_replica_row(&entry.carfile_hash, &entry.device_id, MSG_DISPATCH_TIMEOUT)
                .await?;
            match self.persistent.carfile_record(&entry.carfile_hash).await {
                Ok(mut record) if record.status == RecordStatus::Running => {
                    self.consume_retry_or_fail(&mut record).await?;
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(CoreError::Store(e)),
            }
        }
        Ok(count)
    }

    /// Marks a carfile removed and instructs every holder to delete it.
    ///
    /// Replica rows survive until all holders acknowledge or the grace period
    /// lapses, whichever comes first. Idempotent: removing an absent or
    /// already-removed carfile succeeds without effect; the global carfile
    /// count is decremented exactly once.
    pub async fn remove_carfile(&self, carfile_cid: &str) -> Result<(), CoreError> {
        let hash = carfile_hash(carfile_cid);
        let _guard = self.lock_for(&hash).await;

        let mut record = match self.persistent.carfile_record(&hash).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(CoreError::Store(e)),
        };
        if record.status == RecordStatus::Removed {
            return Ok(());
        }

        record.status = RecordStatus::Removed;
        record.end_time = Some(Utc::now());
        self.persistent.upsert_carfile_record(&record).await?;
        self.ephemeral.remove_waiting(&hash).await?;
        self.ephemeral.incr_base_field(BaseField::CarfileCount, -1).await?;
        self.retries.remove(&hash);
        crate::metrics::record_record_finished(RecordStatus::Removed);

        let replicas = self.persistent.replicas_of(&hash).await?;
        if replicas.is_empty() {
            self.finalize_removal(&hash).await?;
            return Ok(());
        }

        let mut waiting = HashSet::new();
        for replica in &replicas {
            self.ephemeral.end_caching(&replica.device_id, &hash).await?;
            waiting.insert(replica.device_id.clone());
            if let Some(session) = self.registry.lookup(&replica.device_id) {
                if let Err(e) = session.transport().remove_carfile(carfile_cid).await {
                    warn!(device_id = %replica.device_id, error = %e, "delete instruction failed");
                }
            }
        }
        self.pending_removals.insert(
            hash,
            RemovalState {
                waiting,
                deadline: Instant::now() + std::time::Duration::from_secs(
                    self.config.removal_grace_secs,
                ),
            },
        );
        Ok(())
    }

    /// Records a node's deletion acknowledgement.
    pub async fn handle_remove_result(
        &self,
        device_id: &str,
        info: RemoveCarfileResultInfo,
    ) -> Result<(), CoreError> {
        self.ephemeral.set_device_disk_usage(device_id, info.disk_usage).await?;
        self.ephemeral
            .incr_device_field(
                device_id,
                crate::store::DeviceField::BlockCount,
                -i64::from(info.block_count),
            )
            .await?;

        let hash = info.carfile_hash;
        let finalize = match self.pending_removals.get_mut(&hash) {
            Some(mut state) => {
                state.waiting.remove(device_id);
                state.waiting.is_empty()
            }
            None => false,
        };
        if finalize {
            let _guard = self.lock_for(&hash).await;
            self.finalize_removal(&hash).await?;
        }
        Ok(())
    }

    /// Finalizes removals whose grace period lapsed without full acks.
    pub async fn sweep_removals_once(&self) -> Result<usize, CoreError> {
        let now = Instant::now();
        let due: Vec<String> = self
            .pending_removals
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for hash in &due {
            let _guard = self.lock_for(hash).await;
            self.finalize_removal(hash).await?;
        }
        Ok(due.len())
    }

    async fn finalize_removal(&self, hash: &str) -> Result<(), CoreError> {
        self.pending_removals.remove(hash);
        for replica in self.persistent.replicas_of(hash).await? {
            self.persistent.remove_replica(hash, &replica.device_id).await?;
        }
        self.persistent.remove_carfile_record(hash).await?;
        info!(carfile_hash = %hash, "carfile removal finalized");
        Ok(())
    }

    /// Removes one replica (admin `RemoveCache`).
    pub async fn remove_replica(
        &self,
        carfile_cid: &str,
        device_id: &str,
    ) -> Result<(), CoreError> {
        let hash = carfile_hash(carfile_cid);
        let _guard = self.lock_for(&hash).await;

        let replica = self.persistent.replica(&hash, device_id).await?;
        self.ephemeral.end_caching(device_id, &hash).await?;
        if let Some(session) = self.registry.lookup(device_id) {
            if let Err(e) = session.transport().remove_carfile(carfile_cid).await {
                warn!(%device_id, error = %e, "delete instruction failed");
            }
        }
        self.persistent.remove_replica(&hash, device_id).await?;

        if replica.status == ReplicaStatus::Succeeded {
            let mut record = self.persistent.carfile_record(&hash).await?;
            record.cur_reliability = self.persistent.succeeded_replica_count(&hash).await?;
            if record.cur_reliability < record.need_reliability && !record.status.is_terminal() {
                record.status = RecordStatus::Running;
                record.end_time = None;
                self.ephemeral
                    .push_waiting(&WaitingTask {
                        carfile_hash: hash.clone(),
                        carfile_cid: record.carfile_cid.clone(),
                    })
                    .await?;
            }
            self.persistent.upsert_carfile_record(&record).await?;
        }
        Ok(())
    }

    /// Cancels future dispatches for a carfile without touching what already
    /// completed. In-flight node work is not aborted; its late result is
    /// still accepted. The record keeps its current non-terminal state and
    /// stays eligible for re-execution.
    pub async fn stop_cache_task(&self, carfile_cid: &str) -> Result<(), CoreError> {
        let hash = carfile_hash(carfile_cid);
        let _guard = self.lock_for(&hash).await;

        let record = self.persistent.carfile_record(&hash).await?;
        self.ephemeral.remove_waiting(&hash).await?;
        for replica in self.persistent.replicas_of(&hash).await? {
            if !replica.status.is_terminal() {
                self.ephemeral.end_caching(&replica.device_id, &hash).await?;
            }
        }
        info!(carfile = %record.carfile_cid, "cache task stopped");
        Ok(())
    }

    /// Metadata-only expiry update.
    pub async fn reset_expired_time(
        &self,
        carfile_cid: &str,
        expired_time: chrono::DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let hash = carfile_hash(carfile_cid);
        let _guard = self.lock_for(&hash).await;
        let mut record = self.persistent.carfile_record(&hash).await?;
        record.expired_time = expired_time;
        self.persistent.upsert_carfile_record(&record).await?;
        Ok(())
    }

    /// Re-enqueues every record still short of its target.
    pub async fn execute_undone_task(&self) -> Result<usize, CoreError> {
        let undone = self.persistent.undone_carfile_records().await?;
        let count = undone.len();
        for record in undone {
            // Fresh pass, fresh replacement budget.
            self.retries.remove(&record.carfile_hash);
            self.ephemeral
                .push_waiting(&WaitingTask {
                    carfile_hash: record.carfile_hash.clone(),
                    carfile_cid: record.carfile_cid.clone(),
                })
                .await?;
        }
        Ok(count)
    }

    /// Restores reliability for carfiles that lost replicas to departed
    /// nodes. Called by the quit handler after the rows are gone.
    pub async fn restore_carfiles(&self, hashes: &[String]) -> Result<(), CoreError> {
        for hash in hashes {
            let _guard = self.lock_for(hash).await;
            let mut record = match self.persistent.carfile_record(hash).await {
                Ok(r) => r,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(CoreError::Store(e)),
            };
            if record.status == RecordStatus::Removed {
                continue;
            }
            record.cur_reliability = self.persistent.succeeded_replica_count(hash).await?;
            if record.cur_reliability < record.need_reliability {
                info!(carfile = %record.carfile_cid, "restoring lost replicas");
                record.status = RecordStatus::Running;
                record.end_time = None;
                self.retries.remove(hash);
                self.ephemeral
                    .push_waiting(&WaitingTask {
                        carfile_hash: hash.clone(),
                        carfile_cid: record.carfile_cid.clone(),
                    })
                    .await?;
            }
            self.persistent.upsert_carfile_record(&record).await?;
        }
        Ok(())
    }

    /// A record together with its replicas.
    pub async fn record_with_replicas(
        &self,
        carfile_cid: &str,
    ) -> Result<(CarfileRecord, Vec<Replica>), CoreError> {
        let hash = carfile_hash(carfile_cid);
        let record = self.persistent.carfile_record(&hash).await?;
        let replicas = self.persistent.replicas_of(&hash).await?;
        Ok((record, replicas))
    }

    pub async fn list_records(
        &self,
        page: usize,
    ) -> Result<(Vec<CarfileRecord>, usize), CoreError> {
        Ok(self.persistent.carfile_records(page, RECORD_PAGE_SIZE).await?)
    }

    pub async fn running_records(&self) -> Result<Vec<CarfileRecord>, CoreError> {
        Ok(self.persistent.running_carfile_records().await?)
    }

    pub async fn undone_records(&self) -> Result<Vec<CarfileRecord>, CoreError> {
        Ok(self.persistent.undone_carfile_records().await?)
    }

    fn dispatch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.dispatch_timeout_secs)
    }

    /// Disk usage ceiling used by node selection.
    #[must_use]
    pub(crate) fn max_disk_usage(&self) -> f64 {
        self.config.max_disk_usage
    }

    #[must_use]
    pub(crate) fn candidate_replica_target(&self) -> u32 {
        self.config.candidate_replicas
    }

    pub(crate) fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub(crate) fn persistent(&self) -> &Arc<dyn PersistentStore> {
        &self.persistent
    }

    pub(crate) fn ephemeral(&self) -> &Arc<dyn EphemeralStore> {
        &self.ephemeral
    }

    /// Queue worker: drains waiting carfiles until shutdown.
    #[must_use]
    pub fn spawn_queue_worker(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        loop {
                            match manager.process_waiting_once().await {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(e) => {
                                    error!(error = %e, "queue worker iteration failed");
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("replication queue worker shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Expiry sweeper: fails silent dispatches and finalizes stale removals.
    #[must_use]
    pub fn spawn_expiry_worker(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = manager.check_expired_dispatches_once().await {
                            error!(error = %e, "dispatch expiry sweep failed");
                        }
                        if let Err(e) = manager.sweep_removals_once().await {
                            error!(error = %e, "removal sweep failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("replication expiry worker shutting down");
                        break;
                    }
                }
            }
        })
    }
}
