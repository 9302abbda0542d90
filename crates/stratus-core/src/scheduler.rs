//! Scheduler facade.
//!
//! Wires the components together behind the operation surface the API layer
//! exposes. Every dependency — stores, transport factory, secrets — is
//! injected at construction; nothing reaches for process-wide state.

use crate::auth::{AuthKeeper, Permission};
use crate::config::AppConfig;
use crate::download::{DownloadService, HmacDownloadSigner};
use crate::election::Election;
use crate::error::CoreError;
use crate::quit::QuitHandler;
use crate::registry::{ConnectRequest, NodeRegistry, TransportFactory};
use crate::replication::{ReplicaManager, RECORD_PAGE_SIZE};
use crate::store::{DeviceField, EphemeralStore, PersistentStore};
use crate::types::{
    CacheCarfileInfo, CacheResultInfo, CarfileRecord, CarfileRecordPage, DeviceInfo, NodeType,
    NodeRegisterInfo, Registration, RemoveCarfileResultInfo, Replica, ValidateResults,
};
use crate::validation::ValidationEngine;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Upper bound on registrations minted per request.
const MAX_REGISTER_COUNT: usize = 10;

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    election: Election,
    validation: Arc<ValidationEngine>,
    replication: Arc<ReplicaManager>,
    quit: QuitHandler,
    auth: AuthKeeper,
    download: DownloadService,
    transports: Arc<dyn TransportFactory>,
    persistent: Arc<dyn PersistentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
}

impl Scheduler {
    /// Builds a scheduler over the given stores and transport factory.
    #[must_use]
    pub fn new(
        config: &AppConfig,
        persistent: Arc<dyn PersistentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        transports: Arc<dyn TransportFactory>,
        global_secret: Vec<u8>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new(
            Arc::clone(&persistent),
            config.scheduler.server_name.clone(),
        ));
        let election = Election::new(
            Arc::clone(&registry),
            Arc::clone(&ephemeral),
            config.election.clone(),
        );
        let validation = Arc::new(ValidationEngine::new(
            Arc::clone(&registry),
            Arc::clone(&persistent),
            Arc::clone(&ephemeral),
            config.validation.clone(),
            config.scheduler.server_name.clone(),
        ));
        let replication = Arc::new(ReplicaManager::new(
            Arc::clone(&registry),
            Arc::clone(&persistent),
            Arc::clone(&ephemeral),
            config.replication.clone(),
        ));
        let quit = QuitHandler::new(
            Arc::clone(&persistent),
            Arc::clone(&ephemeral),
            Arc::clone(&replication),
        );
        let auth = AuthKeeper::new(global_secret.clone(), Arc::clone(&persistent));
        let download = DownloadService::new(
            Arc::clone(&registry),
            Arc::clone(&persistent),
            Arc::clone(&ephemeral),
            Arc::new(HmacDownloadSigner::new(global_secret)),
            config.download.timeout_secs,
        );
        Self {
            registry,
            election,
            validation,
            replication,
            quit,
            auth,
            download,
            transports,
            persistent,
            ephemeral,
        }
    }

    /// Direct access to the validation engine, for embedders and tests that
    /// drive rounds deterministically.
    #[must_use]
    pub fn validation(&self) -> &Arc<ValidationEngine> {
        &self.validation
    }

    /// Direct access to the replica manager.
    #[must_use]
    pub fn replication(&self) -> &Arc<ReplicaManager> {
        &self.replication
    }

    /// Direct access to the node registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Direct access to the election component.
    #[must_use]
    pub fn election(&self) -> &Election {
        &self.election
    }

    /// Startup pass: clears presence state owned by this scheduler.
    pub async fn startup(&self) -> Result<(), CoreError> {
        self.registry.set_all_offline().await?;
        info!(server_name = %self.registry.server_name(), "presence state reset");
        Ok(())
    }

    /// Spawns the periodic background tasks.
    #[must_use]
    pub fn spawn_background(
        &self,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![
            self.validation.spawn_periodic(shutdown_tx.subscribe()),
            self.replication.spawn_queue_worker(shutdown_tx.subscribe()),
            self.replication.spawn_expiry_worker(shutdown_tx.subscribe()),
        ];
        handles.push(self.spawn_election_timer(shutdown_tx.subscribe()));
        handles
    }

    fn spawn_election_timer(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let ephemeral = Arc::clone(&self.ephemeral);
        let config = self.election_config();
        tokio::spawn(async move {
            let election = Election::new(registry, ephemeral, config);
            let period = election.interval();
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = election.start_elect().await {
                            error!(error = %e, "election failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("election timer shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn election_config(&self) -> crate::config::ElectionConfig {
        self.election.config().clone()
    }

    // --- node-facing operations ---

    /// Handles `EdgeNodeConnect` / `CandidateNodeConnect`.
    pub async fn node_connect(
        &self,
        device_id: &str,
        node_type: NodeType,
        remote_addr: &str,
        public_key: String,
    ) -> Result<(), CoreError> {
        let transport = self.transports.connect(remote_addr).await?;
        self.registry
            .on_connect(
                ConnectRequest {
                    device_id: device_id.to_string(),
                    node_type,
                    remote_addr: remote_addr.to_string(),
                    public_key,
                    // Geolocation is resolved by an external collaborator.
                    geo: String::new(),
                },
                transport,
            )
            .await?;
        crate::metrics::record_node_connect(node_type);
        self.publish_online_gauges();
        Ok(())
    }

    pub async fn node_disconnect(&self, device_id: &str) -> Result<(), CoreError> {
        self.registry.on_disconnect(device_id).await?;
        self.publish_online_gauges();
        Ok(())
    }

    /// Session keep-alive.
    pub fn node_heartbeat(&self, device_id: &str) {
        if let Some(session) = self.registry.lookup(device_id) {
            session.mark_seen();
        }
    }

    fn publish_online_gauges(&self) {
        crate::metrics::set_online_nodes(
            self.registry.online_by_type(NodeType::Edge).len(),
            self.registry.online_by_type(NodeType::Candidate).len(),
        );
    }

    /// Handles `ValidateBlockResult` posted by an audited node through its
    /// validator.
    pub async fn validate_block_result(
        &self,
        validator_id: &str,
        mut results: ValidateResults,
    ) -> Result<(), CoreError> {
        // The reporting validator must be a registered device.
        self.persistent.registration(validator_id).await.map_err(|e| {
            if e.is_not_found() {
                CoreError::UnknownDevice(validator_id.to_string())
            } else {
                CoreError::Store(e)
            }
        })?;
        results.validator_id = validator_id.to_string();
        self.validation.handle_result(results).await
    }

    /// Handles `CacheResult` progress callbacks.
    pub async fn cache_result(
        &self,
        device_id: &str,
        info: CacheResultInfo,
    ) -> Result<(), CoreError> {
        self.replication.handle_cache_result(device_id, info).await
    }

    /// Handles `RemoveCarfileResult` acknowledgements.
    pub async fn remove_carfile_result(
        &self,
        device_id: &str,
        info: RemoveCarfileResultInfo,
    ) -> Result<(), CoreError> {
        self.replication.handle_remove_result(device_id, info).await
    }

    /// Records a node's report of a served user download.
    pub async fn node_download_result(
        &self,
        device_id: &str,
        result: crate::types::NodeBlockDownloadResult,
    ) -> Result<(), CoreError> {
        if result.succeeded {
            self.ephemeral
                .incr_device_field(
                    device_id,
                    DeviceField::TotalUpload,
                    result.block_size as i64,
                )
                .await?;
            self.ephemeral
                .incr_base_field(crate::store::BaseField::DownloadCount, 1)
                .await?;
        }
        Ok(())
    }

    /// Returns the public key a node presented at connect.
    pub fn public_key(&self, device_id: &str) -> Result<String, CoreError> {
        self.registry
            .lookup(device_id)
            .map(|s| s.public_key.clone())
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))
    }

    pub async fn auth_node_new(
        &self,
        perms: &[Permission],
        device_id: &str,
        device_secret: &str,
    ) -> Result<String, CoreError> {
        self.auth.node_token_new(perms, device_id, device_secret).await
    }

    pub async fn auth_verify(
        &self,
        token: &str,
        device_ctx: Option<&str>,
    ) -> Result<Vec<Permission>, CoreError> {
        self.auth.verify(token, device_ctx).await
    }

    /// Issues a token signed with the scheduler's global secret.
    pub fn global_token(&self, perms: &[Permission]) -> Result<String, CoreError> {
        self.auth.global_token(perms)
    }

    // --- operator operations ---

    pub async fn cache_carfile(&self, info: CacheCarfileInfo) -> Result<(), CoreError> {
        self.replication.cache_carfile(info).await
    }

    pub async fn remove_carfile(&self, carfile_cid: &str) -> Result<(), CoreError> {
        self.replication.remove_carfile(carfile_cid).await
    }

    pub async fn remove_replica(
        &self,
        carfile_cid: &str,
        device_id: &str,
    ) -> Result<(), CoreError> {
        self.replication.remove_replica(carfile_cid, device_id).await
    }

    pub async fn stop_cache_task(&self, carfile_cid: &str) -> Result<(), CoreError> {
        self.replication.stop_cache_task(carfile_cid).await
    }

    pub async fn reset_expired_time(
        &self,
        carfile_cid: &str,
        expired_time: chrono::DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.replication.reset_expired_time(carfile_cid, expired_time).await
    }

    pub async fn execute_undone_task(&self) -> Result<usize, CoreError> {
        self.replication.execute_undone_task().await
    }

    pub async fn election_validators(&self) -> Result<Vec<String>, CoreError> {
        self.election.start_elect().await
    }

    pub fn validate_switch(&self, enable: bool) {
        self.validation.set_enabled(enable);
    }

    #[must_use]
    pub fn validate_running_state(&self) -> bool {
        self.validation.is_enabled()
    }

    pub async fn validate_start(&self) -> Result<(), CoreError> {
        self.validation.start_once().await
    }

    /// Handles `NodeQuit`: tears the sessions down and restores replicas.
    pub async fn node_quit(&self, device_ids: &[String]) -> Result<(), CoreError> {
        for device_id in device_ids {
            self.registry.on_disconnect(device_id).await?;
        }
        self.publish_online_gauges();
        self.quit.nodes_quit(device_ids).await
    }

    /// Mints fresh registrations (`RegisterNode`).
    ///
    /// A count outside `1..=10` yields an empty list rather than an error.
    pub async fn register_nodes(
        &self,
        node_type: NodeType,
        count: usize,
    ) -> Result<Vec<NodeRegisterInfo>, CoreError> {
        if count == 0 || count > MAX_REGISTER_COUNT {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let registration = Registration {
                device_id: format!(
                    "{}{}",
                    node_type.id_prefix(),
                    uuid::Uuid::new_v4().simple()
                ),
                secret: crate::auth::generate_secret(),
                node_type,
                create_time: Utc::now(),
            };
            self.persistent.bind_registration(&registration).await?;
            out.push(NodeRegisterInfo {
                device_id: registration.device_id,
                secret: registration.secret,
                node_type,
                create_time: registration.create_time,
            });
        }
        Ok(out)
    }

    pub fn reset_backup_cache_count(&self, count: u32) {
        self.replication.reset_backup_cache_count(count);
    }

    // --- queries ---

    pub async fn record_info(
        &self,
        carfile_cid: &str,
    ) -> Result<(CarfileRecord, Vec<Replica>), CoreError> {
        self.replication.record_with_replicas(carfile_cid).await
    }

    pub async fn list_records(&self, page: usize) -> Result<CarfileRecordPage, CoreError> {
        let (records, total) = self.replication.list_records(page).await?;
        Ok(paged(records, total, page))
    }

    pub async fn running_records(&self) -> Result<Vec<CarfileRecord>, CoreError> {
        self.replication.running_records().await
    }

    pub async fn undone_records(&self, page: usize) -> Result<CarfileRecordPage, CoreError> {
        let all = self.replication.undone_records().await?;
        let total = all.len();
        let page = page.max(1);
        let records: Vec<CarfileRecord> = all
            .into_iter()
            .skip((page - 1) * RECORD_PAGE_SIZE)
            .take(RECORD_PAGE_SIZE)
            .collect();
        Ok(paged(records, total, page))
    }

    #[must_use]
    pub fn online_devices(&self, node_type: NodeType) -> Vec<String> {
        self.registry.online_by_type(node_type)
    }

    /// Validators from the current list that still hold a live session.
    pub async fn online_validators(&self) -> Result<Vec<String>, CoreError> {
        let validators = self.ephemeral.validators().await?;
        Ok(validators.into_iter().filter(|v| self.registry.candidate(v).is_some()).collect())
    }

    pub async fn devices_info(&self, device_id: &str) -> Result<DeviceInfo, CoreError> {
        let row = self.persistent.node(device_id).await?;
        Ok(DeviceInfo {
            device_id: device_id.to_string(),
            node_type: row.node_type,
            is_online: self.registry.lookup(device_id).is_some(),
            block_count: self.ephemeral.device_field(device_id, DeviceField::BlockCount).await?,
            total_download: self
                .ephemeral
                .device_field(device_id, DeviceField::TotalDownload)
                .await?,
            total_upload: self
                .ephemeral
                .device_field(device_id, DeviceField::TotalUpload)
                .await?,
            disk_usage: self.ephemeral.device_disk_usage(device_id).await?,
        })
    }

    pub async fn download_infos(
        &self,
        carfile_cid: &str,
        user_public_key: &str,
    ) -> Result<Vec<crate::types::DownloadInfo>, CoreError> {
        self.download.download_infos(carfile_cid, user_public_key).await
    }

    /// Devices queued for the external data-sync collaborator.
    #[must_use]
    pub fn drain_pending_sync(&self) -> Vec<String> {
        self.registry.drain_pending_sync()
    }
}

fn paged(records: Vec<CarfileRecord>, total: usize, page: usize) -> CarfileRecordPage {
    CarfileRecordPage {
        page: page.max(1),
        total_pages: total.div_ceil(RECORD_PAGE_SIZE),
        total,
        records,
    }
}
