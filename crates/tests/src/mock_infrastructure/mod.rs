//! Test doubles and cluster fixture.
//!
//! [`TestCluster`] wires a real [`Scheduler`] over the in-memory store
//! backends and a [`RecordingFactory`] whose transports capture every RPC the
//! scheduler makes toward nodes, so tests can assert on dispatch plans and
//! fetch instructions without any network.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_core::config::AppConfig;
use stratus_core::registry::{NodeTransport, TransportError, TransportFactory};
use stratus_core::store::memory::{MemoryEphemeralStore, MemoryPersistentStore};
use stratus_core::store::{PersistentStore, Region};
use stratus_core::types::{CacheInstruction, NodeType, Registration, ReqValidate};
use stratus_core::Scheduler;

/// Transport double that records every RPC it receives.
#[derive(Default)]
pub struct RecordingTransport {
    pub validate_batches: Mutex<Vec<Vec<ReqValidate>>>,
    pub cache_instructions: Mutex<Vec<CacheInstruction>>,
    pub removed_cids: Mutex<Vec<String>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn validate_batch_count(&self) -> usize {
        self.validate_batches.lock().len()
    }

    /// Node URLs challenged in the given batch, in dispatch order.
    #[must_use]
    pub fn batch_urls(&self, index: usize) -> Vec<String> {
        self.validate_batches.lock()[index]
            .iter()
            .map(|req| req.node_url.clone())
            .collect()
    }
}

#[async_trait]
impl NodeTransport for RecordingTransport {
    async fn validate_blocks(&self, batch: Vec<ReqValidate>) -> Result<(), TransportError> {
        self.validate_batches.lock().push(batch);
        Ok(())
    }

    async fn cache_carfile(&self, instruction: CacheInstruction) -> Result<(), TransportError> {
        self.cache_instructions.lock().push(instruction);
        Ok(())
    }

    async fn remove_carfile(&self, carfile_cid: &str) -> Result<(), TransportError> {
        self.removed_cids.lock().push(carfile_cid.to_string());
        Ok(())
    }
}

/// Factory handing each remote address its own recording transport.
#[derive(Default)]
pub struct RecordingFactory {
    transports: Mutex<HashMap<String, Arc<RecordingTransport>>>,
}

impl RecordingFactory {
    /// The transport connected for `remote_addr`, if any.
    #[must_use]
    pub fn transport(&self, remote_addr: &str) -> Option<Arc<RecordingTransport>> {
        self.transports.lock().get(remote_addr).cloned()
    }
}

#[async_trait]
impl TransportFactory for RecordingFactory {
    async fn connect(&self, remote_addr: &str) -> Result<Arc<dyn NodeTransport>, TransportError> {
        let transport = Arc::new(RecordingTransport::default());
        self.transports.lock().insert(remote_addr.to_string(), Arc::clone(&transport));
        Ok(transport as Arc<dyn NodeTransport>)
    }
}

/// A scheduler over in-memory backends with recording transports.
pub struct TestCluster {
    pub scheduler: Scheduler,
    pub persistent: Arc<MemoryPersistentStore>,
    pub ephemeral: Arc<MemoryEphemeralStore>,
    pub factory: Arc<RecordingFactory>,
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    #[must_use]
    pub fn with_config(mut config: AppConfig) -> Self {
        config.scheduler.server_name = "sched-test".into();
        let persistent = Arc::new(MemoryPersistentStore::new(Region::parse("test").unwrap()));
        let ephemeral = Arc::new(MemoryEphemeralStore::new());
        let factory = Arc::new(RecordingFactory::default());
        let scheduler = Scheduler::new(
            &config,
            Arc::clone(&persistent) as Arc<dyn PersistentStore>,
            Arc::clone(&ephemeral) as Arc<dyn stratus_core::store::EphemeralStore>,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            b"test-global-secret".to_vec(),
        );
        Self { scheduler, persistent, ephemeral, factory }
    }

    /// Address a device connects from; one per device so its transport can be
    /// found again.
    #[must_use]
    pub fn addr_of(device_id: &str) -> String {
        format!("{device_id}.nodes.test:2345")
    }

    /// Registers a device with a fixed id and brings it online.
    pub async fn register_and_connect(&self, device_id: &str, node_type: NodeType) {
        self.persistent
            .bind_registration(&Registration {
                device_id: device_id.to_string(),
                secret: format!("secret-{device_id}"),
                node_type,
                create_time: Utc::now(),
            })
            .await
            .unwrap();
        self.scheduler
            .node_connect(device_id, node_type, &Self::addr_of(device_id), String::new())
            .await
            .unwrap();
    }

    /// Transport for a connected device.
    #[must_use]
    pub fn transport_of(&self, device_id: &str) -> Arc<RecordingTransport> {
        self.factory
            .transport(&Self::addr_of(device_id))
            .unwrap_or_else(|| panic!("no transport for {device_id}"))
    }

    /// Seeds the audit surface of a device: its `fid → cid` map and the
    /// block-index bound used for challenges.
    pub async fn seed_blocks(&self, device_id: &str, entries: &[(u64, &str)], max_fid: u64) {
        use stratus_core::store::EphemeralStore;
        for (fid, cid) in entries {
            self.persistent.set_device_fid(device_id, *fid, cid).await.unwrap();
        }
        self.ephemeral.set_node_max_fid(device_id, max_fid).await.unwrap();
    }

    /// Runs queued replication work to completion.
    pub async fn drain_replication(&self) {
        while self.scheduler.replication().process_waiting_once().await.unwrap() {}
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
