//! Live node session tracking.
//!
//! The registry owns the in-memory view of connected edge and candidate
//! nodes. Each session carries the transport handle used to make RPCs back to
//! the node; durable presence (`node` table) is written through the
//! persistent store on every transition.
//!
//! Transports are plain client handles produced by a [`TransportFactory`] —
//! they hold no reference back into the scheduler, so dropping a session is
//! enough to release the connection. Callbacks that need a node later look it
//! up by device id at invocation time.
//!
//! Locks on the session maps are never held across a store write or RPC.

use crate::error::CoreError;
use crate::store::PersistentStore;
use crate::types::{CacheInstruction, NodeRow, NodeType, ReqValidate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from node-bound RPCs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("node rpc timed out")]
    Timeout,

    #[error("node rpc failed: {0}")]
    Rpc(String),
}

/// RPC surface the scheduler invokes on a connected node.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    /// Hands a validator its audit batch for the round.
    async fn validate_blocks(&self, batch: Vec<ReqValidate>) -> Result<(), TransportError>;

    /// Instructs the node to fetch and cache a carfile.
    async fn cache_carfile(&self, instruction: CacheInstruction) -> Result<(), TransportError>;

    /// Instructs the node to delete a carfile.
    async fn remove_carfile(&self, carfile_cid: &str) -> Result<(), TransportError>;
}

/// Builds transports for freshly connected nodes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, remote_addr: &str) -> Result<Arc<dyn NodeTransport>, TransportError>;
}

/// A live node session.
pub struct NodeSession {
    pub device_id: String,
    pub node_type: NodeType,
    pub remote_addr: String,
    pub public_key: String,
    transport: Arc<dyn NodeTransport>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("device_id", &self.device_id)
            .field("node_type", &self.node_type)
            .field("remote_addr", &self.remote_addr)
            .field("public_key", &self.public_key)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

impl NodeSession {
    #[must_use]
    pub fn transport(&self) -> Arc<dyn NodeTransport> {
        Arc::clone(&self.transport)
    }

    pub fn mark_seen(&self) {
        *self.last_seen.lock() = Utc::now();
    }

    #[must_use]
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.lock()
    }
}

/// Parameters of a node connect.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub device_id: String,
    pub node_type: NodeType,
    pub remote_addr: String,
    pub public_key: String,
    /// Geo tag resolved by the external geolocation collaborator.
    pub geo: String,
}

/// In-memory map of live edge and candidate sessions.
pub struct NodeRegistry {
    edges: RwLock<HashMap<String, Arc<NodeSession>>>,
    candidates: RwLock<HashMap<String, Arc<NodeSession>>>,
    persistent: Arc<dyn PersistentStore>,
    server_name: String,
    /// Devices awaiting pick-up by the external data-sync component.
    pending_sync: Mutex<Vec<String>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new(persistent: Arc<dyn PersistentStore>, server_name: String) -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
            candidates: RwLock::new(HashMap::new()),
            persistent,
            server_name,
            pending_sync: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn map_for(&self, node_type: NodeType) -> &RwLock<HashMap<String, Arc<NodeSession>>> {
        match node_type {
            NodeType::Edge => &self.edges,
            NodeType::Candidate => &self.candidates,
        }
    }

    /// Registers a freshly connected node.
    ///
    /// Fails with [`CoreError::UnknownDevice`] when no registration row
    /// exists and [`CoreError::TypeMismatch`] when the claimed type disagrees
    /// with the registration. Any prior session for the device is released
    /// before the new one is installed, so a reconnect observes the old
    /// transport dropped first.
    pub async fn on_connect(
        &self,
        req: ConnectRequest,
        transport: Arc<dyn NodeTransport>,
    ) -> Result<Arc<NodeSession>, CoreError> {
        let registration = self.persistent.registration(&req.device_id).await.map_err(|e| {
            if e.is_not_found() {
                CoreError::UnknownDevice(req.device_id.clone())
            } else {
                CoreError::Store(e)
            }
        })?;
        if registration.node_type != req.node_type {
            return Err(CoreError::TypeMismatch {
                device_id: req.device_id,
                registered: registration.node_type,
                actual: req.node_type,
            });
        }

        let session = Arc::new(NodeSession {
            device_id: req.device_id.clone(),
            node_type: req.node_type,
            remote_addr: req.remote_addr.clone(),
            public_key: req.public_key,
            transport,
            last_seen: Mutex::new(Utc::now()),
        });

        {
            let mut map = self.map_for(req.node_type).write();
            if let Some(previous) = map.remove(&req.device_id) {
                // Reconnect: the old transport must be gone before the new
                // session becomes visible.
                drop(previous);
                info!(device_id = %req.device_id, "replacing existing session on reconnect");
            }
            map.insert(req.device_id.clone(), Arc::clone(&session));
        }

        let create_time = match self.persistent.node(&req.device_id).await {
            Ok(row) => row.create_time,
            Err(e) if e.is_not_found() => Utc::now(),
            Err(e) => return Err(CoreError::Store(e)),
        };
        self.persistent
            .upsert_node(&NodeRow {
                device_id: req.device_id.clone(),
                node_type: req.node_type,
                is_online: true,
                address: req.remote_addr,
                geo: req.geo,
                server_name: self.server_name.clone(),
                last_time: Utc::now(),
                create_time,
            })
            .await?;

        self.pending_sync.lock().push(req.device_id.clone());
        info!(device_id = %req.device_id, node_type = %req.node_type, "node online");
        Ok(session)
    }

    /// Marks a node offline and destroys its session.
    pub async fn on_disconnect(&self, device_id: &str) -> Result<(), CoreError> {
        let removed = {
            let removed_edge = self.edges.write().remove(device_id);
            let removed_candidate = self.candidates.write().remove(device_id);
            removed_edge.or(removed_candidate)
        };
        if removed.is_none() {
            warn!(device_id, "disconnect for unknown session");
        }
        match self.persistent.set_node_offline(device_id, Utc::now()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(CoreError::Store(e)),
        }
        info!(device_id, "node offline");
        Ok(())
    }

    /// Looks up a live session of either type.
    #[must_use]
    pub fn lookup(&self, device_id: &str) -> Option<Arc<NodeSession>> {
        self.edges
            .read()
            .get(device_id)
            .cloned()
            .or_else(|| self.candidates.read().get(device_id).cloned())
    }

    #[must_use]
    pub fn candidate(&self, device_id: &str) -> Option<Arc<NodeSession>> {
        self.candidates.read().get(device_id).cloned()
    }

    /// Online device ids of the given type, sorted for deterministic
    /// iteration.
    #[must_use]
    pub fn online_by_type(&self, node_type: NodeType) -> Vec<String> {
        let mut ids: Vec<String> = self.map_for(node_type).read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Total number of online nodes across both types.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.edges.read().len() + self.candidates.read().len()
    }

    /// Marks every node owned by this scheduler offline in the persistent
    /// store. Called once at startup, before any node can connect.
    pub async fn set_all_offline(&self) -> Result<(), CoreError> {
        self.persistent.set_all_offline(&self.server_name).await?;
        Ok(())
    }

    /// Drains the list of devices awaiting external data-sync.
    #[must_use]
    pub fn drain_pending_sync(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_sync.lock())
    }
}

/// Shared fixtures for crate-internal tests.
#[cfg(test)]
pub mod tests_support {
    use super::*;
    use crate::store::memory::MemoryPersistentStore;
    use crate::store::Region;
    use crate::types::Registration;

    /// Transport double that accepts every call.
    pub struct NoopTransport;

    /// Factory producing [`NoopTransport`]s.
    pub struct NoopFactory;

    #[async_trait]
    impl TransportFactory for NoopFactory {
        async fn connect(
            &self,
            _remote_addr: &str,
        ) -> Result<Arc<dyn NodeTransport>, TransportError> {
            Ok(Arc::new(NoopTransport))
        }
    }

    #[async_trait]
    impl NodeTransport for NoopTransport {
        async fn validate_blocks(&self, _batch: Vec<ReqValidate>) -> Result<(), TransportError> {
            Ok(())
        }
        async fn cache_carfile(
            &self,
            _instruction: CacheInstruction,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn remove_carfile(&self, _carfile_cid: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Builds a registry over a fresh memory store with every listed device
    /// registered and connected.
    pub async fn registry_with_online(devices: &[(&str, NodeType)]) -> Arc<NodeRegistry> {
        let store = Arc::new(MemoryPersistentStore::new(Region::parse("test").unwrap()));
        for (id, node_type) in devices {
            store
                .bind_registration(&Registration {
                    device_id: (*id).to_string(),
                    secret: format!("secret-{id}"),
                    node_type: *node_type,
                    create_time: Utc::now(),
                })
                .await
                .unwrap();
        }
        let registry = Arc::new(NodeRegistry::new(store, "sched-test".into()));
        for (id, node_type) in devices {
            registry
                .on_connect(
                    ConnectRequest {
                        device_id: (*id).to_string(),
                        node_type: *node_type,
                        remote_addr: format!("10.0.0.1:{}", 2000 + id.len()),
                        public_key: String::new(),
                        geo: String::new(),
                    },
                    Arc::new(NoopTransport),
                )
                .await
                .unwrap();
        }
        registry
    }
}
