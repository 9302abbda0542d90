//! Node departure handling.
//!
//! A departing node loses every replica it held. The handler deletes the
//! rows in one transaction, hands each affected carfile back to the replica
//! manager for restore, and bumps the quit counter. Idempotent: repeating a
//! quit for the same devices finds no rows and changes nothing further.

use crate::error::CoreError;
use crate::replication::ReplicaManager;
use crate::store::{BaseField, EphemeralStore, PersistentStore};
use std::sync::Arc;
use tracing::info;

pub struct QuitHandler {
    persistent: Arc<dyn PersistentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    replica_manager: Arc<ReplicaManager>,
}

impl QuitHandler {
    #[must_use]
    pub fn new(
        persistent: Arc<dyn PersistentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        replica_manager: Arc<ReplicaManager>,
    ) -> Self {
        Self { persistent, ephemeral, replica_manager }
    }

    /// Processes the departure of one or more nodes.
    pub async fn nodes_quit(&self, device_ids: &[String]) -> Result<(), CoreError> {
        if device_ids.is_empty() {
            return Ok(());
        }
        info!(?device_ids, "nodes quitting");

        let affected = self.persistent.carfiles_with_replicas_on(device_ids).await?;
        self.persistent.remove_replicas_on(device_ids).await?;
        for device_id in device_ids {
            self.ephemeral.incr_base_field(BaseField::NodeQuitCount, 1).await?;
            crate::metrics::record_node_quit(1);
            // The departing node's challenge map is stale now.
            self.persistent.clear_device_fids(device_id).await?;
        }

        self.replica_manager.restore_carfiles(&affected).await?;
        Ok(())
    }
}
