//! Signed download instructions.
//!
//! Users asking for a carfile receive one instruction per online node holding
//! a successful replica. Each instruction carries a serial from the ephemeral
//! counter and a signature over the instruction fields; the signature scheme
//! itself lives behind [`DownloadSigner`] — the core only invokes it.

use crate::error::CoreError;
use crate::registry::NodeRegistry;
use crate::store::{BaseField, EphemeralStore, PersistentStore};
use crate::types::{carfile_hash, DownloadInfo, NodeType, ReplicaStatus};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;

/// Signs download instruction payloads.
pub trait DownloadSigner: Send + Sync {
    fn sign(&self, payload: &str) -> Result<String, CoreError>;
}

/// Default HMAC-SHA256 signer keyed by the scheduler secret.
pub struct HmacDownloadSigner {
    secret: Vec<u8>,
}

impl HmacDownloadSigner {
    #[must_use]
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl DownloadSigner for HmacDownloadSigner {
    fn sign(&self, payload: &str) -> Result<String, CoreError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|_| CoreError::PolicyDenied("unusable signing secret".into()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Produces download instructions for user requests.
pub struct DownloadService {
    registry: Arc<NodeRegistry>,
    persistent: Arc<dyn PersistentStore>,
    ephemeral: Arc<dyn EphemeralStore>,
    signer: Arc<dyn DownloadSigner>,
    timeout_secs: u64,
}

impl DownloadService {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        persistent: Arc<dyn PersistentStore>,
        ephemeral: Arc<dyn EphemeralStore>,
        signer: Arc<dyn DownloadSigner>,
        timeout_secs: u64,
    ) -> Self {
        Self { registry, persistent, ephemeral, signer, timeout_secs }
    }

    /// Builds one signed instruction per online holder of the carfile.
    ///
    /// Offline holders are skipped. An empty list means the content is not
    /// currently retrievable, not an error.
    pub async fn download_infos(
        &self,
        carfile_cid: &str,
        user_public_key: &str,
    ) -> Result<Vec<DownloadInfo>, CoreError> {
        let hash = carfile_hash(carfile_cid);
        let replicas = self.persistent.replicas_of(&hash).await?;

        let mut infos = Vec::new();
        for replica in replicas {
            if replica.status != ReplicaStatus::Succeeded {
                continue;
            }
            let Some(session) = self.registry.lookup(&replica.device_id) else {
                debug!(device_id = %replica.device_id, "holder offline, skipping");
                continue;
            };

            let serial = self.ephemeral.next_download_serial().await?;
            let sign_time = chrono::Utc::now().timestamp();
            let url = format!("https://{}/carfile/{}", session.remote_addr, carfile_cid);
            let payload = format!(
                "{carfile_cid}|{device}|{serial}|{sign_time}|{timeout}|{user_public_key}",
                device = replica.device_id,
                timeout = self.timeout_secs,
            );
            let signature = self.signer.sign(&payload)?;

            // Edges are the serving tier; prefer them over candidates.
            let weight = match session.node_type {
                NodeType::Edge => 2,
                NodeType::Candidate => 1,
            };
            infos.push(DownloadInfo {
                url,
                signature,
                serial,
                sign_time,
                timeout: self.timeout_secs,
                weight,
                device_id: replica.device_id.clone(),
            });
        }

        if !infos.is_empty() {
            self.ephemeral.incr_base_field(BaseField::DownloadCount, 1).await?;
        }
        Ok(infos)
    }
}
