//! HTTP transports for scheduler→node RPCs.
//!
//! Each connected node gets a plain reqwest-backed client handle. Transports
//! hold no reference back into the scheduler, so dropping a session fully
//! releases the connection.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use stratus_core::registry::{NodeTransport, TransportError, TransportFactory};
use stratus_core::types::{CacheInstruction, ReqValidate};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// reqwest-backed transport for one node.
pub struct HttpNodeTransport {
    client: Client,
    base_url: String,
}

impl HttpNodeTransport {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Unreachable(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Rpc(format!("{} returned {}", path, response.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeTransport for HttpNodeTransport {
    async fn validate_blocks(&self, batch: Vec<ReqValidate>) -> Result<(), TransportError> {
        self.post_json("validate", &batch).await
    }

    async fn cache_carfile(&self, instruction: CacheInstruction) -> Result<(), TransportError> {
        self.post_json("cache", &instruction).await
    }

    async fn remove_carfile(&self, carfile_cid: &str) -> Result<(), TransportError> {
        self.post_json("remove", &serde_json::json!({ "carfile_cid": carfile_cid })).await
    }
}

/// Builds [`HttpNodeTransport`]s from a shared connection pool.
pub struct HttpTransportFactory {
    client: Client,
}

impl HttpTransportFactory {
    /// # Errors
    ///
    /// Fails if the underlying client cannot be constructed; fatal at init.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn connect(&self, remote_addr: &str) -> Result<Arc<dyn NodeTransport>, TransportError> {
        Ok(Arc::new(HttpNodeTransport {
            client: self.client.clone(),
            base_url: format!("https://{remote_addr}/rpc/v0"),
        }))
    }
}
