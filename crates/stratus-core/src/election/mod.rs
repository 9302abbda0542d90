//! Validator election.
//!
//! Periodically chooses a validator subset from the online candidate pool and
//! persists it in the ephemeral store with a TTL equal to the election
//! interval. Re-election within the TTL simply replaces the list; if
//! persisting fails the previous list stays live until its TTL expires.

use crate::config::ElectionConfig;
use crate::error::CoreError;
use crate::registry::NodeRegistry;
use crate::store::EphemeralStore;
use crate::types::NodeType;
use crate::validation::rng::SeededRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Election {
    registry: Arc<NodeRegistry>,
    ephemeral: Arc<dyn EphemeralStore>,
    config: ElectionConfig,
}

impl Election {
    #[must_use]
    pub fn new(
        registry: Arc<NodeRegistry>,
        ephemeral: Arc<dyn EphemeralStore>,
        config: ElectionConfig,
    ) -> Self {
        Self { registry, ephemeral, config }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_minutes * 60)
    }

    #[must_use]
    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Runs one election, seeding the shuffle from the clock.
    pub async fn start_elect(&self) -> Result<Vec<String>, CoreError> {
        self.start_elect_with_seed(election_seed()).await
    }

    /// Runs one election with an explicit shuffle seed.
    ///
    /// The chosen list replaces whatever list is currently persisted and
    /// expires after the election interval. With no candidates online an
    /// empty list is persisted and subsequent validation rounds are no-ops.
    pub async fn start_elect_with_seed(&self, seed: u64) -> Result<Vec<String>, CoreError> {
        let mut candidates = self.registry.online_by_type(NodeType::Candidate);
        if candidates.is_empty() {
            warn!("no candidates online, persisting empty validator list");
            self.ephemeral.set_validators(&[], self.interval()).await?;
            return Ok(Vec::new());
        }

        let online_total = self.registry.online_count();
        let wanted =
            (self.config.validator_ratio * online_total as f64).ceil().max(1.0) as usize;
        let count = wanted.min(candidates.len());

        SeededRng::new(seed).shuffle(&mut candidates);
        candidates.truncate(count);
        candidates.sort();

        self.ephemeral.set_validators(&candidates, self.interval()).await?;
        info!(
            validators = candidates.len(),
            online = online_total,
            "validator election complete"
        );
        Ok(candidates)
    }
}

/// Clock-derived shuffle seed for production elections.
fn election_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos() as u64)
}
