//! Node selection policy for replica dispatch.
//!
//! Fills the candidate tier first — the root candidate is the lowest-id free
//! candidate with acceptable disk headroom — then edges. A node is skipped
//! when it already holds a non-failed replica of the carfile, is offline, or
//! sits at or above the disk-usage ceiling.

use super::ReplicaManager;
use crate::error::CoreError;
use crate::types::{CarfileRecord, NodeType, ReplicaStatus};
use std::collections::HashSet;

/// Nodes chosen for one dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedNodes {
    /// Candidate-tier targets, lowest device id first; the first entry is
    /// the root candidate.
    pub candidates: Vec<String>,
    /// Edge-tier targets.
    pub edges: Vec<String>,
}

impl SelectedNodes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty() && self.edges.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len() + self.edges.len()
    }
}

impl ReplicaManager {
    /// Selects up to `deficit` eligible nodes for the record.
    pub(crate) async fn select_nodes(
        &self,
        record: &CarfileRecord,
    ) -> Result<SelectedNodes, CoreError> {
        let deficit = record.deficit() as usize;
        if deficit == 0 {
            return Ok(SelectedNodes::default());
        }

        let replicas = self.persistent().replicas_of(&record.carfile_hash).await?;
        let holding: HashSet<&str> = replicas
            .iter()
            .filter(|r| r.status != ReplicaStatus::Failed)
            .map(|r| r.device_id.as_str())
            .collect();
        let candidate_tier_held = replicas
            .iter()
            .filter(|r| r.is_candidate && r.status != ReplicaStatus::Failed)
            .count();

        let candidate_wanted = (self.candidate_replica_target() as usize)
            .saturating_sub(candidate_tier_held)
            .min(deficit);

        let mut selected = SelectedNodes::default();
        for device_id in self.registry().online_by_type(NodeType::Candidate) {
            if selected.candidates.len() >= candidate_wanted {
                break;
            }
            if holding.contains(device_id.as_str()) || !self.has_disk_headroom(&device_id).await {
                continue;
            }
            selected.candidates.push(device_id);
        }

        let edge_wanted = deficit - selected.candidates.len();
        for device_id in self.registry().online_by_type(NodeType::Edge) {
            if selected.edges.len() >= edge_wanted {
                break;
            }
            if holding.contains(device_id.as_str()) || !self.has_disk_headroom(&device_id).await {
                continue;
            }
            selected.edges.push(device_id);
        }

        Ok(selected)
    }

    async fn has_disk_headroom(&self, device_id: &str) -> bool {
        match self.ephemeral().device_disk_usage(device_id).await {
            Ok(usage) => usage < self.max_disk_usage(),
            Err(_) => true,
        }
    }
}
