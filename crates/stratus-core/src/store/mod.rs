//! Storage interfaces.
//!
//! The scheduler depends on two stores through trait objects and never on a
//! concrete representation:
//!
//! - [`PersistentStore`]: the durable system of record (nodes, registrations,
//!   carfile records, replicas, validation results, per-node block maps).
//! - [`EphemeralStore`]: fast keyed state (round counter, verifying set,
//!   validator list with TTL, per-replica dispatch deadlines, waiting queue,
//!   incrementable counters).
//!
//! Production deployments implement these traits over their own SQL and
//! key-value backends; [`memory`] ships reference implementations used by the
//! test suites and single-node development runs.
//!
//! Multi-writer durable operations must stay row-level or short-transaction
//! only — nothing here may hold a transaction open across a node RPC.

pub mod memory;

use crate::types::{
    CarfileRecord, NodeRow, Registration, Replica, ValidationResultRow, ValidationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by store backends.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested row or key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or state precondition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend is unreachable or timed out; retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected malformed input.
    #[error("invalid store input: {0}")]
    Invalid(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// A validated deployment region tag.
///
/// The persistent layer scopes per-node block maps by region so multiple
/// deployments can share one backend without collisions. The tag is
/// normalized (lowercased, `-` → `_`) and validated against `[a-z0-9_]+`
/// before it is ever interpolated anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region(String);

impl Region {
    /// Normalizes and validates a raw region string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] if the normalized tag is empty or
    /// contains characters outside `[a-z0-9_]`.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        if normalized.is_empty() {
            return Err(StoreError::Invalid("empty region tag".into()));
        }
        if !normalized.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_') {
            return Err(StoreError::Invalid(format!("invalid region tag: {raw}")));
        }
        Ok(Region(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incrementable per-device counter fields (`device_info:<device>` hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceField {
    BlockCount,
    TotalDownload,
    TotalUpload,
}

impl DeviceField {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceField::BlockCount => "block_count",
            DeviceField::TotalDownload => "total_download",
            DeviceField::TotalUpload => "total_upload",
        }
    }
}

/// Global counter fields kept in the ephemeral store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseField {
    CarfileCount,
    NodeQuitCount,
    DownloadCount,
}

impl BaseField {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseField::CarfileCount => "carfile_count",
            BaseField::NodeQuitCount => "node_quit_count",
            BaseField::DownloadCount => "download_count",
        }
    }
}

/// An entry in the replication waiting queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingTask {
    pub carfile_hash: String,
    pub carfile_cid: String,
}

/// A `(device, carfile)` pair whose dispatch deadline expired.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpiredCaching {
    pub device_id: String,
    pub carfile_hash: String,
}

/// Durable system of record.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    // --- node presence ---

    async fn upsert_node(&self, row: &NodeRow) -> Result<(), StoreError>;
    async fn node(&self, device_id: &str) -> Result<NodeRow, StoreError>;
    async fn set_node_offline(&self, device_id: &str, last_time: DateTime<Utc>)
        -> Result<(), StoreError>;
    /// Marks every node owned by `server_name` offline; rows owned by other
    /// schedulers are untouched.
    async fn set_all_offline(&self, server_name: &str) -> Result<(), StoreError>;

    // --- registrations ---

    async fn bind_registration(&self, reg: &Registration) -> Result<(), StoreError>;
    async fn registration(&self, device_id: &str) -> Result<Registration, StoreError>;

    // --- validation results ---

    /// Inserts the `Created` row for `(round_id, device_id)`.
    async fn insert_validation_result(&self, row: &ValidationResultRow) -> Result<(), StoreError>;
    /// Applies the terminal status for `(round_id, device_id)` exactly once.
    async fn finish_validation_result(
        &self,
        round_id: u64,
        device_id: &str,
        status: ValidationStatus,
        msg: &str,
        block_count: u32,
        bandwidth: f64,
        duration: u64,
        end_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn validation_result(
        &self,
        round_id: u64,
        device_id: &str,
    ) -> Result<ValidationResultRow, StoreError>;

    // --- per-node block maps ---

    /// Number of cached content units the node holds.
    async fn device_block_count(&self, device_id: &str) -> Result<u64, StoreError>;
    /// The node's dense `fid → cid` challenge map.
    async fn device_fid_map(&self, device_id: &str) -> Result<HashMap<u64, String>, StoreError>;
    /// Records one `fid → cid` entry for a node (written by data-sync).
    async fn set_device_fid(&self, device_id: &str, fid: u64, cid: &str) -> Result<(), StoreError>;
    async fn clear_device_fids(&self, device_id: &str) -> Result<(), StoreError>;

    // --- carfile records ---

    async fn upsert_carfile_record(&self, record: &CarfileRecord) -> Result<(), StoreError>;
    async fn carfile_record(&self, carfile_hash: &str) -> Result<CarfileRecord, StoreError>;
    /// Page through records, newest first. Returns the slice and total count.
    async fn carfile_records(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<CarfileRecord>, usize), StoreError>;
    /// Records with `cur_reliability < need_reliability` not in a terminal state.
    async fn undone_carfile_records(&self) -> Result<Vec<CarfileRecord>, StoreError>;
    /// Records currently in the `running` state.
    async fn running_carfile_records(&self) -> Result<Vec<CarfileRecord>, StoreError>;
    async fn remove_carfile_record(&self, carfile_hash: &str) -> Result<(), StoreError>;

    // --- replicas ---

    async fn upsert_replica(&self, replica: &Replica) -> Result<(), StoreError>;
    async fn replica(&self, carfile_hash: &str, device_id: &str) -> Result<Replica, StoreError>;
    async fn replicas_of(&self, carfile_hash: &str) -> Result<Vec<Replica>, StoreError>;
    async fn replicas_on_device(&self, device_id: &str) -> Result<Vec<Replica>, StoreError>;
    async fn remove_replica(&self, carfile_hash: &str, device_id: &str) -> Result<(), StoreError>;
    /// Carfile hashes that have a replica on any of the given devices.
    async fn carfiles_with_replicas_on(
        &self,
        device_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;
    /// Deletes every replica row on the given devices in one transaction.
    async fn remove_replicas_on(&self, device_ids: &[String]) -> Result<(), StoreError>;
    async fn succeeded_replica_count(&self, carfile_hash: &str) -> Result<u32, StoreError>;
}

/// Fast keyed state shared between engine tasks.
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Advances the round counter, returning `(previous, current)`.
    async fn incr_round_id(&self) -> Result<(u64, u64), StoreError>;

    // --- verifying set ---

    async fn add_verifying(&self, device_id: &str) -> Result<(), StoreError>;
    async fn remove_verifying(&self, device_id: &str) -> Result<(), StoreError>;
    async fn verifying(&self) -> Result<Vec<String>, StoreError>;
    async fn clear_verifying(&self) -> Result<(), StoreError>;
    async fn verifying_count(&self) -> Result<u64, StoreError>;

    // --- validator list ---

    /// Replaces the validator list; it expires after `ttl`.
    async fn set_validators(&self, device_ids: &[String], ttl: Duration) -> Result<(), StoreError>;
    /// Current validator list; empty once the TTL has lapsed.
    async fn validators(&self) -> Result<Vec<String>, StoreError>;

    // --- node block-index high-water marks ---

    async fn node_max_fid(&self, device_id: &str) -> Result<u64, StoreError>;
    async fn set_node_max_fid(&self, device_id: &str, max_fid: u64) -> Result<(), StoreError>;

    // --- replica dispatch deadlines ---

    /// Arms the `caching:<device>:<hash>` key with the dispatch timeout.
    async fn begin_caching(
        &self,
        device_id: &str,
        carfile_hash: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;
    async fn end_caching(&self, device_id: &str, carfile_hash: &str) -> Result<(), StoreError>;
    /// Pops every pair whose deadline has lapsed.
    async fn take_expired_caching(&self) -> Result<Vec<ExpiredCaching>, StoreError>;

    // --- waiting queue ---

    async fn push_waiting(&self, task: &WaitingTask) -> Result<(), StoreError>;
    async fn pop_waiting(&self) -> Result<Option<WaitingTask>, StoreError>;
    async fn remove_waiting(&self, carfile_hash: &str) -> Result<(), StoreError>;

    // --- counters ---

    async fn incr_device_field(
        &self,
        device_id: &str,
        field: DeviceField,
        delta: i64,
    ) -> Result<i64, StoreError>;
    async fn device_field(&self, device_id: &str, field: DeviceField) -> Result<i64, StoreError>;
    async fn set_device_disk_usage(&self, device_id: &str, usage: f64) -> Result<(), StoreError>;
    async fn device_disk_usage(&self, device_id: &str) -> Result<f64, StoreError>;
    async fn incr_base_field(&self, field: BaseField, delta: i64) -> Result<i64, StoreError>;
    async fn base_field(&self, field: BaseField) -> Result<i64, StoreError>;

    /// Monotonic serial for signed download instructions.
    async fn next_download_serial(&self) -> Result<u64, StoreError>;
}
