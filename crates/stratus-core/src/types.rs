//! Core type definitions for the scheduler data model.
//!
//! # Type Categories
//!
//! ## Durable records
//! - [`NodeRow`], [`Registration`]: node identity and presence
//! - [`CarfileRecord`], [`Replica`]: replication state (system of record)
//! - [`ValidationResultRow`]: per-round audit outcomes
//!
//! ## Wire types
//! - [`ReqValidate`], [`ValidateResults`]: challenge dispatch and results
//! - [`CacheResultInfo`], [`RemoveCarfileResultInfo`]: node progress callbacks
//! - [`DownloadInfo`]: signed download instructions handed to users
//!
//! Carfile identity is carried in two forms: the user-facing root CID and the
//! `carfile_hash` derived from it (see [`carfile_hash`]), which keys every
//! durable row so that re-encodings of the same CID cannot fork a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Kind of a storage node.
///
/// Candidates seed carfiles and are eligible to act as validators; edges
/// serve end users and pull content from candidates. A device's type is fixed
/// at registration and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Edge,
    Candidate,
}

impl NodeType {
    /// Static string form for logs and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Edge => "edge",
            NodeType::Candidate => "candidate",
        }
    }

    /// Device-id prefix used when allocating registrations.
    #[must_use]
    pub fn id_prefix(&self) -> &'static str {
        match self {
            NodeType::Edge => "e_",
            NodeType::Candidate => "c_",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised when a CID fails basic shape validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CidError {
    #[error("empty cid")]
    Empty,
    #[error("cid contains non-printable characters")]
    NotPrintable,
}

/// Derives the carfile hash from a root CID.
///
/// The hash is the lowercase hex SHA-256 of the whitespace-trimmed CID
/// string. It is the primary key of every carfile-scoped durable row, so the
/// derivation must stay stable across releases.
#[must_use]
pub fn carfile_hash(carfile_cid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(carfile_cid.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalizes a CID for audit comparison and returns its hash.
///
/// Validators and the scheduler may hold differently-cased renderings of the
/// same identifier; comparison happens on the normalized hash, never on the
/// raw string.
pub fn normalized_cid_hash(cid: &str) -> Result<String, CidError> {
    let trimmed = cid.trim();
    if trimmed.is_empty() {
        return Err(CidError::Empty);
    }
    if trimmed.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(CidError::NotPrintable);
    }
    Ok(carfile_hash(&trimmed.to_ascii_lowercase()))
}

/// Durable node presence row (`node` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRow {
    pub device_id: String,
    pub node_type: NodeType,
    pub is_online: bool,
    /// Last remote address the node connected from.
    pub address: String,
    /// Geo tag resolved by the external geolocation collaborator; opaque here.
    pub geo: String,
    /// Scheduler instance that owns this row's presence state.
    pub server_name: String,
    pub last_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
}

/// Immutable registration row (`register` table).
///
/// Created once by [`crate::scheduler::Scheduler::register_nodes`]; the
/// secret authenticates the device for token issuance and connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub device_id: String,
    pub secret: String,
    pub node_type: NodeType,
    pub create_time: DateTime<Utc>,
}

/// Registration details returned to the operator from node allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegisterInfo {
    pub device_id: String,
    pub secret: String,
    pub node_type: NodeType,
    pub create_time: DateTime<Utc>,
}

/// State of a single replica row.
///
/// Moves `Pending → Running → {Succeeded, Failed}` only; terminal states set
/// `end_time` on the row. A `Succeeded` replica is what counts toward a
/// record's `cur_reliability`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl ReplicaStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicaStatus::Failed | ReplicaStatus::Succeeded)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaStatus::Pending => "pending",
            ReplicaStatus::Running => "running",
            ReplicaStatus::Failed => "failed",
            ReplicaStatus::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of a carfile record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Removed,
}

impl RecordStatus {
    /// `end_time` is non-null iff the record is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordStatus::Succeeded | RecordStatus::Failed | RecordStatus::Removed
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Running => "running",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
            RecordStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable carfile record (`carfile_record` table), one per root CID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarfileRecord {
    pub carfile_cid: String,
    pub carfile_hash: String,
    /// Target number of successful replicas.
    pub need_reliability: u32,
    /// Number of currently successful replicas.
    pub cur_reliability: u32,
    pub total_size: u64,
    pub total_blocks: u32,
    pub status: RecordStatus,
    pub expired_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl CarfileRecord {
    /// Remaining replicas needed to reach the target.
    #[must_use]
    pub fn deficit(&self) -> u32 {
        self.need_reliability.saturating_sub(self.cur_reliability)
    }
}

/// Durable replica row (`replica` table), unique per `(carfile_hash, device_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub carfile_hash: String,
    pub device_id: String,
    pub status: ReplicaStatus,
    pub done_size: u64,
    pub done_blocks: u32,
    /// Whether this replica sits on the candidate (seeding) tier.
    pub is_candidate: bool,
    pub created_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Outcome of one device's audit in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    /// Row inserted at dispatch; not yet resolved.
    Created,
    Success,
    Fail,
    Timeout,
    Cancelled,
    /// The audited node's block map could not be queried.
    Other,
}

impl ValidationStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ValidationStatus::Created)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Created => "created",
            ValidationStatus::Success => "success",
            ValidationStatus::Fail => "fail",
            ValidationStatus::Timeout => "timeout",
            ValidationStatus::Cancelled => "cancelled",
            ValidationStatus::Other => "other",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable validation result row (`validate_result` table), compound-keyed by
/// `(round_id, device_id)`. Inserted with status [`ValidationStatus::Created`]
/// when the round dispatches and finished exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResultRow {
    pub round_id: u64,
    pub device_id: String,
    pub validator_id: String,
    pub status: ValidationStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Number of CIDs the audited node returned.
    pub block_count: u32,
    /// Reported bandwidth during the challenge, bytes per second.
    pub bandwidth: f64,
    /// Challenge duration reported by the node, milliseconds.
    pub duration: u64,
    pub msg: String,
    pub server_name: String,
}

/// One challenge entry in a validator's dispatch batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqValidate {
    /// Shared round seed; the audited node must draw challenge positions from
    /// the same seeded stream the scheduler scores with.
    pub seed: u64,
    /// Address of the node to audit.
    pub node_url: String,
    /// Maximum challenge duration in seconds.
    pub duration: u64,
    pub round_id: u64,
    pub node_type: NodeType,
    /// Upper bound of the audited node's block-index space.
    pub max_fid: u64,
}

/// Result posted by an audited node at the end of a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResults {
    pub round_id: u64,
    pub device_id: String,
    /// Filled in from the authenticated caller, never trusted from the body.
    #[serde(default)]
    pub validator_id: String,
    pub cids: Vec<String>,
    pub random_count: u32,
    /// Bytes per second observed by the validator.
    pub bandwidth: f64,
    /// Milliseconds spent serving the challenge.
    pub cost_time: u64,
    pub is_cancel: bool,
    pub is_timeout: bool,
}

/// Progress callback from a node carrying out a caching instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheResultInfo {
    pub carfile_hash: String,
    pub status: ReplicaStatus,
    #[serde(default)]
    pub msg: String,
    pub done_size: u64,
    pub done_blocks: u32,
    pub total_block_count: u32,
    pub carfile_size: u64,
    /// Node disk usage percentage after the operation.
    pub disk_usage: f64,
}

/// Report from a node that served (or failed to serve) a user block download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBlockDownloadResult {
    pub serial: u64,
    pub block_size: u64,
    pub succeeded: bool,
    #[serde(default)]
    pub failed_reason: String,
}

/// Acknowledgement from a node that deleted a carfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveCarfileResultInfo {
    pub carfile_hash: String,
    pub block_count: u32,
    pub disk_usage: f64,
}

/// A caching request accepted from an operator or user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCarfileInfo {
    pub carfile_cid: String,
    pub need_reliability: u32,
    pub expired_time: DateTime<Utc>,
    /// When set, cache onto this specific device instead of running the
    /// selection policy.
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Source entry inside a fetch instruction: where an edge pulls blocks from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSource {
    pub url: String,
    pub device_id: String,
}

/// Fetch instruction dispatched to a node chosen to hold a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInstruction {
    pub carfile_cid: String,
    pub carfile_hash: String,
    /// Candidate-tier sources; empty for candidate nodes, which seed from the
    /// content network directly.
    pub sources: Vec<DownloadSource>,
}

/// Signed download instruction returned to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub url: String,
    pub signature: String,
    pub serial: u64,
    /// Unix timestamp at which the signature was produced.
    pub sign_time: i64,
    /// Seconds the instruction stays valid.
    pub timeout: u64,
    pub weight: u32,
    pub device_id: String,
}

/// Device information assembled for `GetDevicesInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub node_type: NodeType,
    pub is_online: bool,
    pub block_count: i64,
    pub total_download: i64,
    pub total_upload: i64,
    pub disk_usage: f64,
}

/// One page of carfile records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarfileRecordPage {
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
    pub records: Vec<CarfileRecord>,
}
