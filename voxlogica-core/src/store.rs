//! Durable, content-addressed result storage.
//!
//! One record per `(node_id, runtime_version)`; absence means the node has
//! never been computed under that runtime. Concurrent readers, single
//! writer per key: a writer first obtains a [`Lease`] through
//! [`ContentStore::begin_compute`], computes, then commits exactly once.
//! Failed and killed records are final; the core never deletes records.

use crate::workplan::NodeId;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of a persisted computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Materialized,
    Failed,
    Killed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Materialized => "materialized",
            RecordStatus::Failed => "failed",
            RecordStatus::Killed => "killed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "materialized" => Some(RecordStatus::Materialized),
            "failed" => Some(RecordStatus::Failed),
            "killed" => Some(RecordStatus::Killed),
            _ => None,
        }
    }
}

/// The persisted outcome of computing a node under a runtime version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRecord {
    pub node_id: NodeId,
    pub runtime_version: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload_bytes: u64,
    /// Encoded value for `materialized` records, absent otherwise.
    pub payload: Option<Vec<u8>>,
    /// Operator error message for `failed` records.
    pub error: Option<String>,
    /// Job-level context attached to the failure, when any.
    pub job_error: Option<String>,
}

impl StoreRecord {
    /// The message surfaced to dependents of a non-materialized record.
    pub fn failure_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.job_error.clone())
            .unwrap_or_else(|| format!("node {} ended {}", self.node_id, self.status.as_str()))
    }
}

/// Exclusive, inter-process permission to commit a record for one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub node_id: NodeId,
    pub runtime_version: String,
    /// Owner string, unique per engine instance.
    pub owner: String,
}

/// Outcome of a lease acquisition attempt.
#[derive(Clone, Debug)]
pub enum BeginCompute {
    /// The caller may compute and must commit or abandon.
    Lease(Lease),
    AlreadyComputed(StoreRecord),
    /// A `failed` or `killed` record exists.
    AlreadyFailed(StoreRecord),
    /// Another writer holds the lease; wait and re-poll `get`.
    Contested,
}

/// What a lease holder writes back.
#[derive(Clone, Debug)]
pub enum CommitOutcome {
    Materialized(Vec<u8>),
    Failed(String),
    Killed(String),
}

/// Filter for [`ContentStore::iter`].
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    pub status: Option<RecordStatus>,
    /// Lowercase hex prefix of the node id.
    pub node_prefix: Option<String>,
}

/// Persistence seam for all node outcomes. The engine and the inspection
/// APIs operate exclusively through this trait.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Snapshot-consistent, non-blocking read.
    async fn get(&self, node_id: NodeId, runtime_version: &str) -> Result<Option<StoreRecord>>;

    /// Try to record an in-flight marker for the key.
    ///
    /// Failed and killed records are sticky: they come back as
    /// [`BeginCompute::AlreadyFailed`]. With `overwrite_failed` set the
    /// caller asks to recompute anyway; the store then grants a lease whose
    /// commit replaces the old record.
    async fn begin_compute(
        &self,
        node_id: NodeId,
        runtime_version: &str,
        owner: &str,
        overwrite_failed: bool,
    ) -> Result<BeginCompute>;

    /// Write the final record and release the lease. Durable before
    /// returning.
    async fn commit(&self, lease: Lease, outcome: CommitOutcome) -> Result<()>;

    /// Release a lease without writing a record, freeing the key for the
    /// next acquirer.
    async fn abandon(&self, lease: Lease) -> Result<()>;

    /// List records, newest first, up to `limit`.
    async fn iter(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreRecord>>;
}
