//! In-memory implementation of [`ContentStore`] for tests and ephemeral
//! runs. Same locking discipline as the durable backend, no durability.

use crate::store::{
    BeginCompute, CommitOutcome, ContentStore, Lease, RecordFilter, RecordStatus, StoreRecord,
};
use crate::workplan::NodeId;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct LeaseRow {
    owner: String,
    acquired_at: Instant,
}

struct Inner {
    records: HashMap<(NodeId, String), StoreRecord>,
    leases: HashMap<(NodeId, String), LeaseRow>,
    /// Insertion order, for newest-first listing.
    order: Vec<(NodeId, String)>,
}

/// Map-backed store guarded by a single `RwLock`.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    lease_ttl: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::from_secs(300))
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                leases: HashMap::new(),
                order: Vec::new(),
            }),
            lease_ttl,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, node_id: NodeId, runtime_version: &str) -> Result<Option<StoreRecord>> {
        let r = self.inner.read().await;
        Ok(r.records
            .get(&(node_id, runtime_version.to_string()))
            .cloned())
    }

    async fn begin_compute(
        &self,
        node_id: NodeId,
        runtime_version: &str,
        owner: &str,
        overwrite_failed: bool,
    ) -> Result<BeginCompute> {
        let mut w = self.inner.write().await;
        let key = (node_id, runtime_version.to_string());

        if let Some(record) = w.records.get(&key) {
            match record.status {
                RecordStatus::Materialized => {
                    return Ok(BeginCompute::AlreadyComputed(record.clone()))
                }
                RecordStatus::Failed | RecordStatus::Killed if !overwrite_failed => {
                    return Ok(BeginCompute::AlreadyFailed(record.clone()))
                }
                // overwrite_failed: fall through to lease acquisition; the
                // commit will replace the sticky record.
                RecordStatus::Failed | RecordStatus::Killed => {}
            }
        }

        if let Some(existing) = w.leases.get(&key) {
            // Stale leases belong to crashed or hung owners; reclaim.
            if existing.acquired_at.elapsed() < self.lease_ttl {
                return Ok(BeginCompute::Contested);
            }
        }
        w.leases.insert(
            key,
            LeaseRow {
                owner: owner.to_string(),
                acquired_at: Instant::now(),
            },
        );
        Ok(BeginCompute::Lease(Lease {
            node_id,
            runtime_version: runtime_version.to_string(),
            owner: owner.to_string(),
        }))
    }

    async fn commit(&self, lease: Lease, outcome: CommitOutcome) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = (lease.node_id, lease.runtime_version.clone());

        match w.leases.get(&key) {
            Some(row) if row.owner == lease.owner => {}
            Some(_) => return Err(anyhow!("lease for {} reclaimed by another owner", lease.node_id)),
            None => return Err(anyhow!("no lease held for {}", lease.node_id)),
        }

        let now = Utc::now();
        let (status, payload, error) = match outcome {
            CommitOutcome::Materialized(payload) => (RecordStatus::Materialized, Some(payload), None),
            CommitOutcome::Failed(error) => (RecordStatus::Failed, None, Some(error)),
            CommitOutcome::Killed(error) => (RecordStatus::Killed, None, Some(error)),
        };
        // A replaced record keeps its original creation time.
        let created_at = w.records.get(&key).map_or(now, |r| r.created_at);
        let record = StoreRecord {
            node_id: lease.node_id,
            runtime_version: lease.runtime_version.clone(),
            status,
            created_at,
            updated_at: now,
            payload_bytes: payload.as_ref().map_or(0, |p| p.len() as u64),
            payload,
            error,
            job_error: None,
        };
        if w.records.insert(key.clone(), record).is_none() {
            w.order.push(key.clone());
        }
        w.leases.remove(&key);
        Ok(())
    }

    async fn abandon(&self, lease: Lease) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = (lease.node_id, lease.runtime_version);
        if let Some(row) = w.leases.get(&key) {
            if row.owner == lease.owner {
                w.leases.remove(&key);
            }
        }
        Ok(())
    }

    async fn iter(&self, filter: &RecordFilter, limit: usize) -> Result<Vec<StoreRecord>> {
        let r = self.inner.read().await;
        let mut out = Vec::new();
        for key in r.order.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let Some(record) = r.records.get(key) else {
                continue;
            };
            if let Some(status) = filter.status {
                if record.status != status {
                    continue;
                }
            }
            if let Some(prefix) = &filter.node_prefix {
                if !record.node_id.to_hex().starts_with(prefix.as_str()) {
                    continue;
                }
            }
            out.push(record.clone());
        }
        Ok(out)
    }
}
