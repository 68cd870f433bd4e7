//! Job submission, tracking, and cancellation.
//!
//! A job wraps one engine execution: either a whole program (`run`) or a
//! single node demanded by the resolver (`value`). Records are kept in
//! memory up to a bounded count with FIFO eviction of terminal jobs; the
//! full log spills to one file per job while the record keeps a rolling
//! tail.

use crate::ast::Program;
use crate::cancel::CancellationToken;
use crate::engine::{CacheSummary, ExecuteOptions, ExecutionEngine, NodeEvent};
use crate::reducer;
use crate::workplan::{NodeId, Workplan};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Run,
    Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }
}

/// Options forwarded to the engine for `run` jobs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub recompute_failed: bool,
    #[serde(default)]
    pub workers: Option<usize>,
}

/// What a job executes.
#[derive(Clone, Debug)]
pub enum JobRequest {
    Run {
        program: Program,
        options: RunOptions,
    },
    /// Single-node job synthesized by the resolver: the sliced plan plus
    /// its target.
    Value { plan: Workplan, target: NodeId },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Run { .. } => JobKind::Run,
            JobRequest::Value { .. } => JobKind::Value,
        }
    }

    /// Compact request parameters persisted on the job record.
    fn params(&self) -> serde_json::Value {
        match self {
            JobRequest::Run { program, options } => serde_json::json!({
                "commands": program.commands.len(),
                "recompute_failed": options.recompute_failed,
                "workers": options.workers,
            }),
            JobRequest::Value { plan, target } => serde_json::json!({
                "target": target.to_hex(),
                "nodes": plan.len(),
            }),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct JobMetrics {
    pub summary: Option<CacheSummary>,
    pub duration_ms: Option<u64>,
}

/// Snapshot of one job.
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub request_params: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: JobMetrics,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Rolling window of the job log; the full log lives in the spill
    /// file.
    pub log_tail: Vec<String>,
    /// Node hex id → error message for failed and poisoned nodes.
    pub execution_errors: BTreeMap<String, String>,
}

struct JobEntry {
    record: JobRecord,
    target: Option<NodeId>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct JobsInner {
    jobs: HashMap<Uuid, JobEntry>,
    order: VecDeque<Uuid>,
}

/// Mutex-guarded job table over one engine. The mutex is never held
/// across an await: handles are taken out under the lock and awaited
/// outside it.
pub struct JobManager {
    engine: Arc<ExecutionEngine>,
    inner: Mutex<JobsInner>,
    log_dir: PathBuf,
    retention: usize,
    tail_capacity: usize,
}

impl JobManager {
    pub fn new(engine: Arc<ExecutionEngine>) -> Result<Self> {
        let config = engine.config().clone();
        let log_dir = config.data_root.join("job-logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("create job log dir {}", log_dir.display()))?;
        Ok(Self {
            engine,
            inner: Mutex::new(JobsInner {
                jobs: HashMap::new(),
                order: VecDeque::new(),
            }),
            log_dir,
            retention: config.job_retention,
            tail_capacity: config.log_tail_capacity,
        })
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Enqueue a job and schedule it asynchronously.
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> Uuid {
        let job_id = Uuid::now_v7();
        let record = JobRecord {
            job_id,
            kind: request.kind(),
            request_params: request.params(),
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            metrics: JobMetrics::default(),
            result: None,
            error: None,
            log_tail: Vec::new(),
            execution_errors: BTreeMap::new(),
        };
        let cancel = CancellationToken::new();
        let target = match &request {
            JobRequest::Value { target, .. } => Some(*target),
            JobRequest::Run { .. } => None,
        };

        {
            let mut inner = self.inner.lock().expect("job manager poisoned");
            inner.jobs.insert(
                job_id,
                JobEntry {
                    record,
                    target,
                    cancel: cancel.clone(),
                    handle: None,
                },
            );
            inner.order.push_back(job_id);
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.run_job(job_id, request, cancel).await;
        });
        {
            let mut inner = self.inner.lock().expect("job manager poisoned");
            if let Some(entry) = inner.jobs.get_mut(&job_id) {
                entry.handle = Some(handle);
            }
        }
        tracing::info!(job_id = %job_id, "job submitted");
        job_id
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        let inner = self.inner.lock().expect("job manager poisoned");
        inner.jobs.get(&job_id).map(|entry| entry.record.clone())
    }

    /// Snapshots, newest first, optionally filtered by kind.
    pub fn list(&self, kind: Option<JobKind>) -> Vec<JobRecord> {
        let inner = self.inner.lock().expect("job manager poisoned");
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|entry| kind.is_none_or(|k| entry.record.kind == k))
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Cooperatively cancel a job and return its final record.
    pub async fn kill(&self, job_id: Uuid) -> Option<JobRecord> {
        let handle = {
            let mut inner = self.inner.lock().expect("job manager poisoned");
            let entry = inner.jobs.get_mut(&job_id)?;
            entry.cancel.cancel();
            entry.handle.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.get(job_id)
    }

    /// A queued or running `value` job targeting `node`, if any. Used by
    /// the resolver to avoid duplicate single-node jobs.
    pub fn find_active_value_job(&self, node: NodeId) -> Option<(Uuid, JobStatus)> {
        let inner = self.inner.lock().expect("job manager poisoned");
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .find(|entry| entry.target == Some(node) && !entry.record.status.is_terminal())
            .map(|entry| (entry.record.job_id, entry.record.status))
    }

    fn append_log(&self, job_id: Uuid, line: &str) {
        let mut inner = self.inner.lock().expect("job manager poisoned");
        if let Some(entry) = inner.jobs.get_mut(&job_id) {
            if entry.record.log_tail.len() == self.tail_capacity {
                entry.record.log_tail.remove(0);
            }
            entry.record.log_tail.push(line.to_string());
        }
    }

    fn update<F: FnOnce(&mut JobRecord)>(&self, job_id: Uuid, f: F) {
        let mut inner = self.inner.lock().expect("job manager poisoned");
        if let Some(entry) = inner.jobs.get_mut(&job_id) {
            f(&mut entry.record);
        }
    }

    /// FIFO eviction of terminal jobs beyond the retention bound.
    fn evict(&self) {
        let mut inner = self.inner.lock().expect("job manager poisoned");
        while inner.order.len() > self.retention {
            let Some(pos) = inner
                .order
                .iter()
                .position(|id| {
                    inner
                        .jobs
                        .get(id)
                        .is_none_or(|entry| entry.record.status.is_terminal())
                })
            else {
                break;
            };
            let Some(evicted) = inner.order.remove(pos) else {
                break;
            };
            inner.jobs.remove(&evicted);
        }
    }

    fn log_path(&self, job_id: Uuid) -> PathBuf {
        self.log_dir.join(format!("job-{job_id}.log"))
    }

    /// Drain engine events into the rolling tail and the spill file.
    fn spawn_log_drain(
        self: &Arc<Self>,
        job_id: Uuid,
        mut events: mpsc::UnboundedReceiver<NodeEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(manager.log_path(job_id))
                .await
                .ok();
            while let Some(event) = events.recv().await {
                let line = match &event.error {
                    Some(error) => format!(
                        "node {} {} {:?} ({}ms): {error}",
                        event.node_id.short(),
                        event.operator,
                        event.status,
                        event.duration_ms
                    ),
                    None => format!(
                        "node {} {} {:?} ({}ms)",
                        event.node_id.short(),
                        event.operator,
                        event.status,
                        event.duration_ms
                    ),
                };
                if let Some(file) = file.as_mut() {
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.write_all(b"\n").await;
                }
                manager.append_log(job_id, &line);
            }
        })
    }

    async fn run_job(self: Arc<Self>, job_id: Uuid, request: JobRequest, cancel: CancellationToken) {
        self.update(job_id, |record| {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        });
        self.append_log(job_id, "job started");
        let started = std::time::Instant::now();

        // Resolve the plan. Static reduction errors fail the job before
        // any execution.
        let (plan, run_options) = match &request {
            JobRequest::Run { program, options } => {
                match reducer::reduce_program(program, self.engine.registry()) {
                    Ok(reduced) => (reduced.workplan, options.clone()),
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "reduction failed");
                        self.append_log(job_id, &format!("reduction failed: {e}"));
                        self.update(job_id, |record| {
                            record.status = JobStatus::Failed;
                            record.error = Some(format!("{}: {e}", e.code()));
                            record.finished_at = Some(Utc::now());
                        });
                        self.evict();
                        return;
                    }
                }
            }
            JobRequest::Value { plan, .. } => (plan.clone(), RunOptions::default()),
        };
        self.append_log(job_id, &format!("plan has {} node(s)", plan.len()));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let drain = self.spawn_log_drain(job_id, event_rx);

        let options = ExecuteOptions {
            workers: run_options.workers,
            recompute_failed: run_options.recompute_failed,
            event_sink: Some(event_tx),
        };
        let outcome = self.engine.execute(&plan, options, cancel).await;
        // Close the sink side and let the drain finish writing.
        let _ = drain.await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                let status = if result.killed {
                    JobStatus::Killed
                } else {
                    JobStatus::Completed
                };
                let execution_errors: BTreeMap<String, String> = result
                    .errors
                    .iter()
                    .map(|(id, error)| (id.to_hex(), error.clone()))
                    .collect();
                let summary = result.summary;
                let result_json = serde_json::json!({
                    "goals": result.goals,
                    "summary": result.summary,
                });
                self.append_log(
                    job_id,
                    &format!(
                        "job {} (computed={} cached_store={} cached_local={} failed={})",
                        if result.killed { "killed" } else { "completed" },
                        summary.computed,
                        summary.cached_store,
                        summary.cached_local,
                        summary.failed
                    ),
                );
                self.update(job_id, |record| {
                    record.status = status;
                    record.finished_at = Some(Utc::now());
                    record.metrics = JobMetrics {
                        summary: Some(summary),
                        duration_ms: Some(duration_ms),
                    };
                    record.result = Some(result_json);
                    record.execution_errors = execution_errors;
                });
            }
            Err(e) => {
                // Infrastructure failure: job-level error, no node-level
                // persistence.
                tracing::error!(job_id = %job_id, error = %e, "job failed");
                self.append_log(job_id, &format!("job failed: {e}"));
                self.update(job_id, |record| {
                    record.status = JobStatus::Failed;
                    record.error = Some(format!("{}: {e}", e.code()));
                    record.finished_at = Some(Utc::now());
                    record.metrics.duration_ms = Some(duration_ms);
                });
            }
        }
        self.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast;
    use crate::config::EngineConfig;
    use crate::stdlib;
    use crate::store_memory::MemoryStore;
    use std::time::Duration;

    fn manager() -> Arc<JobManager> {
        let config = EngineConfig {
            data_root: std::env::temp_dir().join(format!("vox-jobs-{}", Uuid::now_v7())),
            job_retention: 4,
            ..EngineConfig::default()
        };
        std::fs::create_dir_all(&config.data_root).unwrap();
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(stdlib::registry()),
            Arc::new(config),
        ));
        Arc::new(JobManager::new(engine).unwrap())
    }

    fn sum_program() -> Program {
        Program::new(vec![
            ast::bind("a", ast::int(1)),
            ast::bind("b", ast::int(2)),
            ast::bind("c", ast::call("+", vec![ast::ident("a"), ast::ident("b")])),
            ast::print("sum", ast::ident("c")),
        ])
    }

    async fn wait_terminal(manager: &Arc<JobManager>, job_id: Uuid) -> JobRecord {
        for _ in 0..200 {
            let record = manager.get(job_id).unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn run_job_completes_with_goals_and_metrics() {
        let manager = manager();
        let job_id = manager.submit(JobRequest::Run {
            program: sum_program(),
            options: RunOptions::default(),
        });

        let record = wait_terminal(&manager, job_id).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.kind, JobKind::Run);
        let summary = record.metrics.summary.unwrap();
        assert_eq!(summary.computed, 3);
        assert!(record.result.is_some());
        assert!(record
            .log_tail
            .iter()
            .any(|line| line.contains("job completed")));
    }

    #[tokio::test]
    async fn static_errors_fail_the_job_before_execution() {
        let manager = manager();
        let program = Program::new(vec![ast::print("x", ast::call("nope", vec![]))]);
        let job_id = manager.submit(JobRequest::Run {
            program,
            options: RunOptions::default(),
        });

        let record = wait_terminal(&manager, job_id).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().starts_with("UnknownCallable"));
        assert!(record.metrics.summary.is_none());
    }

    #[tokio::test]
    async fn value_jobs_report_their_target() {
        let manager = manager();
        let reduced = reducer::reduce_program(&sum_program(), manager.engine().registry()).unwrap();
        let target = reduced.workplan.goals()[0].target;
        let plan = reduced.workplan.restricted_to(target).unwrap();

        let job_id = manager.submit(JobRequest::Value { plan, target });
        // Visible as an active value job until terminal, then not.
        let record = wait_terminal(&manager, job_id).await;
        assert_eq!(record.kind, JobKind::Value);
        assert_eq!(record.status, JobStatus::Completed);
        assert!(manager.find_active_value_job(target).is_none());

        let stored = manager
            .engine()
            .store()
            .get(target, &manager.engine().config().runtime_version)
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn terminal_jobs_are_evicted_fifo() {
        let manager = manager();
        let mut ids = Vec::new();
        for _ in 0..6 {
            let id = manager.submit(JobRequest::Run {
                program: sum_program(),
                options: RunOptions::default(),
            });
            wait_terminal(&manager, id).await;
            ids.push(id);
        }
        // Retention is 4: the two oldest are gone.
        assert!(manager.get(ids[0]).is_none());
        assert!(manager.get(ids[1]).is_none());
        assert!(manager.get(ids[5]).is_some());
        assert_eq!(manager.list(None).len(), 4);
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let manager = manager();
        let run_id = manager.submit(JobRequest::Run {
            program: sum_program(),
            options: RunOptions::default(),
        });
        wait_terminal(&manager, run_id).await;

        let runs = manager.list(Some(JobKind::Run));
        assert_eq!(runs.len(), 1);
        assert!(manager.list(Some(JobKind::Value)).is_empty());
    }
}
