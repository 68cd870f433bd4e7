//! The execution engine: topological, dependency-ready scheduling of a
//! workplan over a bounded worker pool, with store-backed memoization.
//!
//! The scheduler itself is a single cooperative loop over worker
//! completions; worker dispatch is the only source of parallelism. For
//! each node the pipeline is: consult the store, deduplicate in-process
//! demand through the coordinator, take the inter-process lease, gather
//! decoded dependency values, dispatch the operator, commit, publish.
//!
//! Operator exceptions are domain failures: persisted as `failed` records
//! and propagated to dependents as poison. Store and codec errors are
//! infrastructure failures: they terminate the whole call with an
//! [`EngineError`] and never produce node-level records. Policy
//! violations observed at dispatch (a read outside the allowed roots)
//! follow the infrastructure route, not the domain one: the lease is
//! abandoned and nothing sticky is written for the node.

use crate::cancel::CancellationToken;
use crate::codec;
use crate::config::EngineConfig;
use crate::coordinator::{Acquired, NodeOutcome, WorkCoordinator};
use crate::error::{EngineError, OpError};
use crate::registry::{OpContext, OperatorRegistry};
use crate::store::{BeginCompute, CommitOutcome, ContentStore, Lease, StoreRecord};
use crate::value::VoxValue;
use crate::workplan::{ConstValue, Goal, GoalKind, NodeId, Operation, Operator, Workplan};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

/// How long a contested lease holder is given before we re-poll the store.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-execution options.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Worker pool width override; defaults to the engine configuration.
    pub workers: Option<usize>,
    /// Recompute nodes whose prior record is `failed` or `killed` instead
    /// of reusing the sticky failure.
    pub recompute_failed: bool,
    /// Live event feed, drained by the job manager into the job log.
    pub event_sink: Option<mpsc::UnboundedSender<NodeEvent>>,
}

/// Exact cache accounting for one `execute` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub computed: u64,
    pub cached_store: u64,
    pub cached_local: u64,
    pub failed: u64,
    pub events_stored: u64,
    pub events_total: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Computed,
    CachedStore,
    CachedLocal,
    Failed,
    Skipped,
}

/// One entry of the bounded per-job event log.
#[derive(Clone, Debug, Serialize)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub operator: String,
    pub status: EventStatus,
    pub cache_source: Option<&'static str>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Outcome of a single goal.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GoalOutcome {
    Printed { value: serde_json::Value },
    Saved { path: String, bytes: u64 },
    Failed { error: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct GoalReport {
    pub kind: GoalKind,
    pub label: String,
    pub target: NodeId,
    pub outcome: GoalOutcome,
}

/// Everything `execute` reports back.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub goals: Vec<GoalReport>,
    pub summary: CacheSummary,
    /// Bounded tail of node events in completion order.
    pub events: Vec<NodeEvent>,
    /// Node → error message, for failed and poisoned nodes.
    pub errors: BTreeMap<NodeId, String>,
    /// True when the run was cut short by cancellation.
    pub killed: bool,
}

/// How one node resolved inside this execution.
#[derive(Clone, Debug)]
enum NodeRun {
    Computed,
    CachedStore,
    CachedLocal,
    /// `fresh` distinguishes a failure produced here from a sticky one
    /// found in the store or published by a sibling.
    Failed { error: String, fresh: bool },
    Killed { error: String },
    /// Dropped because the job was cancelled before the node produced
    /// anything; no record was written.
    Cancelled,
}

/// Terminal per-node state tracked by the scheduler.
#[derive(Clone, Debug)]
enum NodeState {
    Pending,
    Running,
    Materialized,
    Failed(String),
    Poisoned(String),
    Cancelled,
}

/// Shared context handed to every worker task.
struct TaskCtx {
    store: Arc<dyn ContentStore>,
    registry: Arc<OperatorRegistry>,
    coordinator: WorkCoordinator,
    config: Arc<EngineConfig>,
    owner: String,
    recompute_failed: bool,
    cancel: CancellationToken,
}

/// A process-wide engine instance: explicit construction, no hidden
/// global state. Inspection APIs take the engine as a parameter.
pub struct ExecutionEngine {
    store: Arc<dyn ContentStore>,
    registry: Arc<OperatorRegistry>,
    coordinator: WorkCoordinator,
    config: Arc<EngineConfig>,
    owner: String,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        registry: Arc<OperatorRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            coordinator: WorkCoordinator::new(),
            config,
            owner: format!("engine-{}", Uuid::now_v7()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Run a workplan to completion (or cancellation).
    pub async fn execute(
        &self,
        plan: &Workplan,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        plan.verify().map_err(EngineError::InvalidPlan)?;

        let workers = options.workers.unwrap_or(self.config.workers).max(1);
        let ctx = Arc::new(TaskCtx {
            store: self.store.clone(),
            registry: self.registry.clone(),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            owner: self.owner.clone(),
            recompute_failed: options.recompute_failed,
            cancel: cancel.clone(),
        });

        // Dependency bookkeeping over unique argument edges.
        let index_of: HashMap<NodeId, usize> = plan
            .nodes()
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let mut dep_remaining: HashMap<NodeId, usize> = HashMap::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (id, op) in plan.iter() {
            let unique: HashSet<NodeId> = op.arguments.iter().copied().collect();
            for dep in &unique {
                dependents.entry(*dep).or_default().push(id);
            }
            dep_remaining.insert(id, unique.len());
        }

        // Ready set keyed by insertion index: dispatch follows the
        // reducer's topological post-order.
        let mut ready: BTreeSet<usize> = plan
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, id)| dep_remaining[id] == 0)
            .map(|(i, _)| i)
            .collect();

        let mut state: HashMap<NodeId, NodeState> = plan
            .nodes()
            .iter()
            .map(|id| (*id, NodeState::Pending))
            .collect();

        let mut summary = CacheSummary::default();
        let mut events: VecDeque<NodeEvent> = VecDeque::new();
        let mut errors: BTreeMap<NodeId, String> = BTreeMap::new();
        let mut tasks: JoinSet<(NodeId, Instant, Result<NodeRun, EngineError>)> = JoinSet::new();
        let mut resolved = 0usize;
        let mut killed = false;

        let mut push_event = |summary: &mut CacheSummary, event: NodeEvent| {
            tracing::debug!(
                node_id = %event.node_id.short(),
                operator = %event.operator,
                status = ?event.status,
                duration_ms = event.duration_ms,
                "node resolved"
            );
            if let Some(sink) = &options.event_sink {
                let _ = sink.send(event.clone());
            }
            summary.events_total += 1;
            if events.len() == self.config.event_capacity {
                events.pop_front();
            }
            events.push_back(event);
            summary.events_stored = events.len() as u64;
        };

        while resolved < plan.len() {
            if cancel.is_cancelled() {
                killed = true;
                break;
            }

            // Fill the worker pool in insertion order.
            while tasks.len() < workers {
                let Some(&idx) = ready.iter().next() else {
                    break;
                };
                ready.remove(&idx);
                let node_id = plan.nodes()[idx];
                let op = plan
                    .get(node_id)
                    .cloned()
                    .ok_or_else(|| EngineError::InvalidPlan(format!("missing node {node_id}")))?;
                state.insert(node_id, NodeState::Running);
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let started = Instant::now();
                    let run = run_node(&ctx, node_id, &op).await;
                    (node_id, started, run)
                });
            }

            if tasks.is_empty() {
                // Nothing runnable and nothing in flight: the rest is
                // unreachable (poisoned subgraphs).
                break;
            }

            let joined = tasks
                .join_next()
                .await
                .expect("join_next on non-empty JoinSet");
            let (node_id, started, run) = match joined {
                Ok(done) => done,
                Err(join_error) => {
                    return Err(EngineError::Store(anyhow::anyhow!(
                        "worker task panicked: {join_error}"
                    )))
                }
            };
            let run = run?;
            let duration_ms = started.elapsed().as_millis() as u64;
            let operator = plan
                .get(node_id)
                .map(|op| op.operator.display_name())
                .unwrap_or_default();
            resolved += 1;

            let failure: Option<String> = match &run {
                NodeRun::Computed => {
                    summary.computed += 1;
                    state.insert(node_id, NodeState::Materialized);
                    push_event(
                        &mut summary,
                        NodeEvent {
                            node_id,
                            operator,
                            status: EventStatus::Computed,
                            cache_source: None,
                            duration_ms,
                            error: None,
                        },
                    );
                    None
                }
                NodeRun::CachedStore => {
                    summary.cached_store += 1;
                    state.insert(node_id, NodeState::Materialized);
                    push_event(
                        &mut summary,
                        NodeEvent {
                            node_id,
                            operator,
                            status: EventStatus::CachedStore,
                            cache_source: Some("store"),
                            duration_ms,
                            error: None,
                        },
                    );
                    None
                }
                NodeRun::CachedLocal => {
                    summary.cached_local += 1;
                    state.insert(node_id, NodeState::Materialized);
                    push_event(
                        &mut summary,
                        NodeEvent {
                            node_id,
                            operator,
                            status: EventStatus::CachedLocal,
                            cache_source: Some("local"),
                            duration_ms,
                            error: None,
                        },
                    );
                    None
                }
                NodeRun::Failed { error, .. } | NodeRun::Killed { error } => {
                    summary.failed += 1;
                    state.insert(node_id, NodeState::Failed(error.clone()));
                    errors.insert(node_id, error.clone());
                    push_event(
                        &mut summary,
                        NodeEvent {
                            node_id,
                            operator,
                            status: EventStatus::Failed,
                            cache_source: None,
                            duration_ms,
                            error: Some(error.clone()),
                        },
                    );
                    Some(error.clone())
                }
                NodeRun::Cancelled => {
                    killed = true;
                    state.insert(node_id, NodeState::Cancelled);
                    None
                }
            };

            if matches!(run, NodeRun::Cancelled) {
                continue;
            }

            match failure {
                None => {
                    // Unlock dependents.
                    for dependent in dependents.get(&node_id).cloned().unwrap_or_default() {
                        let remaining = dep_remaining
                            .get_mut(&dependent)
                            .expect("dependent tracked");
                        *remaining -= 1;
                        if *remaining == 0
                            && matches!(state.get(&dependent), Some(NodeState::Pending))
                        {
                            ready.insert(index_of[&dependent]);
                        }
                    }
                }
                Some(error) => {
                    // Poison every transitive dependent that has not
                    // resolved yet. Derived errors are runtime
                    // observations, never written to the store.
                    let mut queue = VecDeque::from([(node_id, error)]);
                    while let Some((failed_id, cause)) = queue.pop_front() {
                        for dependent in dependents.get(&failed_id).cloned().unwrap_or_default() {
                            if !matches!(state.get(&dependent), Some(NodeState::Pending)) {
                                continue;
                            }
                            let message =
                                format!("dependency {} failed: {cause}", failed_id.short());
                            state.insert(dependent, NodeState::Poisoned(message.clone()));
                            errors.insert(dependent, message.clone());
                            ready.remove(&index_of[&dependent]);
                            resolved += 1;
                            let operator = plan
                                .get(dependent)
                                .map(|op| op.operator.display_name())
                                .unwrap_or_default();
                            push_event(
                                &mut summary,
                                NodeEvent {
                                    node_id: dependent,
                                    operator,
                                    status: EventStatus::Skipped,
                                    cache_source: None,
                                    duration_ms: 0,
                                    error: Some(message.clone()),
                                },
                            );
                            queue.push_back((dependent, message));
                        }
                    }
                }
            }
        }

        if killed {
            // Stop issuing work; let in-flight workers finish on their own
            // terms (they observe the token at their next suspension).
            while let Some(joined) = tasks.join_next().await {
                let Ok((node_id, started, Ok(run))) = joined else {
                    continue;
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                let operator = plan
                    .get(node_id)
                    .map(|op| op.operator.display_name())
                    .unwrap_or_default();
                let (status, cache_source, error) = match &run {
                    NodeRun::Computed => {
                        summary.computed += 1;
                        state.insert(node_id, NodeState::Materialized);
                        (EventStatus::Computed, None, None)
                    }
                    NodeRun::CachedStore => {
                        summary.cached_store += 1;
                        state.insert(node_id, NodeState::Materialized);
                        (EventStatus::CachedStore, Some("store"), None)
                    }
                    NodeRun::CachedLocal => {
                        summary.cached_local += 1;
                        state.insert(node_id, NodeState::Materialized);
                        (EventStatus::CachedLocal, Some("local"), None)
                    }
                    NodeRun::Failed { error, .. } | NodeRun::Killed { error } => {
                        summary.failed += 1;
                        state.insert(node_id, NodeState::Failed(error.clone()));
                        errors.insert(node_id, error.clone());
                        (EventStatus::Failed, None, Some(error.clone()))
                    }
                    NodeRun::Cancelled => {
                        state.insert(node_id, NodeState::Cancelled);
                        continue;
                    }
                };
                push_event(
                    &mut summary,
                    NodeEvent {
                        node_id,
                        operator,
                        status,
                        cache_source,
                        duration_ms,
                        error,
                    },
                );
            }
        }

        // Goals are observed in declaration order, after every target has
        // reached a terminal (or abandoned) state.
        let mut goals = Vec::with_capacity(plan.goals().len());
        for goal in plan.goals() {
            let outcome = self.settle_goal(goal, &state, killed).await;
            goals.push(GoalReport {
                kind: goal.kind,
                label: goal.label.clone(),
                target: goal.target,
                outcome,
            });
        }

        Ok(ExecutionResult {
            goals,
            summary,
            events: events.into_iter().collect(),
            errors,
            killed,
        })
    }

    async fn settle_goal(
        &self,
        goal: &Goal,
        state: &HashMap<NodeId, NodeState>,
        killed: bool,
    ) -> GoalOutcome {
        match state.get(&goal.target) {
            Some(NodeState::Materialized) => match self.goal_value(goal.target).await {
                Ok(value) => self.deliver_goal(goal, &value).await,
                Err(e) => GoalOutcome::Failed {
                    error: e.to_string(),
                },
            },
            Some(NodeState::Failed(error)) | Some(NodeState::Poisoned(error)) => {
                GoalOutcome::Failed {
                    error: error.clone(),
                }
            }
            _ => GoalOutcome::Failed {
                error: if killed {
                    "not computed: job killed".to_string()
                } else {
                    "not computed".to_string()
                },
            },
        }
    }

    async fn goal_value(&self, target: NodeId) -> Result<VoxValue, EngineError> {
        let record = self
            .store
            .get(target, &self.config.runtime_version)
            .await
            .map_err(EngineError::Store)?
            .ok_or(EngineError::MissingDependency(target))?;
        decode_record(&record)
    }

    async fn deliver_goal(&self, goal: &Goal, value: &VoxValue) -> GoalOutcome {
        match goal.kind {
            GoalKind::Print => GoalOutcome::Printed {
                value: value.to_display_json(),
            },
            GoalKind::Save => {
                let path = match self.config.ensure_writable(std::path::Path::new(&goal.label)) {
                    Ok(path) => path,
                    Err(e) => {
                        return GoalOutcome::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                let bytes = match value {
                    VoxValue::Bytes(b) => b.clone(),
                    VoxValue::Str(s) => s.clone().into_bytes(),
                    other => match serde_json::to_vec_pretty(&other.to_display_json()) {
                        Ok(b) => b,
                        Err(e) => {
                            return GoalOutcome::Failed {
                                error: format!("render save payload: {e}"),
                            }
                        }
                    },
                };
                if let Some(parent) = path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        return GoalOutcome::Failed {
                            error: format!("create {}: {e}", parent.display()),
                        };
                    }
                }
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => GoalOutcome::Saved {
                        path: path.display().to_string(),
                        bytes: bytes.len() as u64,
                    },
                    Err(e) => GoalOutcome::Failed {
                        error: format!("write {}: {e}", path.display()),
                    },
                }
            }
        }
    }
}

fn decode_record(record: &StoreRecord) -> Result<VoxValue, EngineError> {
    let payload = record
        .payload
        .as_deref()
        .ok_or(EngineError::MissingDependency(record.node_id))?;
    codec::decode(payload).map_err(|source| EngineError::Codec {
        node_id: record.node_id,
        source,
    })
}

fn const_value(c: &ConstValue) -> VoxValue {
    match c {
        ConstValue::Integer(v) => VoxValue::Int(*v),
        ConstValue::Float(v) => VoxValue::Float(*v),
        ConstValue::Boolean(v) => VoxValue::Bool(*v),
        ConstValue::String(v) => VoxValue::Str(v.clone()),
        ConstValue::Null => VoxValue::Null,
    }
}

/// The per-node pipeline. Returns how the node resolved, or an
/// infrastructure error that fails the whole job.
async fn run_node(
    ctx: &Arc<TaskCtx>,
    node_id: NodeId,
    op: &Operation,
) -> Result<NodeRun, EngineError> {
    let runtime_version = ctx.config.runtime_version.clone();
    loop {
        // 1. Store first: a terminal record settles the node outright.
        if let Some(record) = ctx
            .store
            .get(node_id, &runtime_version)
            .await
            .map_err(EngineError::Store)?
        {
            match record.status {
                crate::store::RecordStatus::Materialized => return Ok(NodeRun::CachedStore),
                crate::store::RecordStatus::Failed if !ctx.recompute_failed => {
                    return Ok(NodeRun::Failed {
                        error: record.failure_message(),
                        fresh: false,
                    })
                }
                crate::store::RecordStatus::Killed if !ctx.recompute_failed => {
                    return Ok(NodeRun::Killed {
                        error: record.failure_message(),
                    })
                }
                _ => {}
            }
        }

        // 2. Deduplicate in-process demand. Coordinator before store
        // lease, always; never the reverse.
        let permit = match ctx.coordinator.acquire(node_id) {
            Acquired::Wait(waiter) => {
                tokio::select! {
                    outcome = waiter.wait() => match outcome {
                        NodeOutcome::Materialized => return Ok(NodeRun::CachedLocal),
                        NodeOutcome::Failed { error } => {
                            return Ok(NodeRun::Failed { error, fresh: false })
                        }
                        NodeOutcome::Killed { error } => return Ok(NodeRun::Killed { error }),
                        // The holder went away without computing; re-enter
                        // the pipeline.
                        NodeOutcome::Abandoned => continue,
                    },
                    _ = ctx.cancel.cancelled() => return Ok(NodeRun::Cancelled),
                }
            }
            Acquired::Compute(permit) => permit,
        };

        // 3. Inter-process lease.
        let lease = {
            let mut current: Option<Lease> = None;
            loop {
                match ctx
                    .store
                    .begin_compute(node_id, &runtime_version, &ctx.owner, ctx.recompute_failed)
                    .await
                    .map_err(EngineError::Store)?
                {
                    BeginCompute::Lease(lease) => {
                        current = Some(lease);
                        break;
                    }
                    BeginCompute::AlreadyComputed(_) => {
                        permit.publish(NodeOutcome::Materialized);
                        return Ok(NodeRun::CachedStore);
                    }
                    BeginCompute::AlreadyFailed(record) => {
                        let error = record.failure_message();
                        match record.status {
                            crate::store::RecordStatus::Killed => {
                                permit.publish(NodeOutcome::Killed {
                                    error: error.clone(),
                                });
                                return Ok(NodeRun::Killed { error });
                            }
                            _ => {
                                permit.publish(NodeOutcome::Failed {
                                    error: error.clone(),
                                });
                                return Ok(NodeRun::Failed {
                                    error,
                                    fresh: false,
                                });
                            }
                        }
                    }
                    BeginCompute::Contested => {
                        // Another process is computing this key. Hold the
                        // local permit (siblings keep waiting locally) and
                        // re-poll until the winner commits or the lease
                        // frees up.
                        tokio::select! {
                            _ = tokio::time::sleep(LEASE_POLL_INTERVAL) => {}
                            _ = ctx.cancel.cancelled() => {
                                drop(permit);
                                return Ok(NodeRun::Cancelled);
                            }
                        }
                    }
                }
            }
            match current {
                Some(lease) => lease,
                None => continue,
            }
        };

        return compute_with_lease(ctx, node_id, op, lease, permit).await;
    }
}

async fn compute_with_lease(
    ctx: &Arc<TaskCtx>,
    node_id: NodeId,
    op: &Operation,
    lease: Lease,
    permit: crate::coordinator::ComputePermit,
) -> Result<NodeRun, EngineError> {
    // 4. Gather decoded dependency values from the store.
    let mut args = Vec::with_capacity(op.arguments.len());
    for arg in &op.arguments {
        let record = match ctx
            .store
            .get(*arg, &ctx.config.runtime_version)
            .await
            .map_err(EngineError::Store)
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                let _ = ctx.store.abandon(lease).await;
                return Err(EngineError::MissingDependency(*arg));
            }
            Err(e) => {
                let _ = ctx.store.abandon(lease).await;
                return Err(e);
            }
        };
        match decode_record(&record) {
            Ok(value) => args.push(value),
            Err(e) => {
                let _ = ctx.store.abandon(lease).await;
                return Err(e);
            }
        }
    }

    // 5. Dispatch.
    let result = match &op.operator {
        Operator::Const(c) => Ok(const_value(c)),
        Operator::Named(name) => {
            let op_ctx = OpContext::new(
                node_id,
                ctx.cancel.clone(),
                ctx.config.clone(),
                ctx.registry.clone(),
            );
            ctx.registry.dispatch(name, &args, &op_ctx).await
        }
    };

    match result {
        Ok(value) => {
            let payload = codec::encode(&value);
            ctx.store
                .commit(lease, CommitOutcome::Materialized(payload))
                .await
                .map_err(EngineError::Store)?;
            permit.publish(NodeOutcome::Materialized);
            Ok(NodeRun::Computed)
        }
        Err(OpError::Cancelled) if ctx.cancel.is_cancelled() => {
            // Job-level cancellation: release the key without a record so
            // the next acquirer can compute.
            let _ = ctx.store.abandon(lease).await;
            drop(permit);
            Ok(NodeRun::Cancelled)
        }
        Err(OpError::Cancelled) => {
            // The operator aborted on its own; that is final for this key.
            let error = "operation cancelled by operator".to_string();
            ctx.store
                .commit(lease, CommitOutcome::Killed(error.clone()))
                .await
                .map_err(EngineError::Store)?;
            permit.publish(NodeOutcome::Killed {
                error: error.clone(),
            });
            Ok(NodeRun::Killed { error })
        }
        Err(OpError::Policy(source)) => {
            // Policy violations are rejected synchronously, never
            // persisted: release the key and fail the whole job.
            let _ = ctx.store.abandon(lease).await;
            drop(permit);
            Err(EngineError::Policy { node_id, source })
        }
        Err(err @ OpError::Domain(_)) => {
            let error = err.to_string();
            ctx.store
                .commit(lease, CommitOutcome::Failed(error.clone()))
                .await
                .map_err(EngineError::Store)?;
            permit.publish(NodeOutcome::Failed {
                error: error.clone(),
            });
            Ok(NodeRun::Failed { error, fresh: true })
        }
    }
}
