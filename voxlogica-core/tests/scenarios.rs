//! End-to-end scenarios over the whole pipeline: program → reduction →
//! execution → store → inspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use voxlogica_core::ast::{self, Program};
use voxlogica_core::cancel::CancellationToken;
use voxlogica_core::config::EngineConfig;
use voxlogica_core::engine::{ExecuteOptions, ExecutionEngine, GoalOutcome};
use voxlogica_core::error::OpError;
use voxlogica_core::jobs::{JobManager, JobRequest, JobStatus, RunOptions};
use voxlogica_core::reducer::reduce_program;
use voxlogica_core::registry::{Arity, EffectClass, OpContext, OpEntry, OpFn, OpKind, OperatorRegistry};
use voxlogica_core::resolver::{Materialization, ResolveRequest, ValueResolver};
use voxlogica_core::stdlib;
use voxlogica_core::store::{ContentStore, RecordFilter, RecordStatus};
use voxlogica_core::store_memory::MemoryStore;
use voxlogica_core::value::VoxValue;

fn test_config() -> EngineConfig {
    let data_root = std::env::temp_dir().join(format!("vox-scenario-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&data_root).unwrap();
    EngineConfig {
        data_root,
        ..EngineConfig::default()
    }
}

fn engine_on(store: Arc<dyn ContentStore>, registry: Arc<OperatorRegistry>) -> ExecutionEngine {
    ExecutionEngine::new(store, registry, Arc::new(test_config()))
}

fn sum_program() -> Program {
    // a=1 b=2 c=a+b print "sum" c
    Program::new(vec![
        ast::bind("a", ast::int(1)),
        ast::bind("b", ast::int(2)),
        ast::bind("c", ast::call("+", vec![ast::ident("a"), ast::ident("b")])),
        ast::print("sum", ast::ident("c")),
    ])
}

fn printed_value(outcome: &GoalOutcome) -> serde_json::Value {
    match outcome {
        GoalOutcome::Printed { value } => value.clone(),
        other => panic!("expected printed goal, got {other:?}"),
    }
}

// ─── Scenario 1: constant arithmetic ──────────────────────────

#[tokio::test]
async fn constant_arithmetic_caches_across_runs() {
    let registry = Arc::new(stdlib::registry());
    let engine = engine_on(Arc::new(MemoryStore::new()), registry.clone());
    let plan = reduce_program(&sum_program(), &registry).unwrap().workplan;

    let first = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(printed_value(&first.goals[0].outcome), serde_json::json!(3));
    assert_eq!(first.summary.computed, 3);

    // Three store entries: 1, 2, and the sum node.
    let records = engine
        .store()
        .iter(&RecordFilter::default(), 100)
        .await
        .unwrap();
    assert_eq!(records.len(), 3);

    let second = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.summary.computed, 0);
    assert_eq!(second.summary.cached_store, 3);
}

// ─── Scenario 2: shared subexpression ─────────────────────────

struct CountingF(Arc<AtomicUsize>);

#[async_trait]
impl OpFn for CountingF {
    async fn call(&self, args: &[VoxValue], _ctx: &OpContext) -> Result<VoxValue, OpError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        // Simulate real work so both demands overlap.
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(args[0].clone())
    }
}

#[tokio::test]
async fn shared_subexpression_is_computed_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = stdlib::registry();
    registry.register(OpEntry {
        name: "f".into(),
        arity: Arity::Exact(1),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(CountingF(calls.clone()))),
    });
    registry.register(OpEntry {
        name: "g".into(),
        arity: Arity::Exact(1),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(CountingF(Arc::new(AtomicUsize::new(0))))),
    });
    registry.bind_default("f", "f");
    registry.bind_default("g", "g");
    let registry = Arc::new(registry);

    // x=f(1) y=f(1)+g(x) print "y" y
    let program = Program::new(vec![
        ast::bind("x", ast::call("f", vec![ast::int(1)])),
        ast::bind(
            "y",
            ast::call(
                "+",
                vec![
                    ast::call("f", vec![ast::int(1)]),
                    ast::call("g", vec![ast::ident("x")]),
                ],
            ),
        ),
        ast::print("y", ast::ident("y")),
    ]);
    let engine = engine_on(Arc::new(MemoryStore::new()), registry.clone());
    let plan = reduce_program(&program, &registry).unwrap().workplan;

    let result = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(printed_value(&result.goals[0].outcome), serde_json::json!(2));
}

// ─── Scenario 3: failure isolation ────────────────────────────

fn explode(v: &VoxValue) -> Result<VoxValue, OpError> {
    match v.as_i64() {
        Some(0) => Err(OpError::domain("explode(0)")),
        Some(n) => Ok(VoxValue::Int(n)),
        None => Err(OpError::domain("explode wants an integer")),
    }
}

#[tokio::test]
async fn failing_goal_leaves_siblings_untouched() {
    let mut registry = stdlib::registry();
    registry.register_unary("explode", explode);
    registry.bind_default("explode", "explode");
    let registry = Arc::new(registry);

    // a=explode(0) b=1+2 print "a" a print "b" b
    let program = Program::new(vec![
        ast::bind("a", ast::call("explode", vec![ast::int(0)])),
        ast::bind("b", ast::call("+", vec![ast::int(1), ast::int(2)])),
        ast::print("a", ast::ident("a")),
        ast::print("b", ast::ident("b")),
    ]);
    let engine = engine_on(Arc::new(MemoryStore::new()), registry.clone());
    let plan = reduce_program(&program, &registry).unwrap().workplan;

    let result = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap();

    match &result.goals[0].outcome {
        GoalOutcome::Failed { error } => assert!(error.contains("explode(0)")),
        other => panic!("goal `a` should fail, got {other:?}"),
    }
    assert_eq!(printed_value(&result.goals[1].outcome), serde_json::json!(3));

    let failed = engine
        .store()
        .iter(
            &RecordFilter {
                status: Some(RecordStatus::Failed),
                node_prefix: None,
            },
            100,
        )
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("explode(0)"));
}

// ─── Policy rejection through the full engine ─────────────────

#[tokio::test]
async fn policy_violation_fails_the_job_without_node_records() {
    let registry = Arc::new(stdlib::registry());

    // import "io"; leak = read_text("/etc/passwd"); shout = concat(leak, "!")
    let program = Program::new(vec![
        ast::import("io"),
        ast::bind("leak", ast::call("read_text", vec![ast::string("/etc/passwd")])),
        ast::bind(
            "shout",
            ast::call("concat", vec![ast::ident("leak"), ast::string("!")]),
        ),
        ast::print("shout", ast::ident("shout")),
    ]);
    let reduced = reduce_program(&program, &registry).unwrap();
    let plan = reduced.workplan.clone();
    let read_node = reduced.symbols["leak"];
    let shout_node = reduced.symbols["shout"];

    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let engine = ExecutionEngine::new(store.clone(), registry.clone(), Arc::new(test_config()));

    // The whole call fails with the policy code; this is not a domain
    // failure.
    let err = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PathOutsideRoots");

    // Nothing sticky landed for the rejected read or its dependent, and
    // the store holds no failed records at all.
    let rt = &engine.config().runtime_version;
    assert!(store.get(read_node, rt).await.unwrap().is_none());
    assert!(store.get(shout_node, rt).await.unwrap().is_none());
    let failed = store
        .iter(
            &RecordFilter {
                status: Some(RecordStatus::Failed),
                node_prefix: None,
            },
            100,
        )
        .await
        .unwrap();
    assert!(failed.is_empty());

    // The key is free again: a rerun is rejected the same way instead of
    // replaying a sticky failure.
    let again = engine
        .execute(&plan, ExecuteOptions::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(again.code(), "PathOutsideRoots");

    // Through the job manager it is a job-level failure with no
    // node-level execution errors.
    let jobs = Arc::new(JobManager::new(Arc::new(engine)).unwrap());
    let job_id = jobs.submit(JobRequest::Run {
        program,
        options: RunOptions::default(),
    });
    let mut record = jobs.get(job_id).unwrap();
    for _ in 0..200 {
        record = jobs.get(job_id).unwrap();
        if record.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().starts_with("PathOutsideRoots"));
    assert!(record.execution_errors.is_empty());
}

// ─── Scenario 4: cross-process dedup ──────────────────────────

#[tokio::test]
async fn two_engines_share_one_store_without_recompute_storms() {
    // Two engines with separate coordinators model two processes sharing
    // a store file.
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = stdlib::registry();
    registry.register(OpEntry {
        name: "slow".into(),
        arity: Arity::Exact(1),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(CountingF(calls.clone()))),
    });
    registry.bind_default("slow", "slow");
    let registry = Arc::new(registry);

    let program = Program::new(vec![
        ast::bind("x", ast::call("slow", vec![ast::int(5)])),
        ast::bind("y", ast::call("+", vec![ast::ident("x"), ast::int(1)])),
        ast::print("y", ast::ident("y")),
    ]);
    let plan = reduce_program(&program, &registry).unwrap().workplan;
    let distinct_nodes = plan.len();

    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let config = Arc::new(test_config());
    let a = ExecutionEngine::new(store.clone(), registry.clone(), config.clone());
    let b = ExecutionEngine::new(store.clone(), registry.clone(), config.clone());

    let plan_a = plan.clone();
    let plan_b = plan.clone();
    let (ra, rb) = tokio::join!(
        a.execute(&plan_a, ExecuteOptions::default(), CancellationToken::new()),
        b.execute(&plan_b, ExecuteOptions::default(), CancellationToken::new()),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Both observe the same goal value and the same terminal store state.
    assert_eq!(printed_value(&ra.goals[0].outcome), serde_json::json!(6));
    assert_eq!(printed_value(&rb.goals[0].outcome), serde_json::json!(6));

    // The slow operator ran at most once per engine (the contested loser
    // adopts the winner's record).
    assert!(calls.load(Ordering::SeqCst) <= 2);
    let records = store.iter(&RecordFilter::default(), 100).await.unwrap();
    assert_eq!(records.len(), distinct_nodes);
    assert!(records
        .iter()
        .all(|r| r.status == RecordStatus::Materialized));
}

// ─── Scenario 5: lazy value inspection ────────────────────────

#[tokio::test]
async fn enqueue_resolve_converges_with_typed_descriptor() {
    let registry = Arc::new(stdlib::registry());
    let engine = Arc::new(engine_on(Arc::new(MemoryStore::new()), registry));
    let jobs = Arc::new(JobManager::new(engine).unwrap());
    let resolver = ValueResolver::new(jobs);

    let request = ResolveRequest {
        program: Some(sum_program()),
        variable: Some("c".into()),
        enqueue: true,
        ..ResolveRequest::default()
    };

    let first = resolver.resolve(request.clone()).await.unwrap();
    assert!(matches!(
        first.materialization,
        Materialization::Pending | Materialization::Running
    ));
    assert!(first.job_id.is_some());

    let mut last = first;
    for _ in 0..300 {
        last = resolver.resolve(request.clone()).await.unwrap();
        if last.materialization == Materialization::Computed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(last.materialization, Materialization::Computed);
    let descriptor = last.descriptor.unwrap();
    assert_eq!(descriptor.vox_type, "integer");
    assert_eq!(descriptor.summary["value"], serde_json::json!(3));
}

// ─── Scenario 6: cancellation ─────────────────────────────────

struct Gate {
    entered: Arc<tokio::sync::Notify>,
    release: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl OpFn for Gate {
    async fn call(&self, args: &[VoxValue], _ctx: &OpContext) -> Result<VoxValue, OpError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(args[0].clone())
    }
}

#[tokio::test]
async fn killed_job_persists_finished_work_only() {
    let entered = Arc::new(tokio::sync::Notify::new());
    let release = Arc::new(tokio::sync::Notify::new());
    let mut registry = stdlib::registry();
    registry.register(OpEntry {
        name: "gate".into(),
        arity: Arity::Exact(1),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(Gate {
            entered: entered.clone(),
            release: release.clone(),
        })),
    });
    registry.bind_default("gate", "gate");
    let registry = Arc::new(registry);

    // first = gate(1); second = gate(first + 1)
    let program = Program::new(vec![
        ast::bind("first", ast::call("gate", vec![ast::int(1)])),
        ast::bind(
            "second",
            ast::call("gate", vec![ast::call("+", vec![ast::ident("first"), ast::int(1)])]),
        ),
        ast::print("second", ast::ident("second")),
    ]);

    let store: Arc<dyn ContentStore> = Arc::new(MemoryStore::new());
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        registry.clone(),
        Arc::new(test_config()),
    ));
    let jobs = Arc::new(JobManager::new(engine.clone()).unwrap());

    let job_id = jobs.submit(JobRequest::Run {
        program,
        options: RunOptions {
            workers: Some(1),
            ..RunOptions::default()
        },
    });

    // Wait for the first gate to be in flight, start the kill, give the
    // cancel flag time to land, then let the in-flight operator finish.
    entered.notified().await;
    let killer = {
        let jobs = jobs.clone();
        tokio::spawn(async move { jobs.kill(job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();
    let record = killer.await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Killed);

    // The first gate node is persisted materialized; the second gate node
    // has no record of any kind.
    let plan = reduce_program(
        &Program::new(vec![
            ast::bind("first", ast::call("gate", vec![ast::int(1)])),
            ast::bind(
                "second",
                ast::call("gate", vec![ast::call("+", vec![ast::ident("first"), ast::int(1)])]),
            ),
            ast::print("second", ast::ident("second")),
        ]),
        &registry,
    )
    .unwrap();
    let second_id = plan.workplan.goals()[0].target;
    let rt = &engine.config().runtime_version;
    assert!(store.get(second_id, rt).await.unwrap().is_none());

    let materialized = store
        .iter(
            &RecordFilter {
                status: Some(RecordStatus::Materialized),
                node_prefix: None,
            },
            100,
        )
        .await
        .unwrap();
    assert!(!materialized.is_empty());
    // Nothing failed: cancellation writes no failure records.
    let failed = store
        .iter(
            &RecordFilter {
                status: Some(RecordStatus::Failed),
                node_prefix: None,
            },
            100,
        )
        .await
        .unwrap();
    assert!(failed.is_empty());
}

// ─── Identity determinism across reducers ─────────────────────

#[test]
fn equivalent_programs_reduce_to_identical_goal_targets() {
    let registry = stdlib::registry();
    let named = reduce_program(&sum_program(), &registry).unwrap();
    let inline = reduce_program(
        &Program::new(vec![ast::print(
            "sum",
            ast::call("+", vec![ast::int(1), ast::int(2)]),
        )]),
        &registry,
    )
    .unwrap();
    assert_eq!(
        named.workplan.goals()[0].target,
        inline.workplan.goals()[0].target
    );
}
