//! Lazy, on-demand value resolution for inspection APIs.
//!
//! A resolve request names a value either by explicit node id or by a
//! program variable. In lookup mode the store is consulted and a
//! descriptor returned; in enqueue mode a missing value spawns a
//! single-node job through the job manager and the caller polls until the
//! store holds a terminal record.

use crate::ast::Program;
use crate::descriptor::{DescriptorBuilder, PageRequest};
use crate::error::ReduceError;
use crate::jobs::{JobManager, JobRequest, JobStatus};
use crate::reducer;
use crate::store::RecordStatus;
use crate::workplan::NodeId;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// How the requested value stands right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
    /// Store hit on a plain lookup.
    Cached,
    /// Store hit observed after an enqueue (the job converged).
    Computed,
    Missing,
    Failed,
    Pending,
    Running,
}

#[derive(Clone, Debug, Default)]
pub struct ResolveRequest {
    /// Program to reduce; required unless `node_id` is given.
    pub program: Option<Program>,
    /// Top-level variable naming the wanted value.
    pub variable: Option<String>,
    /// Explicit node id, bypassing reduction.
    pub node_id: Option<NodeId>,
    /// Descriptor root path.
    pub path: String,
    pub page: PageRequest,
    /// Enqueue a single-node job when the value is missing.
    pub enqueue: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolveResponse {
    pub node_id: NodeId,
    pub materialization: Materialization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<crate::descriptor::Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error("{0}")]
    BadRequest(String),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
}

/// Resolver over one engine and its job manager.
pub struct ValueResolver {
    jobs: Arc<JobManager>,
}

impl ValueResolver {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self { jobs }
    }

    pub async fn resolve(&self, request: ResolveRequest) -> Result<ResolveResponse, ResolveError> {
        let engine = self.jobs.engine();
        let registry = engine.registry();

        // Work out the target node, keeping the reduced plan around for a
        // possible enqueue.
        let mut reduced = None;
        let target = match request.node_id {
            Some(node_id) => node_id,
            None => {
                let program = request.program.as_ref().ok_or_else(|| {
                    ResolveError::BadRequest("either node_id or program is required".into())
                })?;
                let variable = request.variable.as_deref().ok_or_else(|| {
                    ResolveError::BadRequest("variable is required with a program".into())
                })?;
                let r = reducer::reduce_program(program, registry)?;
                let target = r.symbols.get(variable).copied().ok_or_else(|| {
                    ResolveError::BadRequest(format!("no top-level binding `{variable}`"))
                })?;
                reduced = Some(r);
                target
            }
        };

        let record = engine
            .store()
            .get(target, &engine.config().runtime_version)
            .await
            .map_err(ResolveError::Store)?;

        let builder = DescriptorBuilder::new(&engine.config().descriptor, registry);
        if let Some(record) = record {
            let descriptor = builder.from_record(&record, &request.path, request.page);
            let materialization = match record.status {
                RecordStatus::Materialized if request.enqueue => Materialization::Computed,
                RecordStatus::Materialized => Materialization::Cached,
                RecordStatus::Failed | RecordStatus::Killed => Materialization::Failed,
            };
            return Ok(ResolveResponse {
                node_id: target,
                materialization,
                descriptor: Some(descriptor),
                job_id: None,
            });
        }

        if !request.enqueue {
            return Ok(ResolveResponse {
                node_id: target,
                materialization: Materialization::Missing,
                descriptor: None,
                job_id: None,
            });
        }

        // Reuse an in-flight value job for this node when one exists; two
        // identical resolve calls must not double-compute.
        if let Some((job_id, status)) = self.jobs.find_active_value_job(target) {
            let materialization = match status {
                JobStatus::Running => Materialization::Running,
                _ => Materialization::Pending,
            };
            return Ok(ResolveResponse {
                node_id: target,
                materialization,
                descriptor: None,
                job_id: Some(job_id),
            });
        }

        let reduced = match reduced {
            Some(reduced) => reduced,
            None => {
                let program = request.program.as_ref().ok_or_else(|| {
                    ResolveError::BadRequest(
                        "value is missing and no program was given to compute it".into(),
                    )
                })?;
                reducer::reduce_program(program, registry)?
            }
        };
        let plan = reduced.workplan.restricted_to(target).ok_or_else(|| {
            ResolveError::BadRequest(format!("node {target} is not defined by the program"))
        })?;
        let job_id = self.jobs.submit(JobRequest::Value { plan, target });
        Ok(ResolveResponse {
            node_id: target,
            materialization: Materialization::Pending,
            descriptor: None,
            job_id: Some(job_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast;
    use crate::config::EngineConfig;
    use crate::engine::ExecutionEngine;
    use crate::stdlib;
    use crate::store_memory::MemoryStore;
    use std::time::Duration;

    fn resolver() -> ValueResolver {
        let config = EngineConfig {
            data_root: std::env::temp_dir().join(format!("vox-resolve-{}", Uuid::now_v7())),
            ..EngineConfig::default()
        };
        std::fs::create_dir_all(&config.data_root).unwrap();
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(stdlib::registry()),
            Arc::new(config),
        ));
        ValueResolver::new(Arc::new(JobManager::new(engine).unwrap()))
    }

    fn sum_program() -> Program {
        Program::new(vec![
            ast::bind("a", ast::int(1)),
            ast::bind("b", ast::int(2)),
            ast::bind("c", ast::call("+", vec![ast::ident("a"), ast::ident("b")])),
            ast::print("sum", ast::ident("c")),
        ])
    }

    #[tokio::test]
    async fn lookup_of_uncomputed_value_is_missing() {
        let resolver = resolver();
        let response = resolver
            .resolve(ResolveRequest {
                program: Some(sum_program()),
                variable: Some("c".into()),
                ..ResolveRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(response.materialization, Materialization::Missing);
        assert!(response.descriptor.is_none());
        assert!(response.job_id.is_none());
    }

    #[tokio::test]
    async fn enqueue_then_poll_converges_to_computed() {
        let resolver = resolver();
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
        let job_id = first.job_id.unwrap();

        // Poll until the store holds the value.
        let mut last = first;
        for _ in 0..200 {
            last = resolver.resolve(request.clone()).await.unwrap();
            if last.materialization == Materialization::Computed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last.materialization, Materialization::Computed);
        let descriptor = last.descriptor.unwrap();
        assert_eq!(descriptor.vox_type, "integer");
        assert_eq!(descriptor.summary["value"], serde_json::json!(3));
        // The job itself converged too.
        let record = resolver.jobs.get(job_id).unwrap();
        assert!(record.status.is_terminal());
    }

    #[tokio::test]
    async fn identical_enqueues_share_one_job() {
        let resolver = resolver();
        let request = ResolveRequest {
            program: Some(sum_program()),
            variable: Some("c".into()),
            enqueue: true,
            ..ResolveRequest::default()
        };
        let first = resolver.resolve(request.clone()).await.unwrap();
        let second = resolver.resolve(request.clone()).await.unwrap();
        // Either the same in-flight job, or the first already converged
        // and the second saw the store.
        if let (Some(a), Some(b)) = (first.job_id, second.job_id) {
            assert_eq!(a, b);
        } else {
            assert_eq!(second.materialization, Materialization::Computed);
        }
    }

    #[tokio::test]
    async fn unknown_variable_is_a_bad_request() {
        let resolver = resolver();
        let err = resolver
            .resolve(ResolveRequest {
                program: Some(sum_program()),
                variable: Some("zzz".into()),
                ..ResolveRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::BadRequest(_)));
    }

    #[tokio::test]
    async fn explicit_node_id_lookups_bypass_reduction() {
        let resolver = resolver();
        // Compute first through a run-shaped enqueue.
        let request = ResolveRequest {
            program: Some(sum_program()),
            variable: Some("c".into()),
            enqueue: true,
            ..ResolveRequest::default()
        };
        let first = resolver.resolve(request.clone()).await.unwrap();
        let target = first.node_id;
        for _ in 0..200 {
            let r = resolver.resolve(request.clone()).await.unwrap();
            if r.materialization == Materialization::Computed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let by_id = resolver
            .resolve(ResolveRequest {
                node_id: Some(target),
                ..ResolveRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(by_id.materialization, Materialization::Cached);
        assert_eq!(
            by_id.descriptor.unwrap().summary["value"],
            serde_json::json!(3)
        );
    }
}
