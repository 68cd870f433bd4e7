//! Error taxonomy.
//!
//! Four families with different propagation rules:
//! static reduction errors short-circuit a request before any execution;
//! operator domain errors are persisted as `failed` records and poison
//! dependents only; infrastructure errors fail the whole job without
//! node-level persistence; policy errors are rejected synchronously.
//! Every variant carries a stable code via `code()`.

use crate::ast::Span;
use crate::codec::CodecError;
use crate::workplan::NodeId;
use std::path::PathBuf;
use thiserror::Error;

/// Static errors raised during reduction. Never reach the store.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ReduceError {
    #[error("syntax not recognized at {span}: {detail}")]
    SyntaxNotRecognized { detail: String, span: Span },

    #[error("unknown callable `{name}` at {span}")]
    UnknownCallable { name: String, span: Span },

    #[error("`{name}` expects {expected} argument(s), got {got} at {span}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
        span: Span,
    },

    #[error("duplicate print label `{label}` at {span}")]
    DuplicatePrintLabel { label: String, span: Span },

    #[error("cyclic definition involving `{name}` at {span}")]
    CyclicDefinition { name: String, span: Span },

    #[error("unknown namespace `{namespace}` at {span}")]
    IllegalImport { namespace: String, span: Span },
}

impl ReduceError {
    pub fn code(&self) -> &'static str {
        match self {
            ReduceError::SyntaxNotRecognized { .. } => "SyntaxNotRecognized",
            ReduceError::UnknownCallable { .. } => "UnknownCallable",
            ReduceError::ArityMismatch { .. } => "ArityMismatch",
            ReduceError::DuplicatePrintLabel { .. } => "DuplicatePrintLabel",
            ReduceError::CyclicDefinition { .. } => "CyclicDefinition",
            ReduceError::IllegalImport { .. } => "IllegalImport",
        }
    }

    pub fn span(&self) -> Span {
        match self {
            ReduceError::SyntaxNotRecognized { span, .. }
            | ReduceError::UnknownCallable { span, .. }
            | ReduceError::ArityMismatch { span, .. }
            | ReduceError::DuplicatePrintLabel { span, .. }
            | ReduceError::CyclicDefinition { span, .. }
            | ReduceError::IllegalImport { span, .. } => *span,
        }
    }
}

/// Policy errors, rejected synchronously before any work starts.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("path `{0}` is outside the allowed read roots")]
    PathOutsideRoots(PathBuf),

    #[error("unknown runtime version `{0}`")]
    UnknownRuntimeVersion(String),
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::PathOutsideRoots(_) => "PathOutsideRoots",
            PolicyError::UnknownRuntimeVersion(_) => "UnknownRuntimeVersion",
        }
    }
}

/// Infrastructure failures: store I/O, codec mismatch, cancellation raised
/// outside a worker. These terminate the job `failed` with a job-level
/// message and never produce node-level records.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workplan: {0}")]
    InvalidPlan(String),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),

    /// A policy violation observed at operator dispatch. Rejected without
    /// a node-level record; the job fails with this as its job-level
    /// error.
    #[error("policy violation on node {node_id}: {source}")]
    Policy {
        node_id: NodeId,
        #[source]
        source: PolicyError,
    },

    #[error("codec failure on node {node_id}: {source}")]
    Codec {
        node_id: NodeId,
        #[source]
        source: CodecError,
    },

    #[error("dependency {0} has no store record")]
    MissingDependency(NodeId),

    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidPlan(_) => "InvalidPlan",
            EngineError::Store(_) => "StoreFailure",
            EngineError::Policy { source, .. } => source.code(),
            EngineError::Codec { .. } => "CodecFailure",
            EngineError::MissingDependency(_) => "MissingDependency",
            EngineError::Cancelled => "Cancelled",
        }
    }
}

/// Errors raised by primitive operators at dispatch time.
///
/// `Domain` is persisted as a `failed` record; `Cancelled` aborts the node
/// without a materialized payload; `Policy` wraps a synchronous rejection
/// observed inside an operator (a path outside the allowed roots) and
/// fails the job without any node-level record.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum OpError {
    #[error("{0}")]
    Domain(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl OpError {
    pub fn domain(msg: impl Into<String>) -> Self {
        OpError::Domain(msg.into())
    }
}
