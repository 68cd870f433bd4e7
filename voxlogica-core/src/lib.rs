//! VoxLogicA-2 core: reduction of `.imgql` programs to a content-addressed
//! DAG and its memoized, concurrent execution.
//!
//! The pipeline is: AST (from an external parser) → [`reducer`] emits a
//! frozen [`workplan::Workplan`] → [`jobs::JobManager`] runs it through the
//! [`engine::ExecutionEngine`], which consults the [`store`] per node,
//! deduplicates in-process demand through the [`coordinator`], dispatches
//! primitives from the [`registry`], and persists every outcome. Inspection
//! traffic goes through the [`resolver`] and [`descriptor`] builder.

pub mod ast;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod reducer;
pub mod registry;
pub mod resolver;
pub mod stdlib;
pub mod store;
pub mod store_memory;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;
pub mod value;
pub mod workplan;

pub use reducer::canonical::RUNTIME_VERSION;
