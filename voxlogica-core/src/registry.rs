//! The operator registry: name → pure callable with declared arity and
//! effect class.
//!
//! Entries are a tagged sum over the concrete signatures the built-in
//! library uses, plus an erased async fallback for operators that need a
//! context (cancellation polling, scratch space, filesystem policy).
//! Registration happens once at startup; afterwards the registry is
//! immutable and shared read-only.

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::error::OpError;
use crate::value::VoxValue;
use crate::workplan::NodeId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declared argument count of a primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Any => true,
        }
    }

    pub fn describe(self) -> String {
        match self {
            Arity::Exact(k) => k.to_string(),
            Arity::AtLeast(k) => format!("at least {k}"),
            Arity::Any => "any number of".to_string(),
        }
    }
}

/// Effect class of a primitive. `Pure` operators touch nothing outside
/// their arguments; `ReadsFs` operators read host files through the
/// containment check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectClass {
    Pure,
    ReadsFs,
}

/// Context handed to fallback operators.
pub struct OpContext {
    pub node_id: NodeId,
    cancel: CancellationToken,
    config: Arc<EngineConfig>,
    registry: Arc<OperatorRegistry>,
}

impl OpContext {
    pub fn new(
        node_id: NodeId,
        cancel: CancellationToken,
        config: Arc<EngineConfig>,
        registry: Arc<OperatorRegistry>,
    ) -> Self {
        Self {
            node_id,
            cancel,
            config,
            registry,
        }
    }

    /// Apply a pure unary primitive, for operators that materialize lazy
    /// plan elements.
    pub fn apply_unary(&self, name: &str, arg: &VoxValue) -> Result<VoxValue, OpError> {
        self.registry.apply_unary_sync(name, arg)
    }

    /// Cooperative cancellation poll for long-running operators.
    pub fn check_cancelled(&self) -> Result<(), OpError> {
        if self.cancel.is_cancelled() {
            Err(OpError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.config.scratch_dir
    }

    /// Containment check for any host path an operator wants to read.
    pub fn ensure_readable(&self, path: &Path) -> Result<PathBuf, OpError> {
        Ok(self.config.ensure_readable(path)?)
    }

    /// Structured logger scoped to the running node.
    pub fn log(&self, message: &str) {
        tracing::info!(node_id = %self.node_id.short(), "{message}");
    }
}

/// Erased fallback signature: already-decoded arguments plus a context.
#[async_trait]
pub trait OpFn: Send + Sync {
    async fn call(&self, args: &[VoxValue], ctx: &OpContext) -> Result<VoxValue, OpError>;
}

/// The tagged sum of supported callable shapes.
#[derive(Clone)]
pub enum OpKind {
    Unary(fn(&VoxValue) -> Result<VoxValue, OpError>),
    Binary(fn(&VoxValue, &VoxValue) -> Result<VoxValue, OpError>),
    Nary(fn(&[VoxValue]) -> Result<VoxValue, OpError>),
    Fallback(Arc<dyn OpFn>),
}

/// One registered primitive.
#[derive(Clone)]
pub struct OpEntry {
    pub name: String,
    pub arity: Arity,
    pub effect: EffectClass,
    pub kind: OpKind,
}

/// Immutable-after-startup operator table plus importable namespaces.
#[derive(Default)]
pub struct OperatorRegistry {
    ops: HashMap<String, OpEntry>,
    /// Namespace → local symbol → fully qualified op name, in declaration
    /// order.
    namespaces: HashMap<String, Vec<(String, String)>>,
    /// Symbols installed into every program's root scope.
    default_bindings: Vec<(String, String)>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a primitive. Panics on duplicate names: registration is
    /// static startup wiring, and a duplicate is a programming error.
    pub fn register(&mut self, entry: OpEntry) {
        let name = entry.name.clone();
        if self.ops.insert(name.clone(), entry).is_some() {
            panic!("operator `{name}` registered twice");
        }
    }

    pub fn register_unary(
        &mut self,
        name: &str,
        f: fn(&VoxValue) -> Result<VoxValue, OpError>,
    ) {
        self.register(OpEntry {
            name: name.to_string(),
            arity: Arity::Exact(1),
            effect: EffectClass::Pure,
            kind: OpKind::Unary(f),
        });
    }

    pub fn register_binary(
        &mut self,
        name: &str,
        f: fn(&VoxValue, &VoxValue) -> Result<VoxValue, OpError>,
    ) {
        self.register(OpEntry {
            name: name.to_string(),
            arity: Arity::Exact(2),
            effect: EffectClass::Pure,
            kind: OpKind::Binary(f),
        });
    }

    /// Declare a namespace installed by `import`. Symbols keep declaration
    /// order so later entries shadow earlier ones in the reducer's scope.
    pub fn declare_namespace(&mut self, namespace: &str, symbols: Vec<(String, String)>) {
        self.namespaces.insert(namespace.to_string(), symbols);
    }

    /// Add a symbol to the root scope of every program.
    pub fn bind_default(&mut self, local: &str, full: &str) {
        self.default_bindings
            .push((local.to_string(), full.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&OpEntry> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn namespace(&self, name: &str) -> Option<&[(String, String)]> {
        self.namespaces.get(name).map(|v| v.as_slice())
    }

    pub fn default_bindings(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.default_bindings.iter().cloned()
    }

    /// Sorted operator names, for capability discovery.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ops.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch a primitive on decoded arguments.
    pub async fn dispatch(
        &self,
        name: &str,
        args: &[VoxValue],
        ctx: &OpContext,
    ) -> Result<VoxValue, OpError> {
        let entry = self
            .ops
            .get(name)
            .ok_or_else(|| OpError::domain(format!("operator `{name}` is not registered")))?;
        if !entry.arity.accepts(args.len()) {
            return Err(OpError::domain(format!(
                "operator `{name}` expects {} argument(s), got {}",
                entry.arity.describe(),
                args.len()
            )));
        }
        ctx.check_cancelled()?;
        match &entry.kind {
            OpKind::Unary(f) => f(&args[0]),
            OpKind::Binary(f) => f(&args[0], &args[1]),
            OpKind::Nary(f) => f(args),
            OpKind::Fallback(f) => f.call(args, ctx).await,
        }
    }

    /// Synchronous unary application, used when materializing lazy `Map`
    /// plans. Only `Unary` entries qualify; anything else is a domain
    /// error, which keeps page materialization free of awaits.
    pub fn apply_unary_sync(&self, name: &str, arg: &VoxValue) -> Result<VoxValue, OpError> {
        match self.ops.get(name).map(|e| &e.kind) {
            Some(OpKind::Unary(f)) => f(arg),
            Some(_) => Err(OpError::domain(format!(
                "operator `{name}` cannot be used in a lazy map plan"
            ))),
            None => Err(OpError::domain(format!(
                "operator `{name}` is not registered"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(registry: Arc<OperatorRegistry>) -> OpContext {
        OpContext::new(
            NodeId::from_bytes([0; 32]),
            CancellationToken::new(),
            Arc::new(EngineConfig::default()),
            registry,
        )
    }

    fn neg(v: &VoxValue) -> Result<VoxValue, OpError> {
        v.as_i64()
            .map(|n| VoxValue::Int(-n))
            .ok_or_else(|| OpError::domain("neg wants an integer"))
    }

    #[tokio::test]
    async fn dispatch_checks_arity() {
        let mut registry = OperatorRegistry::new();
        registry.register_unary("neg", neg);
        let registry = Arc::new(registry);
        let ctx = ctx(registry.clone());

        let ok = registry
            .dispatch("neg", &[VoxValue::Int(3)], &ctx)
            .await
            .unwrap();
        assert_eq!(ok, VoxValue::Int(-3));

        let err = registry
            .dispatch("neg", &[VoxValue::Int(1), VoxValue::Int(2)], &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OpError::Domain(_)));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_dispatch() {
        let mut registry = OperatorRegistry::new();
        registry.register_unary("neg", neg);
        let registry = Arc::new(registry);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = OpContext::new(
            NodeId::from_bytes([0; 32]),
            cancel,
            Arc::new(EngineConfig::default()),
            registry.clone(),
        );
        let err = registry
            .dispatch("neg", &[VoxValue::Int(3)], &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, OpError::Cancelled);
    }

    #[test]
    fn lazy_map_rejects_non_unary_operators() {
        let mut registry = OperatorRegistry::new();
        registry.register_unary("neg", neg);
        assert!(registry.apply_unary_sync("neg", &VoxValue::Int(1)).is_ok());
        assert!(registry
            .apply_unary_sync("missing", &VoxValue::Int(1))
            .is_err());
    }
}
