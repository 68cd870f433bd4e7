//! Name resolution during reduction.
//!
//! The environment maps names to reduced nodes, closures, or primitive
//! operators. Closures exist only while reducing; they never leak into the
//! emitted workplan.

use crate::ast::Expr;
use crate::workplan::NodeId;
use std::collections::BTreeMap;

/// What a name resolves to.
#[derive(Clone, Debug)]
pub enum Binding {
    /// An already-reduced expression.
    Node(NodeId),
    /// A user function: parameter names, body, and the environment captured
    /// at the definition site.
    Closure(Closure),
    /// A primitive operator, under its registry name. Installed by imports
    /// and by the default namespace.
    Primitive(String),
}

#[derive(Clone, Debug)]
pub struct Closure {
    pub params: Vec<String>,
    pub body: Expr,
    pub captured: Environment,
}

/// An immutable-by-convention scope. Extension clones, so captured
/// snapshots are unaffected by later bindings; `let` is non-recursive and
/// shadowing is plain map insertion.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    bindings: BTreeMap<String, Binding>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    /// Bind a name, shadowing any previous binding.
    pub fn bind(&mut self, name: impl Into<String>, binding: Binding) {
        self.bindings.insert(name.into(), binding);
    }

    /// A copy of this environment with one extra binding.
    pub fn extended(&self, name: impl Into<String>, binding: Binding) -> Self {
        let mut next = self.clone();
        next.bind(name, binding);
        next
    }
}
