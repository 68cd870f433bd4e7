//! The frozen DAG emitted by the reducer.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// 256-bit content hash identifying an [`Operation`].
///
/// The digest is the sole identity: two nodes with identical operator and
/// identical argument ids are the same node. Rendered lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let raw = hex::decode(s)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(bytes))
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(|e| D::Error::custom(format!("bad node id: {e}")))
    }
}

/// A constant literal lifted to a node of its own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Null,
}

/// The operator of a node: a named primitive or a canonical constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operator {
    Named(String),
    Const(ConstValue),
}

impl Operator {
    /// Display name used in event logs and descriptors.
    pub fn display_name(&self) -> String {
        match self {
            Operator::Named(name) => name.clone(),
            Operator::Const(ConstValue::Integer(v)) => v.to_string(),
            Operator::Const(ConstValue::Float(v)) => v.to_string(),
            Operator::Const(ConstValue::Boolean(v)) => v.to_string(),
            Operator::Const(ConstValue::String(v)) => format!("{v:?}"),
            Operator::Const(ConstValue::Null) => "null".to_string(),
        }
    }
}

/// One pure operation producing one value.
///
/// `attributes` carry static configuration; they participate in the node
/// hash, so anything that changes observable behavior must go here and
/// runtime telemetry must not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operator: Operator,
    pub arguments: Vec<NodeId>,
    pub attributes: BTreeMap<String, String>,
}

impl Operation {
    pub fn named(name: impl Into<String>, arguments: Vec<NodeId>) -> Self {
        Self {
            operator: Operator::Named(name.into()),
            arguments,
            attributes: BTreeMap::new(),
        }
    }

    pub fn constant(value: ConstValue) -> Self {
        Self {
            operator: Operator::Const(value),
            arguments: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// A named observation of a node's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    Print,
    Save,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub kind: GoalKind,
    /// Print label, or the save destination path.
    pub label: String,
    pub target: NodeId,
}

/// An immutable set of operations plus the goals observing them.
///
/// Invariants, guaranteed by the reducer and checked by [`Workplan::verify`]:
/// every referenced id is defined exactly once, the graph is acyclic, and
/// `nodes` is in topological post-order (arguments precede their users).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Workplan {
    operations: BTreeMap<NodeId, Operation>,
    /// Insertion order from the reducer (topological post-order).
    nodes: Vec<NodeId>,
    goals: Vec<Goal>,
}

impl Workplan {
    pub fn new(
        operations: BTreeMap<NodeId, Operation>,
        nodes: Vec<NodeId>,
        goals: Vec<Goal>,
    ) -> Self {
        Self {
            operations,
            nodes,
            goals,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.operations.contains_key(&id)
    }

    /// Nodes in insertion (topological) order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Operation)> {
        self.nodes.iter().map(|id| (*id, &self.operations[id]))
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    /// Check the structural invariants. The reducer cannot emit a plan that
    /// violates them; this guards hand-built and deserialized plans.
    pub fn verify(&self) -> Result<(), String> {
        if self.nodes.len() != self.operations.len() {
            return Err(format!(
                "{} ordered nodes but {} operations",
                self.nodes.len(),
                self.operations.len()
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.nodes {
            let op = self
                .operations
                .get(id)
                .ok_or_else(|| format!("ordered node {id} has no operation"))?;
            for arg in &op.arguments {
                if !seen.contains(arg) {
                    return Err(format!("node {id} references undefined or later node {arg}"));
                }
            }
            if !seen.insert(*id) {
                return Err(format!("node {id} defined twice"));
            }
        }
        for goal in &self.goals {
            if !self.operations.contains_key(&goal.target) {
                return Err(format!("goal `{}` targets undefined node {}", goal.label, goal.target));
            }
        }
        Ok(())
    }

    /// The sub-plan needed to compute `target`: the node and its transitive
    /// arguments, in the original order, with no goals. Used by single-node
    /// value jobs.
    pub fn restricted_to(&self, target: NodeId) -> Option<Workplan> {
        self.operations.get(&target)?;
        let mut keep = std::collections::HashSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if keep.insert(id) {
                if let Some(op) = self.operations.get(&id) {
                    stack.extend(op.arguments.iter().copied());
                }
            }
        }
        let nodes: Vec<NodeId> = self.nodes.iter().copied().filter(|n| keep.contains(n)).collect();
        let operations = nodes
            .iter()
            .map(|n| (*n, self.operations[n].clone()))
            .collect();
        Some(Workplan {
            operations,
            nodes,
            goals: Vec::new(),
        })
    }
}
