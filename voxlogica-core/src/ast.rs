//! The AST contract with the parser collaborator.
//!
//! The core never parses `.imgql` text itself; a parser delivers a
//! [`Program`] built from these forms. Infix applications arrive already
//! normalized: the callee is the function identifier, never its lexical
//! spelling, so `a + b` reaches the reducer as `Call { callee: "+", .. }`.
//!
//! Source locations are opaque `(line, column)` pairs carried through to
//! diagnostics untouched.

use serde::{Deserialize, Serialize};

/// Opaque source position attached to every AST node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// An expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Integral numeric literal.
    Int { value: i64, span: Span },
    /// Floating-point numeric literal.
    Float { value: f64, span: Span },
    Str { value: String, span: Span },
    Bool { value: bool, span: Span },
    Null { span: Span },
    /// Reference to a bound name.
    Ident { name: String, span: Span },
    /// Application, prefix or infix. Zero arguments is legal (nullary
    /// primitives).
    Call {
        callee: String,
        args: Vec<Expr>,
        span: Span,
    },
    /// `let name = value in body`: local, non-recursive, shadowing.
    Let {
        name: String,
        value: Box<Expr>,
        body: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int { span, .. }
            | Expr::Float { span, .. }
            | Expr::Str { span, .. }
            | Expr::Bool { span, .. }
            | Expr::Null { span }
            | Expr::Ident { span, .. }
            | Expr::Call { span, .. }
            | Expr::Let { span, .. } => *span,
        }
    }
}

/// A top-level command.
///
/// Bare assignments (`x = e`) desugar in the parser to a [`Command::Bind`]
/// with no parameters; `let f(a, b) = e` arrives with `params = ["a", "b"]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Bind {
        name: String,
        params: Vec<String>,
        body: Expr,
        span: Span,
    },
    Import {
        namespace: String,
        span: Span,
    },
    Print {
        label: String,
        expr: Expr,
        span: Span,
    },
    Save {
        path: String,
        expr: Expr,
        span: Span,
    },
}

impl Command {
    pub fn span(&self) -> Span {
        match self {
            Command::Bind { span, .. }
            | Command::Import { span, .. }
            | Command::Print { span, .. }
            | Command::Save { span, .. } => *span,
        }
    }
}

/// A complete program as delivered by the parser.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub commands: Vec<Command>,
}

impl Program {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }
}

// ─── Construction helpers ─────────────────────────────────────
//
// The parser builds these nodes directly; tests and embedders use the
// shorthand below instead of spelling out spans.

pub fn int(value: i64) -> Expr {
    Expr::Int {
        value,
        span: Span::default(),
    }
}

pub fn float(value: f64) -> Expr {
    Expr::Float {
        value,
        span: Span::default(),
    }
}

pub fn string(value: impl Into<String>) -> Expr {
    Expr::Str {
        value: value.into(),
        span: Span::default(),
    }
}

pub fn boolean(value: bool) -> Expr {
    Expr::Bool {
        value,
        span: Span::default(),
    }
}

pub fn ident(name: impl Into<String>) -> Expr {
    Expr::Ident {
        name: name.into(),
        span: Span::default(),
    }
}

pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Call {
        callee: callee.into(),
        args,
        span: Span::default(),
    }
}

pub fn bind(name: impl Into<String>, body: Expr) -> Command {
    Command::Bind {
        name: name.into(),
        params: Vec::new(),
        body,
        span: Span::default(),
    }
}

pub fn bind_fn(name: impl Into<String>, params: &[&str], body: Expr) -> Command {
    Command::Bind {
        name: name.into(),
        params: params.iter().map(|p| p.to_string()).collect(),
        body,
        span: Span::default(),
    }
}

pub fn import(namespace: impl Into<String>) -> Command {
    Command::Import {
        namespace: namespace.into(),
        span: Span::default(),
    }
}

pub fn print(label: impl Into<String>, expr: Expr) -> Command {
    Command::Print {
        label: label.into(),
        expr,
        span: Span::default(),
    }
}

pub fn save(path: impl Into<String>, expr: Expr) -> Command {
    Command::Save {
        path: path.into(),
        expr,
        span: Span::default(),
    }
}
