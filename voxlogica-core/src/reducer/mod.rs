//! Lowers an AST into a [`Workplan`] of hash-identified operations.
//!
//! Reduction walks top-level commands with an environment of names to
//! nodes, closures, or primitives. Calls reduce arguments left to right,
//! then either substitute into a closure body or emit an operation named
//! after a registry primitive. Emitted operations are deduplicated by
//! content hash, so a shared subexpression appears in the plan exactly
//! once no matter how many times it is written.

pub mod canonical;
pub mod env;

use crate::ast::{Command, Expr, Program, Span};
use crate::error::ReduceError;
use crate::registry::OperatorRegistry;
use crate::workplan::{ConstValue, Goal, GoalKind, NodeId, Operation, Workplan};
use env::{Binding, Closure, Environment};
use std::collections::{BTreeMap, HashSet};

/// Closure application depth guard. Non-recursive `let` makes true cycles
/// impossible; this trips on pathological ASTs from a broken parser.
const MAX_APPLY_DEPTH: usize = 512;

/// The outcome of reduction: the frozen plan plus the top-level value
/// bindings, for inspection APIs that address results by variable name.
#[derive(Clone, Debug)]
pub struct ReducedProgram {
    pub workplan: Workplan,
    pub symbols: BTreeMap<String, NodeId>,
}

/// Reduce a whole program against a registry.
pub fn reduce_program(
    program: &Program,
    registry: &OperatorRegistry,
) -> Result<ReducedProgram, ReduceError> {
    let mut reducer = Reducer::new(registry);
    let mut env = Environment::new();
    for (local, full) in registry.default_bindings() {
        env.bind(local, Binding::Primitive(full));
    }

    for command in &program.commands {
        match command {
            Command::Bind {
                name,
                params,
                body,
                ..
            } => {
                if params.is_empty() {
                    let id = reducer.reduce_expr(&env, body)?;
                    env.bind(name.clone(), Binding::Node(id));
                    reducer.symbols.insert(name.clone(), id);
                } else {
                    env.bind(
                        name.clone(),
                        Binding::Closure(Closure {
                            params: params.clone(),
                            body: body.clone(),
                            captured: env.clone(),
                        }),
                    );
                }
            }
            Command::Import { namespace, span } => {
                let table = registry.namespace(namespace).ok_or_else(|| {
                    ReduceError::IllegalImport {
                        namespace: namespace.clone(),
                        span: *span,
                    }
                })?;
                // Declaration order; later imports shadow earlier ones.
                for (symbol, full_name) in table {
                    env.bind(symbol.clone(), Binding::Primitive(full_name.clone()));
                }
            }
            Command::Print { label, expr, span } => {
                if !reducer.print_labels.insert(label.clone()) {
                    return Err(ReduceError::DuplicatePrintLabel {
                        label: label.clone(),
                        span: *span,
                    });
                }
                let target = reducer.reduce_expr(&env, expr)?;
                reducer.goals.push(Goal {
                    kind: GoalKind::Print,
                    label: label.clone(),
                    target,
                });
            }
            Command::Save { path, expr, .. } => {
                let target = reducer.reduce_expr(&env, expr)?;
                reducer.goals.push(Goal {
                    kind: GoalKind::Save,
                    label: path.clone(),
                    target,
                });
            }
        }
    }

    Ok(reducer.finish())
}

struct Reducer<'a> {
    registry: &'a OperatorRegistry,
    operations: BTreeMap<NodeId, Operation>,
    order: Vec<NodeId>,
    goals: Vec<Goal>,
    symbols: BTreeMap<String, NodeId>,
    print_labels: HashSet<String>,
    apply_depth: usize,
}

impl<'a> Reducer<'a> {
    fn new(registry: &'a OperatorRegistry) -> Self {
        Self {
            registry,
            operations: BTreeMap::new(),
            order: Vec::new(),
            goals: Vec::new(),
            symbols: BTreeMap::new(),
            print_labels: HashSet::new(),
            apply_depth: 0,
        }
    }

    /// Insert an operation, deduplicating by content hash.
    fn emit(&mut self, op: Operation) -> NodeId {
        let id = canonical::node_id(&op);
        if !self.operations.contains_key(&id) {
            self.operations.insert(id, op);
            self.order.push(id);
        }
        id
    }

    fn reduce_expr(&mut self, env: &Environment, expr: &Expr) -> Result<NodeId, ReduceError> {
        match expr {
            Expr::Int { value, .. } => {
                Ok(self.emit(Operation::constant(ConstValue::Integer(*value))))
            }
            Expr::Float { value, .. } => {
                Ok(self.emit(Operation::constant(ConstValue::Float(*value))))
            }
            Expr::Str { value, .. } => Ok(self.emit(Operation::constant(ConstValue::String(
                value.clone(),
            )))),
            Expr::Bool { value, .. } => {
                Ok(self.emit(Operation::constant(ConstValue::Boolean(*value))))
            }
            Expr::Null { .. } => Ok(self.emit(Operation::constant(ConstValue::Null))),

            Expr::Ident { name, span } => match env.lookup(name) {
                Some(Binding::Node(id)) => Ok(*id),
                Some(Binding::Primitive(full)) => {
                    // Bare reference to a primitive is a nullary call.
                    self.emit_primitive(full.clone(), name, Vec::new(), *span)
                }
                Some(Binding::Closure(_)) => Err(ReduceError::SyntaxNotRecognized {
                    detail: format!("function `{name}` used as a value"),
                    span: *span,
                }),
                None => Err(ReduceError::UnknownCallable {
                    name: name.clone(),
                    span: *span,
                }),
            },

            Expr::Call { callee, args, span } => {
                // Arguments reduce left to right before the callee is
                // resolved.
                let mut arg_ids = Vec::with_capacity(args.len());
                for arg in args {
                    arg_ids.push(self.reduce_expr(env, arg)?);
                }
                match env.lookup(callee).cloned() {
                    Some(Binding::Closure(closure)) => {
                        self.apply_closure(callee, &closure, arg_ids, *span)
                    }
                    Some(Binding::Primitive(full)) => {
                        self.emit_primitive(full, callee, arg_ids, *span)
                    }
                    Some(Binding::Node(_)) => Err(ReduceError::UnknownCallable {
                        name: callee.clone(),
                        span: *span,
                    }),
                    None => Err(ReduceError::UnknownCallable {
                        name: callee.clone(),
                        span: *span,
                    }),
                }
            }

            Expr::Let {
                name, value, body, ..
            } => {
                let id = self.reduce_expr(env, value)?;
                let inner = env.extended(name.clone(), Binding::Node(id));
                self.reduce_expr(&inner, body)
            }
        }
    }

    fn apply_closure(
        &mut self,
        name: &str,
        closure: &Closure,
        args: Vec<NodeId>,
        span: Span,
    ) -> Result<NodeId, ReduceError> {
        if closure.params.len() != args.len() {
            return Err(ReduceError::ArityMismatch {
                name: name.to_string(),
                expected: closure.params.len().to_string(),
                got: args.len(),
                span,
            });
        }
        self.apply_depth += 1;
        if self.apply_depth > MAX_APPLY_DEPTH {
            return Err(ReduceError::CyclicDefinition {
                name: name.to_string(),
                span,
            });
        }
        let mut scope = closure.captured.clone();
        for (param, arg) in closure.params.iter().zip(args) {
            scope.bind(param.clone(), Binding::Node(arg));
        }
        let result = self.reduce_expr(&scope, &closure.body);
        self.apply_depth -= 1;
        result
    }

    fn emit_primitive(
        &mut self,
        full_name: String,
        local_name: &str,
        args: Vec<NodeId>,
        span: Span,
    ) -> Result<NodeId, ReduceError> {
        let entry = self
            .registry
            .get(&full_name)
            .ok_or_else(|| ReduceError::UnknownCallable {
                name: local_name.to_string(),
                span,
            })?;
        if !entry.arity.accepts(args.len()) {
            return Err(ReduceError::ArityMismatch {
                name: local_name.to_string(),
                expected: entry.arity.describe(),
                got: args.len(),
                span,
            });
        }
        Ok(self.emit(Operation::named(full_name, args)))
    }

    fn finish(self) -> ReducedProgram {
        let workplan = Workplan::new(self.operations, self.order, self.goals);
        debug_assert!(workplan.verify().is_ok());
        ReducedProgram {
            workplan,
            symbols: self.symbols,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast;
    use crate::stdlib;

    fn registry() -> OperatorRegistry {
        stdlib::registry()
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

    #[test]
    fn reduces_constant_arithmetic_to_three_nodes() {
        let reduced = reduce_program(&sum_program(), &registry()).unwrap();
        assert_eq!(reduced.workplan.len(), 3);
        assert_eq!(reduced.workplan.goals().len(), 1);
        assert_eq!(reduced.symbols.len(), 3);
        assert!(reduced.workplan.verify().is_ok());
    }

    #[test]
    fn identity_is_deterministic_across_reductions() {
        let first = reduce_program(&sum_program(), &registry()).unwrap();
        let second = reduce_program(&sum_program(), &registry()).unwrap();
        assert_eq!(
            first.workplan.goals()[0].target,
            second.workplan.goals()[0].target
        );
    }

    #[test]
    fn structurally_equal_programs_share_goal_identity() {
        // Same operations spelled without intermediate names.
        let inline = Program::new(vec![ast::print(
            "sum",
            ast::call("+", vec![ast::int(1), ast::int(2)]),
        )]);
        let named = reduce_program(&sum_program(), &registry()).unwrap();
        let flat = reduce_program(&inline, &registry()).unwrap();
        assert_eq!(
            named.workplan.goals()[0].target,
            flat.workplan.goals()[0].target
        );
    }

    #[test]
    fn shared_subexpressions_deduplicate() {
        // x = 1+2, y = (1+2)+(1+2): the sum node appears once.
        let program = Program::new(vec![
            ast::bind("x", ast::call("+", vec![ast::int(1), ast::int(2)])),
            ast::bind(
                "y",
                ast::call(
                    "+",
                    vec![
                        ast::call("+", vec![ast::int(1), ast::int(2)]),
                        ast::ident("x"),
                    ],
                ),
            ),
            ast::print("y", ast::ident("y")),
        ]);
        let reduced = reduce_program(&program, &registry()).unwrap();
        // 1, 2, 1+2, (1+2)+(1+2): four nodes, not six.
        assert_eq!(reduced.workplan.len(), 4);
    }

    #[test]
    fn closures_substitute_arguments() {
        // let double(n) = n + n; print "d" double(21)
        let program = Program::new(vec![
            ast::bind_fn(
                "double",
                &["n"],
                ast::call("+", vec![ast::ident("n"), ast::ident("n")]),
            ),
            ast::print("d", ast::call("double", vec![ast::int(21)])),
        ]);
        let reduced = reduce_program(&program, &registry()).unwrap();
        // 21 and 21+21.
        assert_eq!(reduced.workplan.len(), 2);
    }

    #[test]
    fn closure_captures_definition_site_scope() {
        // k = 10; let addk(n) = n + k; k = 99; print "v" addk(1)
        // The closure sees k = 10.
        let program_shadowed = Program::new(vec![
            ast::bind("k", ast::int(10)),
            ast::bind_fn(
                "addk",
                &["n"],
                ast::call("+", vec![ast::ident("n"), ast::ident("k")]),
            ),
            ast::bind("k", ast::int(99)),
            ast::print("v", ast::call("addk", vec![ast::int(1)])),
        ]);
        let program_plain = Program::new(vec![ast::print(
            "v",
            ast::call("+", vec![ast::int(1), ast::int(10)]),
        )]);
        let shadowed = reduce_program(&program_shadowed, &registry()).unwrap();
        let plain = reduce_program(&program_plain, &registry()).unwrap();
        assert_eq!(
            shadowed.workplan.goals()[0].target,
            plain.workplan.goals()[0].target
        );
    }

    #[test]
    fn let_in_scopes_locally() {
        let program = Program::new(vec![ast::print(
            "v",
            Expr::Let {
                name: "x".into(),
                value: Box::new(ast::int(5)),
                body: Box::new(ast::call("+", vec![ast::ident("x"), ast::ident("x")])),
                span: Span::default(),
            },
        )]);
        let reduced = reduce_program(&program, &registry()).unwrap();
        assert_eq!(reduced.workplan.len(), 2);
    }

    #[test]
    fn unknown_callable_is_rejected() {
        let program = Program::new(vec![ast::print("x", ast::call("nope", vec![ast::int(1)]))]);
        let err = reduce_program(&program, &registry()).unwrap_err();
        assert_eq!(err.code(), "UnknownCallable");
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let program = Program::new(vec![ast::print("x", ast::call("+", vec![ast::int(1)]))]);
        let err = reduce_program(&program, &registry()).unwrap_err();
        assert_eq!(err.code(), "ArityMismatch");
    }

    #[test]
    fn duplicate_print_labels_are_rejected() {
        let program = Program::new(vec![
            ast::print("same", ast::int(1)),
            ast::print("same", ast::int(2)),
        ]);
        let err = reduce_program(&program, &registry()).unwrap_err();
        assert_eq!(err.code(), "DuplicatePrintLabel");
    }

    #[test]
    fn unknown_namespace_is_rejected() {
        let program = Program::new(vec![ast::import("no_such_namespace")]);
        let err = reduce_program(&program, &registry()).unwrap_err();
        assert_eq!(err.code(), "IllegalImport");
    }

    #[test]
    fn import_installs_namespace_symbols() {
        let program = Program::new(vec![
            ast::import("seq"),
            ast::print("r", ast::call("range", vec![ast::int(0), ast::int(5)])),
        ]);
        let reduced = reduce_program(&program, &registry()).unwrap();
        assert_eq!(reduced.workplan.goals().len(), 1);
    }

    #[test]
    fn runaway_application_trips_the_depth_guard() {
        // True cycles cannot be written with non-recursive let; fabricate
        // nested application depth with a mechanical chain f_i(n) = f_{i-1}(n).
        let mut commands = vec![ast::bind_fn("f0", &["n"], ast::ident("n"))];
        for i in 1..=MAX_APPLY_DEPTH + 1 {
            commands.push(ast::bind_fn(
                format!("f{i}"),
                &["n"],
                ast::call(format!("f{}", i - 1), vec![ast::ident("n")]),
            ));
        }
        commands.push(ast::print(
            "v",
            ast::call(format!("f{}", MAX_APPLY_DEPTH + 1), vec![ast::int(1)]),
        ));
        let err = reduce_program(&Program::new(commands), &registry()).unwrap_err();
        assert_eq!(err.code(), "CyclicDefinition");
    }
}
