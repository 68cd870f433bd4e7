//! Built-in primitive namespaces.
//!
//! The base namespace (arithmetic, comparison, logic, strings) is
//! installed into every program's root scope; `seq` and `io` are
//! importable. The heavy image-processing library registers through the
//! same [`OperatorRegistry`] API from outside the core.

use crate::error::OpError;
use crate::registry::{Arity, EffectClass, OpContext, OpEntry, OpFn, OpKind, OperatorRegistry};
use crate::value::{LazySeqPlan, VoxValue};
use async_trait::async_trait;
use std::sync::Arc;

/// Hard cap on elements realized by `seq.collect`.
const COLLECT_LIMIT: u64 = 65_536;

/// A registry with every built-in namespace installed.
pub fn registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    install(&mut registry);
    registry
}

/// Install the built-in namespaces into an existing registry.
pub fn install(registry: &mut OperatorRegistry) {
    install_base(registry);
    install_seq(registry);
    install_io(registry);
}

// ─── Base namespace ───────────────────────────────────────────

fn install_base(registry: &mut OperatorRegistry) {
    registry.register_binary("+", add);
    registry.register_binary("-", sub);
    registry.register_binary("*", mul);
    registry.register_binary("/", div);
    registry.register_binary("%", rem);
    registry.register_binary("=", eq);
    registry.register_binary("!=", ne);
    registry.register_binary("<", lt);
    registry.register_binary("<=", le);
    registry.register_binary(">", gt);
    registry.register_binary(">=", ge);
    registry.register_binary("and", and);
    registry.register_binary("or", or);
    registry.register_unary("not", not);
    registry.register_binary("concat", concat);
    registry.register_unary("length", length);
    registry.register(OpEntry {
        name: "substring".to_string(),
        arity: Arity::Exact(3),
        effect: EffectClass::Pure,
        kind: OpKind::Nary(substring),
    });

    for name in [
        "+", "-", "*", "/", "%", "=", "!=", "<", "<=", ">", ">=", "and", "or", "not", "concat",
        "length", "substring",
    ] {
        registry.bind_default(name, name);
    }
}

fn numeric_pair(a: &VoxValue, b: &VoxValue, op: &str) -> Result<(f64, f64), OpError> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(OpError::domain(format!(
            "`{op}` wants numeric operands, got {} and {}",
            a.vox_type(),
            b.vox_type()
        ))),
    }
}

/// Integer result when both operands are integers, float otherwise.
fn arith(
    a: &VoxValue,
    b: &VoxValue,
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<VoxValue, OpError> {
    if let (VoxValue::Int(x), VoxValue::Int(y)) = (a, b) {
        return int_op(*x, *y)
            .map(VoxValue::Int)
            .ok_or_else(|| OpError::domain(format!("`{op}` overflow or division by zero")));
    }
    let (x, y) = numeric_pair(a, b, op)?;
    Ok(VoxValue::Float(float_op(x, y)))
}

fn add(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    arith(a, b, "+", i64::checked_add, |x, y| x + y)
}

fn sub(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    arith(a, b, "-", i64::checked_sub, |x, y| x - y)
}

fn mul(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    arith(a, b, "*", i64::checked_mul, |x, y| x * y)
}

fn div(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    arith(a, b, "/", i64::checked_div, |x, y| x / y)
}

fn rem(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    arith(a, b, "%", i64::checked_rem, |x, y| x % y)
}

fn eq(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(compare_eq(a, b)))
}

fn ne(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(!compare_eq(a, b)))
}

/// Equality with int/float widening; everything else is structural.
fn compare_eq(a: &VoxValue, b: &VoxValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordered(a: &VoxValue, b: &VoxValue, op: &str) -> Result<std::cmp::Ordering, OpError> {
    if let (VoxValue::Str(x), VoxValue::Str(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    let (x, y) = numeric_pair(a, b, op)?;
    x.partial_cmp(&y)
        .ok_or_else(|| OpError::domain(format!("`{op}` on unordered values")))
}

fn lt(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(ordered(a, b, "<")?.is_lt()))
}

fn le(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(ordered(a, b, "<=")?.is_le()))
}

fn gt(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(ordered(a, b, ">")?.is_gt()))
}

fn ge(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(ordered(a, b, ">=")?.is_ge()))
}

fn and(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(a.truthy() && b.truthy()))
}

fn or(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(a.truthy() || b.truthy()))
}

fn not(a: &VoxValue) -> Result<VoxValue, OpError> {
    Ok(VoxValue::Bool(!a.truthy()))
}

fn concat(a: &VoxValue, b: &VoxValue) -> Result<VoxValue, OpError> {
    match (a, b) {
        (VoxValue::Str(x), VoxValue::Str(y)) => Ok(VoxValue::Str(format!("{x}{y}"))),
        _ => Err(OpError::domain(format!(
            "`concat` wants strings, got {} and {}",
            a.vox_type(),
            b.vox_type()
        ))),
    }
}

fn length(a: &VoxValue) -> Result<VoxValue, OpError> {
    let len = match a {
        VoxValue::Str(s) => s.chars().count() as i64,
        VoxValue::Seq(items) => items.len() as i64,
        VoxValue::Lazy(plan) => plan.len() as i64,
        VoxValue::Map(map) => map.len() as i64,
        VoxValue::Bytes(b) => b.len() as i64,
        other => {
            return Err(OpError::domain(format!(
                "`length` of a {}",
                other.vox_type()
            )))
        }
    };
    Ok(VoxValue::Int(len))
}

fn substring(args: &[VoxValue]) -> Result<VoxValue, OpError> {
    let (s, start, len) = match args {
        [VoxValue::Str(s), VoxValue::Int(start), VoxValue::Int(len)] => (s, *start, *len),
        _ => return Err(OpError::domain("`substring` wants (string, start, length)")),
    };
    if start < 0 || len < 0 {
        return Err(OpError::domain("`substring` indices must be non-negative"));
    }
    let out: String = s
        .chars()
        .skip(start as usize)
        .take(len as usize)
        .collect();
    Ok(VoxValue::Str(out))
}

// ─── seq namespace ────────────────────────────────────────────

fn install_seq(registry: &mut OperatorRegistry) {
    registry.register(OpEntry {
        name: "seq.range".to_string(),
        arity: Arity::AtLeast(2),
        effect: EffectClass::Pure,
        kind: OpKind::Nary(seq_range),
    });
    registry.register_binary("seq.map", seq_map);
    registry.register(OpEntry {
        name: "seq.get".to_string(),
        arity: Arity::Exact(2),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(SeqGet)),
    });
    registry.register(OpEntry {
        name: "seq.collect".to_string(),
        arity: Arity::Exact(1),
        effect: EffectClass::Pure,
        kind: OpKind::Fallback(Arc::new(SeqCollect)),
    });

    registry.declare_namespace(
        "seq",
        [
            ("range", "seq.range"),
            ("map", "seq.map"),
            ("get", "seq.get"),
            ("collect", "seq.collect"),
        ]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect(),
    );
}

fn seq_range(args: &[VoxValue]) -> Result<VoxValue, OpError> {
    let ints: Vec<i64> = args
        .iter()
        .map(|v| {
            v.as_i64()
                .ok_or_else(|| OpError::domain("`range` wants integer bounds"))
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(OpError::domain("`range` wants (start, stop[, step])")),
    };
    if step == 0 {
        return Err(OpError::domain("`range` step must not be zero"));
    }
    Ok(VoxValue::Lazy(LazySeqPlan::Range { start, stop, step }))
}

fn seq_map(op: &VoxValue, source: &VoxValue) -> Result<VoxValue, OpError> {
    let operator = op
        .as_str()
        .ok_or_else(|| OpError::domain("`map` wants an operator name"))?;
    match source {
        VoxValue::Lazy(plan) => Ok(VoxValue::Lazy(LazySeqPlan::Map {
            operator: operator.to_string(),
            source: Box::new(plan.clone()),
        })),
        other => Err(OpError::domain(format!(
            "`map` wants a lazy sequence, got {}",
            other.vox_type()
        ))),
    }
}

struct SeqGet;

#[async_trait]
impl OpFn for SeqGet {
    async fn call(&self, args: &[VoxValue], ctx: &OpContext) -> Result<VoxValue, OpError> {
        let index = args[1]
            .as_i64()
            .filter(|i| *i >= 0)
            .ok_or_else(|| OpError::domain("`get` wants a non-negative index"))?
            as u64;
        match &args[0] {
            VoxValue::Seq(items) => items
                .get(index as usize)
                .cloned()
                .ok_or_else(|| OpError::domain(format!("index {index} out of range"))),
            VoxValue::Lazy(plan) => plan.element(index, &|name, v| ctx.apply_unary(name, v)),
            other => Err(OpError::domain(format!(
                "`get` wants a sequence, got {}",
                other.vox_type()
            ))),
        }
    }
}

struct SeqCollect;

#[async_trait]
impl OpFn for SeqCollect {
    async fn call(&self, args: &[VoxValue], ctx: &OpContext) -> Result<VoxValue, OpError> {
        let plan = match &args[0] {
            VoxValue::Lazy(plan) => plan,
            VoxValue::Seq(_) => return Ok(args[0].clone()),
            other => {
                return Err(OpError::domain(format!(
                    "`collect` wants a lazy sequence, got {}",
                    other.vox_type()
                )))
            }
        };
        let len = plan.len();
        if len > COLLECT_LIMIT {
            return Err(OpError::domain(format!(
                "`collect` of {len} elements exceeds the limit of {COLLECT_LIMIT}"
            )));
        }
        let mut items = Vec::with_capacity(len as usize);
        for index in 0..len {
            ctx.check_cancelled()?;
            items.push(plan.element(index, &|name, v| ctx.apply_unary(name, v))?);
        }
        Ok(VoxValue::Seq(items))
    }
}

// ─── io namespace ─────────────────────────────────────────────

fn install_io(registry: &mut OperatorRegistry) {
    registry.register(OpEntry {
        name: "io.read_text".to_string(),
        arity: Arity::Exact(1),
        effect: EffectClass::ReadsFs,
        kind: OpKind::Fallback(Arc::new(ReadText)),
    });
    registry.register(OpEntry {
        name: "io.read_bytes".to_string(),
        arity: Arity::Exact(1),
        effect: EffectClass::ReadsFs,
        kind: OpKind::Fallback(Arc::new(ReadBytes)),
    });

    registry.declare_namespace(
        "io",
        [("read_text", "io.read_text"), ("read_bytes", "io.read_bytes")]
            .into_iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect(),
    );
}

fn checked_path(args: &[VoxValue], ctx: &OpContext) -> Result<std::path::PathBuf, OpError> {
    let raw = args[0]
        .as_str()
        .ok_or_else(|| OpError::domain("read wants a path string"))?;
    ctx.ensure_readable(std::path::Path::new(raw))
}

struct ReadText;

#[async_trait]
impl OpFn for ReadText {
    async fn call(&self, args: &[VoxValue], ctx: &OpContext) -> Result<VoxValue, OpError> {
        let path = checked_path(args, ctx)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| OpError::domain(format!("read {}: {e}", path.display())))?;
        Ok(VoxValue::Str(text))
    }
}

struct ReadBytes;

#[async_trait]
impl OpFn for ReadBytes {
    async fn call(&self, args: &[VoxValue], ctx: &OpContext) -> Result<VoxValue, OpError> {
        let path = checked_path(args, ctx)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| OpError::domain(format!("read {}: {e}", path.display())))?;
        Ok(VoxValue::Bytes(bytes))
    }
}
