//! Side-effect-free expression evaluation over an environment.
//!
//! Function calls are not resolved here; the engine intercepts calls in
//! statement position and interprets the callee, while calls nested
//! inside larger expressions evaluate conservatively.

use num_bigint::BigInt;
use num_traits::Num;

use crate::cfg::ContractCfg;
use crate::domain::{interval_kind_of, AbstractValue, Interval, IntervalKind, VarData, Variable};
use crate::error::{AnalysisError, Result};
use crate::ir::{BinOp, Expression, SolType, UnOp};
use crate::Env;

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    Value(AbstractValue),
    Composite(Variable),
    Tuple(Vec<Evaluated>),
}

impl Evaluated {
    pub fn interval(iv: Interval) -> Self {
        Evaluated::Value(AbstractValue::Interval(iv))
    }

    pub fn unknown() -> Self {
        Evaluated::Value(AbstractValue::Symbol(AbstractValue::ANY.to_string()))
    }

    pub fn as_interval(&self) -> Option<&Interval> {
        match self {
            Evaluated::Value(AbstractValue::Interval(iv)) => Some(iv),
            _ => None,
        }
    }

    pub fn join(&self, other: &Evaluated) -> Evaluated {
        match (self, other) {
            (Evaluated::Value(a), Evaluated::Value(b)) => Evaluated::Value(a.join(b)),
            (Evaluated::Composite(a), Evaluated::Composite(b)) => {
                Evaluated::Composite(a.join(b))
            }
            (Evaluated::Tuple(a), Evaluated::Tuple(b)) if a.len() == b.len() => {
                Evaluated::Tuple(a.iter().zip(b).map(|(x, y)| x.join(y)).collect())
            }
            _ => Evaluated::unknown(),
        }
    }
}

/// Two operand kinds reconciled for arithmetic: widest bit count wins,
/// signedness is contagious.
fn unify_kinds(a: IntervalKind, b: IntervalKind) -> IntervalKind {
    if a == b {
        return a;
    }
    let bits = a.bits().max(b.bits());
    if a.is_signed() || b.is_signed() {
        IntervalKind::Int { bits }
    } else {
        IntervalKind::Uint { bits }
    }
}

/// Variable (cloned) the lvalue-shaped expression resolves to, if it
/// names one. Mapping entries absent from the environment read as the
/// value type's default.
pub fn resolve_var(c: &ContractCfg, env: &Env, expr: &Expression) -> Result<Option<Variable>> {
    match expr {
        Expression::Ident(name) => Ok(env.get(name).cloned()),
        Expression::Member { base, member } => {
            if let Expression::Ident(root) = base.as_ref() {
                // Transaction globals are stored under their dotted path.
                let dotted = format!("{}.{}", root, member);
                if let Some(v) = env.get(&dotted) {
                    return Ok(Some(v.clone()));
                }
            }
            let base_var = match resolve_var(c, env, base)? {
                Some(v) => v,
                None => return Ok(None),
            };
            match &base_var.data {
                VarData::Struct { members } => Ok(members.get(member).cloned()),
                _ => Ok(None),
            }
        }
        Expression::Index { base, index } => {
            let base_var = match resolve_var(c, env, base)? {
                Some(v) => v,
                None => return Ok(None),
            };
            match &base_var.data {
                VarData::Array { elems, .. } => {
                    let idx = eval(c, env, index)?;
                    match idx.as_interval().and_then(Interval::as_singleton) {
                        Some(i) => {
                            let i: u64 = match u64::try_from(i) {
                                Ok(i) => i,
                                Err(_) => return Ok(None),
                            };
                            match elems.get(i as usize) {
                                Some(e) => Ok(Some(e.clone())),
                                None => Ok(None),
                            }
                        }
                        // Unknown index: the read sees any element.
                        None => Ok(elems
                            .iter()
                            .cloned()
                            .reduce(|a, b| a.join(&b))),
                    }
                }
                VarData::Mapping { value, entries, .. } => {
                    let key = mapping_key_repr(c, env, index)?;
                    match entries.get(&key) {
                        Some(v) => Ok(Some(v.clone())),
                        None => {
                            Ok(Some(Variable::default_of("[?]", base_var.scope, value.clone(), &c.defs)?))
                        }
                    }
                }
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Canonical ledger/storage key for a mapping index expression.
pub fn mapping_key_repr(c: &ContractCfg, env: &Env, key: &Expression) -> Result<String> {
    let v = eval(c, env, key)?;
    Ok(match v {
        Evaluated::Value(AbstractValue::Interval(iv)) => match iv.as_singleton() {
            Some(n) => n.to_string(),
            None => iv.to_string(),
        },
        Evaluated::Value(AbstractValue::Symbol(s)) => s,
        _ => "<composite>".to_string(),
    })
}

/// Evaluates `expr` against `env` without mutating anything.
pub fn eval(c: &ContractCfg, env: &Env, expr: &Expression) -> Result<Evaluated> {
    match expr {
        Expression::Number(v) => {
            let kind = if v.sign() == num_bigint::Sign::Minus {
                IntervalKind::INT256
            } else {
                IntervalKind::UINT256
            };
            Ok(Evaluated::interval(Interval::singleton(kind, v.clone())))
        }
        Expression::BoolLit(b) => Ok(Evaluated::interval(if *b {
            Interval::bool_true()
        } else {
            Interval::bool_false()
        })),
        Expression::StringLit(s) => Ok(Evaluated::Value(AbstractValue::Symbol(s.clone()))),
        Expression::HexLit(h) => {
            let digits = h.trim_start_matches("0x");
            match BigInt::from_str_radix(digits, 16) {
                Ok(v) => {
                    // 20-byte literals are address constants.
                    let kind = if digits.len() == 40 {
                        IntervalKind::ADDRESS
                    } else {
                        IntervalKind::UINT256
                    };
                    Ok(Evaluated::interval(Interval::singleton(kind, v)))
                }
                Err(_) => Ok(Evaluated::Value(AbstractValue::Symbol(h.clone()))),
            }
        }
        Expression::Ident(name) => match env.get(name) {
            Some(var) => Ok(evaluate_variable(var)),
            None => Err(AnalysisError::UnknownVariable(name.clone())),
        },
        Expression::Binary { op, left, right } => eval_binary(c, env, *op, left, right),
        Expression::Unary { op, operand, prefix } => {
            let v = eval(c, env, operand)?;
            Ok(match op {
                UnOp::Not => {
                    let b = v
                        .as_interval()
                        .map(coerce_to_bool)
                        .unwrap_or_else(Interval::bool_unknown);
                    Evaluated::interval(b.logical_not())
                }
                UnOp::Neg => match v.as_interval() {
                    Some(iv) => Evaluated::interval(iv.with_kind(IntervalKind::INT256).neg()),
                    None => Evaluated::unknown(),
                },
                UnOp::BitNot => match v.as_interval() {
                    Some(iv) => Evaluated::interval(Interval::top(iv.kind)),
                    None => Evaluated::unknown(),
                },
                UnOp::Inc | UnOp::Dec => match v.as_interval() {
                    Some(iv) => {
                        let one = Interval::singleton(iv.kind, 1);
                        let moved =
                            if *op == UnOp::Inc { iv.add(&one) } else { iv.sub(&one) };
                        // Prefix yields the moved value, postfix the old.
                        Evaluated::interval(if *prefix { moved } else { iv.clone() })
                    }
                    None => Evaluated::unknown(),
                },
                UnOp::Delete => Evaluated::unknown(),
            })
        }
        Expression::Index { .. } | Expression::Member { .. } => eval_access(c, env, expr),
        Expression::Call { .. } => {
            // Calls in expression position are opaque to the pure
            // evaluator; the engine interprets statement-level calls.
            Ok(Evaluated::unknown())
        }
        Expression::Conditional { cond, then_val, else_val } => {
            let cv = eval(c, env, cond)?;
            let b = cv
                .as_interval()
                .map(coerce_to_bool)
                .unwrap_or_else(Interval::bool_unknown);
            if b.is_definitely_true() {
                eval(c, env, then_val)
            } else if b.is_definitely_false() {
                eval(c, env, else_val)
            } else {
                let t = eval(c, env, then_val)?;
                let e = eval(c, env, else_val)?;
                Ok(t.join(&e))
            }
        }
        Expression::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(c, env, item)?);
            }
            Ok(Evaluated::Tuple(out))
        }
        Expression::TypeRef(_) => Ok(Evaluated::unknown()),
        Expression::Cast { ty, expr } => {
            let v = eval(c, env, expr)?;
            match (interval_kind_of(ty), v) {
                (Some(kind), Evaluated::Value(AbstractValue::Interval(iv))) => {
                    Ok(Evaluated::interval(iv.with_kind(kind)))
                }
                (_, other) => Ok(other),
            }
        }
    }
}

fn evaluate_variable(var: &Variable) -> Evaluated {
    match &var.data {
        VarData::Leaf(v) => Evaluated::Value(v.clone()),
        VarData::Enum { ordinal, .. } => Evaluated::interval(ordinal.clone()),
        _ => Evaluated::Composite(var.clone()),
    }
}

fn eval_access(c: &ContractCfg, env: &Env, expr: &Expression) -> Result<Evaluated> {
    if let Expression::Member { base, member } = expr {
        // `type(T).max` / `type(T).min`
        if let Expression::TypeRef(ty) = base.as_ref() {
            if let Some(kind) = interval_kind_of(ty) {
                let v = match member.as_str() {
                    "max" => Some(kind.max_value()),
                    "min" => Some(kind.min_value()),
                    _ => None,
                };
                if let Some(v) = v {
                    return Ok(Evaluated::interval(Interval::singleton(kind, v)));
                }
            }
            return Ok(Evaluated::unknown());
        }
        // `Phase.Open`: enum variant constant.
        if let Expression::Ident(root) = base.as_ref() {
            if !env.contains(root) {
                if let Some(def) = c.defs.enums.get(root) {
                    let ord = def
                        .variants
                        .iter()
                        .position(|v| v == member)
                        .ok_or_else(|| AnalysisError::UnknownMember {
                            base: root.clone(),
                            member: member.clone(),
                        })?;
                    return Ok(Evaluated::interval(Interval::singleton(
                        IntervalKind::Uint { bits: 8 },
                        ord as u32,
                    )));
                }
            }
        }
        // `a.length`
        if member == "length" {
            if let Some(var) = resolve_var(c, env, base)? {
                if let VarData::Array { elems, .. } = &var.data {
                    return Ok(Evaluated::interval(Interval::singleton(
                        IntervalKind::UINT256,
                        elems.len() as u64,
                    )));
                }
            }
            return Ok(Evaluated::interval(Interval::top(IntervalKind::UINT256)));
        }
    }
    match resolve_var(c, env, expr)? {
        Some(var) => Ok(evaluate_variable(&var)),
        None => Ok(Evaluated::unknown()),
    }
}

fn eval_binary(
    c: &ContractCfg,
    env: &Env,
    op: BinOp,
    left: &Expression,
    right: &Expression,
) -> Result<Evaluated> {
    let lv = eval(c, env, left)?;
    let rv = eval(c, env, right)?;
    Ok(apply_binary(op, &lv, &rv))
}

/// Binary operator over already-evaluated operands; used directly for
/// compound assignments.
pub fn apply_binary(op: BinOp, lv: &Evaluated, rv: &Evaluated) -> Evaluated {
    if op.is_logical() {
        let a = lv
            .as_interval()
            .map(coerce_to_bool)
            .unwrap_or_else(Interval::bool_unknown);
        let b = rv
            .as_interval()
            .map(coerce_to_bool)
            .unwrap_or_else(Interval::bool_unknown);
        let out = match op {
            BinOp::And => a.logical_and(&b),
            _ => a.logical_or(&b),
        };
        return Evaluated::interval(out);
    }

    if op.is_comparison() {
        return Evaluated::interval(eval_comparison(op, lv, rv));
    }

    // Arithmetic over unified kinds; non-interval operands lose all
    // precision but keep the computation total.
    let (a, b) = match (lv.as_interval(), rv.as_interval()) {
        (Some(a), Some(b)) => {
            let kind = unify_kinds(a.kind, b.kind);
            (a.with_kind(kind), b.with_kind(kind))
        }
        _ => return Evaluated::interval(Interval::top(IntervalKind::UINT256)),
    };
    let out = match op {
        BinOp::Add => a.add(&b),
        BinOp::Sub => a.sub(&b),
        BinOp::Mul => a.mul(&b),
        BinOp::Div => a.div(&b),
        BinOp::Rem => a.rem(&b),
        BinOp::Pow => a.pow(&b),
        BinOp::Shl => a.shl(&b),
        BinOp::Shr => a.shr(&b),
        BinOp::BitAnd => a.bitand(&b),
        BinOp::BitOr => a.bitor(&b),
        BinOp::BitXor => a.bitxor(&b),
        _ => Interval::top(a.kind),
    };
    Evaluated::interval(out)
}

/// Comparison over evaluated operands, including symbolic identities:
/// the same symbol compares equal to itself, distinct symbols may or
/// may not alias.
pub fn eval_comparison(op: BinOp, lv: &Evaluated, rv: &Evaluated) -> Interval {
    if let (Evaluated::Value(AbstractValue::Symbol(a)), Evaluated::Value(AbstractValue::Symbol(b))) =
        (lv, rv)
    {
        return match op {
            BinOp::Eq if a == b => Interval::bool_true(),
            BinOp::Ne if a == b => Interval::bool_false(),
            _ => Interval::bool_unknown(),
        };
    }
    let (a, b) = match (lv.as_interval(), rv.as_interval()) {
        (Some(a), Some(b)) => {
            let kind = unify_kinds(a.kind, b.kind);
            (a.with_kind(kind), b.with_kind(kind))
        }
        _ => return Interval::bool_unknown(),
    };
    match op {
        BinOp::Lt => a.cmp_lt(&b),
        BinOp::Le => a.cmp_le(&b),
        BinOp::Gt => a.cmp_gt(&b),
        BinOp::Ge => a.cmp_ge(&b),
        BinOp::Eq => a.cmp_eq(&b),
        BinOp::Ne => a.cmp_ne(&b),
        _ => Interval::bool_unknown(),
    }
}

/// Bool view of a numeric interval: `[0,0]` is false, any interval
/// excluding zero is true, anything else is unknown.
pub fn coerce_to_bool(iv: &Interval) -> Interval {
    if iv.kind == IntervalKind::Bool {
        return iv.clone();
    }
    if iv.is_bottom() {
        return Interval::bool_unknown();
    }
    if let Some(v) = iv.as_singleton() {
        return if v == BigInt::from(0) {
            Interval::bool_false()
        } else {
            Interval::bool_true()
        };
    }
    if !iv.may_be_zero() {
        Interval::bool_true()
    } else {
        Interval::bool_unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Scope, TypeDefs};
    use crate::ir::Expression as E;

    fn setup() -> (ContractCfg, Env) {
        let c = ContractCfg::new("C");
        let mut env = Env::new();
        let mut x =
            Variable::default_of("x", Scope::Local, SolType::Uint(8), &TypeDefs::default())
                .unwrap();
        x.set_interval(Interval::of_bigints(
            IntervalKind::Uint { bits: 8 },
            2.into(),
            5.into(),
        ));
        env.insert(x);
        env.overlay(&c.globals);
        (c, env)
    }

    #[test]
    fn test_literal_kinds() {
        let (c, env) = setup();
        let v = eval(&c, &env, &E::num(7)).unwrap();
        assert_eq!(v.as_interval().unwrap().kind, IntervalKind::UINT256);
        let v = eval(&c, &env, &E::big((-7).into())).unwrap();
        assert_eq!(v.as_interval().unwrap().kind, IntervalKind::INT256);
    }

    #[test]
    fn test_hex_address_literal() {
        let (c, env) = setup();
        let addr = format!("0x{}", "ab".repeat(20));
        let v = eval(&c, &env, &E::HexLit(addr)).unwrap();
        assert_eq!(v.as_interval().unwrap().kind, IntervalKind::ADDRESS);
    }

    #[test]
    fn test_arithmetic_unifies_literal_kind() {
        let (c, env) = setup();
        // x: uint8 in [2,5]; x + 1 stays uint-kinded and exact.
        let e = E::binary(BinOp::Add, E::ident("x"), E::num(1));
        let v = eval(&c, &env, &e).unwrap();
        let iv = v.as_interval().unwrap();
        assert_eq!(iv.finite_bounds().unwrap(), (3.into(), 6.into()));
    }

    #[test]
    fn test_comparison_and_logic() {
        let (c, env) = setup();
        let lt = E::binary(BinOp::Lt, E::ident("x"), E::num(10));
        assert!(eval(&c, &env, &lt).unwrap().as_interval().unwrap().is_definitely_true());
        let and = E::binary(
            BinOp::And,
            E::binary(BinOp::Lt, E::ident("x"), E::num(10)),
            E::binary(BinOp::Gt, E::ident("x"), E::num(3)),
        );
        assert_eq!(
            eval(&c, &env, &and).unwrap().as_interval().unwrap(),
            &Interval::bool_unknown()
        );
    }

    #[test]
    fn test_symbol_equality() {
        let (c, env) = setup();
        let same = E::binary(
            BinOp::Eq,
            E::member(E::ident("msg"), "sender"),
            E::member(E::ident("msg"), "sender"),
        );
        assert!(eval(&c, &env, &same).unwrap().as_interval().unwrap().is_definitely_true());
        let diff = E::binary(
            BinOp::Eq,
            E::member(E::ident("msg"), "sender"),
            E::member(E::ident("tx"), "origin"),
        );
        assert_eq!(
            eval(&c, &env, &diff).unwrap().as_interval().unwrap(),
            &Interval::bool_unknown()
        );
    }

    #[test]
    fn test_type_max() {
        let (c, env) = setup();
        let e = E::member(E::TypeRef(SolType::Uint(8)), "max");
        let v = eval(&c, &env, &e).unwrap();
        assert_eq!(v.as_interval().unwrap().as_singleton(), Some(255.into()));
    }

    #[test]
    fn test_conditional_joins_when_unknown() {
        let (c, env) = setup();
        let e = E::Conditional {
            cond: Box::new(E::binary(BinOp::Lt, E::ident("x"), E::num(4))),
            then_val: Box::new(E::num(1)),
            else_val: Box::new(E::num(10)),
        };
        let v = eval(&c, &env, &e).unwrap();
        assert_eq!(
            v.as_interval().unwrap().finite_bounds().unwrap(),
            (1.into(), 10.into())
        );
    }

    #[test]
    fn test_unknown_identifier_errors() {
        let (c, env) = setup();
        assert!(eval(&c, &env, &E::ident("ghost")).is_err());
    }

    #[test]
    fn test_coerce_to_bool() {
        let k = IntervalKind::Uint { bits: 8 };
        assert!(coerce_to_bool(&Interval::singleton(k, 0)).is_definitely_false());
        assert!(coerce_to_bool(&Interval::of_bigints(k, 3.into(), 9.into())).is_definitely_true());
        assert_eq!(
            coerce_to_bool(&Interval::of_bigints(k, 0.into(), 9.into())),
            Interval::bool_unknown()
        );
    }
}
