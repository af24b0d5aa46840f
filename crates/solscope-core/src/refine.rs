//! Condition-driven branch narrowing.
//!
//! Entering a branch tells the analysis something about the variables
//! the condition mentions; `narrow_branch` pushes that knowledge back
//! into the environment. Everything here is conservative: expressions
//! the analysis cannot decompose simply refine nothing.

use tracing::trace;

use crate::cfg::ContractCfg;
use crate::domain::{AbstractValue, Interval, IntervalKind};
use crate::engine::eval::{self, coerce_to_bool, Evaluated};
use crate::engine::lvalue;
use crate::error::Result;
use crate::ir::{BinOp, Expression, UnOp};
use crate::Env;

/// Narrows `env` under the assumption that `cond` evaluates to
/// `assume_true`.
pub fn narrow_branch(
    c: &ContractCfg,
    env: &mut Env,
    cond: &Expression,
    assume_true: bool,
) -> Result<()> {
    match cond {
        Expression::Unary { op: UnOp::Not, operand, .. } => {
            narrow_branch(c, env, operand, !assume_true)
        }
        Expression::Binary { op, left, right } if op.is_logical() => {
            narrow_logical(c, env, *op, left, right, assume_true)
        }
        Expression::Binary { op, left, right } if op.is_comparison() => {
            narrow_comparison(c, env, *op, left, right, assume_true)
        }
        // A bare boolean lvalue pins its value on each branch.
        Expression::Ident(_) | Expression::Member { .. } | Expression::Index { .. } => {
            narrow_bool_operand(c, env, cond, assume_true)
        }
        _ => Ok(()),
    }
}

/// Clone-and-narrow convenience for edge contributions.
pub fn refined_env(
    c: &ContractCfg,
    env: &Env,
    cond: &Expression,
    assume_true: bool,
) -> Result<Env> {
    let mut out = env.clone();
    narrow_branch(c, &mut out, cond, assume_true)?;
    Ok(out)
}

/// Can the condition still evaluate to `assume_true` under `env`?
/// Conditions the evaluator cannot reduce to a bool are conservatively
/// feasible.
pub fn branch_feasible(
    c: &ContractCfg,
    env: &Env,
    cond: &Expression,
    assume_true: bool,
) -> Result<bool> {
    let v = eval::eval(c, env, cond)?;
    let b = match v.as_interval() {
        Some(iv) => coerce_to_bool(iv),
        None => return Ok(true),
    };
    Ok(if assume_true {
        !b.is_definitely_false()
    } else {
        !b.is_definitely_true()
    })
}

fn narrow_logical(
    c: &ContractCfg,
    env: &mut Env,
    op: BinOp,
    left: &Expression,
    right: &Expression,
    assume_true: bool,
) -> Result<()> {
    let conjunctive = match op {
        // `a && b` true, and `a || b` false, constrain both operands.
        BinOp::And => assume_true,
        _ => !assume_true,
    };
    if conjunctive {
        narrow_branch(c, env, left, assume_true)?;
        narrow_branch(c, env, right, assume_true)?;
        Ok(())
    } else {
        // Only one operand needs to hold; the refinement is the join of
        // the single-operand cases.
        let a = refined_env(c, env, left, assume_true)?;
        let b = refined_env(c, env, right, assume_true)?;
        *env = a.joined(&b);
        Ok(())
    }
}

fn narrow_bool_operand(
    c: &ContractCfg,
    env: &mut Env,
    expr: &Expression,
    assume_true: bool,
) -> Result<()> {
    if c.is_read_only_expr(expr) {
        return Ok(());
    }
    let current = match eval::eval(c, env, expr)?.as_interval() {
        Some(iv) if iv.kind == IntervalKind::Bool => iv.clone(),
        _ => return Ok(()),
    };
    let forced = if assume_true { Interval::bool_true() } else { Interval::bool_false() };
    let refined = current.meet(&forced);
    write_refinement(c, env, expr, refined)
}

fn narrow_comparison(
    c: &ContractCfg,
    env: &mut Env,
    op: BinOp,
    left: &Expression,
    right: &Expression,
    assume_true: bool,
) -> Result<()> {
    let effective = if assume_true { op } else { negate_comparison(op) };
    let lv = eval::eval(c, env, left)?;
    let rv = eval::eval(c, env, right)?;

    // Boolean equality specializes: `flag == false` narrows like `!flag`.
    if let Some(()) = try_bool_comparison(c, env, effective, left, &lv, right, &rv)? {
        return Ok(());
    }

    let (a, b) = match (lv.as_interval(), rv.as_interval()) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => return Ok(()),
    };
    let (ra, rb) = match effective {
        BinOp::Lt => a.refine_lt(&b),
        BinOp::Le => a.refine_le(&b),
        BinOp::Gt => a.refine_gt(&b),
        BinOp::Ge => a.refine_ge(&b),
        BinOp::Eq => a.refine_eq(&b),
        BinOp::Ne => a.refine_ne(&b),
        _ => return Ok(()),
    };
    trace!(?effective, left = %ra, right = %rb, "comparison refinement");
    write_refinement(c, env, left, ra)?;
    write_refinement(c, env, right, rb)?;
    Ok(())
}

/// Handles `==`/`!=` where a side is boolean. Returns `Some(())` when
/// the comparison was consumed here.
fn try_bool_comparison(
    c: &ContractCfg,
    env: &mut Env,
    op: BinOp,
    left: &Expression,
    lv: &Evaluated,
    right: &Expression,
    rv: &Evaluated,
) -> Result<Option<()>> {
    if !matches!(op, BinOp::Eq | BinOp::Ne) {
        return Ok(None);
    }
    let is_bool = |v: &Evaluated| {
        v.as_interval().map(|iv| iv.kind == IntervalKind::Bool).unwrap_or(false)
    };
    if !is_bool(lv) && !is_bool(rv) {
        return Ok(None);
    }
    let want_equal = op == BinOp::Eq;
    // When one side is a known constant, the other side is forced.
    if let Some(rb) = rv.as_interval().and_then(Interval::as_singleton) {
        let truth = rb == 1.into();
        let forced = truth == want_equal;
        narrow_bool_operand(c, env, left, forced)?;
        return Ok(Some(()));
    }
    if let Some(lb) = lv.as_interval().and_then(Interval::as_singleton) {
        let truth = lb == 1.into();
        let forced = truth == want_equal;
        narrow_bool_operand(c, env, right, forced)?;
        return Ok(Some(()));
    }
    Ok(Some(()))
}

fn write_refinement(
    c: &ContractCfg,
    env: &mut Env,
    expr: &Expression,
    refined: Interval,
) -> Result<()> {
    if c.is_read_only_expr(expr) {
        return Ok(());
    }
    if !matches!(
        expr,
        Expression::Ident(_) | Expression::Member { .. } | Expression::Index { .. }
    ) {
        return Ok(());
    }
    lvalue::assign_value(
        c,
        env,
        expr,
        &Evaluated::Value(AbstractValue::Interval(refined)),
    )
}

fn negate_comparison(op: BinOp) -> BinOp {
    match op {
        BinOp::Lt => BinOp::Ge,
        BinOp::Le => BinOp::Gt,
        BinOp::Gt => BinOp::Le,
        BinOp::Ge => BinOp::Lt,
        BinOp::Eq => BinOp::Ne,
        BinOp::Ne => BinOp::Eq,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Scope, Variable};
    use crate::ir::{Expression as E, SolType};

    fn setup(vals: &[(&str, i64, i64)]) -> (ContractCfg, Env) {
        let c = ContractCfg::new("C");
        let mut env = Env::new();
        for (name, lo, hi) in vals {
            let mut v =
                Variable::default_of(*name, Scope::Local, SolType::Uint(8), &c.defs).unwrap();
            v.set_interval(Interval::of_bigints(
                IntervalKind::Uint { bits: 8 },
                (*lo).into(),
                (*hi).into(),
            ));
            env.insert(v);
        }
        env.overlay(&c.globals);
        (c, env)
    }

    fn range_of(env: &Env, name: &str) -> (i64, i64) {
        let (lo, hi) = env
            .get(name)
            .unwrap()
            .as_interval()
            .unwrap()
            .finite_bounds()
            .unwrap();
        (i64::try_from(lo).unwrap(), i64::try_from(hi).unwrap())
    }

    #[test]
    fn test_lt_true_branch() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Lt, E::ident("x"), E::num(10)), true)
            .unwrap();
        assert_eq!(range_of(&env, "x"), (0, 9));
    }

    #[test]
    fn test_lt_false_branch() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Lt, E::ident("x"), E::num(10)), false)
            .unwrap();
        assert_eq!(range_of(&env, "x"), (10, 100));
    }

    #[test]
    fn test_le_and_ge() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Le, E::ident("x"), E::num(10)), true)
            .unwrap();
        assert_eq!(range_of(&env, "x"), (0, 10));
        let (c2, mut env2) = setup(&[("y", 0, 100)]);
        narrow_branch(&c2, &mut env2, &E::binary(BinOp::Ge, E::ident("y"), E::num(40)), true)
            .unwrap();
        assert_eq!(range_of(&env2, "y"), (40, 100));
    }

    #[test]
    fn test_eq_meets_both_sides() {
        let (c, mut env) = setup(&[("x", 0, 10), ("y", 5, 20)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Eq, E::ident("x"), E::ident("y")), true)
            .unwrap();
        assert_eq!(range_of(&env, "x"), (5, 10));
        assert_eq!(range_of(&env, "y"), (5, 10));
    }

    #[test]
    fn test_ne_on_equal_singletons_is_bottom() {
        let (c, mut env) = setup(&[("x", 0, 0)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Ne, E::ident("x"), E::num(0)), true)
            .unwrap();
        assert!(env.get("x").unwrap().as_interval().unwrap().is_bottom());
    }

    #[test]
    fn test_negation_flips() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        let cond = E::not(E::binary(BinOp::Lt, E::ident("x"), E::num(10)));
        narrow_branch(&c, &mut env, &cond, true).unwrap();
        assert_eq!(range_of(&env, "x"), (10, 100));
    }

    #[test]
    fn test_and_true_narrows_both() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        let cond = E::binary(
            BinOp::And,
            E::binary(BinOp::Ge, E::ident("x"), E::num(10)),
            E::binary(BinOp::Le, E::ident("x"), E::num(20)),
        );
        narrow_branch(&c, &mut env, &cond, true).unwrap();
        assert_eq!(range_of(&env, "x"), (10, 20));
    }

    #[test]
    fn test_and_false_joins_disjuncts() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        // !(x >= 10 && x <= 20) refines to (x < 10) ⊔ (x > 20) = [0,100].
        let cond = E::binary(
            BinOp::And,
            E::binary(BinOp::Ge, E::ident("x"), E::num(10)),
            E::binary(BinOp::Le, E::ident("x"), E::num(20)),
        );
        narrow_branch(&c, &mut env, &cond, false).unwrap();
        assert_eq!(range_of(&env, "x"), (0, 100));
    }

    #[test]
    fn test_or_false_narrows_both() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        let cond = E::binary(
            BinOp::Or,
            E::binary(BinOp::Lt, E::ident("x"), E::num(10)),
            E::binary(BinOp::Gt, E::ident("x"), E::num(90)),
        );
        narrow_branch(&c, &mut env, &cond, false).unwrap();
        assert_eq!(range_of(&env, "x"), (10, 90));
    }

    #[test]
    fn test_bare_bool_operand() {
        let c = ContractCfg::new("C");
        let mut env = Env::new();
        let mut flag =
            Variable::default_of("flag", Scope::Local, SolType::Bool, &c.defs).unwrap();
        flag.set_interval(Interval::bool_unknown());
        env.insert(flag);
        narrow_branch(&c, &mut env, &E::ident("flag"), true).unwrap();
        assert!(env.get("flag").unwrap().as_interval().unwrap().is_definitely_true());
    }

    #[test]
    fn test_bool_equality_with_constant() {
        let c = ContractCfg::new("C");
        let mut env = Env::new();
        let mut flag =
            Variable::default_of("flag", Scope::Local, SolType::Bool, &c.defs).unwrap();
        flag.set_interval(Interval::bool_unknown());
        env.insert(flag);
        let cond = E::binary(BinOp::Eq, E::ident("flag"), E::boolean(false));
        narrow_branch(&c, &mut env, &cond, true).unwrap();
        assert!(env.get("flag").unwrap().as_interval().unwrap().is_definitely_false());
    }

    #[test]
    fn test_lt_between_two_ranges() {
        // Range-vs-range `<`: the left keeps only values strictly below
        // the right's minimum.
        let (c, mut env) = setup(&[("a", 0, 100), ("b", 5, 10)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Lt, E::ident("a"), E::ident("b")), true)
            .unwrap();
        assert_eq!(range_of(&env, "a"), (0, 4));
        assert_eq!(range_of(&env, "b"), (5, 10));
    }

    #[test]
    fn test_gt_between_two_ranges() {
        let (c, mut env) = setup(&[("a", 0, 100), ("b", 5, 10)]);
        narrow_branch(&c, &mut env, &E::binary(BinOp::Gt, E::ident("a"), E::ident("b")), true)
            .unwrap();
        assert_eq!(range_of(&env, "a"), (11, 100));
        assert_eq!(range_of(&env, "b"), (5, 10));
    }

    #[test]
    fn test_literals_never_mutated() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        // `10 > x` clamps the left side first; the literal cannot exceed
        // the whole of x, so the contradiction lands on the literal and
        // x is left alone. Nothing literal-shaped enters the env.
        narrow_branch(&c, &mut env, &E::binary(BinOp::Gt, E::num(10), E::ident("x")), true)
            .unwrap();
        assert_eq!(range_of(&env, "x"), (0, 100));
        assert!(env.get("10").is_none());
    }

    #[test]
    fn test_globals_never_mutated() {
        let (c, mut env) = setup(&[("x", 0, 100)]);
        let cond = E::binary(
            BinOp::Lt,
            E::member(E::ident("block"), "timestamp"),
            E::num(1000),
        );
        narrow_branch(&c, &mut env, &cond, true).unwrap();
        assert!(env.get("block.timestamp").unwrap().as_interval().unwrap().is_top());
    }

    #[test]
    fn test_feasibility() {
        let (c, env) = setup(&[("x", 0, 0)]);
        let ne = E::binary(BinOp::Ne, E::ident("x"), E::num(0));
        assert!(!branch_feasible(&c, &env, &ne, true).unwrap());
        assert!(branch_feasible(&c, &env, &ne, false).unwrap());
        let (c2, env2) = setup(&[("y", 0, 5)]);
        let lt = E::binary(BinOp::Lt, E::ident("y"), E::num(10));
        assert!(branch_feasible(&c2, &env2, &lt, true).unwrap());
        assert!(!branch_feasible(&c2, &env2, &lt, false).unwrap());
    }
}
