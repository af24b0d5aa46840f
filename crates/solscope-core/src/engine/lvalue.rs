//! Lvalue path resolution and abstract assignment.
//!
//! Index expressions are evaluated up front against the current
//! environment, then the write descends the variable tree. A concrete
//! path gets a strong update; an index the analysis cannot pin down
//! turns into a weak update (the new value joins every candidate slot).

use num_bigint::BigInt;

use crate::cfg::ContractCfg;
use crate::domain::{AbstractValue, Interval, TypeDefs, VarData, Variable};
use crate::engine::eval::{self, Evaluated};
use crate::error::{AnalysisError, Result};
use crate::ir::Expression;
use crate::Env;

#[derive(Debug, Clone)]
enum Step {
    Member(String),
    Index(IndexKey),
}

#[derive(Debug, Clone)]
enum IndexKey {
    Const(BigInt),
    Key(String),
    Unknown,
}

fn collect_steps(
    c: &ContractCfg,
    env: &Env,
    expr: &Expression,
    steps: &mut Vec<Step>,
) -> Result<String> {
    match expr {
        Expression::Ident(name) => Ok(name.clone()),
        Expression::Member { base, member } => {
            let root = collect_steps(c, env, base, steps)?;
            steps.push(Step::Member(member.clone()));
            Ok(root)
        }
        Expression::Index { base, index } => {
            let root = collect_steps(c, env, base, steps)?;
            let key = match eval::eval(c, env, index)? {
                Evaluated::Value(AbstractValue::Interval(iv)) => match iv.as_singleton() {
                    Some(v) => IndexKey::Const(v),
                    None => IndexKey::Unknown,
                },
                Evaluated::Value(AbstractValue::Symbol(s)) => IndexKey::Key(s),
                _ => IndexKey::Unknown,
            };
            steps.push(Step::Index(key));
            Ok(root)
        }
        _ => Err(AnalysisError::NotAssignable),
    }
}

/// Writes `value` to the location `lhs` names in `env`.
pub fn assign_value(
    c: &ContractCfg,
    env: &mut Env,
    lhs: &Expression,
    value: &Evaluated,
) -> Result<()> {
    let mut steps = Vec::new();
    let root = collect_steps(c, env, lhs, &mut steps)?;
    let defs = c.defs.clone();
    let var = env.require_mut(&root)?;
    if var.is_constant {
        return Err(AnalysisError::ConstantAssignment(root));
    }
    assign_into(var, &steps, value, false, &defs)
}

/// Applies `delete` to the location `lhs` names.
pub fn delete_value(c: &ContractCfg, env: &mut Env, lhs: &Expression) -> Result<()> {
    let mut steps = Vec::new();
    let root = collect_steps(c, env, lhs, &mut steps)?;
    let defs = c.defs.clone();
    let var = env.require_mut(&root)?;
    mutate_into(var, &steps, &defs, &mut |v, defs| v.reset_default(defs))
}

/// Resolves `lhs` to a single mutable slot; unknown indices are an
/// error here (used for `push`/`pop`, which need one concrete array).
pub fn target_mut<'a>(
    c: &ContractCfg,
    env: &'a mut Env,
    lhs: &Expression,
) -> Result<&'a mut Variable> {
    let mut steps = Vec::new();
    let root = collect_steps(c, env, lhs, &mut steps)?;
    let defs = c.defs.clone();
    let mut cur = env.require_mut(&root)?;
    for step in &steps {
        cur = match step {
            Step::Member(m) => cur.struct_member_mut(m)?,
            Step::Index(IndexKey::Const(i)) => descend_const(cur, i, &defs)?,
            Step::Index(IndexKey::Key(k)) => cur.mapping_entry_mut(k, &defs)?,
            Step::Index(IndexKey::Unknown) => {
                return Err(AnalysisError::NotIndexable(cur.name.clone()))
            }
        };
    }
    Ok(cur)
}

fn descend_const<'a>(
    var: &'a mut Variable,
    index: &BigInt,
    defs: &TypeDefs,
) -> Result<&'a mut Variable> {
    match &var.data {
        VarData::Array { .. } => {
            let idx = u64::try_from(index.clone())
                .map_err(|_| AnalysisError::NotIndexable(var.name.clone()))?;
            var.array_element_mut(idx, defs)
        }
        VarData::Mapping { .. } => var.mapping_entry_mut(&index.to_string(), defs),
        _ => Err(AnalysisError::NotIndexable(var.name.clone())),
    }
}

fn assign_into(
    var: &mut Variable,
    steps: &[Step],
    value: &Evaluated,
    weak: bool,
    defs: &TypeDefs,
) -> Result<()> {
    let Some(step) = steps.first() else {
        return write_leaf(var, value, weak);
    };
    match step {
        Step::Member(m) => assign_into(var.struct_member_mut(m)?, &steps[1..], value, weak, defs),
        Step::Index(IndexKey::Const(i)) => {
            assign_into(descend_const(var, i, defs)?, &steps[1..], value, weak, defs)
        }
        Step::Index(IndexKey::Key(k)) => {
            assign_into(var.mapping_entry_mut(k, defs)?, &steps[1..], value, weak, defs)
        }
        Step::Index(IndexKey::Unknown) => {
            // One of the slots changes, the rest keep their value; every
            // slot's new range is the join of both.
            match &mut var.data {
                VarData::Array { elems, .. } => {
                    for e in elems.iter_mut() {
                        assign_into(e, &steps[1..], value, true, defs)?;
                    }
                    Ok(())
                }
                VarData::Mapping { entries, .. } => {
                    for e in entries.values_mut() {
                        assign_into(e, &steps[1..], value, true, defs)?;
                    }
                    Ok(())
                }
                _ => Err(AnalysisError::NotIndexable(var.name.clone())),
            }
        }
    }
}

fn mutate_into(
    var: &mut Variable,
    steps: &[Step],
    defs: &TypeDefs,
    f: &mut dyn FnMut(&mut Variable, &TypeDefs) -> Result<()>,
) -> Result<()> {
    let Some(step) = steps.first() else {
        return f(var, defs);
    };
    match step {
        Step::Member(m) => mutate_into(var.struct_member_mut(m)?, &steps[1..], defs, f),
        Step::Index(IndexKey::Const(i)) => {
            mutate_into(descend_const(var, i, defs)?, &steps[1..], defs, f)
        }
        Step::Index(IndexKey::Key(k)) => {
            mutate_into(var.mapping_entry_mut(k, defs)?, &steps[1..], defs, f)
        }
        Step::Index(IndexKey::Unknown) => match &mut var.data {
            VarData::Array { elems, .. } => {
                for e in elems.iter_mut() {
                    mutate_into(e, &steps[1..], defs, f)?;
                }
                Ok(())
            }
            VarData::Mapping { entries, .. } => {
                for e in entries.values_mut() {
                    mutate_into(e, &steps[1..], defs, f)?;
                }
                Ok(())
            }
            _ => Err(AnalysisError::NotIndexable(var.name.clone())),
        },
    }
}

fn write_leaf(var: &mut Variable, value: &Evaluated, weak: bool) -> Result<()> {
    match value {
        Evaluated::Value(av) => {
            let adapted = adapt_value(var, av);
            let new_data = VarData::Leaf(adapted);
            if weak {
                let incoming = Variable { data: new_data, ..var.clone() };
                *var = var.join(&incoming);
            } else {
                match (&mut var.data, value) {
                    (
                        VarData::Enum { ordinal, .. },
                        Evaluated::Value(AbstractValue::Interval(iv)),
                    ) => {
                        *ordinal = iv.with_kind(ordinal.kind);
                    }
                    _ => var.data = new_data,
                }
            }
            Ok(())
        }
        Evaluated::Composite(v) => {
            if weak {
                *var = var.join(v);
            } else {
                var.data = v.data.clone();
            }
            Ok(())
        }
        Evaluated::Tuple(_) => Err(AnalysisError::NotAssignable),
    }
}

/// Re-kinds an interval value to the target's declared kind so a
/// `uint256` literal lands in a `uint8` slot clamped, not mis-kinded.
fn adapt_value(var: &Variable, value: &AbstractValue) -> AbstractValue {
    match (var.as_interval(), value) {
        (Some(target), AbstractValue::Interval(iv)) => {
            AbstractValue::Interval(iv.with_kind(target.kind))
        }
        _ => value.clone(),
    }
}
