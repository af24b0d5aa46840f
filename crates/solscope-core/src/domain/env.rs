//! Variable environments: the per-node analysis state.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::domain::variable::Variable;
use crate::error::{AnalysisError, Result};

/// Ordered map from variable name to abstract value. Insertion order is
/// preserved so joins and ledger output are deterministic; equality is
/// key-based and insensitive to order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Env {
    vars: IndexMap<String, Variable>,
}

impl Env {
    pub fn new() -> Self {
        Env::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Variable> {
        self.vars.get_mut(name)
    }

    pub fn require(&self, name: &str) -> Result<&Variable> {
        self.get(name).ok_or_else(|| AnalysisError::UnknownVariable(name.to_string()))
    }

    pub fn require_mut(&mut self, name: &str) -> Result<&mut Variable> {
        self.vars
            .get_mut(name)
            .ok_or_else(|| AnalysisError::UnknownVariable(name.to_string()))
    }

    pub fn insert(&mut self, var: Variable) {
        self.vars.insert(var.name.clone(), var);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variable)> {
        self.vars.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.vars.keys()
    }

    /// Overlays `other`'s bindings onto this environment, overwriting
    /// matching names. Used to seed callee entry state from the caller.
    pub fn overlay(&mut self, other: &Env) {
        for (_, v) in other.iter() {
            self.insert(v.clone());
        }
    }

    // --- keywise lattice ops; a name missing on one side keeps the
    // --- other side's binding.

    pub fn joined(&self, other: &Env) -> Env {
        self.combined(other, |a, b| a.join(b))
    }

    pub fn met(&self, other: &Env) -> Env {
        self.combined(other, |a, b| a.meet(b))
    }

    /// `self` is the previous iterate, `next` the new one.
    pub fn widened(&self, next: &Env) -> Env {
        self.combined(next, |a, b| a.widen(b))
    }

    pub fn narrowed(&self, other: &Env) -> Env {
        self.combined(other, |a, b| a.narrow(b))
    }

    fn combined(&self, other: &Env, f: impl Fn(&Variable, &Variable) -> Variable) -> Env {
        let mut out = Env::new();
        for (name, a) in &self.vars {
            match other.vars.get(name) {
                Some(b) => out.insert(f(a, b)),
                None => out.insert(a.clone()),
            }
        }
        for (name, b) in &other.vars {
            if !out.contains(name) {
                out.insert(b.clone());
            }
        }
        out
    }

    /// Drops every interval in the environment to bottom, in place.
    pub fn set_bottom(&mut self) {
        for v in self.vars.values_mut() {
            v.set_bottom();
        }
    }

    /// True when every interval leaf is bottom (the state of an
    /// infeasible path). Symbol leaves do not participate; environments
    /// with no interval leaves at all count as live.
    pub fn is_all_bottom(&self) -> bool {
        let (mut total, mut bottom) = (0usize, 0usize);
        for v in self.vars.values() {
            v.bottom_census(&mut total, &mut bottom);
        }
        total > 0 && bottom == total
    }

    /// Flattens all variables into `path -> rendered value` entries.
    pub fn flatten_into(&self, out: &mut BTreeMap<String, String>) {
        for (name, v) in &self.vars {
            v.flatten_into(name, out);
        }
    }

    pub fn flattened(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.flatten_into(&mut out);
        out
    }

    /// Flattened entries whose rendered value differs from `baseline`
    /// (or is absent there). This is the shape of loop-delta records.
    pub fn diff(&self, baseline: &Env) -> BTreeMap<String, String> {
        let before = baseline.flattened();
        let after = self.flattened();
        after
            .into_iter()
            .filter(|(k, v)| before.get(k) != Some(v))
            .collect()
    }
}

impl FromIterator<Variable> for Env {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        let mut env = Env::new();
        for v in iter {
            env.insert(v);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::interval::{Interval, IntervalKind};
    use crate::domain::variable::{Scope, TypeDefs};
    use crate::ir::SolType;

    fn u8v(name: &str, lo: i64, hi: i64) -> Variable {
        let mut v =
            Variable::default_of(name, Scope::Local, SolType::Uint(8), &TypeDefs::default())
                .unwrap();
        v.set_interval(Interval::of_bigints(
            IntervalKind::Uint { bits: 8 },
            lo.into(),
            hi.into(),
        ));
        v
    }

    #[test]
    fn test_join_is_keywise() {
        let a: Env = [u8v("x", 0, 5), u8v("y", 1, 1)].into_iter().collect();
        let b: Env = [u8v("x", 10, 12)].into_iter().collect();
        let j = a.joined(&b);
        assert_eq!(
            j.get("x").unwrap().as_interval().unwrap(),
            &Interval::of_bigints(IntervalKind::Uint { bits: 8 }, 0.into(), 12.into())
        );
        // `y` missing on one side keeps its binding.
        assert!(j.contains("y"));
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let a: Env = [u8v("x", 0, 5), u8v("y", 1, 1)].into_iter().collect();
        let b: Env = [u8v("y", 1, 1), u8v("x", 0, 5)].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overlay_overwrites() {
        let mut a: Env = [u8v("x", 0, 5)].into_iter().collect();
        let b: Env = [u8v("x", 7, 7), u8v("z", 2, 3)].into_iter().collect();
        a.overlay(&b);
        assert_eq!(a.get("x").unwrap().as_interval().unwrap().as_singleton(), Some(7.into()));
        assert!(a.contains("z"));
    }

    #[test]
    fn test_set_bottom_and_detection() {
        let mut a: Env = [u8v("x", 0, 5), u8v("y", 1, 1)].into_iter().collect();
        assert!(!a.is_all_bottom());
        a.set_bottom();
        assert!(a.is_all_bottom());
    }

    #[test]
    fn test_diff_reports_changes_only() {
        let base: Env = [u8v("x", 0, 5), u8v("y", 1, 1)].into_iter().collect();
        let after: Env = [u8v("x", 0, 9), u8v("y", 1, 1)].into_iter().collect();
        let d = after.diff(&base);
        assert_eq!(d.len(), 1);
        assert_eq!(d.get("x").map(String::as_str), Some("[0,9]"));
    }

    #[test]
    fn test_snapshot_serializes_through_json() {
        let env: Env = [u8v("x", 0, 5), u8v("y", 1, 1)].into_iter().collect();
        let json = serde_json::to_string(&env).unwrap();
        let back: Env = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
        // Widened bounds survive too.
        let w = env.widened(&[u8v("x", 0, 6), u8v("y", 1, 1)].into_iter().collect());
        let back: Env = serde_json::from_str(&serde_json::to_string(&w).unwrap()).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_widen_then_narrow_roundtrip() {
        let prev: Env = [u8v("i", 0, 0)].into_iter().collect();
        let next: Env = [u8v("i", 0, 1)].into_iter().collect();
        let w = prev.widened(&next);
        let iv = w.get("i").unwrap().as_interval().unwrap();
        assert_eq!(iv.materialized().finite_bounds().unwrap().1, 255.into());
        let n = w.narrowed(&[u8v("i", 0, 10)].into_iter().collect());
        assert_eq!(
            n.get("i").unwrap().as_interval().unwrap(),
            &Interval::of_bigints(IntervalKind::Uint { bits: 8 }, 0.into(), 10.into())
        );
    }
}
