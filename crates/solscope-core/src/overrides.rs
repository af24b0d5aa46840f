//! Speculative value overrides with rollback.
//!
//! A debugging session can pin a variable to a chosen value, re-run the
//! interpretation, inspect the results and then restore the original
//! state. The undo log captures each overwritten slot once per batch so
//! repeated overrides of the same slot still roll back to the value the
//! batch started from.

use tracing::debug;

use crate::cfg::ContractCfg;
use crate::domain::{AbstractValue, Variable};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideTarget {
    /// A storage variable.
    State(String),
    /// A local (parameter, declared local or named return) of `function`.
    Local { function: String, var: String },
    /// A transaction global by dotted path, e.g. `msg.value`.
    Global(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub target: OverrideTarget,
    pub value: AbstractValue,
}

impl Override {
    pub fn state(var: impl Into<String>, value: AbstractValue) -> Self {
        Override { target: OverrideTarget::State(var.into()), value }
    }

    pub fn local(
        function: impl Into<String>,
        var: impl Into<String>,
        value: AbstractValue,
    ) -> Self {
        Override {
            target: OverrideTarget::Local { function: function.into(), var: var.into() },
            value,
        }
    }

    pub fn global(path: impl Into<String>, value: AbstractValue) -> Self {
        Override { target: OverrideTarget::Global(path.into()), value }
    }
}

/// Rollback journal for one batch of overrides.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<(OverrideTarget, Variable)>,
}

impl UndoLog {
    pub fn new() -> Self {
        UndoLog::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies `ov`, journaling the slot's prior value unless this batch
    /// already touched it.
    pub fn apply(&mut self, c: &mut ContractCfg, ov: &Override) -> Result<()> {
        let slot = slot_mut(c, &ov.target)?;
        if !self.entries.iter().any(|(t, _)| *t == ov.target) {
            self.entries.push((ov.target.clone(), slot.clone()));
        }
        match &ov.value {
            AbstractValue::Interval(iv) => {
                // Keep the slot's own kind so the override clamps like a
                // normal assignment would.
                let kind = slot.as_interval().map(|cur| cur.kind).unwrap_or(iv.kind);
                slot.set_interval(iv.with_kind(kind));
            }
            sym @ AbstractValue::Symbol(_) => {
                slot.data = crate::domain::VarData::Leaf(sym.clone());
            }
        }
        debug!(target = ?ov.target, "applied override");
        Ok(())
    }

    /// Restores every journaled slot, newest first.
    pub fn rollback(self, c: &mut ContractCfg) -> Result<()> {
        for (target, original) in self.entries.into_iter().rev() {
            *slot_mut(c, &target)? = original;
        }
        Ok(())
    }
}

fn slot_mut<'c>(c: &'c mut ContractCfg, target: &OverrideTarget) -> Result<&'c mut Variable> {
    match target {
        OverrideTarget::State(name) => c.state.require_mut(name),
        OverrideTarget::Global(path) => c.globals.require_mut(path),
        OverrideTarget::Local { function, var } => {
            c.function_mut(function)?.related.require_mut(var)
        }
    }
}
