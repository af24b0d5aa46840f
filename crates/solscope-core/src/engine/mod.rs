//! The abstract interpreter.
//!
//! `interpret_function` walks a function's CFG once, node by node, in
//! dependency order. Loops are evaluated by `fixpoint`: a widening pass
//! over the loop body, a bounded narrowing pass, then one recording
//! sweep that publishes the stabilized per-line ranges. Incremental
//! re-interpretation (`reinterpret_from`) starts from the nodes owning
//! the edited lines and propagates only while OUT environments change.

pub mod eval;
pub mod lvalue;

pub use eval::Evaluated;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;

use tracing::{debug, trace, warn};

use crate::cfg::{CondKind, ContractCfg, FnKind, FunctionCfg, NodeId, NodeKind};
use crate::domain::{estimate_trip_count, AbstractValue, Scope, VarData, Variable};
use crate::error::{AnalysisError, Result};
use crate::ir::{AssignOp, BinOp, Expression, SolType, Statement, UnOp};
use crate::ledger::{Ledger, Record, RecordKind};
use crate::refine;
use crate::Env;

/// Widening-pass visit budget per loop head.
pub const W_MAX: usize = 300;
/// Narrowing-pass iteration budget per loop head.
pub const N_MAX: usize = 30;
const MAX_CALL_DEPTH: usize = 12;

pub struct Engine<'c> {
    contract: &'c mut ContractCfg,
    pub ledger: Ledger,
    /// Off while a fixpoint iterates; results publish once stabilized.
    recording: bool,
    /// Lines already cleared (or written) during the current run.
    cleared: BTreeSet<u32>,
    depth: usize,
}

/// Per-invocation facts carried through statement execution.
struct FnCtx {
    returns: Vec<(Option<String>, SolType)>,
    decl_line: u32,
}

#[derive(Debug, Clone)]
struct LoopParts {
    body: BTreeSet<NodeId>,
    cond: NodeId,
    exit: NodeId,
}

impl<'c> Engine<'c> {
    pub fn new(contract: &'c mut ContractCfg) -> Self {
        Engine {
            contract,
            ledger: Ledger::new(),
            recording: true,
            cleared: BTreeSet::new(),
            depth: 0,
        }
    }

    pub fn contract(&self) -> &ContractCfg {
        self.contract
    }

    /// Mutable access for in-place edits between runs.
    pub fn contract_mut(&mut self) -> &mut ContractCfg {
        self.contract
    }

    /// Interprets `name` from scratch, rebuilding its ledger lines.
    /// Returns the joined abstract return value.
    pub fn interpret_function(&mut self, name: &str) -> Result<Evaluated> {
        self.cleared.clear();
        let (ret, _exit_env) = self.call_function(name, None, &[])?;
        Ok(ret)
    }

    /// Runs the contract's constructor (if it has one) and commits the
    /// storage it establishes, so later runs start from the deployed
    /// state.
    pub fn deploy(&mut self, args: &[Evaluated]) -> Result<()> {
        let name = match self
            .contract
            .functions
            .iter()
            .find(|(_, f)| f.kind == Some(FnKind::Constructor))
        {
            Some((n, _)) => n.clone(),
            None => return Ok(()),
        };
        self.cleared.clear();
        let (_, exit_env) = self.call_function(&name, None, args)?;
        let names: Vec<String> = self.contract.state.names().cloned().collect();
        for n in names {
            if let Some(v) = exit_env.get(&n) {
                self.contract.state.insert(v.clone());
            }
        }
        Ok(())
    }

    /// Re-runs interpretation starting from the statements owning
    /// `lines`, reusing every cached environment upstream of them.
    pub fn reinterpret_from(&mut self, function: &str, lines: &[u32]) -> Result<()> {
        self.cleared.clear();
        let slot = self
            .contract
            .functions
            .get_mut(function)
            .ok_or_else(|| AnalysisError::UnknownFunction(function.to_string()))?;
        if slot.name.is_empty() {
            return Err(AnalysisError::UnknownFunction(function.to_string()));
        }
        let mut f = mem::take(slot);
        let outcome = self.rerun_from(&mut f, lines);
        if let Some(slot) = self.contract.functions.get_mut(function) {
            *slot = f;
        }
        outcome
    }

    // --- call plumbing ---

    /// Takes the function out of the contract for the duration of its
    /// interpretation so nested calls can borrow the contract freely.
    fn call_function(
        &mut self,
        name: &str,
        caller_env: Option<&Env>,
        args: &[Evaluated],
    ) -> Result<(Evaluated, Env)> {
        let slot = self
            .contract
            .functions
            .get_mut(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_string()))?;
        if slot.name.is_empty() {
            // Already being interpreted further up the stack; treat the
            // recursive call as opaque.
            return Ok((
                Evaluated::unknown(),
                caller_env.cloned().unwrap_or_else(Env::new),
            ));
        }
        let mut f = mem::take(slot);
        let outcome = self.run_function(&mut f, caller_env, args);
        if let Some(slot) = self.contract.functions.get_mut(name) {
            *slot = f;
        }
        outcome
    }

    fn run_function(
        &mut self,
        f: &mut FunctionCfg,
        caller_env: Option<&Env>,
        args: &[Evaluated],
    ) -> Result<(Evaluated, Env)> {
        debug!(function = %f.name, "interpreting");
        f.reset_analysis_state();
        let ctx = FnCtx { returns: f.returns.clone(), decl_line: f.decl_line };

        let mut entry = f.related.clone();
        // Storage and globals may have moved since the function was
        // declared (edits, overrides); locals keep their seeded shape.
        entry.overlay(&self.contract.state);
        entry.overlay(&self.contract.globals);
        if let Some(caller) = caller_env {
            let names: Vec<String> = entry.names().cloned().collect();
            for n in names {
                if let Some(v) = caller.get(&n) {
                    entry.insert(v.clone());
                }
            }
        }
        let params = f.params.clone();
        for ((pname, _), val) in params.iter().zip(args) {
            lvalue::assign_value(&*self.contract, &mut entry, &Expression::ident(pname), val)?;
        }
        f.node_mut(f.entry).out_env = entry;

        if self.recording {
            self.clear_function_lines(f);
        }

        let mut ret_acc: Option<Evaluated> = None;
        self.traverse(f, &ctx, &mut ret_acc)?;

        let exit_env = f.node(f.exit).out_env.clone();
        let ret = match ret_acc {
            Some(v) => v,
            None => {
                let v = self.named_return_value(&ctx, &exit_env);
                if self.recording {
                    let mut vars = BTreeMap::new();
                    for (n, _) in &ctx.returns {
                        if let Some(n) = n {
                            if let Some(var) = exit_env.get(n) {
                                var.flatten_into(n, &mut vars);
                            }
                        }
                    }
                    self.publish(ctx.decl_line, RecordKind::ImplicitReturn, vars);
                }
                v
            }
        };
        Ok((ret, exit_env))
    }

    /// Single forward pass over the whole CFG; loop heads hand off to
    /// `fixpoint` and the traversal resumes at their LoopExit.
    fn traverse(
        &mut self,
        f: &mut FunctionCfg,
        ctx: &FnCtx,
        ret_acc: &mut Option<Evaluated>,
    ) -> Result<()> {
        let reachable: BTreeSet<NodeId> = f.reachable_from(f.entry).into_iter().collect();
        let mut visited: BTreeSet<NodeId> = BTreeSet::new();
        visited.insert(f.entry);
        let mut requeued: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(f.single_succ(f.entry)?);

        while let Some(id) = queue.pop_front() {
            if visited.contains(&id) {
                continue;
            }
            let parts = if f.node(id).is_loop_join() {
                Some(loop_parts(f, id)?)
            } else {
                None
            };
            // Back-edge predecessors of a loop head are settled by its
            // own fixpoint; everything else must be computed first.
            let pending = f
                .preds(id)
                .iter()
                .filter(|p| reachable.contains(p))
                .filter(|p| parts.as_ref().map(|lp| !lp.body.contains(p)).unwrap_or(true))
                .any(|p| !visited.contains(p));
            if pending {
                let seen = requeued.entry(id).or_insert(0);
                *seen += 1;
                if *seen <= f.node_count() {
                    queue.push_back(id);
                    continue;
                }
                // Irregular graph; proceed with the predecessors we have.
            }

            if let Some(lp) = parts {
                let body = lp.body.clone();
                let init =
                    self.join_preds(f, id, &|p| visited.contains(&p) && !body.contains(&p), None)?;
                self.fixpoint(f, ctx, id, init, ret_acc)?;
                visited.extend(body.iter().copied());
                visited.insert(lp.exit);
                for (s, _) in f.succs(lp.exit).to_vec() {
                    queue.push_back(s);
                }
            } else {
                let in_env = self.join_preds(f, id, &|p| visited.contains(&p), None)?;
                let out = self.transfer(f, ctx, id, in_env, ret_acc)?;
                f.node_mut(id).out_env = out;
                visited.insert(id);
                for (s, _) in f.succs(id).to_vec() {
                    queue.push_back(s);
                }
            }
        }
        Ok(())
    }

    /// Joins contributions from the predecessors `keep` admits,
    /// optionally seeded with `extra`.
    fn join_preds(
        &mut self,
        f: &FunctionCfg,
        id: NodeId,
        keep: &dyn Fn(NodeId) -> bool,
        extra: Option<&Env>,
    ) -> Result<Env> {
        let mut acc: Option<Env> = extra.cloned();
        for p in f.preds(id).to_vec() {
            if !keep(p) || f.node(p).out_env.is_empty() {
                continue;
            }
            let contrib = self.edge_contribution(f, p, id)?;
            acc = Some(match acc {
                None => contrib,
                Some(a) => a.joined(&contrib),
            });
        }
        Ok(acc.unwrap_or_else(Env::new))
    }

    /// What `pred`'s OUT contributes along the edge into `node`:
    /// unconditional edges pass through, condition edges refine, and
    /// infeasible or reverting edges contribute fully-bottomed state.
    fn edge_contribution(&mut self, f: &FunctionCfg, pred: NodeId, node: NodeId) -> Result<Env> {
        let base = f.node(pred).out_env.clone();
        let (kind, expr) = match f.node(pred).condition() {
            Some((k, e)) => (k, e.clone()),
            None => return Ok(base),
        };
        let assume = match f.edge_label(pred, node).flatten() {
            Some(b) => b,
            None => return Ok(base),
        };
        if kind.is_guard() && !assume {
            let mut out = base;
            out.set_bottom();
            return Ok(out);
        }
        if base.is_all_bottom() {
            return Ok(base);
        }
        if !refine::branch_feasible(&*self.contract, &base, &expr, assume)? {
            trace!(cond = %pred, assume, "branch infeasible");
            let mut out = base;
            out.set_bottom();
            return Ok(out);
        }
        let refined = refine::refined_env(&*self.contract, &base, &expr, assume)?;
        if assume && self.recording {
            if let Some(line) = f.node(pred).line {
                let record_kind = match kind {
                    CondKind::Require => RecordKind::RequireTrue,
                    CondKind::Assert => RecordKind::AssertTrue,
                    _ => RecordKind::BranchTrue,
                };
                let vars = self.condition_vars(&refined, &expr);
                if !vars.is_empty() {
                    self.publish(line, record_kind, vars);
                }
            }
        }
        Ok(refined)
    }

    // --- statement interpretation ---

    fn transfer(
        &mut self,
        f: &FunctionCfg,
        ctx: &FnCtx,
        id: NodeId,
        in_env: Env,
        ret_acc: &mut Option<Evaluated>,
    ) -> Result<Env> {
        if in_env.is_empty() || in_env.is_all_bottom() {
            // Dead path: nothing executes, nothing is recorded.
            return Ok(in_env);
        }
        let stmts = f.node(id).stmts.clone();
        let mut env = in_env;
        for stmt in &stmts {
            if self.exec_stmt(ctx, &mut env, stmt, ret_acc)? {
                break;
            }
        }
        Ok(env)
    }

    /// Returns `true` when control leaves the node early (return,
    /// revert, break, continue).
    fn exec_stmt(
        &mut self,
        ctx: &FnCtx,
        env: &mut Env,
        stmt: &Statement,
        ret_acc: &mut Option<Evaluated>,
    ) -> Result<bool> {
        match stmt {
            Statement::VarDecl { ty, name, init, line } => {
                let var =
                    Variable::default_of(name.clone(), Scope::Local, ty.clone(), &self.contract.defs)?;
                env.insert(var);
                if let Some(init) = init {
                    let v = self.eval_rhs(env, init)?;
                    lvalue::assign_value(&*self.contract, env, &Expression::ident(name), &v)?;
                }
                if self.recording {
                    let mut vars = BTreeMap::new();
                    if let Some(v) = env.get(name) {
                        v.flatten_into(name, &mut vars);
                    }
                    self.publish(*line, RecordKind::Declaration, vars);
                }
                Ok(false)
            }
            Statement::Assign { lhs, op, rhs, line } => {
                let rhs_val = self.eval_rhs(env, rhs)?;
                let value = match compound_binop(*op) {
                    None => rhs_val,
                    Some(bop) => {
                        let cur = eval::eval(&*self.contract, env, lhs)?;
                        eval::apply_binary(bop, &cur, &rhs_val)
                    }
                };
                lvalue::assign_value(&*self.contract, env, lhs, &value)?;
                self.record_assignment(env, lhs, *line);
                Ok(false)
            }
            Statement::UnaryStmt { op, target, line } => {
                match op {
                    UnOp::Inc | UnOp::Dec => {
                        let bop = if *op == UnOp::Inc { BinOp::Add } else { BinOp::Sub };
                        let moved = eval::eval(
                            &*self.contract,
                            env,
                            &Expression::binary(bop, target.clone(), Expression::num(1)),
                        )?;
                        lvalue::assign_value(&*self.contract, env, target, &moved)?;
                    }
                    UnOp::Delete => lvalue::delete_value(&*self.contract, env, target)?,
                    // `!x;` / `-x;` as statements have no effect.
                    _ => {}
                }
                self.record_assignment(env, target, *line);
                Ok(false)
            }
            Statement::ExprStmt { expr, line } => {
                self.exec_expr_stmt(env, expr, *line)?;
                Ok(false)
            }
            Statement::Return { expr, line } => {
                let val = match expr {
                    Some(e) => self.eval_rhs(env, e)?,
                    None => self.named_return_value(ctx, env),
                };
                self.sync_named_returns(ctx, env, expr.is_some(), &val)?;
                if self.recording {
                    let mut vars = BTreeMap::new();
                    render_into("return", &val, &mut vars);
                    self.publish(*line, RecordKind::Return, vars);
                }
                *ret_acc = Some(match ret_acc.take() {
                    None => val,
                    Some(prev) => prev.join(&val),
                });
                Ok(true)
            }
            Statement::Revert { reason, line } => {
                if self.recording {
                    let mut vars = BTreeMap::new();
                    if let Some(r) = reason {
                        vars.insert("reason".to_string(), r.clone());
                    }
                    self.publish(*line, RecordKind::Revert, vars);
                }
                env.set_bottom();
                Ok(true)
            }
            // Control flow is already rewired in the graph.
            Statement::Break { .. } | Statement::Continue { .. } => Ok(true),
        }
    }

    fn exec_expr_stmt(&mut self, env: &mut Env, expr: &Expression, line: u32) -> Result<()> {
        if let Expression::Call { callee, args } = expr {
            match callee.as_ref() {
                Expression::Member { base, member } if member == "push" => {
                    let pushed = match args.first() {
                        Some(a) => Some(self.eval_rhs(env, a)?),
                        None => None,
                    };
                    let defs = self.contract.defs.clone();
                    let new_index;
                    {
                        let target = lvalue::target_mut(&*self.contract, env, base)?;
                        let elem_ty = match &target.ty {
                            SolType::Array { base: b, .. } => (**b).clone(),
                            _ => return Err(AnalysisError::NotIndexable(target.name.clone())),
                        };
                        let elem = Variable::default_of("[?]", Scope::Local, elem_ty, &defs)?;
                        target.push_element(elem)?;
                        new_index = match &target.data {
                            VarData::Array { elems, .. } => elems.len() as i64 - 1,
                            _ => 0,
                        };
                    }
                    if let Some(v) = pushed {
                        let slot = Expression::index((**base).clone(), Expression::num(new_index));
                        lvalue::assign_value(&*self.contract, env, &slot, &v)?;
                    }
                    self.record_assignment(env, base, line);
                    return Ok(());
                }
                Expression::Member { base, member } if member == "pop" => {
                    lvalue::target_mut(&*self.contract, env, base)?.pop_element()?;
                    self.record_assignment(env, base, line);
                    return Ok(());
                }
                Expression::Ident(fname) if self.contract.functions.contains_key(fname) => {
                    let fname = fname.clone();
                    let _ = self.interpret_call(env, &fname, args)?;
                    return Ok(());
                }
                _ => {}
            }
        }
        let _ = eval::eval(&*self.contract, env, expr)?;
        Ok(())
    }

    fn eval_rhs(&mut self, env: &mut Env, expr: &Expression) -> Result<Evaluated> {
        if let Expression::Call { callee, args } = expr {
            if let Expression::Ident(fname) = callee.as_ref() {
                if self.contract.functions.contains_key(fname) {
                    let fname = fname.clone();
                    return self.interpret_call(env, &fname, args);
                }
            }
        }
        eval::eval(&*self.contract, env, expr)
    }

    /// Internal call: interpret the callee with the caller's view of
    /// state and globals, then write its storage effects back.
    fn interpret_call(
        &mut self,
        env: &mut Env,
        fname: &str,
        args: &[Expression],
    ) -> Result<Evaluated> {
        if self.depth >= MAX_CALL_DEPTH {
            warn!(function = fname, "call depth cap reached");
            return Ok(Evaluated::unknown());
        }
        let mut arg_vals = Vec::with_capacity(args.len());
        for a in args {
            arg_vals.push(self.eval_rhs(env, a)?);
        }
        self.depth += 1;
        let outcome = self.call_function(fname, Some(env), &arg_vals);
        self.depth -= 1;
        let (ret, exit_env) = outcome?;
        // Locals stay with the callee; everything else writes back
        // whole-variable.
        let writeback: Vec<Variable> = exit_env
            .iter()
            .filter(|(_, v)| v.scope != Scope::Local)
            .map(|(_, v)| v.clone())
            .collect();
        for v in writeback {
            env.insert(v);
        }
        Ok(ret)
    }

    fn sync_named_returns(
        &mut self,
        ctx: &FnCtx,
        env: &mut Env,
        explicit: bool,
        val: &Evaluated,
    ) -> Result<()> {
        if !explicit {
            return Ok(());
        }
        let named: Vec<String> = ctx
            .returns
            .iter()
            .filter_map(|(n, _)| n.clone())
            .collect();
        match (named.len(), val) {
            (1, _) => {
                lvalue::assign_value(&*self.contract, env, &Expression::ident(&named[0]), val)?;
            }
            (n, Evaluated::Tuple(items)) if n == items.len() => {
                for (name, item) in named.iter().zip(items) {
                    lvalue::assign_value(&*self.contract, env, &Expression::ident(name), item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn named_return_value(&self, ctx: &FnCtx, env: &Env) -> Evaluated {
        let named: Vec<&String> = ctx.returns.iter().filter_map(|(n, _)| n.as_ref()).collect();
        let read = |n: &String| {
            eval::eval(&*self.contract, env, &Expression::ident(n.clone()))
                .unwrap_or_else(|_| Evaluated::unknown())
        };
        match named.len() {
            0 => Evaluated::unknown(),
            1 => read(named[0]),
            _ => Evaluated::Tuple(named.iter().map(|n| read(n)).collect()),
        }
    }

    // --- loops ---

    /// Two-pass loop evaluation at `join`, entered with `init_env` from
    /// outside the loop. Nested loops recurse.
    fn fixpoint(
        &mut self,
        f: &mut FunctionCfg,
        ctx: &FnCtx,
        join: NodeId,
        init_env: Env,
        ret_acc: &mut Option<Evaluated>,
    ) -> Result<()> {
        let parts = loop_parts(f, join)?;
        let threshold = self.trip_threshold(f, parts.cond, &init_env);
        debug!(head = %join, threshold, "loop fixpoint");

        // Nested loop heads inside this body run their own fixpoint;
        // their interiors are off-limits to this worklist.
        let inner_joins: Vec<NodeId> = parts
            .body
            .iter()
            .copied()
            .filter(|id| *id != join && f.node(*id).is_loop_join())
            .collect();
        let mut inner: BTreeMap<NodeId, LoopParts> = BTreeMap::new();
        for j in &inner_joins {
            inner.insert(*j, loop_parts(f, *j)?);
        }
        let mut skip: BTreeSet<NodeId> = BTreeSet::new();
        for lp in inner.values() {
            skip.extend(lp.body.iter().copied());
        }
        let top_inner: BTreeSet<NodeId> = inner_joins
            .iter()
            .copied()
            .filter(|j| !inner.iter().any(|(k, lp)| k != j && lp.body.contains(j)))
            .collect();
        for j in &top_inner {
            skip.remove(j);
        }

        f.node_mut(join).join_baseline = Some(init_env.clone());
        f.node_mut(join).snapshot = None;

        let was_recording = mem::replace(&mut self.recording, false);
        let body = parts.body.clone();
        // Returns observed during widening carry over-wide intermediate
        // values; only the stabilized sweep below contributes.
        let ret_before = ret_acc.clone();

        // Widening pass.
        let mut visits = 0usize;
        let mut pops = 0usize;
        let mut queue = VecDeque::from([join]);
        while let Some(id) = queue.pop_front() {
            if pops >= W_MAX {
                warn!(head = %join, "widening visit cap reached");
                break;
            }
            pops += 1;
            if skip.contains(&id) {
                continue;
            }
            let prev = f.node(id).out_env.clone();
            if id == join {
                let joined =
                    self.join_preds(f, join, &|p| body.contains(&p), Some(&init_env))?;
                visits += 1;
                let node = f.node(join);
                let differs = node.snapshot.as_ref().map(|s| *s != joined).unwrap_or(false);
                let out = if visits >= 2 && (differs || visits > threshold) && !prev.is_empty() {
                    prev.widened(&joined)
                } else {
                    joined.clone()
                };
                f.node_mut(join).snapshot = Some(joined);
                if out != prev {
                    f.node_mut(join).out_env = out;
                    for (s, _) in f.succs(join).to_vec() {
                        if body.contains(&s) {
                            queue.push_back(s);
                        }
                    }
                }
            } else if top_inner.contains(&id) {
                let lp = match inner.get(&id) {
                    Some(lp) => lp.clone(),
                    None => continue,
                };
                let inner_body = lp.body.clone();
                let init = self.join_preds(f, id, &|p| !inner_body.contains(&p), None)?;
                let exit_before = f.node(lp.exit).out_env.clone();
                self.fixpoint(f, ctx, id, init, ret_acc)?;
                if f.node(lp.exit).out_env != exit_before {
                    for (s, _) in f.succs(lp.exit).to_vec() {
                        if body.contains(&s) {
                            queue.push_back(s);
                        }
                    }
                }
            } else {
                let in_env = self.join_preds(f, id, &|_| true, None)?;
                let out = self.transfer(f, ctx, id, in_env, ret_acc)?;
                if out != prev {
                    f.node_mut(id).out_env = out;
                    for (s, _) in f.succs(id).to_vec() {
                        if body.contains(&s) {
                            queue.push_back(s);
                        }
                    }
                }
            }
        }

        // Narrowing pass: recompute INs, refine only infinite bounds at
        // the loop head, bounded iterations.
        let order: Vec<NodeId> = f
            .node_ids()
            .filter(|id| body.contains(id) && !skip.contains(id) && !top_inner.contains(id))
            .collect();
        for _ in 0..N_MAX {
            let mut changed = false;
            for &id in &order {
                let prev = f.node(id).out_env.clone();
                let new_out = if id == join {
                    let joined =
                        self.join_preds(f, join, &|p| body.contains(&p), Some(&init_env))?;
                    prev.narrowed(&joined)
                } else {
                    let in_env = self.join_preds(f, id, &|_| true, None)?;
                    self.transfer(f, ctx, id, in_env, ret_acc)?
                };
                if new_out != prev {
                    f.node_mut(id).out_env = new_out;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        self.recording = was_recording;

        // One sweep at the stabilized ranges; this is also where records
        // and return values are collected.
        *ret_acc = ret_before;
        if self.recording {
            for &id in &order {
                self.clear_node_lines(f, id);
            }
        }
        for &id in &order {
            if id == join {
                continue;
            }
            let in_env = self.join_preds(f, id, &|_| true, None)?;
            let out = self.transfer(f, ctx, id, in_env, ret_acc)?;
            f.node_mut(id).out_env = out;
        }
        for j in &top_inner {
            if let Some(lp) = inner.get(j) {
                let inner_body = lp.body.clone();
                let init = self.join_preds(f, *j, &|p| !inner_body.contains(&p), None)?;
                self.fixpoint(f, ctx, *j, init, ret_acc)?;
            }
        }

        // The loop's continuation sees the refined join over everything
        // that can leave the loop (condition false, breaks).
        let exit_in = self.join_preds(f, parts.exit, &|p| body.contains(&p), None)?;
        f.node_mut(parts.exit).out_env = exit_in;

        if self.recording {
            if let Some(baseline) = f.node(join).join_baseline.clone() {
                let delta = f.node(join).out_env.diff(&baseline);
                if !delta.is_empty() {
                    if let Some(line) = f.node(parts.cond).line {
                        self.publish(line, RecordKind::LoopDelta, delta);
                    }
                }
            }
        }
        Ok(())
    }

    /// How many widening-free iterations the loop condition suggests.
    fn trip_threshold(&self, f: &FunctionCfg, cond: NodeId, env: &Env) -> usize {
        if let Some((_, Expression::Binary { op, left, right })) = f.node(cond).condition() {
            if op.is_comparison() {
                let lv = eval::eval(&*self.contract, env, left).ok();
                let rv = eval::eval(&*self.contract, env, right).ok();
                if let (Some(a), Some(b)) = (
                    lv.as_ref().and_then(Evaluated::as_interval),
                    rv.as_ref().and_then(Evaluated::as_interval),
                ) {
                    return estimate_trip_count(a, b, *op) as usize;
                }
            }
        }
        20
    }

    // --- incremental re-interpretation ---

    fn rerun_from(&mut self, f: &mut FunctionCfg, lines: &[u32]) -> Result<()> {
        let ctx = FnCtx { returns: f.returns.clone(), decl_line: f.decl_line };
        let mut ret_acc: Option<Evaluated> = None;

        let mut seeds: Vec<NodeId> = Vec::new();
        for &line in lines {
            let id = f
                .node_at_line(line)
                .ok_or(AnalysisError::UnknownLine(line))?;
            if !seeds.contains(&id) {
                seeds.push(id);
            }
        }

        // A seed inside a loop must re-enter that loop's fixpoint.
        let mut bodies: BTreeMap<NodeId, LoopParts> = BTreeMap::new();
        for j in f.node_ids().filter(|id| f.node(*id).is_loop_join()).collect::<Vec<_>>() {
            bodies.insert(j, loop_parts(f, j)?);
        }
        let mut grew = true;
        while grew {
            grew = false;
            for (j, lp) in &bodies {
                if !seeds.contains(j) && seeds.iter().any(|s| lp.body.contains(s)) {
                    seeds.push(*j);
                    grew = true;
                }
            }
        }

        // A seed dominated by another seed is recomputed anyway.
        let reduced: Vec<NodeId> = seeds
            .iter()
            .copied()
            .filter(|s| !seeds.iter().any(|d| d != s && f.dominates(*d, *s)))
            .collect();
        debug!(function = %f.name, seeds = reduced.len(), "incremental rerun");

        let mut queue: VecDeque<NodeId> = reduced.into_iter().collect();
        let cap = (f.node_count() * 64).max(W_MAX);
        let mut pops = 0usize;
        while let Some(id) = queue.pop_front() {
            if pops >= cap {
                warn!(function = %f.name, "rerun propagation cap reached");
                break;
            }
            pops += 1;
            if f.node(id).is_loop_join() {
                let lp = match bodies.get(&id) {
                    Some(lp) => lp.clone(),
                    None => continue,
                };
                f.node_mut(id).snapshot = None;
                let body = lp.body.clone();
                let init = self.join_preds(f, id, &|p| !body.contains(&p), None)?;
                let exit_before = f.node(lp.exit).out_env.clone();
                self.fixpoint(f, &ctx, id, init, &mut ret_acc)?;
                if f.node(lp.exit).out_env != exit_before {
                    for (s, _) in f.succs(lp.exit).to_vec() {
                        queue.push_back(s);
                    }
                }
            } else {
                if self.recording {
                    self.clear_node_lines(f, id);
                }
                let in_env = self.join_preds(f, id, &|_| true, None)?;
                let before = f.node(id).out_env.clone();
                let out = self.transfer(f, &ctx, id, in_env, &mut ret_acc)?;
                let changed = out != before;
                f.node_mut(id).out_env = out;
                if changed {
                    for (s, _) in f.succs(id).to_vec() {
                        queue.push_back(s);
                    }
                }
            }
        }
        Ok(())
    }

    // --- records ---

    fn publish(&mut self, line: u32, kind: RecordKind, vars: BTreeMap<String, String>) {
        if !self.recording {
            return;
        }
        self.cleared.insert(line);
        self.ledger.append_or_replace(line, Record::new(kind, vars));
    }

    fn clear_function_lines(&mut self, f: &FunctionCfg) {
        for id in f.node_ids().collect::<Vec<_>>() {
            self.clear_node_lines(f, id);
        }
        if self.cleared.insert(f.decl_line) {
            self.ledger.clear_line(f.decl_line);
        }
    }

    fn clear_node_lines(&mut self, f: &FunctionCfg, id: NodeId) {
        let node = f.node(id);
        let mut lines: Vec<u32> = node.stmts.iter().map(Statement::line).collect();
        if let Some(l) = node.line {
            lines.push(l);
        }
        for line in lines {
            if self.cleared.insert(line) {
                self.ledger.clear_line(line);
            }
        }
    }

    fn record_assignment(&mut self, env: &Env, lhs: &Expression, line: u32) {
        if !self.recording {
            return;
        }
        let path = self.canonical_path(env, lhs);
        let mut vars = BTreeMap::new();
        match eval::resolve_var(&*self.contract, env, lhs) {
            Ok(Some(var)) => var.flatten_into(&path, &mut vars),
            _ => {
                if let Ok(v) = eval::eval(&*self.contract, env, lhs) {
                    render_into(&path, &v, &mut vars);
                }
            }
        }
        self.publish(line, RecordKind::Assignment, vars);
    }

    /// Ledger path for an lvalue, with index expressions replaced by
    /// their evaluated keys (`bal[msg.sender]` becomes `bal[addr#101]`).
    fn canonical_path(&self, env: &Env, expr: &Expression) -> String {
        match expr {
            Expression::Index { base, index } => {
                let key = eval::mapping_key_repr(&*self.contract, env, index)
                    .unwrap_or_else(|_| index.path_string());
                format!("{}[{}]", self.canonical_path(env, base), key)
            }
            Expression::Member { base, member } => {
                format!("{}.{}", self.canonical_path(env, base), member)
            }
            _ => expr.path_string(),
        }
    }

    /// Variables a condition constrains, rendered at their refined
    /// values. Read-only names (globals, constants, literals) are left
    /// out.
    fn condition_vars(&self, env: &Env, expr: &Expression) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        self.collect_condition_vars(env, expr, &mut out);
        out
    }

    fn collect_condition_vars(
        &self,
        env: &Env,
        expr: &Expression,
        out: &mut BTreeMap<String, String>,
    ) {
        match expr {
            Expression::Binary { left, right, .. } => {
                self.collect_condition_vars(env, left, out);
                self.collect_condition_vars(env, right, out);
            }
            Expression::Unary { operand, .. } => self.collect_condition_vars(env, operand, out),
            Expression::Ident(_) | Expression::Member { .. } | Expression::Index { .. } => {
                if self.contract.is_read_only_expr(expr) {
                    return;
                }
                if let Ok(v) = eval::eval(&*self.contract, env, expr) {
                    render_into(&self.canonical_path(env, expr), &v, out);
                }
            }
            _ => {}
        }
    }
}

fn compound_binop(op: AssignOp) -> Option<BinOp> {
    Some(match op {
        AssignOp::Assign => return None,
        AssignOp::Add => BinOp::Add,
        AssignOp::Sub => BinOp::Sub,
        AssignOp::Mul => BinOp::Mul,
        AssignOp::Div => BinOp::Div,
        AssignOp::Rem => BinOp::Rem,
        AssignOp::Shl => BinOp::Shl,
        AssignOp::Shr => BinOp::Shr,
        AssignOp::BitAnd => BinOp::BitAnd,
        AssignOp::BitOr => BinOp::BitOr,
        AssignOp::BitXor => BinOp::BitXor,
    })
}

fn render_into(path: &str, value: &Evaluated, out: &mut BTreeMap<String, String>) {
    match value {
        Evaluated::Value(AbstractValue::Interval(iv)) => {
            out.insert(path.to_string(), iv.to_string());
        }
        Evaluated::Value(AbstractValue::Symbol(s)) => {
            out.insert(path.to_string(), s.clone());
        }
        Evaluated::Composite(var) => var.flatten_into(path, out),
        Evaluated::Tuple(items) => {
            for (i, item) in items.iter().enumerate() {
                render_into(&format!("{}[{}]", path, i), item, out);
            }
        }
    }
}

/// Body membership, condition and exit of the loop headed at `join`.
/// Membership: reachable from the head without crossing the loop's own
/// LoopExit, and able to flow back to the head or leave through an exit
/// (the loop's own, or the function exit for `break`/`return`/`revert`
/// blocks whose only successor is an exit).
fn loop_parts(f: &FunctionCfg, join: NodeId) -> Result<LoopParts> {
    let cond = find_loop_cond(f, join)?;
    let exit = f.false_succ(cond)?;

    let mut forward: BTreeSet<NodeId> = BTreeSet::new();
    let mut stack = vec![join];
    while let Some(n) = stack.pop() {
        if n == exit || n == f.exit || !forward.insert(n) {
            continue;
        }
        for (s, _) in f.succs(n) {
            stack.push(*s);
        }
    }
    let mut backward: BTreeSet<NodeId> = BTreeSet::new();
    backward.insert(join);
    let mut stack: Vec<NodeId> = f
        .preds(join)
        .iter()
        .chain(f.preds(exit).iter())
        .chain(f.preds(f.exit).iter())
        .copied()
        .collect();
    while let Some(n) = stack.pop() {
        if n == exit || n == join || n == f.exit || !backward.insert(n) {
            continue;
        }
        for p in f.preds(n) {
            stack.push(*p);
        }
    }
    let body: BTreeSet<NodeId> = forward.intersection(&backward).copied().collect();
    Ok(LoopParts { body, cond, exit })
}

fn find_loop_cond(f: &FunctionCfg, join: NodeId) -> Result<NodeId> {
    // while/for: the head flows straight into the condition.
    if let Ok(s) = f.single_succ(join) {
        if matches!(f.node(s).kind, NodeKind::Condition { kind, .. } if kind.is_loop()) {
            return Ok(s);
        }
    }
    // do-while: the condition's true edge comes back to the head.
    f.preds(join)
        .iter()
        .copied()
        .find(|p| {
            matches!(
                f.node(*p).kind,
                NodeKind::Condition { kind: CondKind::DoWhile, .. }
            ) && f.edge_label(*p, join) == Some(Some(true))
        })
        .ok_or(AnalysisError::MissingLoopExit(join))
}
