//! Incremental CFG construction. Every operation is a local splice:
//! detach the cursor's successors, insert the construct's sub-graph,
//! reconnect. The graph stays connected after each call, which is what
//! lets the engine re-run from the middle of a half-edited function.

use tracing::trace;

use crate::cfg::{CondKind, FnKind, FunctionCfg, NodeId, NodeKind};
use crate::error::{AnalysisError, Result};
use crate::ir::{AssignOp, Expression, SolType, Statement, UnOp};

/// Explicit build state threaded through the builder calls: the node
/// statements currently append to, plus the stack of open constructs.
#[derive(Debug, Clone)]
pub struct BuildCtx {
    pub cursor: NodeId,
    terminated: bool,
    frames: Vec<Frame>,
}

#[derive(Debug, Clone)]
enum Frame {
    /// Open if/try chain. `leaves` are the arm ends awaiting the join.
    Cond { cond: NodeId, false_arm: NodeId, leaves: Vec<NodeId>, arm_open: bool },
    Loop { join: NodeId, exit: NodeId, increment: Option<NodeId> },
    /// Do-while body; the condition arrives at `finish_do_while`. The
    /// exit node exists up front so `break` has a target.
    DoWhile { join: NodeId, exit: NodeId, succs: Vec<(NodeId, Option<bool>)> },
    Unchecked,
}

pub struct Builder<'f> {
    f: &'f mut FunctionCfg,
}

impl<'f> Builder<'f> {
    pub fn new(f: &'f mut FunctionCfg) -> Result<(Builder<'f>, BuildCtx)> {
        let cursor = f.body_start()?;
        Ok((Builder { f }, BuildCtx { cursor, terminated: false, frames: Vec::new() }))
    }

    pub fn cfg(&self) -> &FunctionCfg {
        self.f
    }

    // --- statement appends ---

    fn append(&mut self, ctx: &BuildCtx, stmt: Statement) {
        trace!(node = %ctx.cursor, line = stmt.line(), "append statement");
        let node = self.f.node_mut(ctx.cursor);
        if node.line.is_none() {
            node.line = Some(stmt.line());
        }
        node.stmts.push(stmt);
    }

    pub fn declare(
        &mut self,
        ctx: &BuildCtx,
        ty: SolType,
        name: impl Into<String>,
        init: Option<Expression>,
        line: u32,
    ) {
        self.append(ctx, Statement::VarDecl { ty, name: name.into(), init, line });
    }

    pub fn assign(
        &mut self,
        ctx: &BuildCtx,
        lhs: Expression,
        op: AssignOp,
        rhs: Expression,
        line: u32,
    ) {
        self.append(ctx, Statement::Assign { lhs, op, rhs, line });
    }

    pub fn unary_stmt(&mut self, ctx: &BuildCtx, op: UnOp, target: Expression, line: u32) {
        self.append(ctx, Statement::UnaryStmt { op, target, line });
    }

    pub fn expr_stmt(&mut self, ctx: &BuildCtx, expr: Expression, line: u32) {
        self.append(ctx, Statement::ExprStmt { expr, line });
    }

    /// Appends a `return` and rewires the cursor straight to the exit.
    pub fn ret(&mut self, ctx: &mut BuildCtx, expr: Option<Expression>, line: u32) {
        self.append(ctx, Statement::Return { expr, line });
        self.divert_to(ctx, self.f.exit);
    }

    pub fn revert(&mut self, ctx: &mut BuildCtx, reason: Option<String>, line: u32) {
        self.append(ctx, Statement::Revert { reason, line });
        self.divert_to(ctx, self.f.exit);
    }

    pub fn brk(&mut self, ctx: &mut BuildCtx, line: u32) -> Result<()> {
        let exit = self.enclosing_loop(ctx)?.0;
        self.append(ctx, Statement::Break { line });
        self.divert_to(ctx, exit);
        Ok(())
    }

    pub fn cont(&mut self, ctx: &mut BuildCtx, line: u32) -> Result<()> {
        let target = self.enclosing_loop(ctx)?.1;
        self.append(ctx, Statement::Continue { line });
        self.divert_to(ctx, target);
        Ok(())
    }

    /// (break target, continue target) of the innermost open loop.
    fn enclosing_loop(&self, ctx: &BuildCtx) -> Result<(NodeId, NodeId)> {
        for frame in ctx.frames.iter().rev() {
            match frame {
                Frame::Loop { join, exit, increment } => {
                    return Ok((*exit, increment.unwrap_or(*join)));
                }
                Frame::DoWhile { join, exit, .. } => {
                    // `continue` re-enters at the join; the condition
                    // re-checks on the next pass through it.
                    return Ok((*exit, *join));
                }
                _ => continue,
            }
        }
        Err(AnalysisError::UnmatchedConstruct("break/continue"))
    }

    fn divert_to(&mut self, ctx: &mut BuildCtx, target: NodeId) {
        self.f.take_succs(ctx.cursor);
        self.f.add_edge(ctx.cursor, target, None);
        ctx.terminated = true;
    }

    // --- conditionals ---

    /// Splices `if (cond)` at the cursor; subsequent statements land in
    /// the true arm.
    pub fn begin_if(&mut self, ctx: &mut BuildCtx, cond: Expression, line: u32) {
        self.begin_cond(ctx, CondKind::If, cond, line);
    }

    /// `try expr { .. } catch { .. }`: the success arm behaves like a
    /// true branch, the catch arm like the false branch.
    pub fn begin_try(&mut self, ctx: &mut BuildCtx, call: Expression, line: u32) {
        self.begin_cond(ctx, CondKind::Try, call, line);
    }

    fn begin_cond(&mut self, ctx: &mut BuildCtx, kind: CondKind, cond: Expression, line: u32) {
        let succs = self.f.take_succs(ctx.cursor);
        let c = self.f.add_node(NodeKind::Condition { kind, expr: cond });
        self.f.node_mut(c).line = Some(line);
        let t = self.f.add_node(NodeKind::Branch { is_true: true });
        let e = self.f.add_node(NodeKind::Branch { is_true: false });
        self.f.add_edge(ctx.cursor, c, None);
        self.f.add_edge(c, t, Some(true));
        self.f.add_edge(c, e, Some(false));
        for (s, _) in &succs {
            self.f.add_edge(t, *s, None);
            self.f.add_edge(e, *s, None);
        }
        ctx.frames.push(Frame::Cond { cond: c, false_arm: e, leaves: Vec::new(), arm_open: true });
        ctx.cursor = t;
        ctx.terminated = false;
    }

    /// Closes the true arm and continues in the false arm.
    pub fn begin_else(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        let cursor = ctx.cursor;
        let terminated = ctx.terminated;
        match ctx.frames.last_mut() {
            Some(Frame::Cond { false_arm, leaves, arm_open, .. }) if *arm_open => {
                if !terminated {
                    leaves.push(cursor);
                }
                *arm_open = false;
                ctx.cursor = *false_arm;
                ctx.terminated = false;
                Ok(())
            }
            _ => Err(AnalysisError::UnmatchedConstruct("else")),
        }
    }

    pub fn begin_catch(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        self.begin_else(ctx)
    }

    /// `else if`: closes the true arm, then opens a nested condition in
    /// the false arm.
    pub fn begin_else_if(&mut self, ctx: &mut BuildCtx, cond: Expression, line: u32) -> Result<()> {
        self.begin_else(ctx)?;
        self.begin_cond(ctx, CondKind::ElseIf, cond, line);
        Ok(())
    }

    /// Joins the open arms into a fresh block and continues there.
    /// An `else if` chain is closed one level at a time.
    pub fn finish_if(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        let cursor = ctx.cursor;
        let terminated = ctx.terminated;
        let (mut leaves, was_open, false_arm) = match ctx.frames.pop() {
            Some(Frame::Cond { leaves, arm_open, false_arm, .. }) => {
                (leaves, arm_open, false_arm)
            }
            _ => return Err(AnalysisError::UnmatchedConstruct("end of if")),
        };
        if !terminated {
            leaves.push(cursor);
        }
        if was_open {
            // No else arm was opened: the empty false branch is a leaf.
            leaves.push(false_arm);
        }
        let join = self.f.add_node(NodeKind::Generic);
        let mut continuation: Vec<(NodeId, Option<bool>)> = Vec::new();
        for leaf in &leaves {
            for edge in self.f.take_succs(*leaf) {
                if !continuation.contains(&edge) {
                    continuation.push(edge);
                }
            }
            self.f.add_edge(*leaf, join, None);
        }
        for (s, l) in continuation {
            self.f.add_edge(join, s, l);
        }
        ctx.cursor = join;
        ctx.terminated = leaves.is_empty();
        if ctx.terminated {
            // Every arm returned; the join block is dead weight.
            self.f.add_edge(join, self.f.exit, None);
        }
        trace!(join = %join, "closed conditional");
        Ok(())
    }

    pub fn finish_try(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        self.finish_if(ctx)
    }

    // --- guards ---

    pub fn add_require(&mut self, ctx: &mut BuildCtx, cond: Expression, line: u32) {
        self.add_guard(ctx, CondKind::Require, cond, line);
    }

    pub fn add_assert(&mut self, ctx: &mut BuildCtx, cond: Expression, line: u32) {
        self.add_guard(ctx, CondKind::Assert, cond, line);
    }

    /// Guard splice: the false edge reverts, i.e. runs straight to the
    /// exit without touching the continuation.
    fn add_guard(&mut self, ctx: &mut BuildCtx, kind: CondKind, cond: Expression, line: u32) {
        let succs = self.f.take_succs(ctx.cursor);
        let c = self.f.add_node(NodeKind::Condition { kind, expr: cond });
        self.f.node_mut(c).line = Some(line);
        let t = self.f.add_node(NodeKind::Branch { is_true: true });
        self.f.add_edge(ctx.cursor, c, None);
        self.f.add_edge(c, t, Some(true));
        self.f.add_edge(c, self.f.exit, Some(false));
        for (s, _) in &succs {
            self.f.add_edge(t, *s, None);
        }
        ctx.cursor = t;
        ctx.terminated = false;
    }

    // --- loops ---

    pub fn begin_while(&mut self, ctx: &mut BuildCtx, cond: Expression, line: u32) {
        let succs = self.f.take_succs(ctx.cursor);
        let join = self.f.add_node(NodeKind::LoopJoin);
        let c = self.f.add_node(NodeKind::Condition { kind: CondKind::While, expr: cond });
        self.f.node_mut(c).line = Some(line);
        let body = self.f.add_node(NodeKind::Generic);
        let exit = self.f.add_node(NodeKind::LoopExit);
        self.f.add_edge(ctx.cursor, join, None);
        self.f.add_edge(join, c, None);
        self.f.add_edge(c, body, Some(true));
        self.f.add_edge(c, exit, Some(false));
        self.f.add_edge(body, join, None);
        for (s, _) in &succs {
            self.f.add_edge(exit, *s, None);
        }
        ctx.frames.push(Frame::Loop { join, exit, increment: None });
        ctx.cursor = body;
        ctx.terminated = false;
    }

    /// `for (init; cond; incr)`: `init` lands in the current block, the
    /// increment gets its own node so `continue` can target it.
    pub fn begin_for(
        &mut self,
        ctx: &mut BuildCtx,
        init: Option<Statement>,
        cond: Expression,
        incr: Option<Statement>,
        line: u32,
    ) {
        if let Some(stmt) = init {
            self.append(ctx, stmt);
        }
        let succs = self.f.take_succs(ctx.cursor);
        let join = self.f.add_node(NodeKind::LoopJoin);
        let c = self.f.add_node(NodeKind::Condition { kind: CondKind::For, expr: cond });
        self.f.node_mut(c).line = Some(line);
        let body = self.f.add_node(NodeKind::Generic);
        let inc = self.f.add_node(NodeKind::ForIncrement);
        if let Some(stmt) = incr {
            let node = self.f.node_mut(inc);
            node.line = Some(stmt.line());
            node.stmts.push(stmt);
        }
        let exit = self.f.add_node(NodeKind::LoopExit);
        self.f.add_edge(ctx.cursor, join, None);
        self.f.add_edge(join, c, None);
        self.f.add_edge(c, body, Some(true));
        self.f.add_edge(c, exit, Some(false));
        self.f.add_edge(body, inc, None);
        self.f.add_edge(inc, join, None);
        for (s, _) in &succs {
            self.f.add_edge(exit, *s, None);
        }
        ctx.frames.push(Frame::Loop { join, exit, increment: Some(inc) });
        ctx.cursor = body;
        ctx.terminated = false;
    }

    /// `do { .. }`; the trailing `while (cond);` closes it.
    pub fn begin_do_while(&mut self, ctx: &mut BuildCtx) {
        let succs = self.f.take_succs(ctx.cursor);
        let join = self.f.add_node(NodeKind::LoopJoin);
        let body = self.f.add_node(NodeKind::Generic);
        let exit = self.f.add_node(NodeKind::LoopExit);
        self.f.add_edge(ctx.cursor, join, None);
        self.f.add_edge(join, body, None);
        ctx.frames.push(Frame::DoWhile { join, exit, succs });
        ctx.cursor = body;
        ctx.terminated = false;
    }

    pub fn finish_do_while(
        &mut self,
        ctx: &mut BuildCtx,
        cond: Expression,
        line: u32,
    ) -> Result<()> {
        let (join, exit, succs) = match ctx.frames.pop() {
            Some(Frame::DoWhile { join, exit, succs }) => (join, exit, succs),
            _ => return Err(AnalysisError::UnmatchedConstruct("while of do-while")),
        };
        let c = self.f.add_node(NodeKind::Condition { kind: CondKind::DoWhile, expr: cond });
        self.f.node_mut(c).line = Some(line);
        if !ctx.terminated {
            self.f.add_edge(ctx.cursor, c, None);
        }
        self.f.add_edge(c, join, Some(true));
        self.f.add_edge(c, exit, Some(false));
        for (s, _) in &succs {
            self.f.add_edge(exit, *s, None);
        }
        ctx.cursor = exit;
        ctx.terminated = false;
        Ok(())
    }

    /// Closes a `while`/`for` body; statements continue after the loop.
    pub fn finish_loop(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        let exit = match ctx.frames.pop() {
            Some(Frame::Loop { exit, .. }) => exit,
            _ => return Err(AnalysisError::UnmatchedConstruct("end of loop")),
        };
        ctx.cursor = exit;
        ctx.terminated = false;
        Ok(())
    }

    // --- unchecked ---

    pub fn begin_unchecked(&mut self, ctx: &mut BuildCtx, line: u32) {
        let succs = self.f.take_succs(ctx.cursor);
        let u = self.f.add_node(NodeKind::UncheckedBlock);
        self.f.node_mut(u).line = Some(line);
        self.f.add_edge(ctx.cursor, u, None);
        for (s, _) in &succs {
            self.f.add_edge(u, *s, None);
        }
        ctx.frames.push(Frame::Unchecked);
        ctx.cursor = u;
        ctx.terminated = false;
    }

    pub fn finish_unchecked(&mut self, ctx: &mut BuildCtx) -> Result<()> {
        match ctx.frames.pop() {
            Some(Frame::Unchecked) => {}
            _ => return Err(AnalysisError::UnmatchedConstruct("end of unchecked")),
        }
        let succs = self.f.take_succs(ctx.cursor);
        let g = self.f.add_node(NodeKind::Generic);
        self.f.add_edge(ctx.cursor, g, None);
        for (s, l) in succs {
            self.f.add_edge(g, s, l);
        }
        ctx.cursor = g;
        Ok(())
    }

    // --- edits ---

    /// Drops the statement at `line` from its node; the graph shape is
    /// untouched. Whole constructs come out via
    /// [`FunctionCfg::remove_node`].
    pub fn remove_statement(&mut self, line: u32) -> Result<()> {
        let id = self
            .f
            .node_at_line(line)
            .ok_or(AnalysisError::UnknownLine(line))?;
        let node = self.f.node_mut(id);
        let before = node.stmts.len();
        node.stmts.retain(|s| s.line() != line);
        if node.stmts.len() == before {
            return Err(AnalysisError::UnknownLine(line));
        }
        if node.line == Some(line) {
            node.line = node.stmts.first().map(Statement::line);
        }
        Ok(())
    }

    // --- modifiers ---

    /// Splices the `_` placeholder of a modifier body.
    pub fn placeholder(&mut self, ctx: &mut BuildCtx, line: u32) {
        let succs = self.f.take_succs(ctx.cursor);
        let p = self.f.add_node(NodeKind::ModifierPlaceholder);
        self.f.node_mut(p).line = Some(line);
        let g = self.f.add_node(NodeKind::Generic);
        self.f.add_edge(ctx.cursor, p, None);
        self.f.add_edge(p, g, None);
        for (s, _) in &succs {
            self.f.add_edge(g, *s, None);
        }
        ctx.cursor = g;
    }
}

/// Wraps `f`'s body in `modifier`'s body at its placeholder: the
/// modifier's prefix runs first, the function body replaces `_`, and
/// returns from the body resume at the modifier's suffix. Revert edges
/// (guard-false) keep running straight to the exit.
pub fn integrate_modifier(f: &mut FunctionCfg, modifier: &FunctionCfg) -> Result<()> {
    if modifier.kind != Some(FnKind::Modifier) {
        return Err(AnalysisError::UnknownFunction(modifier.name.clone()));
    }
    let placeholder = modifier
        .node_ids()
        .find(|id| matches!(modifier.node(*id).kind, NodeKind::ModifierPlaceholder))
        .ok_or_else(|| AnalysisError::MissingPlaceholder(modifier.name.clone()))?;

    let body_start = f.body_start()?;
    let old_exit_preds: Vec<NodeId> = f.preds(f.exit).to_vec();

    // Clone the modifier's interior into the function's arena.
    let mut map: Vec<Option<NodeId>> = Vec::new();
    for id in modifier.node_ids() {
        while map.len() <= id.index() {
            map.push(None);
        }
        if id == modifier.entry || id == modifier.exit {
            continue;
        }
        let mut node = modifier.node(id).clone();
        node.out_env = crate::domain::Env::new();
        node.snapshot = None;
        node.join_baseline = None;
        let kind = node.kind.clone();
        let new_id = f.add_node(kind);
        *f.node_mut(new_id) = node;
        map[id.index()] = Some(new_id);
    }
    let f_exit = f.exit;
    let mod_exit = modifier.exit;
    let mapped = move |id: NodeId| -> NodeId {
        if id == mod_exit {
            f_exit
        } else {
            map.get(id.index()).copied().flatten().unwrap_or(f_exit)
        }
    };
    let mod_edges: Vec<(NodeId, NodeId, Option<bool>)> = modifier
        .node_ids()
        .filter(|id| *id != modifier.entry && *id != modifier.exit)
        .flat_map(|id| {
            modifier
                .succs(id)
                .iter()
                .map(move |(s, l)| (id, *s, *l))
                .collect::<Vec<_>>()
        })
        .collect();
    for (from, to, label) in mod_edges {
        f.add_edge(mapped(from), mapped(to), label);
    }

    // Entry now runs the modifier prefix first.
    let mod_start = mapped(modifier.body_start()?);
    f.take_succs(f.entry);
    f.add_edge(f.entry, mod_start, None);

    // The placeholder hands control to the original body; whatever
    // followed it in the modifier becomes the post-body continuation.
    let p = mapped(placeholder);
    let post: Vec<(NodeId, Option<bool>)> = f.take_succs(p);
    f.add_edge(p, body_start, None);

    // Fallthroughs and returns resume at the modifier suffix; labelled
    // (revert) edges stay wired to the exit.
    let resumes_at_exit = post.iter().all(|(t, _)| *t == f.exit);
    if !resumes_at_exit {
        for pred in old_exit_preds {
            if f.edge_label(pred, f.exit) == Some(None) {
                f.remove_edge(pred, f.exit);
                for (t, _) in &post {
                    f.add_edge(pred, *t, None);
                }
            }
        }
    }
    Ok(())
}
