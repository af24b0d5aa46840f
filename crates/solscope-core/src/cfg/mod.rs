//! Control-flow graph model: an arena of nodes addressed by stable
//! handles, with labelled adjacency lists kept in both directions.

pub mod builder;
pub mod contract;

use std::fmt;

use smallvec::SmallVec;

use crate::domain::Env;
use crate::error::{AnalysisError, Result};
use crate::ir::{Expression, SolType, Statement};

pub use builder::{BuildCtx, Builder};
pub use contract::ContractCfg;

/// Stable handle into a function's node arena. Handles survive node
/// removal; removed slots are tombstoned, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What kind of source construct a condition node guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondKind {
    If,
    ElseIf,
    Require,
    Assert,
    While,
    For,
    DoWhile,
    Try,
}

impl CondKind {
    pub fn is_loop(&self) -> bool {
        matches!(self, CondKind::While | CondKind::For | CondKind::DoWhile)
    }

    pub fn is_guard(&self) -> bool {
        matches!(self, CondKind::Require | CondKind::Assert)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Entry,
    Exit,
    /// Straight-line statement block.
    Generic,
    Condition { kind: CondKind, expr: Expression },
    /// Arm of an if/try; `is_true` tells which edge of the condition
    /// feeds it.
    Branch { is_true: bool },
    /// Loop head where the fixpoint is evaluated.
    LoopJoin,
    /// Sole continuation of a loop once its condition turns false (or a
    /// `break` fires).
    LoopExit,
    /// Increment block of a `for` loop; `continue` targets it.
    ForIncrement,
    /// Position of the `_` statement once a modifier is integrated.
    ModifierPlaceholder,
    /// `unchecked { .. }` block.
    UncheckedBlock,
}

/// One CFG node: kind, owned statements and the cached analysis state
/// the engine last computed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgNode {
    pub kind: NodeKind,
    pub stmts: Vec<Statement>,
    /// OUT environment from the most recent interpretation.
    pub out_env: Env,
    /// Previous iterate seen at a LoopJoin, for widening decisions.
    pub snapshot: Option<Env>,
    /// Environment entering the loop, diffed against for loop deltas.
    pub join_baseline: Option<Env>,
    pub line: Option<u32>,
    pub dead: bool,
}

impl CfgNode {
    fn new(kind: NodeKind) -> Self {
        CfgNode {
            kind,
            stmts: Vec::new(),
            out_env: Env::new(),
            snapshot: None,
            join_baseline: None,
            line: None,
            dead: false,
        }
    }

    pub fn is_loop_join(&self) -> bool {
        matches!(self.kind, NodeKind::LoopJoin)
    }

    pub fn condition(&self) -> Option<(CondKind, &Expression)> {
        match &self.kind {
            NodeKind::Condition { kind, expr } => Some((*kind, expr)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Function,
    Constructor,
    Modifier,
    Fallback,
    Receive,
}

type EdgeList = SmallVec<[(NodeId, Option<bool>); 2]>;
type PredList = SmallVec<[NodeId; 2]>;

/// Per-function CFG. Exactly one entry and one exit; the entry always
/// has a single successor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionCfg {
    pub name: String,
    pub kind: Option<FnKind>,
    nodes: Vec<CfgNode>,
    succs: Vec<EdgeList>,
    preds: Vec<PredList>,
    pub entry: NodeId,
    pub exit: NodeId,
    pub params: Vec<(String, SolType)>,
    /// Return slots; named slots sync with the exit environment.
    pub returns: Vec<(Option<String>, SolType)>,
    pub modifiers: Vec<String>,
    /// Environment seeded at entry: state vars, globals, parameters and
    /// named returns.
    pub related: Env,
    /// Line of the function signature, used for implicit-return records.
    pub decl_line: u32,
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId(0)
    }
}

impl FunctionCfg {
    pub fn new(name: impl Into<String>, kind: FnKind) -> Self {
        let mut f = FunctionCfg {
            name: name.into(),
            kind: Some(kind),
            ..FunctionCfg::default()
        };
        let entry = f.add_node(NodeKind::Entry);
        let body = f.add_node(NodeKind::Generic);
        let exit = f.add_node(NodeKind::Exit);
        f.entry = entry;
        f.exit = exit;
        f.add_edge(entry, body, None);
        f.add_edge(body, exit, None);
        f
    }

    /// The initial statement block, cursor for a fresh builder.
    pub fn body_start(&self) -> Result<NodeId> {
        self.single_succ(self.entry)
    }

    pub fn add_node(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(CfgNode::new(kind));
        self.succs.push(SmallVec::new());
        self.preds.push(SmallVec::new());
        id
    }

    pub fn node(&self, id: NodeId) -> &CfgNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CfgNode {
        &mut self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.dead).count()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32)
            .map(NodeId)
            .filter(move |id| !self.nodes[id.index()].dead)
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, label: Option<bool>) {
        if !self.succs[from.index()].iter().any(|(t, l)| *t == to && *l == label) {
            self.succs[from.index()].push((to, label));
        }
        if !self.preds[to.index()].contains(&from) {
            self.preds[to.index()].push(from);
        }
    }

    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        self.succs[from.index()].retain(|(t, _)| *t != to);
        self.preds[to.index()].retain(|p| *p != from);
    }

    pub fn succs(&self, id: NodeId) -> &[(NodeId, Option<bool>)] {
        &self.succs[id.index()]
    }

    pub fn preds(&self, id: NodeId) -> &[NodeId] {
        &self.preds[id.index()]
    }

    /// Label of the edge `from -> to`, if the edge exists.
    pub fn edge_label(&self, from: NodeId, to: NodeId) -> Option<Option<bool>> {
        self.succs[from.index()]
            .iter()
            .find(|(t, _)| *t == to)
            .map(|(_, l)| *l)
    }

    pub fn single_succ(&self, id: NodeId) -> Result<NodeId> {
        match self.succs(id) {
            [(t, _)] => Ok(*t),
            _ => Err(AnalysisError::MissingBranch(id, "single")),
        }
    }

    pub fn true_succ(&self, cond: NodeId) -> Result<NodeId> {
        self.labelled_succ(cond, true, "true")
    }

    pub fn false_succ(&self, cond: NodeId) -> Result<NodeId> {
        self.labelled_succ(cond, false, "false")
    }

    fn labelled_succ(&self, cond: NodeId, want: bool, tag: &'static str) -> Result<NodeId> {
        self.succs(cond)
            .iter()
            .find(|(_, l)| *l == Some(want))
            .map(|(t, _)| *t)
            .ok_or(AnalysisError::MissingBranch(cond, tag))
    }

    /// Detaches and returns all outgoing edges of `from`.
    pub fn take_succs(&mut self, from: NodeId) -> Vec<(NodeId, Option<bool>)> {
        let out: Vec<_> = self.succs[from.index()].drain(..).collect();
        for (to, _) in &out {
            self.preds[to.index()].retain(|p| *p != from);
        }
        out
    }

    /// Removes a node, reconnecting every predecessor to every successor
    /// with the predecessor edge's label.
    pub fn remove_node(&mut self, id: NodeId) {
        let in_edges: Vec<(NodeId, Option<bool>)> = self.preds[id.index()]
            .clone()
            .into_iter()
            .filter_map(|p| self.edge_label(p, id).map(|l| (p, l)))
            .collect();
        let out_edges = self.take_succs(id);
        for (p, _) in &in_edges {
            self.remove_edge(*p, id);
        }
        for (p, label) in in_edges {
            for (s, _) in &out_edges {
                self.add_edge(p, *s, label);
            }
        }
        let node = &mut self.nodes[id.index()];
        node.dead = true;
        node.stmts.clear();
    }

    /// The node whose statements (or condition) own `line`.
    pub fn node_at_line(&self, line: u32) -> Option<NodeId> {
        self.node_ids().find(|id| {
            let n = self.node(*id);
            n.line == Some(line) || n.stmts.iter().any(|s| s.line() == line)
        })
    }

    /// Nodes reachable from `from`, following successor edges.
    pub fn reachable_from(&self, from: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        let mut out = Vec::new();
        while let Some(n) = stack.pop() {
            if seen[n.index()] || self.nodes[n.index()].dead {
                continue;
            }
            seen[n.index()] = true;
            out.push(n);
            for (s, _) in self.succs(n) {
                stack.push(*s);
            }
        }
        out
    }

    /// Immediate dominator-based test: does `a` dominate `b`?
    /// Computed with the usual iterative dominator-set fixpoint; the
    /// graphs here are small enough for the quadratic scheme.
    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if a == b {
            return true;
        }
        let ids: Vec<NodeId> = self.reachable_from(self.entry);
        let index_of = |id: NodeId| ids.iter().position(|x| *x == id);
        let (ai, bi) = match (index_of(a), index_of(b)) {
            (Some(ai), Some(bi)) => (ai, bi),
            _ => return false,
        };
        let n = ids.len();
        let full: Vec<bool> = vec![true; n];
        let mut dom: Vec<Vec<bool>> = vec![full; n];
        let entry_pos = match index_of(self.entry) {
            Some(p) => p,
            None => return false,
        };
        dom[entry_pos] = vec![false; n];
        dom[entry_pos][entry_pos] = true;
        let mut changed = true;
        while changed {
            changed = false;
            for (i, id) in ids.iter().enumerate() {
                if i == entry_pos {
                    continue;
                }
                let mut acc: Option<Vec<bool>> = None;
                for p in self.preds(*id) {
                    if let Some(pi) = index_of(*p) {
                        acc = Some(match acc {
                            None => dom[pi].clone(),
                            Some(cur) => {
                                cur.iter().zip(&dom[pi]).map(|(x, y)| *x && *y).collect()
                            }
                        });
                    }
                }
                let mut next = acc.unwrap_or_else(|| vec![false; n]);
                next[i] = true;
                if next != dom[i] {
                    dom[i] = next;
                    changed = true;
                }
            }
        }
        dom[bi][ai]
    }

    /// Structural sanity: one live entry and exit, entry out-degree 1,
    /// condition nodes with exactly one true and one false successor,
    /// and everything reachable.
    pub fn validate(&self) -> Result<()> {
        let entries = self
            .node_ids()
            .filter(|id| matches!(self.node(*id).kind, NodeKind::Entry))
            .count();
        let exits = self
            .node_ids()
            .filter(|id| matches!(self.node(*id).kind, NodeKind::Exit))
            .count();
        if entries != 1 || exits != 1 {
            return Err(AnalysisError::MissingBranch(self.entry, "entry/exit"));
        }
        if self.succs(self.entry).len() != 1 {
            return Err(AnalysisError::MissingBranch(self.entry, "single"));
        }
        for id in self.node_ids() {
            if self.node(id).condition().is_some() {
                self.true_succ(id)?;
                self.false_succ(id)?;
            }
        }
        let reachable = self.reachable_from(self.entry);
        for id in self.node_ids() {
            if !reachable.contains(&id) {
                return Err(AnalysisError::MissingBranch(id, "reachable"));
            }
        }
        Ok(())
    }

    /// Clears all cached analysis state before a fresh interpretation.
    pub fn reset_analysis_state(&mut self) {
        for n in &mut self.nodes {
            n.out_env = Env::new();
            n.snapshot = None;
            n.join_baseline = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Expression;

    #[test]
    fn test_new_function_shape() {
        let f = FunctionCfg::new("f", FnKind::Function);
        f.validate().unwrap();
        let body = f.body_start().unwrap();
        assert_eq!(f.succs(body), &[(f.exit, None)]);
    }

    #[test]
    fn test_remove_node_reconnects() {
        let mut f = FunctionCfg::new("f", FnKind::Function);
        let body = f.body_start().unwrap();
        let mid = f.add_node(NodeKind::Generic);
        f.remove_edge(body, f.exit);
        f.add_edge(body, mid, None);
        f.add_edge(mid, f.exit, None);
        f.validate().unwrap();
        f.remove_node(mid);
        f.validate().unwrap();
        assert_eq!(f.succs(body), &[(f.exit, None)]);
    }

    #[test]
    fn test_labelled_successors() {
        let mut f = FunctionCfg::new("f", FnKind::Function);
        let body = f.body_start().unwrap();
        let cond = f.add_node(NodeKind::Condition {
            kind: CondKind::If,
            expr: Expression::boolean(true),
        });
        let t = f.add_node(NodeKind::Branch { is_true: true });
        let e = f.add_node(NodeKind::Branch { is_true: false });
        f.remove_edge(body, f.exit);
        f.add_edge(body, cond, None);
        f.add_edge(cond, t, Some(true));
        f.add_edge(cond, e, Some(false));
        f.add_edge(t, f.exit, None);
        f.add_edge(e, f.exit, None);
        assert_eq!(f.true_succ(cond).unwrap(), t);
        assert_eq!(f.false_succ(cond).unwrap(), e);
        assert_eq!(f.edge_label(cond, t), Some(Some(true)));
        f.validate().unwrap();
    }

    #[test]
    fn test_dominates() {
        let mut f = FunctionCfg::new("f", FnKind::Function);
        let body = f.body_start().unwrap();
        let a = f.add_node(NodeKind::Generic);
        let b = f.add_node(NodeKind::Generic);
        f.remove_edge(body, f.exit);
        f.add_edge(body, a, None);
        f.add_edge(body, b, None);
        f.add_edge(a, f.exit, None);
        f.add_edge(b, f.exit, None);
        assert!(f.dominates(body, a));
        assert!(f.dominates(body, f.exit));
        assert!(!f.dominates(a, f.exit));
        assert!(!f.dominates(a, b));
    }
}
