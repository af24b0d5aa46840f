//! Error types for the analysis core.

use thiserror::Error;

use crate::cfg::NodeId;

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// Errors surfaced by the CFG model, the builder and the engine.
///
/// Fixpoint iteration caps are not errors: the engine stops widening or
/// narrowing when a cap is hit and keeps the (sound) result it has.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // --- structural ---
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("node {0} has no {1}-labelled successor")]
    MissingBranch(NodeId, &'static str),

    #[error("node {0} is not a condition node")]
    NotACondition(NodeId),

    #[error("no loop exit reachable from loop head {0}")]
    MissingLoopExit(NodeId),

    #[error("no statement owns source line {0}")]
    UnknownLine(u32),

    #[error("no open construct matches `{0}` here")]
    UnmatchedConstruct(&'static str),

    #[error("modifier `{0}` has no placeholder statement")]
    MissingPlaceholder(String),

    // --- domain ---
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("`{base}` has no member `{member}`")]
    UnknownMember { base: String, member: String },

    #[error("unknown struct type `{0}`")]
    UnknownStruct(String),

    #[error("unknown enum type `{0}`")]
    UnknownEnum(String),

    #[error("static array `{0}` cannot be resized")]
    StaticArrayResize(String),

    #[error("index {index} out of range for static array `{name}` of length {len}")]
    IndexOutOfRange { name: String, index: u64, len: u64 },

    #[error("`{0}` is not indexable")]
    NotIndexable(String),

    #[error("expected a scalar value, found composite `{0}`")]
    CompositeValue(String),

    #[error("cannot assign to constant `{0}`")]
    ConstantAssignment(String),

    #[error("expression is not assignable")]
    NotAssignable,
}
