//! Statement and expression trees consumed by the builder and the engine.
//!
//! The front end (parser, line buffer) lives outside this crate; callers
//! construct these trees programmatically. Helper constructors keep the
//! builder call sites and the tests readable.

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

/// Solidity-style type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolType {
    Uint(u16),
    Int(u16),
    Bool,
    Address,
    /// `bytesN` when `Some(n)`, dynamic `bytes` when `None`.
    Bytes(Option<u16>),
    String,
    /// `len: None` marks a dynamic array.
    Array { base: Box<SolType>, len: Option<u64> },
    Mapping { key: Box<SolType>, value: Box<SolType> },
    Struct(String),
    Enum(String),
}

impl SolType {
    pub fn uint256() -> Self {
        SolType::Uint(256)
    }

    pub fn dynamic_array(base: SolType) -> Self {
        SolType::Array { base: Box::new(base), len: None }
    }

    pub fn static_array(base: SolType, len: u64) -> Self {
        SolType::Array { base: Box::new(base), len: Some(len) }
    }

    pub fn mapping(key: SolType, value: SolType) -> Self {
        SolType::Mapping { key: Box::new(key), value: Box::new(value) }
    }

    pub fn is_elementary(&self) -> bool {
        matches!(
            self,
            SolType::Uint(_)
                | SolType::Int(_)
                | SolType::Bool
                | SolType::Address
                | SolType::Bytes(_)
                | SolType::String
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, SolType)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    And,
    Or,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne)
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    BitNot,
    Inc,
    Dec,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Ident(String),
    Number(BigInt),
    BoolLit(bool),
    StringLit(String),
    /// Hex literal kept textual so 20-byte forms can coerce to addresses.
    HexLit(String),
    Binary { op: BinOp, left: Box<Expression>, right: Box<Expression> },
    Unary { op: UnOp, operand: Box<Expression>, prefix: bool },
    Index { base: Box<Expression>, index: Box<Expression> },
    Member { base: Box<Expression>, member: String },
    Call { callee: Box<Expression>, args: Vec<Expression> },
    Conditional { cond: Box<Expression>, then_val: Box<Expression>, else_val: Box<Expression> },
    Tuple(Vec<Expression>),
    /// Bare type reference, e.g. the `T` in `type(T).max`.
    TypeRef(SolType),
    /// Explicit conversion `T(expr)`.
    Cast { ty: SolType, expr: Box<Expression> },
}

impl Expression {
    pub fn ident(name: impl Into<String>) -> Self {
        Expression::Ident(name.into())
    }

    pub fn num(v: i64) -> Self {
        Expression::Number(BigInt::from(v))
    }

    pub fn big(v: BigInt) -> Self {
        Expression::Number(v)
    }

    pub fn boolean(v: bool) -> Self {
        Expression::BoolLit(v)
    }

    pub fn binary(op: BinOp, left: Expression, right: Expression) -> Self {
        Expression::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn not(operand: Expression) -> Self {
        Expression::Unary { op: UnOp::Not, operand: Box::new(operand), prefix: true }
    }

    pub fn index(base: Expression, index: Expression) -> Self {
        Expression::Index { base: Box::new(base), index: Box::new(index) }
    }

    pub fn member(base: Expression, member: impl Into<String>) -> Self {
        Expression::Member { base: Box::new(base), member: member.into() }
    }

    pub fn call(callee: Expression, args: Vec<Expression>) -> Self {
        Expression::Call { callee: Box::new(callee), args }
    }

    /// Renders lvalue-shaped trees (identifier / member / index chains)
    /// back to a source-like path for ledger keys.
    pub fn path_string(&self) -> String {
        match self {
            Expression::Ident(n) => n.clone(),
            Expression::Number(v) => v.to_string(),
            Expression::BoolLit(v) => v.to_string(),
            Expression::StringLit(s) => s.clone(),
            Expression::HexLit(h) => h.clone(),
            Expression::Member { base, member } => {
                format!("{}.{}", base.path_string(), member)
            }
            Expression::Index { base, index } => {
                format!("{}[{}]", base.path_string(), index.path_string())
            }
            _ => "<expr>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    VarDecl { ty: SolType, name: String, init: Option<Expression>, line: u32 },
    Assign { lhs: Expression, op: AssignOp, rhs: Expression, line: u32 },
    /// `++x;`, `x--;`, `delete x;`
    UnaryStmt { op: UnOp, target: Expression, line: u32 },
    ExprStmt { expr: Expression, line: u32 },
    Return { expr: Option<Expression>, line: u32 },
    Revert { reason: Option<String>, line: u32 },
    Break { line: u32 },
    Continue { line: u32 },
}

impl Statement {
    pub fn line(&self) -> u32 {
        match self {
            Statement::VarDecl { line, .. }
            | Statement::Assign { line, .. }
            | Statement::UnaryStmt { line, .. }
            | Statement::ExprStmt { line, .. }
            | Statement::Return { line, .. }
            | Statement::Revert { line, .. }
            | Statement::Break { line }
            | Statement::Continue { line } => *line,
        }
    }
}
