//! Interval-domain abstract interpretation for Solidity-style
//! contracts, built for interactive use: a contract is loaded once,
//! interpreted, and then re-interpreted incrementally as single lines
//! are edited or variables are speculatively overridden.
//!
//! The pieces:
//!
//! - [`ir`]: types, expressions and statements of the analyzed language.
//! - [`cfg`]: per-function control-flow graphs and the splice-based
//!   [`cfg::Builder`] that keeps them well-formed mid-edit.
//! - [`domain`]: the interval lattice, structured variables and
//!   per-node environments.
//! - [`engine`]: the interpreter itself, with widening/narrowing loop
//!   fixpoints and incremental re-runs.
//! - [`refine`]: branch-condition narrowing of environments.
//! - [`ledger`]: the per-line record store the UI reads.
//! - [`overrides`]: speculative value overrides with rollback.
//!
//! ```
//! use solscope_core::cfg::{Builder, ContractCfg, FnKind};
//! use solscope_core::ir::{AssignOp, Expression, SolType};
//! use solscope_core::Engine;
//!
//! let mut c = ContractCfg::new("Counter");
//! c.add_state_var("count", SolType::uint256(), None, false).unwrap();
//! c.add_function("bump", FnKind::Function, vec![], vec![], 1).unwrap();
//! {
//!     let f = c.function_mut("bump").unwrap();
//!     let (mut b, ctx) = Builder::new(f).unwrap();
//!     b.assign(&ctx, Expression::ident("count"), AssignOp::Add, Expression::num(1), 2);
//! }
//! let mut engine = Engine::new(&mut c);
//! engine.interpret_function("bump").unwrap();
//! assert!(!engine.ledger.get(2).is_empty());
//! ```

pub mod cfg;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ir;
pub mod ledger;
pub mod overrides;
pub mod refine;

pub use cfg::{Builder, ContractCfg, FunctionCfg, NodeId};
pub use domain::{AbstractValue, Env, Interval, IntervalKind, Variable};
pub use engine::{Engine, Evaluated};
pub use error::{AnalysisError, Result};
pub use ledger::{Ledger, Record, RecordKind};
pub use overrides::{Override, OverrideTarget, UndoLog};
