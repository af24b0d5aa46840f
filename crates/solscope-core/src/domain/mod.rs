//! Abstract domains: the interval lattice, variable shapes and
//! per-node environments.

pub mod env;
pub mod interval;
pub mod variable;

pub use env::Env;
pub use interval::{estimate_trip_count, Bound, Interval, IntervalKind};
pub use variable::{
    interval_kind_of, AbstractValue, AddressBook, Scope, TypeDefs, VarData, Variable,
};
