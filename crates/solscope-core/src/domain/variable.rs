//! Abstract variables: interval-valued scalars plus the composite shapes
//! (arrays, structs, mappings, enums) contract storage can take.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::domain::interval::{Interval, IntervalKind};
use crate::error::{AnalysisError, Result};
use crate::ir::{EnumDef, SolType, StructDef};

/// Lexical scope a variable was introduced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Local,
    State,
    Global,
}

/// Leaf value: a numeric/bool interval or an opaque symbol (addresses,
/// byte strings and other quantities the interval domain cannot order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbstractValue {
    Interval(Interval),
    Symbol(String),
}

impl AbstractValue {
    /// Placeholder symbol for joins of distinct symbolic values.
    pub const ANY: &'static str = "unknown";

    pub fn join(&self, other: &AbstractValue) -> AbstractValue {
        match (self, other) {
            (AbstractValue::Interval(a), AbstractValue::Interval(b)) => {
                AbstractValue::Interval(a.join(b))
            }
            (AbstractValue::Symbol(a), AbstractValue::Symbol(b)) if a == b => self.clone(),
            _ => AbstractValue::Symbol(Self::ANY.to_string()),
        }
    }

    pub fn meet(&self, other: &AbstractValue) -> AbstractValue {
        match (self, other) {
            (AbstractValue::Interval(a), AbstractValue::Interval(b)) => {
                AbstractValue::Interval(a.meet(b))
            }
            _ => self.clone(),
        }
    }

    pub fn widen(&self, next: &AbstractValue) -> AbstractValue {
        match (self, next) {
            (AbstractValue::Interval(a), AbstractValue::Interval(b)) => {
                AbstractValue::Interval(a.widen(b))
            }
            _ => self.join(next),
        }
    }

    pub fn narrow(&self, other: &AbstractValue) -> AbstractValue {
        match (self, other) {
            (AbstractValue::Interval(a), AbstractValue::Interval(b)) => {
                AbstractValue::Interval(a.narrow(b))
            }
            _ => self.clone(),
        }
    }

    pub fn as_interval(&self) -> Option<&Interval> {
        match self {
            AbstractValue::Interval(iv) => Some(iv),
            AbstractValue::Symbol(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            AbstractValue::Interval(iv) => iv.to_string(),
            AbstractValue::Symbol(s) => s.clone(),
        }
    }
}

/// Closed sum over the value shapes; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarData {
    Leaf(AbstractValue),
    Array { base: SolType, elems: Vec<Variable>, dynamic: bool },
    Struct { members: IndexMap<String, Variable> },
    Mapping { key: SolType, value: SolType, entries: IndexMap<String, Variable> },
    Enum { enum_name: String, ordinal: Interval },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub scope: Scope,
    pub ty: SolType,
    pub is_constant: bool,
    pub data: VarData,
}

/// Struct and enum definitions a contract declares; composite defaults
/// are built against these.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDefs {
    pub structs: IndexMap<String, StructDef>,
    pub enums: IndexMap<String, EnumDef>,
}

impl TypeDefs {
    pub fn struct_def(&self, name: &str) -> Result<&StructDef> {
        self.structs.get(name).ok_or_else(|| AnalysisError::UnknownStruct(name.to_string()))
    }

    pub fn enum_def(&self, name: &str) -> Result<&EnumDef> {
        self.enums.get(name).ok_or_else(|| AnalysisError::UnknownEnum(name.to_string()))
    }
}

/// Interval kind an elementary type ranges over, when it has one.
pub fn interval_kind_of(ty: &SolType) -> Option<IntervalKind> {
    match ty {
        SolType::Uint(bits) => Some(IntervalKind::Uint { bits: *bits }),
        SolType::Int(bits) => Some(IntervalKind::Int { bits: *bits }),
        SolType::Bool => Some(IntervalKind::Bool),
        SolType::Address => Some(IntervalKind::ADDRESS),
        _ => None,
    }
}

impl Variable {
    /// Default-initialized variable: zero for numerics, `false` for
    /// bools, empty/zeroed composites. Mirrors storage defaults.
    pub fn default_of(
        name: impl Into<String>,
        scope: Scope,
        ty: SolType,
        defs: &TypeDefs,
    ) -> Result<Variable> {
        let name = name.into();
        let data = Self::default_data(&ty, defs)?;
        Ok(Variable { name, scope, ty, is_constant: false, data })
    }

    /// Variable holding the full range of its type; used for parameters
    /// and externally controlled inputs.
    pub fn top_of(
        name: impl Into<String>,
        scope: Scope,
        ty: SolType,
        defs: &TypeDefs,
    ) -> Result<Variable> {
        let name = name.into();
        let data = Self::top_data(&ty, defs)?;
        Ok(Variable { name, scope, ty, is_constant: false, data })
    }

    fn default_data(ty: &SolType, defs: &TypeDefs) -> Result<VarData> {
        Ok(match ty {
            SolType::Uint(_) | SolType::Int(_) | SolType::Bool | SolType::Address => {
                let kind = interval_kind_of(ty).unwrap_or(IntervalKind::UINT256);
                VarData::Leaf(AbstractValue::Interval(Interval::singleton(kind, 0)))
            }
            SolType::Bytes(_) | SolType::String => {
                VarData::Leaf(AbstractValue::Symbol(String::new()))
            }
            SolType::Array { base, len } => {
                let mut elems = Vec::new();
                if let Some(n) = len {
                    for i in 0..*n {
                        elems.push(Variable {
                            name: format!("[{}]", i),
                            scope: Scope::Local,
                            ty: (**base).clone(),
                            is_constant: false,
                            data: Self::default_data(base, defs)?,
                        });
                    }
                }
                VarData::Array { base: (**base).clone(), elems, dynamic: len.is_none() }
            }
            SolType::Mapping { key, value } => VarData::Mapping {
                key: (**key).clone(),
                value: (**value).clone(),
                entries: IndexMap::new(),
            },
            SolType::Struct(sname) => {
                let def = defs.struct_def(sname)?.clone();
                let mut members = IndexMap::new();
                for (fname, fty) in &def.fields {
                    members.insert(
                        fname.clone(),
                        Variable {
                            name: fname.clone(),
                            scope: Scope::Local,
                            ty: fty.clone(),
                            is_constant: false,
                            data: Self::default_data(fty, defs)?,
                        },
                    );
                }
                VarData::Struct { members }
            }
            SolType::Enum(ename) => {
                defs.enum_def(ename)?;
                VarData::Enum {
                    enum_name: ename.clone(),
                    ordinal: Interval::singleton(IntervalKind::Uint { bits: 8 }, 0),
                }
            }
        })
    }

    fn top_data(ty: &SolType, defs: &TypeDefs) -> Result<VarData> {
        Ok(match ty {
            SolType::Uint(_) | SolType::Int(_) | SolType::Bool | SolType::Address => {
                let kind = interval_kind_of(ty).unwrap_or(IntervalKind::UINT256);
                VarData::Leaf(AbstractValue::Interval(Interval::top(kind)))
            }
            SolType::Enum(ename) => {
                let n = defs.enum_def(ename)?.variants.len() as i64;
                VarData::Enum {
                    enum_name: ename.clone(),
                    ordinal: Interval::of_bigints(
                        IntervalKind::Uint { bits: 8 },
                        BigInt::from(0),
                        BigInt::from((n - 1).max(0)),
                    ),
                }
            }
            // Composites and byte strings start from defaults; their
            // contents are refined as entries materialize.
            _ => Self::default_data(ty, defs)?,
        })
    }

    pub fn as_interval(&self) -> Option<&Interval> {
        match &self.data {
            VarData::Leaf(AbstractValue::Interval(iv)) => Some(iv),
            VarData::Enum { ordinal, .. } => Some(ordinal),
            _ => None,
        }
    }

    pub fn set_interval(&mut self, iv: Interval) {
        match &mut self.data {
            VarData::Enum { ordinal, .. } => *ordinal = iv,
            _ => self.data = VarData::Leaf(AbstractValue::Interval(iv)),
        }
    }

    /// Element at a concrete index. Dynamic arrays materialize missing
    /// in-range elements with defaults; static arrays range-check.
    pub fn array_element_mut(&mut self, idx: u64, defs: &TypeDefs) -> Result<&mut Variable> {
        let name = self.name.clone();
        match &mut self.data {
            VarData::Array { base, elems, dynamic } => {
                if idx as usize >= elems.len() {
                    if !*dynamic {
                        return Err(AnalysisError::IndexOutOfRange {
                            name,
                            index: idx,
                            len: elems.len() as u64,
                        });
                    }
                    while elems.len() <= idx as usize {
                        let i = elems.len();
                        elems.push(Variable {
                            name: format!("[{}]", i),
                            scope: Scope::Local,
                            ty: base.clone(),
                            is_constant: false,
                            data: Variable::default_data(base, defs)?,
                        });
                    }
                }
                Ok(&mut elems[idx as usize])
            }
            _ => Err(AnalysisError::NotIndexable(name)),
        }
    }

    /// Mapping entry for a canonical key, materializing the default
    /// value lazily on first touch.
    pub fn mapping_entry_mut(&mut self, key_repr: &str, defs: &TypeDefs) -> Result<&mut Variable> {
        let name = self.name.clone();
        match &mut self.data {
            VarData::Mapping { value, entries, .. } => {
                if !entries.contains_key(key_repr) {
                    let v = Variable {
                        name: format!("[{}]", key_repr),
                        scope: Scope::Local,
                        ty: value.clone(),
                        is_constant: false,
                        data: Variable::default_data(value, defs)?,
                    };
                    entries.insert(key_repr.to_string(), v);
                }
                entries
                    .get_mut(key_repr)
                    .ok_or_else(|| AnalysisError::NotIndexable(name))
            }
            _ => Err(AnalysisError::NotIndexable(name)),
        }
    }

    pub fn struct_member_mut(&mut self, member: &str) -> Result<&mut Variable> {
        let name = self.name.clone();
        match &mut self.data {
            VarData::Struct { members } => members.get_mut(member).ok_or_else(|| {
                AnalysisError::UnknownMember { base: name, member: member.to_string() }
            }),
            _ => Err(AnalysisError::UnknownMember {
                base: name,
                member: member.to_string(),
            }),
        }
    }

    pub fn push_element(&mut self, elem: Variable) -> Result<()> {
        let name = self.name.clone();
        match &mut self.data {
            VarData::Array { elems, dynamic, .. } => {
                if !*dynamic {
                    return Err(AnalysisError::StaticArrayResize(name));
                }
                let mut elem = elem;
                elem.name = format!("[{}]", elems.len());
                elems.push(elem);
                Ok(())
            }
            _ => Err(AnalysisError::StaticArrayResize(name)),
        }
    }

    pub fn pop_element(&mut self) -> Result<()> {
        let name = self.name.clone();
        match &mut self.data {
            VarData::Array { elems, dynamic, .. } => {
                if !*dynamic {
                    return Err(AnalysisError::StaticArrayResize(name));
                }
                elems.pop();
                Ok(())
            }
            _ => Err(AnalysisError::StaticArrayResize(name)),
        }
    }

    /// Resets the variable to its type's default value (`delete x`).
    pub fn reset_default(&mut self, defs: &TypeDefs) -> Result<()> {
        self.data = Self::default_data(&self.ty, defs)?;
        Ok(())
    }

    // --- lattice, recursing through composites ---

    pub fn join(&self, other: &Variable) -> Variable {
        self.combine(other, &CombineOp::Join)
    }

    pub fn meet(&self, other: &Variable) -> Variable {
        self.combine(other, &CombineOp::Meet)
    }

    pub fn widen(&self, next: &Variable) -> Variable {
        self.combine(next, &CombineOp::Widen)
    }

    pub fn narrow(&self, other: &Variable) -> Variable {
        self.combine(other, &CombineOp::Narrow)
    }

    fn combine(&self, other: &Variable, op: &CombineOp) -> Variable {
        let data = match (&self.data, &other.data) {
            (VarData::Leaf(a), VarData::Leaf(b)) => VarData::Leaf(op.leaf(a, b)),
            (
                VarData::Array { base, elems: a, dynamic },
                VarData::Array { elems: b, .. },
            ) => {
                let n = a.len().max(b.len());
                let mut elems = Vec::with_capacity(n);
                for i in 0..n {
                    match (a.get(i), b.get(i)) {
                        (Some(x), Some(y)) => elems.push(x.combine(y, op)),
                        (Some(x), None) => elems.push(x.clone()),
                        (None, Some(y)) => elems.push(y.clone()),
                        (None, None) => unreachable!(),
                    }
                }
                VarData::Array { base: base.clone(), elems, dynamic: *dynamic }
            }
            (VarData::Struct { members: a }, VarData::Struct { members: b }) => {
                let mut members = IndexMap::new();
                for (k, x) in a {
                    match b.get(k) {
                        Some(y) => members.insert(k.clone(), x.combine(y, op)),
                        None => members.insert(k.clone(), x.clone()),
                    };
                }
                for (k, y) in b {
                    if !members.contains_key(k) {
                        members.insert(k.clone(), y.clone());
                    }
                }
                VarData::Struct { members }
            }
            (
                VarData::Mapping { key, value, entries: a },
                VarData::Mapping { entries: b, .. },
            ) => {
                // A key missing on one side keeps the other side's value.
                let mut entries = IndexMap::new();
                for (k, x) in a {
                    match b.get(k) {
                        Some(y) => entries.insert(k.clone(), x.combine(y, op)),
                        None => entries.insert(k.clone(), x.clone()),
                    };
                }
                for (k, y) in b {
                    if !entries.contains_key(k) {
                        entries.insert(k.clone(), y.clone());
                    }
                }
                VarData::Mapping { key: key.clone(), value: value.clone(), entries }
            }
            (
                VarData::Enum { enum_name, ordinal: a },
                VarData::Enum { ordinal: b, .. },
            ) => VarData::Enum {
                enum_name: enum_name.clone(),
                ordinal: op.interval(a, b),
            },
            // Shape mismatch; keep the left side rather than guess.
            _ => self.data.clone(),
        };
        Variable {
            name: self.name.clone(),
            scope: self.scope,
            ty: self.ty.clone(),
            is_constant: self.is_constant && other.is_constant,
            data,
        }
    }

    /// Recursively drops every interval leaf to bottom. Used for the
    /// environments of statically infeasible branches.
    pub fn set_bottom(&mut self) {
        match &mut self.data {
            VarData::Leaf(AbstractValue::Interval(iv)) => *iv = Interval::bottom(iv.kind),
            VarData::Leaf(AbstractValue::Symbol(_)) => {}
            VarData::Array { elems, .. } => elems.iter_mut().for_each(Variable::set_bottom),
            VarData::Struct { members } => {
                members.values_mut().for_each(Variable::set_bottom)
            }
            VarData::Mapping { entries, .. } => {
                entries.values_mut().for_each(Variable::set_bottom)
            }
            VarData::Enum { ordinal, .. } => *ordinal = Interval::bottom(ordinal.kind),
        }
    }

    /// Counts interval leaves and how many of them are bottom; symbol
    /// leaves do not participate in feasibility.
    pub fn bottom_census(&self, total: &mut usize, bottom: &mut usize) {
        match &self.data {
            VarData::Leaf(AbstractValue::Interval(iv)) => {
                *total += 1;
                if iv.is_bottom() {
                    *bottom += 1;
                }
            }
            VarData::Leaf(AbstractValue::Symbol(_)) => {}
            VarData::Array { elems, .. } => {
                for e in elems {
                    e.bottom_census(total, bottom);
                }
            }
            VarData::Struct { members } => {
                for m in members.values() {
                    m.bottom_census(total, bottom);
                }
            }
            VarData::Mapping { entries, .. } => {
                for e in entries.values() {
                    e.bottom_census(total, bottom);
                }
            }
            VarData::Enum { ordinal, .. } => {
                *total += 1;
                if ordinal.is_bottom() {
                    *bottom += 1;
                }
            }
        }
    }

    /// Flattens the variable into `path -> rendered value` entries, the
    /// shape the per-line ledger publishes.
    pub fn flatten_into(&self, prefix: &str, out: &mut BTreeMap<String, String>) {
        match &self.data {
            VarData::Leaf(v) => {
                out.insert(prefix.to_string(), v.render());
            }
            VarData::Array { elems, .. } => {
                for (i, e) in elems.iter().enumerate() {
                    e.flatten_into(&format!("{}[{}]", prefix, i), out);
                }
            }
            VarData::Struct { members } => {
                for (k, m) in members {
                    m.flatten_into(&format!("{}.{}", prefix, k), out);
                }
            }
            VarData::Mapping { entries, .. } => {
                for (k, v) in entries {
                    v.flatten_into(&format!("{}[{}]", prefix, k), out);
                }
            }
            VarData::Enum { ordinal, .. } => {
                out.insert(prefix.to_string(), ordinal.to_string());
            }
        }
    }
}

enum CombineOp {
    Join,
    Meet,
    Widen,
    Narrow,
}

impl CombineOp {
    fn leaf(&self, a: &AbstractValue, b: &AbstractValue) -> AbstractValue {
        match self {
            CombineOp::Join => a.join(b),
            CombineOp::Meet => a.meet(b),
            CombineOp::Widen => a.widen(b),
            CombineOp::Narrow => a.narrow(b),
        }
    }

    fn interval(&self, a: &Interval, b: &Interval) -> Interval {
        match self {
            CombineOp::Join => a.join(b),
            CombineOp::Meet => a.meet(b),
            CombineOp::Widen => a.widen(b),
            CombineOp::Narrow => a.narrow(b),
        }
    }
}

/// Allocator for symbolic address identities. `msg.sender` and
/// `tx.origin` get fixed ids so re-analysis is stable; address-typed
/// parameters get fresh ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressBook {
    next_id: u64,
}

impl AddressBook {
    pub const TX_ORIGIN: u64 = 100;
    pub const MSG_SENDER: u64 = 101;
    const FRESH_BASE: u64 = 1000;

    pub fn fresh(&mut self) -> String {
        let id = Self::FRESH_BASE + self.next_id;
        self.next_id += 1;
        Self::render(id)
    }

    pub fn fixed(id: u64) -> String {
        Self::render(id)
    }

    fn render(id: u64) -> String {
        format!("addr#{}", id)
    }
}
