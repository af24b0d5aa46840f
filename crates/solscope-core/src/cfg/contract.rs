//! Contract-level container: type definitions, state variables, the
//! transaction-global environment and the per-function CFGs.

use indexmap::IndexMap;
use tracing::debug;

use crate::cfg::{builder::integrate_modifier, FnKind, FunctionCfg};
use crate::domain::{
    AbstractValue, AddressBook, Env, Interval, IntervalKind, Scope, TypeDefs, VarData, Variable,
};
use crate::error::{AnalysisError, Result};
use crate::ir::{EnumDef, Expression, SolType, StructDef};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractCfg {
    pub name: String,
    pub defs: TypeDefs,
    /// Storage variables with their declared (or default) values.
    pub state: Env,
    /// `block.*` / `msg.*` / `tx.*` members, keyed by their dotted path.
    pub globals: Env,
    pub functions: IndexMap<String, FunctionCfg>,
    pub addresses: AddressBook,
}

impl ContractCfg {
    pub fn new(name: impl Into<String>) -> Self {
        let mut c = ContractCfg { name: name.into(), ..ContractCfg::default() };
        c.seed_globals();
        c
    }

    /// Transaction globals. Numeric members start at their type's full
    /// range; the two address identities are fixed symbols so repeated
    /// analyses agree on them.
    fn seed_globals(&mut self) {
        let numeric = [
            "block.basefee",
            "block.chainid",
            "block.difficulty",
            "block.gaslimit",
            "block.number",
            "block.timestamp",
            "msg.value",
            "tx.gasprice",
        ];
        for name in numeric {
            self.globals.insert(Variable {
                name: name.to_string(),
                scope: Scope::Global,
                ty: SolType::uint256(),
                is_constant: false,
                data: VarData::Leaf(AbstractValue::Interval(Interval::top(
                    IntervalKind::UINT256,
                ))),
            });
        }
        for (name, id) in [
            ("block.coinbase", 102u64),
            ("msg.sender", AddressBook::MSG_SENDER),
            ("tx.origin", AddressBook::TX_ORIGIN),
        ] {
            self.globals.insert(Variable {
                name: name.to_string(),
                scope: Scope::Global,
                ty: SolType::Address,
                is_constant: false,
                data: VarData::Leaf(AbstractValue::Symbol(AddressBook::fixed(id))),
            });
        }
    }

    pub fn add_struct(&mut self, def: StructDef) {
        self.defs.structs.insert(def.name.clone(), def);
    }

    pub fn add_enum(&mut self, def: EnumDef) {
        self.defs.enums.insert(def.name.clone(), def);
    }

    /// Declares a storage variable, optionally with a constant initial
    /// interval (initializer expressions are folded by the caller).
    pub fn add_state_var(
        &mut self,
        name: impl Into<String>,
        ty: SolType,
        init: Option<Interval>,
        is_constant: bool,
    ) -> Result<()> {
        let name = name.into();
        let mut var = Variable::default_of(name.clone(), Scope::State, ty, &self.defs)?;
        var.is_constant = is_constant;
        if let Some(iv) = init {
            var.set_interval(iv);
        }
        self.state.insert(var);
        debug!(var = %name, "declared state variable");
        Ok(())
    }

    /// Creates a function CFG with its entry environment: state
    /// variables, globals, parameters at their type's full range and
    /// named returns at their defaults.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        kind: FnKind,
        params: Vec<(String, SolType)>,
        returns: Vec<(Option<String>, SolType)>,
        decl_line: u32,
    ) -> Result<&mut FunctionCfg> {
        let name = name.into();
        let mut f = FunctionCfg::new(name.clone(), kind);
        f.decl_line = decl_line;

        let mut related = Env::new();
        related.overlay(&self.state);
        related.overlay(&self.globals);
        for (pname, pty) in &params {
            let mut var = Variable::top_of(pname.clone(), Scope::Local, pty.clone(), &self.defs)?;
            if *pty == SolType::Address {
                var.data = VarData::Leaf(AbstractValue::Symbol(self.addresses.fresh()));
            }
            related.insert(var);
        }
        for (rname, rty) in &returns {
            if let Some(rname) = rname {
                related.insert(Variable::default_of(
                    rname.clone(),
                    Scope::Local,
                    rty.clone(),
                    &self.defs,
                )?);
            }
        }
        f.params = params;
        f.returns = returns;
        f.related = related;

        self.functions.insert(name.clone(), f);
        self.functions
            .get_mut(&name)
            .ok_or(AnalysisError::UnknownFunction(name))
    }

    pub fn function(&self, name: &str) -> Result<&FunctionCfg> {
        self.functions
            .get(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_string()))
    }

    pub fn function_mut(&mut self, name: &str) -> Result<&mut FunctionCfg> {
        self.functions
            .get_mut(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_string()))
    }

    /// Wraps a function's body in its declared modifiers, innermost
    /// last, and refreshes the entry environment with the modifiers'
    /// own related variables.
    pub fn apply_modifiers(&mut self, fn_name: &str) -> Result<()> {
        let modifier_names = self.function(fn_name)?.modifiers.clone();
        for mname in modifier_names.iter().rev() {
            let modifier = self
                .functions
                .get(mname)
                .ok_or_else(|| AnalysisError::UnknownFunction(mname.clone()))?
                .clone();
            let f = self.function_mut(fn_name)?;
            integrate_modifier(f, &modifier)?;
            let extra = modifier.related.clone();
            f.related.overlay(&extra);
            debug!(function = fn_name, modifier = %mname, "integrated modifier");
        }
        Ok(())
    }

    /// True when `expr` names something the analysis must never mutate
    /// while refining a branch: literals, constants, globals, `.length`.
    pub fn is_read_only_expr(&self, expr: &Expression) -> bool {
        match expr {
            Expression::Number(_)
            | Expression::BoolLit(_)
            | Expression::StringLit(_)
            | Expression::HexLit(_)
            | Expression::TypeRef(_) => true,
            Expression::Ident(name) => self
                .state
                .get(name)
                .map(|v| v.is_constant)
                .unwrap_or(false),
            Expression::Member { base, member } => {
                if member == "length" {
                    return true;
                }
                if let Expression::Ident(root) = base.as_ref() {
                    if self.globals.contains(&format!("{}.{}", root, member)) {
                        return true;
                    }
                }
                self.is_read_only_expr(base)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_seeded() {
        let c = ContractCfg::new("C");
        let sender = c.globals.get("msg.sender").unwrap();
        assert_eq!(
            sender.data,
            VarData::Leaf(AbstractValue::Symbol("addr#101".into()))
        );
        let ts = c.globals.get("block.timestamp").unwrap();
        assert!(ts.as_interval().unwrap().is_top());
    }

    #[test]
    fn test_function_entry_env() {
        let mut c = ContractCfg::new("C");
        c.add_state_var("total", SolType::uint256(), None, false).unwrap();
        c.add_function(
            "deposit",
            FnKind::Function,
            vec![("amount".into(), SolType::uint256())],
            vec![(Some("out".into()), SolType::uint256())],
            1,
        )
        .unwrap();
        let f = c.function("deposit").unwrap();
        assert!(f.related.get("total").is_some());
        assert!(f.related.get("msg.sender").is_some());
        assert!(f.related.get("amount").unwrap().as_interval().unwrap().is_top());
        assert_eq!(
            f.related.get("out").unwrap().as_interval().unwrap().as_singleton(),
            Some(0.into())
        );
    }

    #[test]
    fn test_address_params_get_fresh_symbols() {
        let mut c = ContractCfg::new("C");
        c.add_function(
            "f",
            FnKind::Function,
            vec![("a".into(), SolType::Address), ("b".into(), SolType::Address)],
            vec![],
            1,
        )
        .unwrap();
        let f = c.function("f").unwrap();
        assert_ne!(f.related.get("a").unwrap().data, f.related.get("b").unwrap().data);
    }

    #[test]
    fn test_read_only_expressions() {
        let mut c = ContractCfg::new("C");
        c.add_state_var("LIMIT", SolType::uint256(), Some(Interval::singleton(IntervalKind::UINT256, 100)), true)
            .unwrap();
        c.add_state_var("total", SolType::uint256(), None, false).unwrap();
        assert!(c.is_read_only_expr(&Expression::num(5)));
        assert!(c.is_read_only_expr(&Expression::ident("LIMIT")));
        assert!(!c.is_read_only_expr(&Expression::ident("total")));
        assert!(c.is_read_only_expr(&Expression::member(Expression::ident("msg"), "sender")));
        assert!(c.is_read_only_expr(&Expression::member(Expression::ident("arr"), "length")));
    }
}
