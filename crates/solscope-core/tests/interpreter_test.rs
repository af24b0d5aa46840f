//! End-to-end interpretation tests: whole functions built through the
//! CFG builder, interpreted once, checked through the ledger.

use solscope_core::cfg::{Builder, ContractCfg, FnKind};
use solscope_core::ir::{AssignOp, BinOp, Expression as E, SolType, Statement, StructDef, UnOp};
use solscope_core::{Engine, Record, RecordKind};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn record_of(records: &[Record], kind: RecordKind) -> &Record {
    records
        .iter()
        .find(|r| r.kind == kind)
        .unwrap_or_else(|| panic!("no {:?} record in {:?}", kind, records))
}

#[test]
fn test_guarded_transfer_bounds_state() {
    init_tracing();
    let mut c = ContractCfg::new("Token");
    c.add_state_var("total", SolType::uint256(), None, false).unwrap();
    c.add_state_var(
        "balances",
        SolType::mapping(SolType::Address, SolType::uint256()),
        None,
        false,
    )
    .unwrap();
    c.add_function(
        "transfer",
        FnKind::Function,
        vec![("to".into(), SolType::Address), ("amount".into(), SolType::uint256())],
        vec![],
        1,
    )
    .unwrap();
    {
        let f = c.function_mut("transfer").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.add_require(&mut ctx, E::binary(BinOp::Le, E::ident("amount"), E::num(1000)), 2);
        b.assign(&ctx, E::ident("total"), AssignOp::Add, E::ident("amount"), 3);
        b.assign(
            &ctx,
            E::index(E::ident("balances"), E::ident("to")),
            AssignOp::Assign,
            E::ident("amount"),
            4,
        );
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("transfer").unwrap();

    let req = record_of(engine.ledger.get(2), RecordKind::RequireTrue);
    assert_eq!(req.vars["amount"], "[0,1000]");
    let total = record_of(engine.ledger.get(3), RecordKind::Assignment);
    assert_eq!(total.vars["total"], "[0,1000]");
    // The mapping write lands under the parameter's address symbol.
    let slot = record_of(engine.ledger.get(4), RecordKind::Assignment);
    let (key, value) = slot.vars.iter().next().unwrap();
    assert!(key.starts_with("balances[addr#"), "got key {key}");
    assert_eq!(value, "[0,1000]");
}

#[test]
fn test_for_loop_counter_exits_at_bound() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_state_var("s", SolType::uint256(), None, false).unwrap();
    c.add_function("f", FnKind::Function, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.begin_for(
            &mut ctx,
            Some(Statement::VarDecl {
                ty: SolType::Uint(8),
                name: "i".into(),
                init: Some(E::num(0)),
                line: 2,
            }),
            E::binary(BinOp::Lt, E::ident("i"), E::num(5)),
            Some(Statement::UnaryStmt { op: UnOp::Inc, target: E::ident("i"), line: 2 }),
            2,
        );
        b.assign(&ctx, E::ident("s"), AssignOp::Add, E::num(2), 3);
        b.finish_loop(&mut ctx).unwrap();
        b.assign(&ctx, E::ident("s"), AssignOp::Assign, E::ident("i"), 4);
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();

    // Inside the body the counter is refined below the bound.
    let branch = record_of(engine.ledger.get(2), RecordKind::BranchTrue);
    assert_eq!(branch.vars["i"], "[0,4]");
    // The false edge pins the counter to exactly the bound.
    let after = record_of(engine.ledger.get(4), RecordKind::Assignment);
    assert_eq!(after.vars["s"], "[5,5]");
}

#[test]
fn test_nested_while_loops() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_state_var("x", SolType::Uint(8), None, false).unwrap();
    c.add_function("f", FnKind::Function, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.declare(&ctx, SolType::Uint(8), "i", Some(E::num(0)), 2);
        b.begin_while(&mut ctx, E::binary(BinOp::Lt, E::ident("i"), E::num(3)), 3);
        b.declare(&ctx, SolType::Uint(8), "j", Some(E::num(0)), 4);
        b.begin_while(&mut ctx, E::binary(BinOp::Lt, E::ident("j"), E::num(4)), 5);
        b.assign(&ctx, E::ident("j"), AssignOp::Add, E::num(1), 6);
        b.finish_loop(&mut ctx).unwrap();
        b.assign(&ctx, E::ident("i"), AssignOp::Add, E::num(1), 7);
        b.finish_loop(&mut ctx).unwrap();
        b.assign(&ctx, E::ident("x"), AssignOp::Assign, E::ident("i"), 8);
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();

    // Inner loop exits with j == 4 before the outer increment runs.
    let inc = record_of(engine.ledger.get(7), RecordKind::Assignment);
    assert_eq!(inc.vars["i"], "[1,3]");
    let after = record_of(engine.ledger.get(8), RecordKind::Assignment);
    assert_eq!(after.vars["x"], "[3,3]");
    // Both loop heads publish a delta for their counters.
    assert!(record_of(engine.ledger.get(3), RecordKind::LoopDelta).vars.contains_key("i"));
    assert!(record_of(engine.ledger.get(5), RecordKind::LoopDelta).vars.contains_key("j"));
}

#[test]
fn test_do_while_runs_at_least_once() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_state_var("y", SolType::Uint(8), None, false).unwrap();
    c.add_function("f", FnKind::Function, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.declare(&ctx, SolType::Uint(8), "i", Some(E::num(0)), 2);
        b.begin_do_while(&mut ctx);
        b.assign(&ctx, E::ident("i"), AssignOp::Add, E::num(1), 3);
        b.finish_do_while(&mut ctx, E::binary(BinOp::Lt, E::ident("i"), E::num(3)), 4).unwrap();
        b.assign(&ctx, E::ident("y"), AssignOp::Assign, E::ident("i"), 5);
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();

    let after = record_of(engine.ledger.get(5), RecordKind::Assignment);
    assert_eq!(after.vars["y"], "[3,3]");
}

#[test]
fn test_modifier_guard_refines_function_body() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_state_var("x", SolType::Uint(8), None, false).unwrap();
    c.add_state_var("y", SolType::Uint(8), None, false).unwrap();
    c.add_function("positive", FnKind::Modifier, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("positive").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.add_require(&mut ctx, E::binary(BinOp::Gt, E::ident("x"), E::num(0)), 2);
        b.placeholder(&mut ctx, 3);
    }
    c.add_function("f", FnKind::Function, vec![], vec![], 10).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, ctx) = Builder::new(f).unwrap();
        b.assign(&ctx, E::ident("y"), AssignOp::Assign, E::ident("x"), 11);
    }
    c.function_mut("f").unwrap().modifiers = vec!["positive".into()];
    c.apply_modifiers("f").unwrap();

    // State variables start at their type's full range; the modifier's
    // guard carves zero off before the body runs.
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();
    let req = record_of(engine.ledger.get(2), RecordKind::RequireTrue);
    assert_eq!(req.vars["x"], "[1,255]");
    let body = record_of(engine.ledger.get(11), RecordKind::Assignment);
    assert_eq!(body.vars["y"], "[1,255]");
}

#[test]
fn test_internal_call_result_flows_into_declaration() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_function(
        "double",
        FnKind::Function,
        vec![("v".into(), SolType::Uint(8))],
        vec![(None, SolType::Uint(8))],
        1,
    )
    .unwrap();
    {
        let f = c.function_mut("double").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.ret(&mut ctx, Some(E::binary(BinOp::Mul, E::ident("v"), E::num(2))), 2);
    }
    c.add_function("f", FnKind::Function, vec![], vec![], 10).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, ctx) = Builder::new(f).unwrap();
        b.declare(
            &ctx,
            SolType::Uint(8),
            "a",
            Some(E::call(E::ident("double"), vec![E::num(3)])),
            11,
        );
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();
    let decl = record_of(engine.ledger.get(11), RecordKind::Declaration);
    assert_eq!(decl.vars["a"], "[6,6]");
}

#[test]
fn test_struct_member_and_array_push() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_struct(StructDef {
        name: "Point".into(),
        fields: vec![("x".into(), SolType::Uint(8)), ("y".into(), SolType::Uint(8))],
    });
    c.add_state_var("p", SolType::Struct("Point".into()), None, false).unwrap();
    c.add_state_var("arr", SolType::dynamic_array(SolType::Uint(8)), None, false).unwrap();
    c.add_function("f", FnKind::Function, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, ctx) = Builder::new(f).unwrap();
        b.assign(&ctx, E::member(E::ident("p"), "x"), AssignOp::Assign, E::num(5), 2);
        b.expr_stmt(&ctx, E::call(E::member(E::ident("arr"), "push"), vec![E::num(7)]), 3);
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();

    let member = record_of(engine.ledger.get(2), RecordKind::Assignment);
    assert_eq!(member.vars["p.x"], "[5,5]");
    let push = record_of(engine.ledger.get(3), RecordKind::Assignment);
    assert_eq!(push.vars["arr[0]"], "[7,7]");
}

#[test]
fn test_implicit_return_of_named_value() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_function(
        "f",
        FnKind::Function,
        vec![],
        vec![(Some("out".into()), SolType::Uint(8))],
        1,
    )
    .unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, ctx) = Builder::new(f).unwrap();
        b.assign(&ctx, E::ident("out"), AssignOp::Assign, E::num(9), 2);
    }
    let mut engine = Engine::new(&mut c);
    let ret = engine.interpret_function("f").unwrap();
    assert_eq!(ret.as_interval().unwrap().as_singleton(), Some(9.into()));
    // Falling off the end records the named return at the declaration.
    let rec = record_of(engine.ledger.get(1), RecordKind::ImplicitReturn);
    assert_eq!(rec.vars["out"], "[9,9]");
}

#[test]
fn test_break_leaves_loop_with_partial_range() {
    init_tracing();
    let mut c = ContractCfg::new("C");
    c.add_state_var("y", SolType::Uint(8), None, false).unwrap();
    c.add_function("f", FnKind::Function, vec![], vec![], 1).unwrap();
    {
        let f = c.function_mut("f").unwrap();
        let (mut b, mut ctx) = Builder::new(f).unwrap();
        b.declare(&ctx, SolType::Uint(8), "i", Some(E::num(0)), 2);
        b.begin_while(&mut ctx, E::binary(BinOp::Lt, E::ident("i"), E::num(100)), 3);
        b.begin_if(&mut ctx, E::binary(BinOp::Eq, E::ident("i"), E::num(10)), 4);
        b.brk(&mut ctx, 5).unwrap();
        b.finish_if(&mut ctx).unwrap();
        b.assign(&ctx, E::ident("i"), AssignOp::Add, E::num(1), 6);
        b.finish_loop(&mut ctx).unwrap();
        b.assign(&ctx, E::ident("y"), AssignOp::Assign, E::ident("i"), 7);
    }
    let mut engine = Engine::new(&mut c);
    engine.interpret_function("f").unwrap();

    // Exit joins the break edge (i == 10) with the condition's false
    // edge (i == 100).
    let after = record_of(engine.ledger.get(7), RecordKind::Assignment);
    assert_eq!(after.vars["y"], "[10,100]");
}
