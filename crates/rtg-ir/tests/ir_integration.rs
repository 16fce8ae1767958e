//! Module-level IR tests: text round-trip, verification, and
//! dead-function elimination working together.

use rtg_ir::{
    eliminate_dead_funcs, emit_text, parse_text, verify_module, Inst, IrFunc, IrModule, Op,
};

fn func(name: &str, params: usize, returns: usize, code: Vec<Inst>) -> IrFunc {
    IrFunc {
        name: name.to_string(),
        params,
        returns,
        locals: Vec::new(),
        variadic: None,
        code,
    }
}

fn sample() -> IrModule {
    let mut m = IrModule::new();
    m.add_global("main.counter");
    m.add_func(func(
        "main.init$globals",
        0,
        0,
        vec![
            Inst::with_val(Op::ConstI64, 7),
            Inst::with_arg(Op::GlobalSet, 0),
            Inst::new(Op::Return),
        ],
    ));
    m.add_func(func(
        "main.double",
        1,
        1,
        vec![
            Inst::with_arg(Op::LocalSet, 0),
            Inst::with_arg(Op::LocalGet, 0),
            Inst::with_arg(Op::LocalGet, 0),
            Inst::new(Op::Add),
            Inst::with_arg(Op::Return, 1),
        ],
    ));
    m.funcs.last_mut().unwrap().locals.push(rtg_ir::IrLocal {
        name: "x".to_string(),
        wide: false,
        width: 0,
    });
    m.add_func(func(
        "main.main",
        0,
        0,
        vec![
            Inst::with_arg(Op::GlobalGet, 0),
            Inst::with_name(Op::Call, "main.double", 1),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ],
    ));
    m.add_func(func("main.unused", 0, 0, vec![Inst::new(Op::Return)]));
    m
}

#[test]
fn test_verify_then_roundtrip_then_verify() {
    let module = sample();
    verify_module(&module).expect("fresh module verifies");
    let text = emit_text(&module);
    let parsed = parse_text(&text).expect("parse back");
    verify_module(&parsed).expect("parsed module verifies");
    assert_eq!(emit_text(&parsed), text);
}

#[test]
fn test_dce_survives_roundtrip() {
    let mut module = sample();
    let removed = eliminate_dead_funcs(&mut module);
    assert_eq!(removed, 1);
    assert!(!module.has_func("main.unused"));
    let parsed = parse_text(&emit_text(&module)).expect("parse back");
    assert!(parsed.func("main.double").is_some());
    verify_module(&parsed).expect("pruned module verifies");
}

#[test]
fn test_parsed_module_resolves_calls() {
    let parsed = parse_text(&emit_text(&sample())).unwrap();
    assert_eq!(parsed.ret_count("main.double"), 1);
    assert_eq!(parsed.globals.len(), 1);
    assert_eq!(parsed.globals[0].name, "main.counter");
}
