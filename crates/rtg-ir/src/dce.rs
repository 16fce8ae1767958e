//! Dead-function elimination.
//!
//! Reachability starts at `main.main` plus every package `init` and
//! synthetic `init$globals` function. `CALL` names add edges directly; an
//! `IFACE_CALL` adds every concrete method implementing the named interface
//! method, because the backend's dispatch chain calls each of them. Runs
//! before code generation so backends never emit unreferenced symbols.

use crate::module::IrModule;
use crate::op::Op;
use rustc_hash::FxHashSet;

fn is_root(name: &str) -> bool {
    name == "main.main" || name.ends_with(".init") || name.ends_with(".init$globals")
}

/// Remove unreachable functions in place, preserving the order of the
/// survivors. Returns the number of functions removed.
pub fn eliminate_dead_funcs(module: &mut IrModule) -> usize {
    let mut reachable: FxHashSet<String> = FxHashSet::default();
    let mut worklist: Vec<String> = module
        .funcs
        .iter()
        .filter(|f| is_root(&f.name))
        .map(|f| f.name.clone())
        .collect();

    while let Some(name) = worklist.pop() {
        if !reachable.insert(name.clone()) {
            continue;
        }
        let func = match module.func(&name) {
            Some(f) => f,
            None => continue,
        };
        for inst in &func.code {
            match inst.op {
                Op::Call => {
                    if module.has_func(&inst.name) && !reachable.contains(&inst.name) {
                        worklist.push(inst.name.clone());
                    }
                    // Composite constructors expand into runtime.Alloc in
                    // the backend.
                    if inst.name.starts_with(crate::BUILTIN_COMPOSITE_PREFIX)
                        && module.has_func("runtime.Alloc")
                        && !reachable.contains("runtime.Alloc")
                    {
                        worklist.push("runtime.Alloc".to_string());
                    }
                }
                Op::IfaceBox => {
                    if module.has_func("runtime.Alloc") && !reachable.contains("runtime.Alloc") {
                        worklist.push("runtime.Alloc".to_string());
                    }
                }
                Op::IfaceCall => {
                    let method = inst.name.rsplit('.').next().unwrap_or("");
                    for (_, target) in module.iface_impls(method) {
                        if module.has_func(&target) && !reachable.contains(&target) {
                            worklist.push(target);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let before = module.funcs.len();
    module.funcs.retain(|f| reachable.contains(&f.name));
    module.reindex();
    before - module.funcs.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Inst, IrFunc};

    fn func(name: &str, calls: &[&str]) -> IrFunc {
        IrFunc {
            name: name.to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: calls
                .iter()
                .map(|c| Inst::with_name(Op::Call, *c, 0))
                .chain(std::iter::once(Inst::new(Op::Return)))
                .collect(),
        }
    }

    #[test]
    fn test_unreachable_functions_removed() {
        let mut m = IrModule::new();
        m.add_func(func("main.main", &["main.used"]));
        m.add_func(func("main.used", &[]));
        m.add_func(func("main.dead", &["main.also_dead"]));
        m.add_func(func("main.also_dead", &[]));
        let removed = eliminate_dead_funcs(&mut m);
        assert_eq!(removed, 2);
        assert!(m.has_func("main.main"));
        assert!(m.has_func("main.used"));
        assert!(!m.has_func("main.dead"));
    }

    #[test]
    fn test_init_functions_are_roots() {
        let mut m = IrModule::new();
        m.add_func(func("main.main", &[]));
        m.add_func(func("fmt.init$globals", &["fmt.helper"]));
        m.add_func(func("fmt.helper", &[]));
        m.add_func(func("fmt.unused", &[]));
        eliminate_dead_funcs(&mut m);
        assert!(m.has_func("fmt.init$globals"));
        assert!(m.has_func("fmt.helper"));
        assert!(!m.has_func("fmt.unused"));
    }

    #[test]
    fn test_iface_targets_kept() {
        let mut m = IrModule::new();
        m.type_id("main.Circle");
        m.add_method("main.Circle.Area", "main.Circle.Area");
        let mut main = func("main.main", &[]);
        main.code.insert(
            0,
            Inst::with_name(Op::IfaceCall, "main.Shape.Area", 0),
        );
        main.code.insert(0, Inst::with_val(Op::ConstI64, 0));
        main.code.insert(2, Inst::new(Op::Drop));
        m.add_func(main);
        m.add_func(func("main.Circle.Area", &[]));
        eliminate_dead_funcs(&mut m);
        assert!(m.has_func("main.Circle.Area"));
    }

    #[test]
    fn test_recursion_terminates() {
        let mut m = IrModule::new();
        m.add_func(func("main.main", &["main.a"]));
        m.add_func(func("main.a", &["main.b"]));
        m.add_func(func("main.b", &["main.a"]));
        let removed = eliminate_dead_funcs(&mut m);
        assert_eq!(removed, 0);
    }
}
