//! IR module verification.
//!
//! Checks the structural invariants every compiled function must satisfy:
//! label integrity, operand-stack depth consistency (including agreement at
//! merge points), call resolution, and interface box/call validity. The
//! compiler runs this after lowering; it is also the test harness for the
//! module-level properties.

use crate::module::{IrFunc, IrModule};
use crate::op::{stack_effect, Op};
use crate::{BUILTIN_COMPOSITE_PREFIX, RUNTIME_PREFIX};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Verification errors.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A label id defined more than once in one function.
    #[error("{func}: duplicate label {label}")]
    DuplicateLabel {
        /// Function name.
        func: String,
        /// Label id.
        label: i64,
    },

    /// A jump referencing a label with no definition.
    #[error("{func}: jump to undefined label {label}")]
    UndefinedLabel {
        /// Function name.
        func: String,
        /// Label id.
        label: i64,
    },

    /// An instruction would pop more values than the stack holds.
    #[error("{func}: stack underflow at instruction {at}")]
    StackUnderflow {
        /// Function name.
        func: String,
        /// Instruction index.
        at: usize,
    },

    /// Two incoming edges disagree about the depth at a label.
    #[error("{func}: depth mismatch at label {label}: {a} vs {b}")]
    DepthMismatch {
        /// Function name.
        func: String,
        /// Label id.
        label: i64,
        /// Depth from one edge.
        a: i64,
        /// Depth from the other edge.
        b: i64,
    },

    /// Depth at a `RETURN` differs from the declared return arity.
    #[error("{func}: return depth {found}, declared arity {expected}")]
    ReturnDepth {
        /// Function name.
        func: String,
        /// Declared arity.
        expected: i64,
        /// Observed depth.
        found: i64,
    },

    /// A call to a symbol that is neither a module function nor a permitted
    /// builtin prefix.
    #[error("{func}: unresolved call {name}")]
    UnresolvedCall {
        /// Function name.
        func: String,
        /// Called symbol.
        name: String,
    },

    /// An `IFACE_BOX` with a type id outside the assigned range.
    #[error("{func}: interface box with invalid type id {id}")]
    BadTypeId {
        /// Function name.
        func: String,
        /// Offending id.
        id: i64,
    },

    /// An `IFACE_CALL` whose method has no concrete implementation.
    #[error("{func}: interface call {name} has no method-table entry")]
    NoIfaceImpl {
        /// Function name.
        func: String,
        /// Dispatch key.
        name: String,
    },
}

/// Verify one module. Stops at the first violated invariant.
pub fn verify_module(module: &IrModule) -> Result<(), VerifyError> {
    for func in &module.funcs {
        verify_func(module, func)?;
    }
    Ok(())
}

fn verify_func(module: &IrModule, func: &IrFunc) -> Result<(), VerifyError> {
    verify_labels(func)?;
    verify_depths(module, func)?;
    verify_refs(module, func)?;
    Ok(())
}

fn verify_labels(func: &IrFunc) -> Result<(), VerifyError> {
    let mut defined: FxHashMap<i64, ()> = FxHashMap::default();
    for inst in &func.code {
        if inst.op == Op::Label && defined.insert(inst.arg, ()).is_some() {
            return Err(VerifyError::DuplicateLabel {
                func: func.name.clone(),
                label: inst.arg,
            });
        }
    }
    for inst in &func.code {
        if inst.op.is_jump() && !defined.contains_key(&inst.arg) {
            return Err(VerifyError::UndefinedLabel {
                func: func.name.clone(),
                label: inst.arg,
            });
        }
    }
    Ok(())
}

/// Abstract interpretation of the operand-stack depth.
///
/// Entry depth is the parameter count (the caller pushed the arguments; the
/// function's leading `LOCAL_SET`s move them to slots). Depth flows across
/// jumps into a per-label table; the walk iterates until the table is
/// stable so back-edge depths are checked too. Edges falling out of
/// `RETURN` / `PANIC` carry no depth.
fn verify_depths(module: &IrModule, func: &IrFunc) -> Result<(), VerifyError> {
    let mut label_depth: FxHashMap<i64, i64> = FxHashMap::default();
    let ret_of = |name: &str| module.ret_count(name);

    loop {
        let mut changed = false;
        let mut cur: Option<i64> = Some(func.params as i64);

        let mut merge = |label: i64,
                         depth: i64,
                         table: &mut FxHashMap<i64, i64>,
                         changed: &mut bool|
         -> Result<(), VerifyError> {
            match table.get(&label) {
                Some(&d) if d != depth => Err(VerifyError::DepthMismatch {
                    func: func.name.clone(),
                    label,
                    a: d,
                    b: depth,
                }),
                Some(_) => Ok(()),
                None => {
                    table.insert(label, depth);
                    *changed = true;
                    Ok(())
                }
            }
        };

        for (at, inst) in func.code.iter().enumerate() {
            match inst.op {
                Op::Label => {
                    if let Some(c) = cur {
                        merge(inst.arg, c, &mut label_depth, &mut changed)?;
                    }
                    // A dead position becomes live again if some edge
                    // reaches this label.
                    cur = label_depth.get(&inst.arg).copied().or(cur);
                }
                Op::Jmp => {
                    if let Some(c) = cur {
                        merge(inst.arg, c, &mut label_depth, &mut changed)?;
                    }
                    cur = None;
                }
                Op::JmpIf | Op::JmpIfNot => {
                    if let Some(c) = cur {
                        if c < 1 {
                            return Err(VerifyError::StackUnderflow {
                                func: func.name.clone(),
                                at,
                            });
                        }
                        merge(inst.arg, c - 1, &mut label_depth, &mut changed)?;
                        cur = Some(c - 1);
                    }
                }
                Op::Return => {
                    if let Some(c) = cur {
                        if c != func.returns as i64 {
                            return Err(VerifyError::ReturnDepth {
                                func: func.name.clone(),
                                expected: func.returns as i64,
                                found: c,
                            });
                        }
                    }
                    cur = None;
                }
                Op::Panic => {
                    if let Some(c) = cur {
                        if c < 1 {
                            return Err(VerifyError::StackUnderflow {
                                func: func.name.clone(),
                                at,
                            });
                        }
                    }
                    cur = None;
                }
                _ => {
                    if let Some(c) = cur {
                        let (pops, pushes) = stack_effect(inst, &ret_of);
                        if c < pops as i64 {
                            return Err(VerifyError::StackUnderflow {
                                func: func.name.clone(),
                                at,
                            });
                        }
                        cur = Some(c - pops as i64 + pushes as i64);
                    }
                }
            }
        }

        if !changed {
            return Ok(());
        }
    }
}

fn verify_refs(module: &IrModule, func: &IrFunc) -> Result<(), VerifyError> {
    let max_id = module.max_type_id();
    for inst in &func.code {
        match inst.op {
            Op::Call => {
                let name = inst.name.as_str();
                if !module.has_func(name)
                    && !name.starts_with(BUILTIN_COMPOSITE_PREFIX)
                    && !name.starts_with(RUNTIME_PREFIX)
                {
                    return Err(VerifyError::UnresolvedCall {
                        func: func.name.clone(),
                        name: name.to_string(),
                    });
                }
            }
            Op::IfaceBox => {
                if inst.arg < 1 || inst.arg > max_id {
                    return Err(VerifyError::BadTypeId {
                        func: func.name.clone(),
                        id: inst.arg,
                    });
                }
            }
            Op::IfaceCall => {
                let method = inst.name.rsplit('.').next().unwrap_or("");
                if module.iface_impls(method).is_empty() {
                    return Err(VerifyError::NoIfaceImpl {
                        func: func.name.clone(),
                        name: inst.name.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Inst, IrFunc, IrModule};

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

    #[test]
    fn test_balanced_function_passes() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.main",
            0,
            0,
            vec![
                Inst::with_val(Op::ConstI64, 1),
                Inst::with_val(Op::ConstI64, 2),
                Inst::new(Op::Add),
                Inst::new(Op::Drop),
                Inst::new(Op::Return),
            ],
        ));
        assert!(verify_module(&m).is_ok());
    }

    #[test]
    fn test_params_start_on_stack() {
        let mut m = IrModule::new();
        // fn(a, b) int: leading LOCAL_SETs bind parameters, body returns one.
        m.add_func(func(
            "main.add",
            2,
            1,
            vec![
                Inst::with_arg(Op::LocalSet, 1),
                Inst::with_arg(Op::LocalSet, 0),
                Inst::with_arg(Op::LocalGet, 0),
                Inst::with_arg(Op::LocalGet, 1),
                Inst::new(Op::Add),
                Inst::with_arg(Op::Return, 1),
            ],
        ));
        assert!(verify_module(&m).is_ok());
    }

    #[test]
    fn test_underflow_detected() {
        let mut m = IrModule::new();
        m.add_func(func("main.bad", 0, 0, vec![Inst::new(Op::Add)]));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::StackUnderflow { .. })
        ));
    }

    #[test]
    fn test_duplicate_label_detected() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.bad",
            0,
            0,
            vec![
                Inst::with_arg(Op::Label, 1),
                Inst::with_arg(Op::Label, 1),
                Inst::new(Op::Return),
            ],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::DuplicateLabel { label: 1, .. })
        ));
    }

    #[test]
    fn test_undefined_label_detected() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.bad",
            0,
            0,
            vec![Inst::with_arg(Op::Jmp, 9), Inst::new(Op::Return)],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::UndefinedLabel { label: 9, .. })
        ));
    }

    #[test]
    fn test_merge_depth_mismatch_detected() {
        let mut m = IrModule::new();
        // One edge reaches label 1 with depth 1, the other with depth 0.
        m.add_func(func(
            "main.bad",
            0,
            0,
            vec![
                Inst::with_val(Op::ConstI64, 1),
                Inst::with_arg(Op::JmpIf, 1),
                Inst::with_val(Op::ConstI64, 7),
                Inst::with_arg(Op::Label, 1),
                Inst::new(Op::Return),
            ],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::DepthMismatch { label: 1, .. })
        ));
    }

    #[test]
    fn test_return_edges_excluded_from_merge() {
        let mut m = IrModule::new();
        // The RETURN arm leaves a value; that edge must not poison the
        // depth at label 2.
        m.add_func(func(
            "main.ok",
            0,
            1,
            vec![
                Inst::with_val(Op::ConstI64, 1),
                Inst::with_arg(Op::JmpIfNot, 1),
                Inst::with_val(Op::ConstI64, 10),
                Inst::with_arg(Op::Return, 1),
                Inst::with_arg(Op::Label, 1),
                Inst::with_val(Op::ConstI64, 20),
                Inst::with_arg(Op::Return, 1),
            ],
        ));
        assert!(verify_module(&m).is_ok());
    }

    #[test]
    fn test_return_arity_checked() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.bad",
            0,
            1,
            vec![Inst::with_arg(Op::Return, 0)],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::ReturnDepth { .. })
        ));
    }

    #[test]
    fn test_unresolved_call_detected() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.main",
            0,
            0,
            vec![
                Inst::with_name(Op::Call, "main.ghost", 0),
                Inst::new(Op::Drop),
                Inst::new(Op::Return),
            ],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::UnresolvedCall { .. })
        ));
    }

    #[test]
    fn test_builtin_prefixes_allowed() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.main",
            0,
            0,
            vec![
                Inst::with_val(Op::ConstI64, 16),
                Inst::with_name(Op::Call, "runtime.Alloc", 1),
                Inst::new(Op::Drop),
                Inst::new(Op::Return),
            ],
        ));
        assert!(verify_module(&m).is_ok());
    }

    #[test]
    fn test_iface_box_id_range() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.main",
            0,
            0,
            vec![
                Inst::with_val(Op::ConstI64, 5),
                Inst::with_arg(Op::IfaceBox, 7),
                Inst::new(Op::Drop),
                Inst::new(Op::Return),
            ],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::BadTypeId { id: 7, .. })
        ));
    }

    #[test]
    fn test_iface_call_needs_impl() {
        let mut m = IrModule::new();
        m.add_func(func(
            "main.main",
            0,
            0,
            vec![
                Inst::with_val(Op::ConstI64, 0),
                Inst::with_name(Op::IfaceCall, "main.Shape.Area", 0),
                Inst::new(Op::Drop),
                Inst::new(Op::Return),
            ],
        ));
        assert!(matches!(
            verify_module(&m),
            Err(VerifyError::NoIfaceImpl { .. })
        ));
    }

    #[test]
    fn test_loop_back_edge_depth() {
        let mut m = IrModule::new();
        // while-style loop: the back edge re-reaches the head at the same
        // depth.
        m.add_func(func(
            "main.loop",
            0,
            0,
            vec![
                Inst::with_arg(Op::Label, 1),
                Inst::with_val(Op::ConstI64, 1),
                Inst::with_arg(Op::JmpIfNot, 2),
                Inst::with_arg(Op::Jmp, 1),
                Inst::with_arg(Op::Label, 2),
                Inst::new(Op::Return),
            ],
        ));
        assert!(verify_module(&m).is_ok());
    }
}
