//! C-source backend (`-T c[/16|32|64]`).
//!
//! A portable rendition of the IR: every function becomes a C function
//! over one process-wide operand-stack array, labels become `goto`
//! targets, and the word type is selected by the `/16|/32|/64` suffix.
//! Runtime symbols compile to extern declarations (the bundled runtime is
//! emitted through the same backend); the syscall shim dispatches onto
//! POSIX calls.

use super::{init_call_order, sys};
use crate::error::EmitError;
use rtg_ir::{IrFunc, IrModule, Op};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;

/// Mangle a qualified IR name into a C identifier.
fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn c_string_bytes(s: &str) -> String {
    let mut out = String::new();
    for (i, b) in s.as_bytes().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}", b);
    }
    out
}

pub fn lower(module: &IrModule, word_bits: u8) -> Result<Vec<u8>, EmitError> {
    let mut out = String::new();
    let w = match word_bits {
        16 => "uint16_t",
        32 => "uint32_t",
        _ => "uint64_t",
    };
    let sw = match word_bits {
        16 => "int16_t",
        32 => "int32_t",
        _ => "int64_t",
    };
    let word_bytes = word_bits as i64 / 8;

    let _ = writeln!(out, "#include <stdint.h>");
    let _ = writeln!(out, "#include <stdio.h>");
    let _ = writeln!(out, "#include <stdlib.h>");
    let _ = writeln!(out, "#include <unistd.h>");
    let _ = writeln!(out, "#include <fcntl.h>");
    let _ = writeln!(out, "#include <sys/stat.h>");
    let _ = writeln!(out);
    let _ = writeln!(out, "typedef {} w;", w);
    let _ = writeln!(out, "typedef {} sw;", sw);
    let _ = writeln!(out, "static w st[1 << 16];");
    let _ = writeln!(out, "static int sp;");
    let _ = writeln!(out, "#define PUSH(v) (st[sp++] = (w)(v))");
    let _ = writeln!(out, "#define POP() (st[--sp])");
    let _ = writeln!(out);

    // Deduplicated string literals and their two-word headers.
    let mut literals: Vec<String> = Vec::new();
    let mut literal_index: FxHashMap<String, usize> = FxHashMap::default();
    for func in &module.funcs {
        for inst in &func.code {
            if inst.op == Op::ConstStr && !literal_index.contains_key(&inst.name) {
                literal_index.insert(inst.name.clone(), literals.len());
                literals.push(inst.name.clone());
            }
        }
    }
    for (i, lit) in literals.iter().enumerate() {
        if lit.is_empty() {
            let _ = writeln!(out, "static const unsigned char sd{}[1] = {{0}};", i);
        } else {
            let _ = writeln!(
                out,
                "static const unsigned char sd{}[{}] = {{{}}};",
                i,
                lit.len(),
                c_string_bytes(lit)
            );
        }
        let _ = writeln!(
            out,
            "static w sh{}[2] = {{(w)(uintptr_t)sd{}, {}}};",
            i,
            i,
            lit.len()
        );
    }
    let _ = writeln!(out, "static w gl[{}];", module.globals.len().max(1));
    // Panic message for a failed interface dispatch.
    let msg = "interface method not implemented";
    let _ = writeln!(
        out,
        "static const unsigned char pd[{}] = {{{}}};",
        msg.len(),
        c_string_bytes(msg)
    );
    let _ = writeln!(
        out,
        "static w ph[2] = {{(w)(uintptr_t)pd, {}}};",
        msg.len()
    );
    let _ = writeln!(out);

    // Forward declarations for everything callable.
    let mut declared: FxHashMap<String, ()> = FxHashMap::default();
    for func in &module.funcs {
        let _ = writeln!(out, "static void {}(void);", mangle(&func.name));
        declared.insert(func.name.clone(), ());
    }
    for func in &module.funcs {
        for inst in &func.code {
            if inst.op == Op::Call
                && !declared.contains_key(&inst.name)
                && !inst.name.starts_with(rtg_ir::BUILTIN_COMPOSITE_PREFIX)
            {
                if inst.name == "runtime.Syscall" {
                    declared.insert(inst.name.clone(), ());
                    continue; // emitted below
                }
                let _ = writeln!(out, "extern void {}(void);", mangle(&inst.name));
                declared.insert(inst.name.clone(), ());
            }
        }
    }
    let needs_syscall =
        declared.contains_key("runtime.Syscall") && !module.has_func("runtime.Syscall");
    if !declared.contains_key("runtime.Alloc") {
        // Composite constructors and interface boxing allocate through it
        // even when no source call remains.
        let _ = writeln!(out, "extern void runtime_Alloc(void);");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "static void rt_panic(void) {{");
    let _ = writeln!(out, "    w h = POP();");
    let _ = writeln!(
        out,
        "    fwrite((const void *)(uintptr_t)((w *)(uintptr_t)h)[0], 1, (size_t)((w *)(uintptr_t)h)[1], stderr);"
    );
    let _ = writeln!(out, "    fputc('\\n', stderr);");
    let _ = writeln!(out, "    exit(2);");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);

    if needs_syscall {
        emit_syscall_shim(&mut out);
    }

    for func in &module.funcs {
        emit_func(&mut out, module, func, word_bytes)?;
    }

    let _ = writeln!(out, "int main(void) {{");
    for root in init_call_order(module) {
        if module.has_func(&root) {
            let _ = writeln!(out, "    {}();", mangle(&root));
        }
    }
    let _ = writeln!(out, "    return 0;");
    let _ = writeln!(out, "}}");

    Ok(out.into_bytes())
}

fn emit_syscall_shim(out: &mut String) {
    let _ = writeln!(out, "static void runtime_Syscall(void) {{");
    let _ = writeln!(out, "    w a6 = POP(), a5 = POP(), a4 = POP();");
    let _ = writeln!(out, "    w a3 = POP(), a2 = POP(), a1 = POP(), num = POP();");
    let _ = writeln!(out, "    (void)a5; (void)a6;");
    let _ = writeln!(out, "    long r = -1;");
    let _ = writeln!(out, "    switch ((long)num) {{");
    let _ = writeln!(
        out,
        "    case {}: r = read((int)a1, (void *)(uintptr_t)a2, (size_t)a3); break;",
        sys::READ
    );
    let _ = writeln!(
        out,
        "    case {}: r = write((int)a1, (const void *)(uintptr_t)a2, (size_t)a3); break;",
        sys::WRITE
    );
    let _ = writeln!(
        out,
        "    case {}: r = open((const char *)(uintptr_t)a1, (int)a2, (int)a3); break;",
        sys::OPEN
    );
    let _ = writeln!(out, "    case {}: r = close((int)a1); break;", sys::CLOSE);
    let _ = writeln!(
        out,
        "    case {}: r = (long)(uintptr_t)malloc((size_t)a2); break;",
        sys::MMAP
    );
    let _ = writeln!(out, "    case {}: exit((int)a1);", sys::EXIT);
    let _ = writeln!(
        out,
        "    case {}: r = getcwd((char *)(uintptr_t)a1, (size_t)a2) ? (long)a1 : -1; break;",
        sys::GETCWD
    );
    let _ = writeln!(
        out,
        "    case {}: r = mkdir((const char *)(uintptr_t)a1, (mode_t)a2); break;",
        sys::MKDIR
    );
    let _ = writeln!(
        out,
        "    case {}: r = rmdir((const char *)(uintptr_t)a1); break;",
        sys::RMDIR
    );
    let _ = writeln!(
        out,
        "    case {}: r = unlink((const char *)(uintptr_t)a1); break;",
        sys::UNLINK
    );
    let _ = writeln!(out, "    default: PUSH(0); PUSH(0); PUSH(38); return;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "    if (r < 0) {{ PUSH(0); PUSH(0); PUSH(-r); }}");
    let _ = writeln!(out, "    else {{ PUSH(r); PUSH(0); PUSH(0); }}");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
}

fn width_type(width: u8) -> &'static str {
    match width {
        1 => "uint8_t",
        2 => "uint16_t",
        4 => "uint32_t",
        8 => "uint64_t",
        _ => "w",
    }
}

fn emit_func(
    out: &mut String,
    module: &IrModule,
    func: &IrFunc,
    word_bytes: i64,
) -> Result<(), EmitError> {
    let _ = writeln!(out, "static void {}(void) {{", mangle(&func.name));
    if !func.locals.is_empty() {
        let names: Vec<String> = (0..func.locals.len()).map(|i| format!("l{} = 0", i)).collect();
        let _ = writeln!(out, "    w {};", names.join(", "));
    }
    let _ = writeln!(out, "    w t0, t1;");
    let _ = writeln!(out, "    (void)t0; (void)t1;");

    let mut literal_index: FxHashMap<&str, usize> = FxHashMap::default();
    {
        // Recompute the global literal numbering (same walk order as the
        // prologue pass).
        let mut n = 0;
        for f in &module.funcs {
            for inst in &f.code {
                if inst.op == Op::ConstStr && !literal_index.contains_key(inst.name.as_str()) {
                    literal_index.insert(inst.name.as_str(), n);
                    n += 1;
                }
            }
        }
    }

    for inst in &func.code {
        match inst.op {
            Op::Label => {
                let _ = writeln!(out, "L{}:;", inst.arg);
            }
            Op::Jmp => {
                let _ = writeln!(out, "    goto L{};", inst.arg);
            }
            Op::JmpIf => {
                let _ = writeln!(out, "    if (POP()) goto L{};", inst.arg);
            }
            Op::JmpIfNot => {
                let _ = writeln!(out, "    if (!POP()) goto L{};", inst.arg);
            }
            Op::ConstI64 | Op::ConstBool => {
                let _ = writeln!(out, "    PUSH((w){});", inst.val);
            }
            Op::ConstStr => {
                let idx = literal_index[inst.name.as_str()];
                let _ = writeln!(out, "    PUSH((w)(uintptr_t)sh{});", idx);
            }
            Op::LocalGet => {
                let _ = writeln!(out, "    PUSH(l{});", inst.arg);
            }
            Op::LocalSet => {
                let _ = writeln!(out, "    l{} = POP();", inst.arg);
            }
            Op::LocalAddr => {
                let _ = writeln!(out, "    PUSH((w)(uintptr_t)&l{});", inst.arg);
            }
            Op::GlobalGet => {
                let _ = writeln!(out, "    PUSH(gl[{}]);", inst.arg);
            }
            Op::GlobalSet => {
                let _ = writeln!(out, "    gl[{}] = POP();", inst.arg);
            }
            Op::GlobalAddr => {
                let _ = writeln!(out, "    PUSH((w)(uintptr_t)&gl[{}]);", inst.arg);
            }
            op if op.is_binary() => {
                let expr = match op {
                    Op::Add => "t1 + t0",
                    Op::Sub => "t1 - t0",
                    Op::Mul => "t1 * t0",
                    Op::Div => "(w)((sw)t1 / (sw)t0)",
                    Op::Rem => "(w)((sw)t1 % (sw)t0)",
                    Op::BitAnd => "t1 & t0",
                    Op::BitOr => "t1 | t0",
                    Op::BitXor => "t1 ^ t0",
                    Op::Shl => "t1 << t0",
                    Op::Shr => "t1 >> t0",
                    _ => unreachable!(),
                };
                let _ = writeln!(out, "    t0 = POP(); t1 = POP();");
                match inst.width {
                    0 => {
                        let _ = writeln!(out, "    PUSH({});", expr);
                    }
                    width => {
                        let ty = width_type(width);
                        let _ = writeln!(out, "    PUSH(({})({}));", ty, expr);
                    }
                }
            }
            op if op.is_comparison() => {
                let cmp = match op {
                    Op::Eq => "==",
                    Op::Ne => "!=",
                    Op::Lt => "<",
                    Op::Le => "<=",
                    Op::Gt => ">",
                    _ => ">=",
                };
                let _ = writeln!(out, "    t0 = POP(); t1 = POP();");
                let _ = writeln!(out, "    PUSH((sw)t1 {} (sw)t0 ? 1 : 0);", cmp);
            }
            Op::Not => {
                let _ = writeln!(out, "    st[sp - 1] = !st[sp - 1];");
            }
            Op::Neg => {
                let _ = writeln!(out, "    st[sp - 1] = (w)(-(sw)st[sp - 1]);");
            }
            Op::Comp => {
                let _ = writeln!(out, "    st[sp - 1] = ~st[sp - 1];");
            }
            Op::Load => {
                let ty = width_type(inst.width);
                let _ = writeln!(
                    out,
                    "    st[sp - 1] = (w)*({} *)(uintptr_t)st[sp - 1];",
                    ty
                );
            }
            Op::Store => {
                let ty = width_type(inst.width);
                let _ = writeln!(out, "    t0 = POP(); t1 = POP();");
                let _ = writeln!(out, "    *({} *)(uintptr_t)t1 = ({})t0;", ty, ty);
            }
            Op::Offset => {
                let _ = writeln!(out, "    st[sp - 1] += {};", inst.arg);
            }
            Op::IndexAddr => {
                let _ = writeln!(out, "    t0 = POP();"); // index
                let _ = writeln!(
                    out,
                    "    st[sp - 1] = *(w *)(uintptr_t)st[sp - 1] + t0 * {};",
                    inst.arg
                );
            }
            Op::Len => {
                let _ = writeln!(
                    out,
                    "    st[sp - 1] = ((w *)(uintptr_t)st[sp - 1])[1];"
                );
            }
            Op::Cap => {
                let _ = writeln!(
                    out,
                    "    st[sp - 1] = ((w *)(uintptr_t)st[sp - 1])[2];"
                );
            }
            Op::Dup => {
                let _ = writeln!(out, "    PUSH(st[sp - 1]);");
            }
            Op::Drop => {
                let _ = writeln!(out, "    sp--;");
            }
            Op::Call => {
                if inst.name.starts_with(rtg_ir::BUILTIN_COMPOSITE_PREFIX) {
                    let n = inst.arg;
                    let _ = writeln!(out, "    PUSH({});", n * word_bytes);
                    let _ = writeln!(out, "    runtime_Alloc();");
                    let _ = writeln!(out, "    t1 = POP();");
                    for i in (0..n).rev() {
                        let _ = writeln!(
                            out,
                            "    ((w *)(uintptr_t)t1)[{}] = POP();",
                            i
                        );
                    }
                    let _ = writeln!(out, "    PUSH(t1);");
                } else {
                    let _ = writeln!(out, "    {}();", mangle(&inst.name));
                }
            }
            Op::Return => {
                let _ = writeln!(out, "    return;");
            }
            Op::Panic => {
                let _ = writeln!(out, "    rt_panic();");
            }
            Op::IfaceCall => {
                let nargs = inst.arg;
                let method = inst.name.rsplit('.').next().unwrap_or("");
                let _ = writeln!(out, "    t1 = st[sp - 1 - {}];", nargs);
                let _ = writeln!(
                    out,
                    "    st[sp - 1 - {}] = ((w *)(uintptr_t)t1)[1];",
                    nargs
                );
                let _ = writeln!(out, "    t0 = ((w *)(uintptr_t)t1)[0];");
                let mut first = true;
                for (tid, target) in module.iface_impls(method) {
                    let kw = if first { "if" } else { "else if" };
                    first = false;
                    let _ = writeln!(out, "    {} (t0 == {}) {}();", kw, tid, mangle(&target));
                }
                let _ = writeln!(out, "    else {{ PUSH((w)(uintptr_t)ph); rt_panic(); }}");
            }
            Op::IfaceBox => {
                let _ = writeln!(out, "    t0 = POP();");
                let _ = writeln!(out, "    PUSH(2 * {});", word_bytes);
                let _ = writeln!(out, "    runtime_Alloc();");
                let _ = writeln!(out, "    t1 = POP();");
                let _ = writeln!(out, "    ((w *)(uintptr_t)t1)[0] = {};", inst.arg);
                let _ = writeln!(out, "    ((w *)(uintptr_t)t1)[1] = t0;");
                let _ = writeln!(out, "    PUSH(t1);");
            }
            Op::Convert => {
                if inst.width != 0 {
                    let ty = width_type(inst.width);
                    let _ = writeln!(out, "    st[sp - 1] = (w)({})st[sp - 1];", ty);
                }
            }
            _ => unreachable!("ICE: unhandled opcode {:?}", inst.op),
        }
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ir::{Inst, IrFunc, IrModule};

    fn module_with(code: Vec<Inst>) -> IrModule {
        let mut m = IrModule::new();
        m.add_func(IrFunc {
            name: "main.main".to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code,
        });
        m
    }

    #[test]
    fn test_emits_main_and_word_type() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let src = String::from_utf8(lower(&m, 64).unwrap()).unwrap();
        assert!(src.contains("typedef uint64_t w;"));
        assert!(src.contains("int main(void)"));
        assert!(src.contains("main_main();"));
    }

    #[test]
    fn test_word_width_selectable() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let src16 = String::from_utf8(lower(&m, 16).unwrap()).unwrap();
        assert!(src16.contains("typedef uint16_t w;"));
        let src32 = String::from_utf8(lower(&m, 32).unwrap()).unwrap();
        assert!(src32.contains("typedef uint32_t w;"));
    }

    #[test]
    fn test_labels_become_gotos() {
        let m = module_with(vec![
            Inst::with_arg(Op::Label, 1),
            Inst::with_arg(Op::Jmp, 1),
            Inst::new(Op::Return),
        ]);
        let src = String::from_utf8(lower(&m, 64).unwrap()).unwrap();
        assert!(src.contains("L1:;"));
        assert!(src.contains("goto L1;"));
    }

    #[test]
    fn test_string_literal_dedup() {
        let lit = |s: &str| Inst {
            op: Op::ConstStr,
            arg: 0,
            width: 0,
            val: 0,
            name: s.to_string(),
        };
        let m = module_with(vec![
            lit("abc"),
            Inst::new(Op::Drop),
            lit("abc"),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        let src = String::from_utf8(lower(&m, 64).unwrap()).unwrap();
        assert_eq!(src.matches("static const unsigned char sd").count(), 1);
    }
}
