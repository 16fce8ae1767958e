//! i386 code generator (linux/386).
//!
//! Same skeleton as the x86-64 backend with a 4-byte word: the operand
//! stack lives behind `edi`, absolute 32-bit addresses replace
//! RIP-relative operands, and the kernel boundary is `int 0x80`. 64-bit
//! locals are flagged `wide` by the compiler but are carried as single
//! 32-bit words here; the runtime's wide helpers own the high halves.

use super::{init_call_order, sys, Lowered, Rodata, OPSTACK_SIZE};
use crate::error::EmitError;
use crate::fixup::{Fixup, TOK_DATA_ADDR, TOK_RODATA_HEADER};
use crate::x86::{Cond, Reg, X86};
use rtg_ir::{Inst, IrFunc, IrModule, Op};
use rustc_hash::FxHashMap;

const PANIC_HELPER: &str = "$panic$";
const SYSCALL_SHIM: &str = "runtime.Syscall";
const STACK_RESERVE: i64 = OPSTACK_SIZE / 16; // 1 MiB on the small target

pub fn lower(module: &IrModule) -> Result<Lowered, EmitError> {
    let mut cg = I386 {
        module,
        e: X86::new(false),
        fixups: Vec::new(),
        rodata: Rodata::new(),
        funcs: FxHashMap::default(),
        sizes: Vec::new(),
        need_panic: false,
        need_syscall: false,
    };
    cg.emit_start();
    for func in &module.funcs {
        cg.emit_func(func);
    }
    if cg.need_panic {
        cg.emit_panic_helper();
    }
    if cg.need_syscall && !module.has_func(SYSCALL_SHIM) {
        cg.emit_syscall_shim();
    }
    Ok(Lowered {
        text: cg.e.code.into_bytes(),
        fixups: cg.fixups,
        funcs: cg.funcs,
        sizes: cg.sizes,
        rodata: cg.rodata,
        global_count: module.globals.len(),
        entry: 0,
        imports: Vec::new(),
    })
}

struct I386<'m> {
    module: &'m IrModule,
    e: X86,
    fixups: Vec<Fixup>,
    rodata: Rodata,
    funcs: FxHashMap<String, usize>,
    sizes: Vec<(String, usize)>,
    need_panic: bool,
    need_syscall: bool,
}

impl<'m> I386<'m> {
    fn slot_disp(i: i64) -> i32 {
        (-(i + 1) * 4) as i32
    }

    fn emit_start(&mut self) {
        // mmap2(0, len, PROT_RW, MAP_PRIVATE|ANON, -1, 0)
        self.e.mov_ri(Reg::Bx, 0);
        self.e.mov_ri(Reg::Cx, STACK_RESERVE);
        self.e.mov_ri(Reg::Dx, 3);
        self.e.mov_ri(Reg::Si, 0x22);
        self.e.mov_ri(Reg::Di, -1);
        self.e.mov_ri(Reg::Bp, 0);
        self.e.mov_ri(Reg::Ax, 192);
        self.e.int80();
        self.e.lea(Reg::Di, Reg::Ax, STACK_RESERVE as i32);
        for root in init_call_order(self.module) {
            self.e.call_sym(&root, &mut self.fixups);
        }
        self.e.mov_ri(Reg::Bx, 0);
        self.e.mov_ri(Reg::Ax, 1); // exit
        self.e.int80();
    }

    fn emit_func(&mut self, func: &IrFunc) {
        let start = self.e.offset();
        self.funcs.insert(func.name.clone(), start);

        let frame = ((func.locals.len() * 4 + 15) & !15) as i32;
        self.e.push_bp();
        self.e.mov_bp_sp();
        if frame > 0 {
            self.e.sub_ri(Reg::Sp, frame);
        }

        let mut labels: FxHashMap<i64, usize> = FxHashMap::default();
        let mut jumps: Vec<(usize, i64)> = Vec::new();
        for inst in &func.code {
            self.emit_inst(inst, &mut labels, &mut jumps);
        }
        for (at, label) in jumps {
            let target = *labels
                .get(&label)
                .unwrap_or_else(|| panic!("ICE: unbound label {} in {}", label, func.name));
            self.e.patch_jump(at, target);
        }
        self.sizes.push((func.name.clone(), self.e.offset() - start));
    }

    fn epilogue(&mut self) {
        self.e.mov_sp_bp();
        self.e.pop_bp();
        self.e.ret();
    }

    /// Load the address of a data-token symbol into `reg` (no RIP
    /// addressing on this target).
    fn sym_addr(&mut self, reg: Reg, token: &str, addend: i64) {
        self.e.mov_ri_sym(reg, token, addend, &mut self.fixups);
    }

    fn emit_inst(
        &mut self,
        inst: &Inst,
        labels: &mut FxHashMap<i64, usize>,
        jumps: &mut Vec<(usize, i64)>,
    ) {
        match inst.op {
            Op::Label => {
                self.e.flush();
                labels.insert(inst.arg, self.e.offset());
            }
            Op::Jmp => {
                self.e.flush();
                let at = self.e.jmp();
                jumps.push((at, inst.arg));
            }
            Op::JmpIf | Op::JmpIfNot => {
                self.e.op_pop(Reg::Ax);
                self.e.flush();
                self.e.test_rr(Reg::Ax, Reg::Ax);
                let at = if inst.op == Op::JmpIf {
                    self.e.jnz()
                } else {
                    self.e.jz()
                };
                jumps.push((at, inst.arg));
            }
            Op::ConstI64 | Op::ConstBool => {
                self.e.mov_ri(Reg::Ax, inst.val);
                self.e.op_push(Reg::Ax);
            }
            Op::ConstStr => {
                let idx = self.rodata.intern(&inst.name);
                self.sym_addr(Reg::Ax, TOK_RODATA_HEADER, idx as i64);
                self.e.op_push(Reg::Ax);
            }
            Op::LocalGet => {
                self.e.load(Reg::Ax, Reg::Bp, Self::slot_disp(inst.arg), 0);
                self.e.op_push(Reg::Ax);
            }
            Op::LocalSet => {
                self.e.op_pop(Reg::Ax);
                self.e.store(Reg::Bp, Self::slot_disp(inst.arg), Reg::Ax, 0);
            }
            Op::LocalAddr => {
                self.e.lea(Reg::Ax, Reg::Bp, Self::slot_disp(inst.arg));
                self.e.op_push(Reg::Ax);
            }
            Op::GlobalGet => {
                self.sym_addr(Reg::Cx, TOK_DATA_ADDR, inst.arg);
                self.e.load(Reg::Ax, Reg::Cx, 0, 0);
                self.e.op_push(Reg::Ax);
            }
            Op::GlobalSet => {
                self.e.op_pop(Reg::Ax);
                self.sym_addr(Reg::Cx, TOK_DATA_ADDR, inst.arg);
                self.e.store(Reg::Cx, 0, Reg::Ax, 0);
            }
            Op::GlobalAddr => {
                self.sym_addr(Reg::Ax, TOK_DATA_ADDR, inst.arg);
                self.e.op_push(Reg::Ax);
            }
            Op::Add | Op::Sub | Op::Mul | Op::BitAnd | Op::BitOr | Op::BitXor => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                match inst.op {
                    Op::Add => self.e.add_rr(Reg::Ax, Reg::Cx),
                    Op::Sub => self.e.sub_rr(Reg::Ax, Reg::Cx),
                    Op::Mul => self.e.imul_rr(Reg::Ax, Reg::Cx),
                    Op::BitAnd => self.e.and_rr(Reg::Ax, Reg::Cx),
                    Op::BitOr => self.e.or_rr(Reg::Ax, Reg::Cx),
                    _ => self.e.xor_rr(Reg::Ax, Reg::Cx),
                }
                if inst.width != 0 && inst.width < 4 {
                    self.e.truncate(Reg::Ax, inst.width);
                }
                self.e.op_push(Reg::Ax);
            }
            Op::Div | Op::Rem => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                self.e.idiv(Reg::Cx);
                let out = if inst.op == Op::Div { Reg::Ax } else { Reg::Dx };
                self.e.op_push(out);
            }
            Op::Shl | Op::Shr => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                if inst.op == Op::Shl {
                    self.e.shl_cl(Reg::Ax);
                } else {
                    self.e.shr_cl(Reg::Ax);
                }
                self.e.op_push(Reg::Ax);
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                self.e.cmp_rr(Reg::Ax, Reg::Cx);
                let cond = match inst.op {
                    Op::Eq => Cond::Eq,
                    Op::Ne => Cond::Ne,
                    Op::Lt => Cond::Lt,
                    Op::Le => Cond::Le,
                    Op::Gt => Cond::Gt,
                    _ => Cond::Ge,
                };
                self.e.setcc(cond, Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Not => {
                self.e.op_pop(Reg::Ax);
                self.e.test_rr(Reg::Ax, Reg::Ax);
                self.e.setcc(Cond::Eq, Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Neg => {
                self.e.op_pop(Reg::Ax);
                self.e.neg(Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Comp => {
                self.e.op_pop(Reg::Ax);
                self.e.not(Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Load => {
                self.e.op_pop(Reg::Ax);
                self.e.load(Reg::Ax, Reg::Ax, 0, inst.width);
                self.e.op_push(Reg::Ax);
            }
            Op::Store => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                self.e.store(Reg::Ax, 0, Reg::Cx, inst.width);
            }
            Op::Offset => {
                self.e.op_pop(Reg::Ax);
                self.e.add_ri(Reg::Ax, inst.arg as i32);
                self.e.op_push(Reg::Ax);
            }
            Op::IndexAddr => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                self.e.load(Reg::Ax, Reg::Ax, 0, 0);
                if inst.arg != 1 {
                    self.e.imul_ri(Reg::Cx, Reg::Cx, inst.arg as i32);
                }
                self.e.add_rr(Reg::Ax, Reg::Cx);
                self.e.op_push(Reg::Ax);
            }
            Op::Len => {
                self.e.op_pop(Reg::Ax);
                self.e.load(Reg::Ax, Reg::Ax, 4, 0);
                self.e.op_push(Reg::Ax);
            }
            Op::Cap => {
                self.e.op_pop(Reg::Ax);
                self.e.load(Reg::Ax, Reg::Ax, 8, 0);
                self.e.op_push(Reg::Ax);
            }
            Op::Dup => {
                self.e.op_pop(Reg::Ax);
                self.e.op_push(Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Drop => self.e.op_drop(),
            Op::Call => {
                if inst.name.starts_with(rtg_ir::BUILTIN_COMPOSITE_PREFIX) {
                    return self.emit_composite(inst.arg);
                }
                if inst.name == SYSCALL_SHIM && !self.module.has_func(SYSCALL_SHIM) {
                    self.need_syscall = true;
                }
                self.e.flush();
                self.e.call_sym(&inst.name, &mut self.fixups);
            }
            Op::Return => {
                self.e.flush();
                self.epilogue();
            }
            Op::Panic => {
                self.e.flush();
                self.need_panic = true;
                self.e.call_sym(PANIC_HELPER, &mut self.fixups);
            }
            Op::IfaceCall => self.emit_iface_call(inst),
            Op::IfaceBox => {
                self.e.mov_ri(Reg::Ax, 8);
                self.e.op_push(Reg::Ax);
                self.e.flush();
                self.e.call_sym("runtime.Alloc", &mut self.fixups);
                self.e.op_pop(Reg::Dx);
                self.e.op_pop(Reg::Cx);
                self.e.mov_ri(Reg::Ax, inst.arg);
                self.e.store(Reg::Dx, 0, Reg::Ax, 0);
                self.e.store(Reg::Dx, 4, Reg::Cx, 0);
                self.e.op_push(Reg::Dx);
            }
            Op::Convert => {
                self.e.op_pop(Reg::Ax);
                if inst.width != 0 && inst.width < 4 {
                    self.e.truncate(Reg::Ax, inst.width);
                }
                self.e.op_push(Reg::Ax);
            }
        }
    }

    fn emit_composite(&mut self, n: i64) {
        self.e.mov_ri(Reg::Ax, n * 4);
        self.e.op_push(Reg::Ax);
        self.e.flush();
        self.e.call_sym("runtime.Alloc", &mut self.fixups);
        self.e.op_pop(Reg::Dx);
        for i in (0..n).rev() {
            self.e.op_pop(Reg::Cx);
            self.e.store(Reg::Dx, (i * 4) as i32, Reg::Cx, 0);
        }
        self.e.op_push(Reg::Dx);
    }

    fn emit_iface_call(&mut self, inst: &Inst) {
        let nargs = inst.arg;
        let method = inst.name.rsplit('.').next().unwrap_or("");
        let impls = self.module.iface_impls(method);

        self.e.flush();
        self.e.op_peek(Reg::Ax, nargs);
        self.e.load(Reg::Cx, Reg::Ax, 0, 0);
        self.e.load(Reg::Dx, Reg::Ax, 4, 0);
        self.e.op_poke(Reg::Dx, nargs);

        let mut case_jumps = Vec::new();
        for &(tid, _) in &impls {
            self.e.cmp_ri(Reg::Cx, tid as i32);
            case_jumps.push(self.e.jcc(Cond::Eq));
        }
        self.need_panic = true;
        let msg = self.rodata.intern("interface method not implemented");
        self.sym_addr(Reg::Ax, TOK_RODATA_HEADER, msg as i64);
        self.e.op_push(Reg::Ax);
        self.e.flush();
        self.e.call_sym(PANIC_HELPER, &mut self.fixups);

        let mut done_jumps = Vec::new();
        for (at, (_, target)) in case_jumps.into_iter().zip(impls.into_iter()) {
            let here = self.e.offset();
            self.e.patch_jump(at, here);
            self.e.call_sym(&target, &mut self.fixups);
            done_jumps.push(self.e.jmp());
        }
        let done = self.e.offset();
        for at in done_jumps {
            self.e.patch_jump(at, done);
        }
    }

    fn emit_panic_helper(&mut self) {
        self.funcs.insert(PANIC_HELPER.to_string(), self.e.offset());
        let nl = self.rodata.intern("\n");
        self.e.op_pop(Reg::Ax);
        self.e.load(Reg::Cx, Reg::Ax, 0, 0);
        self.e.load(Reg::Dx, Reg::Ax, 4, 0);
        self.e.mov_ri(Reg::Bx, 2);
        self.e.mov_ri(Reg::Ax, 4); // write
        self.e.int80();

        self.sym_addr(Reg::Ax, TOK_RODATA_HEADER, nl as i64);
        self.e.load(Reg::Cx, Reg::Ax, 0, 0);
        self.e.mov_ri(Reg::Dx, 1);
        self.e.mov_ri(Reg::Bx, 2);
        self.e.mov_ri(Reg::Ax, 4);
        self.e.int80();

        self.e.mov_ri(Reg::Bx, 2);
        self.e.mov_ri(Reg::Ax, 1); // exit
        self.e.int80();
    }

    /// Dispatch on the portable syscall number, translating to the i386
    /// `int 0x80` numbering.
    fn emit_syscall_shim(&mut self) {
        self.funcs.insert(SYSCALL_SHIM.to_string(), self.e.offset());
        self.e.push_bp();
        self.e.mov_bp_sp();
        self.e.sub_ri(Reg::Sp, 32);
        for i in (0..7i64).rev() {
            self.e.op_pop(Reg::Ax);
            self.e.store(Reg::Bp, Self::slot_disp(i), Reg::Ax, 0);
        }
        self.e.load(Reg::Ax, Reg::Bp, Self::slot_disp(0), 0);

        let cases: &[(i64, i64)] = &[
            (sys::READ, 3),
            (sys::WRITE, 4),
            (sys::OPEN, 5),
            (sys::CLOSE, 6),
            (sys::STAT, 106),
            (sys::MMAP, 192),
            (sys::EXIT, 1),
            (sys::GETCWD, 183),
            (sys::MKDIR, 39),
            (sys::RMDIR, 40),
            (sys::UNLINK, 10),
            (sys::GETDENTS64, 220),
        ];
        let mut case_jumps = Vec::new();
        for &(num, _) in cases {
            self.e.cmp_ri(Reg::Ax, num as i32);
            case_jumps.push(self.e.jcc(Cond::Eq));
        }
        // Unknown: (0, 0, ENOSYS).
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Cx);
        self.e.mov_ri(Reg::Ax, 38);
        self.e.op_push(Reg::Ax);
        self.e.flush();
        let skip_all = self.e.jmp();

        let mut split_jumps = Vec::new();
        for (at, &(num, native)) in case_jumps.into_iter().zip(cases.iter()) {
            let here = self.e.offset();
            self.e.patch_jump(at, here);
            if num == sys::MMAP {
                // mmap2 uses all six registers; edi carries the operand
                // stack and ebp the frame, so both are saved around the
                // trap.
                self.e.load(Reg::Bx, Reg::Bp, Self::slot_disp(1), 0);
                self.e.load(Reg::Cx, Reg::Bp, Self::slot_disp(2), 0);
                self.e.load(Reg::Dx, Reg::Bp, Self::slot_disp(3), 0);
                self.e.load(Reg::Si, Reg::Bp, Self::slot_disp(4), 0);
                self.e.push_reg(Reg::Di);
                self.e.push_reg(Reg::Bp);
                self.e.load(Reg::Di, Reg::Bp, Self::slot_disp(5), 0);
                self.e.mov_ri(Reg::Bp, 0);
                self.e.mov_ri(Reg::Ax, native);
                self.e.int80();
                self.e.pop_reg(Reg::Bp);
                self.e.pop_reg(Reg::Di);
            } else {
                self.e.load(Reg::Bx, Reg::Bp, Self::slot_disp(1), 0);
                self.e.load(Reg::Cx, Reg::Bp, Self::slot_disp(2), 0);
                self.e.load(Reg::Dx, Reg::Bp, Self::slot_disp(3), 0);
                self.e.load(Reg::Si, Reg::Bp, Self::slot_disp(4), 0);
                self.e.mov_ri(Reg::Ax, native);
                self.e.int80();
            }
            split_jumps.push(self.e.jmp());
        }

        // Common result split: -4095..-1 is -errno.
        let split = self.e.offset();
        for at in split_jumps {
            self.e.patch_jump(at, split);
        }
        self.e.cmp_ri(Reg::Ax, -4096);
        let err = self.e.ja();
        self.e.op_push(Reg::Ax);
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Cx);
        self.e.flush();
        let done = self.e.jmp();

        let here = self.e.offset();
        self.e.patch_jump(err, here);
        self.e.neg(Reg::Ax);
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Ax);
        self.e.flush();

        let end = self.e.offset();
        self.e.patch_jump(done, end);
        self.e.patch_jump(skip_all, end);
        self.epilogue();
    }
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
    fn test_lower_produces_text() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m).unwrap();
        assert!(lowered.funcs.contains_key("main.main"));
        assert!(lowered.imports.is_empty());
    }

    #[test]
    fn test_global_access_uses_abs32() {
        let mut m = module_with(vec![
            Inst::with_arg(Op::GlobalGet, 0),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        m.add_global("main.g");
        let lowered = lower(&m).unwrap();
        assert!(lowered
            .fixups
            .iter()
            .any(|f| f.name == TOK_DATA_ADDR && f.kind == crate::fixup::FixKind::Abs32));
    }
}
