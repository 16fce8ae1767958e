//! x86-64 code generator (Linux and Windows).
//!
//! The operand stack lives behind `r15`, reserved by a one-shot
//! mmap/VirtualAlloc at `_start`. Frames are the usual
//! `push rbp; mov rbp, rsp; sub rsp, N` with locals at negative `rbp`
//! offsets. Internal calls keep the IR convention (arguments and results
//! on the operand stack); the Microsoft x64 ABI appears only at the
//! `kernel32.dll` boundary, with 32 bytes of shadow space and 16-byte
//! alignment around every IAT call.

use super::{init_call_order, sys, Lowered, Rodata, OPSTACK_SIZE};
use crate::error::EmitError;
use crate::fixup::{Fixup, TOK_DATA_ADDR, TOK_RODATA_HEADER};
use crate::x86::{Cond, Reg, X86};
use rtg_ir::{Inst, IrFunc, IrModule, Op};
use rustc_hash::FxHashMap;

const PANIC_HELPER: &str = "$panic$";
const SYSCALL_SHIM: &str = "runtime.Syscall";

pub fn lower(module: &IrModule, windows: bool) -> Result<Lowered, EmitError> {
    let mut cg = Amd64 {
        module,
        windows,
        e: X86::new(true),
        fixups: Vec::new(),
        rodata: Rodata::new(),
        funcs: FxHashMap::default(),
        sizes: Vec::new(),
        imports: Vec::new(),
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
        imports: cg.imports,
    })
}

struct Amd64<'m> {
    module: &'m IrModule,
    windows: bool,
    e: X86,
    fixups: Vec<Fixup>,
    rodata: Rodata,
    funcs: FxHashMap<String, usize>,
    sizes: Vec<(String, usize)>,
    imports: Vec<String>,
    need_panic: bool,
    need_syscall: bool,
}

impl<'m> Amd64<'m> {
    fn import(&mut self, name: &str) {
        if !self.imports.iter().any(|n| n == name) {
            self.imports.push(name.to_string());
        }
    }

    /// Shadow space + alignment, an IAT call, and the stack restore.
    fn iat_call(&mut self, name: &str, home: i32) {
        self.import(name);
        self.e.sub_ri(Reg::Sp, home);
        self.e.call_iat(name, &mut self.fixups);
        self.e.add_ri(Reg::Sp, home);
    }

    /// One-shot operand-stack reservation, init calls, main, exit.
    fn emit_start(&mut self) {
        if self.windows {
            self.e.sub_ri(Reg::Sp, 40);
            self.e.mov_ri(Reg::Cx, 0);
            self.e.mov_ri(Reg::Dx, OPSTACK_SIZE);
            self.e.mov_ri(Reg::R8, 0x3000); // MEM_COMMIT|MEM_RESERVE
            self.e.mov_ri(Reg::R9, 4); // PAGE_READWRITE
            self.import("VirtualAlloc");
            self.e.call_iat("VirtualAlloc", &mut self.fixups);
            self.e.lea(Reg::R15, Reg::Ax, OPSTACK_SIZE as i32);
            for root in init_call_order(self.module) {
                self.e.call_sym(&root, &mut self.fixups);
            }
            self.e.mov_ri(Reg::Cx, 0);
            self.import("ExitProcess");
            self.e.call_iat("ExitProcess", &mut self.fixups);
        } else {
            self.e.mov_ri(Reg::Ax, 9); // mmap
            self.e.mov_ri(Reg::Di, 0);
            self.e.mov_ri(Reg::Si, OPSTACK_SIZE);
            self.e.mov_ri(Reg::Dx, 3); // PROT_READ|PROT_WRITE
            self.e.mov_ri(Reg::R10, 0x22); // MAP_PRIVATE|MAP_ANONYMOUS
            self.e.mov_ri(Reg::R8, -1);
            self.e.mov_ri(Reg::R9, 0);
            self.e.syscall();
            self.e.lea(Reg::R15, Reg::Ax, OPSTACK_SIZE as i32);
            for root in init_call_order(self.module) {
                self.e.call_sym(&root, &mut self.fixups);
            }
            self.e.mov_ri(Reg::Ax, 60); // exit
            self.e.mov_ri(Reg::Di, 0);
            self.e.syscall();
        }
    }

    fn slot_disp(i: i64) -> i32 {
        (-(i + 1) * 8) as i32
    }

    fn emit_func(&mut self, func: &IrFunc) {
        let start = self.e.offset();
        self.funcs.insert(func.name.clone(), start);

        let frame = ((func.locals.len() * 8 + 15) & !15) as i32;
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
            Op::JmpIf => {
                self.e.op_pop(Reg::Ax);
                self.e.flush();
                self.e.test_rr(Reg::Ax, Reg::Ax);
                let at = self.e.jnz();
                jumps.push((at, inst.arg));
            }
            Op::JmpIfNot => {
                self.e.op_pop(Reg::Ax);
                self.e.flush();
                self.e.test_rr(Reg::Ax, Reg::Ax);
                let at = self.e.jz();
                jumps.push((at, inst.arg));
            }
            Op::ConstI64 | Op::ConstBool => {
                self.e.mov_ri(Reg::Ax, inst.val);
                self.e.op_push(Reg::Ax);
            }
            Op::ConstStr => {
                let idx = self.rodata.intern(&inst.name);
                self.e
                    .lea_rip_sym(Reg::Ax, TOK_RODATA_HEADER, idx as i64, &mut self.fixups);
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
                self.e
                    .load_rip_sym(Reg::Ax, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
                self.e.op_push(Reg::Ax);
            }
            Op::GlobalSet => {
                self.e.op_pop(Reg::Ax);
                self.e
                    .store_rip_sym(Reg::Ax, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
            }
            Op::GlobalAddr => {
                self.e
                    .lea_rip_sym(Reg::Ax, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
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
                self.e.truncate(Reg::Ax, inst.width);
                self.e.op_push(Reg::Ax);
            }
            Op::Div | Op::Rem => {
                self.e.op_pop(Reg::Cx);
                self.e.op_pop(Reg::Ax);
                self.e.idiv(Reg::Cx);
                let out = if inst.op == Op::Div { Reg::Ax } else { Reg::Dx };
                self.e.truncate(out, inst.width);
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
                self.e.truncate(Reg::Ax, inst.width);
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
                self.e.load(Reg::Ax, Reg::Ax, 8, 0);
                self.e.op_push(Reg::Ax);
            }
            Op::Cap => {
                self.e.op_pop(Reg::Ax);
                self.e.load(Reg::Ax, Reg::Ax, 16, 0);
                self.e.op_push(Reg::Ax);
            }
            Op::Dup => {
                self.e.op_pop(Reg::Ax);
                self.e.op_push(Reg::Ax);
                self.e.op_push(Reg::Ax);
            }
            Op::Drop => self.e.op_drop(),
            Op::Call => self.emit_call(inst),
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
                // box = runtime.Alloc(2 words); [box] = type id,
                // [box+8] = value
                self.e.mov_ri(Reg::Ax, 16);
                self.e.op_push(Reg::Ax);
                self.e.flush();
                self.e.call_sym("runtime.Alloc", &mut self.fixups);
                self.e.op_pop(Reg::Dx);
                self.e.op_pop(Reg::Cx);
                self.e.mov_ri(Reg::Ax, inst.arg);
                self.e.store(Reg::Dx, 0, Reg::Ax, 0);
                self.e.store(Reg::Dx, 8, Reg::Cx, 0);
                self.e.op_push(Reg::Dx);
            }
            Op::Convert => {
                self.e.op_pop(Reg::Ax);
                self.e.truncate(Reg::Ax, inst.width);
                self.e.op_push(Reg::Ax);
            }
        }
    }

    fn emit_call(&mut self, inst: &Inst) {
        if inst.name.starts_with(rtg_ir::BUILTIN_COMPOSITE_PREFIX) {
            return self.emit_composite(inst.arg);
        }
        if inst.name == SYSCALL_SHIM && !self.module.has_func(SYSCALL_SHIM) {
            self.need_syscall = true;
        }
        self.e.flush();
        self.e.call_sym(&inst.name, &mut self.fixups);
    }

    /// `builtin.composite.T` with n fields: allocate `n` words and store
    /// the operand-stack fields in declaration order, leaving the pointer.
    fn emit_composite(&mut self, n: i64) {
        self.e.mov_ri(Reg::Ax, n * 8);
        self.e.op_push(Reg::Ax);
        self.e.flush();
        self.e.call_sym("runtime.Alloc", &mut self.fixups);
        self.e.op_pop(Reg::Dx);
        for i in (0..n).rev() {
            self.e.op_pop(Reg::Cx);
            self.e.store(Reg::Dx, (i * 8) as i32, Reg::Cx, 0);
        }
        self.e.op_push(Reg::Dx);
    }

    /// Linear if-else chain over the concrete type ids implementing the
    /// method, in ascending id order. The boxed receiver below the
    /// arguments is unboxed in place before the concrete call.
    fn emit_iface_call(&mut self, inst: &Inst) {
        let nargs = inst.arg;
        let method = inst.name.rsplit('.').next().unwrap_or("");
        let impls = self.module.iface_impls(method);

        self.e.flush();
        self.e.op_peek(Reg::Ax, nargs);
        self.e.load(Reg::Cx, Reg::Ax, 0, 0); // type id
        self.e.load(Reg::Dx, Reg::Ax, 8, 0); // value
        self.e.op_poke(Reg::Dx, nargs);

        let mut case_jumps = Vec::new();
        for &(tid, _) in &impls {
            self.e.cmp_ri(Reg::Cx, tid as i32);
            case_jumps.push(self.e.jcc(Cond::Eq));
        }
        // No implementation matched.
        self.need_panic = true;
        let msg = self.rodata.intern("interface method not implemented");
        self.e
            .lea_rip_sym(Reg::Ax, TOK_RODATA_HEADER, msg as i64, &mut self.fixups);
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

    /// Message + newline to stderr, exit 2.
    fn emit_panic_helper(&mut self) {
        self.funcs.insert(PANIC_HELPER.to_string(), self.e.offset());
        let nl = self.rodata.intern("\n");
        if self.windows {
            // Entered by a call at an aligned site; realign for the IAT
            // boundary. The helper never returns.
            self.e.sub_ri(Reg::Sp, 8);
            self.e.op_pop(Reg::Si);
            self.e.mov_ri(Reg::Cx, -12); // STD_ERROR_HANDLE
            self.iat_call("GetStdHandle", 0x40);
            self.e.mov_rr(Reg::Di, Reg::Ax);

            self.e.mov_rr(Reg::Cx, Reg::Di);
            self.e.load(Reg::Dx, Reg::Si, 0, 0);
            self.e.load(Reg::R8, Reg::Si, 8, 0);
            self.e.sub_ri(Reg::Sp, 0x40);
            self.e.lea(Reg::R9, Reg::Sp, 0x38);
            self.e.store_imm(Reg::Sp, 0x20, 0);
            self.e.call_iat("WriteFile", &mut self.fixups);
            self.import("WriteFile");

            self.e
                .lea_rip_sym(Reg::Si, TOK_RODATA_HEADER, nl as i64, &mut self.fixups);
            self.e.mov_rr(Reg::Cx, Reg::Di);
            self.e.load(Reg::Dx, Reg::Si, 0, 0);
            self.e.mov_ri(Reg::R8, 1);
            self.e.lea(Reg::R9, Reg::Sp, 0x38);
            self.e.store_imm(Reg::Sp, 0x20, 0);
            self.e.call_iat("WriteFile", &mut self.fixups);
            self.e.add_ri(Reg::Sp, 0x40);

            self.e.mov_ri(Reg::Cx, 2);
            self.iat_call("ExitProcess", 0x40);
        } else {
            self.e.op_pop(Reg::Cx);
            self.e.load(Reg::Si, Reg::Cx, 0, 0);
            self.e.load(Reg::Dx, Reg::Cx, 8, 0);
            self.e.mov_ri(Reg::Di, 2);
            self.e.mov_ri(Reg::Ax, 1); // write
            self.e.syscall();

            self.e
                .lea_rip_sym(Reg::Ax, TOK_RODATA_HEADER, nl as i64, &mut self.fixups);
            self.e.load(Reg::Si, Reg::Ax, 0, 0);
            self.e.mov_ri(Reg::Dx, 1);
            self.e.mov_ri(Reg::Di, 2);
            self.e.mov_ri(Reg::Ax, 1);
            self.e.syscall();

            self.e.mov_ri(Reg::Di, 2);
            self.e.mov_ri(Reg::Ax, 60); // exit
            self.e.syscall();
        }
    }

    /// `runtime.Syscall(num, a1..a6) -> (r1, r2, errno)`: marshal the
    /// seven frame slots into the target ABI and translate the result
    /// into the uniform triple.
    fn emit_syscall_shim(&mut self) {
        self.funcs.insert(SYSCALL_SHIM.to_string(), self.e.offset());
        self.e.push_bp();
        self.e.mov_bp_sp();
        self.e.sub_ri(Reg::Sp, 64);
        for i in (0..7i64).rev() {
            self.e.op_pop(Reg::Ax);
            self.e.store(Reg::Bp, Self::slot_disp(i), Reg::Ax, 0);
        }
        if self.windows {
            self.emit_syscall_windows();
        } else {
            self.emit_syscall_linux();
        }
    }

    fn emit_syscall_linux(&mut self) {
        // Native numbering: pass straight through.
        self.e.load(Reg::Di, Reg::Bp, Self::slot_disp(1), 0);
        self.e.load(Reg::Si, Reg::Bp, Self::slot_disp(2), 0);
        self.e.load(Reg::Dx, Reg::Bp, Self::slot_disp(3), 0);
        self.e.load(Reg::R10, Reg::Bp, Self::slot_disp(4), 0);
        self.e.load(Reg::R8, Reg::Bp, Self::slot_disp(5), 0);
        self.e.load(Reg::R9, Reg::Bp, Self::slot_disp(6), 0);
        self.e.load(Reg::Ax, Reg::Bp, Self::slot_disp(0), 0);
        self.e.syscall();

        // rax in [-4095, -1] is -errno, anything else a result.
        self.e.cmp_ri(Reg::Ax, -4096);
        let err = self.e.ja();
        self.e.op_push(Reg::Ax);
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.mov_ri(Reg::Dx, 0);
        self.e.op_push(Reg::Dx);
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
        self.epilogue();
    }

    fn emit_syscall_windows(&mut self) {
        self.e.load(Reg::Ax, Reg::Bp, Self::slot_disp(0), 0);

        let cases: Vec<i64> = vec![
            sys::WRITE,
            sys::READ,
            sys::OPEN,
            sys::CLOSE,
            sys::MMAP,
            sys::EXIT,
            sys::GETCWD,
            sys::MKDIR,
            sys::RMDIR,
            sys::UNLINK,
            sys::STAT,
            sys::SPAWN,
            sys::PIPE,
            sys::FINDFILE,
        ];
        let mut case_jumps = Vec::new();
        for &num in &cases {
            self.e.cmp_ri(Reg::Ax, num as i32);
            case_jumps.push(self.e.jcc(Cond::Eq));
        }
        // Unknown number: (0, 0, ENOSYS).
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Cx);
        self.e.mov_ri(Reg::Ax, 38);
        self.e.op_push(Reg::Ax);
        self.e.flush();
        let mut done_jumps = vec![self.e.jmp()];

        for (at, num) in case_jumps.into_iter().zip(cases.into_iter()) {
            let here = self.e.offset();
            self.e.patch_jump(at, here);
            self.emit_windows_case(num);
            done_jumps.push(self.e.jmp());
        }

        let end = self.e.offset();
        for at in done_jumps {
            self.e.patch_jump(at, end);
        }
        self.epilogue();
    }

    /// Push the `(r1, 0, 0)` triple from `rax`.
    fn push_result_triple(&mut self) {
        self.e.op_push(Reg::Ax);
        self.e.mov_ri(Reg::Cx, 0);
        self.e.op_push(Reg::Cx);
        self.e.op_push(Reg::Cx);
        self.e.flush();
    }

    fn emit_windows_case(&mut self, num: i64) {
        let slot = Self::slot_disp;
        match num {
            sys::WRITE | sys::READ => {
                // handle = GetStdHandle(-10 - fd)
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.neg(Reg::Cx);
                self.e.add_ri(Reg::Cx, -10);
                self.iat_call("GetStdHandle", 0x40);
                self.e.mov_rr(Reg::Cx, Reg::Ax);
                self.e.load(Reg::Dx, Reg::Bp, slot(2), 0);
                self.e.load(Reg::R8, Reg::Bp, slot(3), 0);
                self.e.lea(Reg::R9, Reg::Bp, slot(7));
                self.e.sub_ri(Reg::Sp, 0x40);
                self.e.store_imm(Reg::Sp, 0x20, 0);
                let f = if num == sys::WRITE { "WriteFile" } else { "ReadFile" };
                self.import(f);
                self.e.call_iat(f, &mut self.fixups);
                self.e.add_ri(Reg::Sp, 0x40);
                self.e.load(Reg::Ax, Reg::Bp, slot(7), 0);
                self.push_result_triple();
            }
            sys::OPEN => {
                // creation = flags & O_CREAT ? OPEN_ALWAYS : OPEN_EXISTING
                self.e.load(Reg::Ax, Reg::Bp, slot(2), 0);
                self.e.mov_ri(Reg::Cx, 64);
                self.e.and_rr(Reg::Ax, Reg::Cx);
                self.e.shr_ri(Reg::Ax, 6);
                self.e.add_ri(Reg::Ax, 3);
                self.e.sub_ri(Reg::Sp, 0x40);
                self.e.store(Reg::Sp, 0x20, Reg::Ax, 0);
                self.e.store_imm(Reg::Sp, 0x28, 0x80); // FILE_ATTRIBUTE_NORMAL
                self.e.store_imm(Reg::Sp, 0x30, 0);
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.mov_ri(Reg::Dx, 0xC000_0000); // GENERIC_READ|WRITE
                self.e.mov_ri(Reg::R8, 3); // share read|write
                self.e.mov_ri(Reg::R9, 0);
                self.import("CreateFileA");
                self.e.call_iat("CreateFileA", &mut self.fixups);
                self.e.add_ri(Reg::Sp, 0x40);
                self.push_result_triple();
            }
            sys::CLOSE => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.iat_call("CloseHandle", 0x40);
                self.push_result_triple();
            }
            sys::MMAP => {
                self.e.mov_ri(Reg::Cx, 0);
                self.e.load(Reg::Dx, Reg::Bp, slot(2), 0);
                self.e.mov_ri(Reg::R8, 0x3000);
                self.e.mov_ri(Reg::R9, 4);
                self.iat_call("VirtualAlloc", 0x40);
                self.push_result_triple();
            }
            sys::EXIT => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.iat_call("ExitProcess", 0x40);
            }
            sys::GETCWD => {
                self.e.load(Reg::Cx, Reg::Bp, slot(2), 0);
                self.e.load(Reg::Dx, Reg::Bp, slot(1), 0);
                self.iat_call("GetCurrentDirectoryA", 0x40);
                self.push_result_triple();
            }
            sys::MKDIR => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.mov_ri(Reg::Dx, 0);
                self.iat_call("CreateDirectoryA", 0x40);
                self.push_result_triple();
            }
            sys::RMDIR => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.iat_call("RemoveDirectoryA", 0x40);
                self.push_result_triple();
            }
            sys::UNLINK => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.iat_call("DeleteFileA", 0x40);
                self.push_result_triple();
            }
            sys::STAT => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.iat_call("GetFileAttributesA", 0x40);
                self.push_result_triple();
            }
            sys::SPAWN => {
                // The runtime prepares the full argument blocks.
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.load(Reg::Dx, Reg::Bp, slot(2), 0);
                self.e.load(Reg::R8, Reg::Bp, slot(3), 0);
                self.e.load(Reg::R9, Reg::Bp, slot(4), 0);
                self.e.sub_ri(Reg::Sp, 0x60);
                for off in [0x20, 0x28, 0x30, 0x38, 0x40, 0x48] {
                    self.e.store_imm(Reg::Sp, off, 0);
                }
                self.e.load(Reg::Ax, Reg::Bp, slot(5), 0);
                self.e.store(Reg::Sp, 0x40, Reg::Ax, 0);
                self.e.load(Reg::Ax, Reg::Bp, slot(6), 0);
                self.e.store(Reg::Sp, 0x48, Reg::Ax, 0);
                self.import("CreateProcessA");
                self.e.call_iat("CreateProcessA", &mut self.fixups);
                self.e.add_ri(Reg::Sp, 0x60);
                self.push_result_triple();
            }
            sys::PIPE => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.load(Reg::Dx, Reg::Bp, slot(2), 0);
                self.e.mov_ri(Reg::R8, 0);
                self.e.mov_ri(Reg::R9, 0);
                self.iat_call("CreatePipe", 0x40);
                self.push_result_triple();
            }
            sys::FINDFILE => {
                self.e.load(Reg::Cx, Reg::Bp, slot(1), 0);
                self.e.load(Reg::Dx, Reg::Bp, slot(2), 0);
                self.iat_call("FindFirstFileA", 0x40);
                self.push_result_triple();
            }
            _ => unreachable!("ICE: unknown syscall case {}", num),
        }
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
    fn test_lower_empty_main() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m, false).unwrap();
        assert!(lowered.funcs.contains_key("main.main"));
        assert_eq!(lowered.entry, 0);
        assert!(!lowered.text.is_empty());
    }

    #[test]
    fn test_const_zero_uses_xor() {
        let m = module_with(vec![
            Inst::with_val(Op::ConstI64, 0),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        let lowered = lower(&m, false).unwrap();
        let at = lowered.funcs["main.main"];
        // prologue: push rbp; mov rbp, rsp — then xor rax, rax
        let body = &lowered.text[at + 4..at + 7];
        assert_eq!(body, &[0x48, 0x31, 0xc0]);
    }

    #[test]
    fn test_string_literal_interned_once() {
        let m = module_with(vec![
            Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: "abc".to_string(),
            },
            Inst::new(Op::Drop),
            Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: "abc".to_string(),
            },
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        let lowered = lower(&m, false).unwrap();
        assert_eq!(lowered.rodata.literal_count(), 1);
        assert_eq!(lowered.rodata.data_len(), 3);
    }

    #[test]
    fn test_windows_start_imports_kernel32() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m, true).unwrap();
        assert!(lowered.imports.iter().any(|i| i == "VirtualAlloc"));
        assert!(lowered.imports.iter().any(|i| i == "ExitProcess"));
    }

    #[test]
    fn test_call_fixup_recorded() {
        let mut m = IrModule::new();
        m.add_func(IrFunc {
            name: "main.f".to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: vec![Inst::new(Op::Return)],
        });
        m.add_func(IrFunc {
            name: "main.main".to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: vec![
                Inst::with_name(Op::Call, "main.f", 0),
                Inst::new(Op::Return),
            ],
        });
        let lowered = lower(&m, false).unwrap();
        assert!(lowered.fixups.iter().any(|f| f.name == "main.f"));
    }

    #[test]
    fn test_syscall_shim_synthesized() {
        let m = module_with(vec![
            Inst::with_val(Op::ConstI64, 60),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_val(Op::ConstI64, 0),
            Inst::with_name(Op::Call, "runtime.Syscall", 7),
            Inst::new(Op::Drop),
            Inst::new(Op::Drop),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        let lowered = lower(&m, false).unwrap();
        assert!(lowered.funcs.contains_key("runtime.Syscall"));
    }

    #[test]
    fn test_per_function_sizes_recorded() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m, false).unwrap();
        assert_eq!(lowered.sizes.len(), 1);
        assert_eq!(lowered.sizes[0].0, "main.main");
        assert!(lowered.sizes[0].1 > 0);
    }
}
