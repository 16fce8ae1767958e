//! ARM64 code generator (linux/arm64, windows/arm64, darwin/arm64).
//!
//! The operand stack lives behind `x28`. Linux invokes the kernel with
//! `svc 0` (translating the portable catalogue to the AArch64 numbering,
//! which routes path calls through the `*at` forms); macOS has no stable
//! syscall surface, so the shim calls libSystem through GOT slots filled
//! by the dynamic loader. Windows/arm64 marshals into kernel32 IAT thunks
//! the same way the x64 backend does.

use super::{init_call_order, sys, Lowered, Rodata, OPSTACK_SIZE};
use crate::a64::{Cond, A64, OPSTACK};
use crate::error::EmitError;
use crate::fixup::{Fixup, TOK_DATA_ADDR, TOK_GOT_ADDR, TOK_IAT_PREFIX, TOK_RODATA_HEADER};
use crate::fixup::FixKind;
use rtg_ir::{Inst, IrFunc, IrModule, Op};
use rustc_hash::FxHashMap;

const PANIC_HELPER: &str = "$panic$";
const SYSCALL_SHIM: &str = "runtime.Syscall";

/// Flavor of the ARM64 target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Linux,
    Darwin,
    Windows,
}

pub fn lower(module: &IrModule, flavor: Flavor) -> Result<Lowered, EmitError> {
    let mut cg = Arm64 {
        module,
        flavor,
        e: A64::new(),
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

enum LocalJump {
    Imm26(usize, i64),
    Imm19(usize, i64),
}

struct Arm64<'m> {
    module: &'m IrModule,
    flavor: Flavor,
    e: A64,
    fixups: Vec<Fixup>,
    rodata: Rodata,
    funcs: FxHashMap<String, usize>,
    sizes: Vec<(String, usize)>,
    imports: Vec<String>,
    need_panic: bool,
    need_syscall: bool,
}

impl<'m> Arm64<'m> {
    /// Slot index of an imported symbol (GOT on darwin, IAT on windows).
    fn import(&mut self, name: &str) -> usize {
        if let Some(pos) = self.imports.iter().position(|n| n == name) {
            return pos;
        }
        self.imports.push(name.to_string());
        self.imports.len() - 1
    }

    /// Call an imported function: `adrp+ldr` the pointer slot, `blr`.
    fn call_import(&mut self, name: &str, scratch: u8) {
        match self.flavor {
            Flavor::Darwin => {
                let idx = self.import(name);
                self.e
                    .adrp_ldr_sym(scratch, TOK_GOT_ADDR, idx as i64, &mut self.fixups);
                self.e.blr(scratch);
            }
            Flavor::Windows => {
                self.import(name);
                self.fixups.push(Fixup {
                    offset: self.e.offset(),
                    name: format!("{}{}", TOK_IAT_PREFIX, name),
                    addend: 0,
                    kind: FixKind::A64AdrpLdr,
                });
                // adrp scratch, $iat ; ldr scratch, [scratch, #lo12]
                self.e.code.put_u32(0x9000_0000 | scratch as u32);
                self.e.load(scratch, scratch, 0, 0);
                self.e.blr(scratch);
            }
            Flavor::Linux => unreachable!("ICE: imports on linux/arm64"),
        }
    }

    fn emit_start(&mut self) {
        match self.flavor {
            Flavor::Linux => {
                // mmap(0, len, PROT_RW, MAP_PRIVATE|ANON, -1, 0)
                self.e.mov_ri(0, 0);
                self.e.mov_ri(1, OPSTACK_SIZE);
                self.e.mov_ri(2, 3);
                self.e.mov_ri(3, 0x22);
                self.e.mov_ri(4, -1);
                self.e.mov_ri(5, 0);
                self.e.mov_ri(8, 222);
                self.e.svc0();
                self.e.mov_ri(1, OPSTACK_SIZE);
                self.e.add_rr(OPSTACK, 0, 1);
                for root in init_call_order(self.module) {
                    self.e.bl_sym(&root, &mut self.fixups);
                }
                self.e.mov_ri(0, 0);
                self.e.mov_ri(8, 93); // exit
                self.e.svc0();
            }
            Flavor::Darwin | Flavor::Windows => {
                // One VirtualAlloc / mmap through the import table.
                if self.flavor == Flavor::Darwin {
                    self.e.mov_ri(0, 0);
                    self.e.mov_ri(1, OPSTACK_SIZE);
                    self.e.mov_ri(2, 3);
                    self.e.mov_ri(3, 0x1002); // MAP_PRIVATE|MAP_ANON
                    self.e.mov_ri(4, -1);
                    self.e.mov_ri(5, 0);
                    self.call_import("_mmap", 16);
                } else {
                    self.e.mov_ri(0, 0);
                    self.e.mov_ri(1, OPSTACK_SIZE);
                    self.e.mov_ri(2, 0x3000);
                    self.e.mov_ri(3, 4);
                    self.call_import("VirtualAlloc", 16);
                }
                self.e.mov_ri(1, OPSTACK_SIZE);
                self.e.add_rr(OPSTACK, 0, 1);
                for root in init_call_order(self.module) {
                    self.e.bl_sym(&root, &mut self.fixups);
                }
                self.e.mov_ri(0, 0);
                let exit = if self.flavor == Flavor::Darwin {
                    "_exit"
                } else {
                    "ExitProcess"
                };
                self.call_import(exit, 16);
            }
        }
    }

    fn emit_func(&mut self, func: &IrFunc) {
        let start = self.e.offset();
        self.funcs.insert(func.name.clone(), start);

        let frame = ((func.locals.len() * 8 + 15) & !15) as u32;
        self.e.prologue(frame);

        let mut labels: FxHashMap<i64, usize> = FxHashMap::default();
        let mut jumps: Vec<LocalJump> = Vec::new();
        for inst in &func.code {
            self.emit_inst(inst, &mut labels, &mut jumps);
        }
        for jump in jumps {
            let (at, label, wide) = match jump {
                LocalJump::Imm26(at, l) => (at, l, true),
                LocalJump::Imm19(at, l) => (at, l, false),
            };
            let target = *labels
                .get(&label)
                .unwrap_or_else(|| panic!("ICE: unbound label {} in {}", label, func.name));
            if wide {
                self.e.patch_branch26(at, target);
            } else {
                self.e.patch_branch19(at, target);
            }
        }
        self.sizes.push((func.name.clone(), self.e.offset() - start));
    }

    fn emit_inst(
        &mut self,
        inst: &Inst,
        labels: &mut FxHashMap<i64, usize>,
        jumps: &mut Vec<LocalJump>,
    ) {
        match inst.op {
            Op::Label => {
                self.e.flush();
                labels.insert(inst.arg, self.e.offset());
            }
            Op::Jmp => {
                self.e.flush();
                let at = self.e.b();
                jumps.push(LocalJump::Imm26(at, inst.arg));
            }
            Op::JmpIf => {
                self.e.op_pop(0);
                self.e.flush();
                let at = self.e.cbnz(0);
                jumps.push(LocalJump::Imm19(at, inst.arg));
            }
            Op::JmpIfNot => {
                self.e.op_pop(0);
                self.e.flush();
                let at = self.e.cbz(0);
                jumps.push(LocalJump::Imm19(at, inst.arg));
            }
            Op::ConstI64 | Op::ConstBool => {
                self.e.mov_ri(0, inst.val);
                self.e.op_push(0);
            }
            Op::ConstStr => {
                let idx = self.rodata.intern(&inst.name);
                self.e
                    .adrp_add_sym(0, TOK_RODATA_HEADER, idx as i64, &mut self.fixups);
                self.e.op_push(0);
            }
            Op::LocalGet => {
                self.e.load_slot(0, inst.arg as usize);
                self.e.op_push(0);
            }
            Op::LocalSet => {
                self.e.op_pop(0);
                self.e.store_slot(0, inst.arg as usize);
            }
            Op::LocalAddr => {
                self.e.slot_addr(0, inst.arg as usize);
                self.e.op_push(0);
            }
            Op::GlobalGet => {
                self.e
                    .adrp_add_sym(1, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
                self.e.load(0, 1, 0, 0);
                self.e.op_push(0);
            }
            Op::GlobalSet => {
                self.e.op_pop(0);
                self.e
                    .adrp_add_sym(1, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
                self.e.store(0, 1, 0, 0);
            }
            Op::GlobalAddr => {
                self.e
                    .adrp_add_sym(0, TOK_DATA_ADDR, inst.arg, &mut self.fixups);
                self.e.op_push(0);
            }
            Op::Add | Op::Sub | Op::Mul | Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl
            | Op::Shr => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                match inst.op {
                    Op::Add => self.e.add_rr(0, 0, 1),
                    Op::Sub => self.e.sub_rr(0, 0, 1),
                    Op::Mul => self.e.mul(0, 0, 1),
                    Op::BitAnd => self.e.and_rr(0, 0, 1),
                    Op::BitOr => self.e.orr_rr(0, 0, 1),
                    Op::BitXor => self.e.eor_rr(0, 0, 1),
                    Op::Shl => self.e.lsl_rr(0, 0, 1),
                    _ => self.e.lsr_rr(0, 0, 1),
                }
                if inst.width != 0 && inst.width < 8 {
                    self.e.truncate(0, 0, inst.width);
                }
                self.e.op_push(0);
            }
            Op::Div => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                self.e.sdiv(0, 0, 1);
                self.e.op_push(0);
            }
            Op::Rem => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                self.e.sdiv(2, 0, 1);
                self.e.msub(0, 2, 1, 0);
                self.e.op_push(0);
            }
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                self.e.cmp_rr(0, 1);
                let cond = match inst.op {
                    Op::Eq => Cond::Eq,
                    Op::Ne => Cond::Ne,
                    Op::Lt => Cond::Lt,
                    Op::Le => Cond::Le,
                    Op::Gt => Cond::Gt,
                    _ => Cond::Ge,
                };
                self.e.cset(0, cond);
                self.e.op_push(0);
            }
            Op::Not => {
                self.e.op_pop(0);
                self.e.cmp_ri(0, 0);
                self.e.cset(0, Cond::Eq);
                self.e.op_push(0);
            }
            Op::Neg => {
                self.e.op_pop(0);
                self.e.neg(0, 0);
                self.e.op_push(0);
            }
            Op::Comp => {
                self.e.op_pop(0);
                self.e.mvn(0, 0);
                self.e.op_push(0);
            }
            Op::Load => {
                self.e.op_pop(0);
                self.e.load(0, 0, 0, inst.width);
                self.e.op_push(0);
            }
            Op::Store => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                self.e.store(1, 0, 0, inst.width);
            }
            Op::Offset => {
                self.e.op_pop(0);
                if inst.arg < 4096 {
                    self.e.add_ri(0, 0, inst.arg as u32);
                } else {
                    self.e.mov_ri(1, inst.arg);
                    self.e.add_rr(0, 0, 1);
                }
                self.e.op_push(0);
            }
            Op::IndexAddr => {
                self.e.op_pop(1);
                self.e.op_pop(0);
                self.e.load(0, 0, 0, 0);
                if inst.arg != 1 {
                    self.e.mov_ri(2, inst.arg);
                    self.e.mul(1, 1, 2);
                }
                self.e.add_rr(0, 0, 1);
                self.e.op_push(0);
            }
            Op::Len => {
                self.e.op_pop(0);
                self.e.load(0, 0, 8, 0);
                self.e.op_push(0);
            }
            Op::Cap => {
                self.e.op_pop(0);
                self.e.load(0, 0, 16, 0);
                self.e.op_push(0);
            }
            Op::Dup => {
                self.e.op_pop(0);
                self.e.op_push(0);
                self.e.op_push(0);
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
                self.e.bl_sym(&inst.name, &mut self.fixups);
            }
            Op::Return => {
                self.e.flush();
                self.e.epilogue();
            }
            Op::Panic => {
                self.e.flush();
                self.need_panic = true;
                self.e.bl_sym(PANIC_HELPER, &mut self.fixups);
            }
            Op::IfaceCall => self.emit_iface_call(inst),
            Op::IfaceBox => {
                self.e.mov_ri(0, 16);
                self.e.op_push(0);
                self.e.flush();
                self.e.bl_sym("runtime.Alloc", &mut self.fixups);
                self.e.op_pop(2);
                self.e.op_pop(1);
                self.e.mov_ri(0, inst.arg);
                self.e.store(0, 2, 0, 0);
                self.e.store(1, 2, 8, 0);
                self.e.op_push(2);
            }
            Op::Convert => {
                self.e.op_pop(0);
                if inst.width != 0 && inst.width < 8 {
                    self.e.truncate(0, 0, inst.width);
                }
                self.e.op_push(0);
            }
        }
    }

    fn emit_composite(&mut self, n: i64) {
        self.e.mov_ri(0, n * 8);
        self.e.op_push(0);
        self.e.flush();
        self.e.bl_sym("runtime.Alloc", &mut self.fixups);
        self.e.op_pop(2);
        for i in (0..n).rev() {
            self.e.op_pop(1);
            self.e.store(1, 2, (i * 8) as u32, 0);
        }
        self.e.op_push(2);
    }

    fn emit_iface_call(&mut self, inst: &Inst) {
        let nargs = inst.arg;
        let method = inst.name.rsplit('.').next().unwrap_or("");
        let impls = self.module.iface_impls(method);

        self.e.flush();
        self.e.op_peek(0, nargs);
        self.e.load(1, 0, 0, 0); // type id
        self.e.load(2, 0, 8, 0); // value
        self.e.op_poke(2, nargs);

        let mut case_jumps = Vec::new();
        for &(tid, _) in &impls {
            self.e.cmp_ri(1, tid as u32);
            case_jumps.push(self.e.b_cond(Cond::Eq));
        }
        self.need_panic = true;
        let msg = self.rodata.intern("interface method not implemented");
        self.e
            .adrp_add_sym(0, TOK_RODATA_HEADER, msg as i64, &mut self.fixups);
        self.e.op_push(0);
        self.e.flush();
        self.e.bl_sym(PANIC_HELPER, &mut self.fixups);

        let mut done_jumps = Vec::new();
        for (at, (_, target)) in case_jumps.into_iter().zip(impls.into_iter()) {
            let here = self.e.offset();
            self.e.patch_branch19(at, here);
            self.e.bl_sym(&target, &mut self.fixups);
            done_jumps.push(self.e.b());
        }
        let done = self.e.offset();
        for at in done_jumps {
            self.e.patch_branch26(at, done);
        }
    }

    fn emit_write_stderr(&mut self, data: u8, len: u8) {
        match self.flavor {
            Flavor::Linux => {
                self.e.mov_ri(0, 2);
                self.e.mov_rr(1, data);
                self.e.mov_rr(2, len);
                self.e.mov_ri(8, 64); // write
                self.e.svc0();
            }
            Flavor::Darwin => {
                self.e.mov_ri(0, 2);
                self.e.mov_rr(1, data);
                self.e.mov_rr(2, len);
                self.call_import("_write", 16);
            }
            Flavor::Windows => {
                // GetStdHandle(STD_ERROR_HANDLE); WriteFile(h, buf, n, &n, 0)
                self.e.mov_rr(19, data);
                self.e.mov_rr(20, len);
                self.e.mov_ri(0, -12);
                self.call_import("GetStdHandle", 16);
                self.e.mov_rr(1, 19);
                self.e.mov_rr(2, 20);
                self.e.slot_addr(3, 0);
                self.e.mov_ri(4, 0);
                self.call_import("WriteFile", 16);
            }
        }
    }

    /// Message + newline to stderr, exit 2.
    fn emit_panic_helper(&mut self) {
        self.funcs.insert(PANIC_HELPER.to_string(), self.e.offset());
        self.e.prologue(16);
        let nl = self.rodata.intern("\n");
        self.e.op_pop(0);
        self.e.load(21, 0, 0, 0); // data (callee-saved across imports)
        self.e.load(22, 0, 8, 0); // len
        self.e.mov_rr(25, 21);
        self.e.mov_rr(26, 22);
        self.emit_write_stderr(25, 26);

        self.e
            .adrp_add_sym(0, TOK_RODATA_HEADER, nl as i64, &mut self.fixups);
        self.e.load(25, 0, 0, 0);
        self.e.mov_ri(26, 1);
        self.emit_write_stderr(25, 26);

        self.e.mov_ri(0, 2);
        match self.flavor {
            Flavor::Linux => {
                self.e.mov_ri(8, 93);
                self.e.svc0();
            }
            Flavor::Darwin => self.call_import("_exit", 16),
            Flavor::Windows => self.call_import("ExitProcess", 16),
        }
    }

    fn emit_syscall_shim(&mut self) {
        self.funcs.insert(SYSCALL_SHIM.to_string(), self.e.offset());
        self.e.prologue(64);
        for i in (0..7usize).rev() {
            self.e.op_pop(0);
            self.e.store_slot(0, i);
        }
        self.e.load_slot(9, 0); // portable number

        let cases = sys::CATALOGUE;
        let mut case_jumps = Vec::new();
        for &num in cases {
            self.e.cmp_ri(9, num as u32);
            case_jumps.push(self.e.b_cond(Cond::Eq));
        }
        // Unknown: (0, 0, ENOSYS).
        self.e.mov_ri(0, 0);
        self.e.op_push(0);
        self.e.op_push(0);
        self.e.mov_ri(1, 38);
        self.e.op_push(1);
        self.e.flush();
        let mut done_jumps = vec![self.e.b()];

        for (at, &num) in case_jumps.into_iter().zip(cases.iter()) {
            let here = self.e.offset();
            self.e.patch_branch19(at, here);
            match self.flavor {
                Flavor::Linux => self.emit_linux_case(num),
                Flavor::Darwin => self.emit_darwin_case(num),
                Flavor::Windows => self.emit_windows_case(num),
            }
            done_jumps.push(self.e.b());
        }

        let end = self.e.offset();
        for at in done_jumps {
            self.e.patch_branch26(at, end);
        }
        self.e.epilogue();
    }

    /// Success/error split for the `-errno` convention after `svc`.
    fn push_svc_triple(&mut self) {
        self.e.mov_ri(1, -4096);
        self.e.cmp_rr(0, 1);
        // unsigned above -4096 means an error return
        let err = self.e.b_cond(Cond::Hi);
        self.e.op_push(0);
        self.e.mov_ri(1, 0);
        self.e.op_push(1);
        self.e.op_push(1);
        self.e.flush();
        let done = self.e.b();
        let here = self.e.offset();
        self.e.patch_branch19(err, here);
        self.e.neg(0, 0);
        self.e.mov_ri(1, 0);
        self.e.op_push(1);
        self.e.op_push(1);
        self.e.op_push(0);
        self.e.flush();
        let end = self.e.offset();
        self.e.patch_branch26(done, end);
    }

    fn emit_linux_case(&mut self, num: i64) {
        const AT_FDCWD: i64 = -100;
        // Portable → AArch64 numbering; path calls shift into *at form.
        match num {
            sys::OPEN => {
                self.e.load_slot(1, 1);
                self.e.load_slot(2, 2);
                self.e.load_slot(3, 3);
                self.e.mov_ri(0, AT_FDCWD);
                self.e.mov_ri(8, 56); // openat
            }
            sys::STAT => {
                self.e.load_slot(1, 1);
                self.e.load_slot(2, 2);
                self.e.mov_ri(0, AT_FDCWD);
                self.e.mov_ri(3, 0);
                self.e.mov_ri(8, 79); // newfstatat
            }
            sys::MKDIR => {
                self.e.load_slot(1, 1);
                self.e.load_slot(2, 2);
                self.e.mov_ri(0, AT_FDCWD);
                self.e.mov_ri(8, 34); // mkdirat
            }
            sys::RMDIR | sys::UNLINK => {
                self.e.load_slot(1, 1);
                self.e.mov_ri(0, AT_FDCWD);
                self.e
                    .mov_ri(2, if num == sys::RMDIR { 0x200 } else { 0 });
                self.e.mov_ri(8, 35); // unlinkat
            }
            _ => {
                for i in 0..6u8 {
                    self.e.load_slot(i, i as usize + 1);
                }
                let native = match num {
                    sys::READ => 63,
                    sys::WRITE => 64,
                    sys::CLOSE => 57,
                    sys::MMAP => 222,
                    sys::EXIT => 93,
                    sys::GETCWD => 17,
                    sys::GETDENTS64 => 61,
                    _ => unreachable!("ICE: unmapped syscall {}", num),
                };
                self.e.mov_ri(8, native);
            }
        }
        self.e.svc0();
        self.push_svc_triple();
    }

    fn emit_darwin_case(&mut self, num: i64) {
        let name = match num {
            sys::READ => "_read",
            sys::WRITE => "_write",
            sys::OPEN => "_open",
            sys::CLOSE => "_close",
            sys::STAT => "_stat",
            sys::MMAP => "_mmap",
            sys::EXIT => "_exit",
            sys::GETCWD => "_getcwd",
            sys::MKDIR => "_mkdir",
            sys::RMDIR => "_rmdir",
            sys::UNLINK => "_unlink",
            sys::GETDENTS64 => {
                // Directory listing goes through the runtime's readdir
                // wrappers on darwin.
                self.e.mov_ri(0, 0);
                self.e.op_push(0);
                self.e.op_push(0);
                self.e.mov_ri(1, 38);
                self.e.op_push(1);
                self.e.flush();
                return;
            }
            _ => unreachable!("ICE: unmapped syscall {}", num),
        };
        for i in 0..6u8 {
            self.e.load_slot(i, i as usize + 1);
        }
        self.call_import(name, 16);
        // libSystem returns -1 with errno behind __error().
        self.e.mov_rr(19, 0);
        self.e.mov_ri(1, -1);
        self.e.cmp_rr(0, 1);
        let err = self.e.b_cond(Cond::Eq);
        self.e.op_push(19);
        self.e.mov_ri(1, 0);
        self.e.op_push(1);
        self.e.op_push(1);
        self.e.flush();
        let done = self.e.b();
        let here = self.e.offset();
        self.e.patch_branch19(err, here);
        self.call_import("___error", 16);
        self.e.load(0, 0, 0, 4);
        self.e.mov_ri(1, 0);
        self.e.op_push(1);
        self.e.op_push(1);
        self.e.op_push(0);
        self.e.flush();
        let end = self.e.offset();
        self.e.patch_branch26(done, end);
    }

    fn emit_windows_case(&mut self, num: i64) {
        // Same kernel32 mapping as the x64 backend, AAPCS argument
        // registers in place of the Microsoft x64 ones.
        match num {
            sys::WRITE | sys::READ => {
                self.e.load_slot(0, 1);
                self.e.neg(0, 0);
                self.e.mov_ri(1, -10);
                self.e.add_rr(0, 0, 1);
                self.call_import("GetStdHandle", 16);
                self.e.load_slot(1, 2);
                self.e.load_slot(2, 3);
                self.e.slot_addr(3, 7);
                self.e.mov_ri(4, 0);
                let f = if num == sys::WRITE { "WriteFile" } else { "ReadFile" };
                self.call_import(f, 16);
                self.e.load_slot(0, 7);
                self.push_raw_triple();
            }
            sys::EXIT => {
                self.e.load_slot(0, 1);
                self.call_import("ExitProcess", 16);
            }
            sys::MMAP => {
                self.e.mov_ri(0, 0);
                self.e.load_slot(1, 2);
                self.e.mov_ri(2, 0x3000);
                self.e.mov_ri(3, 4);
                self.call_import("VirtualAlloc", 16);
                self.push_raw_triple();
            }
            sys::OPEN => {
                self.e.load_slot(0, 1);
                self.e.mov_ri(1, 0xC000_0000);
                self.e.mov_ri(2, 3);
                self.e.mov_ri(3, 0);
                self.e.mov_ri(4, 3); // OPEN_EXISTING
                self.e.mov_ri(5, 0x80);
                self.e.mov_ri(6, 0);
                self.call_import("CreateFileA", 16);
                self.push_raw_triple();
            }
            sys::CLOSE => {
                self.e.load_slot(0, 1);
                self.call_import("CloseHandle", 16);
                self.push_raw_triple();
            }
            sys::GETCWD => {
                self.e.load_slot(0, 2);
                self.e.load_slot(1, 1);
                self.call_import("GetCurrentDirectoryA", 16);
                self.push_raw_triple();
            }
            sys::MKDIR => {
                self.e.load_slot(0, 1);
                self.e.mov_ri(1, 0);
                self.call_import("CreateDirectoryA", 16);
                self.push_raw_triple();
            }
            sys::RMDIR => {
                self.e.load_slot(0, 1);
                self.call_import("RemoveDirectoryA", 16);
                self.push_raw_triple();
            }
            sys::UNLINK => {
                self.e.load_slot(0, 1);
                self.call_import("DeleteFileA", 16);
                self.push_raw_triple();
            }
            sys::STAT => {
                self.e.load_slot(0, 1);
                self.call_import("GetFileAttributesA", 16);
                self.push_raw_triple();
            }
            _ => {
                self.e.mov_ri(0, 0);
                self.e.op_push(0);
                self.e.op_push(0);
                self.e.mov_ri(1, 38);
                self.e.op_push(1);
                self.e.flush();
            }
        }
    }

    fn push_raw_triple(&mut self) {
        self.e.op_push(0);
        self.e.mov_ri(1, 0);
        self.e.op_push(1);
        self.e.op_push(1);
        self.e.flush();
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
    fn test_lower_linux_produces_text() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m, Flavor::Linux).unwrap();
        assert!(lowered.funcs.contains_key("main.main"));
        assert_eq!(lowered.text.len() % 4, 0);
        assert!(lowered.imports.is_empty());
    }

    #[test]
    fn test_darwin_start_imports_libsystem() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let lowered = lower(&m, Flavor::Darwin).unwrap();
        assert!(lowered.imports.iter().any(|i| i == "_mmap"));
        assert!(lowered.imports.iter().any(|i| i == "_exit"));
    }

    #[test]
    fn test_string_address_uses_adrp_pair() {
        let m = module_with(vec![
            Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: "hi".to_string(),
            },
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        let lowered = lower(&m, Flavor::Linux).unwrap();
        assert!(lowered
            .fixups
            .iter()
            .any(|f| f.name == TOK_RODATA_HEADER && f.kind == FixKind::A64AdrpAdd));
    }

    #[test]
    fn test_syscall_shim_dispatches_catalogue() {
        let mut code = Vec::new();
        for _ in 0..7 {
            code.push(Inst::with_val(Op::ConstI64, 0));
        }
        code.push(Inst::with_name(Op::Call, "runtime.Syscall", 7));
        for _ in 0..3 {
            code.push(Inst::new(Op::Drop));
        }
        code.push(Inst::new(Op::Return));
        let lowered = lower(&module_with(code), Flavor::Linux).unwrap();
        assert!(lowered.funcs.contains_key("runtime.Syscall"));
    }
}
