//! WebAssembly code generator (wasi/wasm32).
//!
//! Unlike the native backends, the IR operand stack maps onto the wasm
//! value stack directly; calls pass arguments and results through wasm
//! function types (multi-value for multi-return functions). Frame slots
//! that need addresses live on a shadow stack in linear memory behind a
//! mutable global stack pointer; a function containing `LOCAL_ADDR` keeps
//! all its slots there, otherwise slots are plain wasm locals.
//!
//! Layout of linear memory: a small scratch area (iovecs, out-params),
//! the string-literal region at 1024, the global slots, the 256 KiB
//! shadow stack, then the heap (grown with `memory.grow`, its base
//! exported as `__heap_base` for the bundled allocator).

use super::stackifier::{stackify, Node};
use super::{sys, Rodata};
use crate::buf::Buffer;
use crate::error::EmitError;
use crate::fixup::FixupError;
use crate::obj::wasm::{op, WasmModule, I32, I64};
use rtg_ir::{stack_effect, Inst, IrFunc, IrModule, Op};
use rustc_hash::FxHashMap;

const RODATA_BASE: u32 = 1024;
const SHADOW_SIZE: u32 = 256 * 1024;
const SCRATCH_IOV: i64 = 16;
const SCRATCH_OUT: i64 = 24;
const PANIC_HELPER: &str = "$panic$";
const SYSCALL_SHIM: &str = "runtime.Syscall";
const WASI: &str = "wasi_snapshot_preview1";

/// Lower a module to final WebAssembly bytes plus per-function sizes.
pub fn lower(module: &IrModule) -> Result<(Vec<u8>, Vec<(String, usize)>), EmitError> {
    WasmGen::new(module).run()
}

struct Layout {
    data_base: u32,
    shadow_top: u32,
    heap_base: u32,
    pages: u32,
}

struct WasmGen<'m> {
    module: &'m IrModule,
    rodata: Rodata,
    need_panic: bool,
    need_syscall: bool,
    func_index: FxHashMap<String, u32>,
    wasi: FxHashMap<&'static str, u32>,
    sp_global: u32,
}

impl<'m> WasmGen<'m> {
    fn new(module: &'m IrModule) -> Self {
        Self {
            module,
            rodata: Rodata::new(),
            need_panic: false,
            need_syscall: false,
            func_index: FxHashMap::default(),
            wasi: FxHashMap::default(),
            sp_global: 0,
        }
    }

    fn run(mut self) -> Result<(Vec<u8>, Vec<(String, usize)>), EmitError> {
        // Scan pass: intern every literal and decide which helpers and
        // imports the module needs before any index is assigned.
        for func in &self.module.funcs {
            for inst in &func.code {
                match inst.op {
                    Op::ConstStr => {
                        self.rodata.intern(&inst.name);
                    }
                    Op::Panic => self.need_panic = true,
                    Op::IfaceCall => {
                        self.need_panic = true;
                        self.rodata.intern("interface method not implemented");
                    }
                    Op::Call if inst.name == SYSCALL_SHIM => {
                        if !self.module.has_func(SYSCALL_SHIM) {
                            self.need_syscall = true;
                        }
                    }
                    _ => {}
                }
            }
        }
        if self.need_panic {
            self.rodata.intern("\n");
        }

        let rodata_size = self.rodata.size(4) as u32;
        let data_base = (RODATA_BASE + rodata_size + 7) & !7;
        let data_size = self.module.globals.len() as u32 * 4;
        let shadow_base = (data_base + data_size + 15) & !15;
        let shadow_top = shadow_base + SHADOW_SIZE;
        let heap_base = shadow_top;
        let layout = Layout {
            data_base,
            shadow_top,
            heap_base,
            pages: (heap_base + (1 << 20)).div_ceil(65536),
        };

        let mut wm = WasmModule::new();

        // Imports first: they own the low function indices.
        if self.need_panic || self.need_syscall {
            let rw = wm.func_type(vec![I32, I32, I32, I32], vec![I32]);
            let idx = wm.import_func(WASI, "fd_write", rw);
            self.wasi.insert("fd_write", idx);
            let exit = wm.func_type(vec![I32], vec![]);
            let idx = wm.import_func(WASI, "proc_exit", exit);
            self.wasi.insert("proc_exit", idx);
        }
        if self.need_syscall {
            let rw = wm.func_type(vec![I32, I32, I32, I32], vec![I32]);
            let idx = wm.import_func(WASI, "fd_read", rw);
            self.wasi.insert("fd_read", idx);
            let open = wm.func_type(
                vec![I32, I32, I32, I32, I32, I64, I64, I32, I32],
                vec![I32],
            );
            let idx = wm.import_func(WASI, "path_open", open);
            self.wasi.insert("path_open", idx);
            let close = wm.func_type(vec![I32], vec![I32]);
            let idx = wm.import_func(WASI, "fd_close", close);
            self.wasi.insert("fd_close", idx);
            let path3 = wm.func_type(vec![I32, I32, I32], vec![I32]);
            let idx = wm.import_func(WASI, "path_create_directory", path3);
            self.wasi.insert("path_create_directory", idx);
            let idx = wm.import_func(WASI, "path_remove_directory", path3);
            self.wasi.insert("path_remove_directory", idx);
            let idx = wm.import_func(WASI, "path_unlink_file", path3);
            self.wasi.insert("path_unlink_file", idx);
            let readdir = wm.func_type(vec![I32, I32, I32, I64, I32], vec![I32]);
            let idx = wm.import_func(WASI, "fd_readdir", readdir);
            self.wasi.insert("fd_readdir", idx);
            let fstat = wm.func_type(vec![I32, I32, I32, I32, I32], vec![I32]);
            let idx = wm.import_func(WASI, "path_filestat_get", fstat);
            self.wasi.insert("path_filestat_get", idx);
        }

        // Globals: SP behind the shadow stack, then the exported heap
        // base.
        self.sp_global = wm.add_global(true, layout.shadow_top as i64);
        let heap_global = wm.add_global(false, layout.heap_base as i64);

        // Index assignment: _start, module functions, then helpers.
        let start_ty = wm.func_type(vec![], vec![]);
        let start_idx = wm.declare_func(start_ty);
        self.func_index.insert("$start$".to_string(), start_idx);
        for func in &self.module.funcs {
            let params = vec![I32; func.params];
            let results = vec![I32; func.returns];
            let ty = wm.func_type(params, results);
            let idx = wm.declare_func(ty);
            self.func_index.insert(func.name.clone(), idx);
        }
        if self.need_panic {
            let ty = wm.func_type(vec![I32], vec![]);
            let idx = wm.declare_func(ty);
            self.func_index.insert(PANIC_HELPER.to_string(), idx);
        }
        if self.need_syscall {
            let ty = wm.func_type(vec![I32; 7], vec![I32; 3]);
            let idx = wm.declare_func(ty);
            self.func_index.insert(SYSCALL_SHIM.to_string(), idx);
        }

        wm.set_memory(layout.pages);
        wm.export_memory("memory");
        wm.export_func("_start", start_idx);
        wm.export_global("__heap_base", heap_global);

        // Bodies, in declaration order.
        let mut sizes = Vec::new();
        let start_body = self.emit_start_body();
        wm.add_body(0, start_body.as_slice());
        for func in &self.module.funcs {
            let (locals, body) = self.emit_func_body(func, &layout)?;
            sizes.push((func.name.clone(), body.len()));
            wm.add_body(locals, body.as_slice());
        }
        if self.need_panic {
            let body = self.emit_panic_body();
            wm.add_body(0, body.as_slice());
        }
        if self.need_syscall {
            let body = self.emit_syscall_body(&layout);
            wm.add_body(2, body.as_slice());
        }

        wm.add_data(RODATA_BASE, self.rodata.serialize(RODATA_BASE as u64, 4));

        Ok((wm.emit(), sizes))
    }

    fn call_index(&self, name: &str) -> Result<u32, EmitError> {
        self.func_index
            .get(name)
            .copied()
            .ok_or_else(|| EmitError::Fixup(FixupError::Unresolved(name.to_string())))
    }

    fn wasi_index(&self, name: &str) -> u32 {
        self.wasi[name]
    }

    // ── body emission ────────────────────────────────────────────────

    fn emit_start_body(&self) -> Buffer {
        let mut b = Buffer::new();
        for root in super::init_call_order(self.module) {
            if let Some(&idx) = self.func_index.get(&root) {
                b.put_u8(op::CALL);
                b.put_uleb(idx as u64);
            }
        }
        b
    }

    /// Per-label operand-stack depths, for typed blocks in the
    /// stackifier.
    fn label_depths(&self, func: &IrFunc) -> FxHashMap<i64, i64> {
        let mut depths = FxHashMap::default();
        let rets = |name: &str| self.module.ret_count(name);
        loop {
            let mut changed = false;
            let mut cur: Option<i64> = Some(func.params as i64);
            let mut record = |depths: &mut FxHashMap<i64, i64>, label: i64, d: i64| {
                if !depths.contains_key(&label) {
                    depths.insert(label, d);
                    true
                } else {
                    false
                }
            };
            for inst in &func.code {
                match inst.op {
                    Op::Label => {
                        if let Some(c) = cur {
                            changed |= record(&mut depths, inst.arg, c);
                        }
                        cur = depths.get(&inst.arg).copied().or(cur);
                    }
                    Op::Jmp => {
                        if let Some(c) = cur {
                            changed |= record(&mut depths, inst.arg, c);
                        }
                        cur = None;
                    }
                    Op::JmpIf | Op::JmpIfNot => {
                        if let Some(c) = cur {
                            changed |= record(&mut depths, inst.arg, c - 1);
                            cur = Some(c - 1);
                        }
                    }
                    Op::Return | Op::Panic => cur = None,
                    _ => {
                        if let Some(c) = cur {
                            let (pops, pushes) = stack_effect(inst, &rets);
                            cur = Some(c - pops as i64 + pushes as i64);
                        }
                    }
                }
            }
            if !changed {
                return depths;
            }
        }
    }

    fn emit_func_body(&self, func: &IrFunc, layout: &Layout) -> Result<(u32, Buffer), EmitError> {
        let shadow = func.code.iter().any(|i| i.op == Op::LocalAddr);
        let max_iface_args = func
            .code
            .iter()
            .filter(|i| i.op == Op::IfaceCall)
            .map(|i| i.arg as usize)
            .max()
            .unwrap_or(0);

        // Local index plan: wasm params mirror IR params; declared slots
        // follow (unless everything lives on the shadow stack), then the
        // scratch locals.
        let declared = if shadow {
            0
        } else {
            func.locals.len() - func.params
        };
        let scratch0 = if shadow {
            func.params as u32
        } else {
            func.locals.len() as u32
        };
        let extra = declared as u32 + 2 + max_iface_args as u32;

        let ctx = FuncCtx {
            shadow,
            frame: (func.locals.len() * 4) as i64,
            tmp0: scratch0,
            tmp1: scratch0 + 1,
            argtmp: scratch0 + 2,
        };

        let mut b = Buffer::new();
        if shadow && ctx.frame > 0 {
            // sp -= frame
            b.put_u8(op::GLOBAL_GET);
            b.put_uleb(self.sp_global as u64);
            i32c(&mut b, ctx.frame);
            b.put_u8(op::I32_SUB);
            b.put_u8(op::GLOBAL_SET);
            b.put_uleb(self.sp_global as u64);
        }
        // The caller's arguments arrive as wasm params; the body's
        // leading LOCAL_SETs expect them on the operand stack.
        for i in 0..func.params {
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(i as u64);
        }

        let depths = self.label_depths(func);
        let tree = stackify(&func.code, &depths);
        self.emit_nodes(&mut b, func, &tree, &ctx, layout)?;

        // A function falling off the end has already returned on every
        // path; keep the validator happy at the implicit end.
        b.put_u8(op::UNREACHABLE);
        Ok((extra, b))
    }

    fn emit_nodes(
        &self,
        b: &mut Buffer,
        func: &IrFunc,
        nodes: &[Node],
        ctx: &FuncCtx,
        layout: &Layout,
    ) -> Result<(), EmitError> {
        for node in nodes {
            match node {
                Node::Inst(i) => self.emit_inst(b, func, &func.code[*i], ctx, layout)?,
                Node::Block { arity, body } => {
                    b.put_u8(op::BLOCK);
                    b.put_u8(if *arity == 1 { I32 } else { op::BLOCKTYPE_EMPTY });
                    self.emit_nodes(b, func, body, ctx, layout)?;
                    b.put_u8(op::END);
                }
                Node::Loop { body } => {
                    b.put_u8(op::LOOP);
                    b.put_u8(op::BLOCKTYPE_EMPTY);
                    self.emit_nodes(b, func, body, ctx, layout)?;
                    b.put_u8(op::END);
                }
                Node::If { then, els } => {
                    b.put_u8(op::IF);
                    b.put_u8(I32);
                    self.emit_nodes(b, func, then, ctx, layout)?;
                    b.put_u8(op::ELSE);
                    self.emit_nodes(b, func, els, ctx, layout)?;
                    b.put_u8(op::END);
                }
                Node::Br(depth) => {
                    b.put_u8(op::BR);
                    b.put_uleb(*depth as u64);
                }
                Node::BrIf(depth) => {
                    b.put_u8(op::BR_IF);
                    b.put_uleb(*depth as u64);
                }
                Node::BrIfNot(depth) => {
                    b.put_u8(op::I32_EQZ);
                    b.put_u8(op::BR_IF);
                    b.put_uleb(*depth as u64);
                }
            }
        }
        Ok(())
    }

    fn emit_inst(
        &self,
        b: &mut Buffer,
        func: &IrFunc,
        inst: &Inst,
        ctx: &FuncCtx,
        layout: &Layout,
    ) -> Result<(), EmitError> {
        match inst.op {
            Op::Label | Op::Jmp | Op::JmpIf | Op::JmpIfNot => {
                unreachable!("ICE: control opcode left in stackified tree")
            }
            Op::ConstI64 | Op::ConstBool => i32c(b, inst.val as i32 as i64),
            Op::ConstStr => {
                let idx = self
                    .rodata_index(&inst.name)
                    .expect("ICE: literal missed by the scan pass");
                let addr =
                    RODATA_BASE as i64 + self.rodata.headers_offset(4) as i64 + idx as i64 * 8;
                i32c(b, addr);
            }
            Op::LocalGet => {
                if ctx.shadow {
                    b.put_u8(op::GLOBAL_GET);
                    b.put_uleb(self.sp_global as u64);
                    b.put_u8(op::I32_LOAD);
                    memarg(b, 2, inst.arg as u64 * 4);
                } else {
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(inst.arg as u64);
                }
            }
            Op::LocalSet => {
                if ctx.shadow {
                    b.put_u8(op::LOCAL_SET);
                    b.put_uleb(ctx.tmp0 as u64);
                    b.put_u8(op::GLOBAL_GET);
                    b.put_uleb(self.sp_global as u64);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(ctx.tmp0 as u64);
                    b.put_u8(op::I32_STORE);
                    memarg(b, 2, inst.arg as u64 * 4);
                } else {
                    b.put_u8(op::LOCAL_SET);
                    b.put_uleb(inst.arg as u64);
                }
            }
            Op::LocalAddr => {
                b.put_u8(op::GLOBAL_GET);
                b.put_uleb(self.sp_global as u64);
                i32c(b, inst.arg * 4);
                b.put_u8(op::I32_ADD);
            }
            Op::GlobalGet => {
                i32c(b, layout.data_base as i64 + inst.arg * 4);
                b.put_u8(op::I32_LOAD);
                memarg(b, 2, 0);
            }
            Op::GlobalSet => {
                b.put_u8(op::LOCAL_SET);
                b.put_uleb(ctx.tmp0 as u64);
                i32c(b, layout.data_base as i64 + inst.arg * 4);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp0 as u64);
                b.put_u8(op::I32_STORE);
                memarg(b, 2, 0);
            }
            Op::GlobalAddr => i32c(b, layout.data_base as i64 + inst.arg * 4),
            Op::Add => b.put_u8(op::I32_ADD),
            Op::Sub => b.put_u8(op::I32_SUB),
            Op::Mul => b.put_u8(op::I32_MUL),
            Op::Div => b.put_u8(op::I32_DIV_S),
            Op::Rem => b.put_u8(op::I32_REM_S),
            Op::BitAnd => b.put_u8(op::I32_AND),
            Op::BitOr => b.put_u8(op::I32_OR),
            Op::BitXor => b.put_u8(op::I32_XOR),
            Op::Shl => b.put_u8(op::I32_SHL),
            Op::Shr => b.put_u8(op::I32_SHR_U),
            Op::Eq => b.put_u8(op::I32_EQ),
            Op::Ne => b.put_u8(op::I32_NE),
            Op::Lt => b.put_u8(op::I32_LT_S),
            Op::Le => b.put_u8(op::I32_LE_S),
            Op::Gt => b.put_u8(op::I32_GT_S),
            Op::Ge => b.put_u8(op::I32_GE_S),
            Op::Not => b.put_u8(op::I32_EQZ),
            Op::Neg => {
                i32c(b, -1);
                b.put_u8(op::I32_MUL);
            }
            Op::Comp => {
                i32c(b, -1);
                b.put_u8(op::I32_XOR);
            }
            Op::Load => {
                match inst.width {
                    1 => b.put_u8(op::I32_LOAD8_U),
                    2 => b.put_u8(op::I32_LOAD16_U),
                    _ => b.put_u8(op::I32_LOAD),
                }
                memarg(b, if inst.width == 1 { 0 } else { 1 }, 0);
            }
            Op::Store => {
                match inst.width {
                    1 => b.put_u8(op::I32_STORE8),
                    2 => b.put_u8(op::I32_STORE16),
                    _ => b.put_u8(op::I32_STORE),
                }
                memarg(b, if inst.width == 1 { 0 } else { 1 }, 0);
            }
            Op::Offset => {
                i32c(b, inst.arg);
                b.put_u8(op::I32_ADD);
            }
            Op::IndexAddr => {
                b.put_u8(op::LOCAL_SET);
                b.put_uleb(ctx.tmp0 as u64);
                b.put_u8(op::I32_LOAD);
                memarg(b, 2, 0);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp0 as u64);
                if inst.arg != 1 {
                    i32c(b, inst.arg);
                    b.put_u8(op::I32_MUL);
                }
                b.put_u8(op::I32_ADD);
            }
            Op::Len => {
                b.put_u8(op::I32_LOAD);
                memarg(b, 2, 4);
            }
            Op::Cap => {
                b.put_u8(op::I32_LOAD);
                memarg(b, 2, 8);
            }
            Op::Dup => {
                b.put_u8(op::LOCAL_TEE);
                b.put_uleb(ctx.tmp0 as u64);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp0 as u64);
            }
            Op::Drop => b.put_u8(op::DROP),
            Op::Call => {
                if inst.name.starts_with(rtg_ir::BUILTIN_COMPOSITE_PREFIX) {
                    return self.emit_composite(b, inst.arg, ctx);
                }
                let idx = self.call_index(&inst.name)?;
                b.put_u8(op::CALL);
                b.put_uleb(idx as u64);
            }
            Op::Return => {
                if ctx.shadow && ctx.frame > 0 {
                    b.put_u8(op::GLOBAL_GET);
                    b.put_uleb(self.sp_global as u64);
                    i32c(b, ctx.frame);
                    b.put_u8(op::I32_ADD);
                    b.put_u8(op::GLOBAL_SET);
                    b.put_uleb(self.sp_global as u64);
                }
                b.put_u8(op::RETURN);
            }
            Op::Panic => {
                let idx = self.call_index(PANIC_HELPER)?;
                b.put_u8(op::CALL);
                b.put_uleb(idx as u64);
                b.put_u8(op::UNREACHABLE);
            }
            Op::IfaceCall => self.emit_iface_call(b, func, inst, ctx)?,
            Op::IfaceBox => {
                b.put_u8(op::LOCAL_SET);
                b.put_uleb(ctx.tmp0 as u64);
                i32c(b, 8);
                let alloc = self.call_index("runtime.Alloc")?;
                b.put_u8(op::CALL);
                b.put_uleb(alloc as u64);
                b.put_u8(op::LOCAL_TEE);
                b.put_uleb(ctx.tmp1 as u64);
                i32c(b, inst.arg);
                b.put_u8(op::I32_STORE);
                memarg(b, 2, 0);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp1 as u64);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp0 as u64);
                b.put_u8(op::I32_STORE);
                memarg(b, 2, 4);
                b.put_u8(op::LOCAL_GET);
                b.put_uleb(ctx.tmp1 as u64);
            }
            Op::Convert => match inst.width {
                1 => {
                    i32c(b, 0xff);
                    b.put_u8(op::I32_AND);
                }
                2 => {
                    i32c(b, 0xffff);
                    b.put_u8(op::I32_AND);
                }
                _ => {}
            },
        }
        Ok(())
    }

    fn rodata_index(&self, s: &str) -> Option<usize> {
        self.rodata.lookup(s)
    }

    fn emit_composite(&self, b: &mut Buffer, n: i64, ctx: &FuncCtx) -> Result<(), EmitError> {
        i32c(b, n * 4);
        let alloc = self.call_index("runtime.Alloc")?;
        b.put_u8(op::CALL);
        b.put_uleb(alloc as u64);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(ctx.tmp1 as u64);
        for i in (0..n).rev() {
            b.put_u8(op::LOCAL_SET);
            b.put_uleb(ctx.tmp0 as u64);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(ctx.tmp1 as u64);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(ctx.tmp0 as u64);
            b.put_u8(op::I32_STORE);
            memarg(b, 2, (i * 4) as u64);
        }
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(ctx.tmp1 as u64);
        Ok(())
    }

    /// Nested `if/else` chain over the implementing type ids; the boxed
    /// receiver and arguments are parked in scratch locals first.
    fn emit_iface_call(
        &self,
        b: &mut Buffer,
        _func: &IrFunc,
        inst: &Inst,
        ctx: &FuncCtx,
    ) -> Result<(), EmitError> {
        let nargs = inst.arg as usize;
        let method = inst.name.rsplit('.').next().unwrap_or("");
        let impls = self.module.iface_impls(method);

        for j in (0..nargs).rev() {
            b.put_u8(op::LOCAL_SET);
            b.put_uleb((ctx.argtmp as usize + j) as u64);
        }
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(ctx.tmp1 as u64); // box
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(ctx.tmp1 as u64);
        b.put_u8(op::I32_LOAD);
        memarg(b, 2, 0);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(ctx.tmp0 as u64); // type id

        for (tid, target) in impls.iter() {
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(ctx.tmp0 as u64);
            i32c(b, *tid);
            b.put_u8(op::I32_EQ);
            b.put_u8(op::IF);
            b.put_u8(I32);
            // Receiver value, then the parked arguments.
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(ctx.tmp1 as u64);
            b.put_u8(op::I32_LOAD);
            memarg(b, 2, 4);
            for j in 0..nargs {
                b.put_u8(op::LOCAL_GET);
                b.put_uleb((ctx.argtmp as usize + j) as u64);
            }
            let idx = self.call_index(target)?;
            b.put_u8(op::CALL);
            b.put_uleb(idx as u64);
            b.put_u8(op::ELSE);
        }
        b.put_u8(op::UNREACHABLE);
        for _ in &impls {
            b.put_u8(op::END);
        }
        Ok(())
    }

    /// `(hdr) -> !`: fd_write the message and a newline to stderr, then
    /// proc_exit(2).
    fn emit_panic_body(&self) -> Buffer {
        let mut b = Buffer::new();
        // iovec { data, len } at the scratch slot
        i32c(&mut b, SCRATCH_IOV);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(0);
        b.put_u8(op::I32_LOAD);
        memarg(&mut b, 2, 0);
        b.put_u8(op::I32_STORE);
        memarg(&mut b, 2, 0);
        i32c(&mut b, SCRATCH_IOV);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(0);
        b.put_u8(op::I32_LOAD);
        memarg(&mut b, 2, 4);
        b.put_u8(op::I32_STORE);
        memarg(&mut b, 2, 4);
        self.emit_fd_write_iov(&mut b);

        // newline
        let nl = self.rodata.lookup("\n").expect("ICE: newline literal");
        let (off, _) = self.rodata.literal_span(nl);
        i32c(&mut b, SCRATCH_IOV);
        i32c(&mut b, RODATA_BASE as i64 + off as i64);
        b.put_u8(op::I32_STORE);
        memarg(&mut b, 2, 0);
        i32c(&mut b, SCRATCH_IOV);
        i32c(&mut b, 1);
        b.put_u8(op::I32_STORE);
        memarg(&mut b, 2, 4);
        self.emit_fd_write_iov(&mut b);

        i32c(&mut b, 2);
        b.put_u8(op::CALL);
        b.put_uleb(self.wasi_index("proc_exit") as u64);
        b.put_u8(op::UNREACHABLE);
        b
    }

    fn emit_fd_write_iov(&self, b: &mut Buffer) {
        i32c(b, 2); // stderr
        i32c(b, SCRATCH_IOV);
        i32c(b, 1);
        i32c(b, SCRATCH_OUT);
        b.put_u8(op::CALL);
        b.put_uleb(self.wasi_index("fd_write") as u64);
        b.put_u8(op::DROP);
    }

    /// `runtime.Syscall(num, a1..a6) -> (r1, r2, errno)`.
    ///
    /// Linux-style flags translate into WASI `oflags` with branchless bit
    /// shuffling, and absolute paths run through the first pre-opened
    /// directory (fd 3) with the leading `/` stripped.
    fn emit_syscall_body(&self, _layout: &Layout) -> Buffer {
        // Locals: 0..6 params; 7 = path/scratch, 8 = length/scratch.
        let p = 7u64;
        let len = 8u64;
        let mut b = Buffer::new();

        let case = |b: &mut Buffer, num: i64| {
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(0);
            i32c(b, num);
            b.put_u8(op::I32_EQ);
            b.put_u8(op::IF);
            b.put_u8(op::BLOCKTYPE_EMPTY);
        };

        // write / read: iovec in scratch memory.
        for (num, import) in [(sys::WRITE, "fd_write"), (sys::READ, "fd_read")] {
            case(&mut b, num);
            i32c(&mut b, SCRATCH_IOV);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(2);
            b.put_u8(op::I32_STORE);
            memarg(&mut b, 2, 0);
            i32c(&mut b, SCRATCH_IOV);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(3);
            b.put_u8(op::I32_STORE);
            memarg(&mut b, 2, 4);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(1);
            i32c(&mut b, SCRATCH_IOV);
            i32c(&mut b, 1);
            i32c(&mut b, SCRATCH_OUT);
            b.put_u8(op::CALL);
            b.put_uleb(self.wasi_index(import) as u64);
            b.put_u8(op::LOCAL_SET);
            b.put_uleb(len);
            i32c(&mut b, SCRATCH_OUT);
            b.put_u8(op::I32_LOAD);
            memarg(&mut b, 2, 0);
            i32c(&mut b, 0);
            b.put_u8(op::LOCAL_GET);
            b.put_uleb(len);
            b.put_u8(op::RETURN);
            b.put_u8(op::END);
        }

        // exit
        case(&mut b, sys::EXIT);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(1);
        b.put_u8(op::CALL);
        b.put_uleb(self.wasi_index("proc_exit") as u64);
        b.put_u8(op::UNREACHABLE);
        b.put_u8(op::END);

        // close
        case(&mut b, sys::CLOSE);
        i32c(&mut b, 0);
        i32c(&mut b, 0);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(1);
        b.put_u8(op::CALL);
        b.put_uleb(self.wasi_index("fd_close") as u64);
        b.put_u8(op::RETURN);
        b.put_u8(op::END);

        // mmap: memory.grow, returning the old end of memory.
        case(&mut b, sys::MMAP);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(2);
        i32c(&mut b, 65535);
        b.put_u8(op::I32_ADD);
        i32c(&mut b, 16);
        b.put_u8(op::I32_SHR_U);
        b.put_u8(op::MEMORY_GROW);
        b.put_u8(0);
        i32c(&mut b, 16);
        b.put_u8(op::I32_SHL);
        i32c(&mut b, 0);
        i32c(&mut b, 0);
        b.put_u8(op::RETURN);
        b.put_u8(op::END);

        // Path-taking calls share the strip-leading-slash + strlen
        // prelude.
        for (num, import) in [
            (sys::OPEN, "path_open"),
            (sys::MKDIR, "path_create_directory"),
            (sys::RMDIR, "path_remove_directory"),
            (sys::UNLINK, "path_unlink_file"),
            (sys::STAT, "path_filestat_get"),
        ] {
            case(&mut b, num);
            self.emit_path_prelude(&mut b, p, len);
            match num {
                sys::OPEN => {
                    i32c(&mut b, 3); // pre-opened dir
                    i32c(&mut b, 1); // follow symlinks
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(p);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    // oflags = ((flags>>6)&9) | ((flags>>15)&2):
                    // O_CREAT=64 -> CREAT|TRUNC bits, O_DIRECTORY=65536 ->
                    // DIRECTORY, branchless.
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(2);
                    i32c(&mut b, 6);
                    b.put_u8(op::I32_SHR_U);
                    i32c(&mut b, 9);
                    b.put_u8(op::I32_AND);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(2);
                    i32c(&mut b, 15);
                    b.put_u8(op::I32_SHR_U);
                    i32c(&mut b, 2);
                    b.put_u8(op::I32_AND);
                    b.put_u8(op::I32_OR);
                    // full rights, no fdflags, fd out-param
                    b.put_u8(op::I64_CONST);
                    b.put_sleb(-1);
                    b.put_u8(op::I64_CONST);
                    b.put_sleb(-1);
                    i32c(&mut b, 0);
                    i32c(&mut b, SCRATCH_OUT);
                    b.put_u8(op::CALL);
                    b.put_uleb(self.wasi_index(import) as u64);
                    b.put_u8(op::LOCAL_SET);
                    b.put_uleb(len);
                    i32c(&mut b, SCRATCH_OUT);
                    b.put_u8(op::I32_LOAD);
                    memarg(&mut b, 2, 0);
                    i32c(&mut b, 0);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    b.put_u8(op::RETURN);
                }
                sys::STAT => {
                    i32c(&mut b, 3);
                    i32c(&mut b, 1);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(p);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(2); // stat buffer
                    b.put_u8(op::CALL);
                    b.put_uleb(self.wasi_index(import) as u64);
                    b.put_u8(op::LOCAL_SET);
                    b.put_uleb(len);
                    i32c(&mut b, 0);
                    i32c(&mut b, 0);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    b.put_u8(op::RETURN);
                }
                _ => {
                    i32c(&mut b, 3);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(p);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    b.put_u8(op::CALL);
                    b.put_uleb(self.wasi_index(import) as u64);
                    b.put_u8(op::LOCAL_SET);
                    b.put_uleb(len);
                    i32c(&mut b, 0);
                    i32c(&mut b, 0);
                    b.put_u8(op::LOCAL_GET);
                    b.put_uleb(len);
                    b.put_u8(op::RETURN);
                }
            }
            b.put_u8(op::END);
        }

        // getdents64 → fd_readdir
        case(&mut b, sys::GETDENTS64);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(1);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(2);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(3);
        b.put_u8(op::I64_CONST);
        b.put_sleb(0);
        i32c(&mut b, SCRATCH_OUT);
        b.put_u8(op::CALL);
        b.put_uleb(self.wasi_index("fd_readdir") as u64);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(len);
        i32c(&mut b, SCRATCH_OUT);
        b.put_u8(op::I32_LOAD);
        memarg(&mut b, 2, 0);
        i32c(&mut b, 0);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(len);
        b.put_u8(op::RETURN);
        b.put_u8(op::END);

        // Anything else (getcwd has no WASI shape): (0, 0, ENOSYS).
        i32c(&mut b, 0);
        i32c(&mut b, 0);
        i32c(&mut b, 38);
        b.put_u8(op::RETURN);
        b
    }

    /// `p = a1 + (a1[0] == '/')`, `len = strlen(p)`.
    fn emit_path_prelude(&self, b: &mut Buffer, p: u64, len: u64) {
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(1);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(1);
        b.put_u8(op::I32_LOAD8_U);
        memarg(b, 0, 0);
        i32c(b, '/' as i64);
        b.put_u8(op::I32_EQ);
        b.put_u8(op::I32_ADD);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(p);

        i32c(b, 0);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(len);
        b.put_u8(op::BLOCK);
        b.put_u8(op::BLOCKTYPE_EMPTY);
        b.put_u8(op::LOOP);
        b.put_u8(op::BLOCKTYPE_EMPTY);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(p);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(len);
        b.put_u8(op::I32_ADD);
        b.put_u8(op::I32_LOAD8_U);
        memarg(b, 0, 0);
        b.put_u8(op::I32_EQZ);
        b.put_u8(op::BR_IF);
        b.put_uleb(1);
        b.put_u8(op::LOCAL_GET);
        b.put_uleb(len);
        i32c(b, 1);
        b.put_u8(op::I32_ADD);
        b.put_u8(op::LOCAL_SET);
        b.put_uleb(len);
        b.put_u8(op::BR);
        b.put_uleb(0);
        b.put_u8(op::END);
        b.put_u8(op::END);
    }
}

struct FuncCtx {
    shadow: bool,
    frame: i64,
    tmp0: u32,
    tmp1: u32,
    argtmp: u32,
}

fn i32c(b: &mut Buffer, v: i64) {
    b.put_u8(op::I32_CONST);
    b.put_sleb(v as i32 as i64);
}

fn memarg(b: &mut Buffer, align: u64, offset: u64) {
    b.put_uleb(align);
    b.put_uleb(offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ir::IrFunc;

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
    fn test_emits_valid_header() {
        let m = module_with(vec![Inst::new(Op::Return)]);
        let (bytes, sizes) = lower(&m).unwrap();
        assert_eq!(&bytes[..4], b"\0asm");
        assert_eq!(sizes.len(), 1);
    }

    #[test]
    fn test_unresolved_call_is_backend_error() {
        let m = module_with(vec![
            Inst::with_name(Op::Call, "runtime.Bogus", 0),
            Inst::new(Op::Drop),
            Inst::new(Op::Return),
        ]);
        assert!(lower(&m).is_err());
    }

    #[test]
    fn test_panic_pulls_wasi_imports() {
        let m = module_with(vec![
            Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: "boom".to_string(),
            },
            Inst::new(Op::Panic),
        ]);
        let (bytes, _) = lower(&m).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("wasi_snapshot_preview1"));
        assert!(text.contains("proc_exit"));
        assert!(text.contains("_start"));
    }
}
