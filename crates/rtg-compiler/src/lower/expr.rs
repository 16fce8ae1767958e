//! Expression lowering.
//!
//! Postfix emission onto the abstract operand stack. String operators are
//! rewritten to runtime calls before emission, short-circuit operators
//! lower to the branch idiom the WebAssembly backend recognizes, and
//! composite literals expand per shape (slice append chain, map set chain,
//! `builtin.composite.*` constructor).

use super::FuncLowerer;
use crate::consts::ConstValue;
use crate::prepass::FuncSig;
use rtg_ast::{BinOp, CompositeElem, Expr, TypeExpr, UnOp};
use rtg_ir::{Inst, Op};

impl<'a> FuncLowerer<'a> {
    /// Lower an expression that must produce exactly one value.
    pub fn lower_expr(&mut self, e: &Expr) {
        let rets = self.lower_expr_multi(e);
        match rets {
            1 => {}
            0 => self.error_value(format!("expression produces no value: {:?}", kind_of(e))),
            n => {
                self.error(format!(
                    "multi-value expression in single-value context ({} values)",
                    n
                ));
                for _ in 1..n {
                    self.emit(Inst::new(Op::Drop));
                }
            }
        }
    }

    /// Lower an expression, returning how many values it left on the
    /// stack. Only calls (and map reads) can differ from 1.
    pub fn lower_expr_multi(&mut self, e: &Expr) -> usize {
        match e {
            Expr::IntLit(v) => {
                self.emit(Inst::with_val(Op::ConstI64, *v));
                1
            }
            Expr::StringLit(s) => {
                self.emit(Inst {
                    op: Op::ConstStr,
                    arg: 0,
                    width: 0,
                    val: 0,
                    name: s.clone(),
                });
                1
            }
            Expr::BoolLit(b) => {
                self.emit(Inst::with_val(Op::ConstBool, *b as i64));
                1
            }
            Expr::Nil => {
                self.emit(Inst::new(Op::ConstI64));
                1
            }
            Expr::Iota => {
                self.error_value("iota outside const declaration".to_string());
                1
            }
            Expr::Ident(name) => {
                self.lower_ident_read(name);
                1
            }
            Expr::Selector { base, name } => {
                self.lower_field_read(base, name);
                1
            }
            Expr::Index { base, index } => self.lower_index_read(base, index),
            Expr::SliceExpr { base, lo, hi } => {
                self.lower_slice_expr(base, lo.as_deref(), hi.as_deref());
                1
            }
            Expr::Call {
                callee,
                args,
                spread,
            } => self.lower_call(callee, args, *spread),
            Expr::Binary { op, lhs, rhs } => {
                self.lower_binary(*op, lhs, rhs);
                1
            }
            Expr::Unary { op, operand } => {
                self.lower_unary(*op, operand);
                1
            }
            Expr::Composite { ty, elems } => {
                self.lower_composite(ty, elems);
                1
            }
            Expr::Addr(inner) => {
                self.lower_addr(inner);
                1
            }
            Expr::Deref(inner) => {
                self.lower_deref(inner);
                1
            }
            Expr::Conv { ty, arg } => {
                self.lower_conv(ty, arg);
                1
            }
            Expr::Make { ty, len, cap } => {
                self.lower_make(ty, len.as_deref(), cap.as_deref());
                1
            }
        }
    }

    fn lower_ident_read(&mut self, name: &str) {
        if let Some(index) = self.lookup(name) {
            self.emit(Inst::with_arg(Op::LocalGet, index as i64));
            return;
        }
        let qualified = self.qualify(name);
        if let Some(info) = self.tables.globals.get(&qualified) {
            let idx = info.index as i64;
            self.emit(Inst::with_arg(Op::GlobalGet, idx));
            return;
        }
        match self.tables.consts.get(&qualified).cloned() {
            Some(ConstValue::Int(v)) => self.emit(Inst::with_val(Op::ConstI64, v)),
            Some(ConstValue::Bool(b)) => self.emit(Inst::with_val(Op::ConstBool, b as i64)),
            Some(ConstValue::Str(s)) => self.emit(Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: s,
            }),
            None => self.error_value(format!("undefined: {}", name)),
        }
    }

    /// Struct-field read: byte offset is declared-field position times the
    /// word size; pointer and value bases are interchangeable here.
    fn lower_field_read(&mut self, base: &Expr, field: &str) {
        let concrete = match self.concrete_type_of(base) {
            Some(c) => c,
            None => {
                self.error_value(format!("cannot resolve receiver type of .{}", field));
                return;
            }
        };
        let offset = match self.tables.field_offset(&concrete, field, self.word) {
            Some(o) => o,
            None => {
                self.error_value(format!("{} has no field {}", concrete, field));
                return;
            }
        };
        self.lower_expr(base);
        if offset != 0 {
            self.emit(Inst::with_arg(Op::Offset, offset));
        }
        self.emit(Inst::new(Op::Load));
    }

    /// Indexed read. Map reads go through `runtime.MapGet`; in
    /// single-value context the `ok` flag is dropped by the caller.
    pub(crate) fn lower_index_read(&mut self, base: &Expr, index: &Expr) -> usize {
        match self.expr_type(base) {
            Some(TypeExpr::Map(_, _)) => {
                self.lower_expr(base);
                self.lower_expr(index);
                self.emit(Inst::with_name(Op::Call, "runtime.MapGet", 2));
                // Default read keeps only the value; two-value forms
                // (`v, ok := m[k]`) are handled by the definition lowering.
                self.emit(Inst::new(Op::Drop));
                1
            }
            other => {
                let esz = match other {
                    Some(TypeExpr::Named(ref n)) if n == "string" => 1,
                    Some(TypeExpr::Slice(elem)) => elem.elem_size(self.word),
                    _ => self.word,
                };
                self.lower_expr(base);
                self.lower_expr(index);
                self.emit(Inst::with_arg(Op::IndexAddr, esz));
                self.emit(Inst {
                    op: Op::Load,
                    arg: 0,
                    width: if esz < self.word { esz as u8 } else { 0 },
                    val: 0,
                    name: String::new(),
                });
                1
            }
        }
    }

    /// Map read that keeps both the value and the `ok` flag.
    pub(crate) fn lower_map_get_both(&mut self, base: &Expr, index: &Expr) {
        self.lower_expr(base);
        self.lower_expr(index);
        self.emit(Inst::with_name(Op::Call, "runtime.MapGet", 2));
    }

    fn lower_slice_expr(&mut self, base: &Expr, lo: Option<&Expr>, hi: Option<&Expr>) {
        let is_string = self.is_string_expr(base);
        self.lower_expr(base);
        match lo {
            Some(e) => self.lower_expr(e),
            None => self.emit(Inst::new(Op::ConstI64)),
        }
        match hi {
            Some(e) => self.lower_expr(e),
            None => {
                self.lower_expr(base);
                self.emit(Inst::new(Op::Len));
            }
        }
        let callee = if is_string {
            "runtime.StringSlice"
        } else {
            "runtime.SliceReslice"
        };
        self.emit(Inst::with_name(Op::Call, callee, 3));
    }

    fn lower_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        if op.is_logical() {
            return self.lower_short_circuit(op, lhs, rhs);
        }

        // String operators are rewritten to runtime calls; the detection is
        // purely syntactic/context-driven.
        if self.is_string_expr(lhs) || self.is_string_expr(rhs) {
            match op {
                BinOp::Add => {
                    self.lower_expr(lhs);
                    self.lower_expr(rhs);
                    self.emit(Inst::with_name(Op::Call, "runtime.StringConcat", 2));
                    return;
                }
                BinOp::Eq | BinOp::Ne => {
                    self.lower_expr(lhs);
                    self.lower_expr(rhs);
                    self.emit(Inst::with_name(Op::Call, "runtime.StringEqual", 2));
                    if op == BinOp::Ne {
                        self.emit(Inst::new(Op::Not));
                    }
                    return;
                }
                _ => {}
            }
        }

        self.lower_expr(lhs);
        self.lower_expr(rhs);
        let width = self.width_of(lhs).max(self.width_of(rhs));
        let opcode = match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Rem => Op::Rem,
            BinOp::BitAnd => Op::BitAnd,
            BinOp::BitOr => Op::BitOr,
            BinOp::BitXor => Op::BitXor,
            BinOp::Shl => Op::Shl,
            BinOp::Shr => Op::Shr,
            BinOp::Eq => Op::Eq,
            BinOp::Ne => Op::Ne,
            BinOp::Lt => Op::Lt,
            BinOp::Le => Op::Le,
            BinOp::Gt => Op::Gt,
            BinOp::Ge => Op::Ge,
            BinOp::LogAnd | BinOp::LogOr => unreachable!(),
        };
        self.emit(Inst {
            op: opcode,
            arg: 0,
            width,
            val: 0,
            name: String::new(),
        });
    }

    /// `&&` / `||` lower to branches with an explicit `CONST_BOOL`
    /// fallback arm; the WebAssembly stackifier matches this exact shape
    /// and re-emits it as a typed `if/else`.
    fn lower_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        let d0 = self.depth();
        let skip = self.new_label();
        let done = self.new_label();
        self.lower_expr(lhs);
        match op {
            BinOp::LogAnd => self.emit(Inst::with_arg(Op::JmpIfNot, skip)),
            BinOp::LogOr => self.emit(Inst::with_arg(Op::JmpIf, skip)),
            _ => unreachable!(),
        }
        self.lower_expr(rhs);
        self.emit(Inst::with_arg(Op::Jmp, done));
        self.emit_label(skip, d0);
        let fallback = (op == BinOp::LogOr) as i64;
        self.emit(Inst::with_val(Op::ConstBool, fallback));
        self.emit_label(done, d0 + 1);
    }

    fn lower_unary(&mut self, op: UnOp, operand: &Expr) {
        self.lower_expr(operand);
        let opcode = match op {
            UnOp::Not => Op::Not,
            UnOp::Neg => Op::Neg,
            UnOp::Comp => Op::Comp,
        };
        self.emit(Inst::new(opcode));
    }

    fn lower_addr(&mut self, inner: &Expr) {
        match inner {
            Expr::Ident(name) => {
                if let Some(index) = self.lookup(name) {
                    self.emit(Inst::with_arg(Op::LocalAddr, index as i64));
                    return;
                }
                let qualified = self.qualify(name);
                if let Some(info) = self.tables.globals.get(&qualified) {
                    let idx = info.index as i64;
                    self.emit(Inst::with_arg(Op::GlobalAddr, idx));
                    return;
                }
                self.error_value(format!("cannot take address of {}", name));
            }
            // &T{...}: the composite already leaves its heap pointer.
            Expr::Composite { ty, elems } => self.lower_composite(ty, elems),
            other => self.error_value(format!("unaddressable operand: {:?}", kind_of(other))),
        }
    }

    /// `*p` is a no-op when `p` points at a struct: in this IR the struct
    /// value is its pointer. The concrete-type record decides; when it is
    /// missing the deref stays a no-op.
    fn lower_deref(&mut self, inner: &Expr) {
        self.lower_expr(inner);
        if let Some(concrete) = self.concrete_type_of(inner) {
            if self.tables.struct_fields(&concrete).is_some() {
                return;
            }
        }
        match self.expr_type(inner) {
            Some(TypeExpr::Ptr(pointee)) if pointee.named().is_some() => {
                let width = pointee.width();
                if self
                    .tables
                    .struct_fields(&self.tables.qualify_type(&self.pkg, pointee.named().unwrap()))
                    .is_some()
                {
                    return;
                }
                self.emit(Inst {
                    op: Op::Load,
                    arg: 0,
                    width,
                    val: 0,
                    name: String::new(),
                });
            }
            _ => {}
        }
    }

    fn lower_conv(&mut self, ty: &TypeExpr, arg: &Expr) {
        match ty {
            TypeExpr::Named(n) if n == "string" => {
                match self.expr_type(arg) {
                    Some(TypeExpr::Slice(elem)) if elem.width() == 1 => {
                        self.lower_expr(arg);
                        self.emit(Inst::with_name(Op::Call, "runtime.BytesToString", 1));
                    }
                    Some(t) if t.is_string() => self.lower_expr(arg),
                    _ => {
                        self.lower_expr(arg);
                        self.emit(Inst::with_name(Op::Call, "runtime.ByteToString", 1));
                    }
                }
            }
            TypeExpr::Slice(elem) if elem.width() == 1 && self.is_string_expr(arg) => {
                self.lower_expr(arg);
                self.emit(Inst::with_name(Op::Call, "runtime.StringToBytes", 1));
            }
            TypeExpr::Named(_) | TypeExpr::Any => {
                let boxing = self.is_interface_type(ty) && !matches!(arg, Expr::Nil);
                self.lower_expr(arg);
                if boxing {
                    if !self.already_boxed(arg) {
                        let id = self.box_type_id(arg);
                        self.emit(Inst::with_arg(Op::IfaceBox, id));
                    }
                } else {
                    let width = ty.width();
                    if width != 0 && width != self.width_of(arg) {
                        self.emit(Inst {
                            op: Op::Convert,
                            arg: 0,
                            width,
                            val: 0,
                            name: String::new(),
                        });
                    }
                }
            }
            _ => self.lower_expr(arg),
        }
    }

    fn lower_make(&mut self, ty: &TypeExpr, len: Option<&Expr>, cap: Option<&Expr>) {
        match ty {
            TypeExpr::Slice(elem) => {
                let esz = elem.elem_size(self.word);
                match len {
                    Some(e) => self.lower_expr(e),
                    None => self.emit(Inst::new(Op::ConstI64)),
                }
                match cap {
                    Some(c) => {
                        self.lower_expr(c);
                        self.emit(Inst::with_val(Op::ConstI64, esz));
                        self.emit(Inst::with_name(Op::Call, "runtime.SliceMakeCap", 3));
                    }
                    None => {
                        self.emit(Inst::with_val(Op::ConstI64, esz));
                        self.emit(Inst::with_name(Op::Call, "runtime.SliceMake", 2));
                    }
                }
            }
            TypeExpr::Map(key, _) => {
                let kind = map_key_kind(key);
                self.emit(Inst::with_val(Op::ConstI64, kind));
                self.emit(Inst::with_name(Op::Call, "runtime.MapMake", 1));
            }
            other => self.error_value(format!("cannot make {:?}", other)),
        }
    }

    // ── composite literals ───────────────────────────────────────────

    pub(crate) fn lower_composite(&mut self, ty: &TypeExpr, elems: &[CompositeElem]) {
        match ty {
            TypeExpr::Slice(elem) => self.lower_slice_literal(elem, elems),
            TypeExpr::Map(key, _) => self.lower_map_literal(key, elems),
            TypeExpr::Named(name) => self.lower_struct_literal(name, elems),
            other => self.error_value(format!("bad composite type {:?}", other)),
        }
    }

    fn lower_slice_literal(&mut self, elem: &TypeExpr, elems: &[CompositeElem]) {
        let esz = elem.elem_size(self.word);
        if elems.is_empty() {
            // An empty literal still needs a non-nil header.
            self.emit(Inst::new(Op::ConstI64));
            self.emit(Inst::with_val(Op::ConstI64, esz));
            self.emit(Inst::with_name(Op::Call, "runtime.SliceMake", 2));
            return;
        }
        self.emit(Inst::new(Op::ConstI64));
        for e in elems {
            self.lower_expr(&e.value);
            self.emit(Inst::with_val(Op::ConstI64, esz));
            self.emit(Inst::with_name(Op::Call, "runtime.SliceAppend", 3));
        }
    }

    fn lower_map_literal(&mut self, key: &TypeExpr, elems: &[CompositeElem]) {
        self.emit(Inst::with_val(Op::ConstI64, map_key_kind(key)));
        self.emit(Inst::with_name(Op::Call, "runtime.MapMake", 1));
        for e in elems {
            let k = match &e.key {
                Some(k) => k.clone(),
                None => {
                    self.error("map literal entry without key".to_string());
                    continue;
                }
            };
            self.emit(Inst::new(Op::Dup));
            self.lower_expr(&k);
            self.lower_expr(&e.value);
            self.emit(Inst::with_name(Op::Call, "runtime.MapSet", 3));
            self.emit(Inst::new(Op::Drop));
        }
    }

    /// Struct literal: one value per declared field in declaration order
    /// (zero for omitted fields), then the `builtin.composite` constructor
    /// the backend expands into `runtime.Alloc` plus stores.
    fn lower_struct_literal(&mut self, name: &str, elems: &[CompositeElem]) {
        let qualified = self.tables.qualify_type(&self.pkg, name);
        let fields = match self.tables.struct_fields(&qualified) {
            Some(f) => f.to_vec(),
            None => {
                self.error_value(format!("unknown struct type {}", name));
                return;
            }
        };
        let keyed = elems.iter().any(|e| e.key.is_some());
        for (i, field) in fields.iter().enumerate() {
            let supplied = if keyed {
                elems.iter().find(|e| {
                    matches!(&e.key, Some(Expr::Ident(k)) if *k == field.name)
                })
            } else {
                elems.get(i)
            };
            match supplied {
                Some(e) => self.lower_expr(&e.value),
                None => self.emit(Inst::new(Op::ConstI64)),
            }
        }
        self.emit(Inst::with_name(
            Op::Call,
            format!("builtin.composite.{}", qualified),
            fields.len() as i64,
        ));
    }

    // ── calls ────────────────────────────────────────────────────────

    pub(crate) fn lower_call(&mut self, callee: &Expr, args: &[Expr], spread: bool) -> usize {
        if let Expr::Ident(name) = callee {
            if let Some(rets) = self.lower_builtin(name, args, spread) {
                return rets;
            }
        }
        match callee {
            Expr::Ident(_) => {
                let name = match self.callee_name(callee) {
                    Some(n) => n,
                    None => {
                        self.error_value(format!("undefined function: {:?}", callee));
                        return 1;
                    }
                };
                let sig = self.tables.sigs.get(&name).cloned();
                self.lower_resolved_call(&name, sig.as_ref(), None, args, spread)
            }
            Expr::Selector { base, name } => self.lower_method_call(base, name, args, spread),
            other => {
                self.error_value(format!("cannot call {:?}", kind_of(other)));
                1
            }
        }
    }

    fn lower_resolved_call(
        &mut self,
        name: &str,
        sig: Option<&FuncSig>,
        recv: Option<&Expr>,
        args: &[Expr],
        spread: bool,
    ) -> usize {
        let mut argc = 0i64;
        if let Some(base) = recv {
            self.lower_expr(base);
            argc += 1;
        }

        let variadic = sig.and_then(|s| s.variadic.clone());
        match (&variadic, spread) {
            (Some(elem), false) => {
                let fixed = sig.map(|s| s.params.len()).unwrap_or(0);
                let fixed_args = &args[..fixed.min(args.len())];
                for (i, a) in fixed_args.iter().enumerate() {
                    self.lower_fixed_arg(a, sig, i);
                }
                argc += fixed_args.len() as i64;
                self.pack_variadic(&args[fixed.min(args.len())..], elem);
                argc += 1;
            }
            _ => {
                for (i, a) in args.iter().enumerate() {
                    self.lower_fixed_arg(a, sig, i);
                }
                argc += args.len() as i64;
            }
        }

        self.emit(Inst::with_name(Op::Call, name, argc));
        self.ret_count_of(name)
    }

    /// Lower one non-variadic argument, boxing it when the declared
    /// parameter is an interface.
    fn lower_fixed_arg(&mut self, arg: &Expr, sig: Option<&FuncSig>, position: usize) {
        let param_ty = sig.and_then(|s| s.params.get(position)).map(|p| p.ty.clone());
        self.lower_expr(arg);
        if let Some(ty) = param_ty {
            if self.is_interface_type(&ty)
                && !matches!(arg, Expr::Nil)
                && !self.already_boxed(arg)
            {
                let id = self.box_type_id(arg);
                self.emit(Inst::with_arg(Op::IfaceBox, id));
            }
        }
    }

    fn lower_method_call(
        &mut self,
        base: &Expr,
        method: &str,
        args: &[Expr],
        spread: bool,
    ) -> usize {
        if let Some(concrete) = self.concrete_type_of(base) {
            let direct = format!("{}.{}", concrete, method);
            let resolved = self.module.method(&direct).map(str::to_string).or_else(|| {
                concrete.rsplit_once('.').and_then(|(pkg, ty)| {
                    self.module
                        .method(&format!("{}.*{}.{}", pkg, ty, method))
                        .map(str::to_string)
                })
            });
            if let Some(fname) = resolved {
                let sig = self.tables.sigs.get(&fname).cloned();
                return self.lower_resolved_call(&fname, sig.as_ref(), Some(base), args, spread);
            }
        }

        // Interface dispatch: the boxed receiver goes below the arguments.
        let iface = match self.expr_type(base) {
            Some(TypeExpr::Named(n)) => {
                let q = self.tables.qualify_type(&self.pkg, &n);
                if self.tables.is_interface_name(&q) {
                    Some(q)
                } else {
                    None
                }
            }
            Some(TypeExpr::Any) => Some("interface{}".to_string()),
            _ => None,
        };
        match iface {
            Some(iface_name) => {
                self.lower_expr(base);
                for a in args {
                    self.lower_expr(a);
                }
                self.emit(Inst::with_name(
                    Op::IfaceCall,
                    format!("{}.{}", iface_name, method),
                    args.len() as i64,
                ));
                1
            }
            None => {
                self.error_value(format!("unknown method {} on {:?}", method, kind_of(base)));
                1
            }
        }
    }

    /// Non-spread variadic packing: allocate a four-word header with the
    /// elements in its tail, store each argument, and push the header as
    /// the final call argument.
    fn pack_variadic(&mut self, args: &[Expr], elem: &TypeExpr) {
        let boxed = matches!(elem, TypeExpr::Any);
        let ew = if boxed { self.word } else { elem.elem_size(self.word) };
        let n = args.len() as i64;
        let header = 4 * self.word;
        let slot = self.add_local(&format!("$vp{}", self.func.locals.len()), None);

        self.emit(Inst::with_val(Op::ConstI64, header + n * ew));
        self.emit(Inst::with_name(Op::Call, "runtime.Alloc", 1));
        self.emit(Inst::with_arg(Op::LocalSet, slot as i64));

        // data pointer
        self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
        self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
        self.emit(Inst::with_val(Op::ConstI64, header));
        self.emit(Inst::new(Op::Add));
        self.emit(Inst::new(Op::Store));
        // len, cap, element size
        for (offset, value) in [
            (self.word, n),
            (2 * self.word, n),
            (3 * self.word, ew),
        ] {
            self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
            self.emit(Inst::with_arg(Op::Offset, offset));
            self.emit(Inst::with_val(Op::ConstI64, value));
            self.emit(Inst::new(Op::Store));
        }

        for (i, a) in args.iter().enumerate() {
            self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
            self.emit(Inst::with_arg(Op::Offset, header + i as i64 * ew));
            self.lower_expr(a);
            if boxed && !matches!(a, Expr::Nil) && !self.already_boxed(a) {
                let id = self.box_type_id(a);
                self.emit(Inst::with_arg(Op::IfaceBox, id));
            }
            self.emit(Inst {
                op: Op::Store,
                arg: 0,
                width: if ew < self.word { ew as u8 } else { 0 },
                val: 0,
                name: String::new(),
            });
        }

        self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
    }

    // ── builtins ─────────────────────────────────────────────────────

    fn lower_builtin(&mut self, name: &str, args: &[Expr], spread: bool) -> Option<usize> {
        match name {
            "len" => {
                let arg = args.first()?;
                if matches!(self.expr_type(arg), Some(TypeExpr::Map(_, _))) {
                    self.lower_expr(arg);
                    self.emit(Inst::with_name(Op::Call, "runtime.MapLen", 1));
                } else {
                    self.lower_expr(arg);
                    self.emit(Inst::new(Op::Len));
                }
                Some(1)
            }
            "cap" => {
                self.lower_expr(args.first()?);
                self.emit(Inst::new(Op::Cap));
                Some(1)
            }
            "append" => {
                let base = args.first()?;
                if spread {
                    self.lower_expr(base);
                    self.lower_expr(args.get(1)?);
                    self.emit(Inst::with_name(Op::Call, "runtime.SliceAppendSlice", 2));
                    return Some(1);
                }
                let esz = match self.expr_type(base) {
                    Some(TypeExpr::Slice(elem)) => elem.elem_size(self.word),
                    _ => self.word,
                };
                self.lower_expr(base);
                for e in &args[1..] {
                    self.lower_expr(e);
                    self.emit(Inst::with_val(Op::ConstI64, esz));
                    self.emit(Inst::with_name(Op::Call, "runtime.SliceAppend", 3));
                }
                Some(1)
            }
            "copy" => {
                self.lower_expr(args.first()?);
                self.lower_expr(args.get(1)?);
                self.emit(Inst::with_name(Op::Call, "runtime.SliceCopy", 2));
                Some(1)
            }
            "delete" => {
                self.lower_expr(args.first()?);
                self.lower_expr(args.get(1)?);
                self.emit(Inst::with_name(Op::Call, "runtime.MapDelete", 2));
                Some(0)
            }
            "panic" => {
                match args.first() {
                    Some(a) => self.lower_expr(a),
                    None => self.emit(Inst::new(Op::ConstI64)),
                }
                self.emit(Inst::new(Op::Panic));
                Some(0)
            }
            "print" | "println" => {
                self.pack_variadic(args, &TypeExpr::Any);
                let callee = if name == "print" {
                    "runtime.Print"
                } else {
                    "runtime.Println"
                };
                self.emit(Inst::with_name(Op::Call, callee, 1));
                Some(0)
            }
            _ => None,
        }
    }

    // ── interface boxing ─────────────────────────────────────────────

    /// Whether an expression already produces a boxed interface value.
    pub(crate) fn already_boxed(&self, e: &Expr) -> bool {
        match e {
            Expr::Call { callee, .. } => {
                if let Some(name) = self.callee_name(callee) {
                    if let Some(sig) = self.tables.sigs.get(&name) {
                        if let Some(first) = sig.results.first() {
                            return self.is_interface_type(first);
                        }
                    }
                }
                false
            }
            Expr::Ident(name) => match self.lookup(name) {
                Some(idx) => matches!(
                    &self.local_info(idx).ty,
                    Some(t) if self.is_interface_type(t)
                ),
                None => false,
            },
            Expr::Conv { ty, .. } => self.is_interface_type(ty),
            _ => false,
        }
    }

    /// Resolve the type id an `IFACE_BOX` carries for this expression:
    /// identity conversions and composite addresses name a user type, and
    /// `int` / `bool` / `string` values take the reserved primitive ids.
    pub(crate) fn box_type_id(&mut self, e: &Expr) -> i64 {
        match e {
            Expr::IntLit(_) | Expr::BoolLit(_) | Expr::Iota => rtg_ir::TYPE_ID_INT,
            Expr::StringLit(_) => rtg_ir::TYPE_ID_STRING,
            Expr::Conv { ty, .. } | Expr::Composite { ty, .. } => match ty.named() {
                Some(n) => {
                    let q = self.tables.qualify_type(&self.pkg, n);
                    self.module.type_id(&q)
                }
                None => rtg_ir::TYPE_ID_INT,
            },
            Expr::Addr(inner) => self.box_type_id(inner),
            _ => {
                if let Some(concrete) = self.concrete_type_of(e) {
                    return self.module.type_id(&concrete);
                }
                match self.expr_type(e) {
                    Some(t) if t.is_string() => rtg_ir::TYPE_ID_STRING,
                    _ => rtg_ir::TYPE_ID_INT,
                }
            }
        }
    }
}

fn map_key_kind(key: &TypeExpr) -> i64 {
    if key.is_string() {
        1
    } else {
        0
    }
}

fn kind_of(e: &Expr) -> &'static str {
    match e {
        Expr::IntLit(_) => "integer literal",
        Expr::StringLit(_) => "string literal",
        Expr::BoolLit(_) => "bool literal",
        Expr::Nil => "nil",
        Expr::Iota => "iota",
        Expr::Ident(_) => "identifier",
        Expr::Selector { .. } => "selector",
        Expr::Index { .. } => "index expression",
        Expr::SliceExpr { .. } => "slice expression",
        Expr::Call { .. } => "call",
        Expr::Binary { .. } => "binary expression",
        Expr::Unary { .. } => "unary expression",
        Expr::Composite { .. } => "composite literal",
        Expr::Addr(_) => "address-of",
        Expr::Deref(_) => "dereference",
        Expr::Conv { .. } => "conversion",
        Expr::Make { .. } => "make",
    }
}
