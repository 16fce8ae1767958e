//! Statement lowering.

use super::{DeferRecord, FuncLowerer};
use rtg_ast::{BinOp, Expr, Stmt, SwitchCase, TypeExpr};
use rtg_ir::{Inst, Op};

impl<'a> FuncLowerer<'a> {
    pub fn lower_stmt(&mut self, stmt: &Stmt) {
        // Nothing after a terminator.
        if !self.is_reachable() {
            return;
        }
        let d0 = self.depth();
        match stmt {
            Stmt::Decl { name, ty, init } => self.lower_decl(name, ty.as_ref(), init.as_ref()),
            Stmt::Define { names, init } => self.lower_define(names, init),
            Stmt::Assign { targets, values } => self.lower_assign(targets, values),
            Stmt::OpAssign { target, op, value } => {
                let desugared = Expr::Binary {
                    op: *op,
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(value.clone()),
                };
                self.lower_assign_single(target, &desugared);
            }
            Stmt::IncDec { target, inc } => {
                let desugared = Expr::Binary {
                    op: if *inc { BinOp::Add } else { BinOp::Sub },
                    lhs: Box::new(target.clone()),
                    rhs: Box::new(Expr::IntLit(1)),
                };
                self.lower_assign_single(target, &desugared);
            }
            Stmt::ExprStmt(e) => {
                let rets = self.lower_expr_multi(e);
                for _ in 0..rets {
                    self.emit(Inst::new(Op::Drop));
                }
            }
            Stmt::Return(values) => self.lower_return(values),
            Stmt::If {
                init,
                cond,
                then,
                els,
            } => self.lower_if(init.as_deref(), cond, then, els.as_deref()),
            Stmt::For {
                init,
                cond,
                post,
                body,
            } => self.lower_for(init.as_deref(), cond.as_ref(), post.as_deref(), body),
            Stmt::Range {
                key,
                value,
                expr,
                body,
            } => self.lower_range(key.as_deref(), value.as_deref(), expr, body),
            Stmt::Switch {
                init,
                tag,
                cases,
                default,
            } => self.lower_switch(init.as_deref(), tag.as_ref(), cases, default.as_deref()),
            Stmt::Break => match self.break_label() {
                Some(label) => self.emit(Inst::with_arg(Op::Jmp, label)),
                None => self.error("break outside loop".to_string()),
            },
            Stmt::Continue => match self.continue_label() {
                Some(label) => self.emit(Inst::with_arg(Op::Jmp, label)),
                None => self.error("continue outside loop".to_string()),
            },
            Stmt::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.lower_stmt(s);
                }
                self.pop_scope();
            }
            Stmt::Defer(call) => self.lower_defer(call),
        }
        self.assert_depth(d0, "statement");
    }

    fn lower_decl(&mut self, name: &str, ty: Option<&TypeExpr>, init: Option<&Expr>) {
        match init {
            Some(e) => {
                let inferred_ty = self.expr_type(e);
                let concrete = self.concrete_type_of(e);
                let boxing = ty.map(|t| self.is_interface_type(t)).unwrap_or(false);
                self.lower_expr(e);
                if boxing && !matches!(e, Expr::Nil) && !self.already_boxed(e) {
                    let id = self.box_type_id(e);
                    self.emit(Inst::with_arg(Op::IfaceBox, id));
                }
                let index = self.add_local(name, ty.cloned());
                if ty.is_none() {
                    self.set_local_type(index, inferred_ty);
                }
                self.set_concrete(index, concrete);
                self.emit(Inst::with_arg(Op::LocalSet, index as i64));
            }
            None => {
                let index = self.add_local(name, ty.cloned());
                match ty {
                    // A named-struct local gets its zeroed heap block at
                    // the point of declaration; the slot then holds the
                    // pointer. Pointer-to-struct locals stay nil.
                    Some(TypeExpr::Named(n)) => {
                        let qualified = self.tables.qualify_type(&self.pkg, n);
                        if let Some(fields) = self.tables.struct_fields(&qualified) {
                            let size = fields.len() as i64 * self.word;
                            self.emit(Inst::with_val(Op::ConstI64, size));
                            self.emit(Inst::with_name(Op::Call, "runtime.Alloc", 1));
                            self.emit(Inst::with_val(Op::ConstI64, size));
                            self.emit(Inst::with_name(Op::Call, "runtime.Memzero", 2));
                        } else if n == "string" {
                            self.emit(Inst {
                                op: Op::ConstStr,
                                arg: 0,
                                width: 0,
                                val: 0,
                                name: String::new(),
                            });
                        } else {
                            self.emit(Inst::new(Op::ConstI64));
                        }
                    }
                    _ => self.emit(Inst::new(Op::ConstI64)),
                }
                self.emit(Inst::with_arg(Op::LocalSet, index as i64));
            }
        }
    }

    fn lower_define(&mut self, names: &[String], init: &Expr) {
        if names.len() == 1 {
            let inferred_ty = self.expr_type(init);
            let concrete = self.concrete_type_of(init);
            self.lower_expr(init);
            let index = self.add_local(&names[0], None);
            self.set_local_type(index, inferred_ty);
            self.set_concrete(index, concrete);
            self.emit(Inst::with_arg(Op::LocalSet, index as i64));
            return;
        }

        // `v, ok := m[k]` keeps both MapGet results.
        if names.len() == 2 {
            if let Expr::Index { base, index } = init {
                if matches!(self.expr_type(base), Some(TypeExpr::Map(_, _))) {
                    let value_ty = match self.expr_type(base) {
                        Some(TypeExpr::Map(_, v)) => Some(*v),
                        _ => None,
                    };
                    let (base, index) = (base.clone(), index.clone());
                    self.lower_map_get_both(&base, &index);
                    let ok_slot = self.add_local(&names[1], Some(TypeExpr::Named("bool".into())));
                    self.emit(Inst::with_arg(Op::LocalSet, ok_slot as i64));
                    let val_slot = self.add_local(&names[0], value_ty);
                    self.emit(Inst::with_arg(Op::LocalSet, val_slot as i64));
                    return;
                }
            }
        }

        // Multi-return call: the first declared result is deepest, so the
        // names bind in reverse pop order.
        let result_tys: Vec<Option<TypeExpr>> = match init {
            Expr::Call { callee, .. } => match self.callee_name(callee) {
                Some(name) => match self.tables.sigs.get(&name) {
                    Some(sig) => sig.results.iter().cloned().map(Some).collect(),
                    None => vec![None; names.len()],
                },
                None => vec![None; names.len()],
            },
            _ => vec![None; names.len()],
        };
        let rets = self.lower_expr_multi(init);
        if rets != names.len() {
            self.error(format!(
                "assignment mismatch: {} names but {} values",
                names.len(),
                rets
            ));
        }
        for i in (0..names.len()).rev() {
            let ty = result_tys.get(i).cloned().flatten();
            let index = self.add_local(&names[i], ty);
            self.emit(Inst::with_arg(Op::LocalSet, index as i64));
        }
    }

    fn lower_assign(&mut self, targets: &[Expr], values: &[Expr]) {
        if targets.len() == 1 && values.len() == 1 {
            self.lower_assign_single(&targets[0], &values[0]);
            return;
        }
        if values.len() == 1 {
            // Multi-assign from one call; values pop in reverse target
            // order, so only direct names can receive them.
            let rets = self.lower_expr_multi(&values[0]);
            if rets != targets.len() {
                self.error(format!(
                    "assignment mismatch: {} targets but {} values",
                    targets.len(),
                    rets
                ));
            }
            for target in targets.iter().rev() {
                self.store_top_into(target);
            }
            return;
        }
        if targets.len() == values.len() {
            // Parallel assignment: evaluate every value first.
            for v in values {
                self.lower_expr(v);
            }
            for target in targets.iter().rev() {
                self.store_top_into(target);
            }
            return;
        }
        self.error("assignment arity mismatch".to_string());
    }

    /// Pop the stack top into a name target (multi-assignment position).
    fn store_top_into(&mut self, target: &Expr) {
        match target {
            Expr::Ident(name) if name == "_" => self.emit(Inst::new(Op::Drop)),
            Expr::Ident(name) => {
                if let Some(index) = self.lookup(name) {
                    self.emit(Inst::with_arg(Op::LocalSet, index as i64));
                    return;
                }
                let qualified = self.qualify(name);
                if let Some(info) = self.tables.globals.get(&qualified) {
                    let idx = info.index as i64;
                    self.emit(Inst::with_arg(Op::GlobalSet, idx));
                    return;
                }
                self.error(format!("undefined: {}", name));
                self.emit(Inst::new(Op::Drop));
            }
            other => {
                self.error("multi-assignment target must be a name".to_string());
                let _ = other;
                self.emit(Inst::new(Op::Drop));
            }
        }
    }

    fn lower_assign_single(&mut self, target: &Expr, value: &Expr) {
        match target {
            Expr::Ident(name) if name == "_" => {
                let rets = self.lower_expr_multi(value);
                for _ in 0..rets {
                    self.emit(Inst::new(Op::Drop));
                }
            }
            Expr::Ident(name) => {
                if let Some(index) = self.lookup(name) {
                    let boxing = matches!(
                        &self.local_info(index).ty,
                        Some(t) if self.is_interface_type(t)
                    );
                    let concrete = self.concrete_type_of(value);
                    self.lower_expr(value);
                    if boxing && !matches!(value, Expr::Nil) && !self.already_boxed(value) {
                        let id = self.box_type_id(value);
                        self.emit(Inst::with_arg(Op::IfaceBox, id));
                    } else {
                        self.set_concrete(index, concrete);
                    }
                    self.emit(Inst::with_arg(Op::LocalSet, index as i64));
                    return;
                }
                let qualified = self.qualify(name);
                if let Some(info) = self.tables.globals.get(&qualified) {
                    let idx = info.index as i64;
                    self.lower_expr(value);
                    self.emit(Inst::with_arg(Op::GlobalSet, idx));
                    return;
                }
                self.error(format!("undefined: {}", name));
                self.lower_expr(value);
                self.emit(Inst::new(Op::Drop));
            }
            Expr::Selector { base, name } => {
                let concrete = match self.concrete_type_of(base) {
                    Some(c) => c,
                    None => {
                        self.error(format!("cannot resolve receiver type of .{}", name));
                        return;
                    }
                };
                let offset = match self.tables.field_offset(&concrete, name, self.word) {
                    Some(o) => o,
                    None => {
                        self.error(format!("{} has no field {}", concrete, name));
                        return;
                    }
                };
                self.lower_expr(base);
                if offset != 0 {
                    self.emit(Inst::with_arg(Op::Offset, offset));
                }
                self.lower_expr(value);
                self.emit(Inst::new(Op::Store));
            }
            Expr::Index { base, index } => match self.expr_type(base) {
                Some(TypeExpr::Map(_, _)) => {
                    self.lower_expr(base);
                    self.lower_expr(index);
                    self.lower_expr(value);
                    self.emit(Inst::with_name(Op::Call, "runtime.MapSet", 3));
                    self.emit(Inst::new(Op::Drop));
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
                    self.lower_expr(value);
                    self.emit(Inst {
                        op: Op::Store,
                        arg: 0,
                        width: if esz < self.word { esz as u8 } else { 0 },
                        val: 0,
                        name: String::new(),
                    });
                }
            },
            Expr::Deref(ptr) => {
                let width = match self.expr_type(ptr) {
                    Some(TypeExpr::Ptr(pointee)) => pointee.width(),
                    _ => 0,
                };
                self.lower_expr(ptr);
                self.lower_expr(value);
                self.emit(Inst {
                    op: Op::Store,
                    arg: 0,
                    width,
                    val: 0,
                    name: String::new(),
                });
            }
            other => {
                self.error(format!("cannot assign to {:?}", other));
            }
        }
    }

    fn lower_return(&mut self, values: &[Expr]) {
        let results = self.results().to_vec();
        for (i, v) in values.iter().enumerate() {
            self.lower_expr(v);
            // Interface boxing at return sites: a nil or an
            // already-boxing call passes through unboxed.
            if let Some(declared) = results.get(i) {
                if self.is_interface_type(declared)
                    && !matches!(v, Expr::Nil)
                    && !self.already_boxed(v)
                {
                    let id = self.box_type_id(v);
                    self.emit(Inst::with_arg(Op::IfaceBox, id));
                }
            }
        }
        if values.len() != results.len() {
            self.error(format!(
                "wrong number of return values: {} for {}",
                values.len(),
                results.len()
            ));
        }
        self.replay_defers();
        self.emit(Inst::with_arg(Op::Return, values.len() as i64));
    }

    fn lower_if(
        &mut self,
        init: Option<&Stmt>,
        cond: &Expr,
        then: &[Stmt],
        els: Option<&[Stmt]>,
    ) {
        // The init-statement form gets a synthetic scope around the whole
        // statement.
        if init.is_some() {
            self.push_scope();
        }
        if let Some(s) = init {
            self.lower_stmt(s);
        }

        let d0 = self.depth();
        let else_label = self.new_label();
        let end_label = self.new_label();

        self.lower_expr(cond);
        self.emit(Inst::with_arg(Op::JmpIfNot, else_label));

        self.push_scope();
        for s in then {
            self.lower_stmt(s);
        }
        self.pop_scope();
        self.assert_depth(d0, "if-then");
        self.emit(Inst::with_arg(Op::Jmp, end_label));

        self.emit_label(else_label, d0);
        if let Some(stmts) = els {
            self.push_scope();
            for s in stmts {
                self.lower_stmt(s);
            }
            self.pop_scope();
            self.assert_depth(d0, "if-else");
        }
        if self.is_reachable() || self.label_used(end_label) {
            self.emit_label(end_label, d0);
        }

        if init.is_some() {
            self.pop_scope();
        }
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &[Stmt],
    ) {
        self.push_scope();
        if let Some(s) = init {
            self.lower_stmt(s);
        }

        let d0 = self.depth();
        let head = self.new_label();
        let end = self.new_label();
        // Without a post statement the back edge doubles as the continue
        // target.
        let cont = if post.is_some() { self.new_label() } else { head };

        self.emit_label(head, d0);
        if let Some(c) = cond {
            self.lower_expr(c);
            self.emit(Inst::with_arg(Op::JmpIfNot, end));
        }

        self.push_loop(end, cont);
        self.push_scope();
        for s in body {
            self.lower_stmt(s);
        }
        self.pop_scope();
        self.pop_loop();
        self.assert_depth(d0, "for-body");

        if let Some(p) = post {
            if self.is_reachable() || self.label_used(cont) {
                self.emit_label(cont, d0);
                self.lower_stmt(p);
            }
        }
        self.emit(Inst::with_arg(Op::Jmp, head));
        if self.label_used(end) {
            self.emit_label(end, d0);
        }
        self.pop_scope();
    }

    /// Range desugaring: two hidden locals carry the iterable and the
    /// index; sequences iterate `len(iter)` times with `INDEX_ADDR`
    /// element access, maps go through the `runtime.Map*` entry points.
    fn lower_range(
        &mut self,
        key: Option<&str>,
        value: Option<&str>,
        expr: &Expr,
        body: &[Stmt],
    ) {
        self.push_scope();

        let iter_ty = self.expr_type(expr);
        let is_map = matches!(iter_ty, Some(TypeExpr::Map(_, _)));
        let (key_ty, elem_ty, esz): (Option<TypeExpr>, Option<TypeExpr>, i64) = match &iter_ty {
            Some(TypeExpr::Map(k, v)) => (Some((**k).clone()), Some((**v).clone()), self.word),
            Some(TypeExpr::Slice(elem)) => (
                Some(TypeExpr::Named("int".into())),
                Some((**elem).clone()),
                elem.elem_size(self.word),
            ),
            Some(t) if t.is_string() => (
                Some(TypeExpr::Named("int".into())),
                Some(TypeExpr::Named("byte".into())),
                1,
            ),
            _ => (Some(TypeExpr::Named("int".into())), None, self.word),
        };

        let iter_slot = self.add_local("$iter", iter_ty.clone());
        let concrete = self.concrete_type_of(expr);
        self.lower_expr(expr);
        self.set_concrete(iter_slot, concrete);
        self.emit(Inst::with_arg(Op::LocalSet, iter_slot as i64));

        let idx_slot = self.add_local("$idx", Some(TypeExpr::Named("int".into())));
        self.emit(Inst::new(Op::ConstI64));
        self.emit(Inst::with_arg(Op::LocalSet, idx_slot as i64));

        let len_slot = self.add_local("$len", Some(TypeExpr::Named("int".into())));
        self.emit(Inst::with_arg(Op::LocalGet, iter_slot as i64));
        if is_map {
            self.emit(Inst::with_name(Op::Call, "runtime.MapLen", 1));
        } else {
            self.emit(Inst::new(Op::Len));
        }
        self.emit(Inst::with_arg(Op::LocalSet, len_slot as i64));

        let key_slot = match key {
            Some(name) if name != "_" => Some(self.add_local(name, key_ty)),
            _ => None,
        };
        let value_slot = match value {
            Some(name) if name != "_" => {
                let slot = self.add_local(name, elem_ty.clone());
                if let Some(t) = &elem_ty {
                    if let Some(n) = t.named() {
                        let q = self.tables.qualify_type(&self.pkg, n);
                        if self.tables.struct_fields(&q).is_some() {
                            self.set_concrete(slot, Some(q));
                        }
                    }
                }
                Some(slot)
            }
            _ => None,
        };
        if let Some(slot) = key_slot {
            // Zero-init so the slots are well-defined even for an empty
            // iterable.
            self.emit(Inst::new(Op::ConstI64));
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
        }
        if let Some(slot) = value_slot {
            self.emit(Inst::new(Op::ConstI64));
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
        }

        let d0 = self.depth();
        let head = self.new_label();
        let end = self.new_label();
        let cont = self.new_label();

        self.emit_label(head, d0);
        self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
        self.emit(Inst::with_arg(Op::LocalGet, len_slot as i64));
        self.emit(Inst::new(Op::Lt));
        self.emit(Inst::with_arg(Op::JmpIfNot, end));

        if let Some(slot) = key_slot {
            if is_map {
                self.emit(Inst::with_arg(Op::LocalGet, iter_slot as i64));
                self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
                self.emit(Inst::with_name(Op::Call, "runtime.MapEntryKey", 2));
            } else {
                self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
            }
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
        }
        if let Some(slot) = value_slot {
            if is_map {
                self.emit(Inst::with_arg(Op::LocalGet, iter_slot as i64));
                self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
                self.emit(Inst::with_name(Op::Call, "runtime.MapEntryValue", 2));
            } else {
                self.emit(Inst::with_arg(Op::LocalGet, iter_slot as i64));
                self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
                self.emit(Inst::with_arg(Op::IndexAddr, esz));
                self.emit(Inst {
                    op: Op::Load,
                    arg: 0,
                    width: if esz < self.word { esz as u8 } else { 0 },
                    val: 0,
                    name: String::new(),
                });
            }
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
        }

        self.push_loop(end, cont);
        self.push_scope();
        for s in body {
            self.lower_stmt(s);
        }
        self.pop_scope();
        self.pop_loop();
        self.assert_depth(d0, "range-body");

        self.emit_label(cont, d0);
        self.emit(Inst::with_arg(Op::LocalGet, idx_slot as i64));
        self.emit(Inst::with_val(Op::ConstI64, 1));
        self.emit(Inst::new(Op::Add));
        self.emit(Inst::with_arg(Op::LocalSet, idx_slot as i64));
        self.emit(Inst::with_arg(Op::Jmp, head));
        self.emit_label(end, d0);

        self.pop_scope();
    }

    /// Per-case compare-and-branch. The tag stays on the stack across the
    /// fall-through jumps; each body starts by dropping it. String tags
    /// compare through `runtime.StringEqual`.
    fn lower_switch(
        &mut self,
        init: Option<&Stmt>,
        tag: Option<&Expr>,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
    ) {
        self.push_scope();
        if let Some(s) = init {
            self.lower_stmt(s);
        }

        let d0 = self.depth();
        let end = self.new_label();

        match tag {
            Some(tag_expr) => {
                let string_tag = self.is_string_expr(tag_expr);
                self.lower_expr(tag_expr);

                for case in cases {
                    let body_label = self.new_label();
                    let next_label = self.new_label();
                    for e in &case.exprs {
                        self.emit(Inst::new(Op::Dup));
                        self.lower_expr(e);
                        if string_tag {
                            self.emit(Inst::with_name(Op::Call, "runtime.StringEqual", 2));
                        } else {
                            self.emit(Inst::new(Op::Eq));
                        }
                        self.emit(Inst::with_arg(Op::JmpIf, body_label));
                    }
                    self.emit(Inst::with_arg(Op::Jmp, next_label));

                    self.emit_label(body_label, d0 + 1);
                    self.emit(Inst::new(Op::Drop));
                    self.push_scope();
                    for s in &case.body {
                        self.lower_stmt(s);
                    }
                    self.pop_scope();
                    self.assert_depth(d0, "switch-case");
                    self.emit(Inst::with_arg(Op::Jmp, end));

                    self.emit_label(next_label, d0 + 1);
                }

                // All cases failed: discard the tag and run the default.
                self.emit(Inst::new(Op::Drop));
                if let Some(body) = default {
                    self.push_scope();
                    for s in body {
                        self.lower_stmt(s);
                    }
                    self.pop_scope();
                    self.assert_depth(d0, "switch-default");
                }
            }
            None => {
                // Tagless switch: each case expression is its own
                // condition.
                for case in cases {
                    let body_label = self.new_label();
                    let next_label = self.new_label();
                    for e in &case.exprs {
                        self.lower_expr(e);
                        self.emit(Inst::with_arg(Op::JmpIf, body_label));
                    }
                    self.emit(Inst::with_arg(Op::Jmp, next_label));

                    self.emit_label(body_label, d0);
                    self.push_scope();
                    for s in &case.body {
                        self.lower_stmt(s);
                    }
                    self.pop_scope();
                    self.assert_depth(d0, "switch-case");
                    self.emit(Inst::with_arg(Op::Jmp, end));

                    self.emit_label(next_label, d0);
                }
                if let Some(body) = default {
                    self.push_scope();
                    for s in body {
                        self.lower_stmt(s);
                    }
                    self.pop_scope();
                    self.assert_depth(d0, "switch-default");
                }
            }
        }

        if self.is_reachable() || self.label_used(end) {
            self.emit_label(end, d0);
        }
        self.pop_scope();
    }

    /// `defer`: evaluate the call's receiver and arguments eagerly into
    /// hidden locals; every return replays the recorded calls in reverse
    /// order.
    fn lower_defer(&mut self, call: &Expr) {
        let (callee, args, spread) = match call {
            Expr::Call {
                callee,
                args,
                spread,
            } => (callee.as_ref(), args.as_slice(), *spread),
            _ => {
                self.error("defer requires a call".to_string());
                return;
            }
        };
        if spread {
            self.error("cannot defer a spread call".to_string());
            return;
        }

        let (name, recv): (String, Option<&Expr>) = match callee {
            Expr::Ident(_) => match self.callee_name(callee) {
                Some(n) => (n, None),
                None => {
                    self.error(format!("undefined function in defer: {:?}", callee));
                    return;
                }
            },
            Expr::Selector { base, name } => {
                let concrete = match self.concrete_type_of(base) {
                    Some(c) => c,
                    None => {
                        self.error("cannot defer an interface call".to_string());
                        return;
                    }
                };
                let direct = format!("{}.{}", concrete, name);
                let resolved = self.module.method(&direct).map(str::to_string).or_else(|| {
                    concrete.rsplit_once('.').and_then(|(pkg, ty)| {
                        self.module
                            .method(&format!("{}.*{}.{}", pkg, ty, name))
                            .map(str::to_string)
                    })
                });
                match resolved {
                    Some(f) => (f, Some(base.as_ref())),
                    None => {
                        self.error(format!("unknown method {} in defer", name));
                        return;
                    }
                }
            }
            _ => {
                self.error("defer requires a named call".to_string());
                return;
            }
        };

        let mut slots = Vec::new();
        if let Some(base) = recv {
            self.lower_expr(base);
            let slot = self.add_local(&format!("$defer{}", self.func.locals.len()), None);
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
            slots.push(slot);
        }
        for a in args {
            self.lower_expr(a);
            let slot = self.add_local(&format!("$defer{}", self.func.locals.len()), None);
            self.emit(Inst::with_arg(Op::LocalSet, slot as i64));
            slots.push(slot);
        }

        let rets = self.ret_count_of(&name);
        self.push_defer(DeferRecord {
            name,
            args: slots,
            rets,
        });
    }
}
