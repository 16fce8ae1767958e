//! Function lowering.
//!
//! One [`FuncLowerer`] per function: it owns the growing local arena, the
//! scope stack, the label counter, the break/continue stacks, the deferred
//! calls, and the abstract operand-stack depth. The depth is updated after
//! every emitted instruction and asserted at every merge point; a mismatch
//! is a compiler bug, not a user error.

mod expr;
mod stmt;

use crate::prepass::{FuncSig, Tables};
use rtg_ast::{Expr, FuncDecl, GlobalDecl, TypeExpr};
use rtg_ir::{stack_effect, Inst, IrFunc, IrLocal, IrModule, Op, VariadicInfo};
use rustc_hash::FxHashMap;

/// Per-local typing facts gathered at binding sites. The lowering relies on
/// these for method resolution, string-operator detection, deref kinds, and
/// element sizes; a missing record falls back to the permissive default.
#[derive(Debug, Clone, Default)]
pub struct LocalInfo {
    /// Qualified concrete type name (`"main.Point"`, `"*main.Point"`).
    pub concrete: Option<String>,
    /// Declared or inferred type expression.
    pub ty: Option<TypeExpr>,
}

/// A deferred call with its eagerly-evaluated arguments parked in hidden
/// locals.
#[derive(Debug, Clone)]
pub(crate) struct DeferRecord {
    pub name: String,
    pub args: Vec<usize>,
    pub rets: usize,
}

pub(crate) struct FuncLowerer<'a> {
    pub tables: &'a Tables,
    pub module: &'a mut IrModule,
    pub errors: &'a mut Vec<String>,
    pub pkg: String,
    pub word: i64,
    pub func: IrFunc,
    pub infos: Vec<LocalInfo>,
    results: Vec<TypeExpr>,
    scopes: Vec<FxHashMap<String, usize>>,
    depth: i64,
    next_label: i64,
    loops: Vec<(i64, i64)>,
    defers: Vec<DeferRecord>,
    reachable: bool,
}

impl<'a> FuncLowerer<'a> {
    pub fn new(
        tables: &'a Tables,
        module: &'a mut IrModule,
        errors: &'a mut Vec<String>,
        pkg: &str,
        word: i64,
        name: String,
        results: Vec<TypeExpr>,
    ) -> Self {
        Self {
            tables,
            module,
            errors,
            pkg: pkg.to_string(),
            word,
            func: IrFunc {
                name,
                params: 0,
                returns: results.len(),
                locals: Vec::new(),
                variadic: None,
                code: Vec::new(),
            },
            infos: Vec::new(),
            results,
            scopes: vec![FxHashMap::default()],
            depth: 0,
            next_label: 0,
            loops: Vec::new(),
            defers: Vec::new(),
            reachable: true,
        }
    }

    // ── emission ─────────────────────────────────────────────────────

    pub fn emit(&mut self, inst: Inst) {
        if !self.reachable {
            return;
        }
        let rets = |name: &str| self.ret_count_of(name);
        let (pops, pushes) = stack_effect(&inst, &rets);
        if self.depth < pops as i64 {
            panic!(
                "ICE: stack underflow in {} at {:?} (depth {}, pops {})",
                self.func.name, inst.op, self.depth, pops
            );
        }
        self.depth += pushes as i64 - pops as i64;
        if inst.op.is_terminator() {
            self.reachable = false;
        }
        self.func.code.push(inst);
    }

    /// Emit a label and restore the depth the incoming edges carry.
    pub fn emit_label(&mut self, id: i64, depth: i64) {
        self.reachable = true;
        self.depth = depth;
        self.func.code.push(Inst::with_arg(Op::Label, id));
    }

    pub fn new_label(&mut self) -> i64 {
        self.next_label += 1;
        self.next_label
    }

    pub fn depth(&self) -> i64 {
        self.depth
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Whether any emitted jump targets the label. Merge labels nothing
    /// reaches are skipped so terminating branches keep the code after
    /// them unreachable (and value-returning functions whose every path
    /// returns do not demand a trailing `return`).
    pub fn label_used(&self, label: i64) -> bool {
        self.func
            .code
            .iter()
            .any(|i| i.op.is_jump() && i.arg == label)
    }

    /// Merge-point assertion: each arm of a branch must rejoin at the same
    /// depth unless it ended in `RETURN` / `PANIC`.
    pub fn assert_depth(&self, expected: i64, ctx: &str) {
        if self.reachable && self.depth != expected {
            panic!(
                "ICE: depth mismatch after {} in {}: {} != {}",
                ctx, self.func.name, self.depth, expected
            );
        }
    }

    pub fn error(&mut self, msg: String) {
        self.errors.push(format!("{}: {}", self.func.name, msg));
    }

    /// Report an error in value position; pushes a placeholder so lowering
    /// can continue collecting further diagnostics.
    pub fn error_value(&mut self, msg: String) {
        self.error(msg);
        self.emit(Inst::new(Op::ConstI64));
    }

    // ── scopes and locals ────────────────────────────────────────────

    pub fn push_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// Append a local slot and bind the name in the innermost scope.
    /// Shadowing is permitted; lookup walks inward to outward.
    pub fn add_local(&mut self, name: &str, ty: Option<TypeExpr>) -> usize {
        let (width, wide) = match &ty {
            Some(t) => (t.width(), t.is_wide()),
            None => (0, false),
        };
        let index = self.func.locals.len();
        self.func.locals.push(IrLocal {
            name: name.to_string(),
            wide,
            width: if width == 8 && self.word == 8 { 0 } else { width },
        });
        let concrete = ty.as_ref().and_then(|t| self.concrete_name_of_type(t));
        self.infos.push(LocalInfo { concrete, ty });
        self.scopes
            .last_mut()
            .expect("scope stack never empty")
            .insert(name.to_string(), index);
        index
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    pub fn local_info(&self, index: usize) -> &LocalInfo {
        &self.infos[index]
    }

    pub fn set_concrete(&mut self, index: usize, concrete: Option<String>) {
        if concrete.is_some() {
            self.infos[index].concrete = concrete;
        }
    }

    pub fn set_local_type(&mut self, index: usize, ty: Option<TypeExpr>) {
        if let Some(t) = ty {
            if self.infos[index].concrete.is_none() {
                self.infos[index].concrete = self.concrete_name_of_type(&t);
            }
            self.infos[index].ty = Some(t);
        }
    }

    // ── loop context ─────────────────────────────────────────────────

    pub fn push_loop(&mut self, break_label: i64, continue_label: i64) {
        self.loops.push((break_label, continue_label));
    }

    pub fn pop_loop(&mut self) {
        self.loops.pop();
    }

    pub fn break_label(&self) -> Option<i64> {
        self.loops.last().map(|&(b, _)| b)
    }

    pub fn continue_label(&self) -> Option<i64> {
        self.loops.last().map(|&(_, c)| c)
    }

    // ── name and type reasoning ──────────────────────────────────────

    /// Qualify a package-local symbol.
    pub fn qualify(&self, name: &str) -> String {
        if name.contains('.') {
            name.to_string()
        } else {
            format!("{}.{}", self.pkg, name)
        }
    }

    /// Return arity of a callable symbol, preferring declared signatures.
    pub fn ret_count_of(&self, name: &str) -> usize {
        if let Some(sig) = self.tables.sigs.get(name) {
            return sig.results.len();
        }
        self.module.ret_count(name)
    }

    /// The qualified concrete name a declared type contributes to a local,
    /// pointer decoration preserved.
    fn concrete_name_of_type(&self, ty: &TypeExpr) -> Option<String> {
        match ty {
            TypeExpr::Named(n) => {
                let q = self.tables.qualify_type(&self.pkg, n);
                if self.tables.struct_fields(&q).is_some() || self.tables.aliases.contains_key(&q) {
                    Some(q)
                } else {
                    None
                }
            }
            TypeExpr::Ptr(inner) => self
                .concrete_name_of_type(inner)
                .map(|n| format!("*{}", n)),
            _ => None,
        }
    }

    /// Best-effort declared type of an expression. `None` means the
    /// lowering falls back to word-sized untyped handling.
    pub fn expr_type(&self, e: &Expr) -> Option<TypeExpr> {
        match e {
            Expr::IntLit(_) | Expr::Iota => Some(TypeExpr::Named("int".to_string())),
            Expr::StringLit(_) => Some(TypeExpr::Named("string".to_string())),
            Expr::BoolLit(_) => Some(TypeExpr::Named("bool".to_string())),
            Expr::Nil => None,
            Expr::Ident(name) => {
                if let Some(idx) = self.lookup(name) {
                    return self.infos[idx].ty.clone();
                }
                let q = self.qualify(name);
                if let Some(g) = self.tables.globals.get(&q) {
                    return g.ty.clone();
                }
                match self.tables.consts.get(&q) {
                    Some(crate::consts::ConstValue::Str(_)) => {
                        Some(TypeExpr::Named("string".to_string()))
                    }
                    Some(crate::consts::ConstValue::Bool(_)) => {
                        Some(TypeExpr::Named("bool".to_string()))
                    }
                    Some(crate::consts::ConstValue::Int(_)) => {
                        Some(TypeExpr::Named("int".to_string()))
                    }
                    None => None,
                }
            }
            Expr::Selector { base, name } => {
                let concrete = self.concrete_type_of(base)?;
                self.tables.field_type(&concrete, name).cloned()
            }
            Expr::Index { base, .. } => match self.expr_type(base)? {
                TypeExpr::Slice(elem) => Some(*elem),
                TypeExpr::Map(_, value) => Some(*value),
                TypeExpr::Named(n) if n == "string" => Some(TypeExpr::Named("byte".to_string())),
                _ => None,
            },
            Expr::SliceExpr { base, .. } => self.expr_type(base),
            Expr::Call { callee, .. } => {
                let name = self.callee_name(callee)?;
                self.tables
                    .sigs
                    .get(&name)
                    .and_then(|sig| sig.results.first().cloned())
            }
            Expr::Binary { op, lhs, rhs } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(TypeExpr::Named("bool".to_string()));
                }
                let lt = self.expr_type(lhs);
                let rt = self.expr_type(rhs);
                match (&lt, &rt) {
                    (Some(t), _) if t.is_string() => lt,
                    (_, Some(t)) if t.is_string() => rt,
                    (Some(a), Some(b)) => {
                        if a.width() >= b.width() {
                            lt
                        } else {
                            rt
                        }
                    }
                    (Some(_), None) => lt,
                    _ => rt,
                }
            }
            Expr::Unary { operand, .. } => self.expr_type(operand),
            Expr::Composite { ty, .. } => Some(ty.clone()),
            Expr::Addr(inner) => Some(TypeExpr::Ptr(Box::new(
                self.expr_type(inner)
                    .unwrap_or(TypeExpr::Named("int".to_string())),
            ))),
            Expr::Deref(inner) => match self.expr_type(inner)? {
                TypeExpr::Ptr(pointee) => Some(*pointee),
                _ => None,
            },
            Expr::Conv { ty, .. } => Some(ty.clone()),
            Expr::Make { ty, .. } => Some(ty.clone()),
        }
    }

    /// Result width of an expression per the max-width rule.
    pub fn width_of(&self, e: &Expr) -> u8 {
        self.expr_type(e).map(|t| t.width()).unwrap_or(0)
    }

    pub fn is_string_expr(&self, e: &Expr) -> bool {
        matches!(self.expr_type(e), Some(t) if t.is_string())
    }

    /// Qualified concrete type of an expression, pointer decoration
    /// stripped. Used for method resolution and struct-deref detection.
    pub fn concrete_type_of(&self, e: &Expr) -> Option<String> {
        let raw = self.raw_concrete_of(e)?;
        Some(raw.trim_start_matches('*').to_string())
    }

    fn raw_concrete_of(&self, e: &Expr) -> Option<String> {
        match e {
            Expr::Ident(name) => {
                if let Some(idx) = self.lookup(name) {
                    if let Some(c) = &self.infos[idx].concrete {
                        return Some(c.clone());
                    }
                    return self
                        .infos[idx]
                        .ty
                        .as_ref()
                        .and_then(|t| self.concrete_name_of_type(t));
                }
                let q = self.qualify(name);
                self.tables
                    .globals
                    .get(&q)
                    .and_then(|g| g.ty.as_ref())
                    .and_then(|t| self.concrete_name_of_type(t))
            }
            Expr::Deref(inner) => self.raw_concrete_of(inner),
            Expr::Addr(inner) => self.raw_concrete_of(inner).map(|n| format!("*{}", n)),
            Expr::Composite { ty, .. } | Expr::Conv { ty, .. } => {
                ty.named().map(|n| self.tables.qualify_type(&self.pkg, n))
            }
            Expr::Selector { base, name } => {
                let owner = self.concrete_type_of(base)?;
                self.tables
                    .field_type(&owner, name)
                    .and_then(|t| self.concrete_name_of_type(t))
            }
            Expr::Call { callee, .. } => {
                let fname = self.callee_name(callee)?;
                self.tables
                    .sigs
                    .get(&fname)
                    .and_then(|sig| sig.results.first())
                    .and_then(|t| self.concrete_name_of_type(t))
            }
            Expr::Index { base, .. } => match self.expr_type(base)? {
                TypeExpr::Slice(elem) => self.concrete_name_of_type(&elem),
                _ => None,
            },
            _ => None,
        }
    }

    /// IR name of a directly-called function, if the callee is a plain
    /// (possibly package-qualified) identifier.
    pub fn callee_name(&self, callee: &Expr) -> Option<String> {
        match callee {
            Expr::Ident(name) => {
                let q = self.qualify(name);
                if self.tables.sigs.contains_key(&q) {
                    Some(q)
                } else if self.tables.sigs.contains_key(name)
                    || name.starts_with("runtime.")
                {
                    Some(name.clone())
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Whether a declared type is an interface at this layer.
    pub fn is_interface_type(&self, ty: &TypeExpr) -> bool {
        match ty {
            TypeExpr::Any => true,
            TypeExpr::Named(n) => {
                let q = self.tables.qualify_type(&self.pkg, n);
                self.tables.is_interface_name(&q)
            }
            _ => false,
        }
    }

    // ── defers ───────────────────────────────────────────────────────

    pub(crate) fn push_defer(&mut self, record: DeferRecord) {
        self.defers.push(record);
    }

    /// Replay deferred calls in reverse declaration order; prefixed to
    /// every return.
    pub fn replay_defers(&mut self) {
        let defers = self.defers.clone();
        for d in defers.iter().rev() {
            for &slot in &d.args {
                self.emit(Inst::with_arg(Op::LocalGet, slot as i64));
            }
            self.emit(Inst::with_name(Op::Call, d.name.clone(), d.args.len() as i64));
            for _ in 0..d.rets {
                self.emit(Inst::new(Op::Drop));
            }
        }
    }

    // ── function assembly ────────────────────────────────────────────

    /// Bind the declared parameters: allocate their slots in declaration
    /// order (receiver first) and emit the reverse-order `LOCAL_SET`s that
    /// move the caller-pushed arguments into them.
    pub fn bind_params(&mut self, params: &[(String, TypeExpr)]) {
        for (name, ty) in params {
            self.add_local(name, Some(ty.clone()));
        }
        self.func.params = params.len();
        self.depth = params.len() as i64;
        for i in (0..params.len()).rev() {
            self.emit(Inst::with_arg(Op::LocalSet, i as i64));
        }
    }

    /// Finish the function: fall-off-the-end handling plus the implicit
    /// return for void functions.
    pub fn finish(mut self) -> IrFunc {
        if self.reachable {
            if self.func.returns == 0 {
                self.replay_defers();
                self.emit(Inst::new(Op::Return));
            } else {
                self.error("missing return".to_string());
            }
        }
        self.func
    }

    pub fn results(&self) -> &[TypeExpr] {
        &self.results
    }
}

/// Lower one declared function or method.
pub fn lower_func(
    tables: &Tables,
    module: &mut IrModule,
    errors: &mut Vec<String>,
    pkg: &str,
    word: i64,
    decl: &FuncDecl,
) -> IrFunc {
    let name = crate::prepass::ir_func_name(pkg, decl);
    let mut lowerer = FuncLowerer::new(
        tables,
        module,
        errors,
        pkg,
        word,
        name,
        decl.results.clone(),
    );

    let mut params: Vec<(String, TypeExpr)> = Vec::new();
    if let Some(recv) = &decl.recv {
        params.push((recv.name.clone(), recv.ty.clone()));
    }
    for p in &decl.params {
        params.push((p.name.clone(), p.ty.clone()));
    }
    if let Some(pack) = &decl.variadic {
        params.push((
            pack.name.clone(),
            TypeExpr::Slice(Box::new(pack.ty.clone())),
        ));
        lowerer.func.variadic = Some(VariadicInfo {
            fixed: decl.params.len() + decl.recv.is_some() as usize,
            elem_width: if matches!(pack.ty, TypeExpr::Any) {
                0
            } else {
                pack.ty.width()
            },
            boxed: matches!(pack.ty, TypeExpr::Any),
        });
    }
    lowerer.bind_params(&params);

    for stmt in &decl.body {
        lowerer.lower_stmt(stmt);
    }
    lowerer.finish()
}

/// Synthesize `pkg.init$globals`: the ordered initializers of the
/// package's globals and embed-tagged variables.
pub fn lower_globals_init(
    tables: &Tables,
    module: &mut IrModule,
    errors: &mut Vec<String>,
    pkg: &str,
    word: i64,
    globals: &[GlobalDecl],
) -> IrFunc {
    let name = format!("{}.init$globals", pkg);
    let mut lowerer = FuncLowerer::new(tables, module, errors, pkg, word, name, Vec::new());

    for g in globals {
        let qualified = format!("{}.{}", pkg, g.name);
        let index = match lowerer.tables.globals.get(&qualified) {
            Some(info) => info.index,
            None => continue,
        };
        if let Some(data) = &g.embed {
            lowerer.emit(Inst {
                op: Op::ConstStr,
                arg: 0,
                width: 0,
                val: 0,
                name: data.clone(),
            });
            lowerer.emit(Inst::with_arg(Op::GlobalSet, index as i64));
        } else if let Some(init) = &g.init {
            lowerer.lower_expr(init);
            lowerer.emit(Inst::with_arg(Op::GlobalSet, index as i64));
        }
    }
    lowerer.finish()
}
