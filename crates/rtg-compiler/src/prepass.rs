//! Whole-module prepasses.
//!
//! Before any function body is lowered the compiler makes several passes
//! over every package in topological order: register global slots, fold
//! constants, collect method declarations (assigning type ids to concrete
//! receiver types), and record interface method lists. The resulting
//! [`Tables`] are read-only during lowering.

use crate::consts::{eval_package_consts, ConstValue};
use rtg_ast::{FuncDecl, Param, Program, TypeDef, TypeExpr};
use rtg_ir::IrModule;
use rustc_hash::FxHashMap;

/// Declared signature of a function or method, keyed by IR function name.
#[derive(Debug, Clone)]
pub struct FuncSig {
    /// Receiver type when the function is a method.
    pub recv: Option<TypeExpr>,
    pub params: Vec<Param>,
    /// Element type of a trailing `...T` parameter.
    pub variadic: Option<TypeExpr>,
    pub results: Vec<TypeExpr>,
}

impl FuncSig {
    /// Total declared parameter count as the IR sees it: receiver plus
    /// fixed parameters plus the variadic slot.
    pub fn param_slots(&self) -> usize {
        self.recv.is_some() as usize + self.params.len() + self.variadic.is_some() as usize
    }
}

/// Metadata of one module-level variable.
#[derive(Debug, Clone)]
pub struct GlobalInfo {
    /// Slot index in the IR module.
    pub index: usize,
    /// Declared or inferred type, when known.
    pub ty: Option<TypeExpr>,
}

/// Read-only symbol tables shared by every function lowering.
#[derive(Debug, Default)]
pub struct Tables {
    /// Qualified struct name → declared fields.
    pub structs: FxHashMap<String, Vec<Param>>,
    /// Qualified alias name → underlying type.
    pub aliases: FxHashMap<String, TypeExpr>,
    /// Qualified interface name → ordered method names.
    pub interfaces: FxHashMap<String, Vec<String>>,
    /// IR function name → declared signature.
    pub sigs: FxHashMap<String, FuncSig>,
    /// Qualified const name → folded value.
    pub consts: FxHashMap<String, ConstValue>,
    /// Qualified global name → slot metadata.
    pub globals: FxHashMap<String, GlobalInfo>,
}

impl Tables {
    /// Resolve a type name seen inside package `pkg` to its qualified
    /// form: package-local declarations win, otherwise the name is taken
    /// as already qualified (or builtin).
    pub fn qualify_type<'a>(&self, pkg: &str, name: &'a str) -> String {
        if name.contains('.') {
            return name.to_string();
        }
        let local = format!("{}.{}", pkg, name);
        if self.structs.contains_key(&local)
            || self.aliases.contains_key(&local)
            || self.interfaces.contains_key(&local)
        {
            return local;
        }
        name.to_string()
    }

    /// Struct fields of a (possibly pointer-decorated) concrete type name.
    pub fn struct_fields(&self, name: &str) -> Option<&[Param]> {
        let bare = name.trim_start_matches('*');
        self.structs.get(bare).map(|f| f.as_slice())
    }

    /// Byte offset of a named field, counting declared fields times the
    /// word size.
    pub fn field_offset(&self, type_name: &str, field: &str, word: i64) -> Option<i64> {
        let fields = self.struct_fields(type_name)?;
        fields
            .iter()
            .position(|p| p.name == field)
            .map(|i| i as i64 * word)
    }

    /// Declared type of a named field.
    pub fn field_type(&self, type_name: &str, field: &str) -> Option<&TypeExpr> {
        let fields = self.struct_fields(type_name)?;
        fields.iter().find(|p| p.name == field).map(|p| &p.ty)
    }

    /// Whether the qualified name denotes an interface (including the
    /// builtin `error`).
    pub fn is_interface_name(&self, name: &str) -> bool {
        name == "error" || self.interfaces.contains_key(name)
    }
}

/// IR name of a declared function: `pkg.Name`, or `pkg.Type.Method` with
/// the receiver's pointer decoration stripped.
pub fn ir_func_name(pkg: &str, decl: &FuncDecl) -> String {
    match &decl.recv {
        Some(recv) => {
            let ty = recv_type_name(&recv.ty);
            format!("{}.{}.{}", pkg, ty, decl.name)
        }
        None => format!("{}.{}", pkg, decl.name),
    }
}

/// Method-table key of a declared method: pointer receivers keep their
/// `*` so lookups can distinguish the two forms.
pub fn method_key(pkg: &str, decl: &FuncDecl) -> Option<String> {
    let recv = decl.recv.as_ref()?;
    let key = match &recv.ty {
        TypeExpr::Ptr(inner) => format!("{}.*{}.{}", pkg, inner.named().unwrap_or(""), decl.name),
        ty => format!("{}.{}.{}", pkg, ty.named().unwrap_or(""), decl.name),
    };
    Some(key)
}

fn recv_type_name(ty: &TypeExpr) -> &str {
    match ty {
        TypeExpr::Ptr(inner) => inner.named().unwrap_or(""),
        other => other.named().unwrap_or(""),
    }
}

/// Run every prepass, filling `tables` and the module-level records of
/// `module` (global slots, type ids, method table, interface lists).
pub fn run_prepasses(
    program: &Program,
    module: &mut IrModule,
    tables: &mut Tables,
    errors: &mut Vec<String>,
) {
    // Type declarations first: struct layouts and interface lists are
    // needed while typing globals and signatures.
    for pkg in &program.packages {
        for def in &pkg.types {
            let qualified = format!("{}.{}", pkg.path, def.name());
            match def {
                TypeDef::Struct { fields, .. } => {
                    tables.structs.insert(qualified, fields.clone());
                }
                TypeDef::Interface { methods, .. } => {
                    tables.interfaces.insert(qualified.clone(), methods.clone());
                    module.add_interface(qualified, methods.clone());
                }
                TypeDef::Alias { ty, .. } => {
                    tables.aliases.insert(qualified, ty.clone());
                }
            }
        }
    }

    // Global slots in topological package order.
    for pkg in &program.packages {
        for g in &pkg.globals {
            let qualified = format!("{}.{}", pkg.path, g.name);
            if tables.globals.contains_key(&qualified) {
                errors.push(format!("duplicate global {}", qualified));
                continue;
            }
            let index = module.add_global(qualified.clone());
            let ty = g.ty.clone().or_else(|| {
                g.embed
                    .as_ref()
                    .map(|_| TypeExpr::Named("string".to_string()))
            });
            tables.globals.insert(qualified, GlobalInfo { index, ty });
        }
    }

    // Constants, with iota propagation.
    for pkg in &program.packages {
        eval_package_consts(&pkg.path, &pkg.consts, &mut tables.consts, errors);
    }

    // Method table and type ids: each concrete value-receiver type gets a
    // fresh id in declaration order (ids 1 and 2 are reserved).
    for pkg in &program.packages {
        for decl in &pkg.funcs {
            let ir_name = ir_func_name(&pkg.path, decl);
            if let Some(key) = method_key(&pkg.path, decl) {
                module.add_method(key, ir_name.clone());
                if let Some(recv) = &decl.recv {
                    if let Some(bare) = recv.ty.named() {
                        module.type_id(&format!("{}.{}", pkg.path, bare));
                    }
                }
            }
            tables.sigs.insert(
                ir_name,
                FuncSig {
                    recv: decl.recv.as_ref().map(|r| r.ty.clone()),
                    params: decl.params.clone(),
                    variadic: decl.variadic.as_ref().map(|p| p.ty.clone()),
                    results: decl.results.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ast::{GlobalDecl, Package};

    fn pkg(path: &str) -> Package {
        Package {
            path: path.to_string(),
            consts: Vec::new(),
            globals: Vec::new(),
            types: Vec::new(),
            funcs: Vec::new(),
        }
    }

    #[test]
    fn test_globals_registered_in_package_order() {
        let mut util = pkg("util");
        util.globals.push(GlobalDecl {
            name: "first".to_string(),
            ty: None,
            init: None,
            embed: None,
        });
        let mut main = pkg("main");
        main.globals.push(GlobalDecl {
            name: "second".to_string(),
            ty: None,
            init: None,
            embed: None,
        });
        let program = Program {
            packages: vec![util, main],
        };
        let mut module = IrModule::new();
        let mut tables = Tables::default();
        let mut errors = Vec::new();
        run_prepasses(&program, &mut module, &mut tables, &mut errors);
        assert_eq!(tables.globals["util.first"].index, 0);
        assert_eq!(tables.globals["main.second"].index, 1);
    }

    #[test]
    fn test_value_receiver_gets_type_id() {
        let mut main = pkg("main");
        main.types.push(TypeDef::Struct {
            name: "Point".to_string(),
            fields: vec![
                Param {
                    name: "x".to_string(),
                    ty: TypeExpr::Named("int".to_string()),
                },
                Param {
                    name: "y".to_string(),
                    ty: TypeExpr::Named("int".to_string()),
                },
            ],
        });
        main.funcs.push(FuncDecl {
            name: "Norm".to_string(),
            recv: Some(Param {
                name: "p".to_string(),
                ty: TypeExpr::Named("Point".to_string()),
            }),
            params: Vec::new(),
            variadic: None,
            results: vec![TypeExpr::Named("int".to_string())],
            body: Vec::new(),
        });
        let program = Program { packages: vec![main] };
        let mut module = IrModule::new();
        let mut tables = Tables::default();
        let mut errors = Vec::new();
        run_prepasses(&program, &mut module, &mut tables, &mut errors);
        assert_eq!(module.lookup_type_id("main.Point"), Some(3));
        assert_eq!(module.method("main.Point.Norm"), Some("main.Point.Norm"));
        assert_eq!(
            tables.field_offset("main.Point", "y", 8),
            Some(8)
        );
    }

    #[test]
    fn test_pointer_receiver_key_keeps_star() {
        let mut main = pkg("main");
        main.funcs.push(FuncDecl {
            name: "Close".to_string(),
            recv: Some(Param {
                name: "f".to_string(),
                ty: TypeExpr::Ptr(Box::new(TypeExpr::Named("File".to_string()))),
            }),
            params: Vec::new(),
            variadic: None,
            results: Vec::new(),
            body: Vec::new(),
        });
        let program = Program { packages: vec![main] };
        let mut module = IrModule::new();
        let mut tables = Tables::default();
        let mut errors = Vec::new();
        run_prepasses(&program, &mut module, &mut tables, &mut errors);
        assert_eq!(module.method("main.*File.Close"), Some("main.File.Close"));
    }

    #[test]
    fn test_qualify_prefers_local_declaration() {
        let mut tables = Tables::default();
        tables
            .structs
            .insert("main.Point".to_string(), Vec::new());
        assert_eq!(tables.qualify_type("main", "Point"), "main.Point");
        assert_eq!(tables.qualify_type("main", "int"), "int");
        assert_eq!(tables.qualify_type("main", "fmt.State"), "fmt.State");
    }
}
