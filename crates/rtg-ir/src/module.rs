//! IR module records.

use crate::op::Op;
use crate::{TYPE_ID_INT, TYPE_ID_STRING};
use rustc_hash::FxHashMap;

/// One IR instruction. Which fields are meaningful depends on the opcode;
/// unused fields are zero / empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    /// The opcode.
    pub op: Op,
    /// Label id, local index, global index, byte offset, argument count,
    /// element size, or type id.
    pub arg: i64,
    /// Operand width in bytes (0 = natural machine word).
    pub width: u8,
    /// 64-bit literal payload.
    pub val: i64,
    /// String-literal payload or called-symbol name.
    pub name: String,
}

impl Inst {
    /// An instruction with all operand fields zeroed.
    pub fn new(op: Op) -> Self {
        Self {
            op,
            arg: 0,
            width: 0,
            val: 0,
            name: String::new(),
        }
    }

    /// Opcode plus `arg`.
    pub fn with_arg(op: Op, arg: i64) -> Self {
        Self { arg, ..Self::new(op) }
    }

    /// Opcode plus `val`.
    pub fn with_val(op: Op, val: i64) -> Self {
        Self { val, ..Self::new(op) }
    }

    /// Opcode plus `name` and `arg` (calls).
    pub fn with_name(op: Op, name: impl Into<String>, arg: i64) -> Self {
        Self {
            arg,
            name: name.into(),
            ..Self::new(op)
        }
    }
}

/// One local slot of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrLocal {
    /// Source name; hidden locals start with `$`.
    pub name: String,
    /// Set when the slot holds 64 bits even on 32-bit targets.
    pub wide: bool,
    /// Explicit byte width in {1,2,4,8}; 0 = natural machine word.
    pub width: u8,
}

/// Variadic metadata of a function with a trailing `...T` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariadicInfo {
    /// Number of fixed parameters before the pack.
    pub fixed: usize,
    /// Byte width of one packed element (0 = word).
    pub elem_width: u8,
    /// Set for `...interface{}`: every packed argument is boxed.
    pub boxed: bool,
}

/// One IR function.
#[derive(Debug, Clone)]
pub struct IrFunc {
    /// Fully qualified: `"pkg.Name"` or `"pkg.Type.Method"`.
    pub name: String,
    /// Parameter count; a receiver counts as parameter 0.
    pub params: usize,
    /// Return arity.
    pub returns: usize,
    /// Local slot arena. The first `params` slots are the parameters.
    pub locals: Vec<IrLocal>,
    /// Present when the final parameter is variadic.
    pub variadic: Option<VariadicInfo>,
    /// Linear instruction sequence.
    pub code: Vec<Inst>,
}

/// One module-level variable slot; word-sized, composite values are a
/// single pointer to a heap header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrGlobal {
    /// Qualified name, `"pkg.Name"`.
    pub name: String,
}

/// A complete compiled module. All cross-references are by name or by
/// small index; ordered `Vec`s carry every iteration order so that output
/// is deterministic.
#[derive(Debug, Clone, Default)]
pub struct IrModule {
    /// Functions in emission order.
    pub funcs: Vec<IrFunc>,
    /// Global slots; the index in this vector is the slot index.
    pub globals: Vec<IrGlobal>,
    /// Concrete-type name → type id, in assignment order. Ids 1 and 2 are
    /// `int` and `string`.
    pub type_ids: Vec<(String, i64)>,
    /// `"pkg.Type.Method"` → qualified IR function name, in declaration
    /// order.
    pub methods: Vec<(String, String)>,
    /// Interface name → ordered method names.
    pub interfaces: Vec<(String, Vec<String>)>,

    func_index: FxHashMap<String, usize>,
}

impl IrModule {
    /// An empty module with the two reserved type ids installed.
    pub fn new() -> Self {
        Self {
            type_ids: vec![
                ("int".to_string(), TYPE_ID_INT),
                ("string".to_string(), TYPE_ID_STRING),
            ],
            ..Default::default()
        }
    }

    /// Append a function and index it by name.
    pub fn add_func(&mut self, func: IrFunc) {
        self.func_index.insert(func.name.clone(), self.funcs.len());
        self.funcs.push(func);
    }

    /// Look up a function by qualified name.
    pub fn func(&self, name: &str) -> Option<&IrFunc> {
        self.func_index.get(name).map(|&i| &self.funcs[i])
    }

    /// Whether a function with this name exists.
    pub fn has_func(&self, name: &str) -> bool {
        self.func_index.contains_key(name)
    }

    /// Append a global, returning its slot index.
    pub fn add_global(&mut self, name: impl Into<String>) -> usize {
        self.globals.push(IrGlobal { name: name.into() });
        self.globals.len() - 1
    }

    /// Slot index of a global by qualified name.
    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.globals.iter().position(|g| g.name == name)
    }

    /// Register a concrete type, returning its id (existing or fresh).
    pub fn type_id(&mut self, name: &str) -> i64 {
        if let Some(&(_, id)) = self.type_ids.iter().find(|(n, _)| n == name) {
            return id;
        }
        let id = self.type_ids.last().map(|&(_, id)| id).unwrap_or(0) + 1;
        self.type_ids.push((name.to_string(), id));
        id
    }

    /// Id of an already-registered type.
    pub fn lookup_type_id(&self, name: &str) -> Option<i64> {
        self.type_ids.iter().find(|(n, _)| n == name).map(|&(_, id)| id)
    }

    /// Largest type id in use.
    pub fn max_type_id(&self) -> i64 {
        self.type_ids.last().map(|&(_, id)| id).unwrap_or(0)
    }

    /// Record a method: `"pkg.Type.Method"` → IR function name.
    pub fn add_method(&mut self, key: impl Into<String>, func: impl Into<String>) {
        self.methods.push((key.into(), func.into()));
    }

    /// Resolve a method-table key.
    pub fn method(&self, key: &str) -> Option<&str> {
        self.methods
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, f)| f.as_str())
    }

    /// Record an interface's ordered method list.
    pub fn add_interface(&mut self, name: impl Into<String>, methods: Vec<String>) {
        self.interfaces.push((name.into(), methods));
    }

    /// Whether a name is a declared interface.
    pub fn is_interface(&self, name: &str) -> bool {
        name == "error" || name == "interface{}" || self.interfaces.iter().any(|(n, _)| n == name)
    }

    /// Return arity of a called symbol: a module function, a known runtime
    /// symbol, or a composite constructor (always 1). Unknown `runtime.*`
    /// names default to one return.
    pub fn ret_count(&self, name: &str) -> usize {
        if let Some(f) = self.func(name) {
            return f.returns;
        }
        if name.starts_with(crate::BUILTIN_COMPOSITE_PREFIX) {
            return 1;
        }
        crate::op::runtime_arity(name).map(|(_, r)| r).unwrap_or(1)
    }

    /// Concrete methods implementing a method name, as
    /// `(type_id, func_name)` pairs in ascending type-id order. This is the
    /// backend's dispatch chain for `IFACE_CALL`.
    pub fn iface_impls(&self, method: &str) -> Vec<(i64, String)> {
        let suffix = format!(".{}", method);
        let mut impls: Vec<(i64, String)> = Vec::new();
        for (key, func) in &self.methods {
            if let Some(type_name) = key.strip_suffix(&suffix) {
                let bare = type_name.replace('*', "");
                if let Some(id) = self.lookup_type_id(&bare) {
                    if !impls.iter().any(|(i, _)| *i == id) {
                        impls.push((id, func.clone()));
                    }
                }
            }
        }
        impls.sort_by_key(|&(id, _)| id);
        impls
    }

    /// Rebuild the name index after functions were removed or reordered.
    pub fn reindex(&mut self) {
        self.func_index = self
            .funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_func(name: &str) -> IrFunc {
        IrFunc {
            name: name.to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: Vec::new(),
        }
    }

    #[test]
    fn test_reserved_type_ids() {
        let mut m = IrModule::new();
        assert_eq!(m.lookup_type_id("int"), Some(1));
        assert_eq!(m.lookup_type_id("string"), Some(2));
        assert_eq!(m.type_id("main.Point"), 3);
        assert_eq!(m.type_id("main.Point"), 3);
        assert_eq!(m.type_id("main.Line"), 4);
        assert_eq!(m.max_type_id(), 4);
    }

    #[test]
    fn test_func_index_tracks_additions() {
        let mut m = IrModule::new();
        m.add_func(empty_func("main.main"));
        m.add_func(empty_func("main.helper"));
        assert!(m.has_func("main.main"));
        assert_eq!(m.func("main.helper").unwrap().name, "main.helper");
        assert!(m.func("main.gone").is_none());
    }

    #[test]
    fn test_global_slots_are_ordered() {
        let mut m = IrModule::new();
        assert_eq!(m.add_global("main.a"), 0);
        assert_eq!(m.add_global("main.b"), 1);
        assert_eq!(m.global_index("main.b"), Some(1));
    }

    #[test]
    fn test_ret_count_fallbacks() {
        let mut m = IrModule::new();
        let mut f = empty_func("main.pair");
        f.returns = 2;
        m.add_func(f);
        assert_eq!(m.ret_count("main.pair"), 2);
        assert_eq!(m.ret_count("builtin.composite.Point"), 1);
        assert_eq!(m.ret_count("runtime.MapGet"), 2);
        assert_eq!(m.ret_count("runtime.MapDelete"), 0);
        assert_eq!(m.ret_count("runtime.Unknown"), 1);
    }

    #[test]
    fn test_iface_impls_sorted_by_type_id() {
        let mut m = IrModule::new();
        m.type_id("main.B");
        m.type_id("main.A");
        m.add_method("main.A.String", "main.A.String");
        m.add_method("main.*B.String", "main.B.String");
        let impls = m.iface_impls("String");
        assert_eq!(
            impls,
            vec![(3, "main.B.String".to_string()), (4, "main.A.String".to_string())]
        );
    }

    #[test]
    fn test_is_interface_builtin_error() {
        let mut m = IrModule::new();
        assert!(m.is_interface("error"));
        assert!(!m.is_interface("main.Point"));
        m.add_interface("main.Shape", vec!["Area".to_string()]);
        assert!(m.is_interface("main.Shape"));
    }
}
