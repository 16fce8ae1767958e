//! AST node types.
//!
//! One enum variant per node kind; no subtyping. Names are plain `String`s,
//! already qualified by the resolver where they cross package boundaries
//! (`"fmt.Println"`), unqualified for package-local references.

/// A type expression as written in a declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// A named type: a builtin (`int`, `string`, `bool`, `byte`, `uint16`,
    /// `int32`, `uint32`, `int64`, `uint64`, `error`) or a declared type,
    /// package-qualified when foreign (`"io.Reader"`).
    Named(String),
    /// `*T`
    Ptr(Box<TypeExpr>),
    /// `[]T`
    Slice(Box<TypeExpr>),
    /// `map[K]V`
    Map(Box<TypeExpr>, Box<TypeExpr>),
    /// `interface{}`
    Any,
}

impl TypeExpr {
    /// Explicit byte width for sub-word integer types; 0 means the natural
    /// machine word.
    pub fn width(&self) -> u8 {
        match self {
            TypeExpr::Named(name) => match name.as_str() {
                "byte" | "bool" | "uint8" | "int8" => 1,
                "uint16" | "int16" => 2,
                "int32" | "uint32" => 4,
                "int64" | "uint64" => 8,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Whether a local of this type spans 64 bits even on 32-bit targets.
    pub fn is_wide(&self) -> bool {
        matches!(self, TypeExpr::Named(n) if n == "int64" || n == "uint64")
    }

    pub fn is_string(&self) -> bool {
        matches!(self, TypeExpr::Named(n) if n == "string")
    }

    /// The bare name for `Named`, `None` otherwise.
    pub fn named(&self) -> Option<&str> {
        match self {
            TypeExpr::Named(n) => Some(n),
            _ => None,
        }
    }

    /// Element size in bytes for a slice of this element type, given the
    /// target word size.
    pub fn elem_size(&self, word: i64) -> i64 {
        match self.width() {
            0 => word,
            w => w as i64,
        }
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `&&` (short-circuit; lowered to branches, never an IR opcode)
    LogAnd,
    /// `||`
    LogOr,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::LogAnd | BinOp::LogOr)
    }
}

/// Unary operators. Address-of and dereference are separate node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// `!x`
    Not,
    /// `-x`
    Neg,
    /// `^x`
    Comp,
}

/// One element of a composite literal. Struct literals carry field-name
/// keys, map literals carry key expressions, slice literals carry none.
#[derive(Debug, Clone)]
pub struct CompositeElem {
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub enum Expr {
    IntLit(i64),
    StringLit(String),
    BoolLit(bool),
    Nil,
    /// Only valid inside a grouped `const` block.
    Iota,
    Ident(String),
    /// `x.name` — field access, method value, or package member; the
    /// compiler disambiguates from context.
    Selector { base: Box<Expr>, name: String },
    Index { base: Box<Expr>, index: Box<Expr> },
    /// `x[lo:hi]`; either bound may be omitted.
    SliceExpr {
        base: Box<Expr>,
        lo: Option<Box<Expr>>,
        hi: Option<Box<Expr>>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        /// `f(xs...)`
        spread: bool,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnOp, operand: Box<Expr> },
    /// `T{...}`, `[]T{...}`, `map[K]V{...}`
    Composite {
        ty: TypeExpr,
        elems: Vec<CompositeElem>,
    },
    /// `&x`
    Addr(Box<Expr>),
    /// `*p`
    Deref(Box<Expr>),
    /// `T(x)` — the resolver has already decided this is a conversion, not
    /// a call.
    Conv { ty: TypeExpr, arg: Box<Expr> },
    /// `make([]T, len[, cap])` / `make(map[K]V)` — the resolver keeps the
    /// type argument out of the ordinary argument list.
    Make {
        ty: TypeExpr,
        len: Option<Box<Expr>>,
        cap: Option<Box<Expr>>,
    },
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub exprs: Vec<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    /// `var name T = init`
    Decl {
        name: String,
        ty: Option<TypeExpr>,
        init: Option<Expr>,
    },
    /// `a, b := expr` (multiple names only for multi-return calls)
    Define { names: Vec<String>, init: Expr },
    /// `a = x` or `a, b = f()`
    Assign { targets: Vec<Expr>, values: Vec<Expr> },
    /// `a op= x`
    OpAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },
    /// `a++` / `a--`
    IncDec { target: Expr, inc: bool },
    ExprStmt(Expr),
    Return(Vec<Expr>),
    If {
        init: Option<Box<Stmt>>,
        cond: Expr,
        then: Vec<Stmt>,
        els: Option<Vec<Stmt>>,
    },
    /// All three non-range `for` shapes; a bare loop has no clauses.
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    /// `for k, v := range expr`
    Range {
        key: Option<String>,
        value: Option<String>,
        expr: Expr,
        body: Vec<Stmt>,
    },
    Switch {
        init: Option<Box<Stmt>>,
        tag: Option<Expr>,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    Break,
    Continue,
    Block(Vec<Stmt>),
    /// `defer f(args...)` — the expression is always a call.
    Defer(Expr),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: String,
    /// Receiver; its type is `Named` or `Ptr(Named)`.
    pub recv: Option<Param>,
    pub params: Vec<Param>,
    /// Trailing `...T` parameter; its `ty` is the element type (`Any` for
    /// `...interface{}`).
    pub variadic: Option<Param>,
    pub results: Vec<TypeExpr>,
    pub body: Vec<Stmt>,
}

/// One `name = expr` inside a `const (...)` group; an omitted expression
/// repeats the previous one with the incremented `iota`.
#[derive(Debug, Clone)]
pub struct ConstSpec {
    pub name: String,
    pub expr: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct ConstGroup {
    pub specs: Vec<ConstSpec>,
}

/// A package-level `var`. `embed` carries the bundled file contents when the
/// declaration was `//go:embed`-tagged; the driver resolves the file before
/// the core runs.
#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub embed: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TypeDef {
    Struct { name: String, fields: Vec<Param> },
    Interface { name: String, methods: Vec<String> },
    /// `type Name underlying` over a non-struct, non-interface type.
    Alias { name: String, ty: TypeExpr },
}

impl TypeDef {
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Struct { name, .. }
            | TypeDef::Interface { name, .. }
            | TypeDef::Alias { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Package {
    /// Import path; `"main"` for the root package.
    pub path: String,
    pub consts: Vec<ConstGroup>,
    pub globals: Vec<GlobalDecl>,
    pub types: Vec<TypeDef>,
    pub funcs: Vec<FuncDecl>,
}

/// The resolved module: packages in topological import order (the resolver
/// has already rejected cycles).
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub packages: Vec<Package>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_widths() {
        assert_eq!(TypeExpr::Named("byte".into()).width(), 1);
        assert_eq!(TypeExpr::Named("uint16".into()).width(), 2);
        assert_eq!(TypeExpr::Named("int32".into()).width(), 4);
        assert_eq!(TypeExpr::Named("int64".into()).width(), 8);
        assert_eq!(TypeExpr::Named("int".into()).width(), 0);
        assert_eq!(TypeExpr::Named("Point".into()).width(), 0);
    }

    #[test]
    fn test_wide_flag() {
        assert!(TypeExpr::Named("int64".into()).is_wide());
        assert!(TypeExpr::Named("uint64".into()).is_wide());
        assert!(!TypeExpr::Named("int32".into()).is_wide());
    }

    #[test]
    fn test_elem_size_defaults_to_word() {
        let t = TypeExpr::Named("int".into());
        assert_eq!(t.elem_size(8), 8);
        assert_eq!(t.elem_size(4), 4);
        let b = TypeExpr::Named("byte".into());
        assert_eq!(b.elem_size(8), 1);
    }

    #[test]
    fn test_binop_categories() {
        assert!(BinOp::Eq.is_comparison());
        assert!(!BinOp::Add.is_comparison());
        assert!(BinOp::LogAnd.is_logical());
        assert!(!BinOp::BitAnd.is_logical());
    }
}
