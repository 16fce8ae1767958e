//! Whole-pipeline tests: lower a small resolved AST with the compiler,
//! verify and prune the IR, and drive every backend over it.

use rtg_ast::{Expr, FuncDecl, Package, Param, Program, Stmt, Target, TypeExpr};
use rtg_codegen::{generate, EmitKind};
use rtg_compiler::Compiler;
use rtg_ir::{eliminate_dead_funcs, verify_module, IrModule};

/// A minimal stand-in for the statically-bundled runtime: the driver
/// normally compiles the real runtime sources into the same module.
fn runtime_package() -> Package {
    let int_ty = TypeExpr::Named("int".to_string());
    Package {
        path: "runtime".to_string(),
        consts: Vec::new(),
        globals: Vec::new(),
        types: Vec::new(),
        funcs: vec![
            FuncDecl {
                name: "Alloc".to_string(),
                recv: None,
                params: vec![Param {
                    name: "n".to_string(),
                    ty: int_ty.clone(),
                }],
                variadic: None,
                results: vec![int_ty.clone()],
                body: vec![Stmt::Return(vec![Expr::IntLit(0)])],
            },
            FuncDecl {
                name: "Print".to_string(),
                recv: None,
                params: vec![Param {
                    name: "args".to_string(),
                    ty: TypeExpr::Slice(Box::new(TypeExpr::Any)),
                }],
                variadic: None,
                results: Vec::new(),
                body: Vec::new(),
            },
        ],
    }
}

fn hello_program() -> Program {
    // func main() { print("hi\n") }
    let print_call = Expr::Call {
        callee: Box::new(Expr::Ident("print".to_string())),
        args: vec![Expr::StringLit("hi\n".to_string())],
        spread: false,
    };
    Program {
        packages: vec![
            runtime_package(),
            Package {
                path: "main".to_string(),
                consts: Vec::new(),
                globals: Vec::new(),
                types: Vec::new(),
                funcs: vec![FuncDecl {
                    name: "main".to_string(),
                    recv: None,
                    params: Vec::new(),
                    variadic: None,
                    results: Vec::new(),
                    body: vec![Stmt::ExprStmt(print_call)],
                }],
            },
        ],
    }
}

fn compile(target: &str) -> IrModule {
    let target = Target::parse(target).unwrap();
    let mut module = Compiler::new(target)
        .compile(&hello_program())
        .expect("compile");
    verify_module(&module).expect("verify");
    eliminate_dead_funcs(&mut module);
    verify_module(&module).expect("verify after dce");
    module
}

fn count_overlapping(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

#[test]
fn test_hello_elf_contains_literal_once() {
    let module = compile("linux/amd64");
    let target = Target::parse("linux/amd64").unwrap();
    let artifact = generate(&module, EmitKind::Native(target)).unwrap();
    assert_eq!(&artifact.bytes[..4], &[0x7f, b'E', b'L', b'F']);
    // Exactly one copy of the deduplicated literal bytes.
    assert_eq!(count_overlapping(&artifact.bytes, b"hi\n"), 1);
    assert!(artifact.executable);
}

#[test]
fn test_literal_dedup_across_uses() {
    // The same literal in many positions lands in rodata once.
    let mut program = hello_program();
    let print_call = Expr::Call {
        callee: Box::new(Expr::Ident("print".to_string())),
        args: vec![Expr::StringLit("abc".to_string())],
        spread: false,
    };
    for _ in 0..100 {
        program.packages[0].funcs[0]
            .body
            .push(Stmt::ExprStmt(print_call.clone()));
    }
    let target = Target::parse("linux/amd64").unwrap();
    let mut module = Compiler::new(target).compile(&program).unwrap();
    eliminate_dead_funcs(&mut module);
    let artifact = generate(&module, EmitKind::Native(target)).unwrap();
    assert_eq!(count_overlapping(&artifact.bytes, b"abc"), 1);
}

#[test]
fn test_every_backend_accepts_compiled_module() {
    for triple in [
        "linux/amd64",
        "linux/386",
        "linux/arm64",
        "windows/amd64",
        "windows/arm64",
        "darwin/arm64",
        "wasi/wasm32",
    ] {
        let module = compile(triple);
        let target = Target::parse(triple).unwrap();
        let artifact = generate(&module, EmitKind::Native(target)).unwrap();
        assert!(!artifact.bytes.is_empty(), "{} produced no bytes", triple);
    }
}

#[test]
fn test_size_report_covers_main() {
    let module = compile("linux/amd64");
    let target = Target::parse("linux/amd64").unwrap();
    let artifact = generate(&module, EmitKind::Native(target)).unwrap();
    assert!(artifact
        .sizes
        .funcs
        .iter()
        .any(|f| f.name == "main.main" && f.bytes > 0));
}

#[test]
fn test_c_backend_renders_compiled_module() {
    let module = compile("linux/amd64");
    let artifact = generate(&module, EmitKind::CSource(64)).unwrap();
    let src = String::from_utf8(artifact.bytes).unwrap();
    assert!(src.contains("main_main"));
    assert!(src.contains("runtime_Print"));
}

#[test]
fn test_output_determinism_across_runs() {
    let target = Target::parse("linux/arm64").unwrap();
    let a = generate(&compile("linux/arm64"), EmitKind::Native(target)).unwrap();
    let b = generate(&compile("linux/arm64"), EmitKind::Native(target)).unwrap();
    assert_eq!(a.bytes, b.bytes);
}
