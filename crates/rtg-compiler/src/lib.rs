//! rtg compiler — AST to stack-machine IR lowering.
//!
//! The compiler walks every package of a resolved [`Program`] in
//! topological order and produces one flat [`IrModule`]: a synthetic
//! `pkg.init$globals` function per package followed by one IR function per
//! declared function and method. Several whole-module prepasses run first
//! (global slots, constants with `iota`, method table and type ids,
//! interface lists); function bodies are then lowered in a single pass
//! each.
//!
//! User-tier diagnostics are collected across the entire module and
//! returned together; internal invariant violations panic with an `ICE:`
//! prefix.

#![warn(rust_2018_idioms)]

pub mod consts;
pub mod error;
pub mod lower;
pub mod prepass;

pub use error::{CompileError, CompileResult};

use lower::{lower_func, lower_globals_init};
use prepass::{run_prepasses, Tables};
use rtg_ast::{Program, Target};
use rtg_ir::IrModule;

/// Main compiler entry point. One value per invocation; the target record
/// is immutable for the compiler's lifetime.
pub struct Compiler {
    target: Target,
}

impl Compiler {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    /// Compile a resolved program into one IR module.
    pub fn compile(&self, program: &Program) -> CompileResult<IrModule> {
        let word = self.target.word_size();
        let mut module = IrModule::new();
        let mut tables = Tables::default();
        let mut errors: Vec<String> = Vec::new();

        run_prepasses(program, &mut module, &mut tables, &mut errors);

        for pkg in &program.packages {
            let init = lower_globals_init(
                &tables,
                &mut module,
                &mut errors,
                &pkg.path,
                word,
                &pkg.globals,
            );
            module.add_func(init);

            for decl in &pkg.funcs {
                let func = lower_func(&tables, &mut module, &mut errors, &pkg.path, word, decl);
                module.add_func(func);
            }
        }

        if errors.is_empty() {
            Ok(module)
        } else {
            Err(CompileError::User(errors))
        }
    }
}
