//! Stack-machine intermediate representation for the rtg compiler.
//!
//! This crate defines the instruction set and module records the compiler
//! produces and every backend consumes, the textual IR form (emit and
//! parse round-trip byte-for-byte), the module verifier, and dead-function
//! elimination.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod dce;
pub mod module;
pub mod op;
pub mod report;
pub mod text;
pub mod verify;

pub use dce::eliminate_dead_funcs;
pub use module::{Inst, IrFunc, IrGlobal, IrModule, IrLocal, VariadicInfo};
pub use op::{runtime_arity, stack_effect, Op};
pub use report::{FuncSize, SizeReport};
pub use text::{emit_text, parse_text, ParseError};
pub use verify::{verify_module, VerifyError};

/// Type id permanently reserved for `int`.
pub const TYPE_ID_INT: i64 = 1;
/// Type id permanently reserved for `string`.
pub const TYPE_ID_STRING: i64 = 2;
/// First type id handed to user-declared concrete types.
pub const FIRST_USER_TYPE_ID: i64 = 3;

/// Prefix of the synthesized composite-literal constructors the backends
/// expand inline.
pub const BUILTIN_COMPOSITE_PREFIX: &str = "builtin.composite.";
/// Prefix of runtime symbols a module may leave unresolved (the runtime is
/// statically bundled by the driver).
pub const RUNTIME_PREFIX: &str = "runtime.";
