//! Compilation errors.
//!
//! User-tier problems are collected across the whole module and reported
//! together; internal invariant failures panic with an `ICE:` prefix and
//! indicate a compiler bug, never bad input.

use thiserror::Error;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error)]
pub enum CompileError {
    /// All user-tier diagnostics of one run, in source order.
    #[error("{}", .0.join("\n"))]
    User(Vec<String>),
}

impl CompileError {
    /// The individual diagnostic lines.
    pub fn messages(&self) -> &[String] {
        match self {
            CompileError::User(msgs) => msgs,
        }
    }
}
