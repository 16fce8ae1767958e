//! Backend errors.
//!
//! A backend failure is a single fatal diagnostic: there is no recovery
//! and no partial output. Internal dispatch inconsistencies (an opcode no
//! backend case handles) are ICEs and panic instead.

use crate::fixup::FixupError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("{0}")]
    Fixup(#[from] FixupError),

    #[error("unsupported target for backend: {0}")]
    UnsupportedTarget(String),

    #[error("text section too large: {0} bytes")]
    TextTooLarge(usize),
}
