//! Object-format writers.
//!
//! Each writer consumes a [`Lowered`](crate::backend::Lowered) module,
//! lays the image out, resolves every fixup against the final virtual
//! addresses, and returns the complete file bytes. Multi-byte fields are
//! little-endian in every format.

pub mod dwarf;
pub mod elf;
pub mod macho;
pub mod pe;
pub mod wasm;
