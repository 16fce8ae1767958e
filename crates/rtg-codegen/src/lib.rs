//! rtg code generation: per-ISA instruction emitters, per-target drivers,
//! and object-format writers.
//!
//! [`generate`] is the single entry point: it walks the pruned IR module
//! once with the target's driver, lays the image out with the matching
//! object writer, patches every fixup, and returns the final file bytes
//! together with the per-function size report.

#![warn(rust_2018_idioms)]

pub mod a64;
pub mod backend;
pub mod buf;
pub mod error;
pub mod fixup;
pub mod obj;
pub mod x86;

pub use error::EmitError;

use backend::{amd64, arm64, cgen, i386, wasm};
use rtg_ast::{Arch, Os, Target};
use rtg_ir::{IrModule, SizeReport};

/// What to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitKind {
    /// A native executable for the given target.
    Native(Target),
    /// C source with the given word width in bits (16, 32, or 64).
    CSource(u8),
}

/// The finished image plus its size report.
#[derive(Debug)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub sizes: SizeReport,
    /// Whether the output should carry the executable bit.
    pub executable: bool,
}

/// Generate the final output for one module. A fresh code generator is
/// constructed per call; nothing is shared between invocations.
pub fn generate(module: &IrModule, emit: EmitKind) -> Result<Artifact, EmitError> {
    match emit {
        EmitKind::CSource(bits) => {
            let bytes = cgen::lower(module, bits)?;
            Ok(Artifact {
                bytes,
                sizes: SizeReport::default(),
                executable: false,
            })
        }
        EmitKind::Native(target) => generate_native(module, target),
    }
}

fn generate_native(module: &IrModule, target: Target) -> Result<Artifact, EmitError> {
    match (target.os, target.arch) {
        (Os::Linux, Arch::Amd64) => {
            let lowered = amd64::lower(module, false)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::elf::write(lowered, obj::elf::Machine::Amd64)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Linux, Arch::I386) => {
            let lowered = i386::lower(module)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::elf::write(lowered, obj::elf::Machine::I386)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Linux, Arch::Arm64) => {
            let lowered = arm64::lower(module, arm64::Flavor::Linux)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::elf::write(lowered, obj::elf::Machine::Arm64)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Windows, Arch::Amd64) => {
            let lowered = amd64::lower(module, true)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::pe::write(lowered, obj::pe::Machine::Amd64)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Windows, Arch::Arm64) => {
            let lowered = arm64::lower(module, arm64::Flavor::Windows)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::pe::write(lowered, obj::pe::Machine::Arm64)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Darwin, Arch::Arm64) => {
            let lowered = arm64::lower(module, arm64::Flavor::Darwin)?;
            let sizes = SizeReport::from_sizes(lowered.sizes.clone());
            let bytes = obj::macho::write(lowered)?;
            Ok(Artifact {
                bytes,
                sizes,
                executable: true,
            })
        }
        (Os::Wasi, Arch::Wasm32) => {
            let (bytes, sizes) = wasm::lower(module)?;
            Ok(Artifact {
                bytes,
                sizes: SizeReport::from_sizes(sizes),
                executable: false,
            })
        }
        _ => Err(EmitError::UnsupportedTarget(target.triple())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtg_ir::{Inst, IrFunc, IrModule, Op};

    fn module() -> IrModule {
        let mut m = IrModule::new();
        m.add_func(IrFunc {
            name: "main.main".to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: vec![Inst::new(Op::Return)],
        });
        m
    }

    #[test]
    fn test_all_native_targets_produce_output() {
        for triple in [
            "linux/amd64",
            "linux/386",
            "linux/arm64",
            "windows/amd64",
            "windows/arm64",
            "darwin/arm64",
            "wasi/wasm32",
        ] {
            let target = Target::parse(triple).unwrap();
            let artifact = generate(&module(), EmitKind::Native(target)).unwrap();
            assert!(!artifact.bytes.is_empty(), "empty output for {}", triple);
        }
    }

    #[test]
    fn test_deterministic_output() {
        let target = Target::parse("linux/amd64").unwrap();
        let a = generate(&module(), EmitKind::Native(target)).unwrap();
        let b = generate(&module(), EmitKind::Native(target)).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_c_source_mode() {
        let artifact = generate(&module(), EmitKind::CSource(64)).unwrap();
        assert!(!artifact.executable);
        let src = String::from_utf8(artifact.bytes).unwrap();
        assert!(src.contains("int main"));
    }
}
