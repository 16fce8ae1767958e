//! Target configuration.
//!
//! The driver parses the `-T os/arch` flag once and threads the resulting
//! immutable [`Target`] through the compiler and code-generator
//! constructors. Nothing in the pipeline reads process-wide state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unsupported build target: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Windows,
    Darwin,
    Wasi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    I386,
    Arm64,
    Wasm32,
}

/// An `os/arch` pair. Constructed once by the driver; read-only thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub os: Os,
    pub arch: Arch,
}

impl Target {
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Parse a `linux/amd64`-style triple. `windows/386` is recognized by
    /// the CLI grammar but has no object writer, so it is rejected here as
    /// an unsupported target.
    pub fn parse(s: &str) -> Result<Self, TargetError> {
        let t = match s {
            "linux/amd64" => Target::new(Os::Linux, Arch::Amd64),
            "linux/386" => Target::new(Os::Linux, Arch::I386),
            "linux/arm64" => Target::new(Os::Linux, Arch::Arm64),
            "windows/amd64" => Target::new(Os::Windows, Arch::Amd64),
            "windows/arm64" => Target::new(Os::Windows, Arch::Arm64),
            "darwin/arm64" => Target::new(Os::Darwin, Arch::Arm64),
            "wasi/wasm32" => Target::new(Os::Wasi, Arch::Wasm32),
            other => return Err(TargetError::Unsupported(other.to_string())),
        };
        Ok(t)
    }

    /// Machine word size in bytes. WebAssembly is a 32-bit target: every
    /// "word" in the runtime header layouts is 4 bytes there.
    pub fn word_size(&self) -> i64 {
        match self.arch {
            Arch::Amd64 | Arch::Arm64 => 8,
            Arch::I386 | Arch::Wasm32 => 4,
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == Os::Windows
    }

    pub fn triple(&self) -> String {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Windows => "windows",
            Os::Darwin => "darwin",
            Os::Wasi => "wasi",
        };
        let arch = match self.arch {
            Arch::Amd64 => "amd64",
            Arch::I386 => "386",
            Arch::Arm64 => "arm64",
            Arch::Wasm32 => "wasm32",
        };
        format!("{}/{}", os, arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_targets() {
        for triple in [
            "linux/amd64",
            "linux/386",
            "linux/arm64",
            "windows/amd64",
            "windows/arm64",
            "darwin/arm64",
            "wasi/wasm32",
        ] {
            let t = Target::parse(triple).unwrap();
            assert_eq!(t.triple(), triple.replace("386", "386"));
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(Target::parse("plan9/amd64").is_err());
        assert!(Target::parse("windows/386").is_err());
        assert!(Target::parse("").is_err());
    }

    #[test]
    fn test_word_sizes() {
        assert_eq!(Target::parse("linux/amd64").unwrap().word_size(), 8);
        assert_eq!(Target::parse("linux/386").unwrap().word_size(), 4);
        assert_eq!(Target::parse("darwin/arm64").unwrap().word_size(), 8);
        assert_eq!(Target::parse("wasi/wasm32").unwrap().word_size(), 4);
    }
}
