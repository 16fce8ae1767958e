//! Per-target code generators.
//!
//! Every native backend walks the IR with the same skeleton: record the
//! function's text offset, emit a prologue, dispatch per opcode, patch
//! function-local jumps, and leave module-level references as fixups for
//! the object writer to resolve once the image is laid out.

pub mod amd64;
pub mod arm64;
pub mod cgen;
pub mod i386;
pub mod stackifier;
pub mod wasm;

use crate::fixup::Fixup;
use rustc_hash::FxHashMap;

/// Deduplicated string-literal pool.
///
/// The read-only data region holds the raw bytes of every literal first,
/// then one `{data_ptr, len}` header per literal. Code references headers
/// by index through the `$rodata_header$` fixup token.
#[derive(Debug, Default)]
pub struct Rodata {
    data: Vec<u8>,
    literals: Vec<(usize, usize)>,
    index: FxHashMap<String, usize>,
}

impl Rodata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a literal, returning its header index. Identical literals
    /// share one copy of the bytes and one header.
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(s.as_bytes());
        let idx = self.literals.len();
        self.literals.push((offset, s.len()));
        self.index.insert(s.to_string(), idx);
        idx
    }

    pub fn literal_count(&self) -> usize {
        self.literals.len()
    }

    /// `(data offset, length)` of one interned literal.
    pub fn literal_span(&self, idx: usize) -> (usize, usize) {
        self.literals[idx]
    }

    /// Header index of an already-interned literal.
    pub fn lookup(&self, s: &str) -> Option<usize> {
        self.index.get(s).copied()
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Byte offset of the first header inside the serialized region.
    pub fn headers_offset(&self, word: usize) -> usize {
        let mut off = self.data.len();
        while off % word != 0 {
            off += 1;
        }
        off
    }

    /// Total serialized size.
    pub fn size(&self, word: usize) -> usize {
        self.headers_offset(word) + self.literals.len() * 2 * word
    }

    /// Serialize: raw bytes, alignment padding, then the headers with
    /// `data_ptr` fields resolved against `base_vaddr` (the address this
    /// blob will load at).
    pub fn serialize(&self, base_vaddr: u64, word: usize) -> Vec<u8> {
        let headers_at = self.headers_offset(word);
        let mut out = Vec::with_capacity(self.size(word));
        out.extend_from_slice(&self.data);
        out.resize(headers_at, 0);
        for &(offset, len) in &self.literals {
            let ptr = base_vaddr + offset as u64;
            if word == 8 {
                out.extend_from_slice(&ptr.to_le_bytes());
                out.extend_from_slice(&(len as u64).to_le_bytes());
            } else {
                out.extend_from_slice(&(ptr as u32).to_le_bytes());
                out.extend_from_slice(&(len as u32).to_le_bytes());
            }
        }
        out
    }
}

/// One lowered module: relocatable text plus everything the object writer
/// needs to lay out and patch the final image.
#[derive(Debug)]
pub struct Lowered {
    pub text: Vec<u8>,
    pub fixups: Vec<Fixup>,
    /// Function name → text offset.
    pub funcs: FxHashMap<String, usize>,
    /// Per-function byte sizes in emission order.
    pub sizes: Vec<(String, usize)>,
    pub rodata: Rodata,
    pub global_count: usize,
    /// Text offset of the entry point.
    pub entry: usize,
    /// Imported symbols, in IAT/GOT slot order (kernel32 thunk names on
    /// Windows, libSystem symbols on macOS, wasi functions on wasm).
    pub imports: Vec<String>,
}

/// Operand-stack reservation at `_start` (spec range 1–16 MiB).
pub const OPSTACK_SIZE: i64 = 1 << 24;

/// The portable syscall-number catalogue: the runtime passes Linux x86-64
/// numbers, and each backend's shim translates to the native mechanism.
pub mod sys {
    pub const READ: i64 = 0;
    pub const WRITE: i64 = 1;
    pub const OPEN: i64 = 2;
    pub const CLOSE: i64 = 3;
    pub const STAT: i64 = 4;
    pub const MMAP: i64 = 9;
    pub const EXIT: i64 = 60;
    pub const GETCWD: i64 = 79;
    pub const MKDIR: i64 = 83;
    pub const RMDIR: i64 = 84;
    pub const UNLINK: i64 = 87;
    pub const GETDENTS64: i64 = 217;
    /// Windows-only process/pipe/findfile primitives.
    pub const SPAWN: i64 = 1000;
    pub const PIPE: i64 = 1001;
    pub const FINDFILE: i64 = 1002;

    /// The full portable set, in dispatch order.
    pub const CATALOGUE: &[i64] = &[
        READ, WRITE, OPEN, CLOSE, STAT, MMAP, EXIT, GETCWD, MKDIR, RMDIR, UNLINK, GETDENTS64,
    ];
}

/// Names of the root functions called by `_start` before `main.main`, in
/// module order.
pub fn init_call_order(module: &rtg_ir::IrModule) -> Vec<String> {
    let mut order: Vec<String> = module
        .funcs
        .iter()
        .filter(|f| f.name.ends_with(".init$globals") || f.name.ends_with(".init"))
        .map(|f| f.name.clone())
        .collect();
    order.push("main.main".to_string());
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rodata_dedup() {
        let mut r = Rodata::new();
        let a = r.intern("abc");
        let b = r.intern("abc");
        let c = r.intern("def");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(r.literal_count(), 2);
        assert_eq!(r.data_len(), 6);
    }

    #[test]
    fn test_rodata_serialize_headers() {
        let mut r = Rodata::new();
        r.intern("abc");
        let blob = r.serialize(0x1000, 8);
        let headers_at = r.headers_offset(8);
        assert_eq!(headers_at, 8); // 3 bytes padded to word
        let ptr = u64::from_le_bytes(blob[headers_at..headers_at + 8].try_into().unwrap());
        let len = u64::from_le_bytes(blob[headers_at + 8..headers_at + 16].try_into().unwrap());
        assert_eq!(ptr, 0x1000);
        assert_eq!(len, 3);
        assert_eq!(&blob[..3], b"abc");
    }

    #[test]
    fn test_rodata_serialize_32bit() {
        let mut r = Rodata::new();
        r.intern("hi");
        let blob = r.serialize(0x2000, 4);
        let headers_at = r.headers_offset(4);
        assert_eq!(blob.len(), headers_at + 8);
        let ptr = u32::from_le_bytes(blob[headers_at..headers_at + 4].try_into().unwrap());
        assert_eq!(ptr, 0x2000);
    }
}
