//! WebAssembly module assembly.
//!
//! Sections are built independently and framed as `id, size-LEB128,
//! contents`; every length and index field is minimal-length LEB128.
//! Function bodies carry an outer size, the local-declarations list, the
//! body, and the `end` opcode.

use crate::buf::Buffer;

/// Value type encodings.
pub const I32: u8 = 0x7f;
pub const I64: u8 = 0x7e;

/// Control opcodes.
pub mod op {
    pub const UNREACHABLE: u8 = 0x00;
    pub const NOP: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const LOOP: u8 = 0x03;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0b;
    pub const BR: u8 = 0x0c;
    pub const BR_IF: u8 = 0x0d;
    pub const RETURN: u8 = 0x0f;
    pub const CALL: u8 = 0x10;
    pub const DROP: u8 = 0x1a;
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const LOCAL_TEE: u8 = 0x22;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;
    pub const I32_LOAD: u8 = 0x28;
    pub const I32_LOAD8_U: u8 = 0x2d;
    pub const I32_LOAD16_U: u8 = 0x2f;
    pub const I32_STORE: u8 = 0x36;
    pub const I32_STORE8: u8 = 0x3a;
    pub const I32_STORE16: u8 = 0x3b;
    pub const MEMORY_SIZE: u8 = 0x3f;
    pub const MEMORY_GROW: u8 = 0x40;
    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const I32_EQZ: u8 = 0x45;
    pub const I32_EQ: u8 = 0x46;
    pub const I32_NE: u8 = 0x47;
    pub const I32_LT_S: u8 = 0x48;
    pub const I32_GT_S: u8 = 0x4a;
    pub const I32_LE_S: u8 = 0x4c;
    pub const I32_GE_S: u8 = 0x4e;
    pub const I32_ADD: u8 = 0x6a;
    pub const I32_SUB: u8 = 0x6b;
    pub const I32_MUL: u8 = 0x6c;
    pub const I32_DIV_S: u8 = 0x6d;
    pub const I32_REM_S: u8 = 0x6f;
    pub const I32_AND: u8 = 0x71;
    pub const I32_OR: u8 = 0x72;
    pub const I32_XOR: u8 = 0x73;
    pub const I32_SHL: u8 = 0x74;
    pub const I32_SHR_U: u8 = 0x76;
    /// Block type byte for "no result".
    pub const BLOCKTYPE_EMPTY: u8 = 0x40;
}

/// One function type (params, results).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<u8>,
    pub results: Vec<u8>,
}

/// Assembles the type, import, function, memory, global, export, code,
/// and data sections of one module.
#[derive(Debug, Default)]
pub struct WasmModule {
    types: Vec<FuncType>,
    /// (module, name, type index)
    imports: Vec<(String, String, u32)>,
    /// Type index per defined function, in index order.
    funcs: Vec<u32>,
    /// Minimum memory pages.
    memory_pages: u32,
    /// (mutable, initial value)
    globals: Vec<(bool, i64)>,
    /// (name, export kind, index) — kind 0 func, 2 memory, 3 global
    exports: Vec<(String, u8, u32)>,
    /// Finished bodies (locals declarations + code + end), one per
    /// defined function.
    bodies: Vec<Vec<u8>>,
    /// (offset, bytes)
    data: Vec<(u32, Vec<u8>)>,
}

impl WasmModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a function type, returning its index.
    pub fn func_type(&mut self, params: Vec<u8>, results: Vec<u8>) -> u32 {
        let ty = FuncType { params, results };
        if let Some(pos) = self.types.iter().position(|t| *t == ty) {
            return pos as u32;
        }
        self.types.push(ty);
        self.types.len() as u32 - 1
    }

    /// Import a function; all imports precede defined functions in the
    /// index space, so every import must be registered before bodies are
    /// emitted.
    pub fn import_func(&mut self, module: &str, name: &str, type_idx: u32) -> u32 {
        self.imports
            .push((module.to_string(), name.to_string(), type_idx));
        self.imports.len() as u32 - 1
    }

    pub fn import_count(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Declare a defined function, returning its index.
    pub fn declare_func(&mut self, type_idx: u32) -> u32 {
        self.funcs.push(type_idx);
        self.imports.len() as u32 + self.funcs.len() as u32 - 1
    }

    pub fn set_memory(&mut self, pages: u32) {
        self.memory_pages = pages;
    }

    pub fn add_global(&mut self, mutable: bool, init: i64) -> u32 {
        self.globals.push((mutable, init));
        self.globals.len() as u32 - 1
    }

    pub fn export_func(&mut self, name: &str, idx: u32) {
        self.exports.push((name.to_string(), 0, idx));
    }

    pub fn export_memory(&mut self, name: &str) {
        self.exports.push((name.to_string(), 2, 0));
    }

    pub fn export_global(&mut self, name: &str, idx: u32) {
        self.exports.push((name.to_string(), 3, idx));
    }

    /// Attach a finished body for the next declared function. `locals` is
    /// the count of extra i32 locals beyond the parameters.
    pub fn add_body(&mut self, locals: u32, code: &[u8]) {
        let mut inner = Buffer::new();
        if locals == 0 {
            inner.put_uleb(0);
        } else {
            inner.put_uleb(1);
            inner.put_uleb(locals as u64);
            inner.put_u8(I32);
        }
        inner.put_bytes(code);
        inner.put_u8(op::END);

        let mut body = Buffer::new();
        body.put_uleb(inner.len() as u64);
        body.put_bytes(inner.as_slice());
        self.bodies.push(body.into_bytes());
    }

    pub fn add_data(&mut self, offset: u32, bytes: Vec<u8>) {
        self.data.push((offset, bytes));
    }

    fn section(out: &mut Buffer, id: u8, content: &Buffer) {
        out.put_u8(id);
        out.put_uleb(content.len() as u64);
        out.put_bytes(content.as_slice());
    }

    /// Produce the final module bytes.
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Buffer::new();
        out.put_bytes(b"\0asm");
        out.put_u32(1);

        // type section
        let mut sec = Buffer::new();
        sec.put_uleb(self.types.len() as u64);
        for t in &self.types {
            sec.put_u8(0x60);
            sec.put_uleb(t.params.len() as u64);
            for p in &t.params {
                sec.put_u8(*p);
            }
            sec.put_uleb(t.results.len() as u64);
            for r in &t.results {
                sec.put_u8(*r);
            }
        }
        Self::section(&mut out, 1, &sec);

        if !self.imports.is_empty() {
            let mut sec = Buffer::new();
            sec.put_uleb(self.imports.len() as u64);
            for (module, name, ty) in &self.imports {
                sec.put_uleb(module.len() as u64);
                sec.put_bytes(module.as_bytes());
                sec.put_uleb(name.len() as u64);
                sec.put_bytes(name.as_bytes());
                sec.put_u8(0); // func
                sec.put_uleb(*ty as u64);
            }
            Self::section(&mut out, 2, &sec);
        }

        let mut sec = Buffer::new();
        sec.put_uleb(self.funcs.len() as u64);
        for ty in &self.funcs {
            sec.put_uleb(*ty as u64);
        }
        Self::section(&mut out, 3, &sec);

        // memory section
        let mut sec = Buffer::new();
        sec.put_uleb(1);
        sec.put_u8(0); // min only
        sec.put_uleb(self.memory_pages as u64);
        Self::section(&mut out, 5, &sec);

        if !self.globals.is_empty() {
            let mut sec = Buffer::new();
            sec.put_uleb(self.globals.len() as u64);
            for &(mutable, init) in &self.globals {
                sec.put_u8(I32);
                sec.put_u8(mutable as u8);
                sec.put_u8(op::I32_CONST);
                sec.put_sleb(init);
                sec.put_u8(op::END);
            }
            Self::section(&mut out, 6, &sec);
        }

        if !self.exports.is_empty() {
            let mut sec = Buffer::new();
            sec.put_uleb(self.exports.len() as u64);
            for (name, kind, idx) in &self.exports {
                sec.put_uleb(name.len() as u64);
                sec.put_bytes(name.as_bytes());
                sec.put_u8(*kind);
                sec.put_uleb(*idx as u64);
            }
            Self::section(&mut out, 7, &sec);
        }

        let mut sec = Buffer::new();
        sec.put_uleb(self.bodies.len() as u64);
        for body in &self.bodies {
            sec.put_bytes(body);
        }
        Self::section(&mut out, 10, &sec);

        if !self.data.is_empty() {
            let mut sec = Buffer::new();
            sec.put_uleb(self.data.len() as u64);
            for (offset, bytes) in &self.data {
                sec.put_uleb(0); // active, memory 0
                sec.put_u8(op::I32_CONST);
                sec.put_sleb(*offset as i64);
                sec.put_u8(op::END);
                sec.put_uleb(bytes.len() as u64);
                sec.put_bytes(bytes);
            }
            Self::section(&mut out, 11, &sec);
        }

        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_and_version() {
        let m = WasmModule::new();
        let bytes = m.emit();
        assert_eq!(&bytes[..8], b"\0asm\x01\0\0\0");
    }

    #[test]
    fn test_type_dedup() {
        let mut m = WasmModule::new();
        let a = m.func_type(vec![I32], vec![I32]);
        let b = m.func_type(vec![I32], vec![I32]);
        let c = m.func_type(vec![], vec![]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_import_indices_precede_funcs() {
        let mut m = WasmModule::new();
        let ty = m.func_type(vec![], vec![]);
        let imp = m.import_func("wasi_snapshot_preview1", "proc_exit", ty);
        let f = m.declare_func(ty);
        assert_eq!(imp, 0);
        assert_eq!(f, 1);
    }

    #[test]
    fn test_body_framing() {
        let mut m = WasmModule::new();
        let ty = m.func_type(vec![], vec![]);
        m.declare_func(ty);
        m.add_body(0, &[op::NOP]);
        m.set_memory(1);
        let bytes = m.emit();
        // section 10 holds one body: count=1, size=3, locals=0, nop, end
        let tail = &bytes[bytes.len() - 7..];
        assert_eq!(tail, &[0x0a, 5, 1, 3, 0, 0x01, 0x0b]);
    }

    #[test]
    fn test_body_end_opcode_present() {
        let mut m = WasmModule::new();
        let ty = m.func_type(vec![], vec![]);
        m.declare_func(ty);
        m.add_body(2, &[op::NOP]);
        m.set_memory(1);
        let bytes = m.emit();
        assert_eq!(*bytes.last().unwrap(), op::END);
    }
}
