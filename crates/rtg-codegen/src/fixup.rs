//! Deferred address patching.
//!
//! Everywhere an emitted instruction references an address that is not yet
//! known, the backend records a fixup. After the whole module is laid out,
//! the object writer resolves every symbol to its final virtual address
//! and patches the code buffer.

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Reserved fixup target: a string literal's rodata header.
pub const TOK_RODATA_HEADER: &str = "$rodata_header$";
/// Reserved fixup target: a global's writable-data slot.
pub const TOK_DATA_ADDR: &str = "$data_addr$";
/// Reserved fixup prefix: a Windows kernel32.dll import-table entry.
pub const TOK_IAT_PREFIX: &str = "$iat$";
/// Reserved fixup target: a macOS GOT slot for a libSystem symbol.
pub const TOK_GOT_ADDR: &str = "$got_addr$";

#[derive(Debug, Error)]
pub enum FixupError {
    #[error("unresolved symbol after code generation: {0}")]
    Unresolved(String),
}

/// How the patch is applied at the recorded code offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixKind {
    /// x86 `rel32` in a call/jmp: `target - (site + 4)`.
    CallRel32,
    /// x86 RIP-relative `disp32`: `target - (site + 4)` from the end of
    /// the displacement field.
    RipDisp32,
    /// 32-bit absolute address (i386 `mov r, imm32` and data slots).
    Abs32,
    /// 64-bit absolute address (`movabs` immediates and data slots).
    Abs64,
    /// ARM64 `BL`/`B` imm26.
    A64Branch26,
    /// ARM64 `ADRP` + `ADD` pair at `offset` and `offset + 4`.
    A64AdrpAdd,
    /// ARM64 `ADRP` + 64-bit `LDR` pair at `offset` and `offset + 4`.
    A64AdrpLdr,
}

/// One pending patch.
#[derive(Debug, Clone)]
pub struct Fixup {
    /// Byte offset of the patched field inside the text section.
    pub offset: usize,
    /// Symbol: an IR function name or one of the reserved tokens.
    pub name: String,
    /// Index payload for the table tokens (string-header index, global
    /// index, GOT slot).
    pub addend: i64,
    pub kind: FixKind,
}

/// Resolves symbols to virtual addresses during the patch walk.
pub struct Resolver<'a> {
    /// Function name → text-section offset.
    pub funcs: &'a FxHashMap<String, usize>,
    /// Virtual address of the text section.
    pub text_vaddr: u64,
    /// Virtual address of the first string header.
    pub header_vaddr: u64,
    /// Bytes per string header (2 words).
    pub header_size: u64,
    /// Virtual address of the writable data section.
    pub data_vaddr: u64,
    /// Word size in bytes.
    pub word: u64,
    /// `$iat$Name` → IAT entry virtual address.
    pub iat: FxHashMap<String, u64>,
    /// GOT slot index → virtual address.
    pub got: Vec<u64>,
}

impl<'a> Resolver<'a> {
    pub fn resolve(&self, fix: &Fixup) -> Result<u64, FixupError> {
        if fix.name == TOK_RODATA_HEADER {
            return Ok(self.header_vaddr + fix.addend as u64 * self.header_size);
        }
        if fix.name == TOK_DATA_ADDR {
            return Ok(self.data_vaddr + fix.addend as u64 * self.word);
        }
        if fix.name == TOK_GOT_ADDR {
            return self
                .got
                .get(fix.addend as usize)
                .copied()
                .ok_or_else(|| FixupError::Unresolved(fix.name.clone()));
        }
        if let Some(rest) = fix.name.strip_prefix(TOK_IAT_PREFIX) {
            return self
                .iat
                .get(rest)
                .copied()
                .ok_or_else(|| FixupError::Unresolved(fix.name.clone()));
        }
        self.funcs
            .get(&fix.name)
            .map(|&off| self.text_vaddr + off as u64)
            .ok_or_else(|| FixupError::Unresolved(fix.name.clone()))
    }
}

fn patch_u32(code: &mut [u8], offset: usize, v: u32) {
    code[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_u32(code: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(code[offset..offset + 4].try_into().unwrap())
}

/// Patch every fixup in `code`. `text_vaddr` is the address of byte 0 of
/// `code`.
pub fn apply_fixups(
    code: &mut [u8],
    fixups: &[Fixup],
    resolver: &Resolver<'_>,
) -> Result<(), FixupError> {
    for fix in fixups {
        let target = resolver.resolve(fix)?;
        match fix.kind {
            FixKind::CallRel32 | FixKind::RipDisp32 => {
                let site = resolver.text_vaddr + fix.offset as u64 + 4;
                let disp = target.wrapping_sub(site) as i64 as i32;
                patch_u32(code, fix.offset, disp as u32);
            }
            FixKind::Abs32 => patch_u32(code, fix.offset, target as u32),
            FixKind::Abs64 => {
                code[fix.offset..fix.offset + 8].copy_from_slice(&target.to_le_bytes());
            }
            FixKind::A64Branch26 => {
                let pc = resolver.text_vaddr + fix.offset as u64;
                let delta = (target.wrapping_sub(pc) as i64) >> 2;
                let insn = read_u32(code, fix.offset);
                let patched = (insn & 0xfc00_0000) | ((delta as u32) & 0x03ff_ffff);
                patch_u32(code, fix.offset, patched);
            }
            FixKind::A64AdrpAdd | FixKind::A64AdrpLdr => {
                let pc = resolver.text_vaddr + fix.offset as u64;
                let page_delta = ((target >> 12) as i64) - ((pc >> 12) as i64);
                let adrp = read_u32(code, fix.offset);
                let immlo = (page_delta & 0x3) as u32;
                let immhi = ((page_delta >> 2) & 0x7ffff) as u32;
                let patched = (adrp & 0x9f00_001f) | (immlo << 29) | (immhi << 5);
                patch_u32(code, fix.offset, patched);

                let low = (target & 0xfff) as u32;
                let second = read_u32(code, fix.offset + 4);
                let patched2 = match fix.kind {
                    // ADD Xd, Xn, #imm12
                    FixKind::A64AdrpAdd => (second & 0xffc0_03ff) | (low << 10),
                    // LDR Xt, [Xn, #imm12*8] — the low offset is scaled.
                    _ => (second & 0xffc0_03ff) | (((low >> 3) & 0xfff) << 10),
                };
                patch_u32(code, fix.offset + 4, patched2);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(funcs: &FxHashMap<String, usize>) -> Resolver<'_> {
        Resolver {
            funcs,
            text_vaddr: 0x1000,
            header_vaddr: 0x2000,
            header_size: 16,
            data_vaddr: 0x3000,
            word: 8,
            iat: FxHashMap::default(),
            got: Vec::new(),
        }
    }

    #[test]
    fn test_call_rel32() {
        let mut funcs = FxHashMap::default();
        funcs.insert("main.f".to_string(), 0x100);
        let r = resolver(&funcs);
        // call at text offset 0x10, disp field at 0x11
        let mut code = vec![0u8; 0x20];
        code[0x10] = 0xe8;
        let fix = Fixup {
            offset: 0x11,
            name: "main.f".to_string(),
            addend: 0,
            kind: FixKind::CallRel32,
        };
        apply_fixups(&mut code, &[fix], &r).unwrap();
        let disp = i32::from_le_bytes(code[0x11..0x15].try_into().unwrap());
        // target 0x1100, site end 0x1015
        assert_eq!(disp, 0x1100 - 0x1015);
    }

    #[test]
    fn test_header_token_resolution() {
        let funcs = FxHashMap::default();
        let r = resolver(&funcs);
        let fix = Fixup {
            offset: 0,
            name: TOK_RODATA_HEADER.to_string(),
            addend: 3,
            kind: FixKind::Abs64,
        };
        let mut code = vec![0u8; 8];
        apply_fixups(&mut code, &[fix], &r).unwrap();
        assert_eq!(u64::from_le_bytes(code.try_into().unwrap()), 0x2000 + 48);
    }

    #[test]
    fn test_unresolved_call_is_error() {
        let funcs = FxHashMap::default();
        let r = resolver(&funcs);
        let fix = Fixup {
            offset: 0,
            name: "main.ghost".to_string(),
            addend: 0,
            kind: FixKind::Abs64,
        };
        let mut code = vec![0u8; 8];
        assert!(apply_fixups(&mut code, &[fix], &r).is_err());
    }

    #[test]
    fn test_adrp_add_pair() {
        let mut funcs = FxHashMap::default();
        funcs.insert("main.f".to_string(), 0);
        let mut r = resolver(&funcs);
        r.text_vaddr = 0x10000;
        // adrp x0, 0 ; add x0, x0, #0
        let mut code = Vec::new();
        code.extend_from_slice(&0x9000_0000u32.to_le_bytes());
        code.extend_from_slice(&0x9100_0000u32.to_le_bytes());
        let fix = Fixup {
            offset: 0,
            name: TOK_DATA_ADDR.to_string(),
            addend: 2,
            kind: FixKind::A64AdrpAdd,
        };
        apply_fixups(&mut code, &[fix], &r).unwrap();
        // data at 0x3010: page delta = (0x3 - 0x10) pages, low 12 bits 0x10
        let add = u32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!((add >> 10) & 0xfff, 0x10);
    }
}
