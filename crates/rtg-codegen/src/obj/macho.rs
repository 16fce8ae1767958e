//! Mach-O executable writer (darwin/arm64).
//!
//! Three segments: `__PAGEZERO`, one RWX mapping carrying the text,
//! string, GOT, and data sections, and `__LINKEDIT` with the symbol
//! tables and the embedded ad-hoc code signature. libSystem imports bind
//! through `__got` non-lazy pointers and the indirect symbol table; the
//! entry point is an `LC_UNIXTHREAD` register state.
//!
//! The code signature is an `EMBEDDED_SIGNATURE` super-blob holding a
//! SHA-256 `CODEDIRECTORY` (one 32-byte slot per 4096-byte page of the
//! image up to the signature), an empty `REQUIREMENTS` blob, and an empty
//! certificate wrapper. Code-signature blob fields are big-endian; the
//! rest of the file is little-endian.

use crate::backend::Lowered;
use crate::buf::Buffer;
use crate::error::EmitError;
use crate::fixup::{apply_fixups, Resolver};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

const BASE_VADDR: u64 = 0x1_0000_0000;
const PAGE: usize = 0x4000;
const CS_PAGE: usize = 4096;

const MH_MAGIC_64: u32 = 0xfeed_facf;
const CPU_ARM64: u32 = 0x0100_000c;
const MH_EXECUTE: u32 = 2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_UNIXTHREAD: u32 = 0x5;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_CODE_SIGNATURE: u32 = 0x1d;

const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade_0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade_0c02;
const CSMAGIC_REQUIREMENTS: u32 = 0xfade_0c01;
const CSMAGIC_BLOBWRAPPER: u32 = 0xfade_0b01;

fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

struct BeBuffer(Vec<u8>);

impl BeBuffer {
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
}

/// Build the embedded signature over `image[..code_limit]`.
fn build_signature(image: &[u8], code_limit: usize) -> Vec<u8> {
    let ident = b"rtg.out\0";
    let nslots = code_limit.div_ceil(CS_PAGE);
    let cd_header = 88usize;
    let cd_len = cd_header + ident.len() + nslots * 32;
    let req_len = 12usize;
    let wrapper_len = 8usize;
    let index_len = 12 + 3 * 8;
    let total = index_len + cd_len + req_len + wrapper_len;

    let mut b = BeBuffer(Vec::with_capacity(total));
    b.u32(CSMAGIC_EMBEDDED_SIGNATURE);
    b.u32(total as u32);
    b.u32(3);
    // (slot type, offset) index
    b.u32(0); // CSSLOT_CODEDIRECTORY
    b.u32(index_len as u32);
    b.u32(2); // CSSLOT_REQUIREMENTS
    b.u32((index_len + cd_len) as u32);
    b.u32(0x10000); // CSSLOT_SIGNATURESLOT
    b.u32((index_len + cd_len + req_len) as u32);

    // CodeDirectory.
    b.u32(CSMAGIC_CODEDIRECTORY);
    b.u32(cd_len as u32);
    b.u32(0x20400); // version
    b.u32(0x2); // CS_ADHOC
    b.u32((cd_header + ident.len()) as u32); // hashOffset
    b.u32(cd_header as u32); // identOffset
    b.u32(0); // nSpecialSlots
    b.u32(nslots as u32);
    b.u32(code_limit as u32);
    b.u8(32); // hashSize
    b.u8(2); // SHA-256
    b.u8(0); // platform
    b.u8(12); // log2(4096)
    b.u32(0); // spare2
    b.u32(0); // scatterOffset
    b.u32(0); // teamOffset
    b.u32(0); // spare3
    b.u64(code_limit as u64); // codeLimit64
    b.u64(0); // execSegBase
    b.u64(0); // execSegLimit
    b.u64(0); // execSegFlags
    b.0.extend_from_slice(ident);
    for page in 0..nslots {
        let start = page * CS_PAGE;
        let end = (start + CS_PAGE).min(code_limit);
        let digest = Sha256::digest(&image[start..end]);
        b.0.extend_from_slice(&digest);
    }

    // Empty requirements set.
    b.u32(CSMAGIC_REQUIREMENTS);
    b.u32(req_len as u32);
    b.u32(0);
    // Empty certificate wrapper.
    b.u32(CSMAGIC_BLOBWRAPPER);
    b.u32(wrapper_len as u32);

    b.0
}

pub fn write(mut lowered: Lowered) -> Result<Vec<u8>, EmitError> {
    let word = 8usize;
    let nfuncs = lowered.sizes.len();
    let nimports = lowered.imports.len();

    // Load command sizes.
    let seg_cmd = |nsects: usize| 72 + nsects * 80;
    let dylinker_str = b"/usr/lib/dyld\0\0\0";
    let dylib_str = b"/usr/lib/libSystem.B.dylib\0\0\0\0\0\0";
    let sizeofcmds = seg_cmd(0)            // __PAGEZERO
        + seg_cmd(4)                       // text/const/got/data
        + seg_cmd(0)                       // __LINKEDIT
        + (12 + dylinker_str.len())
        + (24 + dylib_str.len())
        + 24                               // LC_SYMTAB
        + 80                               // LC_DYSYMTAB
        + (16 + 68 * 4)                    // LC_UNIXTHREAD (ARM_THREAD_STATE64)
        + 16; // LC_CODE_SIGNATURE
    let header_end = 32 + sizeofcmds;

    // File layout.
    let text_off = align_up(header_end, 16);
    let const_off = align_up(text_off + lowered.text.len(), 8);
    let const_size = lowered.rodata.size(word);
    let got_off = align_up(const_off + const_size, 8);
    let got_size = nimports * 8;
    let data_off = got_off + got_size;
    let data_size = lowered.global_count * word;
    let seg_end = align_up(data_off + data_size, 8);

    let linkedit_off = align_up(seg_end, 8);
    let symoff = linkedit_off;
    let nsyms = nfuncs + nimports;
    let indirectoff = symoff + nsyms * 16;
    let stroff = indirectoff + nimports * 4;

    let mut strtab = Buffer::new();
    strtab.put_u8(0);
    let mut sym_strx: Vec<u32> = Vec::new();
    for (name, _) in &lowered.sizes {
        sym_strx.push(strtab.len() as u32);
        strtab.put_bytes(name.as_bytes());
        strtab.put_u8(0);
    }
    for name in &lowered.imports {
        sym_strx.push(strtab.len() as u32);
        strtab.put_bytes(name.as_bytes());
        strtab.put_u8(0);
    }
    let cs_off = align_up(stroff + strtab.len(), 16);

    let text_vaddr = BASE_VADDR + text_off as u64;
    let got_vaddr = BASE_VADDR + got_off as u64;
    let resolver = Resolver {
        funcs: &lowered.funcs,
        text_vaddr,
        header_vaddr: BASE_VADDR
            + const_off as u64
            + lowered.rodata.headers_offset(word) as u64,
        header_size: 16,
        data_vaddr: BASE_VADDR + data_off as u64,
        word: 8,
        iat: FxHashMap::default(),
        got: (0..nimports).map(|i| got_vaddr + i as u64 * 8).collect(),
    };
    apply_fixups(&mut lowered.text, &lowered.fixups, &resolver)?;

    let mut out = Buffer::with_capacity(cs_off + 4096);

    // Header.
    out.put_u32(MH_MAGIC_64);
    out.put_u32(CPU_ARM64);
    out.put_u32(0);
    out.put_u32(MH_EXECUTE);
    out.put_u32(9); // ncmds
    out.put_u32(sizeofcmds as u32);
    out.put_u32(0x0000_0084); // MH_DYLDLINK | MH_TWOLEVEL
    out.put_u32(0); // reserved

    let mut segment = |out: &mut Buffer,
                       name: &[u8],
                       vmaddr: u64,
                       vmsize: u64,
                       fileoff: usize,
                       filesize: usize,
                       prot: u32,
                       nsects: usize| {
        out.put_u32(LC_SEGMENT_64);
        out.put_u32(seg_cmd(nsects) as u32);
        let mut n = [0u8; 16];
        n[..name.len()].copy_from_slice(name);
        out.put_bytes(&n);
        out.put_u64(vmaddr);
        out.put_u64(vmsize);
        out.put_u64(fileoff as u64);
        out.put_u64(filesize as u64);
        out.put_u32(prot); // maxprot
        out.put_u32(prot); // initprot
        out.put_u32(nsects as u32);
        out.put_u32(0);
    };

    let section = |out: &mut Buffer,
                   sectname: &[u8],
                   segname: &[u8],
                   addr: u64,
                   size: usize,
                   offset: usize,
                   align: u32,
                   flags: u32,
                   reserved1: u32| {
        let mut n = [0u8; 16];
        n[..sectname.len()].copy_from_slice(sectname);
        out.put_bytes(&n);
        let mut s = [0u8; 16];
        s[..segname.len()].copy_from_slice(segname);
        out.put_bytes(&s);
        out.put_u64(addr);
        out.put_u64(size as u64);
        out.put_u32(offset as u32);
        out.put_u32(align);
        out.put_u32(0);
        out.put_u32(0);
        out.put_u32(flags);
        out.put_u32(reserved1);
        out.put_u32(0);
        out.put_u32(0);
    };

    segment(&mut out, b"__PAGEZERO", 0, BASE_VADDR, 0, 0, 0, 0);

    let seg_vmsize = align_up(seg_end, PAGE) as u64;
    segment(
        &mut out,
        b"__TEXT",
        BASE_VADDR,
        seg_vmsize,
        0,
        seg_end,
        7, // rwx, matching the single-mapping model
        4,
    );
    section(
        &mut out,
        b"__text",
        b"__TEXT",
        text_vaddr,
        lowered.text.len(),
        text_off,
        4,
        0x8000_0400, // PURE_INSTRUCTIONS | SOME_INSTRUCTIONS
        0,
    );
    section(
        &mut out,
        b"__const",
        b"__TEXT",
        BASE_VADDR + const_off as u64,
        const_size,
        const_off,
        3,
        0,
        0,
    );
    section(
        &mut out,
        b"__got",
        b"__TEXT",
        got_vaddr,
        got_size,
        got_off,
        3,
        0x6, // S_NON_LAZY_SYMBOL_POINTERS
        0,   // first indirect symbol index
    );
    section(
        &mut out,
        b"__data",
        b"__TEXT",
        BASE_VADDR + data_off as u64,
        data_size,
        data_off,
        3,
        0,
        0,
    );

    let linkedit_vmaddr = BASE_VADDR + seg_vmsize;
    let sig_reserve = 4096 + (cs_off / CS_PAGE) * 32;
    segment(
        &mut out,
        b"__LINKEDIT",
        linkedit_vmaddr,
        align_up(cs_off - linkedit_off + sig_reserve, PAGE) as u64,
        linkedit_off,
        cs_off - linkedit_off + sig_reserve,
        1, // r--
        0,
    );

    out.put_u32(LC_LOAD_DYLINKER);
    out.put_u32((12 + dylinker_str.len()) as u32);
    out.put_u32(12);
    out.put_bytes(dylinker_str);

    out.put_u32(LC_LOAD_DYLIB);
    out.put_u32((24 + dylib_str.len()) as u32);
    out.put_u32(24); // name offset
    out.put_u32(0); // timestamp
    out.put_u32(0x0001_0000); // current version
    out.put_u32(0x0001_0000); // compat version
    out.put_bytes(dylib_str);

    out.put_u32(LC_SYMTAB);
    out.put_u32(24);
    out.put_u32(symoff as u32);
    out.put_u32(nsyms as u32);
    out.put_u32(stroff as u32);
    out.put_u32(strtab.len() as u32);

    out.put_u32(LC_DYSYMTAB);
    out.put_u32(80);
    out.put_u32(0); // ilocalsym
    out.put_u32(0); // nlocalsym
    out.put_u32(0); // iextdefsym
    out.put_u32(nfuncs as u32);
    out.put_u32(nfuncs as u32); // iundefsym
    out.put_u32(nimports as u32);
    out.put_u32(0); // tocoff
    out.put_u32(0);
    out.put_u32(0); // modtaboff
    out.put_u32(0);
    out.put_u32(0); // extrefsymoff
    out.put_u32(0);
    out.put_u32(indirectoff as u32);
    out.put_u32(nimports as u32);
    out.put_u32(0); // extreloff
    out.put_u32(0);
    out.put_u32(0); // locreloff
    out.put_u32(0);

    // LC_UNIXTHREAD: ARM_THREAD_STATE64, pc = entry.
    out.put_u32(LC_UNIXTHREAD);
    out.put_u32((16 + 68 * 4) as u32);
    out.put_u32(6); // ARM_THREAD_STATE64
    out.put_u32(68); // register words
    for _ in 0..29 {
        out.put_u64(0); // x0..x28
    }
    out.put_u64(0); // fp
    out.put_u64(0); // lr
    out.put_u64(0); // sp
    out.put_u64(text_vaddr + lowered.entry as u64); // pc
    out.put_u32(0); // cpsr
    out.put_u32(0); // padding

    out.put_u32(LC_CODE_SIGNATURE);
    out.put_u32(16);
    out.put_u32(cs_off as u32);
    let sig_size_at = out.len();
    out.put_u32(0); // patched once the signature is built

    // Section data.
    out.align_to(16);
    debug_assert_eq!(out.len(), text_off);
    out.put_bytes(&lowered.text);
    out.align_to(8);
    out.put_bytes(
        &lowered
            .rodata
            .serialize(BASE_VADDR + const_off as u64, word),
    );
    out.align_to(8);
    for _ in 0..nimports {
        out.put_u64(0);
    }
    for _ in 0..data_size {
        out.put_u8(0);
    }
    out.align_to(8);

    // __LINKEDIT: symbols, indirect table, strings.
    debug_assert_eq!(out.len(), symoff);
    for (i, (name, _)) in lowered.sizes.iter().enumerate() {
        let offset = lowered.funcs[name];
        out.put_u32(sym_strx[i]);
        out.put_u8(0x0f); // N_SECT | N_EXT
        out.put_u8(1); // __text
        out.put_u16(0);
        out.put_u64(text_vaddr + offset as u64);
    }
    for i in 0..nimports {
        out.put_u32(sym_strx[nfuncs + i]);
        out.put_u8(0x01); // N_UNDF | N_EXT
        out.put_u8(0);
        out.put_u16(0x0100); // library ordinal 1
        out.put_u64(0);
    }
    for i in 0..nimports {
        out.put_u32((nfuncs + i) as u32);
    }
    out.put_bytes(strtab.as_slice());
    out.align_to(16);
    debug_assert_eq!(out.len(), cs_off);

    // The signature size field sits in the load commands, inside the
    // hashed range: patch it before hashing. The blob length is a pure
    // function of cs_off, so it is known up front.
    let fixed_overhead = build_signature(&[], 0).len();
    let nslots = cs_off.div_ceil(CS_PAGE);
    let sig_len = fixed_overhead + nslots * 32;
    out.patch_u32(sig_size_at, sig_len as u32);
    let signature = build_signature(out.as_slice(), cs_off);
    debug_assert_eq!(signature.len(), sig_len);
    out.put_bytes(&signature);

    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::arm64::{self, Flavor};
    use rtg_ir::{Inst, IrFunc, IrModule, Op};

    fn lowered() -> Lowered {
        let mut m = IrModule::new();
        m.add_func(IrFunc {
            name: "main.main".to_string(),
            params: 0,
            returns: 0,
            locals: Vec::new(),
            variadic: None,
            code: vec![Inst::new(Op::Return)],
        });
        arm64::lower(&m, Flavor::Darwin).unwrap()
    }

    #[test]
    fn test_header_magic_and_cpu() {
        let bytes = write(lowered()).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), MH_MAGIC_64);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            CPU_ARM64
        );
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), MH_EXECUTE);
    }

    #[test]
    fn test_signature_superblob_present() {
        let bytes = write(lowered()).unwrap();
        // Find the embedded-signature magic (big-endian) near the end.
        let magic = CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes();
        assert!(bytes.windows(4).any(|w| w == magic));
        let cd = CSMAGIC_CODEDIRECTORY.to_be_bytes();
        assert!(bytes.windows(4).any(|w| w == cd));
    }

    #[test]
    fn test_libsystem_referenced() {
        let bytes = write(lowered()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/usr/lib/libSystem.B.dylib"));
        assert!(text.contains("/usr/lib/dyld"));
        assert!(text.contains("_mmap"));
    }

    #[test]
    fn test_signature_hashes_cover_pages() {
        let image = vec![0xabu8; 10000];
        let sig = build_signature(&image, 10000);
        // 3 pages of 4096 → 3 hash slots.
        let nslots = u32::from_be_bytes(sig[12 + 3 * 8 + 28..12 + 3 * 8 + 32].try_into().unwrap());
        assert_eq!(nslots, 3);
    }
}
