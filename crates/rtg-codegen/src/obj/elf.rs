//! ELF executable writer (ELF64 and the ELF32 variant for linux/386).
//!
//! One RWX `PT_LOAD` segment covers `.text` (16-byte aligned), `.rodata`
//! and `.data` (8-byte aligned), followed by the non-loaded `.symtab`,
//! `.strtab`, `.shstrtab` and the DWARF2 sections, then the section
//! header table.

use crate::backend::Lowered;
use crate::buf::Buffer;
use crate::error::EmitError;
use crate::fixup::{apply_fixups, Resolver};
use crate::obj::dwarf;
use rustc_hash::FxHashMap;

const BASE_VADDR: u64 = 0x400000;
const EM_X86_64: u16 = 62;
const EM_386: u16 = 3;
const EM_AARCH64: u16 = 183;

/// Machine selector for [`write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    Amd64,
    I386,
    Arm64,
}

impl Machine {
    fn word(self) -> u64 {
        match self {
            Machine::I386 => 4,
            _ => 8,
        }
    }

    fn e_machine(self) -> u16 {
        match self {
            Machine::Amd64 => EM_X86_64,
            Machine::I386 => EM_386,
            Machine::Arm64 => EM_AARCH64,
        }
    }
}

fn align_up(v: usize, a: usize) -> usize {
    (v + a - 1) & !(a - 1)
}

/// Lay out and write the final executable.
pub fn write(mut lowered: Lowered, machine: Machine) -> Result<Vec<u8>, EmitError> {
    let word = machine.word() as usize;
    let elf64 = machine != Machine::I386;
    let (ehdr_size, phdr_size, shdr_size, sym_size) = if elf64 {
        (64usize, 56usize, 64usize, 24usize)
    } else {
        (52, 32, 40, 16)
    };

    // Layout: headers, text, rodata, data — one loaded segment.
    let text_off = align_up(ehdr_size + phdr_size, 16);
    let rodata_off = align_up(text_off + lowered.text.len(), 8);
    let rodata_size = lowered.rodata.size(word);
    let data_off = align_up(rodata_off + rodata_size, 8);
    let data_size = lowered.global_count * word;
    let load_end = data_off + data_size;

    let text_vaddr = BASE_VADDR + text_off as u64;
    let rodata_vaddr = BASE_VADDR + rodata_off as u64;
    let data_vaddr = BASE_VADDR + data_off as u64;
    let header_vaddr = rodata_vaddr + lowered.rodata.headers_offset(word) as u64;

    let resolver = Resolver {
        funcs: &lowered.funcs,
        text_vaddr,
        header_vaddr,
        header_size: 2 * word as u64,
        data_vaddr,
        word: word as u64,
        iat: FxHashMap::default(),
        got: Vec::new(),
    };
    apply_fixups(&mut lowered.text, &lowered.fixups, &resolver)?;

    // Non-loaded metadata: symbol table, string tables, debug info.
    let mut strtab = Buffer::new();
    strtab.put_u8(0);
    let mut symtab = Buffer::new();
    // Null symbol.
    for _ in 0..sym_size {
        symtab.put_u8(0);
    }
    for (name, size) in &lowered.sizes {
        let offset = lowered.funcs[name];
        let name_off = strtab.len() as u32;
        strtab.put_bytes(name.as_bytes());
        strtab.put_u8(0);
        if elf64 {
            symtab.put_u32(name_off);
            symtab.put_u8(0x12); // GLOBAL | FUNC
            symtab.put_u8(0);
            symtab.put_u16(1); // .text
            symtab.put_u64(text_vaddr + offset as u64);
            symtab.put_u64(*size as u64);
        } else {
            symtab.put_u32(name_off);
            symtab.put_u32((text_vaddr + offset as u64) as u32);
            symtab.put_u32(*size as u32);
            symtab.put_u8(0x12);
            symtab.put_u8(0);
            symtab.put_u16(1);
        }
    }

    let func_offsets: Vec<usize> = lowered.sizes.iter().map(|(n, _)| lowered.funcs[n]).collect();
    let (debug_abbrev, debug_info) = dwarf::debug_sections(&lowered.sizes, text_vaddr, &func_offsets);

    let shstrtab_names = [
        "", ".text", ".rodata", ".data", ".symtab", ".strtab", ".shstrtab", ".debug_abbrev",
        ".debug_info",
    ];
    let mut shstrtab = Buffer::new();
    let mut name_offsets = Vec::new();
    for name in shstrtab_names {
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.put_bytes(name.as_bytes());
        shstrtab.put_u8(0);
    }

    let symtab_off = align_up(load_end, 8);
    let strtab_off = symtab_off + symtab.len();
    let shstrtab_off = strtab_off + strtab.len();
    let abbrev_off = shstrtab_off + shstrtab.len();
    let info_off = abbrev_off + debug_abbrev.len();
    let shoff = align_up(info_off + debug_info.len(), 8);

    let mut out = Buffer::with_capacity(shoff + 9 * shdr_size);

    // ELF header.
    out.put_bytes(&[0x7f, b'E', b'L', b'F']);
    out.put_u8(if elf64 { 2 } else { 1 });
    out.put_u8(1); // little-endian
    out.put_u8(1); // version
    out.put_bytes(&[0; 9]);
    out.put_u16(2); // ET_EXEC
    out.put_u16(machine.e_machine());
    out.put_u32(1);
    let entry = text_vaddr + lowered.entry as u64;
    if elf64 {
        out.put_u64(entry);
        out.put_u64(ehdr_size as u64); // phoff
        out.put_u64(shoff as u64);
        out.put_u32(0); // flags
        out.put_u16(ehdr_size as u16);
        out.put_u16(phdr_size as u16);
        out.put_u16(1); // phnum
        out.put_u16(shdr_size as u16);
        out.put_u16(9); // shnum
        out.put_u16(6); // shstrndx
    } else {
        out.put_u32(entry as u32);
        out.put_u32(ehdr_size as u32);
        out.put_u32(shoff as u32);
        out.put_u32(0);
        out.put_u16(ehdr_size as u16);
        out.put_u16(phdr_size as u16);
        out.put_u16(1);
        out.put_u16(shdr_size as u16);
        out.put_u16(9);
        out.put_u16(6);
    }

    // Program header: one RWX load of the whole front of the file.
    if elf64 {
        out.put_u32(1); // PT_LOAD
        out.put_u32(7); // RWX
        out.put_u64(0);
        out.put_u64(BASE_VADDR);
        out.put_u64(BASE_VADDR);
        out.put_u64(load_end as u64);
        out.put_u64(load_end as u64);
        out.put_u64(0x1000);
    } else {
        out.put_u32(1);
        out.put_u32(0);
        out.put_u32(BASE_VADDR as u32);
        out.put_u32(BASE_VADDR as u32);
        out.put_u32(load_end as u32);
        out.put_u32(load_end as u32);
        out.put_u32(7);
        out.put_u32(0x1000);
    }

    out.align_to(16);
    debug_assert_eq!(out.len(), text_off);
    out.put_bytes(&lowered.text);
    out.align_to(8);
    out.put_bytes(&lowered.rodata.serialize(rodata_vaddr, word));
    out.align_to(8);
    for _ in 0..data_size {
        out.put_u8(0);
    }
    out.align_to(8);
    out.put_bytes(symtab.as_slice());
    out.put_bytes(strtab.as_slice());
    out.put_bytes(shstrtab.as_slice());
    out.put_bytes(&debug_abbrev);
    out.put_bytes(&debug_info);
    out.align_to(8);

    // Section headers.
    let mut shdr = |out: &mut Buffer,
                    name: u32,
                    ty: u32,
                    flags: u64,
                    addr: u64,
                    offset: usize,
                    size: usize,
                    link: u32,
                    info: u32,
                    align: u64,
                    entsize: u64| {
        if elf64 {
            out.put_u32(name);
            out.put_u32(ty);
            out.put_u64(flags);
            out.put_u64(addr);
            out.put_u64(offset as u64);
            out.put_u64(size as u64);
            out.put_u32(link);
            out.put_u32(info);
            out.put_u64(align);
            out.put_u64(entsize);
        } else {
            out.put_u32(name);
            out.put_u32(ty);
            out.put_u32(flags as u32);
            out.put_u32(addr as u32);
            out.put_u32(offset as u32);
            out.put_u32(size as u32);
            out.put_u32(link);
            out.put_u32(info);
            out.put_u32(align as u32);
            out.put_u32(entsize as u32);
        }
    };

    shdr(&mut out, name_offsets[0], 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(
        &mut out,
        name_offsets[1],
        1, // PROGBITS
        0x6, // ALLOC | EXECINSTR
        text_vaddr,
        text_off,
        lowered.text.len(),
        0,
        0,
        16,
        0,
    );
    shdr(
        &mut out,
        name_offsets[2],
        1,
        0x2, // ALLOC
        rodata_vaddr,
        rodata_off,
        rodata_size,
        0,
        0,
        8,
        0,
    );
    shdr(
        &mut out,
        name_offsets[3],
        1,
        0x3, // WRITE | ALLOC
        data_vaddr,
        data_off,
        data_size,
        0,
        0,
        8,
        0,
    );
    shdr(
        &mut out,
        name_offsets[4],
        2, // SYMTAB
        0,
        0,
        symtab_off,
        symtab.len(),
        5,              // .strtab
        1,              // first global symbol
        8,
        sym_size as u64,
    );
    shdr(&mut out, name_offsets[5], 3, 0, 0, strtab_off, strtab.len(), 0, 0, 1, 0);
    shdr(
        &mut out,
        name_offsets[6],
        3,
        0,
        0,
        shstrtab_off,
        shstrtab.len(),
        0,
        0,
        1,
        0,
    );
    shdr(
        &mut out,
        name_offsets[7],
        1,
        0,
        0,
        abbrev_off,
        debug_abbrev.len(),
        0,
        0,
        1,
        0,
    );
    shdr(
        &mut out,
        name_offsets[8],
        1,
        0,
        0,
        info_off,
        debug_info.len(),
        0,
        0,
        1,
        0,
    );

    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::amd64;
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
        amd64::lower(&m, false).unwrap()
    }

    #[test]
    fn test_elf_magic_and_machine() {
        let bytes = write(lowered(), Machine::Amd64).unwrap();
        assert_eq!(&bytes[..4], &[0x7f, b'E', b'L', b'F']);
        assert_eq!(bytes[4], 2); // ELFCLASS64
        assert_eq!(bytes[5], 1); // little-endian
        let machine = u16::from_le_bytes(bytes[18..20].try_into().unwrap());
        assert_eq!(machine, 62);
    }

    #[test]
    fn test_entry_points_into_text() {
        let bytes = write(lowered(), Machine::Amd64).unwrap();
        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        assert!(entry >= BASE_VADDR);
        assert!(entry < BASE_VADDR + bytes.len() as u64);
    }

    #[test]
    fn test_single_rwx_load_segment() {
        let bytes = write(lowered(), Machine::Amd64).unwrap();
        let phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
        let p_type = u32::from_le_bytes(bytes[phoff..phoff + 4].try_into().unwrap());
        let p_flags = u32::from_le_bytes(bytes[phoff + 4..phoff + 8].try_into().unwrap());
        assert_eq!(p_type, 1);
        assert_eq!(p_flags, 7);
    }

    #[test]
    fn test_symtab_contains_main() {
        let bytes = write(lowered(), Machine::Amd64).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("main.main"));
        assert!(text.contains(".debug_info"));
    }
}
