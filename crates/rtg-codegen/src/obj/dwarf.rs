//! Minimal DWARF2 debug information.
//!
//! One compile unit and one `DW_TAG_subprogram` per function carrying
//! name, low_pc, and high_pc. Enough for symbolized backtraces and
//! `addr2line`-style lookups; never loaded at runtime.

use crate::buf::Buffer;

const DW_TAG_COMPILE_UNIT: u64 = 0x11;
const DW_TAG_SUBPROGRAM: u64 = 0x2e;
const DW_AT_NAME: u64 = 0x03;
const DW_AT_LOW_PC: u64 = 0x11;
const DW_AT_HIGH_PC: u64 = 0x12;
const DW_AT_PRODUCER: u64 = 0x25;
const DW_FORM_ADDR: u64 = 0x01;
const DW_FORM_STRING: u64 = 0x08;

/// The two debug sections: `(.debug_abbrev, .debug_info)`.
pub fn debug_sections(funcs: &[(String, usize)], text_vaddr: u64, offsets: &[usize]) -> (Vec<u8>, Vec<u8>) {
    let mut abbrev = Buffer::new();
    // abbrev 1: compile unit with producer
    abbrev.put_uleb(1);
    abbrev.put_uleb(DW_TAG_COMPILE_UNIT);
    abbrev.put_u8(1); // has children
    abbrev.put_uleb(DW_AT_PRODUCER);
    abbrev.put_uleb(DW_FORM_STRING);
    abbrev.put_uleb(0);
    abbrev.put_uleb(0);
    // abbrev 2: subprogram with name/low_pc/high_pc
    abbrev.put_uleb(2);
    abbrev.put_uleb(DW_TAG_SUBPROGRAM);
    abbrev.put_u8(0);
    abbrev.put_uleb(DW_AT_NAME);
    abbrev.put_uleb(DW_FORM_STRING);
    abbrev.put_uleb(DW_AT_LOW_PC);
    abbrev.put_uleb(DW_FORM_ADDR);
    abbrev.put_uleb(DW_AT_HIGH_PC);
    abbrev.put_uleb(DW_FORM_ADDR);
    abbrev.put_uleb(0);
    abbrev.put_uleb(0);
    abbrev.put_uleb(0); // end of abbreviations

    let mut dies = Buffer::new();
    dies.put_uleb(1);
    dies.put_bytes(b"rtg\0");
    for ((name, size), &offset) in funcs.iter().zip(offsets.iter()) {
        dies.put_uleb(2);
        dies.put_bytes(name.as_bytes());
        dies.put_u8(0);
        dies.put_u64(text_vaddr + offset as u64);
        dies.put_u64(text_vaddr + offset as u64 + *size as u64);
    }
    dies.put_uleb(0); // end of children

    // Compile-unit header: length (excluding itself), version 2, abbrev
    // offset, address size.
    let mut info = Buffer::new();
    info.put_u32(dies.len() as u32 + 7);
    info.put_u16(2);
    info.put_u32(0);
    info.put_u8(8);
    info.put_bytes(dies.as_slice());

    (abbrev.into_bytes(), info.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_header_length() {
        let funcs = vec![("main.main".to_string(), 16usize)];
        let offsets = vec![0usize];
        let (_, info) = debug_sections(&funcs, 0x401000, &offsets);
        let len = u32::from_le_bytes(info[..4].try_into().unwrap());
        assert_eq!(len as usize, info.len() - 4);
        assert_eq!(u16::from_le_bytes(info[4..6].try_into().unwrap()), 2);
    }

    #[test]
    fn test_subprogram_carries_name() {
        let funcs = vec![("main.main".to_string(), 16usize)];
        let (_, info) = debug_sections(&funcs, 0x401000, &[0]);
        let text = String::from_utf8_lossy(&info);
        assert!(text.contains("main.main"));
    }
}
