// This module writes generated routines into relocatable ELF objects using the object crate's
// write API. The routine's bytes (base cases, entry, leaf passes, call chain) go into .text as
// one blob; every internal call is rip-relative inside that blob, so no relocations are
// needed. Three global function symbols are defined: the entry under the requested name and
// the two base cases under <name>_x4 and <name>_x8, each sized from the routine's fragment
// layout. The result can be linked into a C or Rust program, or inspected with objdump.

//! ELF object export of generated routines.

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};
use thiserror::Error;

use crate::core::generator::Routine;

/// Error types for object export.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Symbol name must not be empty")]
    EmptySymbol,

    #[error("Code holds {available} bytes, routine needs {required}")]
    CodeTooShort { required: usize, available: usize },

    #[error("Object write failed: {0}")]
    Write(#[from] object::write::Error),
}

/// Build an ELF64 relocatable object holding `routine`.
///
/// `code` is the region the routine was generated into.
pub fn write_elf(code: &[u8], routine: &Routine, symbol: &str) -> Result<Vec<u8>, ExportError> {
    if symbol.is_empty() {
        return Err(ExportError::EmptySymbol);
    }
    if code.len() < routine.code_len {
        return Err(ExportError::CodeTooShort {
            required: routine.code_len,
            available: code.len(),
        });
    }

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let base = obj.append_section_data(text, routine.code(code), 64);

    let fragment_len = |name: &str| routine.fragment(name).map_or(0, |f| f.len);
    let symbols = [
        (
            symbol.to_string(),
            routine.entry_offset,
            routine.code_len - routine.entry_offset,
        ),
        (format!("{symbol}_x4"), routine.x4_offset, fragment_len("x4")),
        (format!("{symbol}_x8"), routine.x8_offset, fragment_len("x8")),
    ];

    for (name, offset, size) in symbols {
        obj.add_symbol(Symbol {
            name: name.into_bytes(),
            value: base + offset as u64,
            size: size as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }

    Ok(obj.write()?)
}
