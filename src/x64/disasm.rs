//! Disassembly listings of generated routines.

use std::fmt::Write as _;

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};

use crate::core::generator::Routine;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub offset: usize,
    pub bytes: Vec<u8>,
    pub text: String,
}

/// Decode `code` as if it started at `ip`.
pub fn disassemble(code: &[u8], ip: u64) -> Vec<Line> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);

    let mut instruction = Instruction::default();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        let offset = decoder.position();
        decoder.decode_out(&mut instruction);

        let mut text = String::new();
        formatter.format(&instruction, &mut text);
        lines.push(Line {
            offset,
            bytes: code[offset..offset + instruction.len()].to_vec(),
            text,
        });
    }
    lines
}

/// Listing of a routine with a label line before every fragment.
pub fn listing(code: &[u8], routine: &Routine, ip: u64) -> String {
    let mut out = String::new();
    let mut fragments = routine.fragments().iter().peekable();

    for line in disassemble(routine.code(code), ip) {
        while let Some(fragment) = fragments.next_if(|f| f.offset <= line.offset) {
            let _ = writeln!(out, "{}:", fragment.name);
        }

        let hex: String = line.bytes.iter().map(|b| format!("{b:02X}")).collect();
        let _ = writeln!(out, "  {:08X}  {:<24} {}", ip as usize + line.offset, hex, line.text);
    }
    out
}

/// Plain hex dump, sixteen bytes per row.
pub fn hex_dump(code: &[u8], base: usize) -> String {
    let mut out = String::new();
    for (row, chunk) in code.chunks(16).enumerate() {
        let _ = write!(out, "{:08X} ", base + row * 16);
        for byte in chunk {
            let _ = write!(out, " {byte:02X}");
        }
        out.push('\n');
    }
    out
}
