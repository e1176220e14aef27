// This module provides the x86-64 glue-instruction encoding for fftjit using the iced-x86 code
// assembler. X64Encoder maps the generator's abstract register roles onto the registers the
// generated routine dedicates to them (ecx for the loop bound and subtransform size, rdx for
// the output cursor, r8 for the twiddle-table cursor) and encodes the handful of instructions
// placed between kernel fragments: 32-bit immediate loads, immediate adds, shl/sar by a
// constant, and direct rel32 calls. Each primitive is assembled at the absolute address it
// will occupy, so call displacements are final when the bytes are copied. The prologue and
// epilogue sequences (System V callee-saved pushes, argument moves, table loads) are built
// through the same encoder. NOP_SEQUENCES holds the recommended multi-byte NOP forms used to
// pad up to instruction-fetch boundaries.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;

use crate::core::backend::RegRole;
use crate::core::error::EncodingError;

/// Longest encoding of a single x86-64 instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Recommended NOP encodings, indexed by length - 1.
pub const NOP_SEQUENCES: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Fill `out` with `len` bytes of NOPs, longest forms first.
pub fn nop_padding(len: usize, out: &mut Vec<u8>) {
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(NOP_SEQUENCES.len());
        out.extend_from_slice(NOP_SEQUENCES[chunk - 1]);
        remaining -= chunk;
    }
}

/// x86-64 instruction encoder using iced-x86.
///
/// Instructions accumulate until [`X64Encoder::finalize`] assembles them at
/// a given address.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(Self { assembler })
    }

    /// 32-bit register playing `role`.
    fn to_gp32_register(role: RegRole) -> AsmRegister32 {
        match role {
            RegRole::LoopCounter | RegRole::Size => ecx,
            RegRole::Output => edx,
            RegRole::Lut => r8d,
        }
    }

    /// 64-bit register playing `role`.
    fn to_gp64_register(role: RegRole) -> AsmRegister64 {
        match role {
            RegRole::LoopCounter | RegRole::Size => rcx,
            RegRole::Output => rdx,
            RegRole::Lut => r8,
        }
    }

    /// Whether `role` holds a pointer rather than a count.
    fn is_pointer(role: RegRole) -> bool {
        matches!(role, RegRole::Output | RegRole::Lut)
    }

    /// Emit MOV instruction - 32-bit immediate to register, zero-extending.
    pub fn mov_imm(&mut self, role: RegRole, value: u32) -> Result<(), EncodingError> {
        let dst = Self::to_gp32_register(role);

        self.assembler
            .mov(dst, value)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit ADD instruction - immediate to register.
    pub fn add_imm(&mut self, role: RegRole, delta: i32) -> Result<(), EncodingError> {
        let result = if Self::is_pointer(role) {
            self.assembler.add(Self::to_gp64_register(role), delta)
        } else {
            self.assembler.add(Self::to_gp32_register(role), delta)
        };

        result.map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit SHL for positive amounts and SAR for negative ones.
    pub fn shift(&mut self, role: RegRole, amount: i32) -> Result<(), EncodingError> {
        if amount == 0 || amount.unsigned_abs() > 31 {
            return Err(EncodingError::ImmediateOutOfRange {
                operation: "shift",
                value: amount as i64,
            });
        }

        let dst = Self::to_gp32_register(role);
        let result = if amount > 0 {
            self.assembler.shl(dst, amount)
        } else {
            self.assembler.sar(dst, -amount)
        };

        result.map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit direct CALL instruction (relative offset).
    pub fn call_direct(&mut self, target: u64) -> Result<(), EncodingError> {
        self.assembler
            .call(target)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit PUSH instruction.
    pub fn push_reg(&mut self, reg: AsmRegister64) -> Result<(), EncodingError> {
        self.assembler
            .push(reg)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit POP instruction.
    pub fn pop_reg(&mut self, reg: AsmRegister64) -> Result<(), EncodingError> {
        self.assembler
            .pop(reg)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit MOV instruction - register to register.
    pub fn mov_reg_reg(&mut self, dst: AsmRegister64, src: AsmRegister64) -> Result<(), EncodingError> {
        self.assembler
            .mov(dst, src)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit MOV instruction - memory to register.
    pub fn mov_reg_mem(&mut self, dst: AsmRegister64, base: AsmRegister64, offset: i32) -> Result<(), EncodingError> {
        let mem = qword_ptr(base + offset);
        self.assembler
            .mov(dst, mem)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit MOVAPS instruction - aligned 128-bit load.
    pub fn movaps_load(&mut self, dst: AsmRegisterXmm, base: AsmRegister64, offset: i32) -> Result<(), EncodingError> {
        let mem = xmmword_ptr(base + offset);
        self.assembler
            .movaps(dst, mem)
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Emit RET instruction.
    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler
            .ret()
            .map_err(|e| EncodingError::Assembly(e.to_string()))?;
        Ok(())
    }

    /// Number of instructions queued since the last finalize.
    pub fn pending(&self) -> usize {
        self.assembler.instructions().len()
    }

    /// Assemble the queued instructions as if placed at `ip` and clear the
    /// queue.
    pub fn finalize(&mut self, ip: u64) -> Result<Vec<u8>, EncodingError> {
        let result = self
            .assembler
            .assemble(ip)
            .map_err(|e| EncodingError::Assembly(e.to_string()));
        self.assembler.reset();
        result
    }
}
