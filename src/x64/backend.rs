//! x86-64 backend.
//!
//! Bridges the generator's [`Backend`] seam with [`X64Encoder`] and the SSE
//! kernel library. Prologue and epilogue bytes are position independent and
//! assembled once at construction; the remaining glue primitives are
//! assembled at the cursor address so relative calls resolve in place.

use std::mem::offset_of;

use iced_x86::code_asm::{r10, r12, r8, r9, rax, rbp, rbx, rdi, rdx, rsi, xmm15};
use log::trace;

use super::encoder::{nop_padding, X64Encoder, MAX_INSTRUCTION_LEN};
use super::kernels;
use crate::core::backend::{Backend, RegRole};
use crate::core::code_buffer::CodeBuffer;
use crate::core::error::{EncodingError, GenerateResult};
use crate::core::plan::Direction;
use crate::core::template::KernelLibrary;

/// Third argument of a generated routine.
///
/// The routine is called as `fn(input: *const f32, output: *mut f32,
/// tables: *const RoutineTables)` under the System V ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RoutineTables {
    /// Twiddle factors, laid out per level as described by the plan's
    /// lookup table.
    pub twiddles: *const f32,
    /// Input element offset of every leaf block.
    pub input_index: *const u32,
    /// Four-lane sign mask from [`Routine::sign_mask`](crate::Routine::sign_mask),
    /// 16-byte aligned.
    pub sign_mask: *const u32,
}

/// x86-64 backend implementing the [`Backend`] trait.
pub struct X64Backend {
    kernels: KernelLibrary,
    prologue: Vec<u8>,
    epilogue: Vec<u8>,
}

impl X64Backend {
    /// Assemble the kernel library and the entry and exit sequences.
    pub fn new() -> Result<Self, EncodingError> {
        let kernels = kernels::build_library()?;
        let prologue = Self::assemble_prologue()?;
        let epilogue = Self::assemble_epilogue()?;

        Ok(Self {
            kernels,
            prologue,
            epilogue,
        })
    }

    fn assemble_prologue() -> Result<Vec<u8>, EncodingError> {
        let mut encoder = X64Encoder::new()?;

        encoder.push_reg(rbx)?;
        encoder.push_reg(rbp)?;
        encoder.push_reg(r12)?;

        encoder.mov_reg_reg(r9, rdi)?;
        encoder.mov_reg_reg(rbx, rsi)?;
        encoder.mov_reg_reg(r12, rdx)?;

        encoder.mov_reg_mem(r8, r12, offset_of!(RoutineTables, twiddles) as i32)?;
        encoder.mov_reg_mem(r10, r12, offset_of!(RoutineTables, input_index) as i32)?;
        encoder.mov_reg_mem(rax, r12, offset_of!(RoutineTables, sign_mask) as i32)?;
        encoder.movaps_load(xmm15, rax, 0)?;

        encoder.finalize(0)
    }

    fn assemble_epilogue() -> Result<Vec<u8>, EncodingError> {
        let mut encoder = X64Encoder::new()?;

        encoder.pop_reg(r12)?;
        encoder.pop_reg(rbp)?;
        encoder.pop_reg(rbx)?;
        encoder.ret()?;

        encoder.finalize(0)
    }

    /// Assemble one primitive at the cursor address and append it.
    fn emit_with(
        &self,
        buf: &mut CodeBuffer<'_>,
        f: impl FnOnce(&mut X64Encoder) -> Result<(), EncodingError>,
    ) -> GenerateResult<()> {
        let mut encoder = X64Encoder::new()?;
        f(&mut encoder)?;
        let bytes = encoder.finalize(buf.address() as u64)?;
        debug_assert!(bytes.len() <= MAX_INSTRUCTION_LEN);
        buf.append(&bytes)?;
        Ok(())
    }
}

impl Backend for X64Backend {
    fn name(&self) -> &'static str {
        "x86-64"
    }

    fn kernels(&self) -> &KernelLibrary {
        &self.kernels
    }

    fn max_primitive_len(&self) -> usize {
        MAX_INSTRUCTION_LEN
    }

    /// The flip sites carry the direction, so both directions rotate with
    /// the same mask.
    fn sign_mask(&self, _direction: Direction) -> [u32; 4] {
        kernels::ROTATION_MASK
    }

    fn prologue_len(&self) -> usize {
        self.prologue.len()
    }

    fn epilogue_len(&self) -> usize {
        self.epilogue.len()
    }

    fn emit_prologue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()> {
        buf.append(&self.prologue)?;
        Ok(())
    }

    fn emit_epilogue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()> {
        buf.append(&self.epilogue)?;
        Ok(())
    }

    fn emit_load_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, value: u32) -> GenerateResult<()> {
        self.emit_with(buf, |e| e.mov_imm(reg, value))
    }

    fn emit_add_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, delta: i32) -> GenerateResult<()> {
        self.emit_with(buf, |e| e.add_imm(reg, delta))
    }

    fn emit_shift(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, amount: i32) -> GenerateResult<()> {
        self.emit_with(buf, |e| e.shift(reg, amount))
    }

    fn emit_call(&self, buf: &mut CodeBuffer<'_>, target: usize) -> GenerateResult<()> {
        self.emit_with(buf, |e| e.call_direct(target as u64))
    }

    fn align_cursor(&self, buf: &mut CodeBuffer<'_>, bias: usize) -> GenerateResult<usize> {
        let padding = buf.padding_for(self.fetch_alignment(), bias);
        if padding > 0 {
            let mut nops = Vec::with_capacity(padding);
            nop_padding(padding, &mut nops);
            buf.append(&nops)?;
            trace!("aligned {:#x} with {} bytes", buf.address(), padding);
        }
        Ok(padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::CodeRegion;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn decode(code: &[u8], ip: u64) -> Vec<Mnemonic> {
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            out.push(decoder.decode().mnemonic());
        }
        out
    }

    #[test]
    fn test_routine_tables_layout() {
        assert_eq!(offset_of!(RoutineTables, twiddles), 0);
        assert_eq!(offset_of!(RoutineTables, input_index), 8);
        assert_eq!(offset_of!(RoutineTables, sign_mask), 16);
    }

    #[test]
    fn test_sign_mask_is_direction_independent() {
        let backend = X64Backend::new().unwrap();
        assert_eq!(backend.sign_mask(Direction::Forward), kernels::ROTATION_MASK);
        assert_eq!(backend.sign_mask(Direction::Inverse), kernels::ROTATION_MASK);
    }

    #[test]
    fn test_prologue_and_epilogue_balance() {
        let backend = X64Backend::new().unwrap();
        let prologue = decode(&backend.prologue, 0);
        let epilogue = decode(&backend.epilogue, 0);

        let pushes = prologue.iter().filter(|&&m| m == Mnemonic::Push).count();
        let pops = epilogue.iter().filter(|&&m| m == Mnemonic::Pop).count();
        assert_eq!(pushes, 3);
        assert_eq!(pops, 3);
        assert_eq!(prologue.last(), Some(&Mnemonic::Movaps));
        assert_eq!(epilogue.last(), Some(&Mnemonic::Ret));
    }

    #[test]
    fn test_call_targets_absolute_address() {
        let backend = X64Backend::new().unwrap();
        let mut region = CodeRegion::new(64);
        let mut buf = CodeBuffer::new(region.as_mut_slice());
        let target = buf.address_of(0);

        buf.append(&[0x90; 7]).unwrap();
        let ip = buf.address() as u64;
        backend.emit_call(&mut buf, target).unwrap();

        let code = &buf.written()[7..];
        let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
        let call = decoder.decode();
        assert_eq!(call.mnemonic(), Mnemonic::Call);
        assert_eq!(call.near_branch_target(), target as u64);
    }

    #[test]
    fn test_align_cursor_uses_nops() {
        let backend = X64Backend::new().unwrap();
        let mut region = CodeRegion::new(64);
        let mut buf = CodeBuffer::new(region.as_mut_slice());
        buf.append(&[0xC3]).unwrap();

        let padding = backend.align_cursor(&mut buf, 3).unwrap();
        assert_eq!(padding, 12);
        assert_eq!((buf.address() + 3) % 16, 0);
        assert!(decode(&buf.written()[1..], 0).iter().all(|&m| m == Mnemonic::Nop));
    }

    #[test]
    fn test_primitives_fit_bound() {
        let backend = X64Backend::new().unwrap();
        let mut region = CodeRegion::new(256);
        let mut buf = CodeBuffer::new(region.as_mut_slice());

        let mut last = 0;
        let mut check = |buf: &CodeBuffer<'_>| {
            assert!(buf.position() - last <= backend.max_primitive_len());
            last = buf.position();
        };

        backend.emit_load_immediate(&mut buf, RegRole::Size, 1 << 26).unwrap();
        check(&buf);
        backend.emit_add_immediate(&mut buf, RegRole::Output, -(1 << 29)).unwrap();
        check(&buf);
        backend.emit_add_immediate(&mut buf, RegRole::Lut, 8).unwrap();
        check(&buf);
        backend.emit_shift(&mut buf, RegRole::Size, -2).unwrap();
        check(&buf);
    }
}
