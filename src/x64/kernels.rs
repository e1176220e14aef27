//! SSE kernel templates for the x86-64 backend.
//!
//! Every template is written with the iced-x86 code assembler and assembled
//! at address zero; none of them contains an absolute address, so the bytes
//! can be copied anywhere. The block encoder reports where each instruction
//! and each displacement ended up, which is how the patch sites and sign-flip
//! sites are found without hand-counted offsets.
//!
//! Register usage inside the routine:
//!
//! | register | role |
//! |----------|------|
//! | `r9`     | input base |
//! | `rbx`    | output base |
//! | `r10`    | input index table |
//! | `r12`    | [`RoutineTables`] pointer |
//! | `xmm15`  | [`ROTATION_MASK`] |
//! | `rax`    | leaf-pass index |
//! | `ecx`    | leaf-pass bound, then subtransform size |
//! | `rdx`    | output cursor of the next call |
//! | `r8`     | twiddle cursor of the next call |
//!
//! Rotations always multiply by -i. The inverse direction is carried only by
//! the flip sites, which swap the add and subtract consuming each rotated
//! operand, so the mask is the same for both directions.
//!
//! Base cases only clobber `rax`, `rsi`, `rdi`, `r10`, `r11` and SSE
//! registers other than `xmm15`.

use std::mem::offset_of;

use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};

use super::backend::RoutineTables;
use crate::core::error::EncodingError;
use crate::core::template::{KernelLibrary, KernelTemplate, LeafVariant, PatchSite};

/// Placeholder displacement of patched loads. Large enough to force a
/// 32-bit displacement field.
const PATCH_PLACEHOLDER: i32 = 0x1000_0000;

/// ADDPS (0F 58) <-> SUBPS (0F 5C).
pub const SIGN_FLIP_MASK: u8 = 0x04;

/// Negates the imaginary lanes after the real/imaginary swap of a rotation.
pub const ROTATION_MASK: [u32; 4] = [0, 0x8000_0000, 0, 0x8000_0000];

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::Assembly(e.to_string())
}

/// Records which instructions carry patch sites and flip sites while a
/// template is written.
struct TemplateBuilder {
    name: &'static str,
    asm: CodeAssembler,
    patched: Vec<usize>,
    flips: Vec<usize>,
    loop_head: Option<CodeLabel>,
}

impl TemplateBuilder {
    fn new(name: &'static str) -> Result<Self, EncodingError> {
        Ok(Self {
            name,
            asm: CodeAssembler::new(64).map_err(asm_err)?,
            patched: Vec::new(),
            flips: Vec::new(),
            loop_head: None,
        })
    }

    fn next_index(&self) -> usize {
        self.asm.instructions().len()
    }

    /// Place the loop head label before the next instruction.
    fn loop_head(&mut self) -> Result<CodeLabel, EncodingError> {
        let mut label = self.asm.create_label();
        self.asm.set_label(&mut label).map_err(asm_err)?;
        self.loop_head = Some(label);
        Ok(label)
    }

    /// `movaps dst, [base + disp32]` with a patched displacement.
    fn patched_load(&mut self, dst: AsmRegisterXmm, base: AsmRegister64) -> Result<(), EncodingError> {
        self.patched.push(self.next_index());
        self.asm
            .movaps(dst, xmmword_ptr(base + PATCH_PLACEHOLDER))
            .map_err(asm_err)
    }

    /// `addps dst, src`, a subtraction in the inverse direction.
    fn flip_add(&mut self, dst: AsmRegisterXmm, src: AsmRegisterXmm) -> Result<(), EncodingError> {
        self.flips.push(self.next_index());
        self.asm.addps(dst, src).map_err(asm_err)
    }

    /// `subps dst, src`, an addition in the inverse direction.
    fn flip_sub(&mut self, dst: AsmRegisterXmm, src: AsmRegisterXmm) -> Result<(), EncodingError> {
        self.flips.push(self.next_index());
        self.asm.subps(dst, src).map_err(asm_err)
    }

    /// `t = a; a += b; t -= b`
    fn butterfly(&mut self, a: AsmRegisterXmm, b: AsmRegisterXmm, t: AsmRegisterXmm) -> Result<(), EncodingError> {
        self.asm.movaps(t, a).map_err(asm_err)?;
        self.asm.addps(a, b).map_err(asm_err)?;
        self.asm.subps(t, b).map_err(asm_err)
    }

    /// Same as [`butterfly`](Self::butterfly) with both halves direction
    /// dependent.
    fn flip_butterfly(&mut self, a: AsmRegisterXmm, b: AsmRegisterXmm, t: AsmRegisterXmm) -> Result<(), EncodingError> {
        self.asm.movaps(t, a).map_err(asm_err)?;
        self.flip_add(a, b)?;
        self.flip_sub(t, b)
    }

    /// Multiply by -i: swap real and imaginary parts, then negate the new
    /// imaginary part through [`ROTATION_MASK`] in xmm15.
    fn rotate(&mut self, reg: AsmRegisterXmm) -> Result<(), EncodingError> {
        self.asm.shufps(reg, reg, 0xB1).map_err(asm_err)?;
        self.asm.xorps(reg, xmm15).map_err(asm_err)
    }

    fn finish(mut self) -> Result<KernelTemplate, EncodingError> {
        let result = self
            .asm
            .assemble_options(
                0,
                BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS
                    | BlockEncoderOptions::RETURN_CONSTANT_OFFSETS,
            )
            .map_err(asm_err)?;

        let loop_entry = match &self.loop_head {
            Some(label) => Some(result.label_ip(label).map_err(asm_err)? as usize),
            None => None,
        };

        let inner = result.inner;
        let code = inner.code_buffer;
        let offsets = inner.new_instruction_offsets;
        let constants = inner.constant_offsets;
        let start_of = |index: usize| offsets[index] as usize;
        let end_of = |index: usize| offsets.get(index + 1).map_or(code.len(), |&o| o as usize);

        let sites = self
            .patched
            .iter()
            .map(|&index| {
                let constant = &constants[index];
                debug_assert_eq!(constant.displacement_size(), 4, "{}: short displacement", self.name);
                PatchSite::disp32(start_of(index) + constant.displacement_offset())
            })
            .collect();

        // reg-reg SSE forms end in opcode, modrm
        let flips = self
            .flips
            .iter()
            .map(|&index| {
                let site = end_of(index) - 2;
                debug_assert!(matches!(code[site], 0x58 | 0x5C), "{}: not addps/subps", self.name);
                site
            })
            .collect();

        let mut template = KernelTemplate::new(self.name, code)
            .with_patch_sites(sites)
            .with_sign_flips(flips, SIGN_FLIP_MASK);
        if let Some(entry) = loop_entry {
            template = template.with_loop_entry(entry);
        }
        Ok(template)
    }
}

/// Eight patched loads relative to `base`, into xmm0..xmm7.
fn leaf_loads(b: &mut TemplateBuilder, base: AsmRegister64) -> Result<(), EncodingError> {
    for dst in [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7] {
        b.patched_load(dst, base)?;
    }
    Ok(())
}

/// Radix-8 butterfly network over xmm0..xmm7, results left in
/// xmm0, xmm8, xmm12, xmm13, xmm4, xmm10, xmm14, xmm2.
fn leaf_butterflies(b: &mut TemplateBuilder) -> Result<(), EncodingError> {
    b.butterfly(xmm0, xmm1, xmm8)?;
    b.butterfly(xmm2, xmm3, xmm9)?;
    b.butterfly(xmm4, xmm5, xmm10)?;
    b.butterfly(xmm6, xmm7, xmm11)?;
    b.rotate(xmm9)?;
    b.rotate(xmm11)?;
    b.butterfly(xmm0, xmm2, xmm12)?;
    b.flip_butterfly(xmm8, xmm9, xmm13)?;
    b.butterfly(xmm4, xmm6, xmm14)?;
    b.flip_butterfly(xmm10, xmm11, xmm2)
}

/// Store the eight results to `rdx + rax * 32`. Odd outputs interleave the
/// two halves.
fn leaf_stores(b: &mut TemplateBuilder, odd_output: bool) -> Result<(), EncodingError> {
    let even = [xmm0, xmm8, xmm12, xmm13, xmm4, xmm10, xmm14, xmm2];
    let odd = [xmm0, xmm4, xmm8, xmm10, xmm12, xmm14, xmm13, xmm2];
    let order = if odd_output { odd } else { even };

    b.asm.lea(rsi, qword_ptr(rax * 4)).map_err(asm_err)?;
    for (i, src) in order.into_iter().enumerate() {
        let disp = 16 * i as i32;
        b.asm
            .movaps(xmmword_ptr(rdx + rsi * 8 + disp), src)
            .map_err(asm_err)?;
    }
    Ok(())
}

/// Index the input through the index table and set `r11` to the element
/// base of this iteration.
fn leaf_input_base(b: &mut TemplateBuilder) -> Result<(), EncodingError> {
    b.asm.mov(r11d, dword_ptr(r10 + rax)).map_err(asm_err)?;
    b.asm.lea(r11, qword_ptr(r9 + r11 * 8)).map_err(asm_err)
}

fn leaf_name(variant: LeafVariant) -> &'static str {
    match variant {
        LeafVariant::EvenEven => "leaf_ee",
        LeafVariant::OddOdd => "leaf_oo",
        LeafVariant::EvenOdd => "leaf_eo",
        LeafVariant::OddEven => "leaf_oe",
    }
}

/// Leaf pass. Even-even and odd-odd loop from the current index to `rcx`;
/// the mixed passes handle a single block.
pub fn leaf_pass(variant: LeafVariant) -> Result<KernelTemplate, EncodingError> {
    let mut b = TemplateBuilder::new(leaf_name(variant))?;
    let looping = matches!(variant, LeafVariant::EvenEven | LeafVariant::OddOdd);
    let odd_output = matches!(variant, LeafVariant::OddOdd | LeafVariant::EvenOdd);

    let head = if looping { Some(b.loop_head()?) } else { None };

    leaf_input_base(&mut b)?;
    leaf_loads(&mut b, r11)?;
    leaf_butterflies(&mut b)?;
    leaf_stores(&mut b, odd_output)?;
    b.asm.add(rax, 4).map_err(asm_err)?;

    if let Some(head) = head {
        b.asm.cmp(rax, rcx).map_err(asm_err)?;
        b.asm.jb(head).map_err(asm_err)?;
    }

    b.finish()
}

/// Size-4 base case: one radix-4 step over the four quarters at `rdx`.
/// Quarter stride in bytes is `2 * rcx`.
pub fn base_case_x4() -> Result<KernelTemplate, EncodingError> {
    let mut b = TemplateBuilder::new("x4")?;

    b.asm.lea(rax, qword_ptr(rcx + rcx)).map_err(asm_err)?;
    b.asm.lea(rsi, qword_ptr(rax + rax * 2)).map_err(asm_err)?;
    b.asm.movaps(xmm0, xmmword_ptr(rdx)).map_err(asm_err)?;
    b.asm.movaps(xmm1, xmmword_ptr(rdx + rax)).map_err(asm_err)?;
    b.asm.movaps(xmm2, xmmword_ptr(rdx + rax * 2)).map_err(asm_err)?;
    b.asm.movaps(xmm3, xmmword_ptr(rdx + rsi)).map_err(asm_err)?;
    b.asm.movaps(xmm8, xmmword_ptr(r8)).map_err(asm_err)?;

    b.asm.mulps(xmm2, xmm8).map_err(asm_err)?;
    b.asm.mulps(xmm3, xmm8).map_err(asm_err)?;
    b.butterfly(xmm2, xmm3, xmm9)?;
    b.rotate(xmm9)?;
    b.butterfly(xmm0, xmm2, xmm10)?;
    b.flip_butterfly(xmm1, xmm9, xmm11)?;

    b.asm.movaps(xmmword_ptr(rdx), xmm0).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(rdx + rax), xmm1).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(rdx + rax * 2), xmm10).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(rdx + rsi), xmm11).map_err(asm_err)?;
    b.asm.ret().map_err(asm_err)?;

    b.finish()
}

/// Size-8 base case: radix-4 steps over the quarters at `rdx`, walking the
/// twiddles from `r8`, until the first quarter is consumed.
pub fn base_case_x8() -> Result<KernelTemplate, EncodingError> {
    let mut b = TemplateBuilder::new("x8")?;

    b.asm.lea(rax, qword_ptr(rcx + rcx)).map_err(asm_err)?;
    b.asm.lea(r10, qword_ptr(rax + rax * 2)).map_err(asm_err)?;
    b.asm.mov(r11, rdx).map_err(asm_err)?;
    b.asm.mov(rsi, r8).map_err(asm_err)?;
    b.asm.lea(rdi, qword_ptr(rdx + rax)).map_err(asm_err)?;

    let head = b.loop_head()?;
    b.asm.movaps(xmm0, xmmword_ptr(r11)).map_err(asm_err)?;
    b.asm.movaps(xmm1, xmmword_ptr(r11 + rax)).map_err(asm_err)?;
    b.asm.movaps(xmm2, xmmword_ptr(r11 + rax * 2)).map_err(asm_err)?;
    b.asm.movaps(xmm3, xmmword_ptr(r11 + r10)).map_err(asm_err)?;
    b.asm.movaps(xmm8, xmmword_ptr(rsi)).map_err(asm_err)?;
    b.asm.movaps(xmm9, xmmword_ptr(rsi + 16)).map_err(asm_err)?;

    b.asm.mulps(xmm2, xmm8).map_err(asm_err)?;
    b.asm.mulps(xmm3, xmm9).map_err(asm_err)?;
    b.butterfly(xmm2, xmm3, xmm6)?;
    b.rotate(xmm6)?;
    b.butterfly(xmm0, xmm2, xmm4)?;
    b.flip_butterfly(xmm1, xmm6, xmm5)?;

    b.asm.movaps(xmmword_ptr(r11), xmm0).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(r11 + rax), xmm1).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(r11 + rax * 2), xmm4).map_err(asm_err)?;
    b.asm.movaps(xmmword_ptr(r11 + r10), xmm5).map_err(asm_err)?;

    b.asm.add(r11, 16).map_err(asm_err)?;
    b.asm.add(rsi, 32).map_err(asm_err)?;
    b.asm.cmp(r11, rdi).map_err(asm_err)?;
    b.asm.jb(head).map_err(asm_err)?;
    b.asm.ret().map_err(asm_err)?;

    b.finish()
}

/// Reset the leaf-pass index and point the output cursor at the output.
pub fn leaf_init() -> Result<KernelTemplate, EncodingError> {
    let mut b = TemplateBuilder::new("leaf_init")?;
    b.asm.xor(eax, eax).map_err(asm_err)?;
    b.asm.mov(rdx, rbx).map_err(asm_err)?;
    b.finish()
}

/// Rewind the output and twiddle cursors for the call chain.
pub fn bridge() -> Result<KernelTemplate, EncodingError> {
    let twiddles = offset_of!(RoutineTables, twiddles) as i32;

    let mut b = TemplateBuilder::new("bridge")?;
    b.asm.mov(rdx, rbx).map_err(asm_err)?;
    b.asm.mov(r8, qword_ptr(r12 + twiddles)).map_err(asm_err)?;
    b.finish()
}

/// Assemble the full library.
pub fn build_library() -> Result<KernelLibrary, EncodingError> {
    Ok(KernelLibrary {
        x4: base_case_x4()?,
        x8: base_case_x8()?,
        leaf_init: leaf_init()?,
        leaves: [
            leaf_pass(LeafVariant::EvenEven)?,
            leaf_pass(LeafVariant::OddOdd)?,
            leaf_pass(LeafVariant::EvenOdd)?,
            leaf_pass(LeafVariant::OddEven)?,
        ],
        bridge: bridge()?,
    })
}
