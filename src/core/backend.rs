//! Architecture seam of the generator.
//!
//! The orchestrator is written once against [`Backend`]. A backend owns the
//! kernel templates for its instruction set and knows how to encode the few
//! glue instructions placed between them. Glue instructions operate on
//! abstract [`RegRole`]s; each backend decides which physical register plays
//! which role.

use super::code_buffer::CodeBuffer;
use super::error::GenerateResult;
use super::plan::Direction;
use super::template::KernelLibrary;

/// Registers the glue code manipulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegRole {
    /// Bound of the leaf-pass loops.
    LoopCounter,
    /// Size of the next subtransform call.
    Size,
    /// Output cursor of the next subtransform call.
    Output,
    /// Twiddle-table cursor of the next subtransform call.
    Lut,
}

/// Instruction-set specific encoding for the generator.
pub trait Backend {
    /// Short target name for diagnostics.
    fn name(&self) -> &'static str;

    /// Templates copied by the generator.
    fn kernels(&self) -> &KernelLibrary;

    /// Boundary loop heads and base-case entries are aligned to.
    fn fetch_alignment(&self) -> usize {
        16
    }

    /// Upper bound of any single glue instruction in bytes.
    fn max_primitive_len(&self) -> usize;

    /// Lane mask the routine's rotations XOR with. The caller passes it in
    /// at run time; it must agree with the sign flips patched for
    /// `direction` so the direction takes effect exactly once.
    fn sign_mask(&self, direction: Direction) -> [u32; 4];

    fn prologue_len(&self) -> usize;

    fn epilogue_len(&self) -> usize;

    fn emit_prologue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()>;

    fn emit_epilogue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()>;

    /// `reg = value`
    fn emit_load_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, value: u32) -> GenerateResult<()>;

    /// `reg += delta`
    fn emit_add_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, delta: i32) -> GenerateResult<()>;

    /// Shift left by `amount` when positive, arithmetic shift right by
    /// `-amount` when negative.
    fn emit_shift(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, amount: i32) -> GenerateResult<()>;

    /// Call the absolute address `target`.
    fn emit_call(&self, buf: &mut CodeBuffer<'_>, target: usize) -> GenerateResult<()>;

    /// Pad so that the byte `bias` past the cursor lands on the fetch
    /// boundary. Returns the padding written.
    fn align_cursor(&self, buf: &mut CodeBuffer<'_>, bias: usize) -> GenerateResult<usize>;
}
