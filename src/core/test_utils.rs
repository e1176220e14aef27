//! Test utilities for session- and backend-level testing.
//!
//! `TestContext` hands out generation sessions with an optional memory
//! limit, and `RecordingBackend` stands in for a real instruction set: it
//! logs every glue primitive the generator asks for and writes a short,
//! position-independent byte pattern for each so buffer accounting stays
//! realistic.

#[cfg(test)]
pub mod test {
    use std::cell::RefCell;

    use crate::core::backend::{Backend, RegRole};
    use crate::core::code_buffer::CodeBuffer;
    use crate::core::error::GenerateResult;
    use crate::core::plan::Direction;
    use crate::core::session::GenerationSession;
    use crate::core::template::{KernelLibrary, KernelTemplate, LeafVariant, PatchSite};

    /// Test context that hands out sessions.
    ///
    /// A limited context simulates an embedder that caps scratch memory.
    pub struct TestContext {
        memory_limit: Option<usize>,
    }

    impl TestContext {
        /// Create a new test context without a memory limit.
        pub fn new() -> Self {
            Self { memory_limit: None }
        }

        /// Create a test context whose sessions refuse to grow beyond
        /// `limit` bytes.
        pub fn with_memory_limit(limit: usize) -> Self {
            Self {
                memory_limit: Some(limit),
            }
        }

        /// Create a generation session honouring this context's limit.
        pub fn create_session(&self) -> GenerationSession {
            match self.memory_limit {
                Some(limit) => GenerationSession::with_memory_limit(limit),
                None => GenerationSession::new(),
            }
        }

        /// Run a closure with a fresh session.
        pub fn with_session<F, R>(&self, f: F) -> R
        where
            F: FnOnce(&mut GenerationSession) -> R,
        {
            let mut session = self.create_session();
            f(&mut session)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Run a test with an unlimited context.
    pub fn with_test_context<F, R>(f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let ctx = TestContext::new();
        f(&ctx)
    }

    /// Run a test with a memory-limited context.
    pub fn with_limited_context<F, R>(limit: usize, f: F) -> R
    where
        F: FnOnce(&TestContext) -> R,
    {
        let ctx = TestContext::with_memory_limit(limit);
        f(&ctx)
    }

    /// A glue instruction requested by the generator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Primitive {
        Prologue,
        Epilogue,
        LoadImmediate(RegRole, u32),
        AddImmediate(RegRole, i32),
        Shift(RegRole, i32),
        Call(usize),
        Align { bias: usize, padding: usize },
    }

    /// Flip mask of the synthetic templates (addps <-> subps).
    pub const FLIP_MASK: u8 = 0x04;

    /// Backend that records primitives instead of encoding real ones.
    pub struct RecordingBackend {
        kernels: KernelLibrary,
        log: RefCell<Vec<Primitive>>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self {
                kernels: synthetic_library(),
                log: RefCell::new(Vec::new()),
            }
        }

        pub fn kernels_mut(&mut self) -> &mut KernelLibrary {
            &mut self.kernels
        }

        pub fn primitives(&self) -> Vec<Primitive> {
            self.log.borrow().clone()
        }

        pub fn clear(&self) {
            self.log.borrow_mut().clear();
        }

        /// Call targets in emission order.
        pub fn calls(&self) -> Vec<usize> {
            self.log
                .borrow()
                .iter()
                .filter_map(|p| match p {
                    Primitive::Call(target) => Some(*target),
                    _ => None,
                })
                .collect()
        }

        fn emit(&self, buf: &mut CodeBuffer<'_>, primitive: Primitive, bytes: &[u8]) -> GenerateResult<()> {
            buf.append(bytes)?;
            self.log.borrow_mut().push(primitive);
            Ok(())
        }
    }

    impl Default for RecordingBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    fn role_byte(reg: RegRole) -> u8 {
        match reg {
            RegRole::LoopCounter | RegRole::Size => 0xC1,
            RegRole::Output => 0xC2,
            RegRole::Lut => 0xC0,
        }
    }

    fn with_imm32(opcode: u8, reg: RegRole, value: u32) -> [u8; 6] {
        let v = value.to_le_bytes();
        [opcode, role_byte(reg), v[0], v[1], v[2], v[3]]
    }

    impl Backend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn kernels(&self) -> &KernelLibrary {
            &self.kernels
        }

        fn max_primitive_len(&self) -> usize {
            6
        }

        fn sign_mask(&self, _direction: Direction) -> [u32; 4] {
            [0, 0x8000_0000, 0, 0x8000_0000]
        }

        fn prologue_len(&self) -> usize {
            4
        }

        fn epilogue_len(&self) -> usize {
            1
        }

        fn emit_prologue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()> {
            self.emit(buf, Primitive::Prologue, &[0x53, 0x55, 0x41, 0x54])
        }

        fn emit_epilogue(&self, buf: &mut CodeBuffer<'_>) -> GenerateResult<()> {
            self.emit(buf, Primitive::Epilogue, &[0xC3])
        }

        fn emit_load_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, value: u32) -> GenerateResult<()> {
            self.emit(buf, Primitive::LoadImmediate(reg, value), &with_imm32(0xB8, reg, value))
        }

        fn emit_add_immediate(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, delta: i32) -> GenerateResult<()> {
            self.emit(buf, Primitive::AddImmediate(reg, delta), &with_imm32(0x81, reg, delta as u32))
        }

        fn emit_shift(&self, buf: &mut CodeBuffer<'_>, reg: RegRole, amount: i32) -> GenerateResult<()> {
            self.emit(buf, Primitive::Shift(reg, amount), &[0xC1, role_byte(reg), amount as u8])
        }

        fn emit_call(&self, buf: &mut CodeBuffer<'_>, target: usize) -> GenerateResult<()> {
            let rel = target.wrapping_sub(buf.address() + 5) as u32;
            let v = rel.to_le_bytes();
            self.emit(buf, Primitive::Call(target), &[0xE8, v[0], v[1], v[2], v[3]])
        }

        fn align_cursor(&self, buf: &mut CodeBuffer<'_>, bias: usize) -> GenerateResult<usize> {
            let padding = buf.align_to(self.fetch_alignment(), bias, 0x90)?;
            self.log.borrow_mut().push(Primitive::Align { bias, padding });
            Ok(padding)
        }
    }

    fn synthetic_leaf(name: &'static str) -> KernelTemplate {
        // mov r11d,[r10+rax]; then eight loads with a disp32 each
        let mut bytes = vec![0x45, 0x8B, 0x1C, 0x02];
        let mut sites = Vec::new();
        for reg in 0..8u8 {
            bytes.extend_from_slice(&[0x43, 0x0F, 0x28, 0x84 | (reg << 3), 0x19]);
            sites.push(PatchSite::disp32(bytes.len()));
            bytes.extend_from_slice(&[0, 0, 0, 0x10]);
        }
        let flip = bytes.len() + 1;
        // addps xmm0,xmm1; add rax,4; cmp rax,rcx; jb
        bytes.extend_from_slice(&[0x0F, 0x58, 0xC1, 0x48, 0x83, 0xC0, 0x04, 0x48, 0x39, 0xC8, 0x72, 0x00]);
        let back = bytes.len() as i32;
        let last = bytes.len() - 1;
        bytes[last] = (-back) as u8;

        KernelTemplate::new(name, bytes)
            .with_patch_sites(sites)
            .with_sign_flips(vec![flip], FLIP_MASK)
            .with_loop_entry(0)
    }

    /// Small templates shaped like the real ones.
    pub fn synthetic_library() -> KernelLibrary {
        let leaf = |variant: LeafVariant| {
            synthetic_leaf(match variant {
                LeafVariant::EvenEven => "leaf_ee",
                LeafVariant::OddOdd => "leaf_oo",
                LeafVariant::EvenOdd => "leaf_eo",
                LeafVariant::OddEven => "leaf_oe",
            })
        };

        KernelLibrary {
            x4: KernelTemplate::new("x4", vec![0x0F, 0x58, 0xC1, 0xC3]).with_sign_flips(vec![1], FLIP_MASK),
            x8: KernelTemplate::new("x8", vec![0x0F, 0x58, 0xC1, 0x0F, 0x5C, 0xD3, 0xC3])
                .with_sign_flips(vec![1, 4], FLIP_MASK),
            leaf_init: KernelTemplate::new("leaf_init", vec![0x31, 0xC0]),
            leaves: LeafVariant::ALL.map(leaf),
            bridge: KernelTemplate::new("bridge", vec![0x48, 0x89, 0xDA]),
        }
    }

    #[test]
    fn test_synthetic_library_is_valid() {
        assert!(synthetic_library().validate().is_ok());
    }

    #[test]
    fn test_limited_context_sessions() {
        with_limited_context(128, |ctx| {
            let session = ctx.create_session();
            assert_eq!(session.memory_limit(), Some(128));
        });
        with_test_context(|ctx| {
            ctx.with_session(|session| assert_eq!(session.memory_limit(), None));
        });
    }
}
