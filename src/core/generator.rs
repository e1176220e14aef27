// This module implements the emission orchestrator, the heart of the crate. Generator owns a
// Backend (kernel templates plus glue-instruction encoders for one instruction set) and a
// GenerationSession (scratch arena and statistics). generate() validates the request against
// the plan, builds the split-radix decomposition in the arena and checks the destination
// capacity against a worst-case bound, all before the first byte is written. It then lays out
// the routine: both base cases, the prologue with the initial loop bound, the leaf passes the
// parity schedule selects (each copied, sign-patched and offset-patched in place), the bridge
// fragment, the call chain and the epilogue. The call chain walks the decomposition with an
// explicit EmissionState and emits only the register updates that differ from the previous
// call site. The arena is reset before generate() returns on every path.

//! Routine generation.

use log::{debug, trace, warn};

use super::backend::{Backend, RegRole};
use super::code_buffer::CodeBuffer;
use super::decompose::{self, Decomposition, DecompositionNode};
use super::error::{EncodingError, GenerateError, GenerateResult};
use super::plan::{self, Direction, TransformParameters, TransformPlan};
use super::schedule::{self, LeafSchedule};
use super::session::{GenerationSession, SessionStats};
use super::template::{BaseCase, KernelTemplate, LeafVariant};

/// Upper bound on the fragments of one routine: two base cases, prologue,
/// leaf init, four leaf passes, bridge, epilogue.
pub const MAX_FRAGMENTS: usize = 10;

/// One contiguous piece of a generated routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
}

impl Fragment {
    const EMPTY: Self = Self {
        name: "",
        offset: 0,
        len: 0,
    };
}

/// A generated routine. Offsets are relative to the start of the region it
/// was written into; the routine does not own that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routine {
    pub size: usize,
    pub direction: Direction,
    /// Offset of the first prologue instruction.
    pub entry_offset: usize,
    /// Absolute address of the entry at generation time.
    pub entry_address: usize,
    /// Bytes written, padding included.
    pub code_len: usize,
    pub x4_offset: usize,
    pub x8_offset: usize,
    pub call_sites: usize,
    /// Sign mask to hand the routine at run time.
    pub sign_mask: [u32; 4],
    fragments: [Fragment; MAX_FRAGMENTS],
    fragment_count: usize,
}

impl Routine {
    /// Copied fragments in emission order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments[..self.fragment_count]
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments().iter().find(|f| f.name == name)
    }

    /// The routine's bytes inside `region`.
    pub fn code<'a>(&self, region: &'a [u8]) -> &'a [u8] {
        &region[..self.code_len]
    }
}

/// Previous call site's register values, threaded through the call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmissionState {
    /// Output offset in elements.
    pub offset: usize,
    /// Zero before the first call site.
    pub size: usize,
    /// Twiddle-table displacement in bytes.
    pub lut: usize,
}

/// What the call-chain walk emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainSummary {
    pub call_sites: usize,
    /// Loads, adds and shifts emitted.
    pub updates: usize,
    /// Adds and shifts skipped because the value was unchanged.
    pub elided: usize,
}

/// Emit one call per node up to the sentinel, updating only the registers
/// whose value differs from the previous call site.
///
/// `targets` holds the absolute addresses of the x4 and x8 base cases.
pub fn emit_call_chain<B: Backend>(
    backend: &B,
    buf: &mut CodeBuffer<'_>,
    nodes: &[DecompositionNode],
    params: &TransformParameters,
    targets: [usize; 2],
) -> GenerateResult<ChainSummary> {
    let leaf = params.leaf();
    let mut state = EmissionState::default();
    let mut summary = ChainSummary::default();

    for node in nodes.iter().take_while(|node| !node.is_sentinel()) {
        let lut = params
            .lut_displacement(node.size)
            .ok_or_else(|| GenerateError::PlanMismatch {
                reason: format!("no lookup-table entry for subtransform of size {}", node.size),
            })?;

        if state.size == 0 {
            backend.emit_load_immediate(buf, RegRole::Size, to_imm32("load", node.size as i64)? as u32)?;
            summary.updates += 1;
        } else {
            let delta = 8 * (node.offset as i64 - state.offset as i64);
            if delta != 0 {
                backend.emit_add_immediate(buf, RegRole::Output, to_imm32("add", delta)?)?;
                summary.updates += 1;
            } else {
                summary.elided += 1;
            }

            if node.size > leaf && node.size != state.size {
                let factor = node.size.trailing_zeros() as i32 - state.size.trailing_zeros() as i32;
                backend.emit_shift(buf, RegRole::Size, factor)?;
                summary.updates += 1;
            } else {
                summary.elided += 1;
            }
        }

        if lut != state.lut {
            let delta = lut as i64 - state.lut as i64;
            backend.emit_add_immediate(buf, RegRole::Lut, to_imm32("add", delta)?)?;
            summary.updates += 1;
        } else {
            summary.elided += 1;
        }

        let target = if node.size == 2 * leaf { targets[0] } else { targets[1] };
        trace!(
            "call site {}: N={} offset={} lut={} -> {:#x}",
            summary.call_sites,
            node.size,
            node.offset,
            lut,
            target
        );
        backend.emit_call(buf, target)?;
        summary.call_sites += 1;

        state = EmissionState {
            offset: node.offset,
            size: if node.size > leaf { node.size } else { state.size },
            lut,
        };
    }

    Ok(summary)
}

fn to_imm32(operation: &'static str, value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value).map_err(|_| EncodingError::ImmediateOutOfRange { operation, value })
}

/// Worst-case routine length for `size`, independent of the iteration
/// counts and of where the region happens to be placed.
pub fn capacity_bound<B: Backend>(backend: &B, size: usize, leaf: usize) -> usize {
    let kernels = backend.kernels();
    let pad = backend.fetch_alignment() - 1;
    let primitive = backend.max_primitive_len();

    let leaf_passes = 2 * kernels.leaf(LeafVariant::EvenEven).len()
        + kernels.leaf(LeafVariant::OddOdd).len()
        + kernels
            .leaf(LeafVariant::EvenOdd)
            .len()
            .max(kernels.leaf(LeafVariant::OddEven).len());

    let fixed = kernels.x4.len()
        + kernels.x8.len()
        + kernels.leaf_init.len()
        + kernels.bridge.len()
        + backend.prologue_len()
        + backend.epilogue_len();

    // two base cases, the entry and up to four leaf loops
    let alignment = 7 * pad;
    // initial loop bound plus two reloads
    let counters = 3 * primitive;
    // at most three register updates and a call per node
    let chain = 4 * primitive * decompose::count(size, leaf);

    fixed + leaf_passes + alignment + counters + chain
}

/// Generates FFT routines for one backend.
pub struct Generator<B: Backend> {
    backend: B,
    session: GenerationSession,
}

impl<B: Backend> Generator<B> {
    /// Create a generator, validating the backend's kernel library.
    pub fn new(backend: B) -> GenerateResult<Self> {
        Self::with_session(backend, GenerationSession::new())
    }

    /// Create a generator that uses `session` for scratch memory.
    pub fn with_session(backend: B, session: GenerationSession) -> GenerateResult<Self> {
        backend.kernels().validate()?;
        debug!(
            "{} backend ready, largest template {} bytes",
            backend.name(),
            backend.kernels().max_template_len()
        );
        Ok(Self { backend, session })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> &GenerationSession {
        &self.session
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    /// Region size that always suffices for `size`.
    pub fn required_capacity(&self, size: usize, leaf: usize) -> usize {
        capacity_bound(&self.backend, size, leaf)
    }

    /// Generate the routine for a transform of `size` into `plan`'s region.
    ///
    /// All validation (size, plan agreement, scratch allocation, capacity)
    /// happens before the region is touched, so on those errors the region
    /// is unchanged.
    pub fn generate<P: TransformPlan + ?Sized>(
        &mut self,
        plan: &mut P,
        size: usize,
        leaf: usize,
        direction: Direction,
    ) -> GenerateResult<Routine> {
        let result = generate_into(&self.backend, &self.session, plan, size, leaf, direction);
        self.session.reset();

        match result {
            Ok((routine, chain)) => {
                self.session.record_routine(size, routine.code_len);
                self.session
                    .record_call_chain(chain.call_sites, chain.updates, chain.elided);
                debug!(
                    "generated N={} {:?}: {} bytes, {} call sites, {} updates ({} elided)",
                    size, direction, routine.code_len, chain.call_sites, chain.updates, chain.elided
                );
                Ok(routine)
            }
            Err(err) => {
                self.session.record_failure();
                debug!("generation of N={} failed: {}", size, err);
                Err(err)
            }
        }
    }
}

fn validate_request(params: &TransformParameters, size: usize, leaf: usize) -> GenerateResult<()> {
    if !plan::is_supported(size, leaf) {
        return Err(GenerateError::InvalidSize { size, leaf });
    }

    if params.size() != size || params.leaf() != leaf {
        return Err(GenerateError::PlanMismatch {
            reason: format!(
                "plan is for N={} leaf={}, requested N={} leaf={}",
                params.size(),
                params.leaf(),
                size,
                leaf
            ),
        });
    }

    params.check_lut().map_err(|err| GenerateError::PlanMismatch {
        reason: err.to_string(),
    })
}

fn generate_into<B: Backend, P: TransformPlan + ?Sized>(
    backend: &B,
    session: &GenerationSession,
    plan: &mut P,
    size: usize,
    leaf: usize,
    direction: Direction,
) -> GenerateResult<(Routine, ChainSummary)> {
    validate_request(plan.parameters(), size, leaf)?;

    let decomposition = Decomposition::build(session, size, leaf)?;
    let required = capacity_bound(backend, size, leaf);

    let (params, region) = plan.split_mut();
    if region.len() < required {
        warn!(
            "region of {} bytes cannot hold N={} (needs up to {})",
            region.len(),
            size,
            required
        );
        return Err(GenerateError::RegionTooSmall {
            required,
            available: region.len(),
        });
    }

    let schedule = schedule::leaf_schedule(size, params.iterations());
    debug!(
        "N={} leaf={}: {} subtransforms, leaf passes {:?}",
        size,
        leaf,
        decomposition.len(),
        schedule.steps.iter().map(|s| s.variant.short_name()).collect::<Vec<_>>()
    );

    let mut emitter = Emitter {
        backend,
        buf: CodeBuffer::new(region),
        direction,
        fragments: [Fragment::EMPTY; MAX_FRAGMENTS],
        fragment_count: 0,
    };

    let kernels = backend.kernels();

    backend.align_cursor(&mut emitter.buf, 0)?;
    let x4_offset = emitter.copy(kernels.base_case(BaseCase::X4), &[])?;
    backend.align_cursor(&mut emitter.buf, 0)?;
    let x8_offset = emitter.copy(kernels.base_case(BaseCase::X8), &[])?;
    let targets = [
        emitter.buf.address_of(x4_offset),
        emitter.buf.address_of(x8_offset),
    ];

    backend.align_cursor(&mut emitter.buf, 0)?;
    let entry_offset = emitter.buf.position();
    backend.emit_prologue(&mut emitter.buf)?;
    emitter.record("prologue", entry_offset);

    emitter.emit_leaf_passes(size, &schedule)?;
    emitter.copy(&kernels.bridge, &[])?;

    let chain = emit_call_chain(backend, &mut emitter.buf, decomposition.nodes(), params, targets)?;

    let epilogue = emitter.buf.position();
    backend.emit_epilogue(&mut emitter.buf)?;
    emitter.record("epilogue", epilogue);

    let routine = Routine {
        size,
        direction,
        entry_offset,
        entry_address: emitter.buf.address_of(entry_offset),
        code_len: emitter.buf.position(),
        x4_offset,
        x8_offset,
        call_sites: chain.call_sites,
        sign_mask: backend.sign_mask(direction),
        fragments: emitter.fragments,
        fragment_count: emitter.fragment_count,
    };

    Ok((routine, chain))
}

/// Write side of one generation.
struct Emitter<'b, 'r, B: Backend> {
    backend: &'b B,
    buf: CodeBuffer<'r>,
    direction: Direction,
    fragments: [Fragment; MAX_FRAGMENTS],
    fragment_count: usize,
}

impl<B: Backend> Emitter<'_, '_, B> {
    /// Copy `template`, apply the direction and `patches`, and return the
    /// offset it was copied to.
    fn copy(&mut self, template: &KernelTemplate, patches: &[u32]) -> GenerateResult<usize> {
        let start = self.buf.append(template.bytes())?;
        let fragment = self.buf.fragment_mut(start, template.len());
        template.apply_direction(fragment, self.direction)?;
        template.apply_patches(fragment, patches)?;
        self.record(template.name(), start);
        Ok(start)
    }

    /// Record a fragment spanning `start` to the cursor.
    fn record(&mut self, name: &'static str, start: usize) {
        debug_assert!(self.fragment_count < MAX_FRAGMENTS);
        if let Some(slot) = self.fragments.get_mut(self.fragment_count) {
            *slot = Fragment {
                name,
                offset: start,
                len: self.buf.position() - start,
            };
            self.fragment_count += 1;
        }
    }

    fn emit_leaf_passes(&mut self, size: usize, schedule: &LeafSchedule) -> GenerateResult<()> {
        let backend = self.backend;
        let kernels = backend.kernels();

        backend.emit_load_immediate(&mut self.buf, RegRole::LoopCounter, schedule.initial_count)?;
        self.copy(&kernels.leaf_init, &[])?;

        for step in &schedule.steps {
            let template = kernels.leaf(step.variant);

            if let Some(count) = step.counter_reload {
                backend.emit_load_immediate(&mut self.buf, RegRole::LoopCounter, count)?;
            }
            if step.aligned {
                let padding = backend.align_cursor(&mut self.buf, template.loop_entry().unwrap_or(0))?;
                trace!("{}: {} bytes of padding", template.name(), padding);
            }

            self.copy(template, &step.order.patch_values(size))?;
        }

        Ok(())
    }
}
