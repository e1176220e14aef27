// This module gathers the architecture-independent half of fftjit. The decomposition engine
// turns a transform size into the post-order list of subtransforms; the session owns the
// scratch arena that list lives in and the statistics gathered across generations; plan
// describes a transform (size, leaf size, iteration counts, twiddle-table layout) and the
// region its routine is written into; the code buffer is the write cursor over that region;
// templates carry the pre-assembled kernels with their patch metadata; the schedule selects
// the leaf passes; and the generator stitches everything together through the Backend trait,
// which is the only place instruction-set knowledge enters the core.

//! Core generator infrastructure.
//!
//! # Key Components
//!
//! ## Decomposition (`decompose`)
//! - Split-radix recursion into quarter and eighth subtransforms
//! - Post-order node list, sized and filled by the same child table
//!
//! ## Session (`session`)
//! - Scratch arena using `bumpalo`, reset after every generation
//! - Optional memory limit
//! - Generation statistics
//!
//! ## Templates (`template`)
//! - Pre-assembled kernels with patch sites and sign-flip sites
//! - Library validation
//!
//! ## Generation (`generator`)
//! - Validation before any write
//! - Leaf-pass schedule and delta-encoded call chain
//! - Backend-agnostic, see [`Backend`]

pub mod backend;
pub mod code_buffer;
pub mod decompose;
pub mod error;
pub mod generator;
pub mod plan;
pub mod schedule;
pub mod session;
pub mod template;
pub mod test_utils;

pub use backend::{Backend, RegRole};
pub use code_buffer::{CodeBuffer, CodeBufferError};
pub use decompose::{Decomposition, DecompositionNode};
pub use error::{EncodingError, GenerateError, GenerateResult};
pub use generator::{
    ChainSummary,
    EmissionState,
    Fragment,
    Generator,
    Routine,
};
pub use plan::{
    CodeRegion,
    Direction,
    IterationCounts,
    Plan,
    PlanError,
    TransformParameters,
    TransformPlan,
};
pub use schedule::{LeafSchedule, LeafStep, OffsetOrder};
pub use session::{GenerationSession, SessionError, SessionStats};
pub use template::{
    BaseCase,
    KernelLibrary,
    KernelTemplate,
    LeafVariant,
    PatchKind,
    PatchSite,
    TemplateError,
};
