//! fftjit - Just-in-time generation of split-radix FFT routines.
//!
//! For a power-of-two transform size, fftjit writes one contiguous machine
//! code routine that computes the whole transform. The size is decomposed
//! into a post-order list of subtransforms, and pre-assembled kernel
//! fragments are copied into the destination with their size, offset and
//! direction dependent fields patched in place. Between the leaf passes and
//! the calls into the base cases only the register values that actually
//! change are updated.
//!
//! # Primary Usage
//!
//! ```ignore
//! use fftjit::{Direction, Generator, Plan, TransformParameters};
//! use fftjit::x64::X64Backend;
//!
//! let mut generator = Generator::new(X64Backend::new()?)?;
//! let params = TransformParameters::new(1024, 8)?;
//! let mut plan = Plan::new(params, generator.required_capacity(1024, 8));
//!
//! let routine = generator.generate(&mut plan, 1024, 8, Direction::Forward)?;
//! let code = routine.code(plan.region());
//! ```
//!
//! Mapping the region executable and calling the routine is left to the
//! caller.
//!
//! # Architecture
//!
//! - [`core`] - Decomposition, templates, session and the generator
//! - [`x64`] - x86-64 encoder, SSE kernels and backend
//! - [`export`] - ELF object output

pub mod core;
pub mod export;
pub mod x64;

pub use core::{
    // Generation
    Backend, Generator, Routine, GenerateError, GenerateResult,
    // Plans
    Direction, Plan, TransformParameters, TransformPlan, CodeRegion,
    // Templates
    KernelLibrary, KernelTemplate, TemplateError,
    // Session management
    GenerationSession, SessionStats, SessionError,
};
pub use export::{write_elf, ExportError};
