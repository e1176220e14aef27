// This module defines the error types for routine generation using the thiserror crate.
// GenerateError is the top-level enum returned by Generator::generate: precondition failures
// (unsupported size, a plan that disagrees with the requested size, a destination region that
// cannot hold the worst-case routine) are all reported before the first byte is written, and
// resource exhaustion of the scratch arena surfaces through the wrapped SessionError. The
// remaining variants (buffer overflow, template inconsistency, encoding failure) indicate an
// internal defect once writing has started, because the code buffer has no rollback.
// EncodingError is shared by every backend; the x86-64 one maps iced-x86 failures into it.

//! Error types for routine generation.

use thiserror::Error;

use super::code_buffer::CodeBufferError;
use super::session::SessionError;
use super::template::TemplateError;

/// Failure reported by a backend while encoding a primitive or assembling a template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The register role has no mapping for the requested operand width.
    #[error("Invalid register for operation")]
    InvalidRegister,

    /// Immediate does not fit the instruction form.
    #[error("Immediate {value} out of range for {operation}")]
    ImmediateOutOfRange { operation: &'static str, value: i64 },

    /// Assembly error from the underlying assembler.
    #[error("Assembly error: {0}")]
    Assembly(String),
}

/// Main error type for routine generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("Unsupported transform size {size} for leaf size {leaf}")]
    InvalidSize { size: usize, leaf: usize },

    #[error("Plan mismatch: {reason}")]
    PlanMismatch { reason: String },

    #[error("Code region too small: {required} bytes required, {available} available")]
    RegionTooSmall { required: usize, available: usize },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Buffer(#[from] CodeBufferError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

/// Result type alias for generation operations.
pub type GenerateResult<T> = Result<T, GenerateError>;
