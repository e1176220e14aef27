//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Glue-instruction encoding using iced-x86
//! - SSE kernel templates
//! - The [`X64Backend`] used by the generator
//! - Disassembly listings

pub mod backend;
pub mod disasm;
pub mod encoder;
pub mod kernels;

pub use backend::{RoutineTables, X64Backend};
pub use encoder::X64Encoder;
pub use crate::core::error::EncodingError;
