// This module provides arena-based scratch storage for routine generation using the bumpalo
// crate. GenerationSession owns the Bump arena that holds the temporary decomposition node list
// of one generate call; the generator resets it before returning, so nothing allocated during a
// generation outlives that call regardless of outcome. An optional allocation limit caps the
// arena, which is how callers (and tests) bound memory use and simulate exhaustion: a refused
// allocation surfaces as SessionError::AllocationFailed before any code has been written.
// SessionStats accumulates metrics across generations (routines produced, bytes emitted, call
// sites, register updates emitted versus elided by delta encoding, largest routine) and renders
// them through Display for the CLI.

//! Arena-based generation session.
//!
//! Scratch memory for one generation at a time, plus statistics that persist
//! across generations.

use bumpalo::Bump;
use std::alloc::Layout;
use std::fmt;
use thiserror::Error;

use super::decompose::DecompositionNode;

/// Scratch arena and statistics for a generator.
pub struct GenerationSession {
    /// Arena for temporary decomposition storage.
    arena: Bump,

    /// Statistics across all generations run through this session.
    stats: SessionStats,
}

impl GenerationSession {
    /// Create an unlimited session.
    pub fn new() -> Self {
        Self {
            arena: Bump::new(),
            stats: SessionStats::default(),
        }
    }

    /// Create a session whose arena refuses to grow beyond `limit` bytes.
    pub fn with_memory_limit(limit: usize) -> Self {
        let arena = Bump::new();
        arena.set_allocation_limit(Some(limit));
        Self {
            arena,
            stats: SessionStats::default(),
        }
    }

    /// Current arena limit, if any.
    pub fn memory_limit(&self) -> Option<usize> {
        self.arena.allocation_limit()
    }

    /// Bytes currently held by the arena.
    pub fn memory_used(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Allocate `count` nodes, each initialized to the sentinel.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc_nodes(&self, count: usize) -> Result<&mut [DecompositionNode], SessionError> {
        let failed = || SessionError::AllocationFailed {
            nodes: count,
            bytes: count.saturating_mul(std::mem::size_of::<DecompositionNode>()),
        };

        let layout = Layout::array::<DecompositionNode>(count).map_err(|_| failed())?;
        let ptr = self
            .arena
            .try_alloc_layout(layout)
            .map_err(|_| failed())?
            .cast::<DecompositionNode>();

        // SAFETY: the layout covers exactly `count` nodes, every slot is
        // written before the slice is formed, and the arena keeps the memory
        // alive for as long as `self` is borrowed.
        unsafe {
            for i in 0..count {
                ptr.as_ptr().add(i).write(DecompositionNode::SENTINEL);
            }
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), count))
        }
    }

    /// Release all scratch allocations. Statistics are kept.
    pub fn reset(&mut self) {
        self.arena.reset();
    }

    /// Record a finished routine.
    pub fn record_routine(&mut self, size: usize, code_len: usize) {
        let stats = &mut self.stats;
        stats.routines_generated += 1;
        stats.total_code_size += code_len;

        if stats.largest_routine_size < code_len {
            stats.largest_routine_size = code_len;
            stats.largest_transform = size;
        }
    }

    /// Record the call-chain summary of a routine.
    pub fn record_call_chain(&mut self, call_sites: usize, emitted: usize, elided: usize) {
        self.stats.call_sites += call_sites;
        self.stats.register_updates += emitted;
        self.stats.updates_elided += elided;
    }

    /// Record a generation that failed.
    pub fn record_failure(&mut self) {
        self.stats.failures += 1;
    }

    /// Get generation statistics.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

impl Default for GenerationSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Generation session statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of routines generated.
    pub routines_generated: usize,

    /// Number of generate calls that returned an error.
    pub failures: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    /// Subtransform call sites emitted.
    pub call_sites: usize,

    /// Offset, shift and table updates emitted between call sites.
    pub register_updates: usize,

    /// Updates skipped because the value did not change.
    pub updates_elided: usize,

    /// Largest routine generated (bytes).
    pub largest_routine_size: usize,

    /// Transform size of the largest routine.
    pub largest_transform: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Generation Session Statistics:")?;
        writeln!(f, "  Routines generated: {}", self.routines_generated)?;
        writeln!(f, "  Failures: {}", self.failures)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Call sites: {}", self.call_sites)?;
        writeln!(f, "  Register updates: {}", self.register_updates)?;
        writeln!(f, "  Updates elided: {}", self.updates_elided)?;

        if self.largest_routine_size > 0 {
            writeln!(
                f,
                "  Largest routine: N={} ({} bytes)",
                self.largest_transform, self.largest_routine_size
            )?;
        }

        Ok(())
    }
}

/// Error types for session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The arena refused the decomposition storage.
    #[error("Scratch allocation of {nodes} nodes ({bytes} bytes) failed")]
    AllocationFailed { nodes: usize, bytes: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = GenerationSession::new();
        let stats = session.stats();
        assert_eq!(stats.routines_generated, 0);
        assert_eq!(stats.total_code_size, 0);
        assert_eq!(session.memory_limit(), None);
    }

    #[test]
    fn test_node_allocation() {
        let session = GenerationSession::new();
        let nodes = session.alloc_nodes(5).unwrap();
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(DecompositionNode::is_sentinel));
        nodes[2] = DecompositionNode::new(16, 4);
        assert_eq!(nodes[2].size, 16);
        assert!(session.memory_used() > 0);
    }

    #[test]
    fn test_memory_limit_refuses_allocation() {
        let session = GenerationSession::with_memory_limit(0);
        assert_eq!(session.memory_limit(), Some(0));
        let err = session.alloc_nodes(3).unwrap_err();
        assert_eq!(
            err,
            SessionError::AllocationFailed {
                nodes: 3,
                bytes: 3 * std::mem::size_of::<DecompositionNode>(),
            }
        );
    }

    #[test]
    fn test_reset_keeps_statistics() {
        let mut session = GenerationSession::new();
        session.alloc_nodes(64).unwrap();
        session.record_routine(64, 512);
        session.reset();
        assert_eq!(session.stats().routines_generated, 1);
        assert!(session.alloc_nodes(64).is_ok());
    }

    #[test]
    fn test_session_statistics() {
        let mut session = GenerationSession::new();
        session.record_routine(64, 300);
        session.record_routine(1024, 900);
        session.record_call_chain(4, 7, 5);
        session.record_failure();

        let stats = session.stats();
        assert_eq!(stats.routines_generated, 2);
        assert_eq!(stats.total_code_size, 1200);
        assert_eq!(stats.largest_transform, 1024);
        assert_eq!(stats.call_sites, 4);
        assert_eq!(stats.register_updates, 7);
        assert_eq!(stats.updates_elided, 5);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_statistics_display() {
        let mut session = GenerationSession::new();
        session.record_routine(256, 640);
        session.record_call_chain(10, 12, 18);

        let output = format!("{}", session.stats());
        assert!(output.contains("Routines generated: 1"));
        assert!(output.contains("Call sites: 10"));
        assert!(output.contains("N=256 (640 bytes)"));
    }
}
