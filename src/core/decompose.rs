//! Split-radix decomposition of a transform size.
//!
//! A transform of size `N` above the leaf size is split into one quarter, two
//! eighths and two more quarters. Applying that split recursively and listing
//! every internal node after its five children yields the post-order list the
//! call chain is generated from. Leaves (sizes at or below the leaf size)
//! contribute no node: they are covered by the leaf passes.
//!
//! [`count`] and [`decompose`] walk the identical recursion through
//! [`children`], so a buffer sized by `count` is filled exactly by
//! `decompose`.

use super::session::{GenerationSession, SessionError};

/// One internal node of the recursion tree.
///
/// `offset` is measured in complex elements from the start of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecompositionNode {
    pub size: usize,
    pub offset: usize,
}

impl DecompositionNode {
    /// Terminator appended after the last real node.
    pub const SENTINEL: Self = Self { size: 0, offset: 0 };

    pub const fn new(size: usize, offset: usize) -> Self {
        Self { size, offset }
    }

    pub fn is_sentinel(&self) -> bool {
        self.size == 0
    }
}

/// The five structural children of a node of size `n` at `offset`, in
/// traversal order.
pub fn children(n: usize, offset: usize) -> [(usize, usize); 5] {
    [
        (n / 4, offset),
        (n / 8, offset + n / 4),
        (n / 8, offset + n / 4 + n / 8),
        (n / 4, offset + n / 2),
        (n / 4, offset + 3 * n / 4),
    ]
}

/// Number of internal nodes produced for size `n` (sentinel excluded).
pub fn count(n: usize, leaf: usize) -> usize {
    if n <= leaf {
        return 0;
    }

    1 + children(n, 0)
        .iter()
        .map(|&(size, _)| count(size, leaf))
        .sum::<usize>()
}

/// Append the post-order nodes for `n` at `offset` into `out`, starting at
/// `*cursor`. Returns the number of nodes written by this call.
///
/// # Panics
///
/// Panics if `out` is shorter than [`count`] requires; the buffer is always
/// sized from `count`, so this only fires on a broken invariant.
pub fn decompose(
    n: usize,
    leaf: usize,
    offset: usize,
    out: &mut [DecompositionNode],
    cursor: &mut usize,
) -> usize {
    if n <= leaf {
        return 0;
    }

    let start = *cursor;
    for (size, child_offset) in children(n, offset) {
        decompose(size, leaf, child_offset, out, cursor);
    }

    out[*cursor] = DecompositionNode::new(n, offset);
    *cursor += 1;

    *cursor - start
}

/// Heap-allocated post-order list without the sentinel.
pub fn elaborate(n: usize, leaf: usize) -> Vec<DecompositionNode> {
    let mut nodes = vec![DecompositionNode::SENTINEL; count(n, leaf)];
    let mut cursor = 0;
    decompose(n, leaf, 0, &mut nodes, &mut cursor);
    nodes
}

/// Sentinel-terminated decomposition living in a session arena.
#[derive(Debug, Clone, Copy)]
pub struct Decomposition<'arena> {
    nodes: &'arena [DecompositionNode],
}

impl<'arena> Decomposition<'arena> {
    /// Size the node list with [`count`], allocate it from the session and
    /// fill it. Fails without side effects if the arena refuses the
    /// allocation.
    pub fn build(
        session: &'arena GenerationSession,
        n: usize,
        leaf: usize,
    ) -> Result<Self, SessionError> {
        let internal = count(n, leaf);
        let nodes = session.alloc_nodes(internal + 1)?;

        let mut cursor = 0;
        let written = decompose(n, leaf, 0, nodes, &mut cursor);
        debug_assert_eq!(written, internal);
        nodes[internal] = DecompositionNode::SENTINEL;

        Ok(Self { nodes })
    }

    /// All nodes including the trailing sentinel.
    pub fn nodes(&self) -> &'arena [DecompositionNode] {
        self.nodes
    }

    /// Nodes before the sentinel.
    pub fn internal(&self) -> &'arena [DecompositionNode] {
        &self.nodes[..self.nodes.len() - 1]
    }

    /// Number of internal nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
