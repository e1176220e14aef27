// This module defines the plan-side inputs of routine generation. TransformPlan is the narrow
// seam the generator sees: read-only TransformParameters (size, leaf size, leaf-pass iteration
// counts, lookup-table displacements) plus a writable code region, split so both can be held at
// once. TransformParameters::new computes the reference values for a power-of-two size;
// with_tables accepts externally computed ones. CodeRegion is an owned, 64-byte aligned byte
// region pre-filled with int3 so unwritten bytes trap, and Plan bundles parameters with a
// region. Direction selects between the compiled-in forward kernels and their sign-flipped
// inverse. The minimal size is four leaves: the leaf passes always run at least two blocks of
// 2 * leaf elements, so anything smaller would be written past its end.

//! Transform plans, parameters and code regions.

use thiserror::Error;

/// Largest supported transform size.
pub const MAX_TRANSFORM_SIZE: usize = 1 << 26;

/// Transform direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sign -1. Kernels run as compiled.
    Forward,
    /// Sign +1. Sign-flip sites are patched.
    Inverse,
}

impl Direction {
    /// Map a sign convention (negative means forward) to a direction.
    pub fn from_sign(sign: i32) -> Self {
        if sign < 0 {
            Direction::Forward
        } else {
            Direction::Inverse
        }
    }

    pub fn sign(self) -> i32 {
        match self {
            Direction::Forward => -1,
            Direction::Inverse => 1,
        }
    }

    pub fn is_inverse(self) -> bool {
        self == Direction::Inverse
    }
}

/// Error types for parameter construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Unsupported transform size {size} for leaf size {leaf}")]
    InvalidSize { size: usize, leaf: usize },

    #[error("Lookup table has {available} entries, {required} required")]
    LutTooShort { required: usize, available: usize },
}

/// Whether `size` can be generated with leaf size `leaf`.
pub fn is_supported(size: usize, leaf: usize) -> bool {
    size.is_power_of_two()
        && leaf.is_power_of_two()
        && leaf >= 2
        && size >= min_size(leaf)
        && size <= MAX_TRANSFORM_SIZE
}

/// Smallest transform the leaf passes cover exactly.
pub fn min_size(leaf: usize) -> usize {
    4 * leaf
}

/// Number of lookup-table levels a transform needs: `log2(size / leaf)`.
pub fn lut_levels(size: usize, leaf: usize) -> usize {
    (size / leaf).trailing_zeros() as usize
}

/// Iteration counts of the leaf passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationCounts {
    /// Iterations of the first even-even pass (`i0`).
    pub primary: usize,
    /// Iterations of the odd-odd and trailing even-even passes (`i1`).
    pub secondary: usize,
}

impl IterationCounts {
    /// Reference counts for a transform of `size` with leaf size `leaf`.
    ///
    /// For every supported size the passes built from these counts run
    /// `size / (2 * leaf)` blocks in total.
    pub fn for_size(size: usize, leaf: usize) -> Self {
        let leaves = size / leaf;
        let mut primary = leaves / 3 + 1;
        let mut secondary = leaves / 3;
        if leaves % 3 > 1 {
            secondary += 1;
        }

        primary /= 2;
        secondary /= 2;

        Self { primary, secondary }
    }
}

/// Read-only description of one transform, as seen by the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformParameters {
    size: usize,
    leaf: usize,
    iterations: IterationCounts,
    lut_table: Vec<usize>,
}

impl TransformParameters {
    /// Reference parameters for a power-of-two `size`.
    pub fn new(size: usize, leaf: usize) -> Result<Self, PlanError> {
        if !is_supported(size, leaf) {
            return Err(PlanError::InvalidSize { size, leaf });
        }

        Ok(Self {
            size,
            leaf,
            iterations: IterationCounts::for_size(size, leaf),
            lut_table: reference_lut_table(size, leaf),
        })
    }

    /// Parameters with externally computed iteration counts and table.
    ///
    /// The table is not length-checked here; generation rejects a table
    /// shorter than [`lut_levels`].
    pub fn with_tables(
        size: usize,
        leaf: usize,
        iterations: IterationCounts,
        lut_table: Vec<usize>,
    ) -> Result<Self, PlanError> {
        if !is_supported(size, leaf) {
            return Err(PlanError::InvalidSize { size, leaf });
        }

        Ok(Self {
            size,
            leaf,
            iterations,
            lut_table,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn leaf(&self) -> usize {
        self.leaf
    }

    pub fn iterations(&self) -> IterationCounts {
        self.iterations
    }

    /// Table start of every level, in complex elements.
    pub fn lut_table(&self) -> &[usize] {
        &self.lut_table
    }

    /// Check that the table covers every level of this transform.
    pub fn check_lut(&self) -> Result<(), PlanError> {
        let required = lut_levels(self.size, self.leaf);
        if self.lut_table.len() < required {
            return Err(PlanError::LutTooShort {
                required,
                available: self.lut_table.len(),
            });
        }
        Ok(())
    }

    /// Byte displacement into the twiddle table for a subtransform of
    /// `node_size`: `8 * table[log2(node_size / leaf) - 1]`.
    pub fn lut_displacement(&self, node_size: usize) -> Option<usize> {
        let level = lut_levels(node_size, self.leaf).checked_sub(1)?;
        self.lut_table.get(level).map(|&start| 8 * start)
    }
}

/// Cumulative per-level table starts. Level `i` covers subtransforms of
/// `2 * leaf << i`; the first level holds a quarter of that many twiddles and
/// later levels three quarters.
fn reference_lut_table(size: usize, leaf: usize) -> Vec<usize> {
    let levels = lut_levels(size, leaf);
    let mut table = Vec::with_capacity(levels);
    let mut start = 0;
    let mut n = 2 * leaf;

    for level in 0..levels {
        table.push(start);
        start += if level == 0 { n / 4 } else { 3 * n / 4 };
        n *= 2;
    }

    table
}

/// Owned byte region aligned to [`CodeRegion::ALIGNMENT`], filled with
/// [`CodeRegion::FILL`].
pub struct CodeRegion {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl CodeRegion {
    pub const ALIGNMENT: usize = 64;

    /// int3
    pub const FILL: u8 = 0xCC;

    pub fn new(len: usize) -> Self {
        let storage = vec![Self::FILL; len + Self::ALIGNMENT];
        let addr = storage.as_ptr() as usize;
        let start = (Self::ALIGNMENT - addr % Self::ALIGNMENT) % Self::ALIGNMENT;
        Self {
            storage,
            start,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("address", &format_args!("{:#x}", self.as_slice().as_ptr() as usize))
            .field("len", &self.len)
            .finish()
    }
}

/// What the generator needs from a plan.
pub trait TransformPlan {
    /// Parameters of the transform.
    fn parameters(&self) -> &TransformParameters;

    /// Parameters together with the writable destination region.
    fn split_mut(&mut self) -> (&TransformParameters, &mut [u8]);
}

/// Parameters plus an owned code region.
#[derive(Debug)]
pub struct Plan {
    parameters: TransformParameters,
    region: CodeRegion,
}

impl Plan {
    pub fn new(parameters: TransformParameters, capacity: usize) -> Self {
        Self {
            parameters,
            region: CodeRegion::new(capacity),
        }
    }

    pub fn region(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// The first `len` bytes of the region.
    pub fn code(&self, len: usize) -> &[u8] {
        &self.region.as_slice()[..len.min(self.region.len())]
    }
}

impl TransformPlan for Plan {
    fn parameters(&self) -> &TransformParameters {
        &self.parameters
    }

    fn split_mut(&mut self) -> (&TransformParameters, &mut [u8]) {
        (&self.parameters, self.region.as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_sizes() {
        assert!(is_supported(32, 8));
        assert!(is_supported(8, 2));
        assert!(is_supported(1 << 26, 8));
        assert!(!is_supported(16, 8));
        assert!(!is_supported(8, 8));
        assert!(!is_supported(24, 8));
        assert!(!is_supported(16, 1));
        assert!(!is_supported(1 << 27, 8));
    }

    #[test]
    fn test_reference_iteration_counts() {
        assert_eq!(IterationCounts::for_size(32, 8), IterationCounts { primary: 1, secondary: 0 });
        assert_eq!(IterationCounts::for_size(64, 8), IterationCounts { primary: 1, secondary: 1 });
        assert_eq!(IterationCounts::for_size(128, 8), IterationCounts { primary: 3, secondary: 2 });
    }

    #[test]
    fn test_reference_lut_table() {
        let params = TransformParameters::new(128, 8).unwrap();
        // levels for 16, 32, 64, 128
        assert_eq!(params.lut_table(), &[0, 4, 28, 76]);
        assert_eq!(params.lut_displacement(16), Some(0));
        assert_eq!(params.lut_displacement(32), Some(32));
        assert_eq!(params.lut_displacement(128), Some(8 * 76));
        assert_eq!(params.lut_displacement(8), None);
        assert!(params.check_lut().is_ok());
    }

    #[test]
    fn test_short_lut_is_rejected() {
        let params =
            TransformParameters::with_tables(64, 8, IterationCounts::default(), vec![0]).unwrap();
        assert_eq!(
            params.check_lut(),
            Err(PlanError::LutTooShort { required: 3, available: 1 })
        );
    }

    #[test]
    fn test_invalid_size_rejected() {
        assert_eq!(
            TransformParameters::new(100, 8),
            Err(PlanError::InvalidSize { size: 100, leaf: 8 })
        );
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::from_sign(-1), Direction::Forward);
        assert_eq!(Direction::from_sign(1), Direction::Inverse);
        assert_eq!(Direction::Inverse.sign(), 1);
        assert!(Direction::Inverse.is_inverse());
    }

    #[test]
    fn test_minimal_size_is_rejected_below_four_leaves() {
        assert_eq!(
            TransformParameters::new(16, 8),
            Err(PlanError::InvalidSize { size: 16, leaf: 8 })
        );
        assert_eq!(TransformParameters::new(min_size(8), 8).unwrap().size(), 32);
    }

    #[test]
    fn test_code_region_alignment() {
        for len in [0usize, 1, 100, 4096] {
            let region = CodeRegion::new(len);
            assert_eq!(region.len(), len);
            assert_eq!(region.as_slice().as_ptr() as usize % CodeRegion::ALIGNMENT, 0);
            assert!(region.as_slice().iter().all(|&b| b == CodeRegion::FILL));
        }
    }

    #[test]
    fn test_plan_split() {
        let mut plan = Plan::new(TransformParameters::new(64, 8).unwrap(), 32);
        let (params, region) = plan.split_mut();
        region[0] = 0x90;
        assert_eq!(params.size(), 64);
        assert_eq!(plan.code(1), &[0x90]);
        assert_eq!(plan.region().len(), 32);
    }
}
