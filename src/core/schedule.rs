//! Leaf-pass schedule.
//!
//! Which leaf passes run, in which order, with which offset table, is fully
//! determined by two bits: the parity of `log2(N)` and whether the secondary
//! iteration count is nonzero. The loop bound starts at `4 * i0` and grows
//! as passes are appended; passes that loop get the bound reloaded first.

use super::plan::IterationCounts;
use super::template::LeafVariant;

/// Ordering of the eight input offsets patched into a leaf pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetOrder {
    Primary,
    /// Last four entries rotated by two.
    Rotated,
    /// Used by the closing even-even pass.
    Trailing,
}

impl OffsetOrder {
    /// Offsets in elements for a transform of size `n`.
    pub fn elements(self, n: usize) -> [usize; 8] {
        match self {
            OffsetOrder::Primary => [0, n, n / 2, 3 * n / 2, n / 4, 5 * n / 4, 7 * n / 4, 3 * n / 4],
            OffsetOrder::Rotated => [0, n, n / 2, 3 * n / 2, 7 * n / 4, 3 * n / 4, n / 4, 5 * n / 4],
            OffsetOrder::Trailing => [7 * n / 4, 3 * n / 4, n / 4, 5 * n / 4, 0, n, 3 * n / 2, n / 2],
        }
    }

    /// Values written into the patch sites: `4 * element`.
    pub fn patch_values(self, n: usize) -> [u32; 8] {
        self.elements(n).map(|element| (4 * element) as u32)
    }
}

/// One leaf pass to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafStep {
    pub variant: LeafVariant,
    pub order: OffsetOrder,
    /// Loop bound to load before the pass, if it loops.
    pub counter_reload: Option<u32>,
    /// Whether the loop head is aligned to the fetch boundary.
    pub aligned: bool,
}

/// The full leaf-pass sequence of one routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSchedule {
    /// Loop bound loaded right after the prologue.
    pub initial_count: u32,
    pub steps: Vec<LeafStep>,
    /// Loop bound after the last pass.
    pub final_count: u32,
}

/// Whether `log2(n)` is odd.
pub fn is_odd_size(n: usize) -> bool {
    n.trailing_zeros() & 1 == 1
}

/// Build the leaf schedule for a transform of size `n`.
pub fn leaf_schedule(n: usize, iterations: IterationCounts) -> LeafSchedule {
    let initial_count = 4 * iterations.primary as u32;
    let secondary = 4 * iterations.secondary as u32;
    let mut count = initial_count;
    let mut steps = Vec::with_capacity(4);

    steps.push(LeafStep {
        variant: LeafVariant::EvenEven,
        order: OffsetOrder::Primary,
        counter_reload: None,
        aligned: true,
    });

    let odd_odd = |count: &mut u32| {
        *count += secondary;
        LeafStep {
            variant: LeafVariant::OddOdd,
            order: OffsetOrder::Rotated,
            counter_reload: Some(*count),
            aligned: true,
        }
    };

    if is_odd_size(n) {
        if secondary != 0 {
            steps.push(odd_odd(&mut count));
        }
        count += 4;
        steps.push(LeafStep {
            variant: LeafVariant::OddEven,
            order: OffsetOrder::Rotated,
            counter_reload: None,
            aligned: false,
        });
    } else {
        count += 4;
        steps.push(LeafStep {
            variant: LeafVariant::EvenOdd,
            order: OffsetOrder::Primary,
            counter_reload: None,
            aligned: false,
        });
        if secondary != 0 {
            steps.push(odd_odd(&mut count));
        }
    }

    if secondary != 0 {
        count += secondary;
        steps.push(LeafStep {
            variant: LeafVariant::EvenEven,
            order: OffsetOrder::Trailing,
            counter_reload: Some(count),
            aligned: true,
        });
    }

    LeafSchedule {
        initial_count,
        steps,
        final_count: count,
    }
}
