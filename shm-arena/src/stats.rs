use serde::Serialize;

use crate::Allocation;

/// Usage of an arena, computed from its allocation table alone.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArenaStats {
    /// The size of the whole segment, header included.
    pub total_size: usize,
    /// Sum of the sizes of all live allocations.
    pub allocated: usize,
    pub free: usize,
    pub allocation_count: usize,
    pub usage_percent: f64,
}

impl ArenaStats {
    pub fn compute<'lt>(
        total_size: usize,
        allocations: impl IntoIterator<Item = &'lt Allocation>,
    ) -> Self {
        let (allocation_count, allocated) = allocations
            .into_iter()
            .fold((0, 0), |(count, sum), allocation| {
                (count + 1, sum + allocation.size)
            });

        let usage_percent = if total_size == 0 {
            0.0
        } else {
            allocated as f64 / total_size as f64 * 100.0
        };

        ArenaStats {
            total_size,
            allocated,
            free: total_size.saturating_sub(allocated),
            allocation_count,
            usage_percent,
        }
    }
}
