//! Convolution kernels operating on caller-owned buffers.
//!
//! Kernels never allocate memory or spawn threads. Work is split into `thread_num`
//! contiguous partitions of the output; a kernel call processes the partition selected
//! by its `task_id`, so that disjoint partitions may be computed concurrently.

use std::ops::Range;

pub mod conv;
pub mod depthwise;
pub mod dw3x3;
pub mod gemm;

/// Returns the range of work units owned by the specified task when `units` are split
/// into `thread_num` contiguous partitions. Trailing tasks may get empty ranges.
pub fn task_range(units: usize, thread_num: usize, task_id: usize) -> Range<usize> {
    let per_task = units_per_task(units, thread_num);
    let start = task_id.saturating_mul(per_task).min(units);
    start..(start + per_task).min(units)
}

/// Maximum number of work units owned by a single task.
pub fn units_per_task(units: usize, thread_num: usize) -> usize {
    let thread_num = thread_num.max(1);
    (units + thread_num - 1) / thread_num
}
