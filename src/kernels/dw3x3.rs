//! Depthwise 3x3 convolution.
//!
//! The interior of the output (pixels whose receptive field lies inside the unpadded signal)
//! is computed in blocks: for each output row, up to [`block_out_width()`] columns and
//! [`CHANNEL_BLOCK`] channels of the 3 contributing signal rows are gathered into a scratch
//! buffer and convolved from there. Pixels touching the padding are computed by
//! [`conv_dw_3x3_pad()`].
//!
//! Weights use the `[3][3][channels]` layout produced by
//! [`pack_dw3x3_weights()`](crate::packing::pack_dw3x3_weights) and have filter zero points
//! already subtracted. The channel count must be a multiple of 8; supported strides are 1 and 2,
//! dilation must be 1.

use std::ops::Range;

use super::task_range;
use crate::{params::ConvDescriptor, sliding::SlidingWindow};

/// Number of channels processed in a single pass over a block.
pub const CHANNEL_BLOCK: usize = 64;
const KERNEL: usize = 3;

/// Number of output columns processed per block.
pub fn block_out_width(stride: usize) -> usize {
    if stride == 1 {
        30
    } else {
        29
    }
}

/// Width of the signal rows gathered per block.
pub fn block_input_width(stride: usize) -> usize {
    stride * (block_out_width(stride) - 1) + KERNEL
}

/// Minimal length of the scratch buffer passed to [`conv_dw_3x3()`].
pub fn scratch_len(stride: usize) -> usize {
    KERNEL * block_input_width(stride) * CHANNEL_BLOCK
}

fn input_zero_point(desc: &ConvDescriptor) -> i32 {
    desc.quant.input.zero_point
}

/// Computes the interior part of the output rows owned by `task_id`.
///
/// Rows are numbered across the whole batch, i.e., there are `batch_size * output.height`
/// rows split among `desc.thread_num` tasks.
///
/// # Panics
///
/// Panics if buffers are smaller than required by `desc`, or if `scratch` is shorter
/// than [`scratch_len()`].
#[allow(clippy::too_many_arguments)]
pub fn conv_dw_3x3(
    output: &mut [i8],
    scratch: &mut [i8],
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
    task_id: usize,
) {
    let total_rows = desc.output.batch_size * desc.output.height;
    let rows = task_range(total_rows, desc.thread_num, task_id);
    let row_len = desc.output.width * desc.output.channels;
    let output = &mut output[rows.start * row_len..rows.end * row_len];
    interior_rows(output, rows, scratch, input, weight, bias, desc, sliding);
}

/// Computes every output pixel outside the interior rectangle of `sliding`, across all
/// batch samples. Taps falling into the padding are skipped.
///
/// With an empty interior rectangle this computes the complete convolution.
pub fn conv_dw_3x3_pad(
    output: &mut [i8],
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let total_rows = desc.output.batch_size * desc.output.height;
    let row_len = desc.output.width * desc.output.channels;
    border_rows(
        &mut output[..total_rows * row_len],
        0..total_rows,
        input,
        weight,
        bias,
        desc,
        sliding,
    );
}

/// Interior computation over `output` holding exactly the global output `rows`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn interior_rows(
    output: &mut [i8],
    rows: Range<usize>,
    scratch: &mut [i8],
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let channels = desc.output.channels;
    let stride = desc.params.strides[0];
    debug_assert!(desc.is_depthwise());
    debug_assert_eq!(channels % 8, 0);
    debug_assert!(stride == 1 || stride == 2);
    debug_assert_eq!(desc.params.strides[1], stride);
    debug_assert_eq!(desc.params.dilation, [1, 1]);
    debug_assert!(scratch.len() >= scratch_len(stride));

    if !sliding.has_interior() {
        return;
    }
    let (in_h, in_w) = (desc.input.height, desc.input.width);
    let out_w = desc.output.width;
    let block_w = block_out_width(stride);
    let input_zp = input_zero_point(desc);

    for (local_row, row) in rows.enumerate() {
        let (batch, oh) = (row / desc.output.height, row % desc.output.height);
        if oh < sliding.top || oh >= sliding.bottom {
            continue;
        }
        let ih = oh * stride - desc.pad_top();
        let out_row = &mut output[local_row * out_w * channels..(local_row + 1) * out_w * channels];

        let mut ow = sliding.left;
        while ow < sliding.right {
            let width = block_w.min(sliding.right - ow);
            let input_width = stride * (width - 1) + KERNEL;
            let iw = ow * stride - desc.pad_left();

            for c_start in (0..channels).step_by(CHANNEL_BLOCK) {
                let c_len = CHANNEL_BLOCK.min(channels - c_start);

                for kh in 0..KERNEL {
                    for j in 0..input_width {
                        let src = ((batch * in_h + ih + kh) * in_w + iw + j) * channels + c_start;
                        let dst = (kh * input_width + j) * CHANNEL_BLOCK;
                        scratch[dst..dst + c_len].copy_from_slice(&input[src..src + c_len]);
                    }
                }

                for i in 0..width {
                    let out = &mut out_row[(ow + i) * channels + c_start..][..c_len];
                    for (c, out) in out.iter_mut().enumerate() {
                        let channel = c_start + c;
                        let mut acc = bias[channel];
                        for kh in 0..KERNEL {
                            for kw in 0..KERNEL {
                                let x = scratch[(kh * input_width + i * stride + kw) * CHANNEL_BLOCK + c];
                                let w = weight[(kh * KERNEL + kw) * channels + channel];
                                acc += (i32::from(x) - input_zp) * i32::from(w);
                            }
                        }
                        *out = desc.quant.requantize(acc, channel);
                    }
                }
            }
            ow += width;
        }
    }
}

/// Border computation over `output` holding exactly the global output `rows`.
pub(crate) fn border_rows(
    output: &mut [i8],
    rows: Range<usize>,
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let channels = desc.output.channels;
    let out_w = desc.output.width;
    let [stride_h, stride_w] = desc.params.strides;
    let (in_h, in_w) = (desc.input.height, desc.input.width);
    let input_zp = input_zero_point(desc);

    for (local_row, row) in rows.enumerate() {
        let (batch, oh) = (row / desc.output.height, row % desc.output.height);
        for ow in 0..out_w {
            if sliding.is_interior(oh, ow) {
                continue;
            }
            let out = &mut output[(local_row * out_w + ow) * channels..][..channels];
            for (channel, out) in out.iter_mut().enumerate() {
                let mut acc = bias[channel];
                for kh in 0..KERNEL {
                    let ih = (oh * stride_h + kh).wrapping_sub(desc.pad_top());
                    if ih >= in_h {
                        continue;
                    }
                    for kw in 0..KERNEL {
                        let iw = (ow * stride_w + kw).wrapping_sub(desc.pad_left());
                        if iw >= in_w {
                            continue;
                        }
                        let x = input[((batch * in_h + ih) * in_w + iw) * channels + channel];
                        let w = weight[(kh * KERNEL + kw) * channels + channel];
                        acc += (i32::from(x) - input_zp) * i32::from(w);
                    }
                }
                *out = desc.quant.requantize(acc, channel);
            }
        }
    }
}
