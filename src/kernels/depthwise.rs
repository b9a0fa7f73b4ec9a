//! Depthwise convolution driven by a [`SlidingWindow`].
//!
//! Signal and output use the channel-aligned NHWC layout, in which every pixel holds
//! `sliding.ic_align` values. Weights are grouped into blocks of `sliding.block_channel`
//! channels (`[c_block][kernel_h][kernel_w][block_channel]`) with filter zero points already
//! subtracted, as produced by [`pack_depthwise_weights()`](crate::packing::pack_depthwise_weights).

use std::ops::Range;

use super::task_range;
use crate::{packing, params::ConvDescriptor, sliding::SlidingWindow};

/// Length of the packed weight buffer for the specified descriptor.
pub fn packed_weight_len(desc: &ConvDescriptor) -> usize {
    packing::depthwise_weight_len(desc.output.channels, desc.kernel_plane())
}

/// Per-channel zero points of the signal and the output.
#[derive(Debug, Clone, Copy)]
struct ZeroPoints<'a> {
    input: &'a [i8],
    output: &'a [i32],
}

/// Computes the output rows owned by `task_id`.
///
/// Rows are numbered across the whole batch. Output channels beyond `desc.output.channels`
/// (i.e., alignment padding) are left untouched.
///
/// # Panics
///
/// Panics if buffers are smaller than required by `desc` and `sliding`, or if zero point
/// slices have fewer than `desc.output.channels` entries.
#[allow(clippy::too_many_arguments)]
pub fn conv_dw_int8_sw(
    output: &mut [i8],
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    input_zp: &[i8],
    output_zp: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
    task_id: usize,
) {
    let total_rows = desc.output.batch_size * desc.output.height;
    let rows = task_range(total_rows, desc.thread_num, task_id);
    let output = &mut output[rows.start * sliding.out_h_step..rows.end * sliding.out_h_step];
    let zero_points = ZeroPoints {
        input: input_zp,
        output: output_zp,
    };
    sliding_rows(output, rows, input, weight, bias, zero_points, desc, sliding);
}

/// Same as [`conv_dw_int8_sw()`], but processing `output` holding exactly the global
/// output `rows`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn conv_dw_int8_sw_rows(
    output: &mut [i8],
    rows: Range<usize>,
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    input_zp: &[i8],
    output_zp: &[i32],
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let zero_points = ZeroPoints {
        input: input_zp,
        output: output_zp,
    };
    sliding_rows(output, rows, input, weight, bias, zero_points, desc, sliding);
}

#[allow(clippy::too_many_arguments)]
fn sliding_rows(
    output: &mut [i8],
    rows: Range<usize>,
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    zero_points: ZeroPoints<'_>,
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    debug_assert!(desc.is_depthwise());
    debug_assert!(zero_points.input.len() >= desc.output.channels);
    debug_assert!(zero_points.output.len() >= desc.output.channels);

    // Interior windows never start in padding, so the subtraction cannot underflow.
    let pad_offset = desc.pad_top() * sliding.in_h_step + desc.pad_left() * sliding.ic_align;
    for (local_row, row) in rows.enumerate() {
        let (batch, oh) = (row / desc.output.height, row % desc.output.height);
        let out_row = &mut output[local_row * sliding.out_h_step..][..sliding.out_h_step];
        let input = &input[batch * sliding.in_step..][..sliding.in_step];

        for ow in 0..desc.output.width {
            let out = &mut out_row[ow * sliding.out_w_step..][..sliding.ic_align];
            if sliding.is_interior(oh, ow) {
                let start = oh * sliding.in_sh_step + ow * sliding.in_sw_step - pad_offset;
                center_pixel(out, &input[start..], weight, bias, zero_points, desc, sliding);
            } else {
                border_pixel(out, input, [oh, ow], weight, bias, zero_points, desc, sliding);
            }
        }
    }
}

/// Computes a pixel whose receptive field is inside the signal; `input` starts at
/// the top-left tap of the window.
fn center_pixel(
    out: &mut [i8],
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    zero_points: ZeroPoints<'_>,
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let [kernel_h, kernel_w] = desc.kernel;
    let block = sliding.block_channel;
    let channels = desc.output.channels;

    for c_block in 0..sliding.c_block {
        let weight = &weight[c_block * sliding.kernel_step..][..sliding.kernel_step];
        let offset = c_block * sliding.out_c_step;
        for ci in 0..block.min(channels.saturating_sub(offset)) {
            let channel = offset + ci;
            let zero_point = i32::from(zero_points.input[channel]);
            let mut acc = bias[channel];
            for kh in 0..kernel_h {
                let row = kh * sliding.in_kh_step + channel;
                for kw in 0..kernel_w {
                    let x = i32::from(input[row + kw * sliding.in_kw_step]);
                    let w = i32::from(weight[(kh * kernel_w + kw) * block + ci]);
                    acc += (x - zero_point) * w;
                }
            }
            out[channel] =
                desc.quant
                    .requantize_with_zero_point(acc, channel, zero_points.output[channel]);
        }
    }
}

/// Computes a pixel touching the padding; out-of-bounds taps are skipped.
#[allow(clippy::too_many_arguments)]
fn border_pixel(
    out: &mut [i8],
    input: &[i8],
    [oh, ow]: [usize; 2],
    weight: &[i16],
    bias: &[i32],
    zero_points: ZeroPoints<'_>,
    desc: &ConvDescriptor,
    sliding: &SlidingWindow,
) {
    let [kernel_h, kernel_w] = desc.kernel;
    let [stride_h, stride_w] = desc.params.strides;
    let [dilation_h, dilation_w] = desc.params.dilation;
    let block = sliding.block_channel;
    let channels = desc.output.channels;

    for c_block in 0..sliding.c_block {
        let weight = &weight[c_block * sliding.kernel_step..][..sliding.kernel_step];
        let offset = c_block * sliding.out_c_step;
        for ci in 0..block.min(channels.saturating_sub(offset)) {
            let channel = offset + ci;
            let zero_point = i32::from(zero_points.input[channel]);
            let mut acc = bias[channel];
            for kh in 0..kernel_h {
                // Negative coordinates wrap around and fail the bounds check.
                let ih = (oh * stride_h + kh * dilation_h).wrapping_sub(desc.pad_top());
                if ih >= desc.input.height {
                    continue;
                }
                for kw in 0..kernel_w {
                    let iw = (ow * stride_w + kw * dilation_w).wrapping_sub(desc.pad_left());
                    if iw >= desc.input.width {
                        continue;
                    }
                    let x = i32::from(input[ih * sliding.in_h_step + iw * sliding.ic_align + channel]);
                    let w = i32::from(weight[(kh * kernel_w + kw) * block + ci]);
                    acc += (x - zero_point) * w;
                }
            }
            out[channel] =
                desc.quant
                    .requantize_with_zero_point(acc, channel, zero_points.output[channel]);
        }
    }
}
