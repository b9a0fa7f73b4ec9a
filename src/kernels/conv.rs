//! General convolution through im2col and packed `i8` matrix multiplication.
//!
//! Output pixels of every batch sample are split into tiles of `desc.tile_num` pixels.
//! For each tile, receptive fields are gathered into `matmul_input` (im2col), packed into
//! `packed_input` together with input sums, and multiplied by packed weights. Accumulators
//! are corrected for zero points as `sum(x * w) - input_sum + bias`, where `bias` must be
//! prepared by [`fold_zero_points_into_bias()`](crate::packing::fold_zero_points_into_bias).
//!
//! The kernel treats the descriptor as a single group: for grouped convolutions, the caller
//! prepares a descriptor, weights and signal per group.

use std::ops::Range;

use super::{gemm::MatmulKernel, gemm::MatmulTile, task_range};
use crate::{
    packing::{im2col, pack_input, GemmLayout},
    params::ConvDescriptor,
};

/// Matrix multiplication path.
#[derive(Debug, Clone, Copy)]
pub enum GemmPath<'a> {
    /// Plain inner products over the reference layout.
    Reference,
    /// Tiled multiplication by the specified kernel over the blocked layout.
    Optimized(&'a dyn MatmulKernel),
}

impl GemmPath<'_> {
    /// Checks whether this path uses the blocked layout.
    pub fn is_optimized(&self) -> bool {
        matches!(self, Self::Optimized(_))
    }

    /// Buffer layout used by this path.
    pub fn layout(&self, desc: &ConvDescriptor) -> GemmLayout {
        GemmLayout::new(desc, self.is_optimized())
    }
}

/// Per-task scratch buffers.
#[derive(Debug)]
pub(crate) struct Scratch<'a> {
    pub packed_input: &'a mut [i8],
    pub matmul_input: &'a mut [i8],
    pub input_sum: &'a mut [i32],
}

/// Total number of tiles over all batch samples.
pub fn tile_count(desc: &ConvDescriptor) -> usize {
    desc.output.batch_size * tiles_per_sample(desc)
}

fn tiles_per_sample(desc: &ConvDescriptor) -> usize {
    let pixels = desc.output.height * desc.output.width;
    (pixels + desc.tile_num - 1) / desc.tile_num
}

/// Computes the tiles owned by `task_id`.
///
/// Scratch buffers hold `desc.thread_num` slots, each sized according to
/// [`GemmLayout`]; the task uses the slot with its index. `packed_weight` and `bias`
/// must follow the layout of `path`.
///
/// # Panics
///
/// Panics if buffers are smaller than required.
#[allow(clippy::too_many_arguments)]
pub fn conv_int8(
    input: &[i8],
    packed_input: &mut [i8],
    matmul_input: &mut [i8],
    packed_weight: &[i8],
    bias: &[i32],
    output: &mut [i8],
    input_sum: &mut [i32],
    task_id: usize,
    desc: &ConvDescriptor,
    path: GemmPath<'_>,
) {
    let layout = path.layout(desc);
    let slot = |len: usize| task_id * len..(task_id + 1) * len;
    let scratch = Scratch {
        packed_input: &mut packed_input[slot(layout.packed_input_len())],
        matmul_input: &mut matmul_input[slot(layout.matmul_input_len())],
        input_sum: &mut input_sum[slot(layout.input_sum_len())],
    };
    let tiles = task_range(tile_count(desc), desc.thread_num, task_id);
    conv_tiles(input, scratch, packed_weight, bias, output, 0, tiles, desc, path);
}

/// Computes the specified `tiles`. `output` is a part of the output tensor starting
/// at the element `output_offset`, which must contain all outputs of the tiles.
#[allow(clippy::too_many_arguments)]
pub(crate) fn conv_tiles(
    input: &[i8],
    scratch: Scratch<'_>,
    packed_weight: &[i8],
    bias: &[i32],
    output: &mut [i8],
    output_offset: usize,
    tiles: Range<usize>,
    desc: &ConvDescriptor,
    path: GemmPath<'_>,
) {
    let layout = path.layout(desc);
    let per_sample = tiles_per_sample(desc);
    let pixels = desc.output.height * desc.output.width;
    let in_sample = desc.input.height * desc.input.width * desc.input.channels;
    let out_channels = desc.output.channels;
    let Scratch {
        packed_input,
        matmul_input,
        input_sum,
    } = scratch;

    for tile in tiles {
        let (batch, start) = (tile / per_sample, tile % per_sample * desc.tile_num);
        let count = desc.tile_num.min(pixels - start);
        let input = &input[batch * in_sample..(batch + 1) * in_sample];
        im2col(input, desc, start, count, matmul_input);
        pack_input(
            matmul_input,
            count,
            &layout,
            &desc.quant,
            packed_input,
            input_sum,
        );

        let out_start = (batch * pixels + start) * out_channels - output_offset;
        let output = &mut output[out_start..out_start + count * out_channels];
        match path {
            GemmPath::Reference => {
                reference_tile(
                    packed_input,
                    input_sum,
                    packed_weight,
                    bias,
                    count,
                    &layout,
                    desc,
                    output,
                );
            }
            GemmPath::Optimized(kernel) => {
                let tile = MatmulTile {
                    packed_input,
                    packed_weight,
                    input_sum,
                    bias,
                    rows: count,
                    cols: out_channels,
                    unit_size: layout.unit_size,
                    up_round_oc: layout.up_round_oc,
                    output_stride: out_channels,
                    quant: &desc.quant,
                };
                kernel.multiply(tile, output);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn reference_tile(
    packed_input: &[i8],
    input_sum: &[i32],
    packed_weight: &[i8],
    bias: &[i32],
    rows: usize,
    layout: &GemmLayout,
    desc: &ConvDescriptor,
    output: &mut [i8],
) {
    let unit = layout.unit_size;
    let sum_stride = layout.input_sum_stride();
    for (row, out) in output.chunks_mut(layout.out_channels).take(rows).enumerate() {
        let a = &packed_input[row * unit..(row + 1) * unit];
        for (oc, out) in out.iter_mut().enumerate() {
            let w = &packed_weight[oc * unit..(oc + 1) * unit];
            let acc: i32 = a
                .iter()
                .zip(w)
                .map(|(&x, &w)| i32::from(x) * i32::from(w))
                .sum();
            let sum = if layout.per_channel {
                input_sum[row * sum_stride + oc]
            } else {
                input_sum[row * sum_stride]
            };
            *out = desc.quant.requantize(acc - sum + bias[oc], oc);
        }
    }
}
