//! Buffer sizing and data layout transforms.
//!
//! All kernels work on caller-allocated buffers. The functions here are the single place
//! defining how large these buffers must be and how weights and activations are arranged
//! in them.

use crate::{params::ConvDescriptor, quant::QuantParams};

/// Block of 4 elements.
pub const C4: usize = 4;
/// Block of 8 elements; channel block width of depthwise kernels.
pub const C8: usize = 8;
/// Block of 16 elements; reduction alignment of the reference GEMM path.
pub const C16: usize = 16;

/// Rounds `value` up to a multiple of `block`.
#[inline]
pub const fn round_up(value: usize, block: usize) -> usize {
    (value + block - 1) / block * block
}

/// Buffer geometry of the GEMM convolution path.
///
/// | Path | Reduction alignment | Output channel alignment | Activation rows |
/// |------|---------------------|--------------------------|-----------------|
/// | reference | 16 | 4 | `tile_num` |
/// | optimized | 4  | 8 | `tile_num` rounded up to 4 |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmLayout {
    /// Number of signal values per output value (`kernel_h * kernel_w * in_channels`).
    pub deep: usize,
    /// Aligned reduction length.
    pub unit_size: usize,
    /// Number of output channels.
    pub out_channels: usize,
    /// Aligned number of output channels.
    pub up_round_oc: usize,
    /// Output pixels per tile.
    pub tile_num: usize,
    /// Activation rows in the packed input.
    pub tile_rows: usize,
    /// Whether the layout is the blocked one consumed by matmul kernels.
    pub optimized: bool,
    /// Whether input sums are computed per output channel.
    pub per_channel: bool,
}

impl GemmLayout {
    /// Computes the layout for the specified descriptor.
    pub fn new(desc: &ConvDescriptor, optimized: bool) -> Self {
        Self::from_dims(
            desc.deep(),
            desc.output.channels,
            desc.tile_num,
            optimized,
            desc.quant.is_per_channel(),
        )
    }

    /// Computes the layout from the reduction length and the number of output channels.
    pub fn from_dims(
        deep: usize,
        out_channels: usize,
        tile_num: usize,
        optimized: bool,
        per_channel: bool,
    ) -> Self {
        let (unit_size, up_round_oc, tile_rows) = if optimized {
            (
                round_up(deep, C4),
                round_up(out_channels, C8),
                round_up(tile_num, C4),
            )
        } else {
            (
                round_up(deep, C16),
                round_up(out_channels, C4),
                tile_num,
            )
        };
        Self {
            deep,
            unit_size,
            out_channels,
            up_round_oc,
            tile_num,
            tile_rows,
            optimized,
            per_channel,
        }
    }

    /// Length of the packed weight buffer.
    pub fn packed_weight_len(&self) -> usize {
        self.unit_size * self.up_round_oc
    }

    /// Length of the packed activation buffer.
    pub fn packed_input_len(&self) -> usize {
        self.unit_size * self.tile_rows
    }

    /// Length of the im2col buffer.
    pub fn matmul_input_len(&self) -> usize {
        self.deep * self.tile_num
    }

    /// Length of the input sum buffer.
    pub fn input_sum_len(&self) -> usize {
        self.tile_rows * self.input_sum_stride()
    }

    /// Distance between input sums of adjacent rows.
    pub fn input_sum_stride(&self) -> usize {
        if self.per_channel {
            self.up_round_oc
        } else {
            1
        }
    }
}

/// Packs `[out_channels][deep]` weights for the GEMM path.
///
/// The reference layout stores each output channel as a zero-padded row of `unit_size`
/// values. The optimized layout stores `[oc / 8][unit_size / 4][8][4]` blocks.
pub fn pack_gemm_weights(weights: &[i8], layout: &GemmLayout, packed: &mut [i8]) {
    let GemmLayout {
        deep, unit_size, ..
    } = *layout;
    debug_assert!(weights.len() >= layout.out_channels * deep);
    let packed = &mut packed[..layout.packed_weight_len()];
    packed.iter_mut().for_each(|value| *value = 0);

    for (oc, row) in weights.chunks(deep).take(layout.out_channels).enumerate() {
        for (k, &value) in row.iter().enumerate() {
            let index = if layout.optimized {
                let units = unit_size / C4;
                ((oc / C8 * units + k / C4) * C8 + oc % C8) * C4 + k % C4
            } else {
                oc * unit_size + k
            };
            packed[index] = value;
        }
    }
    log::trace!(
        "packed {}x{} weights into {} bytes",
        layout.out_channels,
        deep,
        packed.len()
    );
}

/// Adjusts biases so that GEMM accumulators over raw `i8` values yield zero-point-corrected
/// sums.
///
/// With signal zero point `zi` and filter zero point `zf`,
/// `sum((x - zi) * (w - zf)) = sum(x * w) - zf * sum(x) - zi * sum(w) + deep * zi * zf`.
/// The `zf * sum(x)` term depends on the signal and is subtracted through input sums;
/// the remaining terms are folded into `corrected`, saturating to the `i32` range.
pub fn fold_zero_points_into_bias(
    weights: &[i8],
    bias: Option<&[i32]>,
    deep: usize,
    quant: &QuantParams,
    corrected: &mut [i32],
) {
    let input_zp = i64::from(quant.input.zero_point);
    for (oc, out) in corrected.iter_mut().enumerate() {
        let weight_sum: i64 = weights[oc * deep..(oc + 1) * deep]
            .iter()
            .map(|&w| i64::from(w))
            .sum();
        let filter_zp = i64::from(quant.filter_zero_point(oc));
        let base = i64::from(bias.map_or(0, |bias| bias[oc]));
        let value = base - input_zp * weight_sum + deep as i64 * input_zp * filter_zp;
        *out = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    }
}

/// Gathers receptive fields of `count` output pixels starting from `start` into rows
/// of `deep` values. Taps falling into padding get the signal zero point.
///
/// `input` is a single NHWC batch sample.
pub fn im2col(
    input: &[i8],
    desc: &ConvDescriptor,
    start: usize,
    count: usize,
    matmul_input: &mut [i8],
) {
    let channels = desc.input.channels;
    let (in_h, in_w) = (desc.input.height, desc.input.width);
    let [kernel_h, kernel_w] = desc.kernel;
    let [stride_h, stride_w] = desc.params.strides;
    let [dilation_h, dilation_w] = desc.params.dilation;
    let zero_point = desc.quant.input.clamped_zero_point();
    let deep = desc.deep();

    for (row, dst) in matmul_input[..count * deep].chunks_mut(deep).enumerate() {
        let pixel = start + row;
        let (oh, ow) = (pixel / desc.output.width, pixel % desc.output.width);
        for kh in 0..kernel_h {
            let ih = (oh * stride_h + kh * dilation_h).wrapping_sub(desc.pad_top());
            for kw in 0..kernel_w {
                let iw = (ow * stride_w + kw * dilation_w).wrapping_sub(desc.pad_left());
                let offset = (kh * kernel_w + kw) * channels;
                let dst = &mut dst[offset..offset + channels];
                // Negative coordinates wrap around and fail the bounds check as well.
                if ih < in_h && iw < in_w {
                    let src = (ih * in_w + iw) * channels;
                    dst.copy_from_slice(&input[src..src + channels]);
                } else {
                    dst.iter_mut().for_each(|value| *value = zero_point);
                }
            }
        }
    }
}

/// Packs `rows` im2col rows into the GEMM activation layout and computes input sums,
/// i.e., row sums multiplied by filter zero points.
///
/// The reference layout stores zero-padded rows of `unit_size` values. The optimized
/// layout stores `[rows / 4][unit_size / 4][4][4]` blocks.
pub fn pack_input(
    matmul_input: &[i8],
    rows: usize,
    layout: &GemmLayout,
    quant: &QuantParams,
    packed_input: &mut [i8],
    input_sum: &mut [i32],
) {
    let GemmLayout {
        deep, unit_size, ..
    } = *layout;
    let packed_input = &mut packed_input[..layout.packed_input_len()];
    packed_input.iter_mut().for_each(|value| *value = 0);
    let input_sum = &mut input_sum[..layout.input_sum_len()];
    input_sum.iter_mut().for_each(|value| *value = 0);

    let stride = layout.input_sum_stride();
    for (row, src) in matmul_input[..rows * deep].chunks(deep).enumerate() {
        let mut sum = 0_i32;
        for (k, &value) in src.iter().enumerate() {
            let index = if layout.optimized {
                let units = unit_size / C4;
                ((row / C4 * units + k / C4) * C4 + row % C4) * C4 + k % C4
            } else {
                row * unit_size + k
            };
            packed_input[index] = value;
            sum += i32::from(value);
        }

        let sums = &mut input_sum[row * stride..(row + 1) * stride];
        if layout.per_channel {
            for (oc, out) in sums.iter_mut().take(layout.out_channels).enumerate() {
                *out = sum * quant.filter_zero_point(oc);
            }
        } else {
            sums[0] = sum * quant.filter_zero_point(0);
        }
    }
}

/// Length of the packed weight buffer of the 3x3 depthwise kernel.
pub fn dw3x3_weight_len(channels: usize) -> usize {
    9 * channels
}

/// Packs `[channels][3][3]` depthwise weights into the `[3][3][channels]` layout of
/// the 3x3 kernel, subtracting filter zero points.
pub fn pack_dw3x3_weights(weights: &[i8], channels: usize, quant: &QuantParams, packed: &mut [i16]) {
    for (channel, taps) in weights.chunks(9).take(channels).enumerate() {
        let zero_point = quant.filter_zero_point(channel);
        for (tap, &value) in taps.iter().enumerate() {
            packed[tap * channels + channel] = dw_weight(value, zero_point);
        }
    }
}

/// Length of the packed weight buffer of the sliding-window depthwise kernel.
pub fn depthwise_weight_len(channels: usize, kernel_plane: usize) -> usize {
    round_up(channels, C8) * kernel_plane
}

/// Packs `[channels][kernel_h][kernel_w]` depthwise weights into
/// `[channels / 8][kernel_h][kernel_w][8]` blocks, subtracting filter zero points.
/// Padding channels get zero weights.
pub fn pack_depthwise_weights(
    weights: &[i8],
    channels: usize,
    kernel_plane: usize,
    quant: &QuantParams,
    packed: &mut [i16],
) {
    let packed = &mut packed[..depthwise_weight_len(channels, kernel_plane)];
    packed.iter_mut().for_each(|value| *value = 0);

    for (channel, taps) in weights.chunks(kernel_plane).take(channels).enumerate() {
        let zero_point = quant.filter_zero_point(channel);
        let block_start = channel / C8 * kernel_plane * C8;
        for (tap, &value) in taps.iter().enumerate() {
            packed[block_start + tap * C8 + channel % C8] = dw_weight(value, zero_point);
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn dw_weight(value: i8, zero_point: i32) -> i16 {
    (i32::from(value) - zero_point).clamp(i16::MIN.into(), i16::MAX.into()) as i16
}

/// Copies `pixels` NHWC pixels of `channels` values into a layout with `aligned` values
/// per pixel, filling extra channels with `fill`.
pub fn align_channels(src: &[i8], channels: usize, aligned: usize, fill: i8, dst: &mut [i8]) {
    for (src, dst) in src.chunks(channels).zip(dst.chunks_mut(aligned)) {
        dst[..channels].copy_from_slice(src);
        dst[channels..].iter_mut().for_each(|value| *value = fill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffers::FeatureMapShape,
        params::Params,
        quant::{QuantArg, QuantParams},
    };

    fn descriptor(
        input: [usize; 3],
        kernel: [usize; 2],
        out_channels: usize,
        params: Params,
        quant: QuantParams,
    ) -> ConvDescriptor {
        let input = FeatureMapShape {
            batch_size: 1,
            height: input[0],
            width: input[1],
            channels: input[2],
        };
        ConvDescriptor::new(input, kernel, out_channels, params, quant).unwrap()
    }

    #[test]
    fn layout_sizes() {
        let desc = descriptor([1, 1, 2], [1, 1], 2, Params::default(), QuantParams::identity())
            .with_tile_num(1);
        let reference = GemmLayout::new(&desc, false);
        assert_eq!((reference.unit_size, reference.up_round_oc), (16, 4));
        assert_eq!(reference.packed_weight_len(), 64);
        assert_eq!(reference.packed_input_len(), 16);
        assert_eq!(reference.matmul_input_len(), 2);
        assert_eq!(reference.input_sum_len(), 1);

        let optimized = GemmLayout::new(&desc, true);
        assert_eq!((optimized.unit_size, optimized.up_round_oc), (4, 8));
        assert_eq!(optimized.tile_rows, 4);
        assert_eq!(optimized.packed_input_len(), 16);

        let per_channel = QuantParams::per_channel(
            QuantArg::IDENTITY,
            &[QuantArg::IDENTITY; 2],
            QuantArg::IDENTITY,
        );
        let desc = descriptor([2, 2, 4], [1, 1], 2, Params::default(), per_channel);
        let layout = GemmLayout::new(&desc, true);
        assert_eq!(layout.input_sum_len(), 4 * 8);
        assert_eq!(layout.input_sum_stride(), 8);
    }

    #[test]
    fn weight_packing_layouts() {
        let desc = descriptor([1, 1, 5], [1, 1], 9, Params::default(), QuantParams::identity());
        let weights: Vec<i8> = (0..45).collect();

        let layout = GemmLayout::new(&desc, false);
        let mut packed = vec![-1; layout.packed_weight_len()];
        pack_gemm_weights(&weights, &layout, &mut packed);
        assert_eq!(&packed[..5], &[0, 1, 2, 3, 4]);
        assert!(packed[5..16].iter().all(|&value| value == 0));
        assert_eq!(&packed[16..21], &[5, 6, 7, 8, 9]);
        assert!(packed[9 * 16..].iter().all(|&value| value == 0));

        let layout = GemmLayout::new(&desc, true);
        assert_eq!((layout.unit_size, layout.up_round_oc), (8, 16));
        let mut packed = vec![-1; layout.packed_weight_len()];
        pack_gemm_weights(&weights, &layout, &mut packed);
        // First block: channels 0..8, reduction values 0..4.
        assert_eq!(&packed[..8], &[0, 1, 2, 3, 5, 6, 7, 8]);
        // Second block: channels 0..8, reduction values 4..8.
        assert_eq!(&packed[32..36], &[4, 0, 0, 0]);
        // Third block: channel 8, then zero channels.
        assert_eq!(&packed[64..68], &[40, 41, 42, 43]);
        assert!(packed[68..96].iter().all(|&value| value == 0));
    }

    #[test]
    fn im2col_fills_padding_with_zero_point() {
        let quant = QuantParams::per_tensor(
            QuantArg::new(1.0, -3),
            QuantArg::IDENTITY,
            QuantArg::IDENTITY,
        );
        let params = Params {
            pads: [1; 4],
            ..Params::default()
        };
        let desc = descriptor([2, 2, 1], [3, 3], 1, params, quant);
        let input = [1, 2, 3, 4];
        let mut matmul_input = vec![0; 9 * 2];
        im2col(&input, &desc, 0, 2, &mut matmul_input);
        assert_eq!(
            matmul_input,
            [
                -3, -3, -3, -3, 1, 2, -3, 3, 4, // (0, 0)
                -3, -3, -3, 1, 2, -3, 3, 4, -3, // (0, 1)
            ]
        );
    }

    #[test]
    fn input_packing_computes_sums() {
        let quant = QuantParams::per_channel(
            QuantArg::IDENTITY,
            &[QuantArg::new(1.0, 2), QuantArg::new(1.0, -1)],
            QuantArg::IDENTITY,
        );
        let desc = descriptor([1, 2, 5], [1, 1], 2, Params::default(), quant.clone())
            .with_tile_num(2);
        let matmul_input: Vec<i8> = vec![1, 2, 3, 4, 5, -1, -2, -3, -4, -5];

        let layout = GemmLayout::new(&desc, true);
        let mut packed = vec![0; layout.packed_input_len()];
        let mut sums = vec![0; layout.input_sum_len()];
        pack_input(&matmul_input, 2, &layout, &quant, &mut packed, &mut sums);
        assert_eq!(&packed[..8], &[1, 2, 3, 4, -1, -2, -3, -4]);
        assert_eq!(&packed[16..24], &[5, 0, 0, 0, -5, 0, 0, 0]);
        assert_eq!(&sums[..2], &[30, -15]);
        assert_eq!(&sums[8..10], &[-30, 15]);

        let layout = GemmLayout::new(&desc, false);
        let mut packed = vec![0; layout.packed_input_len()];
        let mut sums = vec![0; layout.input_sum_len()];
        pack_input(&matmul_input, 2, &layout, &quant, &mut packed, &mut sums);
        assert_eq!(&packed[..6], &[1, 2, 3, 4, 5, 0]);
        assert_eq!(&packed[16..21], &[-1, -2, -3, -4, -5]);
        assert_eq!(&sums[4..6], &[-30, 15]);
    }

    #[test]
    fn bias_correction() {
        let quant = QuantParams::per_tensor(
            QuantArg::new(1.0, 2),
            QuantArg::new(1.0, 1),
            QuantArg::IDENTITY,
        );
        let weights = [1, 2, 3, -1, 0, 4];
        let mut corrected = [0; 2];
        fold_zero_points_into_bias(&weights, Some(&[10, 20][..]), 3, &quant, &mut corrected);
        // 10 - 2 * 6 + 3 * 2 * 1; 20 - 2 * 3 + 3 * 2 * 1
        assert_eq!(corrected, [4, 20]);
    }

    #[test]
    fn bias_correction_saturates_for_deep_layers() {
        let quant = QuantParams::per_tensor(
            QuantArg::new(1.0, 127),
            QuantArg::new(1.0, 127),
            QuantArg::IDENTITY,
        );
        // 140_000 * 127 * 127 exceeds `i32::MAX`.
        let deep = 140_000;
        let weights = vec![0; deep];
        let mut corrected = [0; 1];
        fold_zero_points_into_bias(&weights, None, deep, &quant, &mut corrected);
        assert_eq!(corrected, [i32::MAX]);

        let weights = vec![127; deep];
        fold_zero_points_into_bias(&weights, Some(&[-7][..]), deep, &quant, &mut corrected);
        // The weight sum term cancels the zero point product exactly.
        assert_eq!(corrected, [-7]);
    }

    #[test]
    fn depthwise_weight_packing() {
        let quant = QuantParams::per_tensor(
            QuantArg::IDENTITY,
            QuantArg::new(1.0, 1),
            QuantArg::IDENTITY,
        );
        let weights: Vec<i8> = (0..9 * 10).map(|i| (i % 100) as i8).collect();

        let mut packed = vec![0; dw3x3_weight_len(10)];
        pack_dw3x3_weights(&weights, 10, &quant, &mut packed);
        assert_eq!(packed[0], -1);
        assert_eq!(packed[1], 8);
        assert_eq!(packed[4 * 10 + 3], 30);

        let mut packed = vec![7; depthwise_weight_len(10, 9)];
        assert_eq!(packed.len(), 16 * 9);
        pack_depthwise_weights(&weights, 10, 9, &quant, &mut packed);
        assert_eq!(&packed[..3], &[-1, 8, 17]);
        assert_eq!(packed[8], 0);
        // Channel 9 is the second channel of the second block.
        assert_eq!(packed[9 * 8 + 4 * 8 + 1], 9 * 9 + 4 - 1);
        assert_eq!(packed[9 * 8 + 2], 0);
    }

    #[test]
    fn channel_alignment() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0; 8];
        align_channels(&src, 3, 4, -7, &mut dst);
        assert_eq!(dst, [1, 2, 3, -7, 4, 5, 6, -7]);
    }
}
