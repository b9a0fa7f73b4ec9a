//! Pluggable tiled matrix multiplication used by the optimized GEMM path.

use lazy_static::lazy_static;

use std::fmt;

use crate::{
    packing::{C4, C8},
    quant::QuantParams,
};

/// Operands of a single tile multiplication.
///
/// `packed_input` uses the `[rows / 4][unit_size / 4][4][4]` layout, `packed_weight`
/// the `[up_round_oc / 8][unit_size / 4][8][4]` layout (see [`crate::packing`]).
#[derive(Debug, Clone, Copy)]
pub struct MatmulTile<'a> {
    /// Packed activation rows.
    pub packed_input: &'a [i8],
    /// Packed weights.
    pub packed_weight: &'a [i8],
    /// Input sums; either one per row, or one per (row, output channel) pair
    /// for per-channel quantization.
    pub input_sum: &'a [i32],
    /// Biases with folded zero point corrections.
    pub bias: &'a [i32],
    /// Number of valid rows.
    pub rows: usize,
    /// Number of valid output channels.
    pub cols: usize,
    /// Aligned reduction length.
    pub unit_size: usize,
    /// Aligned number of output channels.
    pub up_round_oc: usize,
    /// Distance between output rows.
    pub output_stride: usize,
    /// Quantization params used to requantize accumulators.
    pub quant: &'a QuantParams,
}

impl MatmulTile<'_> {
    /// Finishes an accumulator for the specified output element.
    #[inline]
    pub fn finish(&self, row: usize, col: usize, acc: i32) -> i8 {
        let sum = if self.quant.is_per_channel() {
            self.input_sum[row * self.up_round_oc + col]
        } else {
            self.input_sum[row]
        };
        self.quant.requantize(acc - sum + self.bias[col], col)
    }
}

/// Tiled `i8` matrix multiplication with requantization.
///
/// Kernels consume operands in the fixed blocked layout produced by
/// [`pack_input()`](crate::packing::pack_input) and
/// [`pack_gemm_weights()`](crate::packing::pack_gemm_weights): activations come in blocks
/// of 4 rows regardless of how many rows a kernel accumulates at once.
pub trait MatmulKernel: Send + Sync + fmt::Debug {
    /// Human-readable kernel name.
    fn name(&self) -> &'static str;

    /// Multiplies the tile and writes `rows x cols` requantized values to `output`.
    fn multiply(&self, tile: MatmulTile<'_>, output: &mut [i8]);
}

/// Kernel accumulating 4 rows by 8 output channels at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tile4x8;

impl MatmulKernel for Tile4x8 {
    fn name(&self) -> &'static str {
        "4x8"
    }

    fn multiply(&self, tile: MatmulTile<'_>, output: &mut [i8]) {
        let units = tile.unit_size / C4;
        for row_block in 0..(tile.rows + C4 - 1) / C4 {
            let input = &tile.packed_input[row_block * units * C4 * C4..][..units * C4 * C4];
            for col_block in 0..(tile.cols + C8 - 1) / C8 {
                let weight = &tile.packed_weight[col_block * units * C8 * C4..][..units * C8 * C4];

                let mut acc = [[0_i32; C8]; C4];
                for (a, w) in input.chunks_exact(C4 * C4).zip(weight.chunks_exact(C8 * C4)) {
                    for (r, acc_row) in acc.iter_mut().enumerate() {
                        let a = &a[r * C4..(r + 1) * C4];
                        for (c, acc) in acc_row.iter_mut().enumerate() {
                            let w = &w[c * C4..(c + 1) * C4];
                            *acc += a
                                .iter()
                                .zip(w)
                                .map(|(&x, &w)| i32::from(x) * i32::from(w))
                                .sum::<i32>();
                        }
                    }
                }

                for (r, acc_row) in acc.iter().enumerate() {
                    let row = row_block * C4 + r;
                    if row >= tile.rows {
                        break;
                    }
                    for (c, &acc) in acc_row.iter().enumerate() {
                        let col = col_block * C8 + c;
                        if col >= tile.cols {
                            break;
                        }
                        output[row * tile.output_stride + col] = tile.finish(row, col, acc);
                    }
                }
            }
        }
    }
}

/// Kernel accumulating a single row by 8 output channels at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tile1x8;

impl MatmulKernel for Tile1x8 {
    fn name(&self) -> &'static str {
        "1x8"
    }

    fn multiply(&self, tile: MatmulTile<'_>, output: &mut [i8]) {
        let units = tile.unit_size / C4;
        for row in 0..tile.rows {
            let (row_block, r) = (row / C4, row % C4);
            for col_block in 0..(tile.cols + C8 - 1) / C8 {
                let mut acc = [0_i32; C8];
                for unit in 0..units {
                    let a = (row_block * units + unit) * C4 * C4 + r * C4;
                    let a = &tile.packed_input[a..a + C4];
                    let w = (col_block * units + unit) * C8 * C4;
                    let w = &tile.packed_weight[w..w + C8 * C4];
                    for (acc, w) in acc.iter_mut().zip(w.chunks_exact(C4)) {
                        *acc += a
                            .iter()
                            .zip(w)
                            .map(|(&x, &w)| i32::from(x) * i32::from(w))
                            .sum::<i32>();
                    }
                }

                let cols = (col_block * C8..tile.cols).take(C8);
                for (col, &acc) in cols.zip(&acc) {
                    output[row * tile.output_stride + col] = tile.finish(row, col, acc);
                }
            }
        }
    }
}

lazy_static! {
    static ref DEFAULT_KERNEL: &'static dyn MatmulKernel = detect_kernel();
}

fn detect_kernel() -> &'static dyn MatmulKernel {
    let kernel: &'static dyn MatmulKernel = if wide_tiles_supported() {
        &Tile4x8
    } else {
        &Tile1x8
    };
    log::debug!("selected {} matmul kernel", kernel.name());
    kernel
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn wide_tiles_supported() -> bool {
    is_x86_feature_detected!("avx2")
}

#[cfg(target_arch = "aarch64")]
fn wide_tiles_supported() -> bool {
    true
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn wide_tiles_supported() -> bool {
    false
}

/// Returns the default matmul kernel. The kernel is selected once per process.
///
/// Both kernels are portable scalar code producing identical results; the selection only
/// changes accumulator tiling. [`Tile4x8`] keeps 32 accumulators live, which the compiler
/// can map onto vector registers when the target has wide ones (AVX2 on x86, NEON
/// on aarch64); elsewhere the smaller [`Tile1x8`] tile avoids register spills.
pub fn default_kernel() -> &'static dyn MatmulKernel {
    *DEFAULT_KERNEL
}
