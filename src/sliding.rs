//! Sliding-window geometry for depthwise kernels.

use crate::params::ConvDescriptor;

/// Precomputed iteration geometry of a depthwise convolution.
///
/// Output pixels in `[top, bottom) x [left, right)` have their whole receptive field inside
/// the unpadded signal; the remaining pixels form the border ring. Steps are expressed
/// in elements of the channel-aligned NHWC layout, in which every pixel occupies `ic_align`
/// elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SlidingWindow {
    /// First interior output column.
    pub left: usize,
    /// End of interior output columns (exclusive).
    pub right: usize,
    /// First interior output row.
    pub top: usize,
    /// End of interior output rows (exclusive).
    pub bottom: usize,
    /// Number of channel blocks.
    pub c_block: usize,
    /// Channels per block.
    pub block_channel: usize,
    /// Channels per pixel in the aligned layout (`c_block * block_channel`).
    pub ic_align: usize,
    /// Output elements per batch sample.
    pub out_step: usize,
    /// Output elements per output row.
    pub out_h_step: usize,
    /// Output elements per output column.
    pub out_w_step: usize,
    /// Output elements per channel block.
    pub out_c_step: usize,
    /// Input elements per batch sample.
    pub in_step: usize,
    /// Input elements per input row.
    pub in_h_step: usize,
    /// Input elements between windows of adjacent output rows.
    pub in_sh_step: usize,
    /// Input elements between windows of adjacent output columns.
    pub in_sw_step: usize,
    /// Input elements between adjacent kernel rows (accounts for dilation).
    pub in_kh_step: usize,
    /// Input elements between adjacent kernel columns (accounts for dilation).
    pub in_kw_step: usize,
    /// Weight elements per channel block.
    pub kernel_step: usize,
}

impl SlidingWindow {
    /// Computes the geometry of a depthwise convolution with channels grouped
    /// in blocks of `block` channels.
    pub fn new(desc: &ConvDescriptor, block: usize) -> Self {
        let params = &desc.params;
        let [stride_h, stride_w] = params.strides;
        let [dilation_h, dilation_w] = params.dilation;
        let [kernel_h, kernel_w] = desc.kernel;

        let (top, bottom) = interior_range(
            desc.output.height,
            desc.input.height,
            params.pads[0],
            stride_h,
            (kernel_h - 1) * dilation_h + 1,
        );
        let (left, right) = interior_range(
            desc.output.width,
            desc.input.width,
            params.pads[1],
            stride_w,
            (kernel_w - 1) * dilation_w + 1,
        );

        let c_block = (desc.output.channels + block - 1) / block;
        let ic_align = c_block * block;
        let in_h_step = desc.input.width * ic_align;
        let out_h_step = desc.output.width * ic_align;

        let this = Self {
            left,
            right,
            top,
            bottom,
            c_block,
            block_channel: block,
            ic_align,
            out_step: desc.output.height * out_h_step,
            out_h_step,
            out_w_step: ic_align,
            out_c_step: block,
            in_step: desc.input.height * in_h_step,
            in_h_step,
            in_sh_step: in_h_step * stride_h,
            in_sw_step: ic_align * stride_w,
            in_kh_step: in_h_step * dilation_h,
            in_kw_step: ic_align * dilation_w,
            kernel_step: kernel_h * kernel_w * block,
        };
        log::trace!("computed sliding window {:?}", this);
        this
    }

    /// Checks whether the receptive field of an output pixel lies inside the signal.
    #[inline]
    pub fn is_interior(&self, row: usize, col: usize) -> bool {
        (self.top..self.bottom).contains(&row) && (self.left..self.right).contains(&col)
    }

    /// Checks whether the interior region is non-empty.
    pub fn has_interior(&self) -> bool {
        self.top < self.bottom && self.left < self.right
    }
}

/// Range of output positions whose windows `[o * stride - pad, o * stride - pad + span)`
/// fit into `[0, input)`.
fn interior_range(
    output: usize,
    input: usize,
    pad: usize,
    stride: usize,
    span: usize,
) -> (usize, usize) {
    let start = ((pad + stride - 1) / stride).min(output);
    let end = if input + pad >= span {
        ((input + pad - span) / stride + 1).min(output)
    } else {
        0
    };
    (start, end.max(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffers::FeatureMapShape, params::Params, quant::QuantParams};

    fn descriptor(size: [usize; 2], channels: usize, params: Params) -> ConvDescriptor {
        let input = FeatureMapShape {
            batch_size: 1,
            height: size[0],
            width: size[1],
            channels,
        };
        let params = Params {
            groups: channels,
            ..params
        };
        ConvDescriptor::new(input, [3, 3], channels, params, QuantParams::identity()).unwrap()
    }

    #[test]
    fn interior_without_padding_is_whole_output() {
        let desc = descriptor([5, 5], 8, Params::default());
        let sliding = SlidingWindow::new(&desc, 8);
        assert_eq!(
            (sliding.top, sliding.bottom, sliding.left, sliding.right),
            (0, 3, 0, 3)
        );
        assert_eq!(sliding.c_block, 1);
        assert_eq!(sliding.ic_align, 8);
        assert_eq!(sliding.in_kh_step, 40);
        assert_eq!(sliding.in_kw_step, 8);
        assert_eq!(sliding.out_h_step, 24);
        assert_eq!(sliding.out_step, 3 * 24);
        assert_eq!(sliding.in_step, 5 * 40);
        assert_eq!(sliding.kernel_step, 72);
    }

    #[test]
    fn interior_with_padding() {
        let params = Params {
            pads: [1; 4],
            ..Params::default()
        };
        let sliding = SlidingWindow::new(&descriptor([8, 8], 8, params), 8);
        assert_eq!(
            (sliding.top, sliding.bottom, sliding.left, sliding.right),
            (1, 7, 1, 7)
        );
        assert!(sliding.is_interior(1, 6));
        assert!(!sliding.is_interior(0, 3));
        assert!(!sliding.is_interior(3, 7));

        let strided = Params {
            pads: [1; 4],
            strides: [2, 2],
            ..Params::default()
        };
        let sliding = SlidingWindow::new(&descriptor([7, 7], 8, strided), 8);
        // Output is 4x4; the last window starts at 3 * 2 - 1 = 5 and overflows.
        assert_eq!(
            (sliding.top, sliding.bottom, sliding.left, sliding.right),
            (1, 3, 1, 3)
        );
        assert_eq!(sliding.in_sh_step, 2 * 7 * 8);
        assert_eq!(sliding.in_sw_step, 16);
    }

    #[test]
    fn unaligned_channels_are_padded_to_blocks() {
        let params = Params {
            dilation: [2, 2],
            pads: [2; 4],
            ..Params::default()
        };
        let sliding = SlidingWindow::new(&descriptor([4, 4], 11, params), 8);
        assert_eq!(sliding.c_block, 2);
        assert_eq!(sliding.ic_align, 16);
        assert_eq!(sliding.in_kw_step, 32);
        assert_eq!(sliding.in_kh_step, 2 * 4 * 16);
        assert_eq!(sliding.kernel_step, 9 * 8);
        // The dilated window spans 5 pixels and never fits into 4 signal pixels.
        assert_eq!((sliding.top, sliding.bottom), (2, 2));
        assert!(!sliding.has_interior());
    }
}
