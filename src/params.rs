//! Convolution parameters.

use crate::{buffers::FeatureMapShape, quant::QuantParams, Error};

/// General convolution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Params {
    /// Strides along spatial dimensions.
    pub strides: [usize; 2],
    /// Pads along spatial dimensions. The first 2 values denote pads at the beginning of
    /// rows / columns, the second 2 values - pads at the end.
    pub pads: [usize; 4],
    /// Number of groups in the convolution. Each group of filters will be applied to
    /// a subset of input channels.
    pub groups: usize,
    /// Signal dilation along spatial dimensions.
    pub dilation: [usize; 2],
}

impl Default for Params {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            pads: [0; 4],
            groups: 1,
            dilation: [1, 1],
        }
    }
}

impl Params {
    /// Computes spatial output dimensions for the given signal dimensions and kernel size.
    /// Returns `None` if the dilated kernel does not fit into the padded signal.
    pub fn output_dims(&self, signal: [usize; 2], kernel: [usize; 2]) -> Option<[usize; 2]> {
        let dim = |axis: usize| {
            let padded = signal[axis] + self.pads[axis] + self.pads[axis + 2];
            let span = self.dilation[axis] * kernel[axis].saturating_sub(1) + 1;
            padded
                .checked_sub(span)
                .map(|free| free / self.strides[axis].max(1) + 1)
        };
        Some([dim(0)?, dim(1)?])
    }

    pub(crate) fn check(&self, kernel: [usize; 2]) -> Result<(), Error> {
        if self.strides.contains(&0) {
            return Err(Error::Geometry("strides must be positive"));
        }
        if self.dilation.contains(&0) {
            return Err(Error::Geometry("dilation must be positive"));
        }
        if kernel.contains(&0) {
            return Err(Error::Geometry("kernel dimensions must be positive"));
        }
        if self.groups == 0 {
            return Err(Error::Geometry("group count must be positive"));
        }
        Ok(())
    }
}

/// Params for the quantized convolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct I8Params {
    /// Common parameters.
    pub common: Params,
    /// Quantization of the signal, filters and output.
    pub quant: QuantParams,
}

impl From<I8Params> for Params {
    fn from(value: I8Params) -> Self {
        value.common
    }
}

/// Complete configuration of a single kernel invocation.
///
/// Kernels trust the descriptor: shapes, pads and quantization must agree with the buffers
/// passed alongside it. Use [`Self::new()`] to derive output dimensions, or
/// [`Self::validate()`] to check a hand-built descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvDescriptor {
    /// Shape of the signal.
    pub input: FeatureMapShape,
    /// Shape of the output.
    pub output: FeatureMapShape,
    /// Kernel height and width.
    pub kernel: [usize; 2],
    /// Strides, pads, dilation and groups.
    pub params: Params,
    /// Number of partitions the work is split into. Each kernel call processes
    /// the partition selected by its `task_id`.
    pub thread_num: usize,
    /// Number of output pixels processed per GEMM tile.
    pub tile_num: usize,
    /// Quantization params.
    pub quant: QuantParams,
}

impl ConvDescriptor {
    /// Default number of output pixels per GEMM tile.
    pub const DEFAULT_TILE_NUM: usize = 4;

    /// Creates a descriptor, computing output dimensions.
    pub fn new(
        input: FeatureMapShape,
        kernel: [usize; 2],
        output_channels: usize,
        params: Params,
        quant: QuantParams,
    ) -> Result<Self, Error> {
        params.check(kernel)?;
        let [height, width] = params
            .output_dims([input.height, input.width], kernel)
            .ok_or(Error::EmptyOutput)?;
        let output = FeatureMapShape {
            batch_size: input.batch_size,
            height,
            width,
            channels: output_channels,
        };
        let this = Self {
            input,
            output,
            kernel,
            params,
            thread_num: 1,
            tile_num: Self::DEFAULT_TILE_NUM,
            quant,
        };
        this.validate()?;
        Ok(this)
    }

    /// Sets the number of partitions.
    #[must_use]
    pub fn with_threads(mut self, thread_num: usize) -> Self {
        self.thread_num = thread_num.max(1);
        self
    }

    /// Sets the number of output pixels per GEMM tile.
    #[must_use]
    pub fn with_tile_num(mut self, tile_num: usize) -> Self {
        self.tile_num = tile_num.max(1);
        self
    }

    /// Checks internal consistency of the descriptor.
    pub fn validate(&self) -> Result<(), Error> {
        self.params.check(self.kernel)?;
        if self.thread_num == 0 || self.tile_num == 0 {
            return Err(Error::Geometry("thread and tile counts must be positive"));
        }
        if self.input.batch_size != self.output.batch_size {
            return Err(Error::Geometry("input and output batch sizes differ"));
        }

        let groups = self.params.groups;
        if self.input.channels % groups != 0 {
            return Err(Error::Groups {
                count: self.input.channels,
                groups,
            });
        }
        if self.output.channels % groups != 0 {
            return Err(Error::Groups {
                count: self.output.channels,
                groups,
            });
        }

        let expected = self
            .params
            .output_dims([self.input.height, self.input.width], self.kernel)
            .ok_or(Error::EmptyOutput)?;
        let actual = [self.output.height, self.output.width];
        if expected != actual {
            return Err(Error::OutputShape { expected, actual });
        }

        if let Some(count) = self.quant.filters.channel_count() {
            if count != self.output.channels {
                return Err(Error::QuantChannels {
                    expected: self.output.channels,
                    actual: count,
                });
            }
        }
        Ok(())
    }

    /// Pad above the first row.
    #[inline]
    pub fn pad_top(&self) -> usize {
        self.params.pads[0]
    }

    /// Pad before the first column.
    #[inline]
    pub fn pad_left(&self) -> usize {
        self.params.pads[1]
    }

    /// Number of kernel taps.
    #[inline]
    pub fn kernel_plane(&self) -> usize {
        self.kernel[0] * self.kernel[1]
    }

    /// Number of signal values contributing to a single output value of the GEMM path.
    #[inline]
    pub fn deep(&self) -> usize {
        self.kernel_plane() * self.input.channels
    }

    /// Checks whether the descriptor describes a depthwise convolution with channel
    /// multiplier 1.
    pub fn is_depthwise(&self) -> bool {
        self.params.groups == self.input.channels && self.input.channels == self.output.channels
    }
}
