//! Quantized 2D convolutions on the CPU.
//!
//! [Convolution] is a fundamental building block in signal processing. This crate is focused
//! on 2D convolutions (i.e., the signal is a still image) in the context of [deep learning]
//! inference (more precisely, [convolutional neural networks][cnn]) on quantized data:
//! signals, filters and outputs are signed 8-bit integers, and multiply-add operations
//! are accumulated in 32-bit integers (this format is frequently denoted `int8/32` in deep
//! learning literature).
//!
//! # Features
//!
//! - Affine quantization with zero points for signals, filters and outputs. Filters
//!   can be quantized per tensor or per output channel.
//! - Fixed-point requantization of accumulators; no floating-point operations are performed
//!   in kernels.
//! - Dilated, strided, padded and grouped convolutions.
//! - Fused activations via [`ActivationRange`].
//!
//! # Implementation details
//!
//! Depending on the convolution params, one of the following kernels is used:
//!
//! - Depthwise 3x3 convolutions with stride 1 or 2 over a multiple of 8 channels are computed
//!   by a blocked kernel ([`kernels::dw3x3`]).
//! - Other depthwise convolutions use a sliding-window kernel ([`kernels::depthwise`]).
//! - All other convolutions are reduced to matrix multiplication via im2col
//!   ([`kernels::conv`]). The multiplication is either a straightforward reference
//!   implementation, or a tiled [`MatmulKernel`] chosen based on CPU features.
//!
//! Kernels operate on caller-allocated buffers and are usable directly; buffer sizes are
//! defined by the [`packing`] module. The high-level [`Convolution`] API allocates buffers,
//! packs filters and computes output partitions in parallel using [`rayon`].
//!
//! [Convolution]: https://en.wikipedia.org/wiki/Convolution
//! [deep learning]: https://en.wikipedia.org/wiki/Deep_learning
//! [cnn]: https://en.wikipedia.org/wiki/Convolutional_neural_network
//! [`rayon`]: https://docs.rs/rayon/
//!
//! # Examples
//!
//! ```
//! use ndarray::Array4;
//! use rand::{Rng, thread_rng};
//! use int8_convolution::{Convolution, FeatureMap, I8Params, Params, QuantArg, QuantParams};
//!
//! # fn main() -> Result<(), int8_convolution::Error> {
//! let params = I8Params {
//!     common: Params::default(),
//!     // These params are found by profiling; here, they are
//!     // chosen randomly.
//!     quant: QuantParams::per_tensor(
//!         QuantArg::new(0.05, 20),
//!         QuantArg::new(0.01, -5),
//!         QuantArg::new(0.1, -10),
//!     ),
//! };
//! let convolution = Convolution::new(3).build(params)?;
//!
//! // Generate random signal with 6x6 spatial dims and 3 channels.
//! let mut rng = thread_rng();
//! let signal = Array4::<i8>::from_shape_fn([1, 6, 6, 3], |_| rng.gen_range(-127..=127));
//! // Construct two 3x3 spatial filters.
//! let filters = Array4::<i8>::from_shape_fn([2, 3, 3, 3], |_| rng.gen_range(-127..=127));
//! // Perform the convolution. The output should have 4x4 spatial dims
//! // and contain 2 channels (1 per each filter). The output layout will
//! // be the same as in the signal.
//! let output = convolution.compute(
//!     // `FeatureMap` wraps `ArrayView4` with information about
//!     // memory layout (which is "channels-last" / NHWC in this case).
//!     FeatureMap::nhwc(&signal),
//!     &filters,
//! )?;
//! assert_eq!(output.shape(), [1, 4, 4, 2]);
//!
//! // For increased efficiency, we may pack filters once.
//! // This is especially useful when the same filters are convolved
//! // with multiple signals.
//! let convolution = convolution.with_filters(&filters)?;
//! let new_output = convolution.compute(FeatureMap::nhwc(&signal))?;
//! assert_eq!(output, new_output);
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/int8-convolution/0.1.0")]
#![deny(missing_docs, missing_debug_implementations)]

use ndarray::{Array4, ArrayView4};

mod base;
mod buffers;
mod error;
pub mod kernels;
pub mod packing;
mod params;
pub mod quant;
pub mod sliding;

use crate::{base::Base, buffers::Filters};
pub use crate::{
    base::ConvolutionBuilder,
    buffers::{FeatureMap, FeatureMapShape, Layout},
    error::Error,
    kernels::gemm::{default_kernel, MatmulKernel, Tile1x8, Tile4x8},
    params::{ConvDescriptor, I8Params, Params},
    quant::{ActivationRange, Multiplier, QuantArg, QuantParams},
};

/// Quantized convolution over signed 8-bit integers.
///
/// ## Connection to real-value convolution
///
/// Quantized convolution mirrors real-valued convolution in which `i8` elements
/// of the signal, filter and output tensors represent real-valued numbers with the
/// following mapping:
///
/// ```
/// let scale: f32 = // ...
/// # 1.0;
/// let zero_point: i32 = // ...
/// # 0; drop(
/// |x: i8| -> f32 { scale * (i32::from(x) - zero_point) as f32 }
/// # )
/// ```
///
/// `scale` and `zero_point` may differ for different tensors; these params are usually
/// determined by *profiling* the corresponding convolutional neural network (see e.g.
/// [this paper]). They are specified for each tensor with a [`QuantArg`]; filters may have
/// a separate `QuantArg` per output channel.
///
/// # Computing convolution
///
/// Suppose `S` is the signal and `F` is the filter tensor; both contain `i8` values.
/// The computation is performed as follows:
///
/// 1. Unbias the signal and filters: `S := S - S.zero_point`, `F := F - F.zero_point`.
/// 2. Compute "standard" convolution output `O := S (*) F` using `i32` precision.
///    Padding contributes zeros to the unbiased signal.
/// 3. If there are filter biases `B` provided, apply them to the output per each output
///    channel: `O[.., f] := O[.., f] + B[f]`. Biases are thus expressed in accumulator units.
/// 4. Rescale the output: `O := round(O * S.scale * F.scale / O.scale)`, where the scale
///    is approximated by a fixed-point [`Multiplier`] and ties are rounded away from zero.
/// 5. Apply output zero point: `O := O + O.zero_point`.
/// 6. Saturate output to the activation range ([`ActivationRange`]) and the `i8` range.
///
/// [this paper]: https://arxiv.org/abs/1712.05877
#[derive(Debug)]
pub struct Convolution(Base<()>);

impl Convolution {
    /// Creates a new convolution builder with a square `size x size` filter.
    pub fn new(size: usize) -> ConvolutionBuilder {
        ConvolutionBuilder::new([size, size])
    }

    /// Creates a new convolution builder with a `[height, width]` filter.
    pub fn with_size(size: [usize; 2]) -> ConvolutionBuilder {
        ConvolutionBuilder::new(size)
    }

    /// Spatial size of the convolution.
    pub fn size(&self) -> [usize; 2] {
        self.0.size()
    }

    /// Returns parameters of the convolution.
    pub fn params(&self) -> &I8Params {
        self.0.params()
    }

    /// Sets convolution parameters.
    pub fn set_params(&mut self, params: I8Params) -> Result<(), Error> {
        self.0.set_params(params)
    }

    /// Returns the convolution with packed filters.
    ///
    /// # Parameters
    ///
    /// - `filters` should have `MxK_HxK_WxC` layout, where `M` is the number of filters,
    ///   `K_H` and `K_W` are spatial dimensions of a filter, `C` is the number of input channels
    ///   per group.
    pub fn with_filters<'a>(
        self,
        filters: impl Into<ArrayView4<'a, i8>>,
    ) -> Result<FiltersConvolution, Error> {
        self.0
            .with_filters(filters.into(), None)
            .map(FiltersConvolution)
    }

    /// Returns the convolution with packed filters and filter biases.
    pub fn with_biased_filters<'a>(
        self,
        filters: impl Into<ArrayView4<'a, i8>>,
        filter_biases: &[i32],
    ) -> Result<FiltersConvolution, Error> {
        self.0
            .with_filters(filters.into(), Some(filter_biases))
            .map(FiltersConvolution)
    }

    /// Performs convolution on the provided `signal` and `filters`.
    ///
    /// # Parameters
    ///
    /// - `filters` should have `MxK_HxK_WxC` layout, where `M` is the number of filters,
    ///   `K_H` and `K_W` are spatial dimensions of a filter, `C` is the number of input channels
    ///   per group.
    ///
    /// # Return value
    ///
    /// The output will have the same layout as `signal`.
    ///
    /// # Errors
    ///
    /// - Returns an error if `filters` do not have expected spatial dimensions, i.e.,
    ///   [`Self::size()`].
    /// - Likewise, returns an error if the number of input channels differs from the number of
    ///   channels in `filters` multiplied by the number of groups.
    pub fn compute<'a>(
        &self,
        signal: FeatureMap<'_>,
        filters: impl Into<ArrayView4<'a, i8>>,
    ) -> Result<Array4<i8>, Error> {
        self.0.compute(signal, filters.into(), None)
    }

    /// Performs convolution on the provided `signal` and `filters`, with the output offset
    /// by the provided per-filter biases.
    ///
    /// Parameters, return value and errors are generally the same as for
    /// [`compute()`](#method.compute).
    pub fn compute_with_biases<'a>(
        &self,
        signal: FeatureMap<'_>,
        filters: impl Into<ArrayView4<'a, i8>>,
        filter_biases: &[i32],
    ) -> Result<Array4<i8>, Error> {
        self.0.compute(signal, filters.into(), Some(filter_biases))
    }
}

/// Convolution with packed filters.
#[derive(Debug)]
pub struct FiltersConvolution(Base<Filters>);

impl FiltersConvolution {
    /// Spatial size of the convolution.
    pub fn size(&self) -> [usize; 2] {
        self.0.size()
    }

    /// Returns parameters of the convolution.
    pub fn params(&self) -> &I8Params {
        self.0.params()
    }

    /// Sets convolution parameters. Filters are repacked according to the new params.
    pub fn set_params(&mut self, params: I8Params) -> Result<(), Error> {
        self.0.set_params(params)
    }

    /// Computes the convolution on the provided signal.
    pub fn compute(&self, signal: FeatureMap<'_>) -> Result<Array4<i8>, Error> {
        self.0.compute(signal)
    }
}
