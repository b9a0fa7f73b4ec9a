//! Errors reported when configuring convolutions.

use thiserror::Error;

/// Errors that can occur when configuring or running a convolution.
///
/// Kernels themselves never report errors; all checks happen when descriptors are built
/// and when the high-level API prepares buffers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid convolution geometry, such as a zero stride.
    #[error("invalid convolution geometry: {0}")]
    Geometry(&'static str),

    /// The dilated kernel does not fit into the padded signal.
    #[error("convolution kernel does not fit into the padded signal")]
    EmptyOutput,

    /// Output dimensions disagree with the convolution output formula.
    #[error("output dimensions {actual:?} differ from expected {expected:?}")]
    OutputShape {
        /// Dimensions following from the signal shape and params.
        expected: [usize; 2],
        /// Dimensions in the descriptor.
        actual: [usize; 2],
    },

    /// Channel count cannot be split into the requested number of groups.
    #[error("{count} channels cannot be split into {groups} groups")]
    Groups {
        /// Number of channels.
        count: usize,
        /// Number of groups.
        groups: usize,
    },

    /// Number of signal channels disagrees with filters.
    #[error("signal has {signal} channels, while filters expect {expected}")]
    ChannelMismatch {
        /// Channels in the signal.
        signal: usize,
        /// Channels expected by filters and groups.
        expected: usize,
    },

    /// Filter spatial dimensions disagree with the convolution size.
    #[error("invalid filter shape: expected {expected:?}, got {actual:?}")]
    FilterSize {
        /// Convolution size.
        expected: [usize; 2],
        /// Spatial size of filters.
        actual: [usize; 2],
    },

    /// Number of filter biases disagrees with the number of filters.
    #[error("got {actual} filter biases for {expected} filters")]
    BiasCount {
        /// Number of filters.
        expected: usize,
        /// Number of biases.
        actual: usize,
    },

    /// Per-channel quantization does not cover every output channel.
    #[error("per-channel quantization has {actual} entries for {expected} output channels")]
    QuantChannels {
        /// Number of output channels.
        expected: usize,
        /// Number of quantization entries.
        actual: usize,
    },

    /// Error converting buffers to arrays.
    #[error("cannot shape convolution output: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
