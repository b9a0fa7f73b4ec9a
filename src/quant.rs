//! Fixed-point requantization of `i32` accumulators to `i8` outputs.
//!
//! Quantized tensors represent real values as `scale * (q - zero_point)`. Convolving
//! two quantized tensors yields an `i32` accumulator whose real value is
//! `input.scale * filter.scale * acc`; mapping it to the output tensor requires multiplying
//! by `input.scale * filter.scale / output.scale`. This real-valued factor is approximated
//! by a [`Multiplier`], so that no floating-point operations are performed in kernels.

use std::ops::Range;

/// Minimum value of the `i8` output range.
pub const INT8_MIN: i32 = i8::MIN as i32;
/// Maximum value of the `i8` output range.
pub const INT8_MAX: i32 = i8::MAX as i32;

/// Scale and zero point of a quantized tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantArg {
    /// Real-valued scale.
    pub scale: f32,
    /// Quantized value corresponding to the real zero.
    pub zero_point: i32,
}

impl Default for QuantArg {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl QuantArg {
    /// Unit scale and zero zero point.
    pub const IDENTITY: Self = Self {
        scale: 1.0,
        zero_point: 0,
    };

    /// Creates quantization params.
    pub const fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// Zero point saturated to the `i8` range, i.e., the value used to fill padding.
    #[allow(clippy::cast_possible_truncation)]
    pub fn clamped_zero_point(self) -> i8 {
        self.zero_point.clamp(INT8_MIN, INT8_MAX) as i8
    }
}

/// Fixed-point representation of a real-valued scale.
///
/// The represented scale is `multiplier * 2^left_shift / 2^right_shift`. The canonical form
/// produced by [`Self::from_scale()`] keeps `multiplier` in `[2^30, 2^31)`, so that
/// `multiplier / 2^31` is the mantissa of the scale; e.g., `1.0` is represented
/// as `{ multiplier: 2^30, left_shift: 0, right_shift: 30 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Multiplier {
    /// Fixed-point multiplier.
    pub multiplier: i32,
    /// Shift applied to the accumulator before multiplication.
    pub left_shift: u32,
    /// Rounding shift applied to the 64-bit product.
    pub right_shift: u32,
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Multiplier {
    /// Multiplier representing `1.0`.
    pub const IDENTITY: Self = Self {
        multiplier: 1 << 30,
        left_shift: 0,
        right_shift: 30,
    };

    /// Creates a multiplier from raw parts.
    pub const fn new(multiplier: i32, left_shift: u32, right_shift: u32) -> Self {
        Self {
            multiplier,
            left_shift,
            right_shift,
        }
    }

    /// Converts a real-valued scale into canonical fixed-point form. Non-positive
    /// and non-finite scales produce a zero multiplier.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_scale(scale: f64) -> Self {
        if !(scale > 0.0 && scale.is_finite()) {
            return Self::new(0, 0, 0);
        }

        // `scale = mantissa * 2^exponent` with `mantissa` in `[0.5, 1)`.
        let mut exponent = scale.log2().floor() as i32 + 1;
        let mut mantissa = scale / 2.0_f64.powi(exponent);
        if mantissa >= 1.0 {
            mantissa /= 2.0;
            exponent += 1;
        } else if mantissa < 0.5 {
            mantissa *= 2.0;
            exponent -= 1;
        }

        let mut multiplier = (mantissa * (1_u64 << 31) as f64).round() as i64;
        if multiplier == 1 << 31 {
            multiplier /= 2;
            exponent += 1;
        }

        let right_shift = 31 - exponent;
        if right_shift >= 0 {
            Self::new(multiplier as i32, 0, right_shift as u32)
        } else {
            Self::new(multiplier as i32, (-right_shift) as u32, 0)
        }
    }

    /// Real-valued scale represented by this multiplier.
    pub fn scale(self) -> f64 {
        f64::from(self.multiplier) * 2.0_f64.powi(self.left_shift as i32)
            / 2.0_f64.powi(self.right_shift as i32)
    }

    /// Rescales the accumulator. Ties are rounded away from zero; the result saturates
    /// to the `i32` range.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub fn apply(self, acc: i32) -> i32 {
        let shifted = i128::from(acc) << self.left_shift.min(63);
        let product = shifted * i128::from(self.multiplier);
        let value = rounding_shift_right(product, self.right_shift);
        value.clamp(i128::from(i32::MIN), i128::from(i32::MAX)) as i32
    }
}

/// Divides `value` by `2^shift`, rounding half away from zero.
#[inline]
pub fn rounding_shift_right(value: i128, shift: u32) -> i128 {
    if shift == 0 {
        return value;
    }
    let shift = shift.min(126);
    let half = 1_i128 << (shift - 1);
    if value >= 0 {
        (value + half) >> shift
    } else {
        -((half - value) >> shift)
    }
}

/// Clamp bounds applied to requantized values (e.g., a fused ReLU).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivationRange {
    /// Lower bound.
    pub min: i32,
    /// Upper bound.
    pub max: i32,
}

impl Default for ActivationRange {
    fn default() -> Self {
        Self::FULL
    }
}

impl ActivationRange {
    /// Full `i8` range; no activation.
    pub const FULL: Self = Self {
        min: INT8_MIN,
        max: INT8_MAX,
    };

    /// Fused ReLU for the given output quantization.
    pub fn relu(output: QuantArg) -> Self {
        Self {
            min: output.zero_point.clamp(INT8_MIN, INT8_MAX),
            max: INT8_MAX,
        }
    }

    /// Fused ReLU6 for the given output quantization.
    #[allow(clippy::cast_possible_truncation)]
    pub fn relu6(output: QuantArg) -> Self {
        let six = (6.0 / f64::from(output.scale)).round();
        let max = if six.is_finite() {
            six.min(f64::from(INT8_MAX) - f64::from(output.zero_point)) as i32
                + output.zero_point
        } else {
            INT8_MAX
        };
        Self {
            min: output.zero_point.clamp(INT8_MIN, INT8_MAX),
            max: max.clamp(INT8_MIN, INT8_MAX),
        }
    }

    /// Clamps `value` to this range intersected with the `i8` range.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub fn clamp(self, value: i32) -> i8 {
        value
            .max(self.min.max(INT8_MIN))
            .min(self.max.min(INT8_MAX)) as i8
    }
}

/// Rescales an accumulator to the output domain, shifts it by the output zero point
/// and clamps it to the activation range.
#[inline]
pub fn requantize(
    acc: i32,
    multiplier: Multiplier,
    output_zero_point: i32,
    activation: ActivationRange,
) -> i8 {
    activation.clamp(multiplier.apply(acc).saturating_add(output_zero_point))
}

/// Either a single value applying to all output channels, or one value per channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Granularity<T> {
    /// Single value for the entire tensor.
    PerTensor(T),
    /// Value per output channel.
    PerChannel(Vec<T>),
}

impl<T> Granularity<T> {
    /// Returns the value for the specified output channel.
    ///
    /// # Panics
    ///
    /// Panics if values are per-channel and `channel` is out of bounds.
    #[inline]
    pub fn get(&self, channel: usize) -> &T {
        match self {
            Self::PerTensor(value) => value,
            Self::PerChannel(values) => &values[channel],
        }
    }

    /// Checks whether values are specified per channel.
    pub fn is_per_channel(&self) -> bool {
        matches!(self, Self::PerChannel(_))
    }

    /// Number of channels covered, or `None` for per-tensor values.
    pub fn channel_count(&self) -> Option<usize> {
        match self {
            Self::PerTensor(_) => None,
            Self::PerChannel(values) => Some(values.len()),
        }
    }
}

impl<T: Clone> Granularity<T> {
    fn slice(&self, channels: Range<usize>) -> Self {
        match self {
            Self::PerTensor(value) => Self::PerTensor(value.clone()),
            Self::PerChannel(values) => Self::PerChannel(values[channels].to_vec()),
        }
    }
}

/// Filter quantization together with the multiplier rescaling its accumulators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterQuant {
    /// Filter scale and zero point.
    pub arg: QuantArg,
    /// Multiplier approximating `input.scale * arg.scale / output.scale`.
    pub multiplier: Multiplier,
}

impl FilterQuant {
    /// Derives the multiplier from real-valued scales.
    pub fn new(input: QuantArg, filter: QuantArg, output: QuantArg) -> Self {
        let scale =
            f64::from(input.scale) * f64::from(filter.scale) / f64::from(output.scale);
        Self {
            arg: filter,
            multiplier: Multiplier::from_scale(scale),
        }
    }
}

/// Quantization params of a convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    /// Quantization of the signal.
    pub input: QuantArg,
    /// Quantization of the output.
    pub output: QuantArg,
    /// Filter quantization with the corresponding multipliers.
    pub filters: Granularity<FilterQuant>,
    /// Output clamp bounds.
    pub activation: ActivationRange,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self::identity()
    }
}

impl QuantParams {
    /// Params under which quantized values coincide with real values.
    pub fn identity() -> Self {
        Self {
            input: QuantArg::IDENTITY,
            output: QuantArg::IDENTITY,
            filters: Granularity::PerTensor(FilterQuant {
                arg: QuantArg::IDENTITY,
                multiplier: Multiplier::IDENTITY,
            }),
            activation: ActivationRange::FULL,
        }
    }

    /// Per-tensor quantization with the multiplier derived from scales.
    pub fn per_tensor(input: QuantArg, filter: QuantArg, output: QuantArg) -> Self {
        Self {
            input,
            output,
            filters: Granularity::PerTensor(FilterQuant::new(input, filter, output)),
            activation: ActivationRange::FULL,
        }
    }

    /// Per-channel filter quantization with multipliers derived from scales.
    pub fn per_channel(input: QuantArg, filters: &[QuantArg], output: QuantArg) -> Self {
        let filters = filters
            .iter()
            .map(|&filter| FilterQuant::new(input, filter, output))
            .collect();
        Self {
            input,
            output,
            filters: Granularity::PerChannel(filters),
            activation: ActivationRange::FULL,
        }
    }

    /// Replaces the activation range.
    #[must_use]
    pub fn with_activation(mut self, activation: ActivationRange) -> Self {
        self.activation = activation;
        self
    }

    /// Checks whether filters are quantized per channel.
    pub fn is_per_channel(&self) -> bool {
        self.filters.is_per_channel()
    }

    /// Returns filter quantization for the specified output channel.
    #[inline]
    pub fn filter(&self, channel: usize) -> &FilterQuant {
        self.filters.get(channel)
    }

    /// Returns the filter zero point for the specified output channel.
    #[inline]
    pub fn filter_zero_point(&self, channel: usize) -> i32 {
        self.filters.get(channel).arg.zero_point
    }

    /// Requantizes an accumulator for the specified output channel.
    #[inline]
    pub fn requantize(&self, acc: i32, channel: usize) -> i8 {
        self.requantize_with_zero_point(acc, channel, self.output.zero_point)
    }

    /// Same as [`Self::requantize()`], with an overridden output zero point.
    #[inline]
    pub fn requantize_with_zero_point(&self, acc: i32, channel: usize, zero_point: i32) -> i8 {
        let multiplier = self.filters.get(channel).multiplier;
        requantize(acc, multiplier, zero_point, self.activation)
    }

    /// Restricts per-channel params to a range of output channels.
    pub(crate) fn for_channels(&self, channels: Range<usize>) -> Self {
        Self {
            filters: self.filters.slice(channels),
            ..self.clone()
        }
    }
}
