//! Feature maps and prepared filters.

use ndarray::{Array4, ArrayView4};

use std::borrow::Cow;

use crate::{
    base::{Base, Strategy},
    packing::{self, GemmLayout},
    params::I8Params,
    quant::QuantParams,
    Error,
};

/// Shape of a [`FeatureMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeatureMapShape {
    /// Number of samples constituting the map.
    pub batch_size: usize,
    /// Spatial width.
    pub width: usize,
    /// Spatial height.
    pub height: usize,
    /// Number of channels.
    pub channels: usize,
}

impl FeatureMapShape {
    fn from_nhwc_slice(shape: &[usize]) -> Self {
        FeatureMapShape {
            batch_size: shape[0],
            height: shape[1],
            width: shape[2],
            channels: shape[3],
        }
    }

    fn from_nchw_slice(shape: &[usize]) -> Self {
        FeatureMapShape {
            batch_size: shape[0],
            height: shape[2],
            width: shape[3],
            channels: shape[1],
        }
    }

    /// Number of elements in a map with this shape.
    pub fn len(self) -> usize {
        self.batch_size * self.height * self.width * self.channels
    }

    /// Checks whether a map with this shape has no elements.
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Number of pixels in a single sample.
    pub(crate) fn pixels(self) -> usize {
        self.height * self.width
    }

    fn as_array(self, layout: Layout) -> [usize; 4] {
        match layout {
            Layout::ChannelsFirst => [self.batch_size, self.channels, self.height, self.width],
            Layout::ChannelsLast => [self.batch_size, self.height, self.width, self.channels],
        }
    }
}

/// Memory layout of a [`FeatureMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// `NCHW` / "channels-first" layout. In this layout, channels are an outer dimension compared
    /// to spatial width and height.
    ChannelsFirst,
    /// `NHWC` / "channels-last" layout. In this layout, channels are the innermost dimension.
    ///
    /// This layout is preferred because it is used internally by all kernels; signals
    /// in the other layout are transposed before the computation.
    ChannelsLast,
}

/// Feature map, i.e., a signal or output of the convolution operation.
///
/// Internally, a `FeatureMap` is a thin wrapper around [`ArrayView`](ndarray::ArrayView)
/// that additionally indicates the memory layout of the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureMap<'a> {
    layout: Layout,
    inner: ArrayView4<'a, i8>,
    shape: FeatureMapShape,
}

impl<'a> FeatureMap<'a> {
    /// Constructs a map from an NCHW-ordered tensor.
    pub fn nchw(array: impl Into<ArrayView4<'a, i8>>) -> Self {
        let array = array.into();
        Self {
            layout: Layout::ChannelsFirst,
            shape: FeatureMapShape::from_nchw_slice(array.shape()),
            inner: array,
        }
    }

    /// Constructs a map from an NHWC-ordered tensor.
    pub fn nhwc(array: impl Into<ArrayView4<'a, i8>>) -> Self {
        let array = array.into();
        Self {
            layout: Layout::ChannelsLast,
            shape: FeatureMapShape::from_nhwc_slice(array.shape()),
            inner: array,
        }
    }

    /// Gets the layout of this map.
    pub fn layout(self) -> Layout {
        self.layout
    }

    /// Gets the shape of this map.
    pub fn shape(self) -> FeatureMapShape {
        self.shape
    }

    fn to_nhwc(self) -> ArrayView4<'a, i8> {
        match self.layout {
            Layout::ChannelsFirst => self.inner.permuted_axes([0, 2, 3, 1]),
            Layout::ChannelsLast => self.inner,
        }
    }

    /// Returns the map contents as a contiguous NHWC slice, copying them if necessary.
    pub(crate) fn nhwc_data(self) -> Cow<'a, [i8]> {
        let view = self.to_nhwc();
        match view.to_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(view.iter().copied().collect()),
        }
    }
}

/// Converts NHWC output data to an array with the specified layout.
pub(crate) fn shape_output(
    data: Vec<i8>,
    shape: FeatureMapShape,
    layout: Layout,
) -> Result<Array4<i8>, Error> {
    let output = Array4::from_shape_vec(shape.as_array(Layout::ChannelsLast), data)?;
    Ok(match layout {
        Layout::ChannelsLast => output,
        Layout::ChannelsFirst => output
            .permuted_axes([0, 3, 1, 2])
            .as_standard_layout()
            .into_owned(),
    })
}

/// Packed weights of a single group of the GEMM path.
#[derive(Debug, Clone)]
pub(crate) struct GroupWeights {
    pub layout: GemmLayout,
    pub quant: QuantParams,
    pub weight: Vec<i8>,
    /// Biases with folded zero point corrections, padded to `layout.up_round_oc`.
    pub bias: Vec<i32>,
}

/// Filters packed for a specific kernel.
#[derive(Debug, Clone)]
pub(crate) enum PackedFilters {
    Dw3x3 { weight: Vec<i16>, bias: Vec<i32> },
    SlidingWindow { weight: Vec<i16>, bias: Vec<i32> },
    Gemm { groups: Vec<GroupWeights> },
}

/// Container for convolution filters and optionally filter biases.
#[derive(Debug, Clone)]
pub(crate) struct Filters {
    raw: Array4<i8>,
    biases: Option<Vec<i32>>,
    packed: PackedFilters,
}

impl Filters {
    pub fn filter_count(&self) -> usize {
        self.raw.shape()[0]
    }

    pub fn channel_count(&self) -> usize {
        self.raw.shape()[3]
    }

    pub fn packed(&self) -> &PackedFilters {
        &self.packed
    }

    pub fn new<T>(
        filters: ArrayView4<'_, i8>,
        biases: Option<&[i32]>,
        conv: &Base<T>,
    ) -> Result<Self, Error> {
        let expected = conv.size();
        let actual = [filters.shape()[1], filters.shape()[2]];
        if expected != actual {
            return Err(Error::FilterSize { expected, actual });
        }
        if let Some(biases) = biases {
            if biases.len() != filters.shape()[0] {
                return Err(Error::BiasCount {
                    expected: filters.shape()[0],
                    actual: biases.len(),
                });
            }
        }

        let mut this = Self {
            raw: filters.as_standard_layout().into_owned(),
            biases: biases.map(<[i32]>::to_vec),
            packed: PackedFilters::Gemm { groups: vec![] },
        };
        this.pack(conv)?;
        Ok(this)
    }

    /// Packs filters according to the current convolution params.
    pub fn pack<T>(&mut self, conv: &Base<T>) -> Result<(), Error> {
        let params = conv.params();
        let filter_count = self.filter_count();
        let groups = params.common.groups;
        if groups == 0 || filter_count % groups != 0 {
            return Err(Error::Groups {
                count: filter_count,
                groups,
            });
        }
        if let Some(count) = params.quant.filters.channel_count() {
            if count != filter_count {
                return Err(Error::QuantChannels {
                    expected: filter_count,
                    actual: count,
                });
            }
        }

        let strategy = Strategy::select(conv.size(), filter_count, self.channel_count(), params);
        let raw = self
            .raw
            .as_slice()
            .ok_or(Error::Geometry("filters must be contiguous"))?;
        let bias = self
            .biases
            .clone()
            .unwrap_or_else(|| vec![0; filter_count]);
        let plane = conv.size()[0] * conv.size()[1];

        self.packed = match strategy {
            Strategy::Dw3x3 => {
                let mut weight = vec![0; packing::dw3x3_weight_len(filter_count)];
                packing::pack_dw3x3_weights(raw, filter_count, &params.quant, &mut weight);
                PackedFilters::Dw3x3 { weight, bias }
            }
            Strategy::SlidingWindow => {
                let mut weight = vec![0; packing::depthwise_weight_len(filter_count, plane)];
                packing::pack_depthwise_weights(
                    raw,
                    filter_count,
                    plane,
                    &params.quant,
                    &mut weight,
                );
                PackedFilters::SlidingWindow { weight, bias }
            }
            Strategy::Gemm => PackedFilters::Gemm {
                groups: self.pack_groups(raw, conv, params),
            },
        };
        log::trace!(
            "packed {} filters for {:?} strategy",
            filter_count,
            strategy
        );
        Ok(())
    }

    fn pack_groups<T>(&self, raw: &[i8], conv: &Base<T>, params: &I8Params) -> Vec<GroupWeights> {
        let groups = params.common.groups;
        let group_filters = self.filter_count() / groups;
        let deep = conv.size()[0] * conv.size()[1] * self.channel_count();
        let config = conv.config();

        (0..groups)
            .map(|group| {
                let filters = group * group_filters..(group + 1) * group_filters;
                let quant = params.quant.for_channels(filters.clone());
                let layout = GemmLayout::from_dims(
                    deep,
                    group_filters,
                    config.tile_num,
                    config.matmul_kernel.is_some(),
                    quant.is_per_channel(),
                );

                let raw = &raw[filters.start * deep..filters.end * deep];
                let mut weight = vec![0; layout.packed_weight_len()];
                packing::pack_gemm_weights(raw, &layout, &mut weight);
                let mut bias = vec![0; layout.up_round_oc];
                let biases = self.biases.as_ref().map(|biases| &biases[filters]);
                packing::fold_zero_points_into_bias(
                    raw,
                    biases,
                    deep,
                    &quant,
                    &mut bias[..group_filters],
                );
                GroupWeights {
                    layout,
                    quant,
                    weight,
                    bias,
                }
            })
            .collect()
    }
}
