use ndarray::{Array4, ArrayView4};
use rayon::prelude::*;

use std::borrow::Cow;

use crate::{
    buffers::{shape_output, FeatureMap, FeatureMapShape, Filters, GroupWeights, PackedFilters},
    kernels::{
        conv::{self, GemmPath, Scratch},
        depthwise, dw3x3,
        gemm::{default_kernel, MatmulKernel},
        units_per_task,
    },
    packing::{self, C8},
    params::{ConvDescriptor, I8Params, Params},
    sliding::SlidingWindow,
    Convolution, Error,
};

/// Execution settings shared by all convolutions created by a builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecConfig {
    pub threads: usize,
    pub tile_num: usize,
    /// `None` selects the reference GEMM path.
    pub matmul_kernel: Option<&'static dyn MatmulKernel>,
}

impl ExecConfig {
    fn gemm_path(&self) -> GemmPath<'static> {
        self.matmul_kernel.map_or(GemmPath::Reference, GemmPath::Optimized)
    }
}

/// Convolution builder. The same builder can be used to create multiple `Convolution`s
/// which share the same spatial size and execution settings.
#[derive(Debug, Clone)]
pub struct ConvolutionBuilder {
    size: [usize; 2],
    config: ExecConfig,
}

impl ConvolutionBuilder {
    /// Initializes a builder with a specific filter size.
    pub(crate) fn new(size: [usize; 2]) -> Self {
        Self {
            size,
            config: ExecConfig {
                threads: rayon::current_num_threads(),
                tile_num: ConvDescriptor::DEFAULT_TILE_NUM,
                matmul_kernel: Some(default_kernel()),
            },
        }
    }

    /// Sets the number of partitions the output is split into. Partitions are computed
    /// in parallel on the `rayon` thread pool. The default value is the number of threads
    /// in the current pool.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads.max(1);
        self
    }

    /// Sets the number of output pixels processed per GEMM tile.
    #[must_use]
    pub fn tile_num(mut self, tile_num: usize) -> Self {
        self.config.tile_num = tile_num.max(1);
        self
    }

    /// Switches general convolutions to the reference (non-tiled) GEMM path.
    #[must_use]
    pub fn reference_gemm(mut self) -> Self {
        self.config.matmul_kernel = None;
        self
    }

    /// Sets the kernel used by the optimized GEMM path. By default, the kernel is chosen
    /// based on CPU features.
    #[must_use]
    pub fn matmul_kernel(mut self, kernel: &'static dyn MatmulKernel) -> Self {
        self.config.matmul_kernel = Some(kernel);
        self
    }

    /// Creates a new convolution with the specified params.
    pub fn build(&self, params: I8Params) -> Result<Convolution, Error> {
        Base::new(self, params).map(Convolution)
    }
}

/// Kernel family used to compute a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Strategy {
    Dw3x3,
    SlidingWindow,
    Gemm,
}

impl Strategy {
    pub fn select(
        size: [usize; 2],
        filter_count: usize,
        filter_channels: usize,
        params: &I8Params,
    ) -> Self {
        let Params {
            strides,
            dilation,
            groups,
            ..
        } = params.common;
        if filter_channels != 1 || filter_count != groups {
            return Strategy::Gemm;
        }

        let blocked = size == [3, 3]
            && dilation == [1, 1]
            && strides[0] == strides[1]
            && (strides[0] == 1 || strides[0] == 2)
            && filter_count % C8 == 0;
        if blocked {
            Strategy::Dw3x3
        } else {
            Strategy::SlidingWindow
        }
    }
}

#[derive(Debug)]
pub(crate) struct Base<T> {
    size: [usize; 2],
    params: I8Params,
    config: ExecConfig,
    buffers: T,
}

impl<T> Base<T> {
    pub fn size(&self) -> [usize; 2] {
        self.size
    }

    pub fn params(&self) -> &I8Params {
        &self.params
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    fn descriptor(
        &self,
        signal: FeatureMapShape,
        filters: &Filters,
    ) -> Result<ConvDescriptor, Error> {
        let expected = filters.channel_count() * self.params.common.groups;
        if signal.channels != expected {
            return Err(Error::ChannelMismatch {
                signal: signal.channels,
                expected,
            });
        }
        let desc = ConvDescriptor::new(
            signal,
            self.size,
            filters.filter_count(),
            self.params.common,
            self.params.quant.clone(),
        )?;
        Ok(desc
            .with_threads(self.config.threads)
            .with_tile_num(self.config.tile_num))
    }

    fn run(&self, signal: FeatureMap<'_>, filters: &Filters) -> Result<Array4<i8>, Error> {
        let desc = self.descriptor(signal.shape(), filters)?;
        let input = signal.nhwc_data();
        let mut output = vec![0_i8; desc.output.len()];
        if !output.is_empty() {
            match filters.packed() {
                PackedFilters::Dw3x3 { weight, bias } => {
                    log::debug!("computing {:?} with 3x3 depthwise kernel", desc.output);
                    compute_dw3x3(&desc, &input, weight, bias, &mut output);
                }
                PackedFilters::SlidingWindow { weight, bias } => {
                    log::debug!("computing {:?} with sliding-window kernel", desc.output);
                    compute_sliding(&desc, &input, weight, bias, &mut output);
                }
                PackedFilters::Gemm { groups } => {
                    log::debug!(
                        "computing {:?} with {:?} GEMM path in {} group(s)",
                        desc.output,
                        self.config.gemm_path(),
                        groups.len()
                    );
                    self.compute_gemm(&desc, &input, groups, &mut output)?;
                }
            }
        }
        shape_output(output, desc.output, signal.layout())
    }

    fn compute_gemm(
        &self,
        desc: &ConvDescriptor,
        input: &[i8],
        groups: &[GroupWeights],
        output: &mut [i8],
    ) -> Result<(), Error> {
        let group_count = groups.len();
        let in_channels = desc.input.channels / group_count;
        let out_channels = desc.output.channels / group_count;
        let path = self.config.gemm_path();

        for (group, weights) in groups.iter().enumerate() {
            let group_desc = ConvDescriptor::new(
                FeatureMapShape {
                    channels: in_channels,
                    ..desc.input
                },
                desc.kernel,
                out_channels,
                Params {
                    groups: 1,
                    ..desc.params
                },
                weights.quant.clone(),
            )?
            .with_threads(desc.thread_num)
            .with_tile_num(desc.tile_num);

            if group_count == 1 {
                gemm_group(&group_desc, input, weights, path, output);
            } else {
                let channels = group * in_channels..(group + 1) * in_channels;
                let group_input: Vec<i8> = input
                    .chunks(desc.input.channels)
                    .flat_map(|pixel| pixel[channels.clone()].iter().copied())
                    .collect();
                let mut group_output = vec![0; group_desc.output.len()];
                gemm_group(&group_desc, &group_input, weights, path, &mut group_output);

                let offset = group * out_channels;
                for (dst, src) in output
                    .chunks_mut(desc.output.channels)
                    .zip(group_output.chunks(out_channels))
                {
                    dst[offset..offset + out_channels].copy_from_slice(src);
                }
            }
        }
        Ok(())
    }
}

fn compute_dw3x3(
    desc: &ConvDescriptor,
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    output: &mut [i8],
) {
    let sliding = SlidingWindow::new(desc, C8);
    let row_len = desc.output.width * desc.output.channels;
    let rows_per_task = units_per_task(desc.output.batch_size * desc.output.height, desc.thread_num);
    let stride = desc.params.strides[0];

    output
        .par_chunks_mut(rows_per_task * row_len)
        .enumerate()
        .for_each(|(task_id, chunk)| {
            let start = task_id * rows_per_task;
            let rows = start..start + chunk.len() / row_len;
            let mut scratch = vec![0; dw3x3::scratch_len(stride)];
            dw3x3::border_rows(chunk, rows.clone(), input, weight, bias, desc, &sliding);
            dw3x3::interior_rows(chunk, rows, &mut scratch, input, weight, bias, desc, &sliding);
        });
}

fn compute_sliding(
    desc: &ConvDescriptor,
    input: &[i8],
    weight: &[i16],
    bias: &[i32],
    output: &mut [i8],
) {
    let channels = desc.output.channels;
    let sliding = SlidingWindow::new(desc, C8);
    let ic_align = sliding.ic_align;
    let input_zp = desc.quant.input.clamped_zero_point();

    let input: Cow<'_, [i8]> = if ic_align == channels {
        Cow::Borrowed(input)
    } else {
        let mut aligned = vec![0; desc.input.batch_size * sliding.in_step];
        packing::align_channels(input, channels, ic_align, input_zp, &mut aligned);
        Cow::Owned(aligned)
    };
    let input_zps = vec![input_zp; channels];
    let output_zps = vec![desc.quant.output.zero_point; channels];

    let rows_per_task = units_per_task(desc.output.batch_size * desc.output.height, desc.thread_num);
    let run = |target: &mut [i8]| {
        target
            .par_chunks_mut(rows_per_task * sliding.out_h_step)
            .enumerate()
            .for_each(|(task_id, chunk)| {
                let start = task_id * rows_per_task;
                let rows = start..start + chunk.len() / sliding.out_h_step;
                depthwise::conv_dw_int8_sw_rows(
                    chunk,
                    rows,
                    &input,
                    weight,
                    bias,
                    &input_zps,
                    &output_zps,
                    desc,
                    &sliding,
                );
            });
    };

    if ic_align == channels {
        run(output);
    } else {
        let mut aligned = vec![0; desc.output.batch_size * sliding.out_step];
        run(&mut aligned);
        for (dst, src) in output.chunks_mut(channels).zip(aligned.chunks(ic_align)) {
            dst.copy_from_slice(&src[..channels]);
        }
    }
}

fn gemm_group(
    desc: &ConvDescriptor,
    input: &[i8],
    weights: &GroupWeights,
    path: GemmPath<'_>,
    output: &mut [i8],
) {
    let layout = weights.layout;
    debug_assert_eq!(layout, path.layout(desc));
    let pixels = desc.output.pixels();
    let out_channels = desc.output.channels;
    let tiles_per_sample = (pixels + desc.tile_num - 1) / desc.tile_num;
    let tiles_per_task = units_per_task(tiles_per_sample, desc.thread_num);

    for (batch, sample_output) in output.chunks_mut(pixels * out_channels).enumerate() {
        sample_output
            .par_chunks_mut(tiles_per_task * desc.tile_num * out_channels)
            .enumerate()
            .for_each(|(task_id, chunk)| {
                let first = task_id * tiles_per_task;
                let last = (first + tiles_per_task).min(tiles_per_sample);
                let tiles = batch * tiles_per_sample + first..batch * tiles_per_sample + last;
                let output_offset = (batch * pixels + first * desc.tile_num) * out_channels;

                let mut packed_input = vec![0; layout.packed_input_len()];
                let mut matmul_input = vec![0; layout.matmul_input_len()];
                let mut input_sum = vec![0; layout.input_sum_len()];
                let scratch = Scratch {
                    packed_input: &mut packed_input,
                    matmul_input: &mut matmul_input,
                    input_sum: &mut input_sum,
                };
                conv::conv_tiles(
                    input,
                    scratch,
                    &weights.weight,
                    &weights.bias,
                    chunk,
                    output_offset,
                    tiles,
                    desc,
                    path,
                );
            });
    }
}

impl Base<()> {
    pub fn new(builder: &ConvolutionBuilder, params: I8Params) -> Result<Self, Error> {
        params.common.check(builder.size)?;
        Ok(Base {
            size: builder.size,
            params,
            config: builder.config,
            buffers: (),
        })
    }

    pub fn set_params(&mut self, params: I8Params) -> Result<(), Error> {
        params.common.check(self.size)?;
        self.params = params;
        Ok(())
    }

    pub fn with_filters(
        self,
        filters: ArrayView4<'_, i8>,
        filter_biases: Option<&[i32]>,
    ) -> Result<Base<Filters>, Error> {
        let filters = Filters::new(filters, filter_biases, &self)?;
        Ok(Base {
            buffers: filters,
            size: self.size,
            params: self.params,
            config: self.config,
        })
    }

    pub fn compute(
        &self,
        signal: FeatureMap<'_>,
        filters: ArrayView4<'_, i8>,
        filter_biases: Option<&[i32]>,
    ) -> Result<Array4<i8>, Error> {
        let filters = Filters::new(filters, filter_biases, self)?;
        self.run(signal, &filters)
    }
}

impl Base<Filters> {
    pub fn set_params(&mut self, params: I8Params) -> Result<(), Error> {
        params.common.check(self.size)?;
        let previous = std::mem::replace(&mut self.params, params);
        let mut filters = self.buffers.clone();
        match filters.pack(self) {
            Ok(()) => {
                self.buffers = filters;
                Ok(())
            }
            Err(err) => {
                self.params = previous;
                Err(err)
            }
        }
    }

    pub fn compute(&self, signal: FeatureMap<'_>) -> Result<Array4<i8>, Error> {
        self.run(signal, &self.buffers)
    }
}
