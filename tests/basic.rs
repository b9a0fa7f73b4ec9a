//! Basic tests for the public convolution API.

use ndarray::{Array4, Axis};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use int8_convolution::{
    ActivationRange, Convolution, Error, FeatureMap, I8Params, Params, QuantArg, QuantParams,
    Tile1x8, Tile4x8,
};

fn create_signal(height: usize, width: usize) -> Array4<i8> {
    Array4::from_shape_vec(
        [1, height, width, 1],
        (0..(width * height)).map(|i| i as i8).collect(),
    )
    .unwrap()
}

/// Params dividing accumulators by `divisor` before rounding.
fn scaled_params(common: Params, divisor: f32) -> I8Params {
    I8Params {
        common,
        quant: QuantParams::per_tensor(
            QuantArg::IDENTITY,
            QuantArg::IDENTITY,
            QuantArg::new(divisor, 0),
        ),
    }
}

#[test]
fn with_padding() -> Result<(), Error> {
    let params = Params {
        pads: [1; 4],
        ..Params::default()
    };
    let convolution = Convolution::new(3).build(scaled_params(params, 2.0))?;

    let signal = create_signal(5, 5);
    let filter = Array4::<i8>::from_elem([1, 3, 3, 1], 1);

    // Raw sums are halved, with ties rounded away from zero.
    let c = convolution.compute(FeatureMap::nhwc(&signal), &filter)?;
    assert_eq!(
        c,
        Array4::<i8>::from_shape_vec(
            [1, 5, 5, 1],
            vec![
                6, 11, 14, 17, 12, //
                17, 27, 32, 36, 26, //
                32, 50, 54, 59, 41, //
                47, 72, 77, 81, 56, //
                36, 56, 59, 62, 42, //
            ],
        )?,
    );
    Ok(())
}

#[test]
fn with_strides() -> Result<(), Error> {
    let params = Params {
        strides: [2, 2],
        ..Params::default()
    };
    let convolution = Convolution::new(3).build(scaled_params(params, 4.0))?;

    let signal = create_signal(7, 5);
    let filter = Array4::<i8>::from_elem([1, 3, 3, 1], 1);
    // Raw sums: 54, 72, 144, 162, 234, 252
    let expected_output = Array4::<i8>::from_shape_vec([1, 3, 2, 1], vec![14, 18, 36, 41, 59, 63])?;

    assert_eq!(
        convolution.compute(FeatureMap::nhwc(&signal), &filter)?,
        expected_output
    );
    Ok(())
}

#[test]
fn with_strides_and_padding() -> Result<(), Error> {
    let params = Params {
        strides: [2, 2],
        pads: [1; 4],
        ..Params::default()
    };
    let convolution = Convolution::new(3).build(scaled_params(params, 2.0))?;

    let signal = create_signal(7, 5);
    let filter = Array4::<i8>::from_elem([1, 3, 3, 1], 1);
    let expected_output = Array4::<i8>::from_shape_vec(
        [1, 4, 3, 1],
        vec![6, 14, 12, 32, 54, 41, 62, 99, 71, 56, 89, 62],
    )?;

    assert_eq!(
        convolution.compute(FeatureMap::nhwc(&signal), &filter)?,
        expected_output
    );
    Ok(())
}

#[test]
fn with_several_input_channels() -> Result<(), Error> {
    let convolution = Convolution::new(3).build(I8Params {
        common: Params {
            pads: [1; 4],
            ..Params::default()
        },
        quant: QuantParams::identity(),
    })?;

    let signal: Vec<i8> = (0..100).map(|i| (i / 4) as i8).collect();
    let signal = Array4::from_shape_vec([1, 5, 5, 4], signal)?;
    let filter = Array4::<i8>::from_elem([1, 3, 3, 4], 1);
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filter)?;

    // 48 = 4 * (0 + 1 + 5 + 6), numbers in the upper left corner of the image.
    assert_eq!(output[[0, 0, 0, 0]], 48);
    Ok(())
}

#[test]
fn with_dilation() -> Result<(), Error> {
    let mut convolution = Convolution::new(3).build(I8Params {
        common: Params {
            dilation: [2, 2],
            ..Params::default()
        },
        quant: QuantParams::identity(),
    })?;

    let signal = Array4::<i8>::from_shape_vec([1, 5, 5, 1], (1..=25).collect())?;
    let filters = Array4::<i8>::from_elem([1, 3, 3, 1], 1);

    // 117 = 1 + 3 + ... + 25
    let expected_output = Array4::<i8>::from_elem([1, 1, 1, 1], 117);
    assert_eq!(
        convolution.compute(FeatureMap::nhwc(&signal), &filters)?,
        expected_output
    );

    convolution.set_params(I8Params {
        common: Params {
            pads: [1; 4],
            dilation: [2, 2],
            ..Params::default()
        },
        quant: QuantParams::identity(),
    })?;

    let expected_output = Array4::<i8>::from_shape_vec(
        [1, 3, 3, 1],
        vec![
            52, 78, 52, //
            78, 117, 78, //
            52, 78, 52, //
        ],
    )?;
    assert_eq!(
        convolution.compute(FeatureMap::nhwc(&signal), &filters)?,
        expected_output
    );
    Ok(())
}

#[test]
fn padding_uses_input_zero_point() -> Result<(), Error> {
    let params = I8Params {
        common: Params {
            pads: [1; 4],
            ..Params::default()
        },
        quant: QuantParams::per_tensor(
            QuantArg::new(1.0, 10),
            QuantArg::IDENTITY,
            QuantArg::IDENTITY,
        ),
    };
    // Unbiased signal is zero everywhere, so padding must not contribute either.
    let signal = Array4::<i8>::from_elem([1, 4, 4, 2], 10);
    let filters = Array4::<i8>::from_elem([3, 3, 3, 2], 1);
    let convolution = Convolution::new(3).build(params.clone())?;
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert!(output.iter().all(|&x| x == 0), "{:?}", output);

    // Same check for the depthwise kernel.
    let depthwise = I8Params {
        common: Params {
            groups: 2,
            ..params.common
        },
        ..params
    };
    let convolution = Convolution::new(3).build(depthwise)?;
    let filters = Array4::<i8>::from_elem([2, 3, 3, 1], 1);
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert!(output.iter().all(|&x| x == 0), "{:?}", output);
    Ok(())
}

#[test]
fn depthwise_3x3_convolution() -> Result<(), Error> {
    let common = Params {
        pads: [1; 4],
        groups: 8,
        ..Params::default()
    };
    let convolution = Convolution::new(3).build(I8Params {
        common,
        quant: QuantParams::identity(),
    })?;
    let signal = Array4::<i8>::from_shape_fn([1, 4, 4, 8], |(.., c)| c as i8 + 1);
    let filters = Array4::<i8>::from_elem([8, 3, 3, 1], 1);

    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert_eq!(output.shape(), [1, 4, 4, 8]);
    let taps = [4, 6, 6, 4, 6, 9, 9, 6, 6, 9, 9, 6, 4, 6, 6, 4];
    for (pixel, &taps) in output.lanes(Axis(3)).into_iter().zip(&taps) {
        let expected: Vec<i8> = (1..=8).map(|c| c * taps).collect();
        assert_eq!(pixel.to_vec(), expected);
    }

    let convolution = Convolution::new(3).build(I8Params {
        common: Params {
            strides: [2, 2],
            ..common
        },
        quant: QuantParams::identity(),
    })?;
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert_eq!(output.shape(), [1, 2, 2, 8]);
    for (pixel, &taps) in output.lanes(Axis(3)).into_iter().zip(&[4, 6, 6, 9]) {
        let expected: Vec<i8> = (1..=8).map(|c| c * taps).collect();
        assert_eq!(pixel.to_vec(), expected);
    }
    Ok(())
}

#[test]
fn fused_activations() -> Result<(), Error> {
    let output_arg = QuantArg::new(0.5, 0);
    let quant = QuantParams::per_tensor(QuantArg::IDENTITY, QuantArg::IDENTITY, output_arg);

    let relu = I8Params {
        common: Params::default(),
        quant: quant.clone().with_activation(ActivationRange::relu(output_arg)),
    };
    let signal = Array4::<i8>::from_shape_vec([1, 1, 4, 1], vec![1, -2, 3, 10])?;
    // 2 filters force the GEMM path, a single one the depthwise path.
    for &filter_count in &[1, 2] {
        let filters = Array4::<i8>::from_elem([filter_count, 1, 1, 1], -1);
        let convolution = Convolution::new(1).build(relu.clone())?;
        let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
        let output: Vec<_> = output.index_axis(Axis(3), 0).iter().copied().collect();
        assert_eq!(output, [0, 4, 0, 0]);
    }

    let relu6 = I8Params {
        common: Params::default(),
        quant: quant.with_activation(ActivationRange::relu6(output_arg)),
    };
    let filters = Array4::<i8>::from_elem([1, 1, 1, 1], 1);
    let convolution = Convolution::new(1).build(relu6)?;
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert_eq!(output.into_raw_vec(), [2, 0, 6, 12]);
    Ok(())
}

#[test]
fn saturation() -> Result<(), Error> {
    let convolution = Convolution::new(3).build(I8Params::default())?;
    let signal = Array4::<i8>::from_elem([1, 3, 3, 2], 100);
    let filters = Array4::<i8>::from_shape_fn([2, 3, 3, 2], |(f, ..)| if f == 0 { 1 } else { -1 });
    let output = convolution.compute(FeatureMap::nhwc(&signal), &filters)?;
    assert_eq!(output.into_raw_vec(), [127, -128]);
    Ok(())
}

#[test]
fn gemm_paths_agree() -> Result<(), Error> {
    let mut rng = XorShiftRng::seed_from_u64(123);
    let params = I8Params {
        common: Params {
            strides: [2, 1],
            pads: [1, 2, 0, 1],
            groups: 2,
            dilation: [1, 2],
        },
        quant: QuantParams::per_channel(
            QuantArg::new(0.1, -3),
            &(0..10)
                .map(|i| QuantArg::new(0.002 * (i + 1) as f32, i - 5))
                .collect::<Vec<_>>(),
            QuantArg::new(0.2, 7),
        ),
    };
    let signal = Array4::<i8>::from_shape_fn([2, 9, 11, 6], |_| rng.gen());
    let filters = Array4::<i8>::from_shape_fn([10, 3, 3, 3], |_| rng.gen());
    let biases: Vec<i32> = (0..10).map(|_| rng.gen_range(-1_000..1_000)).collect();

    let reference = Convolution::new(3)
        .reference_gemm()
        .threads(3)
        .build(params.clone())?
        .compute_with_biases(FeatureMap::nhwc(&signal), &filters, &biases)?;

    for tile_num in &[1, 4, 7] {
        let wide = Convolution::new(3)
            .matmul_kernel(&Tile4x8)
            .tile_num(*tile_num)
            .build(params.clone())?;
        let output = wide.compute_with_biases(FeatureMap::nhwc(&signal), &filters, &biases)?;
        assert_eq!(output, reference);

        let narrow = Convolution::new(3)
            .matmul_kernel(&Tile1x8)
            .tile_num(*tile_num)
            .threads(2)
            .build(params.clone())?
            .with_biased_filters(&filters, &biases)?;
        let output = narrow.compute(FeatureMap::nhwc(&signal))?;
        assert_eq!(output, reference);
    }
    Ok(())
}

#[test]
fn nchw_and_nhwc_layouts_agree() -> Result<(), Error> {
    let mut rng = XorShiftRng::seed_from_u64(7);
    let signal = Array4::<i8>::from_shape_fn([2, 6, 6, 16], |_| rng.gen());
    let filters = Array4::<i8>::from_shape_fn([16, 3, 3, 1], |_| rng.gen());
    let params = I8Params {
        common: Params {
            pads: [1; 4],
            groups: 16,
            ..Params::default()
        },
        quant: QuantParams::per_tensor(
            QuantArg::new(0.5, 1),
            QuantArg::new(0.01, 0),
            QuantArg::new(0.25, -2),
        ),
    };
    let convolution = Convolution::new(3).build(params)?.with_filters(&filters)?;

    let nhwc_output = convolution.compute(FeatureMap::nhwc(&signal))?;
    let nchw_signal = signal.view().permuted_axes([0, 3, 1, 2]);
    let nchw_output = convolution.compute(FeatureMap::nchw(nchw_signal))?;
    assert_eq!(nchw_output.permuted_axes([0, 2, 3, 1]), nhwc_output);
    Ok(())
}
