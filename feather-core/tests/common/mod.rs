//! Shared models and helpers for feather-core integration tests.
#![allow(dead_code)]

use feather_core::{
    EltwiseOp, LayerParam, ModelWeights, Net, NetConfig, NetError, NetParam, OpParam, PoolMethod,
    WeightBlob,
};

pub fn input(name: &str, channels: usize, height: usize, width: usize) -> LayerParam {
    LayerParam::new(
        name,
        &[],
        name,
        OpParam::Input {
            num: 1,
            channels,
            height,
            width,
        },
    )
}

pub fn relu(name: &str, bottom: &str, top: &str) -> LayerParam {
    LayerParam::new(
        name,
        &[bottom],
        top,
        OpParam::Relu {
            negative_slope: 0.0,
        },
    )
}

/// Deterministic values in `[-1, 1)`.
pub fn values(count: usize, seed: u32) -> Vec<f32> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(12345);
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / (1u32 << 23) as f32 - 1.0
        })
        .collect()
}

pub fn blob(dims: &[usize], seed: u32) -> WeightBlob {
    let count = dims.iter().product();
    WeightBlob::new(dims.to_vec(), values(count, seed)).expect("weight blob")
}

/// `data -> fc (InnerProduct) -> act (in-place ReLU)`.
pub fn fc_relu_param(inputs: usize, outputs: usize) -> NetParam {
    NetParam::new(vec![
        input("data", inputs, 1, 1),
        LayerParam::new(
            "fc",
            &["data"],
            "fc",
            OpParam::InnerProduct {
                num_output: outputs,
                bias_term: true,
            },
        ),
        relu("act", "fc", "fc"),
    ])
}

pub fn fc_relu_weights(inputs: usize, outputs: usize) -> ModelWeights {
    let mut weights = ModelWeights::new();
    weights
        .push(1, blob(&[outputs, inputs], 1))
        .push(1, blob(&[outputs], 2));
    weights
}

/// Small classifier touching every operator:
/// conv, batch norm, scale, relu, pooling, eltwise, inner product, softmax.
pub fn classifier_param() -> NetParam {
    NetParam::new(vec![
        input("data", 5, 6, 6),
        LayerParam::new(
            "conv1",
            &["data"],
            "conv1",
            OpParam::Convolution {
                num_output: 6,
                kernel_h: 3,
                kernel_w: 3,
                stride_h: 1,
                stride_w: 1,
                pad_h: 1,
                pad_w: 1,
                dilation_h: 1,
                dilation_w: 1,
                group: 1,
                bias_term: true,
            },
        ),
        LayerParam::new("bn1", &["conv1"], "conv1", OpParam::BatchNorm { eps: 1e-5 }),
        LayerParam::new("scale1", &["conv1"], "conv1", OpParam::Scale { bias_term: true }),
        relu("relu1", "conv1", "conv1"),
        LayerParam::new(
            "pool1",
            &["conv1"],
            "pool1",
            OpParam::Pooling {
                method: PoolMethod::Max,
                kernel_h: 2,
                kernel_w: 2,
                stride_h: 2,
                stride_w: 2,
                pad_h: 0,
                pad_w: 0,
                global: false,
            },
        ),
        LayerParam::new(
            "conv2",
            &["pool1"],
            "conv2",
            OpParam::Convolution {
                num_output: 6,
                kernel_h: 1,
                kernel_w: 1,
                stride_h: 1,
                stride_w: 1,
                pad_h: 0,
                pad_w: 0,
                dilation_h: 1,
                dilation_w: 1,
                group: 2,
                bias_term: true,
            },
        ),
        relu("relu2", "conv2", "conv2"),
        LayerParam::new(
            "sum",
            &["pool1", "conv2"],
            "sum",
            OpParam::Eltwise {
                operation: EltwiseOp::Sum,
                coeffs: vec![0.5, 1.5],
            },
        ),
        LayerParam::new(
            "fc",
            &["sum"],
            "fc",
            OpParam::InnerProduct {
                num_output: 10,
                bias_term: true,
            },
        ),
        LayerParam::new("prob", &["fc"], "prob", OpParam::Softmax {}),
    ])
}

pub fn classifier_weights() -> ModelWeights {
    let positive = |count: usize, seed: u32| -> WeightBlob {
        WeightBlob::vector(values(count, seed).into_iter().map(|v| v + 1.5).collect())
    };
    let mut weights = ModelWeights::new();
    weights
        .push(1, blob(&[6, 5, 3, 3], 10))
        .push(1, blob(&[6], 11))
        .push(2, blob(&[6], 12))
        .push(2, positive(6, 13))
        .push(2, WeightBlob::vector(vec![1.0]))
        .push(3, positive(6, 14))
        .push(3, blob(&[6], 15))
        .push(6, blob(&[6, 3, 1, 1], 16))
        .push(6, blob(&[6], 17))
        .push(9, blob(&[10, 6 * 3 * 3], 18))
        .push(9, blob(&[10], 19));
    weights
}

pub fn classifier_input() -> Vec<f32> {
    values(5 * 6 * 6, 99)
}

/// Load, feed and run a net in one go.
pub fn run(
    config: NetConfig,
    param: &NetParam,
    weights: &ModelWeights,
    input_name: &str,
    input: &[f32],
) -> Result<Net, NetError> {
    let mut net = Net::new(config)?;
    net.load_param(param)?;
    net.load_weights(weights)?;
    net.set_input(input_name, input)?;
    net.forward()?;
    Ok(net)
}

/// A GPU net, or `None` when the host has no usable adapter.
pub fn gpu_net(config: NetConfig) -> Option<Net> {
    match Net::new(config) {
        Ok(net) => Some(net),
        Err(NetError::Gpu(err)) => {
            eprintln!("skipping GPU test: {err}");
            None
        }
        Err(err) => panic!("unexpected error creating a GPU net: {err}"),
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {index}: {a} vs {e} (tolerance {tolerance})"
        );
    }
}
