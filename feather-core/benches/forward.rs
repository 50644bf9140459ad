use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use feather_core::{
    LayerParam, ModelWeights, Net, NetConfig, NetParam, OpParam, PoolMethod, WeightBlob,
};

const CHANNELS: usize = 16;
const SIZE: usize = 32;

fn conv_block_param() -> NetParam {
    NetParam::new(vec![
        LayerParam::new(
            "data",
            &[],
            "data",
            OpParam::Input {
                num: 1,
                channels: 3,
                height: SIZE,
                width: SIZE,
            },
        ),
        LayerParam::new(
            "conv",
            &["data"],
            "conv",
            OpParam::Convolution {
                num_output: CHANNELS,
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
        LayerParam::new(
            "relu",
            &["conv"],
            "conv",
            OpParam::Relu {
                negative_slope: 0.0,
            },
        ),
        LayerParam::new(
            "pool",
            &["conv"],
            "pool",
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
    ])
}

fn conv_block_weights() -> Option<ModelWeights> {
    let count = CHANNELS * 3 * 3 * 3;
    let kernel: Vec<f32> = (0..count).map(|i| ((i % 7) as f32 - 3.0) * 0.1).collect();
    let kernel = WeightBlob::new(vec![CHANNELS, 3, 3, 3], kernel).ok()?;
    let mut weights = ModelWeights::new();
    weights
        .push(1, kernel)
        .push(1, WeightBlob::vector(vec![0.05; CHANNELS]));
    Some(weights)
}

fn build_net(config: NetConfig) -> Option<Net> {
    let weights = conv_block_weights()?;
    let input: Vec<f32> = (0..3 * SIZE * SIZE).map(|i| (i % 13) as f32 / 13.0).collect();
    let mut net = match Net::new(config) {
        Ok(net) => net,
        Err(err) => {
            eprintln!("skipping forward benchmark; failed to create net: {err}");
            return None;
        }
    };
    let loaded = net
        .load_param(&conv_block_param())
        .and_then(|_| net.load_weights(&weights))
        .and_then(|_| net.set_input("data", &input))
        .and_then(|_| net.forward());
    match loaded {
        Ok(()) => Some(net),
        Err(err) => {
            eprintln!("skipping forward benchmark; warm-up failed: {err}");
            None
        }
    }
}

fn forward_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_conv_block");
    group.sample_size(20);

    let configs = [
        ("cpu_fused", NetConfig::cpu()),
        ("cpu_unfused", NetConfig::cpu().with_fusion(false)),
        ("gpu_buffer", NetConfig::gpu()),
    ];
    for (label, config) in configs {
        let Some(mut net) = build_net(config) else {
            continue;
        };
        group.bench_function(BenchmarkId::from_parameter(label), |b| {
            b.iter(|| {
                black_box(net.forward()).ok();
                black_box(net.extract_blob("pool")).ok();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, forward_benchmark);
criterion_main!(benches);
