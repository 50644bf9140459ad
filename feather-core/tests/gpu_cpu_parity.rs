//! The GPU backend must agree with the CPU backend on the same model.
//!
//! Tests skip when no adapter is available.

mod common;

use common::{
    assert_close, classifier_input, classifier_param, classifier_weights, gpu_net, input, relu,
    run, values,
};
use feather_core::{
    BlobShape, LayerParam, ModelWeights, NetConfig, NetError, NetParam, OpParam, PoolMethod,
};

const TOLERANCE: f32 = 1e-4;

fn gpu_run(
    config: NetConfig,
    param: &NetParam,
    weights: &ModelWeights,
    data: &[f32],
) -> Option<feather_core::Net> {
    let mut net = gpu_net(config)?;
    net.load_param(param).expect("param");
    net.load_weights(weights).expect("weights");
    net.set_input("data", data).expect("input");
    net.forward().expect("gpu forward");
    Some(net)
}

#[test]
fn relu_on_gpu_matches_expected_values() {
    let param = NetParam::new(vec![input("data", 3, 1, 1), relu("act", "data", "act")]);
    let Some(net) = gpu_run(
        NetConfig::gpu(),
        &param,
        &ModelWeights::new(),
        &[-1.0, 0.0, 2.0],
    ) else {
        return;
    };
    assert_eq!(net.extract_blob("act").expect("act"), vec![0.0, 0.0, 2.0]);

    let kernels = net.layer_kernels("act").expect("relu layer");
    assert_eq!(kernels.len(), 1);
    assert!(kernels[0].is_built());
    let geometry = kernels[0].lws.iter().zip(kernels[0].gws);
    assert!(geometry.into_iter().all(|(l, g)| *l >= 1 && *l <= g.next_power_of_two()));
}

#[test]
fn classifier_matches_cpu_baseline() {
    let cpu = run(
        NetConfig::cpu(),
        &classifier_param(),
        &classifier_weights(),
        "data",
        &classifier_input(),
    )
    .expect("cpu forward");
    for fusion in [true, false] {
        let Some(gpu) = gpu_run(
            NetConfig::gpu().with_fusion(fusion),
            &classifier_param(),
            &classifier_weights(),
            &classifier_input(),
        ) else {
            return;
        };
        for blob in ["pool1", "conv2", "sum", "fc", "prob"] {
            let expected = cpu.extract_blob(blob).expect("cpu blob");
            let actual = match gpu.extract_blob(blob) {
                Ok(values) => values,
                // Intermediates may have been recycled on the device.
                Err(NetError::BlobReleased(_)) => continue,
                Err(err) => panic!("extracting {blob}: {err}"),
            };
            assert_close(&actual, &expected, TOLERANCE);
        }
    }
}

#[test]
fn average_pooling_and_channel_padding_agree() {
    // Seven channels leave padded lanes in every block of four.
    let param = NetParam::new(vec![
        input("data", 7, 5, 5),
        LayerParam::new(
            "pool",
            &["data"],
            "pool",
            OpParam::Pooling {
                method: PoolMethod::Average,
                kernel_h: 3,
                kernel_w: 3,
                stride_h: 2,
                stride_w: 2,
                pad_h: 1,
                pad_w: 1,
                global: false,
            },
        ),
        LayerParam::new(
            "global",
            &["pool"],
            "global",
            OpParam::Pooling {
                method: PoolMethod::Max,
                kernel_h: 0,
                kernel_w: 0,
                stride_h: 1,
                stride_w: 1,
                pad_h: 0,
                pad_w: 0,
                global: true,
            },
        ),
    ]);
    let data = values(7 * 5 * 5, 5);
    let cpu = run(NetConfig::cpu(), &param, &ModelWeights::new(), "data", &data)
        .expect("cpu forward");
    let Some(gpu) = gpu_run(NetConfig::gpu(), &param, &ModelWeights::new(), &data) else {
        return;
    };
    assert_eq!(gpu.blob_shape("global").expect("shape"), BlobShape::new(1, 7, 1, 1));
    assert_close(
        &gpu.extract_blob("global").expect("gpu"),
        &cpu.extract_blob("global").expect("cpu"),
        TOLERANCE,
    );
}

#[test]
fn image_memory_is_rejected() {
    let mut config = NetConfig::gpu();
    config.device = feather_utils::DeviceType::GpuImage;
    assert!(matches!(
        feather_core::Net::new(config),
        Err(NetError::Gpu(feather_core::GpuError::UnsupportedMemoryType(_)))
    ));
}
