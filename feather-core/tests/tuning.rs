//! Autotuner modes driven through a whole net. Tests skip without an adapter.

mod common;

use common::{assert_close, classifier_input, classifier_param, classifier_weights, gpu_net};
use feather_core::{LayerError, Net, NetConfig, NetError, TuningError, TuningTable};
use feather_utils::{TuningMode, TuningSettings};

fn tuning(mode: TuningMode, table_path: Option<std::path::PathBuf>) -> TuningSettings {
    TuningSettings {
        mode,
        table_path,
        warmup_runs: 1,
    }
}

fn forward(net: &mut Net) -> Result<(), NetError> {
    net.load_param(&classifier_param())?;
    net.load_weights(&classifier_weights())?;
    net.set_input("data", &classifier_input())?;
    net.forward()
}

#[test]
fn tuned_table_reproduces_the_search() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tuning.json");

    let Some(mut search) =
        gpu_net(NetConfig::gpu().with_tuning(tuning(TuningMode::Tuning, Some(path.clone()))))
    else {
        return;
    };
    forward(&mut search).expect("tuning pass");
    assert_eq!(search.save_tuning_table(None).expect("save"), path);

    let table = TuningTable::load_from_path(&path).expect("table");
    assert!(table.get("conv1_convolution_lws").is_some());
    assert!(table.get("conv1_convolution_gws").is_some());
    assert!(table.get("prob_softmax_lws").is_some());

    let Some(mut tuned) =
        gpu_net(NetConfig::gpu().with_tuning(tuning(TuningMode::Tuned, Some(path.clone()))))
    else {
        return;
    };
    forward(&mut tuned).expect("tuned pass");
    assert_close(
        &tuned.extract_blob("prob").expect("tuned"),
        &search.extract_blob("prob").expect("search"),
        1e-5,
    );
    let loaded = tuned.tuning_table().expect("gpu table");
    assert_eq!(loaded.len(), table.len());
    for (key, entry) in table.iter() {
        assert_eq!(loaded.lookup(key).expect("loaded key"), entry.dims);
    }
}

#[test]
fn tuned_mode_fails_on_a_missing_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("empty.json");
    TuningTable::new().save_to_path(&path).expect("save");

    let Some(mut net) =
        gpu_net(NetConfig::gpu().with_tuning(tuning(TuningMode::Tuned, Some(path))))
    else {
        return;
    };
    let err = forward(&mut net).expect_err("lookup miss");
    assert!(
        matches!(
            &err,
            NetError::Forward {
                source: LayerError::Tuning(TuningError::LookupMiss { .. }),
                ..
            }
        ),
        "unexpected error: {err}"
    );
}

#[test]
fn tuned_mode_requires_a_table_path() {
    let config = NetConfig::gpu().with_tuning(tuning(TuningMode::Tuned, None));
    assert!(matches!(
        Net::new(config),
        Err(NetError::Tuning(TuningError::NoTablePath))
    ));
}

#[test]
fn in_process_tuning_spreads_over_passes() {
    let Some(mut net) =
        gpu_net(NetConfig::gpu().with_tuning(tuning(TuningMode::TunerInProcess, None)))
    else {
        return;
    };
    forward(&mut net).expect("first pass");
    let after_one = net.tuning_table().expect("table").len();
    for _ in 0..3 {
        net.forward().expect("pass");
    }
    let table = net.tuning_table().expect("table");
    assert!(table.len() >= after_one);
    assert!(table.get("fc_inner_product_lws").is_some());
    assert_eq!(net.tuning_mode(), TuningMode::TunerInProcess);
}
