mod common;

use std::{collections::HashMap, fs};

use candle_core::{Device, Tensor};
use common::{labels, ToyModel, FRAMES};
use seqtrain::{
    checkpoint::weights_path, data::loaders_from_config, train, FitOptions, FitOutcome,
    TrainingConfig, TrainingError,
};
use tempfile::tempdir;

fn write_chunks(path: &std::path::Path, rows: usize) {
    let device = Device::Cpu;
    let labels = labels(rows);
    let signal: Vec<f32> = labels.iter().map(|label| *label as f32).collect();
    let mut tensors = HashMap::new();
    tensors.insert(
        "chunks".to_string(),
        Tensor::from_vec(signal, (rows, FRAMES), &device).expect("chunks"),
    );
    tensors.insert(
        "targets".to_string(),
        Tensor::from_vec(labels, (rows, FRAMES), &device).expect("targets"),
    );
    tensors.insert(
        "lengths".to_string(),
        Tensor::full(FRAMES as i64, rows, &device).expect("lengths"),
    );
    candle_core::safetensors::save(&tensors, path).expect("save chunks");
}

#[test]
fn relative_data_paths_resolve_against_the_config_file() {
    let tmp = tempdir().expect("tempdir");
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(&data_dir).expect("data dir");
    write_chunks(&data_dir.join("train.safetensors"), 12);
    write_chunks(&data_dir.join("valid.safetensors"), 4);

    let config_path = tmp.path().join("train.toml");
    fs::write(
        &config_path,
        r#"
[data]
chunks_per_epoch = 12
batch_size = 4
train_path = "data/train.safetensors"
valid_path = "data/valid.safetensors"

[optimizer]
algorithm = "sgd"
learning_rate = 0.01

[runtime]
use_amp = false
grad_accum_split = 2
"#,
    )
    .expect("write config");

    let config = TrainingConfig::from_path(&config_path).expect("config");
    assert_eq!(config.steps_per_epoch(), 3);
    assert_eq!(
        config.data.train_path.as_deref(),
        Some(data_dir.join("train.safetensors").as_path())
    );

    let (mut train, mut valid) = loaders_from_config(&config, &Device::Cpu).expect("loaders");
    let mut batches = 0;
    while let Some(batch) = train.next_batch().expect("batch") {
        assert_eq!(batch.batch_size().expect("size"), 4);
        batches += 1;
    }
    assert_eq!(batches, 3);
    assert!(valid.next_batch().expect("batch").is_some());
    assert!(valid.next_batch().expect("batch").is_none());
}

#[test]
fn invalid_settings_are_reported_together() {
    let tmp = tempdir().expect("tempdir");
    let config_path = tmp.path().join("bad.json");
    fs::write(
        &config_path,
        r#"{
            "data": { "chunks_per_epoch": 2, "batch_size": 6 },
            "runtime": { "grad_accum_split": 4, "save_optim_every": 0 }
        }"#,
    )
    .expect("write config");

    match TrainingConfig::from_path(&config_path) {
        Err(TrainingError::Validation(messages)) => {
            assert!(messages.iter().any(|m| m.contains("divisible")));
            assert!(messages.iter().any(|m| m.contains("chunks_per_epoch")));
            assert!(messages.iter().any(|m| m.contains("save_optim_every")));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn missing_data_paths_fail_loader_construction() {
    let config = common::config(false);
    let err = loaders_from_config(&config, &Device::Cpu).err().expect("missing paths");
    assert!(matches!(err, TrainingError::Initialization(_)));
}

#[test]
fn configured_job_trains_from_chunk_files() {
    let tmp = tempdir().expect("tempdir");
    write_chunks(&tmp.path().join("train.safetensors"), 8);
    write_chunks(&tmp.path().join("valid.safetensors"), 4);

    let config_path = tmp.path().join("job.toml");
    fs::write(
        &config_path,
        r#"
[data]
chunks_per_epoch = 8
batch_size = 4
train_path = "train.safetensors"
valid_path = "valid.safetensors"

[optimizer]
algorithm = "sgd"
learning_rate = 0.01

[runtime]
use_amp = false
grad_accum_split = 2
device = "cpu"
"#,
    )
    .expect("write config");
    let config = TrainingConfig::from_path(&config_path).expect("config");

    let workdir = tmp.path().join("run");
    let (outcome, model) = train(
        &config,
        |device| {
            assert!(device.is_cpu());
            Ok(ToyModel::new(0.5, 0.0))
        },
        &workdir,
        FitOptions::epochs(1),
    )
    .expect("train");

    assert_eq!(outcome, FitOutcome::Completed { last_epoch: 1 });
    assert!(weights_path(&workdir, 1).exists());
    assert!(workdir.join("training.csv").exists());
    assert_ne!(model.weight_value(), 0.5);
}
