//! Training-path tests: configuration, logs, datasets and the epoch loop.

use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use densegrow_core::config::parse_layer_list;
use densegrow_core::data::{self, CifarName, Normalisation, SyntheticSpec};
use densegrow_core::logs::{self, format_duration, FeatureLog, MetricLog, Phase};
use densegrow_core::*;

fn assert_close(a: f32, b: f32, tol: f32) {
    assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
}

/// Small, fast run rooted at `dir`.
fn quick_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.model.growth_rate = 4;
    config.model.layer_num_list = "1".into();
    config.train.batch_size = 16;
    config.train.max_n_ep = 20;
    config.self_construct.variant = "0".into();
    config.self_construct.asc_thresh = 5;
    config.self_construct.block_count = 1;
    config.logging.output_dir = dir.to_path_buf();
    config.logging.ft_filters = false;
    config.data.synthetic = SyntheticSpec {
        train_size: 32,
        validation_size: 16,
        test_size: 16,
        ..SyntheticSpec::default()
    };
    config
}

fn quick_run(config: Config) -> (Trainer, InMemoryProvider) {
    let data = data::synthetic(&config.data.synthetic, config.runtime.seed).unwrap();
    let trainer = Trainer::new(config, data.data_shape(), data.n_classes(), data.name()).unwrap();
    (trainer, data)
}

/// Reports every layer but the first as settled from call `settle_from`
/// onwards.
struct ScriptedOracle {
    calls: Rc<Cell<usize>>,
    settle_from: usize,
}

impl StrengthOracle for ScriptedOracle {
    fn observe(&self, network: &Network, block: usize) -> GrowResult<BlockStrength> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        let layers = network.block(block)?.layers.len();
        let src = if call >= self.settle_from { 1.0 } else { 0.0 };
        Ok(BlockStrength {
            block,
            table: (0..layers).map(|l| vec![1.0; l + 1]).collect(),
            lcs_dst: vec![1.0; layers],
            lcs_src: vec![src; layers],
        })
    }
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_parse_layer_list() {
    assert_eq!(parse_layer_list("12, 12 ,12"), vec![12, 12, 12]);
    assert_eq!(parse_layer_list("1"), vec![1]);
    assert_eq!(parse_layer_list("a,b"), vec![1]);
    assert_eq!(parse_layer_list("3,0"), vec![1]);
    assert_eq!(parse_layer_list(""), vec![1]);
}

#[test]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.model.growth_rate, 12);
    assert_eq!(config.model.model_type, ModelType::DenseNet);
    assert_eq!(config.train.batch_size, 64);
    assert_eq!(config.variant(), Variant::LATEST);
    assert_eq!(config.lr_coordinator().variant, LrVariant::LATEST);
    assert_eq!(config.construct_params().max_n_ep, config.train.max_n_ep);
    assert_eq!(config.data.normalisation, Normalisation::Divide256);
}

#[test]
fn test_config_missing_or_invalid_file_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let missing = Config::load(&dir.path().join("missing.toml"));
    assert_eq!(missing.model.growth_rate, 12);

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[model\ngrowth_rate = ").unwrap();
    assert_eq!(Config::load(&bad).train.max_n_ep, 300);
}

#[test]
fn test_config_partial_toml() {
    let config = Config::from_toml_str(
        r#"
        [model]
        model_type = "DenseNet-BC"
        layer_num_list = "6,4"

        [self_construct]
        variant = "kernels"
        layer_cs = "spread"

        [data]
        normalisation = "by_channels"
        "#,
    )
    .unwrap();
    assert_eq!(config.model.model_type, ModelType::DenseNetBC);
    assert_eq!(config.layer_num_list(), vec![6, 4]);
    assert_eq!(config.variant(), Variant::Kernelwise);
    assert_eq!(config.self_construct.layer_cs, LayerCsMode::Spread);
    assert_eq!(config.data.normalisation, Normalisation::ByChannels);
    assert_eq!(config.train.max_n_ep, 300);
}

#[test]
fn test_config_toml_round_trip() {
    let mut config = Config::default();
    config.model.growth_rate = 24;
    config.self_construct.variant = "2".into();
    config.data.normalisation = Normalisation::Divide255;
    let text = config.to_toml().unwrap();
    assert!(text.contains("divide_255"), "{text}");

    let parsed = Config::from_toml_str(&text).unwrap();
    assert_eq!(parsed.model.growth_rate, 24);
    assert_eq!(parsed.variant(), Variant::V2);
    assert_eq!(parsed.data.normalisation, Normalisation::Divide255);
    assert_eq!(parsed.logging.ft_comma, ";");
}

#[test]
fn test_config_zero_counts_fall_back() {
    let config = Config::from_toml_str(
        r#"
        [self_construct]
        asc_thresh = 0
        std_window = 0
        patience_param = 7
        "#,
    )
    .unwrap();
    assert_eq!(config.self_construct.asc_thresh, 10);
    assert_eq!(config.self_construct.std_window, 50);
    assert_eq!(config.self_construct.patience_param, 7);
}

#[test]
fn test_construct_params_never_carry_zero_counts() {
    let mut config = Config::default();
    config.self_construct.asc_thresh = 0;
    config.self_construct.std_window = 0;
    config.self_construct.patience_param = 0;
    let params = config.construct_params();
    assert_eq!(params.asc_thresh, 10);
    assert_eq!(params.std_window, 50);
    assert_eq!(params.patience_param, 0);
}

#[test]
fn test_architecture_from_config() {
    let mut config = Config::default();
    config.model.layer_num_list = "2,3".into();
    config.runtime.seed = 17;
    let arch = config.architecture(Shape::d3(3, 32, 32), 10);
    assert_eq!(arch.layer_num_list, vec![2, 3]);
    assert_eq!(arch.first_output_features(), 24);
    assert_eq!(arch.seed, 17);
    assert_close(arch.momentum, 0.9, 1e-7);
}

// =============================================================================
// Run Path Tests
// =============================================================================

#[test]
fn test_model_identifier_tracks_layer_counts() {
    let id = paths::model_identifier(ModelType::DenseNetBC, 12, &[3, 1], "C10+");
    assert_eq!(id, "DenseNet-BC_growth_rate=12_layer_num_list=3,1_dataset_C10+");

    let mut logging = Config::default().logging;
    logging.output_dir = "out".into();
    logging.should_save_model = true;
    logging.should_save_ft_logs = false;
    let mut run = RunPaths::new(&logging, ModelType::DenseNet, 12, &[1], "C10", chrono::Local::now());
    assert!(run.save_path().is_some());
    assert!(run.logs_path().is_some());
    assert!(run.ft_logs_path().is_none());

    run.refresh(&[2], true);
    assert!(run.model_identifier().contains("layer_num_list=2_"));
    assert!(run.checkpoint_file().ends_with(paths::CHECKPOINT_FILE));
    run.refresh(&[2], false);
    assert!(run.save_path().is_none());
}

// =============================================================================
// Log Tests
// =============================================================================

#[test]
fn test_feature_log_row_format() {
    let strength = BlockStrength::from_table(
        0,
        vec![vec![1.0], vec![0.5, 1.0]],
        LayerCsMode::Relevance,
        strength::RELEVANCE_THRESHOLD,
    );
    let mut log = FeatureLog::new(Vec::new(), ";", ",");
    log.write_epoch(3, 0.5, 1.25, &[strength]).unwrap();
    log.write_total_time(Duration::from_micros(3_723_000_042)).unwrap();
    let text = String::from_utf8(log.into_inner()).unwrap();

    let expected_row = concat!(
        r#""Epoch 3";"0,500000";"1,250000";"""#,
        // layer 0
        r#";"0,500000";"""#,
        r#";"1,000000";"0,500000""#,
        r#";"""#,
        r#";"1,000000""#,
        r#";"";"1,000000""#,
        // layer 1
        r#";"1,000000";"""#,
        r#";"1,000000""#,
        r#";"""#,
        r#";"0,500000";"1,000000""#,
        r#";"";"0,500000""#,
        "\n",
    );
    assert_eq!(text, format!("{expected_row}\nTOTAL TRAINING TIME: 1:02:03.000042\n"));
}

#[test]
fn test_feature_log_without_blocks() {
    let mut log = FeatureLog::new(Vec::new(), ",", ".");
    log.write_epoch(1, 0.25, 2.0, &[]).unwrap();
    let text = String::from_utf8(log.into_inner()).unwrap();
    assert_eq!(text, "\"Epoch 1\",\"0.250000\",\"2.000000\",\"\"\n");
}

#[test]
fn test_format_duration() {
    assert_eq!(format_duration(Duration::from_millis(1500)), "0:00:01.500000");
    assert_eq!(format_duration(Duration::from_secs(36_000)), "10:00:00.000000");
}

#[test]
fn test_estimate_remaining() {
    let per_epoch = Duration::from_secs(2);
    assert_eq!(logs::estimate_remaining(per_epoch, 20, 5), Duration::from_secs(30));
    assert_eq!(logs::estimate_remaining(per_epoch, 20, 20), Duration::ZERO);
    assert_eq!(logs::estimate_remaining(per_epoch, 20, 35), Duration::ZERO);
}

#[test]
fn test_metric_log_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = MetricLog::create(&dir.path().join("logs")).unwrap();
    log.record(Phase::PerBatch, 1, 1.5, 0.25).unwrap();
    log.record(Phase::Valid, 1, 1.25, 0.5).unwrap();
    log.flush().unwrap();

    let text = std::fs::read_to_string(dir.path().join("logs").join(MetricLog::FILE_NAME)).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["phase,step,loss,accuracy", "per_batch,1,1.5,0.25", "valid,1,1.25,0.5"]);
}

// =============================================================================
// Dataset Tests
// =============================================================================

#[test]
fn test_one_hot() {
    let labels = data::one_hot(&[2, 0], 3).unwrap();
    assert_eq!(labels.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
    assert_eq!(labels.row(1).to_vec(), vec![1.0, 0.0, 0.0]);
    assert!(matches!(data::one_hot(&[3], 3), Err(GrowError::Data(_))));
}

#[test]
fn test_split_batches_wrap_around() {
    let images = Tensor::from_shape_fn((5, 1, 2, 2), |(n, _, _, _)| n as f32);
    let labels = data::one_hot(&[0, 1, 0, 1, 0], 2).unwrap();
    let mut split = InMemorySplit::new(images, labels, false, false, 0).unwrap();
    assert_eq!(split.num_examples(), 5);

    let (first, _) = split.next_batch(2).unwrap();
    let (second, _) = split.next_batch(2).unwrap();
    let (third, _) = split.next_batch(2).unwrap();
    assert_eq!(first[[0, 0, 0, 0]], 0.0);
    assert_eq!(second[[0, 0, 0, 0]], 2.0);
    // Only one example left: a new pass starts.
    assert_eq!(third[[0, 0, 0, 0]], 0.0);

    let (all, labels) = split.next_batch(10).unwrap();
    assert_eq!(all.dim().0, 5);
    assert_eq!(labels.nrows(), 5);
    assert!(matches!(split.next_batch(0), Err(GrowError::EmptyBatch)));
}

#[test]
fn test_split_rejects_label_count_mismatch() {
    let images = Tensor::zeros((3, 1, 2, 2));
    let labels = data::one_hot(&[0, 1], 2).unwrap();
    assert!(InMemorySplit::new(images, labels, false, false, 0).is_err());
}

#[test]
fn test_augmentation_keeps_shape() {
    let images = Tensor::ones((4, 3, 8, 8));
    let labels = data::one_hot(&[0, 1, 2, 3], 4).unwrap();
    let mut split = InMemorySplit::new(images, labels, true, true, 3).unwrap();
    let (batch, _) = split.next_batch(4).unwrap();
    assert_eq!(batch.dim(), (4, 3, 8, 8));
    assert!(batch.iter().all(|&v| v == 0.0 || v == 1.0));
}

#[test]
fn test_normalisation_modes() {
    let mut images = Tensor::from_elem((1, 2, 2, 2), 128.0);
    data::normalise(&mut images, Normalisation::Divide256, &[]);
    assert_close(images[[0, 0, 0, 0]], 0.5, 1e-6);

    let mut images = Tensor::from_shape_fn((2, 1, 1, 2), |(n, _, _, x)| (n * 2 + x) as f32);
    let stats = data::channel_stats(&images);
    assert_close(stats[0].0, 1.5, 1e-6);
    data::normalise(&mut images, Normalisation::ByChannels, &stats);
    let (mean, std) = densegrow_core::tensor::mean_std(images.as_slice().unwrap());
    assert_close(mean, 0.0, 1e-5);
    assert_close(std, 1.0, 1e-5);
}

#[test]
fn test_synthetic_dataset_is_deterministic() {
    let spec = SyntheticSpec { train_size: 12, validation_size: 0, test_size: 8, ..SyntheticSpec::default() };
    let mut a = data::synthetic(&spec, 5).unwrap();
    let mut b = data::synthetic(&spec, 5).unwrap();
    assert_eq!(a.data_shape(), Shape::d3(3, 8, 8));
    assert_eq!(a.n_classes(), 4);
    assert!(a.validation().is_none());
    assert_eq!(a.train().next_batch(6).unwrap(), b.train().next_batch(6).unwrap());
    assert_eq!(a.test().num_examples(), 8);
}

#[test]
fn test_cifar_names() {
    let name: CifarName = "C10+".parse().unwrap();
    assert_eq!(name, CifarName { classes: 10, augment: true });
    assert_eq!(name.to_string(), "C10+");
    let name: CifarName = "C100".parse().unwrap();
    assert!(!name.augment);
    assert!("C20".parse::<CifarName>().is_err());
}

#[test]
fn test_read_cifar_records() {
    const PIXELS: usize = 3 * 32 * 32;
    let mut bytes = Vec::new();
    for (label, fill) in [(3u8, 10u8), (7, 20)] {
        bytes.push(label);
        bytes.extend(std::iter::repeat(fill).take(PIXELS - 1));
        bytes.push(255);
    }
    let (images, classes) = data::read_cifar_records(&bytes, "C10".parse().unwrap()).unwrap();
    assert_eq!(classes, vec![3, 7]);
    assert_eq!(images.dim(), (2, 3, 32, 32));
    assert_eq!(images[[1, 0, 0, 0]], 20.0);
    assert_eq!(images[[1, 2, 31, 31]], 255.0);

    // CIFAR-100 records carry the fine label second.
    let mut bytes = vec![1u8, 42];
    bytes.extend(std::iter::repeat(0u8).take(PIXELS));
    let (_, classes) = data::read_cifar_records(&bytes, "C100".parse().unwrap()).unwrap();
    assert_eq!(classes, vec![42]);

    assert!(data::read_cifar_records(&bytes[1..], "C100".parse().unwrap()).is_err());
}

#[test]
fn test_load_cifar_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let options = data::CifarOptions {
        normalisation: Normalisation::Divide256,
        validation_fraction: 0.1,
        shuffle: true,
        seed: 0,
    };
    assert!(matches!(
        data::load_cifar(&dir.path().join("nothing"), "C10", &options),
        Err(GrowError::Data(_))
    ));
}

// =============================================================================
// Trainer Tests
// =============================================================================

#[test]
fn test_fixed_budget_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.self_construct.enabled = false;
    config.train.max_n_ep = 3;
    let (mut trainer, mut data) = quick_run(config);
    assert!(trainer.controller().is_none());

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 3);
    assert!(summary.events.is_empty());
    assert_eq!(summary.layer_num_list, vec![1]);
    assert_close(summary.learning_rate, 0.001, 1e-7);
    assert!(summary.loss.is_finite());

    let (loss, accuracy) = trainer.test(data.test(), 16).unwrap();
    assert!(loss.is_finite());
    assert!((0.0..=1.0).contains(&accuracy));

    let metrics = trainer.paths().logs_path().unwrap().join(MetricLog::FILE_NAME);
    let text = std::fs::read_to_string(metrics).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("train,")).count(), 3);
    assert_eq!(text.lines().filter(|l| l.starts_with("per_batch,")).count(), 6);
}

#[test]
fn test_settlement_stops_ascension() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.logging.should_save_ft_logs = true;
    let calls = Rc::new(Cell::new(0));
    let (trainer, mut data) = quick_run(config);
    let mut trainer = trainer.with_oracle(Box::new(ScriptedOracle { calls: calls.clone(), settle_from: 11 }));

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 20);
    // Block epoch 1 is never observed, so call 11 is epoch 12.
    assert_eq!(calls.get(), 19);
    let layer_epochs: Vec<usize> = summary
        .events
        .iter()
        .filter(|e| e.kind == GrowthKind::Layer)
        .map(|e| e.epoch)
        .collect();
    assert_eq!(layer_epochs, vec![5, 10]);
    assert_eq!(summary.layer_num_list, vec![3]);
    assert_eq!(trainer.controller().unwrap().state().settled_layers_ceil, 2);

    let ft_log = std::fs::read_to_string(trainer.paths().ft_logs_path().unwrap()).unwrap();
    assert_eq!(ft_log.lines().filter(|l| l.starts_with("\"Epoch ")).count(), 20);
    assert!(ft_log.contains("TOTAL TRAINING TIME: "));
}

#[test]
fn test_finished_block_opens_next_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.train.max_n_ep = 4;
    config.self_construct.asc_thresh = 100;
    config.self_construct.block_count = 2;
    let calls = Rc::new(Cell::new(0));
    let (trainer, mut data) = quick_run(config);
    let mut trainer = trainer.with_oracle(Box::new(ScriptedOracle { calls, settle_from: usize::MAX }));

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 8);
    assert_eq!(summary.layer_num_list, vec![1, 1]);
    assert_eq!(summary.events, vec![GrowthEvent { epoch: 4, block_epoch: 4, kind: GrowthKind::Block }]);
}

#[test]
fn test_first_block_epoch_is_not_observed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.train.max_n_ep = 3;
    config.self_construct.asc_thresh = 1;
    config.self_construct.block_count = 2;
    let calls = Rc::new(Cell::new(0));
    let (trainer, mut data) = quick_run(config);
    let mut trainer = trainer.with_oracle(Box::new(ScriptedOracle { calls: calls.clone(), settle_from: usize::MAX }));

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 6);
    assert_eq!(calls.get(), 4);
    let events: Vec<(usize, usize, GrowthKind)> =
        summary.events.iter().map(|e| (e.epoch, e.block_epoch, e.kind)).collect();
    assert_eq!(
        events,
        vec![
            (2, 2, GrowthKind::Layer),
            (3, 3, GrowthKind::Layer),
            (3, 3, GrowthKind::Block),
            (5, 2, GrowthKind::Layer),
            (6, 3, GrowthKind::Layer),
        ]
    );
    assert_eq!(summary.layer_num_list, vec![3, 3]);
}

#[test]
fn test_settled_block_waits_for_second_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.model.layer_num_list = "2".into();
    config.train.max_n_ep = 2;
    config.self_construct.asc_thresh = 1;
    let calls = Rc::new(Cell::new(0));
    let (trainer, mut data) = quick_run(config);
    let mut trainer = trainer.with_oracle(Box::new(ScriptedOracle { calls: calls.clone(), settle_from: 1 }));

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 2);
    assert_eq!(calls.get(), 1);
    assert!(summary.events.is_empty());
    assert_eq!(trainer.controller().unwrap().state().settled_layers_ceil, 1);
}

#[test]
fn test_kernelwise_run_with_measured_strength() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.train.max_n_ep = 4;
    config.self_construct.variant = "kernels".into();
    config.self_construct.asc_thresh = 3;
    config.self_construct.expansion_rate = 2;
    config.logging.ft_filters = true;
    let (mut trainer, mut data) = quick_run(config);

    let summary = trainer.train_all_epochs(&mut data).unwrap();
    assert_eq!(summary.epochs, 4);
    let kinds: Vec<GrowthKind> = summary.events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![GrowthKind::Kernels(2), GrowthKind::Layer, GrowthKind::Kernels(2)]);
    assert_eq!(summary.layer_num_list, vec![2]);
    assert_eq!(trainer.network().block(0).unwrap().layers[1].width(), 6);
}

#[test]
fn test_trainer_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = quick_config(dir.path());
    config.self_construct.enabled = false;
    config.train.max_n_ep = 1;
    config.logging.should_save_model = true;
    let (mut trainer, mut data) = quick_run(config.clone());
    trainer.train_all_epochs(&mut data).unwrap();
    assert!(trainer.paths().checkpoint_file().exists());

    let (mut fresh, mut fresh_data) = quick_run(config);
    let snapshot = fresh.load_model().unwrap();
    assert_eq!(snapshot.model_identifier, trainer.paths().model_identifier());
    let (images, _) = fresh_data.test().next_batch(16).unwrap();
    let expected = trainer.network_mut().forward(&images, false).unwrap();
    let actual = fresh.network_mut().forward(&images, false).unwrap();
    assert_eq!(expected, actual);
}
