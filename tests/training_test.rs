//! 训练步、掩码与训练循环

use std::collections::BTreeMap;
use std::sync::Arc;

use titling::{
    BatchGenerator, CheckpointManager, CheckpointStrategy, SampleEncoder, TitlingError,
    TrainConfig, adam::Adam,
};

mod common;

#[test]
fn test_single_example_converges_and_is_reproduced() {
    let mut model = common::build_model(
        common::cat_dog_vocab(),
        common::model_config(6, 32, true),
    );
    model.set_learning_rate(0.01);
    let example = common::example("cat dog cat", 1, 0.6);
    let batch = common::batch(&model, std::slice::from_ref(&example));

    let initial = model.evaluate(&batch).unwrap();
    let loss = common::train_until(&mut model, &batch, 0.05, 2000);
    assert!(loss < 0.05, "loss did not converge: {initial} -> {loss}");

    model.synchronize_inference_weights().unwrap();
    let title = model.generate(example.image.view(), example.category).unwrap();
    assert_eq!(title, "cat dog cat");

    let generation = model
        .generate_detailed(example.image.view(), example.category)
        .unwrap();
    assert_eq!(generation.stop_reason, titling::StopReason::EndToken);
}

#[test]
fn test_masking_excludes_padding_from_loss() {
    let vocab = common::cat_dog_vocab();
    // 相同种子 → 相同初始权重，只有掩码开关不同
    let masked = common::build_model(Arc::clone(&vocab), common::model_config(6, 8, true));
    let unmasked = common::build_model(vocab, common::model_config(6, 8, false));
    let batch = common::batch(&masked, &[common::example("cat dog cat", 0, 0.3)]);

    let masked_loss = masked.evaluate(&batch).unwrap();
    let unmasked_loss = unmasked.evaluate(&batch).unwrap();

    // 4 个真实位置完全相同；不掩码时 2 个 PAD 位置贡献 0 损失但计入分母
    assert!(
        (unmasked_loss - masked_loss * 4.0 / 6.0).abs() < 1e-4,
        "{masked_loss} vs {unmasked_loss}"
    );
}

#[test]
fn test_masked_prediction_carries_state_over_padding() {
    let model = common::build_model(common::cat_dog_vocab(), common::model_config(5, 8, true));
    let image = common::image(0.3);
    let probs = model.predict_sequence(image.view(), 0, &[0, 4, 1, 1, 1]).unwrap();

    assert_eq!(probs.dim(), (5, 6));
    // 被掩码的位置沿用最后一个真实位置的隐藏状态
    for t in 2..5 {
        for (a, b) in probs.row(t).iter().zip(probs.row(1).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
    for row in probs.rows() {
        assert!((row.sum() - 1.0).abs() < 1e-4);
    }
}

#[test]
fn test_train_step_rejects_malformed_batches() {
    let mut model = common::build_model(common::cat_dog_vocab(), common::model_config(4, 8, true));
    let good = common::batch(&model, &[common::example("cat", 0, 0.1)]);

    let mut wrong_image = good.clone();
    wrong_image.images[0] = ndarray::Array3::zeros((8, 8, 1));
    assert!(matches!(
        model.train_step(&wrong_image),
        Err(TitlingError::ShapeMismatch { .. })
    ));

    let mut bad_id = good.clone();
    bad_id.input_ids[[0, 1]] = 99;
    assert!(matches!(
        model.train_step(&bad_id),
        Err(TitlingError::InvalidTokenId { id: 99, .. })
    ));

    let mut wrong_targets = good.clone();
    wrong_targets.targets = ndarray::Array3::zeros((1, 3, 6));
    assert!(matches!(
        model.train_step(&wrong_targets),
        Err(TitlingError::ShapeMismatch { .. })
    ));

    assert!(matches!(
        model.predict_sequence(good.images[0].view(), 0, &[0, 4]),
        Err(TitlingError::ShapeMismatch { .. })
    ));
    assert_eq!(model.train_steps(), 0);
}

#[test]
fn test_mismatched_optimizer_state_is_rejected() {
    let mut model = common::build_model(
        common::cat_dog_vocab(),
        common::model_config(4, 8, true),
    );
    let batch = common::batch(&model, &[common::example("cat dog", 0, 0.3)]);
    model.train_step(&batch).unwrap();
    let before = model.optimizer_states().clone();

    let wrong_shape = BTreeMap::from([("output/kernel".to_string(), Adam::new((1, 1)))]);
    assert!(matches!(
        model.restore_optimizer_states(wrong_shape),
        Err(TitlingError::ParameterMismatch { ref layer, ref param, .. })
            if layer == "output" && param == "kernel"
    ));

    let unknown_layer = BTreeMap::from([("attention/kernel".to_string(), Adam::new((8, 8)))]);
    assert!(matches!(
        model.restore_optimizer_states(unknown_layer),
        Err(TitlingError::LayerMismatch { ref layer, .. }) if layer == "attention"
    ));

    let unknown_param = BTreeMap::from([("lstm/gamma".to_string(), Adam::new((8, 8)))]);
    assert!(matches!(
        model.restore_optimizer_states(unknown_param),
        Err(TitlingError::MissingParameter { ref layer, ref param })
            if layer == "lstm" && param == "gamma"
    ));

    // 失败的恢复不改动已有状态，参数仍然继续训练
    assert_eq!(model.optimizer_states(), &before);
    let kernel = model.training_graph().output.kernel.clone();
    model.train_step(&batch).unwrap();
    assert_ne!(model.training_graph().output.kernel, kernel);
    assert_eq!(model.optimizer_states()["output/kernel"].timestep, 2);

    model.restore_optimizer_states(before.clone()).unwrap();
    assert_eq!(model.optimizer_states(), &before);
}

fn examples() -> Vec<titling::TrainingExample> {
    vec![
        common::example("cat dog", 0, 0.1),
        common::example("dog cat cat", 1, 0.9),
        common::example("cat", 0, 0.2),
        common::example("dog", 1, 0.8),
    ]
}

fn generator(model: &titling::CaptionModel) -> BatchGenerator<Vec<titling::TrainingExample>> {
    let encoder = SampleEncoder::new(
        Arc::new(model.vocab().clone()),
        model.config().max_len,
        model.config().num_categories,
    )
    .unwrap();
    BatchGenerator::new(examples(), encoder, 2, true, Some(4)).unwrap()
}

#[test]
fn test_fit_runs_all_epochs_and_synchronizes() {
    let mut model = common::build_model(common::cat_dog_vocab(), common::model_config(4, 16, true));
    let mut train = generator(&model);
    let validation = generator(&model);
    let config = TrainConfig {
        epochs: 5,
        batch_size: 2,
        learning_rate: 0.01,
        ..TrainConfig::default()
    };

    let report = titling::fit(&mut model, &config, &mut train, Some(&validation), None, 0).unwrap();

    assert_eq!(report.epochs_run(), 5);
    assert!(!report.stopped_early);
    assert!(report.history.iter().all(|s| s.val_loss.is_some()));
    assert!((report.history[4].learning_rate - config.learning_rate_at(4)).abs() < 1e-9);
    assert_eq!(model.train_steps(), 10);
    assert!(model.is_synchronized());
    assert!(report.final_train_loss().unwrap() < report.history[0].train_loss);
}

#[test]
fn test_early_stopping_restores_best_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = CheckpointManager::new(dir.path(), CheckpointStrategy::Best, 2).unwrap();
    let mut model = common::build_model(common::cat_dog_vocab(), common::model_config(4, 8, true));
    let mut train = generator(&model);
    // 第一轮之后不可能再改善 1000，第二轮即触发早停
    let config = TrainConfig {
        epochs: 10,
        batch_size: 2,
        learning_rate: 0.01,
        patience: 1,
        min_delta: 1000.0,
        ..TrainConfig::default()
    };

    let report =
        titling::fit(&mut model, &config, &mut train, None, Some(&mut manager), 0).unwrap();

    assert!(report.stopped_early);
    assert_eq!(report.epochs_run(), 2);
    assert_eq!(report.best_epoch, Some(0));

    let best = CheckpointManager::load_checkpoint(manager.best_checkpoint().unwrap()).unwrap();
    assert_eq!(model.export_weights(), best.weights);
    assert!(model.is_synchronized());
}

#[test]
fn test_fit_resumes_from_initial_epoch() {
    let mut model = common::build_model(common::cat_dog_vocab(), common::model_config(4, 8, true));
    let mut train = generator(&model);
    let config = TrainConfig {
        epochs: 3,
        batch_size: 2,
        ..TrainConfig::default()
    };

    let report = titling::fit(&mut model, &config, &mut train, None, None, 2).unwrap();
    assert_eq!(report.epochs_run(), 1);
    assert_eq!(report.history[0].epoch, 2);

    let report = titling::fit(&mut model, &config, &mut train, None, None, 3).unwrap();
    assert_eq!(report.epochs_run(), 0);
    assert!(model.is_synchronized());
}
