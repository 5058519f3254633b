//! 检查点管理器集成测试
//!
//! 测试检查点的保存、加载和训练恢复功能

use titling::{
    CheckpointManager, CheckpointStrategy,
    checkpoint_manager::{Checkpoint, CheckpointMetadata},
};

mod common;

fn trained_model(steps: usize) -> titling::CaptionModel {
    let mut model = common::build_model(common::cat_dog_vocab(), common::model_config(4, 8, true));
    let batch = common::batch(&model, &[common::example("cat dog", 0, 0.4)]);
    for _ in 0..steps {
        model.train_step(&batch).unwrap();
    }
    model
}

fn metadata(epoch: usize, loss: f32) -> CheckpointMetadata {
    CheckpointMetadata::new(epoch, loss, 0.001, "test", epoch * 10)
}

#[test]
fn test_best_and_last_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager =
        CheckpointManager::new(dir.path(), CheckpointStrategy::BestAndLast, 3).unwrap();
    let model = trained_model(1);

    // 第一次一定是最佳，同时写出最新
    let saved = manager.save_checkpoint(&model, metadata(0, 2.0)).unwrap();
    assert_eq!(saved.len(), 2);
    assert!(saved.iter().all(|p| p.exists() && p.with_extension("json").exists()));

    // 没有改善时只更新最新
    let saved = manager.save_checkpoint(&model, metadata(1, 2.5)).unwrap();
    assert_eq!(saved, vec![dir.path().join("checkpoint_last.bin")]);

    assert_eq!(manager.best_loss(), 2.0);
    assert_eq!(manager.best_epoch(), 0);
    assert!(manager.last_checkpoint().is_some());

    let best = manager.best_checkpoint().unwrap();
    assert!(best.file_name().unwrap().to_string_lossy().contains("epoch_0"));

    let last = CheckpointManager::load_checkpoint(manager.last_checkpoint().unwrap()).unwrap();
    assert_eq!(last.metadata.epoch, 1);
    assert_eq!(last.metadata.phase, "test");
}

#[test]
fn test_best_strategy_skips_worse_epochs_and_keeps_best_n() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = CheckpointManager::new(dir.path(), CheckpointStrategy::Best, 2).unwrap();
    let model = trained_model(0);

    for (epoch, loss) in [(0, 3.0), (1, 2.0), (2, 2.5), (3, 1.0)] {
        manager.save_checkpoint(&model, metadata(epoch, loss)).unwrap();
    }

    let listed = manager.list_checkpoints().unwrap();
    let epochs: Vec<usize> = listed.iter().map(|(_, m)| m.epoch).collect();
    // epoch 2 没有改善没有保存，epoch 0 被清理
    assert_eq!(epochs, vec![1, 3]);
    assert!(manager.last_checkpoint().is_none());
    assert_eq!(manager.best_loss(), 1.0);
}

#[test]
fn test_periodic_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager =
        CheckpointManager::new(dir.path(), CheckpointStrategy::Periodic(2), 1).unwrap();
    let model = trained_model(0);

    assert!(manager.save_checkpoint(&model, metadata(0, 1.0)).unwrap().is_empty());
    let saved = manager.save_checkpoint(&model, metadata(1, 1.0)).unwrap();
    assert_eq!(saved, vec![dir.path().join("checkpoint_epoch_1.bin")]);
}

#[test]
fn test_restore_reproduces_weights_optimizer_and_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = CheckpointManager::new(dir.path(), CheckpointStrategy::Last, 1).unwrap();
    let mut model = trained_model(5);
    model.synchronize_inference_weights().unwrap();

    let path = manager.save_checkpoint(&model, metadata(4, 0.5)).unwrap().remove(0);
    let checkpoint = CheckpointManager::load_checkpoint(&path).unwrap();
    assert_eq!(checkpoint, Checkpoint::capture(&model, checkpoint.metadata.clone()));

    let mut restored =
        common::build_model(common::cat_dog_vocab(), common::model_config(4, 8, true));
    checkpoint.restore_into(&mut restored).unwrap();

    assert!(restored.is_synchronized());
    assert_eq!(restored.export_weights(), model.export_weights());
    assert_eq!(restored.optimizer_states(), model.optimizer_states());
    assert_eq!(restored.learning_rate(), 0.001);

    let image = common::image(0.4);
    assert_eq!(
        restored.generate(image.view(), 0).unwrap(),
        model.generate(image.view(), 0).unwrap()
    );

    // 恢复后继续训练，两边的更新完全一致
    let batch = common::batch(&model, &[common::example("cat dog", 0, 0.4)]);
    model.set_learning_rate(0.001);
    let a = model.train_step(&batch).unwrap();
    let b = restored.train_step(&batch).unwrap();
    assert_eq!(a, b);
    assert_eq!(restored.export_weights(), model.export_weights());
}
