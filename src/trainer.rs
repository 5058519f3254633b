//! 训练循环
//!
//! 包含：
//! 1. 指数衰减学习率 `lr = lr0 · rate^(epoch / steps)`
//! 2. 可选验证集，早停监控验证 loss（没有验证集时监控训练 loss）
//! 3. 早停时回滚到最佳 epoch 的权重
//! 4. 检查点管理集成与从 `initial_epoch` 续训
//! 5. 训练结束后同步推理图

use std::time::Instant;

use crate::{
    batch_generator::{BatchGenerator, ExampleSource},
    checkpoint_manager::{Checkpoint, CheckpointManager, CheckpointMetadata},
    config::TrainConfig,
    error::{Result, TitlingError},
    model::CaptionModel,
};

const PHASE: &str = "caption_training";

/// 一个 epoch 的统计
#[derive(Clone, Debug, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub learning_rate: f32,
    /// 损失非有限、被跳过的批次数
    pub skipped_batches: usize,
    pub seconds: f32,
}

impl EpochStats {
    /// 早停和检查点比较用的 loss
    pub fn monitored_loss(&self) -> f32 {
        self.val_loss.unwrap_or(self.train_loss)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingReport {
    pub history: Vec<EpochStats>,
    pub best_epoch: Option<usize>,
    pub best_loss: f32,
    pub stopped_early: bool,
}

impl TrainingReport {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }

    pub fn final_train_loss(&self) -> Option<f32> {
        self.history.last().map(|stats| stats.train_loss)
    }
}

/// 在整个生成器上求平均 loss，不更新参数
pub fn evaluate_generator<S: ExampleSource>(
    model: &CaptionModel,
    generator: &BatchGenerator<S>,
) -> Result<f32> {
    if generator.is_empty() {
        return Err(TitlingError::InvalidConfig(
            "validation set is smaller than one batch".to_string(),
        ));
    }
    let mut total = 0.0;
    for batch in generator.iter() {
        total += model.evaluate(&batch?)?;
    }
    Ok(total / generator.len() as f32)
}

/// **训练主循环**
///
/// # 参数
/// - `train` / `validation`: 批次生成器；每个 epoch 结束时训练集会重新打乱
/// - `checkpoints`: 可选检查点管理器，按其策略保存；保存失败只记录警告
/// - `initial_epoch`: 续训起点，一般是上次检查点的 `epoch + 1`
///
/// 返回时推理图已经与训练图同步。
pub fn fit<S: ExampleSource>(
    model: &mut CaptionModel,
    config: &TrainConfig,
    train: &mut BatchGenerator<S>,
    validation: Option<&BatchGenerator<S>>,
    mut checkpoints: Option<&mut CheckpointManager>,
    initial_epoch: usize,
) -> Result<TrainingReport> {
    config.validate()?;
    if train.is_empty() {
        return Err(TitlingError::InvalidConfig(format!(
            "training set is smaller than one batch of {}",
            train.batch_size()
        )));
    }

    let mut report = TrainingReport {
        best_loss: checkpoints
            .as_deref()
            .map_or(f32::INFINITY, CheckpointManager::best_loss),
        ..TrainingReport::default()
    };
    let mut best_state: Option<Checkpoint> = None;
    let mut wait = 0usize;
    let start_time = Instant::now();

    log::info!(
        "开始训练: epochs {}..{}, 每轮 {} 个批次, batch_size {}",
        initial_epoch,
        config.epochs,
        train.len(),
        train.batch_size()
    );

    for epoch in initial_epoch..config.epochs {
        let epoch_start = Instant::now();
        let learning_rate = config.learning_rate_at(epoch);
        model.set_learning_rate(learning_rate);

        let mut total_loss = 0.0;
        let mut counted = 0usize;
        let mut skipped_batches = 0usize;
        for index in 0..train.len() {
            let loss = model.train_step(&train.batch(index)?)?;
            if loss.is_finite() {
                total_loss += loss;
                counted += 1;
            } else {
                skipped_batches += 1;
            }
        }
        train.on_epoch_end();

        let stats = EpochStats {
            epoch,
            train_loss: if counted > 0 {
                total_loss / counted as f32
            } else {
                f32::NAN
            },
            val_loss: validation
                .map(|generator| evaluate_generator(&*model, generator))
                .transpose()?,
            learning_rate,
            skipped_batches,
            seconds: epoch_start.elapsed().as_secs_f32(),
        };
        let monitored = stats.monitored_loss();

        log::info!(
            "[{:3}/{:3}] Loss: {:.4} | Val: {} | PPL: {:.2} | LR: {:.6} | {:.1}s",
            epoch + 1,
            config.epochs,
            stats.train_loss,
            stats
                .val_loss
                .map_or_else(|| "-".to_string(), |loss| format!("{loss:.4}")),
            stats.train_loss.exp(),
            learning_rate,
            stats.seconds
        );

        if let Some(manager) = checkpoints.as_deref_mut() {
            if manager.should_save(epoch, monitored) {
                let metadata = CheckpointMetadata::new(
                    epoch,
                    monitored,
                    learning_rate,
                    PHASE,
                    model.train_steps(),
                );
                if let Err(e) = manager.save_checkpoint(model, metadata) {
                    log::warn!("保存检查点失败: {}", e);
                }
            }
        }

        report.history.push(stats);

        if monitored < report.best_loss - config.min_delta {
            report.best_loss = monitored;
            report.best_epoch = Some(epoch);
            wait = 0;
            if config.patience > 0 {
                best_state = Some(Checkpoint::capture(
                    model,
                    CheckpointMetadata::new(
                        epoch,
                        monitored,
                        learning_rate,
                        PHASE,
                        model.train_steps(),
                    ),
                ));
            }
        } else {
            wait += 1;
            if config.patience > 0 && wait >= config.patience {
                log::info!(
                    "🛑 早停触发: 最佳epoch {:?}, 最佳loss {:.4}, 停止epoch {}",
                    report.best_epoch,
                    report.best_loss,
                    epoch
                );
                report.stopped_early = true;
                restore_best(model, checkpoints.as_deref(), best_state.as_ref())?;
                break;
            }
        }
    }

    model.synchronize_inference_weights()?;
    log::info!(
        "训练结束: {} 个 epoch, 耗时 {:.1}s",
        report.epochs_run(),
        start_time.elapsed().as_secs_f32()
    );
    Ok(report)
}

/// 回滚到最佳权重：优先使用磁盘上的最佳检查点，其次使用本次训练在内存中记下的最佳状态
fn restore_best(
    model: &mut CaptionModel,
    manager: Option<&CheckpointManager>,
    in_memory: Option<&Checkpoint>,
) -> Result<()> {
    if let Some(path) = manager.and_then(CheckpointManager::best_checkpoint) {
        log::info!("🔄 加载最佳检查点: {}", path.display());
        match CheckpointManager::load_checkpoint(&path).and_then(|c| c.restore_into(model)) {
            Ok(()) => return Ok(()),
            Err(e) => log::warn!("加载最佳检查点失败: {}", e),
        }
    }

    match in_memory {
        Some(checkpoint) => {
            checkpoint.restore_into(model)?;
            log::info!(
                "✅ 已回滚到 epoch {} 的模型参数",
                checkpoint.metadata.epoch
            );
        }
        None => log::warn!("没有可回滚的最佳状态，保留当前权重"),
    }
    Ok(())
}
