//! 检查点管理器模块
//!
//! 提供训练检查点的保存、加载和管理功能，支持多种保存策略：
//! - **Best**: 保存最佳模型（基于loss）
//! - **Last**: 保存最新模型，用于断点续训
//! - **Periodic**: 周期性保存（每N个epoch）
//!
//! 检查点包含完整的训练状态：
//! - 训练图的权重快照（按层名组织）
//! - 优化器状态（每个参数矩阵的 Adam m、v 和 timestep）
//! - 训练元数据（epoch、loss、学习率、时间戳、阶段）
//!
//! 每个 `.bin` 检查点旁边都有一个同名 `.json` 元数据文件，方便直接查看。

use std::fs;
use std::path::{Path, PathBuf};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::CaptionModel,
    model_serialization::{
        self, OptimizerSnapshot, WeightSnapshot, export_optimizers, import_optimizers,
    },
};

const BEST_PREFIX: &str = "checkpoint_best";
const LAST_FILE: &str = "checkpoint_last.bin";

/// 检查点元数据
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 当前epoch（从 0 开始）
    pub epoch: usize,
    /// 本轮用于比较的 loss（有验证集时为验证 loss）
    pub loss: f32,
    pub learning_rate: f32,
    /// 保存时间戳
    pub timestamp: String,
    /// 训练阶段标识
    pub phase: String,
    pub train_steps: usize,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        loss: f32,
        learning_rate: f32,
        phase: &str,
        train_steps: usize,
    ) -> Self {
        Self {
            epoch,
            loss,
            learning_rate,
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            phase: phase.to_string(),
            train_steps,
        }
    }
}

/// 完整的检查点数据
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct Checkpoint {
    pub weights: WeightSnapshot,
    pub optimizer: OptimizerSnapshot,
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    pub fn capture(model: &CaptionModel, metadata: CheckpointMetadata) -> Self {
        Self {
            weights: model.export_weights(),
            optimizer: export_optimizers(model.optimizer_states()),
            metadata,
        }
    }

    /// 把检查点写回模型：权重、优化器状态和学习率。推理图随之重新同步。
    pub fn restore_into(&self, model: &mut CaptionModel) -> Result<()> {
        let optimizers = import_optimizers(&self.optimizer)?;
        model.training_graph().check_optimizer_states(&optimizers)?;
        model.load_weights(&self.weights)?;
        model.restore_optimizer_states(optimizers)?;
        model.set_learning_rate(self.metadata.learning_rate);
        Ok(())
    }
}

/// 检查点保存策略
#[derive(Clone, Debug, PartialEq)]
pub enum CheckpointStrategy {
    /// 仅保存最佳模型
    Best,
    /// 保存最新模型
    Last,
    /// 周期性保存（每N个epoch）
    Periodic(usize),
    /// 组合策略：最佳 + 最新
    BestAndLast,
    /// 组合策略：最佳 + 周期性
    BestAndPeriodic(usize),
}

/// 检查点管理器
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    strategy: CheckpointStrategy,
    best_loss: f32,
    best_epoch: usize,
    /// 保留的最佳检查点数量
    keep_best_n: usize,
}

impl CheckpointManager {
    /// 创建检查点管理器，目录不存在时自动创建
    pub fn new<P: AsRef<Path>>(
        checkpoint_dir: P,
        strategy: CheckpointStrategy,
        keep_best_n: usize,
    ) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            strategy,
            best_loss: f32::INFINITY,
            best_epoch: 0,
            keep_best_n: keep_best_n.max(1),
        })
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn strategy(&self) -> &CheckpointStrategy {
        &self.strategy
    }

    fn is_periodic_epoch(n: usize, epoch: usize) -> bool {
        n > 0 && (epoch + 1) % n == 0
    }

    /// 检查这一轮是否会写出任何检查点
    pub fn should_save(&self, epoch: usize, current_loss: f32) -> bool {
        let improved = current_loss < self.best_loss;
        match self.strategy {
            CheckpointStrategy::Best => improved,
            CheckpointStrategy::Last | CheckpointStrategy::BestAndLast => true,
            CheckpointStrategy::Periodic(n) => Self::is_periodic_epoch(n, epoch),
            CheckpointStrategy::BestAndPeriodic(n) => {
                improved || Self::is_periodic_epoch(n, epoch)
            }
        }
    }

    fn best_file_name(metadata: &CheckpointMetadata) -> String {
        format!(
            "{}_epoch_{}_loss_{:.4}.bin",
            BEST_PREFIX, metadata.epoch, metadata.loss
        )
    }

    fn periodic_file_name(metadata: &CheckpointMetadata) -> String {
        format!("checkpoint_epoch_{}.bin", metadata.epoch)
    }

    /// **按策略保存检查点**
    ///
    /// 返回本次写出的所有检查点路径；策略认为不需要保存时返回空列表。
    /// 组合策略下同一轮可能同时写出最佳和最新两个文件。
    pub fn save_checkpoint(
        &mut self,
        model: &CaptionModel,
        metadata: CheckpointMetadata,
    ) -> Result<Vec<PathBuf>> {
        let is_best = metadata.loss < self.best_loss;

        let mut names = Vec::new();
        match self.strategy {
            CheckpointStrategy::Best => {
                if is_best {
                    names.push(Self::best_file_name(&metadata));
                }
            }
            CheckpointStrategy::Last => names.push(LAST_FILE.to_string()),
            CheckpointStrategy::Periodic(n) => {
                if Self::is_periodic_epoch(n, metadata.epoch) {
                    names.push(Self::periodic_file_name(&metadata));
                }
            }
            CheckpointStrategy::BestAndLast => {
                if is_best {
                    names.push(Self::best_file_name(&metadata));
                }
                names.push(LAST_FILE.to_string());
            }
            CheckpointStrategy::BestAndPeriodic(n) => {
                if is_best {
                    names.push(Self::best_file_name(&metadata));
                }
                if Self::is_periodic_epoch(n, metadata.epoch) {
                    names.push(Self::periodic_file_name(&metadata));
                }
            }
        }

        if names.is_empty() {
            return Ok(Vec::new());
        }

        let checkpoint = Checkpoint::capture(model, metadata);
        let mut saved = Vec::with_capacity(names.len());
        for name in names {
            let path = self.checkpoint_dir.join(name);
            model_serialization::save_binary(&checkpoint, &path)?;
            fs::write(
                path.with_extension("json"),
                serde_json::to_string_pretty(&checkpoint.metadata)?,
            )?;
            saved.push(path);
        }

        if is_best {
            self.best_loss = checkpoint.metadata.loss;
            self.best_epoch = checkpoint.metadata.epoch;
        }

        log::info!(
            "📦 检查点已保存: {} 个文件 (epoch={}, loss={:.4}{})",
            saved.len(),
            checkpoint.metadata.epoch,
            checkpoint.metadata.loss,
            if is_best { ", 🏆 NEW BEST!" } else { "" }
        );

        if is_best {
            self.cleanup_old_checkpoints()?;
        }

        Ok(saved)
    }

    /// 加载检查点
    pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint> {
        let checkpoint: Checkpoint = model_serialization::load_binary(path)?;
        log::info!(
            "✅ 检查点加载成功: epoch={}, loss={:.4}, phase={}",
            checkpoint.metadata.epoch,
            checkpoint.metadata.loss,
            checkpoint.metadata.phase
        );
        Ok(checkpoint)
    }

    /// loss 最低的最佳检查点
    pub fn best_checkpoint(&self) -> Option<PathBuf> {
        self.best_checkpoints()
            .ok()?
            .into_iter()
            .next()
            .map(|(path, _)| path)
    }

    /// 最新检查点；只有保存过 `Last` 类策略时才存在
    pub fn last_checkpoint(&self) -> Option<PathBuf> {
        let path = self.checkpoint_dir.join(LAST_FILE);
        path.exists().then_some(path)
    }

    /// 列出所有带元数据的检查点，按 epoch 排序
    pub fn list_checkpoints(&self) -> Result<Vec<(PathBuf, CheckpointMetadata)>> {
        let mut checkpoints = Vec::new();

        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("bin") {
                continue;
            }
            let metadata_path = path.with_extension("json");
            if metadata_path.exists() {
                let metadata: CheckpointMetadata =
                    serde_json::from_str(&fs::read_to_string(&metadata_path)?)?;
                checkpoints.push((path, metadata));
            }
        }

        checkpoints.sort_by_key(|(_, metadata)| metadata.epoch);
        Ok(checkpoints)
    }

    /// 所有最佳检查点，loss 从低到高
    fn best_checkpoints(&self) -> Result<Vec<(PathBuf, CheckpointMetadata)>> {
        let mut best: Vec<_> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|(path, _)| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(BEST_PREFIX))
            })
            .collect();
        best.sort_by(|(_, a), (_, b)| a.loss.total_cmp(&b.loss));
        Ok(best)
    }

    /// 清理旧的检查点，只保留最佳的N个
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        for (path, metadata) in self.best_checkpoints()?.iter().skip(self.keep_best_n) {
            log::info!(
                "🗑️  删除旧检查点: {} (epoch={}, loss={:.4})",
                path.display(),
                metadata.epoch,
                metadata.loss
            );
            fs::remove_file(path)?;
            let metadata_path = path.with_extension("json");
            if metadata_path.exists() {
                fs::remove_file(metadata_path)?;
            }
        }
        Ok(())
    }

    /// 续训时用已有的最佳 loss 初始化比较基准
    pub fn update_best_loss(&mut self, loss: f32, epoch: usize) {
        if loss < self.best_loss {
            self.best_loss = loss;
            self.best_epoch = epoch;
        }
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_strategy_should_save() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            CheckpointManager::new(dir.path(), CheckpointStrategy::Periodic(10), 3).unwrap();

        // epoch 从 0 开始计数，第 10、20 轮对应下标 9、19
        assert!(manager.should_save(9, 1.0));
        assert!(!manager.should_save(10, 1.0));
        assert!(manager.should_save(19, 1.0));
    }

    #[test]
    fn test_best_checkpoint_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path(), CheckpointStrategy::Best, 3).unwrap();

        manager.update_best_loss(2.0, 10);
        assert_eq!(manager.best_loss(), 2.0);
        assert_eq!(manager.best_epoch(), 10);

        manager.update_best_loss(1.5, 20);
        assert_eq!(manager.best_epoch(), 20);

        manager.update_best_loss(2.5, 30);
        assert_eq!(manager.best_loss(), 1.5);
        assert_eq!(manager.best_epoch(), 20);

        assert!(!manager.should_save(31, 1.6));
        assert!(manager.should_save(31, 1.4));
    }
}
