//! # 配置
//!
//! 默认值来自 `lib.rs` 中的常量。两个结构都可以序列化成 JSON，和检查点放在一起，
//! 记录这次训练实际用了哪些参数。

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_CLIP_NORM, DEFAULT_IMAGE_SHAPE, DEFAULT_LSTM_SIZE, DEFAULT_MAX_LEN,
    DEFAULT_NUM_CATEGORIES,
    error::{Result, TitlingError},
};

/// [`crate::CaptionModel`] 的结构参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// 固定序列长度 L，也是生成词数的上限
    pub max_len: usize,
    /// LSTM 隐状态宽度 R
    pub lstm_size: usize,
    /// 类别数 C，即类别 one-hot 的宽度
    pub num_categories: usize,
    /// 图像形状 `[H, W, C]`
    pub image_shape: [usize; 3],
    /// PAD 位置不参与循环，也不计入损失
    pub mask_padding: bool,
    /// 梯度全局范数上限
    pub clip_norm: f32,
    /// 权重初始化种子，`None` 时使用系统随机源
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_LEN,
            lstm_size: DEFAULT_LSTM_SIZE,
            num_categories: DEFAULT_NUM_CATEGORIES,
            image_shape: DEFAULT_IMAGE_SHAPE,
            mask_padding: true,
            clip_norm: DEFAULT_CLIP_NORM,
            seed: None,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_len < 1 {
            return Err(TitlingError::InvalidConfig(
                "max_len must be at least 1".to_string(),
            ));
        }
        if self.lstm_size == 0 {
            return Err(TitlingError::InvalidConfig(
                "lstm_size must be positive".to_string(),
            ));
        }
        if self.num_categories == 0 {
            return Err(TitlingError::InvalidConfig(
                "num_categories must be positive".to_string(),
            ));
        }
        if self.image_shape.contains(&0) {
            return Err(TitlingError::InvalidConfig(format!(
                "image_shape {:?} has a zero dimension",
                self.image_shape
            )));
        }
        if !(self.clip_norm.is_finite() && self.clip_norm > 0.0) {
            return Err(TitlingError::InvalidConfig(format!(
                "clip_norm must be a positive finite number, got {}",
                self.clip_norm
            )));
        }
        Ok(())
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

/// [`crate::trainer::fit`] 的训练超参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// `lr = learning_rate * lr_decay_rate^(epoch / lr_decay_steps)`
    pub lr_decay_rate: f32,
    pub lr_decay_steps: f32,
    /// 连续多少个 epoch 没有改善就早停，`0` 表示不早停
    pub patience: usize,
    pub min_delta: f32,
    pub shuffle_seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 15,
            batch_size: 32,
            learning_rate: 1e-3,
            lr_decay_rate: 0.95,
            lr_decay_steps: 10.0,
            patience: 0,
            min_delta: 1e-4,
            shuffle_seed: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TitlingError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TitlingError::InvalidConfig(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        if !(self.lr_decay_rate > 0.0 && self.lr_decay_rate <= 1.0) {
            return Err(TitlingError::InvalidConfig(format!(
                "lr_decay_rate must be in (0, 1], got {}",
                self.lr_decay_rate
            )));
        }
        if !(self.lr_decay_steps > 0.0) {
            return Err(TitlingError::InvalidConfig(
                "lr_decay_steps must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn learning_rate_at(&self, epoch: usize) -> f32 {
        self.learning_rate * self.lr_decay_rate.powf(epoch as f32 / self.lr_decay_steps)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}
