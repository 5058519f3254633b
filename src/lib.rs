//! # titling - 图像标题生成（双图 LSTM 编码器 / 解码器）
//!
//! 给定一张图片和一个类别，逐词生成一句标题。纯 Rust 实现，只依赖 `ndarray` 做矩阵运算，
//! 所有前向 / 反向传播手写。
//!
//! ## 核心设计
//!
//! 1. **训练图（Training Graph）**：teacher forcing，一次处理整条填充到 `max_len` 的序列
//! 2. **推理编码图（Inference Encoder Graph）**：图像 + 类别 → 编码向量
//! 3. **推理解码图（Inference Decoder Graph）**：每次只走一步 LSTM
//! 4. **权重同步**：训练图是权重的唯一来源，按层名显式复制到两个推理图，全有或全无
//!
//! ## 模块组织
//!
//! ### 模型
//! - `model`: `CaptionModel`，持有三张图并暴露训练 / 同步 / 生成接口
//! - `training_graph`, `inference`: 三张计算图
//! - `graph`: `Layer` / `Graph` trait 与按名字的权重同步
//! - `generation`: 贪心解码状态机（SEEDING / STEPPING / DONE）
//!
//! ### 神经网络层
//! - `dense`: 全连接层（投影层、输出层）
//! - `lstm`: LSTM 单元及其 BPTT 反向传播
//! - `embeddings`: 冻结的词向量矩阵
//! - `feature_extractor`: 冻结的卷积图像编码器 + 全局平均池化
//!
//! ### 数据
//! - `vocab`: 词表与保留 token
//! - `sample_encoder`: 单个样本 → 定长张量
//! - `batch_generator`: 打乱的定长批次
//! - `dataset_loader`: 帖子 JSON 文件
//!
//! ### 训练与持久化
//! - `adam`, `trainer`, `checkpoint_manager`, `model_serialization`, `config`, `error`
//! - `performance_monitor`, `utils`

pub mod adam;
pub mod batch_generator;
pub mod checkpoint_manager;
pub mod config;
pub mod dataset_loader;
pub mod dense;
pub mod embeddings;
pub mod error;
pub mod feature_extractor;
pub mod generation;
pub mod graph;
pub mod inference;
pub mod lstm;
pub mod model;
pub mod model_serialization;
pub mod performance_monitor;
pub mod sample_encoder;
pub mod trainer;
pub mod training_graph;
pub mod utils;
pub mod vocab;

pub use batch_generator::{Batch, BatchGenerator, ExampleSource, ImageSource, InMemoryImages};
pub use checkpoint_manager::{CheckpointManager, CheckpointStrategy};
pub use config::{ModelConfig, TrainConfig};
pub use embeddings::EmbeddingMatrix;
pub use error::{Result, TitlingError};
pub use feature_extractor::{FeatureExtractor, FrozenConvEncoder};
pub use generation::{DecodeState, Generation, StopReason, TitleDecoder};
pub use graph::{Graph, Layer};
pub use model::CaptionModel;
pub use model_serialization::{WeightSnapshot, load_weights_auto};
pub use performance_monitor::PerformanceMonitor;
pub use sample_encoder::{EncodedSample, SampleEncoder, TrainingExample};
pub use trainer::{TrainingReport, fit};
pub use vocab::{SpecialToken, Vocab};

// ============================================================================
// 模型超参数（Model Hyperparameters）
// ============================================================================

/// **标题最大长度 L**
///
/// 训练时输入 / 目标序列都填充或截断到这个长度；生成时最多产出这么多个词。
pub const DEFAULT_MAX_LEN: usize = 20;

/// **LSTM 隐藏状态宽度 R**
pub const DEFAULT_LSTM_SIZE: usize = 256;

/// **类别数量 C**（one-hot 类别向量的宽度）
pub const DEFAULT_NUM_CATEGORIES: usize = 20;

/// **输入图像形状** `[height, width, channels]`
pub const DEFAULT_IMAGE_SHAPE: [usize; 3] = [224, 224, 3];

/// **梯度裁剪阈值**（全局 L2 范数）
pub const DEFAULT_CLIP_NORM: f32 = 5.0;

// ============================================================================
// 层名（权重同步按这些名字匹配）
// ============================================================================

pub const PROJECTION_LAYER: &str = "projection";
pub const LSTM_LAYER: &str = "lstm";
pub const OUTPUT_LAYER: &str = "output";

// ============================================================================
// 数值稳定性常量 (Numerical Stability Constants)
// ============================================================================

/// **对数运算专用常量**
///
/// 交叉熵需要对概率取对数，log(0) = -∞，因此先截断到这个下限：
///
/// ```text
/// loss = -y · ln(max(p, LOG_EPSILON))
/// ```
pub const LOG_EPSILON: f32 = 1e-10;

/// **Softmax 归一化专用常量**，防止指数和为 0 时除零
pub const SOFTMAX_EPSILON: f32 = 1e-12;
