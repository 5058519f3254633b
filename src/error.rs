//! # 错误类型（Error Types）
//!
//! 整个 crate 共用一个错误枚举。分三类：
//!
//! - **配置错误**：层名 / 参数名 / 参数形状不一致（权重同步、加载快照时触发），
//!   以及非法的超参数。这类错误必须在复制任何权重之前报告。
//! - **输入校验错误**：图像、类别、序列或批次形状不符合模型的固定输入形状，
//!   在任何计算开始之前返回给调用方。
//! - **I/O 与序列化错误**：检查点、快照、数据集文件的读写。
//!
//! 词表未命中（VocabularyMiss）不是错误：查表时直接回退到 `<UNK>`。
//! 生成达到 `max_len` 也不是错误，见 [`crate::generation::StopReason`]。

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TitlingError {
    /// 推理图中的层在权重来源里找不到同名层
    #[error("layer `{layer}` of the {graph} graph has no counterpart in the weight source")]
    LayerMismatch { layer: String, graph: String },

    #[error("layer `{layer}` is missing parameter `{param}` in the weight source")]
    MissingParameter { layer: String, param: String },

    #[error(
        "parameter `{layer}/{param}` has shape {actual:?} in the weight source, \
         expected {expected:?}"
    )]
    ParameterMismatch {
        layer: String,
        param: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// 输入张量与模型的固定输入形状不符
    #[error("{what} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("category {category} is out of range for {num_categories} categories")]
    InvalidCategory {
        category: usize,
        num_categories: usize,
    },

    #[error("token id {id} is out of range for a vocabulary of {vocab_size}")]
    InvalidTokenId { id: usize, vocab_size: usize },

    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load image {}: {reason}", .path.display())]
    ImageLoad { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("binary decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl TitlingError {
    pub(crate) fn shape(what: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        TitlingError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TitlingError>;
