//! # 样本编码器（Sample Encoder）
//!
//! 一个训练样本 (image, category, title) → 定长张量：
//!
//! ```text
//! title     = "cat dog cat"           max_len = 6
//! canonical = [START, cat, dog, cat, END]           = [0, 4, 5, 4, 3]
//! input     = canonical[..-1] + PAD                 = [0, 4, 5, 4, 1, 1]
//! target    = canonical[1..]  + 全零行               = one_hot[4, 5, 4, 3], 0, 0
//! ```
//!
//! 标题最多保留 `max_len - 1` 个词，为 START / END 留出位置，所以 input 和 target
//! 总是长度恰好为 `max_len` 的、相差一步的两个序列。词表里没有的词映射到 `<UNK>`，不会报错。

use std::sync::Arc;

use ndarray::{Array1, Array2, Array3};

use crate::{
    error::{Result, TitlingError},
    utils::one_hot,
    vocab::Vocab,
};

/// 原始训练样本
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingExample {
    /// (H, W, C) 像素数组
    pub image: Array3<f32>,
    /// 类别下标，取值 [0, C)
    pub category: usize,
    pub title: String,
}

/// 编码后的定长样本
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedSample {
    pub image: Array3<f32>,
    /// one-hot，长度 C
    pub category: Array1<f32>,
    /// 长度 L
    pub input_ids: Vec<usize>,
    /// (L, V)，PAD 位置为全零行
    pub targets: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct SampleEncoder {
    vocab: Arc<Vocab>,
    max_len: usize,
    num_categories: usize,
}

impl SampleEncoder {
    pub fn new(vocab: Arc<Vocab>, max_len: usize, num_categories: usize) -> Result<Self> {
        if max_len == 0 {
            return Err(TitlingError::InvalidConfig(
                "max_len must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            vocab,
            max_len,
            num_categories,
        })
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn num_categories(&self) -> usize {
        self.num_categories
    }

    /// `[START, w1..wk, END]`，k ≤ max_len - 1
    pub fn canonical_sequence(&self, title: &str) -> Vec<usize> {
        let words = Vocab::tokenize(title);
        let mut sequence = Vec::with_capacity(self.max_len + 1);
        sequence.push(self.vocab.start_id());
        sequence.extend(
            words
                .iter()
                .take(self.max_len - 1)
                .map(|word| self.vocab.id_of(word)),
        );
        sequence.push(self.vocab.end_id());
        sequence
    }

    /// 返回 (input_ids, target_ids)，两者长度都是 `max_len`；target 的 `None` 表示 PAD
    pub fn encode_title(&self, title: &str) -> (Vec<usize>, Vec<Option<usize>>) {
        let canonical = self.canonical_sequence(title);
        let pad = self.vocab.pad_id();

        let input_ids = canonical[..canonical.len() - 1]
            .iter()
            .copied()
            .chain(std::iter::repeat(pad))
            .take(self.max_len)
            .collect();
        let target_ids = canonical[1..]
            .iter()
            .copied()
            .map(Some)
            .chain(std::iter::repeat(None))
            .take(self.max_len)
            .collect();

        (input_ids, target_ids)
    }

    pub fn encode(&self, example: &TrainingExample) -> Result<EncodedSample> {
        if example.category >= self.num_categories {
            return Err(TitlingError::InvalidCategory {
                category: example.category,
                num_categories: self.num_categories,
            });
        }

        let (input_ids, target_ids) = self.encode_title(&example.title);
        let mut targets = Array2::zeros((self.max_len, self.vocab.len()));
        for (t, id) in target_ids.into_iter().enumerate() {
            if let Some(id) = id {
                targets[[t, id]] = 1.0;
            }
        }

        Ok(EncodedSample {
            image: example.image.clone(),
            category: one_hot(example.category, self.num_categories),
            input_ids,
            targets,
        })
    }
}
