//! # 词嵌入矩阵（Embedding Matrix）
//!
//! 一个 V×D 的冻结矩阵，第 i 行就是 token i 的词向量。训练图和解码器只读它，
//! 不会有梯度流进来，所以在三张图之间用 `Arc` 共享，不参与权重同步。
//!
//! ```text
//! id 4 ("cat") → table[4] = [0.23, -0.45, 0.67, ...]   (D 维)
//! ```

use ndarray::{Array2, ArrayView1};

use crate::{
    error::{Result, TitlingError},
    utils::{sample_normal, seeded_rng},
};

#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingMatrix {
    table: Array2<f32>,
}

impl EmbeddingMatrix {
    /// 使用外部提供的词向量（例如预训练的 GloVe）
    pub fn new(table: Array2<f32>) -> Result<Self> {
        if table.nrows() == 0 || table.ncols() == 0 {
            return Err(TitlingError::shape(
                "embedding matrix",
                &[1, 1],
                table.shape(),
            ));
        }
        if table.iter().any(|x| !x.is_finite()) {
            return Err(TitlingError::InvalidConfig(
                "embedding matrix contains non-finite values".to_string(),
            ));
        }
        Ok(Self { table })
    }

    /// **随机词向量**
    ///
    /// 没有预训练向量时使用，N(0, 1/√D)，这样每一行的 L2 范数约为 1。
    pub fn random(vocab_size: usize, dim: usize, seed: Option<u64>) -> Self {
        let mut rng = seeded_rng(seed);
        let std = 1.0 / (dim.max(1) as f32).sqrt();
        let table = Array2::from_shape_fn((vocab_size.max(1), dim.max(1)), |_| {
            sample_normal(&mut rng, 0.0, std)
        });
        Self { table }
    }

    pub fn vocab_size(&self) -> usize {
        self.table.nrows()
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }

    /// 越界时返回 `None`
    pub fn row(&self, id: usize) -> Option<ArrayView1<'_, f32>> {
        (id < self.table.nrows()).then(|| self.table.row(id))
    }

    pub fn lookup(&self, id: usize) -> Result<ArrayView1<'_, f32>> {
        self.row(id).ok_or(TitlingError::InvalidTokenId {
            id,
            vocab_size: self.table.nrows(),
        })
    }

    pub fn table(&self) -> &Array2<f32> {
        &self.table
    }
}
