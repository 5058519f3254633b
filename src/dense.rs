//! # 全连接层（Dense Layer）
//!
//! 模型里有两个全连接层：
//!
//! - `projection`: `concat(GAP(features), one_hot)` → 编码向量（宽度 D）
//! - `output`: LSTM 隐藏状态（宽度 R）→ 词表 logits（宽度 V）
//!
//! ```text
//! y = x · W + b        W: (in, out), b: (1, out)
//! ```
//!
//! 层本身不持有优化器和缓存：前向只读参数，反向把梯度累加进调用方提供的
//! [`DenseGradients`]，这样同一个层既能被训练图使用，也能在推理图里被并发读取。

use ndarray::{Array1, Array2};
use rand::Rng;

use crate::{
    graph::Layer,
    utils::{outer, sample_normal},
};

#[derive(Clone, Debug)]
pub struct Dense {
    name: String,
    /// **权重矩阵** W: (input_dim, output_dim)
    pub kernel: Array2<f32>,
    /// **偏置** b: (1, output_dim)
    pub bias: Array2<f32>,
}

impl Dense {
    /// # 初始化策略
    /// - **权重**: He 初始化 std = sqrt(2 / input_dim)
    /// - **偏置**: 全零
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> Self {
        let std = (2.0 / input_dim.max(1) as f32).sqrt();
        let kernel = Array2::from_shape_fn((input_dim, output_dim), |_| {
            sample_normal(&mut *rng, 0.0, std)
        });

        Self {
            name: name.into(),
            kernel,
            bias: Array2::zeros((1, output_dim)),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
        input.dot(&self.kernel) + &self.bias.row(0)
    }

    /// **反向传播**
    ///
    /// ```text
    /// grad_W += x^T · dy
    /// grad_b += dy
    /// grad_x  = dy · W^T
    /// ```
    pub fn backward(
        &self,
        input: &Array1<f32>,
        grad_output: &Array1<f32>,
        grads: &mut DenseGradients,
    ) -> Array1<f32> {
        grads.kernel += &outer(input, grad_output);
        let mut bias = grads.bias.row_mut(0);
        bias += grad_output;
        self.kernel.dot(grad_output)
    }
}

impl Layer for Dense {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> &str {
        "Dense"
    }

    fn weights(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![("kernel", &self.kernel), ("bias", &self.bias)]
    }

    fn weights_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![("kernel", &mut self.kernel), ("bias", &mut self.bias)]
    }
}

/// 一个 [`Dense`] 层在一个批次上累积的梯度
#[derive(Clone, Debug, PartialEq)]
pub struct DenseGradients {
    pub kernel: Array2<f32>,
    pub bias: Array2<f32>,
}

impl DenseGradients {
    pub fn zeros_like(layer: &Dense) -> Self {
        Self {
            kernel: Array2::zeros(layer.kernel.dim()),
            bias: Array2::zeros(layer.bias.dim()),
        }
    }

    pub fn named(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![("kernel", &self.kernel), ("bias", &self.bias)]
    }

    pub fn named_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![("kernel", &mut self.kernel), ("bias", &mut self.bias)]
    }
}
