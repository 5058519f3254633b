/// 工具函数模块
///
/// 包含数学运算、激活函数、随机初始化等通用工具
use std::cmp::Ordering;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::SOFTMAX_EPSILON;

/// Softmax激活函数（按行）
///
/// 对输入张量的每一行应用softmax，将数值转换为概率分布。
/// 使用数值稳定的实现（减去最大值避免溢出）。
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();

    for mut row in result.rows_mut() {
        // 找到该行的最大值（用于数值稳定）
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // 计算exp(x - max)
        row.mapv_inplace(|x| (x - max_val).exp());

        // 归一化
        let sum_exp: f32 = row.sum();
        row.mapv_inplace(|x| x / sum_exp.max(SOFTMAX_EPSILON));
    }

    result
}

/// 单个向量的 softmax，解码器每一步只产生一行 logits
pub fn softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    softmax(&logits.view().insert_axis(Axis(0)).to_owned())
        .index_axis_move(Axis(0), 0)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 贪心解码：返回概率最大的下标。并列时取最小下标。
pub fn argmax(values: ArrayView1<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_idx, best), (idx, &v)| {
            match v.partial_cmp(&best) {
                Some(Ordering::Greater) => (idx, v),
                _ => (best_idx, best),
            }
        })
        .0
}

/// 外积 `a ⊗ b`，形状 (a.len(), b.len())
pub fn outer(a: &Array1<f32>, b: &Array1<f32>) -> Array2<f32> {
    a.view()
        .insert_axis(Axis(1))
        .dot(&b.view().insert_axis(Axis(0)))
}

pub fn one_hot(index: usize, size: usize) -> Array1<f32> {
    let mut v = Array1::zeros(size);
    if index < size {
        v[index] = 1.0;
    }
    v
}

/// 多个梯度矩阵的全局 L2 范数
pub fn global_norm<'a>(grads: impl IntoIterator<Item = &'a Array2<f32>>) -> f32 {
    grads
        .into_iter()
        .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// 正态分布采样；参数非法时退化为 `[-std, std)` 均匀分布
pub fn sample_normal<R: Rng + ?Sized>(rng: &mut R, mean: f32, std: f32) -> f32 {
    match Normal::new(mean, std) {
        Ok(normal) => normal.sample(rng),
        Err(_) => mean + rng.random_range(-std.abs().max(1e-6)..std.abs().max(1e-6)),
    }
}

/// 有种子时可复现，否则从操作系统取熵
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
