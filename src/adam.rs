//! # Adam 优化器
//!
//! 每个可训练参数矩阵各持有一个 `Adam` 实例，保存一阶矩 `m`、二阶矩 `v` 和步数。
//!
//! ```text
//! m = β1·m + (1-β1)·g
//! v = β2·v + (1-β2)·g²
//! θ = θ - lr · m̂ / (√v̂ + ε)      m̂ = m/(1-β1^t), v̂ = v/(1-β2^t)
//! ```

use ndarray::{Array2, Zip};

#[derive(Clone, Debug, PartialEq)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub timestep: usize,
    pub m: Array2<f32>,
    pub v: Array2<f32>,
}

impl Adam {
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            timestep: 0,
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    /// 用梯度 `grads` 更新 `params`。形状不一致或学习率非法时跳过本次更新。
    pub fn step(&mut self, params: &mut Array2<f32>, grads: &Array2<f32>, lr: f32) {
        if !lr.is_finite() || lr <= 0.0 {
            return;
        }
        if params.dim() != grads.dim() || self.m.dim() != grads.dim() {
            log::warn!(
                "Adam.step 形状不一致: params={:?}, grads={:?}, state={:?}，跳过更新",
                params.dim(),
                grads.dim(),
                self.m.dim()
            );
            return;
        }

        self.timestep += 1;
        let t = self.timestep as f32;
        let bias1 = (1.0 - self.beta1.powf(t)).max(1e-12);
        let bias2 = (1.0 - self.beta2.powf(t)).max(1e-12);
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        Zip::from(params)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(grads)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut adam = Adam::new((1, 2));
        let mut params = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap();
        let grads = Array2::from_shape_vec((1, 2), vec![0.5, -0.5]).unwrap();

        adam.step(&mut params, &grads, 0.1);

        // 第一步的更新幅度约等于 lr
        assert!((params[[0, 0]] - 0.9).abs() < 1e-4);
        assert!((params[[0, 1]] + 0.9).abs() < 1e-4);
        assert_eq!(adam.timestep, 1);
    }

    #[test]
    fn test_adam_skips_mismatched_shapes() {
        let mut adam = Adam::new((2, 2));
        let mut params = Array2::<f32>::ones((2, 2));
        let grads = Array2::<f32>::ones((1, 2));

        adam.step(&mut params, &grads, 0.1);

        assert_eq!(adam.timestep, 0);
        assert!(params.iter().all(|&p| p == 1.0));
    }
}
