//! # LSTM 单元（Long Short-Term Memory）
//!
//! 训练图和推理解码图共用同一种单元：训练图在整条序列上循环调用 [`Lstm::step`]
//! 并保留每一步的中间值做 BPTT；解码图每生成一个词只调用一次。
//!
//! ## 门的顺序
//!
//! 参数按 `[i | f | g | o]` 四段拼接，每段宽度 R：
//!
//! ```text
//! z = x · W + h_prev · U + b              W: (D, 4R), U: (R, 4R), b: (1, 4R)
//! i = σ(z_i)   f = σ(z_f)   g = tanh(z_g)   o = σ(z_o)
//! c = f ⊙ c_prev + i ⊙ g
//! h = o ⊙ tanh(c)
//! ```
//!
//! 遗忘门偏置初始化为 1，让初始状态更容易沿序列保留下来。

use ndarray::{Array1, Array2, s};
use rand::Rng;

use crate::{
    graph::Layer,
    utils::{outer, sample_normal, sigmoid},
};

#[derive(Clone, Debug)]
pub struct Lstm {
    name: String,
    units: usize,
    /// 输入权重 W: (input_dim, 4R)
    pub kernel: Array2<f32>,
    /// 循环权重 U: (R, 4R)
    pub recurrent_kernel: Array2<f32>,
    /// 偏置 b: (1, 4R)
    pub bias: Array2<f32>,
}

/// 单步前向的全部中间值，反向传播时需要
#[derive(Clone, Debug)]
pub struct LstmStep {
    pub x: Array1<f32>,
    pub h_prev: Array1<f32>,
    pub c_prev: Array1<f32>,
    pub i: Array1<f32>,
    pub f: Array1<f32>,
    pub g: Array1<f32>,
    pub o: Array1<f32>,
    pub c: Array1<f32>,
    pub tanh_c: Array1<f32>,
    pub h: Array1<f32>,
}

impl Lstm {
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        units: usize,
        rng: &mut R,
    ) -> Self {
        // Glorot：std = sqrt(2 / (fan_in + fan_out))
        let kernel_std = (2.0 / (input_dim + 4 * units).max(1) as f32).sqrt();
        let recurrent_std = 1.0 / (units.max(1) as f32).sqrt();

        let kernel = Array2::from_shape_fn((input_dim, 4 * units), |_| {
            sample_normal(&mut *rng, 0.0, kernel_std)
        });
        let recurrent_kernel = Array2::from_shape_fn((units, 4 * units), |_| {
            sample_normal(&mut *rng, 0.0, recurrent_std)
        });
        let mut bias = Array2::zeros((1, 4 * units));
        bias.slice_mut(s![0, units..2 * units]).fill(1.0);

        Self {
            name: name.into(),
            units,
            kernel,
            recurrent_kernel,
            bias,
        }
    }

    pub fn units(&self) -> usize {
        self.units
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn zero_state(&self) -> (Array1<f32>, Array1<f32>) {
        (Array1::zeros(self.units), Array1::zeros(self.units))
    }

    /// 单步前向，保留中间值
    pub fn step(&self, x: &Array1<f32>, h_prev: &Array1<f32>, c_prev: &Array1<f32>) -> LstmStep {
        let r = self.units;
        let z = x.dot(&self.kernel) + h_prev.dot(&self.recurrent_kernel) + &self.bias.row(0);

        let i = z.slice(s![0..r]).mapv(sigmoid);
        let f = z.slice(s![r..2 * r]).mapv(sigmoid);
        let g = z.slice(s![2 * r..3 * r]).mapv(f32::tanh);
        let o = z.slice(s![3 * r..4 * r]).mapv(sigmoid);

        let c = &f * c_prev + &i * &g;
        let tanh_c = c.mapv(f32::tanh);
        let h = &o * &tanh_c;

        LstmStep {
            x: x.clone(),
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            i,
            f,
            g,
            o,
            c,
            tanh_c,
            h,
        }
    }

    /// 单步前向，只返回新的 `(h, c)`
    pub fn forward(
        &self,
        x: &Array1<f32>,
        h_prev: &Array1<f32>,
        c_prev: &Array1<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let step = self.step(x, h_prev, c_prev);
        (step.h, step.c)
    }

    /// **单步反向传播（BPTT 的一步）**
    ///
    /// `grad_h` / `grad_c` 是流入本步输出 `h` / `c` 的总梯度。参数梯度累加进 `grads`，
    /// 返回 `(grad_x, grad_h_prev, grad_c_prev)`。
    ///
    /// ```text
    /// do = dh ⊙ tanh(c)
    /// dc = dc + dh ⊙ o ⊙ (1 - tanh²(c))
    /// di = dc ⊙ g     df = dc ⊙ c_prev     dg = dc ⊙ i     dc_prev = dc ⊙ f
    /// dz = [di·i(1-i) | df·f(1-f) | dg·(1-g²) | do·o(1-o)]
    /// ```
    pub fn backward_step(
        &self,
        step: &LstmStep,
        grad_h: &Array1<f32>,
        grad_c: &Array1<f32>,
        grads: &mut LstmGradients,
    ) -> (Array1<f32>, Array1<f32>, Array1<f32>) {
        let r = self.units;

        let d_o = grad_h * &step.tanh_c;
        let d_c = grad_c + &(grad_h * &step.o * &step.tanh_c.mapv(|t| 1.0 - t * t));
        let d_i = &d_c * &step.g;
        let d_f = &d_c * &step.c_prev;
        let d_g = &d_c * &step.i;
        let grad_c_prev = &d_c * &step.f;

        let mut d_z = Array1::zeros(4 * r);
        d_z.slice_mut(s![0..r])
            .assign(&(d_i * &step.i.mapv(|v| v * (1.0 - v))));
        d_z.slice_mut(s![r..2 * r])
            .assign(&(d_f * &step.f.mapv(|v| v * (1.0 - v))));
        d_z.slice_mut(s![2 * r..3 * r])
            .assign(&(d_g * &step.g.mapv(|v| 1.0 - v * v)));
        d_z.slice_mut(s![3 * r..4 * r])
            .assign(&(d_o * &step.o.mapv(|v| v * (1.0 - v))));

        grads.kernel += &outer(&step.x, &d_z);
        grads.recurrent_kernel += &outer(&step.h_prev, &d_z);
        let mut bias = grads.bias.row_mut(0);
        bias += &d_z;

        let grad_x = self.kernel.dot(&d_z);
        let grad_h_prev = self.recurrent_kernel.dot(&d_z);

        (grad_x, grad_h_prev, grad_c_prev)
    }
}

impl Layer for Lstm {
    fn name(&self) -> &str {
        &self.name
    }

    fn layer_type(&self) -> &str {
        "LSTM"
    }

    fn weights(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![
            ("kernel", &self.kernel),
            ("recurrent_kernel", &self.recurrent_kernel),
            ("bias", &self.bias),
        ]
    }

    fn weights_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![
            ("kernel", &mut self.kernel),
            ("recurrent_kernel", &mut self.recurrent_kernel),
            ("bias", &mut self.bias),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LstmGradients {
    pub kernel: Array2<f32>,
    pub recurrent_kernel: Array2<f32>,
    pub bias: Array2<f32>,
}

impl LstmGradients {
    pub fn zeros_like(layer: &Lstm) -> Self {
        Self {
            kernel: Array2::zeros(layer.kernel.dim()),
            recurrent_kernel: Array2::zeros(layer.recurrent_kernel.dim()),
            bias: Array2::zeros(layer.bias.dim()),
        }
    }

    pub fn named(&self) -> Vec<(&'static str, &Array2<f32>)> {
        vec![
            ("kernel", &self.kernel),
            ("recurrent_kernel", &self.recurrent_kernel),
            ("bias", &self.bias),
        ]
    }

    pub fn named_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)> {
        vec![
            ("kernel", &mut self.kernel),
            ("recurrent_kernel", &mut self.recurrent_kernel),
            ("bias", &mut self.bias),
        ]
    }
}
