//! # 冻结的图像特征提取器（Frozen Feature Extractor）
//!
//! 图像 → 特征图 → 全局平均池化 → 与 one-hot 类别拼接。拼接后的向量再经过
//! `projection` 层得到编码向量，这是视觉部分和语言部分之间唯一的桥梁：
//!
//! ```text
//! image (H, W, 3) ──extract──▶ (H', W', K) ──GAP──▶ (K,) ──concat(one_hot C)──▶ (K + C,)
//! ```
//!
//! 提取器是冻结的：训练图不会把梯度传进来，训练图与推理编码图通过 `Arc` 共享同一个实例。

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, s};

use crate::{
    error::{Result, TitlingError},
    utils::{sample_normal, seeded_rng},
};

pub trait FeatureExtractor: Send + Sync {
    /// 特征图的通道数 K，也就是池化后向量的长度
    fn output_channels(&self) -> usize;

    /// 在构建模型时检查图像形状 `[H, W, C]` 能否被处理
    fn validate_input_shape(&self, shape: [usize; 3]) -> Result<()>;

    fn extract(&self, image: ArrayView3<f32>) -> Result<Array3<f32>>;
}

/// **固定随机卷积编码器**
///
/// 单层 3×3、步长 2、无填充的卷积 + ReLU。权重由种子决定，创建后不再改变，
/// 用来在没有预训练 CNN 的环境里代替冻结的 VGG 主干。
pub struct FrozenConvEncoder {
    in_channels: usize,
    out_channels: usize,
    /// (3·3·in_channels, out_channels)，行按 (ky, kx, c) 展开
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl FrozenConvEncoder {
    const KERNEL_SIZE: usize = 3;
    const STRIDE: usize = 2;

    pub fn new(in_channels: usize, out_channels: usize, seed: u64) -> Self {
        let mut rng = seeded_rng(Some(seed));
        let fan_in = Self::KERNEL_SIZE * Self::KERNEL_SIZE * in_channels.max(1);
        // He 初始化：std = sqrt(2 / fan_in)
        let std = (2.0 / fan_in as f32).sqrt();
        let kernel = Array2::from_shape_fn((fan_in, out_channels), |_| {
            sample_normal(&mut rng, 0.0, std)
        });

        Self {
            in_channels,
            out_channels,
            kernel,
            bias: Array1::zeros(out_channels),
        }
    }

    fn output_size(extent: usize) -> usize {
        (extent - Self::KERNEL_SIZE) / Self::STRIDE + 1
    }
}

impl FeatureExtractor for FrozenConvEncoder {
    fn output_channels(&self) -> usize {
        self.out_channels
    }

    fn validate_input_shape(&self, shape: [usize; 3]) -> Result<()> {
        let [height, width, channels] = shape;
        if height < Self::KERNEL_SIZE || width < Self::KERNEL_SIZE || channels != self.in_channels
        {
            return Err(TitlingError::shape(
                "image for the convolutional encoder",
                &[Self::KERNEL_SIZE, Self::KERNEL_SIZE, self.in_channels],
                &shape,
            ));
        }
        Ok(())
    }

    fn extract(&self, image: ArrayView3<f32>) -> Result<Array3<f32>> {
        let (height, width, channels) = image.dim();
        self.validate_input_shape([height, width, channels])?;

        let out_h = Self::output_size(height);
        let out_w = Self::output_size(width);
        let k = Self::KERNEL_SIZE;
        let mut features = Array3::zeros((out_h, out_w, self.out_channels));

        for oy in 0..out_h {
            for ox in 0..out_w {
                let (y, x) = (oy * Self::STRIDE, ox * Self::STRIDE);
                // iter() 按逻辑顺序 (ky, kx, c) 展开，与 kernel 的行顺序一致
                let patch: Array1<f32> = image
                    .slice(s![y..y + k, x..x + k, ..])
                    .iter()
                    .copied()
                    .collect();
                let activation = (patch.dot(&self.kernel) + &self.bias).mapv(|v| v.max(0.0));
                features.slice_mut(s![oy, ox, ..]).assign(&activation);
            }
        }

        Ok(features)
    }
}

/// 全局平均池化：(H, W, K) → (K,)
pub fn global_average_pool(features: &Array3<f32>) -> Array1<f32> {
    let (height, width, channels) = features.dim();
    let cells = (height * width).max(1) as f32;
    if channels == 0 {
        return Array1::zeros(0);
    }
    features.sum_axis(Axis(0)).sum_axis(Axis(0)) / cells
}

/// **特征流水线**：`concat(GAP(extract(image)), category_one_hot)`
///
/// 训练图和推理编码图都调用这个函数，保证两边看到的输入完全一致。
pub fn encode_features(
    extractor: &dyn FeatureExtractor,
    image: ArrayView3<f32>,
    category: ArrayView1<f32>,
) -> Result<Array1<f32>> {
    let pooled = global_average_pool(&extractor.extract(image)?);
    Ok(pooled.iter().chain(category.iter()).copied().collect())
}
