//! # 训练图（Training Graph）
//!
//! Teacher forcing：每个位置都喂入真实的上一个词，一次前向覆盖整条定长序列。
//!
//! ```text
//! image, category ──▶ features ──projection──▶ encoded (D)
//!                                                 │
//!                          (0, 0) ──lstm step──▶ (h₀, c₀)      输出丢弃，只保留状态
//!                                                 │
//! input_ids[t] ──embedding──▶ x_t ──lstm step──▶ h_t ──output──▶ softmax ──▶ p_t
//! ```
//!
//! ## PAD 掩码
//!
//! `mask_padding = true` 时 PAD 位置直接跳过：状态原样带到下一步，不计损失，也不计入分母。
//! 关闭时 PAD 的词向量和普通 token 一样被送进 LSTM，所有 L 个位置都计入分母
//! （PAD 的目标是全零行，贡献的损失为 0）。
//!
//! ## 损失
//!
//! ```text
//! loss = Σ_t -Σ_v y[t,v] · ln(max(p[t,v], LOG_EPSILON)) / 计入的位置数
//! ```
//!
//! softmax + 交叉熵对 logits 的梯度是 `p · Σy - y`，梯度最后按同一个位置数缩放。

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

use crate::{
    LOG_EPSILON,
    adam::Adam,
    batch_generator::Batch,
    dense::{Dense, DenseGradients},
    embeddings::EmbeddingMatrix,
    error::{Result, TitlingError},
    feature_extractor::{FeatureExtractor, encode_features},
    graph::{Graph, Layer},
    lstm::{Lstm, LstmGradients, LstmStep},
    utils::{global_norm, softmax_1d},
};

pub struct TrainingGraph {
    extractor: Arc<dyn FeatureExtractor>,
    embeddings: Arc<EmbeddingMatrix>,
    pub projection: Dense,
    pub lstm: Lstm,
    pub output: Dense,
    pad_id: usize,
    mask_padding: bool,
    /// 键为 `层名/参数名`
    optimizers: BTreeMap<String, Adam>,
}

/// 一个位置的前向记录
struct Position {
    step: LstmStep,
    probs: Array1<f32>,
}

/// 一个样本的完整前向记录，反向传播按时间倒序消费
struct SampleTrace {
    features: Array1<f32>,
    seed: LstmStep,
    /// 被掩码的位置为 `None`
    positions: Vec<Option<Position>>,
}

impl TrainingGraph {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        embeddings: Arc<EmbeddingMatrix>,
        projection: Dense,
        lstm: Lstm,
        output: Dense,
        pad_id: usize,
        mask_padding: bool,
    ) -> Self {
        Self {
            extractor,
            embeddings,
            projection,
            lstm,
            output,
            pad_id,
            mask_padding,
            optimizers: BTreeMap::new(),
        }
    }

    pub fn mask_padding(&self) -> bool {
        self.mask_padding
    }

    pub fn extractor(&self) -> &dyn FeatureExtractor {
        self.extractor.as_ref()
    }

    pub fn embedding_dim(&self) -> usize {
        self.embeddings.dim()
    }

    fn trace(
        &self,
        image: ArrayView3<f32>,
        category: ArrayView1<f32>,
        input_ids: ArrayView1<usize>,
    ) -> Result<SampleTrace> {
        let features = encode_features(self.extractor.as_ref(), image, category)?;
        let encoded = self.projection.forward(&features);

        let (h0, c0) = self.lstm.zero_state();
        let seed = self.lstm.step(&encoded, &h0, &c0);
        let (mut h, mut c) = (seed.h.clone(), seed.c.clone());

        let mut positions = Vec::with_capacity(input_ids.len());
        for &id in input_ids.iter() {
            if self.mask_padding && id == self.pad_id {
                positions.push(None);
                continue;
            }
            let x = self.embeddings.lookup(id)?.to_owned();
            let step = self.lstm.step(&x, &h, &c);
            let probs = softmax_1d(&self.output.forward(&step.h));
            h = step.h.clone();
            c = step.c.clone();
            positions.push(Some(Position { step, probs }));
        }

        Ok(SampleTrace {
            features,
            seed,
            positions,
        })
    }

    /// 返回 (交叉熵之和, 计入的位置数)
    fn sample_loss(&self, trace: &SampleTrace, targets: ArrayView2<f32>) -> (f32, usize) {
        trace
            .positions
            .iter()
            .enumerate()
            .filter_map(|(t, position)| position.as_ref().map(|p| (t, p)))
            .fold((0.0, 0), |(loss, count), (t, position)| {
                (
                    loss + cross_entropy(&position.probs, targets.row(t)),
                    count + 1,
                )
            })
    }

    fn backward_sample(
        &self,
        trace: &SampleTrace,
        targets: ArrayView2<f32>,
        grads: &mut Gradients,
    ) {
        let mut grad_h = Array1::zeros(self.lstm.units());
        let mut grad_c = Array1::zeros(self.lstm.units());

        for (t, position) in trace.positions.iter().enumerate().rev() {
            // 被掩码的位置状态原样传递，梯度也原样传回上一步
            let Some(position) = position else {
                continue;
            };
            let target = targets.row(t);
            let grad_logits = &position.probs * target.sum() - &target;
            let grad_h_out =
                self.output
                    .backward(&position.step.h, &grad_logits, &mut grads.output);

            let (_, grad_h_prev, grad_c_prev) = self.lstm.backward_step(
                &position.step,
                &(grad_h_out + &grad_h),
                &grad_c,
                &mut grads.lstm,
            );
            grad_h = grad_h_prev;
            grad_c = grad_c_prev;
        }

        let (grad_encoded, _, _) =
            self.lstm
                .backward_step(&trace.seed, &grad_h, &grad_c, &mut grads.lstm);
        self.projection
            .backward(&trace.features, &grad_encoded, &mut grads.projection);
    }

    /// **前向 + 反向**
    ///
    /// 返回批次平均损失和同样按位置数平均的梯度。调用方负责校验批次形状。
    pub fn compute_gradients(&self, batch: &Batch) -> Result<(f32, Gradients)> {
        let mut grads = Gradients::zeros_like(self);
        let mut total_loss = 0.0;
        let mut counted = 0;

        for (index, image) in batch.images.iter().enumerate() {
            let trace = self.trace(
                image.view(),
                batch.categories.row(index),
                batch.input_ids.row(index),
            )?;
            let targets = batch.targets.index_axis(Axis(0), index);
            let (loss, count) = self.sample_loss(&trace, targets);
            total_loss += loss;
            counted += count;
            self.backward_sample(&trace, targets, &mut grads);
        }

        if counted == 0 {
            return Ok((0.0, grads));
        }
        grads.scale(1.0 / counted as f32);
        Ok((total_loss / counted as f32, grads))
    }

    /// 只做前向，返回批次平均损失
    pub fn loss(&self, batch: &Batch) -> Result<f32> {
        let mut total_loss = 0.0;
        let mut counted = 0;

        for (index, image) in batch.images.iter().enumerate() {
            let trace = self.trace(
                image.view(),
                batch.categories.row(index),
                batch.input_ids.row(index),
            )?;
            let (loss, count) =
                self.sample_loss(&trace, batch.targets.index_axis(Axis(0), index));
            total_loss += loss;
            counted += count;
        }

        Ok(if counted == 0 {
            0.0
        } else {
            total_loss / counted as f32
        })
    }

    /// **Teacher-forced 预测**：(L, V) 的概率矩阵
    ///
    /// 被掩码的位置用带过来的隐藏状态给出分布，和 Keras 掩码的行为一致。
    pub fn predict(
        &self,
        image: ArrayView3<f32>,
        category: ArrayView1<f32>,
        input_ids: ArrayView1<usize>,
    ) -> Result<Array2<f32>> {
        let trace = self.trace(image, category, input_ids)?;
        let mut probs = Array2::zeros((trace.positions.len(), self.output.output_dim()));
        let mut hidden = trace.seed.h.clone();

        for (t, position) in trace.positions.iter().enumerate() {
            let row = match position {
                Some(position) => {
                    hidden = position.step.h.clone();
                    position.probs.clone()
                }
                None => softmax_1d(&self.output.forward(&hidden)),
            };
            probs.row_mut(t).assign(&row);
        }

        Ok(probs)
    }

    /// **Adam 更新**，每个参数矩阵一个优化器，第一次用到时创建
    pub fn apply_gradients(&mut self, grads: &Gradients, lr: f32) {
        let Self {
            projection,
            lstm,
            output,
            optimizers,
            ..
        } = self;

        let updates: [(&mut dyn Layer, Vec<(&'static str, &Array2<f32>)>); 3] = [
            (projection as &mut dyn Layer, grads.projection.named()),
            (lstm as &mut dyn Layer, grads.lstm.named()),
            (output as &mut dyn Layer, grads.output.named()),
        ];

        for (layer, layer_grads) in updates {
            let layer_name = layer.name().to_string();
            let layer_grads: BTreeMap<&'static str, &Array2<f32>> =
                layer_grads.into_iter().collect();

            for (param, weights) in layer.weights_mut() {
                let Some(grad) = layer_grads.get(param) else {
                    continue;
                };
                optimizers
                    .entry(format!("{layer_name}/{param}"))
                    .or_insert_with(|| Adam::new(weights.dim()))
                    .step(weights, grad, lr);
            }
        }
    }

    pub fn optimizer_states(&self) -> &BTreeMap<String, Adam> {
        &self.optimizers
    }

    /// 每个 `层名/参数名` 都必须对应训练图中的一个参数，且 `m`、`v` 与该参数同形
    pub fn check_optimizer_states(&self, states: &BTreeMap<String, Adam>) -> Result<()> {
        for (key, adam) in states {
            let (layer_name, param) = key.split_once('/').unwrap_or((key.as_str(), ""));
            let layers = self.layers();
            let layer = layers
                .iter()
                .find(|layer| layer.name() == layer_name)
                .ok_or_else(|| TitlingError::LayerMismatch {
                    layer: layer_name.to_string(),
                    graph: self.graph_name().to_string(),
                })?;
            let (_, weights) = layer
                .weights()
                .into_iter()
                .find(|(name, _)| *name == param)
                .ok_or_else(|| TitlingError::MissingParameter {
                    layer: layer_name.to_string(),
                    param: param.to_string(),
                })?;

            for state in [&adam.m, &adam.v] {
                if state.dim() != weights.dim() {
                    return Err(TitlingError::ParameterMismatch {
                        layer: layer_name.to_string(),
                        param: param.to_string(),
                        expected: weights.dim(),
                        actual: state.dim(),
                    });
                }
            }
        }
        Ok(())
    }

    /// 校验通过才整体替换；失败时保留原有的优化器状态
    pub fn restore_optimizer_states(&mut self, states: BTreeMap<String, Adam>) -> Result<()> {
        self.check_optimizer_states(&states)?;
        self.optimizers = states;
        Ok(())
    }
}

impl Graph for TrainingGraph {
    fn graph_name(&self) -> &str {
        "training"
    }

    fn layers(&self) -> Vec<&dyn Layer> {
        vec![&self.projection, &self.lstm, &self.output]
    }

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.projection, &mut self.lstm, &mut self.output]
    }
}

fn cross_entropy(probs: &Array1<f32>, target: ArrayView1<f32>) -> f32 {
    -probs
        .iter()
        .zip(target.iter())
        .filter(|&(_, &y)| y != 0.0)
        .map(|(&p, &y)| y * p.max(LOG_EPSILON).ln())
        .sum::<f32>()
}

/// 训练图三个层的梯度
#[derive(Clone, Debug, PartialEq)]
pub struct Gradients {
    pub projection: DenseGradients,
    pub lstm: LstmGradients,
    pub output: DenseGradients,
}

impl Gradients {
    pub fn zeros_like(graph: &TrainingGraph) -> Self {
        Self {
            projection: DenseGradients::zeros_like(&graph.projection),
            lstm: LstmGradients::zeros_like(&graph.lstm),
            output: DenseGradients::zeros_like(&graph.output),
        }
    }

    fn tensors(&self) -> impl Iterator<Item = &Array2<f32>> {
        self.projection
            .named()
            .into_iter()
            .chain(self.lstm.named())
            .chain(self.output.named())
            .map(|(_, g)| g)
    }

    pub fn scale(&mut self, factor: f32) {
        for (_, g) in self
            .projection
            .named_mut()
            .into_iter()
            .chain(self.lstm.named_mut())
            .chain(self.output.named_mut())
        {
            g.mapv_inplace(|v| v * factor);
        }
    }

    pub fn global_norm(&self) -> f32 {
        global_norm(self.tensors())
    }

    /// 全局范数超过 `max_norm` 时按比例缩小，返回裁剪前的范数
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if norm.is_finite() && norm > max_norm && norm > 0.0 {
            self.scale(max_norm / norm);
        }
        norm
    }
}
