//! # 推理图（Inference Graphs）
//!
//! - [`InferenceEncoderGraph`]: (image, category) → 编码向量，没有循环部分
//! - [`InferenceDecoderGraph`]: (上一个词的词向量, h, c) → (词表分布, h', c')，只走一步
//!
//! 两张图各自持有 `projection` / `lstm` / `output` 的副本，层名与训练图相同，
//! 只有通过 [`crate::graph::synchronize`] 才会与训练图一致。

use std::sync::Arc;

use ndarray::{Array1, ArrayView1, ArrayView3};

use crate::{
    dense::Dense,
    error::Result,
    feature_extractor::{FeatureExtractor, encode_features},
    graph::{Graph, Layer},
    lstm::Lstm,
    utils::softmax_1d,
};

pub struct InferenceEncoderGraph {
    extractor: Arc<dyn FeatureExtractor>,
    pub projection: Dense,
}

impl InferenceEncoderGraph {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, projection: Dense) -> Self {
        Self {
            extractor,
            projection,
        }
    }

    pub fn extractor(&self) -> &dyn FeatureExtractor {
        self.extractor.as_ref()
    }

    pub fn encode(&self, image: ArrayView3<f32>, category: ArrayView1<f32>) -> Result<Array1<f32>> {
        let features = encode_features(self.extractor.as_ref(), image, category)?;
        Ok(self.projection.forward(&features))
    }
}

impl Graph for InferenceEncoderGraph {
    fn graph_name(&self) -> &str {
        "inference_encoder"
    }

    fn layers(&self) -> Vec<&dyn Layer> {
        vec![&self.projection]
    }

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.projection]
    }
}

/// 解码器单步输出
#[derive(Clone, Debug)]
pub struct DecoderOutput {
    pub probs: Array1<f32>,
    pub h: Array1<f32>,
    pub c: Array1<f32>,
}

pub struct InferenceDecoderGraph {
    pub lstm: Lstm,
    pub output: Dense,
}

impl InferenceDecoderGraph {
    pub fn new(lstm: Lstm, output: Dense) -> Self {
        Self { lstm, output }
    }

    /// 以编码向量为唯一输入、从零状态走一步，只保留 `(h, c)`
    pub fn seed(&self, encoded: &Array1<f32>) -> (Array1<f32>, Array1<f32>) {
        let (h0, c0) = self.lstm.zero_state();
        self.lstm.forward(encoded, &h0, &c0)
    }

    pub fn step(
        &self,
        prev_embedding: &Array1<f32>,
        h: &Array1<f32>,
        c: &Array1<f32>,
    ) -> DecoderOutput {
        let (h, c) = self.lstm.forward(prev_embedding, h, c);
        let probs = softmax_1d(&self.output.forward(&h));
        DecoderOutput { probs, h, c }
    }

    pub fn vocab_size(&self) -> usize {
        self.output.output_dim()
    }
}

impl Graph for InferenceDecoderGraph {
    fn graph_name(&self) -> &str {
        "inference_decoder"
    }

    fn layers(&self) -> Vec<&dyn Layer> {
        vec![&self.lstm, &self.output]
    }

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer> {
        vec![&mut self.lstm, &mut self.output]
    }
}
