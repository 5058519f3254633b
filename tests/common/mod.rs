//! 集成测试共用的小模型和数据

#![allow(dead_code)]

use std::sync::Arc;

use ndarray::Array3;
use titling::{
    Batch, CaptionModel, EmbeddingMatrix, FrozenConvEncoder, ModelConfig, SampleEncoder,
    TrainingExample, Vocab,
};

pub const IMAGE_SHAPE: [usize; 3] = [8, 8, 3];
pub const EMBEDDING_DIM: usize = 8;
pub const FEATURE_CHANNELS: usize = 4;

/// {START=0, PAD=1, UNK=2, END=3, cat=4, dog=5}
pub fn cat_dog_vocab() -> Arc<Vocab> {
    Arc::new(Vocab::new(["cat", "dog"]))
}

pub fn image(value: f32) -> Array3<f32> {
    let [h, w, c] = IMAGE_SHAPE;
    Array3::from_shape_fn((h, w, c), |(y, x, ch)| value + 0.05 * ((y + x + ch) % 3) as f32)
}

pub fn model_config(max_len: usize, lstm_size: usize, mask_padding: bool) -> ModelConfig {
    ModelConfig {
        max_len,
        lstm_size,
        num_categories: 2,
        image_shape: IMAGE_SHAPE,
        mask_padding,
        clip_norm: 5.0,
        seed: Some(42),
    }
}

pub fn embeddings(vocab: &Vocab) -> Arc<EmbeddingMatrix> {
    Arc::new(EmbeddingMatrix::random(vocab.len(), EMBEDDING_DIM, Some(7)))
}

pub fn extractor() -> Arc<FrozenConvEncoder> {
    Arc::new(FrozenConvEncoder::new(3, FEATURE_CHANNELS, 9))
}

pub fn build_model(vocab: Arc<Vocab>, config: ModelConfig) -> CaptionModel {
    let embeddings = embeddings(&vocab);
    CaptionModel::new(config, vocab, embeddings, extractor()).unwrap()
}

pub fn example(title: &str, category: usize, value: f32) -> TrainingExample {
    TrainingExample {
        image: image(value),
        category,
        title: title.to_string(),
    }
}

pub fn batch(model: &CaptionModel, examples: &[TrainingExample]) -> Batch {
    let encoder = SampleEncoder::new(
        Arc::new(model.vocab().clone()),
        model.config().max_len,
        model.config().num_categories,
    )
    .unwrap();
    let samples: Vec<_> = examples.iter().map(|e| encoder.encode(e).unwrap()).collect();
    Batch::from_samples(&samples).unwrap()
}

/// 在同一个批次上反复训练，直到 loss 低于 `target` 或用完 `max_steps`，返回最后的 loss
pub fn train_until(
    model: &mut CaptionModel,
    batch: &Batch,
    target: f32,
    max_steps: usize,
) -> f32 {
    let mut loss = f32::INFINITY;
    for _ in 0..max_steps {
        loss = model.train_step(batch).unwrap();
        if loss < target {
            break;
        }
    }
    loss
}
