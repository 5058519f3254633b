//! # 标题生成模型（Caption Model）
//!
//! 持有三张计算图，对外暴露三个核心操作：
//!
//! - [`CaptionModel::train_step`]: 在训练图上做一次 teacher-forced 更新
//! - [`CaptionModel::synchronize_inference_weights`]: 按层名把训练图的权重复制到推理图
//! - [`CaptionModel::generate`]: 用推理图逐词贪心生成标题
//!
//! ## 并发模型
//!
//! 生成只需要 `&self`，多个线程可以同时为不同图片生成标题；训练和同步需要 `&mut self`，
//! 借用检查保证权重复制不会与任何进行中的生成交错，生成看到的要么是同步前、要么是同步后
//! 的完整权重。
//!
//! ## 形状约定
//!
//! ```text
//! image      (H, W, 3)        = config.image_shape
//! category   [0, C)
//! input_ids  L                = config.max_len
//! targets    (L, V)           V = vocab.len()
//! ```
//!
//! 所有输入在任何计算开始之前校验，不符合时返回 `ShapeMismatch` / `InvalidCategory` /
//! `InvalidTokenId`。

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array2, ArrayView1, ArrayView3};

use crate::{
    LSTM_LAYER, OUTPUT_LAYER, PROJECTION_LAYER,
    adam::Adam,
    batch_generator::Batch,
    config::ModelConfig,
    dense::Dense,
    embeddings::EmbeddingMatrix,
    error::{Result, TitlingError},
    feature_extractor::FeatureExtractor,
    generation::{Generation, TitleDecoder},
    graph::{self, Graph},
    inference::{InferenceDecoderGraph, InferenceEncoderGraph},
    lstm::Lstm,
    model_serialization::{SnapshotMetadata, WeightSnapshot},
    training_graph::TrainingGraph,
    utils::{one_hot, seeded_rng},
    vocab::Vocab,
};

pub const DEFAULT_LEARNING_RATE: f32 = 1e-3;

pub struct CaptionModel {
    config: ModelConfig,
    vocab: Arc<Vocab>,
    embeddings: Arc<EmbeddingMatrix>,
    training: TrainingGraph,
    encoder: InferenceEncoderGraph,
    decoder: InferenceDecoderGraph,
    learning_rate: f32,
    synchronized: bool,
    train_steps: usize,
}

impl CaptionModel {
    /// **构建三张图**
    ///
    /// 三张图各自随机初始化，推理图在第一次同步之前输出的是确定但无意义的结果。
    pub fn new(
        config: ModelConfig,
        vocab: Arc<Vocab>,
        embeddings: Arc<EmbeddingMatrix>,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Result<Self> {
        config.validate()?;
        extractor.validate_input_shape(config.image_shape)?;

        let feature_dim = extractor.output_channels() + config.num_categories;
        let embedding_dim = embeddings.dim();
        let lstm_size = config.lstm_size;
        let vocab_size = vocab.len();
        let mut rng = seeded_rng(config.seed);

        let training = TrainingGraph::new(
            Arc::clone(&extractor),
            Arc::clone(&embeddings),
            Dense::new(PROJECTION_LAYER, feature_dim, embedding_dim, &mut rng),
            Lstm::new(LSTM_LAYER, embedding_dim, lstm_size, &mut rng),
            Dense::new(OUTPUT_LAYER, lstm_size, vocab_size, &mut rng),
            vocab.pad_id(),
            config.mask_padding,
        );
        let encoder = InferenceEncoderGraph::new(
            extractor,
            Dense::new(PROJECTION_LAYER, feature_dim, embedding_dim, &mut rng),
        );
        let decoder = InferenceDecoderGraph::new(
            Lstm::new(LSTM_LAYER, embedding_dim, lstm_size, &mut rng),
            Dense::new(OUTPUT_LAYER, lstm_size, vocab_size, &mut rng),
        );

        Self::from_graphs(config, vocab, embeddings, training, encoder, decoder)
    }

    /// 用现成的三张图组装模型。
    ///
    /// 三张图的各层维度都在这里与配置、词表和词向量核对，不一致返回 `ShapeMismatch`；
    /// 层名不一致不会在这里报错，而是在同步时报 `LayerMismatch`。
    pub fn from_graphs(
        config: ModelConfig,
        vocab: Arc<Vocab>,
        embeddings: Arc<EmbeddingMatrix>,
        training: TrainingGraph,
        encoder: InferenceEncoderGraph,
        decoder: InferenceDecoderGraph,
    ) -> Result<Self> {
        config.validate()?;

        let vocab_size = vocab.len();
        let embedding_dim = embeddings.dim();
        if embeddings.vocab_size() != vocab_size {
            return Err(TitlingError::shape(
                "embedding matrix",
                &[vocab_size, embedding_dim],
                &[embeddings.vocab_size(), embedding_dim],
            ));
        }
        training.extractor().validate_input_shape(config.image_shape)?;
        encoder.extractor().validate_input_shape(config.image_shape)?;

        let feature_dim = training.extractor().output_channels() + config.num_categories;
        let lstm_size = config.lstm_size;
        for (what, actual, expected) in [
            ("training embedding width", training.embedding_dim(), embedding_dim),
            ("projection input", training.projection.input_dim(), feature_dim),
            ("projection output", training.projection.output_dim(), embedding_dim),
            ("lstm input", training.lstm.input_dim(), embedding_dim),
            ("lstm units", training.lstm.units(), lstm_size),
            ("output layer input", training.output.input_dim(), lstm_size),
            ("output layer width", training.output.output_dim(), vocab_size),
            (
                "encoder feature width",
                encoder.extractor().output_channels() + config.num_categories,
                feature_dim,
            ),
            ("encoder projection input", encoder.projection.input_dim(), feature_dim),
            ("encoder projection output", encoder.projection.output_dim(), embedding_dim),
            ("decoder lstm input", decoder.lstm.input_dim(), embedding_dim),
            ("decoder lstm units", decoder.lstm.units(), lstm_size),
            ("decoder output input", decoder.output.input_dim(), lstm_size),
            ("decoder vocabulary", decoder.vocab_size(), vocab_size),
        ] {
            if actual != expected {
                return Err(TitlingError::shape(what, &[expected], &[actual]));
            }
        }

        log::info!(
            "CaptionModel: {} 个参数, 词表 {}, 词向量 {}, LSTM {}, max_len {}, mask_padding {}",
            training.parameters(),
            vocab_size,
            embedding_dim,
            config.lstm_size,
            config.max_len,
            config.mask_padding
        );

        Ok(Self {
            config,
            vocab,
            embeddings,
            training,
            encoder,
            decoder,
            learning_rate: DEFAULT_LEARNING_RATE,
            synchronized: false,
            train_steps: 0,
        })
    }

    // ========================================================================
    // 输入校验
    // ========================================================================

    fn validate_image(&self, image: ArrayView3<f32>) -> Result<()> {
        if image.shape() != &self.config.image_shape[..] {
            return Err(TitlingError::shape(
                "image",
                &self.config.image_shape,
                image.shape(),
            ));
        }
        Ok(())
    }

    fn validate_category(&self, category: usize) -> Result<()> {
        if category >= self.config.num_categories {
            return Err(TitlingError::InvalidCategory {
                category,
                num_categories: self.config.num_categories,
            });
        }
        Ok(())
    }

    fn validate_ids(&self, ids: ArrayView1<usize>) -> Result<()> {
        if ids.len() != self.config.max_len {
            return Err(TitlingError::shape(
                "input id sequence",
                &[self.config.max_len],
                &[ids.len()],
            ));
        }
        let vocab_size = self.vocab.len();
        if let Some(&id) = ids.iter().find(|&&id| id >= vocab_size) {
            return Err(TitlingError::InvalidTokenId { id, vocab_size });
        }
        Ok(())
    }

    pub fn validate_batch(&self, batch: &Batch) -> Result<()> {
        let size = batch.len();
        if size == 0 {
            return Err(TitlingError::InvalidConfig("empty batch".to_string()));
        }
        let (max_len, num_categories, vocab_size) = (
            self.config.max_len,
            self.config.num_categories,
            self.vocab.len(),
        );

        if batch.categories.dim() != (size, num_categories) {
            return Err(TitlingError::shape(
                "category batch",
                &[size, num_categories],
                batch.categories.shape(),
            ));
        }
        if batch.input_ids.nrows() != size {
            return Err(TitlingError::shape(
                "input id batch",
                &[size, max_len],
                batch.input_ids.shape(),
            ));
        }
        if batch.targets.dim() != (size, max_len, vocab_size) {
            return Err(TitlingError::shape(
                "target batch",
                &[size, max_len, vocab_size],
                batch.targets.shape(),
            ));
        }
        for image in &batch.images {
            self.validate_image(image.view())?;
        }
        for ids in batch.input_ids.rows() {
            self.validate_ids(ids)?;
        }
        Ok(())
    }

    // ========================================================================
    // 训练
    // ========================================================================

    /// **一次 teacher-forced 训练步**：前向、反向、全局范数裁剪、Adam 更新
    ///
    /// 更新后推理图与训练图不再一致，生成之前需要重新同步。
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        self.validate_batch(batch)?;

        let (loss, mut grads) = self.training.compute_gradients(batch)?;
        if !loss.is_finite() {
            log::warn!("第 {} 步损失为 {}，跳过本次更新", self.train_steps + 1, loss);
            return Ok(loss);
        }

        let grad_norm = grads.clip_global_norm(self.config.clip_norm);
        self.training.apply_gradients(&grads, self.learning_rate);
        self.synchronized = false;
        self.train_steps += 1;

        log::debug!(
            "step {}: loss={:.4}, grad_norm={:.4}, lr={:.6}",
            self.train_steps,
            loss,
            grad_norm,
            self.learning_rate
        );
        Ok(loss)
    }

    /// 不更新参数的批次损失
    pub fn evaluate(&self, batch: &Batch) -> Result<f32> {
        self.validate_batch(batch)?;
        self.training.loss(batch)
    }

    /// 训练图上的 teacher-forced 概率，(L, V)
    pub fn predict_sequence(
        &self,
        image: ArrayView3<f32>,
        category: usize,
        input_ids: &[usize],
    ) -> Result<Array2<f32>> {
        self.validate_image(image)?;
        self.validate_category(category)?;
        let ids = ArrayView1::from(input_ids);
        self.validate_ids(ids)?;

        let category = one_hot(category, self.config.num_categories);
        self.training.predict(image, category.view(), ids)
    }

    // ========================================================================
    // 同步
    // ========================================================================

    /// **按层名把训练图的权重复制到两个推理图**
    ///
    /// 任何一个推理层在训练图中找不到同名层都会返回 `LayerMismatch`，此时不复制任何权重。
    pub fn synchronize_inference_weights(&mut self) -> Result<()> {
        let mut targets: [&mut dyn Graph; 2] = [&mut self.encoder, &mut self.decoder];
        let copied = graph::synchronize(&self.training, &mut targets)?;
        self.synchronized = true;
        log::info!("推理图已同步（{} 个参数矩阵）", copied);
        Ok(())
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    // ========================================================================
    // 生成
    // ========================================================================

    /// 创建一个可逐步驱动的解码器
    pub fn decoder<'a>(
        &'a self,
        image: ArrayView3<'a, f32>,
        category: usize,
    ) -> Result<TitleDecoder<'a>> {
        self.validate_image(image)?;
        self.validate_category(category)?;
        if !self.synchronized {
            log::warn!("推理图尚未与训练图同步，生成结果不反映训练后的权重");
        }

        Ok(TitleDecoder::new(
            &self.encoder,
            &self.decoder,
            &self.embeddings,
            &self.vocab,
            image,
            one_hot(category, self.config.num_categories),
            self.config.max_len,
        ))
    }

    pub fn generate_detailed<'a>(
        &'a self,
        image: ArrayView3<'a, f32>,
        category: usize,
    ) -> Result<Generation> {
        self.decoder(image, category)?.run()
    }

    /// **贪心生成标题**，词之间用单个空格连接，不含 END
    pub fn generate<'a>(&'a self, image: ArrayView3<'a, f32>, category: usize) -> Result<String> {
        Ok(self.generate_detailed(image, category)?.text())
    }

    // ========================================================================
    // 权重快照
    // ========================================================================

    pub fn snapshot_metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            max_len: self.config.max_len,
            lstm_size: self.config.lstm_size,
            embedding_dim: self.embeddings.dim(),
            vocab_size: self.vocab.len(),
            num_categories: self.config.num_categories,
            feature_dim: self.training.projection.input_dim(),
            mask_padding: self.training.mask_padding(),
        }
    }

    pub fn export_weights(&self) -> WeightSnapshot {
        WeightSnapshot::from_weight_set(
            &graph::export_weights(&self.training),
            self.snapshot_metadata(),
        )
    }

    /// **加载权重快照**
    ///
    /// 先校验训练图和两个推理图都能接受这份快照，再写入训练图并重新同步。
    /// 任何校验失败都不会修改模型。
    pub fn load_weights(&mut self, snapshot: &WeightSnapshot) -> Result<()> {
        let weights = snapshot.to_weight_set()?;
        graph::check_compatible(&weights, &self.training)?;
        graph::check_compatible(&weights, &self.encoder)?;
        graph::check_compatible(&weights, &self.decoder)?;

        let copied = graph::import_weights(&weights, &mut self.training)?;
        log::info!("已从快照载入 {} 个参数矩阵", copied);
        self.synchronize_inference_weights()
    }

    pub fn optimizer_states(&self) -> &BTreeMap<String, Adam> {
        self.training.optimizer_states()
    }

    /// 任何一个状态与训练图的参数对不上都返回错误，不替换任何状态
    pub fn restore_optimizer_states(&mut self, states: BTreeMap<String, Adam>) -> Result<()> {
        self.training.restore_optimizer_states(states)
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn embeddings(&self) -> &EmbeddingMatrix {
        &self.embeddings
    }

    pub fn training_graph(&self) -> &TrainingGraph {
        &self.training
    }

    pub fn encoder_graph(&self) -> &InferenceEncoderGraph {
        &self.encoder
    }

    pub fn decoder_graph(&self) -> &InferenceDecoderGraph {
        &self.decoder
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    pub fn train_steps(&self) -> usize {
        self.train_steps
    }

    pub fn total_parameters(&self) -> usize {
        self.training.parameters()
    }

    pub fn network_description(&self) -> String {
        self.training
            .layers()
            .iter()
            .map(|layer| format!("{}({})", layer.layer_type(), layer.name()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
