//! 训练图 → 推理图的按名字同步

use std::sync::Arc;

use ndarray::Array2;
use titling::{
    CaptionModel, EmbeddingMatrix, Graph, ModelConfig, TitlingError, Vocab,
    dense::Dense,
    graph,
    inference::{InferenceDecoderGraph, InferenceEncoderGraph},
    lstm::Lstm,
    training_graph::TrainingGraph,
    utils::{one_hot, seeded_rng},
};

mod common;

const LSTM_SIZE: usize = 6;

struct Parts {
    config: ModelConfig,
    vocab: Arc<Vocab>,
    embeddings: Arc<EmbeddingMatrix>,
    training: TrainingGraph,
    encoder: InferenceEncoderGraph,
    decoder: InferenceDecoderGraph,
}

/// 手工拼装三张图，解码器 LSTM 的层名、输入宽度和单元数可以和训练图不一致
fn parts(decoder_lstm_name: &str, decoder_input: usize, decoder_units: usize) -> Parts {
    let vocab = common::cat_dog_vocab();
    let embeddings = common::embeddings(&vocab);
    let extractor = common::extractor();
    let config = common::model_config(4, LSTM_SIZE, true);
    let feature_dim = common::FEATURE_CHANNELS + config.num_categories;
    let mut rng = seeded_rng(Some(3));

    let training = TrainingGraph::new(
        extractor.clone(),
        Arc::clone(&embeddings),
        Dense::new("projection", feature_dim, common::EMBEDDING_DIM, &mut rng),
        Lstm::new("lstm", common::EMBEDDING_DIM, LSTM_SIZE, &mut rng),
        Dense::new("output", LSTM_SIZE, vocab.len(), &mut rng),
        vocab.pad_id(),
        true,
    );
    let encoder = InferenceEncoderGraph::new(
        extractor,
        Dense::new("projection", feature_dim, common::EMBEDDING_DIM, &mut rng),
    );
    let decoder = InferenceDecoderGraph::new(
        Lstm::new(decoder_lstm_name, decoder_input, decoder_units, &mut rng),
        Dense::new("output", decoder_units, vocab.len(), &mut rng),
    );

    Parts {
        config,
        vocab,
        embeddings,
        training,
        encoder,
        decoder,
    }
}

fn assemble(decoder_lstm_name: &str) -> CaptionModel {
    let Parts {
        config,
        vocab,
        embeddings,
        training,
        encoder,
        decoder,
    } = parts(decoder_lstm_name, common::EMBEDDING_DIM, LSTM_SIZE);
    CaptionModel::from_graphs(config, vocab, embeddings, training, encoder, decoder).unwrap()
}

fn inference_weights(model: &CaptionModel) -> Vec<Array2<f32>> {
    vec![
        model.encoder_graph().projection.kernel.clone(),
        model.decoder_graph().lstm.kernel.clone(),
        model.decoder_graph().output.kernel.clone(),
    ]
}

#[test]
fn test_sync_copies_every_layer_by_name() {
    let mut model = assemble("lstm");
    assert!(!model.is_synchronized());
    assert_ne!(
        model.decoder_graph().lstm.kernel,
        model.training_graph().lstm.kernel
    );

    model.synchronize_inference_weights().unwrap();

    assert!(model.is_synchronized());
    assert_eq!(
        model.encoder_graph().projection.kernel,
        model.training_graph().projection.kernel
    );
    assert_eq!(
        model.decoder_graph().lstm.recurrent_kernel,
        model.training_graph().lstm.recurrent_kernel
    );
    assert_eq!(
        model.decoder_graph().output.bias,
        model.training_graph().output.bias
    );
}

#[test]
fn test_unknown_layer_name_fails_and_copies_nothing() {
    let mut model = assemble("lstm_v2");
    let before = inference_weights(&model);

    let result = model.synchronize_inference_weights();

    assert!(matches!(
        result,
        Err(TitlingError::LayerMismatch { ref layer, ref graph })
            if layer == "lstm_v2" && graph == "inference_decoder"
    ));
    assert!(!model.is_synchronized());
    // 编码图排在解码图前面，也没有被复制
    assert_eq!(inference_weights(&model), before);
}

#[test]
fn test_shape_mismatch_fails_and_copies_nothing() {
    let Parts {
        training,
        mut encoder,
        mut decoder,
        ..
    } = parts("lstm", common::EMBEDDING_DIM, LSTM_SIZE + 1);
    let encoder_before = encoder.projection.kernel.clone();
    let decoder_before = decoder.lstm.kernel.clone();

    let mut targets: [&mut dyn Graph; 2] = [&mut encoder, &mut decoder];
    let result = graph::synchronize(&training, &mut targets);

    assert!(matches!(
        result,
        Err(TitlingError::ParameterMismatch { ref layer, .. }) if layer == "lstm"
    ));
    assert_eq!(encoder.projection.kernel, encoder_before);
    assert_eq!(decoder.lstm.kernel, decoder_before);
}

#[test]
fn test_from_graphs_rejects_inconsistent_dimensions() {
    // 解码器 LSTM 的输入宽度与词向量维度不一致
    let Parts {
        config,
        vocab,
        embeddings,
        training,
        encoder,
        decoder,
    } = parts("lstm", 5, LSTM_SIZE);
    let result = CaptionModel::from_graphs(config, vocab, embeddings, training, encoder, decoder);
    assert!(matches!(
        result,
        Err(TitlingError::ShapeMismatch { ref what, ref expected, ref actual })
            if what == "decoder lstm input"
                && expected == &vec![common::EMBEDDING_DIM]
                && actual == &vec![5]
    ));

    // 解码器 LSTM 单元数与配置不一致
    let Parts {
        config,
        vocab,
        embeddings,
        training,
        encoder,
        decoder,
    } = parts("lstm", common::EMBEDDING_DIM, LSTM_SIZE + 1);
    let result = CaptionModel::from_graphs(config, vocab, embeddings, training, encoder, decoder);
    assert!(matches!(
        result,
        Err(TitlingError::ShapeMismatch { ref what, .. }) if what == "decoder lstm units"
    ));

    // 编码图的投影层输入与特征宽度不一致
    let Parts {
        config,
        vocab,
        embeddings,
        training,
        decoder,
        ..
    } = parts("lstm", common::EMBEDDING_DIM, LSTM_SIZE);
    let mut rng = seeded_rng(Some(5));
    let encoder = InferenceEncoderGraph::new(
        common::extractor(),
        Dense::new("projection", 3, common::EMBEDDING_DIM, &mut rng),
    );
    let result = CaptionModel::from_graphs(config, vocab, embeddings, training, encoder, decoder);
    assert!(matches!(
        result,
        Err(TitlingError::ShapeMismatch { ref what, .. }) if what == "encoder projection input"
    ));
}

#[test]
fn test_synchronized_decoder_matches_teacher_forced_first_step() {
    let vocab = common::cat_dog_vocab();
    let mut model = common::build_model(vocab, common::model_config(4, LSTM_SIZE, true));
    let image = common::image(0.4);
    let ids = [0, 4, 5, 1];
    let category = one_hot(1, 2);

    let first_step = |model: &CaptionModel| {
        let encoded = model
            .encoder_graph()
            .encode(image.view(), category.view())
            .unwrap();
        let (h, c) = model.decoder_graph().seed(&encoded);
        let start = model.embeddings().row(0).unwrap().to_owned();
        model.decoder_graph().step(&start, &h, &c).probs
    };

    let teacher_forced = model.predict_sequence(image.view(), 1, &ids).unwrap();
    let unsynced = first_step(&model);
    assert!(
        unsynced
            .iter()
            .zip(teacher_forced.row(0).iter())
            .any(|(a, b)| (a - b).abs() > 1e-6)
    );

    model.synchronize_inference_weights().unwrap();
    let synced = first_step(&model);
    for (a, b) in synced.iter().zip(teacher_forced.row(0).iter()) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
}

#[test]
fn test_training_step_invalidates_sync() {
    let vocab = common::cat_dog_vocab();
    let mut model = common::build_model(vocab, common::model_config(4, LSTM_SIZE, true));
    let batch = common::batch(&model, &[common::example("cat dog", 0, 0.2)]);

    model.synchronize_inference_weights().unwrap();
    let synced_kernel = model.decoder_graph().output.kernel.clone();

    model.train_step(&batch).unwrap();
    assert!(!model.is_synchronized());
    // 训练不会通过别名影响推理图
    assert_eq!(model.decoder_graph().output.kernel, synced_kernel);
    assert_ne!(model.training_graph().output.kernel, synced_kernel);

    model.synchronize_inference_weights().unwrap();
    assert_eq!(
        model.decoder_graph().output.kernel,
        model.training_graph().output.kernel
    );
}

#[test]
fn test_graph_parameter_counts_agree() {
    let model = assemble("lstm");
    let inference = model.encoder_graph().parameters() + model.decoder_graph().parameters();
    assert_eq!(inference, model.training_graph().parameters());
    assert_eq!(model.total_parameters(), model.training_graph().parameters());
}
