use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array3;
use rand::{Rng, SeedableRng, rngs::StdRng};

use titling::{
    BatchGenerator, CaptionModel, CheckpointManager, CheckpointStrategy, EmbeddingMatrix,
    ExampleSource, FrozenConvEncoder, InMemoryImages, ModelConfig, PerformanceMonitor,
    SampleEncoder, TrainConfig, Vocab, batch_generator::PostSource,
    checkpoint_manager::Checkpoint,
    dataset_loader::{Post, PostsFile},
};

const IMAGE_SIDE: usize = 16;
const FEATURE_CHANNELS: usize = 8;
const EMBEDDING_DIM: usize = 16;

/// 没有提供帖子文件时使用的演示数据：每个类别一种标题
const DEMO_POSTS: [(&str, &str); 4] = [
    ("aww", "my cat sleeping on the sofa"),
    ("earthporn", "sunset over the mountains"),
    ("food", "homemade pizza night"),
    ("cars", "old truck restored after ten years"),
];

// CLI 解析辅助函数
fn arg_has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

fn parse_usize_arg(args: &[String], key: &str) -> Option<usize> {
    arg_value(args, key).and_then(|v| v.parse().ok())
}

fn parse_f32_arg(args: &[String], key: &str) -> Option<f32> {
    arg_value(args, key).and_then(|v| v.parse().ok())
}

/// 每个类别一种主色调加少量噪声，让类别和图像内容都能区分样本
fn synthetic_image(category: usize, rng: &mut StdRng) -> Array3<f32> {
    Array3::from_shape_fn((IMAGE_SIDE, IMAGE_SIDE, 3), |(y, x, c)| {
        let base = if c == category % 3 { 0.8 } else { 0.1 };
        let stripe = if (x + y * category) % 4 == 0 { 0.2 } else { 0.0 };
        base + stripe + rng.random_range(-0.05..0.05)
    })
}

fn demo_posts() -> PostsFile {
    let mut posts = Vec::new();
    for copy in 0..4 {
        for (index, (_, title)) in DEMO_POSTS.iter().enumerate() {
            posts.push(Post {
                path: PathBuf::from(format!("demo/{index}_{copy}.png")),
                subreddit: index,
                title: title.to_string(),
            });
        }
    }
    PostsFile {
        posts,
        subreddit_indices_map: DEMO_POSTS
            .iter()
            .enumerate()
            .map(|(index, (name, _))| (name.to_string(), index))
            .collect(),
    }
}

fn run(args: &[String], monitor: &mut PerformanceMonitor) -> titling::Result<()> {
    let epochs = parse_usize_arg(args, "--epochs").unwrap_or(60);
    let lr = parse_f32_arg(args, "--lr").unwrap_or(0.01);
    let patience = parse_usize_arg(args, "--patience").unwrap_or(0);
    let batch_size = parse_usize_arg(args, "--batch-size").unwrap_or(4);
    let checkpoint_dir =
        PathBuf::from(arg_value(args, "--checkpoint-dir").unwrap_or("checkpoints"));

    monitor.start("加载数据");
    let posts_file = match arg_value(args, "--posts") {
        Some(path) => PostsFile::load(path, parse_usize_arg(args, "--limit"))?,
        None => demo_posts(),
    };
    let num_categories = posts_file
        .posts
        .iter()
        .map(|post| post.subreddit + 1)
        .max()
        .unwrap_or(1)
        .max(posts_file.subreddit_indices_map.len());

    // 图像解码不在本 crate 范围内，这里按类别合成图像
    let mut rng = StdRng::seed_from_u64(7);
    let mut images = InMemoryImages::new();
    for post in &posts_file.posts {
        images.insert(post.path.clone(), synthetic_image(post.subreddit, &mut rng));
    }

    let vocab = Arc::new(Vocab::build_from_texts(&posts_file.titles()));
    monitor.stop("加载数据");
    println!(
        "📚 词表大小: {}, 类别数: {}, 样本数: {}",
        vocab.len(),
        num_categories,
        posts_file.posts.len()
    );

    let model_config = ModelConfig {
        max_len: parse_usize_arg(args, "--max-len").unwrap_or(10),
        lstm_size: parse_usize_arg(args, "--lstm-size").unwrap_or(48),
        num_categories,
        image_shape: [IMAGE_SIDE, IMAGE_SIDE, 3],
        mask_padding: !arg_has_flag(args, "--no-mask"),
        clip_norm: 5.0,
        seed: Some(42),
    };
    let train_config = TrainConfig {
        epochs,
        batch_size,
        learning_rate: lr,
        lr_decay_rate: 0.95,
        lr_decay_steps: 10.0,
        patience,
        min_delta: 1e-4,
        shuffle_seed: Some(1),
    };

    let embeddings = Arc::new(EmbeddingMatrix::random(vocab.len(), EMBEDDING_DIM, Some(3)));
    let extractor = Arc::new(FrozenConvEncoder::new(3, FEATURE_CHANNELS, 11));
    let mut model = CaptionModel::new(
        model_config.clone(),
        Arc::clone(&vocab),
        embeddings,
        extractor,
    )?;
    println!("🧠 网络结构: {}", model.network_description());
    println!("   参数总量: {}", model.total_parameters());

    let mut manager = CheckpointManager::new(&checkpoint_dir, CheckpointStrategy::BestAndLast, 3)?;
    model_config.save_json(checkpoint_dir.join("model_config.json"))?;
    train_config.save_json(checkpoint_dir.join("train_config.json"))?;

    let mut initial_epoch = 0;
    if arg_has_flag(args, "--resume") {
        if let Some(path) = manager.last_checkpoint() {
            let checkpoint = CheckpointManager::load_checkpoint(&path)?;
            checkpoint.restore_into(&mut model)?;
            initial_epoch = checkpoint.metadata.epoch + 1;
            restore_best_loss(&mut manager, &checkpoint);
            println!("🔄 从 epoch {} 继续训练", initial_epoch);
        }
    }

    let posts = posts_file.posts.clone();
    let encoder = SampleEncoder::new(Arc::clone(&vocab), model_config.max_len, num_categories)?;
    let mut generator = BatchGenerator::new(
        PostSource::new(posts, images),
        encoder,
        train_config.batch_size,
        true,
        train_config.shuffle_seed,
    )?;

    monitor.start("训练");
    let report = titling::fit(
        &mut model,
        &train_config,
        &mut generator,
        None,
        Some(&mut manager),
        initial_epoch,
    )?;
    monitor.stop("训练");
    if let (Some(epoch), true) = (report.best_epoch, report.best_loss.is_finite()) {
        println!("🏆 最佳 epoch {}: loss {:.4}", epoch, report.best_loss);
    }

    let weights_path = checkpoint_dir.join("weights.bin");
    model.export_weights().save_auto(&weights_path)?;
    verify_weights(&mut model, &weights_path)?;

    monitor.start("生成");
    println!("\n✍️  生成结果:");
    let source = generator.source();
    let mut shown = BTreeSet::new();
    for (index, post) in source.posts().iter().enumerate() {
        if !shown.insert(post.subreddit) {
            continue;
        }
        let example = source.example(index)?;
        let generation = model.generate_detailed(example.image.view(), example.category)?;
        println!(
            "  [{}] {:<40} ← 原标题: {} ({:?})",
            posts_file.category_name(post.subreddit).unwrap_or("?"),
            generation.text(),
            post.title,
            generation.stop_reason
        );
    }
    monitor.stop("生成");

    Ok(())
}

fn restore_best_loss(manager: &mut CheckpointManager, checkpoint: &Checkpoint) {
    if let Ok(checkpoints) = manager.list_checkpoints() {
        for (_, metadata) in checkpoints {
            manager.update_best_loss(metadata.loss, metadata.epoch);
        }
    }
    log::info!(
        "续训基准: 最佳 loss {:.4}（当前检查点 loss {:.4}）",
        manager.best_loss(),
        checkpoint.metadata.loss
    );
}

/// 重新读回保存的权重，确认文件可用
fn verify_weights(model: &mut CaptionModel, path: &Path) -> titling::Result<()> {
    let snapshot = titling::load_weights_auto(path)?;
    model.load_weights(&snapshot)?;
    println!(
        "💾 权重已保存并校验: {} ({} 个参数)",
        path.display(),
        snapshot.parameter_count()
    );
    Ok(())
}

fn main() {
    println!("\n╔═══════════════════════════════════════════════════════════╗");
    println!("║          titling - 图像标题生成（LSTM 编码器/解码器）     ║");
    println!("╚═══════════════════════════════════════════════════════════╝\n");

    // 初始化日志系统
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
    {
        eprintln!("日志初始化失败: {}", e);
    }

    let mut monitor = PerformanceMonitor::new();
    monitor.start("程序总执行时间");

    let args: Vec<String> = std::env::args().skip(1).collect();
    if arg_has_flag(&args, "--help") {
        println!("用法: titling [--posts=PATH] [--limit=N] [--epochs=N] [--lr=F] [--batch-size=N]");
        println!("              [--patience=N] [--max-len=N] [--lstm-size=N] [--no-mask]");
        println!("              [--checkpoint-dir=DIR] [--resume]");
        return;
    }

    if let Err(e) = run(&args, &mut monitor) {
        log::error!("运行失败: {}", e);
        std::process::exit(1);
    }

    monitor.stop("程序总执行时间");
    monitor.log_report();
}
