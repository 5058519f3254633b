//! # 批次生成器（Batch Generator）
//!
//! 按打乱后的顺序把样本切成定长批次，每个批次由 [`SampleEncoder`] 编码后堆叠：
//!
//! ```text
//! images      B × (H, W, 3)
//! categories  (B, C)       one-hot
//! input_ids   (B, L)
//! targets     (B, L, V)
//! ```
//!
//! 批次数为 `floor(样本数 / batch_size)`，凑不满一批的尾部样本在本轮被丢弃，
//! 下一轮打乱后会轮到别的样本。图像解码是外部职责，通过 [`ImageSource`] 注入。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Axis};
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::{
    dataset_loader::Post,
    error::{Result, TitlingError},
    sample_encoder::{EncodedSample, SampleEncoder, TrainingExample},
    utils::seeded_rng,
};

/// 堆叠后的一个批次
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub images: Vec<Array3<f32>>,
    pub categories: Array2<f32>,
    pub input_ids: Array2<usize>,
    pub targets: Array3<f32>,
}

impl Batch {
    pub fn from_samples(samples: &[EncodedSample]) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(TitlingError::InvalidConfig(
                "cannot build a batch from zero samples".to_string(),
            ));
        };
        let batch_size = samples.len();
        let num_categories = first.category.len();
        let (max_len, vocab_size) = first.targets.dim();

        let mut categories = Array2::zeros((batch_size, num_categories));
        let mut input_ids = Array2::zeros((batch_size, max_len));
        let mut targets = Array3::zeros((batch_size, max_len, vocab_size));

        for (b, sample) in samples.iter().enumerate() {
            if sample.category.len() != num_categories {
                return Err(TitlingError::shape(
                    "category one-hot",
                    &[num_categories],
                    &[sample.category.len()],
                ));
            }
            if sample.input_ids.len() != max_len {
                return Err(TitlingError::shape(
                    "input id sequence",
                    &[max_len],
                    &[sample.input_ids.len()],
                ));
            }
            if sample.targets.dim() != (max_len, vocab_size) {
                return Err(TitlingError::shape(
                    "target sequence",
                    &[max_len, vocab_size],
                    sample.targets.shape(),
                ));
            }

            categories.row_mut(b).assign(&sample.category);
            for (t, &id) in sample.input_ids.iter().enumerate() {
                input_ids[[b, t]] = id;
            }
            targets.index_axis_mut(Axis(0), b).assign(&sample.targets);
        }

        Ok(Self {
            images: samples.iter().map(|s| s.image.clone()).collect(),
            categories,
            input_ids,
            targets,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// 图像解码（外部协作者）
pub trait ImageSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<Array3<f32>>;
}

/// 预先放在内存里的图像，测试和演示用
#[derive(Clone, Debug, Default)]
pub struct InMemoryImages {
    images: HashMap<PathBuf, Array3<f32>>,
}

impl InMemoryImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, image: Array3<f32>) {
        self.images.insert(path.into(), image);
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl ImageSource for InMemoryImages {
    fn load(&self, path: &Path) -> Result<Array3<f32>> {
        self.images
            .get(path)
            .cloned()
            .ok_or_else(|| TitlingError::ImageLoad {
                path: path.to_path_buf(),
                reason: "no image registered under this path".to_string(),
            })
    }
}

/// 按下标随机访问的样本集合
pub trait ExampleSource {
    fn len(&self) -> usize;

    fn example(&self, index: usize) -> Result<TrainingExample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExampleSource for Vec<TrainingExample> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn example(&self, index: usize) -> Result<TrainingExample> {
        self.get(index)
            .cloned()
            .ok_or_else(|| TitlingError::InvalidConfig(format!("example {index} out of range")))
    }
}

/// 帖子 + 图像源，读取时才解码图像
pub struct PostSource<I: ImageSource> {
    posts: Vec<Post>,
    images: I,
}

impl<I: ImageSource> PostSource<I> {
    pub fn new(posts: Vec<Post>, images: I) -> Self {
        Self { posts, images }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }
}

impl<I: ImageSource> ExampleSource for PostSource<I> {
    fn len(&self) -> usize {
        self.posts.len()
    }

    fn example(&self, index: usize) -> Result<TrainingExample> {
        let post = self
            .posts
            .get(index)
            .ok_or_else(|| TitlingError::InvalidConfig(format!("post {index} out of range")))?;
        Ok(TrainingExample {
            image: self.images.load(&post.path)?,
            category: post.subreddit,
            title: post.title.clone(),
        })
    }
}

pub struct BatchGenerator<S: ExampleSource> {
    source: S,
    encoder: SampleEncoder,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    rng: StdRng,
}

impl<S: ExampleSource> BatchGenerator<S> {
    pub fn new(
        source: S,
        encoder: SampleEncoder,
        batch_size: usize,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TitlingError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        let mut generator = Self {
            order: (0..source.len()).collect(),
            source,
            encoder,
            batch_size,
            shuffle,
            rng: seeded_rng(seed),
        };
        generator.on_epoch_end();
        Ok(generator)
    }

    /// 每轮的批次数
    pub fn len(&self) -> usize {
        self.source.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn encoder(&self) -> &SampleEncoder {
        &self.encoder
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn batch(&self, index: usize) -> Result<Batch> {
        if index >= self.len() {
            return Err(TitlingError::InvalidConfig(format!(
                "batch {index} out of range for {} batches",
                self.len()
            )));
        }
        let start = index * self.batch_size;
        let samples = self.order[start..start + self.batch_size]
            .iter()
            .map(|&i| self.encoder.encode(&self.source.example(i)?))
            .collect::<Result<Vec<_>>>()?;
        Batch::from_samples(&samples)
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        (0..self.len()).map(move |index| self.batch(index))
    }

    /// 重新打乱样本顺序
    pub fn on_epoch_end(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}
