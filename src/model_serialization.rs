// ============================================================================
// 权重快照序列化 - 支持二进制和 JSON 两种格式
// ============================================================================
//
// 快照只保存训练图的权重，按 "层名 → 参数名 → 矩阵" 组织，与同步使用同一套名字。
// 加载时先做全量校验再写入训练图，随后重新同步两个推理图。
//
// 1. **二进制格式** (推荐用于生产):
//    - 使用 bincode 序列化,文件小、速度快
//    - 文件扩展名: .bin
//
// 2. **JSON 格式** (推荐用于调试):
//    - 人类可读,方便检查权重
//    - 文件扩展名: .json
//
// 非有限值（NaN / ±Inf）在保存时被置为 0。
// ============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use bincode::{Decode, Encode};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    adam::Adam,
    error::{Result, TitlingError},
    graph::{LayerWeights, WeightSet},
};

pub const SNAPSHOT_VERSION: u32 = 1;

fn finite_or_zero(values: impl Iterator<Item = f32>, what: &str) -> Vec<f32> {
    let mut replaced = 0usize;
    let data = values
        .map(|x| {
            if x.is_finite() {
                x
            } else {
                replaced += 1;
                0.0
            }
        })
        .collect();
    if replaced > 0 {
        log::warn!("{} 中有 {} 个非有限值，已置为 0", what, replaced);
    }
    data
}

// ============================================================================
// 张量与 Adam 状态
// ============================================================================

#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct SerializableTensor {
    pub shape: (usize, usize),
    pub data: Vec<f32>,
}

impl SerializableTensor {
    pub fn from_array(array: &Array2<f32>, what: &str) -> Self {
        Self {
            shape: array.dim(),
            data: finite_or_zero(array.iter().copied(), what),
        }
    }

    pub fn to_array(&self, what: &str) -> Result<Array2<f32>> {
        Array2::from_shape_vec(self.shape, self.data.clone()).map_err(|_| {
            TitlingError::shape(
                what,
                &[self.shape.0 * self.shape.1],
                &[self.data.len()],
            )
        })
    }
}

#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct SerializableAdam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub timestep: usize,
    pub m: SerializableTensor,
    pub v: SerializableTensor,
}

impl SerializableAdam {
    pub fn from_adam(adam: &Adam, key: &str) -> Self {
        Self {
            beta1: adam.beta1,
            beta2: adam.beta2,
            epsilon: adam.epsilon,
            timestep: adam.timestep,
            m: SerializableTensor::from_array(&adam.m, &format!("{key}.m")),
            v: SerializableTensor::from_array(&adam.v, &format!("{key}.v")),
        }
    }

    pub fn to_adam(&self, key: &str) -> Result<Adam> {
        let m = self.m.to_array(&format!("optimizer state {key}.m"))?;
        let v = self.v.to_array(&format!("optimizer state {key}.v"))?;
        if m.dim() != v.dim() {
            return Err(TitlingError::shape(
                format!("optimizer state {key}.v"),
                &[m.nrows(), m.ncols()],
                &[v.nrows(), v.ncols()],
            ));
        }
        Ok(Adam {
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            timestep: self.timestep,
            m,
            v,
        })
    }
}

/// 键为 `层名/参数名`
pub type OptimizerSnapshot = BTreeMap<String, SerializableAdam>;

pub fn export_optimizers(states: &BTreeMap<String, Adam>) -> OptimizerSnapshot {
    states
        .iter()
        .map(|(key, adam)| (key.clone(), SerializableAdam::from_adam(adam, key)))
        .collect()
}

pub fn import_optimizers(snapshot: &OptimizerSnapshot) -> Result<BTreeMap<String, Adam>> {
    snapshot
        .iter()
        .map(|(key, adam)| Ok((key.clone(), adam.to_adam(key)?)))
        .collect()
}

// ============================================================================
// 权重快照
// ============================================================================

/// 模型结构信息，加载时用于人工核对；真正的兼容性由逐层逐参数的形状检查保证
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub max_len: usize,
    pub lstm_size: usize,
    pub embedding_dim: usize,
    pub vocab_size: usize,
    pub num_categories: usize,
    pub feature_dim: usize,
    pub mask_padding: bool,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub version: u32,
    pub layers: BTreeMap<String, BTreeMap<String, SerializableTensor>>,
    pub metadata: SnapshotMetadata,
}

impl WeightSnapshot {
    pub fn from_weight_set(weights: &WeightSet, metadata: SnapshotMetadata) -> Self {
        let layers = weights
            .iter()
            .map(|(layer, params)| {
                let params = params
                    .iter()
                    .map(|(param, w)| {
                        (
                            param.clone(),
                            SerializableTensor::from_array(w, &format!("{layer}/{param}")),
                        )
                    })
                    .collect();
                (layer.clone(), params)
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            layers,
            metadata,
        }
    }

    pub fn to_weight_set(&self) -> Result<WeightSet> {
        self.layers
            .iter()
            .map(|(layer, params)| {
                let params = params
                    .iter()
                    .map(|(param, tensor)| {
                        Ok((param.clone(), tensor.to_array(&format!("{layer}/{param}"))?))
                    })
                    .collect::<Result<LayerWeights>>()?;
                Ok((layer.clone(), params))
            })
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .values()
            .flat_map(|params| params.values())
            .map(|tensor| tensor.data.len())
            .sum()
    }

    pub fn save_binary<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_binary(self, path)
    }

    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_binary(path)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path)
    }

    /// 按扩展名选择格式：`.json` 为 JSON，其余为二进制
    pub fn save_auto<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if is_json(path.as_ref()) {
            self.save_json(path)
        } else {
            self.save_binary(path)
        }
    }
}

/// 自动选择加载方法
pub fn load_weights_auto<P: AsRef<Path>>(path: P) -> Result<WeightSnapshot> {
    if is_json(path.as_ref()) {
        WeightSnapshot::load_json(path)
    } else {
        WeightSnapshot::load_binary(path)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

// ============================================================================
// 通用读写
// ============================================================================

pub(crate) fn save_binary<T: Encode, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    bincode::encode_into_std_write(value, &mut writer, bincode::config::standard())?;

    let file_size = std::fs::metadata(path.as_ref())?.len();
    log::info!(
        "已保存 {:?}（{:.2} MB）",
        path.as_ref(),
        file_size as f64 / 1_048_576.0
    );
    Ok(())
}

pub(crate) fn load_binary<T: Decode<()>, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let value = bincode::decode_from_std_read(&mut reader, bincode::config::standard())?;
    log::info!("已加载 {:?}", path.as_ref());
    Ok(value)
}

pub(crate) fn save_json<T: Serialize, P: AsRef<Path>>(value: &T, path: P) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    log::info!("已保存 {:?}", path.as_ref());
    Ok(())
}

pub(crate) fn load_json<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let value = serde_json::from_reader(reader)?;
    log::info!("已加载 {:?}", path.as_ref());
    Ok(value)
}
