//! # 计算图与按名字的权重同步
//!
//! 三张计算图各自持有自己的层实例。训练图是权重的唯一来源；两张推理图只有在显式调用
//! [`synchronize`] 之后才与训练图数值一致。同步是结构化复制而不是别名共享：
//! 复制完成后，训练图后续的更新不会悄悄影响正在进行的生成。
//!
//! ## 同步协议
//!
//! ```text
//! 1. export_weights(source)            层名 → 参数名 → 矩阵
//! 2. check_compatible(weights, target)  对每个目标图：
//!        层名不存在      → LayerMismatch
//!        参数名不存在    → MissingParameter
//!        形状不一致      → ParameterMismatch
//! 3. 所有目标都通过后才开始复制（全有或全无）
//! ```

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::error::{Result, TitlingError};

/// 带名字、可被同步的参数层
pub trait Layer: Send + Sync {
    /// 同步时用来匹配的层名
    fn name(&self) -> &str;

    fn layer_type(&self) -> &str;

    /// `(参数名, 矩阵)`，顺序固定
    fn weights(&self) -> Vec<(&'static str, &Array2<f32>)>;

    fn weights_mut(&mut self) -> Vec<(&'static str, &mut Array2<f32>)>;

    fn parameters(&self) -> usize {
        self.weights().iter().map(|(_, w)| w.len()).sum()
    }
}

pub trait Graph {
    fn graph_name(&self) -> &str;

    fn layers(&self) -> Vec<&dyn Layer>;

    fn layers_mut(&mut self) -> Vec<&mut dyn Layer>;

    fn parameters(&self) -> usize {
        self.layers().iter().map(|layer| layer.parameters()).sum()
    }
}

pub type LayerWeights = BTreeMap<String, Array2<f32>>;

/// 层名 → 参数名 → 矩阵
pub type WeightSet = BTreeMap<String, LayerWeights>;

pub fn export_weights(graph: &dyn Graph) -> WeightSet {
    graph
        .layers()
        .into_iter()
        .map(|layer| {
            let params = layer
                .weights()
                .into_iter()
                .map(|(param, w)| (param.to_string(), w.clone()))
                .collect();
            (layer.name().to_string(), params)
        })
        .collect()
}

/// 检查 `target` 的每一个层、每一个参数都能在 `weights` 里找到形状相同的来源
pub fn check_compatible(weights: &WeightSet, target: &dyn Graph) -> Result<()> {
    for layer in target.layers() {
        let source = weights
            .get(layer.name())
            .ok_or_else(|| TitlingError::LayerMismatch {
                layer: layer.name().to_string(),
                graph: target.graph_name().to_string(),
            })?;

        for (param, w) in layer.weights() {
            let src = source
                .get(param)
                .ok_or_else(|| TitlingError::MissingParameter {
                    layer: layer.name().to_string(),
                    param: param.to_string(),
                })?;
            if src.dim() != w.dim() {
                return Err(TitlingError::ParameterMismatch {
                    layer: layer.name().to_string(),
                    param: param.to_string(),
                    expected: w.dim(),
                    actual: src.dim(),
                });
            }
        }
    }
    Ok(())
}

/// 调用方必须先通过 [`check_compatible`]
fn copy_checked(weights: &WeightSet, target: &mut dyn Graph) -> usize {
    let mut copied = 0;
    for layer in target.layers_mut() {
        let Some(source) = weights.get(layer.name()) else {
            continue;
        };
        for (param, w) in layer.weights_mut() {
            if let Some(src) = source.get(param) {
                w.assign(src);
                copied += 1;
            }
        }
    }
    copied
}

/// 把 `weights` 导入单个图；任何不兼容都会在复制之前返回错误
pub fn import_weights(weights: &WeightSet, target: &mut dyn Graph) -> Result<usize> {
    check_compatible(weights, target)?;
    Ok(copy_checked(weights, target))
}

/// **按名字同步**
///
/// 先校验所有目标图，全部通过后再复制。返回复制的参数矩阵个数。
pub fn synchronize(source: &dyn Graph, targets: &mut [&mut dyn Graph]) -> Result<usize> {
    let weights = export_weights(source);

    for target in targets.iter() {
        check_compatible(&weights, &**target)?;
    }

    let mut copied = 0;
    for target in targets.iter_mut() {
        copied += copy_checked(&weights, &mut **target);
    }

    log::debug!(
        "从 {} 图同步了 {} 个参数矩阵到 {} 个推理图",
        source.graph_name(),
        copied,
        targets.len()
    );
    Ok(copied)
}
