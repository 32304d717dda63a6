//! 视觉特征投影（两层 MLP + GELU）
//!
//! 视觉编码器如果输出的是 mm_hidden 维特征，需要投影到 decoder 的 hidden 维：
//! `gelu(x · W1ᵀ + b1) · W2ᵀ + b2`

use ndarray::{Array1, Array2, ArrayView2};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// tanh 近似的 GELU
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
}

/// 投影层权重文件路径（原始小端 f32）
#[derive(Debug, Clone)]
pub struct ProjectorFiles<'a> {
    pub l1_weight: &'a Path,
    pub l1_bias: &'a Path,
    pub l2_weight: &'a Path,
    pub l2_bias: &'a Path,
}

#[derive(Debug, Clone)]
pub struct VisionProjector {
    /// [hidden, input]
    l1_weight: Array2<f32>,
    l1_bias: Array1<f32>,
    /// [hidden, hidden]
    l2_weight: Array2<f32>,
    l2_bias: Array1<f32>,
}

impl VisionProjector {
    pub fn new(
        l1_weight: Array2<f32>,
        l1_bias: Array1<f32>,
        l2_weight: Array2<f32>,
        l2_bias: Array1<f32>,
    ) -> EngineResult<Self> {
        let hidden = l1_bias.len();
        if l1_weight.nrows() != hidden || l2_weight.dim() != (hidden, hidden) || l2_bias.len() != hidden {
            return Err(EngineError::shape(format!(
                "inconsistent projector weights: l1_w {:?}, l1_b {}, l2_w {:?}, l2_b {}",
                l1_weight.dim(),
                hidden,
                l2_weight.dim(),
                l2_bias.len()
            )));
        }
        Ok(Self {
            l1_weight,
            l1_bias,
            l2_weight,
            l2_bias,
        })
    }

    /// 从四个 .bin 文件加载；维度由文件长度推断：
    /// hidden = len(b1)，input = len(W1) / hidden
    pub fn from_files(files: &ProjectorFiles<'_>) -> EngineResult<Self> {
        let l1_w = read_f32_le(files.l1_weight)?;
        let l1_b = read_f32_le(files.l1_bias)?;
        let l2_w = read_f32_le(files.l2_weight)?;
        let l2_b = read_f32_le(files.l2_bias)?;

        let hidden = l1_b.len();
        if hidden == 0 {
            return Err(EngineError::artifact(files.l1_bias, "projector bias is empty"));
        }
        if l1_w.len() % hidden != 0 {
            return Err(EngineError::artifact(
                files.l1_weight,
                format!("{} floats is not a multiple of hidden width {hidden}", l1_w.len()),
            ));
        }
        let input = l1_w.len() / hidden;
        if l2_w.len() != hidden * hidden {
            return Err(EngineError::artifact(
                files.l2_weight,
                format!("expected {} floats ({hidden}x{hidden}), got {}", hidden * hidden, l2_w.len()),
            ));
        }
        if l2_b.len() != hidden {
            return Err(EngineError::artifact(
                files.l2_bias,
                format!("expected {hidden} floats, got {}", l2_b.len()),
            ));
        }

        let l1_weight = Array2::from_shape_vec((hidden, input), l1_w)
            .map_err(|e| EngineError::artifact(files.l1_weight, e.to_string()))?;
        let l2_weight = Array2::from_shape_vec((hidden, hidden), l2_w)
            .map_err(|e| EngineError::artifact(files.l2_weight, e.to_string()))?;

        info!(input, hidden, "vision projector loaded");
        Self::new(l1_weight, Array1::from(l1_b), l2_weight, Array1::from(l2_b))
    }

    pub fn input_width(&self) -> usize {
        self.l1_weight.ncols()
    }

    pub fn hidden_width(&self) -> usize {
        self.l1_bias.len()
    }

    /// x: [T, input] → [T, hidden]
    pub fn forward(&self, features: ArrayView2<'_, f32>) -> EngineResult<Array2<f32>> {
        if features.ncols() != self.input_width() {
            return Err(EngineError::shape(format!(
                "projector expects feature width {}, got {}",
                self.input_width(),
                features.ncols()
            )));
        }
        let mut hidden = features.dot(&self.l1_weight.t()) + &self.l1_bias;
        hidden.mapv_inplace(gelu);
        Ok(hidden.dot(&self.l2_weight.t()) + &self.l2_bias)
    }
}

/// 读取原始小端 f32 数组
pub fn read_f32_le(path: &Path) -> EngineResult<Vec<f32>> {
    let bytes = fs::read(path).map_err(|e| EngineError::artifact(path, format!("failed to read: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(EngineError::artifact(
            path,
            format!("file length {} is not a multiple of 4", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
