//! 文本嵌入与视觉特征拼接
//!
//! `<image>` 占位符所在的位置被替换成 T 个视觉向量，其余位置照抄：
//! 输出长度 = L - 1 + T

use ndarray::{s, Array2, ArrayView2};

use crate::error::{EngineError, EngineResult};

/// 找到第一个图像占位符的位置
pub fn find_placeholder(ids: &[i64], image_id: i64) -> Option<usize> {
    ids.iter().position(|&id| id == image_id)
}

/// text: [L, H]，vision: [T, H] → [L - 1 + T, H]
pub fn fuse_embeddings(
    text: ArrayView2<'_, f32>,
    placeholder: usize,
    vision: ArrayView2<'_, f32>,
) -> EngineResult<Array2<f32>> {
    let (text_len, hidden) = text.dim();
    let (vision_len, vision_hidden) = vision.dim();

    if placeholder >= text_len {
        return Err(EngineError::shape(format!(
            "placeholder index {placeholder} out of range for {text_len} text positions"
        )));
    }
    if vision_hidden != hidden {
        return Err(EngineError::shape(format!(
            "vision features have width {vision_hidden}, text embeddings have width {hidden}"
        )));
    }

    let total = text_len - 1 + vision_len;
    let mut fused = Array2::<f32>::zeros((total, hidden));
    fused
        .slice_mut(s![..placeholder, ..])
        .assign(&text.slice(s![..placeholder, ..]));
    fused
        .slice_mut(s![placeholder..placeholder + vision_len, ..])
        .assign(&vision);
    fused
        .slice_mut(s![placeholder + vision_len.., ..])
        .assign(&text.slice(s![placeholder + 1.., ..]));
    Ok(fused)
}

/// 按 token ids 定位占位符后拼接；找不到占位符时返回 `MissingPlaceholder`
pub fn fuse_at_image_token(
    ids: &[i64],
    image_id: i64,
    text: ArrayView2<'_, f32>,
    vision: ArrayView2<'_, f32>,
) -> EngineResult<Array2<f32>> {
    if ids.len() != text.nrows() {
        return Err(EngineError::shape(format!(
            "{} token ids but {} text embeddings",
            ids.len(),
            text.nrows()
        )));
    }
    let placeholder = find_placeholder(ids, image_id).ok_or(EngineError::MissingPlaceholder { image_id })?;
    fuse_embeddings(text, placeholder, vision)
}
