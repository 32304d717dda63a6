//! 图像预处理：任意格式 → RGB → 双三次缩放到固定边长 → [0,1] → NCHW

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// 视觉编码器要求的输入边长
pub const DEFAULT_IMAGE_SIZE: u32 = 1024;

/// 从文件读取并预处理，输出形状 [1, 3, size, size]
pub fn preprocess_image(path: &Path, size: u32) -> EngineResult<Array4<f32>> {
    let image = image::open(path).map_err(|source| EngineError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image_to_tensor(&image, size))
}

/// 不裁剪，直接拉伸到 size × size
pub fn image_to_tensor(image: &DynamicImage, size: u32) -> Array4<f32> {
    let rgb = image
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgb8();

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel.0[c] as f32 / 255.0;
        }
    }
    tensor
}
