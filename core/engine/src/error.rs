use std::borrow::Cow;
use std::path::PathBuf;

use thiserror::Error;

/// 推理核心的统一错误类型
///
/// - `Artifact` / `ShapeMismatch`：模型或引擎版本不匹配，直接向上抛出，终止生成
/// - `UnknownToken`：BPE 符号不在词表中且没有配置 `<unk>`
/// - `MissingPlaceholder`：prompt 中没有图像占位符，调用方应当提示用户而不是崩溃
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("artifact error ({}): {message}", path.display())]
    Artifact { path: PathBuf, message: Cow<'static, str> },

    #[error("unknown token '{symbol}' and no <unk> token configured")]
    UnknownToken { symbol: String },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(Cow<'static, str>),

    #[error("prompt does not contain the image placeholder (id {image_id})")]
    MissingPlaceholder { image_id: i64 },

    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),

    #[error("failed to load image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("runtime error: {0}")]
    Runtime(Cow<'static, str>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    pub fn artifact<P, T>(path: P, message: T) -> Self
    where
        P: Into<PathBuf>,
        T: Into<Cow<'static, str>>,
    {
        Self::Artifact {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn shape<T>(message: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        Self::ShapeMismatch(message.into())
    }

    pub fn config<T>(message: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        Self::Config(message.into())
    }

    pub fn runtime<T>(message: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        Self::Runtime(message.into())
    }

    /// 是否属于“不可恢复”的错误（模型文件 / 形状问题）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Artifact { .. } | Self::ShapeMismatch(_) | Self::Runtime(_) | Self::Config(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_placeholder_is_not_fatal() {
        let err = EngineError::MissingPlaceholder { image_id: 151646 };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("151646"));
    }

    #[test]
    fn test_artifact_message_contains_path() {
        let err = EngineError::artifact("models/vocab.json", "missing");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("models/vocab.json"));
    }
}
