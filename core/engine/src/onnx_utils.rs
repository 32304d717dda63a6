use ndarray::{CowArray, IxDyn};
use ort::tensor::OrtOwnedTensor;
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// 创建 ONNX Runtime 环境；三个模型共用一个环境
pub fn init_onnx_runtime(name: &str) -> EngineResult<Arc<Environment>> {
    let env = Environment::builder()
        .with_name(name)
        .build()
        .map_err(|e| EngineError::runtime(format!("failed to init ONNX Runtime: {e}")))?;
    Ok(Arc::new(env))
}

/// 从文件加载一个 session，`intra_threads` 为算子内并行线程数
pub fn load_session(env: &Arc<Environment>, path: &Path, intra_threads: usize) -> EngineResult<Session> {
    if !path.exists() {
        return Err(EngineError::artifact(path, "model file not found"));
    }

    let threads = i16::try_from(intra_threads.max(1)).unwrap_or(i16::MAX);
    let session = SessionBuilder::new(env)
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(threads))
        .map_err(|e| EngineError::runtime(format!("failed to create session builder: {e}")))?
        .with_model_from_file(path)
        .map_err(|e| EngineError::artifact(path, format!("failed to load ONNX model: {e}")))?;

    info!(
        model = %path.display(),
        inputs = session.inputs.len(),
        outputs = session.outputs.len(),
        "onnx session loaded"
    );
    for (i, input) in session.inputs.iter().enumerate() {
        debug!(index = i, name = %input.name, dims = ?input.dimensions, "model input");
    }
    for (i, output) in session.outputs.iter().enumerate() {
        debug!(index = i, name = %output.name, "model output");
    }
    Ok(session)
}

/// 按名字找 session 输入的下标
pub fn input_index(session: &Session, name: &str) -> Option<usize> {
    session.inputs.iter().position(|i| i.name == name)
}

/// 按名字找 session 输出的下标
pub fn output_index(session: &Session, name: &str) -> Option<usize> {
    session.outputs.iter().position(|o| o.name == name)
}

/// 把 f32 输出张量拷贝成 owned 的动态维数组
pub fn extract_f32(value: &Value<'_>, what: &str) -> EngineResult<ndarray::ArrayD<f32>> {
    let tensor: OrtOwnedTensor<f32, IxDyn> = value
        .try_extract()
        .map_err(|e| EngineError::runtime(format!("failed to extract {what} tensor: {e}")))?;
    let owned = tensor.view().to_owned();
    Ok(owned)
}

/// 供 `Value::from_array` 使用的输入张量
pub enum Feed {
    F32(CowArray<'static, f32, IxDyn>),
    I64(CowArray<'static, i64, IxDyn>),
    Bool(CowArray<'static, bool, IxDyn>),
}

impl Feed {
    pub fn f32<D: ndarray::Dimension>(array: ndarray::Array<f32, D>) -> Self {
        Feed::F32(CowArray::from(array.into_dyn()))
    }

    pub fn i64<D: ndarray::Dimension>(array: ndarray::Array<i64, D>) -> Self {
        Feed::I64(CowArray::from(array.into_dyn()))
    }

    pub fn boolean<D: ndarray::Dimension>(array: ndarray::Array<bool, D>) -> Self {
        Feed::Bool(CowArray::from(array.into_dyn()))
    }
}

/// `Feed` 的局部借用视图；CowArray 对生命周期不变，直接借 `Feed` 会要求 feeds 为 'static
enum FeedView<'a> {
    F32(CowArray<'a, f32, IxDyn>),
    I64(CowArray<'a, i64, IxDyn>),
    Bool(CowArray<'a, bool, IxDyn>),
}

/// 按 session 输入顺序准备好的 feeds 运行一次模型
pub fn run_session(session: &Session, feeds: &[Feed], what: &str) -> EngineResult<Vec<Value<'static>>> {
    // 与 CPU 内存绑定的输入不需要 session 的 allocator
    let allocator = std::ptr::null_mut();
    let views: Vec<FeedView<'_>> = feeds
        .iter()
        .map(|feed| match feed {
            Feed::F32(a) => FeedView::F32(CowArray::from(a.view())),
            Feed::I64(a) => FeedView::I64(CowArray::from(a.view())),
            Feed::Bool(a) => FeedView::Bool(CowArray::from(a.view())),
        })
        .collect();
    let values = views
        .iter()
        .map(|view| match view {
            FeedView::F32(a) => Value::from_array(allocator, a),
            FeedView::I64(a) => Value::from_array(allocator, a),
            FeedView::Bool(a) => Value::from_array(allocator, a),
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::runtime(format!("failed to build {what} inputs: {e}")))?;

    session
        .run(values)
        .map_err(|e| EngineError::runtime(format!("{what} inference failed: {e}")))
}
