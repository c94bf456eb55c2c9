// 该文件是 Shanan （山南西风） 项目的一部分。
// src/backend.rs - 检测后端
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  assets::AssetStore,
  compute::{ComputeSettings, ComputeTarget, EngineOptions, ParseComputeTargetError},
  decode::DecoderConfig,
  engine::{DecodedEngine, EngineLoader, TensorEngine},
  frame::CapturedFrame,
  labels::Labels,
  model::{DetectError, DetectionResult, Detector, SetupError},
};

mod decoded;
mod tensor;

pub use self::decoded::{DecodedBackend, DecodedBackendConfig};
pub use self::tensor::{TensorBackend, TensorBackendConfig, TensorModelConfig};

/// 后端需要的模型与标签资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssets {
  pub store: AssetStore,
  pub model: String,
  pub labels: String,
}

impl ModelAssets {
  pub fn new(store: AssetStore, model: impl Into<String>, labels: impl Into<String>) -> Self {
    Self {
      store,
      model: model.into(),
      labels: labels.into(),
    }
  }

  fn load<L: EngineLoader>(
    &self,
    loader: &L,
    options: &EngineOptions,
  ) -> Result<(L::Engine, Labels), SetupError> {
    let labels = self.store.read_labels(&self.labels)?;
    let path = self.store.asset_file_path(&self.model)?;
    info!("加载模型文件: {}", path.display());
    let engine = loader.load(&path, options)?;
    info!("模型加载完成，共 {} 个类别", labels.len());
    Ok((engine, labels))
  }
}

/// 已加载的引擎及其标签
struct Loaded<E> {
  engine: E,
  labels: Labels,
  /// GPU 委托要求推理线程与加载线程一致
  bound_thread: Option<ThreadId>,
}

impl<E> Loaded<E> {
  fn new(engine: E, labels: Labels, options: &EngineOptions) -> Self {
    Self {
      engine,
      labels,
      bound_thread: options.thread_bound.then(|| thread::current().id()),
    }
  }

  fn check_thread(&self) {
    if let Some(bound) = self.bound_thread {
      debug_assert_eq!(
        bound,
        thread::current().id(),
        "GPU 委托的引擎必须在执行 setup 的线程上推理"
      );
    }
  }
}

/// 后端集合，按配置选择其中之一
pub enum Backend<T: EngineLoader, D: EngineLoader> {
  Tensor(TensorBackend<T>),
  Decoded(DecodedBackend<D>),
}

impl<T, D> Detector for Backend<T, D>
where
  T: EngineLoader,
  T::Engine: TensorEngine,
  D: EngineLoader,
  D::Engine: DecodedEngine,
{
  fn name(&self) -> &str {
    match self {
      Backend::Tensor(backend) => backend.name(),
      Backend::Decoded(backend) => backend.name(),
    }
  }

  fn compute_target(&self) -> ComputeTarget {
    match self {
      Backend::Tensor(backend) => backend.compute_target(),
      Backend::Decoded(backend) => backend.compute_target(),
    }
  }

  fn setup(&mut self, target: ComputeTarget) -> Result<(), SetupError> {
    match self {
      Backend::Tensor(backend) => backend.setup(target),
      Backend::Decoded(backend) => backend.setup(target),
    }
  }

  fn cleanup(&mut self) {
    match self {
      Backend::Tensor(backend) => backend.cleanup(),
      Backend::Decoded(backend) => backend.cleanup(),
    }
  }

  fn is_ready(&self) -> bool {
    match self {
      Backend::Tensor(backend) => backend.is_ready(),
      Backend::Decoded(backend) => backend.is_ready(),
    }
  }

  fn detect(&mut self, frame: &CapturedFrame) -> Result<DetectionResult, DetectError> {
    match self {
      Backend::Tensor(backend) => backend.detect(frame),
      Backend::Decoded(backend) => backend.detect(frame),
    }
  }
}

#[derive(Error, Debug)]
pub enum BackendUrlError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("模型路径无效: {0}")]
  InvalidPath(String),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error(transparent)]
  ComputeTarget(#[from] ParseComputeTargetError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
  /// 输出原始张量，需要本地解码
  Tensor,
  /// 引擎自带后处理
  Decoded,
}

const TENSOR_SCHEME: &str = "yolov5";
const DECODED_SCHEME: &str = "yolo26";
const DEFAULT_LABELS: &str = "classes.txt";
const DEFAULT_CACHE_DIR: &str = "shanan-live";

/// 由 URL 描述的后端配置
///
/// `yolov5:///models/yolov5s.rknn?labels=coco.txt&compute=npu&threshold=0.5&max_results=5`
#[derive(Debug, Clone)]
pub struct BackendSpec {
  pub kind: BackendKind,
  pub assets: ModelAssets,
  pub compute_target: ComputeTarget,
  pub threshold: Option<f32>,
  pub max_results: Option<usize>,
}

impl FromUrl for BackendSpec {
  type Error = BackendUrlError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let kind = match url.scheme() {
      TENSOR_SCHEME => BackendKind::Tensor,
      DECODED_SCHEME => BackendKind::Decoded,
      other => return Err(BackendUrlError::SchemeMismatch(other.to_string())),
    };

    let model_path = PathBuf::from(url.path());
    let (bundle_dir, model) = match (model_path.parent(), model_path.file_name()) {
      (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
      _ => return Err(BackendUrlError::InvalidPath(url.path().to_string())),
    };

    let mut labels = DEFAULT_LABELS.to_string();
    let mut cache_dir = std::env::temp_dir().join(DEFAULT_CACHE_DIR);
    let mut compute_target = ComputeTarget::default();
    let mut threshold = None;
    let mut max_results = None;

    for (key, value) in url.query_pairs() {
      let invalid = || BackendUrlError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match &*key {
        "labels" => labels = value.to_string(),
        "cache" => cache_dir = PathBuf::from(&*value),
        "compute" => compute_target = value.parse()?,
        "threshold" => threshold = Some(value.parse::<f32>().map_err(|_| invalid())?),
        "max_results" => max_results = Some(value.parse::<usize>().map_err(|_| invalid())?),
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }

    Ok(BackendSpec {
      kind,
      assets: ModelAssets::new(AssetStore::new(bundle_dir, cache_dir), model, labels),
      compute_target,
      threshold,
      max_results,
    })
  }
}

impl BackendSpec {
  pub fn model_dir(&self) -> &Path {
    self.assets.store.bundle_dir()
  }

  /// 构造后端，未使用的加载器会被丢弃
  pub fn build<T: EngineLoader, D: EngineLoader>(
    self,
    tensor_loader: T,
    decoded_loader: D,
    compute: ComputeSettings,
  ) -> Backend<T, D> {
    match self.kind {
      BackendKind::Tensor => {
        let mut config = TensorBackendConfig::new(self.assets);
        config.compute_target = self.compute_target;
        if let Some(threshold) = self.threshold {
          config.decoder = DecoderConfig::with_threshold(threshold);
        }
        if let Some(max_results) = self.max_results {
          config.max_results = max_results;
        }
        Backend::Tensor(TensorBackend::new(config, tensor_loader, compute))
      }
      BackendKind::Decoded => {
        let mut config = DecodedBackendConfig::new(self.assets);
        config.compute_target = self.compute_target;
        if let Some(threshold) = self.threshold {
          config.score_threshold = threshold;
        }
        if let Some(max_results) = self.max_results {
          config.max_results = max_results;
        }
        Backend::Decoded(DecodedBackend::new(config, decoded_loader, compute))
      }
    }
  }
}
