// 该文件是 Shanan （山南西风） 项目的一部分。
// src/backend/decoded.rs - 引擎自带后处理的后端
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

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{Loaded, ModelAssets};
use crate::{
  compute::{ComputeSettings, ComputeTarget},
  engine::{DecodedEngine, EngineLoader},
  frame::CapturedFrame,
  model::{DetectError, DetectedObject, DetectionResult, Detector, SetupError},
};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_RESULTS: usize = 3;

#[derive(Debug, Clone)]
pub struct DecodedBackendConfig {
  pub assets: ModelAssets,
  /// 低于该分数的检测会被丢弃
  pub score_threshold: f32,
  pub max_results: usize,
  pub compute_target: ComputeTarget,
}

impl DecodedBackendConfig {
  pub fn new(assets: ModelAssets) -> Self {
    Self {
      assets,
      score_threshold: DEFAULT_SCORE_THRESHOLD,
      max_results: DEFAULT_MAX_RESULTS,
      compute_target: ComputeTarget::default(),
    }
  }
}

/// 适配已解码引擎的输出
pub struct DecodedBackend<L: EngineLoader> {
  assets: ModelAssets,
  score_threshold: f32,
  max_results: usize,
  target: ComputeTarget,
  compute: ComputeSettings,
  loader: L,
  loaded: Option<Loaded<L::Engine>>,
}

impl<L: EngineLoader> DecodedBackend<L> {
  pub fn new(config: DecodedBackendConfig, loader: L, compute: ComputeSettings) -> Self {
    Self {
      assets: config.assets,
      score_threshold: config.score_threshold,
      max_results: config.max_results,
      target: config.compute_target,
      compute,
      loader,
      loaded: None,
    }
  }
}

impl<L> Detector for DecodedBackend<L>
where
  L: EngineLoader,
  L::Engine: DecodedEngine,
{
  fn name(&self) -> &str {
    "decoded"
  }

  fn compute_target(&self) -> ComputeTarget {
    self.target
  }

  fn setup(&mut self, target: ComputeTarget) -> Result<(), SetupError> {
    self.target = target;
    self.loaded = None;
    let options = self.compute.resolve(target);
    let (engine, labels) = self.assets.load(&self.loader, &options)?;
    self.loaded = Some(Loaded::new(engine, labels, &options));
    Ok(())
  }

  fn cleanup(&mut self) {
    if self.loaded.take().is_some() {
      info!("释放检测模型");
    }
  }

  fn is_ready(&self) -> bool {
    self.loaded.is_some()
  }

  fn detect(&mut self, frame: &CapturedFrame) -> Result<DetectionResult, DetectError> {
    if self.loaded.is_none() {
      if let Err(e) = self.setup(self.target) {
        error!("模型加载失败: {}", e);
      }
    }

    let rotated = frame.rotated();
    let (width, height) = rotated.dimensions();
    let Some(loaded) = self.loaded.as_ref() else {
      warn!("模型未加载，帧 {} 没有检测结果", frame.timestamp);
      return Ok(DetectionResult::empty(width, height));
    };
    loaded.check_thread();

    let now = Instant::now();
    let items = loaded.engine.detect(&rotated)?;
    debug!("推理耗时: {:.2?}", now.elapsed());

    // 归一化坐标换算到旋转后图像的像素坐标
    let objects: Vec<DetectedObject> = items
      .into_iter()
      .filter(|item| item.score >= self.score_threshold)
      .map(|item| DetectedObject {
        bbox: item.bbox.scale(width as f32, height as f32),
        label: loaded.labels.resolve(item.class_index).to_string(),
        confidence: item.score,
      })
      .collect();
    Ok(DetectionResult::new(objects, width, height).keep_top(self.max_results))
  }
}
