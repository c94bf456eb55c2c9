// 该文件是 Shanan （山南西风） 项目的一部分。
// src/backend/tensor.rs - 原始张量后端
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

use image::imageops::{self, FilterType};
use tracing::{debug, error, info, warn};

use super::{Loaded, ModelAssets};
use crate::{
  compute::{ComputeSettings, ComputeTarget},
  decode::{Decoder, DecoderConfig, Projection},
  engine::{EngineLoader, TensorEngine},
  frame::{CapturedFrame, ModelInput},
  model::{DetectError, DetectedObject, DetectionResult, Detector, SetupError},
};

pub const DEFAULT_MAX_RESULTS: usize = 5;

/// 模型输入输出的固定参数
#[derive(Debug, Clone, PartialEq)]
pub struct TensorModelConfig {
  pub input_width: u32,
  pub input_height: u32,
  /// 仅用于 f32 输入
  pub mean: [f32; 3],
  pub std: [f32; 3],
  pub output_rows: usize,
  /// 类别数 + 5
  pub output_columns: usize,
}

impl Default for TensorModelConfig {
  // YOLOv5 640x640，80 类，不做均值方差归一化
  fn default() -> Self {
    Self {
      input_width: 640,
      input_height: 640,
      mean: [0.0; 3],
      std: [1.0; 3],
      output_rows: 25200,
      output_columns: 85,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TensorBackendConfig {
  pub assets: ModelAssets,
  pub model: TensorModelConfig,
  pub decoder: DecoderConfig,
  pub max_results: usize,
  pub compute_target: ComputeTarget,
}

impl TensorBackendConfig {
  pub fn new(assets: ModelAssets) -> Self {
    Self {
      assets,
      model: TensorModelConfig::default(),
      decoder: DecoderConfig::default(),
      max_results: DEFAULT_MAX_RESULTS,
      compute_target: ComputeTarget::default(),
    }
  }
}

pub struct TensorBackend<L: EngineLoader> {
  assets: ModelAssets,
  model: TensorModelConfig,
  decoder: Decoder,
  max_results: usize,
  target: ComputeTarget,
  compute: ComputeSettings,
  loader: L,
  loaded: Option<Loaded<L::Engine>>,
}

impl<L: EngineLoader> TensorBackend<L> {
  pub fn new(config: TensorBackendConfig, loader: L, compute: ComputeSettings) -> Self {
    Self {
      assets: config.assets,
      model: config.model,
      decoder: Decoder::new(config.decoder),
      max_results: config.max_results,
      target: config.compute_target,
      compute,
      loader,
      loaded: None,
    }
  }

  fn prepare(&self, image: &image::RgbImage, engine: &L::Engine) -> ModelInput
  where
    L::Engine: TensorEngine,
  {
    let resized = imageops::resize(
      image,
      self.model.input_width,
      self.model.input_height,
      FilterType::Triangle,
    );
    ModelInput::from_image(
      &resized,
      engine.input_format(),
      self.model.mean,
      self.model.std,
    )
  }
}

impl<L> Detector for TensorBackend<L>
where
  L: EngineLoader,
  L::Engine: TensorEngine,
{
  fn name(&self) -> &str {
    "tensor"
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
      info!("释放张量模型");
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
    let input = self.prepare(&rotated, &loaded.engine);
    let output = loaded.engine.forward(&input)?;
    let elapsed = now.elapsed();

    let projection = Projection::scale(
      width as f32 / self.model.input_width as f32,
      height as f32 / self.model.input_height as f32,
    );
    let detections = self.decoder.decode(
      &output,
      self.model.output_rows,
      self.model.output_columns,
      projection,
    )?;

    let objects: Vec<DetectedObject> = detections
      .into_iter()
      .map(|detection| DetectedObject {
        bbox: detection.bbox,
        label: loaded.labels.resolve(detection.class_index).to_string(),
        confidence: detection.score,
      })
      .collect();
    let result = DetectionResult::new(objects, width, height).keep_top(self.max_results);

    debug!(
      "帧 {} 推理完成，耗时: {:.2?}，检测到 {} 个物体",
      frame.timestamp,
      elapsed,
      result.len()
    );
    Ok(result)
  }
}
