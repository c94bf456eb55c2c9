// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 检测结果与检测器接口
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

use thiserror::Error;

use crate::{
  assets::AssetError, compute::ComputeTarget, decode::DecodeError, engine::EngineError,
  frame::CapturedFrame, geometry::BoundingBox,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
  pub bbox: BoundingBox,
  pub label: String,
  /// 置信度，位于 [0, 1]
  pub confidence: f32,
}

/// 一次推理的完整结果，检测框以旋转校正后的图像尺寸为坐标系
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
  pub detected_objects: Vec<DetectedObject>,
  pub image_width: u32,
  pub image_height: u32,
}

impl DetectionResult {
  /// 按置信度降序整理检测结果
  pub fn new(mut detected_objects: Vec<DetectedObject>, image_width: u32, image_height: u32) -> Self {
    detected_objects.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Self {
      detected_objects,
      image_width,
      image_height,
    }
  }

  /// 只保留置信度最高的 `max` 个
  pub fn keep_top(mut self, max: usize) -> Self {
    self.detected_objects.truncate(max);
    self
  }

  /// 没有检测结果，但保留图像尺寸
  pub fn empty(image_width: u32, image_height: u32) -> Self {
    Self {
      detected_objects: Vec::new(),
      image_width,
      image_height,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.detected_objects.is_empty()
  }

  pub fn len(&self) -> usize {
    self.detected_objects.len()
  }
}

#[derive(Error, Debug)]
pub enum SetupError {
  #[error("资源加载失败: {0}")]
  Asset(#[from] AssetError),
  #[error("模型加载失败: {0}")]
  Engine(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("输出张量解码失败: {0}")]
  Decode(#[from] DecodeError),
}

/// 检测后端的统一接口
///
/// `setup` 可重复调用，每次都会重新加载模型；`cleanup` 释放模型后，
/// 下一次 `detect` 会自动重新 `setup`。模型加载失败不会让 `detect`
/// 返回错误，而是得到一个空结果。
pub trait Detector {
  fn name(&self) -> &str;

  /// 下一次自动 `setup` 使用的计算目标
  fn compute_target(&self) -> ComputeTarget;

  fn setup(&mut self, target: ComputeTarget) -> Result<(), SetupError>;

  fn cleanup(&mut self);

  fn is_ready(&self) -> bool;

  fn detect(&mut self, frame: &CapturedFrame) -> Result<DetectionResult, DetectError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
  fn name(&self) -> &str {
    (**self).name()
  }

  fn compute_target(&self) -> ComputeTarget {
    (**self).compute_target()
  }

  fn setup(&mut self, target: ComputeTarget) -> Result<(), SetupError> {
    (**self).setup(target)
  }

  fn cleanup(&mut self) {
    (**self).cleanup()
  }

  fn is_ready(&self) -> bool {
    (**self).is_ready()
  }

  fn detect(&mut self, frame: &CapturedFrame) -> Result<DetectionResult, DetectError> {
    (**self).detect(frame)
  }
}
