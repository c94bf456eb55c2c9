// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine.rs - 推理引擎接口
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

use std::path::Path;

use image::RgbImage;
use thiserror::Error;

use crate::{
  compute::EngineOptions,
  frame::{InputFormat, ModelInput},
  geometry::BoundingBox,
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型文件读取失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  InvalidModel(String),
  #[error("推理失败: {0}")]
  Inference(String),
  #[error("不支持的输入格式: {0:?}")]
  UnsupportedInput(InputFormat),
}

impl EngineError {
  pub fn invalid(msg: impl Into<String>) -> Self {
    EngineError::InvalidModel(msg.into())
  }

  pub fn inference(msg: impl Into<String>) -> Self {
    EngineError::Inference(msg.into())
  }
}

/// 只输出原始张量的引擎，结果需要经过 [`crate::decode`] 解码
pub trait TensorEngine {
  fn input_format(&self) -> InputFormat;

  /// 返回按行优先展开的检测张量
  fn forward(&self, input: &ModelInput) -> Result<Vec<f32>, EngineError>;
}

/// 引擎内部已解码的检测项，坐标归一化到 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedItem {
  pub class_index: usize,
  pub score: f32,
  pub bbox: BoundingBox,
}

/// 自带后处理的引擎，输出已排序的检测结果
pub trait DecodedEngine {
  fn detect(&self, image: &RgbImage) -> Result<Vec<DecodedItem>, EngineError>;
}

/// 从模型文件创建引擎
///
/// 加载器本身不持有引擎状态，可以在一个线程创建，在另一个线程加载。
pub trait EngineLoader {
  type Engine;

  fn load(&self, model: &Path, options: &EngineOptions) -> Result<Self::Engine, EngineError>;
}

impl<E, F> EngineLoader for F
where
  F: Fn(&Path, &EngineOptions) -> Result<E, EngineError>,
{
  type Engine = E;

  fn load(&self, model: &Path, options: &EngineOptions) -> Result<E, EngineError> {
    self(model, options)
  }
}

#[cfg(feature = "rknpu")]
pub mod rknn;
