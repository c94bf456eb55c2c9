// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/rknn.rs - RKNN 推理引擎
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

use image::{
  RgbImage,
  imageops::{self, FilterType},
};
use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use tracing::{debug, error, info, warn};

use super::{DecodedEngine, DecodedItem, EngineError, EngineLoader, TensorEngine};
use crate::{
  compute::{Delegate, EngineOptions},
  frame::{InputFormat, ModelInput},
  geometry::BoundingBox,
};

fn rknn_error(msg: &str, e: rknpu::Error) -> EngineError {
  EngineError::invalid(format!("{}: {}", msg, e))
}

/// 读取模型文件并创建上下文，检查输入输出数量
fn create_context(
  model: &Path,
  options: &EngineOptions,
  num_inputs: u32,
  num_outputs: u32,
) -> Result<Context, EngineError> {
  if options.delegate != Delegate::Accelerator {
    warn!("RKNN 引擎只能运行在 NPU 上，忽略委托 {:?}", options.delegate);
  }

  let model_data = std::fs::read(model)?;
  debug!(
    "模型文件大小: {:.2} MB",
    model_data.len() as f64 / (1024.0 * 1024.0)
  );

  info!("创建 RKNN 推理上下文");
  let context = Context::new(&model_data, InitFlags::default())
    .map_err(|e| rknn_error("无法创建推理上下文", e))?;

  match context.sdk_version() {
    Ok(version) => {
      if let Ok(api_ver) = version.api_version() {
        debug!("模型 API 版本: {}", api_ver);
      }
      if let Ok(drv_ver) = version.driver_version() {
        debug!("模型驱动版本: {}", drv_ver);
      }
    }
    Err(e) => {
      error!("查询 SDK 版本失败: {}", e);
      return Err(rknn_error("无法查询 SDK 版本", e));
    }
  }

  let actual_inputs = context
    .num_inputs()
    .map_err(|e| rknn_error("无法获取输入数量", e))?;
  let actual_outputs = context
    .num_outputs()
    .map_err(|e| rknn_error("无法获取输出数量", e))?;

  if actual_inputs != num_inputs || actual_outputs != num_outputs {
    let msg = format!(
      "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
      num_inputs, num_outputs, actual_inputs, actual_outputs
    );
    error!("{}", msg);
    return Err(EngineError::invalid(msg));
  }

  Ok(context)
}

fn run_nhwc(context: &Context, data: &[u8]) -> Result<rknpu::Output, EngineError> {
  context
    .set_input(0, data, TensorFormat::NHWC, TensorType::UInt8)
    .map_err(|e| EngineError::inference(e.to_string()))?;
  context
    .run()
    .map_err(|e| EngineError::inference(e.to_string()))?;
  context
    .get_outputs()
    .map_err(|e| EngineError::inference(e.to_string()))
}

/// 单输出 YOLOv5 模型，输出 `rows x (classes + 5)` 的原始张量
pub struct RknnTensorEngine {
  context: Context,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RknnTensorLoader;

impl EngineLoader for RknnTensorLoader {
  type Engine = RknnTensorEngine;

  fn load(&self, model: &Path, options: &EngineOptions) -> Result<RknnTensorEngine, EngineError> {
    let context = create_context(model, options, 1, 1)?;
    Ok(RknnTensorEngine { context })
  }
}

impl TensorEngine for RknnTensorEngine {
  fn input_format(&self) -> InputFormat {
    InputFormat::Uint8Nhwc
  }

  fn forward(&self, input: &ModelInput) -> Result<Vec<f32>, EngineError> {
    let ModelInput::Uint8Nhwc { data, .. } = input else {
      return Err(EngineError::UnsupportedInput(InputFormat::Float32Nchw));
    };
    let output = run_nhwc(&self.context, data)?;
    let tensor = output
      .get_f32(0)
      .map_err(|e| EngineError::inference(e.to_string()))?;
    Ok(tensor.to_vec())
  }
}

const YOLO26_NUM_OUTPUTS: u32 = 6;
const YOLO26_CLASS_NUM: usize = 80;
const YOLO26_INPUT_W: u32 = 640;
const YOLO26_INPUT_H: u32 = 640;
const YOLO26_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
const YOLO26_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
// 引擎内部的最低分数，最终阈值由后端决定
const YOLO26_MIN_SCORE: f32 = 0.25;

/// 三个检测头、无需 NMS 的 YOLO26 模型
pub struct Yolo26Engine {
  context: Context,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Yolo26Loader;

impl EngineLoader for Yolo26Loader {
  type Engine = Yolo26Engine;

  fn load(&self, model: &Path, options: &EngineOptions) -> Result<Yolo26Engine, EngineError> {
    let context = create_context(model, options, 1, YOLO26_NUM_OUTPUTS)?;
    Ok(Yolo26Engine { context })
  }
}

impl DecodedEngine for Yolo26Engine {
  fn detect(&self, image: &RgbImage) -> Result<Vec<DecodedItem>, EngineError> {
    let resized = imageops::resize(image, YOLO26_INPUT_W, YOLO26_INPUT_H, FilterType::Triangle);
    let output = run_nhwc(&self.context, resized.as_raw())?;

    let mut items = Vec::new();
    for (head_idx, (&(map_h, map_w), stride)) in
      YOLO26_HEAD_SIZES.iter().zip(YOLO26_STRIDES).enumerate()
    {
      let first = output
        .get_f32(head_idx * 2)
        .map_err(|e| EngineError::inference(e.to_string()))?;
      let second = output
        .get_f32(head_idx * 2 + 1)
        .map_err(|e| EngineError::inference(e.to_string()))?;
      let head = Head {
        map_w,
        map_h,
        stride,
      };
      let Some((reg, cls)) = head.match_tensors(&first, &second) else {
        error!(
          "检测头 {}: 输出大小不匹配 - {}, {}",
          head_idx,
          first.len(),
          second.len()
        );
        continue;
      };
      head.decode(reg, cls, &mut items);
    }

    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    debug!("YOLO26 检测到 {} 个物体", items.len());
    Ok(items)
  }
}

struct Head {
  map_w: usize,
  map_h: usize,
  stride: f32,
}

impl Head {
  fn spatial(&self) -> usize {
    self.map_w * self.map_h
  }

  /// RKNN 输出顺序不固定，按张量大小区分回归和分类
  fn match_tensors<'a>(&self, a: &'a [f32], b: &'a [f32]) -> Option<(&'a [f32], &'a [f32])> {
    let reg_len = 4 * self.spatial();
    let cls_len = YOLO26_CLASS_NUM * self.spatial();
    if a.len() == reg_len && b.len() == cls_len {
      Some((a, b))
    } else if a.len() == cls_len && b.len() == reg_len {
      Some((b, a))
    } else {
      None
    }
  }

  fn decode(&self, reg: &[f32], cls: &[f32], items: &mut Vec<DecodedItem>) {
    let spatial = self.spatial();
    let (input_w, input_h) = (YOLO26_INPUT_W as f32, YOLO26_INPUT_H as f32);

    for h in 0..self.map_h {
      for w in 0..self.map_w {
        let idx = h * self.map_w + w;

        let mut max_logit = f32::MIN;
        let mut class_index = 0;
        for c in 0..YOLO26_CLASS_NUM {
          let logit = cls[c * spatial + idx];
          if logit > max_logit {
            max_logit = logit;
            class_index = c;
          }
        }
        let score = sigmoid(max_logit);
        if score <= YOLO26_MIN_SCORE {
          continue;
        }

        let grid_x = w as f32 + 0.5;
        let grid_y = h as f32 + 0.5;
        let left = ((grid_x - reg[idx]) * self.stride).clamp(0.0, input_w);
        let top = ((grid_y - reg[spatial + idx]) * self.stride).clamp(0.0, input_h);
        let right = ((grid_x + reg[2 * spatial + idx]) * self.stride).clamp(0.0, input_w);
        let bottom = ((grid_y + reg[3 * spatial + idx]) * self.stride).clamp(0.0, input_h);

        items.push(DecodedItem {
          class_index,
          score,
          bbox: BoundingBox::new(
            left / input_w,
            top / input_h,
            right / input_w,
            bottom / input_h,
          ),
        });
      }
    }
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
