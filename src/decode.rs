// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 检测张量解码与非极大值抑制
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
use tracing::debug;

use crate::geometry::{BoundingBox, intersection_over_union};

/// 每行中类别概率之前的属性个数: cx, cy, w, h, objectness
pub const BOX_ATTRIBUTES: usize = 5;

pub const DEFAULT_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_LIMIT: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
  #[error("张量形状不匹配: 期望 {rows} x {columns} = {expected} 个元素, 实际为 {actual}")]
  Shape {
    rows: usize,
    columns: usize,
    expected: usize,
    actual: usize,
  },
  #[error("列数过少: {0}, 至少需要 {min} 列", min = BOX_ATTRIBUTES + 1)]
  TooFewColumns(usize),
}

/// 解码参数
///
/// 置信度阈值与 NMS 重叠阈值分开配置；[`DecoderConfig::with_threshold`]
/// 把两者设为同一个值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
  /// objectness 必须严格大于该值才会成为候选
  pub score_threshold: f32,
  /// IoU 严格大于该值的候选会被抑制
  pub iou_threshold: f32,
  /// NMS 最多保留的检测数
  pub nms_limit: usize,
}

impl DecoderConfig {
  pub const fn with_threshold(threshold: f32) -> Self {
    Self {
      score_threshold: threshold,
      iou_threshold: threshold,
      nms_limit: DEFAULT_NMS_LIMIT,
    }
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn nms_limit(mut self, limit: usize) -> Self {
    self.nms_limit = limit;
    self
  }
}

impl Default for DecoderConfig {
  fn default() -> Self {
    Self::with_threshold(DEFAULT_THRESHOLD)
  }
}

/// 单个候选检测
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
  pub class_index: usize,
  pub score: f32,
  pub bbox: BoundingBox,
}

/// 模型坐标到源图像坐标的映射: 先缩放再平移
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
  pub scale_x: f32,
  pub scale_y: f32,
  pub offset_x: f32,
  pub offset_y: f32,
}

impl Projection {
  pub const fn scale(scale_x: f32, scale_y: f32) -> Self {
    Self {
      scale_x,
      scale_y,
      offset_x: 0.0,
      offset_y: 0.0,
    }
  }

  pub fn offset(mut self, offset_x: f32, offset_y: f32) -> Self {
    self.offset_x = offset_x;
    self.offset_y = offset_y;
    self
  }

  fn apply(&self, bbox: BoundingBox) -> BoundingBox {
    bbox
      .scale(self.scale_x, self.scale_y)
      .translate(self.offset_x, self.offset_y)
  }
}

impl Default for Projection {
  fn default() -> Self {
    Self::scale(1.0, 1.0)
  }
}

#[derive(Debug, Clone, Default)]
pub struct Decoder {
  config: DecoderConfig,
}

impl Decoder {
  pub fn new(config: DecoderConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &DecoderConfig {
    &self.config
  }

  /// 解码并执行 NMS，结果按分数降序排列
  pub fn decode(
    &self,
    tensor: &[f32],
    rows: usize,
    columns: usize,
    projection: Projection,
  ) -> Result<Vec<RawDetection>, DecodeError> {
    let candidates = self.candidates(tensor, rows, columns, projection)?;
    debug!("候选检测数: {}", candidates.len());
    Ok(non_max_suppression(
      candidates,
      self.config.nms_limit,
      self.config.iou_threshold,
    ))
  }

  /// 逐行筛选 objectness 超过阈值的候选，不做抑制
  pub fn candidates(
    &self,
    tensor: &[f32],
    rows: usize,
    columns: usize,
    projection: Projection,
  ) -> Result<Vec<RawDetection>, DecodeError> {
    if rows == 0 && tensor.is_empty() {
      return Ok(Vec::new());
    }
    if columns <= BOX_ATTRIBUTES {
      return Err(DecodeError::TooFewColumns(columns));
    }
    // 乘积溢出时按 usize::MAX 报告
    let expected = rows.checked_mul(columns).unwrap_or(usize::MAX);
    if tensor.len() != expected {
      return Err(DecodeError::Shape {
        rows,
        columns,
        expected,
        actual: tensor.len(),
      });
    }

    let mut candidates = Vec::new();
    for row in tensor.chunks_exact(columns) {
      let objectness = row[4];
      if objectness <= self.config.score_threshold || objectness.is_nan() {
        continue;
      }

      let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
      candidates.push(RawDetection {
        class_index: argmax(&row[BOX_ATTRIBUTES..]),
        score: objectness,
        bbox: projection.apply(bbox),
      });
    }
    Ok(candidates)
  }
}

// 严格大于比较，相等时保留靠前的类别
fn argmax(scores: &[f32]) -> usize {
  let mut best = 0;
  let mut max = scores[0];
  for (index, &score) in scores.iter().enumerate().skip(1) {
    if score > max {
      max = score;
      best = index;
    }
  }
  best
}

/// 贪心非极大值抑制
///
/// 先按分数稳定降序排序，每次选取剩余最高分的候选，并抑制与其 IoU
/// 超过 `iou_threshold` 的后续候选，直到选满 `limit` 个或所有候选均已处理。
/// 抑制不区分类别。
pub fn non_max_suppression(
  mut candidates: Vec<RawDetection>,
  limit: usize,
  iou_threshold: f32,
) -> Vec<RawDetection> {
  candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
  if limit == 0 {
    return Vec::new();
  }

  let mut selected = Vec::with_capacity(limit.min(candidates.len()));
  let mut active = vec![true; candidates.len()];
  let mut remaining = candidates.len();

  'select: for i in 0..candidates.len() {
    if !active[i] {
      continue;
    }
    let best = candidates[i];
    active[i] = false;
    remaining -= 1;
    selected.push(best);
    if selected.len() >= limit || remaining == 0 {
      break;
    }

    for (j, candidate) in candidates.iter().enumerate().skip(i + 1) {
      if active[j] && intersection_over_union(&best.bbox, &candidate.bbox) > iou_threshold {
        active[j] = false;
        remaining -= 1;
        if remaining == 0 {
          break 'select;
        }
      }
    }
  }

  selected
}
