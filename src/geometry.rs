// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框与重叠度计算
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

/// 轴对齐边界框，坐标为旋转校正后源图像的像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
  pub left: f32,
  pub top: f32,
  pub right: f32,
  pub bottom: f32,
}

impl BoundingBox {
  pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
    Self {
      left,
      top,
      right,
      bottom,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
    Self {
      left: cx - width / 2.0,
      top: cy - height / 2.0,
      right: cx + width / 2.0,
      bottom: cy + height / 2.0,
    }
  }

  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  pub fn scale(self, sx: f32, sy: f32) -> Self {
    Self {
      left: self.left * sx,
      top: self.top * sy,
      right: self.right * sx,
      bottom: self.bottom * sy,
    }
  }

  pub fn translate(self, dx: f32, dy: f32) -> Self {
    Self {
      left: self.left + dx,
      top: self.top + dy,
      right: self.right + dx,
      bottom: self.bottom + dy,
    }
  }
}

impl From<[f32; 4]> for BoundingBox {
  // [x_min, y_min, x_max, y_max]
  fn from(bbox: [f32; 4]) -> Self {
    Self::new(bbox[0], bbox[1], bbox[2], bbox[3])
  }
}

fn raw_area(bbox: &BoundingBox) -> f32 {
  bbox.width() * bbox.height()
}

/// 面积，退化输入截断为 0
pub fn area(bbox: &BoundingBox) -> f32 {
  raw_area(bbox).max(0.0)
}

/// 两个边界框的交并比，结果位于 [0, 1]
pub fn intersection_over_union(a: &BoundingBox, b: &BoundingBox) -> f32 {
  let area_a = raw_area(a);
  let area_b = raw_area(b);
  if area_a < 0.0 || area_b < 0.0 {
    return 0.0;
  }

  let inter_left = a.left.max(b.left);
  let inter_top = a.top.max(b.top);
  let inter_right = a.right.min(b.right);
  let inter_bottom = a.bottom.min(b.bottom);
  let intersection = (inter_right - inter_left).max(0.0) * (inter_bottom - inter_top).max(0.0);

  let union = area_a + area_b - intersection;
  if union > 0.0 {
    (intersection / union).clamp(0.0, 1.0)
  } else {
    0.0
  }
}
