// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 采集帧与模型输入张量
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

use std::borrow::Cow;

use image::{RgbImage, imageops};

const RGB_CHANNELS: usize = 3;

/// 顺时针旋转角度，仅允许 0/90/180/270
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
  #[default]
  Deg0,
  Deg90,
  Deg180,
  Deg270,
}

impl Rotation {
  pub fn from_degrees(degrees: i32) -> Option<Self> {
    match degrees {
      0 => Some(Rotation::Deg0),
      90 => Some(Rotation::Deg90),
      180 => Some(Rotation::Deg180),
      270 => Some(Rotation::Deg270),
      _ => None,
    }
  }

  pub fn degrees(&self) -> i32 {
    match self {
      Rotation::Deg0 => 0,
      Rotation::Deg90 => 90,
      Rotation::Deg180 => 180,
      Rotation::Deg270 => 270,
    }
  }

  /// 旋转后的 (宽, 高)
  pub fn rotated_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
    match self {
      Rotation::Deg0 | Rotation::Deg180 => (width, height),
      Rotation::Deg90 | Rotation::Deg270 => (height, width),
    }
  }

  pub fn apply<'a>(&self, image: &'a RgbImage) -> Cow<'a, RgbImage> {
    match self {
      Rotation::Deg0 => Cow::Borrowed(image),
      Rotation::Deg90 => Cow::Owned(imageops::rotate90(image)),
      Rotation::Deg180 => Cow::Owned(imageops::rotate180(image)),
      Rotation::Deg270 => Cow::Owned(imageops::rotate270(image)),
    }
  }
}

/// 流水线的输入单元
#[derive(Debug, Clone)]
pub struct CapturedFrame {
  /// 毫秒时间戳
  pub timestamp: i64,
  pub image: RgbImage,
  pub rotation: Rotation,
}

impl CapturedFrame {
  pub fn new(timestamp: i64, image: RgbImage, rotation: Rotation) -> Self {
    Self {
      timestamp,
      image,
      rotation,
    }
  }

  /// 旋转校正后的图像，检测框以此为坐标系
  pub fn rotated(&self) -> Cow<'_, RgbImage> {
    self.rotation.apply(&self.image)
  }

  pub fn rotated_dimensions(&self) -> (u32, u32) {
    let (width, height) = self.image.dimensions();
    self.rotation.rotated_dimensions(width, height)
  }
}

/// 张量引擎接受的输入格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
  /// 归一化到 [0, 1] 后按 (x - mean) / std 标准化的 f32 NCHW
  Float32Nchw,
  /// 原始字节 NHWC
  Uint8Nhwc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
  Float32Nchw {
    data: Vec<f32>,
    width: u32,
    height: u32,
  },
  Uint8Nhwc {
    data: Vec<u8>,
    width: u32,
    height: u32,
  },
}

impl ModelInput {
  pub fn from_image(image: &RgbImage, format: InputFormat, mean: [f32; 3], std: [f32; 3]) -> Self {
    let (width, height) = image.dimensions();
    match format {
      InputFormat::Float32Nchw => ModelInput::Float32Nchw {
        data: to_nchw_f32(image, mean, std),
        width,
        height,
      },
      InputFormat::Uint8Nhwc => ModelInput::Uint8Nhwc {
        data: image.as_raw().clone(),
        width,
        height,
      },
    }
  }

  pub fn dimensions(&self) -> (u32, u32) {
    match self {
      ModelInput::Float32Nchw { width, height, .. } | ModelInput::Uint8Nhwc { width, height, .. } => {
        (*width, *height)
      }
    }
  }
}

fn to_nchw_f32(image: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Vec<f32> {
  let (width, height) = image.dimensions();
  let plane = width as usize * height as usize;
  let mut data = vec![0.0f32; RGB_CHANNELS * plane];

  for (x, y, pixel) in image.enumerate_pixels() {
    let offset = y as usize * width as usize + x as usize;
    for c in 0..RGB_CHANNELS {
      let value = pixel[c] as f32 / 255.0;
      data[c * plane + offset] = (value - mean[c]) / std[c];
    }
  }
  data
}
