// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 图像文件输入
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

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::{CapturedFrame, Rotation},
};

const IMAGE_SCHEME: &str = "image";
const FOLDER_SCHEME: &str = "folder";
const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "gif", "webp"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("参数 {key} 无效: {value}")]
  InvalidParameter { key: String, value: String },
  #[error("目录中没有图像文件: {0}")]
  Empty(PathBuf),
}

/// 从图像文件读取帧
///
/// * `image:///path/a.jpg?rotation=90` 读取单张图像
/// * `folder:///path/dir?interval_ms=200` 按文件名顺序读取目录中的所有图像
///
/// 无法解码的文件记录错误后跳过。
#[derive(Debug)]
pub struct ImageInput {
  files: VecDeque<PathBuf>,
  rotation: Rotation,
  interval: Duration,
}

impl FromUrl for ImageInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let path = PathBuf::from(url.path());
    let files = match url.scheme() {
      IMAGE_SCHEME => VecDeque::from([path]),
      FOLDER_SCHEME => list_images(&path)?,
      other => {
        error!(
          "URI 方案不匹配: 期望 '{}' 或 '{}', 实际为 '{}'",
          IMAGE_SCHEME, FOLDER_SCHEME, other
        );
        return Err(InputError::SchemeMismatch(other.to_string()));
      }
    };

    let mut input = ImageInput {
      files,
      rotation: Rotation::default(),
      interval: Duration::ZERO,
    };

    for (key, value) in url.query_pairs() {
      let invalid = || InputError::InvalidParameter {
        key: key.to_string(),
        value: value.to_string(),
      };
      match &*key {
        "rotation" => {
          let degrees = value.parse::<i32>().map_err(|_| invalid())?;
          input.rotation = Rotation::from_degrees(degrees).ok_or_else(invalid)?;
        }
        "interval_ms" => {
          let millis = value.parse::<u64>().map_err(|_| invalid())?;
          input.interval = Duration::from_millis(millis);
        }
        _ => debug!("忽略未知参数: {}={}", key, value),
      }
    }

    Ok(input)
  }
}

impl ImageInput {
  pub fn rotation(&self) -> Rotation {
    self.rotation
  }

  /// 两帧之间的间隔
  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn remaining(&self) -> usize {
    self.files.len()
  }
}

impl Iterator for ImageInput {
  type Item = CapturedFrame;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(path) = self.files.pop_front() {
      match ImageReader::open(&path).and_then(|reader| reader.with_guessed_format()) {
        Ok(reader) => match reader.decode() {
          Ok(image) => {
            let timestamp = chrono::Utc::now().timestamp_millis();
            debug!("读取图像 {}，时间戳 {}", path.display(), timestamp);
            return Some(CapturedFrame::new(timestamp, image.into_rgb8(), self.rotation));
          }
          Err(e) => warn!("图像解码失败 {}: {}", path.display(), e),
        },
        Err(e) => warn!("无法打开图像 {}: {}", path.display(), e),
      }
    }
    None
  }
}

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
}

fn list_images(dir: &Path) -> Result<VecDeque<PathBuf>, InputError> {
  let mut files = Vec::new();
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_file() && is_image(&path) {
      files.push(path);
    }
  }
  if files.is_empty() {
    return Err(InputError::Empty(dir.to_path_buf()));
  }
  files.sort();
  debug!("目录 {} 中共 {} 张图像", dir.display(), files.len());
  Ok(files.into())
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let dir = std::env::temp_dir().join(format!(
      "shanan-input-{}-{}-{}",
      tag,
      std::process::id(),
      nanos
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb([10, 20, 30]))
      .save(&path)
      .unwrap();
    path
  }

  fn url_for(scheme: &str, path: &Path, query: &str) -> Url {
    let mut url = Url::parse(&format!("{}://{}", scheme, path.display())).unwrap();
    if !query.is_empty() {
      url.set_query(Some(query));
    }
    url
  }

  #[test]
  fn reads_single_image_with_rotation() {
    let dir = scratch_dir("single");
    let path = write_image(&dir, "a.png", 4, 2);

    let mut input = ImageInput::from_url(&url_for("image", &path, "rotation=90")).unwrap();
    assert_eq!(input.rotation(), Rotation::Deg90);
    let frame = input.next().unwrap();
    assert_eq!(frame.image.dimensions(), (4, 2));
    assert_eq!(frame.rotated_dimensions(), (2, 4));
    assert!(frame.timestamp > 0);
    assert!(input.next().is_none());

    std::fs::remove_dir_all(dir).ok();
  }

  #[test]
  fn folder_is_sorted_and_skips_broken_files() {
    let dir = scratch_dir("folder");
    write_image(&dir, "b.png", 3, 3);
    write_image(&dir, "a.png", 1, 1);
    std::fs::write(dir.join("c.png"), b"not an image").unwrap();
    std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

    let input = ImageInput::from_url(&url_for("folder", &dir, "interval_ms=25")).unwrap();
    assert_eq!(input.interval(), Duration::from_millis(25));
    assert_eq!(input.remaining(), 3);

    let sizes: Vec<_> = input.map(|frame| frame.image.dimensions()).collect();
    assert_eq!(sizes, vec![(1, 1), (3, 3)]);

    std::fs::remove_dir_all(dir).ok();
  }

  #[test]
  fn rejects_bad_parameters() {
    let dir = scratch_dir("params");
    let path = write_image(&dir, "a.png", 1, 1);

    let err = ImageInput::from_url(&url_for("image", &path, "rotation=45")).unwrap_err();
    assert!(matches!(err, InputError::InvalidParameter { .. }));

    let err = ImageInput::from_url(&url_for("video", &path, "")).unwrap_err();
    assert!(matches!(err, InputError::SchemeMismatch(_)));

    let empty = scratch_dir("empty");
    let err = ImageInput::from_url(&url_for("folder", &empty, "")).unwrap_err();
    assert!(matches!(err, InputError::Empty(_)));

    std::fs::remove_dir_all(dir).ok();
    std::fs::remove_dir_all(empty).ok();
  }
}
