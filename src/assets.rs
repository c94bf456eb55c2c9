// 该文件是 Shanan （山南西风） 项目的一部分。
// src/assets.rs - 模型与标签资源
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

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::labels::Labels;

#[derive(Error, Debug)]
pub enum AssetError {
  #[error("资源 {name} 读取失败: {source}")]
  Io {
    name: String,
    #[source]
    source: io::Error,
  },
  #[error("资源 {0} 不是有效的 UTF-8 文本")]
  Encoding(String),
  #[error("资源名无效: {0}")]
  InvalidName(String),
}

impl AssetError {
  fn io(name: &str, source: io::Error) -> Self {
    AssetError::Io {
      name: name.to_string(),
      source,
    }
  }
}

/// 随程序分发的资源目录，以及可直接按路径访问的缓存目录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStore {
  bundle_dir: PathBuf,
  cache_dir: PathBuf,
}

impl AssetStore {
  pub fn new(bundle_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
    Self {
      bundle_dir: bundle_dir.into(),
      cache_dir: cache_dir.into(),
    }
  }

  pub fn bundle_dir(&self) -> &Path {
    &self.bundle_dir
  }

  pub fn cache_dir(&self) -> &Path {
    &self.cache_dir
  }

  /// 返回资源在缓存目录中的路径
  ///
  /// 首次使用时从资源目录复制；缓存文件存在且非空时直接复用。
  pub fn asset_file_path(&self, name: &str) -> Result<PathBuf, AssetError> {
    let file_name = Path::new(name)
      .file_name()
      .ok_or_else(|| AssetError::InvalidName(name.to_string()))?;
    let cached = self.cache_dir.join(file_name);

    if fs::metadata(&cached).is_ok_and(|meta| meta.is_file() && meta.len() > 0) {
      debug!("使用缓存资源: {}", cached.display());
      return Ok(cached);
    }

    let source = self.bundle_dir.join(name);
    if source == cached {
      return Err(AssetError::io(
        name,
        io::Error::new(io::ErrorKind::NotFound, "缓存资源为空或不存在"),
      ));
    }

    info!("复制资源 {} 到 {}", source.display(), cached.display());
    fs::create_dir_all(&self.cache_dir).map_err(|e| AssetError::io(name, e))?;
    // 缓存目录中只出现完整的文件
    let partial = self.cache_dir.join(format!(
      ".{}.{}.part",
      file_name.to_string_lossy(),
      std::process::id()
    ));
    let copied = copy_file(&source, &partial).map_err(|e| {
      let _ = fs::remove_file(&partial);
      AssetError::io(name, e)
    })?;
    fs::rename(&partial, &cached).map_err(|e| AssetError::io(name, e))?;
    debug!(
      "资源复制完成: {:.2} MB",
      copied as f64 / (1024.0 * 1024.0)
    );

    Ok(cached)
  }

  /// 读取换行分隔的标签文件
  pub fn read_labels(&self, name: &str) -> Result<Labels, AssetError> {
    let path = self.bundle_dir.join(name);
    let bytes = fs::read(&path).map_err(|e| AssetError::io(name, e))?;
    let text = String::from_utf8(bytes).map_err(|_| AssetError::Encoding(name.to_string()))?;
    let labels = Labels::parse(&text);
    debug!("读取到 {} 个标签: {}", labels.len(), path.display());
    Ok(labels)
  }
}

fn copy_file(source: &Path, target: &Path) -> io::Result<u64> {
  let mut input = File::open(source)?;
  let mut output = File::create(target)?;
  let copied = io::copy(&mut input, &mut output)?;
  output.flush()?;
  output.sync_all()?;
  Ok(copied)
}
