// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别标签
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

/// 无法解析类别时使用的标签
pub const UNKNOWN_LABEL: &str = "unknown";

/// 按索引查找标签，越界或标签表为空时返回 [`UNKNOWN_LABEL`]
pub fn resolve_label<S: AsRef<str>>(class_index: i64, labels: &[S]) -> &str {
  usize::try_from(class_index)
    .ok()
    .and_then(|index| labels.get(index))
    .map_or(UNKNOWN_LABEL, |label| label.as_ref())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
  names: Vec<String>,
}

impl Labels {
  /// 按 `\n` 切分标签文件
  ///
  /// 每一项保持原样不做裁剪，仅丢弃文件末尾换行产生的那一个空项。
  pub fn parse(text: &str) -> Self {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() {
      return Self::default();
    }
    Self {
      names: body.split('\n').map(str::to_owned).collect(),
    }
  }

  pub fn resolve(&self, class_index: usize) -> &str {
    self
      .names
      .get(class_index)
      .map_or(UNKNOWN_LABEL, String::as_str)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn names(&self) -> &[String] {
    &self.names
  }
}

impl From<Vec<String>> for Labels {
  fn from(names: Vec<String>) -> Self {
    Self { names }
  }
}

impl<'a> FromIterator<&'a str> for Labels {
  fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
    Self {
      names: iter.into_iter().map(str::to_owned).collect(),
    }
  }
}
