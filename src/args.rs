// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Shanan 实时检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址
  /// - yolov5:///path/model.rknn?labels=classes.txt&threshold=0.5&max_results=5
  /// - yolo26:///path/model.rknn?compute=npu
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 输入来源
  /// - image:///path/a.jpg?rotation=90
  /// - folder:///path/dir?interval_ms=100
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 检测结果输出文件（JSON Lines），默认输出到标准输出
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,

  /// 没有订阅者后保持模型加载的时间（毫秒）
  #[arg(long, default_value = "5000", value_name = "MILLIS")]
  pub idle_timeout_ms: u64,

  /// 设备支持 GPU 委托
  #[arg(long)]
  pub gpu: bool,

  /// 推理线程数
  #[arg(long, default_value = "2", value_name = "COUNT")]
  pub num_threads: usize,

  /// 最多提交的帧数
  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}
