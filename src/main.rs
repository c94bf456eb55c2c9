// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 实时检测主程序
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

mod args;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shanan_live::{
  BackendSpec, ComputeSettings, DetectionPipeline, DetectionResult, FromUrl, PipelineConfig,
  engine::rknn::{RknnTensorLoader, Yolo26Loader},
  input::ImageInput,
};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

fn result_json(result: &DetectionResult) -> serde_json::Value {
  let objects: Vec<_> = result
    .detected_objects
    .iter()
    .map(|object| {
      json!({
        "label": object.label,
        "confidence": object.confidence,
        "bbox": [
          object.bbox.left,
          object.bbox.top,
          object.bbox.right,
          object.bbox.bottom,
        ],
      })
    })
    .collect();
  json!({
    "width": result.image_width,
    "height": result.image_height,
    "objects": objects,
  })
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = args::Args::parse();

  info!("模型地址: {}", args.model);
  info!("输入来源: {}", args.input);

  let spec = BackendSpec::from_url(&args.model)?;
  let input = ImageInput::from_url(&args.input)?;
  let interval = input.interval();
  let compute = ComputeSettings::new(args.gpu).num_threads(args.num_threads);
  let config = PipelineConfig {
    idle_timeout: Duration::from_millis(args.idle_timeout_ms),
  };

  let mut pipeline = DetectionPipeline::spawn(config, move || {
    spec.build(RknnTensorLoader, Yolo26Loader, compute)
  })?;

  let mut sink: Box<dyn Write + Send> = match &args.output {
    Some(path) => Box::new(BufWriter::new(File::create(path)?)),
    None => Box::new(io::stdout()),
  };
  let subscription = pipeline.subscribe()?;
  let printer = thread::Builder::new()
    .name("shanan-printer".to_string())
    .spawn(move || -> io::Result<()> {
      while let Some(result) = subscription.recv() {
        writeln!(sink, "{}", result_json(&result))?;
        sink.flush()?;
      }
      Ok(())
    })?;

  let (tx, rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(());
  })?;

  let mut frame_index = 0;
  for frame in input {
    frame_index += 1;
    info!("提交第 {} 帧图像，时间戳 {}", frame_index, frame.timestamp);
    pipeline.submit(frame)?;

    if args.frame_number.is_some_and(|n| frame_index >= n) {
      info!("达到指定帧数 {}, 停止提交", frame_index);
      break;
    }
    if rx.recv_timeout(interval).is_ok() {
      warn!("中断信号接收，停止提交");
      break;
    }
  }

  if !pipeline.settle(SETTLE_TIMEOUT) {
    warn!("等待检测完成超时");
  }
  let stats = pipeline.stats();
  info!(
    "提交 {} 帧，合并 {} 帧，检测 {} 次，失败 {} 次",
    stats.submitted, stats.coalesced, stats.detected, stats.failed
  );
  pipeline.stop();

  printer
    .join()
    .map_err(|_| anyhow!("输出线程异常退出"))??;

  info!("任务完成，退出");
  Ok(())
}
