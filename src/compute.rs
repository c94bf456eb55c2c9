// 该文件是 Shanan （山南西风） 项目的一部分。
// src/compute.rs - 计算后端选择
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

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_NUM_THREADS: usize = 2;

/// 请求的推理硬件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeTarget {
  Cpu,
  Gpu,
  #[default]
  Accelerator,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("未知的计算后端: {0}")]
pub struct ParseComputeTargetError(String);

impl FromStr for ComputeTarget {
  type Err = ParseComputeTargetError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "cpu" => Ok(ComputeTarget::Cpu),
      "gpu" => Ok(ComputeTarget::Gpu),
      "accelerator" | "npu" | "nnapi" => Ok(ComputeTarget::Accelerator),
      _ => Err(ParseComputeTargetError(s.to_string())),
    }
  }
}

impl fmt::Display for ComputeTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ComputeTarget::Cpu => write!(f, "cpu"),
      ComputeTarget::Gpu => write!(f, "gpu"),
      ComputeTarget::Accelerator => write!(f, "accelerator"),
    }
  }
}

/// 引擎实际使用的委托
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delegate {
  #[default]
  Cpu,
  Gpu,
  Accelerator,
}

/// 引擎配置
///
/// `thread_bound` 为真时，引擎只能在执行 `setup` 的线程上调用 `detect`；
/// GPU 委托不能跨线程转移。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
  pub delegate: Delegate,
  pub num_threads: usize,
  pub thread_bound: bool,
}

impl Default for EngineOptions {
  fn default() -> Self {
    Self {
      delegate: Delegate::Cpu,
      num_threads: DEFAULT_NUM_THREADS,
      thread_bound: false,
    }
  }
}

/// 运行时能力探测
pub trait CapabilityProbe {
  fn gpu_supported(&self) -> bool;
}

/// 不支持 GPU 的设备
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGpu;

impl CapabilityProbe for NoGpu {
  fn gpu_supported(&self) -> bool {
    false
  }
}

// 固定结果，常用于命令行参数或测试
impl CapabilityProbe for bool {
  fn gpu_supported(&self) -> bool {
    *self
  }
}

#[derive(Clone)]
pub struct ComputeSettings {
  probe: Arc<dyn CapabilityProbe + Send + Sync>,
  num_threads: usize,
}

impl fmt::Debug for ComputeSettings {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ComputeSettings")
      .field("num_threads", &self.num_threads)
      .finish_non_exhaustive()
  }
}

impl Default for ComputeSettings {
  fn default() -> Self {
    Self::new(NoGpu)
  }
}

impl ComputeSettings {
  pub fn new(probe: impl CapabilityProbe + Send + Sync + 'static) -> Self {
    Self {
      probe: Arc::new(probe),
      num_threads: DEFAULT_NUM_THREADS,
    }
  }

  pub fn num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads.max(1);
    self
  }

  /// 由目标生成引擎配置
  pub fn resolve(&self, target: ComputeTarget) -> EngineOptions {
    let mut options = EngineOptions {
      num_threads: self.num_threads,
      ..EngineOptions::default()
    };
    self.apply(&mut options, target);
    options
  }

  /// 在已有配置上应用目标
  ///
  /// GPU 不可用时记录警告并保持原配置不变，不会返回错误。
  pub fn apply(&self, options: &mut EngineOptions, target: ComputeTarget) {
    match target {
      ComputeTarget::Cpu => {}
      ComputeTarget::Gpu => {
        if self.probe.gpu_supported() {
          options.delegate = Delegate::Gpu;
          options.thread_bound = true;
        } else {
          warn!("当前设备不支持 GPU 委托，回退到默认配置");
        }
      }
      ComputeTarget::Accelerator => {
        options.delegate = Delegate::Accelerator;
      }
    }
    debug!("计算目标 {} -> {:?}", target, options);
  }
}
