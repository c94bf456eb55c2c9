// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 检测流水线
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

//! 单槽邮箱 + 推理线程 + 广播。
//!
//! 新帧覆盖尚未处理的旧帧，推理线程每次取走最新的一帧；正在进行的推理不会被中断。
//! 所有订阅者共享同一个结果槽，每个订阅只记录自己读到的版本号，
//! 读取慢的订阅者只会看到最新的结果，不会积压。最后一个订阅者离开后，
//! 流水线在 `idle_timeout` 内继续工作，超时后释放模型并停止处理，
//! 直到再次有人订阅。
//!
//! 模型只在有订阅者时加载：在第一次订阅之前提交的帧留在邮箱中，
//! 不会触发加载，也不会被处理，直到有人订阅。

use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::CapturedFrame,
  model::{DetectionResult, Detector},
};

const WORKER_NAME: &str = "shanan-detect";
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 没有订阅者后继续运行的时间
  pub idle_timeout: Duration,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  /// 尚无可用结果，也没有排队的帧
  Idle,
  /// 有帧在邮箱中等待
  Pending,
  /// 正在推理
  Detecting,
  /// 已发布结果，邮箱为空
  Published,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
  /// 提交的帧数
  pub submitted: u64,
  /// 被新帧覆盖而丢弃的帧数
  pub coalesced: u64,
  /// 成功发布的结果数
  pub detected: u64,
  /// 推理失败次数
  pub failed: u64,
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("检测流水线已停止")]
  Stopped,
  #[error("无法启动推理线程: {0}")]
  WorkerSpawn(#[from] std::io::Error),
}

struct Inner {
  state: PipelineState,
  pending: Option<CapturedFrame>,
  latest: DetectionResult,
  /// 每发布一次结果加一
  generation: u64,
  subscribers: Vec<u64>,
  next_subscriber: u64,
  /// 最后一个订阅者离开后开始计时
  idle_deadline: Option<Instant>,
  /// 推理线程已加载模型并在处理帧
  hot: bool,
  stopped: bool,
  stats: PipelineStats,
}

impl Inner {
  fn settled_state(&self) -> PipelineState {
    if self.pending.is_some() {
      PipelineState::Pending
    } else if self.stats.detected > 0 {
      PipelineState::Published
    } else {
      PipelineState::Idle
    }
  }

  fn is_settled(&self) -> bool {
    self.pending.is_none() && self.state != PipelineState::Detecting
  }
}

struct Shared {
  inner: Mutex<Inner>,
  signal: Condvar,
  config: PipelineConfig,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
    self
      .signal
      .wait(guard)
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn wait_timeout<'a>(
    &self,
    guard: MutexGuard<'a, Inner>,
    timeout: Duration,
  ) -> MutexGuard<'a, Inner> {
    self
      .signal
      .wait_timeout(guard, timeout)
      .unwrap_or_else(PoisonError::into_inner)
      .0
  }

  fn unsubscribe(&self, id: u64) {
    let mut inner = self.lock();
    inner.subscribers.retain(|subscriber| *subscriber != id);
    if inner.subscribers.is_empty() && !inner.stopped {
      debug!("最后一个订阅者已离开，{:?} 后释放模型", self.config.idle_timeout);
      inner.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
    }
    self.signal.notify_all();
  }
}

/// 检测流水线
///
/// 检测器在推理线程内构造，`setup`、`detect` 与 `cleanup` 都在同一线程执行。
pub struct DetectionPipeline {
  shared: Arc<Shared>,
  worker: Option<JoinHandle<()>>,
}

impl DetectionPipeline {
  pub fn spawn<D, F>(config: PipelineConfig, make_detector: F) -> Result<Self, PipelineError>
  where
    D: Detector + 'static,
    F: FnOnce() -> D + Send + 'static,
  {
    let shared = Arc::new(Shared {
      inner: Mutex::new(Inner {
        state: PipelineState::Idle,
        pending: None,
        latest: DetectionResult::default(),
        generation: 0,
        subscribers: Vec::new(),
        next_subscriber: 0,
        idle_deadline: None,
        hot: false,
        stopped: false,
        stats: PipelineStats::default(),
      }),
      signal: Condvar::new(),
      config,
    });

    let worker_shared = Arc::clone(&shared);
    let worker = thread::Builder::new()
      .name(WORKER_NAME.to_string())
      .spawn(move || {
        let detector = make_detector();
        Worker {
          shared: worker_shared,
          detector,
        }
        .run();
      })?;

    Ok(Self {
      shared,
      worker: Some(worker),
    })
  }

  /// 提交一帧，覆盖尚未开始处理的旧帧
  pub fn submit(&self, frame: CapturedFrame) -> Result<(), PipelineError> {
    let mut inner = self.shared.lock();
    if inner.stopped {
      warn!("流水线已停止，丢弃帧 {}", frame.timestamp);
      return Err(PipelineError::Stopped);
    }

    inner.stats.submitted += 1;
    let timestamp = frame.timestamp;
    if let Some(stale) = inner.pending.replace(frame) {
      inner.stats.coalesced += 1;
      debug!("帧 {} 被帧 {} 覆盖", stale.timestamp, timestamp);
    }
    if inner.state != PipelineState::Detecting {
      inner.state = PipelineState::Pending;
    }
    self.shared.signal.notify_all();
    Ok(())
  }

  /// 订阅检测结果，订阅后第一次读取立即得到当前结果
  pub fn subscribe(&self) -> Result<Subscription, PipelineError> {
    let mut inner = self.shared.lock();
    if inner.stopped {
      return Err(PipelineError::Stopped);
    }

    let id = inner.next_subscriber;
    inner.next_subscriber += 1;
    inner.subscribers.push(id);
    inner.idle_deadline = None;
    debug!("新增订阅者 {}，当前共 {} 个", id, inner.subscribers.len());
    self.shared.signal.notify_all();

    Ok(Subscription {
      id,
      seen: Cell::new(None),
      shared: Arc::clone(&self.shared),
    })
  }

  /// 最近一次完成的检测结果
  pub fn latest(&self) -> DetectionResult {
    self.shared.lock().latest.clone()
  }

  pub fn state(&self) -> PipelineState {
    self.shared.lock().state
  }

  pub fn stats(&self) -> PipelineStats {
    self.shared.lock().stats
  }

  pub fn subscriber_count(&self) -> usize {
    self.shared.lock().subscribers.len()
  }

  /// 推理线程是否处于工作状态（已加载模型）
  pub fn is_hot(&self) -> bool {
    self.shared.lock().hot
  }

  /// 等待邮箱清空且没有正在进行的推理，超时返回 `false`
  pub fn settle(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut inner = self.shared.lock();
    while !inner.is_settled() {
      let now = Instant::now();
      if now >= deadline || inner.stopped {
        return inner.is_settled();
      }
      inner = self.shared.wait_timeout(inner, deadline - now);
    }
    true
  }

  /// 停止流水线并释放模型，可重复调用
  pub fn stop(&mut self) {
    {
      let mut inner = self.shared.lock();
      if !inner.stopped {
        info!("停止检测流水线");
      }
      inner.stopped = true;
      inner.pending = None;
      inner.subscribers.clear();
      self.shared.signal.notify_all();
    }
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        error!("推理线程异常退出");
      }
    }
  }
}

impl Drop for DetectionPipeline {
  fn drop(&mut self) {
    self.stop();
  }
}

/// 检测结果订阅，销毁时自动退订
///
/// 只保留最新一个未读结果，中间被新结果覆盖的不会再交付。
pub struct Subscription {
  id: u64,
  /// 已读到的结果版本，`None` 表示尚未读取
  seen: Cell<Option<u64>>,
  shared: Arc<Shared>,
}

impl Subscription {
  fn take_unseen(&self, inner: &Inner) -> Option<DetectionResult> {
    if self.seen.get() == Some(inner.generation) {
      return None;
    }
    self.seen.set(Some(inner.generation));
    Some(inner.latest.clone())
  }

  /// 阻塞等待最新的未读结果，流水线停止后返回 `None`
  pub fn recv(&self) -> Option<DetectionResult> {
    let mut inner = self.shared.lock();
    loop {
      if let Some(result) = self.take_unseen(&inner) {
        return Some(result);
      }
      if inner.stopped {
        return None;
      }
      inner = self.shared.wait(inner);
    }
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Option<DetectionResult> {
    let deadline = Instant::now() + timeout;
    let mut inner = self.shared.lock();
    loop {
      if let Some(result) = self.take_unseen(&inner) {
        return Some(result);
      }
      let now = Instant::now();
      if inner.stopped || now >= deadline {
        return None;
      }
      inner = self.shared.wait_timeout(inner, deadline - now);
    }
  }

  /// 最新的未读结果，不阻塞
  pub fn latest(&self) -> Option<DetectionResult> {
    self.take_unseen(&self.shared.lock())
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.shared.unsubscribe(self.id);
  }
}

enum Step {
  Warmup,
  Detect(CapturedFrame),
  Teardown,
  Stop,
}

struct Worker<D> {
  shared: Arc<Shared>,
  detector: D,
}

impl<D: Detector> Worker<D> {
  fn run(mut self) {
    info!("推理线程已启动，检测器: {}", self.detector.name());
    loop {
      match self.next_step() {
        Step::Warmup => {
          let target = self.detector.compute_target();
          info!("加载检测模型，计算目标: {}", target);
          if let Err(e) = self.detector.setup(target) {
            error!("模型加载失败: {}", e);
          }
        }
        Step::Detect(frame) => self.detect(frame),
        Step::Teardown => {
          info!("订阅者空闲超时，释放检测模型");
          self.detector.cleanup();
        }
        Step::Stop => {
          self.detector.cleanup();
          break;
        }
      }
    }
    info!("推理线程退出");
  }

  fn next_step(&self) -> Step {
    let mut inner = self.shared.lock();
    loop {
      if inner.stopped {
        return Step::Stop;
      }

      let now = Instant::now();
      let subscribed = !inner.subscribers.is_empty();
      let lingering = inner.idle_deadline.is_some_and(|deadline| now < deadline);

      if subscribed || lingering {
        if !inner.hot {
          inner.hot = true;
          return Step::Warmup;
        }
        if let Some(frame) = inner.pending.take() {
          inner.state = PipelineState::Detecting;
          return Step::Detect(frame);
        }
      } else {
        inner.idle_deadline = None;
        if inner.hot {
          inner.hot = false;
          return Step::Teardown;
        }
      }

      inner = match inner.idle_deadline {
        Some(deadline) => {
          let timeout = deadline.saturating_duration_since(now);
          self.shared.wait_timeout(inner, timeout)
        }
        None => self.shared.wait(inner),
      };
    }
  }

  fn detect(&mut self, frame: CapturedFrame) {
    let now = Instant::now();
    let outcome = self.detector.detect(&frame);
    let elapsed = now.elapsed();

    let mut inner = self.shared.lock();
    match outcome {
      Ok(result) => {
        info!(
          "帧 {} 检测完成，耗时: {:.2?}，{} 个物体",
          frame.timestamp,
          elapsed,
          result.len()
        );
        inner.stats.detected += 1;
        inner.generation += 1;
        inner.latest = result;
      }
      Err(e) => {
        error!("帧 {} 检测失败: {}", frame.timestamp, e);
        inner.stats.failed += 1;
      }
    }
    inner.state = inner.settled_state();
    self.shared.signal.notify_all();
  }
}
