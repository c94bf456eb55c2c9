// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/backend.rs - 检测后端测试
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

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use image::RgbImage;
use shanan_live::{
  BackendSpec, BoundingBox, CapturedFrame, ComputeSettings, ComputeTarget, DecodedBackend,
  DetectError, DetectionResult, Detector, EngineOptions, FromUrl, Rotation, SetupError,
  TensorBackend,
  assets::AssetStore,
  backend::{DecodedBackendConfig, ModelAssets, TensorBackendConfig, TensorModelConfig},
  compute::Delegate,
  decode::DecoderConfig,
  engine::{DecodedEngine, DecodedItem, EngineError, TensorEngine},
  frame::{InputFormat, ModelInput},
  labels::UNKNOWN_LABEL,
};
use url::Url;

fn scratch_dir(tag: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!(
    "shanan-backend-{}-{}-{}",
    tag,
    std::process::id(),
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
  ));
  fs::create_dir_all(&dir).unwrap();
  dir
}

/// 资源目录中放置模型文件与两个类别的标签文件
fn model_assets(tag: &str) -> (ModelAssets, PathBuf) {
  let root = scratch_dir(tag);
  let bundle = root.join("bundle");
  fs::create_dir_all(&bundle).unwrap();
  fs::write(bundle.join("model.bin"), b"weights").unwrap();
  fs::write(bundle.join("classes.txt"), "person\nbicycle\n").unwrap();
  let store = AssetStore::new(&bundle, root.join("cache"));
  (ModelAssets::new(store, "model.bin", "classes.txt"), root)
}

struct FixedTensor {
  output: Vec<f32>,
  inputs: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl TensorEngine for FixedTensor {
  fn input_format(&self) -> InputFormat {
    InputFormat::Float32Nchw
  }

  fn forward(&self, input: &ModelInput) -> Result<Vec<f32>, EngineError> {
    self.inputs.lock().unwrap().push(input.dimensions());
    Ok(self.output.clone())
  }
}

struct TensorFixture {
  backend: TensorBackend<Box<dyn Fn(&Path, &EngineOptions) -> Result<FixedTensor, EngineError>>>,
  loads: Arc<AtomicUsize>,
  inputs: Arc<Mutex<Vec<(u32, u32)>>>,
  root: PathBuf,
}

/// 64x64 输入，`columns - 5` 个类别
fn tensor_fixture(tag: &str, output: Vec<f32>, rows: usize, columns: usize) -> TensorFixture {
  let (assets, root) = model_assets(tag);
  let mut config = TensorBackendConfig::new(assets);
  config.model = TensorModelConfig {
    input_width: 64,
    input_height: 64,
    output_rows: rows,
    output_columns: columns,
    ..TensorModelConfig::default()
  };
  config.compute_target = ComputeTarget::Cpu;

  let loads = Arc::new(AtomicUsize::new(0));
  let inputs = Arc::new(Mutex::new(Vec::new()));
  let loader_loads = Arc::clone(&loads);
  let loader_inputs = Arc::clone(&inputs);
  let loader: Box<dyn Fn(&Path, &EngineOptions) -> Result<FixedTensor, EngineError>> =
    Box::new(move |model: &Path, _: &EngineOptions| {
      assert!(model.exists());
      loader_loads.fetch_add(1, Ordering::SeqCst);
      Ok(FixedTensor {
        output: output.clone(),
        inputs: Arc::clone(&loader_inputs),
      })
    });

  TensorFixture {
    backend: TensorBackend::new(config, loader, ComputeSettings::default()),
    loads,
    inputs,
    root,
  }
}

fn frame(width: u32, height: u32, rotation: Rotation) -> CapturedFrame {
  CapturedFrame::new(42, RgbImage::new(width, height), rotation)
}

fn assert_box(actual: BoundingBox, expected: [f32; 4]) {
  let actual = [actual.left, actual.top, actual.right, actual.bottom];
  for (a, e) in actual.iter().zip(expected) {
    assert!((a - e).abs() < 1e-4, "{:?} != {:?}", actual, expected);
  }
}

#[test]
fn tensor_backend_decodes_and_suppresses() {
  let output = vec![
    100.0, 100.0, 50.0, 50.0, 0.9, 0.8, 0.1, //
    102.0, 101.0, 50.0, 50.0, 0.85, 0.8, 0.1,
  ];
  let mut f = tensor_fixture("e2e", output, 2, 7);

  let result = f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  assert_eq!(result.len(), 1);
  let object = &result.detected_objects[0];
  assert_eq!(object.label, "person");
  assert_eq!(object.confidence, 0.9);
  assert_box(object.bbox, [75.0, 75.0, 125.0, 125.0]);
  assert_eq!((result.image_width, result.image_height), (64, 64));

  // 模型先复制到缓存目录再加载
  assert!(f.root.join("cache").join("model.bin").exists());
  assert_eq!(f.inputs.lock().unwrap().as_slice(), &[(64, 64)]);

  fs::remove_dir_all(&f.root).ok();
}

#[test]
fn out_of_range_class_resolves_to_unknown() {
  let output = vec![10.0, 10.0, 4.0, 4.0, 0.9, 0.1, 0.2, 0.7];
  let mut f = tensor_fixture("unknown", output, 1, 8);

  let result = f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  assert_eq!(result.detected_objects[0].label, UNKNOWN_LABEL);

  fs::remove_dir_all(&f.root).ok();
}

#[test]
fn boxes_follow_rotated_frame() {
  let output = vec![32.0, 32.0, 10.0, 10.0, 0.9, 0.1, 0.8];
  let mut f = tensor_fixture("rotation", output, 1, 7);

  // 32x64 顺时针旋转 90 度后为 64x32
  let result = f.backend.detect(&frame(32, 64, Rotation::Deg90)).unwrap();
  assert_eq!((result.image_width, result.image_height), (64, 32));
  let object = &result.detected_objects[0];
  assert_eq!(object.label, "bicycle");
  assert_box(object.bbox, [27.0, 13.5, 37.0, 18.5]);

  fs::remove_dir_all(&f.root).ok();
}

#[test]
fn malformed_tensor_fails_detection() {
  let mut f = tensor_fixture("malformed", vec![1.0; 5], 2, 7);
  let err = f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap_err();
  assert!(matches!(err, DetectError::Decode(_)));
  assert!(f.backend.is_ready());

  fs::remove_dir_all(&f.root).ok();
}

#[test]
fn results_are_capped_by_max_results() {
  let output = vec![
    5.0, 5.0, 4.0, 4.0, 0.6, 1.0, 0.0, //
    20.0, 20.0, 4.0, 4.0, 0.9, 1.0, 0.0, //
    35.0, 35.0, 4.0, 4.0, 0.7, 0.0, 1.0, //
    50.0, 50.0, 4.0, 4.0, 0.8, 0.0, 1.0,
  ];
  let (assets, root) = model_assets("max");
  let mut config = TensorBackendConfig::new(assets);
  config.model = TensorModelConfig {
    input_width: 64,
    input_height: 64,
    output_rows: 4,
    output_columns: 7,
    ..TensorModelConfig::default()
  };
  config.decoder = DecoderConfig::default().nms_limit(10);
  config.max_results = 2;
  let loader = move |_: &Path, _: &EngineOptions| -> Result<FixedTensor, EngineError> {
    Ok(FixedTensor {
      output: output.clone(),
      inputs: Arc::default(),
    })
  };
  let mut backend = TensorBackend::new(config, loader, ComputeSettings::default());

  let result = backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  let scores: Vec<f32> = result
    .detected_objects
    .iter()
    .map(|object| object.confidence)
    .collect();
  assert_eq!(scores, [0.9f32, 0.8]);

  fs::remove_dir_all(root).ok();
}

#[test]
fn cleanup_is_followed_by_lazy_setup() {
  let mut f = tensor_fixture("lazy", vec![0.0; 7], 1, 7);
  assert!(!f.backend.is_ready());

  f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  assert_eq!(f.loads.load(Ordering::SeqCst), 1);
  f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  assert_eq!(f.loads.load(Ordering::SeqCst), 1);

  f.backend.cleanup();
  assert!(!f.backend.is_ready());
  let result = f.backend.detect(&frame(64, 64, Rotation::Deg0)).unwrap();
  assert!(result.is_empty());
  assert_eq!(f.loads.load(Ordering::SeqCst), 2);

  fs::remove_dir_all(&f.root).ok();
}

type TensorLoaderFn = fn(&Path, &EngineOptions) -> Result<FixedTensor, EngineError>;

fn empty_tensor(_: &Path, _: &EngineOptions) -> Result<FixedTensor, EngineError> {
  Ok(FixedTensor {
    output: vec![0.0; 7],
    inputs: Arc::new(Mutex::new(Vec::new())),
  })
}

/// 可以跨线程移动的张量后端，只返回空输出
fn movable_tensor_backend(
  tag: &str,
  compute: ComputeSettings,
) -> (TensorBackend<TensorLoaderFn>, PathBuf) {
  let (assets, root) = model_assets(tag);
  let mut config = TensorBackendConfig::new(assets);
  config.model = TensorModelConfig {
    input_width: 64,
    input_height: 64,
    output_rows: 1,
    output_columns: 7,
    ..TensorModelConfig::default()
  };
  let loader: TensorLoaderFn = empty_tensor;
  (TensorBackend::new(config, loader, compute), root)
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "GPU 委托的引擎必须在执行 setup 的线程上推理")]
fn gpu_engine_panics_when_detecting_on_another_thread() {
  let (mut backend, root) = movable_tensor_backend("gpu-thread", ComputeSettings::new(true));
  backend.setup(ComputeTarget::Gpu).unwrap();
  fs::remove_dir_all(&root).ok();

  let outcome = thread::spawn(move || backend.detect(&frame(64, 64, Rotation::Deg0))).join();
  if let Err(panic) = outcome {
    std::panic::resume_unwind(panic);
  }
}

#[test]
fn cpu_engine_can_detect_on_another_thread() {
  let (mut backend, root) = movable_tensor_backend("cpu-thread", ComputeSettings::new(true));
  backend.setup(ComputeTarget::Cpu).unwrap();

  let result = thread::spawn(move || backend.detect(&frame(64, 64, Rotation::Deg0)))
    .join()
    .unwrap()
    .unwrap();
  assert!(result.is_empty());
  assert_eq!((result.image_width, result.image_height), (64, 64));

  fs::remove_dir_all(&root).ok();
}

#[test]
fn missing_labels_yield_empty_results() {
  let (assets, root) = model_assets("labels");
  let assets = ModelAssets::new(assets.store, "model.bin", "missing.txt");
  let loader = |_: &Path, _: &EngineOptions| -> Result<FixedTensor, EngineError> {
    panic!("标签缺失时不应加载模型")
  };
  let mut backend = TensorBackend::new(
    TensorBackendConfig::new(assets),
    loader,
    ComputeSettings::default(),
  );

  let err = backend.setup(ComputeTarget::Cpu).unwrap_err();
  assert!(matches!(err, SetupError::Asset(_)));

  let result = backend.detect(&frame(8, 6, Rotation::Deg270)).unwrap();
  assert_eq!(result, DetectionResult::empty(6, 8));
  assert!(!backend.is_ready());

  fs::remove_dir_all(root).ok();
}

#[test]
fn engine_load_failure_is_a_setup_error() {
  let (assets, root) = model_assets("engine");
  let loader = |_: &Path, _: &EngineOptions| -> Result<FixedTensor, EngineError> {
    Err(EngineError::invalid("模型损坏"))
  };
  let mut backend = TensorBackend::new(
    TensorBackendConfig::new(assets),
    loader,
    ComputeSettings::default(),
  );

  assert!(matches!(
    backend.setup(ComputeTarget::Accelerator),
    Err(SetupError::Engine(_))
  ));
  assert!(backend.detect(&frame(4, 4, Rotation::Deg0)).unwrap().is_empty());

  fs::remove_dir_all(root).ok();
}

#[test]
fn compute_target_selects_engine_options() {
  let (assets, root) = model_assets("compute");
  let seen = Arc::new(Mutex::new(Vec::new()));
  let loader_seen = Arc::clone(&seen);
  let loader = move |_: &Path, options: &EngineOptions| -> Result<FixedTensor, EngineError> {
    loader_seen.lock().unwrap().push(options.clone());
    Ok(FixedTensor {
      output: Vec::new(),
      inputs: Arc::default(),
    })
  };

  let mut unsupported = TensorBackend::new(
    TensorBackendConfig::new(assets.clone()),
    &loader,
    ComputeSettings::default(),
  );
  unsupported.setup(ComputeTarget::Gpu).unwrap();
  assert_eq!(unsupported.compute_target(), ComputeTarget::Gpu);

  let mut supported = TensorBackend::new(
    TensorBackendConfig::new(assets.clone()),
    &loader,
    ComputeSettings::new(true),
  );
  supported.setup(ComputeTarget::Gpu).unwrap();
  supported.setup(ComputeTarget::Accelerator).unwrap();

  let seen = seen.lock().unwrap();
  assert_eq!(seen[0].delegate, Delegate::Cpu);
  assert!(!seen[0].thread_bound);
  assert_eq!(seen[1].delegate, Delegate::Gpu);
  assert!(seen[1].thread_bound);
  assert_eq!(seen[2].delegate, Delegate::Accelerator);

  fs::remove_dir_all(root).ok();
}

struct FixedItems(Vec<DecodedItem>);

impl DecodedEngine for FixedItems {
  fn detect(&self, _image: &RgbImage) -> Result<Vec<DecodedItem>, EngineError> {
    Ok(self.0.clone())
  }
}

fn item(class_index: usize, score: f32, bbox: [f32; 4]) -> DecodedItem {
  DecodedItem {
    class_index,
    score,
    bbox: bbox.into(),
  }
}

#[test]
fn decoded_backend_scales_and_filters() {
  let (assets, root) = model_assets("decoded");
  let items = vec![
    item(1, 0.4, [0.0, 0.0, 1.0, 1.0]),
    item(1, 0.7, [0.5, 0.5, 1.0, 1.0]),
    item(0, 0.9, [0.1, 0.2, 0.5, 0.6]),
  ];
  let loader = move |_: &Path, _: &EngineOptions| -> Result<FixedItems, EngineError> {
    Ok(FixedItems(items.clone()))
  };
  let mut backend = DecodedBackend::new(
    DecodedBackendConfig::new(assets),
    loader,
    ComputeSettings::default(),
  );

  let result = backend.detect(&frame(200, 100, Rotation::Deg0)).unwrap();
  let labels: Vec<_> = result
    .detected_objects
    .iter()
    .map(|object| object.label.as_str())
    .collect();
  assert_eq!(labels, ["person", "bicycle"]);
  assert_box(result.detected_objects[0].bbox, [20.0, 20.0, 100.0, 60.0]);
  assert_box(result.detected_objects[1].bbox, [100.0, 50.0, 200.0, 100.0]);

  fs::remove_dir_all(root).ok();
}

#[test]
fn decoded_backend_keeps_top_three() {
  let (assets, root) = model_assets("decoded-max");
  let items: Vec<_> = [0.55, 0.95, 0.65, 0.85, 0.75]
    .into_iter()
    .map(|score| item(0, score, [0.0, 0.0, 0.5, 0.5]))
    .collect();
  let loader = move |_: &Path, _: &EngineOptions| -> Result<FixedItems, EngineError> {
    Ok(FixedItems(items.clone()))
  };
  let mut backend = DecodedBackend::new(
    DecodedBackendConfig::new(assets),
    loader,
    ComputeSettings::default(),
  );

  let result = backend.detect(&frame(10, 10, Rotation::Deg0)).unwrap();
  let scores: Vec<f32> = result
    .detected_objects
    .iter()
    .map(|object| object.confidence)
    .collect();
  assert_eq!(scores, [0.95f32, 0.85, 0.75]);

  fs::remove_dir_all(root).ok();
}

#[test]
fn backend_spec_builds_from_url() {
  let (assets, root) = model_assets("spec");
  let url = Url::parse(&format!(
    "yolov5://{}/model.bin?cache={}&compute=cpu&threshold=0.3&max_results=1",
    assets.store.bundle_dir().display(),
    root.join("spec-cache").display()
  ))
  .unwrap();
  let spec = BackendSpec::from_url(&url).unwrap();
  assert_eq!(spec.model_dir(), assets.store.bundle_dir());

  let tensor_loader = |_: &Path, _: &EngineOptions| -> Result<FixedTensor, EngineError> {
    Err(EngineError::invalid("张量模型不可用"))
  };
  let decoded_loader = |_: &Path, _: &EngineOptions| -> Result<FixedItems, EngineError> {
    Ok(FixedItems(vec![
      item(0, 0.4, [0.0, 0.0, 0.5, 0.5]),
      item(1, 0.35, [0.0, 0.0, 0.5, 0.5]),
    ]))
  };

  let mut backend = spec.build(tensor_loader, decoded_loader, ComputeSettings::default());
  assert_eq!(backend.name(), "tensor");
  assert_eq!(backend.compute_target(), ComputeTarget::Cpu);
  assert!(backend.detect(&frame(4, 4, Rotation::Deg0)).unwrap().is_empty());

  let url = Url::parse(&format!(
    "yolo26://{}/model.bin?cache={}&threshold=0.3&max_results=1",
    assets.store.bundle_dir().display(),
    root.join("spec-cache").display()
  ))
  .unwrap();
  let mut backend = BackendSpec::from_url(&url).unwrap().build(
    tensor_loader,
    decoded_loader,
    ComputeSettings::default(),
  );
  assert_eq!(backend.name(), "decoded");
  let result = backend.detect(&frame(4, 4, Rotation::Deg0)).unwrap();
  assert_eq!(result.len(), 1);
  assert_eq!(result.detected_objects[0].label, "person");

  fs::remove_dir_all(root).ok();
}
