//! ONNX Runtime transform: runs a patch batch through an `ort::Session`.
//!
//! Patches arrive as NHWC `u8`; the model takes NCHW `f32` (or `f16` when the
//! graph input is half precision) and returns NCHW, which is handed back to
//! the dispatcher as NHWC `f32`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};

use crate::config::InferenceConfig;
use crate::dispatch::Transform;

/// Execution provider selection.
///
/// `Tensorrt` registers CUDA as a fallback; if CUDA is missing too, ORT runs on CPU.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// The backend a session is actually built with. A CUDA request on a host
/// without the CUDA EP runs on CPU; TensorRT keeps its own fallback chain.
pub fn resolve_backend(requested: &InferenceBackend, cuda_available: bool) -> InferenceBackend {
    match requested {
        InferenceBackend::Cuda if !cuda_available => InferenceBackend::Cpu,
        other => other.clone(),
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: &'a InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` with the requested backend and fallback chain.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let started = Instant::now();

    let backend = match config.backend {
        InferenceBackend::Cuda => {
            let cuda_available = CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false);
            if !cuda_available {
                warn!("CUDA EP is not available; building a CPU session instead");
            }
            resolve_backend(config.backend, cuda_available)
        }
        other => other.clone(),
    };

    let session = match backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );

            let cache_path = cache_dir.to_string_lossy().to_string();
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cuda => {
            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => builder.commit_from_file(config.model_path).with_context(|| {
            format!("Failed to load ONNX model: {}", config.model_path.display())
        })?,
    };

    info!(
        requested_backend = %config.backend,
        backend = %backend,
        model = %config.model_path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "ONNX session ready"
    );
    Ok(session)
}

/// [`Transform`] backed by an ONNX model.
pub struct OnnxTransform {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    scale: f32,
}

impl OnnxTransform {
    pub fn load(config: &InferenceConfig, model_path: &Path, base_dir: &Path) -> Result<Self> {
        let backend = InferenceBackend::from_str_lossy(&config.backend);
        let trt_cache_dir: PathBuf = if config.trt_cache_dir.is_absolute() {
            config.trt_cache_dir.clone()
        } else {
            base_dir.join(&config.trt_cache_dir)
        };
        let session = build_session(&SessionConfig {
            model_path,
            backend: &backend,
            trt_cache_dir: Some(&trt_cache_dir),
        })?;

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        debug!(%input_name, %output_name, is_fp16, "Detected model IO");

        Ok(Self {
            session,
            input_name,
            output_name,
            is_fp16,
            scale: if config.scale_to_unit { 1.0 / 255.0 } else { 1.0 },
        })
    }

    fn run_f32(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let f32_data = input.into_raw_vec_and_offset().0;
        let mut fp16_data = vec![f16::ZERO; f32_data.len()];
        fp16_data.convert_from_f32_slice(&f32_data);

        let input_tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let fp16_owned = output_view.as_standard_layout().into_owned();
        let fp16_slice = fp16_owned
            .as_slice()
            .context("f16 output is not contiguous")?;
        let mut f32_out = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_out);
        Ok(ArrayD::from_shape_vec(fp16_owned.shape().to_vec(), f32_out)?)
    }
}

impl Transform for OnnxTransform {
    fn name(&self) -> &str {
        "OnnxTransform"
    }

    fn run_batch(&mut self, batch: Array4<u8>) -> Result<Array4<f32>> {
        let input = nhwc_u8_to_nchw_f32(&batch, self.scale);
        let output = if self.is_fp16 {
            self.run_f16(input)?
        } else {
            self.run_f32(input)?
        };
        let output = output
            .into_dimensionality::<Ix4>()
            .context("model output must be 4-D NCHW")?;
        Ok(nchw_to_nhwc(output))
    }
}

/// NHWC `u8` to contiguous NCHW `f32`, multiplied by `scale`.
pub fn nhwc_u8_to_nchw_f32(batch: &Array4<u8>, scale: f32) -> Array4<f32> {
    batch
        .mapv(|v| f32::from(v) * scale)
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned()
}

/// NCHW to contiguous NHWC.
pub fn nchw_to_nhwc(output: Array4<f32>) -> Array4<f32> {
    output
        .permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
}
