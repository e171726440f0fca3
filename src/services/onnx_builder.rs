// Shared ONNX Runtime session builder with automatic hardware acceleration detection

use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::ops::{Deref, DerefMut};
use tracing::{debug, info, warn};

use crate::core::errors::{DetectResult, DetectionError};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

#[cfg(feature = "xnnpack")]
use ort::execution_providers::XNNPACKExecutionProvider;

/// Calculate optimal thread count for ONNX Runtime CPU inference.
///
/// Windows loses throughput past ~6 intra-op threads to synchronization
/// overhead (https://github.com/microsoft/onnxruntime/issues/3713).
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Fixed-size pool of sessions. `Session::run` needs `&mut`, so each
/// in-flight inference checks one out.
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
    capacity: usize,
}

impl OnnxSessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        let capacity = sessions.len().max(1);
        let (sender, receiver) = bounded(capacity);
        for session in sessions {
            // Capacity covers every session, so this never blocks
            let _ = sender.send(session);
        }
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.receiver.len()
    }

    /// Check out a session, blocking until one is free. The session goes
    /// back to the pool when the guard drops, including on error paths.
    pub fn acquire(&self) -> DetectResult<PooledSession<'_>> {
        let session = self
            .receiver
            .recv()
            .map_err(|_| DetectionError::ModelUnavailable("session pool closed".to_string()))?;
        Ok(PooledSession {
            pool: self,
            session: Some(session),
        })
    }
}

pub struct PooledSession<'a> {
    pool: &'a OnnxSessionPool,
    session: Option<Session>,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only taken in Drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.pool.sender.send(session).is_err() {
                warn!("Session pool closed, dropping session");
            }
        }
    }
}

fn commit(
    provider: ExecutionProviderDispatch,
    level: GraphOptimizationLevel,
    model_bytes: &[u8],
) -> ort::Result<Session> {
    Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(level)?
        .with_intra_threads(optimal_intra_op_threads())?
        .with_inter_threads(1)?
        .commit_from_memory(model_bytes)
}

/// Accelerated providers compiled into this build, in order of preference
fn accelerated_providers() -> Vec<(&'static str, ExecutionProviderDispatch)> {
    #[allow(unused_mut)]
    let mut providers: Vec<(&'static str, ExecutionProviderDispatch)> = Vec::new();

    #[cfg(feature = "tensorrt")]
    providers.push(("TensorRT", TensorRTExecutionProvider::default().build()));

    #[cfg(feature = "cuda")]
    providers.push(("CUDA", CUDAExecutionProvider::default().build()));

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    providers.push(("CoreML", CoreMLExecutionProvider::default().build()));

    #[cfg(all(target_os = "windows", feature = "directml"))]
    providers.push(("DirectML", DirectMLExecutionProvider::default().build()));

    #[cfg(feature = "openvino")]
    providers.push((
        "OpenVINO-CPU",
        OpenVINOExecutionProvider::default().with_device_type("CPU").build(),
    ));

    #[cfg(feature = "xnnpack")]
    providers.push(("XNNPACK", XNNPACKExecutionProvider::default().build()));

    providers
}

/// Build an ONNX Runtime session, preferring hardware acceleration.
///
/// `backend` forces a provider by name (`CPU`, `CUDA`, `TENSORRT`, ...);
/// `None` or `AUTO` tries every compiled-in accelerator before falling
/// back to plain CPU.
///
/// # Returns
/// (backend_name, Session)
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    backend: Option<&str>,
) -> Result<(String, Session)> {
    let model_size_mb = model_bytes.len() as f32 / 1_048_576.0;

    match backend.map(str::to_uppercase).as_deref() {
        None | Some("AUTO") => {}
        Some("CPU") => {
            let session = commit(
                CPUExecutionProvider::default().build(),
                GraphOptimizationLevel::Level3,
                model_bytes,
            )
            .context(format!("Failed to load {} with CPU backend", model_name))?;
            info!("✓ Forced CPU backend for {}", model_name);
            return Ok(("CPU".to_string(), session));
        }
        Some(forced) => {
            info!("INFERENCE_BACKEND={}, forcing specific backend for {}", forced, model_name);
            for (name, provider) in accelerated_providers() {
                if name.to_uppercase().starts_with(forced) {
                    let session = commit(provider, GraphOptimizationLevel::Level3, model_bytes)
                        .context(format!("Failed to load {} with {}", model_name, name))?;
                    info!("✓ Forced {} backend for {}", name, model_name);
                    return Ok((name.to_string(), session));
                }
            }
            bail!(
                "{} backend not available for {}. Rebuild with the matching cargo feature",
                forced,
                model_name
            );
        }
    }

    for (name, provider) in accelerated_providers() {
        // DirectML is unstable with aggressive graph rewrites
        let level = if name == "DirectML" {
            GraphOptimizationLevel::Level1
        } else {
            GraphOptimizationLevel::Level3
        };
        match commit(provider, level, model_bytes) {
            Ok(session) => {
                info!("✓ Using {} acceleration for {}", name, model_name);
                return Ok((name.to_string(), session));
            }
            Err(e) => debug!("{} unavailable for {}: {}", name, model_name, e),
        }
    }

    // Final fallback: Pure CPU (no acceleration)
    let session = commit(
        CPUExecutionProvider::default().build(),
        GraphOptimizationLevel::Level3,
        model_bytes,
    )
    .context(format!(
        "Failed to load {} ONNX model from memory ({:.1} MB). \
        This usually indicates:\n  \
        1. Model file corruption during transfer\n  \
        2. ONNX Runtime version/platform mismatch\n  \
        3. Model created with incompatible ONNX opset version",
        model_name, model_size_mb
    ))?;

    warn!("⚠️  Using CPU-only inference for {} (no GPU acceleration available)", model_name);
    Ok(("CPU".to_string(), session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_forced_backend_is_rejected() {
        let result = build_session_with_acceleration(b"irrelevant", "garbage", Some("QUANTUM"));
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_pool_reports_capacity() {
        let pool = OnnxSessionPool::new(Vec::new());
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 0);
    }
}
