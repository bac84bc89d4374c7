//! Model boundary.
//!
//! The diffusion network, the transmitter (latent → mesh decoder) and the
//! diffusion schedule live in an external model library. This module defines
//! the traits that library is reached through, plus the request-owned
//! [`Latent`] and the process-wide [`ModelBundle`].
//!
//! ## Backends
//!
//! - [`toy`]: deterministic stand-in networks for exercising the pipeline
//!   without weights

pub mod toy;

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{InferencePolicy, Precision};
use crate::mesh::TriMesh;
use crate::{Error, Result};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Text-conditioned latent diffusion model (`sample_latents`).
pub trait LatentDiffusion: Send + Sync {
    /// Sample one latent per entry in `request.texts`.
    ///
    /// Returns a tensor of shape `[texts.len(), latent_dim]`.
    fn sample_latents(&self, request: &SampleRequest<'_>) -> candle_core::Result<Tensor>;
}

/// Latent → mesh decoder (`decode_latent_mesh(..).tri_mesh()`).
pub trait Transmitter: Send + Sync {
    /// Length of the 1-D latent this decoder accepts.
    fn latent_dim(&self) -> usize;

    /// Decode a `[latent_dim]` latent into a triangulated mesh.
    fn decode_latent_mesh(&self, latent: &Tensor) -> candle_core::Result<TriMesh>;
}

/// Constructs the bundle components on a chosen device.
pub trait ModelLoader: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// `load_model("transmitter", device)`.
    fn load_transmitter(&self, device: &Device) -> Result<Arc<dyn Transmitter>>;

    /// `load_model("text300M", device)`.
    fn load_text_model(&self, device: &Device) -> Result<Arc<dyn LatentDiffusion>>;

    /// `diffusion_from_config(load_config("diffusion"))`.
    fn diffusion_config(&self) -> Result<DiffusionConfig> {
        Ok(DiffusionConfig::default())
    }
}

/// Resolve a backend by name, for the command-line adapters.
pub fn loader_for(name: &str) -> Result<Arc<dyn ModelLoader>> {
    match name {
        "toy" => Ok(Arc::new(toy::ToyLoader::default())),
        other => Err(Error::Config(format!(
            "unknown model backend '{other}'. Available: toy"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Diffusion configuration
// ---------------------------------------------------------------------------

/// What the diffusion network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanType {
    Epsilon,
    XStart,
}

/// Training-time diffusion configuration shipped with the model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of training timesteps.
    pub timesteps: usize,
    /// Training noise schedule name (e.g. "exp").
    pub schedule: String,
    pub mean_type: MeanType,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: 1024,
            schedule: "exp".to_string(),
            mean_type: MeanType::XStart,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampling request
// ---------------------------------------------------------------------------

/// Everything the model library's `sample_latents` receives.
pub struct SampleRequest<'a> {
    /// One conditioning text per latent, in output order.
    pub texts: Vec<&'a str>,
    pub guidance_scale: f64,
    pub precision: Precision,
    pub clip_denoised: bool,
    /// Resolved noise levels, `step_count + 1` entries ending in 0.
    pub sigmas: Vec<f64>,
    pub s_churn: f64,
    pub seed: Option<u64>,
    pub diffusion: &'a DiffusionConfig,
    pub device: &'a Device,
    /// Called after each denoising step with `(step, total_steps)`.
    pub progress: Option<&'a (dyn Fn(usize, usize) + Sync)>,
}

impl SampleRequest<'_> {
    pub fn batch_size(&self) -> usize {
        self.texts.len()
    }

    pub fn step_count(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    pub(crate) fn report_progress(&self, step: usize) {
        if let Some(progress) = self.progress {
            progress(step, self.step_count());
        }
    }
}

// ---------------------------------------------------------------------------
// Latent
// ---------------------------------------------------------------------------

/// A single sampled shape latent, owned by one request.
#[derive(Debug, Clone)]
pub struct Latent {
    tensor: Tensor,
}

impl Latent {
    pub fn new(tensor: Tensor) -> Self {
        Self { tensor }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn dims(&self) -> &[usize] {
        self.tensor.dims()
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// The heavyweight, read-only model state shared by every request.
pub struct ModelBundle {
    pub transmitter: Arc<dyn Transmitter>,
    pub text_model: Arc<dyn LatentDiffusion>,
    pub diffusion: DiffusionConfig,
    pub device: Device,
    /// Present when the device cannot serve overlapping inference calls.
    inference_lock: Option<Mutex<()>>,
}

impl ModelBundle {
    pub fn new(
        transmitter: Arc<dyn Transmitter>,
        text_model: Arc<dyn LatentDiffusion>,
        diffusion: DiffusionConfig,
        device: Device,
        policy: InferencePolicy,
    ) -> Self {
        let serialize = match policy {
            InferencePolicy::Serialized => true,
            InferencePolicy::Concurrent => false,
            InferencePolicy::Auto => !device.is_cpu(),
        };
        Self {
            transmitter,
            text_model,
            diffusion,
            device,
            inference_lock: serialize.then(|| Mutex::new(())),
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.transmitter.latent_dim()
    }

    pub fn serializes_inference(&self) -> bool {
        self.inference_lock.is_some()
    }

    /// Hold this for the duration of an inference call.
    ///
    /// `None` when concurrent inference is allowed. A poisoned lock is
    /// recovered: the bundle itself is never mutated under it.
    pub fn inference_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.inference_lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl std::fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBundle")
            .field("latent_dim", &self.latent_dim())
            .field("diffusion", &self.diffusion)
            .field("device", &self.device)
            .field("serializes_inference", &self.serializes_inference())
            .finish()
    }
}
