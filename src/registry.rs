//! Model registry: constructs the model bundle once and shares it.
//!
//! The first [`ModelRegistry::get`] selects a device and loads the transmitter,
//! the text-conditioned model and the diffusion configuration. Every later
//! call returns the same `Arc`. Concurrent first callers block on the single
//! initializer rather than loading twice.
//!
//! A failed construction is reported as [`Error::ModelUnavailable`] and is not
//! cached, so the next independent request tries again. Nothing is retried
//! within a call.

use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use once_cell::sync::OnceCell;

use crate::config::{DevicePreference, InferencePolicy};
use crate::model::{ModelBundle, ModelLoader};
use crate::{Error, Result};

/// Lazily constructed, process-lifetime model bundle.
pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    device: DevicePreference,
    inference: InferencePolicy,
    bundle: OnceCell<Arc<ModelBundle>>,
}

impl ModelRegistry {
    pub fn new(loader: Arc<dyn ModelLoader>, device: DevicePreference) -> Self {
        Self {
            loader,
            device,
            inference: InferencePolicy::default(),
            bundle: OnceCell::new(),
        }
    }

    pub fn with_inference_policy(mut self, policy: InferencePolicy) -> Self {
        self.inference = policy;
        self
    }

    /// Return the bundle, constructing it on first use.
    pub fn get(&self) -> Result<Arc<ModelBundle>> {
        self.bundle
            .get_or_try_init(|| self.construct().map(Arc::new))
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.bundle.get().is_some()
    }

    pub fn device_preference(&self) -> DevicePreference {
        self.device
    }

    pub fn loader_name(&self) -> &str {
        self.loader.name()
    }

    fn construct(&self) -> Result<ModelBundle> {
        let started = Instant::now();
        let device = select_device(self.device)?;
        tracing::info!(backend = self.loader.name(), device = ?device, "loading model bundle");

        let transmitter = self.loader.load_transmitter(&device).map_err(unavailable)?;
        let text_model = self.loader.load_text_model(&device).map_err(unavailable)?;
        let diffusion = self.loader.diffusion_config().map_err(unavailable)?;

        let bundle = ModelBundle::new(transmitter, text_model, diffusion, device, self.inference);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            latent_dim = bundle.latent_dim(),
            serialized = bundle.serializes_inference(),
            "model bundle ready"
        );
        Ok(bundle)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("loader", &self.loader.name())
            .field("device", &self.device)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Relabel a loader failure as a model-unavailable error.
fn unavailable(error: Error) -> Error {
    match error {
        Error::ModelUnavailable(_) => error,
        other => Error::ModelUnavailable(other.to_string()),
    }
}

/// Pick the execution device: an explicit accelerator, or the best available.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Auto => Ok(preferred_device(0)),
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| {
            Error::ModelUnavailable(format!("CUDA device {ordinal} unavailable: {e}"))
        }),
        DevicePreference::Metal(ordinal) => Device::new_metal(ordinal).map_err(|e| {
            Error::ModelUnavailable(format!("Metal device {ordinal} unavailable: {e}"))
        }),
    }
}

/// Return the preferred device: CUDA if available, then Metal, otherwise CPU.
pub fn preferred_device(ordinal: usize) -> Device {
    if candle_core::utils::cuda_is_available()
        && let Ok(device) = Device::new_cuda(ordinal)
    {
        return device;
    }
    if candle_core::utils::metal_is_available()
        && let Ok(device) = Device::new_metal(ordinal)
    {
        return device;
    }
    Device::Cpu
}
