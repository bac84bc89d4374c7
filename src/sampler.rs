//! Latent sampler.
//!
//! Wraps the model library's `sample_latents` with a fixed [`SamplingConfig`].
//! The denoising numerics belong to the model; this layer resolves the noise
//! schedule, passes every option through unchanged, and checks what comes
//! back: exactly `batch_size` finite latents of the bundle's latent length,
//! returned in request order.

use std::time::Instant;

use candle_core::{DType, Tensor};

use crate::config::SamplingConfig;
use crate::error::describe_fault;
use crate::model::{Latent, ModelBundle, SampleRequest};
use crate::{Error, Result};

/// Stateless wrapper around the external sampling call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sampler;

impl Sampler {
    /// Sample `config.batch_size` latents for `prompt`.
    pub fn sample(
        &self,
        prompt: &str,
        bundle: &ModelBundle,
        config: &SamplingConfig,
    ) -> Result<Vec<Latent>> {
        config.validate()?;

        let started = Instant::now();
        let progress = |step: usize, total: usize| log_progress(step, total);
        let request = SampleRequest {
            texts: vec![prompt; config.batch_size],
            guidance_scale: config.guidance_scale,
            precision: config.precision,
            clip_denoised: config.clip_denoised,
            sigmas: config.sigmas(),
            s_churn: config.noise_schedule.s_churn,
            seed: config.seed,
            diffusion: &bundle.diffusion,
            device: &bundle.device,
            progress: config
                .progress_reporting
                .then_some(&progress as &(dyn Fn(usize, usize) + Sync)),
        };

        tracing::info!(
            prompt,
            batch_size = config.batch_size,
            guidance_scale = config.guidance_scale,
            steps = config.step_count,
            precision = ?config.precision,
            "sampling latents"
        );

        let latents = {
            let _guard = bundle.inference_guard();
            bundle.text_model.sample_latents(&request)
        }
        .map_err(|e| failed(prompt, describe_fault(&e)))?;

        let latents = check_latents(prompt, latents, config.batch_size, bundle.latent_dim())?;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            count = latents.len(),
            "sampling done"
        );
        Ok(latents)
    }
}

fn failed(prompt: &str, reason: impl Into<String>) -> Error {
    Error::Generation {
        prompt: prompt.to_string(),
        reason: reason.into(),
    }
}

/// Validate the raw `[batch, latent_dim]` output and split it into latents.
fn check_latents(
    prompt: &str,
    latents: Tensor,
    batch_size: usize,
    latent_dim: usize,
) -> Result<Vec<Latent>> {
    if latents.dims() != &[batch_size, latent_dim] {
        return Err(failed(
            prompt,
            format!(
                "expected latents of shape [{batch_size}, {latent_dim}], got {:?}",
                latents.dims()
            ),
        ));
    }

    let latents = latents
        .to_dtype(DType::F32)
        .map_err(|e| failed(prompt, describe_fault(&e)))?;
    let values: Vec<f32> = latents
        .flatten_all()
        .and_then(|flat| flat.to_vec1())
        .map_err(|e| failed(prompt, describe_fault(&e)))?;
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(failed(
            prompt,
            format!(
                "non-finite value in latent {} at position {}",
                index / latent_dim,
                index % latent_dim
            ),
        ));
    }

    (0..batch_size)
        .map(|i| {
            latents
                .get(i)
                .map(Latent::new)
                .map_err(|e| failed(prompt, describe_fault(&e)))
        })
        .collect()
}

fn log_progress(step: usize, total: usize) {
    tracing::debug!(step, total, "denoising step");
    let quarter = (total / 4).max(1);
    if step % quarter == 0 || step == total {
        tracing::info!("denoising {step}/{total}");
    }
}
