//! Deterministic stand-in networks.
//!
//! Lets the CLI, the daemon and the tests drive the full pipeline without
//! downloading weights. The shapes are blobby spheres, one per prompt.
//!
//! - [`ToyDiffusion`] hashes each prompt (SHA-256) into a target latent, then
//!   runs a Karras/Euler loop with classifier-free guidance whose conditional
//!   branch is an ideal denoiser toward that target.
//! - [`ToyTransmitter`] displaces a UV sphere radially by `tanh(B · z)`,
//!   where `B` is a fixed `[vertices, latent_dim]` basis of plane waves.

use std::f32::consts::{PI, TAU};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::{LatentDiffusion, ModelLoader, SampleRequest, Transmitter};
use crate::config::Precision;
use crate::mesh::TriMesh;
use crate::Result;

/// Latent length of the toy backend.
pub const TOY_LATENT_DIM: usize = 64;

/// Loader for the toy backend.
#[derive(Debug, Clone)]
pub struct ToyLoader {
    pub latent_dim: usize,
    /// Longitude divisions of the template sphere.
    pub segments: u32,
    /// Latitude divisions of the template sphere.
    pub rings: u32,
}

impl Default for ToyLoader {
    fn default() -> Self {
        Self {
            latent_dim: TOY_LATENT_DIM,
            segments: 32,
            rings: 16,
        }
    }
}

impl ModelLoader for ToyLoader {
    fn name(&self) -> &str {
        "toy"
    }

    fn load_transmitter(&self, device: &Device) -> Result<Arc<dyn Transmitter>> {
        let transmitter = ToyTransmitter::new(self.latent_dim, self.segments, self.rings, device)
            .map_err(|e| crate::Error::ModelUnavailable(format!("toy transmitter: {e}")))?;
        Ok(Arc::new(transmitter))
    }

    fn load_text_model(&self, device: &Device) -> Result<Arc<dyn LatentDiffusion>> {
        Ok(Arc::new(ToyDiffusion::new(self.latent_dim, device)))
    }
}

// ---------------------------------------------------------------------------
// Diffusion
// ---------------------------------------------------------------------------

/// Stand-in text-conditioned diffusion model.
#[derive(Debug, Clone)]
pub struct ToyDiffusion {
    latent_dim: usize,
    device: Device,
}

impl ToyDiffusion {
    pub fn new(latent_dim: usize, device: &Device) -> Self {
        Self {
            latent_dim,
            device: device.clone(),
        }
    }

    /// Guided x0 prediction with EDM preconditioning (σ_data = 1).
    ///
    /// ```text
    /// c_skip = 1 / (σ² + 1)
    /// cond   = c_skip · x + (1 - c_skip) · target
    /// uncond = c_skip · x
    /// x0     = uncond + g · (cond - uncond)
    /// ```
    fn denoise(
        &self,
        x: &Tensor,
        target: &Tensor,
        sigma: f64,
        guidance_scale: f64,
        dtype: DType,
    ) -> candle_core::Result<Tensor> {
        let c_skip = 1.0 / (sigma * sigma + 1.0);
        let x = x.to_dtype(dtype)?;
        let target = target.to_dtype(dtype)?;
        let uncond = (&x * c_skip)?;
        let cond = (&uncond + (&target * (1.0 - c_skip))?)?;
        let guided = (&uncond + ((cond - &uncond)? * guidance_scale)?)?;
        guided.to_dtype(DType::F32)
    }
}

impl LatentDiffusion for ToyDiffusion {
    fn sample_latents(&self, request: &SampleRequest<'_>) -> candle_core::Result<Tensor> {
        let batch = request.batch_size();
        let dim = self.latent_dim;
        if request.sigmas.len() < 2 {
            candle_core::bail!("sigma schedule needs at least one step");
        }

        let targets: Vec<f32> = request
            .texts
            .iter()
            .flat_map(|text| prompt_target(text, dim))
            .collect();
        let target = Tensor::from_vec(targets, (batch, dim), &self.device)?;

        let seed = request.seed.unwrap_or_else(rand::random);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let dtype = match request.precision {
            Precision::Half => DType::F16,
            Precision::Full => DType::F32,
        };
        let steps = request.step_count();
        let gamma_max = 2f64.sqrt() - 1.0;

        let mut x = (gaussian(&mut rng, (batch, dim), &self.device)? * request.sigmas[0])?;
        for step in 0..steps {
            let sigma = request.sigmas[step];
            let sigma_next = request.sigmas[step + 1];

            // Churn: re-inject noise to raise σ to σ̂ before the step.
            let gamma = if request.s_churn > 0.0 {
                (request.s_churn / steps as f64).min(gamma_max)
            } else {
                0.0
            };
            let sigma_hat = sigma * (1.0 + gamma);
            if gamma > 0.0 {
                let eps = gaussian(&mut rng, (batch, dim), &self.device)?;
                x = (x + (eps * (sigma_hat * sigma_hat - sigma * sigma).sqrt())?)?;
            }

            let mut denoised =
                self.denoise(&x, &target, sigma_hat, request.guidance_scale, dtype)?;
            if request.clip_denoised {
                denoised = denoised.clamp(-1f32, 1f32)?;
            }

            // Euler: x_next = x + (x - x0) / σ̂ · (σ_next - σ̂)
            let d = ((&x - &denoised)? / sigma_hat)?;
            x = (x + (d * (sigma_next - sigma_hat))?)?;

            request.report_progress(step + 1);
        }

        Ok(x)
    }
}

/// Per-prompt target latent in [-1, 1], stable across runs and platforms.
fn prompt_target(text: &str, dim: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    let mut rng = ChaCha8Rng::seed_from_u64(u64::from_le_bytes(seed));
    (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Standard normal samples via Box-Muller.
fn gaussian(
    rng: &mut ChaCha8Rng,
    shape: (usize, usize),
    device: &Device,
) -> candle_core::Result<Tensor> {
    let n = shape.0 * shape.1;
    let values: Vec<f32> = (0..n)
        .map(|_| {
            let u1 = 1.0 - rng.r#gen::<f32>(); // (0, 1]
            let u2 = rng.r#gen::<f32>();
            (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
        })
        .collect();
    Tensor::from_vec(values, shape, device)
}

// ---------------------------------------------------------------------------
// Transmitter
// ---------------------------------------------------------------------------

/// Stand-in latent → mesh decoder.
#[derive(Debug, Clone)]
pub struct ToyTransmitter {
    latent_dim: usize,
    /// Unit directions of the template sphere.
    directions: Vec<Vec3>,
    faces: Vec<[u32; 3]>,
    /// [vertices, latent_dim]
    basis: Tensor,
    device: Device,
}

impl ToyTransmitter {
    pub fn new(
        latent_dim: usize,
        segments: u32,
        rings: u32,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let (directions, faces) = uv_sphere(segments, rings);
        let norm = (latent_dim as f32).sqrt();

        let mut basis = Vec::with_capacity(directions.len() * latent_dim);
        for dir in &directions {
            for k in 0..latent_dim {
                let freq = Vec3::new((k % 4) as f32, ((k / 4) % 4) as f32, (k / 16) as f32) * 1.5;
                let phase = k as f32 * 0.7;
                basis.push((freq.dot(*dir) + phase).cos() / norm);
            }
        }
        let basis = Tensor::from_vec(basis, (directions.len(), latent_dim), device)?;

        Ok(Self {
            latent_dim,
            directions,
            faces,
            basis,
            device: device.clone(),
        })
    }
}

impl Transmitter for ToyTransmitter {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn decode_latent_mesh(&self, latent: &Tensor) -> candle_core::Result<TriMesh> {
        if latent.dims() != &[self.latent_dim] {
            candle_core::bail!(
                "expected latent of shape [{}], got {:?}",
                self.latent_dim,
                latent.dims()
            );
        }

        let z = latent
            .to_dtype(DType::F32)?
            .to_device(&self.device)?
            .reshape((self.latent_dim, 1))?;
        let offsets: Vec<f32> = self.basis.matmul(&z)?.squeeze(1)?.tanh()?.to_vec1()?;

        let low = Vec3::new(0.25, 0.35, 0.8);
        let high = Vec3::new(0.95, 0.6, 0.2);
        let (vertices, colors): (Vec<[f32; 3]>, Vec<[f32; 3]>) = self
            .directions
            .iter()
            .zip(&offsets)
            .map(|(dir, &offset)| {
                let position = *dir * (1.0 + 0.35 * offset);
                let color = low.lerp(high, (offset + 1.0) * 0.5);
                (position.to_array(), color.to_array())
            })
            .unzip();

        Ok(TriMesh::new(vertices, self.faces.clone()).with_vertex_colors(colors))
    }
}

/// Template UV sphere: unit directions and triangles with single-triangle caps.
fn uv_sphere(segments: u32, rings: u32) -> (Vec<Vec3>, Vec<[u32; 3]>) {
    let segments = segments.max(3);
    let rings = rings.max(2);

    let mut directions = Vec::with_capacity(((rings + 1) * (segments + 1)) as usize);
    for ring in 0..=rings {
        let phi = PI * ring as f32 / rings as f32; // 0 to PI (top to bottom)
        for segment in 0..=segments {
            let theta = TAU * segment as f32 / segments as f32; // 0 to TAU (around)
            directions.push(Vec3::new(
                phi.sin() * theta.cos(),
                phi.cos(),
                phi.sin() * theta.sin(),
            ));
        }
    }

    let stride = segments + 1;
    let mut faces = Vec::new();
    for ring in 0..rings {
        for segment in 0..segments {
            let i0 = ring * stride + segment;
            let i1 = i0 + 1;
            let i2 = i0 + stride;
            let i3 = i2 + 1;

            if ring == 0 {
                faces.push([i0, i2, i3]);
            } else if ring == rings - 1 {
                faces.push([i0, i2, i1]);
            } else {
                faces.push([i0, i2, i3]);
                faces.push([i0, i3, i1]);
            }
        }
    }

    (directions, faces)
}
