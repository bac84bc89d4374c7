//! End-to-end generation pipeline.
//!
//! Orchestrates one text-to-3D request:
//! 1. Validate the prompt and per-request overrides
//! 2. Fetch the shared model bundle (constructed on first use)
//! 3. Sample one latent conditioned on the prompt
//! 4. Decode the latent into a triangle mesh
//! 5. Write the mesh as OBJ and/or STL
//! 6. Optionally render preview images (best effort)
//!
//! Every step short-circuits: the first failure ends the request with the
//! error of that stage, and a scoped artifact directory is removed with it.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, SamplingConfig, validate_guidance_scale};
use crate::decoder::MeshDecoder;
use crate::mesh::TriMesh;
use crate::model::loader_for;
use crate::registry::ModelRegistry;
use crate::render::{Renderer, create_pan_cameras};
use crate::sampler::Sampler;
use crate::writer::{Artifact, ArtifactDir, AssetWriter, Format, artifact_stem};
use crate::{Error, Result, Stage};

/// A single generation request. Unset overrides fall back to the pipeline
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(default)]
    pub guidance_scale: Option<f64>,

    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub formats: Option<Vec<Format>>,

    /// Write artifacts here and keep them. Without it they go to a temporary
    /// directory that lives as long as the [`GenerationResult`].
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Output of a successful request.
pub struct GenerationResult {
    pub prompt: String,
    /// One artifact per requested format.
    pub artifacts: BTreeMap<Format, Artifact>,
    /// At most `previews.max_previews` images; empty when rendering failed or
    /// was not configured.
    pub previews: Vec<RgbImage>,
    /// Stages visited, from `Idle` to `Done`.
    pub stages: Vec<Stage>,
    pub vertex_count: usize,
    pub face_count: usize,
    pub elapsed: Duration,
    dir: ArtifactDir,
}

impl GenerationResult {
    pub fn artifact(&self, format: Format) -> Option<&Artifact> {
        self.artifacts.get(&format)
    }

    pub fn output_dir(&self) -> &Path {
        self.dir.path()
    }

    /// True when the artifacts are deleted together with this result.
    pub fn is_scoped(&self) -> bool {
        self.dir.is_scoped()
    }

    /// Keep the artifacts on disk after this result is dropped.
    pub fn keep(self) -> (PathBuf, BTreeMap<Format, Artifact>) {
        (self.dir.keep(), self.artifacts)
    }

    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            prompt: self.prompt.clone(),
            artifacts: self.artifacts.values().cloned().collect(),
            previews: self.previews.len(),
            stages: self.stages.clone(),
            vertex_count: self.vertex_count,
            face_count: self.face_count,
            elapsed_ms: self.elapsed.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for GenerationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationResult")
            .field("prompt", &self.prompt)
            .field("artifacts", &self.artifacts)
            .field("previews", &self.previews.len())
            .field("stages", &self.stages)
            .field("vertex_count", &self.vertex_count)
            .field("face_count", &self.face_count)
            .field("dir", &self.dir)
            .finish()
    }
}

/// Serializable view of a [`GenerationResult`].
#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub prompt: String,
    pub artifacts: Vec<Artifact>,
    pub previews: usize,
    pub stages: Vec<Stage>,
    pub vertex_count: usize,
    pub face_count: usize,
    pub elapsed_ms: u64,
}

/// Text-to-3D pipeline over a shared [`ModelRegistry`].
///
/// Holds no per-request state; any number of threads may call
/// [`generate`](Self::generate) on one pipeline.
pub struct GenerationPipeline {
    registry: Arc<ModelRegistry>,
    config: PipelineConfig,
    sampler: Sampler,
    decoder: MeshDecoder,
    writer: AssetWriter,
    renderer: Option<Arc<dyn Renderer>>,
}

impl GenerationPipeline {
    pub fn new(registry: Arc<ModelRegistry>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            writer: AssetWriter::new(config.stl_encoding),
            config,
            sampler: Sampler,
            decoder: MeshDecoder,
            renderer: None,
        })
    }

    /// Build a pipeline with its own registry for the named backend.
    pub fn from_config(config: PipelineConfig, backend: &str) -> Result<Self> {
        let registry = ModelRegistry::new(loader_for(backend)?, config.device)
            .with_inference_policy(config.inference);
        Self::new(Arc::new(registry), config)
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Construct the model bundle now instead of on the first request.
    pub fn preload(&self) -> Result<()> {
        self.registry.get().map(|_| ())
    }

    /// Generate with the configured defaults.
    pub fn generate(&self, prompt: &str) -> Result<GenerationResult> {
        self.generate_request(&GenerationRequest::new(prompt))
    }

    pub fn generate_request(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let started = Instant::now();
        let mut stages = vec![Stage::Idle];

        let result = self.run(request, &mut stages, started);
        if let Err(ref error) = result {
            tracing::warn!(
                prompt = %request.prompt,
                stage = %error.stage().unwrap_or(Stage::Idle),
                error = %error,
                "generation failed"
            );
        }
        result
    }

    fn run(
        &self,
        request: &GenerationRequest,
        stages: &mut Vec<Stage>,
        started: Instant,
    ) -> Result<GenerationResult> {
        let prompt = request.prompt.as_str();

        stages.push(Stage::Validating);
        let (sampling, formats) = self.resolve(request)?;
        tracing::info!(prompt, guidance_scale = sampling.guidance_scale, "generation started");

        stages.push(Stage::ModelLoading);
        let bundle = self.registry.get()?;

        stages.push(Stage::Sampling);
        let latent = self
            .sampler
            .sample(prompt, &bundle, &sampling)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Generation {
                prompt: prompt.to_string(),
                reason: "model returned no latents".into(),
            })?;

        stages.push(Stage::Decoding);
        let mesh = self.decoder.decode(&latent, &bundle)?;

        stages.push(Stage::Writing);
        let dir = match &request.output_dir {
            Some(path) => ArtifactDir::persistent(path)?,
            None => ArtifactDir::scoped()?,
        };
        let artifacts = self
            .writer
            .write(&mesh, formats, &dir, &artifact_stem(prompt))?;

        let previews = match &self.renderer {
            Some(renderer) if self.config.previews.enabled => {
                stages.push(Stage::PreviewRendering);
                self.render_previews(renderer.as_ref(), &mesh)
            }
            _ => Vec::new(),
        };

        stages.push(Stage::Done);
        let elapsed = started.elapsed();
        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            artifacts = artifacts.len(),
            previews = previews.len(),
            dir = %dir.path().display(),
            "generation done"
        );

        Ok(GenerationResult {
            prompt: prompt.to_string(),
            artifacts,
            previews,
            stages: std::mem::take(stages),
            vertex_count: mesh.vertex_count(),
            face_count: mesh.face_count(),
            elapsed,
            dir,
        })
    }

    /// Check the request and merge its overrides into the configuration.
    fn resolve<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Result<(SamplingConfig, &'a [Format])> {
        if request.prompt.trim().is_empty() {
            return Err(Error::Input("prompt is empty".into()));
        }

        let mut sampling = SamplingConfig {
            batch_size: 1,
            ..self.config.sampling.clone()
        };
        if let Some(scale) = request.guidance_scale {
            validate_guidance_scale(scale).map_err(Error::Input)?;
            sampling.guidance_scale = scale;
        }
        if request.seed.is_some() {
            sampling.seed = request.seed;
        }

        let formats = match &request.formats {
            Some(formats) if formats.is_empty() => {
                return Err(Error::Input("no output formats requested".into()));
            }
            Some(formats) => formats.as_slice(),
            None => self.config.formats.as_slice(),
        };
        Ok((sampling, formats))
    }

    /// Render pan previews, swallowing any failure.
    fn render_previews(&self, renderer: &dyn Renderer, mesh: &TriMesh) -> Vec<RgbImage> {
        let config = &self.config.previews;
        let cameras = create_pan_cameras(config.camera_count, config.size);

        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| renderer.render(mesh, &cameras)));
        let error = match outcome {
            Ok(Ok(mut images)) => {
                images.truncate(config.max_previews);
                return images;
            }
            Ok(Err(error @ Error::Preview(_))) => error,
            Ok(Err(other)) => Error::Preview(other.to_string()),
            Err(payload) => Error::Preview(panic_message(payload.as_ref())),
        };
        tracing::warn!(%error, "continuing without previews");
        Vec::new()
    }
}

impl std::fmt::Debug for GenerationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationPipeline")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".into());
    format!("renderer panicked: {detail}")
}
