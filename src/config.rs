//! Configuration for the generation pipeline.
//!
//! Defaults: one latent, guidance 15, fp16, 64 Karras steps over
//! σ ∈ [1e-3, 160], OBJ output.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scheduler::NoiseSchedule;
use crate::writer::{Format, StlEncoding};
use crate::{Error, Result};

/// Numeric precision used for model evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// fp16 activations.
    Half,
    /// fp32 throughout.
    Full,
}

/// Options passed through to the latent sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Latents produced per call (default: 1).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Classifier-free guidance strength (default: 15.0).
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,

    #[serde(default = "default_precision")]
    pub precision: Precision,

    /// Denoising iterations (default: 64).
    #[serde(default = "default_step_count")]
    pub step_count: usize,

    #[serde(default)]
    pub noise_schedule: NoiseSchedule,

    /// Clamp each denoised prediction to the latent's valid range.
    #[serde(default = "default_true")]
    pub clip_denoised: bool,

    /// Emit per-step progress events.
    #[serde(default = "default_true")]
    pub progress_reporting: bool,

    /// Random seed. `None` = random.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            guidance_scale: default_guidance_scale(),
            precision: default_precision(),
            step_count: default_step_count(),
            noise_schedule: NoiseSchedule::default(),
            clip_denoised: true,
            progress_reporting: true,
            seed: None,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.step_count == 0 {
            return Err(Error::Config("step_count must be at least 1".into()));
        }
        validate_guidance_scale(self.guidance_scale).map_err(Error::Config)?;
        self.noise_schedule
            .validate()
            .map_err(|e| Error::Config(format!("noise_schedule: {e}")))
    }

    /// The resolved sigma list for this configuration.
    pub fn sigmas(&self) -> Vec<f64> {
        self.noise_schedule.sigmas(self.step_count)
    }
}

pub(crate) fn validate_guidance_scale(scale: f64) -> std::result::Result<(), String> {
    if scale.is_finite() && scale >= 0.0 {
        Ok(())
    } else {
        Err(format!("guidance_scale must be a non-negative number, got {scale}"))
    }
}

/// Which device the model bundle is constructed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// First CUDA device if available, otherwise CPU.
    #[default]
    Auto,
    Cpu,
    /// A specific CUDA ordinal. Fails if unavailable.
    Cuda(usize),
    /// A specific Metal ordinal. Fails if unavailable.
    Metal(usize),
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            "metal" => Ok(Self::Metal(0)),
            other => {
                let ordinal = |prefix: &str| {
                    other
                        .strip_prefix(prefix)
                        .and_then(|ordinal| ordinal.parse::<usize>().ok())
                };
                ordinal("cuda:")
                    .map(Self::Cuda)
                    .or_else(|| ordinal("metal:").map(Self::Metal))
                    .ok_or_else(|| {
                        format!("unknown device '{s}'. Use auto, cpu, cuda[:N] or metal[:N]")
                    })
            }
        }
    }
}

/// Whether inference calls against the shared bundle may overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePolicy {
    /// Serialize on accelerators, allow concurrency on CPU.
    #[default]
    Auto,
    Serialized,
    Concurrent,
}

/// Preview rendering options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Render previews when a renderer is attached (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poses in the pan around the object (default: 20).
    #[serde(default = "default_camera_count")]
    pub camera_count: usize,

    /// Square image size in pixels (default: 64).
    #[serde(default = "default_preview_size")]
    pub size: u32,

    /// Images kept from the pan (default: 3).
    #[serde(default = "default_max_previews")]
    pub max_previews: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            camera_count: default_camera_count(),
            size: default_preview_size(),
            max_previews: default_max_previews(),
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Artifact formats written per request (default: OBJ only).
    #[serde(default = "default_formats")]
    pub formats: Vec<Format>,

    #[serde(default)]
    pub stl_encoding: StlEncoding,

    #[serde(default)]
    pub device: DevicePreference,

    #[serde(default)]
    pub inference: InferencePolicy,

    #[serde(default)]
    pub previews: PreviewConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            formats: default_formats(),
            stl_encoding: StlEncoding::default(),
            device: DevicePreference::default(),
            inference: InferencePolicy::default(),
            previews: PreviewConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()?;
        if self.formats.is_empty() {
            return Err(Error::Config("at least one output format is required".into()));
        }
        if self.previews.enabled && self.previews.size == 0 {
            return Err(Error::Config("preview size must be at least 1 pixel".into()));
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    1
}

fn default_guidance_scale() -> f64 {
    15.0
}

fn default_precision() -> Precision {
    Precision::Half
}

fn default_step_count() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_camera_count() -> usize {
    20
}

fn default_preview_size() -> u32 {
    64
}

fn default_max_previews() -> usize {
    3
}

fn default_formats() -> Vec<Format> {
    vec![Format::Obj]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScheduleFamily;

    #[test]
    fn test_sampling_defaults() {
        let cfg = SamplingConfig::default();
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.guidance_scale, 15.0);
        assert_eq!(cfg.precision, Precision::Half);
        assert_eq!(cfg.step_count, 64);
        assert_eq!(cfg.noise_schedule.family, ScheduleFamily::Karras);
        assert_eq!(cfg.noise_schedule.sigma_min, 1e-3);
        assert_eq!(cfg.noise_schedule.sigma_max, 160.0);
        assert_eq!(cfg.noise_schedule.s_churn, 0.0);
        assert!(cfg.clip_denoised);
        assert!(cfg.progress_reporting);
        assert_eq!(cfg.sigmas().len(), 65);
    }

    #[test]
    fn test_pipeline_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.formats, vec![Format::Obj]);
        assert_eq!(cfg.device, DevicePreference::Auto);
        assert_eq!(cfg.previews.camera_count, 20);
        assert_eq!(cfg.previews.max_previews, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = SamplingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let cfg = SamplingConfig {
            step_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SamplingConfig {
            guidance_scale: f64::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SamplingConfig {
            noise_schedule: NoiseSchedule {
                sigma_min: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(
            &path,
            r#"{
                "sampling": {"guidance_scale": 3.0, "step_count": 32, "precision": "full"},
                "formats": ["obj", "stl"],
                "device": "cpu"
            }"#,
        )
        .unwrap();

        let cfg = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.sampling.guidance_scale, 3.0);
        assert_eq!(cfg.sampling.step_count, 32);
        assert_eq!(cfg.sampling.precision, Precision::Full);
        assert_eq!(cfg.sampling.batch_size, 1);
        assert_eq!(cfg.formats, vec![Format::Obj, Format::Stl]);
        assert_eq!(cfg.device, DevicePreference::Cpu);
    }

    #[test]
    fn test_from_json_file_rejects_empty_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"formats": []}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_device_preference_parse() {
        assert_eq!("auto".parse(), Ok(DevicePreference::Auto));
        assert_eq!("CPU".parse(), Ok(DevicePreference::Cpu));
        assert_eq!("cuda".parse(), Ok(DevicePreference::Cuda(0)));
        assert_eq!("cuda:2".parse(), Ok(DevicePreference::Cuda(2)));
        assert!("tpu".parse::<DevicePreference>().is_err());
        assert!("cuda:x".parse::<DevicePreference>().is_err());
        assert_eq!("metal".parse(), Ok(DevicePreference::Metal(0)));
        assert_eq!("Metal:1".parse(), Ok(DevicePreference::Metal(1)));
        assert!("metal:".parse::<DevicePreference>().is_err());
    }
}
