//! text3d CLI: text-to-3D mesh generation.
//!
//! Generates a mesh from a text prompt and writes it next to the working
//! directory (or to `--output-dir`) as `<prompt_stem>.obj` / `.stl`.
//!
//! # Output
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"prompt":"a chair shaped like an avocado","artifacts":[{"format":"obj","path":"./a_chair_shaped_like_an_avocado.obj","size_bytes":41532}],"previews":0,"stages":["idle","validating","model_loading","sampling","decoding","writing","done"],"vertex_count":482,"face_count":960,"elapsed_ms":812}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::Parser;
use text3d_rs::{
    config::{DevicePreference, PipelineConfig},
    pipeline::{GenerationPipeline, GenerationRequest},
    writer::{Format, StlEncoding},
};

#[derive(Parser, Debug)]
#[command(
    name = "text3d",
    about = "Text-to-3D mesh generation",
    long_about = "Generate a triangle mesh from a text prompt.\n\
                  Artifacts are written to --output-dir; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Short description of the object, e.g. "a chair shaped like an avocado".
    #[arg(long, short = 'p')]
    prompt: String,

    /// JSON pipeline configuration. Flags below override its fields.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory for the artifacts. Created if missing.
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    /// Output format, repeatable (obj, stl). Defaults to the config's formats.
    #[arg(long, short = 'f', value_parser = parse_format)]
    format: Vec<Format>,

    /// Write ASCII instead of binary STL.
    #[arg(long, default_value_t = false)]
    ascii_stl: bool,

    /// Classifier-free guidance scale.
    #[arg(long, short = 'g')]
    guidance_scale: Option<f64>,

    /// Number of denoising steps.
    #[arg(long)]
    steps: Option<usize>,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Execution device: auto, cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    device: Option<DevicePreference>,

    /// Model backend.
    #[arg(long, default_value = "toy")]
    backend: String,
}

fn parse_format(s: &str) -> Result<Format, String> {
    Format::parse(s).ok_or_else(|| format!("unsupported format '{s}'. Use obj or stl"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(steps) = args.steps {
        config.sampling.step_count = steps;
    }
    if let Some(device) = args.device {
        config.device = device;
    }
    if args.ascii_stl {
        config.stl_encoding = StlEncoding::Ascii;
    }

    tracing::info!(backend = %args.backend, device = ?config.device, "starting");
    let pipeline = GenerationPipeline::from_config(config, &args.backend)?;

    let request = GenerationRequest {
        prompt: args.prompt,
        guidance_scale: args.guidance_scale,
        seed: args.seed,
        formats: (!args.format.is_empty()).then_some(args.format),
        output_dir: Some(args.output_dir),
    };

    let result = pipeline
        .generate_request(&request)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    // Print machine-readable summary to stdout for the caller
    println!("{}", serde_json::to_string(&result.summary())?);

    Ok(())
}
