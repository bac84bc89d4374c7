//! Error types for text3d-rs.
//!
//! Every failure of a generation request maps to exactly one variant, and
//! every request-level variant names the pipeline [`Stage`] it came from.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::writer::Format;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The prompt (or a per-request override) was rejected before any work began.
    #[error("bad input: {0}")]
    Input(String),

    /// The model bundle could not be constructed (missing weights, device, OOM).
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Latent sampling failed or produced invalid output.
    #[error("generation failed for prompt {prompt:?}: {reason}")]
    Generation { prompt: String, reason: String },

    /// Malformed latent or decoder fault.
    #[error("decode failed: {0}")]
    Decode(String),

    /// I/O failure while serializing an artifact. `format` is `None` when the
    /// output directory itself could not be created.
    #[error("write failed ({}): {source}", write_target(.format, .path))]
    Write {
        format: Option<Format>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Preview rendering failed. Never fails a request; the pipeline swallows it.
    #[error("preview rendering failed: {0}")]
    Preview(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// The background generation manager is gone.
    #[error("manager: {0}")]
    Manager(String),
}

impl Error {
    /// The pipeline stage this error terminates, if it is a request-level error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Input(_) => Some(Stage::Validating),
            Error::ModelUnavailable(_) => Some(Stage::ModelLoading),
            Error::Generation { .. } => Some(Stage::Sampling),
            Error::Decode(_) => Some(Stage::Decoding),
            Error::Write { .. } => Some(Stage::Writing),
            Error::Preview(_) => Some(Stage::PreviewRendering),
            Error::Config(_) | Error::Manager(_) => None,
        }
    }

    pub(crate) fn write(
        format: Option<Format>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Error::Write {
            format,
            path: path.into(),
            source,
        }
    }
}

fn write_target(format: &Option<Format>, path: &Path) -> String {
    match format {
        Some(format) => format!("{format} → {}", path.display()),
        None => path.display().to_string(),
    }
}

/// Pipeline states. A request walks these in declaration order and stops at
/// `Done` or at the stage named by its error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Validating,
    ModelLoading,
    Sampling,
    Decoding,
    Writing,
    PreviewRendering,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Validating => "validating",
            Stage::ModelLoading => "model loading",
            Stage::Sampling => "sampling",
            Stage::Decoding => "decoding",
            Stage::Writing => "writing",
            Stage::PreviewRendering => "preview rendering",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Return true if the error message looks like a device out-of-memory condition.
///
/// Candle surfaces CUDA errors as boxed errors whose `Display` contains the
/// cudarc error string, so we match on substrings.
pub fn is_oom_error(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("out of memory")
        || msg.contains("cudaerrormemorya") // cudaErrorMemoryAllocation
        || msg.contains("cuda_error_out_of_memory")
        || msg.contains("cublas_status_alloc_failed")
        || msg.contains("alloc failed")
}

/// Render a collaborator error for a stage message, noting device OOM.
pub(crate) fn describe_fault(error: &dyn std::error::Error) -> String {
    let msg = error.to_string();
    if is_oom_error(&msg) {
        format!("device out of memory: {msg}")
    } else {
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_oom_error_matches_known_patterns() {
        assert!(is_oom_error("CUDA out of memory"));
        assert!(is_oom_error("cudaErrorMemoryAllocation"));
        assert!(is_oom_error("CUDA_ERROR_OUT_OF_MEMORY"));
        assert!(is_oom_error("alloc failed"));
        assert!(!is_oom_error("shape mismatch"));
        assert!(!is_oom_error("invalid index"));
    }

    #[test]
    fn test_every_request_error_names_a_stage() {
        let errors = [
            Error::Input("empty".into()),
            Error::ModelUnavailable("no weights".into()),
            Error::Generation {
                prompt: "a chair".into(),
                reason: "NaN".into(),
            },
            Error::Decode("bad dims".into()),
            Error::write(
                Some(Format::Obj),
                "/tmp/x.obj",
                std::io::Error::other("disk full"),
            ),
            Error::Preview("renderer crashed".into()),
        ];
        let stages: Vec<Stage> = errors.iter().filter_map(Error::stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Validating,
                Stage::ModelLoading,
                Stage::Sampling,
                Stage::Decoding,
                Stage::Writing,
                Stage::PreviewRendering,
            ]
        );
        assert_eq!(Error::Config("x".into()).stage(), None);
    }

    #[test]
    fn test_write_error_names_format_and_path() {
        let err = Error::write(
            Some(Format::Stl),
            "/out/chair.stl",
            std::io::Error::other("disk full"),
        );
        let msg = err.to_string();
        assert!(msg.contains("stl"), "{msg}");
        assert!(msg.contains("/out/chair.stl"), "{msg}");
        assert!(msg.contains("disk full"), "{msg}");
    }

    #[test]
    fn test_generation_error_carries_prompt() {
        let err = Error::Generation {
            prompt: "a teapot".into(),
            reason: "non-finite latent".into(),
        };
        assert!(err.to_string().contains("\"a teapot\""));
    }
}
