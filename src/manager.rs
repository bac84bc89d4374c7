//! Generation manager: keeps the pipeline resident and queues requests.
//!
//! The manager owns one [`GenerationPipeline`] on a dedicated blocking thread.
//! Callers submit [`GenerationRequest`]s from async code; they are processed
//! sequentially in arrival order and each caller gets its own result back.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use text3d_rs::config::PipelineConfig;
//! use text3d_rs::manager::{GenerationManager, ManagerConfig};
//! use text3d_rs::pipeline::{GenerationPipeline, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = GenerationPipeline::from_config(PipelineConfig::default(), "toy").unwrap();
//!     let manager = GenerationManager::start(Arc::new(pipeline), ManagerConfig::default())
//!         .await
//!         .unwrap();
//!     let result = manager
//!         .generate(GenerationRequest::new("a chair shaped like an avocado"))
//!         .await
//!         .unwrap();
//!     println!("{:?}", result.summary());
//! }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::pipeline::{GenerationPipeline, GenerationRequest, GenerationResult};
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Requests that may wait before `generate` starts applying backpressure.
    pub queue_capacity: usize,

    /// Construct the model bundle before accepting requests. A failure here
    /// fails `start`.
    pub preload: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            preload: true,
        }
    }
}

/// A submitted generation request.
struct PendingRequest {
    request: GenerationRequest,
    reply: oneshot::Sender<Result<GenerationResult>>,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Debug, Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
}

impl GenerationManager {
    /// Start the worker thread and return a handle for submitting requests.
    pub async fn start(pipeline: Arc<GenerationPipeline>, config: ManagerConfig) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }

        if config.preload {
            // Model construction does synchronous I/O and heavy compute.
            let loading = Arc::clone(&pipeline);
            tokio::task::spawn_blocking(move || loading.preload())
                .await
                .map_err(|e| Error::Manager(format!("model load task panicked: {e}")))??;
        }

        let (tx, rx) = mpsc::channel::<PendingRequest>(config.queue_capacity);
        tokio::task::spawn_blocking(move || run_manager(pipeline, rx));

        Ok(Self { tx })
    }

    /// Submit a generation request and wait for the result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<GenerationResult>>();
        self.tx
            .send(PendingRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// True once the worker thread has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The manager loop. Runs in a dedicated blocking thread until every handle
/// is dropped.
fn run_manager(pipeline: Arc<GenerationPipeline>, mut rx: mpsc::Receiver<PendingRequest>) {
    while let Some(pending) = rx.blocking_recv() {
        let result = pipeline.generate_request(&pending.request);
        // The caller may have given up waiting.
        if pending.reply.send(result).is_err() {
            tracing::debug!(prompt = %pending.request.prompt, "caller went away, result dropped");
        }
    }
    tracing::info!("generation manager shut down");
}
