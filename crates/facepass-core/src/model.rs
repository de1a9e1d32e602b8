//! Embedding model capability and its one-shot readiness gate.

use crate::frame::StillFrame;
use crate::types::{BoundingBox, Embedding};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("model weights not found: {0}")]
    WeightsMissing(String),
    #[error("model failed to load: {0}")]
    Failed(String),
    #[error("model did not become ready within {0:?}")]
    TimedOut(Duration),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Face detection and embedding inference, supplied by the host.
#[async_trait]
pub trait EmbeddingModel: Send + Sync + 'static {
    /// Load weights. Called at most once per [`ModelHandle`].
    async fn ready(&self) -> Result<(), ModelLoadError>;

    /// Cheap detector used by the live preview loop.
    async fn detect_faces(&self, frame: &StillFrame) -> Result<Vec<BoundingBox>, ModelError>;

    /// Expensive detection + alignment + embedding, one call per still frame.
    /// `Ok(None)` means no face was found.
    async fn extract_embedding(&self, frame: &StillFrame) -> Result<Option<Embedding>, ModelError>;

    /// Length of every embedding this model produces.
    fn dimension(&self) -> usize;
}

/// Outcome of the model load step.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    Ready,
    Unavailable(ModelLoadError),
}

/// Detector availability as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectorStatus {
    /// Load has not finished yet.
    Pending,
    Ready,
    /// Load failed; face-presence gating is off.
    Unavailable,
}

/// Shares one model between sessions and the extractor and runs its load
/// step exactly once, bounded by `load_timeout`.
pub struct ModelHandle<M> {
    model: M,
    load_timeout: Duration,
    status: OnceCell<ModelStatus>,
}

impl<M: EmbeddingModel> ModelHandle<M> {
    pub fn new(model: M, load_timeout: Duration) -> Self {
        Self {
            model,
            load_timeout,
            status: OnceCell::new(),
        }
    }

    /// Wait for the load step, starting it if nobody has yet.
    ///
    /// Concurrent callers share the same attempt. The failure is logged once,
    /// here, and never again.
    pub async fn ensure_ready(&self) -> &ModelStatus {
        self.status
            .get_or_init(|| async {
                match tokio::time::timeout(self.load_timeout, self.model.ready()).await {
                    Ok(Ok(())) => {
                        tracing::info!(dimension = self.model.dimension(), "embedding model ready");
                        ModelStatus::Ready
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "embedding model unavailable; face gating disabled");
                        ModelStatus::Unavailable(err)
                    }
                    Err(_) => {
                        let err = ModelLoadError::TimedOut(self.load_timeout);
                        tracing::warn!(error = %err, "embedding model unavailable; face gating disabled");
                        ModelStatus::Unavailable(err)
                    }
                }
            })
            .await
    }

    /// Current status without waiting.
    pub fn detector_status(&self) -> DetectorStatus {
        match self.status.get() {
            None => DetectorStatus::Pending,
            Some(ModelStatus::Ready) => DetectorStatus::Ready,
            Some(ModelStatus::Unavailable(_)) => DetectorStatus::Unavailable,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}
