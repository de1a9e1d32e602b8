//! One-shot descriptor extraction from a confirmed still frame.

use crate::frame::StillFrame;
use crate::model::{EmbeddingModel, ModelHandle, ModelLoadError, ModelStatus};
use crate::types::{Embedding, RetryAction};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected in the captured frame")]
    NoFaceDetected,
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(ModelLoadError),
    #[error("descriptor computation failed: {0}")]
    DescriptorComputeFailure(String),
}

impl ExtractError {
    /// Recovery offered to the user. Model failures have none: the flow is
    /// degraded rather than retried.
    pub fn retry_action(&self) -> Option<RetryAction> {
        match self {
            ExtractError::NoFaceDetected | ExtractError::DescriptorComputeFailure(_) => {
                Some(RetryAction::RetakePhoto)
            }
            ExtractError::ModelUnavailable(_) => None,
        }
    }
}

/// A still frame paired with the embedding computed from it.
#[derive(Debug, Clone)]
pub struct CapturedFace {
    pub frame: StillFrame,
    pub embedding: Embedding,
}

pub struct DescriptorExtractor<M> {
    model: Arc<ModelHandle<M>>,
}

impl<M> Clone for DescriptorExtractor<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
        }
    }
}

impl<M: EmbeddingModel> DescriptorExtractor<M> {
    pub fn new(model: Arc<ModelHandle<M>>) -> Self {
        Self { model }
    }

    pub fn model_handle(&self) -> &Arc<ModelHandle<M>> {
        &self.model
    }

    /// Run detection, alignment and embedding inference once on `frame`.
    pub async fn extract(&self, frame: &StillFrame) -> Result<Embedding, ExtractError> {
        if let ModelStatus::Unavailable(err) = self.model.ensure_ready().await {
            return Err(ExtractError::ModelUnavailable(err.clone()));
        }

        let model = self.model.model();
        let embedding = model
            .extract_embedding(frame)
            .await
            .map_err(|e| ExtractError::DescriptorComputeFailure(e.to_string()))?
            .ok_or(ExtractError::NoFaceDetected)?;

        if embedding.dimension() != model.dimension() {
            return Err(ExtractError::DescriptorComputeFailure(format!(
                "expected {}-dim embedding, got {}",
                model.dimension(),
                embedding.dimension()
            )));
        }

        tracing::debug!(
            dimension = embedding.dimension(),
            sequence = frame.sequence,
            "descriptor extracted"
        );
        Ok(embedding)
    }

    /// Extract and keep the frame alongside the embedding. On failure the
    /// frame is dropped; the caller retakes.
    pub async fn capture(&self, frame: StillFrame) -> Result<CapturedFace, ExtractError> {
        let embedding = self.extract(&frame).await?;
        Ok(CapturedFace { frame, embedding })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;
    use crate::model::fake::ScriptedModel;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn frame() -> StillFrame {
        StillFrame::new(vec![120; 16], 4, 4, PixelLayout::Gray8).unwrap()
    }

    fn extractor(model: ScriptedModel) -> DescriptorExtractor<ScriptedModel> {
        DescriptorExtractor::new(Arc::new(ModelHandle::new(model, Duration::from_secs(1))))
    }

    #[tokio::test]
    async fn test_extract_returns_embedding() {
        let expected = Embedding::new(vec![0.1, 0.2, 0.3]);
        let ex = extractor(ScriptedModel::returning(Some(expected.clone())));
        assert_eq!(ex.extract(&frame()).await, Ok(expected));
    }

    #[tokio::test]
    async fn test_extract_no_face() {
        let ex = extractor(ScriptedModel::returning(None));
        let err = ex.extract(&frame()).await.unwrap_err();
        assert_eq!(err, ExtractError::NoFaceDetected);
        assert_eq!(err.retry_action(), Some(RetryAction::RetakePhoto));
    }

    #[tokio::test]
    async fn test_extract_model_unavailable_skips_inference() {
        let mut model = ScriptedModel::returning(Some(Embedding::new(vec![1.0, 2.0, 3.0])));
        model.load = Err(ModelLoadError::Failed("bad weights".into()));
        let ex = extractor(model);

        let err = ex.extract(&frame()).await.unwrap_err();
        assert!(matches!(err, ExtractError::ModelUnavailable(_)));
        assert_eq!(err.retry_action(), None);
        assert_eq!(ex.model.model().extract_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extract_inference_error() {
        let mut model = ScriptedModel::returning(Some(Embedding::new(vec![1.0, 2.0, 3.0])));
        model.fail_inference = true;
        let ex = extractor(model);
        assert!(matches!(
            ex.extract(&frame()).await,
            Err(ExtractError::DescriptorComputeFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_extract_rejects_wrong_dimension() {
        let mut model = ScriptedModel::returning(Some(Embedding::new(vec![1.0, 2.0])));
        model.dimension = 128;
        let ex = extractor(model);
        let err = ex.extract(&frame()).await.unwrap_err();
        assert!(
            matches!(&err, ExtractError::DescriptorComputeFailure(msg) if msg.contains("128")),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_capture_pairs_frame_and_embedding() {
        let ex = extractor(ScriptedModel::returning(Some(Embedding::new(vec![0.5; 3]))));
        let captured = ex.capture(frame().with_sequence(7)).await.unwrap();
        assert_eq!(captured.frame.sequence, 7);
        assert_eq!(captured.embedding.as_slice(), &[0.5, 0.5, 0.5]);
        assert_eq!(ex.model.model().extract_calls.load(Ordering::SeqCst), 1);
    }
}
