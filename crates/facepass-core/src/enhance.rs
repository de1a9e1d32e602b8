use crate::types::EncodedImage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnhanceError {
    #[error("enhancement service unreachable: {0}")]
    Unavailable(String),
    #[error("enhancement rejected the image: {0}")]
    Rejected(String),
}

/// Image-to-image enhancement applied before an enrollment image is stored.
/// Stateless from the caller's point of view.
#[async_trait]
pub trait ImageEnhancer: Send + Sync {
    async fn enhance(&self, image: &EncodedImage) -> Result<EncodedImage, EnhanceError>;
}

/// Stores the raw capture as the enhanced image.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEnhancer;

#[async_trait]
impl ImageEnhancer for PassthroughEnhancer {
    async fn enhance(&self, image: &EncodedImage) -> Result<EncodedImage, EnhanceError> {
        if image.is_empty() {
            return Err(EnhanceError::Rejected("empty image".into()));
        }
        Ok(image.clone())
    }
}
