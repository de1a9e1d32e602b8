use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector produced by the embedding model.
///
/// The values are fixed once the embedding exists; callers read them through
/// [`as_slice`](Self::as_slice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet-128").
    model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the dimensions differ. Inputs are neither
    /// normalized nor clamped.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// Opaque encoded image (PNG when produced by this crate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    pub const PNG: &'static str = "image/png";

    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            mime: Self::PNG.to_string(),
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An enrolled user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub raw_image: EncodedImage,
    pub enhanced_image: EncodedImage,
    pub embedding: Embedding,
    /// Set for the first identity ever enrolled into an empty roster.
    pub is_privileged: bool,
    pub enrolled_at: String,
}

/// Caller-supplied part of an [`Identity`]; the registry fills in the rest.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub display_name: String,
    pub email: String,
    pub raw_image: EncodedImage,
    pub enhanced_image: EncodedImage,
    pub embedding: Embedding,
}

/// Profile fields collected by the UI alongside a capture.
#[derive(Debug, Clone)]
pub struct Profile {
    pub display_name: String,
    pub email: String,
}

/// The user-facing recovery path for a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetryAction {
    RetryCamera,
    RetakePhoto,
}

/// Normalize an email for uniqueness comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
