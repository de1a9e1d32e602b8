//! Camera capability consumed by the capture session.

use async_trait::async_trait;
use facepass_core::{RetryAction, StillFrame};
use std::time::Duration;
use thiserror::Error;

/// Requested stream geometry. Adapters may negotiate something close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for StreamConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquireError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("camera device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera device busy")]
    DeviceBusy,
    #[error("camera playback rejected: {0}")]
    PlaybackRejected(String),
    #[error("camera unsupported: {0}")]
    Unsupported(String),
    #[error("camera did not start within {0:?}")]
    TimedOut(Duration),
}

impl AcquireError {
    /// `None` when retrying the same device cannot help.
    pub fn retry_action(&self) -> Option<RetryAction> {
        match self {
            AcquireError::Unsupported(_) => None,
            _ => Some(RetryAction::RetryCamera),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("stream is no longer active")]
    Inactive,
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
}

/// Source of exclusive camera streams.
#[async_trait]
pub trait Camera: Send + Sync + 'static {
    type Stream: VideoStream;

    async fn request_stream(
        &self,
        constraints: StreamConstraints,
    ) -> Result<Self::Stream, AcquireError>;
}

/// A live stream handle. Clones share the same underlying device.
#[async_trait]
pub trait VideoStream: Clone + Send + Sync + 'static {
    /// Start playback and confirm frames are flowing.
    async fn play(&self) -> Result<(), AcquireError>;

    /// Grab the current frame, unmirrored.
    async fn grab_frame(&self) -> Result<StillFrame, StreamError>;

    fn is_active(&self) -> bool;

    /// Release the device.
    fn stop(&self);
}
