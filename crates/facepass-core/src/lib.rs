//! facepass-core: Face enrollment and identity matching.
//!
//! Consumes an externally supplied embedding model through [`EmbeddingModel`],
//! extracts descriptors from still frames, and matches them against an
//! [`EnrollmentRegistry`] by Euclidean distance.

pub mod enhance;
pub mod extractor;
pub mod flow;
pub mod frame;
pub mod matcher;
pub mod model;
pub mod registry;
pub mod types;

pub use enhance::{EnhanceError, ImageEnhancer, PassthroughEnhancer};
pub use extractor::{CapturedFace, DescriptorExtractor, ExtractError};
pub use flow::{EnrollError, FaceAuth, LoginError, LoginOutcome};
pub use frame::{FrameError, PixelLayout, StillFrame};
pub use matcher::{EuclideanMatcher, MatchPolicy, MatchResult, Matcher};
pub use model::{DetectorStatus, EmbeddingModel, ModelError, ModelHandle, ModelLoadError, ModelStatus};
pub use registry::{
    EnrollmentRegistry, MemoryRosterStore, PersistenceError, RegistryError, RosterSnapshot,
    RosterStore,
};
pub use types::{BoundingBox, Embedding, EncodedImage, EnrollmentRequest, Identity, Profile, RetryAction};
