//! Enrollment and login built from the extractor, enhancer, registry and
//! matcher.

use crate::enhance::{EnhanceError, ImageEnhancer};
use crate::extractor::{CapturedFace, DescriptorExtractor, ExtractError};
use crate::frame::{FrameError, StillFrame};
use crate::matcher::{EuclideanMatcher, MatchPolicy, MatchResult, Matcher};
use crate::model::EmbeddingModel;
use crate::registry::{EnrollmentRegistry, RegistryError, RosterStore};
use crate::types::{Embedding, EnrollmentRequest, Identity, Profile};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("could not encode captured frame: {0}")]
    Frame(#[from] FrameError),
    #[error("image enhancement failed: {0}")]
    Enhance(#[from] EnhanceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Error, Debug)]
pub enum LoginError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated { identity: Identity, distance: f32 },
    Rejected { best_distance: f32 },
    /// Nobody is enrolled; prompt for enrollment instead of a retry.
    NoEnrolledIdentities,
}

pub struct FaceAuth<M, E, S> {
    extractor: DescriptorExtractor<M>,
    enhancer: E,
    registry: Arc<EnrollmentRegistry<S>>,
    policy: MatchPolicy,
}

impl<M, E, S> FaceAuth<M, E, S>
where
    M: EmbeddingModel,
    E: ImageEnhancer,
    S: RosterStore,
{
    pub fn new(
        extractor: DescriptorExtractor<M>,
        enhancer: E,
        registry: Arc<EnrollmentRegistry<S>>,
        policy: MatchPolicy,
    ) -> Self {
        Self {
            extractor,
            enhancer,
            registry,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<EnrollmentRegistry<S>> {
        &self.registry
    }

    /// Extract, enhance, enroll.
    pub async fn enroll(&self, frame: StillFrame, profile: Profile) -> Result<Identity, EnrollError> {
        let captured = self.extractor.capture(frame).await?;
        self.enroll_captured(captured, profile).await
    }

    /// Enroll a face whose embedding was already computed.
    pub async fn enroll_captured(
        &self,
        captured: CapturedFace,
        profile: Profile,
    ) -> Result<Identity, EnrollError> {
        let raw_image = captured.frame.to_png()?;
        let enhanced_image = self.enhancer.enhance(&raw_image).await?;
        let identity = self.registry.add(EnrollmentRequest {
            display_name: profile.display_name,
            email: profile.email,
            raw_image,
            enhanced_image,
            embedding: captured.embedding,
        })?;
        Ok(identity)
    }

    /// Re-capture an enrolled identity's face.
    pub async fn refresh(&self, id: &str, frame: StillFrame) -> Result<Identity, EnrollError> {
        if self.registry.get(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()).into());
        }
        let captured = self.extractor.capture(frame).await?;
        let raw_image = captured.frame.to_png()?;
        let enhanced_image = self.enhancer.enhance(&raw_image).await?;
        Ok(self
            .registry
            .update_embedding(id, captured.embedding, raw_image, enhanced_image)?)
    }

    /// Match an embedding against the current roster without logging in.
    pub fn identify(&self, embedding: &Embedding) -> MatchResult {
        let roster = self.registry.list_roster();
        EuclideanMatcher.best_match(embedding, roster.iter(), self.policy.threshold)
    }

    /// Extract a descriptor from `frame`, match it, and on success make the
    /// matched identity active.
    pub async fn login(&self, frame: &StillFrame) -> Result<LoginOutcome, LoginError> {
        let embedding = self.extractor.extract(frame).await?;
        let roster = self.registry.list_roster();

        let outcome = match EuclideanMatcher.best_match(&embedding, roster.iter(), self.policy.threshold) {
            MatchResult::NoEnrolledIdentities => LoginOutcome::NoEnrolledIdentities,
            MatchResult::Unknown { best_distance } => {
                tracing::info!(best_distance, threshold = self.policy.threshold, "login rejected");
                LoginOutcome::Rejected { best_distance }
            }
            MatchResult::Matched { identity_id, distance } => {
                self.registry.set_active(Some(&identity_id))?;
                let identity = roster
                    .get(&identity_id)
                    .cloned()
                    .ok_or_else(|| RegistryError::NotFound(identity_id.clone()))?;
                tracing::info!(identity = %identity_id, distance, "login accepted");
                LoginOutcome::Authenticated { identity, distance }
            }
        };
        Ok(outcome)
    }

    pub fn logout(&self) -> Result<(), RegistryError> {
        self.registry.set_active(None)
    }
}
