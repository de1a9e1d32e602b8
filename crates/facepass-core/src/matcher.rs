//! Nearest-neighbour identity matching over Euclidean distance.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};

/// Reference decision threshold in the embedding space.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

/// Matching policy supplied from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Maximum Euclidean distance (inclusive) for a positive match.
    pub threshold: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

/// Result of matching a probe embedding against a roster.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// The roster was empty; the caller should offer enrollment.
    NoEnrolledIdentities,
    Matched { identity_id: String, distance: f32 },
    /// Nobody was within the threshold. `best_distance` is `+inf` when no
    /// roster entry had a comparable dimension.
    Unknown { best_distance: f32 },
}

impl MatchResult {
    pub fn identity_id(&self) -> Option<&str> {
        match self {
            MatchResult::Matched { identity_id, .. } => Some(identity_id),
            _ => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

/// Strategy for comparing a probe embedding against enrolled identities.
pub trait Matcher {
    fn best_match<'a, I>(&self, probe: &Embedding, roster: I, threshold: f32) -> MatchResult
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>;
}

/// Minimum Euclidean distance matcher.
///
/// Visits every roster entry. On equal distances the entry seen first wins,
/// so the result is deterministic for a deterministic roster order.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn best_match<'a, I>(&self, probe: &Embedding, roster: I, threshold: f32) -> MatchResult
    where
        I: IntoIterator<Item = (&'a str, &'a Embedding)>,
    {
        let mut seen_any = false;
        let mut best: Option<(&'a str, f32)> = None;

        for (id, embedding) in roster {
            seen_any = true;
            let Some(distance) = probe.euclidean_distance(embedding) else {
                tracing::warn!(
                    identity = id,
                    probe_dim = probe.dimension(),
                    enrolled_dim = embedding.dimension(),
                    "skipping roster entry with mismatched embedding dimension"
                );
                continue;
            };
            let better = match best {
                None => !distance.is_nan(),
                Some((_, best_distance)) => distance < best_distance,
            };
            if better {
                best = Some((id, distance));
            }
        }

        if !seen_any {
            return MatchResult::NoEnrolledIdentities;
        }

        match best {
            Some((id, distance)) if distance <= threshold => MatchResult::Matched {
                identity_id: id.to_string(),
                distance,
            },
            Some((_, distance)) => MatchResult::Unknown {
                best_distance: distance,
            },
            None => MatchResult::Unknown {
                best_distance: f32::INFINITY,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn reference_vector() -> Vec<f32> {
        (1..=128).map(|i| (i as f32) / 1000.0).collect()
    }

    #[test]
    fn test_empty_roster_is_not_unknown() {
        let probe = emb(&[0.1, 0.2]);
        let result = EuclideanMatcher.best_match(&probe, std::iter::empty::<(&str, &Embedding)>(), 100.0);
        assert_eq!(result, MatchResult::NoEnrolledIdentities);
    }

    #[test]
    fn test_exact_match_distance_zero() {
        let enrolled = emb(&reference_vector());
        let roster = [("u1", &enrolled)];
        let result = EuclideanMatcher.best_match(&enrolled.clone(), roster, 0.55);
        assert_eq!(
            result,
            MatchResult::Matched {
                identity_id: "u1".into(),
                distance: 0.0
            }
        );
    }

    #[test]
    fn test_self_match_for_zero_threshold() {
        let a = emb(&[0.3, -0.7, 1.5]);
        let b = emb(&[9.0, 9.0, 9.0]);
        let roster = [("a", &a), ("b", &b)];
        let result = EuclideanMatcher.best_match(&a, roster, 0.0);
        assert_eq!(result.identity_id(), Some("a"));
    }

    #[test]
    fn test_rejection_reports_best_distance() {
        let v1 = emb(&[0.0, 0.0, 0.0]);
        let v2 = emb(&[0.9, 0.0, 0.0]);
        let roster = [("u1", &v1)];
        let result = EuclideanMatcher.best_match(&v2, roster, 0.55);
        match result {
            MatchResult::Unknown { best_distance } => {
                assert!((best_distance - 0.9).abs() < 1e-6, "got {best_distance}")
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let enrolled = emb(&[0.0, 0.0]);
        let probe = emb(&[0.5, 0.0]);
        let roster = [("u1", &enrolled)];
        let at = EuclideanMatcher.best_match(&probe, roster, 0.5);
        assert_eq!(
            at,
            MatchResult::Matched {
                identity_id: "u1".into(),
                distance: 0.5
            }
        );
    }

    #[test]
    fn test_just_past_threshold_is_unknown() {
        let enrolled = emb(&[0.0, 0.0]);
        let probe = emb(&[0.5 + 1e-6, 0.0]);
        let roster = [("u1", &enrolled)];
        let result = EuclideanMatcher.best_match(&probe, roster, 0.5);
        assert!(matches!(result, MatchResult::Unknown { .. }), "{result:?}");
    }

    #[test]
    fn test_picks_nearest_of_many() {
        let probe = emb(&[1.0, 0.0, 0.0]);
        let far = emb(&[0.0, 1.0, 0.0]);
        let near = emb(&[0.9, 0.1, 0.0]);
        let farther = emb(&[-1.0, 0.0, 0.0]);
        let roster = [("far", &far), ("near", &near), ("farther", &farther)];
        let result = EuclideanMatcher.best_match(&probe, roster, 0.55);
        assert_eq!(result.identity_id(), Some("near"));
    }

    #[test]
    fn test_tie_goes_to_first_in_order() {
        let probe = emb(&[0.0, 0.0]);
        let left = emb(&[-0.1, 0.0]);
        let right = emb(&[0.1, 0.0]);
        let forward = [("left", &left), ("right", &right)];
        assert_eq!(
            EuclideanMatcher.best_match(&probe, forward, 0.55).identity_id(),
            Some("left")
        );
        let reverse = [("right", &right), ("left", &left)];
        assert_eq!(
            EuclideanMatcher.best_match(&probe, reverse, 0.55).identity_id(),
            Some("right")
        );
    }

    #[test]
    fn test_mismatched_dimensions_are_skipped() {
        let probe = emb(&[0.0, 0.0]);
        let wrong = emb(&[0.0, 0.0, 0.0]);
        let right = emb(&[0.1, 0.0]);
        let roster = [("wrong", &wrong), ("right", &right)];
        assert_eq!(
            EuclideanMatcher.best_match(&probe, roster, 0.55).identity_id(),
            Some("right")
        );

        let only_wrong = [("wrong", &wrong)];
        assert_eq!(
            EuclideanMatcher.best_match(&probe, only_wrong, 0.55),
            MatchResult::Unknown {
                best_distance: f32::INFINITY
            }
        );
    }

    #[test]
    fn test_default_policy_threshold() {
        assert_eq!(MatchPolicy::default().threshold, 0.55);
    }
}
