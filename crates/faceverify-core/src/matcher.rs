use crate::types::{DetectionSet, DimensionMismatch, MatchPair, MatchResult, ReferenceSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Euclidean distance below which two descriptors are taken to be the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for deciding whether a detection set matches a reference set.
///
/// Implementations skip detections and records that carry no descriptor,
/// compare with a strict `distance < threshold`, and escalate only a
/// length mismatch between two valid descriptors.
pub trait Matcher {
    fn evaluate(
        &self,
        detections: &DetectionSet,
        references: &ReferenceSet,
        threshold: f32,
    ) -> Result<MatchResult, DimensionMismatch>;
}

/// Stops at the first (detection, reference) pair under threshold.
///
/// Detections are scanned in order and, for each, references in order.
/// The reported pair is the first qualifying one, not the closest.
pub struct FirstMatchEvaluator;

impl Matcher for FirstMatchEvaluator {
    fn evaluate(
        &self,
        detections: &DetectionSet,
        references: &ReferenceSet,
        threshold: f32,
    ) -> Result<MatchResult, DimensionMismatch> {
        if references.is_empty() {
            return Ok(MatchResult::no_match(0));
        }

        let mut comparisons = 0;

        for (detection_index, detection) in detections.iter().enumerate() {
            let Some(probe) = detection.descriptor.as_ref() else {
                continue;
            };

            for (reference_index, record) in references.records.iter().enumerate() {
                let Some(stored) = record.descriptor.as_ref() else {
                    continue;
                };

                let distance = probe.distance(stored)?;
                comparisons += 1;

                if distance < threshold {
                    let pair = MatchPair {
                        detection_index,
                        reference_index,
                        distance,
                    };
                    return Ok(MatchResult::matched(pair, comparisons));
                }
            }
        }

        Ok(MatchResult::no_match(comparisons))
    }
}

/// Compares every pair and reports the closest one under threshold.
///
/// `matched` always agrees with [`FirstMatchEvaluator`]; only the
/// reported pair can differ.
pub struct BestMatchEvaluator;

impl Matcher for BestMatchEvaluator {
    fn evaluate(
        &self,
        detections: &DetectionSet,
        references: &ReferenceSet,
        threshold: f32,
    ) -> Result<MatchResult, DimensionMismatch> {
        if references.is_empty() {
            return Ok(MatchResult::no_match(0));
        }

        let mut comparisons = 0;
        let mut best: Option<MatchPair> = None;

        for (detection_index, detection) in detections.iter().enumerate() {
            let Some(probe) = detection.descriptor.as_ref() else {
                continue;
            };

            for (reference_index, record) in references.records.iter().enumerate() {
                let Some(stored) = record.descriptor.as_ref() else {
                    continue;
                };

                let distance = probe.distance(stored)?;
                comparisons += 1;

                let closer = best.map_or(true, |b| distance < b.distance);
                if distance < threshold && closer {
                    best = Some(MatchPair {
                        detection_index,
                        reference_index,
                        distance,
                    });
                }
            }
        }

        Ok(match best {
            Some(pair) => MatchResult::matched(pair, comparisons),
            None => MatchResult::no_match(comparisons),
        })
    }
}

/// Evaluate with the default first-match policy.
pub fn evaluate(
    detections: &DetectionSet,
    references: &ReferenceSet,
    threshold: f32,
) -> Result<MatchResult, DimensionMismatch> {
    FirstMatchEvaluator.evaluate(detections, references, threshold)
}

/// Configurable choice of [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    #[serde(alias = "first-match")]
    First,
    #[serde(alias = "best-match")]
    Best,
}

impl MatchPolicy {
    pub fn matcher(self) -> Box<dyn Matcher + Send + Sync> {
        match self {
            MatchPolicy::First => Box::new(FirstMatchEvaluator),
            MatchPolicy::Best => Box::new(BestMatchEvaluator),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::First => f.write_str("first"),
            MatchPolicy::Best => f.write_str("best"),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-match" => Ok(MatchPolicy::First),
            "best" | "best-match" => Ok(MatchPolicy::Best),
            other => Err(format!("unknown match policy {other:?} (expected first or best)")),
        }
    }
}
