//! faceverify-core — Face descriptor matching.
//!
//! Descriptors are produced by an external face model. This crate only
//! compares them: Euclidean distance plus a threshold decides whether a
//! live face matches any stored reference for a matric number.

pub mod matcher;
pub mod types;
pub mod wire;

pub use matcher::{
    evaluate, BestMatchEvaluator, FirstMatchEvaluator, MatchPolicy, Matcher,
    DEFAULT_MATCH_THRESHOLD,
};
pub use types::{
    distance, BoundingBox, Descriptor, Detection, DetectionSet, DimensionMismatch,
    InvalidDescriptor, MatchPair, MatchResult, ReferenceRecord, ReferenceSet,
};
