use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Two descriptors of different length were compared.
///
/// Always an integration error: every descriptor in one deployment comes
/// from the same model and has the same length.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor dimension mismatch: {left} vs {right}")]
pub struct DimensionMismatch {
    pub left: usize,
    pub right: usize,
}

/// Why a raw value could not be turned into a [`Descriptor`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidDescriptor {
    #[error("descriptor is missing")]
    Missing,
    #[error("descriptor is empty")]
    Empty,
    #[error("component {index} is not a number")]
    NotNumeric { index: usize },
    #[error("component {index} is not finite")]
    NonFinite { index: usize },
    #[error("index key {key:?} is not a position in 0..{len}")]
    BadIndex { key: String, len: usize },
    #[error("no component at position {index}")]
    MissingIndex { index: usize },
    #[error("expected an array or index-keyed object, got {0}")]
    UnsupportedShape(&'static str),
}

/// Face descriptor produced by the external recognition model
/// (typically 128-dimensional).
///
/// Non-empty and all components finite; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, InvalidDescriptor> {
        if values.is_empty() {
            return Err(InvalidDescriptor::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(InvalidDescriptor::NonFinite { index });
        }
        Ok(Self(values))
    }

    /// Parse a descriptor from loosely-typed JSON.
    ///
    /// Accepts a plain array of numbers, or an object keyed by decimal
    /// positions (`{"0": 0.1, "1": -0.2, ...}`), which is how a
    /// `Float32Array` comes out of `JSON.stringify`.
    pub fn from_json(value: &Value) -> Result<Self, InvalidDescriptor> {
        match value {
            Value::Array(items) => {
                let values = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| component(index, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::new(values)
            }
            Value::Object(map) => {
                let len = map.len();
                let mut slots: Vec<Option<f32>> = vec![None; len];
                for (key, item) in map {
                    let index = key
                        .parse::<usize>()
                        .ok()
                        .filter(|&i| i < len)
                        .ok_or_else(|| InvalidDescriptor::BadIndex {
                            key: key.clone(),
                            len,
                        })?;
                    slots[index] = Some(component(index, item)?);
                }
                // "1" and "01" land on the same slot and leave a hole elsewhere.
                let values = slots
                    .into_iter()
                    .enumerate()
                    .map(|(index, slot)| slot.ok_or(InvalidDescriptor::MissingIndex { index }))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::new(values)
            }
            Value::Null => Err(InvalidDescriptor::Missing),
            Value::Bool(_) => Err(InvalidDescriptor::UnsupportedShape("boolean")),
            Value::Number(_) => Err(InvalidDescriptor::UnsupportedShape("number")),
            Value::String(_) => Err(InvalidDescriptor::UnsupportedShape("string")),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean (L2) distance to another descriptor.
    ///
    /// Symmetric, non-negative, and zero only for element-wise equal
    /// descriptors. Fails if the lengths differ.
    pub fn distance(&self, other: &Descriptor) -> Result<f32, DimensionMismatch> {
        if self.len() != other.len() {
            return Err(DimensionMismatch {
                left: self.len(),
                right: other.len(),
            });
        }

        // Accumulate in f64 so tiny component differences do not
        // underflow to a zero distance.
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = f64::from(*a) - f64::from(*b);
                d * d
            })
            .sum();

        Ok(sum.sqrt() as f32)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = InvalidDescriptor;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0
    }
}

fn component(index: usize, value: &Value) -> Result<f32, InvalidDescriptor> {
    let raw = value
        .as_f64()
        .ok_or(InvalidDescriptor::NotNumeric { index })?;
    let v = raw as f32;
    if !v.is_finite() {
        return Err(InvalidDescriptor::NonFinite { index });
    }
    Ok(v)
}

/// Euclidean distance between two descriptors. See [`Descriptor::distance`].
pub fn distance(a: &Descriptor, b: &Descriptor) -> Result<f32, DimensionMismatch> {
    a.distance(b)
}

/// Bounding box of a detected face. Carried for display, never used for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(alias = "_x")]
    pub x: f32,
    #[serde(alias = "_y")]
    pub y: f32,
    #[serde(alias = "_width")]
    pub width: f32,
    #[serde(alias = "_height")]
    pub height: f32,
    #[serde(default, alias = "score")]
    pub confidence: f32,
}

/// One face found in one capture frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Detection {
    /// `None` when the model produced no usable descriptor for this face.
    pub descriptor: Option<Descriptor>,
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            bbox: None,
        }
    }
}

/// All faces found in one polling tick, in model output order.
pub type DetectionSet = Vec<Detection>;

/// One stored reference image for a matric number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub matric_number: String,
    pub image_url: Option<String>,
    /// `None` when the stored record had a missing or malformed descriptor.
    pub descriptor: Option<Descriptor>,
}

/// Every reference record fetched for one matric number.
///
/// Replaced as a whole on each successful fetch; never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSet {
    pub matric_number: String,
    pub records: Vec<ReferenceRecord>,
    pub fetched_at: DateTime<Utc>,
}

impl ReferenceSet {
    pub fn new(
        matric_number: impl Into<String>,
        records: Vec<ReferenceRecord>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            matric_number: matric_number.into(),
            records,
            fetched_at,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that carry a descriptor.
    pub fn usable(&self) -> usize {
        self.records.iter().filter(|r| r.descriptor.is_some()).count()
    }
}

/// The pair that decided a positive match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    /// Position of the detection in its detection set.
    pub detection_index: usize,
    /// Position of the record in the reference set.
    pub reference_index: usize,
    pub distance: f32,
}

/// Outcome of evaluating one detection set. Recomputed every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub matched: bool,
    pub pair: Option<MatchPair>,
    /// Number of distances computed.
    pub comparisons: usize,
}

impl MatchResult {
    pub fn no_match(comparisons: usize) -> Self {
        Self {
            matched: false,
            pair: None,
            comparisons,
        }
    }

    pub fn matched(pair: MatchPair, comparisons: usize) -> Self {
        Self {
            matched: true,
            pair: Some(pair),
            comparisons,
        }
    }
}
