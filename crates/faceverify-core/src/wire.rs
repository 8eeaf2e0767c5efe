//! JSON contract of the reference-image service and of recorded detections.
//!
//! Records arrive loosely typed. Validation happens here, once: a record
//! with an unusable descriptor keeps its place in the set with
//! `descriptor: None`, and the matcher skips it.

use crate::types::{BoundingBox, Descriptor, Detection, DetectionSet, ReferenceRecord, ReferenceSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Path of the reference lookup endpoint, relative to the API base URL.
pub const FACEVERIFY_PATH: &str = "/api/v1/test/faceverify";

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON array of detections, got {0}")]
    NotAnArray(&'static str),
}

/// Body of `POST /api/v1/test/faceverify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceVerifyRequest {
    pub matric_number: String,
}

/// Successful response body. Only `images` is read.
#[derive(Debug, Clone, Deserialize)]
pub struct FaceVerifyResponse {
    pub images: Vec<Value>,
}

impl FaceVerifyResponse {
    /// Convert the loosely-typed image list into a validated reference set.
    pub fn into_reference_set(
        self,
        matric_number: &str,
        fetched_at: DateTime<Utc>,
    ) -> ReferenceSet {
        let records = self
            .images
            .iter()
            .enumerate()
            .map(|(index, image)| reference_record(matric_number, index, image))
            .collect();
        ReferenceSet::new(matric_number, records, fetched_at)
    }
}

fn reference_record(matric_number: &str, index: usize, image: &Value) -> ReferenceRecord {
    let Value::Object(fields) = image else {
        tracing::debug!(index, "reference image is not an object; skipping descriptor");
        return ReferenceRecord {
            matric_number: matric_number.to_string(),
            image_url: None,
            descriptor: None,
        };
    };

    let image_url = ["url", "imageUrl", "image_url"]
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    let descriptor = match Descriptor::from_json(fields.get("descriptor").unwrap_or(&Value::Null)) {
        Ok(descriptor) => Some(descriptor),
        Err(reason) => {
            tracing::debug!(index, %reason, "unusable reference descriptor");
            None
        }
    };

    ReferenceRecord {
        matric_number: matric_number.to_string(),
        image_url,
        descriptor,
    }
}

/// Parse one detection set: a JSON array of detection objects.
///
/// Each object may carry a `descriptor` (array or index-keyed object) and
/// geometry under `box` or `detection`. Unusable descriptors become `None`.
pub fn parse_detection_set(value: &Value) -> Result<DetectionSet, WireError> {
    let Value::Array(items) = value else {
        return Err(WireError::NotAnArray(json_kind(value)));
    };

    Ok(items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_detection(index, item))
        .collect())
}

/// Parse a detection set from JSON text.
pub fn parse_detection_set_str(text: &str) -> Result<DetectionSet, WireError> {
    let value: Value = serde_json::from_str(text)?;
    parse_detection_set(&value)
}

fn parse_detection(index: usize, item: &Value) -> Detection {
    let descriptor = match Descriptor::from_json(item.get("descriptor").unwrap_or(&Value::Null)) {
        Ok(descriptor) => Some(descriptor),
        Err(reason) => {
            tracing::debug!(index, %reason, "unusable detection descriptor");
            None
        }
    };

    let bbox = ["box", "detection"]
        .iter()
        .find_map(|key| item.get(*key))
        .and_then(parse_box);

    Detection { descriptor, bbox }
}

fn parse_box(value: &Value) -> Option<BoundingBox> {
    // face-api nests the box one level down: {"detection": {"_box": {...}, "_score": ..}}
    let score = ["score", "_score"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_f64));
    let geometry = ["box", "_box"]
        .iter()
        .find_map(|key| value.get(*key))
        .unwrap_or(value);
    let mut bbox: BoundingBox = serde_json::from_value(geometry.clone()).ok()?;
    if let Some(score) = score {
        bbox.confidence = score as f32;
    }
    Some(bbox)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
